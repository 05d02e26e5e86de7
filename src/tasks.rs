//! Almacén en memoria del estado de las tareas en segundo plano.
//!
//! Cada tarea nace en `processing` y pasa una única vez a `completed` o
//! `failed`. Las entradas caducan tras el TTL configurado. Sólo vale para
//! un único proceso servidor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::models::KnowledgeNode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Processing,
    Completed,
    Failed,
}

/// Resultado de una tarea: un árbol o una explicación.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskResult {
    Node(KnowledgeNode),
    Explanation { explanation: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub status: TaskState,
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskStatus {
    fn processing() -> Self {
        Self {
            status: TaskState::Processing,
            progress: 0,
            result: None,
            error: None,
        }
    }
}

struct TaskEntry {
    status: TaskStatus,
    created_at: Instant,
}

#[derive(Clone)]
pub struct TaskStore {
    entries: Arc<Mutex<HashMap<String, TaskEntry>>>,
    ttl: Duration,
}

impl TaskStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    /// Registra una tarea nueva en `processing` y devuelve su id.
    pub fn create(&self) -> String {
        let id = Uuid::new_v4().to_string();
        let mut entries = self.lock();
        self.purge_expired(&mut entries);
        entries.insert(
            id.clone(),
            TaskEntry {
                status: TaskStatus::processing(),
                created_at: Instant::now(),
            },
        );
        id
    }

    /// Actualiza el progreso de una tarea aún en curso.
    pub fn set_progress(&self, id: &str, progress: u8) -> bool {
        self.update_processing(id, |status| status.progress = progress.min(99))
    }

    pub fn complete(&self, id: &str, result: TaskResult) -> bool {
        self.update_processing(id, |status| {
            status.status = TaskState::Completed;
            status.progress = 100;
            status.result = Some(result);
        })
    }

    pub fn fail(&self, id: &str, error: impl Into<String>) -> bool {
        let error = error.into();
        self.update_processing(id, |status| {
            status.status = TaskState::Failed;
            status.progress = 0;
            status.error = Some(error);
        })
    }

    pub fn get(&self, id: &str) -> Option<TaskStatus> {
        let entries = self.lock();
        entries
            .get(id)
            .filter(|entry| entry.created_at.elapsed() < self.ttl)
            .map(|entry| entry.status.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Las transiciones sólo se aplican desde `processing`.
    fn update_processing(&self, id: &str, apply: impl FnOnce(&mut TaskStatus)) -> bool {
        let mut entries = self.lock();
        match entries.get_mut(id) {
            Some(entry) if entry.status.status == TaskState::Processing => {
                apply(&mut entry.status);
                true
            }
            Some(_) => {
                debug!("Tarea {id} ya finalizada; se ignora la transición");
                false
            }
            None => false,
        }
    }

    fn purge_expired(&self, entries: &mut HashMap<String, TaskEntry>) {
        let before = entries.len();
        entries.retain(|_, entry| entry.created_at.elapsed() < self.ttl);
        let purged = before - entries.len();
        if purged > 0 {
            debug!("Eliminadas {purged} tareas caducadas");
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TaskEntry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
