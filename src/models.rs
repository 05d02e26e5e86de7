//! Modelos de dominio: el nodo de conocimiento y su formato de exportación.
//!
//! El formato JSON es siempre `{title, summary, children}` recursivo. El
//! identificador estable y la marca de expansión viven sólo en memoria.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// Caracteres del resumen que entran en la huella de un nodo.
const FINGERPRINT_SUMMARY_CHARS: usize = 20;

/// Identificador sintético de un nodo, asignado al crearlo o deserializarlo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(Uuid);

impl NodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Estado de expansión de un nodo. Distingue "hoja" de "aún sin expandir".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpansionState {
    Unexpanded,
    ExpandedEmpty,
    ExpandedNonEmpty,
}

/// Nodo del árbol de conocimiento.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeNode {
    #[serde(skip, default)]
    pub id: NodeId,
    pub title: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub summary: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub children: Vec<KnowledgeNode>,
    #[serde(skip)]
    pub expanded: bool,
}

impl KnowledgeNode {
    /// Crea un nodo sin hijos y sin expandir.
    pub fn new(title: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            id: NodeId::new(),
            title: title.into(),
            summary: summary.into(),
            children: Vec::new(),
            expanded: false,
        }
    }

    pub fn with_children(mut self, children: Vec<KnowledgeNode>) -> Self {
        self.children = children;
        self
    }

    pub fn expansion_state(&self) -> ExpansionState {
        match (self.children.is_empty(), self.expanded) {
            (false, _) => ExpansionState::ExpandedNonEmpty,
            (true, true) => ExpansionState::ExpandedEmpty,
            (true, false) => ExpansionState::Unexpanded,
        }
    }

    /// `true` mientras nadie haya pedido todavía los hijos de este nodo.
    pub fn needs_expansion(&self) -> bool {
        self.expansion_state() == ExpansionState::Unexpanded
    }

    /// Sustituye los hijos por el resultado de una expansión.
    pub fn attach_children(&mut self, children: Vec<KnowledgeNode>) {
        self.children = children;
        self.expanded = true;
    }

    /// Añade hijos nuevos a continuación de los existentes.
    pub fn append_children(&mut self, children: Vec<KnowledgeNode>) {
        self.children.extend(children);
        self.expanded = true;
    }

    /// Igualdad por contenido: título y resumen exactos.
    pub fn same_content(&self, other: &KnowledgeNode) -> bool {
        self.title == other.title && self.summary == other.summary
    }

    /// Huella `título_prefijo-del-resumen`. Dos nodos con el mismo título y
    /// el mismo prefijo de resumen colisionan.
    pub fn fingerprint(&self) -> String {
        let prefix: String = self.summary.chars().take(FINGERPRINT_SUMMARY_CHARS).collect();
        format!("{}_{}", self.title, prefix)
    }

    /// Número total de nodos del subárbol, incluido éste.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(KnowledgeNode::node_count).sum::<usize>()
    }

    /// JSON con sangría listo para descargar.
    pub fn to_export_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Lee un árbol exportado previamente.
    pub fn from_json_str(raw: &str) -> Result<Self, ImportError> {
        serde_json::from_str(raw).map_err(ImportError)
    }
}

/// Error al importar un árbol desde JSON.
#[derive(Debug, thiserror::Error)]
#[error("JSON de red de conocimiento inválido: {0}")]
pub struct ImportError(#[source] serde_json::Error);

/// Nombre del fichero de exportación, p. ej. `knowledge-network-1718000000000.json`.
pub fn export_file_name(now: DateTime<Utc>) -> String {
    format!("knowledge-network-{}.json", now.timestamp_millis())
}

// Los LLM devuelven a veces `null` donde esperamos cadena o lista.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
