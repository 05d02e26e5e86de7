//! Dobles de prueba compartidos por los tests de los módulos.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;

use crate::app_state::AppState;
use crate::config::AppConfig;
use crate::explorer::NodeExpander;
use crate::llm::{ChatGateway, ChatRequest, LlmError, LlmProvider};
use crate::models::KnowledgeNode;

/// Pasarela que devuelve respuestas guionizadas en orden.
#[derive(Default)]
pub struct ScriptedGateway {
    responses: Mutex<VecDeque<String>>,
    failing: bool,
    calls: AtomicUsize,
    last_prompt: Mutex<Option<String>>,
    last_provider: Mutex<Option<LlmProvider>>,
}

impl ScriptedGateway {
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            responses: Mutex::new(responses.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    /// Todas las llamadas fallan como un error del proveedor.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.last_prompt.lock().unwrap().clone()
    }

    pub fn last_provider(&self) -> Option<LlmProvider> {
        *self.last_provider.lock().unwrap()
    }
}

#[async_trait]
impl ChatGateway for ScriptedGateway {
    async fn complete(&self, provider: LlmProvider, request: ChatRequest<'_>) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_prompt.lock().unwrap() = Some(request.prompt.to_string());
        *self.last_provider.lock().unwrap() = Some(provider);

        if self.failing {
            return Err(LlmError::Upstream {
                provider,
                message: "conexión rechazada".to_string(),
            });
        }
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(LlmError::EmptyResponse(provider))
    }
}

/// Expansor determinista: `n` hijos llamados `"{título}.{i}"`.
pub struct FakeExpander {
    children: usize,
    failing: HashSet<String>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    last_context: Mutex<Option<String>>,
}

impl FakeExpander {
    pub fn new(children: usize) -> Self {
        Self {
            children,
            failing: HashSet::new(),
            delay: None,
            calls: AtomicUsize::new(0),
            last_context: Mutex::new(None),
        }
    }

    pub fn failing_on<const N: usize>(mut self, titles: [&str; N]) -> Self {
        self.failing.extend(titles.iter().map(|t| t.to_string()));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_context(&self) -> Option<String> {
        self.last_context.lock().unwrap().clone()
    }
}

#[async_trait]
impl NodeExpander for FakeExpander {
    async fn expand(&self, node: &KnowledgeNode) -> anyhow::Result<Vec<KnowledgeNode>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.contains(&node.title) {
            bail!("fallo simulado al expandir '{}'", node.title);
        }
        Ok((1..=self.children)
            .map(|i| KnowledgeNode::new(format!("{}.{i}", node.title), format!("resumen de {}.{i}", node.title)))
            .collect())
    }

    async fn explain(&self, node: &KnowledgeNode, context_path: &str) -> anyhow::Result<String> {
        *self.last_context.lock().unwrap() = Some(context_path.to_string());
        Ok(format!("## {}\n\nExplicación de prueba.", node.title))
    }
}

/// Estado del servidor con DeepSeek configurado y subidas de hasta 1 KiB.
pub fn test_state(gateway: Arc<ScriptedGateway>) -> AppState {
    let config = AppConfig::from_lookup(|key| match key {
        "DEEPSEEK_API_KEY" => Some("sk-test".to_string()),
        "MAX_UPLOAD_BYTES" => Some("1024".to_string()),
        _ => None,
    })
    .unwrap();
    AppState::with_gateway(config, gateway)
}
