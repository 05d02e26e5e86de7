//! Motor de exploración del árbol de conocimiento.
//!
//!   - `cache`: caché LRU de nodos ya expandidos.
//!   - `navigation`: nodo actual, pila de ancestros y reconciliación del árbol.
//!   - `prefetch`: expansión especulativa de hijos y nietos en segundo plano.
//!   - `session`: orquesta los tres anteriores sobre un documento raíz.
//!   - `client`: cliente HTTP del servidor, usable como `NodeExpander`.

pub mod cache;
pub mod client;
pub mod navigation;
pub mod prefetch;
pub mod session;

use async_trait::async_trait;

use crate::knowledge::KnowledgeService;
use crate::models::KnowledgeNode;

pub use cache::{CacheKey, KeyPolicy, NodeCache, SharedCache, DEFAULT_CACHE_SIZE};
pub use client::{ApiClient, ClientError};
pub use navigation::{find_node, find_parents, merge_into_tree, NodeMatch, Navigator};
pub use prefetch::{PrefetchOutcome, PrefetchScheduler, PRELOAD_DEPTH_THRESHOLD};
pub use session::{Explorer, ExplorerSettings};

/// Servicio de expansión visto desde el explorador.
#[async_trait]
pub trait NodeExpander: Send + Sync + 'static {
    /// Hijos nuevos para `node`. Un error nunca se convierte en lista vacía.
    async fn expand(&self, node: &KnowledgeNode) -> anyhow::Result<Vec<KnowledgeNode>>;

    /// Explicación larga de `node` dentro de la ruta `context_path`.
    async fn explain(&self, node: &KnowledgeNode, context_path: &str) -> anyhow::Result<String>;
}

#[async_trait]
impl NodeExpander for KnowledgeService {
    async fn expand(&self, node: &KnowledgeNode) -> anyhow::Result<Vec<KnowledgeNode>> {
        let expanded = self
            .expand_node(&node.title, Some(&node.summary), self.default_model())
            .await?;
        Ok(expanded.children)
    }

    async fn explain(&self, node: &KnowledgeNode, context_path: &str) -> anyhow::Result<String> {
        Ok(self
            .explain_node(&node.title, Some(&node.summary), Some(context_path), self.default_model())
            .await?)
    }
}
