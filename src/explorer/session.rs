//! Sesión de exploración: un documento raíz, la navegación sobre él, la
//! caché de nodos y la precarga. La raíz es la única fuente de verdad; la
//! navegación guarda copias que se refrescan desde ella tras cada cambio.

use std::sync::Arc;

use anyhow::Context;
use tracing::{debug, info};

use crate::models::{ImportError, KnowledgeNode};

use super::cache::{self, KeyPolicy, NodeCache, SharedCache, DEFAULT_CACHE_SIZE};
use super::navigation::{find_node, find_parents, merge_into_tree, NodeMatch, Navigator};
use super::prefetch::{PrefetchScheduler, PRELOAD_DEPTH_THRESHOLD};
use super::NodeExpander;

#[derive(Debug, Clone, Copy)]
pub struct ExplorerSettings {
    pub cache_size: usize,
    pub preload_depth_threshold: usize,
    pub key_policy: KeyPolicy,
}

impl Default for ExplorerSettings {
    fn default() -> Self {
        Self {
            cache_size: DEFAULT_CACHE_SIZE,
            preload_depth_threshold: PRELOAD_DEPTH_THRESHOLD,
            key_policy: KeyPolicy::Identity,
        }
    }
}

pub struct Explorer {
    root: KnowledgeNode,
    navigator: Navigator,
    cache: SharedCache,
    prefetch: Arc<PrefetchScheduler>,
    expander: Arc<dyn NodeExpander>,
    matcher: NodeMatch,
}

impl Explorer {
    pub fn new(root: KnowledgeNode, expander: Arc<dyn NodeExpander>, settings: ExplorerSettings) -> Self {
        let cache = cache::shared(NodeCache::with_policy(settings.cache_size, settings.key_policy));
        cache::lock(&cache).put(root.clone());
        let prefetch = Arc::new(PrefetchScheduler::new(
            Arc::clone(&expander),
            Arc::clone(&cache),
            settings.preload_depth_threshold,
        ));

        Self {
            navigator: Navigator::new(root.clone()),
            root,
            cache,
            prefetch,
            expander,
            matcher: settings.key_policy.into(),
        }
    }

    /// Carga un documento nuevo: cancela precargas, vacía la caché y vuelve
    /// a la raíz.
    pub fn load(&mut self, root: KnowledgeNode) {
        self.prefetch.cancel_all();
        {
            let mut cache = cache::lock(&self.cache);
            cache.clear();
            cache.put(root.clone());
        }
        self.navigator.reset(root.clone());
        info!("Documento '{}' cargado ({} nodos)", root.title, root.node_count());
        self.root = root;
    }

    pub fn root(&self) -> &KnowledgeNode {
        &self.root
    }

    pub fn current(&self) -> &KnowledgeNode {
        self.navigator.current()
    }

    pub fn navigator(&self) -> &Navigator {
        &self.navigator
    }

    pub fn depth(&self) -> usize {
        self.navigator.current_depth()
    }

    pub fn breadcrumb(&self) -> Vec<String> {
        self.navigator.breadcrumb_path()
    }

    pub fn cache_len(&self) -> usize {
        cache::lock(&self.cache).len()
    }

    pub fn prefetch_in_flight(&self) -> usize {
        self.prefetch.in_flight_count()
    }

    /// Entra en `child`. Sin hijos conocidos, usa la copia de la caché o la
    /// expande (esperando). Después lanza la precarga de sus descendientes.
    /// Si la expansión falla, el estado no cambia.
    pub async fn enter_child(&mut self, child: &KnowledgeNode) -> anyhow::Result<()> {
        let depth = self.navigator.current_depth();

        let entered = if !child.needs_expansion() {
            child.clone()
        } else if let Some(cached) = self.cached_expansion(child) {
            debug!("'{}' servido desde la caché", child.title);
            cached
        } else {
            let children = self
                .expander
                .expand(child)
                .await
                .with_context(|| format!("No se pudieron generar los hijos de '{}'", child.title))?;
            let mut updated = child.clone();
            updated.attach_children(children);
            updated
        };

        cache::lock(&self.cache).put(entered.clone());
        if child.needs_expansion() {
            self.apply_update(child, &entered);
        }
        self.navigator.navigate_to_child(entered.clone());

        let next_depth = depth + 1;
        if next_depth < self.prefetch.threshold() {
            self.prefetch.spawn(entered, next_depth);
        }
        Ok(())
    }

    /// Pide hijos nuevos para `node` y los añade a los que ya tenga. Un nodo
    /// sin expandir con copia expandida en caché se resuelve sin red.
    pub async fn expand(&mut self, node: &KnowledgeNode) -> anyhow::Result<KnowledgeNode> {
        let updated = match self.cached_expansion(node).filter(|_| node.needs_expansion()) {
            Some(cached) => cached,
            None => {
                let children = self
                    .expander
                    .expand(node)
                    .await
                    .with_context(|| format!("No se pudo expandir '{}'", node.title))?;
                let mut updated = node.clone();
                updated.append_children(children);
                updated
            }
        };

        cache::lock(&self.cache).put(updated.clone());
        self.apply_update(node, &updated);
        Ok(updated)
    }

    /// Explicación de `node` con la ruta actual como contexto.
    pub async fn ask(&self, node: &KnowledgeNode) -> anyhow::Result<String> {
        let context_path = self.context_path(node);
        self.expander.explain(node, &context_path).await
    }

    /// `A > B > nodo`, con la ruta de migas actual.
    pub fn context_path(&self, node: &KnowledgeNode) -> String {
        format!("{} > {}", self.navigator.breadcrumb_path().join(" > "), node.title)
    }

    /// Vuelve al padre. Las precargas en curso siguen y acaban en la caché.
    pub fn back(&mut self) -> bool {
        if !self.navigator.navigate_back() {
            return false;
        }
        self.refresh_from_root();
        true
    }

    /// Salta a una miga (`-1` = raíz).
    pub fn jump_to(&mut self, index: isize) {
        self.navigator.navigate_to_breadcrumb(index);
        self.refresh_from_root();
    }

    /// Aborta las precargas lanzadas al entrar en `node`.
    pub fn cancel_prefetch(&self, node: &KnowledgeNode) {
        self.prefetch.cancel(node);
    }

    /// JSON del árbol, incluido lo ya precargado aunque no se haya visitado.
    pub fn export_json(&self) -> serde_json::Result<String> {
        let mut tree = self.root.clone();
        cache::lock(&self.cache).fill_tree(&mut tree);
        tree.to_export_json()
    }

    /// Carga un árbol exportado con `export_json`.
    pub fn import_json(&mut self, raw: &str) -> Result<(), ImportError> {
        let root = KnowledgeNode::from_json_str(raw)?;
        self.load(root);
        Ok(())
    }

    /// Espera a que terminen las precargas pendientes e incorpora sus
    /// resultados al árbol.
    pub async fn settle(&mut self) {
        self.prefetch.drain().await;
        self.absorb_prefetched();
    }

    fn cached_expansion(&self, node: &KnowledgeNode) -> Option<KnowledgeNode> {
        cache::lock(&self.cache)
            .get(node)
            .filter(|cached| !cached.needs_expansion())
    }

    // Fusiona `new` en la raíz bajo cada padre real de `old` y refresca la
    // navegación.
    fn apply_update(&mut self, old: &KnowledgeNode, new: &KnowledgeNode) {
        let matcher = self.matcher;
        if matcher.matches(&self.root, old) {
            self.root = new.clone();
        } else {
            let parents = find_parents(&self.root, old, matcher);
            let mut replaced = 0;
            for parent in &parents {
                replaced += merge_into_tree(&mut self.root, parent, old, new, matcher);
            }
            debug!("'{}' fusionado en {replaced} posiciones del árbol", new.title);
            if replaced == 0 && matcher.matches(self.navigator.current(), old) {
                self.navigator.update_current_node(new.clone());
            }
        }
        self.refresh_from_root();
    }

    // Incorpora a la raíz lo que la precarga dejó en la caché.
    fn absorb_prefetched(&mut self) -> usize {
        let filled = cache::lock(&self.cache).fill_tree(&mut self.root);
        if filled > 0 {
            debug!("{filled} nodos precargados incorporados al árbol");
            self.refresh_from_root();
        }
        filled
    }

    fn refresh_from_root(&mut self) {
        let matcher = self.matcher;
        if let Some(fresh) = find_node(&self.root, self.navigator.current(), matcher).cloned() {
            self.navigator.update_current_node(fresh);
        }

        let fresh_history: Vec<KnowledgeNode> = self
            .navigator
            .history()
            .iter()
            .filter_map(|entry| find_node(&self.root, entry, matcher).cloned())
            .collect();
        for fresh in &fresh_history {
            self.navigator
                .update_history_node(|entry| matcher.matches(entry, fresh), fresh);
        }
    }
}
