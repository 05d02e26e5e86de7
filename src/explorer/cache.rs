//! Caché LRU de nodos. `get` y `put` cuentan como acceso; `has` no.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};

use lru::LruCache;

use crate::models::{KnowledgeNode, NodeId};

pub const DEFAULT_CACHE_SIZE: usize = 50;

/// Cómo se deriva la clave de un nodo.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KeyPolicy {
    /// Identificador estable del nodo.
    #[default]
    Identity,
    /// Título + prefijo del resumen. Nodos homónimos colisionan.
    Fingerprint,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Id(NodeId),
    Fingerprint(String),
}

impl KeyPolicy {
    pub fn key_for(self, node: &KnowledgeNode) -> CacheKey {
        match self {
            Self::Identity => CacheKey::Id(node.id),
            Self::Fingerprint => CacheKey::Fingerprint(node.fingerprint()),
        }
    }
}

pub struct NodeCache {
    entries: LruCache<CacheKey, KnowledgeNode>,
    policy: KeyPolicy,
}

impl NodeCache {
    pub fn new(max_size: usize) -> Self {
        Self::with_policy(max_size, KeyPolicy::default())
    }

    /// Una capacidad de cero se trata como uno.
    pub fn with_policy(max_size: usize, policy: KeyPolicy) -> Self {
        let capacity = NonZeroUsize::new(max_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            policy,
        }
    }

    pub fn key_for(&self, node: &KnowledgeNode) -> CacheKey {
        self.policy.key_for(node)
    }

    /// Inserta o refresca el nodo; si la caché está llena y la clave es
    /// nueva, expulsa antes la menos usada.
    pub fn put(&mut self, node: KnowledgeNode) {
        let key = self.key_for(&node);
        self.entries.put(key, node);
    }

    /// Devuelve la copia cacheada (posiblemente con más hijos) y la promociona.
    pub fn get(&mut self, node: &KnowledgeNode) -> Option<KnowledgeNode> {
        let key = self.key_for(node);
        self.entries.get(&key).cloned()
    }

    /// Como `get`, pero sin promocionar ni clonar.
    pub fn peek(&self, node: &KnowledgeNode) -> Option<&KnowledgeNode> {
        self.entries.peek(&self.key_for(node))
    }

    /// Completa los nodos sin expandir de `root` con las copias expandidas
    /// de la caché, recursivamente. Devuelve cuántos nodos se completaron.
    pub fn fill_tree(&self, root: &mut KnowledgeNode) -> usize {
        let mut filled = 0;
        if root.needs_expansion() {
            if let Some(cached) = self.peek(root).filter(|cached| !cached.needs_expansion()) {
                root.attach_children(cached.children.clone());
                filled += 1;
            }
        }
        for child in &mut root.children {
            filled += self.fill_tree(child);
        }
        filled
    }

    pub fn has(&self, node: &KnowledgeNode) -> bool {
        self.entries.contains(&self.key_for(node))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    pub fn policy(&self) -> KeyPolicy {
        self.policy
    }
}

/// Caché compartida entre la sesión y el precargador.
pub type SharedCache = Arc<Mutex<NodeCache>>;

pub fn shared(cache: NodeCache) -> SharedCache {
    Arc::new(Mutex::new(cache))
}

/// Bloquea la caché compartida aunque otro hilo haya entrado en pánico.
pub fn lock(cache: &SharedCache) -> MutexGuard<'_, NodeCache> {
    match cache.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
