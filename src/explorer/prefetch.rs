//! Precarga especulativa de hijos y nietos.
//!
//! Flujo para `(node, depth)`:
//!   1. Si `depth` alcanza el umbral, no se hace nada.
//!   2. Si ya hay una precarga en curso para la clave del nodo, tampoco.
//!   3. Se expande el nodo si aún no tiene hijos y se guarda en la caché.
//!   4. Si queda margen de profundidad, se lanzan en paralelo las expansiones
//!      de los hijos sin expandir. No se esperan; cada fallo se registra
//!      por separado.
//!
//! La marca "en curso" se retira al terminar el paso 3, haya ido bien o mal.
//! Las tareas del paso 4 viven en un `JoinSet` por nodo: cancelar el nodo
//! aborta todo su grupo.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::models::KnowledgeNode;

use super::cache::{self, CacheKey, SharedCache};
use super::NodeExpander;

pub const PRELOAD_DEPTH_THRESHOLD: usize = 10;

/// Qué hizo una llamada a `prefetch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchOutcome {
    DepthLimit,
    AlreadyInFlight,
    ExpansionFailed,
    /// El nodo tiene hijos; `fan_out` es el número de nietos pedidos.
    Primed { fan_out: usize },
}

pub struct PrefetchScheduler {
    expander: Arc<dyn NodeExpander>,
    cache: SharedCache,
    threshold: usize,
    in_flight: Mutex<HashSet<CacheKey>>,
    groups: Mutex<HashMap<CacheKey, JoinSet<()>>>,
}

impl PrefetchScheduler {
    pub fn new(expander: Arc<dyn NodeExpander>, cache: SharedCache, threshold: usize) -> Self {
        Self {
            expander,
            cache,
            threshold,
            in_flight: Mutex::new(HashSet::new()),
            groups: Mutex::new(HashMap::new()),
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Claves con una expansión (paso 3) en curso.
    pub fn in_flight_count(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Lanza `prefetch` sin esperar, dentro del grupo del nodo.
    pub fn spawn(self: &Arc<Self>, node: KnowledgeNode, depth: usize) {
        let key = self.key_for(&node);
        let this = Arc::clone(self);
        let mut groups = lock(&self.groups);
        reap_finished(&mut groups);
        groups.entry(key).or_default().spawn(async move {
            this.prefetch(node, depth).await;
        });
    }

    /// Grupos con tareas aún vivas. Los terminados se liberan aquí y en cada
    /// `spawn`.
    pub fn group_count(&self) -> usize {
        let mut groups = lock(&self.groups);
        reap_finished(&mut groups);
        groups.len()
    }

    pub async fn prefetch(&self, mut node: KnowledgeNode, depth: usize) -> PrefetchOutcome {
        if depth >= self.threshold {
            debug!(
                "Profundidad {depth} alcanza el umbral {}; no se precarga '{}'",
                self.threshold, node.title
            );
            return PrefetchOutcome::DepthLimit;
        }

        let key = self.key_for(&node);
        let Some(guard) = InFlightGuard::acquire(&self.in_flight, key.clone()) else {
            return PrefetchOutcome::AlreadyInFlight;
        };

        if node.needs_expansion() {
            match self.expander.expand(&node).await {
                Ok(children) => {
                    node.attach_children(children);
                    cache::lock(&self.cache).put(node.clone());
                    info!(
                        "Precarga: {} hijos generados para '{}'",
                        node.children.len(),
                        node.title
                    );
                }
                Err(e) => {
                    warn!("Precarga de '{}' fallida: {e:#}", node.title);
                    return PrefetchOutcome::ExpansionFailed;
                }
            }
        }
        drop(guard);

        let fan_out = if depth + 1 < self.threshold {
            self.fan_out(key, &node)
        } else {
            0
        };
        PrefetchOutcome::Primed { fan_out }
    }

    fn fan_out(&self, key: CacheKey, node: &KnowledgeNode) -> usize {
        let pending: Vec<KnowledgeNode> = node
            .children
            .iter()
            .filter(|child| child.needs_expansion())
            .cloned()
            .collect();
        if pending.is_empty() {
            return 0;
        }

        let mut groups = lock(&self.groups);
        reap_finished(&mut groups);
        let group = groups.entry(key).or_default();
        for mut child in pending.iter().cloned() {
            let expander = Arc::clone(&self.expander);
            let cache = Arc::clone(&self.cache);
            group.spawn(async move {
                match expander.expand(&child).await {
                    Ok(grandchildren) => {
                        child.attach_children(grandchildren);
                        info!(
                            "Precarga: {} nietos generados para '{}'",
                            child.children.len(),
                            child.title
                        );
                        cache::lock(&cache).put(child);
                    }
                    Err(e) => warn!("Precarga de los hijos de '{}' fallida: {e:#}", child.title),
                }
            });
        }
        pending.len()
    }

    /// Aborta las precargas ligadas a `node`.
    pub fn cancel(&self, node: &KnowledgeNode) {
        let key = self.key_for(node);
        if let Some(mut group) = lock(&self.groups).remove(&key) {
            debug!("Cancelando {} precargas de '{}'", group.len(), node.title);
            group.abort_all();
        }
    }

    pub fn cancel_all(&self) {
        let groups: Vec<JoinSet<()>> = lock(&self.groups).drain().map(|(_, g)| g).collect();
        for mut group in groups {
            group.abort_all();
        }
    }

    /// Espera a que terminen todas las precargas pendientes, incluidas las
    /// que se lancen mientras tanto.
    pub async fn drain(&self) {
        loop {
            let groups: Vec<JoinSet<()>> = lock(&self.groups).drain().map(|(_, g)| g).collect();
            if groups.is_empty() {
                break;
            }
            for mut group in groups {
                while let Some(joined) = group.join_next().await {
                    log_join_error(joined);
                }
            }
        }
    }

    fn key_for(&self, node: &KnowledgeNode) -> CacheKey {
        cache::lock(&self.cache).key_for(node)
    }
}

/// Marca una clave como "en curso" y la retira al soltarse, también si la
/// tarea se aborta a mitad.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<CacheKey>>,
    key: CacheKey,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(set: &'a Mutex<HashSet<CacheKey>>, key: CacheKey) -> Option<Self> {
        // El cerrojo se suelta antes de construir la guarda: su `Drop` vuelve
        // a bloquear el mismo conjunto.
        let inserted = lock(set).insert(key.clone());
        inserted.then(|| Self { set, key })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        lock(self.set).remove(&self.key);
    }
}

// Recoge las tareas ya terminadas y elimina los grupos vacíos.
fn reap_finished(groups: &mut HashMap<CacheKey, JoinSet<()>>) {
    groups.retain(|_, group| {
        while let Some(joined) = group.try_join_next() {
            log_join_error(joined);
        }
        !group.is_empty()
    });
}

fn log_join_error(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            warn!("Una tarea de precarga terminó en pánico: {e}");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::explorer::cache::{shared, NodeCache};
    use crate::testing::FakeExpander;
    use std::time::Duration;

    fn scheduler(expander: Arc<FakeExpander>, threshold: usize) -> (Arc<PrefetchScheduler>, SharedCache) {
        let cache = shared(NodeCache::new(50));
        let scheduler = Arc::new(PrefetchScheduler::new(expander, cache.clone(), threshold));
        (scheduler, cache)
    }

    #[tokio::test]
    async fn no_calls_at_depth_threshold() {
        let expander = Arc::new(FakeExpander::new(3));
        let (scheduler, cache) = scheduler(expander.clone(), PRELOAD_DEPTH_THRESHOLD);

        let outcome = scheduler
            .prefetch(KnowledgeNode::new("A", ""), PRELOAD_DEPTH_THRESHOLD)
            .await;
        scheduler.drain().await;

        assert_eq!(outcome, PrefetchOutcome::DepthLimit);
        assert_eq!(expander.calls(), 0);
        assert!(cache::lock(&cache).is_empty());
    }

    #[tokio::test]
    async fn expands_node_then_grandchildren() {
        let expander = Arc::new(FakeExpander::new(3));
        let (scheduler, cache) = scheduler(expander.clone(), PRELOAD_DEPTH_THRESHOLD);
        let node = KnowledgeNode::new("A", "");

        let outcome = scheduler.prefetch(node.clone(), 1).await;
        assert_eq!(outcome, PrefetchOutcome::Primed { fan_out: 3 });
        assert_eq!(scheduler.in_flight_count(), 0);

        scheduler.drain().await;
        assert_eq!(expander.calls(), 4);

        let mut cache = cache::lock(&cache);
        let cached = cache.get(&node).unwrap();
        assert_eq!(cached.children.len(), 3);
        for child in &cached.children {
            assert_eq!(cache.get(child).unwrap().children.len(), 3);
        }
    }

    #[tokio::test]
    async fn no_fan_out_on_last_allowed_level() {
        let expander = Arc::new(FakeExpander::new(2));
        let (scheduler, _cache) = scheduler(expander.clone(), 3);

        let outcome = scheduler.prefetch(KnowledgeNode::new("A", ""), 2).await;
        scheduler.drain().await;

        assert_eq!(outcome, PrefetchOutcome::Primed { fan_out: 0 });
        assert_eq!(expander.calls(), 1);
    }

    #[tokio::test]
    async fn already_expanded_children_are_skipped() {
        let expander = Arc::new(FakeExpander::new(2));
        let (scheduler, _cache) = scheduler(expander.clone(), PRELOAD_DEPTH_THRESHOLD);
        let mut leaf = KnowledgeNode::new("hoja", "");
        leaf.attach_children(Vec::new());
        let node = KnowledgeNode::new("A", "").with_children(vec![
            leaf,
            KnowledgeNode::new("B", "").with_children(vec![KnowledgeNode::new("B1", "")]),
            KnowledgeNode::new("C", ""),
        ]);

        let outcome = scheduler.prefetch(node, 0).await;
        scheduler.drain().await;

        assert_eq!(outcome, PrefetchOutcome::Primed { fan_out: 1 });
        assert_eq!(expander.calls(), 1);
    }

    #[tokio::test]
    async fn failures_are_contained() {
        let expander = Arc::new(FakeExpander::new(2).failing_on(["A.1"]));
        let (scheduler, cache) = scheduler(expander.clone(), PRELOAD_DEPTH_THRESHOLD);
        let node = KnowledgeNode::new("A", "");

        scheduler.prefetch(node.clone(), 0).await;
        scheduler.drain().await;

        let mut cache = cache::lock(&cache);
        let cached = cache.get(&node).unwrap();
        assert!(cache.get(&cached.children[0]).is_none());
        assert_eq!(cache.get(&cached.children[1]).unwrap().children.len(), 2);
        drop(cache);

        let broken = Arc::new(FakeExpander::new(2).failing_on(["X"]));
        let (scheduler, cache) = self::scheduler(broken, PRELOAD_DEPTH_THRESHOLD);
        let outcome = scheduler.prefetch(KnowledgeNode::new("X", ""), 0).await;
        assert_eq!(outcome, PrefetchOutcome::ExpansionFailed);
        assert_eq!(scheduler.in_flight_count(), 0);
        assert!(cache::lock(&cache).is_empty());
    }

    #[tokio::test]
    async fn concurrent_prefetch_of_same_node_is_deduplicated() {
        let expander = Arc::new(FakeExpander::new(2).with_delay(Duration::from_millis(50)));
        let (scheduler, _cache) = scheduler(expander.clone(), 1);
        let node = KnowledgeNode::new("A", "");

        let (first, second) = tokio::join!(
            scheduler.prefetch(node.clone(), 0),
            scheduler.prefetch(node.clone(), 0)
        );

        let outcomes = [first, second];
        assert!(outcomes.contains(&PrefetchOutcome::AlreadyInFlight));
        assert!(outcomes.contains(&PrefetchOutcome::Primed { fan_out: 0 }));
        assert_eq!(expander.calls(), 1);
    }

    #[test]
    fn second_acquire_of_same_key_is_refused_without_releasing_the_first() {
        let set = Mutex::new(HashSet::new());
        let key = CacheKey::Fingerprint("A_".to_string());

        let first = InFlightGuard::acquire(&set, key.clone());
        assert!(first.is_some());
        assert!(InFlightGuard::acquire(&set, key.clone()).is_none());
        assert!(lock(&set).contains(&key));

        drop(first);
        assert!(lock(&set).is_empty());
        assert!(InFlightGuard::acquire(&set, key).is_some());
    }

    #[tokio::test]
    async fn finished_groups_are_released() {
        let expander = Arc::new(FakeExpander::new(2));
        let (scheduler, _cache) = scheduler(expander.clone(), 1);

        for i in 0..20 {
            scheduler.spawn(KnowledgeNode::new(format!("n{i}"), ""), 0);
        }
        assert_eq!(scheduler.group_count(), 20);

        for _ in 0..100 {
            if scheduler.group_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(scheduler.group_count(), 0);
        assert_eq!(expander.calls(), 20);
    }

    #[tokio::test]
    async fn cancel_aborts_pending_fan_out() {
        let expander = Arc::new(FakeExpander::new(3).with_delay(Duration::from_secs(30)));
        let node = KnowledgeNode::new("A", "").with_children(vec![
            KnowledgeNode::new("B", ""),
            KnowledgeNode::new("C", ""),
        ]);
        let (scheduler, cache) = scheduler(expander, PRELOAD_DEPTH_THRESHOLD);

        let outcome = scheduler.prefetch(node.clone(), 0).await;
        assert_eq!(outcome, PrefetchOutcome::Primed { fan_out: 2 });

        scheduler.cancel(&node);
        tokio::time::timeout(Duration::from_secs(1), scheduler.drain())
            .await
            .expect("drain tras cancelar no debe esperar a las tareas abortadas");
        assert!(cache::lock(&cache).is_empty());
    }
}
