//! Estado de navegación (nodo actual + ancestros) y reconciliación del
//! árbol raíz cuando un nodo recibe hijos nuevos.
//!
//! Todas las operaciones son totales: un movimiento imposible no hace nada.

use crate::models::KnowledgeNode;

use super::cache::KeyPolicy;

/// Criterio para decidir si dos nodos son "el mismo".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NodeMatch {
    /// Mismo identificador estable.
    #[default]
    Identity,
    /// Título y resumen exactos.
    Content,
}

impl NodeMatch {
    pub fn matches(self, a: &KnowledgeNode, b: &KnowledgeNode) -> bool {
        match self {
            Self::Identity => a.id == b.id,
            Self::Content => a.same_content(b),
        }
    }
}

impl From<KeyPolicy> for NodeMatch {
    fn from(policy: KeyPolicy) -> Self {
        match policy {
            KeyPolicy::Identity => Self::Identity,
            KeyPolicy::Fingerprint => Self::Content,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Navigator {
    history: Vec<KnowledgeNode>,
    current: KnowledgeNode,
}

impl Navigator {
    pub fn new(root: KnowledgeNode) -> Self {
        Self {
            history: Vec::new(),
            current: root,
        }
    }

    /// Vuelve a empezar desde una raíz nueva.
    pub fn reset(&mut self, root: KnowledgeNode) {
        self.history.clear();
        self.current = root;
    }

    pub fn current(&self) -> &KnowledgeNode {
        &self.current
    }

    /// Ancestros del nodo actual, empezando por la raíz.
    pub fn history(&self) -> &[KnowledgeNode] {
        &self.history
    }

    /// No comprueba que `child` cuelgue realmente del nodo actual.
    pub fn navigate_to_child(&mut self, child: KnowledgeNode) {
        let parent = std::mem::replace(&mut self.current, child);
        self.history.push(parent);
    }

    /// Devuelve `false` (sin hacer nada) si ya estamos en la raíz.
    pub fn navigate_back(&mut self) -> bool {
        match self.history.pop() {
            Some(previous) => {
                self.current = previous;
                true
            }
            None => false,
        }
    }

    /// `-1` salta a la raíz; `k >= 0` salta al k-ésimo ancestro. Los índices
    /// fuera de rango no hacen nada.
    pub fn navigate_to_breadcrumb(&mut self, index: isize) {
        if index == -1 {
            if !self.history.is_empty() {
                self.current = self.history.swap_remove(0);
                self.history.clear();
            }
            return;
        }

        let Ok(index) = usize::try_from(index) else {
            return;
        };
        if index >= self.history.len() {
            return;
        }
        self.history.truncate(index + 1);
        if let Some(target) = self.history.pop() {
            self.current = target;
        }
    }

    pub fn update_current_node(&mut self, node: KnowledgeNode) {
        self.current = node;
    }

    /// Sustituye todos los ancestros que cumplan `predicate`.
    pub fn update_history_node(&mut self, predicate: impl Fn(&KnowledgeNode) -> bool, node: &KnowledgeNode) {
        for entry in self.history.iter_mut().filter(|entry| predicate(entry)) {
            *entry = node.clone();
        }
    }

    pub fn current_depth(&self) -> usize {
        self.history.len()
    }

    pub fn can_go_back(&self) -> bool {
        !self.history.is_empty()
    }

    /// Títulos desde la raíz hasta el nodo actual.
    pub fn breadcrumb_path(&self) -> Vec<String> {
        self.history
            .iter()
            .chain(std::iter::once(&self.current))
            .map(|node| node.title.clone())
            .collect()
    }
}

/// Busca cada subárbol igual a `parent` y sustituye en sus hijos el nodo igual
/// a `old` por `new`. Recorre el árbol entero: un mismo nodo puede aparecer
/// en varias posiciones. Devuelve el número de sustituciones.
pub fn merge_into_tree(
    root: &mut KnowledgeNode,
    parent: &KnowledgeNode,
    old: &KnowledgeNode,
    new: &KnowledgeNode,
    matcher: NodeMatch,
) -> usize {
    let mut replaced = 0;
    if matcher.matches(root, parent) {
        for child in root.children.iter_mut().filter(|child| matcher.matches(child, old)) {
            *child = new.clone();
            replaced += 1;
        }
    }
    for child in &mut root.children {
        replaced += merge_into_tree(child, parent, old, new, matcher);
    }
    replaced
}

/// Primer nodo del árbol (en preorden) igual a `target`.
pub fn find_node<'a>(
    root: &'a KnowledgeNode,
    target: &KnowledgeNode,
    matcher: NodeMatch,
) -> Option<&'a KnowledgeNode> {
    if matcher.matches(root, target) {
        return Some(root);
    }
    root.children
        .iter()
        .find_map(|child| find_node(child, target, matcher))
}

/// Copias de todos los nodos que tienen entre sus hijos uno igual a `target`.
pub fn find_parents(root: &KnowledgeNode, target: &KnowledgeNode, matcher: NodeMatch) -> Vec<KnowledgeNode> {
    let mut parents = Vec::new();
    collect_parents(root, target, matcher, &mut parents);
    parents
}

fn collect_parents(node: &KnowledgeNode, target: &KnowledgeNode, matcher: NodeMatch, out: &mut Vec<KnowledgeNode>) {
    if node.children.iter().any(|child| matcher.matches(child, target)) {
        out.push(node.clone());
    }
    for child in &node.children {
        collect_parents(child, target, matcher, out);
    }
}
