//! Reverse mapping from a live scope to the entry ids that live under it.

use crate::scope::ScopeId;

/// Read-only view of a scope hierarchy.
pub trait ScopeGraph {
    /// Parent of `scope`; the root is its own parent. `None` for unknown scopes.
    fn parent(&self, scope: ScopeId) -> Option<ScopeId>;

    /// Entry id attached to `scope`, if any.
    fn tag(&self, scope: ScopeId) -> Option<&str>;

    /// Live instances grouped under `scope` when it is an aggregation node.
    fn aggregated(&self, scope: ScopeId) -> Option<&[ScopeId]>;
}

/// Entry ids rooted at `scope`, in child order.
///
/// Walks parent links until a tagged scope or the root is reached. An
/// aggregation node contributes the ids of each of its instances.
pub fn paths<G: ScopeGraph + ?Sized>(graph: &G, scope: ScopeId) -> Vec<String> {
    let mut out = Vec::new();
    let mut stack = vec![scope];

    while let Some(node) = stack.pop() {
        let Some(parent) = graph.parent(node) else {
            continue;
        };
        if parent == node {
            continue;
        }
        if let Some(instances) = graph.aggregated(node) {
            // Reversed so the stack yields them in child order
            stack.extend(instances.iter().rev().copied());
            continue;
        }
        match graph.tag(node) {
            Some(id) => out.push(id.to_string()),
            None => stack.push(parent),
        }
    }

    out
}
