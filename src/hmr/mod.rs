//! Hot module replacement bookkeeping.
//!
//! Rust-side state is limited to per-module flags and the update plan;
//! the JS-side handles (accept/dispose callbacks, carried `data`) live
//! in the linker, which owns all engine values.

use crate::graph::ModuleGraph;
use std::collections::BTreeSet;

/// Per-module hot state, stored on the graph node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HotState {
    /// The module (or something evaluating it) called `accept`.
    pub is_hot: bool,
    /// Recompiled since the last evaluation; pending re-run.
    pub is_dirty: bool,
    /// `invalidate()` was called: the next evaluation must restart the
    /// compile instead of patching in place.
    pub invalidated: bool,
}

/// What the evaluator should do for the current set of dirty modules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdatePlan {
    /// Nothing dirty; evaluation is a noop.
    Clean,
    /// Re-evaluate `dirty` in order and fire accept handlers on
    /// `accepters` afterwards.
    Patch {
        dirty: Vec<String>,
        accepters: Vec<String>,
    },
    /// No accepting ancestor: the host page must fully reload.
    FullReload,
}

/// Build the update plan for the graph's dirty modules.
///
/// Dirty modules are ordered initiator-first: a dirty importer runs
/// before its dirty dependency, which the importer's `require` then
/// re-evaluates on demand. Accepters are the nearest hot modules found
/// walking the initiator edges from each dirty module.
pub fn plan_update(graph: &ModuleGraph) -> UpdatePlan {
    let dirty = graph.dirty_modules();
    if dirty.is_empty() {
        return UpdatePlan::Clean;
    }

    let mut accepters: BTreeSet<String> = BTreeSet::new();
    for path in &dirty {
        if !graph.accepts_update(path) {
            return UpdatePlan::FullReload;
        }
        accepters.extend(nearest_accepters(graph, path));
    }

    UpdatePlan::Patch {
        dirty: order_initiator_first(graph, dirty),
        accepters: accepters.into_iter().collect(),
    }
}

/// Order dirty modules so that initiators precede the dirty modules
/// they depend on (reverse-topological over dependency edges,
/// restricted to the dirty set; stable for disconnected modules).
fn order_initiator_first(graph: &ModuleGraph, dirty: Vec<String>) -> Vec<String> {
    let members: BTreeSet<String> = dirty.iter().cloned().collect();
    let mut visited: BTreeSet<String> = BTreeSet::new();
    let mut post_order: Vec<String> = Vec::new();

    fn visit(
        graph: &ModuleGraph,
        path: &str,
        members: &BTreeSet<String>,
        visited: &mut BTreeSet<String>,
        post_order: &mut Vec<String>,
    ) {
        if !visited.insert(path.to_string()) {
            return;
        }
        let dependencies = graph
            .get(path)
            .map(|m| m.borrow().dependencies.clone())
            .unwrap_or_default();
        for dependency in dependencies {
            if members.contains(&dependency) {
                visit(graph, &dependency, members, visited, post_order);
            }
        }
        post_order.push(path.to_string());
    }

    for path in &dirty {
        visit(graph, path, &members, &mut visited, &mut post_order);
    }
    post_order.reverse();
    post_order
}

/// The closest modules with an accept handler, walking initiators
/// breadth-first from `path` (including `path` itself).
fn nearest_accepters(graph: &ModuleGraph, path: &str) -> Vec<String> {
    let mut queue = vec![path.to_string()];
    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut found = Vec::new();

    while let Some(current) = queue.pop() {
        if !seen.insert(current.clone()) {
            continue;
        }
        let is_hot = graph
            .get(&current)
            .map(|m| m.borrow().hot.is_hot)
            .unwrap_or(false);
        if is_hot {
            found.push(current);
            continue;
        }
        queue.extend(graph.initiators_of(&current));
    }

    found
}

/// Clear dirty flags after a successful patch evaluation.
pub fn finish_update(graph: &ModuleGraph, dirty: &[String]) {
    for path in dirty {
        if let Some(module) = graph.get(path) {
            module.borrow_mut().hot.is_dirty = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_graph() -> ModuleGraph {
        let graph = ModuleGraph::new();
        graph.upsert("/index.js", String::new());
        graph.upsert("/leaf.js", String::new());
        graph.add_dependency("/index.js", "./leaf", "/leaf.js");
        graph
    }

    #[test]
    fn clean_graph_plans_nothing() {
        let graph = leaf_graph();
        assert_eq!(plan_update(&graph), UpdatePlan::Clean);
    }

    #[test]
    fn unaccepted_change_escalates() {
        let graph = leaf_graph();
        graph.get("/leaf.js").unwrap().borrow_mut().hot.is_dirty = true;
        assert_eq!(plan_update(&graph), UpdatePlan::FullReload);
    }

    #[test]
    fn accepting_importer_produces_patch_plan() {
        let graph = leaf_graph();
        graph.get("/index.js").unwrap().borrow_mut().hot.is_hot = true;
        graph.get("/leaf.js").unwrap().borrow_mut().hot.is_dirty = true;

        let plan = plan_update(&graph);
        assert_eq!(
            plan,
            UpdatePlan::Patch {
                dirty: vec!["/leaf.js".to_string()],
                accepters: vec!["/index.js".to_string()],
            }
        );
    }

    #[test]
    fn self_accepting_module_is_its_own_accepter() {
        let graph = leaf_graph();
        let leaf = graph.get("/leaf.js").unwrap();
        leaf.borrow_mut().hot.is_hot = true;
        leaf.borrow_mut().hot.is_dirty = true;

        assert_eq!(
            plan_update(&graph),
            UpdatePlan::Patch {
                dirty: vec!["/leaf.js".to_string()],
                accepters: vec!["/leaf.js".to_string()],
            }
        );
    }
}
