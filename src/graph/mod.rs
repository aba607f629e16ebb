//! The module graph: per-path compilation state and dependency edges.
//!
//! A module is identified by its absolute path. The graph owns the
//! forward edges (`dependencies` / `dependencyMap`) on each module and
//! the reverse edges (`initiators`) as a separate map. Cycles are
//! permitted; the linker handles them with CommonJS semantics.

use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;
use thiserror::Error;

use crate::fs::FsError;
use crate::hmr::HotState;
use crate::preset::TransformError;
use crate::resolver::ResolveError;

/// Why a module failed to compile. Captured on the module so sibling
/// modules keep compiling; the closure await surfaces the first one.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Read(#[from] FsError),
}

/// Outcome of invalidating a module's compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    /// The module is hot; it was marked dirty for re-evaluation.
    MarkedDirty,
    /// HMR cannot absorb the change; the host page must fully reload.
    RequiresReload,
    /// No module existed at that path.
    Missing,
}

/// One node of the graph.
#[derive(Debug, Default)]
pub struct Module {
    pub path: String,
    /// Original source text, refreshed from the FS when compilation is
    /// invalidated.
    pub source: String,
    /// Compiled text; `None` before compilation or after an error.
    pub compiled: Option<String>,
    pub is_entry: bool,
    pub error: Option<CompileError>,
    /// Resolved dependency paths, deduplicated, in discovery order.
    pub dependencies: Vec<String>,
    /// Original import specifier to resolved path.
    pub dependency_map: FxHashMap<String, String>,
    pub hot: HotState,
}

impl Module {
    pub fn new(path: String, source: String) -> Self {
        Self {
            path,
            source,
            ..Default::default()
        }
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled.is_some()
    }
}

/// Path-keyed module map plus the inverse dependency edges.
#[derive(Default)]
pub struct ModuleGraph {
    modules: RefCell<FxHashMap<String, Rc<RefCell<Module>>>>,
    initiators: RefCell<FxHashMap<String, BTreeSet<String>>>,
}

impl ModuleGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<Rc<RefCell<Module>>> {
        self.modules.borrow().get(path).cloned()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.modules.borrow().contains_key(path)
    }

    pub fn is_compiled(&self, path: &str) -> bool {
        self.get(path)
            .map(|module| module.borrow().is_compiled())
            .unwrap_or(false)
    }

    /// Create the module or refresh its source. Refreshing clears any
    /// previous error so the next compile starts clean.
    pub fn upsert(&self, path: &str, source: String) -> Rc<RefCell<Module>> {
        let mut modules = self.modules.borrow_mut();
        match modules.get(path) {
            Some(module) => {
                {
                    let mut m = module.borrow_mut();
                    if m.source != source {
                        m.source = source;
                        m.compiled = None;
                    }
                    m.error = None;
                }
                Rc::clone(module)
            }
            None => {
                let module = Rc::new(RefCell::new(Module::new(path.to_string(), source)));
                modules.insert(path.to_string(), Rc::clone(&module));
                module
            }
        }
    }

    /// Register a resolved dependency edge, updating the module's
    /// forward maps and the target's reverse edge.
    pub fn add_dependency(&self, from: &str, specifier: &str, resolved: &str) {
        if let Some(module) = self.get(from) {
            let mut m = module.borrow_mut();
            m.dependency_map
                .insert(specifier.to_string(), resolved.to_string());
            if !m.dependencies.iter().any(|d| d == resolved) {
                m.dependencies.push(resolved.to_string());
            }
        }
        self.initiators
            .borrow_mut()
            .entry(resolved.to_string())
            .or_default()
            .insert(from.to_string());
    }

    /// Who imports `path`.
    pub fn initiators_of(&self, path: &str) -> BTreeSet<String> {
        self.initiators
            .borrow()
            .get(path)
            .cloned()
            .unwrap_or_default()
    }

    /// Clear a module's compilation and its outgoing edges. When the
    /// change can be absorbed by HMR the module is marked dirty,
    /// otherwise the caller must escalate to a full reload.
    pub fn reset_compilation(&self, path: &str, hmr_enabled: bool) -> ResetOutcome {
        let Some(module) = self.get(path) else {
            return ResetOutcome::Missing;
        };

        let dependencies = {
            let mut m = module.borrow_mut();
            m.compiled = None;
            m.error = None;
            std::mem::take(&mut m.dependencies)
        };
        module.borrow_mut().dependency_map.clear();

        // Reverse edges follow the forward edges.
        let mut initiators = self.initiators.borrow_mut();
        for dependency in &dependencies {
            if let Some(set) = initiators.get_mut(dependency) {
                set.remove(path);
            }
        }
        drop(initiators);

        if hmr_enabled && self.accepts_update(path) {
            module.borrow_mut().hot.is_dirty = true;
            ResetOutcome::MarkedDirty
        } else {
            ResetOutcome::RequiresReload
        }
    }

    /// Whether the module itself or some transitive initiator declared
    /// an accept handler.
    pub fn accepts_update(&self, path: &str) -> bool {
        let mut queue = vec![path.to_string()];
        let mut seen = BTreeSet::new();

        while let Some(current) = queue.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(module) = self.get(&current) {
                if module.borrow().hot.is_hot {
                    return true;
                }
            }
            queue.extend(self.initiators_of(&current));
        }
        false
    }

    /// Modules currently marked dirty, in a stable order.
    pub fn dirty_modules(&self) -> Vec<String> {
        let mut dirty: Vec<String> = self
            .modules
            .borrow()
            .iter()
            .filter(|(_, module)| module.borrow().hot.is_dirty)
            .map(|(path, _)| path.clone())
            .collect();
        dirty.sort();
        dirty
    }

    /// Modules whose hot handle called `invalidate()`.
    pub fn invalidated_modules(&self) -> Vec<String> {
        let mut invalidated: Vec<String> = self
            .modules
            .borrow()
            .iter()
            .filter(|(_, module)| module.borrow().hot.invalidated)
            .map(|(path, _)| path.clone())
            .collect();
        invalidated.sort();
        invalidated
    }

    pub fn mark_entry(&self, path: &str) {
        if let Some(module) = self.get(path) {
            module.borrow_mut().is_entry = true;
        }
    }

    /// All module paths, unordered.
    pub fn paths(&self) -> Vec<String> {
        self.modules.borrow().keys().cloned().collect()
    }

    /// Drop every module and edge. Only the owning bundler's reset does
    /// this.
    pub fn clear(&self) {
        self.modules.borrow_mut().clear();
        self.initiators.borrow_mut().clear();
    }
}
