//! The evaluation linker: executes compiled modules inside a Boa
//! context in dependency order.
//!
//! Compiled code is CommonJS; every module is wrapped in
//! `(function (require, module, exports, globals, __hot__) { ... })`
//! and invoked with a native `require` that consults the module's
//! precomputed dependency map. Exports are cached before the body runs,
//! so circular imports observe the partially populated object. Built-in
//! shims materialize on demand inside `require` — the only lookup
//! allowed to side-effect the module map.

use boa_engine::{
    js_string, object::ObjectInitializer, property::Attribute, Context, JsData, JsNativeError,
    JsObject, JsResult, JsValue, NativeFunction, Source,
};
use boa_gc::{Finalize, Trace};
use boa_runtime::{
    extensions::{ConsoleExtension, EncodingExtension, UrlExtension},
    register_extensions, ConsoleState, Logger,
};
use rustc_hash::FxHashMap;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use thiserror::Error;
use tracing::debug;

use crate::fs::FileSystem;
use crate::graph::ModuleGraph;
use crate::hmr::{self, UpdatePlan};
use crate::preset::Preset;
use crate::shims;

/// Errors that can occur while evaluating the program.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    #[error("Runtime exception in {path}: {message}")]
    Runtime { path: String, message: String },

    #[error("Module '{path}' has not been compiled")]
    NotCompiled { path: String },

    #[error("Engine error: {0}")]
    Engine(String),
}

/// Result type for evaluation operations.
pub type EvalResult<T> = Result<T, EvalError>;

/// What an evaluation pass concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalOutcome {
    /// Modules ran (or nothing was dirty).
    Evaluated,
    /// A hot handle called `invalidate()`: restart the compile.
    NeedsRestart,
    /// No accepting ancestor for a dirty module: full reload.
    RequiresReload,
}

/// Console severity, mirroring the host console hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Log,
    Info,
    Warn,
    Error,
}

/// One captured console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleEntry {
    pub level: LogLevel,
    pub message: String,
}

/// Logger that records console output for the host to drain.
#[derive(Debug, Clone, Default, Trace, Finalize)]
struct CaptureLogger {
    #[unsafe_ignore_trace]
    entries: Rc<RefCell<Vec<ConsoleEntry>>>,
}

impl CaptureLogger {
    fn push(&self, level: LogLevel, message: String) {
        self.entries.borrow_mut().push(ConsoleEntry { level, message });
    }
}

impl Logger for CaptureLogger {
    fn log(&self, msg: String, _state: &ConsoleState, _context: &mut Context) -> JsResult<()> {
        self.push(LogLevel::Log, msg);
        Ok(())
    }

    fn info(&self, msg: String, _state: &ConsoleState, _context: &mut Context) -> JsResult<()> {
        self.push(LogLevel::Info, msg);
        Ok(())
    }

    fn warn(&self, msg: String, _state: &ConsoleState, _context: &mut Context) -> JsResult<()> {
        self.push(LogLevel::Warn, msg);
        Ok(())
    }

    fn error(&self, msg: String, _state: &ConsoleState, _context: &mut Context) -> JsResult<()> {
        self.push(LogLevel::Error, msg);
        Ok(())
    }
}

/// JS-side HMR handles for one module.
struct HotHandles {
    accept: Vec<JsObject>,
    dispose: Vec<JsObject>,
    /// Opaque user data carried across reloads.
    data: JsValue,
}

impl Default for HotHandles {
    fn default() -> Self {
        Self {
            accept: Vec::new(),
            dispose: Vec::new(),
            data: JsValue::undefined(),
        }
    }
}

/// State shared between the evaluator and its native closures.
struct LinkerState {
    graph: Rc<ModuleGraph>,
    fs: Rc<FileSystem>,
    preset: Rc<Preset>,
    exports: RefCell<FxHashMap<String, JsValue>>,
    hot: RefCell<FxHashMap<String, HotHandles>>,
}

/// Captures for the native `require` and hot-handle functions.
#[derive(Trace, Finalize, JsData)]
struct LinkerCaptures {
    #[unsafe_ignore_trace]
    state: Rc<LinkerState>,
    #[unsafe_ignore_trace]
    path: String,
}

/// The evaluate thunk returned by the orchestrator. Owns the Boa
/// context, which persists across HMR patches; a full reload builds a
/// fresh evaluator (the page-reload analog).
pub struct Evaluator {
    context: RefCell<Context>,
    state: Rc<LinkerState>,
    console: Rc<RefCell<Vec<ConsoleEntry>>>,
    runtimes: Vec<String>,
    first_run: Cell<bool>,
}

impl Evaluator {
    pub fn new(
        graph: Rc<ModuleGraph>,
        fs: Rc<FileSystem>,
        preset: Rc<Preset>,
        runtimes: Vec<String>,
    ) -> EvalResult<Self> {
        let console = Rc::new(RefCell::new(Vec::new()));
        let logger = CaptureLogger {
            entries: Rc::clone(&console),
        };

        let mut context = Context::default();
        // Large module graphs recurse deeply through require chains.
        context.runtime_limits_mut().set_recursion_limit(16384);
        context
            .runtime_limits_mut()
            .set_stack_size_limit(1024 * 1024);

        register_extensions(
            (ConsoleExtension(logger), UrlExtension, EncodingExtension),
            None,
            &mut context,
        )
        .map_err(|e| EvalError::Engine(e.to_string()))?;

        Ok(Self {
            context: RefCell::new(context),
            state: Rc::new(LinkerState {
                graph,
                fs,
                preset,
                exports: RefCell::new(FxHashMap::default()),
                hot: RefCell::new(FxHashMap::default()),
            }),
            console,
            runtimes,
            first_run: Cell::new(true),
        })
    }

    /// Run the program. The first call evaluates the runtime modules in
    /// registration order and then the entry; later calls re-evaluate
    /// only dirty modules, initiator-first.
    pub fn evaluate(&self, entry: &str) -> EvalResult<EvalOutcome> {
        let mut context = self.context.borrow_mut();

        if self.first_run.get() {
            for runtime in &self.runtimes {
                self.run_module(runtime, &mut context)?;
            }
            self.run_module(entry, &mut context)?;
            self.first_run.set(false);
            return Ok(EvalOutcome::Evaluated);
        }

        if !self.state.graph.invalidated_modules().is_empty() {
            return Ok(EvalOutcome::NeedsRestart);
        }

        match hmr::plan_update(&self.state.graph) {
            UpdatePlan::Clean => {
                // The entry itself may be new (e.g. package.json main
                // changed) and never evaluated in this context.
                if self.state.exports.borrow().get(entry).is_none() {
                    self.run_module(entry, &mut context)?;
                }
                Ok(EvalOutcome::Evaluated)
            }
            UpdatePlan::FullReload => Ok(EvalOutcome::RequiresReload),
            UpdatePlan::Patch { dirty, accepters } => {
                debug!(?dirty, ?accepters, "applying hot update");
                for path in &dirty {
                    self.dispose_module(path, &mut context)?;
                }
                for path in &dirty {
                    self.run_module(path, &mut context)?;
                }
                for path in &accepters {
                    self.fire_accept_handlers(path, &mut context)?;
                }
                hmr::finish_update(&self.state.graph, &dirty);
                Ok(EvalOutcome::Evaluated)
            }
        }
    }

    /// Evaluate a console command against the current global scope.
    pub fn evaluate_command(&self, command: &str) -> EvalResult<String> {
        let mut context = self.context.borrow_mut();
        let value = context
            .eval(Source::from_bytes(command.as_bytes()))
            .map_err(|e| EvalError::Runtime {
                path: "<repl>".to_string(),
                message: e.to_string(),
            })?;
        Ok(value.display().to_string())
    }

    /// Drain captured console output.
    pub fn take_console(&self) -> Vec<ConsoleEntry> {
        std::mem::take(&mut self.console.borrow_mut())
    }

    /// The cached exports of a module, if it has been evaluated.
    pub fn exports_of(&self, path: &str) -> Option<JsValue> {
        self.state.exports.borrow().get(path).cloned()
    }

    fn run_module(&self, path: &str, context: &mut Context) -> EvalResult<()> {
        // A module with neither cached exports nor compiled code is a
        // scheduling invariant violation, not a user exception.
        let has_exports = self.state.exports.borrow().contains_key(path);
        if !has_exports && !self.state.graph.is_compiled(path) {
            return Err(EvalError::NotCompiled {
                path: path.to_string(),
            });
        }

        evaluate_module(&self.state, path, context)
            .map(|_| ())
            .map_err(|e| EvalError::Runtime {
                path: path.to_string(),
                message: e.to_string(),
            })
    }

    /// Run a dirty module's dispose handlers, carry its `data`, and
    /// drop the stale evaluation.
    fn dispose_module(&self, path: &str, context: &mut Context) -> EvalResult<()> {
        let handlers = {
            let mut hot = self.state.hot.borrow_mut();
            hot.get_mut(path).map(std::mem::take)
        };

        if let Some(handles) = handlers {
            let data = JsObject::with_object_proto(context.intrinsics());
            for handler in &handles.dispose {
                handler
                    .call(&JsValue::undefined(), &[data.clone().into()], context)
                    .map_err(|e| EvalError::Runtime {
                        path: path.to_string(),
                        message: e.to_string(),
                    })?;
            }
            self.state.hot.borrow_mut().insert(
                path.to_string(),
                HotHandles {
                    data: data.into(),
                    ..HotHandles::default()
                },
            );
        }

        self.state.exports.borrow_mut().remove(path);
        Ok(())
    }

    fn fire_accept_handlers(&self, path: &str, context: &mut Context) -> EvalResult<()> {
        let handlers: Vec<JsObject> = self
            .state
            .hot
            .borrow()
            .get(path)
            .map(|h| h.accept.clone())
            .unwrap_or_default();
        for handler in handlers {
            handler
                .call(&JsValue::undefined(), &[], context)
                .map_err(|e| EvalError::Runtime {
                    path: path.to_string(),
                    message: e.to_string(),
                })?;
        }
        Ok(())
    }
}

/// Evaluate one module, returning its exports. Re-entrant calls return
/// the cached (possibly still-populating) exports object.
fn evaluate_module(state: &Rc<LinkerState>, path: &str, context: &mut Context) -> JsResult<JsValue> {
    if let Some(cached) = state.exports.borrow().get(path) {
        return Ok(cached.clone());
    }

    let code = {
        let module = state.graph.get(path).ok_or_else(|| {
            JsNativeError::typ().with_message(format!("Module '{path}' is not in the graph"))
        })?;
        let m = module.borrow();
        m.compiled.clone().ok_or_else(|| {
            JsNativeError::typ().with_message(format!("Module '{path}' has not been compiled"))
        })?
    };

    let exports = JsObject::with_object_proto(context.intrinsics());
    let exports_value = JsValue::from(exports);
    // Cache before running the body: circular imports see the partial
    // exports, CommonJS-style.
    state
        .exports
        .borrow_mut()
        .insert(path.to_string(), exports_value.clone());

    let module_object = ObjectInitializer::new(context)
        .property(js_string!("id"), js_string!(path), Attribute::all())
        .property(js_string!("exports"), exports_value.clone(), Attribute::all())
        .build();
    let require = build_require(state, path, context);
    let hot = build_hot_handle(state, path, context);
    let globals = context.global_object();

    let wrapper = format!(
        "(function (require, module, exports, globals, __hot__) {{\n{code}\n//# sourceURL={path}\n}})"
    );
    let wrapped = context.eval(Source::from_bytes(wrapper.as_bytes()));
    let function = wrapped
        .and_then(|value| {
            value
                .as_object()
                .filter(JsObject::is_callable)
                .ok_or_else(|| {
                    JsNativeError::typ()
                        .with_message("module wrapper did not evaluate to a function")
                        .into()
                })
        })
        .inspect_err(|_| {
            state.exports.borrow_mut().remove(path);
        })?;

    let call_result = function.call(
        &JsValue::undefined(),
        &[
            require,
            module_object.clone().into(),
            exports_value,
            globals.into(),
            hot,
        ],
        context,
    );
    if let Err(error) = call_result {
        state.exports.borrow_mut().remove(path);
        return Err(error);
    }

    // `module.exports` may have been reassigned wholesale.
    let final_exports = module_object.get(js_string!("exports"), context)?;
    state
        .exports
        .borrow_mut()
        .insert(path.to_string(), final_exports.clone());
    Ok(final_exports)
}

/// The synchronous `require` for one module: consult its dependency
/// map, fall back to built-in shims, fail with specifier and origin.
fn build_require(state: &Rc<LinkerState>, path: &str, context: &mut Context) -> JsValue {
    let captures = LinkerCaptures {
        state: Rc::clone(state),
        path: path.to_string(),
    };
    NativeFunction::from_copy_closure_with_captures(
        |_this, args, captures, context| {
            let specifier = args
                .get(0)
                .and_then(|v| v.as_string())
                .map(|s| s.to_std_string_escaped())
                .unwrap_or_default();
            require_module(&captures.state, &captures.path, &specifier, context)
        },
        captures,
    )
    .to_js_function(context.realm())
    .into()
}

fn require_module(
    state: &Rc<LinkerState>,
    from: &str,
    specifier: &str,
    context: &mut Context,
) -> JsResult<JsValue> {
    let mapped = state
        .graph
        .get(from)
        .and_then(|m| m.borrow().dependency_map.get(specifier).cloned());

    let target = match mapped {
        Some(target) => target,
        None => match shims::builtin_path(specifier) {
            Some(shim) => shim,
            None => {
                return Err(JsNativeError::typ()
                    .with_message(format!(
                        "Cannot find module '{specifier}' (required from {from})"
                    ))
                    .into())
            }
        },
    };

    if shims::is_shim_path(&target) && !state.graph.is_compiled(&target) {
        materialize_shim(state, &target)?;
    }

    evaluate_module(state, &target, context)
}

/// Compile a shim the moment it is first required. Shim dependencies
/// are themselves built-ins, so resolution here stays synchronous.
fn materialize_shim(state: &Rc<LinkerState>, path: &str) -> JsResult<()> {
    let source = state.fs.read_sync(path).map_err(|e| {
        JsNativeError::typ().with_message(format!("Cannot load built-in module: {e}"))
    })?;
    let module = state.graph.upsert(path, source.clone());

    let output = state
        .preset
        .transform(path, source)
        .map_err(|e| JsNativeError::typ().with_message(e.to_string()))?;
    module.borrow_mut().compiled = Some(output.code);

    for specifier in output.dependencies {
        if let Some(resolved) = shims::builtin_path(&specifier) {
            state.graph.add_dependency(path, &specifier, &resolved);
        }
    }
    Ok(())
}

/// The `__hot__` handle: `accept`, `dispose`, `invalidate` plus the
/// carried `data` value.
fn build_hot_handle(state: &Rc<LinkerState>, path: &str, context: &mut Context) -> JsValue {
    let data = state
        .hot
        .borrow_mut()
        .entry(path.to_string())
        .or_default()
        .data
        .clone();

    let accept = NativeFunction::from_copy_closure_with_captures(
        |_this, args, captures, _context| {
            if let Some(handler) = args
                .get(0)
                .and_then(|v| v.as_object())
                .filter(JsObject::is_callable)
            {
                captures
                    .state
                    .hot
                    .borrow_mut()
                    .entry(captures.path.clone())
                    .or_default()
                    .accept
                    .push(handler);
            }
            if let Some(module) = captures.state.graph.get(&captures.path) {
                module.borrow_mut().hot.is_hot = true;
            }
            Ok(JsValue::undefined())
        },
        LinkerCaptures {
            state: Rc::clone(state),
            path: path.to_string(),
        },
    );

    let dispose = NativeFunction::from_copy_closure_with_captures(
        |_this, args, captures, _context| {
            if let Some(handler) = args
                .get(0)
                .and_then(|v| v.as_object())
                .filter(JsObject::is_callable)
            {
                captures
                    .state
                    .hot
                    .borrow_mut()
                    .entry(captures.path.clone())
                    .or_default()
                    .dispose
                    .push(handler);
            }
            Ok(JsValue::undefined())
        },
        LinkerCaptures {
            state: Rc::clone(state),
            path: path.to_string(),
        },
    );

    let invalidate = NativeFunction::from_copy_closure_with_captures(
        |_this, _args, captures, _context| {
            if let Some(module) = captures.state.graph.get(&captures.path) {
                module.borrow_mut().hot.invalidated = true;
            }
            Ok(JsValue::undefined())
        },
        LinkerCaptures {
            state: Rc::clone(state),
            path: path.to_string(),
        },
    );

    ObjectInitializer::new(context)
        .function(accept, js_string!("accept"), 1)
        .function(dispose, js_string!("dispose"), 1)
        .function(invalidate, js_string!("invalidate"), 0)
        .property(js_string!("data"), data, Attribute::all())
        .build()
        .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::Resolver;
    use crate::scheduler::Scheduler;

    async fn evaluator(files: &[(&str, &str)], entry: &str) -> Evaluator {
        let fs = FileSystem::new();
        for (path, content) in files {
            fs.write_sync(path, (*content).to_string());
        }
        let fs = fs.into_shared();
        shims::seed(&fs);

        let graph = Rc::new(ModuleGraph::new());
        let resolver = Rc::new(Resolver::new(Rc::clone(&fs)));
        let preset = Rc::new(Preset::vanilla());
        let scheduler = Scheduler::new(
            Rc::clone(&fs),
            Rc::clone(&graph),
            resolver,
            Rc::clone(&preset),
        );
        let _ = scheduler.transform_module(entry);
        scheduler.module_finished(entry).await.unwrap();

        Evaluator::new(graph, fs, preset, Vec::new()).unwrap()
    }

    #[tokio::test]
    async fn evaluates_relative_imports() {
        let evaluator = evaluator(
            &[
                ("/index.js", "import x from \"./m\"; console.log(x);"),
                ("/m.js", "export default 42;"),
            ],
            "/index.js",
        )
        .await;

        evaluator.evaluate("/index.js").unwrap();
        let console = evaluator.take_console();
        assert_eq!(console.len(), 1);
        assert_eq!(console[0].message, "42");
        assert_eq!(console[0].level, LogLevel::Log);
    }

    #[tokio::test]
    async fn circular_imports_observe_partial_exports() {
        let evaluator = evaluator(
            &[
                (
                    "/a.js",
                    "exports.early = \"a-early\";\nvar b = require(\"./b\");\nexports.late = b.sawEarly;",
                ),
                (
                    "/b.js",
                    "var a = require(\"./a\");\nexports.sawEarly = a.early;\nconsole.log(a.late === undefined);",
                ),
            ],
            "/a.js",
        )
        .await;

        evaluator.evaluate("/a.js").unwrap();
        // b ran while a was mid-evaluation: late was not assigned yet.
        let console = evaluator.take_console();
        assert_eq!(console[0].message, "true");

        let exports = evaluator.exports_of("/a.js").unwrap();
        let object = exports.as_object().unwrap();
        let mut context = evaluator.context.borrow_mut();
        let late = object.get(js_string!("late"), &mut context).unwrap();
        assert_eq!(
            late.as_string().map(|s| s.to_std_string_escaped()).as_deref(),
            Some("a-early")
        );
    }

    #[tokio::test]
    async fn builtin_and_node_prefixed_requires_share_exports() {
        let evaluator = evaluator(
            &[(
                "/index.js",
                "var a = require(\"stream\");\nvar b = require(\"node:stream\");\nconsole.log(a === b);",
            )],
            "/index.js",
        )
        .await;

        evaluator.evaluate("/index.js").unwrap();
        assert_eq!(evaluator.take_console()[0].message, "true");
    }

    #[tokio::test]
    async fn shims_materialize_transitively() {
        // A computed specifier is invisible to the dependency scan, so
        // the stream shim (and the events shim it requires) only enter
        // the graph when `require` materializes them.
        let evaluator = evaluator(
            &[(
                "/index.js",
                "var name = \"str\" + \"eam\";\nvar Stream = require(name);\nvar s = new Stream.Readable();\ns.on(\"data\", function (c) { console.log(c); });\ns.push(\"chunk\");",
            )],
            "/index.js",
        )
        .await;

        evaluator.evaluate("/index.js").unwrap();
        assert_eq!(evaluator.take_console()[0].message, "chunk");
    }

    #[tokio::test]
    async fn unknown_specifier_names_specifier_and_origin() {
        let evaluator = evaluator(
            &[(
                "/index.js",
                "var name = \"./gone\";\nmodule.exports = require(name);",
            )],
            "/index.js",
        )
        .await;

        let error = evaluator.evaluate("/index.js").unwrap_err();
        let message = error.to_string();
        assert!(message.contains("./gone"));
        assert!(message.contains("/index.js"));
    }

    #[tokio::test]
    async fn uncompiled_modules_surface_a_typed_error() {
        let fs = FileSystem::new().into_shared();
        let graph = Rc::new(ModuleGraph::new());
        // In the graph, but never compiled by a scheduler.
        graph.upsert("/index.js", "console.log(1);".into());

        let evaluator =
            Evaluator::new(graph, fs, Rc::new(Preset::vanilla()), Vec::new()).unwrap();
        let error = evaluator.evaluate("/index.js").unwrap_err();
        assert_eq!(
            error,
            EvalError::NotCompiled {
                path: "/index.js".to_string()
            }
        );
    }

    #[tokio::test]
    async fn accept_marks_the_module_hot() {
        let evaluator = evaluator(
            &[("/index.js", "__hot__.accept();\nmodule.exports = 1;")],
            "/index.js",
        )
        .await;

        evaluator.evaluate("/index.js").unwrap();
        let module = evaluator.state.graph.get("/index.js").unwrap();
        assert!(module.borrow().hot.is_hot);
    }

    #[tokio::test]
    async fn repl_commands_see_module_globals() {
        let evaluator = evaluator(
            &[("/index.js", "globals.answer = 41 + 1;")],
            "/index.js",
        )
        .await;

        evaluator.evaluate("/index.js").unwrap();
        assert_eq!(evaluator.evaluate_command("answer").unwrap(), "42");
    }
}
