//! The orchestrator: drives a compile request end-to-end and emits
//! status transitions to the host.
//!
//! A request flows through: FS diff, preset initialization, dependency
//! manifest + package preload, entry resolution, closure transformation,
//! and evaluation, with HMR bookkeeping on subsequent compiles. All
//! mutable state is owned by the bundler instance; test harnesses
//! construct fresh instances.

pub mod protocol;

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::fs::{path as vpath, BridgeLayer, FileResolver, FileSystem, Layer, PackageLayer};
use crate::graph::{CompileError, ModuleGraph};
use crate::hmr;
use crate::linker::{ConsoleEntry, EvalOutcome, Evaluator, LogLevel};
use crate::preset::Preset;
use crate::registry::{
    manifest, DependencySet, PackageRegistry, PackageStore, RegistryError, DEFAULT_FETCH_RETRIES,
    DEFAULT_PACKAGER_URL,
};
use crate::resolver::Resolver;
use crate::scheduler::Scheduler;
use crate::shims;

pub use protocol::{
    BundleEntry, BundleFile, BundlerState, ConsoleRecord, ErrorFrame, ErrorPayload,
    InboundMessage, ModuleSource, OutboundMessage, Status, TranspiledModule,
    TranspiledModuleSource,
};

/// Errors that end a compile request.
#[derive(Error, Debug, Clone)]
pub enum BundlerError {
    #[error("Could not find entry point in package.json or preset defaults")]
    EntryPointUnresolved,

    #[error("Compile requested before preset initialization")]
    PresetMissing,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("Runtime exception: {0}")]
    Evaluation(String),
}

/// Result type for bundler operations.
pub type BundlerResult<T> = Result<T, BundlerError>;

/// Sink for outbound protocol messages.
pub trait Emitter {
    fn emit(&self, message: OutboundMessage);
}

/// Emitter that records messages; used by tests and by hosts that
/// drain messages in batches.
#[derive(Default)]
pub struct CollectingEmitter {
    messages: RefCell<Vec<OutboundMessage>>,
}

impl CollectingEmitter {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn take(&self) -> Vec<OutboundMessage> {
        std::mem::take(&mut self.messages.borrow_mut())
    }

    pub fn messages(&self) -> Vec<OutboundMessage> {
        self.messages.borrow().clone()
    }
}

impl Emitter for CollectingEmitter {
    fn emit(&self, message: OutboundMessage) {
        self.messages.borrow_mut().push(message);
    }
}

/// Bundler configuration.
#[derive(Debug, Clone)]
pub struct BundlerConfig {
    /// Primary packager CDN.
    pub packager_url: Url,
    /// Bounded retries per CDN request.
    pub fetch_retries: u32,
    /// Fixed delay between retries.
    pub retry_delay: Duration,
}

impl Default for BundlerConfig {
    fn default() -> Self {
        Self {
            packager_url: Url::parse(DEFAULT_PACKAGER_URL).expect("default packager URL is valid"),
            fetch_retries: DEFAULT_FETCH_RETRIES,
            retry_delay: Duration::from_millis(500),
        }
    }
}

/// One compile request, the engine-level mirror of the protocol's
/// `compile` message.
#[derive(Debug, Clone, Default)]
pub struct CompileRequest {
    /// Absolute path to file contents.
    pub files: BTreeMap<String, String>,
    pub template: String,
    /// Host override for the preset's HMR default.
    pub hmr: Option<bool>,
}

impl CompileRequest {
    pub fn new(template: &str) -> Self {
        Self {
            template: template.to_string(),
            ..Default::default()
        }
    }

    pub fn file(mut self, path: &str, code: &str) -> Self {
        self.files.insert(path.to_string(), code.to_string());
        self
    }

    pub fn hmr(mut self, enabled: bool) -> Self {
        self.hmr = Some(enabled);
        self
    }
}

/// What a compile produced.
#[derive(Debug, Clone)]
pub struct CompileSummary {
    /// Resolved entry path; `None` for HTML-only or empty projects.
    pub entry: Option<String>,
    /// The HTML document to serve (user `/index.html` or the preset
    /// default).
    pub html: String,
    pub evaluated: bool,
}

/// The compile engine. Owns the FS, graph, registry, preset and the
/// persistent evaluator.
pub struct Bundler {
    config: BundlerConfig,
    emitter: Rc<dyn Emitter>,
    fs: Rc<FileSystem>,
    store: Rc<PackageStore>,
    registry: Rc<PackageRegistry>,
    graph: Rc<ModuleGraph>,
    preset: RefCell<Option<Rc<Preset>>>,
    evaluator: RefCell<Option<Rc<Evaluator>>>,
    first_load: Cell<bool>,
    previous_files: RefCell<BTreeSet<String>>,
    dependency_signature: RefCell<Option<String>>,
}

impl Bundler {
    pub fn new(config: BundlerConfig, emitter: Rc<dyn Emitter>) -> BundlerResult<Self> {
        Self::build(config, emitter, None)
    }

    /// A bundler whose FS misses are delegated to an external file
    /// resolver (the async bridge layer).
    pub fn with_file_resolver(
        config: BundlerConfig,
        emitter: Rc<dyn Emitter>,
        resolver: Rc<dyn FileResolver>,
    ) -> BundlerResult<Self> {
        Self::build(config, emitter, Some(resolver))
    }

    fn build(
        config: BundlerConfig,
        emitter: Rc<dyn Emitter>,
        file_resolver: Option<Rc<dyn FileResolver>>,
    ) -> BundlerResult<Self> {
        let store = Rc::new(PackageStore::new());
        let registry = PackageRegistry::new(config.packager_url.clone(), Rc::clone(&store))?
            .with_retry_policy(config.fetch_retries, config.retry_delay);

        let mut fs = FileSystem::new();
        fs.push_layer(Layer::Package(PackageLayer::new(Rc::clone(&store))));
        if let Some(resolver) = file_resolver {
            fs.push_layer(Layer::Bridge(BridgeLayer::new(resolver)));
        }
        let fs = fs.into_shared();
        shims::seed(&fs);

        emitter.emit(OutboundMessage::Initialized);

        Ok(Self {
            config,
            emitter,
            fs,
            store,
            registry: Rc::new(registry),
            graph: Rc::new(ModuleGraph::new()),
            preset: RefCell::new(None),
            evaluator: RefCell::new(None),
            first_load: Cell::new(true),
            previous_files: RefCell::new(BTreeSet::new()),
            dependency_signature: RefCell::new(None),
        })
    }

    pub fn config(&self) -> &BundlerConfig {
        &self.config
    }

    pub fn fs(&self) -> Rc<FileSystem> {
        Rc::clone(&self.fs)
    }

    pub fn graph(&self) -> Rc<ModuleGraph> {
        Rc::clone(&self.graph)
    }

    pub fn package_store(&self) -> Rc<PackageStore> {
        Rc::clone(&self.store)
    }

    pub fn registry(&self) -> Rc<PackageRegistry> {
        Rc::clone(&self.registry)
    }

    /// Drain console output captured during the last evaluation.
    pub fn take_console(&self) -> Vec<ConsoleEntry> {
        self.evaluator
            .borrow()
            .as_ref()
            .map(|e| e.take_console())
            .unwrap_or_default()
    }

    fn emit(&self, message: OutboundMessage) {
        self.emitter.emit(message);
    }

    fn emit_status(&self, status: Status) {
        self.emit(OutboundMessage::Status { status });
    }

    /// Handle one inbound protocol message.
    pub async fn handle_message(&self, message: InboundMessage) {
        match message {
            InboundMessage::Compile {
                modules,
                template,
                hmr,
                ..
            } => {
                let mut request = CompileRequest::new(&template);
                request.hmr = hmr;
                for (path, module) in modules {
                    request.files.insert(path, module.code);
                }
                let _ = self.compile(request).await;
            }
            InboundMessage::Refresh => self.emit(OutboundMessage::Refresh),
            InboundMessage::Evaluate { command } => self.evaluate_command(&command),
            InboundMessage::FsResponse { .. } => {
                // Routed by the transport directly to the bridge's
                // protocol resolver; nothing to do at this level.
            }
        }
    }

    /// Console REPL pass-through.
    pub fn evaluate_command(&self, command: &str) {
        let evaluator = self.evaluator.borrow();
        let Some(evaluator) = evaluator.as_ref() else {
            return;
        };
        let result = match evaluator.evaluate_command(command) {
            Ok(result) => result,
            Err(error) => error.to_string(),
        };
        self.emit(OutboundMessage::Console {
            log: None,
            result: Some(result),
        });
    }

    /// Run one compile request end-to-end.
    pub async fn compile(&self, request: CompileRequest) -> BundlerResult<CompileSummary> {
        let first_load = self.first_load.get();
        self.emit(OutboundMessage::Start { first_load });
        self.emit_status(Status::Initializing);

        if first_load {
            self.graph.clear();
            *self.preset.borrow_mut() = None;
        }

        let preset = self.initialize_preset(&request.template);
        let hmr_enabled = request.hmr.unwrap_or(preset.hmr_enabled());

        self.emit_status(Status::InstallingDependencies);
        let changed = self.write_files(&request.files);
        debug!(?changed, first_load, "updated file system");

        let mut force_reload = false;
        if !first_load && !changed.is_empty() {
            // Modules that failed last time get a fresh attempt too:
            // their failure may have been an import that now exists.
            let mut invalidate = changed.clone();
            for path in self.graph.paths() {
                let errored = self
                    .graph
                    .get(&path)
                    .map(|m| m.borrow().error.is_some())
                    .unwrap_or(false);
                if errored && !invalidate.contains(&path) {
                    invalidate.push(path);
                }
            }

            if hmr_enabled {
                for path in &invalidate {
                    if let Some(module) = self.graph.get(path) {
                        module.borrow_mut().hot.invalidated = false;
                    }
                    let outcome = self.graph.reset_compilation(path, true);
                    if outcome == crate::graph::ResetOutcome::RequiresReload {
                        force_reload = true;
                    }
                }
            } else {
                for path in &invalidate {
                    self.graph.reset_compilation(path, false);
                }
                force_reload = true;
            }
        }
        if force_reload {
            self.full_reload();
        }

        let package_json_changed = first_load || changed.iter().any(|p| p == "/package.json");
        if package_json_changed {
            self.install_dependencies(first_load).await?;
        }

        // A fresh resolver and scheduler per request: the resolution
        // cache is only valid for one compile.
        let resolver = Rc::new(Resolver::new(Rc::clone(&self.fs)));
        let scheduler = Scheduler::new(
            Rc::clone(&self.fs),
            Rc::clone(&self.graph),
            Rc::clone(&resolver),
            Rc::clone(&preset),
        );

        let entry = match self.resolve_entry(&resolver).await {
            Ok(entry) => entry,
            // Empty or HTML-only project: this particular error drives
            // the empty state, not an error surface.
            Err(BundlerError::EntryPointUnresolved) => {
                info!("no JS entry point; skipping bundling");
                self.emit(OutboundMessage::State {
                    state: BundlerState::default(),
                });
                self.emit_status(Status::Done);
                self.emit(OutboundMessage::Done {
                    compilaton_error: false,
                });
                self.emit(OutboundMessage::Success);
                self.first_load.set(false);
                return Ok(CompileSummary {
                    entry: None,
                    html: self.html_document(&request, &preset),
                    evaluated: false,
                });
            }
            Err(other) => return Err(other),
        };

        self.emit_status(Status::Transpiling);

        let runtimes_pending = first_load
            || preset
                .runtime_modules()
                .iter()
                .any(|r| !self.graph.is_compiled(r.path));
        if runtimes_pending {
            for runtime in preset.runtime_modules() {
                if let Err(error) = scheduler.module_finished(runtime.path).await {
                    return self.fail_compile(error);
                }
            }
        }

        let _ = scheduler.transform_module(&entry);
        if let Err(error) = scheduler.module_finished(&entry).await {
            return self.fail_compile(error);
        }

        self.graph.mark_entry(&entry);
        self.emit(OutboundMessage::State {
            state: self.snapshot(),
        });

        self.emit_status(Status::Evaluating);
        self.run_evaluator(&scheduler, &entry).await?;

        self.emit_status(Status::Done);
        self.emit(OutboundMessage::Done {
            compilaton_error: false,
        });
        self.emit(OutboundMessage::Success);
        self.first_load.set(false);

        Ok(CompileSummary {
            entry: Some(entry),
            html: self.html_document(&request, &preset),
            evaluated: true,
        })
    }

    fn initialize_preset(&self, template: &str) -> Rc<Preset> {
        if let Some(preset) = self.preset.borrow().as_ref() {
            return Rc::clone(preset);
        }
        let preset = Rc::new(Preset::for_template(template));
        for runtime in preset.runtime_modules() {
            self.fs.write_sync(runtime.path, runtime.source.to_string());
        }
        *self.preset.borrow_mut() = Some(Rc::clone(&preset));
        preset
    }

    /// The initialized preset. Compile phases run after step 3, so a
    /// miss here is a sequencing bug in the caller.
    fn require_preset(&self) -> BundlerResult<Rc<Preset>> {
        self.preset
            .borrow()
            .as_ref()
            .map(Rc::clone)
            .ok_or(BundlerError::PresetMissing)
    }

    /// Diff the request's files against the FS, write changes, and drop
    /// files that disappeared from the project. Returns changed paths.
    fn write_files(&self, files: &BTreeMap<String, String>) -> Vec<String> {
        let mut changed = Vec::new();
        let mut current = BTreeSet::new();

        for (path, code) in files {
            let path = vpath::normalize(path);
            current.insert(path.clone());
            let existing = self.fs.memory().read(&path);
            if existing.as_deref() != Some(code) {
                self.fs.write_sync(&path, code.clone());
                changed.push(path);
            }
        }

        let previous = std::mem::replace(&mut *self.previous_files.borrow_mut(), current.clone());
        for removed in previous.difference(&current) {
            self.fs.remove(removed);
            self.graph.reset_compilation(removed, false);
            changed.push(removed.clone());
        }

        changed
    }

    /// Parse `package.json`, augment dependencies via the preset, fetch
    /// the manifest and preload packages. A changed dependency set on a
    /// later compile forces a full reload.
    async fn install_dependencies(&self, first_load: bool) -> BundlerResult<()> {
        let preset = self.require_preset()?;
        let mut dependencies = DependencySet::new();
        if let Ok(manifest) = self.fs.read_json_sync("/package.json") {
            if let Some(deps) = manifest.get("dependencies").and_then(|d| d.as_object()) {
                for (name, range) in deps {
                    if let Some(range) = range.as_str() {
                        dependencies.insert(name.clone(), range.to_string());
                    }
                }
            }
        }
        preset.augment_dependencies(&mut dependencies);

        let signature = manifest::signature(&dependencies);
        let signature_changed = self
            .dependency_signature
            .borrow()
            .as_ref()
            .map(|previous| previous != &signature)
            .unwrap_or(false);
        *self.dependency_signature.borrow_mut() = Some(signature);

        if dependencies.is_empty() {
            return Ok(());
        }

        info!(count = dependencies.len(), "installing dependencies");
        self.registry.fetch_manifest(&dependencies).await;
        self.registry.preload_modules().await?;
        self.registry.load_module_dependencies().await?;

        if signature_changed && !first_load {
            self.full_reload();
        }
        Ok(())
    }

    /// Resolve the entry: `package.json` `main` first, then the
    /// preset's candidates. No hit is `EntryPointUnresolved`, which the
    /// orchestrator turns into the empty state rather than an error.
    async fn resolve_entry(&self, resolver: &Rc<Resolver>) -> BundlerResult<String> {
        let preset = self.require_preset()?;

        if let Ok(manifest) = self.fs.read_json_sync("/package.json") {
            if let Some(main) = manifest.get("main").and_then(|m| m.as_str()) {
                let specifier = if main.starts_with("./") || main.starts_with('/') {
                    main.to_string()
                } else {
                    format!("./{main}")
                };
                if let Ok(path) = resolver.resolve(&specifier, "/package.json").await {
                    return Ok(path);
                }
            }
        }

        for candidate in preset.entry_candidates() {
            if self.fs.exists(candidate).await {
                return Ok((*candidate).to_string());
            }
        }
        Err(BundlerError::EntryPointUnresolved)
    }

    /// Evaluate the compiled program, honoring HMR outcomes. An
    /// `invalidate()` resets the affected modules and restarts the
    /// transform; an unaccepted update escalates to a fresh evaluator
    /// (the page-reload analog) plus a `refresh` message.
    async fn run_evaluator(&self, scheduler: &Rc<Scheduler>, entry: &str) -> BundlerResult<()> {
        let preset = self.require_preset()?;
        for _attempt in 0..3 {
            if self.evaluator.borrow().is_none() {
                let runtimes = preset
                    .runtime_modules()
                    .iter()
                    .map(|r| r.path.to_string())
                    .collect();
                let evaluator = Evaluator::new(
                    Rc::clone(&self.graph),
                    Rc::clone(&self.fs),
                    Rc::clone(&preset),
                    runtimes,
                )
                .map_err(|e| BundlerError::Evaluation(e.to_string()))?;
                *self.evaluator.borrow_mut() = Some(Rc::new(evaluator));
            }

            let outcome = {
                let evaluator = self.evaluator.borrow();
                evaluator.as_ref().expect("evaluator exists").evaluate(entry)
            };

            match outcome {
                Ok(EvalOutcome::Evaluated) => {
                    hmr::finish_update(&self.graph, &self.graph.dirty_modules());
                    self.flush_console();
                    return Ok(());
                }
                Ok(EvalOutcome::NeedsRestart) => {
                    debug!("hot handle invalidated modules; restarting compile");
                    for path in self.graph.invalidated_modules() {
                        if let Some(module) = self.graph.get(&path) {
                            module.borrow_mut().hot.invalidated = false;
                        }
                        self.graph.reset_compilation(&path, true);
                    }
                    if let Err(error) = scheduler.module_finished(entry).await {
                        return self.fail_compile(error).map(|_| ());
                    }
                }
                Ok(EvalOutcome::RequiresReload) => {
                    self.full_reload();
                }
                Err(error) => {
                    self.flush_console();
                    let title = match &error {
                        crate::linker::EvalError::NotCompiled { .. } => "Compilation Error",
                        _ => "Runtime Exception",
                    };
                    self.emit(OutboundMessage::show_error(title, entry, &error.to_string()));
                    self.emit_status(Status::Error);
                    self.emit(OutboundMessage::Done {
                        compilaton_error: true,
                    });
                    return Err(BundlerError::Evaluation(error.to_string()));
                }
            }
        }
        Ok(())
    }

    /// Drop the evaluator and tell the host to reload. The next
    /// evaluation starts from a fresh context, which is the embedded
    /// analog of a page reload.
    fn full_reload(&self) {
        debug!("escalating to full reload");
        self.emit(OutboundMessage::Refresh);
        *self.evaluator.borrow_mut() = None;
        hmr::finish_update(&self.graph, &self.graph.dirty_modules());
    }

    fn fail_compile(&self, error: CompileError) -> BundlerResult<CompileSummary> {
        let (title, path) = match &error {
            CompileError::Transform(e) => ("Compilation Error", transform_error_path(e)),
            CompileError::Resolve(crate::resolver::ResolveError::ModuleNotFound {
                origin, ..
            }) => ("Module Not Found", origin.clone()),
            CompileError::Read(crate::fs::FsError::NotFound { path }) => {
                ("Module Not Found", path.clone())
            }
            CompileError::Read(crate::fs::FsError::InvalidJson { path, .. }) => {
                ("Compilation Error", path.clone())
            }
        };
        self.emit(OutboundMessage::show_error(title, &path, &error.to_string()));
        self.emit_status(Status::Error);
        self.emit(OutboundMessage::Done {
            compilaton_error: true,
        });
        self.first_load.set(false);
        Err(error.into())
    }

    fn flush_console(&self) {
        let entries = self.take_console();
        if entries.is_empty() {
            return;
        }
        let records = entries
            .into_iter()
            .map(|entry: ConsoleEntry| ConsoleRecord {
                method: match entry.level {
                    LogLevel::Log => "log",
                    LogLevel::Info => "info",
                    LogLevel::Warn => "warn",
                    LogLevel::Error => "error",
                }
                .to_string(),
                data: vec![entry.message],
            })
            .collect();
        self.emit(OutboundMessage::Console {
            log: Some(records),
            result: None,
        });
    }

    /// Snapshot the transpiled module map for observers. Keys keep the
    /// historical `<path>:` shape.
    fn snapshot(&self) -> BundlerState {
        let mut transpiled_modules = BTreeMap::new();
        for path in self.graph.paths() {
            let Some(module) = self.graph.get(&path) else {
                continue;
            };
            let m = module.borrow();
            let Some(compiled) = &m.compiled else {
                continue;
            };
            transpiled_modules.insert(
                format!("{path}:"),
                TranspiledModule {
                    source: TranspiledModuleSource {
                        is_entry: m.is_entry,
                        file_name: vpath::basename(&path).to_string(),
                        compiled_code: compiled.clone(),
                    },
                },
            );
        }
        BundlerState { transpiled_modules }
    }

    fn html_document(&self, request: &CompileRequest, preset: &Rc<Preset>) -> String {
        request
            .files
            .get("/index.html")
            .cloned()
            .or_else(|| self.fs.memory().read("/index.html"))
            .unwrap_or_else(|| preset.default_html().to_string())
    }
}

fn transform_error_path(error: &crate::preset::TransformError) -> String {
    use crate::preset::TransformError::*;
    match error {
        Parse { path, .. }
        | Transform { path, .. }
        | UnsupportedFile { path }
        | UnknownTransformer { path, .. } => path.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundler() -> (Bundler, Rc<CollectingEmitter>) {
        let emitter = CollectingEmitter::new();
        let bundler = Bundler::new(BundlerConfig::default(), emitter.clone()).unwrap();
        (bundler, emitter)
    }

    fn statuses(messages: &[OutboundMessage]) -> Vec<Status> {
        messages
            .iter()
            .filter_map(|m| match m {
                OutboundMessage::Status { status } => Some(*status),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn vanilla_project_reaches_done() {
        let (bundler, emitter) = bundler();
        let request = CompileRequest::new("vanilla")
            .file("/index.html", "<script src=\"index.js\"></script>")
            .file("/index.js", "console.log(\"hi\");");

        let summary = bundler.compile(request).await.unwrap();
        assert_eq!(summary.entry.as_deref(), Some("/index.js"));
        assert!(summary.evaluated);
        assert!(summary.html.contains("index.js"));

        let messages = emitter.take();
        assert_eq!(
            statuses(&messages),
            vec![
                Status::Initializing,
                Status::InstallingDependencies,
                Status::Transpiling,
                Status::Evaluating,
                Status::Done,
            ]
        );
        assert!(messages.iter().any(|m| matches!(
            m,
            OutboundMessage::Done {
                compilaton_error: false
            }
        )));
        // S1's rendered output becomes a console observation here: the
        // program ran.
        assert!(messages.iter().any(|m| matches!(
            m,
            OutboundMessage::Console { log: Some(records), .. }
                if records.iter().any(|r| r.data.contains(&"hi".to_string()))
        )));
    }

    #[tokio::test]
    async fn relative_import_logs_the_value() {
        let (bundler, _emitter) = bundler();
        let request = CompileRequest::new("vanilla")
            .file("/index.js", "import x from \"./m\";\nconsole.log(x);")
            .file("/m.js", "export default 42;");

        bundler.compile(request).await.unwrap();
        // Console was already flushed to the emitter; the evaluator has
        // nothing pending.
        assert!(bundler.take_console().is_empty());
    }

    #[tokio::test]
    async fn extension_probing_resolves_tsx() {
        let (bundler, _) = bundler();
        let request = CompileRequest::new("vanilla")
            .file("/index.ts", "import v from \"./util\";\nexport default v;")
            .file("/util.tsx", "export default \"ok\";");

        let summary = bundler.compile(request).await.unwrap();
        assert_eq!(summary.entry.as_deref(), Some("/index.ts"));
        assert!(bundler.graph.is_compiled("/util.tsx"));
    }

    #[tokio::test]
    async fn empty_project_presents_empty_state() {
        let (bundler, emitter) = bundler();
        let summary = bundler.compile(CompileRequest::new("vanilla")).await.unwrap();

        assert_eq!(summary.entry, None);
        assert!(!summary.evaluated);
        let messages = emitter.take();
        assert!(messages.iter().any(|m| matches!(
            m,
            OutboundMessage::Done {
                compilaton_error: false
            }
        )));
        assert!(!messages
            .iter()
            .any(|m| matches!(m, OutboundMessage::Action { .. })));
    }

    #[tokio::test]
    async fn missing_dependency_shows_an_error_action() {
        let (bundler, emitter) = bundler();
        let request =
            CompileRequest::new("vanilla").file("/index.js", "import \"./does-not-exist\";");

        let result = bundler.compile(request).await;
        assert!(result.is_err());

        let messages = emitter.take();
        let action = messages
            .iter()
            .find_map(|m| match m {
                OutboundMessage::Action { path, message, .. } => Some((path.clone(), message.clone())),
                _ => None,
            })
            .expect("an error action was emitted");
        assert_eq!(action.0, "/index.js");
        assert!(action.1.contains("does-not-exist"));
        assert!(messages.iter().any(|m| matches!(
            m,
            OutboundMessage::Done {
                compilaton_error: true
            }
        )));
        // No evaluation happened.
        assert!(!messages
            .iter()
            .any(|m| matches!(m, OutboundMessage::Status { status: Status::Evaluating })));
    }

    #[tokio::test]
    async fn edit_without_hmr_forces_a_full_reload() {
        let (bundler, emitter) = bundler();
        let request = CompileRequest::new("vanilla").file("/index.js", "console.log(1);");
        bundler.compile(request.clone()).await.unwrap();
        emitter.take();

        let edited = CompileRequest::new("vanilla").file("/index.js", "console.log(2);");
        bundler.compile(edited).await.unwrap();

        let messages = emitter.take();
        assert!(messages
            .iter()
            .any(|m| matches!(m, OutboundMessage::Refresh)));
    }

    #[tokio::test]
    async fn hot_edit_patches_without_reload() {
        let (bundler, emitter) = bundler();
        let first = CompileRequest::new("vanilla")
            .hmr(true)
            .file(
                "/index.js",
                "import leaf from \"./leaf\";\n__hot__.accept();\nconsole.log(leaf);",
            )
            .file(
                "/leaf.js",
                "__hot__.dispose(function () { console.log(\"disposed\"); });\nexport default \"one\";",
            );
        bundler.compile(first).await.unwrap();
        emitter.take();

        let second = CompileRequest::new("vanilla")
            .hmr(true)
            .file(
                "/index.js",
                "import leaf from \"./leaf\";\n__hot__.accept();\nconsole.log(leaf);",
            )
            .file(
                "/leaf.js",
                "__hot__.dispose(function () { console.log(\"disposed\"); });\nexport default \"two\";",
            );
        bundler.compile(second).await.unwrap();

        let messages = emitter.take();
        assert!(
            !messages.iter().any(|m| matches!(m, OutboundMessage::Refresh)),
            "hot update must not reload"
        );
        let console: Vec<String> = messages
            .iter()
            .filter_map(|m| match m {
                OutboundMessage::Console { log: Some(records), .. } => Some(records.clone()),
                _ => None,
            })
            .flatten()
            .flat_map(|r| r.data)
            .collect();
        let disposals = console.iter().filter(|line| *line == "disposed").count();
        assert_eq!(disposals, 1, "dispose fired exactly once: {console:?}");
    }

    #[tokio::test]
    async fn html_only_project_skips_bundling() {
        let (bundler, emitter) = bundler();
        let request =
            CompileRequest::new("vanilla").file("/index.html", "<h1>static page</h1>");
        let summary = bundler.compile(request).await.unwrap();

        assert_eq!(summary.entry, None);
        assert_eq!(summary.html, "<h1>static page</h1>");
        assert!(emitter.take().iter().any(|m| matches!(
            m,
            OutboundMessage::Done {
                compilaton_error: false
            }
        )));
    }

    #[tokio::test]
    async fn package_json_main_wins_over_candidates() {
        let (bundler, _) = bundler();
        let request = CompileRequest::new("vanilla")
            .file("/package.json", r#"{"main": "src/app.js"}"#)
            .file("/src/app.js", "console.log(\"app\");")
            .file("/index.js", "console.log(\"wrong\");");

        let summary = bundler.compile(request).await.unwrap();
        assert_eq!(summary.entry.as_deref(), Some("/src/app.js"));
    }

    #[tokio::test]
    async fn runtime_module_seeds_process_global() {
        let (bundler, emitter) = bundler();
        let request = CompileRequest::new("vanilla")
            .file("/index.js", "console.log(globals.process.env.NODE_ENV);");

        bundler.compile(request).await.unwrap();
        // The runtime module ran before the entry and installed the
        // process shim on the global object.
        let console: Vec<String> = emitter
            .take()
            .into_iter()
            .filter_map(|m| match m {
                OutboundMessage::Console { log: Some(records), .. } => Some(records),
                _ => None,
            })
            .flatten()
            .flat_map(|r| r.data)
            .collect();
        assert!(console.contains(&"development".to_string()), "{console:?}");
    }

    #[tokio::test]
    async fn removed_files_disappear_from_the_fs() {
        let (bundler, _) = bundler();
        let first = CompileRequest::new("vanilla")
            .file("/index.js", "console.log(1);")
            .file("/extra.js", "export default 1;");
        bundler.compile(first).await.unwrap();
        assert!(bundler.fs.exists_sync("/extra.js"));

        let second = CompileRequest::new("vanilla").file("/index.js", "console.log(1);");
        bundler.compile(second).await.unwrap();
        assert!(!bundler.fs.exists_sync("/extra.js"));
    }

    #[tokio::test]
    async fn snapshot_keys_keep_the_trailing_colon() {
        let (bundler, emitter) = bundler();
        let request = CompileRequest::new("vanilla").file("/index.js", "console.log(1);");
        bundler.compile(request).await.unwrap();

        let state = emitter
            .take()
            .into_iter()
            .find_map(|m| match m {
                OutboundMessage::State { state } => Some(state),
                _ => None,
            })
            .expect("state snapshot emitted");
        let entry = state.transpiled_modules.get("/index.js:").unwrap();
        assert!(entry.source.is_entry);
        assert_eq!(entry.source.file_name, "index.js");
    }
}
