//! The transformation scheduler: a named queue of shared futures that
//! guarantees at most one in-flight compile per path.
//!
//! `transform_module` coalesces concurrent requests for a path onto one
//! job; the job compiles the module, registers its dependencies and
//! schedules them without awaiting. `module_finished` then walks the
//! transitive closure awaiting every in-flight job, cycle-safe, and
//! surfaces the first compilation error it finds.

use futures::future::{FutureExt, LocalBoxFuture, Shared};
use rustc_hash::{FxHashMap, FxHashSet};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, trace};

use crate::fs::{FileSystem, FsError};
use crate::graph::{CompileError, ModuleGraph};
use crate::preset::Preset;
use crate::registry::DEFAULT_CONCURRENCY;
use crate::resolver::Resolver;

/// A coalesced transformation job. Cloning shares the same execution.
pub type TransformJob = Shared<LocalBoxFuture<'static, ()>>;

/// Drives module transformation over the shared graph.
pub struct Scheduler {
    fs: Rc<FileSystem>,
    graph: Rc<ModuleGraph>,
    resolver: Rc<Resolver>,
    preset: Rc<Preset>,
    queue: RefCell<FxHashMap<String, TransformJob>>,
    permits: Arc<Semaphore>,
    weak_self: std::rc::Weak<Scheduler>,
}

impl Scheduler {
    pub fn new(
        fs: Rc<FileSystem>,
        graph: Rc<ModuleGraph>,
        resolver: Rc<Resolver>,
        preset: Rc<Preset>,
    ) -> Rc<Self> {
        Rc::new_cyclic(|weak| Self {
            fs,
            graph,
            resolver,
            preset,
            queue: RefCell::new(FxHashMap::default()),
            permits: Arc::new(Semaphore::new(DEFAULT_CONCURRENCY)),
            weak_self: weak.clone(),
        })
    }

    fn shared(&self) -> Rc<Self> {
        self.weak_self.upgrade().expect("scheduler is alive")
    }

    /// The in-flight job for a path, if any.
    pub fn in_flight(&self, path: &str) -> Option<TransformJob> {
        self.queue.borrow().get(path).cloned()
    }

    /// Schedule the transformation of a module. Returns the existing
    /// job when the path is already in flight; a settled job when the
    /// module is already compiled (or failed and awaits invalidation).
    pub fn transform_module(&self, path: &str) -> TransformJob {
        if let Some(module) = self.graph.get(path) {
            let settled = {
                let m = module.borrow();
                m.is_compiled() || m.error.is_some()
            };
            if settled {
                return futures::future::ready(()).boxed_local().shared();
            }
        }

        if let Some(job) = self.in_flight(path) {
            return job;
        }

        trace!(path, "scheduling transformation");
        let scheduler = self.shared();
        let job_path = path.to_string();
        let job: TransformJob = async move {
            scheduler.run_job(&job_path).await;
            scheduler.queue.borrow_mut().remove(&job_path);
        }
        .boxed_local()
        .shared();

        self.queue.borrow_mut().insert(path.to_string(), job.clone());
        job
    }

    /// One transformation: read the latest source, run the preset's
    /// transform chain, resolve and schedule discovered dependencies.
    /// Errors are captured on the module, never thrown through the
    /// queue, so sibling modules keep compiling.
    async fn run_job(&self, path: &str) {
        let _permit = Arc::clone(&self.permits).acquire_owned().await.ok();

        let source = match self.fs.read(path).await {
            Ok(source) => source,
            Err(error) => {
                let module = self.graph.upsert(path, String::new());
                module.borrow_mut().error = Some(CompileError::Read(error));
                return;
            }
        };

        let module = self.graph.upsert(path, source.clone());
        if module.borrow().is_compiled() {
            return;
        }

        match self.preset.transform(path, source) {
            Err(error) => {
                debug!(path, %error, "transformation failed");
                module.borrow_mut().error = Some(CompileError::Transform(error));
            }
            Ok(output) => {
                module.borrow_mut().compiled = Some(output.code);
                for specifier in output.dependencies {
                    match self.resolver.resolve(&specifier, path).await {
                        Ok(resolved) => {
                            self.graph.add_dependency(path, &specifier, &resolved);
                            if !self.graph.is_compiled(&resolved) {
                                // Scheduled, not awaited; the closure
                                // wait drives it.
                                let _ = self.transform_module(&resolved);
                            }
                        }
                        Err(error) => {
                            debug!(path, %error, "dependency resolution failed");
                            let mut m = module.borrow_mut();
                            if m.error.is_none() {
                                // A module with an unresolved edge is
                                // not compiled, even though its own
                                // transform succeeded.
                                m.compiled = None;
                                m.error = Some(CompileError::Resolve(error));
                            }
                        }
                    }
                }
            }
        }
    }

    /// Await the transitive compile closure of `path` and surface the
    /// first compilation error found on any module in it.
    pub async fn module_finished(&self, path: &str) -> Result<(), CompileError> {
        let visited = Rc::new(RefCell::new(FxHashSet::default()));
        self.wait_for(path.to_string(), visited).await
    }

    fn wait_for(
        &self,
        path: String,
        visited: Rc<RefCell<FxHashSet<String>>>,
    ) -> LocalBoxFuture<'static, Result<(), CompileError>> {
        let scheduler = self.shared();
        async move {
            if !visited.borrow_mut().insert(path.clone()) {
                return Ok(());
            }

            // Adopt the in-flight job, or schedule one ourselves: a
            // module invalidated since the last compile has no job yet.
            let job = scheduler
                .in_flight(&path)
                .unwrap_or_else(|| scheduler.transform_module(&path));
            job.await;

            let module = scheduler.graph.get(&path).ok_or_else(|| {
                CompileError::Read(FsError::NotFound { path: path.clone() })
            })?;
            if let Some(error) = module.borrow().error.clone() {
                return Err(error);
            }

            let dependencies = module.borrow().dependencies.clone();
            let waits: Vec<_> = dependencies
                .into_iter()
                .map(|dependency| scheduler.wait_for(dependency, Rc::clone(&visited)))
                .collect();
            for result in futures::future::join_all(waits).await {
                result?;
            }
            Ok(())
        }
        .boxed_local()
    }

    /// Drop all in-flight bookkeeping. Jobs already running finish
    /// against the shared graph; their results are simply superseded.
    pub fn reset(&self) {
        self.queue.borrow_mut().clear();
    }
}
