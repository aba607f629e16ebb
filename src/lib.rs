//! Terrarium - an in-page bundler core
//!
//! Terrarium ingests a small user project, compiles each file to
//! executable form, links the module graph with correct dependency
//! ordering, and evaluates the program inside an embedded Boa context:
//! - Layered virtual file system (memory, async bridge, CDN packages)
//! - Node-style module resolution over the virtual FS
//! - oxc-powered TypeScript/JSX transformation
//! - CDN package registry with multi-source fallback
//! - CommonJS linker with hot module replacement

pub mod bundler;
pub mod fs;
pub mod graph;
pub mod hmr;
pub mod linker;
pub mod preset;
pub mod registry;
pub mod resolver;
pub mod scheduler;
pub mod shims;

// Re-export commonly used types
pub use bundler::{
    Bundler, BundlerConfig, BundlerError, BundlerResult, CollectingEmitter, CompileRequest,
    CompileSummary, Emitter, InboundMessage, OutboundMessage, Status,
};
pub use fs::{FileSystem, FsError, FsResult};
pub use graph::{CompileError, Module, ModuleGraph};
pub use linker::{ConsoleEntry, EvalError, EvalOutcome, Evaluator, LogLevel};
pub use preset::{Preset, Transform, TransformError, TransformOutput, TransformerConfig};
pub use registry::{PackageRegistry, RegistryError, RegistryResult};
pub use resolver::{ResolveError, ResolveResult, Resolver};
pub use scheduler::Scheduler;
