//! Package registry: dependency manifest resolution and CDN package
//! fetching with multi-source fallback.
//!
//! The primary CDN speaks the packager protocol (POST a dependency set,
//! receive a flattened manifest; GET per-package file maps). When it is
//! unreachable, public CDNs serve each package's main file as a single
//! pre-transpiled blob.

mod error;
pub mod manifest;
mod fetcher;
mod store;

pub use error::{RegistryError, RegistryResult};
pub use fetcher::PackageRegistry;
pub use manifest::{DependencySet, ManifestEntry};
pub use store::{PackageStore, PackagedFile};

/// Default packager CDN, overridable through the bundler configuration.
pub const DEFAULT_PACKAGER_URL: &str = "https://packager.terrarium.dev/";

/// Public CDNs tried in order when the packager fails. Each serves the
/// package's main file as one pre-transpiled blob.
pub const FALLBACK_CDNS: &[&str] = &[
    "https://cdn.jsdelivr.net/npm/{name}@{version}",
    "https://unpkg.com/{name}@{version}",
];

/// Concurrency for parallel fetches and transforms.
pub const DEFAULT_CONCURRENCY: usize = 50;

/// Bounded retries for a single CDN request.
pub const DEFAULT_FETCH_RETRIES: u32 = 2;
