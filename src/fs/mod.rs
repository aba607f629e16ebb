//! Layered virtual file system for the bundler.
//!
//! Reads walk an ordered stack of layers; the first layer that knows the
//! path answers. Writes always land in the in-memory layer. Paths are
//! absolute, `/`-separated and normalized before lookup.

pub mod bridge;
pub mod memory;
pub mod package;
pub mod path;

use std::rc::Rc;
use thiserror::Error;

pub use bridge::{BridgeLayer, FileResolver, FsRequest, ProtocolFileResolver};
pub use memory::MemoryLayer;
pub use package::PackageLayer;

/// Errors produced by file system lookups.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FsError {
    #[error("Module not found: {path}")]
    NotFound { path: String },

    #[error("Cannot parse {path}: {message}")]
    InvalidJson { path: String, message: String },
}

/// Result type for file system operations.
pub type FsResult<T> = Result<T, FsError>;

/// One layer of the stack. A closed enum keeps the async read paths
/// plainly typed instead of hiding them behind trait objects.
pub enum Layer {
    Memory(MemoryLayer),
    Bridge(BridgeLayer),
    Package(PackageLayer),
}

impl Layer {
    fn read_sync(&self, path: &str) -> Option<String> {
        match self {
            Layer::Memory(layer) => layer.read(path),
            // The bridge can only answer over the async channel.
            Layer::Bridge(_) => None,
            Layer::Package(layer) => layer.read(path),
        }
    }

    async fn read(&self, path: &str) -> Option<String> {
        match self {
            Layer::Memory(layer) => layer.read(path),
            Layer::Bridge(layer) => layer.read(path).await,
            Layer::Package(layer) => layer.read(path),
        }
    }

    fn exists_sync(&self, path: &str) -> bool {
        match self {
            Layer::Memory(layer) => layer.exists(path),
            Layer::Bridge(_) => false,
            Layer::Package(layer) => layer.exists(path),
        }
    }

    async fn exists(&self, path: &str) -> bool {
        match self {
            Layer::Memory(layer) => layer.exists(path),
            Layer::Bridge(layer) => layer.exists(path).await,
            Layer::Package(layer) => layer.exists(path),
        }
    }

    fn reset_cache(&self) {
        if let Layer::Bridge(layer) = self {
            layer.reset_cache();
        }
    }
}

/// The ordered layer stack. Constructed once per bundler instance and
/// shared behind an `Rc`.
pub struct FileSystem {
    layers: Vec<Layer>,
}

impl FileSystem {
    /// A stack with a single memory layer.
    pub fn new() -> Self {
        Self {
            layers: vec![Layer::Memory(MemoryLayer::new())],
        }
    }

    pub fn push_layer(&mut self, layer: Layer) {
        self.layers.push(layer);
    }

    pub fn into_shared(self) -> Rc<Self> {
        Rc::new(self)
    }

    /// The topmost memory layer, target of all writes.
    pub fn memory(&self) -> &MemoryLayer {
        self.layers
            .iter()
            .find_map(|layer| match layer {
                Layer::Memory(memory) => Some(memory),
                _ => None,
            })
            .expect("file system always has a memory layer")
    }

    pub fn read_sync(&self, path: &str) -> FsResult<String> {
        let path = path::normalize(path);
        for layer in &self.layers {
            if let Some(content) = layer.read_sync(&path) {
                return Ok(content);
            }
        }
        Err(FsError::NotFound { path })
    }

    pub async fn read(&self, path: &str) -> FsResult<String> {
        let path = path::normalize(path);
        for layer in &self.layers {
            if let Some(content) = layer.read(&path).await {
                return Ok(content);
            }
        }
        Err(FsError::NotFound { path })
    }

    pub fn exists_sync(&self, path: &str) -> bool {
        let path = path::normalize(path);
        self.layers.iter().any(|layer| layer.exists_sync(&path))
    }

    pub async fn exists(&self, path: &str) -> bool {
        let path = path::normalize(path);
        for layer in &self.layers {
            if layer.exists(&path).await {
                return true;
            }
        }
        false
    }

    pub fn write_sync(&self, path: &str, content: String) {
        self.memory().write(path::normalize(path), content);
    }

    pub fn remove(&self, path: &str) -> Option<String> {
        self.memory().remove(&path::normalize(path))
    }

    /// Read and parse a JSON file in one step.
    pub fn read_json_sync(&self, path: &str) -> FsResult<serde_json::Value> {
        let content = self.read_sync(path)?;
        serde_json::from_str(&content).map_err(|e| FsError::InvalidJson {
            path: path::normalize(path),
            message: e.to_string(),
        })
    }

    /// Drop per-compile caches held by layers (currently the bridge's
    /// answer cache).
    pub fn reset_cache(&self) {
        for layer in &self.layers {
            layer.reset_cache();
        }
    }
}

impl Default for FileSystem {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{PackageStore, PackagedFile};
    use rustc_hash::FxHashMap;

    #[test]
    fn first_layer_hit_wins() {
        let store = Rc::new(PackageStore::new());
        let mut files = FxHashMap::default();
        files.insert(
            "index.js".to_string(),
            PackagedFile::transpiled("from package".into()),
        );
        store.mount("pkg", "1.0.0", files);

        let mut fs = FileSystem::new();
        fs.push_layer(Layer::Package(PackageLayer::new(store)));

        fs.write_sync("/node_modules/pkg/index.js", "from memory".into());
        assert_eq!(
            fs.read_sync("/node_modules/pkg/index.js").as_deref(),
            Ok("from memory")
        );

        fs.remove("/node_modules/pkg/index.js");
        assert_eq!(
            fs.read_sync("/node_modules/pkg/index.js").as_deref(),
            Ok("from package")
        );
    }

    #[test]
    fn misses_surface_as_not_found() {
        let fs = FileSystem::new();
        assert_eq!(
            fs.read_sync("/nope.js"),
            Err(FsError::NotFound {
                path: "/nope.js".to_string()
            })
        );
        assert!(!fs.exists_sync("/nope.js"));
    }

    #[test]
    fn paths_are_normalized_before_lookup() {
        let fs = FileSystem::new();
        fs.write_sync("/src/./a/../index.js", "ok".into());
        assert_eq!(fs.read_sync("/src/index.js").as_deref(), Ok("ok"));
        assert!(fs.exists_sync("/src/index.js"));
    }

    #[tokio::test]
    async fn async_reads_match_sync_reads() {
        let fs = FileSystem::new();
        fs.write_sync("/index.js", "content".into());
        assert_eq!(fs.read("/index.js").await.as_deref(), Ok("content"));
        assert!(fs.exists("/index.js").await);
        assert!(fs.read("/missing.js").await.is_err());
    }

    #[test]
    fn read_json_reports_parse_failures() {
        let fs = FileSystem::new();
        fs.write_sync("/package.json", "{ not json".into());
        assert!(matches!(
            fs.read_json_sync("/package.json"),
            Err(FsError::InvalidJson { .. })
        ));
    }
}
