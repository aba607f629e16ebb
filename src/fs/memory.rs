//! In-memory layer: the source of truth for user files and shims.

use rustc_hash::FxHashMap;
use std::cell::RefCell;

/// Hash map layer holding file contents. Writes from the bundler always
/// land here; the other layers are read-only.
#[derive(Debug, Default)]
pub struct MemoryLayer {
    files: RefCell<FxHashMap<String, String>>,
}

impl MemoryLayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self, path: &str) -> Option<String> {
        self.files.borrow().get(path).cloned()
    }

    pub fn exists(&self, path: &str) -> bool {
        self.files.borrow().contains_key(path)
    }

    pub fn write(&self, path: String, content: String) {
        self.files.borrow_mut().insert(path, content);
    }

    pub fn remove(&self, path: &str) -> Option<String> {
        self.files.borrow_mut().remove(path)
    }

    /// Snapshot of all stored paths, unordered.
    pub fn paths(&self) -> Vec<String> {
        self.files.borrow().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.files.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.borrow().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_remove() {
        let layer = MemoryLayer::new();
        layer.write("/index.js".into(), "export default 1;".into());
        assert!(layer.exists("/index.js"));
        assert_eq!(layer.read("/index.js").as_deref(), Some("export default 1;"));
        assert_eq!(layer.remove("/index.js").as_deref(), Some("export default 1;"));
        assert!(!layer.exists("/index.js"));
    }
}
