//! Mounted package files, exposed to the file system through the
//! package layer.

use rustc_hash::{FxHashMap, FxHashSet};
use serde::Deserialize;
use std::cell::RefCell;

/// A single file delivered by the packager CDN.
#[derive(Debug, Clone, Deserialize)]
pub struct PackagedFile {
    #[serde(default)]
    pub content: String,
    /// Specifiers this file requires, as reported by the packager.
    #[serde(default)]
    pub requires: Vec<String>,
    /// Whether the CDN already lowered the file to plain CommonJS.
    #[serde(default)]
    pub transpiled: bool,
}

impl PackagedFile {
    pub fn transpiled(content: String) -> Self {
        Self {
            content,
            requires: Vec::new(),
            transpiled: true,
        }
    }
}

/// All files fetched from CDNs, keyed by absolute `/node_modules/...`
/// path. Mounting the same package twice is a noop, so the first mount
/// (lowest manifest depth) wins in the hoisted layout.
#[derive(Debug, Default)]
pub struct PackageStore {
    files: RefCell<FxHashMap<String, PackagedFile>>,
    mounted: RefCell<FxHashSet<String>>,
}

impl PackageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.borrow().contains_key(path)
    }

    pub fn read(&self, path: &str) -> Option<String> {
        self.files.borrow().get(path).map(|f| f.content.clone())
    }

    pub fn file(&self, path: &str) -> Option<PackagedFile> {
        self.files.borrow().get(path).cloned()
    }

    /// Whether `name@version` has already been mounted.
    pub fn is_mounted(&self, name: &str, version: &str) -> bool {
        self.mounted.borrow().contains(&format!("{name}@{version}"))
    }

    /// Mount a package's files under `/node_modules/<name>/`. Paths in
    /// `files` are package-relative. Existing files are never replaced.
    pub fn mount(&self, name: &str, version: &str, files: FxHashMap<String, PackagedFile>) {
        let key = format!("{name}@{version}");
        if !self.mounted.borrow_mut().insert(key) {
            return;
        }

        let mut store = self.files.borrow_mut();
        for (rel, file) in files {
            let rel = rel.trim_start_matches('/');
            let path = format!("/node_modules/{name}/{rel}");
            store.entry(path).or_insert(file);
        }
    }

    /// Paths of every mounted file, unordered.
    pub fn paths(&self) -> Vec<String> {
        self.files.borrow().keys().cloned().collect()
    }

    pub fn clear(&self) {
        self.files.borrow_mut().clear();
        self.mounted.borrow_mut().clear();
    }
}
