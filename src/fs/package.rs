//! Read-through layer over the package registry store.

use std::rc::Rc;

use crate::registry::PackageStore;

/// Answers existence and contents of `/node_modules/...` paths from the
/// files the registry has mounted.
#[derive(Debug)]
pub struct PackageLayer {
    store: Rc<PackageStore>,
}

impl PackageLayer {
    pub fn new(store: Rc<PackageStore>) -> Self {
        Self { store }
    }

    pub fn read(&self, path: &str) -> Option<String> {
        if !path.starts_with("/node_modules/") {
            return None;
        }
        self.store.read(path)
    }

    pub fn exists(&self, path: &str) -> bool {
        path.starts_with("/node_modules/") && self.store.contains(path)
    }
}
