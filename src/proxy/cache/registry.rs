use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::handle::ObjectHandle;

/// Concurrency-safe map from canonical path to live object handle.
///
/// The get-or-insert primitive is atomic under the map lock: once a caller
/// installs a handle for a path, every later caller receives that same
/// handle until its downloader removes it. That ordering is what coalesces
/// concurrent downloads of the same object.
pub(crate) struct HandleRegistry {
    handles: Mutex<HashMap<String, Arc<ObjectHandle>>>,
}

impl HandleRegistry {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            handles: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn get(&self, clean_path: &str) -> Option<Arc<ObjectHandle>> {
        self.handles.lock().get(clean_path).cloned()
    }

    pub(crate) fn get_or_insert(&self, clean_path: &str) -> Arc<ObjectHandle> {
        let mut handles = self.handles.lock();
        handles
            .entry(clean_path.to_owned())
            .or_insert_with(|| Arc::new(ObjectHandle::new(clean_path.to_owned())))
            .clone()
    }

    pub(crate) fn remove(&self, clean_path: &str) {
        self.handles.lock().remove(clean_path);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.handles.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_insert_returns_the_installed_handle() {
        let registry = HandleRegistry::new();
        let first = registry.get_or_insert("/pool/a.pkg");
        let second = registry.get_or_insert("/pool/a.pkg");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn distinct_paths_get_distinct_handles() {
        let registry = HandleRegistry::new();
        let a = registry.get_or_insert("/pool/a.pkg");
        let b = registry.get_or_insert("/pool/b.pkg");
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn remove_clears_the_entry() {
        let registry = HandleRegistry::new();
        let first = registry.get_or_insert("/pool/a.pkg");
        registry.remove("/pool/a.pkg");
        assert!(registry.get("/pool/a.pkg").is_none());
        let fresh = registry.get_or_insert("/pool/a.pkg");
        assert!(!Arc::ptr_eq(&first, &fresh));
    }
}
