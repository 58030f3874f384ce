//! Dispatch table mapping backend names to loaded `Backend` implementations.
//!
//! A small registry that resolves a name to an implementation, with dynamic
//! loading of out-of-process plug-ins folded in for backends that ship as
//! shared libraries (the `backends_path` configuration option).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use super::Backend;
use crate::error::{DagError, DagResult};

pub struct BackendRegistry {
    backends: Mutex<HashMap<String, Arc<dyn Backend>>>,
    /// Kept open for the registry's lifetime; a `Backend` trait object
    /// whose vtable lives in one of these libraries stays valid exactly as
    /// long as the library does.
    _libraries: Mutex<Vec<libloading::Library>>,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        BackendRegistry {
            backends: Mutex::new(HashMap::new()),
            _libraries: Mutex::new(Vec::new()),
        }
    }
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, backend: Arc<dyn Backend>) {
        self.backends.lock().insert(backend.name().to_string(), backend);
    }

    pub fn get(&self, name: &str) -> DagResult<Arc<dyn Backend>> {
        self.backends
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| DagError::BackendNotLoaded(name.to_string()))
    }

    pub fn available(&self) -> Vec<String> {
        self.backends.lock().keys().cloned().collect()
    }

    /// Best-effort load of every `.so`/`.dylib`/`.dll` in `dir` that exports
    /// a `dagrunner_backend_entry` symbol returning a boxed `Backend`. A
    /// directory with no loadable plug-ins, or that doesn't exist, is not
    /// an error: the registry simply stays as it was, and a model bound to
    /// one of the missing backends later fails with `BackendNotLoaded`.
    pub fn load_from_path(&self, dir: &Path) -> DagResult<usize> {
        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(_) => return Ok(0),
        };
        let mut loaded = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let is_library = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("so") | Some("dylib") | Some("dll")
            );
            if !is_library {
                continue;
            }
            unsafe {
                let lib = match libloading::Library::new(&path) {
                    Ok(l) => l,
                    Err(_) => continue,
                };
                type EntryFn = unsafe extern "C" fn() -> *mut dyn Backend;
                let entry_fn: libloading::Symbol<EntryFn> =
                    match lib.get(b"dagrunner_backend_entry") {
                        Ok(f) => f,
                        Err(_) => continue,
                    };
                let raw = entry_fn();
                if raw.is_null() {
                    continue;
                }
                let backend = Arc::from_raw(raw);
                self.register(backend);
                loaded += 1;
                self._libraries.lock().push(lib);
            }
        }
        Ok(loaded)
    }
}
