//! Per-model/script runtime statistics registry.
//!
//! Keyed by the run key exactly as it appears in the command, independent
//! of which device or backend actually executed it, matching the
//! observable behavior clients rely on (aggregate call counts survive
//! backend reloads).

use std::collections::HashMap;

use parking_lot::Mutex;

#[derive(Debug, Clone, Default)]
pub struct ModelStats {
    pub calls: u64,
    pub errors: u64,
    pub total_duration_us: u64,
    pub last_batch_size: usize,
}

#[derive(Default)]
pub struct StatsRegistry {
    inner: Mutex<HashMap<String, ModelStats>>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_run(&self, key: &str, duration_us: u64, batch_size: usize, ok: bool) {
        let mut guard = self.inner.lock();
        let entry = guard.entry(key.to_string()).or_default();
        entry.calls += 1;
        if !ok {
            entry.errors += 1;
        }
        entry.total_duration_us += duration_us;
        entry.last_batch_size = batch_size;
    }

    pub fn get(&self, key: &str) -> Option<ModelStats> {
        self.inner.lock().get(key).cloned()
    }
}
