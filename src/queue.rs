//! Per-device queue (C5): one FIFO of runnable DAGs plus a fixed pool of
//! worker threads bound to a device string.
//!
//! Grounded on `original_source/src/background_workers.c`'s
//! `RunQueueInfo`/`ensureRunQueue`: one `queue_condition_var` +
//! `run_queue_mutex` pair per device, workers created once and named after
//! their device, a process-wide registry (`run_queues`) that lazily creates
//! a queue the first time a device is referenced. The Rust port swaps the
//! hand-rolled `AI_dict`/`pthread` pair for `parking_lot::{Mutex, Condvar}`
//! behind a `once_cell::sync::Lazy`, matching the teacher's lazy-registry
//! idiom in `backend::registry` / `extensions::registry`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::thread::JoinHandle;

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};

use crate::run_info::RunInfo;

/// One device's FIFO of runnable DAGs, shared by every worker bound to it.
pub struct DeviceQueue {
    pub device: String,
    items: Mutex<VecDeque<Arc<RunInfo>>>,
    condvar: Condvar,
    shutdown: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl DeviceQueue {
    fn new(device: String) -> Arc<Self> {
        Arc::new(DeviceQueue {
            device,
            items: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            shutdown: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
        })
    }

    pub fn push_back(&self, run: Arc<RunInfo>) {
        self.items.lock().push_back(run);
        self.condvar.notify_one();
    }

    pub fn push_front(&self, run: Arc<RunInfo>) {
        self.items.lock().push_front(run);
        self.condvar.notify_one();
    }

    /// Wait until the queue is non-empty (or shutdown), then return a
    /// locked guard so the caller can form a batch under one critical
    /// section, matching the locking order in spec §5: "always acquire the
    /// queue mutex before the DAG lock... never hold the queue mutex across
    /// a backend call."
    pub fn lock_nonempty(&self) -> parking_lot::MutexGuard<'_, VecDeque<Arc<RunInfo>>> {
        let mut guard = self.items.lock();
        while guard.is_empty() && !self.shutdown.load(Ordering::SeqCst) {
            self.condvar.wait(&mut guard);
        }
        guard
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Pop the current front item, if any, without waiting.
    pub fn pop_front(&self) -> Option<Arc<RunInfo>> {
        self.items.lock().pop_front()
    }

    /// Lock the raw item deque for in-place batch formation or rotation.
    /// Callers must not hold this across a backend call (spec §5 locking
    /// order).
    pub fn items_lock(&self) -> parking_lot::MutexGuard<'_, VecDeque<Arc<RunInfo>>> {
        self.items.lock()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.condvar.notify_all();
    }
}

/// Process-wide device -> queue table, created once and never torn down
/// before process exit (spec §9 "Global state"), mirroring the teacher's
/// `once_cell::sync::Lazy<Mutex<HashMap<...>>>` registries.
pub struct QueueRegistry {
    queues: Mutex<std::collections::HashMap<String, Arc<DeviceQueue>>>,
}

static REGISTRY: Lazy<QueueRegistry> = Lazy::new(|| QueueRegistry {
    queues: Mutex::new(std::collections::HashMap::new()),
});

static INIT: Once = Once::new();

impl QueueRegistry {
    pub fn global() -> &'static QueueRegistry {
        INIT.call_once(|| {});
        &REGISTRY
    }

    /// Return the queue for `device`, spawning `threads_per_queue` worker
    /// threads named after the device the first time it's referenced
    /// (`ensureRunQueue`).
    pub fn ensure<F>(&self, device: &str, threads_per_queue: usize, spawn_worker: F) -> Arc<DeviceQueue>
    where
        F: Fn(Arc<DeviceQueue>) + Send + Sync + Clone + 'static,
    {
        let devicestr = device.to_ascii_uppercase();
        let mut guard = self.queues.lock();
        if let Some(q) = guard.get(&devicestr) {
            return q.clone();
        }
        let queue = DeviceQueue::new(devicestr.clone());
        for i in 0..threads_per_queue.max(1) {
            let queue_for_thread = queue.clone();
            let name = format!("dagrunner-{devicestr}-{i}");
            let builder = std::thread::Builder::new().name(name);
            // Workers are spawned by the caller-provided closure so the
            // scheduler module (which owns execution logic) doesn't need a
            // dependency cycle back into this one.
            let worker = spawn_worker.clone();
            let handle = builder
                .spawn(move || worker(queue_for_thread))
                .expect("failed to spawn device worker thread");
            queue.threads.lock().push(handle);
        }
        guard.insert(devicestr, queue.clone());
        queue
    }

    pub fn get(&self, device: &str) -> Option<Arc<DeviceQueue>> {
        self.queues.lock().get(&device.to_ascii_uppercase()).cloned()
    }

    pub fn device_names(&self) -> Vec<String> {
        self.queues.lock().keys().cloned().collect()
    }

    /// Signal every queue to stop waiting and join their worker threads.
    /// Used by the CLI harness and tests on shutdown; a long-running server
    /// module would never call this before process exit.
    pub fn shutdown_all(&self) {
        let mut guard = self.queues.lock();
        for queue in guard.values() {
            queue.request_shutdown();
        }
        for (_, queue) in guard.drain() {
            let mut threads = queue.threads.lock();
            for handle in threads.drain(..) {
                let _ = handle.join();
            }
        }
    }
}
