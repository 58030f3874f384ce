//! RunInfo (C3): the shared, reference-counted state of one in-flight DAG.
//!
//! One `RunInfo` is created per submitted DAG by the parser and wrapped in
//! an `Arc` so every device queue that owns at least one of its ops can hold
//! a clone without a central arena (spec.md §3 discusses an index +
//! generation-counter arena; this crate resolves that Open Question in
//! favor of `Arc`, see DESIGN.md). The tensor slot array and op list live
//! behind one `RwLock` so a worker reads/writes them under a single
//! critical section per spec.md §5's locking order ("never hold the queue
//! mutex across a backend call; never hold the DAG lock across queue
//! operations").

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use parking_lot::RwLock;

use crate::error::DagError;
use crate::op::DagOp;
use crate::tensor::TensorHandle;

/// A reply destination: one client's channel back out of the engine.
///
/// Modeled as a `crossbeam_channel::Sender` rather than a raw socket so the
/// same `RunInfo`/scheduler code works whether the caller is the CLI
/// harness, a test, or (in a real deployment) a network front end relaying
/// onto its own connection.
pub struct ClientHandle {
    pub id: u64,
    pub sender: crossbeam_channel::Sender<crate::reply::WireReply>,
}

/// Tensor slots and op list, mutated together under one lock so a worker
/// never observes an op whose inputs aren't yet installed (spec.md §3
/// "Tensor ownership").
pub struct SharedState {
    pub tensors: Vec<Option<TensorHandle>>,
    pub ops: Vec<DagOp>,
}

/// Shared state of one submitted DAG, from parse through final reply.
pub struct RunInfo {
    pub shared: RwLock<SharedState>,

    /// Slot index -> keyspace key name, for slots written by PERSIST keys
    /// (spec.md §4.1 "PERSIST"). Only these slots are written back to the
    /// keyspace when the DAG completes.
    pub persist_slots: HashMap<String, usize>,

    /// Total op count, fixed at parse time.
    pub op_count: usize,
    /// Ops completed so far (successes, failures, and skips all count).
    pub complete_op_count: AtomicUsize,

    /// Set by the first op to fail; later ops are NOT-APPLICABLE instead of
    /// running (spec.md §3 "Error propagation").
    pub error_flag: AtomicBool,
    pub err: Mutex<Option<DagError>>,

    /// Per-device view: slot indices into `dagOps`-equivalent `shared.ops`
    /// that belong to that device, preserving parse order.
    pub device_views: HashMap<String, Vec<usize>>,
    /// Per-device completion counters, used to decide when a device queue
    /// can drop its reference to this DAG (spec.md §5 "DagDeviceComplete").
    pub device_complete_op_count: HashMap<String, AtomicUsize>,
    /// Number of devices that have not yet finished their share of ops.
    /// The last device to complete its share runs the reply assembler.
    pub live_devices: AtomicUsize,

    pub timeout_ms: Option<u64>,
    pub queued_at: Instant,
    pub timed_out: AtomicBool,

    pub client: Mutex<Option<ClientHandle>>,

    /// True when this DAG has exactly one op — batching and the device-fan
    /// out accounting are skipped as a fast path (spec.md §4.3 "single-op
    /// DAG"), though the same locking discipline still applies.
    pub single_op_dag: bool,
    pub single_device_dag: bool,

    /// Guards against running the reply assembler twice for the same DAG.
    pub unblocked: AtomicBool,
}

impl RunInfo {
    pub fn new(
        tensors: Vec<Option<TensorHandle>>,
        ops: Vec<DagOp>,
        persist_slots: HashMap<String, usize>,
        timeout_ms: Option<u64>,
    ) -> Self {
        let op_count = ops.len();
        let mut device_views: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, op) in ops.iter().enumerate() {
            device_views.entry(op.device.clone()).or_default().push(idx);
        }
        let device_complete_op_count = device_views
            .keys()
            .map(|d| (d.clone(), AtomicUsize::new(0)))
            .collect();
        let live_devices = device_views.len();
        let single_device_dag = device_views.len() <= 1;

        RunInfo {
            shared: RwLock::new(SharedState { tensors, ops }),
            persist_slots,
            op_count,
            complete_op_count: AtomicUsize::new(0),
            error_flag: AtomicBool::new(false),
            err: Mutex::new(None),
            device_views,
            device_complete_op_count,
            live_devices: AtomicUsize::new(live_devices),
            timeout_ms,
            queued_at: Instant::now(),
            timed_out: AtomicBool::new(false),
            client: Mutex::new(None),
            single_op_dag: op_count == 1,
            single_device_dag,
            unblocked: AtomicBool::new(false),
        }
    }

    /// Has this DAG's deadline, if any, already passed?
    pub fn is_past_deadline(&self) -> bool {
        match self.timeout_ms {
            Some(ms) => self.queued_at.elapsed().as_millis() as u64 >= ms,
            None => false,
        }
    }

    /// Record the first error seen by any op in this DAG. Subsequent calls
    /// are no-ops: only the first failure is preserved (spec.md §3 "DagOp
    /// errors... short-circuit").
    pub fn set_error(&self, err: DagError) {
        if !self.error_flag.swap(true, Ordering::SeqCst) {
            *self.err.lock().unwrap() = Some(err);
        }
    }

    pub fn has_error(&self) -> bool {
        self.error_flag.load(Ordering::SeqCst)
    }

    /// Mark one more op complete for `device`, returning true if that
    /// device has now finished every op assigned to it.
    pub fn complete_op_on_device(&self, device: &str) -> bool {
        self.complete_op_count.fetch_add(1, Ordering::SeqCst);
        let total_for_device = self.device_views.get(device).map(|v| v.len()).unwrap_or(0);
        let done = self
            .device_complete_op_count
            .get(device)
            .map(|c| c.fetch_add(1, Ordering::SeqCst) + 1)
            .unwrap_or(0);
        done >= total_for_device
    }

    /// Has every op across every device finished?
    pub fn all_complete(&self) -> bool {
        self.complete_op_count.load(Ordering::SeqCst) >= self.op_count
    }

    /// Claim the right to run the reply assembler for this DAG. Returns
    /// true exactly once across however many device workers race to call
    /// it (spec.md §5 "exactly one reply is produced per DAG").
    pub fn try_claim_unblock(&self) -> bool {
        !self.unblocked.swap(true, Ordering::SeqCst)
    }
}
