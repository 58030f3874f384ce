//! Engine facade: wires the command parser (C4), per-device queues (C5),
//! scheduler (C6), and reply assembler (C7) together behind one entry point
//! a host module calls for `DAGRUN`/`DAGRUN_RO`.
//!
//! Grounded on the teacher's `Orchestrator` (`inference/orchestrator.rs`):
//! one struct owning the shared collaborators (here: keyspace, backend
//! registry, stats registry, config) plus a single `submit`-shaped method
//! callers drive, with worker threads as the engine's only internal
//! concurrency.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::backend::registry::BackendRegistry;
use crate::config::DagConfig;
use crate::error::DagResult;
use crate::keyspace::SharedKeyspace;
use crate::op::DagOp;
use crate::parser::{self, DagMode};
use crate::queue::QueueRegistry;
use crate::reply::WireReply;
use crate::run_info::{ClientHandle, RunInfo};
use crate::scheduler;
use crate::stats::StatsRegistry;

/// The handful of shared collaborators every device worker needs. Cloned
/// into each worker thread as one `Arc`, matching the teacher's pattern of
/// passing one config/registry bundle into spawned work (e.g.
/// `inference::orchestrator`'s backend dispatch).
pub struct EngineHandles {
    pub keyspace: SharedKeyspace,
    pub backends: Arc<BackendRegistry>,
    pub stats: Arc<StatsRegistry>,
}

pub struct Engine {
    handles: Arc<EngineHandles>,
    config: DagConfig,
    next_client_id: AtomicU64,
}

impl Engine {
    pub fn new(keyspace: SharedKeyspace, backends: Arc<BackendRegistry>, config: DagConfig) -> Self {
        Engine {
            handles: Arc::new(EngineHandles {
                keyspace,
                backends,
                stats: Arc::new(StatsRegistry::new()),
            }),
            config,
            next_client_id: AtomicU64::new(1),
        }
    }

    pub fn stats(&self) -> &StatsRegistry {
        &self.handles.stats
    }

    /// Parse `tokens` (the command body after `DAGRUN`/`DAGRUN_RO`), enqueue
    /// one view per distinct target device, and block the calling thread
    /// until the reply assembler fires (spec §4, §6).
    ///
    /// A real server-module deployment would instead register a callback
    /// and return immediately, relying on the host's client-blocking
    /// primitives (spec §6 "block-client / unblock-client") — this
    /// synchronous form is what the CLI harness and the test suite use, and
    /// is functionally identical from the engine's point of view: both ends
    /// in `deliver` sending exactly one `WireReply`.
    pub fn run_dagrun(&self, tokens: &[String], mode: DagMode) -> WireReply {
        let run = match parser::parse(tokens, self.handles.keyspace.as_ref(), mode) {
            Ok(run) => Arc::new(run),
            Err(e) => return WireReply::FatalError(e.wire_text()),
        };

        let (tx, rx) = crossbeam_channel::bounded(1);
        let client_id = self.next_client_id.fetch_add(1, Ordering::SeqCst);
        *run.client.lock().unwrap() = Some(ClientHandle { id: client_id, sender: tx });

        self.enqueue(&run);

        rx.recv().unwrap_or(WireReply::FatalError(
            "ERR client disconnected before DAG completed".to_string(),
        ))
    }

    /// Push one view of `run` onto every device queue its ops touch,
    /// spawning that queue's workers on first use (spec §4.1 step 6 /
    /// §4.2).
    fn enqueue(&self, run: &Arc<RunInfo>) {
        let devices: Vec<String> = run.device_views.keys().cloned().collect();
        for device in devices {
            let queue = QueueRegistry::global().ensure(&device, self.config.threads_per_queue, {
                let handles = self.handles.clone();
                move |queue| scheduler::worker_loop(queue, handles.clone())
            });
            queue.push_back(run.clone());
        }
    }

    /// Expose the op count of the DAG that would result from parsing
    /// `tokens`, without scheduling it. Used by callers that want to report
    /// `"reply array length equals the DAG's op count"` (spec §7) ahead of
    /// submission, e.g. admission control.
    pub fn would_parse(&self, tokens: &[String], mode: DagMode) -> DagResult<Vec<DagOp>> {
        let run = parser::parse(tokens, self.handles.keyspace.as_ref(), mode)?;
        Ok(run.shared.into_inner().ops)
    }
}
