//! Scheduler/worker loop: batch formation, single-step execution, and the
//! re-queue/retire decision for one device queue.
//!
//! Each worker pops the front DAG off its device queue, scans the rest of
//! the queue for batchable successors bounded by the current op's declared
//! batch size, releases the queue lock, executes, then either pushes the
//! DAG back to the front (it made progress or still has ready work), rotates
//! the next queue item ahead of it (it's blocked on another device), or
//! sleeps briefly and retries (it's the only thing in the queue and it's
//! blocked).

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::backend::{Backend, ModelRunContext, ScriptRunContext};
use crate::engine::EngineHandles;
use crate::op::{DagOp, OpKind, OpResult};
use crate::queue::DeviceQueue;
use crate::reply;
use crate::run_info::RunInfo;
use crate::tensor::TensorHandle;

/// Throttled-spin sleep used when a DAG is the only item in its device
/// queue and is still waiting on another device's output. A future revision
/// could replace this with a wait/notify scheme keyed on the blocking slot;
/// for now a short sleep keeps a blocked DAG from busy-spinning the queue.
const THROTTLE_SPIN: Duration = Duration::from_millis(1);

/// Add a small random skew to the throttled spin so that many DAGs stuck
/// on the same queue at once don't all wake up in lockstep and immediately
/// re-contend for the queue mutex.
fn jittered_throttle() -> Duration {
    use rand::Rng;
    let extra_us: u64 = rand::thread_rng().gen_range(0..300);
    THROTTLE_SPIN + Duration::from_micros(extra_us)
}

/// Index of the next not-yet-executed op on `device` for this DAG, or
/// `None` if this device's share is already complete.
fn current_op_index(run: &RunInfo, device: &str) -> Option<usize> {
    let done = run
        .device_complete_op_count
        .get(device)
        .map(|c| c.load(Ordering::SeqCst))
        .unwrap_or(0);
    run.device_views.get(device).and_then(|v| v.get(done)).copied()
}

fn inputs_ready(run: &RunInfo, op_idx: usize) -> bool {
    let shared = run.shared.read();
    shared.ops[op_idx]
        .in_indices
        .iter()
        .all(|&slot| shared.tensors[slot].is_some())
}

/// Is the current op on `device` a ModelRun with batching enabled at all?
/// If it isn't, or its model declares a batch size of 0, the batch is just
/// the DAG itself.
fn current_op_is_batchable(run: &RunInfo, device: &str) -> bool {
    match current_op_index(run, device) {
        Some(idx) => run.shared.read().ops[idx].is_batchable_kind(),
        None => false,
    }
}

fn current_op_batch_limits(run: &RunInfo, device: &str) -> (usize, usize) {
    match current_op_index(run, device) {
        Some(idx) => match &run.shared.read().ops[idx].kind {
            OpKind::ModelRun {
                batch_size,
                min_batch_size,
                ..
            } => (*batch_size, *min_batch_size),
            _ => (0, 0),
        },
        None => (0, 0),
    }
}

fn current_op_batch_size(run: &RunInfo, device: &str) -> u64 {
    match current_op_index(run, device) {
        Some(idx) => {
            let shared = run.shared.read();
            shared.ops[idx]
                .in_indices
                .first()
                .and_then(|&slot| shared.tensors[slot].as_ref())
                .map(|t| t.batch_dim())
                .unwrap_or(0)
        }
        None => 0,
    }
}

/// Whether two DAGs' current ops can be executed as one backend call: both
/// ModelRun, same model key, same input arity, every input tensor present
/// with matching dtype/rank/trailing shape; the zeroth (batch) dimension is
/// free to differ.
fn batchable(a: &RunInfo, b: &RunInfo, device: &str) -> bool {
    let (Some(ia), Some(ib)) = (current_op_index(a, device), current_op_index(b, device)) else {
        return false;
    };
    let sa = a.shared.read();
    let sb = b.shared.read();
    let (op_a, op_b) = (&sa.ops[ia], &sb.ops[ib]);
    let (OpKind::ModelRun { .. }, OpKind::ModelRun { .. }) = (&op_a.kind, &op_b.kind) else {
        return false;
    };
    if op_a.run_key != op_b.run_key {
        return false;
    }
    if op_a.in_indices.len() != op_b.in_indices.len() {
        return false;
    }
    for (&slot_a, &slot_b) in op_a.in_indices.iter().zip(op_b.in_indices.iter()) {
        let (Some(ta), Some(tb)) = (&sa.tensors[slot_a], &sb.tensors[slot_b]) else {
            return false;
        };
        if ta.dtype() != tb.dtype() {
            return false;
        }
        if ta.rank() != tb.rank() {
            return false;
        }
        if ta.trailing_shape() != tb.trailing_shape() {
            return false;
        }
    }
    true
}

/// Pop the front item and greedily accumulate batchable successors from the
/// remainder of `items`, mutating `items` in place.
pub fn form_batch(front: Arc<RunInfo>, items: &mut VecDeque<Arc<RunInfo>>, device: &str) -> Vec<Arc<RunInfo>> {
    let mut batch = vec![front.clone()];
    if !current_op_is_batchable(&front, device) {
        return batch;
    }
    let (batch_cap, min_batch) = current_op_batch_limits(&front, device);
    if batch_cap == 0 {
        return batch;
    }
    let mut accumulated = current_op_batch_size(&front, device);
    if accumulated == 0 || accumulated >= batch_cap as u64 {
        return batch;
    }

    let mut idx = 0;
    while idx < items.len() {
        if accumulated >= min_batch as u64 && min_batch > 0 {
            break;
        }
        let candidate = items[idx].clone();
        if !batchable(&front, &candidate, device) {
            idx += 1;
            continue;
        }
        let csize = current_op_batch_size(&candidate, device);
        if accumulated + csize > batch_cap as u64 {
            break;
        }
        accumulated += csize;
        batch.push(candidate);
        items.remove(idx);
    }
    batch
}

/// Build a `ModelRunContext`/`ScriptRunContext` from the batch's current
/// ops, invoke the backend exactly once, and slice the result back onto
/// each member — or, for a single-member non-batched call, just run it
/// directly.
///
/// Any member whose DAG already has its `error_flag` set (set by a
/// different device between batch formation and this call) is excluded
/// from the backend call entirely and its current op is marked
/// `NotApplicable` instead — "subsequent ops... on any device are not
/// executed" (spec.md §7).
fn execute_batch(batch: &[Arc<RunInfo>], device: &str, handles: &EngineHandles) {
    let mut runnable: Vec<Arc<RunInfo>> = Vec::with_capacity(batch.len());
    for run in batch {
        if run.has_error() {
            if let Some(op_idx) = current_op_index(run, device) {
                run.shared.write().ops[op_idx].result = OpResult::NotApplicable;
            }
            continue;
        }
        runnable.push(run.clone());
    }
    if runnable.is_empty() {
        return;
    }
    let batch = runnable;

    let started = Instant::now();
    let current_ops: Vec<usize> = batch
        .iter()
        .filter_map(|r| current_op_index(r, device))
        .collect();
    if current_ops.len() != batch.len() {
        // A member had nothing left to do on this device (shouldn't happen
        // given callers only pass runs with a ready current op), skip.
        return;
    }

    // Gather per-member inputs and the op kind (uniform across a batch by
    // construction of `form_batch`/`batchable`).
    let mut per_member_inputs: Vec<Vec<TensorHandle>> = Vec::with_capacity(batch.len());
    let mut op_kind_is_model = false;
    for (run, &op_idx) in batch.iter().zip(current_ops.iter()) {
        let shared = run.shared.read();
        let op = &shared.ops[op_idx];
        op_kind_is_model = matches!(op.kind, OpKind::ModelRun { .. });
        let inputs: Vec<TensorHandle> = op
            .in_indices
            .iter()
            .map(|&slot| shared.tensors[slot].clone().expect("input slot must be ready"))
            .collect();
        per_member_inputs.push(inputs);
    }

    let result = if op_kind_is_model {
        run_model_batch(&batch, &current_ops, &per_member_inputs, handles)
    } else {
        run_non_batched(&batch, &current_ops, &per_member_inputs, handles)
    };

    let duration_us = started.elapsed().as_micros() as u64;
    let batch_len = batch.len();
    for (run, &op_idx) in batch.iter().zip(current_ops.iter()) {
        let mut shared = run.shared.write();
        shared.ops[op_idx].duration_us = duration_us;
        shared.ops[op_idx].batch_size_used = batch_len;
        drop(shared);
        match &result {
            Ok(outputs_by_member) => {
                let outputs = outputs_by_member
                    .get(&(Arc::as_ptr(run) as usize))
                    .cloned()
                    .unwrap_or_default();
                let mut shared = run.shared.write();
                let out_indices = shared.ops[op_idx].out_indices.clone();
                for (slot, tensor) in out_indices.into_iter().zip(outputs.into_iter()) {
                    shared.tensors[slot] = Some(tensor);
                }
                shared.ops[op_idx].result = OpResult::Ok;
            }
            Err(e) => {
                let mut shared = run.shared.write();
                shared.ops[op_idx].result = OpResult::Err(e.wire_text());
                drop(shared);
                run.set_error(e.clone());
            }
        }
    }
}

type MemberOutputs = std::collections::HashMap<usize, Vec<TensorHandle>>;

fn run_model_batch(
    batch: &[Arc<RunInfo>],
    current_ops: &[usize],
    per_member_inputs: &[Vec<TensorHandle>],
    handles: &EngineHandles,
) -> Result<MemberOutputs, crate::error::DagError> {
    let run_key = {
        let shared = batch[0].shared.read();
        shared.ops[current_ops[0]].run_key.clone().unwrap()
    };
    let meta = handles.keyspace.get_model_metadata(&run_key)?;
    let backend = handles.backends.get(&meta.backend)?;

    if batch.len() == 1 {
        let output_count = {
            let shared = batch[0].shared.read();
            shared.ops[current_ops[0]].out_indices.len()
        };
        let mut ctx = ModelRunContext {
            inputs: per_member_inputs[0].clone(),
            output_count,
            results: Vec::new(),
        };
        backend.model_run(&meta.handle, &mut ctx)?;
        let mut out = MemberOutputs::new();
        out.insert(Arc::as_ptr(&batch[0]) as usize, ctx.results);
        return Ok(out);
    }

    let per_input_slot = per_member_inputs[0].len();
    let mut concatenated = Vec::with_capacity(per_input_slot);
    for slot in 0..per_input_slot {
        let members: Vec<TensorHandle> = per_member_inputs.iter().map(|m| m[slot].clone()).collect();
        concatenated.push(TensorHandle::concat_batch(&members));
    }
    let output_count = {
        let shared = batch[0].shared.read();
        shared.ops[current_ops[0]].out_indices.len()
    };
    let mut ctx = ModelRunContext {
        inputs: concatenated,
        output_count,
        results: Vec::new(),
    };
    backend.model_run(&meta.handle, &mut ctx)?;

    let member_batch_sizes: Vec<u64> = per_member_inputs.iter().map(|m| m[0].batch_dim()).collect();
    let mut out = MemberOutputs::new();
    for (i, run) in batch.iter().enumerate() {
        let mut member_results = Vec::with_capacity(ctx.results.len());
        for output_tensor in &ctx.results {
            let slices = output_tensor.split_batch(&member_batch_sizes);
            member_results.push(slices[i].clone());
        }
        out.insert(Arc::as_ptr(run) as usize, member_results);
    }
    Ok(out)
}

fn run_non_batched(
    batch: &[Arc<RunInfo>],
    current_ops: &[usize],
    per_member_inputs: &[Vec<TensorHandle>],
    handles: &EngineHandles,
) -> Result<MemberOutputs, crate::error::DagError> {
    let mut out = MemberOutputs::new();
    for ((run, &op_idx), inputs) in batch.iter().zip(current_ops.iter()).zip(per_member_inputs.iter()) {
        let shared = run.shared.read();
        let op = &shared.ops[op_idx];
        let results = match &op.kind {
            OpKind::ModelRun { .. } => {
                let run_key = op.run_key.clone().unwrap();
                drop(shared);
                let meta = handles.keyspace.get_model_metadata(&run_key)?;
                let backend = handles.backends.get(&meta.backend)?;
                let output_count = run.shared.read().ops[op_idx].out_indices.len();
                let mut ctx = ModelRunContext {
                    inputs: inputs.clone(),
                    output_count,
                    results: Vec::new(),
                };
                backend.model_run(&meta.handle, &mut ctx)?;
                ctx.results
            }
            OpKind::ScriptRun { fn_name, .. } => {
                let run_key = op.run_key.clone().unwrap();
                let fn_name = fn_name.clone();
                let output_count = op.out_indices.len();
                drop(shared);
                let meta = handles.keyspace.get_script_metadata(&run_key)?;
                let backend = handles.backends.get(&meta.backend)?;
                let mut ctx = ScriptRunContext {
                    fn_name,
                    inputs: inputs.clone(),
                    output_count,
                    results: Vec::new(),
                };
                backend.script_run(&meta.handle, &mut ctx)?;
                ctx.results
            }
            OpKind::TensorSet { dtype, shape, source } => {
                let tensor = materialize_tensor_set(*dtype, shape, source)?;
                drop(shared);
                vec![tensor]
            }
            OpKind::TensorGet { .. } => {
                // TensorGet has no output slots; it only reads. Recorded as
                // Ok with zero results so the common completion path below
                // still advances bookkeeping uniformly.
                drop(shared);
                Vec::new()
            }
        };
        out.insert(Arc::as_ptr(run) as usize, results);
    }
    Ok(out)
}

fn materialize_tensor_set(
    dtype: crate::tensor::DType,
    shape: &[u64],
    source: &crate::op::TensorSetSource,
) -> Result<TensorHandle, crate::error::DagError> {
    use crate::error::DagError;
    use crate::op::TensorSetSource;

    let data = match source {
        TensorSetSource::Blob(hex) => decode_hex(hex)
            .ok_or_else(|| DagError::Parse(format!("invalid BLOB payload: {hex}")))?,
        TensorSetSource::Values(values) => encode_values(dtype, values)?,
    };
    Ok(TensorHandle::new(dtype, shape.to_vec(), data))
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

fn encode_values(dtype: crate::tensor::DType, values: &[String]) -> Result<Vec<u8>, crate::error::DagError> {
    use crate::error::DagError;
    use crate::tensor::DTypeKind;

    let mut out = Vec::with_capacity(values.len() * dtype.width.bytes());
    for v in values {
        match dtype.kind {
            DTypeKind::Float if dtype.width.bytes() == 4 => {
                let f: f32 = v
                    .parse()
                    .map_err(|_| DagError::Parse(format!("invalid float value: {v}")))?;
                out.extend_from_slice(&f.to_le_bytes());
            }
            DTypeKind::Float => {
                let f: f64 = v
                    .parse()
                    .map_err(|_| DagError::Parse(format!("invalid float value: {v}")))?;
                out.extend_from_slice(&f.to_le_bytes());
            }
            DTypeKind::Int | DTypeKind::Uint | DTypeKind::Bool => {
                let i: i64 = v
                    .parse()
                    .map_err(|_| DagError::Parse(format!("invalid integer value: {v}")))?;
                out.extend_from_slice(&i.to_le_bytes()[..dtype.width.bytes()]);
            }
            DTypeKind::String => out.extend_from_slice(v.as_bytes()),
        }
    }
    Ok(out)
}

/// After one execution step, decide whether to re-queue this DAG on
/// `device` (front, behind a rotated peer, or after a throttled sleep), or
/// retire it from this device's view and possibly unblock the client.
pub fn advance(run: &Arc<RunInfo>, queue: &DeviceQueue, handles: &EngineHandles) {
    if run.single_op_dag {
        finish_single_op(run, handles);
        return;
    }

    let device_done = run.complete_op_on_device(&queue.device);
    let dag_error = run.has_error();
    let all_complete = run.all_complete() || dag_error;

    if !device_done && !dag_error {
        match current_op_index(run, &queue.device) {
            Some(next_idx) if inputs_ready(run, next_idx) => {
                queue.push_front(run.clone());
            }
            _ => rotate_or_throttle(run.clone(), queue),
        }
    }

    if all_complete && run.try_claim_unblock() {
        let reply = reply::assemble(run, handles.keyspace.as_ref(), &handles.stats);
        deliver(run, reply);
    }

    if device_done || dag_error {
        let remaining = run.live_devices.fetch_sub(1, Ordering::SeqCst) - 1;
        let _ = remaining;
    }
}

/// Re-queue `run` for another attempt on `queue`: rotate a peer ahead of it
/// if one exists, so other work gets a turn, or sleep briefly if `run` is
/// the only item (spec.md §4.3 "throttled spin").
fn rotate_or_throttle(run: Arc<RunInfo>, queue: &DeviceQueue) {
    if let Some(peer) = queue.pop_front() {
        queue.push_front(run);
        queue.push_front(peer);
    } else {
        queue.push_front(run);
        std::thread::sleep(jittered_throttle());
    }
}

fn finish_single_op(run: &Arc<RunInfo>, handles: &EngineHandles) {
    if run.try_claim_unblock() {
        let reply = reply::assemble(run, handles.keyspace.as_ref(), &handles.stats);
        deliver(run, reply);
    }
}

fn deliver(run: &Arc<RunInfo>, reply: reply::WireReply) {
    if let Some(client) = run.client.lock().unwrap().take() {
        let _ = client.sender.send(reply);
    }
}

/// Mark every op still `Unstarted` on this DAG as NotApplicable and fast
/// path to the reply assembler. A timeout only ever fires at dequeue time —
/// it never interrupts an in-flight backend call.
pub fn fail_with_timeout(run: &Arc<RunInfo>, handles: &EngineHandles) {
    run.timed_out.store(true, Ordering::SeqCst);
    {
        let mut shared = run.shared.write();
        for op in shared.ops.iter_mut() {
            if op.result == OpResult::Unstarted {
                op.result = OpResult::NotApplicable;
            }
        }
    }
    if run.try_claim_unblock() {
        let reply = reply::assemble(run, handles.keyspace.as_ref(), &handles.stats);
        deliver(run, reply);
    }
}

/// The steady-state loop bound to one device queue's worker threads.
pub fn worker_loop(queue: Arc<DeviceQueue>, handles: Arc<EngineHandles>) {
    loop {
        let front = {
            let mut guard = queue.lock_nonempty();
            if guard.is_empty() {
                return; // shutdown requested and nothing left to drain
            }
            guard.pop_front()
        };
        let Some(front) = front else { continue };

        if front.is_past_deadline() {
            fail_with_timeout(&front, &handles);
            continue;
        }

        // A cross-device DAG can reach the front of this device's queue
        // before another device has produced one of its current op's
        // inputs (spec.md §4.4: "a consumer observes a populated slot only
        // after the producer's successful write"). Don't execute against
        // an unready op — rotate a peer ahead or throttle-spin instead, the
        // same decision `advance` makes after completing a step.
        if !front.has_error() {
            if let Some(op_idx) = current_op_index(&front, &queue.device) {
                if !inputs_ready(&front, op_idx) {
                    rotate_or_throttle(front, &queue);
                    continue;
                }
            }
        }

        let batch = {
            let mut guard = queue.items_lock();
            form_batch(front, &mut guard, &queue.device)
        };
        execute_batch(&batch, &queue.device, &handles);
        for run in &batch {
            advance(run, &queue, &handles);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ModelHandle, ModelMetadata};
    use crate::keyspace::InMemoryKeyspace;
    use crate::stats::StatsRegistry;
    use crate::tensor::DType;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn handles_with_mock() -> Arc<EngineHandles> {
        let ks = InMemoryKeyspace::new();
        ks.register_model(
            "m",
            ModelMetadata {
                backend: "mock".to_string(),
                device: "CPU".to_string(),
                input_names: vec!["x".to_string()],
                output_names: vec!["y".to_string()],
                batch_size: 8,
                min_batch_size: 0,
                min_batch_timeout_ms: 0,
                handle: ModelHandle(Arc::new(crate::backend::mock::MockBackend.model_create("CPU", b"double", b"").unwrap().0)),
            },
        );
        let backends = crate::backend::registry::BackendRegistry::new();
        backends.register(Arc::new(crate::backend::mock::MockBackend));
        Arc::new(EngineHandles {
            keyspace: Arc::new(ks),
            backends: Arc::new(backends),
            stats: Arc::new(StatsRegistry::new()),
        })
    }

    fn modelrun_op(batch_size: usize) -> DagOp {
        let mut op = DagOp::new(
            OpKind::ModelRun {
                input_names: vec![Some("x".to_string())],
                output_names: vec![Some("y".to_string())],
                batch_size,
                min_batch_size: 0,
                min_batch_timeout_ms: 0,
            },
            "CPU".to_string(),
            Some("m".to_string()),
        );
        op.in_indices = vec![0];
        op.out_indices = vec![1];
        op
    }

    #[test]
    fn batch_of_one_when_only_item_present() {
        let op = modelrun_op(8);
        let t = TensorHandle::new(DType::FLOAT32, vec![1, 4], vec![0; 16]);
        let run = Arc::new(RunInfo::new(vec![Some(t), None], vec![op], HashMap::new(), None));
        let mut items = VecDeque::new();
        let batch = form_batch(run, &mut items, "CPU");
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn batches_two_compatible_dags_up_to_cap() {
        let op_a = modelrun_op(8);
        let op_b = modelrun_op(8);
        let t_a = TensorHandle::new(DType::FLOAT32, vec![1, 4], vec![0; 16]);
        let t_b = TensorHandle::new(DType::FLOAT32, vec![1, 4], vec![0; 16]);
        let front = Arc::new(RunInfo::new(vec![Some(t_a), None], vec![op_a], HashMap::new(), None));
        let peer = Arc::new(RunInfo::new(vec![Some(t_b), None], vec![op_b], HashMap::new(), None));
        let mut items = VecDeque::new();
        items.push_back(peer);
        let batch = form_batch(front, &mut items, "CPU");
        assert_eq!(batch.len(), 2);
        assert!(items.is_empty());
    }

    #[test]
    fn mismatched_trailing_shape_is_not_batched() {
        let op_a = modelrun_op(8);
        let op_b = modelrun_op(8);
        let t_a = TensorHandle::new(DType::FLOAT32, vec![1, 4], vec![0; 16]);
        let t_b = TensorHandle::new(DType::FLOAT32, vec![1, 8], vec![0; 32]);
        let front = Arc::new(RunInfo::new(vec![Some(t_a), None], vec![op_a], HashMap::new(), None));
        let peer = Arc::new(RunInfo::new(vec![Some(t_b), None], vec![op_b], HashMap::new(), None));
        let mut items = VecDeque::new();
        items.push_back(peer);
        let batch = form_batch(front, &mut items, "CPU");
        assert_eq!(batch.len(), 1);
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn execute_batch_installs_outputs_for_single_member() {
        let handles = handles_with_mock();
        let op = modelrun_op(0);
        let t = TensorHandle::new(DType::FLOAT32, vec![1], vec![0, 0, 128, 63]); // 1.0f32
        let run = Arc::new(RunInfo::new(vec![Some(t), None], vec![op], HashMap::new(), None));
        execute_batch(&[run.clone()], "CPU", &handles);
        let shared = run.shared.read();
        assert_eq!(shared.ops[0].result, OpResult::Ok);
        assert!(shared.tensors[1].is_some());
    }
}
