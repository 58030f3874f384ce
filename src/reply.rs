//! Reply assembler: walks a completed DAG's ops in program order and
//! produces the wire-level reply, persisting any PERSIST'd tensors first.
//! Emits one reply element per op in parse order regardless of which
//! device actually executed it.

use std::sync::Arc;

use crate::error::DagError;
use crate::keyspace::Keyspace;
use crate::op::{OpKind, OpResult, ReplyFormat};
use crate::run_info::RunInfo;
use crate::stats::StatsRegistry;
use crate::tensor::TensorHandle;

/// One op's contribution to the reply array, or a tensor payload for
/// TensorGet in whichever format(s) were requested.
#[derive(Debug, Clone, PartialEq)]
pub enum WireElement {
    Simple(String),
    Error(String),
    NotApplicable,
    Tensor(Vec<TensorView>),
}

/// One requested view of a tensor (TensorGet can ask for more than one
/// format in the same op, e.g. `META VALUES`).
#[derive(Debug, Clone, PartialEq)]
pub enum TensorView {
    Meta { dtype: String, shape: Vec<u64> },
    Blob(Vec<u8>),
    Values(Vec<u8>),
}

/// A full reply: either a fatal DAG-level error, a timeout, or one element
/// per op in the DAG's original order.
#[derive(Debug, Clone, PartialEq)]
pub enum WireReply {
    Array(Vec<WireElement>),
    FatalError(String),
    TimedOut,
}

fn tensor_views(tensor: &TensorHandle, formats: &[ReplyFormat]) -> Vec<TensorView> {
    formats
        .iter()
        .map(|fmt| match fmt {
            ReplyFormat::Meta => TensorView::Meta {
                dtype: format!("{:?}", tensor.dtype().kind),
                shape: tensor.shape().to_vec(),
            },
            ReplyFormat::Blob => TensorView::Blob(tensor.data().to_vec()),
            ReplyFormat::Values => TensorView::Values(tensor.data().to_vec()),
        })
        .collect()
}

/// Assemble and return the reply for a finished DAG, persisting any
/// PERSIST'd tensors first. Persistence only runs if no op already failed;
/// if it fails itself, the DAG reply is the single persist-failure error
/// string, not an array (spec.md §4.6, §7: "Persist errors taint the DAG
/// after successful execution and appear as a reply-level error").
///
/// A per-op runtime error (§7 "per-op backend errors... first setter
/// wins") does NOT collapse the reply to a top-level error: the array form
/// is still produced, with the erroring op's error in its slot and
/// `NotApplicable` for every op after it (spec.md §8 invariant 3, scenario
/// S5).
pub fn assemble(run: &Arc<RunInfo>, keyspace: &dyn Keyspace, stats: &StatsRegistry) -> WireReply {
    if run.timed_out.load(std::sync::atomic::Ordering::SeqCst) {
        return WireReply::TimedOut;
    }

    if !run.has_error() {
        if let Err(persist_err) = persist_outputs(run, keyspace) {
            let wire_text = persist_err.wire_text();
            run.set_error(persist_err);
            return WireReply::FatalError(wire_text);
        }
    }

    let shared = run.shared.read();
    let mut elements = Vec::with_capacity(shared.ops.len());
    for op in &shared.ops {
        record_stats(op, stats);
        let element = match (&op.result, &op.kind) {
            (OpResult::NotApplicable, _) => WireElement::NotApplicable,
            (OpResult::Err(e), _) => WireElement::Error(e.clone()),
            (OpResult::Ok, OpKind::TensorGet { formats }) => {
                let slot = op.in_indices[0];
                match &shared.tensors[slot] {
                    Some(t) => WireElement::Tensor(tensor_views(t, formats)),
                    None => WireElement::Error("ERR tensor key is empty".to_string()),
                }
            }
            (OpResult::Ok, _) => WireElement::Simple("OK".to_string()),
            (OpResult::Unstarted, _) => WireElement::NotApplicable,
        };
        elements.push(element);
    }
    WireReply::Array(elements)
}

fn record_stats(op: &crate::op::DagOp, stats: &StatsRegistry) {
    if let Some(key) = &op.run_key {
        if matches!(op.kind, OpKind::ModelRun { .. } | OpKind::ScriptRun { .. }) {
            let ok = !matches!(op.result, OpResult::Err(_));
            if !matches!(op.result, OpResult::Unstarted) {
                stats.record_run(key, op.duration_us, op.batch_size_used, ok);
            }
        }
    }
}

fn persist_outputs(run: &Arc<RunInfo>, keyspace: &dyn Keyspace) -> Result<(), DagError> {
    if run.persist_slots.is_empty() {
        return Ok(());
    }
    let shared = run.shared.read();
    let mut missing = Vec::new();
    for (key, &slot) in &run.persist_slots {
        match &shared.tensors[slot] {
            Some(tensor) => {
                keyspace.set_tensor(key, tensor.clone())?;
                keyspace.replicate_write(key);
            }
            None => missing.push(key.clone()),
        }
    }
    if !missing.is_empty() {
        missing.sort();
        return Err(DagError::PersistFailed(missing.join(", ")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyspace::InMemoryKeyspace;
    use crate::op::{DagOp, OpKind, ReplyFormat};
    use crate::tensor::DType;
    use std::collections::HashMap;

    fn make_tensorget_dag(value: &TensorHandle) -> Arc<RunInfo> {
        let mut set_op = DagOp::new(
            OpKind::TensorSet {
                dtype: value.dtype(),
                shape: value.shape().to_vec(),
                source: crate::op::TensorSetSource::Values(vec!["2.0".to_string()]),
            },
            "CPU".to_string(),
            None,
        );
        set_op.out_indices = vec![0];
        set_op.result = OpResult::Ok;

        let mut get_op = DagOp::new(
            OpKind::TensorGet {
                formats: vec![ReplyFormat::Values],
            },
            "CPU".to_string(),
            None,
        );
        get_op.in_indices = vec![0];
        get_op.result = OpResult::Ok;

        let run = RunInfo::new(vec![Some(value.clone())], vec![set_op, get_op], HashMap::new(), None);
        Arc::new(run)
    }

    #[test]
    fn reply_lists_ops_in_program_order() {
        let t = TensorHandle::new(DType::FLOAT32, vec![1], vec![0, 0, 0, 64]);
        let run = make_tensorget_dag(&t);
        let ks = InMemoryKeyspace::new();
        let stats = StatsRegistry::new();
        match assemble(&run, &ks, &stats) {
            WireReply::Array(elems) => {
                assert_eq!(elems.len(), 2);
                assert_eq!(elems[0], WireElement::Simple("OK".to_string()));
                assert!(matches!(elems[1], WireElement::Tensor(_)));
            }
            other => panic!("expected array reply, got {other:?}"),
        }
    }

    #[test]
    fn error_op_short_circuits_reply_as_array_not_fatal_error() {
        // Per spec.md §8 invariant 3 and scenario S5, a per-op runtime error
        // produces the array form: the erroring op's error in its own slot,
        // `NotApplicable` for every op after it. Only persist failures
        // collapse the whole reply to `WireReply::FatalError`.
        let mut op1 = DagOp::new(
            OpKind::TensorGet {
                formats: vec![ReplyFormat::Meta],
            },
            "CPU".to_string(),
            None,
        );
        op1.result = OpResult::Err("ERR boom".to_string());
        let mut op2 = DagOp::new(
            OpKind::TensorGet {
                formats: vec![ReplyFormat::Meta],
            },
            "CPU".to_string(),
            None,
        );
        op2.result = OpResult::NotApplicable;

        let run = RunInfo::new(vec![None], vec![op1, op2], HashMap::new(), None);
        run.set_error(DagError::BackendRuntime("boom".to_string()));
        let run = Arc::new(run);
        let ks = InMemoryKeyspace::new();
        let stats = StatsRegistry::new();
        match assemble(&run, &ks, &stats) {
            WireReply::Array(elems) => {
                assert_eq!(elems.len(), 2);
                assert_eq!(elems[0], WireElement::Error("ERR boom".to_string()));
                assert_eq!(elems[1], WireElement::NotApplicable);
            }
            other => panic!("expected array reply, got {other:?}"),
        }
    }

    #[test]
    fn persist_failure_taints_dag_after_success() {
        let mut op = DagOp::new(
            OpKind::TensorSet {
                dtype: DType::FLOAT32,
                shape: vec![1],
                source: crate::op::TensorSetSource::Values(vec!["1.0".to_string()]),
            },
            "CPU".to_string(),
            None,
        );
        op.out_indices = vec![0];
        op.result = OpResult::Ok;
        let mut persist_slots = HashMap::new();
        persist_slots.insert("y".to_string(), 0usize);
        // slot 0 left unset -> persist should fail even though op "succeeded"
        let run = Arc::new(RunInfo::new(vec![None], vec![op], persist_slots, None));
        let ks = InMemoryKeyspace::new();
        let stats = StatsRegistry::new();
        match assemble(&run, &ks, &stats) {
            WireReply::FatalError(e) => assert!(e.contains("could not persist")),
            other => panic!("expected fatal error, got {other:?}"),
        }
    }

    #[test]
    fn timeout_short_circuits_everything() {
        let op = DagOp::new(
            OpKind::TensorGet {
                formats: vec![ReplyFormat::Meta],
            },
            "CPU".to_string(),
            None,
        );
        let run = RunInfo::new(vec![None], vec![op], HashMap::new(), Some(1));
        run.timed_out.store(true, std::sync::atomic::Ordering::SeqCst);
        let run = Arc::new(run);
        let ks = InMemoryKeyspace::new();
        let stats = StatsRegistry::new();
        assert_eq!(assemble(&run, &ks, &stats), WireReply::TimedOut);
    }
}
