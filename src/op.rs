//! DagOp: one node of a parsed DAG.
//!
//! `in_indices`/`out_indices` are slot numbers into the owning `RunInfo`'s
//! shared tensor array (after alpha-conversion, see `crate::parser::alpha`),
//! `device` is fixed at parse time, and `result` starts `Unstarted` and is
//! written at most once by the scheduler.

use crate::tensor::DType;

/// Requested tensor reply encoding for a TensorGet op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyFormat {
    Meta,
    Blob,
    Values,
}

impl ReplyFormat {
    pub fn parse(tok: &str) -> Option<ReplyFormat> {
        match tok.to_ascii_uppercase().as_str() {
            "META" => Some(ReplyFormat::Meta),
            "BLOB" => Some(ReplyFormat::Blob),
            "VALUES" => Some(ReplyFormat::Values),
            _ => None,
        }
    }
}

/// Raw tokens backing a TensorSet, parsed against the declared dtype only
/// once the op actually executes. This crate treats tensor value encoding
/// as opaque bytes and only needs to round-trip TensorSet → TensorGet
/// byte-for-byte.
#[derive(Debug, Clone)]
pub enum TensorSetSource {
    /// Hex-encoded raw bytes, used for the BLOB form.
    Blob(String),
    /// Decimal literal tokens, one per element, used for the VALUES form.
    Values(Vec<String>),
}

/// Kind-specific payload for a DagOp.
#[derive(Debug, Clone)]
pub enum OpKind {
    TensorSet {
        dtype: DType,
        shape: Vec<u64>,
        source: TensorSetSource,
    },
    TensorGet {
        formats: Vec<ReplyFormat>,
    },
    ModelRun {
        input_names: Vec<Option<String>>,
        output_names: Vec<Option<String>>,
        batch_size: usize,
        min_batch_size: usize,
        min_batch_timeout_ms: u64,
    },
    ScriptRun {
        fn_name: String,
        input_names: Vec<Option<String>>,
        /// Index into `input_names`/`in_indices` at which the `$` variadic
        /// marker was found, if any (spec.md §4.1, §8 boundary case).
        variadic_from: Option<usize>,
    },
}

impl OpKind {
    pub fn is_model_run(&self) -> bool {
        matches!(self, OpKind::ModelRun { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            OpKind::TensorSet { .. } => "TENSORSET",
            OpKind::TensorGet { .. } => "TENSORGET",
            OpKind::ModelRun { .. } => "MODELRUN",
            OpKind::ScriptRun { .. } => "SCRIPTRUN",
        }
    }
}

/// Outcome of one op's execution. `Unstarted` is the only state a freshly
/// parsed op may be in; every other state is written at most once by the
/// scheduler (spec.md §3 "result: {Unstarted, Ok, Err, NotApplicable}").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpResult {
    Unstarted,
    Ok,
    Err(String),
    NotApplicable,
}

/// One node of a parsed DAG.
#[derive(Debug, Clone)]
pub struct DagOp {
    pub kind: OpKind,
    /// Slot indices read by this op, alpha-converted to address the exact
    /// producer instance (spec.md §4.1 step 3).
    pub in_indices: Vec<usize>,
    /// Slot indices written by this op. After parsing, no two ops in a DAG
    /// share an output slot (spec.md §8 invariant 1).
    pub out_indices: Vec<usize>,
    /// Target device queue, e.g. `"CPU"` or `"GPU:0"`. Fixed after parsing.
    pub device: String,
    /// Identifier of the model/script to invoke; `None` for Tensor{Set,Get}.
    pub run_key: Option<String>,
    pub result: OpResult,
    pub duration_us: u64,
    /// Actual batch size this op ran with (1 if unbatched), recorded for
    /// the stats registry (spec.md §4.6).
    pub batch_size_used: usize,
}

impl DagOp {
    pub fn new(kind: OpKind, device: String, run_key: Option<String>) -> Self {
        DagOp {
            kind,
            in_indices: Vec::new(),
            out_indices: Vec::new(),
            device,
            run_key,
            result: OpResult::Unstarted,
            duration_us: 0,
            batch_size_used: 1,
        }
    }

    /// Is this op a candidate for cross-DAG batching at all? Only ModelRun
    /// ops with `batch_size > 0` are (spec.md §4.3 step 2).
    pub fn is_batchable_kind(&self) -> bool {
        matches!(
            &self.kind,
            OpKind::ModelRun { batch_size, .. } if *batch_size > 0
        )
    }
}
