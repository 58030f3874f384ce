//! Backend interface: the pluggable model/script runtimes a ModelRun/
//! ScriptRun op ultimately calls into.
//!
//! One small trait with the capability methods a runtime actually
//! implements, default-`BackendNotLoaded` for the optional ones, and a
//! registry keyed by backend name that resolves which implementation a
//! given model/script key should run against.

pub mod mock;
pub mod registry;

use std::any::Any;
use std::sync::Arc;

use crate::error::{DagError, DagResult};
use crate::tensor::TensorHandle;

/// Opaque per-backend model handle. Backends stash whatever internal
/// representation they need behind the `Any`; the engine only ever moves
/// the handle around and passes it back to the same backend.
#[derive(Clone)]
pub struct ModelHandle(pub Arc<dyn Any + Send + Sync>);

#[derive(Clone)]
pub struct ScriptHandle(pub Arc<dyn Any + Send + Sync>);

/// Metadata the parser and scheduler need about a model key, independent
/// of which backend actually owns it.
#[derive(Clone)]
pub struct ModelMetadata {
    pub backend: String,
    pub device: String,
    pub input_names: Vec<String>,
    pub output_names: Vec<String>,
    /// 0 disables batching for this model.
    pub batch_size: usize,
    pub min_batch_size: usize,
    pub min_batch_timeout_ms: u64,
    pub handle: ModelHandle,
}

#[derive(Clone)]
pub struct ScriptMetadata {
    pub backend: String,
    pub device: String,
    pub handle: ScriptHandle,
}

/// One call's worth of named inputs/outputs passed to `Backend::model_run`.
/// `inputs` is already batch-concatenated by the scheduler when more than
/// one DAG's ops were combined with others; the backend itself runs exactly
/// once per call regardless of how many logical requests it represents.
pub struct ModelRunContext {
    pub inputs: Vec<TensorHandle>,
    pub output_count: usize,
    pub results: Vec<TensorHandle>,
}

pub struct ScriptRunContext {
    pub fn_name: String,
    pub inputs: Vec<TensorHandle>,
    pub output_count: usize,
    pub results: Vec<TensorHandle>,
}

/// A pluggable model/script runtime.
///
/// Every method has a name-qualified `BackendNotLoaded` default so a
/// minimal backend only needs to implement what it actually supports.
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    fn model_create(&self, device: &str, opts: &[u8], bytes: &[u8]) -> DagResult<ModelHandle>;
    fn model_run(&self, model: &ModelHandle, ctx: &mut ModelRunContext) -> DagResult<()>;
    fn model_serialize(&self, model: &ModelHandle) -> DagResult<Vec<u8>>;
    fn model_free(&self, _model: ModelHandle) {}

    fn script_create(&self, _device: &str, _bytes: &[u8]) -> DagResult<ScriptHandle> {
        Err(DagError::BackendNotLoaded(format!(
            "{} does not support scripts",
            self.name()
        )))
    }

    fn script_run(&self, _script: &ScriptHandle, _ctx: &mut ScriptRunContext) -> DagResult<()> {
        Err(DagError::BackendNotLoaded(format!(
            "{} does not support scripts",
            self.name()
        )))
    }

    fn script_free(&self, _script: ScriptHandle) {}

    fn get_version(&self) -> Option<String> {
        None
    }

    fn get_memory_info(&self) -> Option<u64> {
        None
    }

    fn terminate_run_session(&self, _session_id: u64) -> bool {
        false
    }

    fn add_new_device(&self, _device: &str) -> DagResult<()> {
        Err(DagError::BackendNotLoaded(format!(
            "{} cannot add devices",
            self.name()
        )))
    }
}
