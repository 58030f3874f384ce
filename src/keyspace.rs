//! Keyspace: tensor/model/script storage the engine reads from and writes
//! back to.
//!
//! The engine never assumes a particular storage backend. This module
//! defines the trait the scheduler and reply assembler call against, plus
//! an in-memory implementation used by the CLI harness and tests.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::backend::{ModelMetadata, ScriptMetadata};
use crate::error::{DagError, DagResult};
use crate::tensor::TensorHandle;

/// Storage the engine reads tensors/model metadata from and writes
/// PERSIST'd tensors and replication notices back to.
pub trait Keyspace: Send + Sync {
    fn get_tensor(&self, key: &str) -> DagResult<TensorHandle>;
    fn set_tensor(&self, key: &str, tensor: TensorHandle) -> DagResult<()>;

    fn get_model_metadata(&self, key: &str) -> DagResult<ModelMetadata>;
    fn get_script_metadata(&self, key: &str) -> DagResult<ScriptMetadata>;

    /// Notify the keyspace that `key` was written by a DAG so it can
    /// propagate the write (e.g. to replicas or an AOF), independent of the
    /// reply sent to the client.
    fn replicate_write(&self, _key: &str) {}
}

/// Plain in-process keyspace, backed by a couple of `RwLock<HashMap>`s.
/// Used by the CLI harness and the test suite; a real deployment would
/// implement `Keyspace` against its own storage engine instead.
#[derive(Default)]
pub struct InMemoryKeyspace {
    tensors: RwLock<HashMap<String, TensorHandle>>,
    models: RwLock<HashMap<String, ModelMetadata>>,
    scripts: RwLock<HashMap<String, ScriptMetadata>>,
}

impl InMemoryKeyspace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_model(&self, key: impl Into<String>, meta: ModelMetadata) {
        self.models.write().insert(key.into(), meta);
    }

    pub fn register_script(&self, key: impl Into<String>, meta: ScriptMetadata) {
        self.scripts.write().insert(key.into(), meta);
    }
}

impl Keyspace for InMemoryKeyspace {
    fn get_tensor(&self, key: &str) -> DagResult<TensorHandle> {
        self.tensors
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| DagError::TypeMismatch(format!("no such tensor key: {key}")))
    }

    fn set_tensor(&self, key: &str, tensor: TensorHandle) -> DagResult<()> {
        self.tensors.write().insert(key.to_string(), tensor);
        Ok(())
    }

    fn get_model_metadata(&self, key: &str) -> DagResult<ModelMetadata> {
        self.models
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| DagError::UnknownModelOrScript(key.to_string()))
    }

    fn get_script_metadata(&self, key: &str) -> DagResult<ScriptMetadata> {
        self.scripts
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| DagError::UnknownModelOrScript(key.to_string()))
    }
}

pub type SharedKeyspace = Arc<dyn Keyspace>;
