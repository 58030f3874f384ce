//! A small in-process backend used by the CLI harness and test suite.
//!
//! Real backends (ONNX Runtime, TorchScript, TensorFlow, ...) live outside
//! this crate and are loaded through `BackendRegistry::load_from_path`.
//! This one exists so the engine is exercisable without any of them: it
//! treats a model's `opts` bytes as the name of a trivial elementwise
//! float32 transform and applies it to its inputs, which is enough to
//! drive the scheduler's batching and multi-output plumbing in tests.

use crate::backend::{Backend, ModelHandle, ModelRunContext, ScriptHandle, ScriptRunContext};
use crate::error::{DagError, DagResult};
use crate::tensor::{DType, TensorHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MockOp {
    Identity,
    Double,
    SumInputs,
}

impl MockOp {
    fn parse(name: &str) -> DagResult<MockOp> {
        match name {
            "identity" => Ok(MockOp::Identity),
            "double" => Ok(MockOp::Double),
            "sum_inputs" => Ok(MockOp::SumInputs),
            other => Err(DagError::BackendRuntime(format!(
                "mock backend: unknown op {other}"
            ))),
        }
    }
}

fn as_f32_vec(t: &TensorHandle) -> Vec<f32> {
    t.data()
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn from_f32_vec(shape: Vec<u64>, values: &[f32]) -> TensorHandle {
    let mut data = Vec::with_capacity(values.len() * 4);
    for v in values {
        data.extend_from_slice(&v.to_le_bytes());
    }
    TensorHandle::new(DType::FLOAT32, shape, data)
}

pub struct MockBackend;

impl Default for MockBackend {
    fn default() -> Self {
        MockBackend
    }
}

impl Backend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn model_create(&self, _device: &str, opts: &[u8], _bytes: &[u8]) -> DagResult<ModelHandle> {
        let op_name = std::str::from_utf8(opts)
            .map_err(|_| DagError::BackendRuntime("mock backend: opts not utf8".into()))?;
        let op = MockOp::parse(op_name)?;
        Ok(ModelHandle(std::sync::Arc::new(op)))
    }

    fn model_run(&self, model: &ModelHandle, ctx: &mut ModelRunContext) -> DagResult<()> {
        let op = model
            .0
            .downcast_ref::<MockOp>()
            .ok_or_else(|| DagError::BackendRuntime("mock backend: bad model handle".into()))?;
        if ctx.inputs.is_empty() {
            return Err(DagError::BackendRuntime("mock backend: no inputs".into()));
        }
        let out = match op {
            MockOp::Identity => ctx.inputs[0].clone(),
            MockOp::Double => {
                let values: Vec<f32> = as_f32_vec(&ctx.inputs[0]).iter().map(|v| v * 2.0).collect();
                from_f32_vec(ctx.inputs[0].shape().to_vec(), &values)
            }
            MockOp::SumInputs => {
                let mut acc = as_f32_vec(&ctx.inputs[0]);
                for other in &ctx.inputs[1..] {
                    let vals = as_f32_vec(other);
                    for (a, b) in acc.iter_mut().zip(vals.iter()) {
                        *a += b;
                    }
                }
                from_f32_vec(ctx.inputs[0].shape().to_vec(), &acc)
            }
        };
        ctx.results = (0..ctx.output_count).map(|_| out.clone()).collect();
        Ok(())
    }

    fn model_serialize(&self, model: &ModelHandle) -> DagResult<Vec<u8>> {
        let op = model
            .0
            .downcast_ref::<MockOp>()
            .ok_or_else(|| DagError::BackendRuntime("mock backend: bad model handle".into()))?;
        let name = match op {
            MockOp::Identity => "identity",
            MockOp::Double => "double",
            MockOp::SumInputs => "sum_inputs",
        };
        Ok(name.as_bytes().to_vec())
    }

    fn script_create(&self, _device: &str, bytes: &[u8]) -> DagResult<ScriptHandle> {
        Ok(ScriptHandle(std::sync::Arc::new(bytes.to_vec())))
    }

    fn script_run(&self, _script: &ScriptHandle, ctx: &mut ScriptRunContext) -> DagResult<()> {
        if ctx.inputs.is_empty() {
            return Err(DagError::BackendRuntime("mock backend: no inputs".into()));
        }
        let out = ctx.inputs[0].clone();
        ctx.results = (0..ctx.output_count).map(|_| out.clone()).collect();
        Ok(())
    }

    fn get_version(&self) -> Option<String> {
        Some("mock-1.0".to_string())
    }
}
