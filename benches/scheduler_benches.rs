//! Benchmarks for the DAG engine's hot paths: batch formation and
//! single-DAG parse-through-reply latency against the mock backend.

use std::collections::VecDeque;
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use dagrunner::backend::mock::MockBackend;
use dagrunner::backend::registry::BackendRegistry;
use dagrunner::backend::{Backend, ModelHandle, ModelMetadata};
use dagrunner::config::DagConfig;
use dagrunner::engine::Engine;
use dagrunner::keyspace::InMemoryKeyspace;
use dagrunner::op::{DagOp, OpKind};
use dagrunner::parser::DagMode;
use dagrunner::run_info::RunInfo;
use dagrunner::tensor::{DType, TensorHandle};

fn make_engine() -> Engine {
    let keyspace = InMemoryKeyspace::new();
    let backends = BackendRegistry::new();
    backends.register(Arc::new(MockBackend));
    keyspace.register_model(
        "double_model",
        ModelMetadata {
            backend: "mock".to_string(),
            device: "CPU".to_string(),
            input_names: vec!["x".to_string()],
            output_names: vec!["y".to_string()],
            batch_size: 8,
            min_batch_size: 0,
            min_batch_timeout_ms: 0,
            handle: ModelHandle(Arc::new(
                MockBackend.model_create("CPU", b"double", b"").unwrap().0,
            )),
        },
    );
    Engine::new(Arc::new(keyspace), Arc::new(backends), DagConfig::default())
}

fn modelrun_dag(batch_size: usize) -> Arc<RunInfo> {
    let mut op = DagOp::new(
        OpKind::ModelRun {
            input_names: vec![Some("x".to_string())],
            output_names: vec![Some("y".to_string())],
            batch_size,
            min_batch_size: 0,
            min_batch_timeout_ms: 0,
        },
        "CPU".to_string(),
        Some("double_model".to_string()),
    );
    op.in_indices = vec![0];
    op.out_indices = vec![1];
    let tensor = TensorHandle::new(DType::FLOAT32, vec![1, 4], vec![0; 16]);
    Arc::new(RunInfo::new(
        vec![Some(tensor), None],
        vec![op],
        Default::default(),
        None,
    ))
}

fn bench_batch_formation(c: &mut Criterion) {
    let mut group = c.benchmark_group("form_batch");
    for &peers in &[0usize, 1, 4, 16] {
        group.throughput(Throughput::Elements(peers as u64 + 1));
        group.bench_function(format!("peers_{peers}"), |b| {
            b.iter(|| {
                let front = modelrun_dag(8);
                let mut items: VecDeque<_> = (0..peers).map(|_| modelrun_dag(8)).collect();
                let batch = dagrunner::scheduler::form_batch(front, &mut items, "CPU");
                black_box(batch.len())
            });
        });
    }
    group.finish();
}

fn bench_single_dag_round_trip(c: &mut Criterion) {
    let engine = make_engine();
    let tokens: Vec<String> = "TENSORSET a FLOAT 1 VALUES 2.0 |> TENSORGET a VALUES"
        .split_whitespace()
        .map(String::from)
        .collect();
    c.bench_function("tensorset_then_tensorget", |b| {
        b.iter(|| black_box(engine.run_dagrun(&tokens, DagMode::ReadWrite)));
    });
}

criterion_group!(benches, bench_batch_formation, bench_single_dag_round_trip);
criterion_main!(benches);
