//! dagrunner — an in-process DAG execution engine for cross-device tensor
//! computation graphs.
//!
//! Clients submit a `DAGRUN`/`DAGRUN_RO` command: a DAG whose nodes are
//! tensor set/get operations and calls into externally-provided model or
//! script backends. This crate parses that command into a dependency-
//! checked op sequence, schedules the ops onto per-device worker queues,
//! opportunistically batches compatible model-run ops across independent
//! DAGs, and assembles one correctly ordered reply per DAG.
//!
//! # Layout
//!
//! - [`tensor`] — the opaque, reference-counted tensor handle (C1).
//! - [`op`] — one DAG node: kind, slot indices, target device, result (C2).
//! - [`run_info`] — the shared, per-DAG execution record (C3).
//! - [`parser`] — wire-format command parsing and alpha-conversion (C4).
//! - [`queue`] — per-device FIFOs and their worker thread pools (C5).
//! - [`scheduler`] — batch formation and the worker step loop (C6).
//! - [`reply`] — wire reply assembly and tensor persistence (C7).
//! - [`backend`] — the pluggable model/script runtime interface.
//! - [`keyspace`] — the host tensor/model/script storage interface.
//! - [`engine`] — the facade tying C4–C7 and the registries together.
//! - [`config`], [`error`], [`stats`] — ambient configuration, error
//!   taxonomy, and the per-model runtime stats registry.
//!
//! # Example
//!
//! ```
//! use dagrunner::backend::mock::MockBackend;
//! use dagrunner::backend::registry::BackendRegistry;
//! use dagrunner::backend::{Backend, ModelHandle, ModelMetadata};
//! use dagrunner::config::DagConfig;
//! use dagrunner::engine::Engine;
//! use dagrunner::keyspace::InMemoryKeyspace;
//! use dagrunner::parser::DagMode;
//! use std::sync::Arc;
//!
//! let keyspace = InMemoryKeyspace::new();
//! let backends = BackendRegistry::new();
//! backends.register(Arc::new(MockBackend));
//! keyspace.register_model(
//!     "double_model",
//!     ModelMetadata {
//!         backend: "mock".to_string(),
//!         device: "CPU".to_string(),
//!         input_names: vec!["x".to_string()],
//!         output_names: vec!["y".to_string()],
//!         batch_size: 0,
//!         min_batch_size: 0,
//!         min_batch_timeout_ms: 0,
//!         handle: ModelHandle(Arc::new(
//!             MockBackend.model_create("CPU", b"double", b"").unwrap().0,
//!         )),
//!     },
//! );
//!
//! let engine = Engine::new(Arc::new(keyspace), Arc::new(backends), DagConfig::default());
//! let tokens: Vec<String> = "TENSORSET a FLOAT 1 VALUES 2.0 |> TENSORGET a VALUES"
//!     .split_whitespace()
//!     .map(String::from)
//!     .collect();
//! let reply = engine.run_dagrun(&tokens, DagMode::ReadWrite);
//! # let _ = reply;
//! ```

#![warn(clippy::all)]

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod keyspace;
pub mod op;
pub mod parser;
pub mod queue;
pub mod reply;
pub mod run_info;
pub mod scheduler;
pub mod stats;
pub mod tensor;

pub use backend::{Backend, ModelHandle, ModelMetadata, ScriptHandle, ScriptMetadata};
pub use config::DagConfig;
pub use engine::Engine;
pub use error::{DagError, DagResult};
pub use keyspace::{InMemoryKeyspace, Keyspace, SharedKeyspace};
pub use op::{DagOp, OpKind, OpResult, ReplyFormat};
pub use parser::DagMode;
pub use reply::WireReply;
pub use run_info::RunInfo;
pub use stats::StatsRegistry;
pub use tensor::{DType, DTypeKind, TensorHandle, Width};

/// Library version, read from `Cargo.toml` at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
