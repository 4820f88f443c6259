pub mod app;
pub mod billing;
pub mod config;
pub mod context;
pub mod engine;
pub mod metrics_server;
pub mod observability;
pub mod pipeline;
pub mod remote;
pub mod sources;
pub mod store;
pub mod sync;
pub mod validation;

pub use context::ExecutionContext;
pub use engine::{EngineError, MeterEngine};
pub use pipeline::{BatchPipeline, Envelope, PipelineError};
pub use sync::{SyncCoordinator, SyncOutcome};
