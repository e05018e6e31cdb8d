//! Pipeline execution: admission, cancellation, planning, and the runner.

pub mod cancel;
pub mod gate;
pub mod plan;
pub mod pool;
pub mod runner;

pub use cancel::{CancelFlag, CancelRegistry};
pub use gate::{AdmissionGate, GateError, Permit};
pub use plan::{transform_plan, TransformStep};
pub use pool::{PoolClosed, RunRequest, WorkerPool};
pub use runner::PipelineRunner;
