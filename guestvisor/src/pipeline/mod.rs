//! Table-driven staged execution.
//!
//! ```text
//! ExecutionPlan → Stages → Tasks
//!
//! - Sequential stage: the first failing task aborts the plan
//! - BestEffort stage: failures are logged and recorded, the stage carries on
//! ```
//!
//! Tasks share a context, cloned per task; use interior mutability for writes.

mod executor;
mod metrics;
mod stage;
mod task;

pub use executor::{ExecutionPlan, PipelineExecutor};
pub use metrics::{PipelineMetrics, StageMetrics, TaskMetrics};
pub use stage::{ExecutionMode, Stage};
pub use task::{BoxedTask, PipelineTask};
