use std::time::Duration;

use super::ExecutionMode;

/// Outcome of one task.
#[derive(Debug, Clone)]
pub struct TaskMetrics {
    pub name: String,
    pub elapsed: Duration,
    /// Set when a best-effort task failed.
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StageMetrics {
    pub index: usize,
    pub mode: ExecutionMode,
    pub elapsed: Duration,
    pub tasks: Vec<TaskMetrics>,
}

/// Timings of a completed plan. A plan aborted by a sequential stage
/// produces no metrics.
#[derive(Debug, Clone, Default)]
pub struct PipelineMetrics {
    pub elapsed: Duration,
    pub stages: Vec<StageMetrics>,
}

impl PipelineMetrics {
    fn tasks(&self) -> impl Iterator<Item = &TaskMetrics> {
        self.stages.iter().flat_map(|stage| stage.tasks.iter())
    }

    pub fn task_elapsed(&self, name: &str) -> Option<Duration> {
        self.tasks().find(|task| task.name == name).map(|task| task.elapsed)
    }

    pub fn task_error(&self, name: &str) -> Option<&str> {
        self.tasks()
            .find(|task| task.name == name)
            .and_then(|task| task.error.as_deref())
    }

    /// Names of tolerated failures, in execution order.
    pub fn failed_tasks(&self) -> Vec<&str> {
        self.tasks()
            .filter(|task| task.error.is_some())
            .map(|task| task.name.as_str())
            .collect()
    }
}
