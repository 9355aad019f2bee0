/// What a failing task does to the rest of the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// The first error aborts the plan.
    Sequential,
    /// Errors are logged and recorded; remaining tasks still run.
    BestEffort,
}

/// Tasks run one after another under a shared failure policy.
#[derive(Debug, Clone)]
pub struct Stage<T> {
    pub tasks: Vec<T>,
    pub mode: ExecutionMode,
}

impl<T> Stage<T> {
    fn with_mode(tasks: Vec<T>, mode: ExecutionMode) -> Self {
        Self { tasks, mode }
    }

    pub fn sequential(tasks: Vec<T>) -> Self {
        Self::with_mode(tasks, ExecutionMode::Sequential)
    }

    pub fn best_effort(tasks: Vec<T>) -> Self {
        Self::with_mode(tasks, ExecutionMode::BestEffort)
    }
}
