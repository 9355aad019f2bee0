use std::time::Instant;

use guestvisor_shared::GuestvisorResult;

use super::metrics::{PipelineMetrics, StageMetrics, TaskMetrics};
use super::stage::{ExecutionMode, Stage};
use super::task::BoxedTask;

pub struct ExecutionPlan<Ctx> {
    stages: Vec<Stage<BoxedTask<Ctx>>>,
}

impl<Ctx> ExecutionPlan<Ctx> {
    pub fn new(stages: Vec<Stage<BoxedTask<Ctx>>>) -> Self {
        Self { stages }
    }

    pub fn stages(self) -> Vec<Stage<BoxedTask<Ctx>>> {
        self.stages
    }
}

pub struct PipelineExecutor;

impl PipelineExecutor {
    /// Run every stage in order, collecting timings.
    ///
    /// Returns the first error of a sequential stage. Best-effort failures
    /// only show up in the metrics.
    pub async fn execute<Ctx>(plan: ExecutionPlan<Ctx>, ctx: Ctx) -> GuestvisorResult<PipelineMetrics>
    where
        Ctx: Clone,
    {
        let total_start = Instant::now();
        let mut stage_metrics = Vec::new();

        for (index, stage) in plan.stages().into_iter().enumerate() {
            let mode = stage.mode;
            let stage_start = Instant::now();
            let mut task_metrics = Vec::with_capacity(stage.tasks.len());

            for task in stage.tasks {
                let name = task.name().to_string();
                let task_start = Instant::now();
                let result = task.run(ctx.clone()).await;

                let error = match (result, mode) {
                    (Ok(()), _) => None,
                    (Err(e), ExecutionMode::Sequential) => return Err(e),
                    (Err(e), ExecutionMode::BestEffort) => Some(e.to_string()),
                };
                task_metrics.push(TaskMetrics {
                    name,
                    elapsed: task_start.elapsed(),
                    error,
                });
            }

            stage_metrics.push(StageMetrics {
                index,
                mode,
                elapsed: stage_start.elapsed(),
                tasks: task_metrics,
            });
        }

        Ok(PipelineMetrics {
            elapsed: total_start.elapsed(),
            stages: stage_metrics,
        })
    }
}
