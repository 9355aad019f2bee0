//! Per-guest FIFO ordering of tasks.
//!
//! Tasks for one guest run one at a time in submission order on a worker
//! spawned on demand. A failed task aborts every task queued behind it at
//! that moment; tasks submitted afterwards run normally. Different guests
//! never wait on each other.
//!
//! An execution leaves the map as soon as its worker finds the queue empty.
//! Admission and eviction both happen under the map lock, so a task is never
//! pushed into an execution whose worker has already exited.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::execution::Execution;
use super::task::BoxedJob;

type Executions = Arc<Mutex<HashMap<String, Arc<Execution>>>>;

#[derive(Default)]
pub struct Serializer {
    executions: Executions,
}

impl Serializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `task` behind every pending task of `guest_id`.
    pub fn serialize(&self, guest_id: &str, task: BoxedJob) {
        let mut executions = self.executions.lock();
        let execution = executions
            .entry(guest_id.to_string())
            .or_insert_with(|| Arc::new(Execution::new(guest_id)));
        if execution.push(task) {
            tokio::spawn(work(Arc::clone(&self.executions), Arc::clone(execution)));
        }
    }

    /// Guests that currently have an execution.
    pub fn len(&self) -> usize {
        self.executions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.executions.lock().is_empty()
    }

    /// Tasks waiting behind the running one for `guest_id`.
    pub fn pending(&self, guest_id: &str) -> usize {
        self.executions
            .lock()
            .get(guest_id)
            .map(|e| e.len())
            .unwrap_or(0)
    }
}

async fn work(executions: Executions, execution: Arc<Execution>) {
    loop {
        let next = {
            let mut map = executions.lock();
            let next = execution.next();
            if next.is_none() {
                let ours = map
                    .get(execution.guest_id())
                    .is_some_and(|e| Arc::ptr_eq(e, &execution));
                if ours {
                    map.remove(execution.guest_id());
                }
            }
            next
        };
        let Some(task) = next else {
            return;
        };

        let op = task.op();
        if task.run().await {
            continue;
        }

        let aborted = execution.drain();
        if !aborted.is_empty() {
            tracing::warn!(
                guest_id = %execution.guest_id(),
                op = %op,
                aborted = aborted.len(),
                "Task failed, aborting queued tasks"
            );
        }
        for task in aborted {
            task.abort();
        }
    }
}
