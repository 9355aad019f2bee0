//! Units of work queued per guest.

use std::fmt;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::oneshot;

use guestvisor_shared::{GuestvisorError, GuestvisorResult};

use crate::context::CallContext;

/// Kind of operation a task performs; also the action of its lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Destroy,
    Shutdown,
    Boot,
    Create,
    Resize,
    Misc,
    CreateSnapshot,
    CommitSnapshot,
    RestoreSnapshot,
}

impl Op {
    pub fn as_str(self) -> &'static str {
        match self {
            Op::Destroy => "destroy",
            Op::Shutdown => "shutdown",
            Op::Boot => "boot",
            Op::Create => "create",
            Op::Resize => "resize",
            Op::Misc => "misc",
            Op::CreateSnapshot => "create-snapshot",
            Op::CommitSnapshot => "commit-snapshot",
            Op::RestoreSnapshot => "restore-snapshot",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A queued task with its result type erased.
///
/// Each job finishes exactly once: either [`Job::run`] or [`Job::abort`]
/// consumes it.
#[async_trait]
pub trait Job: Send {
    fn op(&self) -> Op;

    /// Run the work and deliver its result. Returns whether it succeeded.
    async fn run(self: Box<Self>) -> bool;

    /// Deliver the aborted error without running the work.
    fn abort(self: Box<Self>);
}

pub type BoxedJob = Box<dyn Job>;

/// Receives the outcome of a [`Task`].
pub type TaskReceiver<T> = oneshot::Receiver<GuestvisorResult<T>>;

pub struct Task<T> {
    guest_id: String,
    op: Op,
    ctx: CallContext,
    work: BoxFuture<'static, GuestvisorResult<T>>,
    done: oneshot::Sender<GuestvisorResult<T>>,
}

impl<T: Send + 'static> Task<T> {
    pub fn new(
        guest_id: impl Into<String>,
        op: Op,
        ctx: CallContext,
        work: BoxFuture<'static, GuestvisorResult<T>>,
    ) -> (Self, TaskReceiver<T>) {
        let (done, rx) = oneshot::channel();
        let task = Self {
            guest_id: guest_id.into(),
            op,
            ctx,
            work,
            done,
        };
        (task, rx)
    }

    fn deliver(done: oneshot::Sender<GuestvisorResult<T>>, guest_id: &str, op: Op, result: GuestvisorResult<T>) {
        if let Err(Err(e)) = done.send(result) {
            tracing::warn!(guest_id, op = %op, error = %e, "Task failed after its caller left");
        }
    }
}

#[async_trait]
impl<T: Send + 'static> Job for Task<T> {
    fn op(&self) -> Op {
        self.op
    }

    async fn run(self: Box<Self>) -> bool {
        let Task {
            guest_id,
            op,
            ctx,
            work,
            done,
        } = *self;

        // A caller that already gave up does not get its work started.
        if ctx.is_done() {
            Self::deliver(done, &guest_id, op, Err(GuestvisorError::Cancelled));
            return false;
        }

        tracing::debug!(guest_id = %guest_id, op = %op, "Running task");
        let result = match AssertUnwindSafe(work).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(GuestvisorError::Internal(format!("{} task panicked", op))),
        };
        let ok = result.is_ok();
        Self::deliver(done, &guest_id, op, result);
        ok
    }

    fn abort(self: Box<Self>) {
        tracing::debug!(guest_id = %self.guest_id, op = %self.op, "Aborting queued task");
        let _ = self.done.send(Err(GuestvisorError::SerializedTaskAborted));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn explode(msg: &'static str) -> BoxFuture<'static, GuestvisorResult<()>> {
        Box::pin(futures::future::lazy(move |_| -> GuestvisorResult<()> {
            panic!("{}", msg)
        }))
    }

    #[tokio::test]
    async fn test_run_delivers_result() {
        let work: BoxFuture<'static, GuestvisorResult<u32>> = Box::pin(async { Ok(7) });
        let (task, rx) = Task::new("g1", Op::Misc, CallContext::background(), work);
        assert!(Box::new(task).run().await);
        assert_eq!(rx.await.unwrap().unwrap(), 7);
    }

    #[tokio::test]
    async fn test_abort_never_runs_work() {
        let (task, rx) = Task::new("g1", Op::Misc, CallContext::background(), explode("must not run"));
        Box::new(task).abort();
        assert!(rx.await.unwrap().unwrap_err().is_aborted());
    }

    #[tokio::test]
    async fn test_cancelled_caller_skips_work() {
        let ctx = CallContext::background();
        ctx.cancel();
        let (task, rx) = Task::new("g1", Op::Boot, ctx, explode("must not run"));
        assert!(!Box::new(task).run().await);
        assert!(matches!(rx.await.unwrap(), Err(GuestvisorError::Cancelled)));
    }

    #[tokio::test]
    async fn test_panic_becomes_failure() {
        let (task, rx) = Task::new("g1", Op::Resize, CallContext::background(), explode("boom"));
        assert!(!Box::new(task).run().await);
        assert!(matches!(rx.await.unwrap(), Err(GuestvisorError::Internal(_))));
    }

    #[test]
    fn test_op_names() {
        assert_eq!(Op::CreateSnapshot.to_string(), "create-snapshot");
        assert_eq!(Op::Shutdown.as_str(), "shutdown");
    }
}
