//! Guest control plane.
//!
//! Every mutating call goes through [`Manager::ctrl`]: the guest is reloaded
//! from the store when its turn comes, the operation runs as a task on the
//! guest's serializer queue, and the caller waits for whichever comes first
//! of the task finishing, its context ending, or `virt_timeout`. A caller
//! that stops waiting does not stop the task; its late result is logged.
//! Successful operations are published to every watcher.

mod create;
mod execution;
mod serializer;
mod task;
mod watcher;

use std::future::Future;
use std::sync::Arc;

use tokio::time::Instant;

use guestvisor_shared::constants::{GUEST_EVENT_TYPE, keys};
use guestvisor_shared::{Event, GuestvisorError, GuestvisorResult, ResultExt};

use crate::bot::{ExecOutput, Rollback, Snapshot};
use crate::context::CallContext;
use crate::guest::{DestroyReceiver, ResizeRequest, VirtGuest};
use crate::models::{ExtraNetwork, Status, Volume};
use crate::runtime::SharedRuntime;

pub use create::CreateOptions;
pub use serializer::Serializer;
pub use task::Op;
pub use watcher::{Watcher, Watchers};

use task::Task;

pub struct Manager {
    rt: SharedRuntime,
    serializer: Serializer,
    watchers: Watchers,
}

impl Manager {
    pub fn new(rt: SharedRuntime) -> Self {
        Self {
            rt,
            serializer: Serializer::new(),
            watchers: Watchers::new(),
        }
    }

    pub fn runtime(&self) -> &SharedRuntime {
        &self.rt
    }

    /// Read a guest straight from the store, bypassing the queue.
    pub fn load(&self, id: &str) -> GuestvisorResult<VirtGuest> {
        VirtGuest::load(Arc::clone(&self.rt), id)
    }

    pub async fn load_uuid(&self, id: &str) -> GuestvisorResult<String> {
        self.load(id)?.uuid().await
    }

    /// IDs of every guest recorded for this host.
    pub fn list_local_ids(&self) -> GuestvisorResult<Vec<String>> {
        let prefix = keys::host_guests_prefix(&self.rt.config.host_name);
        let entries = self.rt.store.get_prefix(&prefix)?;
        Ok(entries
            .into_iter()
            .filter_map(|kv| kv.key.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }

    pub fn new_watcher(&self) -> Watcher {
        self.watchers.watch()
    }

    pub fn stop_watchers(&self) {
        self.watchers.stop();
    }

    pub async fn start(&self, ctx: &CallContext, id: &str) -> GuestvisorResult<()> {
        self.ctrl(ctx, id, Op::Boot, None, |mut vg, ctx| async move {
            vg.start(&ctx).await?;
            vg.run_lambda().await
        })
        .await
    }

    pub async fn stop(&self, ctx: &CallContext, id: &str, force: bool) -> GuestvisorResult<()> {
        self.ctrl(ctx, id, Op::Shutdown, None, move |mut vg, _| async move {
            vg.stop(force).await
        })
        .await
    }

    pub async fn suspend(&self, ctx: &CallContext, id: &str) -> GuestvisorResult<()> {
        self.ctrl(ctx, id, Op::Boot, None, |mut vg, _| async move { vg.suspend().await })
            .await
    }

    pub async fn resume(&self, ctx: &CallContext, id: &str) -> GuestvisorResult<()> {
        self.ctrl(ctx, id, Op::Boot, None, |mut vg, _| async move { vg.resume().await })
            .await
    }

    /// Returns once the guest is durably `destroying`; the receiver reports
    /// the teardown.
    pub async fn destroy(&self, ctx: &CallContext, id: &str, force: bool) -> GuestvisorResult<DestroyReceiver> {
        self.ctrl(ctx, id, Op::Destroy, None, move |vg, _| vg.destroy(force))
            .await
    }

    pub async fn resize(&self, ctx: &CallContext, id: &str, req: ResizeRequest) -> GuestvisorResult<()> {
        self.ctrl(ctx, id, Op::Resize, None, |mut vg, _| async move {
            vg.resize(&req).await
        })
        .await
    }

    pub async fn capture(&self, ctx: &CallContext, id: &str, name: &str) -> GuestvisorResult<String> {
        let name = name.to_string();
        self.ctrl(ctx, id, Op::Misc, None, |mut vg, _| async move {
            vg.capture(&name).await
        })
        .await
    }

    pub async fn migrate(&self, ctx: &CallContext, id: &str) -> GuestvisorResult<()> {
        self.ctrl(ctx, id, Op::Misc, None, |mut vg, _| async move { vg.migrate().await })
            .await
    }

    /// Wait for the guest to stop, returning the lambda output and exit code
    /// when it has one.
    ///
    /// Waiting polls outside the guest's queue so it never holds up other
    /// operations.
    pub async fn wait(&self, ctx: &CallContext, id: &str, block: bool) -> GuestvisorResult<(Vec<u8>, i32)> {
        let mut vg = self.load(id)?;
        let waited = tokio::select! {
            result = vg.wait(Status::Stopped, block) => result,
            _ = ctx.done() => Err(GuestvisorError::Cancelled),
        };
        waited.with_context(|| format!("wait {}", id))?;

        Ok(vg
            .meta()
            .lambda
            .as_ref()
            .map(|l| (l.output.clone(), l.exit_code))
            .unwrap_or_default())
    }

    pub async fn execute_command(&self, ctx: &CallContext, id: &str, cmd: Vec<String>) -> GuestvisorResult<ExecOutput> {
        self.ctrl(ctx, id, Op::Misc, None, |vg, _| async move {
            vg.execute_command(&cmd).await
        })
        .await
    }

    pub async fn cat(&self, ctx: &CallContext, id: &str, path: &str) -> GuestvisorResult<Vec<u8>> {
        let path = path.to_string();
        self.ctrl(ctx, id, Op::Misc, None, |vg, _| async move { vg.cat(&path).await })
            .await
    }

    pub async fn log(&self, ctx: &CallContext, id: &str, path: &str, n: usize) -> GuestvisorResult<Vec<u8>> {
        let path = path.to_string();
        self.ctrl(ctx, id, Op::Misc, None, move |vg, _| async move {
            vg.log(&path, n).await
        })
        .await
    }

    pub async fn copy_to_guest(
        &self,
        ctx: &CallContext,
        id: &str,
        dest: &str,
        content: Vec<u8>,
        overwrite: bool,
    ) -> GuestvisorResult<()> {
        let dest = dest.to_string();
        self.ctrl(ctx, id, Op::Misc, None, move |vg, _| async move {
            vg.copy_to_guest(&dest, &content, overwrite).await
        })
        .await
    }

    /// Join an extra network, returning the guest's address on it.
    pub async fn connect_extra_network(
        &self,
        ctx: &CallContext,
        id: &str,
        network: ExtraNetwork,
    ) -> GuestvisorResult<String> {
        self.ctrl(ctx, id, Op::Misc, None, |mut vg, _| async move {
            vg.connect_extra_network(network).await
        })
        .await
    }

    pub async fn disconnect_extra_network(&self, ctx: &CallContext, id: &str, name: &str) -> GuestvisorResult<()> {
        let name = name.to_string();
        self.ctrl(ctx, id, Op::Misc, None, |mut vg, _| async move {
            vg.disconnect_extra_network(&name).await
        })
        .await
    }

    pub async fn fs_freeze_all(&self, ctx: &CallContext, id: &str) -> GuestvisorResult<u32> {
        self.ctrl(ctx, id, Op::Misc, None, |vg, _| async move { vg.fs_freeze_all().await })
            .await
    }

    pub async fn fs_thaw_all(&self, ctx: &CallContext, id: &str) -> GuestvisorResult<u32> {
        self.ctrl(ctx, id, Op::Misc, None, |vg, _| async move { vg.fs_thaw_all().await })
            .await
    }

    pub async fn fs_freeze_status(&self, ctx: &CallContext, id: &str) -> GuestvisorResult<String> {
        self.ctrl(ctx, id, Op::Misc, None, |vg, _| async move {
            vg.fs_freeze_status().await
        })
        .await
    }

    pub async fn check_volume(&self, ctx: &CallContext, id: &str, vol_id: &str) -> GuestvisorResult<()> {
        let vol_id = vol_id.to_string();
        self.ctrl(ctx, id, Op::Misc, None, |vg, _| async move {
            vg.check_volume(&vol_id).await
        })
        .await
    }

    pub async fn repair_volume(&self, ctx: &CallContext, id: &str, vol_id: &str) -> GuestvisorResult<()> {
        let vol_id = vol_id.to_string();
        self.ctrl(ctx, id, Op::Misc, None, |vg, _| async move {
            vg.repair_volume(&vol_id).await
        })
        .await
    }

    pub async fn list_snapshots(
        &self,
        id: &str,
        vol_id: Option<&str>,
    ) -> GuestvisorResult<Vec<(Volume, Vec<Snapshot>)>> {
        self.load(id)?.list_snapshots(vol_id).await
    }

    pub async fn create_snapshot(&self, ctx: &CallContext, id: &str, vol_id: &str) -> GuestvisorResult<()> {
        let vol_id = vol_id.to_string();
        self.ctrl(ctx, id, Op::CreateSnapshot, None, |mut vg, ctx| async move {
            vg.snapshot(&vol_id, &ctx).await
        })
        .await
    }

    pub async fn commit_snapshot(
        &self,
        ctx: &CallContext,
        id: &str,
        vol_id: &str,
        snap_id: &str,
    ) -> GuestvisorResult<()> {
        let (vol_id, snap_id) = (vol_id.to_string(), snap_id.to_string());
        self.ctrl(ctx, id, Op::CommitSnapshot, None, |mut vg, ctx| async move {
            vg.commit(&vol_id, &snap_id, &ctx).await
        })
        .await
    }

    pub async fn commit_snapshot_by_day(
        &self,
        ctx: &CallContext,
        id: &str,
        vol_id: &str,
        day: u32,
    ) -> GuestvisorResult<()> {
        let vol_id = vol_id.to_string();
        self.ctrl(ctx, id, Op::CommitSnapshot, None, move |mut vg, ctx| async move {
            vg.commit_by_day(&vol_id, day, &ctx).await
        })
        .await
    }

    pub async fn restore_snapshot(
        &self,
        ctx: &CallContext,
        id: &str,
        vol_id: &str,
        snap_id: &str,
    ) -> GuestvisorResult<()> {
        let (vol_id, snap_id) = (vol_id.to_string(), snap_id.to_string());
        self.ctrl(ctx, id, Op::RestoreSnapshot, None, |mut vg, ctx| async move {
            vg.restore(&vol_id, &snap_id, &ctx).await
        })
        .await
    }

    /// Bring every local guest in line with its stored status. Returns the
    /// guests that could not be reconciled.
    pub async fn reconcile_all(&self, ctx: &CallContext) -> GuestvisorResult<Vec<(String, GuestvisorError)>> {
        let ids = self.list_local_ids()?;
        tracing::info!(guests = ids.len(), "Reconciling local guests");

        let mut failed = Vec::new();
        for id in ids {
            let result = self
                .ctrl(ctx, &id, Op::Misc, None, |mut vg, ctx| async move {
                    vg.sync_state(&ctx).await
                })
                .await;
            if let Err(e) = result {
                tracing::error!(guest_id = %id, error = %e, "Failed to reconcile guest");
                failed.push((id, e));
            }
        }

        match self.orphan_domains().await {
            Ok(orphans) => {
                for domain in orphans {
                    tracing::warn!(domain = %domain, "Domain has no guest record");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to list domains"),
        }
        Ok(failed)
    }

    /// Domains defined on this host that no local guest record owns.
    pub async fn orphan_domains(&self) -> GuestvisorResult<Vec<String>> {
        let known = self.list_local_ids()?;
        let domains = self.rt.bots.list_domains().await?;
        Ok(domains.into_iter().filter(|d| !known.contains(d)).collect())
    }

    /// Load the guest inside a serialized task and run `f` on it.
    async fn ctrl<T, F, Fut>(
        &self,
        ctx: &CallContext,
        id: &str,
        op: Op,
        rollback: Option<Rollback>,
        f: F,
    ) -> GuestvisorResult<T>
    where
        T: Send + 'static,
        F: FnOnce(VirtGuest, CallContext) -> Fut + Send + 'static,
        Fut: Future<Output = GuestvisorResult<T>> + Send + 'static,
    {
        let rt = Arc::clone(&self.rt);
        let guest_id = id.to_string();
        self.run(ctx, id, op, rollback, move |task_ctx| async move {
            let vg = VirtGuest::load(rt, &guest_id)?;
            f(vg, task_ctx).await
        })
        .await
    }

    /// Queue `work` for `id` and wait for it, the caller's context, or
    /// `virt_timeout`, whichever ends first. `rollback` runs on any failure.
    async fn run<T, F, Fut>(
        &self,
        ctx: &CallContext,
        id: &str,
        op: Op,
        rollback: Option<Rollback>,
        work: F,
    ) -> GuestvisorResult<T>
    where
        T: Send + 'static,
        F: FnOnce(CallContext) -> Fut,
        Fut: Future<Output = GuestvisorResult<T>> + Send + 'static,
    {
        let timeout = self.rt.config.virt_timeout;
        let task_ctx = ctx.child_with_timeout(timeout);
        let (task, done) = Task::new(id, op, task_ctx.clone(), Box::pin(work(task_ctx)));
        self.serializer.serialize(id, Box::new(task));

        let started = Instant::now();
        let result = tokio::select! {
            result = done => result.unwrap_or_else(|_| {
                Err(GuestvisorError::Internal("task dropped without a result".into()))
            }),
            _ = ctx.done() => Err(if ctx.is_cancelled() {
                GuestvisorError::Cancelled
            } else {
                GuestvisorError::Timeout(started.elapsed())
            }),
            _ = tokio::time::sleep(timeout) => Err(GuestvisorError::Timeout(timeout)),
        };

        match result {
            Ok(value) => {
                tracing::info!(guest_id = %id, op = %op, "Operation done");
                self.watchers
                    .publish(&Event::new(id, GUEST_EVENT_TYPE, op.as_str()));
                Ok(value)
            }
            Err(e) => {
                tracing::warn!(guest_id = %id, op = %op, error = %e, "Operation failed");
                if let Some(rollback) = rollback {
                    rollback.await;
                }
                Err(e.context(format!("{} {}", op, id)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::bot::DomainState;
    use crate::bot::mock::Call;
    use crate::guest::testing::{Harness, test_config};
    use crate::models::LambdaOptions;

    fn manager(h: &Harness) -> Manager {
        Manager::new(h.rt.clone())
    }

    #[tokio::test]
    async fn test_start_publishes_event() {
        let h = Harness::new();
        let m = manager(&h);
        let mut watcher = m.new_watcher();
        let id = h.guest(Status::Stopped).id;

        m.start(&CallContext::background(), &id).await.unwrap();

        let event = watcher.recv().await.unwrap();
        assert_eq!(event.id, id);
        assert_eq!(event.kind, "guest");
        assert_eq!(event.action, "boot");
        assert_eq!(h.stored(&id).status, Some(Status::Running));
    }

    #[tokio::test]
    async fn test_failure_publishes_nothing() {
        let h = Harness::new();
        let m = manager(&h);
        let mut watcher = m.new_watcher();
        let id = h.guest(Status::Running).id;

        let err = m.start(&CallContext::background(), &id).await.unwrap_err();
        assert!(err.is_forward_status());
        assert!(err.to_string().starts_with(&format!("boot {}", id)));
        assert!(watcher.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_queued_operations_see_fresh_records() {
        let h = Harness::new();
        let m = manager(&h);
        let id = h.guest(Status::Running).id;
        let ctx = CallContext::background();

        let (stopped, started) = tokio::join!(m.stop(&ctx, &id, false), m.start(&ctx, &id));
        stopped.unwrap();
        started.unwrap();
        assert_eq!(h.stored(&id).status, Some(Status::Running));
    }

    #[tokio::test]
    async fn test_failed_operation_aborts_queued_ones() {
        let h = Harness::new();
        let m = manager(&h);
        let id = h.guest(Status::Running).id;
        let ctx = CallContext::background();
        h.bots.fail("suspend");

        let (suspended, resumed) = tokio::join!(m.suspend(&ctx, &id), m.resume(&ctx, &id));
        assert!(!suspended.unwrap_err().is_aborted());
        assert!(resumed.unwrap_err().is_aborted());
        assert_eq!(h.bots.count(&id, "resume"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_runs_rollback_and_releases_caller() {
        let h = Harness::new();
        let m = manager(&h);
        let id = h.guest(Status::Running).id;
        h.bots.delay("suspend", Duration::from_secs(3600));

        let rolled_back = Arc::new(parking_lot::Mutex::new(false));
        let flag = Arc::clone(&rolled_back);
        let rollback: Rollback = Box::pin(async move {
            *flag.lock() = true;
        });

        let err = m
            .ctrl(&CallContext::background(), &id, Op::Boot, Some(rollback), |mut vg, _| async move {
                vg.suspend().await
            })
            .await
            .unwrap_err();

        assert!(matches!(err.root(), GuestvisorError::Timeout(_)));
        assert!(*rolled_back.lock());
    }

    #[tokio::test]
    async fn test_cancelled_caller_is_released() {
        let h = Harness::new();
        let m = manager(&h);
        let id = h.guest(Status::Running).id;
        h.bots.delay("suspend", Duration::from_millis(200));

        let ctx = CallContext::background();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let err = m.suspend(&ctx, &id).await.unwrap_err();
        assert!(matches!(err.root(), GuestvisorError::Cancelled));

        // The in-flight suspend still completes.
        m.resume(&CallContext::background(), &id).await.unwrap();
        assert_eq!(h.bots.count(&id, "suspend"), 1);
    }

    #[tokio::test]
    async fn test_destroy_returns_teardown_channel() {
        let h = Harness::new();
        let m = manager(&h);
        let id = h.guest(Status::Running).id;

        let done = m.destroy(&CallContext::background(), &id, false).await.unwrap();
        done.await.unwrap().unwrap();
        assert!(h.store.is_empty());
        assert!(m.list_local_ids().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lambda_start_and_wait() {
        let h = Harness::new();
        let m = manager(&h);
        let mut guest = h.guest(Status::Stopped);
        guest.lambda = Some(LambdaOptions {
            cmd: vec!["run".into(), "job".into()],
            ..LambdaOptions::default()
        });
        guest.save(h.store.as_ref()).unwrap();
        let ctx = CallContext::background();

        m.start(&ctx, &guest.id).await.unwrap();
        m.stop(&ctx, &guest.id, false).await.unwrap();

        let (output, code) = m.wait(&ctx, &guest.id, false).await.unwrap();
        assert_eq!(output, b"run job");
        assert_eq!(code, 0);
        assert_eq!(m.log(&ctx, &guest.id, "/any", 5).await.unwrap(), b"run job");
    }

    #[tokio::test]
    async fn test_exec_and_resize_through_manager() {
        let h = Harness::new();
        let m = manager(&h);
        let id = h.guest(Status::Running).id;
        let ctx = CallContext::background();

        let out = m
            .execute_command(&ctx, &id, vec!["hostname".into()])
            .await
            .unwrap();
        assert_eq!(out.output, b"hostname");

        let req = ResizeRequest::default().with_volume("/data=4G").unwrap();
        m.resize(&ctx, &id, req).await.unwrap();
        assert!(h.bots.effects(&id).contains(&Call::AmplifyVolume {
            mount_dir: "/data".into(),
            delta: 2 << 30
        }));
    }

    #[tokio::test]
    async fn test_extra_network_connect_and_disconnect() {
        let h = Harness::new();
        let m = manager(&h);
        let id = h.guest(Status::Running).id;
        let ctx = CallContext::background();
        let mut watcher = m.new_watcher();
        let network = ExtraNetwork {
            mode: "bridge".into(),
            name: "br-ext".into(),
            cidr: "192.168.10.5/24".into(),
        };

        let cidr = m.connect_extra_network(&ctx, &id, network.clone()).await.unwrap();
        assert_eq!(cidr, network.cidr);
        assert_eq!(watcher.recv().await.unwrap().action, "misc");
        assert_eq!(h.stored(&id).extra_networks, vec![network]);
        assert_eq!(h.bots.count(&id, "bind_extra_network"), 1);

        m.disconnect_extra_network(&ctx, &id, "br-ext").await.unwrap();
        assert!(h.stored(&id).extra_networks.is_empty());
        assert_eq!(h.bots.count(&id, "unbind_extra_network"), 1);

        let err = m.disconnect_extra_network(&ctx, &id, "br-ext").await.unwrap_err();
        assert!(matches!(err.root(), GuestvisorError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_snapshot_ops_publish_their_action() {
        let h = Harness::new();
        let m = manager(&h);
        let guest = h.guest(Status::Stopped);
        let vol = guest.find_vol("/data").unwrap().id.clone();
        let ctx = CallContext::background();
        let mut watcher = m.new_watcher();

        m.create_snapshot(&ctx, &guest.id, &vol).await.unwrap();
        m.restore_snapshot(&ctx, &guest.id, &vol, "s0").await.unwrap();
        assert_eq!(watcher.recv().await.unwrap().action, "create-snapshot");
        assert_eq!(watcher.recv().await.unwrap().action, "restore-snapshot");

        let listed = m.list_snapshots(&guest.id, Some(&vol)).await.unwrap();
        assert_eq!(listed[0].1.len(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_all() {
        let h = Harness::with_config(test_config());
        let m = manager(&h);
        let starting = h.guest(Status::Starting).id;
        let destroying = h.guest(Status::Destroying).id;
        let running = h.guest(Status::Running).id;
        h.bots.set_domain_state(&running, DomainState::Running);

        let failed = m.reconcile_all(&CallContext::background()).await.unwrap();
        assert!(failed.is_empty());

        assert_eq!(h.stored(&starting).status, Some(Status::Running));
        assert!(m.load(&destroying).is_err());
        let mut ids = m.list_local_ids().unwrap();
        ids.sort();
        let mut expected = vec![starting, running];
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn test_orphan_domains() {
        let h = Harness::new();
        let m = manager(&h);
        let id = h.guest(Status::Stopped).id;
        h.bots.set_domain_state("stray", DomainState::Running);

        assert_eq!(m.orphan_domains().await.unwrap(), vec!["stray".to_string()]);
        assert!(m.reconcile_all(&CallContext::background()).await.unwrap().is_empty());
        assert_eq!(m.list_local_ids().unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn test_uuid_and_freeze() {
        let h = Harness::new();
        let m = manager(&h);
        let id = h.guest(Status::Running).id;
        let ctx = CallContext::background();

        assert_eq!(m.load_uuid(&id).await.unwrap(), format!("uuid-{}", id));
        assert_eq!(m.fs_freeze_all(&ctx, &id).await.unwrap(), 2);
        assert_eq!(m.fs_thaw_all(&ctx, &id).await.unwrap(), 2);
    }
}
