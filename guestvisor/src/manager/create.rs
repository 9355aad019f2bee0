use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use guestvisor_shared::GuestvisorResult;

use super::{Manager, Op};
use crate::bot::Rollback;
use crate::context::CallContext;
use crate::guest::VirtGuest;
use crate::models::{ExtraNetwork, GpuParams, Guest, LambdaOptions, Volume, qemu_mac};
use crate::runtime::SharedRuntime;

const ROLLBACK_DESTROY_TIMEOUT: Duration = Duration::from_secs(60);

/// Parameters of a new guest.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub image_name: String,
    pub cpu: u32,
    /// Bytes.
    pub memory: u64,
    /// System disk size in bytes.
    pub sys_size: u64,
    pub data_volumes: Vec<Volume>,
    pub ips: Vec<String>,
    pub extra_networks: Vec<ExtraNetwork>,
    pub labels: BTreeMap<String, String>,
    pub gpu: GpuParams,
    /// Command run after every boot of a lambda guest.
    pub lambda_cmd: Option<Vec<String>>,
    pub lambda_stdin: bool,
}

impl CreateOptions {
    fn into_guest(self, rt: &SharedRuntime) -> GuestvisorResult<Guest> {
        let config = &rt.config;
        let mut guest = Guest::new(&config.host_name, &self.image_name, self.cpu, self.memory);
        guest.mac = qemu_mac();
        guest.ips = self.ips;
        guest.extra_networks = self.extra_networks;
        guest.labels = self.labels;
        guest.gpu = self.gpu;
        guest.lambda = self.lambda_cmd.map(|cmd| LambdaOptions {
            cmd,
            ..LambdaOptions::default()
        });
        guest.lambda_stdin = self.lambda_stdin;

        let mut vols = Vec::with_capacity(self.data_volumes.len() + 1);
        vols.push(Volume::new_sys(self.sys_size, &self.image_name));
        vols.extend(self.data_volumes);
        guest.append_vols(vols, config.max_volumes_count)?;

        guest.check(config)?;
        Ok(guest)
    }
}

impl Manager {
    /// Record a new guest and define its domain.
    ///
    /// The record is written as `pending` first. If defining fails or the
    /// caller stops waiting, the guest is force-destroyed again.
    pub async fn create(&self, ctx: &CallContext, opts: CreateOptions) -> GuestvisorResult<Guest> {
        let mut guest = opts.into_guest(&self.rt)?;
        guest.create(self.rt.store.as_ref())?;
        let id = guest.id.clone();
        tracing::info!(guest_id = %id, image = %guest.image_name, "Guest recorded");

        let rollback: Rollback = Box::pin(purge(Arc::clone(&self.rt), id.clone()));
        self.ctrl(ctx, &id, Op::Create, Some(rollback), |mut vg, _| async move {
            vg.create().await?;
            Ok(vg.into_meta())
        })
        .await
    }
}

/// Force-destroy a guest whose creation failed, waiting a bounded time for
/// the teardown.
async fn purge(rt: SharedRuntime, id: String) {
    let vg = match VirtGuest::load(rt, &id) {
        Ok(vg) => vg,
        Err(e) => {
            tracing::error!(guest_id = %id, error = %e, "Cannot load guest to roll back");
            return;
        }
    };
    let done = match vg.destroy(true).await {
        Ok(done) => done,
        Err(e) => {
            tracing::error!(guest_id = %id, error = %e, "Failed to roll back guest");
            return;
        }
    };
    match tokio::time::timeout(ROLLBACK_DESTROY_TIMEOUT, done).await {
        Ok(Ok(Ok(()))) => tracing::info!(guest_id = %id, "Rolled back guest"),
        Ok(Ok(Err(e))) => tracing::error!(guest_id = %id, error = %e, "Roll back teardown failed"),
        Ok(Err(_)) => tracing::error!(guest_id = %id, "Roll back teardown vanished"),
        Err(_) => tracing::error!(guest_id = %id, "Roll back teardown timed out"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::mock::Call;
    use crate::guest::testing::{GIB, Harness};
    use crate::models::Status;

    fn options() -> CreateOptions {
        CreateOptions {
            image_name: "ubuntu".into(),
            cpu: 2,
            memory: 2 * GIB,
            sys_size: 20 * GIB,
            data_volumes: vec![Volume::parse_request("/data=10G").unwrap()],
            ips: vec!["10.0.0.9/24".into()],
            ..CreateOptions::default()
        }
    }

    #[tokio::test]
    async fn test_create_defines_guest() {
        let h = Harness::new();
        let m = Manager::new(h.rt.clone());

        let guest = m.create(&CallContext::background(), options()).await.unwrap();

        assert_eq!(guest.status, Some(Status::Creating));
        assert!(guest.mac.starts_with("52:54:00:"));
        let stored = h.stored(&guest.id);
        assert_eq!(stored.vols.len(), 2);
        assert_eq!(stored.find_vol("/data").unwrap().device, "vdb");
        assert_eq!(h.bots.effects(&guest.id), vec![Call::Define]);
        assert_eq!(m.list_local_ids().unwrap(), vec![guest.id.clone()]);
    }

    #[tokio::test]
    async fn test_failed_define_rolls_back() {
        let h = Harness::new();
        let m = Manager::new(h.rt.clone());
        h.bots.fail("define");

        let err = m.create(&CallContext::background(), options()).await.unwrap_err();
        assert!(err.to_string().starts_with("create "));
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_options_write_nothing() {
        let h = Harness::new();
        let m = Manager::new(h.rt.clone());
        let opts = CreateOptions {
            cpu: 0,
            ..options()
        };

        assert!(m.create(&CallContext::background(), opts).await.is_err());
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_lambda_options_are_kept() {
        let h = Harness::new();
        let m = Manager::new(h.rt.clone());
        let opts = CreateOptions {
            lambda_cmd: Some(vec!["make".into()]),
            ..options()
        };

        let guest = m.create(&CallContext::background(), opts).await.unwrap();
        assert!(guest.is_lambda());
        assert_eq!(h.stored(&guest.id).lambda.unwrap().cmd, vec!["make".to_string()]);
    }
}
