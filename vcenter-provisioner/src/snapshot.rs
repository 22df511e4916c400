// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! VM snapshots, addressed by the control plane's snapshot id.
//!
//! The endpoint names each snapshot after the id it was created with, so
//! every operation starts with a depth-first search of the VM's snapshot
//! tree for that name.

use crate::config::ProvisionerConfig;
use crate::poll;
use crate::poll::CondCheckError;
use slog::Logger;
use slog::debug;
use slog::info;
use slog::o;
use slog::warn;
use std::sync::Arc;
use std::time::Duration;
use vcenter_api::SnapshotRef;
use vcenter_api::SnapshotSpec;
use vcenter_api::SnapshotTree;
use vcenter_api::VimApi;
use vcenter_api::VimError;
use vcenter_api::VmRef;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Remote(#[from] VimError),

    #[error(
        "Snapshot {name} of {vm} did not become the current snapshot within \
         {timeout:?}"
    )]
    TimedOut { vm: VmRef, name: String, timeout: Duration },
}

/// Finds the snapshot called `name` in a snapshot tree, depth first.
pub fn find_snapshot<'a>(
    roots: &'a [SnapshotTree],
    name: &str,
) -> Option<&'a SnapshotTree> {
    roots.iter().find_map(|node| {
        if node.name == name {
            Some(node)
        } else {
            find_snapshot(&node.children, name)
        }
    })
}

pub struct SnapshotManager {
    log: Logger,
    vim: Arc<dyn VimApi>,
    config: ProvisionerConfig,
}

impl SnapshotManager {
    pub fn new(
        log: &Logger,
        vim: Arc<dyn VimApi>,
        config: ProvisionerConfig,
    ) -> Self {
        Self {
            log: log.new(o!("component" => "SnapshotManager")),
            vim,
            config,
        }
    }

    /// Takes a snapshot of `vm`, memory included, named `snap_id`.
    ///
    /// Some endpoint versions never signal completion of long snapshot
    /// tasks. On those the snapshot tree is polled until the new snapshot
    /// is the current one.
    pub async fn create(
        &self,
        vm: &VmRef,
        snap_id: &str,
        snap_name: &str,
    ) -> Result<(), SnapshotError> {
        let log = self.log.new(o!(
            "vm" => vm.to_string(),
            "snapshot" => snap_id.to_string(),
        ));
        let spec = SnapshotSpec {
            name: snap_id.to_string(),
            description: format!("OpenNebula Snapshot: {snap_name}"),
            memory: true,
            quiesce: true,
        };
        let about = self.vim.about().await?;
        let task = self.vim.create_snapshot(vm, &spec).await?;
        if !self.config.polls_for_snapshots(&about.api_version) {
            self.vim.wait_for_task(&task).await?;
            info!(log, "created snapshot");
            return Ok(());
        }

        info!(
            log,
            "waiting for snapshot to become current";
            "api_version" => &about.api_version,
        );
        let timeout = self.config.snapshot_poll_timeout();
        let result = poll::wait_for_condition(
            || async {
                let info = self
                    .vim
                    .snapshot_info(vm)
                    .await
                    .map_err(CondCheckError::Failed)?;
                let created = find_snapshot(&info.roots, snap_id)
                    .map(|node| &node.snapshot);
                if created.is_some() && created == info.current.as_ref() {
                    Ok(())
                } else {
                    debug!(log, "snapshot not current yet");
                    Err(CondCheckError::<VimError>::NotYet)
                }
            },
            &self.config.snapshot_poll_interval(),
            &timeout,
        )
        .await;
        match result {
            Ok(()) => {
                info!(log, "created snapshot");
                Ok(())
            }
            Err(poll::Error::TimedOut(_)) => Err(SnapshotError::TimedOut {
                vm: vm.clone(),
                name: snap_id.to_string(),
                timeout,
            }),
            Err(poll::Error::PermanentError(err)) => Err(err.into()),
        }
    }

    async fn lookup(
        &self,
        vm: &VmRef,
        snap_id: &str,
    ) -> Result<Option<SnapshotRef>, SnapshotError> {
        let info = self.vim.snapshot_info(vm).await?;
        Ok(find_snapshot(&info.roots, snap_id).map(|n| n.snapshot.clone()))
    }

    /// Reverts `vm` to the snapshot named `snap_id`. A missing snapshot is
    /// not an error.
    pub async fn revert(
        &self,
        vm: &VmRef,
        snap_id: &str,
    ) -> Result<(), SnapshotError> {
        let log = self.log.new(o!(
            "vm" => vm.to_string(),
            "snapshot" => snap_id.to_string(),
        ));
        let Some(snapshot) = self.lookup(vm, snap_id).await? else {
            warn!(log, "snapshot to revert to not found");
            return Ok(());
        };
        self.vim.revert_to_snapshot(&snapshot).await?;
        info!(log, "reverted to snapshot");
        Ok(())
    }

    /// Removes the snapshot named `snap_id`, keeping its children. A
    /// missing snapshot is not an error.
    pub async fn delete(
        &self,
        vm: &VmRef,
        snap_id: &str,
    ) -> Result<(), SnapshotError> {
        let log = self.log.new(o!(
            "vm" => vm.to_string(),
            "snapshot" => snap_id.to_string(),
        ));
        let Some(snapshot) = self.lookup(vm, snap_id).await? else {
            warn!(log, "snapshot to delete not found");
            return Ok(());
        };
        self.vim.remove_snapshot(&snapshot, false).await?;
        info!(log, "deleted snapshot");
        Ok(())
    }

    pub async fn remove_all(&self, vm: &VmRef) -> Result<(), SnapshotError> {
        self.vim.remove_all_snapshots(vm).await?;
        info!(self.log, "removed all snapshots"; "vm" => %vm);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::test_setup_log;
    use assert_matches::assert_matches;
    use vcenter_api::VimOp;
    use vcenter_api::fakes::FakeVcenter;

    fn setup(log: &Logger) -> (Arc<FakeVcenter>, VmRef, SnapshotManager) {
        let fake = FakeVcenter::new();
        let dc = fake.add_datacenter("dc0");
        let cluster = fake.add_cluster(&dc, "cluster0");
        let host = fake.add_host(&cluster, "esx0", &[]);
        let pool = fake.root_pool(&cluster).unwrap();
        let vm = fake.add_vm(&host, &pool, "one-7-myvm", vec![]);
        let manager = SnapshotManager::new(
            log,
            fake.clone(),
            ProvisionerConfig::default(),
        );
        (fake, vm, manager)
    }

    fn node(name: &str, children: Vec<SnapshotTree>) -> SnapshotTree {
        SnapshotTree {
            snapshot: SnapshotRef::new(format!("snapshot-{name}")),
            name: name.to_string(),
            description: String::new(),
            children,
        }
    }

    #[test]
    fn test_find_snapshot_depth_first() {
        let roots = vec![
            node("0", vec![node("1", vec![node("2", vec![])])]),
            node("3", vec![node("4", vec![])]),
        ];
        for name in ["0", "2", "4"] {
            assert_eq!(find_snapshot(&roots, name).unwrap().name, name);
        }
        assert!(find_snapshot(&roots, "5").is_none());
        assert!(find_snapshot(&[], "0").is_none());
    }

    #[tokio::test]
    async fn test_create_revert_delete() {
        let logctx = test_setup_log("test_create_revert_delete");
        let (fake, vm, manager) = setup(&logctx.log);

        manager.create(&vm, "0", "first").await.unwrap();
        manager.create(&vm, "1", "second").await.unwrap();
        let info = fake.snapshot_info(&vm).await.unwrap();
        let first = find_snapshot(&info.roots, "0").unwrap();
        assert_eq!(first.description, "OpenNebula Snapshot: first");
        assert_eq!(first.children[0].name, "1");
        assert_eq!(info.current, Some(first.children[0].snapshot.clone()));

        manager.revert(&vm, "0").await.unwrap();
        let info = fake.snapshot_info(&vm).await.unwrap();
        assert_eq!(info.current, Some(info.roots[0].snapshot.clone()));

        // Removing a snapshot keeps its children.
        manager.delete(&vm, "0").await.unwrap();
        let info = fake.snapshot_info(&vm).await.unwrap();
        assert!(find_snapshot(&info.roots, "0").is_none());
        assert!(find_snapshot(&info.roots, "1").is_some());

        manager.remove_all(&vm).await.unwrap();
        let info = fake.snapshot_info(&vm).await.unwrap();
        assert!(info.roots.is_empty());
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_missing_snapshot_is_ignored() {
        let logctx = test_setup_log("test_missing_snapshot_is_ignored");
        let (fake, vm, manager) = setup(&logctx.log);
        manager.revert(&vm, "9").await.unwrap();
        manager.delete(&vm, "9").await.unwrap();
        assert_eq!(fake.call_count(VimOp::RevertToSnapshot), 0);
        assert_eq!(fake.call_count(VimOp::RemoveSnapshot), 0);
        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_polls_when_completion_is_not_signalled() {
        let logctx = test_setup_log(
            "test_create_polls_when_completion_is_not_signalled",
        );
        let (fake, vm, manager) = setup(&logctx.log);
        fake.set_api_version("5.5");
        fake.suppress_snapshot_signal(5);

        manager.create(&vm, "0", "slow").await.unwrap();
        assert_eq!(fake.call_count(VimOp::WaitForTask), 0);
        assert_eq!(fake.call_count(VimOp::SnapshotInfo), 6);
        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_poll_gives_up() {
        let logctx = test_setup_log("test_create_poll_gives_up");
        let (fake, vm, manager) = setup(&logctx.log);
        fake.set_api_version("5.5");
        fake.suppress_snapshot_signal(u32::MAX);

        let err = manager.create(&vm, "0", "stuck").await.unwrap_err();
        assert_matches!(err, SnapshotError::TimedOut { .. });
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_lost_completion_signal_fails_wait() {
        let logctx = test_setup_log("test_lost_completion_signal_fails_wait");
        let (fake, vm, manager) = setup(&logctx.log);
        fake.suppress_snapshot_signal(1);

        let err = manager.create(&vm, "0", "lost").await.unwrap_err();
        assert_matches!(
            err,
            SnapshotError::Remote(VimError { op: VimOp::WaitForTask, .. })
        );
        logctx.cleanup_successful();
    }
}
