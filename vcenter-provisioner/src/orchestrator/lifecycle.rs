// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Power actions, destruction and whole-VM workflows.

use super::Provisioner;
use crate::annotations;
use crate::desired::DesiredVm;
use crate::error::Error;
use crate::poll;
use crate::poll::CondCheckError;
use slog::debug;
use slog::error;
use slog::info;
use slog::warn;
use std::time::Duration;
use vcenter_api::DeviceChange;
use vcenter_api::DeviceKind;
use vcenter_api::DiskBacking;
use vcenter_api::FileOperation;
use vcenter_api::PowerState;
use vcenter_api::VimError;
use vcenter_api::VirtualDevice;
use vcenter_api::VmConfigSpec;
use vcenter_api::VmRef;

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A delta disk on top of `device`'s current backing, in the same slot.
fn delta_disk(device: &VirtualDevice) -> Option<VirtualDevice> {
    let DeviceKind::Disk { backing, capacity_kb } = &device.kind else {
        return None;
    };
    if backing.parent.is_some() {
        return None;
    }
    Some(VirtualDevice {
        kind: DeviceKind::Disk {
            backing: DiskBacking {
                file_name: String::new(),
                datastore: backing.datastore.clone(),
                disk_mode: backing.disk_mode,
                parent: Some(Box::new(backing.clone())),
            },
            capacity_kb: *capacity_kb,
        },
        ..device.clone()
    })
}

impl Provisioner {
    /// Clones, configures and starts a new VM.
    pub async fn deploy(&self, desired: &DesiredVm) -> Result<VmRef, Error> {
        let vm = self.clone_vm(desired).await?;
        self.reference_unmanaged_devices(&vm, desired).await?;
        self.reconfigure(&vm, desired, true).await?;
        self.power_on(&vm).await?;
        self.set_running(&vm, true).await?;
        info!(self.vm_log(&vm), "deployed VM"; "name" => %desired);
        Ok(vm)
    }

    pub async fn power_on(&self, vm: &VmRef) -> Result<(), Error> {
        self.vim.power_on(vm).await?;
        info!(self.vm_log(vm), "powered on");
        Ok(())
    }

    pub async fn power_off_hard(&self, vm: &VmRef) -> Result<(), Error> {
        self.vim.power_off(vm).await?;
        info!(self.vm_log(vm), "powered off");
        Ok(())
    }

    pub async fn reset(&self, vm: &VmRef) -> Result<(), Error> {
        self.vim.reset(vm).await?;
        info!(self.vm_log(vm), "reset");
        Ok(())
    }

    pub async fn suspend(&self, vm: &VmRef) -> Result<(), Error> {
        self.vim.suspend(vm).await?;
        info!(self.vm_log(vm), "suspended");
        Ok(())
    }

    /// Asks the guest to restart.
    pub async fn reboot(&self, vm: &VmRef) -> Result<(), Error> {
        self.vim.reboot_guest(vm).await?;
        info!(self.vm_log(vm), "rebooted guest");
        Ok(())
    }

    /// Asks the guest to shut down and waits for the VM to power off,
    /// powering it off hard once the shutdown timeout passes.
    ///
    /// A guest that cannot be asked at all (no tools running, already off)
    /// is not waited for.
    pub async fn shutdown(&self, vm: &VmRef) -> Result<(), Error> {
        let log = self.vm_log(vm);
        let requested = match self.vim.shutdown_guest(vm).await {
            Ok(()) => true,
            Err(err) => {
                warn!(log, "guest shutdown request failed"; "error" => %err);
                false
            }
        };

        let stopped = if requested {
            let timeout = self.config.shutdown_timeout();
            let result = poll::wait_for_condition(
                || async {
                    let info =
                        self.vim.vm(vm).await.map_err(CondCheckError::Failed)?;
                    if info.power_state == PowerState::PoweredOff {
                        Ok(())
                    } else {
                        debug!(log, "guest still running");
                        Err(CondCheckError::<VimError>::NotYet)
                    }
                },
                &SHUTDOWN_POLL_INTERVAL,
                &timeout,
            )
            .await;
            match result {
                Ok(()) => true,
                Err(poll::Error::TimedOut(elapsed)) => {
                    warn!(
                        log,
                        "guest did not shut down in time";
                        "elapsed" => ?elapsed,
                    );
                    false
                }
                Err(poll::Error::PermanentError(err)) => return Err(err.into()),
            }
        } else {
            self.vim.vm(vm).await?.power_state == PowerState::PoweredOff
        };

        if stopped {
            info!(log, "guest shut down");
            return Ok(());
        }
        self.power_off_hard(vm).await
    }

    /// Destroys `vm` along with its disks, except for persistent images,
    /// which are detached first.
    pub async fn destroy(&self, vm: &VmRef) -> Result<(), Error> {
        let log = self.vm_log(vm);
        let info = self.vim.vm(vm).await?;
        if info.power_state != PowerState::PoweredOff {
            self.power_off_hard(vm).await?;
        }
        self.detach_persistent_disks(&log, vm).await?;
        self.vim.destroy_vm(vm).await?;
        info!(log, "destroyed VM"; "name" => &info.name);
        Ok(())
    }

    pub async fn mark_as_template(&self, vm: &VmRef) -> Result<(), Error> {
        self.vim.mark_as_template(vm).await?;
        info!(self.vm_log(vm), "marked as template");
        Ok(())
    }

    /// Records on `vm` whether the control plane considers it running.
    pub async fn set_running(
        &self,
        vm: &VmRef,
        running: bool,
    ) -> Result<(), Error> {
        let spec = VmConfigSpec {
            extra_config: vec![annotations::running(running)],
            ..VmConfigSpec::default()
        };
        self.vim.reconfigure_vm(vm, &spec).await?;
        debug!(self.vm_log(vm), "updated running flag"; "running" => running);
        Ok(())
    }

    /// Rewrites the contextualization text handed to the guest.
    pub async fn regenerate_context(
        &self,
        vm: &VmRef,
        desired: &DesiredVm,
    ) -> Result<(), Error> {
        let spec = VmConfigSpec {
            extra_config: vec![annotations::context(desired)],
            ..VmConfigSpec::default()
        };
        self.vim.reconfigure_vm(vm, &spec).await?;
        info!(self.vm_log(vm), "regenerated context");
        Ok(())
    }

    pub async fn remove_all_snapshots(&self, vm: &VmRef) -> Result<(), Error> {
        Ok(self.snapshots.remove_all(vm).await?)
    }

    /// Puts a delta disk on top of every disk of `template` that has no
    /// parent backing yet, so that clones of it can share the base disks.
    ///
    /// The template is turned into a VM for the change and back into a
    /// template afterwards, including when the change fails.
    pub async fn prepare_linked_clone_template(
        &self,
        template: &VmRef,
    ) -> Result<(), Error> {
        let log = self.vm_log(template);
        let info = self.vim.vm(template).await?;
        let deltas = info
            .devices
            .iter()
            .filter_map(|base| Some((base.clone(), delta_disk(base)?)))
            .collect::<Vec<_>>();
        if deltas.is_empty() {
            info!(log, "template already backs linked clones");
            return Ok(());
        }

        if info.template {
            self.vim
                .mark_as_virtual_machine(template, &info.resource_pool)
                .await?;
        }
        let disks = deltas.len();
        let mut spec = VmConfigSpec::default();
        for (base, delta) in deltas {
            spec.device_change.push(DeviceChange::remove(base));
            spec.device_change.push(
                DeviceChange::add(delta)
                    .with_file_operation(FileOperation::Create),
            );
        }

        if let Err(err) = self.vim.reconfigure_vm(template, &spec).await {
            error!(
                log,
                "failed to add delta disks, restoring template";
                "error" => %err,
            );
            if let Err(restore) = self.vim.mark_as_template(template).await {
                error!(
                    log,
                    "failed to restore template";
                    "error" => %restore,
                );
            }
            return Err(err.into());
        }
        self.vim.mark_as_template(template).await?;
        info!(log, "added delta disks to template"; "disks" => disks);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::Setup;
    use super::super::tests::desired;
    use super::super::tests::disk;
    use super::super::tests::setup;
    use super::*;
    use crate::annotations::CONTEXT_KEY;
    use crate::annotations::RUNNING_KEY;
    use crate::reconciler::LiveDisk;
    use crate::test_util::test_setup_log;
    use assert_matches::assert_matches;
    use vcenter_api::Fault;
    use vcenter_api::VimOp;
    use vcenter_api::fakes::GuestBehavior;

    fn power_state(setup: &Setup, vm: &VmRef) -> PowerState {
        setup.fake.vm_info(vm).unwrap().power_state
    }

    fn disk_parents(setup: &Setup, vm: &VmRef) -> Vec<Option<String>> {
        setup
            .fake
            .vm_info(vm)
            .unwrap()
            .devices
            .into_iter()
            .filter_map(|device| match device.kind {
                DeviceKind::Disk { backing, .. } => {
                    Some(backing.parent.map(|p| p.file_name))
                }
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_deploy() {
        let logctx = test_setup_log("test_deploy");
        let setup = setup(&logctx.log).await;
        let desired = desired(&setup);

        let vm = setup.provisioner.deploy(&desired).await.unwrap();
        let info = setup.fake.vm_info(&vm).unwrap();
        assert_eq!(info.name, "one-7-myvm");
        assert_eq!(info.power_state, PowerState::PoweredOn);
        assert_eq!(info.num_cpus, 2);
        assert_eq!(info.extra_config.get(RUNNING_KEY).unwrap(), "yes");
        assert!(info.extra_config.contains_key(CONTEXT_KEY));
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_power_actions() {
        let logctx = test_setup_log("test_power_actions");
        let setup = setup(&logctx.log).await;
        let vm = setup.provisioner.deploy(&desired(&setup)).await.unwrap();
        let provisioner = &setup.provisioner;

        provisioner.suspend(&vm).await.unwrap();
        assert_eq!(power_state(&setup, &vm), PowerState::Suspended);
        provisioner.power_on(&vm).await.unwrap();
        provisioner.reset(&vm).await.unwrap();
        provisioner.reboot(&vm).await.unwrap();
        assert_eq!(power_state(&setup, &vm), PowerState::PoweredOn);
        provisioner.power_off_hard(&vm).await.unwrap();
        assert_eq!(power_state(&setup, &vm), PowerState::PoweredOff);

        let err = provisioner.reset(&vm).await.unwrap_err();
        assert_matches!(
            err,
            Error::Vim(VimError { fault: Fault::InvalidState, .. })
        );
        provisioner.set_running(&vm, false).await.unwrap();
        let info = setup.fake.vm_info(&vm).unwrap();
        assert_eq!(info.extra_config.get(RUNNING_KEY).unwrap(), "no");
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_shutdown_cooperative_guest() {
        let logctx = test_setup_log("test_shutdown_cooperative_guest");
        let setup = setup(&logctx.log).await;
        let vm = setup.provisioner.deploy(&desired(&setup)).await.unwrap();

        setup.provisioner.shutdown(&vm).await.unwrap();
        assert_eq!(power_state(&setup, &vm), PowerState::PoweredOff);
        assert_eq!(setup.fake.call_count(VimOp::PowerOff), 0);

        // Already off: nothing to wait for.
        setup.provisioner.shutdown(&vm).await.unwrap();
        assert_eq!(setup.fake.call_count(VimOp::PowerOff), 0);
        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_falls_back_to_power_off() {
        let logctx = test_setup_log("test_shutdown_falls_back_to_power_off");
        let setup = setup(&logctx.log).await;
        let vm = setup.provisioner.deploy(&desired(&setup)).await.unwrap();
        setup.fake.set_guest_behavior(GuestBehavior::Unresponsive);

        let start = tokio::time::Instant::now();
        setup.provisioner.shutdown(&vm).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(600));
        assert_eq!(power_state(&setup, &vm), PowerState::PoweredOff);
        assert_eq!(setup.fake.call_count(VimOp::PowerOff), 1);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_shutdown_without_guest_tools() {
        let logctx = test_setup_log("test_shutdown_without_guest_tools");
        let setup = setup(&logctx.log).await;
        let vm = setup.provisioner.deploy(&desired(&setup)).await.unwrap();
        setup.fake.set_guest_behavior(GuestBehavior::NoTools);

        setup.provisioner.shutdown(&vm).await.unwrap();
        assert_eq!(power_state(&setup, &vm), PowerState::PoweredOff);
        assert_eq!(setup.fake.call_count(VimOp::PowerOff), 1);

        let err = setup.provisioner.reboot(&vm).await.unwrap_err();
        assert_matches!(
            err,
            Error::Vim(VimError { op: VimOp::RebootGuest, .. })
        );
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_destroy_keeps_persistent_disks() {
        let logctx = test_setup_log("test_destroy_keeps_persistent_disks");
        let setup = setup(&logctx.log).await;
        let persistent = "[ds0] images/data.vmdk";
        setup.fake.add_file(persistent);
        setup.images.add_persistent_image("images/data.vmdk");
        let mut desired = desired(&setup);
        let mut data = disk(&setup, 1, Some("images/data.vmdk"));
        data.persistent = true;
        desired.disks.push(data);
        let vm = setup.provisioner.deploy(&desired).await.unwrap();
        assert_eq!(
            LiveDisk::scan(&setup.fake.vm_info(&vm).unwrap().devices).len(),
            2
        );

        setup.provisioner.destroy(&vm).await.unwrap();
        assert!(setup.fake.vm_info(&vm).is_none());
        assert!(setup.fake.file_exists(persistent));
        assert!(!setup.fake.file_exists("[ds0] one-7-myvm/one-7-myvm.vmdk"));
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_regenerate_context() {
        let logctx = test_setup_log("test_regenerate_context");
        let setup = setup(&logctx.log).await;
        let mut desired = desired(&setup);
        let vm = setup.provisioner.deploy(&desired).await.unwrap();

        desired.onegate_token = Some("token".to_string());
        setup.provisioner.regenerate_context(&vm, &desired).await.unwrap();
        let info = setup.fake.vm_info(&vm).unwrap();
        assert_eq!(
            info.extra_config.get(CONTEXT_KEY),
            Some(&annotations::context(&desired).value)
        );
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_prepare_linked_clone_template() {
        let logctx = test_setup_log("test_prepare_linked_clone_template");
        let setup = setup(&logctx.log).await;

        setup
            .provisioner
            .prepare_linked_clone_template(&setup.template)
            .await
            .unwrap();
        let info = setup.fake.vm_info(&setup.template).unwrap();
        assert!(info.template);
        assert_eq!(
            disk_parents(&setup, &setup.template),
            [Some(super::super::tests::TEMPLATE_DISK.to_string())]
        );

        // A second pass has nothing to convert.
        setup
            .provisioner
            .prepare_linked_clone_template(&setup.template)
            .await
            .unwrap();
        assert_eq!(setup.fake.call_count(VimOp::MarkAsVirtualMachine), 1);

        let mut desired = desired(&setup);
        desired.placement.linked_clone = true;
        let vm = setup.provisioner.clone_vm(&desired).await.unwrap();
        let template_disk = LiveDisk::scan(&info.devices).remove(0);
        assert_eq!(
            disk_parents(&setup, &vm),
            [Some(template_disk.file_name)]
        );
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_prepare_restores_template_on_failure() {
        let logctx =
            test_setup_log("test_prepare_restores_template_on_failure");
        let setup = setup(&logctx.log).await;
        setup.fake.fail_next(VimOp::ReconfigureVm, Fault::Other);

        let err = setup
            .provisioner
            .prepare_linked_clone_template(&setup.template)
            .await
            .unwrap_err();
        assert_matches!(
            err,
            Error::Vim(VimError { op: VimOp::ReconfigureVm, .. })
        );
        assert!(setup.fake.vm_info(&setup.template).unwrap().template);
        assert_eq!(disk_parents(&setup, &setup.template), [None]);
        logctx.cleanup_successful();
    }
}
