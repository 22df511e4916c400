// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Creating a VM from its template.

use super::Provisioner;
use crate::annotations;
use crate::annotations::UnmanagedKeyMap;
use crate::annotations::set_disk_key;
use crate::desired::DesiredVm;
use crate::error::ConfigurationConflict;
use crate::error::Error;
use crate::placement::clone_into_pod;
use crate::reconciler::LiveDisk;
use crate::reconciler::LiveNic;
use slog::Logger;
use slog::info;
use slog::o;
use slog::warn;
use vcenter_api::CloneSpec;
use vcenter_api::ClusterInfo;
use vcenter_api::DatastoreTarget;
use vcenter_api::DeviceChange;
use vcenter_api::DeviceKind;
use vcenter_api::DiskMoveType;
use vcenter_api::FolderRef;
use vcenter_api::RelocateSpec;
use vcenter_api::ResourcePoolRef;
use vcenter_api::VimError;
use vcenter_api::VmConfigSpec;
use vcenter_api::VmInfo;
use vcenter_api::VmRef;

fn is_duplicate_name(err: &Error) -> bool {
    err.vim_error().is_some_and(VimError::is_duplicate_name)
}

/// Whether the template can back a linked clone: every disk is already a
/// delta on top of another backing.
fn template_supports_linked_clones(template: &VmInfo) -> bool {
    template.devices.iter().all(|device| match &device.kind {
        DeviceKind::Disk { backing, .. } => backing.parent.is_some(),
        _ => true,
    })
}

impl Provisioner {
    /// Clones the VM's template into a new, powered off VM named after the
    /// VM.
    ///
    /// A VM that already has the name is taken to be the leftover of an
    /// earlier attempt: its persistent disks are detached, it is destroyed
    /// and the clone is tried once more.
    pub async fn clone_vm(&self, desired: &DesiredVm) -> Result<VmRef, Error> {
        let name = self.config.vm_name(desired.id, &desired.name);
        let log = self.log.new(o!("vm_name" => name.clone()));
        let placement = &desired.placement;
        let template = self.vim.vm(&placement.template).await?;
        let cluster = self.vim.cluster(&placement.cluster).await?;
        let pool =
            resource_pool(&cluster, placement.resource_pool.as_deref())?;

        let folder = match &placement.folder {
            Some(path) => self
                .vim
                .find_folder(&template.datacenter, path)
                .await?
                .unwrap_or_else(|| {
                    warn!(
                        log,
                        "VM folder not found, using the template's";
                        "folder" => path,
                    );
                    template.parent_folder.clone()
                }),
            None => template.parent_folder.clone(),
        };

        let customization = match &placement.customization_spec {
            Some(spec_name) => Some(
                self.vim.customization_spec(spec_name).await?.ok_or_else(
                    || {
                        ConfigurationConflict::new(
                            format!("VM {desired}"),
                            "customization_spec",
                            format!(
                                "customization spec {spec_name} does not \
                                 exist"
                            ),
                        )
                    },
                )?,
            ),
            None => None,
        };

        let on_pod =
            matches!(placement.datastore, Some(DatastoreTarget::Pod(_)));
        let linked = placement.linked_clone
            && !on_pod
            && template_supports_linked_clones(&template);
        if placement.linked_clone && !linked {
            warn!(log, "template cannot back a linked clone, copying disks");
        }
        let disk_move_type = if linked {
            DiskMoveType::MoveChildMostDiskBacking
        } else {
            DiskMoveType::MoveAllDiskBackingsAndDisallowSharing
        };

        let spec = CloneSpec {
            location: RelocateSpec {
                pool,
                datastore: match &placement.datastore {
                    Some(DatastoreTarget::Datastore(ds)) => Some(ds.clone()),
                    _ => None,
                },
                host: placement.host.clone(),
                disk_move_type,
            },
            power_on: false,
            template: false,
            config: Some(VmConfigSpec {
                extra_config: vec![annotations::running(false)],
                ..VmConfigSpec::default()
            }),
            customization,
        };

        match self.submit_clone(&log, desired, &folder, &name, &spec).await {
            Err(err) if is_duplicate_name(&err) => {
                warn!(
                    log,
                    "a VM with the same name exists, replacing it";
                    "error" => %err,
                );
                if let Some(stale) = self
                    .vim
                    .find_vm_by_name(&template.datacenter, &name)
                    .await?
                {
                    self.detach_persistent_disks(&log, &stale).await?;
                    self.vim.destroy_vm(&stale).await?;
                    info!(log, "destroyed stale VM"; "vm" => %stale);
                }
                self.submit_clone(&log, desired, &folder, &name, &spec).await
            }
            result => result,
        }
    }

    async fn submit_clone(
        &self,
        log: &Logger,
        desired: &DesiredVm,
        folder: &FolderRef,
        name: &str,
        spec: &CloneSpec,
    ) -> Result<VmRef, Error> {
        let template = &desired.placement.template;
        let vm = match &desired.placement.datastore {
            Some(DatastoreTarget::Pod(pod)) => {
                clone_into_pod(
                    self.vim.as_ref(),
                    log,
                    pod,
                    template,
                    folder,
                    name,
                    spec,
                )
                .await?
            }
            _ => self.vim.clone_vm(template, folder, name, spec).await?,
        };
        info!(
            log,
            "cloned template";
            "vm" => %vm,
            "template" => %template,
            "linked" => spec.location.disk_move_type
                == DiskMoveType::MoveChildMostDiskBacking,
        );
        Ok(vm)
    }

    /// Ties the devices a clone inherited from its template to the VM's
    /// unmanaged disks and NICs.
    ///
    /// An unmanaged disk is the clone's disk at the position its source has
    /// among the template's disks; the association is recorded on the VM.
    /// Unmanaged NICs take the desired MAC addresses in device order.
    pub async fn reference_unmanaged_devices(
        &self,
        vm: &VmRef,
        desired: &DesiredVm,
    ) -> Result<(), Error> {
        let log = self.vm_log(vm);
        let template = &desired.placement.template;
        let template_info = self.vim.vm(template).await?;
        let info = self.vim.vm(vm).await?;

        let template_disks = LiveDisk::scan(&template_info.devices)
            .into_iter()
            .filter(|d| d.device.is_disk())
            .collect::<Vec<_>>();
        let vm_disks = LiveDisk::scan(&info.devices)
            .into_iter()
            .filter(|d| d.device.is_disk())
            .collect::<Vec<_>>();

        let recorded = UnmanagedKeyMap::from_extra_config(&info.extra_config);
        let mut spec = VmConfigSpec::default();
        for disk in desired.disks.iter().filter(|d| !d.managed) {
            let source = disk.source.as_deref().ok_or_else(|| {
                Error::MissingDiskSource {
                    disk_id: disk.disk_id,
                    disk_type: disk.disk_type.to_string(),
                }
            })?;
            let not_in_template = || Error::UnmanagedDiskNotInTemplate {
                disk_id: disk.disk_id,
                source_path: source.to_string(),
                template: template.to_string(),
            };
            let position = template_disks
                .iter()
                .position(|d| d.path == source)
                .ok_or_else(not_in_template)?;
            let live = vm_disks.get(position).ok_or_else(not_in_template)?;
            if recorded.get(disk.disk_id) == Some(live.key()) {
                continue;
            }
            info!(
                log,
                "referencing unmanaged disk";
                "disk_id" => disk.disk_id,
                "key" => live.key(),
            );
            spec.extra_config.push(set_disk_key(disk.disk_id, live.key()));
        }

        let live_nics = LiveNic::scan(&info.devices);
        let unmanaged_nics = desired.nics.iter().filter(|n| !n.managed);
        for (nic, live) in unmanaged_nics.zip(live_nics) {
            if live.mac == Some(nic.mac) {
                continue;
            }
            let mut device = live.device;
            if let DeviceKind::Nic(adapter) = &mut device.kind {
                adapter.mac = Some(nic.mac);
            }
            info!(
                log,
                "setting MAC of unmanaged NIC";
                "nic_id" => nic.nic_id,
                "mac" => %nic.mac,
            );
            spec.device_change.push(DeviceChange::edit(device));
        }

        if spec.is_empty() {
            return Ok(());
        }
        self.vim.reconfigure_vm(vm, &spec).await?;
        Ok(())
    }
}

/// The pool named `requested` among the cluster's, or the cluster's root
/// pool when none is requested.
fn resource_pool(
    cluster: &ClusterInfo,
    requested: Option<&str>,
) -> Result<ResourcePoolRef, ConfigurationConflict> {
    let Some(name) = requested else {
        return Ok(cluster.resource_pool.clone());
    };
    cluster
        .resource_pools
        .iter()
        .find(|pool| pool.name == name)
        .map(|pool| pool.reference.clone())
        .ok_or_else(|| {
            ConfigurationConflict::new(
                format!("cluster {}", cluster.name),
                "resource_pool",
                format!("resource pool {name} does not exist"),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::super::tests::TEMPLATE_DISK;
    use super::super::tests::desired;
    use super::super::tests::setup;
    use super::*;
    use crate::annotations::RUNNING_KEY;
    use crate::test_util::test_setup_log;
    use assert_matches::assert_matches;
    use macaddr::MacAddr6;
    use vcenter_api::DiskBacking;
    use vcenter_api::DiskMode;
    use vcenter_api::Fault;
    use vcenter_api::PowerState;
    use vcenter_api::VimOp;
    use vcenter_api::fakes::devices;

    #[tokio::test]
    async fn test_clone_full() {
        let logctx = test_setup_log("test_clone_full");
        let setup = setup(&logctx.log).await;
        let desired = desired(&setup);

        let vm = setup.provisioner.clone_vm(&desired).await.unwrap();
        let info = setup.fake.vm_info(&vm).unwrap();
        assert_eq!(info.name, "one-7-myvm");
        assert_eq!(info.power_state, PowerState::PoweredOff);
        assert!(!info.template);
        assert_eq!(
            info.resource_pool,
            setup.fake.root_pool(&setup.cluster).unwrap()
        );
        assert_eq!(info.extra_config.get(RUNNING_KEY).unwrap(), "no");
        let disk = LiveDisk::scan(&info.devices).remove(0);
        assert_eq!(disk.file_name, "[ds0] one-7-myvm/one-7-myvm.vmdk");
        assert_matches!(
            disk.device.kind,
            DeviceKind::Disk { backing: DiskBacking { parent: None, .. }, .. }
        );
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_clone_placement_options() {
        let logctx = test_setup_log("test_clone_placement_options");
        let setup = setup(&logctx.log).await;
        let pool = setup.fake.add_resource_pool(&setup.cluster, "gold");
        let folder = setup.fake.add_folder(&setup.dc, "tenants/a");
        setup.fake.add_customization_spec("linux");
        let mut desired = desired(&setup);
        desired.placement.resource_pool = Some("gold".to_string());
        desired.placement.folder = Some("tenants/a".to_string());
        desired.placement.customization_spec = Some("linux".to_string());

        let vm = setup.provisioner.clone_vm(&desired).await.unwrap();
        let info = setup.fake.vm_info(&vm).unwrap();
        assert_eq!(info.resource_pool, pool);
        assert_eq!(info.parent_folder, folder);

        // Folders that do not resolve fall back to the template's.
        desired.id = 8;
        desired.placement.folder = Some("nowhere".to_string());
        let vm = setup.provisioner.clone_vm(&desired).await.unwrap();
        let template = setup.fake.vm_info(&setup.template).unwrap();
        assert_eq!(
            setup.fake.vm_info(&vm).unwrap().parent_folder,
            template.parent_folder
        );
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_clone_rejects_unknown_pool_and_customization() {
        let logctx = test_setup_log(
            "test_clone_rejects_unknown_pool_and_customization",
        );
        let setup = setup(&logctx.log).await;
        let mut desired = desired(&setup);
        desired.placement.resource_pool = Some("missing".to_string());
        let err = setup.provisioner.clone_vm(&desired).await.unwrap_err();
        assert_matches!(
            err,
            Error::Conflict(ConfigurationConflict {
                field: "resource_pool",
                ..
            })
        );

        desired.placement.resource_pool = None;
        desired.placement.customization_spec = Some("missing".to_string());
        let err = setup.provisioner.clone_vm(&desired).await.unwrap_err();
        assert_matches!(
            err,
            Error::Conflict(ConfigurationConflict {
                field: "customization_spec",
                ..
            })
        );
        assert_eq!(setup.fake.call_count(VimOp::CloneVm), 0);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_linked_clone_needs_delta_template() {
        let logctx = test_setup_log("test_linked_clone_needs_delta_template");
        let setup = setup(&logctx.log).await;
        let mut desired = desired(&setup);
        desired.placement.linked_clone = true;

        // The template's disk has no parent yet: full clone.
        let vm = setup.provisioner.clone_vm(&desired).await.unwrap();
        let disk = LiveDisk::scan(&setup.fake.vm_info(&vm).unwrap().devices)
            .remove(0);
        assert_matches!(
            disk.device.kind,
            DeviceKind::Disk { backing: DiskBacking { parent: None, .. }, .. }
        );

        let pool = setup.fake.root_pool(&setup.cluster).unwrap();
        let base = DiskBacking {
            file_name: TEMPLATE_DISK.to_string(),
            datastore: Some(setup.ds.clone()),
            disk_mode: DiskMode::Persistent,
            parent: None,
        };
        let mut delta = devices::disk(
            2000,
            1000,
            0,
            "[ds0] templates/base-delta.vmdk",
            &setup.ds,
            10 << 20,
        );
        if let DeviceKind::Disk { backing, .. } = &mut delta.kind {
            backing.parent = Some(Box::new(base));
        }
        let template = setup.fake.add_template(
            &setup.host,
            &pool,
            "delta",
            vec![devices::scsi_controller(1000, 0), delta],
        );
        desired.id = 8;
        desired.placement.template = template;
        let vm = setup.provisioner.clone_vm(&desired).await.unwrap();
        let disk = LiveDisk::scan(&setup.fake.vm_info(&vm).unwrap().devices)
            .remove(0);
        let DeviceKind::Disk { backing, .. } = disk.device.kind else {
            panic!("not a disk");
        };
        assert_eq!(
            backing.parent.unwrap().file_name,
            "[ds0] templates/base-delta.vmdk"
        );
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_clone_replaces_stale_vm_keeping_persistent_disks() {
        let logctx = test_setup_log(
            "test_clone_replaces_stale_vm_keeping_persistent_disks",
        );
        let setup = setup(&logctx.log).await;
        let fake = &setup.fake;
        let pool = fake.root_pool(&setup.cluster).unwrap();
        let persistent = "[ds0] images/data.vmdk";
        let scratch = "[ds0] one-7-myvm/scratch.vmdk";
        setup.images.add_persistent_image("images/data.vmdk");
        let stale = fake.add_vm(
            &setup.host,
            &pool,
            "one-7-myvm",
            vec![
                devices::scsi_controller(1000, 0),
                devices::disk(2000, 1000, 0, scratch, &setup.ds, 1 << 20),
                devices::disk(2001, 1000, 1, persistent, &setup.ds, 1 << 20),
            ],
        );

        let vm = setup.provisioner.clone_vm(&desired(&setup)).await.unwrap();
        assert_ne!(vm, stale);
        assert_eq!(fake.vms_named("one-7-myvm"), vec![vm]);
        assert!(fake.file_exists(persistent));
        assert!(!fake.file_exists(scratch));
        assert_eq!(fake.call_count(VimOp::CloneVm), 2);
        assert_eq!(fake.call_count(VimOp::DestroyVm), 1);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_clone_retries_duplicate_name_once() {
        let logctx = test_setup_log("test_clone_retries_duplicate_name_once");
        let setup = setup(&logctx.log).await;
        setup.fake.fail_next(VimOp::CloneVm, Fault::DuplicateName);
        setup.fake.fail_next(VimOp::CloneVm, Fault::DuplicateName);

        let err =
            setup.provisioner.clone_vm(&desired(&setup)).await.unwrap_err();
        assert_matches!(
            err,
            Error::Vim(VimError { fault: Fault::DuplicateName, .. })
        );
        assert_eq!(setup.fake.call_count(VimOp::CloneVm), 2);
        assert_eq!(setup.fake.call_count(VimOp::DestroyVm), 0);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_clone_into_storage_pod() {
        let logctx = test_setup_log("test_clone_into_storage_pod");
        let setup = setup(&logctx.log).await;
        let pod = setup.fake.add_storage_pod(&[setup.ds.clone()]);
        let mut desired = desired(&setup);
        desired.placement.datastore = Some(DatastoreTarget::Pod(pod));
        desired.placement.linked_clone = true;
        setup
            .fake
            .fail_next(VimOp::ApplyRecommendation, Fault::DuplicateName);

        let vm = setup.provisioner.clone_vm(&desired).await.unwrap();
        assert_eq!(setup.fake.call_count(VimOp::CloneVm), 0);
        assert_eq!(setup.fake.call_count(VimOp::ApplyRecommendation), 2);
        let info = setup.fake.vm_info(&vm).unwrap();
        assert_eq!(
            LiveDisk::scan(&info.devices)[0].file_name,
            "[ds0] one-7-myvm/one-7-myvm.vmdk"
        );
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_reference_unmanaged_devices() {
        let logctx = test_setup_log("test_reference_unmanaged_devices");
        let setup = setup(&logctx.log).await;
        let desired = desired(&setup);
        let vm = setup.provisioner.clone_vm(&desired).await.unwrap();

        setup
            .provisioner
            .reference_unmanaged_devices(&vm, &desired)
            .await
            .unwrap();
        let info = setup.fake.vm_info(&vm).unwrap();
        let keys = UnmanagedKeyMap::from_extra_config(&info.extra_config);
        let disk = LiveDisk::scan(&info.devices).remove(0);
        assert_eq!(keys.get(0), Some(disk.key()));
        let nics = LiveNic::scan(&info.devices);
        assert_eq!(nics[0].mac, Some(MacAddr6::new(2, 0, 0xa, 0, 0, 7)));

        // Everything is in place the second time around.
        let calls = setup.fake.call_count(VimOp::ReconfigureVm);
        setup
            .provisioner
            .reference_unmanaged_devices(&vm, &desired)
            .await
            .unwrap();
        assert_eq!(setup.fake.call_count(VimOp::ReconfigureVm), calls);

        // A stale key is rewritten.
        setup.fake.set_extra_config(&vm, &annotations::disk_key(0), "1");
        setup
            .provisioner
            .reference_unmanaged_devices(&vm, &desired)
            .await
            .unwrap();
        assert_eq!(setup.fake.call_count(VimOp::ReconfigureVm), calls + 1);
        let info = setup.fake.vm_info(&vm).unwrap();
        let keys = UnmanagedKeyMap::from_extra_config(&info.extra_config);
        assert_eq!(keys.get(0), Some(disk.key()));
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_unmanaged_disk_must_come_from_template() {
        let logctx =
            test_setup_log("test_unmanaged_disk_must_come_from_template");
        let setup = setup(&logctx.log).await;
        let mut desired = desired(&setup);
        let vm = setup.provisioner.clone_vm(&desired).await.unwrap();
        desired.disks[0].source = Some("templates/other.vmdk".to_string());

        let err = setup
            .provisioner
            .reference_unmanaged_devices(&vm, &desired)
            .await
            .unwrap_err();
        assert_matches!(
            err,
            Error::UnmanagedDiskNotInTemplate { disk_id: 0, .. }
        );
        logctx.cleanup_successful();
    }
}
