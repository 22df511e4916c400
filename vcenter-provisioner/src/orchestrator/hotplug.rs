// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Adding and removing single disks and NICs on a live VM.

use super::Provisioner;
use crate::annotations::UnmanagedKeyMap;
use crate::annotations::clear_disk_key;
use crate::desired::DesiredVm;
use crate::desired::DiskDescriptor;
use crate::desired::NicDescriptor;
use crate::error::Error;
use crate::nic::add_nic_changes;
use crate::placement::place_disks;
use crate::reconciler::LiveDisk;
use crate::reconciler::LiveNic;
use crate::reconciler::PlaceholderKeys;
use crate::reconciler::attach_spec;
use crate::reconciler::plan_disks;
use macaddr::MacAddr6;
use slog::debug;
use slog::info;
use std::collections::BTreeSet;
use std::slice;
use vcenter_api::DatastoreRef;
use vcenter_api::DeviceChange;
use vcenter_api::VmConfigSpec;
use vcenter_api::VmRef;

/// Where the file of a detached disk lives; the file itself is left alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachedDisk {
    pub datastore: Option<DatastoreRef>,
    /// Backing file path without the datastore.
    pub path: String,
}

impl Provisioner {
    pub async fn attach_disk(
        &self,
        vm: &VmRef,
        desired: &DesiredVm,
        disk: &DiskDescriptor,
    ) -> Result<(), Error> {
        let log = self.vm_log(vm);
        let mut info = self.vim.vm(vm).await?;
        let vm_name = info.name.clone();
        let paths = self.paths(desired.id, &vm_name);
        let keys = UnmanagedKeyMap::from_extra_config(&info.extra_config);
        let plan = plan_disks(
            slice::from_ref(disk),
            &LiveDisk::scan(&info.devices),
            &keys,
            &paths,
        )?;
        if plan.attach.is_empty() {
            return Err(Error::DiskAlreadyAttached {
                vm: vm_name,
                disk_id: disk.disk_id,
            });
        }

        let attach = attach_spec(
            self.vim.as_ref(),
            &log,
            vm,
            &mut info,
            &plan.attach,
            desired.placement.datastore.as_ref(),
            &paths,
            &mut PlaceholderKeys::default(),
        )
        .await?;
        let mut spec = VmConfigSpec {
            device_change: attach.device_change,
            ..VmConfigSpec::default()
        };
        for (pod, disks) in &attach.pod_disks {
            let placed =
                place_disks(self.vim.as_ref(), &log, vm, pod, disks).await?;
            spec.extra_config.extend(placed);
        }
        if !spec.is_empty() {
            self.vim.reconfigure_vm(vm, &spec).await?;
        }
        info!(log, "attached disk"; "disk_id" => disk.disk_id);
        Ok(())
    }

    /// Removes `disk` from `vm` without deleting its file, and forgets the
    /// device key recorded for it.
    pub async fn detach_disk(
        &self,
        vm: &VmRef,
        desired: &DesiredVm,
        disk: &DiskDescriptor,
    ) -> Result<DetachedDisk, Error> {
        let log = self.vm_log(vm);
        let info = self.vim.vm(vm).await?;
        let keys = UnmanagedKeyMap::from_extra_config(&info.extra_config);
        let plan = plan_disks(
            slice::from_ref(disk),
            &LiveDisk::scan(&info.devices),
            &keys,
            &self.paths(desired.id, &info.name),
        )?;
        let Some((_, live)) = plan.matched.into_iter().next() else {
            return Err(Error::DiskNotAttached {
                vm: info.name,
                disk_id: disk.disk_id,
            });
        };

        let mut spec = VmConfigSpec {
            device_change: vec![DeviceChange::remove(live.device.clone())],
            ..VmConfigSpec::default()
        };
        if let Some(disk_id) = keys.disk_for_key(live.key()) {
            spec.extra_config.push(clear_disk_key(disk_id));
        }
        self.vim.reconfigure_vm(vm, &spec).await?;
        info!(
            log,
            "detached disk";
            "disk_id" => disk.disk_id,
            "file" => &live.file_name,
        );
        Ok(DetachedDisk { datastore: live.datastore, path: live.path })
    }

    /// Adds `nic` to `vm`, provisioning its network first. A NIC with the
    /// same MAC already on the VM is left as it is.
    pub async fn attach_nic(
        &self,
        vm: &VmRef,
        nic: &NicDescriptor,
    ) -> Result<(), Error> {
        let log = self.vm_log(vm);
        let info = self.vim.vm(vm).await?;
        if LiveNic::scan(&info.devices).iter().any(|n| n.mac == Some(nic.mac))
        {
            debug!(log, "NIC already attached"; "mac" => %nic.mac);
            return Ok(());
        }

        self.networks.ensure_network(&info.host, nic).await?;
        let host = self.vim.host(&info.host).await?;
        let spec = VmConfigSpec {
            device_change: add_nic_changes(
                slice::from_ref(nic),
                &host,
                &info.devices,
                &self.config,
                &mut PlaceholderKeys::default(),
            )?,
            ..VmConfigSpec::default()
        };
        self.vim.reconfigure_vm(vm, &spec).await?;
        info!(
            log,
            "attached NIC";
            "nic_id" => nic.nic_id,
            "mac" => %nic.mac,
            "network" => &nic.bridge,
        );
        Ok(())
    }

    /// Removes the NIC with address `mac` from `vm`; nothing happens when
    /// there is none.
    pub async fn detach_nic(
        &self,
        vm: &VmRef,
        mac: MacAddr6,
    ) -> Result<(), Error> {
        let log = self.vm_log(vm);
        let info = self.vim.vm(vm).await?;
        let Some(live) = LiveNic::scan(&info.devices)
            .into_iter()
            .find(|n| n.mac == Some(mac))
        else {
            debug!(log, "NIC to detach not found"; "mac" => %mac);
            return Ok(());
        };

        let spec = VmConfigSpec {
            device_change: vec![DeviceChange::remove(live.device)],
            ..VmConfigSpec::default()
        };
        self.vim.reconfigure_vm(vm, &spec).await?;
        info!(log, "detached NIC"; "mac" => %mac);
        let networks = BTreeSet::from([live.network]);
        self.tear_down_networks(&log, &info.host, networks).await
    }

    pub async fn detach_all_nics(&self, vm: &VmRef) -> Result<(), Error> {
        let log = self.vm_log(vm);
        let info = self.vim.vm(vm).await?;
        let nics = LiveNic::scan(&info.devices);
        if nics.is_empty() {
            return Ok(());
        }

        let spec = VmConfigSpec {
            device_change: nics
                .iter()
                .map(|n| DeviceChange::remove(n.device.clone()))
                .collect(),
            ..VmConfigSpec::default()
        };
        self.vim.reconfigure_vm(vm, &spec).await?;
        info!(log, "detached all NICs"; "count" => nics.len());
        let networks = nics.into_iter().map(|n| n.network).collect();
        self.tear_down_networks(&log, &info.host, networks).await
    }
}
