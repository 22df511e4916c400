// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bringing a live VM in line with its desired configuration.

use super::Provisioner;
use crate::annotations;
use crate::annotations::UnmanagedKeyMap;
use crate::desired::DesiredVm;
use crate::error::Error;
use crate::nic::add_nic_changes;
use crate::placement::place_disks;
use crate::reconciler::LiveDisk;
use crate::reconciler::LiveNic;
use crate::reconciler::PlaceholderKeys;
use crate::reconciler::attach_spec;
use crate::reconciler::detach_spec;
use crate::reconciler::plan_disks;
use crate::reconciler::plan_nics;
use crate::reconciler::resize_changes;
use slog::Logger;
use slog::info;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use vcenter_api::DeviceChange;
use vcenter_api::HostRef;
use vcenter_api::NetworkRef;
use vcenter_api::OptionValue;
use vcenter_api::VmConfigSpec;
use vcenter_api::VmInfo;
use vcenter_api::VmRef;

/// The options among `options` whose value differs from the VM's.
fn changed_options(
    extra_config: &BTreeMap<String, String>,
    options: Vec<OptionValue>,
) -> impl Iterator<Item = OptionValue> + '_ {
    options.into_iter().filter(move |option| {
        extra_config.get(&option.key).map(String::as_str).unwrap_or("")
            != option.value
    })
}

impl Provisioner {
    /// Reconfigures `vm` to match `desired`.
    ///
    /// Everything goes into a single reconfiguration, which is skipped when
    /// the VM already matches. On the VM's first reconfiguration, disks and
    /// NICs it should not have are removed by a separate call beforehand.
    /// Managed networks that lost a NIC are torn down afterwards unless
    /// something else still uses them.
    pub async fn reconfigure(
        &self,
        vm: &VmRef,
        desired: &DesiredVm,
        first_time: bool,
    ) -> Result<(), Error> {
        let log = self.vm_log(vm);
        let mut info = self.vim.vm(vm).await?;
        let mut detached_networks = BTreeSet::new();

        if first_time {
            let removed =
                self.detach_dropped_devices(&log, vm, &info, desired).await?;
            if let Some(networks) = removed {
                detached_networks.extend(networks);
                info = self.vim.vm(vm).await?;
            }
        }

        let vm_name = info.name.clone();
        let paths = self.paths(desired.id, &vm_name);
        let keys = UnmanagedKeyMap::from_extra_config(&info.extra_config);
        let disk_plan = plan_disks(
            &desired.disks,
            &LiveDisk::scan(&info.devices),
            &keys,
            &paths,
        )?;
        let nic_plan =
            plan_nics(&desired.nics, &LiveNic::scan(&info.devices));

        let mut spec = VmConfigSpec::default();
        let cpus = desired.cpus.unwrap_or(1);
        if info.num_cpus != cpus {
            spec.num_cpus = Some(cpus);
        }
        if info.memory_mb != desired.memory_mb {
            spec.memory_mb = Some(desired.memory_mb);
        }
        let mut options = vec![annotations::context(desired)];
        options.extend(annotations::vnc(desired.graphics.as_ref()));
        spec.extra_config.extend(changed_options(&info.extra_config, options));

        let detach =
            detach_spec(self.images.as_ref(), &log, &disk_plan.detach, &keys)
                .await?;
        spec.device_change.extend(detach.device_change);
        spec.extra_config.extend(detach.extra_config);
        for nic in &nic_plan.detach {
            info!(log, "detaching NIC"; "mac" => ?nic.mac);
            spec.device_change.push(DeviceChange::remove(nic.device.clone()));
            detached_networks.insert(nic.network.clone());
        }

        let mut placeholders = PlaceholderKeys::default();
        if !nic_plan.attach.is_empty() {
            for nic in &nic_plan.attach {
                self.networks.ensure_network(&info.host, nic).await?;
            }
            let host = self.vim.host(&info.host).await?;
            spec.device_change.extend(add_nic_changes(
                &nic_plan.attach,
                &host,
                &info.devices,
                &self.config,
                &mut placeholders,
            )?);
        }

        spec.device_change.extend(resize_changes(&log, &disk_plan.matched));
        let attach = attach_spec(
            self.vim.as_ref(),
            &log,
            vm,
            &mut info,
            &disk_plan.attach,
            desired.placement.datastore.as_ref(),
            &paths,
            &mut placeholders,
        )
        .await?;
        spec.device_change.extend(attach.device_change);
        for (pod, disks) in &attach.pod_disks {
            let placed =
                place_disks(self.vim.as_ref(), &log, vm, pod, disks).await?;
            spec.extra_config.extend(placed);
        }

        if !spec.is_empty() {
            self.vim.reconfigure_vm(vm, &spec).await?;
            info!(
                log,
                "reconfigured VM";
                "device_changes" => spec.device_change.len(),
                "options" => spec.extra_config.len(),
            );
        }

        self.tear_down_networks(&log, &info.host, detached_networks).await
    }

    /// Removes the disks and NICs of `vm` that `desired` no longer has.
    /// Returns the networks of the removed NICs, or `None` when nothing had
    /// to go.
    async fn detach_dropped_devices(
        &self,
        log: &Logger,
        vm: &VmRef,
        info: &VmInfo,
        desired: &DesiredVm,
    ) -> Result<Option<Vec<NetworkRef>>, Error> {
        let keys = UnmanagedKeyMap::from_extra_config(&info.extra_config);
        let disk_plan = plan_disks(
            &desired.disks,
            &LiveDisk::scan(&info.devices),
            &keys,
            &self.paths(desired.id, &info.name),
        )?;
        let nic_plan =
            plan_nics(&desired.nics, &LiveNic::scan(&info.devices));
        if disk_plan.detach.is_empty() && nic_plan.detach.is_empty() {
            return Ok(None);
        }

        let mut spec =
            detach_spec(self.images.as_ref(), log, &disk_plan.detach, &keys)
                .await?;
        spec.device_change.extend(
            nic_plan
                .detach
                .iter()
                .map(|nic| DeviceChange::remove(nic.device.clone())),
        );
        self.vim.reconfigure_vm(vm, &spec).await?;
        info!(
            log,
            "removed devices missing from the desired VM";
            "disks" => disk_plan.detach.len(),
            "nics" => nic_plan.detach.len(),
        );
        Ok(Some(nic_plan.detach.into_iter().map(|n| n.network).collect()))
    }

    /// Tears down the infrastructure of managed networks among `networks`.
    pub(super) async fn tear_down_networks(
        &self,
        log: &Logger,
        host: &HostRef,
        networks: BTreeSet<NetworkRef>,
    ) -> Result<(), Error> {
        if networks.is_empty() {
            return Ok(());
        }
        let about = self.vim.about().await?;
        for network in networks {
            let managed = self
                .catalog
                .managed_network(&network, &about.instance_uuid)
                .await
                .map_err(Error::NetworkCatalog)?;
            let Some(managed) = managed else {
                continue;
            };
            info!(
                log,
                "tearing down network that lost a NIC";
                "network_id" => managed.network_id,
                "port_group" => &managed.port_group_name,
            );
            self.networks.remove_network(host, &network, &managed).await?;
        }
        Ok(())
    }
}
