// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Port groups on distributed switches.
//!
//! Distributed switches belong to the datacenter, so changes to them are
//! made under the datacenter's lock. Joining the VM's host to the switch is
//! a host change and additionally takes the host's lock.

use super::NetworkError;
use super::NetworkProvisioner;
use super::RollbackAction;
use super::Transaction;
use super::remote;
use super::switch_change_conflict;
use crate::desired::VcenterNetwork;
use crate::lock::LockTarget;
use crate::poll;
use crate::poll::CondCheckError;
use slog::Logger;
use slog::debug;
use slog::info;
use slog::o;
use std::time::Duration;
use vcenter_api::DatacenterRef;
use vcenter_api::DistributedPortGroupInfo;
use vcenter_api::DistributedPortGroupSpec;
use vcenter_api::DistributedSwitchInfo;
use vcenter_api::DistributedSwitchSpec;
use vcenter_api::HostInfo;
use vcenter_api::HostRef;
use vcenter_api::NetworkRef;
use vcenter_api::PortBinding;
use vcenter_api::ProxySwitch;
use vcenter_api::VimError;

const PORT_GROUP_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Name given to the port group holding a new switch's uplink ports.
pub fn uplink_port_group_name(switch_name: &str) -> String {
    format!("{switch_name}-uplink-pg")
}

impl NetworkProvisioner {
    /// The datacenter `host` belongs to, with its name.
    pub(super) async fn datacenter_of(
        &self,
        host: &HostInfo,
    ) -> Result<(DatacenterRef, String), NetworkError> {
        let cluster = self
            .vim
            .cluster(&host.cluster)
            .await
            .map_err(remote("query", &host.cluster))?;
        let dc = self
            .vim
            .datacenter(&cluster.datacenter)
            .await
            .map_err(remote("query", &cluster.datacenter))?;
        Ok((cluster.datacenter, dc.name))
    }

    pub(super) async fn ensure_distributed(
        &self,
        host: &HostRef,
        port_group: &str,
        network: &VcenterNetwork,
        instance_uuid: &str,
    ) -> Result<(), NetworkError> {
        let host_info =
            self.vim.host(host).await.map_err(remote("query", host))?;
        let (dc, dc_name) = self.datacenter_of(&host_info).await?;
        let log = self.log.new(o!(
            "datacenter" => dc_name.clone(),
            "host" => host_info.name.clone(),
            "port_group" => port_group.to_string(),
        ));
        let _guard = self.locks.acquire(&LockTarget::Datacenter(dc_name)).await;
        let mut txn = Transaction::new(&log);
        let result = self
            .ensure_distributed_locked(
                &log,
                &mut txn,
                &dc,
                host,
                &host_info,
                port_group,
                network,
                instance_uuid,
            )
            .await;
        txn.finish(self.vim.as_ref(), result).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn ensure_distributed_locked(
        &self,
        log: &Logger,
        txn: &mut Transaction,
        dc: &DatacenterRef,
        host: &HostRef,
        host_info: &HostInfo,
        port_group: &str,
        network: &VcenterNetwork,
        instance_uuid: &str,
    ) -> Result<(), NetworkError> {
        let port_groups = self
            .vim
            .distributed_port_groups(dc)
            .await
            .map_err(remote("list distributed port groups of", dc))?;
        let switches = self
            .vim
            .distributed_switches(dc)
            .await
            .map_err(remote("list distributed switches of", dc))?;
        let existing = port_groups
            .into_iter()
            .find(|pg| !pg.uplink && pg.spec.name == port_group);
        let switch = switches
            .into_iter()
            .find(|s| s.spec.name == network.switch_name);

        let vlan_id = network.vlan_id.unwrap_or(0);
        let num_ports = network
            .num_ports
            .unwrap_or(self.config.distributed_port_group_ports);

        let (switch, reference) = match existing {
            Some(existing) => {
                if existing.switch_name != network.switch_name {
                    return Err(switch_change_conflict(
                        port_group,
                        &existing.switch_name,
                        &network.switch_name,
                    )
                    .into());
                }
                self.update_port_group(log, txn, &existing, vlan_id, num_ports)
                    .await?;
                if let Some(switch) = &switch {
                    self.update_switch(log, txn, switch, network).await?;
                }
                (switch, existing.reference)
            }
            None => {
                let switch = match switch {
                    Some(switch) => {
                        self.update_switch(log, txn, &switch, network).await?;
                        switch
                    }
                    None => self.create_switch(log, txn, dc, network).await?,
                };
                let spec = DistributedPortGroupSpec {
                    name: port_group.to_string(),
                    num_ports,
                    vlan_id,
                    binding: PortBinding::EarlyBinding,
                    auto_expand: true,
                };
                let reference = self
                    .create_port_group(log, txn, dc, &switch, &spec)
                    .await?;
                (Some(switch), reference)
            }
        };

        if let Some(switch) = &switch {
            let _guard = self
                .locks
                .acquire(&LockTarget::Host(host_info.name.clone()))
                .await;
            self.join_switch(log, host, switch, network).await?;
        }

        self.catalog
            .record_network_ref(network.network_id, &reference, instance_uuid)
            .await
            .map_err(|err| NetworkError::Catalog {
                network_id: network.network_id,
                port_group: reference.clone(),
                err,
            })
    }

    async fn create_switch(
        &self,
        log: &Logger,
        txn: &mut Transaction,
        dc: &DatacenterRef,
        network: &VcenterNetwork,
    ) -> Result<DistributedSwitchInfo, NetworkError> {
        let spec = DistributedSwitchSpec {
            name: network.switch_name.clone(),
            uplink_port_names: DistributedSwitchSpec::uplink_names(
                network.pnics.len(),
            ),
            max_mtu: network.mtu.unwrap_or(self.config.default_mtu),
        };
        let switch = self
            .vim
            .create_distributed_switch(dc, &spec)
            .await
            .map_err(remote("create distributed switch", &spec.name))?;
        txn.record(RollbackAction::CreateDistributedSwitch {
            dvs: switch.reference.clone(),
            name: spec.name.clone(),
        });
        info!(
            log,
            "created distributed switch";
            "switch" => &spec.name,
            "dvs" => %switch.reference,
        );
        if let Some(uplink) = &switch.uplink_port_group {
            let name = uplink_port_group_name(&spec.name);
            self.vim
                .rename_distributed_port_group(uplink, &name)
                .await
                .map_err(remote("rename uplink port group", uplink))?;
        }
        Ok(switch)
    }

    /// Grows the switch's uplink ports to the number of requested physical
    /// NICs and sets its MTU.
    async fn update_switch(
        &self,
        log: &Logger,
        txn: &mut Transaction,
        switch: &DistributedSwitchInfo,
        network: &VcenterNetwork,
    ) -> Result<(), NetworkError> {
        let mut spec = switch.spec.clone();
        if spec.uplink_port_names.len() < network.pnics.len() {
            spec.uplink_port_names =
                DistributedSwitchSpec::uplink_names(network.pnics.len());
        }
        spec.max_mtu = network.mtu.unwrap_or(self.config.default_mtu);
        if spec == switch.spec {
            return Ok(());
        }
        self.vim
            .reconfigure_distributed_switch(&switch.reference, &spec)
            .await
            .map_err(remote("update distributed switch", &spec.name))?;
        txn.record(RollbackAction::UpdateDistributedSwitch {
            dvs: switch.reference.clone(),
            prior: switch.spec.clone(),
        });
        info!(
            log,
            "updated distributed switch";
            "switch" => &spec.name,
            "uplinks" => spec.uplink_port_names.len(),
            "max_mtu" => spec.max_mtu,
        );
        Ok(())
    }

    async fn update_port_group(
        &self,
        log: &Logger,
        txn: &mut Transaction,
        existing: &DistributedPortGroupInfo,
        vlan_id: u16,
        num_ports: u32,
    ) -> Result<(), NetworkError> {
        let spec = DistributedPortGroupSpec {
            num_ports,
            vlan_id,
            binding: PortBinding::EarlyBinding,
            ..existing.spec.clone()
        };
        if spec == existing.spec {
            return Ok(());
        }
        self.vim
            .reconfigure_distributed_port_group(&existing.reference, &spec)
            .await
            .map_err(remote("update distributed port group", &spec.name))?;
        txn.record(RollbackAction::UpdateDistributedPortGroup {
            port_group: existing.reference.clone(),
            prior: existing.spec.clone(),
        });
        info!(
            log,
            "updated distributed port group";
            "vlan_id" => vlan_id,
            "num_ports" => num_ports,
        );
        Ok(())
    }

    /// Adds the port group and waits for the switch to list it, which is
    /// the only way to learn its reference.
    ///
    /// The port group exists from the moment it is added, so it is undone
    /// by name even if it never shows up.
    async fn create_port_group(
        &self,
        log: &Logger,
        txn: &mut Transaction,
        dc: &DatacenterRef,
        switch: &DistributedSwitchInfo,
        spec: &DistributedPortGroupSpec,
    ) -> Result<NetworkRef, NetworkError> {
        self.vim
            .add_distributed_port_group(&switch.reference, spec)
            .await
            .map_err(remote("create distributed port group", &spec.name))?;
        txn.record(RollbackAction::CreateDistributedPortGroup {
            dc: dc.clone(),
            switch: switch.reference.clone(),
            name: spec.name.clone(),
        });

        let timeout = self.config.port_group_visibility_timeout();
        let created = poll::wait_for_condition(
            || async {
                let listed = self
                    .vim
                    .switch_port_groups(&switch.reference)
                    .await
                    .map_err(CondCheckError::Failed)?;
                match listed.into_iter().find(|pg| pg.spec.name == spec.name) {
                    Some(pg) => Ok(pg.reference),
                    None => {
                        debug!(log, "port group not listed yet");
                        Err(CondCheckError::<VimError>::NotYet)
                    }
                }
            },
            &PORT_GROUP_POLL_INTERVAL,
            &timeout,
        )
        .await;
        let reference = match created {
            Ok(reference) => reference,
            Err(poll::Error::TimedOut(_)) => {
                return Err(NetworkError::NotVisible {
                    name: spec.name.clone(),
                    switch: switch.spec.name.clone(),
                    timeout,
                });
            }
            Err(poll::Error::PermanentError(err)) => {
                return Err(NetworkError::Remote {
                    action: "list port groups of",
                    object: switch.spec.name.clone(),
                    err,
                });
            }
        };
        info!(
            log,
            "created distributed port group";
            "network" => %reference,
        );
        Ok(reference)
    }

    /// Makes `host` a member of `switch`, binding the requested physical
    /// NICs that are still free.
    async fn join_switch(
        &self,
        log: &Logger,
        host: &HostRef,
        switch: &DistributedSwitchInfo,
        network: &VcenterNetwork,
    ) -> Result<(), NetworkError> {
        let config = self
            .vim
            .host_network_config(host)
            .await
            .map_err(remote("query the network configuration of", host))?;
        let available = config.available_pnics();
        let current = config
            .proxy_switches
            .iter()
            .find(|ps| ps.dvs_uuid == switch.uuid);
        let mut uplinks =
            current.map(|ps| ps.uplinks.clone()).unwrap_or_default();
        for pnic in &network.pnics {
            if available.contains(pnic) && !uplinks.contains(pnic) {
                uplinks.push(pnic.clone());
            }
        }
        let proxy = ProxySwitch {
            dvs_uuid: switch.uuid.clone(),
            dvs_name: switch.spec.name.clone(),
            uplinks,
        };
        if current == Some(&proxy) {
            return Ok(());
        }
        self.vim
            .update_proxy_switch(host, &proxy)
            .await
            .map_err(remote("join distributed switch from", host))?;
        info!(
            log,
            "host joined distributed switch";
            "switch" => &proxy.dvs_name,
            "uplinks" => ?proxy.uplinks,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::Setup;
    use super::super::tests::managed_nic;
    use super::super::tests::setup;
    use super::*;
    use crate::desired::PortGroupType;
    use crate::error::ConfigurationConflict;
    use crate::test_util::test_setup_log;
    use assert_matches::assert_matches;
    use vcenter_api::Fault;
    use vcenter_api::NetworkType;
    use vcenter_api::VimApi;
    use vcenter_api::VimOp;

    #[tokio::test]
    async fn test_creates_switch_and_port_group() {
        let logctx = test_setup_log("test_creates_dvs_and_port_group");
        let Setup { fake, catalog, host, provisioner } = setup(&logctx.log);
        let nic = managed_nic(1, "dpg0", PortGroupType::Distributed, "dvs0");
        catalog.add_network("dpg0", nic.vcenter_network.as_ref().unwrap());

        provisioner.ensure_network(&host, &nic).await.unwrap();

        let switch = fake.distributed_switch_named("dvs0").unwrap();
        assert_eq!(switch.spec.uplink_port_names, vec!["dvUplink1"]);
        assert_eq!(switch.spec.max_mtu, 1500);
        let snapshot = fake.network_snapshot();
        let (uplink_switch, _) =
            snapshot.port_groups.get("dvs0-uplink-pg").unwrap();
        assert_eq!(uplink_switch, "dvs0");
        let pg = fake.distributed_port_group_named("dpg0").unwrap();
        assert_eq!(pg.spec.vlan_id, 100);
        assert_eq!(pg.spec.num_ports, 8);
        assert_eq!(pg.spec.binding, PortBinding::EarlyBinding);
        assert!(pg.spec.auto_expand);
        assert_eq!(catalog.reference(1), Some(pg.reference.clone()));

        let config = fake.host_network(&host).unwrap();
        let proxy = config.proxy_switch("dvs0").unwrap();
        assert_eq!(proxy.uplinks, vec!["vmnic1"]);

        // The VM's host can now see the port group.
        let info = fake.host(&host).await.unwrap();
        assert!(info.networks.iter().any(|n| {
            n.reference == pg.reference
                && matches!(n.network_type, NetworkType::Distributed { .. })
        }));
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_existing_port_group_on_other_switch() {
        let logctx = test_setup_log("test_existing_port_group_on_other_switch");
        let Setup { fake, catalog, host, provisioner } = setup(&logctx.log);
        let nic = managed_nic(1, "dpg0", PortGroupType::Distributed, "dvs0");
        catalog.add_network("dpg0", nic.vcenter_network.as_ref().unwrap());
        provisioner.ensure_network(&host, &nic).await.unwrap();
        let before = fake.network_snapshot();
        let calls = fake.calls().len();

        let moved = managed_nic(1, "dpg0", PortGroupType::Distributed, "dvs1");
        let err = provisioner.ensure_network(&host, &moved).await.unwrap_err();
        assert_matches!(
            err,
            NetworkError::Conflict(ConfigurationConflict {
                field: "switch_name",
                ..
            })
        );
        assert_eq!(fake.network_snapshot(), before);
        assert!(fake.calls()[calls..].iter().all(|op| matches!(
            op,
            VimOp::About
                | VimOp::Host
                | VimOp::Cluster
                | VimOp::Datacenter
                | VimOp::DistributedPortGroups
                | VimOp::DistributedSwitches
        )));
        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_port_group_to_show_up() {
        let logctx = test_setup_log("test_waits_for_port_group_to_show_up");
        let Setup { fake, catalog, host, provisioner } = setup(&logctx.log);
        let nic = managed_nic(1, "dpg0", PortGroupType::Distributed, "dvs0");
        catalog.add_network("dpg0", nic.vcenter_network.as_ref().unwrap());

        fake.set_port_group_visibility_delay(3);
        provisioner.ensure_network(&host, &nic).await.unwrap();
        assert_eq!(fake.call_count(VimOp::SwitchPortGroups), 4);
        assert!(catalog.reference(1).is_some());
        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn test_port_group_never_shows_up() {
        let logctx = test_setup_log("test_port_group_never_shows_up");
        let Setup { fake, catalog, host, provisioner } = setup(&logctx.log);
        let nic = managed_nic(1, "dpg0", PortGroupType::Distributed, "dvs0");
        catalog.add_network("dpg0", nic.vcenter_network.as_ref().unwrap());
        let before = fake.network_snapshot();

        fake.set_port_group_visibility_delay(1000);
        let err = provisioner.ensure_network(&host, &nic).await.unwrap_err();
        assert_matches!(err, NetworkError::NotVisible { .. });
        // The new switch is destroyed, and its port groups with it.
        assert_eq!(fake.call_count(VimOp::DestroyDistributedSwitch), 1);
        assert_eq!(fake.network_snapshot(), before);
        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn test_invisible_port_group_on_existing_switch_is_removed() {
        let logctx = test_setup_log(
            "test_invisible_port_group_on_existing_switch_is_removed",
        );
        let Setup { fake, catalog, host, provisioner } = setup(&logctx.log);
        let other =
            managed_nic(2, "dpg-other", PortGroupType::Distributed, "dvs0");
        let network = other.vcenter_network.as_ref().unwrap();
        catalog.add_network("dpg-other", network);
        provisioner.ensure_network(&host, &other).await.unwrap();
        let nic = managed_nic(1, "dpg0", PortGroupType::Distributed, "dvs0");
        catalog.add_network("dpg0", nic.vcenter_network.as_ref().unwrap());
        let before = fake.network_snapshot();

        fake.set_port_group_visibility_delay(1000);
        let err = provisioner.ensure_network(&host, &nic).await.unwrap_err();
        assert_matches!(err, NetworkError::NotVisible { .. });
        assert_eq!(fake.call_count(VimOp::DestroyDistributedSwitch), 0);
        assert_eq!(fake.call_count(VimOp::DestroyDistributedPortGroup), 1);
        assert!(fake.distributed_port_group_named("dpg0").is_none());
        assert_eq!(fake.network_snapshot(), before);
        assert_eq!(catalog.reference(1), None);

        // A retry starts from scratch and records the new port group.
        fake.set_port_group_visibility_delay(0);
        provisioner.ensure_network(&host, &nic).await.unwrap();
        let pg = fake.distributed_port_group_named("dpg0").unwrap();
        assert_eq!(catalog.reference(1), Some(pg.reference));
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_existing_port_group_is_recorded() {
        let logctx = test_setup_log("test_existing_port_group_is_recorded");
        let Setup { fake, catalog, host, provisioner } = setup(&logctx.log);
        let nic = managed_nic(1, "dpg0", PortGroupType::Distributed, "dvs0");
        catalog.add_network("dpg0", nic.vcenter_network.as_ref().unwrap());
        provisioner.ensure_network(&host, &nic).await.unwrap();
        let pg = fake.distributed_port_group_named("dpg0").unwrap();

        // The control plane lost track of the port group, e.g. after a
        // crash between creating it and recording it.
        catalog.add_network("dpg0", nic.vcenter_network.as_ref().unwrap());
        assert_eq!(catalog.reference(1), None);
        let before = fake.network_snapshot();
        provisioner.ensure_network(&host, &nic).await.unwrap();
        assert_eq!(fake.network_snapshot(), before);
        assert_eq!(fake.call_count(VimOp::AddDistributedPortGroup), 1);
        assert_eq!(catalog.reference(1), Some(pg.reference));
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_failed_join_reverts_port_group_update() {
        let logctx =
            test_setup_log("test_failed_join_reverts_port_group_update");
        let Setup { fake, catalog, host, provisioner } = setup(&logctx.log);
        let mut nic =
            managed_nic(1, "dpg0", PortGroupType::Distributed, "dvs0");
        catalog.add_network("dpg0", nic.vcenter_network.as_ref().unwrap());
        provisioner.ensure_network(&host, &nic).await.unwrap();
        let before = fake.network_snapshot();

        if let Some(network) = nic.vcenter_network.as_mut() {
            network.vlan_id = Some(300);
            network.pnics.push("vmnic2".to_string());
        }
        fake.fail_next(VimOp::UpdateProxySwitch, Fault::Other);
        let err = provisioner.ensure_network(&host, &nic).await.unwrap_err();
        assert_eq!(
            err.vim_error().map(|e| e.op),
            Some(VimOp::UpdateProxySwitch)
        );
        assert_eq!(fake.network_snapshot(), before);
        logctx.cleanup_successful();
    }
}
