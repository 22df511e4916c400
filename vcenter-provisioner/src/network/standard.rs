// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Port groups on standard switches.

use super::NetworkError;
use super::NetworkProvisioner;
use super::RollbackAction;
use super::Transaction;
use super::remote;
use super::switch_change_conflict;
use crate::desired::VcenterNetwork;
use crate::lock::LockTarget;
use slog::Logger;
use slog::info;
use slog::o;
use vcenter_api::HostNetworkConfig;
use vcenter_api::HostRef;
use vcenter_api::PortGroupSpec;
use vcenter_api::VirtualSwitch;
use vcenter_api::VirtualSwitchSpec;

impl NetworkProvisioner {
    pub(super) async fn ensure_standard(
        &self,
        host: &HostRef,
        port_group: &str,
        network: &VcenterNetwork,
        instance_uuid: &str,
    ) -> Result<(), NetworkError> {
        let host_info =
            self.vim.host(host).await.map_err(remote("query", host))?;
        let log = self.log.new(o!(
            "host" => host_info.name.clone(),
            "port_group" => port_group.to_string(),
        ));
        let _guard =
            self.locks.acquire(&LockTarget::Host(host_info.name.clone())).await;
        let mut txn = Transaction::new(&log);
        let result = self
            .ensure_standard_locked(
                &log,
                &mut txn,
                host,
                port_group,
                network,
                instance_uuid,
            )
            .await;
        txn.finish(self.vim.as_ref(), result).await
    }

    async fn ensure_standard_locked(
        &self,
        log: &Logger,
        txn: &mut Transaction,
        host: &HostRef,
        port_group: &str,
        network: &VcenterNetwork,
        instance_uuid: &str,
    ) -> Result<(), NetworkError> {
        let config = self
            .vim
            .host_network_config(host)
            .await
            .map_err(remote("query the network configuration of", host))?;
        let vlan_id = network.vlan_id.unwrap_or(0);

        if let Some(existing) = config.port_group(port_group) {
            if existing.vswitch_name != network.switch_name {
                return Err(switch_change_conflict(
                    port_group,
                    &existing.vswitch_name,
                    &network.switch_name,
                )
                .into());
            }
            if existing.vlan_id != vlan_id {
                let spec = PortGroupSpec { vlan_id, ..existing.clone() };
                self.vim
                    .update_port_group(host, port_group, &spec)
                    .await
                    .map_err(remote("update port group", port_group))?;
                txn.record(RollbackAction::UpdatePortGroup {
                    host: host.clone(),
                    prior: existing.clone(),
                });
                info!(log, "updated port group"; "vlan_id" => vlan_id);
            }
            if let Some(vswitch) = config.vswitch(&network.switch_name) {
                self.update_vswitch(log, txn, host, &config, vswitch, network)
                    .await?;
            }
            return Ok(());
        }

        match config.vswitch(&network.switch_name) {
            Some(vswitch) => {
                self.update_vswitch(log, txn, host, &config, vswitch, network)
                    .await?
            }
            None => {
                self.create_vswitch(log, txn, host, &config, network).await?
            }
        }

        let spec = PortGroupSpec {
            name: port_group.to_string(),
            vswitch_name: network.switch_name.clone(),
            vlan_id,
        };
        let reference = self
            .vim
            .add_port_group(host, &spec)
            .await
            .map_err(remote("create port group", port_group))?;
        txn.record(RollbackAction::CreatePortGroup {
            host: host.clone(),
            name: port_group.to_string(),
        });
        info!(log, "created port group"; "network" => %reference);

        self.catalog
            .record_network_ref(network.network_id, &reference, instance_uuid)
            .await
            .map_err(|err| NetworkError::Catalog {
                network_id: network.network_id,
                port_group: reference.clone(),
                err,
            })
    }

    async fn create_vswitch(
        &self,
        log: &Logger,
        txn: &mut Transaction,
        host: &HostRef,
        config: &HostNetworkConfig,
        network: &VcenterNetwork,
    ) -> Result<(), NetworkError> {
        let available = config.available_pnics();
        let spec = VirtualSwitchSpec {
            num_ports: network
                .num_ports
                .unwrap_or(self.config.standard_switch_ports),
            mtu: network.mtu.unwrap_or(self.config.default_mtu),
            uplinks: network
                .pnics
                .iter()
                .filter(|pnic| available.contains(pnic))
                .cloned()
                .collect(),
        };
        self.vim
            .add_virtual_switch(host, &network.switch_name, &spec)
            .await
            .map_err(remote("create switch", &network.switch_name))?;
        txn.record(RollbackAction::CreateVirtualSwitch {
            host: host.clone(),
            name: network.switch_name.clone(),
        });
        info!(
            log,
            "created switch";
            "switch" => &network.switch_name,
            "uplinks" => ?spec.uplinks,
        );
        Ok(())
    }

    /// Brings an existing switch in line with the network: adds requested
    /// uplinks that are still free and sets the port count and MTU.
    async fn update_vswitch(
        &self,
        log: &Logger,
        txn: &mut Transaction,
        host: &HostRef,
        config: &HostNetworkConfig,
        vswitch: &VirtualSwitch,
        network: &VcenterNetwork,
    ) -> Result<(), NetworkError> {
        let available = config.available_pnics();
        let mut spec = vswitch.spec.clone();
        for pnic in &network.pnics {
            if available.contains(pnic) && !spec.uplinks.contains(pnic) {
                spec.uplinks.push(pnic.clone());
            }
        }
        spec.num_ports =
            network.num_ports.unwrap_or(self.config.standard_switch_ports);
        spec.mtu = network.mtu.unwrap_or(self.config.default_mtu);
        if spec == vswitch.spec {
            return Ok(());
        }
        self.vim
            .update_virtual_switch(host, &vswitch.name, &spec)
            .await
            .map_err(remote("update switch", &vswitch.name))?;
        txn.record(RollbackAction::UpdateVirtualSwitch {
            host: host.clone(),
            name: vswitch.name.clone(),
            prior: vswitch.spec.clone(),
        });
        info!(
            log,
            "updated switch";
            "switch" => &vswitch.name,
            "num_ports" => spec.num_ports,
            "mtu" => spec.mtu,
            "uplinks" => ?spec.uplinks,
        );
        Ok(())
    }
}
