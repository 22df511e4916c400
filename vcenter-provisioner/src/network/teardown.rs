// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Removal of the infrastructure of managed networks no NIC uses anymore.

use super::NetworkError;
use super::NetworkProvisioner;
use super::remote;
use crate::desired::PortGroupType;
use crate::facilities::ManagedNetwork;
use crate::lock::LockTarget;
use slog::Logger;
use slog::info;
use slog::o;
use slog::warn;
use vcenter_api::HostRef;
use vcenter_api::NetworkRef;
use vcenter_api::VimError;

impl NetworkProvisioner {
    /// Removes the port group of `network`, and its switch once no other
    /// port group is left on it.
    ///
    /// Objects that are already gone or still in use stay as they are.
    pub async fn remove_network(
        &self,
        host: &HostRef,
        reference: &NetworkRef,
        network: &ManagedNetwork,
    ) -> Result<(), NetworkError> {
        let host_info =
            self.vim.host(host).await.map_err(remote("query", host))?;
        match network.port_group_type {
            PortGroupType::Standard => {
                let log = self.log.new(o!(
                    "host" => host_info.name.clone(),
                    "port_group" => network.port_group_name.clone(),
                ));
                let _guard = self
                    .locks
                    .acquire(&LockTarget::Host(host_info.name.clone()))
                    .await;
                self.remove_standard(&log, host, reference, network).await
            }
            PortGroupType::Distributed => {
                let (dc, dc_name) = self.datacenter_of(&host_info).await?;
                let log = self.log.new(o!(
                    "datacenter" => dc_name.clone(),
                    "port_group" => network.port_group_name.clone(),
                ));
                let _guard =
                    self.locks.acquire(&LockTarget::Datacenter(dc_name)).await;
                let port_groups = self
                    .vim
                    .distributed_port_groups(&dc)
                    .await
                    .map_err(remote("list distributed port groups of", &dc))?;
                let Some(port_group) = port_groups.into_iter().find(|pg| {
                    !pg.uplink && pg.spec.name == network.port_group_name
                }) else {
                    warn!(log, "distributed port group already removed");
                    return Ok(());
                };
                match self
                    .vim
                    .destroy_distributed_port_group(&port_group.reference)
                    .await
                {
                    Ok(()) => info!(log, "removed distributed port group"),
                    Err(err) => return benign(&log, "port group", err),
                }
                self.forget(network, reference).await?;

                let remaining = self
                    .vim
                    .switch_port_groups(&port_group.switch)
                    .await
                    .map_err(remote(
                        "list port groups of",
                        &network.switch_name,
                    ))?;
                if remaining.iter().any(|pg| !pg.uplink) {
                    return Ok(());
                }
                let switch = &port_group.switch;
                match self.vim.destroy_distributed_switch(switch).await {
                    Ok(()) => {
                        info!(
                            log,
                            "removed distributed switch";
                            "switch" => &network.switch_name,
                        );
                        Ok(())
                    }
                    Err(err) => benign(&log, "switch", err),
                }
            }
        }
    }

    async fn remove_standard(
        &self,
        log: &Logger,
        host: &HostRef,
        reference: &NetworkRef,
        network: &ManagedNetwork,
    ) -> Result<(), NetworkError> {
        let config = self
            .vim
            .host_network_config(host)
            .await
            .map_err(remote("query the network configuration of", host))?;
        if config.port_group(&network.port_group_name).is_none() {
            warn!(log, "port group already removed");
            return Ok(());
        }
        match self
            .vim
            .remove_port_group(host, &network.port_group_name)
            .await
        {
            Ok(()) => info!(log, "removed port group"),
            Err(err) => return benign(log, "port group", err),
        }
        self.forget(network, reference).await?;

        if config.vswitch(&network.switch_name).is_none()
            || config.port_groups.iter().any(|pg| {
                pg.vswitch_name == network.switch_name
                    && pg.name != network.port_group_name
            })
        {
            return Ok(());
        }
        match self.vim.remove_virtual_switch(host, &network.switch_name).await {
            Ok(()) => {
                info!(log, "removed switch"; "switch" => &network.switch_name);
                Ok(())
            }
            Err(err) => benign(log, "switch", err),
        }
    }

    async fn forget(
        &self,
        network: &ManagedNetwork,
        reference: &NetworkRef,
    ) -> Result<(), NetworkError> {
        self.catalog.clear_network_ref(network.network_id).await.map_err(
            |err| NetworkError::Catalog {
                network_id: network.network_id,
                port_group: reference.clone(),
                err,
            },
        )
    }
}

/// Swallows teardown failures on objects that are gone or still in use.
fn benign(
    log: &Logger,
    what: &'static str,
    err: VimError,
) -> Result<(), NetworkError> {
    if err.is_benign_teardown() {
        warn!(log, "leaving {what} in place"; "error" => %err);
        return Ok(());
    }
    let object = err.object.clone();
    Err(NetworkError::Remote { action: "remove", object, err })
}
