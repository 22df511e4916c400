// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Switch and port group infrastructure behind managed virtual networks.
//!
//! A NIC on a managed network needs its port group, and the switch the port
//! group hangs off, to exist before the NIC can be attached. Port groups
//! live either on a standard switch local to the VM's host or on a
//! distributed switch spanning the datacenter. Every change is made under
//! the lock of the host or datacenter it touches and recorded in a
//! [`Transaction`], which undoes the recorded changes if a later step
//! fails.

mod distributed;
mod rollback;
mod standard;
mod teardown;

pub use rollback::RollbackAction;
pub use rollback::Transaction;

use crate::config::ProvisionerConfig;
use crate::desired::NicDescriptor;
use crate::desired::PortGroupType;
use crate::error::ConfigurationConflict;
use crate::facilities::NetworkCatalog;
use crate::lock::NamedLocks;
use slog::Logger;
use slog::o;
use std::sync::Arc;
use std::time::Duration;
use vcenter_api::HostRef;
use vcenter_api::NetworkRef;
use vcenter_api::VimApi;
use vcenter_api::VimError;

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error(transparent)]
    Conflict(#[from] ConfigurationConflict),

    #[error("Failed to {action} {object}")]
    Remote {
        action: &'static str,
        object: String,
        #[source]
        err: VimError,
    },

    #[error(
        "Distributed port group {name} did not show up on switch {switch} \
         within {timeout:?}"
    )]
    NotVisible { name: String, switch: String, timeout: Duration },

    #[error(
        "Failed to record port group {port_group} for network {network_id}"
    )]
    Catalog {
        network_id: u64,
        port_group: NetworkRef,
        #[source]
        err: anyhow::Error,
    },

    #[error("{cause}; undoing the change to {action} failed as well")]
    RollbackFailed {
        cause: Box<NetworkError>,
        action: String,
        #[source]
        err: VimError,
    },
}

impl NetworkError {
    pub fn vim_error(&self) -> Option<&VimError> {
        match self {
            NetworkError::Remote { err, .. } => Some(err),
            NetworkError::RollbackFailed { cause, .. } => cause.vim_error(),
            _ => None,
        }
    }
}

/// Builds the mapping from a failed endpoint call to a [`NetworkError`].
pub(crate) fn remote(
    action: &'static str,
    object: impl ToString,
) -> impl FnOnce(VimError) -> NetworkError {
    let object = object.to_string();
    move |err| NetworkError::Remote { action, object, err }
}

/// Creates, updates and removes the switch infrastructure of managed
/// networks.
pub struct NetworkProvisioner {
    log: Logger,
    vim: Arc<dyn VimApi>,
    catalog: Arc<dyn NetworkCatalog>,
    locks: NamedLocks,
    config: ProvisionerConfig,
}

impl NetworkProvisioner {
    pub fn new(
        log: &Logger,
        vim: Arc<dyn VimApi>,
        catalog: Arc<dyn NetworkCatalog>,
        locks: NamedLocks,
        config: ProvisionerConfig,
    ) -> Self {
        Self {
            log: log.new(o!("component" => "NetworkProvisioner")),
            vim,
            catalog,
            locks,
            config,
        }
    }

    /// Makes sure the port group `nic` attaches to exists on `host` with the
    /// configuration its network asks for. NICs on networks the engine does
    /// not manage need nothing.
    pub async fn ensure_network(
        &self,
        host: &HostRef,
        nic: &NicDescriptor,
    ) -> Result<(), NetworkError> {
        let Some(network) = &nic.vcenter_network else {
            return Ok(());
        };
        let about =
            self.vim.about().await.map_err(remote("query", "endpoint"))?;
        if let Some(instance_id) = &network.instance_id {
            if *instance_id != about.instance_uuid {
                return Err(ConfigurationConflict::new(
                    format!("network {}", network.network_id),
                    "instance_id",
                    format!(
                        "the network belongs to endpoint {instance_id}, not \
                         {}; create a different virtual network instead",
                        about.instance_uuid
                    ),
                )
                .into());
            }
        }
        match network.port_group_type {
            PortGroupType::Standard => {
                self.ensure_standard(
                    host,
                    &nic.bridge,
                    network,
                    &about.instance_uuid,
                )
                .await
            }
            PortGroupType::Distributed => {
                self.ensure_distributed(
                    host,
                    &nic.bridge,
                    network,
                    &about.instance_uuid,
                )
                .await
            }
        }
    }
}

/// The conflict raised when a port group would have to move to another
/// switch.
fn switch_change_conflict(
    port_group: &str,
    current: &str,
    requested: &str,
) -> ConfigurationConflict {
    ConfigurationConflict::new(
        format!("port group {port_group}"),
        "switch_name",
        format!(
            "the port group is on switch {current} and cannot be moved to \
             {requested}; revert the network definition or create a \
             different virtual network instead"
        ),
    )
}
