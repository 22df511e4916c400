// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Undo log for switch and port group changes.

use super::NetworkError;
use slog::Logger;
use slog::debug;
use slog::error;
use slog::info;
use slog::warn;
use std::fmt;
use vcenter_api::DatacenterRef;
use vcenter_api::DistributedPortGroupSpec;
use vcenter_api::DistributedSwitchSpec;
use vcenter_api::DvsRef;
use vcenter_api::HostRef;
use vcenter_api::NetworkRef;
use vcenter_api::PortGroupSpec;
use vcenter_api::VimApi;
use vcenter_api::VimError;
use vcenter_api::VirtualSwitchSpec;

/// A change made to the endpoint, with what it takes to revert it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackAction {
    CreateVirtualSwitch {
        host: HostRef,
        name: String,
    },
    UpdateVirtualSwitch {
        host: HostRef,
        name: String,
        prior: VirtualSwitchSpec,
    },
    CreatePortGroup {
        host: HostRef,
        name: String,
    },
    UpdatePortGroup {
        host: HostRef,
        prior: PortGroupSpec,
    },
    CreateDistributedSwitch {
        dvs: DvsRef,
        name: String,
    },
    UpdateDistributedSwitch {
        dvs: DvsRef,
        prior: DistributedSwitchSpec,
    },
    /// Added to `switch` under `name`. Its reference is only known once the
    /// switch lists it, so it is looked up again when undone.
    CreateDistributedPortGroup {
        dc: DatacenterRef,
        switch: DvsRef,
        name: String,
    },
    UpdateDistributedPortGroup {
        port_group: NetworkRef,
        prior: DistributedPortGroupSpec,
    },
}

impl fmt::Display for RollbackAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollbackAction::CreateVirtualSwitch { host, name } => {
                write!(f, "creation of switch {name} on {host}")
            }
            RollbackAction::UpdateVirtualSwitch { host, name, .. } => {
                write!(f, "update of switch {name} on {host}")
            }
            RollbackAction::CreatePortGroup { host, name } => {
                write!(f, "creation of port group {name} on {host}")
            }
            RollbackAction::UpdatePortGroup { host, prior } => {
                write!(f, "update of port group {} on {host}", prior.name)
            }
            RollbackAction::CreateDistributedSwitch { name, .. } => {
                write!(f, "creation of distributed switch {name}")
            }
            RollbackAction::UpdateDistributedSwitch { prior, .. } => {
                write!(f, "update of distributed switch {}", prior.name)
            }
            RollbackAction::CreateDistributedPortGroup { name, .. } => {
                write!(f, "creation of distributed port group {name}")
            }
            RollbackAction::UpdateDistributedPortGroup { prior, .. } => {
                write!(f, "update of distributed port group {}", prior.name)
            }
        }
    }
}

impl RollbackAction {
    async fn undo(&self, vim: &dyn VimApi) -> Result<(), VimError> {
        match self {
            RollbackAction::CreateVirtualSwitch { host, name } => {
                vim.remove_virtual_switch(host, name).await
            }
            RollbackAction::UpdateVirtualSwitch { host, name, prior } => {
                vim.update_virtual_switch(host, name, prior).await
            }
            RollbackAction::CreatePortGroup { host, name } => {
                vim.remove_port_group(host, name).await
            }
            RollbackAction::UpdatePortGroup { host, prior } => {
                vim.update_port_group(host, &prior.name, prior).await
            }
            RollbackAction::CreateDistributedSwitch { dvs, .. } => {
                vim.destroy_distributed_switch(dvs).await
            }
            RollbackAction::UpdateDistributedSwitch { dvs, prior } => {
                vim.reconfigure_distributed_switch(dvs, prior).await
            }
            RollbackAction::CreateDistributedPortGroup { dc, switch, name } => {
                let created = vim
                    .distributed_port_groups(dc)
                    .await?
                    .into_iter()
                    .find(|pg| {
                        !pg.uplink
                            && pg.switch == *switch
                            && pg.spec.name == *name
                    });
                match created {
                    Some(pg) => {
                        vim.destroy_distributed_port_group(&pg.reference).await
                    }
                    None => Ok(()),
                }
            }
            RollbackAction::UpdateDistributedPortGroup {
                port_group,
                prior,
            } => {
                vim.reconfigure_distributed_port_group(port_group, prior).await
            }
        }
    }
}

/// The changes made so far by one network provisioning operation.
pub struct Transaction {
    log: Logger,
    actions: Vec<RollbackAction>,
}

impl Transaction {
    pub fn new(log: &Logger) -> Self {
        Self { log: log.clone(), actions: Vec::new() }
    }

    pub fn record(&mut self, action: RollbackAction) {
        debug!(self.log, "recorded network change"; "change" => %action);
        self.actions.push(action);
    }

    pub fn actions(&self) -> &[RollbackAction] {
        &self.actions
    }

    /// Reverts every recorded change, newest first.
    ///
    /// Undoing a change whose object is already gone or still in use counts
    /// as done. Any other failure stops the rollback; the remaining changes
    /// stay in place.
    pub async fn rollback(
        self,
        vim: &dyn VimApi,
    ) -> Result<(), (RollbackAction, VimError)> {
        for action in self.actions.into_iter().rev() {
            match action.undo(vim).await {
                Ok(()) => {
                    info!(
                        self.log,
                        "reverted network change";
                        "change" => %action,
                    );
                }
                Err(err) if err.is_benign_teardown() => {
                    warn!(
                        self.log,
                        "network change needs no revert";
                        "change" => %action,
                        "error" => %err,
                    );
                }
                Err(err) => return Err((action, err)),
            }
        }
        Ok(())
    }

    /// Settles the transaction according to the outcome of the steps it
    /// recorded: kept on success, rolled back on failure.
    pub async fn finish<T>(
        self,
        vim: &dyn VimApi,
        result: Result<T, NetworkError>,
    ) -> Result<T, NetworkError> {
        let cause = match result {
            Ok(value) => return Ok(value),
            Err(cause) => cause,
        };
        if self.actions.is_empty() {
            return Err(cause);
        }
        let log = self.log.clone();
        error!(
            log,
            "network provisioning failed, rolling back";
            "changes" => self.actions.len(),
            "error" => %cause,
        );
        match self.rollback(vim).await {
            Ok(()) => Err(cause),
            Err((action, err)) => {
                error!(
                    log,
                    "network rollback failed";
                    "change" => %action,
                    "error" => %err,
                );
                Err(NetworkError::RollbackFailed {
                    cause: Box::new(cause),
                    action: action.to_string(),
                    err,
                })
            }
        }
    }
}
