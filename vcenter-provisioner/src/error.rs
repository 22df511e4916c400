// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::network::NetworkError;
use crate::placement::PlacementError;
use crate::slots::CapacityError;
use crate::snapshot::SnapshotError;
use vcenter_api::VimError;

/// The declarative description of a VM or network is incompatible with what
/// already exists on the endpoint. These are never retried: the description
/// has to change.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "{field} of {object} conflicts with the existing configuration: \
     {detail}"
)]
pub struct ConfigurationConflict {
    pub object: String,
    pub field: &'static str,
    pub detail: String,
}

impl ConfigurationConflict {
    pub fn new(
        object: impl Into<String>,
        field: &'static str,
        detail: impl Into<String>,
    ) -> Self {
        Self { object: object.into(), field, detail: detail.into() }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Vim(#[from] VimError),

    #[error(transparent)]
    Conflict(#[from] ConfigurationConflict),

    #[error(transparent)]
    Capacity(#[from] CapacityError),

    #[error(transparent)]
    Placement(#[from] PlacementError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("Failed to query the image registry: {0}")]
    ImageRegistry(#[source] anyhow::Error),

    #[error("Failed to update the network catalog: {0}")]
    NetworkCatalog(#[source] anyhow::Error),

    #[error(
        "CD-ROM disk {disk_id} can only be attached to {vm} while it is \
         powered off"
    )]
    CdromRequiresPowerOff { vm: String, disk_id: u32 },

    #[error("Disk {disk_id} is already attached to {vm}")]
    DiskAlreadyAttached { vm: String, disk_id: u32 },

    #[error("Disk {disk_id} is not attached to {vm}")]
    DiskNotAttached { vm: String, disk_id: u32 },

    #[error("Disk {disk_id} of type {disk_type} has no image source")]
    MissingDiskSource { disk_id: u32, disk_type: String },

    #[error(
        "Unmanaged disk {disk_id} ({source_path}) is not a disk of \
         template {template}"
    )]
    UnmanagedDiskNotInTemplate {
        disk_id: u32,
        source_path: String,
        template: String,
    },

    #[error("Network {network} is not available on host {host}")]
    NetworkNotFound { network: String, host: String },

    #[error(
        "Disk {disk_id} must be placed on a single datastore, not {target}"
    )]
    UnexpectedStoragePod { disk_id: u32, target: String },
}

impl Error {
    /// The endpoint fault behind this error, if it came from the endpoint.
    pub fn vim_error(&self) -> Option<&VimError> {
        match self {
            Error::Vim(err) => Some(err),
            Error::Placement(err) => err.vim_error(),
            Error::Network(err) => err.vim_error(),
            Error::Snapshot(SnapshotError::Remote(err)) => Some(err),
            _ => None,
        }
    }
}
