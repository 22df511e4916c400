// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The virtual hardware of a VM, as reported by and submitted to the
//! management endpoint.

use crate::DatastoreRef;
use crate::NetworkRef;
use macaddr::MacAddr6;
use serde::Deserialize;
use serde::Serialize;

/// Unit number a SCSI controller reserves for itself on its own bus.
pub const SCSI_CONTROLLER_UNIT_NUMBER: i32 = 7;

/// One entry of a VM's device list.
///
/// `key` is unique within a VM's device list at any instant. Devices that
/// have not been created yet carry a non-positive placeholder key, which the
/// endpoint replaces on creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualDevice {
    pub key: i32,
    pub label: String,
    pub controller_key: Option<i32>,
    pub unit_number: Option<i32>,
    pub kind: DeviceKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceKind {
    Disk { backing: DiskBacking, capacity_kb: u64 },
    Cdrom { backing: CdromBacking },
    Nic(NicDevice),
    ScsiController { bus_number: i32, scsi_unit_number: i32 },
    IdeController { bus_number: i32 },
    SataController { bus_number: i32 },
    Other { type_name: String },
}

/// A flat disk file backing a virtual disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskBacking {
    /// Full file name, `[datastore] path/to/disk.vmdk`. May be empty when the
    /// placement service is expected to pick the file location.
    pub file_name: String,
    pub datastore: Option<DatastoreRef>,
    pub disk_mode: DiskMode,
    /// Backing this delta disk is layered on, if any.
    pub parent: Option<Box<DiskBacking>>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DiskMode {
    Persistent,
    IndependentPersistent,
    IndependentNonpersistent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CdromBacking {
    Iso { file_name: String, datastore: Option<DatastoreRef> },
    Passthrough { device_name: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicDevice {
    pub model: NicModel,
    pub mac: Option<MacAddr6>,
    pub backing: NicBacking,
    pub resource_allocation: Option<NicResourceAllocation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NicBacking {
    /// Attached to a host-local (standard) port group.
    Network { network: NetworkRef, device_name: String },
    /// Attached to a distributed port group.
    DistributedPort { switch_uuid: String, port_group_key: String },
}

impl NicBacking {
    /// The network reference this backing points at. For distributed ports
    /// the port group key is the port group's reference.
    pub fn network_ref(&self) -> NetworkRef {
        match self {
            NicBacking::Network { network, .. } => network.clone(),
            NicBacking::DistributedPort { port_group_key, .. } => {
                NetworkRef::new(port_group_key.as_str())
            }
        }
    }
}

/// Bandwidth shaping for a NIC, in Mbit/s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicResourceAllocation {
    pub limit: u64,
    pub reservation: u64,
}

/// Emulated network card models.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum NicModel {
    #[default]
    #[strum(to_string = "e1000", serialize = "virtuale1000")]
    E1000,
    #[strum(to_string = "e1000e", serialize = "virtuale1000e")]
    E1000e,
    #[strum(to_string = "pcnet32", serialize = "virtualpcnet32")]
    Pcnet32,
    #[strum(
        to_string = "sriovethernetcard",
        serialize = "virtualsriovethernetcard"
    )]
    SriovEthernetCard,
    #[strum(to_string = "vmxnetm", serialize = "virtualvmxnetm")]
    Vmxnetm,
    #[strum(
        to_string = "vmxnet2",
        serialize = "virtualvmxnet2",
        serialize = "vmnet2"
    )]
    Vmxnet2,
    #[strum(to_string = "vmxnet3", serialize = "virtualvmxnet3")]
    Vmxnet3,
}

impl NicModel {
    /// Parses a model name, falling back to [`NicModel::E1000`] for anything
    /// unrecognized.
    pub fn from_name_or_default(name: &str) -> Self {
        name.parse().unwrap_or_default()
    }
}

impl VirtualDevice {
    pub fn is_disk(&self) -> bool {
        matches!(self.kind, DeviceKind::Disk { .. })
    }

    pub fn is_cdrom(&self) -> bool {
        matches!(self.kind, DeviceKind::Cdrom { .. })
    }

    /// Disks and CD-ROMs backed by an ISO file.
    pub fn is_disk_or_iso(&self) -> bool {
        matches!(
            self.kind,
            DeviceKind::Disk { .. }
                | DeviceKind::Cdrom { backing: CdromBacking::Iso { .. } }
        )
    }

    pub fn is_nic(&self) -> bool {
        matches!(self.kind, DeviceKind::Nic(_))
    }

    pub fn nic(&self) -> Option<&NicDevice> {
        match &self.kind {
            DeviceKind::Nic(nic) => Some(nic),
            _ => None,
        }
    }

    /// Full backing file name of a disk or ISO-backed CD-ROM.
    pub fn backing_file(&self) -> Option<&str> {
        match &self.kind {
            DeviceKind::Disk { backing, .. } => Some(&backing.file_name),
            DeviceKind::Cdrom {
                backing: CdromBacking::Iso { file_name, .. },
            } => Some(file_name),
            _ => None,
        }
    }

    /// Datastore holding the backing file, if known.
    pub fn backing_datastore(&self) -> Option<&DatastoreRef> {
        match &self.kind {
            DeviceKind::Disk { backing, .. } => backing.datastore.as_ref(),
            DeviceKind::Cdrom {
                backing: CdromBacking::Iso { datastore, .. },
            } => datastore.as_ref(),
            _ => None,
        }
    }
}

/// Strips the `[datastore] ` prefix from a backing file name, yielding the
/// datastore-relative path.
pub fn path_without_datastore(file_name: &str) -> &str {
    if let Some(rest) = file_name.strip_prefix('[') {
        if let Some(idx) = rest.find("] ") {
            return &rest[idx + 2..];
        }
    }
    file_name
}

/// Formats a datastore-qualified file name.
pub fn datastore_path(datastore_name: &str, path: &str) -> String {
    format!("[{datastore_name}] {path}")
}
