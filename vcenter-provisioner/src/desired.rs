// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The control plane's declarative description of a VM.
//!
//! These types are read-only inputs: the engine never writes them back.
//! Everything the engine needs to remember between invocations rides on the
//! VM object itself (see [`crate::annotations`]).

use crate::error::Error;
use macaddr::MacAddr6;
use serde::Deserialize;
use serde::Deserializer;
use std::fmt;
use vcenter_api::ClusterRef;
use vcenter_api::DatastoreTarget;
use vcenter_api::HostRef;
use vcenter_api::NetworkRef;
use vcenter_api::VmRef;

/// A VM as the control plane wants it to be.
#[derive(Debug, Clone, Deserialize)]
pub struct DesiredVm {
    /// Control-plane VM id.
    pub id: u64,
    pub name: String,
    /// Virtual CPUs; one when unset.
    pub cpus: Option<u32>,
    pub memory_mb: u64,
    #[serde(default)]
    pub disks: Vec<DiskDescriptor>,
    #[serde(default)]
    pub nics: Vec<NicDescriptor>,
    /// Contextualization variables, in order.
    #[serde(default)]
    pub context: Vec<(String, String)>,
    pub onegate_token: Option<String>,
    pub graphics: Option<Graphics>,
    pub placement: Placement,
}

/// Where and how the VM is created.
#[derive(Debug, Clone, Deserialize)]
pub struct Placement {
    pub template: VmRef,
    pub cluster: ClusterRef,
    pub host: Option<HostRef>,
    /// System datastore: volatile and non-persistent disks land here.
    pub datastore: Option<DatastoreTarget>,
    /// Name of a resource pool of the cluster.
    pub resource_pool: Option<String>,
    /// VM folder path below the datacenter's VM folder.
    pub folder: Option<String>,
    pub customization_spec: Option<String>,
    #[serde(default)]
    pub linked_clone: bool,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Deserialize, strum::Display,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum DiskType {
    #[serde(alias = "FILE", alias = "BLOCK")]
    Disk,
    Cdrom,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DiskDescriptor {
    pub disk_id: u32,
    pub disk_type: DiskType,
    /// Datastore-relative path of the image the disk comes from. Volatile
    /// disks have none.
    pub source: Option<String>,
    /// Datastore of the image, possibly a storage pod.
    pub datastore: DatastoreTarget,
    pub size_mb: Option<u64>,
    /// Size recorded when the disk was attached; a larger `size_mb` asks for
    /// a resize.
    pub original_size_mb: Option<u64>,
    #[serde(default)]
    pub persistent: bool,
    /// Unmanaged disks come with the template instead of being created by
    /// the control plane.
    #[serde(default = "default_managed")]
    pub managed: bool,
}

fn default_managed() -> bool {
    true
}

impl DiskDescriptor {
    pub fn is_cdrom(&self) -> bool {
        self.disk_type == DiskType::Cdrom
    }

    pub fn is_volatile(&self) -> bool {
        self.disk_type == DiskType::Disk && self.source.is_none()
    }

    /// Datastore-relative path the disk's file has on the VM.
    ///
    /// Persistent disks and CD-ROMs use the image itself. Non-persistent
    /// disks use a per-VM copy next to the image; volatile disks live in the
    /// volatile directory.
    pub fn image_path(
        &self,
        vm_id: u64,
        vm_name: &str,
        volatile_dir: &str,
    ) -> Result<String, Error> {
        let disk_id = self.disk_id;
        match &self.source {
            Some(source) if self.persistent || self.is_cdrom() => {
                Ok(source.clone())
            }
            Some(source) => {
                let (stem, ext) = match source.rsplit_once('.') {
                    Some((stem, ext)) if !ext.contains('/') => {
                        (stem, format!(".{ext}"))
                    }
                    _ => (source.as_str(), String::new()),
                };
                Ok(format!("{stem}-{vm_id}-{disk_id}{ext}"))
            }
            None if self.is_volatile() => Ok(format!(
                "{volatile_dir}/{vm_name}/one-{vm_id}-{disk_id}.vmdk"
            )),
            None => Err(Error::MissingDiskSource {
                disk_id,
                disk_type: self.disk_type.to_string(),
            }),
        }
    }

    /// Datastore the disk's file lives on: its own for persistent disks and
    /// CD-ROMs, the VM's system datastore otherwise.
    pub fn effective_datastore<'a>(
        &'a self,
        system: Option<&'a DatastoreTarget>,
    ) -> &'a DatastoreTarget {
        if self.persistent || self.is_cdrom() {
            return &self.datastore;
        }
        system.unwrap_or(&self.datastore)
    }
}

/// Bandwidth figures of a NIC, in KB/s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Bandwidth {
    pub inbound_avg: Option<u64>,
    pub inbound_peak: Option<u64>,
    pub outbound_avg: Option<u64>,
    pub outbound_peak: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NicDescriptor {
    pub nic_id: u32,
    /// In the usual colon-separated notation.
    #[serde(deserialize_with = "deserialize_mac")]
    pub mac: MacAddr6,
    /// Port group name.
    pub bridge: String,
    /// Endpoint reference of the network, when it was imported.
    pub network_ref: Option<NetworkRef>,
    pub model: Option<String>,
    #[serde(default)]
    pub bandwidth: Bandwidth,
    #[serde(default = "default_managed")]
    pub managed: bool,
    /// Switch infrastructure that has to exist for the port group; absent
    /// for networks that were imported from the endpoint.
    pub vcenter_network: Option<VcenterNetwork>,
}

fn deserialize_mac<'de, D>(deserializer: D) -> Result<MacAddr6, D::Error>
where
    D: Deserializer<'de>,
{
    let mac = String::deserialize(deserializer)?;
    mac.parse().map_err(|err| {
        serde::de::Error::custom(format!("invalid MAC address {mac:?}: {err}"))
    })
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Deserialize, strum::Display,
)]
pub enum PortGroupType {
    #[serde(rename = "Port Group")]
    #[strum(to_string = "Port Group")]
    Standard,
    #[serde(rename = "Distributed Port Group")]
    #[strum(to_string = "Distributed Port Group")]
    Distributed,
}

/// A virtual network whose switch and port group are created on demand.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VcenterNetwork {
    /// Control-plane network id.
    pub network_id: u64,
    /// Endpoint instance the network was created on, if it ever was.
    pub instance_id: Option<String>,
    pub port_group_type: PortGroupType,
    pub switch_name: String,
    /// Physical NICs to use as uplinks.
    #[serde(default)]
    pub pnics: Vec<String>,
    pub mtu: Option<u32>,
    pub vlan_id: Option<u16>,
    pub num_ports: Option<u32>,
}

/// VNC console settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Graphics {
    pub port: u16,
    pub listen: Option<String>,
    pub keymap: Option<String>,
}

impl fmt::Display for DesiredVm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}
