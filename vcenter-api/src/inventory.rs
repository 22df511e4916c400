// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Read-only views of inventory objects.

use crate::ClusterRef;
use crate::DatacenterRef;
use crate::DatastoreRef;
use crate::FolderRef;
use crate::HostRef;
use crate::NetworkRef;
use crate::ResourcePoolRef;
use crate::VirtualDevice;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AboutInfo {
    pub instance_uuid: String,
    pub api_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatacenterInfo {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePoolInfo {
    pub reference: ResourcePoolRef,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub name: String,
    pub datacenter: DatacenterRef,
    /// The cluster's root resource pool.
    pub resource_pool: ResourcePoolRef,
    /// Every named resource pool below the root.
    pub resource_pools: Vec<ResourcePoolInfo>,
}

/// Whether a network is a host-local port group or a distributed one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NetworkType {
    Standard,
    Distributed { switch_uuid: String, port_group_key: String },
}

/// A network visible from a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub reference: NetworkRef,
    pub name: String,
    pub network_type: NetworkType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    pub name: String,
    pub cluster: ClusterRef,
    pub cpu_mhz: u64,
    pub networks: Vec<NetworkInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatastoreInfo {
    pub name: String,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
}

/// Usage figures the endpoint keeps for a running VM.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuickStats {
    pub overall_cpu_usage_mhz: i64,
    pub host_memory_usage_mb: i64,
    pub guest_ip_addresses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmInfo {
    pub name: String,
    pub datacenter: DatacenterRef,
    pub parent_folder: FolderRef,
    pub template: bool,
    pub power_state: PowerState,
    pub num_cpus: u32,
    pub memory_mb: u64,
    pub host: HostRef,
    pub resource_pool: ResourcePoolRef,
    pub devices: Vec<VirtualDevice>,
    pub extra_config: BTreeMap<String, String>,
    pub quick_stats: QuickStats,
}

impl VmInfo {
    pub fn find_device(&self, key: i32) -> Option<&VirtualDevice> {
        self.devices.iter().find(|d| d.key == key)
    }

    /// Returns the device attached at `(controller_key, unit_number)`.
    pub fn device_at(
        &self,
        controller_key: i32,
        unit_number: i32,
    ) -> Option<&VirtualDevice> {
        self.devices.iter().find(|d| {
            d.controller_key == Some(controller_key)
                && d.unit_number == Some(unit_number)
        })
    }

    pub fn datastore_ref_of(&self, key: i32) -> Option<&DatastoreRef> {
        self.find_device(key).and_then(|d| d.backing_datastore())
    }
}
