// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Switch and port group configuration, host-local and distributed.

use crate::DvsRef;
use crate::NetworkRef;
use serde::Deserialize;
use serde::Serialize;

/// Configuration of a host-local (standard) virtual switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualSwitchSpec {
    pub num_ports: u32,
    pub mtu: u32,
    /// Physical NICs bound to the switch as uplinks.
    pub uplinks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualSwitch {
    pub name: String,
    pub spec: VirtualSwitchSpec,
}

/// A host-local port group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortGroupSpec {
    pub name: String,
    pub vswitch_name: String,
    pub vlan_id: u16,
}

/// A host's membership in a distributed switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySwitch {
    pub dvs_uuid: String,
    pub dvs_name: String,
    pub uplinks: Vec<String>,
}

/// The network configuration of one host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostNetworkConfig {
    pub pnics: Vec<String>,
    pub vswitches: Vec<VirtualSwitch>,
    pub port_groups: Vec<PortGroupSpec>,
    pub proxy_switches: Vec<ProxySwitch>,
}

impl HostNetworkConfig {
    pub fn vswitch(&self, name: &str) -> Option<&VirtualSwitch> {
        self.vswitches.iter().find(|vs| vs.name == name)
    }

    pub fn port_group(&self, name: &str) -> Option<&PortGroupSpec> {
        self.port_groups.iter().find(|pg| pg.name == name)
    }

    pub fn proxy_switch(&self, dvs_name: &str) -> Option<&ProxySwitch> {
        self.proxy_switches.iter().find(|ps| ps.dvs_name == dvs_name)
    }

    /// Physical NICs not yet claimed by any switch or proxy switch.
    pub fn available_pnics(&self) -> Vec<String> {
        let claimed = self
            .vswitches
            .iter()
            .flat_map(|vs| vs.spec.uplinks.iter())
            .chain(self.proxy_switches.iter().flat_map(|ps| ps.uplinks.iter()))
            .collect::<Vec<_>>();
        self.pnics
            .iter()
            .filter(|pnic| !claimed.contains(pnic))
            .cloned()
            .collect()
    }
}

/// Configuration of a distributed switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedSwitchSpec {
    pub name: String,
    pub uplink_port_names: Vec<String>,
    pub max_mtu: u32,
}

impl DistributedSwitchSpec {
    /// Uplink port names `dvUplink1..=count`.
    pub fn uplink_names(count: usize) -> Vec<String> {
        (1..=count).map(|i| format!("dvUplink{i}")).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedSwitchInfo {
    pub reference: DvsRef,
    pub uuid: String,
    pub spec: DistributedSwitchSpec,
    /// The port group holding the switch's uplink ports.
    pub uplink_port_group: Option<NetworkRef>,
}

/// When ports of a distributed port group are bound to VMs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PortBinding {
    /// A free port is assigned when a VM is reconfigured onto the group.
    EarlyBinding,
    Ephemeral,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedPortGroupSpec {
    pub name: String,
    pub num_ports: u32,
    pub vlan_id: u16,
    pub binding: PortBinding,
    pub auto_expand: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedPortGroupInfo {
    pub reference: NetworkRef,
    /// The port group key NIC backings refer to.
    pub key: String,
    pub switch: DvsRef,
    pub switch_name: String,
    pub switch_uuid: String,
    pub uplink: bool,
    pub spec: DistributedPortGroupSpec,
}
