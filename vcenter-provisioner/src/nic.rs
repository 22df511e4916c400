// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Network adapter device specifications.

use crate::config::ProvisionerConfig;
use crate::desired::Bandwidth;
use crate::desired::NicDescriptor;
use crate::error::Error;
use crate::reconciler::PlaceholderKeys;
use vcenter_api::DeviceChange;
use vcenter_api::DeviceKind;
use vcenter_api::HostInfo;
use vcenter_api::NetworkInfo;
use vcenter_api::NetworkType;
use vcenter_api::NicBacking;
use vcenter_api::NicDevice;
use vcenter_api::NicModel;
use vcenter_api::NicResourceAllocation;
use vcenter_api::VirtualDevice;

/// Converts a KB/s figure into the Mbit/s the endpoint expects.
fn to_mbps(kbytes_per_sec: u64) -> u64 {
    (kbytes_per_sec / 1024) * 8
}

/// Traffic shaping for a new adapter.
///
/// The limit needs both peaks; the reservation takes the smaller average,
/// with an unset average counting as zero. Nothing is shaped unless the
/// limit is positive, and the reservation never exceeds the limit.
pub fn resource_allocation(
    bandwidth: &Bandwidth,
    default_inbound_peak: Option<u64>,
) -> Option<NicResourceAllocation> {
    let inbound_peak = bandwidth.inbound_peak.or(default_inbound_peak)?;
    let outbound_peak = bandwidth.outbound_peak?;
    let limit = to_mbps(inbound_peak.min(outbound_peak));
    if limit == 0 {
        return None;
    }
    let reservation = match (bandwidth.inbound_avg, bandwidth.outbound_avg) {
        (None, None) => 0,
        (inbound, outbound) => {
            to_mbps(inbound.unwrap_or(0).min(outbound.unwrap_or(0)))
        }
    };
    Some(NicResourceAllocation { limit, reservation: reservation.min(limit) })
}

/// Finds the network a NIC should attach to among those its host sees,
/// by reference first and by name otherwise.
pub fn find_network<'a>(
    nic: &NicDescriptor,
    host: &'a HostInfo,
) -> Result<&'a NetworkInfo, Error> {
    host.networks
        .iter()
        .find(|n| nic.network_ref.as_ref() == Some(&n.reference))
        .or_else(|| host.networks.iter().find(|n| n.name == nic.bridge))
        .ok_or_else(|| Error::NetworkNotFound {
            network: nic.bridge.clone(),
            host: host.name.clone(),
        })
}

/// A new adapter for `nic` labelled `net<card_num>`.
pub fn nic_device(
    nic: &NicDescriptor,
    network: &NetworkInfo,
    key: i32,
    card_num: usize,
    config: &ProvisionerConfig,
) -> VirtualDevice {
    let model = nic
        .model
        .as_deref()
        .map(NicModel::from_name_or_default)
        .unwrap_or(config.default_nic_model);
    let backing = match &network.network_type {
        NetworkType::Standard => NicBacking::Network {
            network: network.reference.clone(),
            device_name: nic.bridge.clone(),
        },
        NetworkType::Distributed { switch_uuid, port_group_key } => {
            NicBacking::DistributedPort {
                switch_uuid: switch_uuid.clone(),
                port_group_key: port_group_key.clone(),
            }
        }
    };
    VirtualDevice {
        key,
        label: format!("net{card_num}"),
        controller_key: None,
        unit_number: None,
        kind: DeviceKind::Nic(NicDevice {
            model,
            mac: Some(nic.mac),
            backing,
            resource_allocation: resource_allocation(
                &nic.bandwidth,
                config.default_inbound_peak_bw,
            ),
        }),
    }
}

/// Additions for every NIC in `nics`, numbered after the adapters already
/// in `devices`.
pub fn add_nic_changes(
    nics: &[NicDescriptor],
    host: &HostInfo,
    devices: &[VirtualDevice],
    config: &ProvisionerConfig,
    keys: &mut PlaceholderKeys,
) -> Result<Vec<DeviceChange>, Error> {
    let existing = devices.iter().filter(|d| d.is_nic()).count();
    nics.iter()
        .enumerate()
        .map(|(idx, nic)| {
            let network = find_network(nic, host)?;
            let device = nic_device(
                nic,
                network,
                keys.next_key(),
                existing + idx + 1,
                config,
            );
            Ok(DeviceChange::add(device))
        })
        .collect()
}
