// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shorthands for building device lists in tests.

use crate::CdromBacking;
use crate::DatastoreRef;
use crate::DeviceKind;
use crate::DiskBacking;
use crate::DiskMode;
use crate::NetworkRef;
use crate::NicBacking;
use crate::NicDevice;
use crate::NicModel;
use crate::SCSI_CONTROLLER_UNIT_NUMBER;
use crate::VirtualDevice;
use macaddr::MacAddr6;

pub fn scsi_controller(key: i32, bus_number: i32) -> VirtualDevice {
    VirtualDevice {
        key,
        label: format!("SCSI controller {bus_number}"),
        controller_key: None,
        unit_number: None,
        kind: DeviceKind::ScsiController {
            bus_number,
            scsi_unit_number: SCSI_CONTROLLER_UNIT_NUMBER,
        },
    }
}

pub fn ide_controller(key: i32, bus_number: i32) -> VirtualDevice {
    VirtualDevice {
        key,
        label: format!("IDE {bus_number}"),
        controller_key: None,
        unit_number: None,
        kind: DeviceKind::IdeController { bus_number },
    }
}

pub fn disk(
    key: i32,
    controller_key: i32,
    unit_number: i32,
    file_name: &str,
    datastore: &DatastoreRef,
    capacity_kb: u64,
) -> VirtualDevice {
    VirtualDevice {
        key,
        label: format!("Hard disk {key}"),
        controller_key: Some(controller_key),
        unit_number: Some(unit_number),
        kind: DeviceKind::Disk {
            backing: DiskBacking {
                file_name: file_name.to_string(),
                datastore: Some(datastore.clone()),
                disk_mode: DiskMode::Persistent,
                parent: None,
            },
            capacity_kb,
        },
    }
}

pub fn cdrom(
    key: i32,
    controller_key: i32,
    unit_number: i32,
    file_name: &str,
    datastore: &DatastoreRef,
) -> VirtualDevice {
    VirtualDevice {
        key,
        label: format!("CD/DVD drive {key}"),
        controller_key: Some(controller_key),
        unit_number: Some(unit_number),
        kind: DeviceKind::Cdrom {
            backing: CdromBacking::Iso {
                file_name: file_name.to_string(),
                datastore: Some(datastore.clone()),
            },
        },
    }
}

pub fn nic(key: i32, mac: MacAddr6, network: &NetworkRef) -> VirtualDevice {
    VirtualDevice {
        key,
        label: format!("Network adapter {key}"),
        controller_key: None,
        unit_number: None,
        kind: DeviceKind::Nic(NicDevice {
            model: NicModel::E1000,
            mac: Some(mac),
            backing: NicBacking::Network {
                network: network.clone(),
                device_name: network.to_string(),
            },
            resource_allocation: None,
        }),
    }
}
