// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Controller slot allocation for new block devices.
//!
//! Disks attach to SCSI controllers, CD-ROM drives to IDE controllers. Each
//! new device needs a `(controller, unit)` address nobody else uses. When
//! several devices are added by one reconfiguration, the `n`th of them asks
//! for the `n`th free address of its family, so they never collide.

use crate::error::Error;
use slog::Logger;
use slog::info;
use vcenter_api::DeviceChange;
use vcenter_api::DeviceKind;
use vcenter_api::SCSI_CONTROLLER_UNIT_NUMBER;
use vcenter_api::VimApi;
use vcenter_api::VirtualDevice;
use vcenter_api::VmConfigSpec;
use vcenter_api::VmRef;

/// SCSI controllers a VM may have.
pub const MAX_SCSI_CONTROLLERS: usize = 4;

/// Unit numbers addressable on a SCSI controller.
const SCSI_UNITS: std::ops::RangeInclusive<i32> = 0..=14;

/// Unit numbers addressable on an IDE controller.
const IDE_UNITS: std::ops::RangeInclusive<i32> = 0..=1;

/// Placeholder key for a controller added by a reconfiguration.
const NEW_CONTROLLER_KEY: i32 = -100;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, strum::Display,
)]
pub enum ControllerFamily {
    #[strum(to_string = "SCSI")]
    Scsi,
    #[strum(to_string = "IDE")]
    Ide,
}

/// An address on a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Slot {
    pub controller_key: i32,
    pub unit_number: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CapacityError {
    #[error("There are no IDE controllers to connect a CD-ROM drive to")]
    NoIdeController,

    #[error(
        "Cannot add a new SCSI controller, the maximum is {}",
        MAX_SCSI_CONTROLLERS
    )]
    ControllerLimit,

    #[error(
        "No free {family} slot for device {position} after adding a \
         controller"
    )]
    NoFreeSlot { family: ControllerFamily, position: usize },
}

/// Outcome of looking for a free slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Allocation {
    Slot(Slot),
    /// Every controller is full; this controller must be added first.
    NeedsController(VirtualDevice),
}

struct Controller {
    key: i32,
    bus_number: i32,
    reserved_unit: Option<i32>,
}

fn controllers(
    devices: &[VirtualDevice],
    family: ControllerFamily,
) -> Vec<Controller> {
    let mut controllers = devices
        .iter()
        .filter_map(|d| match (&d.kind, family) {
            (
                DeviceKind::ScsiController { bus_number, scsi_unit_number },
                ControllerFamily::Scsi,
            ) => Some(Controller {
                key: d.key,
                bus_number: *bus_number,
                reserved_unit: Some(*scsi_unit_number),
            }),
            (
                DeviceKind::IdeController { bus_number },
                ControllerFamily::Ide,
            ) => Some(Controller {
                key: d.key,
                bus_number: *bus_number,
                reserved_unit: None,
            }),
            _ => None,
        })
        .collect::<Vec<_>>();
    controllers.sort_by_key(|c| (c.bus_number, c.key));
    controllers
}

/// Every free address of `family`, ordered by controller bus and unit.
pub fn free_slots(
    devices: &[VirtualDevice],
    family: ControllerFamily,
) -> Vec<Slot> {
    let units = match family {
        ControllerFamily::Scsi => SCSI_UNITS,
        ControllerFamily::Ide => IDE_UNITS,
    };
    controllers(devices, family)
        .into_iter()
        .flat_map(|controller| {
            units.clone().filter_map(move |unit| {
                if Some(unit) == controller.reserved_unit {
                    return None;
                }
                let used = devices.iter().any(|d| {
                    d.controller_key == Some(controller.key)
                        && d.unit_number == Some(unit)
                });
                (!used).then_some(Slot {
                    controller_key: controller.key,
                    unit_number: unit,
                })
            })
        })
        .collect()
}

/// Returns the `position`th free address of `family`, or the controller that
/// has to be added when there are not enough free addresses.
pub fn allocate(
    devices: &[VirtualDevice],
    family: ControllerFamily,
    position: usize,
) -> Result<Allocation, CapacityError> {
    if let Some(slot) = free_slots(devices, family).get(position) {
        return Ok(Allocation::Slot(*slot));
    }
    match family {
        ControllerFamily::Ide => {
            if controllers(devices, family).is_empty() {
                Err(CapacityError::NoIdeController)
            } else {
                Err(CapacityError::NoFreeSlot { family, position })
            }
        }
        ControllerFamily::Scsi => {
            new_scsi_controller(devices).map(Allocation::NeedsController)
        }
    }
}

/// The SCSI controller to add next: on the bus after the last one.
pub fn new_scsi_controller(
    devices: &[VirtualDevice],
) -> Result<VirtualDevice, CapacityError> {
    let existing = controllers(devices, ControllerFamily::Scsi);
    if existing.len() >= MAX_SCSI_CONTROLLERS {
        return Err(CapacityError::ControllerLimit);
    }
    let bus_number = existing.last().map(|c| c.bus_number + 1).unwrap_or(0);
    Ok(VirtualDevice {
        key: NEW_CONTROLLER_KEY,
        label: format!("SCSI controller {bus_number}"),
        controller_key: None,
        unit_number: None,
        kind: DeviceKind::ScsiController {
            bus_number,
            scsi_unit_number: SCSI_CONTROLLER_UNIT_NUMBER,
        },
    })
}

/// Finds a free address for a new device on `vm`, adding a SCSI controller
/// through a separate reconfiguration when every controller is full.
///
/// `devices` is refreshed from the endpoint after a controller is added.
pub async fn allocate_slot(
    vim: &dyn VimApi,
    log: &Logger,
    vm: &VmRef,
    devices: &mut Vec<VirtualDevice>,
    family: ControllerFamily,
    position: usize,
) -> Result<Slot, Error> {
    let controller = match allocate(devices, family, position)? {
        Allocation::Slot(slot) => return Ok(slot),
        Allocation::NeedsController(controller) => controller,
    };

    info!(
        log,
        "adding a SCSI controller";
        "vm" => %vm,
        "label" => &controller.label,
    );
    let spec = VmConfigSpec {
        device_change: vec![DeviceChange::add(controller)],
        ..Default::default()
    };
    vim.reconfigure_vm(vm, &spec).await?;
    *devices = vim.vm(vm).await?.devices;

    match allocate(devices, family, position)? {
        Allocation::Slot(slot) => Ok(slot),
        Allocation::NeedsController(_) => {
            Err(CapacityError::NoFreeSlot { family, position }.into())
        }
    }
}
