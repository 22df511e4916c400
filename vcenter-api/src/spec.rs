// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Change requests submitted to the endpoint: VM reconfiguration, cloning
//! and storage placement.

use crate::DatastoreRef;
use crate::FolderRef;
use crate::HostRef;
use crate::ResourcePoolRef;
use crate::StoragePodRef;
use crate::VirtualDevice;
use crate::VmRef;
use serde::Deserialize;
use serde::Serialize;

/// An untyped key/value annotation stored on the VM object.
///
/// Setting an empty value removes the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionValue {
    pub key: String,
    pub value: String,
}

impl OptionValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self { key: key.into(), value: value.into() }
    }

    /// An annotation that deletes `key`.
    pub fn removal(key: impl Into<String>) -> Self {
        Self { key: key.into(), value: String::new() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceOperation {
    Add,
    Remove,
    Edit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOperation {
    Create,
    Destroy,
}

/// One device addition, removal or in-place edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceChange {
    pub operation: DeviceOperation,
    pub file_operation: Option<FileOperation>,
    pub device: VirtualDevice,
}

impl DeviceChange {
    pub fn add(device: VirtualDevice) -> Self {
        Self { operation: DeviceOperation::Add, file_operation: None, device }
    }

    pub fn remove(device: VirtualDevice) -> Self {
        Self {
            operation: DeviceOperation::Remove,
            file_operation: None,
            device,
        }
    }

    pub fn edit(device: VirtualDevice) -> Self {
        Self { operation: DeviceOperation::Edit, file_operation: None, device }
    }

    pub fn with_file_operation(mut self, op: FileOperation) -> Self {
        self.file_operation = Some(op);
        self
    }
}

/// A VM reconfiguration request. Unset fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConfigSpec {
    pub num_cpus: Option<u32>,
    pub memory_mb: Option<u64>,
    pub extra_config: Vec<OptionValue>,
    pub device_change: Vec<DeviceChange>,
}

impl VmConfigSpec {
    pub fn is_empty(&self) -> bool {
        self.num_cpus.is_none()
            && self.memory_mb.is_none()
            && self.extra_config.is_empty()
            && self.device_change.is_empty()
    }
}

/// How disk backings are handled when cloning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskMoveType {
    /// Full clone: copy every disk backing.
    MoveAllDiskBackingsAndDisallowSharing,
    /// Linked clone: share the template's backings, creating only deltas.
    MoveChildMostDiskBacking,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelocateSpec {
    pub pool: ResourcePoolRef,
    pub datastore: Option<DatastoreRef>,
    pub host: Option<HostRef>,
    pub disk_move_type: DiskMoveType,
}

/// A guest customization specification stored on the endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomizationSpec {
    pub name: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloneSpec {
    pub location: RelocateSpec,
    pub power_on: bool,
    pub template: bool,
    pub config: Option<VmConfigSpec>,
    pub customization: Option<CustomizationSpec>,
}

/// Input to the storage placement service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoragePlacementSpec {
    /// Place a clone of `template` named `clone_name` in `pod`.
    Clone {
        pod: StoragePodRef,
        template: VmRef,
        clone_name: String,
        folder: FolderRef,
        clone_spec: CloneSpec,
    },
    /// Place new disks of `vm` (identified by their placeholder keys) in
    /// `pod`, applying `config_spec` once the recommendation is applied.
    Reconfigure {
        pod: StoragePodRef,
        vm: VmRef,
        disk_keys: Vec<i32>,
        config_spec: VmConfigSpec,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementRecommendation {
    /// Key used to apply the recommendation. May be empty when the service
    /// could not produce an applicable recommendation.
    pub key: String,
    pub target: Option<DatastoreRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePlacementResult {
    pub recommendations: Vec<PlacementRecommendation>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyRecommendationResult {
    /// The VM created by applying a clone recommendation.
    pub vm: Option<VmRef>,
}
