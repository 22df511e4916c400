// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Storage placement for storage pods.
//!
//! A storage pod does not name a datastore by itself. Anything created on
//! one, a whole clone or a few new disks, goes through the placement
//! service: ask for recommendations, apply the first one.

use crate::annotations::set_disk_key;
use crate::error::Error;
use crate::reconciler::PodDisk;
use slog::Logger;
use slog::info;
use vcenter_api::ApplyRecommendationResult;
use vcenter_api::CloneSpec;
use vcenter_api::FolderRef;
use vcenter_api::OptionValue;
use vcenter_api::StoragePlacementSpec;
use vcenter_api::StoragePodRef;
use vcenter_api::VimApi;
use vcenter_api::VimError;
use vcenter_api::VmConfigSpec;
use vcenter_api::VmRef;

#[derive(Debug, thiserror::Error)]
pub enum PlacementError {
    #[error("Failed to get a placement recommendation from storage pod {pod}")]
    Recommend {
        pod: StoragePodRef,
        #[source]
        err: VimError,
    },

    #[error("Storage pod {pod} returned no placement recommendation")]
    NoRecommendation { pod: StoragePodRef },

    #[error("Storage pod {pod} returned a recommendation without a key")]
    MissingKey { pod: StoragePodRef },

    #[error("Failed to apply recommendation {key} of storage pod {pod}")]
    Apply {
        pod: StoragePodRef,
        key: String,
        #[source]
        err: VimError,
    },

    #[error("Applying the placement of {name} on {pod} produced no VM")]
    NoClone { pod: StoragePodRef, name: String },

    #[error("Disk {disk_id} placed on storage pod {pod} is missing from {vm}")]
    DiskNotPlaced { pod: StoragePodRef, vm: String, disk_id: u32 },
}

impl PlacementError {
    pub fn vim_error(&self) -> Option<&VimError> {
        match self {
            PlacementError::Recommend { err, .. }
            | PlacementError::Apply { err, .. } => Some(err),
            _ => None,
        }
    }
}

fn pod_of(spec: &StoragePlacementSpec) -> &StoragePodRef {
    match spec {
        StoragePlacementSpec::Clone { pod, .. }
        | StoragePlacementSpec::Reconfigure { pod, .. } => pod,
    }
}

/// Requests placement recommendations for `spec` and applies the first.
pub async fn recommend_and_apply(
    vim: &dyn VimApi,
    log: &Logger,
    spec: &StoragePlacementSpec,
) -> Result<ApplyRecommendationResult, PlacementError> {
    let pod = pod_of(spec);
    let result = vim
        .recommend_datastores(spec)
        .await
        .map_err(|err| PlacementError::Recommend { pod: pod.clone(), err })?;
    let recommendation = result
        .recommendations
        .into_iter()
        .next()
        .ok_or_else(|| PlacementError::NoRecommendation { pod: pod.clone() })?;
    if recommendation.key.is_empty() {
        return Err(PlacementError::MissingKey { pod: pod.clone() });
    }
    info!(
        log,
        "applying storage placement";
        "pod" => %pod,
        "recommendation" => &recommendation.key,
        "target" => ?recommendation.target,
    );
    vim.apply_storage_recommendation(&recommendation.key).await.map_err(
        |err| PlacementError::Apply {
            pod: pod.clone(),
            key: recommendation.key,
            err,
        },
    )
}

/// Clones `template` into a datastore of `pod`.
pub async fn clone_into_pod(
    vim: &dyn VimApi,
    log: &Logger,
    pod: &StoragePodRef,
    template: &VmRef,
    folder: &FolderRef,
    name: &str,
    clone_spec: &CloneSpec,
) -> Result<VmRef, PlacementError> {
    let spec = StoragePlacementSpec::Clone {
        pod: pod.clone(),
        template: template.clone(),
        clone_name: name.to_string(),
        folder: folder.clone(),
        clone_spec: clone_spec.clone(),
    };
    recommend_and_apply(vim, log, &spec).await?.vm.ok_or_else(|| {
        PlacementError::NoClone { pod: pod.clone(), name: name.to_string() }
    })
}

/// Adds `disks` to `vm` on datastores of `pod`.
///
/// The placement service names the new files, so the only handle on each
/// disk afterwards is its device key. The returned annotations record those
/// keys; they are meant to ride along with the VM's next reconfiguration.
pub async fn place_disks(
    vim: &dyn VimApi,
    log: &Logger,
    vm: &VmRef,
    pod: &StoragePodRef,
    disks: &[PodDisk],
) -> Result<Vec<OptionValue>, Error> {
    let spec = StoragePlacementSpec::Reconfigure {
        pod: pod.clone(),
        vm: vm.clone(),
        disk_keys: disks.iter().map(|d| d.change.device.key).collect(),
        config_spec: VmConfigSpec {
            device_change: disks.iter().map(|d| d.change.clone()).collect(),
            ..VmConfigSpec::default()
        },
    };
    recommend_and_apply(vim, log, &spec).await?;

    let info = vim.vm(vm).await?;
    disks
        .iter()
        .map(|disk| {
            let device = info
                .device_at(disk.slot.controller_key, disk.slot.unit_number)
                .ok_or_else(|| PlacementError::DiskNotPlaced {
                    pod: pod.clone(),
                    vm: info.name.clone(),
                    disk_id: disk.disk_id,
                })?;
            Ok(set_disk_key(disk.disk_id, device.key))
        })
        .collect()
}
