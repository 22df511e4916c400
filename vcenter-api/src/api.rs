// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::AboutInfo;
use crate::ApplyRecommendationResult;
use crate::CloneSpec;
use crate::ClusterInfo;
use crate::ClusterRef;
use crate::CustomizationSpec;
use crate::DatacenterInfo;
use crate::DatacenterRef;
use crate::DatastoreInfo;
use crate::DatastoreRef;
use crate::DistributedPortGroupInfo;
use crate::DistributedPortGroupSpec;
use crate::DistributedSwitchInfo;
use crate::DistributedSwitchSpec;
use crate::DvsRef;
use crate::FolderRef;
use crate::HostInfo;
use crate::HostNetworkConfig;
use crate::HostRef;
use crate::NetworkRef;
use crate::PerfCounter;
use crate::PerfSamples;
use crate::PortGroupSpec;
use crate::ProxySwitch;
use crate::ResourcePoolRef;
use crate::SnapshotInfo;
use crate::SnapshotRef;
use crate::SnapshotSpec;
use crate::StoragePlacementResult;
use crate::StoragePlacementSpec;
use crate::TaskRef;
use crate::VimError;
use crate::VirtualSwitchSpec;
use crate::VmConfigSpec;
use crate::VmInfo;
use crate::VmRef;

/// Names each operation of [`VimApi`], for error reporting and fault
/// injection.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
pub enum VimOp {
    About,
    Datacenter,
    Cluster,
    Host,
    HostNetworkConfig,
    Datastore,
    FindFolder,
    CustomizationSpec,
    Vm,
    FindVmByName,
    CloneVm,
    ReconfigureVm,
    DestroyVm,
    PowerOn,
    PowerOff,
    Reset,
    Suspend,
    ShutdownGuest,
    RebootGuest,
    MarkAsTemplate,
    MarkAsVirtualMachine,
    CreateSnapshot,
    WaitForTask,
    RevertToSnapshot,
    RemoveSnapshot,
    RemoveAllSnapshots,
    SnapshotInfo,
    AddVirtualSwitch,
    UpdateVirtualSwitch,
    RemoveVirtualSwitch,
    AddPortGroup,
    UpdatePortGroup,
    RemovePortGroup,
    UpdateProxySwitch,
    DistributedSwitches,
    DistributedPortGroups,
    CreateDistributedSwitch,
    ReconfigureDistributedSwitch,
    DestroyDistributedSwitch,
    SwitchPortGroups,
    AddDistributedPortGroup,
    RenameDistributedPortGroup,
    ReconfigureDistributedPortGroup,
    DestroyDistributedPortGroup,
    RecommendDatastores,
    ApplyRecommendation,
    PerfRefreshRate,
    QueryPerf,
}

/// The operations the provisioning engine needs from the management
/// endpoint.
///
/// Every mutating call returns once the endpoint reports the underlying task
/// as finished, except [`VimApi::create_snapshot`], which hands back the task
/// so the caller can decide how to wait for it.
#[async_trait::async_trait]
pub trait VimApi: Send + Sync {
    async fn about(&self) -> Result<AboutInfo, VimError>;

    // Inventory

    async fn datacenter(
        &self,
        dc: &DatacenterRef,
    ) -> Result<DatacenterInfo, VimError>;

    async fn cluster(
        &self,
        cluster: &ClusterRef,
    ) -> Result<ClusterInfo, VimError>;

    async fn host(&self, host: &HostRef) -> Result<HostInfo, VimError>;

    async fn host_network_config(
        &self,
        host: &HostRef,
    ) -> Result<HostNetworkConfig, VimError>;

    async fn datastore(
        &self,
        ds: &DatastoreRef,
    ) -> Result<DatastoreInfo, VimError>;

    /// Resolves a `/`-separated folder path below the datacenter's VM
    /// folder.
    async fn find_folder(
        &self,
        dc: &DatacenterRef,
        path: &str,
    ) -> Result<Option<FolderRef>, VimError>;

    async fn customization_spec(
        &self,
        name: &str,
    ) -> Result<Option<CustomizationSpec>, VimError>;

    // Virtual machines

    async fn vm(&self, vm: &VmRef) -> Result<VmInfo, VimError>;

    async fn find_vm_by_name(
        &self,
        dc: &DatacenterRef,
        name: &str,
    ) -> Result<Option<VmRef>, VimError>;

    async fn clone_vm(
        &self,
        template: &VmRef,
        folder: &FolderRef,
        name: &str,
        spec: &CloneSpec,
    ) -> Result<VmRef, VimError>;

    async fn reconfigure_vm(
        &self,
        vm: &VmRef,
        spec: &VmConfigSpec,
    ) -> Result<(), VimError>;

    /// Destroys the VM along with every disk file still attached to it.
    async fn destroy_vm(&self, vm: &VmRef) -> Result<(), VimError>;

    async fn power_on(&self, vm: &VmRef) -> Result<(), VimError>;
    async fn power_off(&self, vm: &VmRef) -> Result<(), VimError>;
    async fn reset(&self, vm: &VmRef) -> Result<(), VimError>;
    async fn suspend(&self, vm: &VmRef) -> Result<(), VimError>;

    /// Asks the guest to shut down. Returns before the guest has stopped.
    async fn shutdown_guest(&self, vm: &VmRef) -> Result<(), VimError>;
    async fn reboot_guest(&self, vm: &VmRef) -> Result<(), VimError>;

    async fn mark_as_template(&self, vm: &VmRef) -> Result<(), VimError>;
    async fn mark_as_virtual_machine(
        &self,
        vm: &VmRef,
        pool: &ResourcePoolRef,
    ) -> Result<(), VimError>;

    // Snapshots

    async fn create_snapshot(
        &self,
        vm: &VmRef,
        spec: &SnapshotSpec,
    ) -> Result<TaskRef, VimError>;

    async fn wait_for_task(&self, task: &TaskRef) -> Result<(), VimError>;

    async fn revert_to_snapshot(
        &self,
        snapshot: &SnapshotRef,
    ) -> Result<(), VimError>;

    async fn remove_snapshot(
        &self,
        snapshot: &SnapshotRef,
        remove_children: bool,
    ) -> Result<(), VimError>;

    async fn remove_all_snapshots(&self, vm: &VmRef) -> Result<(), VimError>;

    async fn snapshot_info(
        &self,
        vm: &VmRef,
    ) -> Result<SnapshotInfo, VimError>;

    // Host-local networking

    async fn add_virtual_switch(
        &self,
        host: &HostRef,
        name: &str,
        spec: &VirtualSwitchSpec,
    ) -> Result<(), VimError>;

    async fn update_virtual_switch(
        &self,
        host: &HostRef,
        name: &str,
        spec: &VirtualSwitchSpec,
    ) -> Result<(), VimError>;

    async fn remove_virtual_switch(
        &self,
        host: &HostRef,
        name: &str,
    ) -> Result<(), VimError>;

    async fn add_port_group(
        &self,
        host: &HostRef,
        spec: &PortGroupSpec,
    ) -> Result<NetworkRef, VimError>;

    async fn update_port_group(
        &self,
        host: &HostRef,
        name: &str,
        spec: &PortGroupSpec,
    ) -> Result<(), VimError>;

    async fn remove_port_group(
        &self,
        host: &HostRef,
        name: &str,
    ) -> Result<(), VimError>;

    /// Adds the host to a distributed switch, or updates the uplinks of an
    /// existing membership.
    async fn update_proxy_switch(
        &self,
        host: &HostRef,
        proxy: &ProxySwitch,
    ) -> Result<(), VimError>;

    // Distributed networking

    async fn distributed_switches(
        &self,
        dc: &DatacenterRef,
    ) -> Result<Vec<DistributedSwitchInfo>, VimError>;

    async fn distributed_port_groups(
        &self,
        dc: &DatacenterRef,
    ) -> Result<Vec<DistributedPortGroupInfo>, VimError>;

    async fn create_distributed_switch(
        &self,
        dc: &DatacenterRef,
        spec: &DistributedSwitchSpec,
    ) -> Result<DistributedSwitchInfo, VimError>;

    async fn reconfigure_distributed_switch(
        &self,
        dvs: &DvsRef,
        spec: &DistributedSwitchSpec,
    ) -> Result<(), VimError>;

    async fn destroy_distributed_switch(
        &self,
        dvs: &DvsRef,
    ) -> Result<(), VimError>;

    /// Port groups the switch currently lists. A newly added port group may
    /// take a while to show up here.
    async fn switch_port_groups(
        &self,
        dvs: &DvsRef,
    ) -> Result<Vec<DistributedPortGroupInfo>, VimError>;

    async fn add_distributed_port_group(
        &self,
        dvs: &DvsRef,
        spec: &DistributedPortGroupSpec,
    ) -> Result<(), VimError>;

    async fn rename_distributed_port_group(
        &self,
        pg: &NetworkRef,
        name: &str,
    ) -> Result<(), VimError>;

    async fn reconfigure_distributed_port_group(
        &self,
        pg: &NetworkRef,
        spec: &DistributedPortGroupSpec,
    ) -> Result<(), VimError>;

    async fn destroy_distributed_port_group(
        &self,
        pg: &NetworkRef,
    ) -> Result<(), VimError>;

    // Storage placement

    async fn recommend_datastores(
        &self,
        spec: &StoragePlacementSpec,
    ) -> Result<StoragePlacementResult, VimError>;

    async fn apply_storage_recommendation(
        &self,
        key: &str,
    ) -> Result<ApplyRecommendationResult, VimError>;

    // Performance

    /// Sampling interval of the real-time performance provider, in seconds.
    async fn perf_refresh_rate(&self, vm: &VmRef) -> Result<u32, VimError>;

    async fn query_perf(
        &self,
        vm: &VmRef,
        counters: &[PerfCounter],
        max_samples: u32,
    ) -> Result<PerfSamples, VimError>;
}
