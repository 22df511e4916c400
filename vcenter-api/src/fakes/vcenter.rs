// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An in-memory management endpoint.

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
use crate::DeviceKind;
use crate::DeviceOperation;
use crate::DiskBacking;
use crate::DiskMoveType;
use crate::DistributedPortGroupInfo;
use crate::DistributedPortGroupSpec;
use crate::DistributedSwitchInfo;
use crate::DistributedSwitchSpec;
use crate::DvsRef;
use crate::Fault;
use crate::FileOperation;
use crate::FolderRef;
use crate::HostInfo;
use crate::HostNetworkConfig;
use crate::HostRef;
use crate::NetworkInfo;
use crate::NetworkRef;
use crate::NetworkType;
use crate::PerfCounter;
use crate::PerfSamples;
use crate::PlacementRecommendation;
use crate::PortBinding;
use crate::PortGroupSpec;
use crate::PowerState;
use crate::ProxySwitch;
use crate::QuickStats;
use crate::ResourcePoolInfo;
use crate::ResourcePoolRef;
use crate::SnapshotInfo;
use crate::SnapshotRef;
use crate::SnapshotSpec;
use crate::SnapshotTree;
use crate::StoragePlacementResult;
use crate::StoragePlacementSpec;
use crate::StoragePodRef;
use crate::TaskRef;
use crate::VimApi;
use crate::VimError;
use crate::VimOp;
use crate::VirtualDevice;
use crate::VirtualSwitch;
use crate::VirtualSwitchSpec;
use crate::VmConfigSpec;
use crate::VmInfo;
use crate::VmRef;
use crate::datastore_path;
use macaddr::MacAddr6;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

const DEFAULT_REFRESH_RATE_SECS: u32 = 20;

/// How the guest reacts to a shutdown or reboot request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestBehavior {
    /// The guest stops as soon as it is asked to.
    Cooperative,
    /// The request is accepted but the guest keeps running.
    Unresponsive,
    /// Guest tools are not running; requests fail.
    NoTools,
}

/// Switch and port group configuration of the whole endpoint, keyed by
/// name so that objects recreated under new references compare equal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSnapshot {
    pub hosts: BTreeMap<String, HostNetworkConfig>,
    pub switches: BTreeMap<String, DistributedSwitchSpec>,
    /// Port group name to (switch name, configuration).
    pub port_groups: BTreeMap<String, (String, DistributedPortGroupSpec)>,
}

struct FakeHost {
    info: HostInfo,
    network: HostNetworkConfig,
}

struct FakeVm {
    info: VmInfo,
    snapshots: SnapshotInfo,
    perf: PerfSamples,
    refresh_rate: u32,
}

struct FakeDvs {
    dc: DatacenterRef,
    info: DistributedSwitchInfo,
}

struct FakeDpg {
    dc: DatacenterRef,
    info: DistributedPortGroupInfo,
    /// Listings of the parent switch that will still omit this port group.
    hidden_polls: u32,
}

struct PendingSnapshot {
    vm: VmRef,
    snapshot: SnapshotRef,
    remaining_polls: u32,
}

enum TaskState {
    Done,
    SignalLost,
}

struct State {
    next_id: u64,
    next_device_key: i32,
    next_mac: u32,
    about: AboutInfo,
    datacenters: BTreeMap<DatacenterRef, DatacenterInfo>,
    vm_folders: BTreeMap<DatacenterRef, BTreeMap<String, FolderRef>>,
    clusters: BTreeMap<ClusterRef, ClusterInfo>,
    hosts: BTreeMap<HostRef, FakeHost>,
    datastores: BTreeMap<DatastoreRef, DatastoreInfo>,
    pods: BTreeMap<StoragePodRef, Vec<DatastoreRef>>,
    customization_specs: BTreeMap<String, CustomizationSpec>,
    vms: BTreeMap<VmRef, FakeVm>,
    files: BTreeSet<String>,
    switches: BTreeMap<DvsRef, FakeDvs>,
    port_groups: BTreeMap<NetworkRef, FakeDpg>,
    recommendations: BTreeMap<String, (StoragePlacementSpec, DatastoreRef)>,
    tasks: BTreeMap<TaskRef, TaskState>,
    faults: BTreeMap<VimOp, VecDeque<Fault>>,
    calls: Vec<VimOp>,
    dpg_visibility_delay: u32,
    snapshot_signal_delay: Option<u32>,
    pending_snapshot: Option<PendingSnapshot>,
    guest: GuestBehavior,
    blank_recommendation_keys: bool,
}

/// A management endpoint kept entirely in memory.
///
/// Objects are created through the `add_*` helpers; afterwards the fake is
/// driven through [`VimApi`] like the real thing. Failures can be injected
/// per operation with [`FakeVcenter::fail_next`].
pub struct FakeVcenter {
    state: Mutex<State>,
}

fn err(
    op: VimOp,
    object: impl Display,
    fault: Fault,
    message: impl Into<String>,
) -> VimError {
    VimError::new(op, object, fault, message)
}

impl State {
    fn id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn generate_mac(&mut self) -> MacAddr6 {
        self.next_mac += 1;
        let [_, a, b, c] = self.next_mac.to_be_bytes();
        MacAddr6::new(0x00, 0x50, 0x56, a, b, c)
    }

    fn begin(
        &mut self,
        op: VimOp,
        object: impl Display,
    ) -> Result<(), VimError> {
        self.calls.push(op);
        match self.faults.get_mut(&op).and_then(|q| q.pop_front()) {
            Some(fault) => Err(err(op, object, fault, "injected fault")),
            None => Ok(()),
        }
    }

    fn vm(&self, op: VimOp, vm: &VmRef) -> Result<&FakeVm, VimError> {
        self.vms.get(vm).ok_or_else(|| VimError::not_found(op, vm))
    }

    fn vm_mut(
        &mut self,
        op: VimOp,
        vm: &VmRef,
    ) -> Result<&mut FakeVm, VimError> {
        self.vms.get_mut(vm).ok_or_else(|| VimError::not_found(op, vm))
    }

    fn host_mut(
        &mut self,
        op: VimOp,
        host: &HostRef,
    ) -> Result<&mut FakeHost, VimError> {
        self.hosts.get_mut(host).ok_or_else(|| VimError::not_found(op, host))
    }

    fn datastore_name(
        &self,
        op: VimOp,
        ds: &DatastoreRef,
    ) -> Result<String, VimError> {
        self.datastores
            .get(ds)
            .map(|info| info.name.clone())
            .ok_or_else(|| VimError::not_found(op, ds))
    }

    fn network_in_use(&self, network: &NetworkRef) -> bool {
        self.vms.values().any(|vm| {
            vm.info.devices.iter().any(|d| {
                d.nic().is_some_and(|nic| &nic.backing.network_ref() == network)
            })
        })
    }

    fn apply_config(
        &mut self,
        op: VimOp,
        vm_ref: &VmRef,
        spec: &VmConfigSpec,
        placement: Option<&DatastoreRef>,
    ) -> Result<(), VimError> {
        let (vm_name, power_state, mut devices, mut extra_config) = {
            let vm = self.vm(op, vm_ref)?;
            (
                vm.info.name.clone(),
                vm.info.power_state,
                vm.info.devices.clone(),
                vm.info.extra_config.clone(),
            )
        };
        let mut created = Vec::new();
        let mut destroyed = Vec::new();

        for change in &spec.device_change {
            match change.operation {
                DeviceOperation::Add => {
                    let mut device = change.device.clone();
                    if device.key <= 0 {
                        self.next_device_key += 1;
                        device.key = self.next_device_key;
                    }
                    if devices.iter().any(|d| d.key == device.key) {
                        return Err(err(
                            op,
                            vm_ref,
                            Fault::InvalidArgument,
                            format!("device key {} already in use", device.key),
                        ));
                    }
                    if let (Some(ctrl), Some(unit)) =
                        (device.controller_key, device.unit_number)
                    {
                        if !devices.iter().any(|d| d.key == ctrl) {
                            return Err(err(
                                op,
                                vm_ref,
                                Fault::InvalidArgument,
                                format!("controller {ctrl} does not exist"),
                            ));
                        }
                        if devices.iter().any(|d| {
                            d.controller_key == Some(ctrl)
                                && d.unit_number == Some(unit)
                        }) {
                            return Err(err(
                                op,
                                vm_ref,
                                Fault::InvalidArgument,
                                format!(
                                    "unit {unit} of controller {ctrl} is \
                                     already in use"
                                ),
                            ));
                        }
                    }
                    let key = device.key;
                    let create =
                        change.file_operation == Some(FileOperation::Create);
                    match &mut device.kind {
                        DeviceKind::Disk { backing, .. } => {
                            if create {
                                if let Some(target) = placement {
                                    backing.datastore = Some(target.clone());
                                }
                                if backing.file_name.is_empty()
                                    || placement.is_some()
                                {
                                    let Some(ds) = backing.datastore.clone()
                                    else {
                                        return Err(err(
                                            op,
                                            vm_ref,
                                            Fault::InvalidArgument,
                                            "new disk has no datastore",
                                        ));
                                    };
                                    let ds_name =
                                        self.datastore_name(op, &ds)?;
                                    let path = format!(
                                        "{vm_name}/{vm_name}_{key}.vmdk"
                                    );
                                    backing.file_name =
                                        datastore_path(&ds_name, &path);
                                }
                                created.push(backing.file_name.clone());
                            } else if !self.files.contains(&backing.file_name)
                                && !created.contains(&backing.file_name)
                            {
                                return Err(err(
                                    op,
                                    vm_ref,
                                    Fault::NotFound,
                                    format!(
                                        "file {} was not found",
                                        backing.file_name
                                    ),
                                ));
                            }
                        }
                        DeviceKind::Cdrom { .. } => {
                            if power_state != PowerState::PoweredOff {
                                return Err(err(
                                    op,
                                    vm_ref,
                                    Fault::InvalidState,
                                    "CD-ROM drives can only be added while \
                                     powered off",
                                ));
                            }
                        }
                        DeviceKind::Nic(nic) => {
                            if nic.mac.is_none() {
                                nic.mac = Some(self.generate_mac());
                            }
                        }
                        _ => {}
                    }
                    devices.push(device);
                }
                DeviceOperation::Remove => {
                    let idx = devices
                        .iter()
                        .position(|d| d.key == change.device.key)
                        .ok_or_else(|| {
                            let key = change.device.key;
                            err(
                                op,
                                vm_ref,
                                Fault::NotFound,
                                format!("device {key} not found"),
                            )
                        })?;
                    let removed = devices.remove(idx);
                    if change.file_operation == Some(FileOperation::Destroy) {
                        if let Some(file) = removed.backing_file() {
                            destroyed.push(file.to_string());
                        }
                    }
                }
                DeviceOperation::Edit => {
                    let slot = devices
                        .iter_mut()
                        .find(|d| d.key == change.device.key)
                        .ok_or_else(|| {
                            let key = change.device.key;
                            err(
                                op,
                                vm_ref,
                                Fault::NotFound,
                                format!("device {key} not found"),
                            )
                        })?;
                    *slot = change.device.clone();
                }
            }
        }

        for option in &spec.extra_config {
            if option.value.is_empty() {
                extra_config.remove(&option.key);
            } else {
                extra_config.insert(option.key.clone(), option.value.clone());
            }
        }

        let vm = self.vm_mut(op, vm_ref)?;
        vm.info.devices = devices;
        vm.info.extra_config = extra_config;
        if let Some(cpus) = spec.num_cpus {
            vm.info.num_cpus = cpus;
        }
        if let Some(memory) = spec.memory_mb {
            vm.info.memory_mb = memory;
        }
        for file in destroyed {
            self.files.remove(&file);
        }
        self.files.extend(created);
        Ok(())
    }

    fn clone_from(
        &mut self,
        op: VimOp,
        template: &VmRef,
        folder: &FolderRef,
        name: &str,
        spec: &CloneSpec,
    ) -> Result<VmRef, VimError> {
        let source = self.vm(op, template)?.info.clone();
        if self.vms.values().any(|vm| {
            vm.info.name == name && vm.info.datacenter == source.datacenter
        }) {
            return Err(err(
                op,
                name,
                Fault::DuplicateName,
                format!("The name '{name}' already exists."),
            ));
        }

        let linked = spec.location.disk_move_type
            == DiskMoveType::MoveChildMostDiskBacking;
        let mut devices = Vec::with_capacity(source.devices.len());
        let mut files = Vec::new();
        for mut device in source.devices.iter().cloned() {
            match &mut device.kind {
                DeviceKind::Disk { backing, .. } => {
                    let ds = spec
                        .location
                        .datastore
                        .clone()
                        .or_else(|| backing.datastore.clone());
                    let ds_name = match &ds {
                        Some(ds) => self.datastore_name(op, ds)?,
                        None => String::new(),
                    };
                    let path = if files.is_empty() {
                        format!("{name}/{name}.vmdk")
                    } else {
                        format!("{name}/{name}_{}.vmdk", files.len())
                    };
                    let file_name = datastore_path(&ds_name, &path);
                    let parent = linked.then(|| Box::new(backing.clone()));
                    *backing = DiskBacking {
                        file_name: file_name.clone(),
                        datastore: ds,
                        disk_mode: backing.disk_mode,
                        parent,
                    };
                    files.push(file_name);
                }
                DeviceKind::Nic(nic) => nic.mac = Some(self.generate_mac()),
                _ => {}
            }
            devices.push(device);
        }

        let vm_ref = VmRef::new(self.id("vm"));
        let info = VmInfo {
            name: name.to_string(),
            datacenter: source.datacenter.clone(),
            parent_folder: folder.clone(),
            template: spec.template,
            power_state: PowerState::PoweredOff,
            num_cpus: source.num_cpus,
            memory_mb: source.memory_mb,
            host: spec.location.host.clone().unwrap_or(source.host.clone()),
            resource_pool: spec.location.pool.clone(),
            devices,
            extra_config: source.extra_config.clone(),
            quick_stats: QuickStats::default(),
        };
        self.vms.insert(
            vm_ref.clone(),
            FakeVm {
                info,
                snapshots: SnapshotInfo::default(),
                perf: PerfSamples::new(),
                refresh_rate: DEFAULT_REFRESH_RATE_SECS,
            },
        );
        self.files.extend(files.iter().cloned());

        if let Some(config) = &spec.config {
            if let Err(e) = self.apply_config(op, &vm_ref, config, None) {
                self.vms.remove(&vm_ref);
                for file in &files {
                    self.files.remove(file);
                }
                return Err(e);
            }
        }
        if spec.power_on {
            self.vm_mut(op, &vm_ref)?.info.power_state = PowerState::PoweredOn;
        }
        Ok(vm_ref)
    }

    fn set_power(
        &mut self,
        op: VimOp,
        vm: &VmRef,
        from: &[PowerState],
        to: PowerState,
    ) -> Result<(), VimError> {
        self.begin(op, vm)?;
        let fake = self.vm_mut(op, vm)?;
        if !from.contains(&fake.info.power_state) {
            return Err(err(
                op,
                vm,
                Fault::InvalidState,
                format!(
                    "the operation is not allowed in the current state ({})",
                    fake.info.power_state
                ),
            ));
        }
        fake.info.power_state = to;
        Ok(())
    }

    fn find_snapshot_vm(&self, snapshot: &SnapshotRef) -> Option<VmRef> {
        self.vms.iter().find_map(|(vm_ref, vm)| {
            vm.snapshots
                .roots
                .iter()
                .any(|root| tree_contains(root, snapshot))
                .then(|| vm_ref.clone())
        })
    }
}

fn tree_contains(node: &SnapshotTree, target: &SnapshotRef) -> bool {
    &node.snapshot == target
        || node.children.iter().any(|child| tree_contains(child, target))
}

/// Adds `child` below `parent`, handing it back when `parent` is not in the
/// tree.
fn insert_snapshot(
    nodes: &mut [SnapshotTree],
    parent: &SnapshotRef,
    mut child: SnapshotTree,
) -> Result<(), SnapshotTree> {
    for node in nodes {
        if &node.snapshot == parent {
            node.children.push(child);
            return Ok(());
        }
        match insert_snapshot(&mut node.children, parent, child) {
            Ok(()) => return Ok(()),
            Err(c) => child = c,
        }
    }
    Err(child)
}

/// Returns the parent of `target` (`Some(None)` for roots), or `None` when
/// the snapshot is not in the tree.
fn snapshot_parent(
    nodes: &[SnapshotTree],
    target: &SnapshotRef,
    parent: Option<&SnapshotRef>,
) -> Option<Option<SnapshotRef>> {
    for node in nodes {
        if &node.snapshot == target {
            return Some(parent.cloned());
        }
        if let Some(found) =
            snapshot_parent(&node.children, target, Some(&node.snapshot))
        {
            return Some(found);
        }
    }
    None
}

fn remove_snapshot_node(
    nodes: &mut Vec<SnapshotTree>,
    target: &SnapshotRef,
    keep_children: bool,
) -> Option<SnapshotTree> {
    if let Some(idx) = nodes.iter().position(|n| &n.snapshot == target) {
        let node = nodes.remove(idx);
        if keep_children {
            for (offset, child) in node.children.iter().cloned().enumerate() {
                nodes.insert(idx + offset, child);
            }
        }
        return Some(node);
    }
    nodes
        .iter_mut()
        .find_map(|n| {
            remove_snapshot_node(&mut n.children, target, keep_children)
        })
}

impl FakeVcenter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                next_id: 0,
                next_device_key: 4000,
                next_mac: 0,
                about: AboutInfo {
                    instance_uuid: "5c1d2ac4-8a3d-4f8e-9d0c-7c2a8a1b0001"
                        .to_string(),
                    api_version: "6.7".to_string(),
                },
                datacenters: BTreeMap::new(),
                vm_folders: BTreeMap::new(),
                clusters: BTreeMap::new(),
                hosts: BTreeMap::new(),
                datastores: BTreeMap::new(),
                pods: BTreeMap::new(),
                customization_specs: BTreeMap::new(),
                vms: BTreeMap::new(),
                files: BTreeSet::new(),
                switches: BTreeMap::new(),
                port_groups: BTreeMap::new(),
                recommendations: BTreeMap::new(),
                tasks: BTreeMap::new(),
                faults: BTreeMap::new(),
                calls: Vec::new(),
                dpg_visibility_delay: 0,
                snapshot_signal_delay: None,
                pending_snapshot: None,
                guest: GuestBehavior::Cooperative,
                blank_recommendation_keys: false,
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    // Inventory setup

    pub fn set_api_version(&self, version: &str) {
        self.state().about.api_version = version.to_string();
    }

    pub fn instance_uuid(&self) -> String {
        self.state().about.instance_uuid.clone()
    }

    pub fn add_datacenter(&self, name: &str) -> DatacenterRef {
        let mut state = self.state();
        let dc = DatacenterRef::new(state.id("datacenter"));
        let root = FolderRef::new(state.id("folder"));
        state.datacenters.insert(
            dc.clone(),
            DatacenterInfo { name: name.to_string() },
        );
        state
            .vm_folders
            .insert(dc.clone(), BTreeMap::from([(String::new(), root)]));
        dc
    }

    pub fn add_folder(&self, dc: &DatacenterRef, path: &str) -> FolderRef {
        let mut state = self.state();
        let folder = FolderRef::new(state.id("folder"));
        state
            .vm_folders
            .entry(dc.clone())
            .or_default()
            .insert(path.trim_matches('/').to_string(), folder.clone());
        folder
    }

    pub fn add_cluster(&self, dc: &DatacenterRef, name: &str) -> ClusterRef {
        let mut state = self.state();
        let cluster = ClusterRef::new(state.id("domain-c"));
        let pool = ResourcePoolRef::new(state.id("resgroup"));
        state.clusters.insert(
            cluster.clone(),
            ClusterInfo {
                name: name.to_string(),
                datacenter: dc.clone(),
                resource_pool: pool,
                resource_pools: Vec::new(),
            },
        );
        cluster
    }

    pub fn add_resource_pool(
        &self,
        cluster: &ClusterRef,
        name: &str,
    ) -> ResourcePoolRef {
        let mut state = self.state();
        let pool = ResourcePoolRef::new(state.id("resgroup"));
        if let Some(info) = state.clusters.get_mut(cluster) {
            info.resource_pools.push(ResourcePoolInfo {
                reference: pool.clone(),
                name: name.to_string(),
            });
        }
        pool
    }

    pub fn root_pool(&self, cluster: &ClusterRef) -> Option<ResourcePoolRef> {
        self.state().clusters.get(cluster).map(|c| c.resource_pool.clone())
    }

    pub fn add_host(
        &self,
        cluster: &ClusterRef,
        name: &str,
        pnics: &[&str],
    ) -> HostRef {
        let mut state = self.state();
        let host = HostRef::new(state.id("host"));
        state.hosts.insert(
            host.clone(),
            FakeHost {
                info: HostInfo {
                    name: name.to_string(),
                    cluster: cluster.clone(),
                    cpu_mhz: 2400,
                    networks: Vec::new(),
                },
                network: HostNetworkConfig {
                    pnics: pnics.iter().map(|p| p.to_string()).collect(),
                    ..Default::default()
                },
            },
        );
        host
    }

    pub fn add_datastore(&self, name: &str) -> DatastoreRef {
        let mut state = self.state();
        let ds = DatastoreRef::new(state.id("datastore"));
        state
            .datastores
            .insert(ds.clone(), DatastoreInfo { name: name.to_string() });
        ds
    }

    pub fn add_storage_pod(
        &self,
        datastores: &[DatastoreRef],
    ) -> StoragePodRef {
        let mut state = self.state();
        let pod = StoragePodRef::new(state.id("group-p"));
        state.pods.insert(pod.clone(), datastores.to_vec());
        pod
    }

    pub fn add_customization_spec(&self, name: &str) {
        self.state().customization_specs.insert(
            name.to_string(),
            CustomizationSpec {
                name: name.to_string(),
                body: format!("<customization name=\"{name}\"/>"),
            },
        );
    }

    pub fn add_file(&self, file_name: &str) {
        self.state().files.insert(file_name.to_string());
    }

    pub fn file_exists(&self, file_name: &str) -> bool {
        self.state().files.contains(file_name)
    }

    pub fn files(&self) -> Vec<String> {
        self.state().files.iter().cloned().collect()
    }

    fn insert_vm(
        &self,
        host: &HostRef,
        pool: &ResourcePoolRef,
        name: &str,
        devices: Vec<VirtualDevice>,
        template: bool,
    ) -> VmRef {
        let mut state = self.state();
        let dc = state
            .hosts
            .get(host)
            .and_then(|h| state.clusters.get(&h.info.cluster))
            .map(|c| c.datacenter.clone())
            .unwrap_or_else(|| DatacenterRef::new("datacenter-0"));
        let folder = state
            .vm_folders
            .get(&dc)
            .and_then(|folders| folders.get(""))
            .cloned()
            .unwrap_or_else(|| FolderRef::new("folder-0"));
        for device in &devices {
            if let DeviceKind::Disk { backing, .. } = &device.kind {
                let mut backing = Some(backing);
                while let Some(b) = backing {
                    state.files.insert(b.file_name.clone());
                    backing = b.parent.as_deref();
                }
            }
        }
        let vm = VmRef::new(state.id("vm"));
        state.vms.insert(
            vm.clone(),
            FakeVm {
                info: VmInfo {
                    name: name.to_string(),
                    datacenter: dc,
                    parent_folder: folder,
                    template,
                    power_state: PowerState::PoweredOff,
                    num_cpus: 1,
                    memory_mb: 1024,
                    host: host.clone(),
                    resource_pool: pool.clone(),
                    devices,
                    extra_config: BTreeMap::new(),
                    quick_stats: QuickStats::default(),
                },
                snapshots: SnapshotInfo::default(),
                perf: PerfSamples::new(),
                refresh_rate: DEFAULT_REFRESH_RATE_SECS,
            },
        );
        vm
    }

    /// Adds a powered-off VM. Backing files of its disks are created too.
    pub fn add_vm(
        &self,
        host: &HostRef,
        pool: &ResourcePoolRef,
        name: &str,
        devices: Vec<VirtualDevice>,
    ) -> VmRef {
        self.insert_vm(host, pool, name, devices, false)
    }

    pub fn add_template(
        &self,
        host: &HostRef,
        pool: &ResourcePoolRef,
        name: &str,
        devices: Vec<VirtualDevice>,
    ) -> VmRef {
        self.insert_vm(host, pool, name, devices, true)
    }

    // Inspection and manipulation

    pub fn vm_info(&self, vm: &VmRef) -> Option<VmInfo> {
        self.state().vms.get(vm).map(|v| v.info.clone())
    }

    pub fn vms_named(&self, name: &str) -> Vec<VmRef> {
        self.state()
            .vms
            .iter()
            .filter(|(_, vm)| vm.info.name == name)
            .map(|(vm_ref, _)| vm_ref.clone())
            .collect()
    }

    pub fn set_power_state(&self, vm: &VmRef, power_state: PowerState) {
        if let Some(fake) = self.state().vms.get_mut(vm) {
            fake.info.power_state = power_state;
        }
    }

    pub fn set_extra_config(&self, vm: &VmRef, key: &str, value: &str) {
        if let Some(fake) = self.state().vms.get_mut(vm) {
            fake.info.extra_config.insert(key.to_string(), value.to_string());
        }
    }

    /// Drops a device without going through a reconfiguration, the way an
    /// operator acting on the endpoint directly would.
    pub fn remove_device(&self, vm: &VmRef, key: i32) {
        if let Some(fake) = self.state().vms.get_mut(vm) {
            fake.info.devices.retain(|d| d.key != key);
        }
    }

    pub fn set_quick_stats(&self, vm: &VmRef, stats: QuickStats) {
        if let Some(fake) = self.state().vms.get_mut(vm) {
            fake.info.quick_stats = stats;
        }
    }

    pub fn set_perf_samples(
        &self,
        vm: &VmRef,
        counter: PerfCounter,
        samples: Vec<i64>,
    ) {
        if let Some(fake) = self.state().vms.get_mut(vm) {
            fake.perf.insert(counter, samples);
        }
    }

    pub fn set_refresh_rate(&self, vm: &VmRef, secs: u32) {
        if let Some(fake) = self.state().vms.get_mut(vm) {
            fake.refresh_rate = secs;
        }
    }

    pub fn set_guest_behavior(&self, behavior: GuestBehavior) {
        self.state().guest = behavior;
    }

    /// Makes the next call to `op` fail with `fault`. Repeated calls queue
    /// further failures.
    pub fn fail_next(&self, op: VimOp, fault: Fault) {
        self.state().faults.entry(op).or_default().push_back(fault);
    }

    pub fn call_count(&self, op: VimOp) -> usize {
        self.state().calls.iter().filter(|c| **c == op).count()
    }

    pub fn calls(&self) -> Vec<VimOp> {
        self.state().calls.clone()
    }

    /// New distributed port groups stay out of their switch's listing for
    /// this many listings.
    pub fn set_port_group_visibility_delay(&self, polls: u32) {
        self.state().dpg_visibility_delay = polls;
    }

    /// Snapshot tasks stop reporting completion; a new snapshot becomes
    /// current only after `polls` further reads of the snapshot tree.
    pub fn suppress_snapshot_signal(&self, polls: u32) {
        self.state().snapshot_signal_delay = Some(polls);
    }

    /// Recommendations come back with empty keys.
    pub fn set_blank_recommendation_keys(&self, blank: bool) {
        self.state().blank_recommendation_keys = blank;
    }

    pub fn host_network(&self, host: &HostRef) -> Option<HostNetworkConfig> {
        self.state().hosts.get(host).map(|h| h.network.clone())
    }

    pub fn distributed_switch_named(
        &self,
        name: &str,
    ) -> Option<DistributedSwitchInfo> {
        self.state()
            .switches
            .values()
            .find(|s| s.info.spec.name == name)
            .map(|s| s.info.clone())
    }

    pub fn distributed_port_group_named(
        &self,
        name: &str,
    ) -> Option<DistributedPortGroupInfo> {
        self.state()
            .port_groups
            .values()
            .find(|pg| pg.info.spec.name == name)
            .map(|pg| pg.info.clone())
    }

    pub fn network_snapshot(&self) -> NetworkSnapshot {
        let state = self.state();
        NetworkSnapshot {
            hosts: state
                .hosts
                .values()
                .map(|h| (h.info.name.clone(), h.network.clone()))
                .collect(),
            switches: state
                .switches
                .values()
                .map(|s| (s.info.spec.name.clone(), s.info.spec.clone()))
                .collect(),
            port_groups: state
                .port_groups
                .values()
                .map(|pg| {
                    (
                        pg.info.spec.name.clone(),
                        (pg.info.switch_name.clone(), pg.info.spec.clone()),
                    )
                })
                .collect(),
        }
    }
}

#[async_trait::async_trait]
impl VimApi for FakeVcenter {
    async fn about(&self) -> Result<AboutInfo, VimError> {
        let mut state = self.state();
        state.begin(VimOp::About, "ServiceInstance")?;
        Ok(state.about.clone())
    }

    async fn datacenter(
        &self,
        dc: &DatacenterRef,
    ) -> Result<DatacenterInfo, VimError> {
        let mut state = self.state();
        state.begin(VimOp::Datacenter, dc)?;
        state
            .datacenters
            .get(dc)
            .cloned()
            .ok_or_else(|| VimError::not_found(VimOp::Datacenter, dc))
    }

    async fn cluster(
        &self,
        cluster: &ClusterRef,
    ) -> Result<ClusterInfo, VimError> {
        let mut state = self.state();
        state.begin(VimOp::Cluster, cluster)?;
        state
            .clusters
            .get(cluster)
            .cloned()
            .ok_or_else(|| VimError::not_found(VimOp::Cluster, cluster))
    }

    async fn host(&self, host: &HostRef) -> Result<HostInfo, VimError> {
        let mut state = self.state();
        state.begin(VimOp::Host, host)?;
        let fake = state
            .hosts
            .get(host)
            .ok_or_else(|| VimError::not_found(VimOp::Host, host))?;
        let mut info = fake.info.clone();
        let member_of = fake
            .network
            .proxy_switches
            .iter()
            .map(|ps| ps.dvs_uuid.as_str())
            .collect::<Vec<_>>();
        info.networks.extend(
            state
                .port_groups
                .values()
                .filter(|pg| member_of.contains(&pg.info.switch_uuid.as_str()))
                .map(|pg| NetworkInfo {
                    reference: pg.info.reference.clone(),
                    name: pg.info.spec.name.clone(),
                    network_type: NetworkType::Distributed {
                        switch_uuid: pg.info.switch_uuid.clone(),
                        port_group_key: pg.info.key.clone(),
                    },
                }),
        );
        Ok(info)
    }

    async fn host_network_config(
        &self,
        host: &HostRef,
    ) -> Result<HostNetworkConfig, VimError> {
        let mut state = self.state();
        state.begin(VimOp::HostNetworkConfig, host)?;
        Ok(state.host_mut(VimOp::HostNetworkConfig, host)?.network.clone())
    }

    async fn datastore(
        &self,
        ds: &DatastoreRef,
    ) -> Result<DatastoreInfo, VimError> {
        let mut state = self.state();
        state.begin(VimOp::Datastore, ds)?;
        state
            .datastores
            .get(ds)
            .cloned()
            .ok_or_else(|| VimError::not_found(VimOp::Datastore, ds))
    }

    async fn find_folder(
        &self,
        dc: &DatacenterRef,
        path: &str,
    ) -> Result<Option<FolderRef>, VimError> {
        let mut state = self.state();
        state.begin(VimOp::FindFolder, dc)?;
        Ok(state
            .vm_folders
            .get(dc)
            .and_then(|folders| folders.get(path.trim_matches('/')))
            .cloned())
    }

    async fn customization_spec(
        &self,
        name: &str,
    ) -> Result<Option<CustomizationSpec>, VimError> {
        let mut state = self.state();
        state.begin(VimOp::CustomizationSpec, name)?;
        Ok(state.customization_specs.get(name).cloned())
    }

    async fn vm(&self, vm: &VmRef) -> Result<VmInfo, VimError> {
        let mut state = self.state();
        state.begin(VimOp::Vm, vm)?;
        Ok(state.vm(VimOp::Vm, vm)?.info.clone())
    }

    async fn find_vm_by_name(
        &self,
        dc: &DatacenterRef,
        name: &str,
    ) -> Result<Option<VmRef>, VimError> {
        let mut state = self.state();
        state.begin(VimOp::FindVmByName, name)?;
        Ok(state
            .vms
            .iter()
            .find(|(_, vm)| vm.info.name == name && &vm.info.datacenter == dc)
            .map(|(vm_ref, _)| vm_ref.clone()))
    }

    async fn clone_vm(
        &self,
        template: &VmRef,
        folder: &FolderRef,
        name: &str,
        spec: &CloneSpec,
    ) -> Result<VmRef, VimError> {
        let mut state = self.state();
        state.begin(VimOp::CloneVm, name)?;
        state.clone_from(VimOp::CloneVm, template, folder, name, spec)
    }

    async fn reconfigure_vm(
        &self,
        vm: &VmRef,
        spec: &VmConfigSpec,
    ) -> Result<(), VimError> {
        let mut state = self.state();
        state.begin(VimOp::ReconfigureVm, vm)?;
        state.apply_config(VimOp::ReconfigureVm, vm, spec, None)
    }

    async fn destroy_vm(&self, vm: &VmRef) -> Result<(), VimError> {
        let mut state = self.state();
        state.begin(VimOp::DestroyVm, vm)?;
        let fake = state
            .vms
            .remove(vm)
            .ok_or_else(|| VimError::not_found(VimOp::DestroyVm, vm))?;
        for device in &fake.info.devices {
            if let DeviceKind::Disk { backing, .. } = &device.kind {
                state.files.remove(&backing.file_name);
            }
        }
        Ok(())
    }

    async fn power_on(&self, vm: &VmRef) -> Result<(), VimError> {
        self.state().set_power(
            VimOp::PowerOn,
            vm,
            &[PowerState::PoweredOff, PowerState::Suspended],
            PowerState::PoweredOn,
        )
    }

    async fn power_off(&self, vm: &VmRef) -> Result<(), VimError> {
        self.state().set_power(
            VimOp::PowerOff,
            vm,
            &[PowerState::PoweredOn, PowerState::Suspended],
            PowerState::PoweredOff,
        )
    }

    async fn reset(&self, vm: &VmRef) -> Result<(), VimError> {
        self.state().set_power(
            VimOp::Reset,
            vm,
            &[PowerState::PoweredOn],
            PowerState::PoweredOn,
        )
    }

    async fn suspend(&self, vm: &VmRef) -> Result<(), VimError> {
        self.state().set_power(
            VimOp::Suspend,
            vm,
            &[PowerState::PoweredOn],
            PowerState::Suspended,
        )
    }

    async fn shutdown_guest(&self, vm: &VmRef) -> Result<(), VimError> {
        let mut state = self.state();
        match state.guest {
            GuestBehavior::Cooperative => state.set_power(
                VimOp::ShutdownGuest,
                vm,
                &[PowerState::PoweredOn],
                PowerState::PoweredOff,
            ),
            GuestBehavior::Unresponsive => {
                state.begin(VimOp::ShutdownGuest, vm)?;
                state.vm(VimOp::ShutdownGuest, vm).map(|_| ())
            }
            GuestBehavior::NoTools => {
                state.begin(VimOp::ShutdownGuest, vm)?;
                Err(err(
                    VimOp::ShutdownGuest,
                    vm,
                    Fault::InvalidState,
                    "guest tools are not running",
                ))
            }
        }
    }

    async fn reboot_guest(&self, vm: &VmRef) -> Result<(), VimError> {
        let mut state = self.state();
        if state.guest == GuestBehavior::NoTools {
            state.begin(VimOp::RebootGuest, vm)?;
            return Err(err(
                VimOp::RebootGuest,
                vm,
                Fault::InvalidState,
                "guest tools are not running",
            ));
        }
        state.set_power(
            VimOp::RebootGuest,
            vm,
            &[PowerState::PoweredOn],
            PowerState::PoweredOn,
        )
    }

    async fn mark_as_template(&self, vm: &VmRef) -> Result<(), VimError> {
        let mut state = self.state();
        state.begin(VimOp::MarkAsTemplate, vm)?;
        let fake = state.vm_mut(VimOp::MarkAsTemplate, vm)?;
        if fake.info.power_state != PowerState::PoweredOff {
            return Err(err(
                VimOp::MarkAsTemplate,
                vm,
                Fault::InvalidState,
                "only powered off VMs can become templates",
            ));
        }
        fake.info.template = true;
        Ok(())
    }

    async fn mark_as_virtual_machine(
        &self,
        vm: &VmRef,
        pool: &ResourcePoolRef,
    ) -> Result<(), VimError> {
        let mut state = self.state();
        state.begin(VimOp::MarkAsVirtualMachine, vm)?;
        let fake = state.vm_mut(VimOp::MarkAsVirtualMachine, vm)?;
        fake.info.template = false;
        fake.info.resource_pool = pool.clone();
        Ok(())
    }

    async fn create_snapshot(
        &self,
        vm: &VmRef,
        spec: &SnapshotSpec,
    ) -> Result<TaskRef, VimError> {
        let mut state = self.state();
        state.begin(VimOp::CreateSnapshot, vm)?;
        state.vm(VimOp::CreateSnapshot, vm)?;
        let snapshot = SnapshotRef::new(state.id("snapshot"));
        let task = TaskRef::new(state.id("task"));
        let node = SnapshotTree {
            snapshot: snapshot.clone(),
            name: spec.name.clone(),
            description: spec.description.clone(),
            children: Vec::new(),
        };
        let delay = state.snapshot_signal_delay;
        let fake = state.vm_mut(VimOp::CreateSnapshot, vm)?;
        match fake.snapshots.current.clone() {
            Some(current) => {
                if let Err(node) =
                    insert_snapshot(&mut fake.snapshots.roots, &current, node)
                {
                    fake.snapshots.roots.push(node);
                }
            }
            None => fake.snapshots.roots.push(node),
        }
        match delay {
            Some(remaining_polls) => {
                state.pending_snapshot = Some(PendingSnapshot {
                    vm: vm.clone(),
                    snapshot,
                    remaining_polls,
                });
                state.tasks.insert(task.clone(), TaskState::SignalLost);
            }
            None => {
                fake.snapshots.current = Some(snapshot);
                state.tasks.insert(task.clone(), TaskState::Done);
            }
        }
        Ok(task)
    }

    async fn wait_for_task(&self, task: &TaskRef) -> Result<(), VimError> {
        let mut state = self.state();
        state.begin(VimOp::WaitForTask, task)?;
        match state.tasks.get(task) {
            Some(TaskState::Done) => Ok(()),
            Some(TaskState::SignalLost) => Err(err(
                VimOp::WaitForTask,
                task,
                Fault::Other,
                "task did not report completion",
            )),
            None => Err(VimError::not_found(VimOp::WaitForTask, task)),
        }
    }

    async fn revert_to_snapshot(
        &self,
        snapshot: &SnapshotRef,
    ) -> Result<(), VimError> {
        let mut state = self.state();
        state.begin(VimOp::RevertToSnapshot, snapshot)?;
        let vm = state.find_snapshot_vm(snapshot).ok_or_else(|| {
            VimError::not_found(VimOp::RevertToSnapshot, snapshot)
        })?;
        state.vm_mut(VimOp::RevertToSnapshot, &vm)?.snapshots.current =
            Some(snapshot.clone());
        Ok(())
    }

    async fn remove_snapshot(
        &self,
        snapshot: &SnapshotRef,
        remove_children: bool,
    ) -> Result<(), VimError> {
        let mut state = self.state();
        state.begin(VimOp::RemoveSnapshot, snapshot)?;
        let vm = state.find_snapshot_vm(snapshot).ok_or_else(|| {
            VimError::not_found(VimOp::RemoveSnapshot, snapshot)
        })?;
        let fake = state.vm_mut(VimOp::RemoveSnapshot, &vm)?;
        let parent = snapshot_parent(&fake.snapshots.roots, snapshot, None)
            .flatten();
        if let Some(removed) = remove_snapshot_node(
            &mut fake.snapshots.roots,
            snapshot,
            !remove_children,
        ) {
            let current_gone = match &fake.snapshots.current {
                Some(current) if remove_children => {
                    tree_contains(&removed, current)
                }
                Some(current) => current == snapshot,
                None => false,
            };
            if current_gone {
                fake.snapshots.current = parent;
            }
        }
        Ok(())
    }

    async fn remove_all_snapshots(&self, vm: &VmRef) -> Result<(), VimError> {
        let mut state = self.state();
        state.begin(VimOp::RemoveAllSnapshots, vm)?;
        let fake = state.vm_mut(VimOp::RemoveAllSnapshots, vm)?;
        fake.snapshots = SnapshotInfo::default();
        Ok(())
    }

    async fn snapshot_info(
        &self,
        vm: &VmRef,
    ) -> Result<SnapshotInfo, VimError> {
        let mut state = self.state();
        state.begin(VimOp::SnapshotInfo, vm)?;
        let promote = match state.pending_snapshot.as_mut() {
            Some(pending) if &pending.vm == vm => {
                if pending.remaining_polls == 0 {
                    true
                } else {
                    pending.remaining_polls -= 1;
                    false
                }
            }
            _ => false,
        };
        if promote {
            if let Some(pending) = state.pending_snapshot.take() {
                state.vm_mut(VimOp::SnapshotInfo, vm)?.snapshots.current =
                    Some(pending.snapshot);
            }
        }
        Ok(state.vm(VimOp::SnapshotInfo, vm)?.snapshots.clone())
    }

    async fn add_virtual_switch(
        &self,
        host: &HostRef,
        name: &str,
        spec: &VirtualSwitchSpec,
    ) -> Result<(), VimError> {
        const OP: VimOp = VimOp::AddVirtualSwitch;
        let mut state = self.state();
        state.begin(OP, name)?;
        let fake = state.host_mut(OP, host)?;
        if fake.network.vswitch(name).is_some() {
            return Err(err(
                OP,
                name,
                Fault::DuplicateName,
                format!("virtual switch {name} already exists"),
            ));
        }
        let available = fake.network.available_pnics();
        if let Some(pnic) =
            spec.uplinks.iter().find(|pnic| !available.contains(pnic))
        {
            return Err(err(
                OP,
                name,
                Fault::InvalidArgument,
                format!("physical NIC {pnic} is not available"),
            ));
        }
        fake.network
            .vswitches
            .push(VirtualSwitch { name: name.to_string(), spec: spec.clone() });
        Ok(())
    }

    async fn update_virtual_switch(
        &self,
        host: &HostRef,
        name: &str,
        spec: &VirtualSwitchSpec,
    ) -> Result<(), VimError> {
        const OP: VimOp = VimOp::UpdateVirtualSwitch;
        let mut state = self.state();
        state.begin(OP, name)?;
        let fake = state.host_mut(OP, host)?;
        let vswitch = fake
            .network
            .vswitches
            .iter_mut()
            .find(|vs| vs.name == name)
            .ok_or_else(|| VimError::not_found(OP, name))?;
        vswitch.spec = spec.clone();
        Ok(())
    }

    async fn remove_virtual_switch(
        &self,
        host: &HostRef,
        name: &str,
    ) -> Result<(), VimError> {
        const OP: VimOp = VimOp::RemoveVirtualSwitch;
        let mut state = self.state();
        state.begin(OP, name)?;
        let fake = state.host_mut(OP, host)?;
        if fake.network.vswitch(name).is_none() {
            return Err(VimError::not_found(OP, name));
        }
        if fake.network.port_groups.iter().any(|pg| pg.vswitch_name == name) {
            return Err(err(
                OP,
                name,
                Fault::ResourceInUse,
                format!("virtual switch {name} still has port groups"),
            ));
        }
        fake.network.vswitches.retain(|vs| vs.name != name);
        Ok(())
    }

    async fn add_port_group(
        &self,
        host: &HostRef,
        spec: &PortGroupSpec,
    ) -> Result<NetworkRef, VimError> {
        const OP: VimOp = VimOp::AddPortGroup;
        let mut state = self.state();
        state.begin(OP, &spec.name)?;
        let network = NetworkRef::new(state.id("network"));
        let fake = state.host_mut(OP, host)?;
        if fake.network.port_group(&spec.name).is_some() {
            return Err(err(
                OP,
                &spec.name,
                Fault::DuplicateName,
                format!("port group {} already exists", spec.name),
            ));
        }
        if fake.network.vswitch(&spec.vswitch_name).is_none() {
            return Err(VimError::not_found(OP, &spec.vswitch_name));
        }
        fake.network.port_groups.push(spec.clone());
        fake.info.networks.push(NetworkInfo {
            reference: network.clone(),
            name: spec.name.clone(),
            network_type: NetworkType::Standard,
        });
        Ok(network)
    }

    async fn update_port_group(
        &self,
        host: &HostRef,
        name: &str,
        spec: &PortGroupSpec,
    ) -> Result<(), VimError> {
        const OP: VimOp = VimOp::UpdatePortGroup;
        let mut state = self.state();
        state.begin(OP, name)?;
        let fake = state.host_mut(OP, host)?;
        let pg = fake
            .network
            .port_groups
            .iter_mut()
            .find(|pg| pg.name == name)
            .ok_or_else(|| VimError::not_found(OP, name))?;
        *pg = spec.clone();
        Ok(())
    }

    async fn remove_port_group(
        &self,
        host: &HostRef,
        name: &str,
    ) -> Result<(), VimError> {
        const OP: VimOp = VimOp::RemovePortGroup;
        let mut state = self.state();
        state.begin(OP, name)?;
        let network = {
            let fake = state.host_mut(OP, host)?;
            if fake.network.port_group(name).is_none() {
                return Err(VimError::not_found(OP, name));
            }
            fake.info
                .networks
                .iter()
                .find(|n| n.name == name)
                .map(|n| n.reference.clone())
        };
        if network.as_ref().is_some_and(|n| state.network_in_use(n)) {
            return Err(err(
                OP,
                name,
                Fault::ResourceInUse,
                format!("port group {name} is in use"),
            ));
        }
        let fake = state.host_mut(OP, host)?;
        fake.network.port_groups.retain(|pg| pg.name != name);
        fake.info.networks.retain(|n| n.name != name);
        Ok(())
    }

    async fn update_proxy_switch(
        &self,
        host: &HostRef,
        proxy: &ProxySwitch,
    ) -> Result<(), VimError> {
        const OP: VimOp = VimOp::UpdateProxySwitch;
        let mut state = self.state();
        state.begin(OP, host)?;
        if !state.switches.values().any(|s| s.info.uuid == proxy.dvs_uuid) {
            return Err(VimError::not_found(OP, &proxy.dvs_name));
        }
        let fake = state.host_mut(OP, host)?;
        match fake
            .network
            .proxy_switches
            .iter_mut()
            .find(|ps| ps.dvs_uuid == proxy.dvs_uuid)
        {
            Some(existing) => *existing = proxy.clone(),
            None => fake.network.proxy_switches.push(proxy.clone()),
        }
        Ok(())
    }

    async fn distributed_switches(
        &self,
        dc: &DatacenterRef,
    ) -> Result<Vec<DistributedSwitchInfo>, VimError> {
        let mut state = self.state();
        state.begin(VimOp::DistributedSwitches, dc)?;
        Ok(state
            .switches
            .values()
            .filter(|s| &s.dc == dc)
            .map(|s| s.info.clone())
            .collect())
    }

    async fn distributed_port_groups(
        &self,
        dc: &DatacenterRef,
    ) -> Result<Vec<DistributedPortGroupInfo>, VimError> {
        let mut state = self.state();
        state.begin(VimOp::DistributedPortGroups, dc)?;
        Ok(state
            .port_groups
            .values()
            .filter(|pg| &pg.dc == dc)
            .map(|pg| pg.info.clone())
            .collect())
    }

    async fn create_distributed_switch(
        &self,
        dc: &DatacenterRef,
        spec: &DistributedSwitchSpec,
    ) -> Result<DistributedSwitchInfo, VimError> {
        const OP: VimOp = VimOp::CreateDistributedSwitch;
        let mut state = self.state();
        state.begin(OP, &spec.name)?;
        if state
            .switches
            .values()
            .any(|s| &s.dc == dc && s.info.spec.name == spec.name)
        {
            return Err(err(
                OP,
                &spec.name,
                Fault::DuplicateName,
                format!("distributed switch {} already exists", spec.name),
            ));
        }
        let dvs = DvsRef::new(state.id("dvs"));
        let uuid = format!("50 1d {:02x} 7a", state.next_id);
        let uplink_pg = NetworkRef::new(state.id("dvportgroup"));
        let uplink_name = format!("{}-DVUplinks-{}", spec.name, state.next_id);
        let info = DistributedSwitchInfo {
            reference: dvs.clone(),
            uuid: uuid.clone(),
            spec: spec.clone(),
            uplink_port_group: Some(uplink_pg.clone()),
        };
        state
            .switches
            .insert(
                dvs.clone(),
                FakeDvs { dc: dc.clone(), info: info.clone() },
            );
        state.port_groups.insert(
            uplink_pg.clone(),
            FakeDpg {
                dc: dc.clone(),
                info: DistributedPortGroupInfo {
                    key: uplink_pg.to_string(),
                    reference: uplink_pg,
                    switch: dvs,
                    switch_name: spec.name.clone(),
                    switch_uuid: uuid,
                    uplink: true,
                    spec: DistributedPortGroupSpec {
                        name: uplink_name,
                        num_ports: spec.uplink_port_names.len() as u32,
                        vlan_id: 0,
                        binding: PortBinding::EarlyBinding,
                        auto_expand: false,
                    },
                },
                hidden_polls: 0,
            },
        );
        Ok(info)
    }

    async fn reconfigure_distributed_switch(
        &self,
        dvs: &DvsRef,
        spec: &DistributedSwitchSpec,
    ) -> Result<(), VimError> {
        const OP: VimOp = VimOp::ReconfigureDistributedSwitch;
        let mut state = self.state();
        state.begin(OP, dvs)?;
        let fake = state
            .switches
            .get_mut(dvs)
            .ok_or_else(|| VimError::not_found(OP, dvs))?;
        fake.info.spec = spec.clone();
        let name = spec.name.clone();
        for pg in state.port_groups.values_mut() {
            if &pg.info.switch == dvs {
                pg.info.switch_name = name.clone();
            }
        }
        Ok(())
    }

    async fn destroy_distributed_switch(
        &self,
        dvs: &DvsRef,
    ) -> Result<(), VimError> {
        const OP: VimOp = VimOp::DestroyDistributedSwitch;
        let mut state = self.state();
        state.begin(OP, dvs)?;
        let uuid = state
            .switches
            .get(dvs)
            .map(|s| s.info.uuid.clone())
            .ok_or_else(|| VimError::not_found(OP, dvs))?;
        let in_use = state
            .port_groups
            .values()
            .filter(|pg| &pg.info.switch == dvs)
            .any(|pg| state.network_in_use(&pg.info.reference));
        if in_use {
            return Err(err(
                OP,
                dvs,
                Fault::ResourceInUse,
                "a port group of the switch is in use",
            ));
        }
        state.switches.remove(dvs);
        state.port_groups.retain(|_, pg| &pg.info.switch != dvs);
        for host in state.hosts.values_mut() {
            host.network.proxy_switches.retain(|ps| ps.dvs_uuid != uuid);
        }
        Ok(())
    }

    async fn switch_port_groups(
        &self,
        dvs: &DvsRef,
    ) -> Result<Vec<DistributedPortGroupInfo>, VimError> {
        const OP: VimOp = VimOp::SwitchPortGroups;
        let mut state = self.state();
        state.begin(OP, dvs)?;
        if !state.switches.contains_key(dvs) {
            return Err(VimError::not_found(OP, dvs));
        }
        let mut listed = Vec::new();
        for pg in state.port_groups.values_mut() {
            if &pg.info.switch != dvs {
                continue;
            }
            if pg.hidden_polls > 0 {
                pg.hidden_polls -= 1;
            } else {
                listed.push(pg.info.clone());
            }
        }
        Ok(listed)
    }

    async fn add_distributed_port_group(
        &self,
        dvs: &DvsRef,
        spec: &DistributedPortGroupSpec,
    ) -> Result<(), VimError> {
        const OP: VimOp = VimOp::AddDistributedPortGroup;
        let mut state = self.state();
        state.begin(OP, &spec.name)?;
        let (dc, switch_name, switch_uuid) = state
            .switches
            .get(dvs)
            .map(|s| {
                (s.dc.clone(), s.info.spec.name.clone(), s.info.uuid.clone())
            })
            .ok_or_else(|| VimError::not_found(OP, dvs))?;
        if state
            .port_groups
            .values()
            .any(|pg| pg.dc == dc && pg.info.spec.name == spec.name)
        {
            return Err(err(
                OP,
                &spec.name,
                Fault::DuplicateName,
                format!("port group {} already exists", spec.name),
            ));
        }
        let pg = NetworkRef::new(state.id("dvportgroup"));
        let hidden_polls = state.dpg_visibility_delay;
        state.port_groups.insert(
            pg.clone(),
            FakeDpg {
                dc,
                info: DistributedPortGroupInfo {
                    key: pg.to_string(),
                    reference: pg,
                    switch: dvs.clone(),
                    switch_name,
                    switch_uuid,
                    uplink: false,
                    spec: spec.clone(),
                },
                hidden_polls,
            },
        );
        Ok(())
    }

    async fn rename_distributed_port_group(
        &self,
        pg: &NetworkRef,
        name: &str,
    ) -> Result<(), VimError> {
        const OP: VimOp = VimOp::RenameDistributedPortGroup;
        let mut state = self.state();
        state.begin(OP, pg)?;
        let fake = state
            .port_groups
            .get_mut(pg)
            .ok_or_else(|| VimError::not_found(OP, pg))?;
        fake.info.spec.name = name.to_string();
        Ok(())
    }

    async fn reconfigure_distributed_port_group(
        &self,
        pg: &NetworkRef,
        spec: &DistributedPortGroupSpec,
    ) -> Result<(), VimError> {
        const OP: VimOp = VimOp::ReconfigureDistributedPortGroup;
        let mut state = self.state();
        state.begin(OP, pg)?;
        let fake = state
            .port_groups
            .get_mut(pg)
            .ok_or_else(|| VimError::not_found(OP, pg))?;
        fake.info.spec = spec.clone();
        Ok(())
    }

    async fn destroy_distributed_port_group(
        &self,
        pg: &NetworkRef,
    ) -> Result<(), VimError> {
        const OP: VimOp = VimOp::DestroyDistributedPortGroup;
        let mut state = self.state();
        state.begin(OP, pg)?;
        if !state.port_groups.contains_key(pg) {
            return Err(VimError::not_found(OP, pg));
        }
        if state.network_in_use(pg) {
            return Err(err(
                OP,
                pg,
                Fault::ResourceInUse,
                format!("port group {pg} is in use"),
            ));
        }
        state.port_groups.remove(pg);
        Ok(())
    }

    async fn recommend_datastores(
        &self,
        spec: &StoragePlacementSpec,
    ) -> Result<StoragePlacementResult, VimError> {
        const OP: VimOp = VimOp::RecommendDatastores;
        let mut state = self.state();
        let pod = match spec {
            StoragePlacementSpec::Clone { pod, .. }
            | StoragePlacementSpec::Reconfigure { pod, .. } => pod.clone(),
        };
        state.begin(OP, &pod)?;
        let datastores = state
            .pods
            .get(&pod)
            .cloned()
            .ok_or_else(|| VimError::not_found(OP, &pod))?;
        let Some(target) = datastores.first().cloned() else {
            return Ok(StoragePlacementResult::default());
        };
        let key = if state.blank_recommendation_keys {
            String::new()
        } else {
            state.id("recommend")
        };
        state
            .recommendations
            .insert(key.clone(), (spec.clone(), target.clone()));
        Ok(StoragePlacementResult {
            recommendations: vec![PlacementRecommendation {
                key,
                target: Some(target),
            }],
        })
    }

    async fn apply_storage_recommendation(
        &self,
        key: &str,
    ) -> Result<ApplyRecommendationResult, VimError> {
        const OP: VimOp = VimOp::ApplyRecommendation;
        let mut state = self.state();
        state.begin(OP, key)?;
        let (spec, target) = state
            .recommendations
            .remove(key)
            .ok_or_else(|| VimError::not_found(OP, key))?;
        match spec {
            StoragePlacementSpec::Clone {
                template,
                clone_name,
                folder,
                mut clone_spec,
                ..
            } => {
                clone_spec.location.datastore = Some(target);
                let vm = state.clone_from(
                    OP,
                    &template,
                    &folder,
                    &clone_name,
                    &clone_spec,
                )?;
                Ok(ApplyRecommendationResult { vm: Some(vm) })
            }
            StoragePlacementSpec::Reconfigure { vm, config_spec, .. } => {
                state.apply_config(OP, &vm, &config_spec, Some(&target))?;
                Ok(ApplyRecommendationResult { vm: None })
            }
        }
    }

    async fn perf_refresh_rate(&self, vm: &VmRef) -> Result<u32, VimError> {
        let mut state = self.state();
        state.begin(VimOp::PerfRefreshRate, vm)?;
        Ok(state.vm(VimOp::PerfRefreshRate, vm)?.refresh_rate)
    }

    async fn query_perf(
        &self,
        vm: &VmRef,
        counters: &[PerfCounter],
        max_samples: u32,
    ) -> Result<PerfSamples, VimError> {
        let mut state = self.state();
        state.begin(VimOp::QueryPerf, vm)?;
        let fake = state.vm(VimOp::QueryPerf, vm)?;
        let max = max_samples as usize;
        Ok(counters
            .iter()
            .filter_map(|counter| {
                fake.perf.get(counter).map(|samples| {
                    let skip = samples.len().saturating_sub(max);
                    (*counter, samples[skip..].to_vec())
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DeviceChange;
    use crate::fakes::devices;

    fn setup() -> (Arc<FakeVcenter>, HostRef, ResourcePoolRef, DatastoreRef)
    {
        let fake = FakeVcenter::new();
        let dc = fake.add_datacenter("dc0");
        let cluster = fake.add_cluster(&dc, "cluster0");
        let host = fake.add_host(&cluster, "esx0", &["vmnic0", "vmnic1"]);
        let pool = fake.root_pool(&cluster).unwrap();
        let ds = fake.add_datastore("ds0");
        (fake, host, pool, ds)
    }

    #[tokio::test]
    async fn test_reconfigure_rejects_occupied_unit() {
        let (fake, host, pool, ds) = setup();
        let vm = fake.add_vm(
            &host,
            &pool,
            "vm0",
            vec![
                devices::scsi_controller(1000, 0),
                devices::disk(2000, 1000, 0, "[ds0] vm0/vm0.vmdk", &ds, 1024),
            ],
        );
        fake.add_file("[ds0] extra.vmdk");
        let spec = VmConfigSpec {
            device_change: vec![DeviceChange::add(devices::disk(
                -1,
                1000,
                0,
                "[ds0] extra.vmdk",
                &ds,
                1024,
            ))],
            ..Default::default()
        };
        let err = fake.reconfigure_vm(&vm, &spec).await.unwrap_err();
        assert_eq!(err.fault, Fault::InvalidArgument);
        assert_eq!(fake.vm_info(&vm).unwrap().devices.len(), 2);
    }

    #[tokio::test]
    async fn test_destroy_vm_removes_attached_disk_files() {
        let (fake, host, pool, ds) = setup();
        let vm = fake.add_vm(
            &host,
            &pool,
            "vm0",
            vec![
                devices::scsi_controller(1000, 0),
                devices::disk(2000, 1000, 0, "[ds0] vm0/vm0.vmdk", &ds, 1024),
                devices::disk(2001, 1000, 1, "[ds0] keep.vmdk", &ds, 1024),
            ],
        );
        let detach = VmConfigSpec {
            device_change: vec![DeviceChange::remove(
                fake.vm_info(&vm).unwrap().devices[2].clone(),
            )],
            ..Default::default()
        };
        fake.reconfigure_vm(&vm, &detach).await.unwrap();
        fake.destroy_vm(&vm).await.unwrap();
        assert!(!fake.file_exists("[ds0] vm0/vm0.vmdk"));
        assert!(fake.file_exists("[ds0] keep.vmdk"));
    }

    #[tokio::test]
    async fn test_port_group_listing_delay() {
        let (fake, _host, _pool, _ds) = setup();
        let dc = fake.add_datacenter("dc1");
        let dvs = fake
            .create_distributed_switch(
                &dc,
                &DistributedSwitchSpec {
                    name: "dswitch".to_string(),
                    uplink_port_names: vec![],
                    max_mtu: 1500,
                },
            )
            .await
            .unwrap()
            .reference;
        fake.set_port_group_visibility_delay(2);
        let spec = DistributedPortGroupSpec {
            name: "pg0".to_string(),
            num_ports: 8,
            vlan_id: 0,
            binding: PortBinding::EarlyBinding,
            auto_expand: true,
        };
        fake.add_distributed_port_group(&dvs, &spec).await.unwrap();
        let named = |pgs: Vec<DistributedPortGroupInfo>| {
            pgs.into_iter().any(|pg| pg.spec.name == "pg0")
        };
        assert!(!named(fake.switch_port_groups(&dvs).await.unwrap()));
        assert!(!named(fake.switch_port_groups(&dvs).await.unwrap()));
        assert!(named(fake.switch_port_groups(&dvs).await.unwrap()));
    }

    #[tokio::test]
    async fn test_injected_fault_is_consumed() {
        let (fake, host, _pool, _ds) = setup();
        fake.fail_next(VimOp::HostNetworkConfig, Fault::Other);
        assert!(fake.host_network_config(&host).await.is_err());
        assert!(fake.host_network_config(&host).await.is_ok());
        assert_eq!(fake.call_count(VimOp::HostNetworkConfig), 2);
    }
}
