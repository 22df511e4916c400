// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Diffing desired disks and NICs against the devices a VM actually has.
//!
//! Planning is pure: [`plan_disks`] and [`plan_nics`] split both sides into
//! matched pairs and the unmatched remainders. Turning a plan into device
//! changes needs the endpoint (datastore names, free controller slots) and
//! the image registry (which files must survive a detach).

use crate::annotations::UnmanagedKeyMap;
use crate::annotations::clear_disk_key;
use crate::desired::DiskDescriptor;
use crate::desired::NicDescriptor;
use crate::error::Error;
use crate::facilities::ImageRegistry;
use crate::slots::ControllerFamily;
use crate::slots::Slot;
use crate::slots::allocate_slot;
use macaddr::MacAddr6;
use slog::Logger;
use slog::info;
use slog::warn;
use std::collections::BTreeMap;
use vcenter_api::CdromBacking;
use vcenter_api::DatastoreRef;
use vcenter_api::DatastoreTarget;
use vcenter_api::DeviceChange;
use vcenter_api::DeviceKind;
use vcenter_api::DiskBacking;
use vcenter_api::DiskMode;
use vcenter_api::FileOperation;
use vcenter_api::NetworkRef;
use vcenter_api::PowerState;
use vcenter_api::StoragePodRef;
use vcenter_api::VimApi;
use vcenter_api::VirtualDevice;
use vcenter_api::VmConfigSpec;
use vcenter_api::VmInfo;
use vcenter_api::VmRef;
use vcenter_api::datastore_path;
use vcenter_api::path_without_datastore;

/// A disk or ISO-backed CD-ROM found on the VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveDisk {
    pub device: VirtualDevice,
    /// Full backing file name, `[datastore] path`.
    pub file_name: String,
    /// Backing file name without the datastore.
    pub path: String,
    pub datastore: Option<DatastoreRef>,
    /// Capacity of a disk; CD-ROMs have none.
    pub capacity_kb: Option<u64>,
}

impl LiveDisk {
    pub fn scan(devices: &[VirtualDevice]) -> Vec<LiveDisk> {
        devices
            .iter()
            .filter(|d| d.is_disk_or_iso())
            .filter_map(|device| {
                let file_name = device.backing_file()?.to_string();
                let capacity_kb = match &device.kind {
                    DeviceKind::Disk { capacity_kb, .. } => Some(*capacity_kb),
                    _ => None,
                };
                Some(LiveDisk {
                    path: path_without_datastore(&file_name).to_string(),
                    datastore: device.backing_datastore().cloned(),
                    device: device.clone(),
                    file_name,
                    capacity_kb,
                })
            })
            .collect()
    }

    pub fn key(&self) -> i32 {
        self.device.key
    }
}

/// A network adapter found on the VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveNic {
    pub device: VirtualDevice,
    pub mac: Option<MacAddr6>,
    pub network: NetworkRef,
}

impl LiveNic {
    pub fn scan(devices: &[VirtualDevice]) -> Vec<LiveNic> {
        devices
            .iter()
            .filter_map(|device| {
                let nic = device.nic()?;
                Some(LiveNic {
                    device: device.clone(),
                    mac: nic.mac,
                    network: nic.backing.network_ref(),
                })
            })
            .collect()
    }
}

/// What the canonical image paths of a VM's disks are derived from.
#[derive(Debug, Clone, Copy)]
pub struct PathContext<'a> {
    pub vm_id: u64,
    /// Endpoint-side VM name.
    pub vm_name: &'a str,
    pub volatile_dir: &'a str,
}

impl PathContext<'_> {
    pub fn image_path(&self, disk: &DiskDescriptor) -> Result<String, Error> {
        disk.image_path(self.vm_id, self.vm_name, self.volatile_dir)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DiskPlan {
    pub matched: Vec<(DiskDescriptor, LiveDisk)>,
    pub attach: Vec<DiskDescriptor>,
    pub detach: Vec<LiveDisk>,
}

impl DiskPlan {
    /// Whether nothing has to be attached or detached.
    pub fn is_settled(&self) -> bool {
        self.attach.is_empty() && self.detach.is_empty()
    }
}

/// Pairs desired disks with live ones.
///
/// A desired disk claims the live disk its recorded device key points at.
/// Without a usable key, it claims the first live disk whose backing path
/// is the disk's canonical image path. Claimed live disks are out of the
/// running for later desired disks.
pub fn plan_disks(
    disks: &[DiskDescriptor],
    live: &[LiveDisk],
    keys: &UnmanagedKeyMap,
    paths: &PathContext<'_>,
) -> Result<DiskPlan, Error> {
    let mut remaining = live.to_vec();
    let mut plan = DiskPlan::default();
    for disk in disks {
        let by_key = keys
            .get(disk.disk_id)
            .and_then(|key| remaining.iter().position(|l| l.key() == key));
        let found = match by_key {
            Some(idx) => Some(idx),
            None => {
                let path = paths.image_path(disk)?;
                remaining.iter().position(|l| l.path == path)
            }
        };
        match found {
            Some(idx) => {
                plan.matched.push((disk.clone(), remaining.remove(idx)))
            }
            None => plan.attach.push(disk.clone()),
        }
    }
    plan.detach = remaining;
    Ok(plan)
}

#[derive(Debug, Clone, Default)]
pub struct NicPlan {
    pub matched: Vec<(NicDescriptor, LiveNic)>,
    pub attach: Vec<NicDescriptor>,
    pub detach: Vec<LiveNic>,
}

impl NicPlan {
    pub fn is_settled(&self) -> bool {
        self.attach.is_empty() && self.detach.is_empty()
    }
}

/// Pairs desired NICs with live ones by MAC address. Live NICs nobody asks
/// for anymore, including those whose MAC is unknown, are detached.
pub fn plan_nics(nics: &[NicDescriptor], live: &[LiveNic]) -> NicPlan {
    let mut pending = nics.to_vec();
    let mut plan = NicPlan::default();
    for nic in live {
        let found = nic
            .mac
            .and_then(|mac| pending.iter().position(|n| n.mac == mac));
        match found {
            Some(idx) => plan.matched.push((pending.remove(idx), nic.clone())),
            None => plan.detach.push(nic.clone()),
        }
    }
    plan.attach = pending;
    plan
}

/// Device removals for disks nobody asks for anymore.
///
/// Files of persistent images and ISO images stay on the datastore; every
/// other file is destroyed along with the device. Associations recorded for
/// the removed devices are cleared.
pub async fn detach_spec(
    images: &dyn ImageRegistry,
    log: &Logger,
    detach: &[LiveDisk],
    keys: &UnmanagedKeyMap,
) -> Result<VmConfigSpec, Error> {
    let mut spec = VmConfigSpec::default();
    for disk in detach {
        let keep_file = disk.device.is_cdrom()
            || images
                .is_persistent_image(&disk.path)
                .await
                .map_err(Error::ImageRegistry)?;
        let change = DeviceChange::remove(disk.device.clone());
        if keep_file {
            info!(log, "detaching disk"; "file" => &disk.file_name);
            spec.device_change.push(change);
        } else {
            info!(
                log,
                "detaching and destroying disk";
                "file" => &disk.file_name,
            );
            spec.device_change
                .push(change.with_file_operation(FileOperation::Destroy));
        }
        if let Some(disk_id) = keys.disk_for_key(disk.key()) {
            spec.extra_config.push(clear_disk_key(disk_id));
        }
    }
    Ok(spec)
}

/// In-place capacity edits for matched disks that were grown.
///
/// Shrinking is not supported by the endpoint; such requests are logged and
/// otherwise ignored.
pub fn resize_changes(
    log: &Logger,
    matched: &[(DiskDescriptor, LiveDisk)],
) -> Vec<DeviceChange> {
    matched
        .iter()
        .filter_map(|(disk, live)| {
            let (Some(size_mb), Some(original_mb)) =
                (disk.size_mb, disk.original_size_mb)
            else {
                return None;
            };
            let current_kb = live.capacity_kb?;
            if size_mb < original_mb {
                warn!(
                    log,
                    "ignoring request to shrink disk";
                    "disk_id" => disk.disk_id,
                    "size_mb" => size_mb,
                    "original_size_mb" => original_mb,
                );
                return None;
            }
            let wanted_kb = size_mb.saturating_mul(1024);
            if size_mb == original_mb || current_kb >= wanted_kb {
                return None;
            }
            let mut device = live.device.clone();
            if let DeviceKind::Disk { capacity_kb, .. } = &mut device.kind {
                *capacity_kb = wanted_kb;
            }
            info!(
                log,
                "growing disk";
                "disk_id" => disk.disk_id,
                "capacity_kb" => wanted_kb,
            );
            Some(DeviceChange::edit(device))
        })
        .collect()
}

/// Hands out the placeholder keys of devices created by one reconfiguration.
#[derive(Debug)]
pub struct PlaceholderKeys {
    next: i32,
}

impl Default for PlaceholderKeys {
    fn default() -> Self {
        Self { next: -1 }
    }
}

impl PlaceholderKeys {
    pub fn next_key(&mut self) -> i32 {
        let key = self.next;
        self.next -= 1;
        key
    }
}

/// A new disk whose file location is picked by the placement service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodDisk {
    pub disk_id: u32,
    pub slot: Slot,
    pub change: DeviceChange,
}

#[derive(Debug, Clone, Default)]
pub struct AttachPlan {
    /// Additions that go into the VM's own reconfiguration.
    pub device_change: Vec<DeviceChange>,
    /// Additions that have to go through storage placement, per pod.
    pub pod_disks: BTreeMap<StoragePodRef, Vec<PodDisk>>,
}

pub fn disk_device(
    key: i32,
    slot: Slot,
    size_mb: u64,
    backing: DiskBacking,
) -> VirtualDevice {
    VirtualDevice {
        key,
        label: String::new(),
        controller_key: Some(slot.controller_key),
        unit_number: Some(slot.unit_number),
        kind: DeviceKind::Disk {
            backing,
            capacity_kb: size_mb.saturating_mul(1024),
        },
    }
}

pub fn cdrom_device(
    key: i32,
    slot: Slot,
    file_name: String,
    datastore: DatastoreRef,
) -> VirtualDevice {
    VirtualDevice {
        key,
        label: String::new(),
        controller_key: Some(slot.controller_key),
        unit_number: Some(slot.unit_number),
        kind: DeviceKind::Cdrom {
            backing: CdromBacking::Iso {
                file_name,
                datastore: Some(datastore),
            },
        },
    }
}

/// Device additions for the disks in `disks`.
///
/// CD-ROMs go on IDE controllers and need the VM powered off. Disks go on
/// SCSI controllers, with a controller added first when all are full, which
/// refreshes `vm_info.devices`. Disks whose effective datastore is a storage
/// pod are returned separately.
pub async fn attach_spec(
    vim: &dyn VimApi,
    log: &Logger,
    vm: &VmRef,
    vm_info: &mut VmInfo,
    disks: &[DiskDescriptor],
    system: Option<&DatastoreTarget>,
    paths: &PathContext<'_>,
    keys: &mut PlaceholderKeys,
) -> Result<AttachPlan, Error> {
    let mut plan = AttachPlan::default();
    let mut positions = BTreeMap::<ControllerFamily, usize>::new();
    for disk in disks {
        let family = if disk.is_cdrom() {
            ControllerFamily::Ide
        } else {
            ControllerFamily::Scsi
        };
        let position = {
            let next = positions.entry(family).or_default();
            *next += 1;
            *next - 1
        };
        if disk.is_cdrom() && vm_info.power_state != PowerState::PoweredOff {
            return Err(Error::CdromRequiresPowerOff {
                vm: vm_info.name.clone(),
                disk_id: disk.disk_id,
            });
        }

        let path = paths.image_path(disk)?;
        let target = disk.effective_datastore(system);
        let slot = allocate_slot(
            vim,
            log,
            vm,
            &mut vm_info.devices,
            family,
            position,
        )
        .await?;
        let key = keys.next_key();
        let size_mb = disk.size_mb.unwrap_or(0);

        match target {
            DatastoreTarget::Pod(pod) if disk.is_cdrom() => {
                return Err(Error::UnexpectedStoragePod {
                    disk_id: disk.disk_id,
                    target: pod.to_string(),
                });
            }
            DatastoreTarget::Pod(pod) => {
                let backing = DiskBacking {
                    file_name: String::new(),
                    datastore: None,
                    disk_mode: DiskMode::Persistent,
                    parent: None,
                };
                let change =
                    DeviceChange::add(disk_device(key, slot, size_mb, backing))
                        .with_file_operation(FileOperation::Create);
                plan.pod_disks.entry(pod.clone()).or_default().push(PodDisk {
                    disk_id: disk.disk_id,
                    slot,
                    change,
                });
            }
            DatastoreTarget::Datastore(ds) => {
                let ds_name = vim.datastore(ds).await?.name;
                let file_name = datastore_path(&ds_name, &path);
                let device = if disk.is_cdrom() {
                    cdrom_device(key, slot, file_name, ds.clone())
                } else {
                    let backing = DiskBacking {
                        file_name,
                        datastore: Some(ds.clone()),
                        disk_mode: DiskMode::Persistent,
                        parent: None,
                    };
                    disk_device(key, slot, size_mb, backing)
                };
                plan.device_change.push(DeviceChange::add(device));
            }
        }
    }
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desired::Bandwidth;
    use crate::desired::DiskType;
    use crate::fakes::FakeImageRegistry;
    use crate::test_util::test_setup_log;
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use std::collections::BTreeSet;
    use test_strategy::Arbitrary;
    use test_strategy::proptest;
    use vcenter_api::DeviceOperation;
    use vcenter_api::fakes::FakeVcenter;
    use vcenter_api::fakes::devices;

    const PATHS: PathContext<'static> = PathContext {
        vm_id: 7,
        vm_name: "one-7-myvm",
        volatile_dir: "one-volatile",
    };

    fn desired_disk(disk_id: u32, source: Option<&str>) -> DiskDescriptor {
        DiskDescriptor {
            disk_id,
            disk_type: DiskType::Disk,
            source: source.map(str::to_string),
            datastore: DatastoreTarget::from("datastore-1"),
            size_mb: Some(1024),
            original_size_mb: None,
            persistent: false,
            managed: true,
        }
    }

    fn live_disk(key: i32, unit: i32, path: &str) -> LiveDisk {
        let ds = DatastoreRef::new("datastore-1");
        let device = devices::disk(
            key,
            1000,
            unit,
            &datastore_path("ds0", path),
            &ds,
            1024 * 1024,
        );
        LiveDisk::scan(&[device]).remove(0)
    }

    fn desired_nic(nic_id: u32, mac: MacAddr6) -> NicDescriptor {
        NicDescriptor {
            nic_id,
            mac,
            bridge: "VM Network".to_string(),
            network_ref: None,
            model: None,
            bandwidth: Bandwidth::default(),
            managed: true,
            vcenter_network: None,
        }
    }

    #[test]
    fn test_matching_disks_need_nothing() {
        let disks = vec![
            desired_disk(0, Some("images/ubuntu.vmdk")),
            desired_disk(1, None),
        ];
        let live = vec![
            live_disk(2000, 0, "images/ubuntu-7-0.vmdk"),
            live_disk(2001, 1, "one-volatile/one-7-myvm/one-7-1.vmdk"),
        ];
        let plan =
            plan_disks(&disks, &live, &UnmanagedKeyMap::default(), &PATHS)
                .unwrap();
        assert!(plan.is_settled());
        assert_eq!(plan.matched.len(), 2);
    }

    #[test]
    fn test_recorded_key_wins_over_path() {
        let mut unmanaged = desired_disk(0, Some("tmpl/disk.vmdk"));
        unmanaged.managed = false;
        let disks = vec![unmanaged, desired_disk(1, Some("img/a.vmdk"))];
        let live = vec![
            live_disk(2000, 0, "one-7-myvm/one-7-myvm.vmdk"),
            live_disk(2001, 1, "img/a-7-1.vmdk"),
            live_disk(2002, 2, "leftover.vmdk"),
        ];
        let mut keys = UnmanagedKeyMap::default();
        keys.insert(0, 2000);
        let plan = plan_disks(&disks, &live, &keys, &PATHS).unwrap();
        let matched = plan
            .matched
            .iter()
            .map(|(d, l)| (d.disk_id, l.key()))
            .collect::<Vec<_>>();
        assert_eq!(matched, vec![(0, 2000), (1, 2001)]);
        assert!(plan.attach.is_empty());
        assert_eq!(plan.detach.len(), 1);
        assert_eq!(plan.detach[0].key(), 2002);

        // A key pointing at a device that is gone falls back to the path.
        keys.insert(1, 9999);
        let plan = plan_disks(&disks[1..], &live, &keys, &PATHS).unwrap();
        assert_eq!(plan.matched[0].1.key(), 2001);
    }

    #[test]
    fn test_resize_grows_matching_disk() {
        let logctx = test_setup_log("test_resize_grows_matching_disk");
        let mut disk = desired_disk(0, Some("img/a.vmdk"));
        disk.size_mb = Some(20480);
        disk.original_size_mb = Some(10240);
        let ds = DatastoreRef::new("datastore-1");
        let path = "[ds0] img/a-7-0.vmdk";
        let device = devices::disk(2000, 1000, 0, path, &ds, 10240 * 1024);
        let live = LiveDisk::scan(&[device]);

        let plan = plan_disks(
            std::slice::from_ref(&disk),
            &live,
            &UnmanagedKeyMap::default(),
            &PATHS,
        )
        .unwrap();
        assert!(plan.is_settled());
        let changes = resize_changes(&logctx.log, &plan.matched);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].operation, DeviceOperation::Edit);
        assert_eq!(changes[0].file_operation, None);
        assert_matches!(
            changes[0].device.kind,
            DeviceKind::Disk { capacity_kb: 20971520, .. }
        );

        // Once grown, nothing more to do.
        let grown = LiveDisk::scan(&[changes[0].device.clone()]);
        let plan = plan_disks(
            std::slice::from_ref(&disk),
            &grown,
            &UnmanagedKeyMap::default(),
            &PATHS,
        )
        .unwrap();
        assert!(resize_changes(&logctx.log, &plan.matched).is_empty());
        logctx.cleanup_successful();
    }

    #[test]
    fn test_shrink_is_ignored() {
        let logctx = test_setup_log("test_shrink_is_ignored");
        let mut disk = desired_disk(0, Some("img/a.vmdk"));
        disk.size_mb = Some(5120);
        disk.original_size_mb = Some(10240);
        let live = live_disk(2000, 0, "img/a-7-0.vmdk");
        assert!(resize_changes(&logctx.log, &[(disk, live)]).is_empty());
        logctx.cleanup_successful();
    }

    #[test]
    fn test_nic_plan_by_mac() {
        let net = NetworkRef::new("network-1");
        let mac = |b| MacAddr6::new(2, 0, 0, 0, 0, b);
        let live = LiveNic::scan(&[
            devices::nic(4000, mac(1), &net),
            devices::nic(4001, mac(2), &net),
        ]);
        let nics = vec![desired_nic(0, mac(2)), desired_nic(1, mac(3))];
        let plan = plan_nics(&nics, &live);
        assert_eq!(plan.matched.len(), 1);
        assert_eq!(plan.matched[0].1.device.key, 4001);
        assert_eq!(plan.detach[0].device.key, 4000);
        assert_eq!(plan.attach[0].nic_id, 1);
        assert_eq!(plan_nics(&[], &[]).is_settled(), true);
    }

    #[tokio::test]
    async fn test_detach_keeps_persistent_files() {
        let logctx = test_setup_log("test_detach_keeps_persistent_files");
        let images = FakeImageRegistry::new();
        images.add_persistent_image("img/persistent.vmdk");
        let detach = vec![
            live_disk(2000, 0, "img/persistent.vmdk"),
            live_disk(2001, 1, "img/copy-7-1.vmdk"),
        ];
        let mut keys = UnmanagedKeyMap::default();
        keys.insert(4, 2001);

        let spec = detach_spec(&*images, &logctx.log, &detach, &keys)
            .await
            .unwrap();
        assert_eq!(spec.device_change.len(), 2);
        assert_eq!(spec.device_change[0].file_operation, None);
        assert_eq!(
            spec.device_change[1].file_operation,
            Some(FileOperation::Destroy)
        );
        assert_eq!(spec.extra_config, vec![clear_disk_key(4)]);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_attach_spec_places_devices() {
        let logctx = test_setup_log("test_attach_spec_places_devices");
        let fake = FakeVcenter::new();
        let dc = fake.add_datacenter("dc0");
        let cluster = fake.add_cluster(&dc, "cluster0");
        let host = fake.add_host(&cluster, "esx0", &[]);
        let pool = fake.root_pool(&cluster).unwrap();
        let ds = fake.add_datastore("ds0");
        let pod = fake.add_storage_pod(&[ds.clone()]);
        let vm = fake.add_vm(
            &host,
            &pool,
            "one-7-myvm",
            vec![
                devices::scsi_controller(1000, 0),
                devices::ide_controller(200, 0),
                devices::disk(2000, 1000, 0, "[ds0] a.vmdk", &ds, 1024),
            ],
        );

        let mut copy = desired_disk(1, Some("img/b.vmdk"));
        copy.datastore = DatastoreTarget::Datastore(ds.clone());
        let volatile = desired_disk(2, None);
        let mut cdrom = desired_disk(3, Some("iso/boot.iso"));
        cdrom.disk_type = DiskType::Cdrom;
        cdrom.datastore = DatastoreTarget::Datastore(ds.clone());
        let system = DatastoreTarget::Pod(pod.clone());

        let mut info = fake.vm_info(&vm).unwrap();
        let mut keys = PlaceholderKeys::default();
        let plan = attach_spec(
            &*fake,
            &logctx.log,
            &vm,
            &mut info,
            &[copy, volatile, cdrom.clone()],
            Some(&system),
            &PATHS,
            &mut keys,
        )
        .await
        .unwrap();

        // The non-persistent copy follows the VM to the pod.
        let pod_disks = &plan.pod_disks[&pod];
        assert_eq!(
            pod_disks.iter().map(|d| d.disk_id).collect::<Vec<_>>(),
            vec![1, 2]
        );
        let slots = pod_disks.iter().map(|d| d.slot).collect::<BTreeSet<_>>();
        assert_eq!(slots.len(), 2);
        assert!(pod_disks.iter().all(|d| {
            d.change.file_operation == Some(FileOperation::Create)
        }));

        assert_eq!(plan.device_change.len(), 1);
        let cdrom_device = &plan.device_change[0].device;
        assert_eq!(cdrom_device.controller_key, Some(200));
        assert_eq!(cdrom_device.backing_file(), Some("[ds0] iso/boot.iso"));
        assert_eq!(cdrom_device.key, -3);

        fake.set_power_state(&vm, PowerState::PoweredOn);
        info.power_state = PowerState::PoweredOn;
        let err = attach_spec(
            &*fake,
            &logctx.log,
            &vm,
            &mut info,
            &[cdrom],
            Some(&system),
            &PATHS,
            &mut keys,
        )
        .await
        .unwrap_err();
        assert_matches!(err, Error::CdromRequiresPowerOff { disk_id: 3, .. });
        logctx.cleanup_successful();
    }

    #[derive(Debug, Clone, Arbitrary)]
    struct DiskCase {
        #[strategy(0usize..4)]
        source: usize,
        persistent: bool,
        #[strategy(proptest::option::of(0i32..6))]
        recorded_key: Option<i32>,
    }

    #[derive(Debug, Clone, Arbitrary)]
    struct LiveCase {
        #[strategy(0usize..8)]
        path: usize,
    }

    const SOURCES: [Option<&str>; 4] =
        [None, Some("img/a.vmdk"), Some("img/b.vmdk"), Some("img/a.vmdk")];
    const LIVE_PATHS: [&str; 8] = [
        "img/a.vmdk",
        "img/a-7-1.vmdk",
        "img/b-7-2.vmdk",
        "img/b.vmdk",
        "one-volatile/one-7-myvm/one-7-0.vmdk",
        "one-volatile/one-7-myvm/one-7-3.vmdk",
        "img/a-7-3.vmdk",
        "other.vmdk",
    ];

    fn build(
        disks: &[DiskCase],
        live: &[LiveCase],
    ) -> (Vec<DiskDescriptor>, Vec<LiveDisk>, UnmanagedKeyMap) {
        let mut keys = UnmanagedKeyMap::default();
        let desired = disks
            .iter()
            .enumerate()
            .map(|(id, case)| {
                let id = id as u32;
                if let Some(key) = case.recorded_key {
                    keys.insert(id, 2000 + key);
                }
                let mut disk = desired_disk(id, SOURCES[case.source]);
                disk.persistent = case.persistent && disk.source.is_some();
                disk
            })
            .collect();
        let live = live
            .iter()
            .enumerate()
            .map(|(i, case)| {
                live_disk(2000 + i as i32, i as i32, LIVE_PATHS[case.path])
            })
            .collect();
        (desired, live, keys)
    }

    #[proptest]
    fn proptest_plan_partitions_both_sides(
        #[strategy(proptest::collection::vec(any::<DiskCase>(), 0..6))]
        disks: Vec<DiskCase>,
        #[strategy(proptest::collection::vec(any::<LiveCase>(), 0..6))]
        live: Vec<LiveCase>,
    ) {
        let (desired, live, keys) = build(&disks, &live);
        let plan = plan_disks(&desired, &live, &keys, &PATHS).unwrap();

        prop_assert_eq!(plan.matched.len() + plan.attach.len(), desired.len());
        prop_assert_eq!(plan.matched.len() + plan.detach.len(), live.len());

        let desired_ids = plan
            .matched
            .iter()
            .map(|(d, _)| d.disk_id)
            .chain(plan.attach.iter().map(|d| d.disk_id))
            .collect::<BTreeSet<_>>();
        prop_assert_eq!(desired_ids.len(), desired.len());
        let live_keys = plan
            .matched
            .iter()
            .map(|(_, l)| l.key())
            .chain(plan.detach.iter().map(|l| l.key()))
            .collect::<BTreeSet<_>>();
        prop_assert_eq!(live_keys.len(), live.len());
    }

    #[proptest]
    fn proptest_reconciled_disks_are_settled(
        #[strategy(proptest::collection::vec(any::<DiskCase>(), 0..6))]
        disks: Vec<DiskCase>,
    ) {
        let (desired, _, _) = build(&disks, &[]);
        // The live side as it looks after every desired disk was attached.
        let live = desired
            .iter()
            .enumerate()
            .map(|(i, disk)| {
                let path = PATHS.image_path(disk).unwrap();
                live_disk(3000 + i as i32, i as i32, &path)
            })
            .collect::<Vec<_>>();
        let plan =
            plan_disks(&desired, &live, &UnmanagedKeyMap::default(), &PATHS)
                .unwrap();
        prop_assert!(plan.is_settled());
    }
}
