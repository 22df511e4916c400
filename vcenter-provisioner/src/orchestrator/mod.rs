// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Top-level VM workflows: clone, reconfigure, hotplug, power actions and
//! monitoring.
//!
//! A [`Provisioner`] holds no per-VM state. Each call reads what it needs
//! from the endpoint, decides, and writes the outcome back to the VM object,
//! so consecutive calls may come from different processes.

mod clone;
mod hotplug;
mod lifecycle;
mod monitor;
mod reconfigure;

pub use hotplug::DetachedDisk;
pub use monitor::PreviousPoll;
pub use monitor::VmMonitor;
pub use monitor::VmState;

use crate::config::ProvisionerConfig;
use crate::error::Error;
use crate::facilities::ImageRegistry;
use crate::facilities::NetworkCatalog;
use crate::lock::NamedLocks;
use crate::network::NetworkProvisioner;
use crate::reconciler::PathContext;
use crate::snapshot::SnapshotManager;
use slog::Logger;
use slog::info;
use slog::o;
use std::sync::Arc;
use vcenter_api::DeviceChange;
use vcenter_api::VimApi;
use vcenter_api::VmConfigSpec;
use vcenter_api::VmRef;
use vcenter_api::path_without_datastore;

pub struct Provisioner {
    log: Logger,
    vim: Arc<dyn VimApi>,
    images: Arc<dyn ImageRegistry>,
    catalog: Arc<dyn NetworkCatalog>,
    networks: NetworkProvisioner,
    snapshots: SnapshotManager,
    config: ProvisionerConfig,
}

impl Provisioner {
    pub fn new(
        log: &Logger,
        vim: Arc<dyn VimApi>,
        images: Arc<dyn ImageRegistry>,
        catalog: Arc<dyn NetworkCatalog>,
        locks: NamedLocks,
        config: ProvisionerConfig,
    ) -> Self {
        let networks = NetworkProvisioner::new(
            log,
            vim.clone(),
            catalog.clone(),
            locks,
            config.clone(),
        );
        let snapshots = SnapshotManager::new(log, vim.clone(), config.clone());
        Self {
            log: log.new(o!("component" => "Provisioner")),
            vim,
            images,
            catalog,
            networks,
            snapshots,
            config,
        }
    }

    pub fn networks(&self) -> &NetworkProvisioner {
        &self.networks
    }

    pub fn snapshots(&self) -> &SnapshotManager {
        &self.snapshots
    }

    fn vm_log(&self, vm: &VmRef) -> Logger {
        self.log.new(o!("vm" => vm.to_string()))
    }

    fn paths<'a>(&'a self, vm_id: u64, vm_name: &'a str) -> PathContext<'a> {
        PathContext {
            vm_id,
            vm_name,
            volatile_dir: &self.config.volatile_dir,
        }
    }

    /// Detaches, without deleting their files, the disks of `vm` that are
    /// persistent images, so that destroying the VM leaves them alone.
    async fn detach_persistent_disks(
        &self,
        log: &Logger,
        vm: &VmRef,
    ) -> Result<(), Error> {
        let info = self.vim.vm(vm).await?;
        let mut spec = VmConfigSpec::default();
        for device in info.devices.iter().filter(|d| d.is_disk_or_iso()) {
            let Some(file_name) = device.backing_file() else {
                continue;
            };
            let persistent = self
                .images
                .is_persistent_image(path_without_datastore(file_name))
                .await
                .map_err(Error::ImageRegistry)?;
            if persistent {
                info!(log, "detaching persistent disk"; "file" => file_name);
                spec.device_change.push(DeviceChange::remove(device.clone()));
            }
        }
        if spec.is_empty() {
            return Ok(());
        }
        self.vim.reconfigure_vm(vm, &spec).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desired::Bandwidth;
    use crate::desired::DesiredVm;
    use crate::desired::DiskDescriptor;
    use crate::desired::DiskType;
    use crate::desired::NicDescriptor;
    use crate::desired::Placement;
    use crate::fakes::FakeImageRegistry;
    use crate::fakes::FakeNetworkCatalog;
    use macaddr::MacAddr6;
    use vcenter_api::ClusterRef;
    use vcenter_api::DatacenterRef;
    use vcenter_api::DatastoreRef;
    use vcenter_api::DatastoreTarget;
    use vcenter_api::HostRef;
    use vcenter_api::NetworkRef;
    use vcenter_api::PortGroupSpec;
    use vcenter_api::VirtualSwitchSpec;
    use vcenter_api::fakes::FakeVcenter;
    use vcenter_api::fakes::devices;

    pub(super) const TEMPLATE_DISK: &str = "[ds0] templates/base.vmdk";

    pub(super) struct Setup {
        pub fake: Arc<FakeVcenter>,
        pub images: Arc<FakeImageRegistry>,
        pub catalog: Arc<FakeNetworkCatalog>,
        pub dc: DatacenterRef,
        pub cluster: ClusterRef,
        pub host: HostRef,
        pub ds: DatastoreRef,
        pub vm_network: NetworkRef,
        pub template: VmRef,
        pub provisioner: Provisioner,
    }

    /// One host with a "VM Network" port group, and a template with one
    /// disk and one NIC.
    pub(super) async fn setup(log: &Logger) -> Setup {
        let fake = FakeVcenter::new();
        let dc = fake.add_datacenter("dc0");
        let cluster = fake.add_cluster(&dc, "cluster0");
        let host =
            fake.add_host(&cluster, "esx0", &["vmnic0", "vmnic1", "vmnic2"]);
        let ds = fake.add_datastore("ds0");
        let vswitch = VirtualSwitchSpec {
            num_ports: 128,
            mtu: 1500,
            uplinks: vec!["vmnic0".to_string()],
        };
        fake.add_virtual_switch(&host, "vSwitch0", &vswitch).await.unwrap();
        let vm_network = fake
            .add_port_group(
                &host,
                &PortGroupSpec {
                    name: "VM Network".to_string(),
                    vswitch_name: "vSwitch0".to_string(),
                    vlan_id: 0,
                },
            )
            .await
            .unwrap();
        let pool = fake.root_pool(&cluster).unwrap();
        let template = fake.add_template(
            &host,
            &pool,
            "base",
            vec![
                devices::ide_controller(200, 0),
                devices::scsi_controller(1000, 0),
                devices::disk(2000, 1000, 0, TEMPLATE_DISK, &ds, 10 << 20),
                devices::nic(
                    7000,
                    MacAddr6::new(0, 0x50, 0x56, 0xff, 0, 1),
                    &vm_network,
                ),
            ],
        );

        let images = FakeImageRegistry::new();
        let catalog = FakeNetworkCatalog::new();
        let provisioner = Provisioner::new(
            log,
            fake.clone(),
            images.clone(),
            catalog.clone(),
            NamedLocks::new(),
            ProvisionerConfig::default(),
        );
        Setup {
            fake,
            images,
            catalog,
            dc,
            cluster,
            host,
            ds,
            vm_network,
            template,
            provisioner,
        }
    }

    pub(super) fn disk(
        setup: &Setup,
        disk_id: u32,
        source: Option<&str>,
    ) -> DiskDescriptor {
        DiskDescriptor {
            disk_id,
            disk_type: DiskType::Disk,
            source: source.map(str::to_string),
            datastore: DatastoreTarget::Datastore(setup.ds.clone()),
            size_mb: Some(1024),
            original_size_mb: None,
            persistent: false,
            managed: true,
        }
    }

    pub(super) fn nic(
        nic_id: u32,
        mac: MacAddr6,
        bridge: &str,
    ) -> NicDescriptor {
        NicDescriptor {
            nic_id,
            mac,
            bridge: bridge.to_string(),
            network_ref: None,
            model: None,
            bandwidth: Bandwidth::default(),
            managed: true,
            vcenter_network: None,
        }
    }

    /// VM 7 built from the template: its disk and NIC are unmanaged.
    pub(super) fn desired(setup: &Setup) -> DesiredVm {
        let mut template_disk =
            disk(setup, 0, Some("templates/base.vmdk"));
        template_disk.managed = false;
        template_disk.size_mb = Some(10 * 1024);
        let mut template_nic =
            nic(0, MacAddr6::new(2, 0, 0xa, 0, 0, 7), "VM Network");
        template_nic.managed = false;
        DesiredVm {
            id: 7,
            name: "myvm".to_string(),
            cpus: Some(2),
            memory_mb: 2048,
            disks: vec![template_disk],
            nics: vec![template_nic],
            context: vec![("HOSTNAME".to_string(), "myvm".to_string())],
            onegate_token: None,
            graphics: None,
            placement: Placement {
                template: setup.template.clone(),
                cluster: setup.cluster.clone(),
                host: Some(setup.host.clone()),
                datastore: Some(DatastoreTarget::Datastore(setup.ds.clone())),
                resource_pool: None,
                folder: None,
                customization_spec: None,
                linked_clone: false,
            },
        }
    }
}
