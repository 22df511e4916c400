// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory control-plane collaborators for tests.

use crate::desired::PortGroupType;
use crate::desired::VcenterNetwork;
use crate::facilities::ImageRegistry;
use crate::facilities::ManagedNetwork;
use crate::facilities::NetworkCatalog;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use vcenter_api::NetworkRef;

#[derive(Default)]
pub struct FakeImageRegistry {
    persistent: Mutex<BTreeSet<String>>,
}

impl FakeImageRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_persistent_image(&self, path: &str) {
        self.persistent.lock().unwrap().insert(path.to_string());
    }
}

#[async_trait]
impl ImageRegistry for FakeImageRegistry {
    async fn is_persistent_image(&self, path: &str) -> anyhow::Result<bool> {
        Ok(self.persistent.lock().unwrap().contains(path))
    }
}

struct CatalogEntry {
    port_group_name: String,
    port_group_type: PortGroupType,
    switch_name: String,
    reference: Option<(NetworkRef, String)>,
}

#[derive(Default)]
pub struct FakeNetworkCatalog {
    networks: Mutex<BTreeMap<u64, CatalogEntry>>,
    fail_record: Mutex<bool>,
}

impl FakeNetworkCatalog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers the managed network a NIC on `port_group_name` refers to.
    pub fn add_network(&self, port_group_name: &str, network: &VcenterNetwork) {
        self.networks.lock().unwrap().insert(
            network.network_id,
            CatalogEntry {
                port_group_name: port_group_name.to_string(),
                port_group_type: network.port_group_type,
                switch_name: network.switch_name.clone(),
                reference: None,
            },
        );
    }

    /// The port group recorded for `network_id`.
    pub fn reference(&self, network_id: u64) -> Option<NetworkRef> {
        self.networks
            .lock()
            .unwrap()
            .get(&network_id)
            .and_then(|entry| entry.reference.as_ref())
            .map(|(network, _)| network.clone())
    }

    /// Makes every later `record_network_ref` fail.
    pub fn fail_records(&self) {
        *self.fail_record.lock().unwrap() = true;
    }
}

#[async_trait]
impl NetworkCatalog for FakeNetworkCatalog {
    async fn managed_network(
        &self,
        network: &NetworkRef,
        instance_uuid: &str,
    ) -> anyhow::Result<Option<ManagedNetwork>> {
        let networks = self.networks.lock().unwrap();
        Ok(networks.iter().find_map(|(id, entry)| {
            let (reference, uuid) = entry.reference.as_ref()?;
            (reference == network && uuid == instance_uuid).then(|| {
                ManagedNetwork {
                    network_id: *id,
                    port_group_name: entry.port_group_name.clone(),
                    port_group_type: entry.port_group_type,
                    switch_name: entry.switch_name.clone(),
                }
            })
        }))
    }

    async fn record_network_ref(
        &self,
        network_id: u64,
        network: &NetworkRef,
        instance_uuid: &str,
    ) -> anyhow::Result<()> {
        if *self.fail_record.lock().unwrap() {
            anyhow::bail!("network {network_id} could not be updated");
        }
        let mut networks = self.networks.lock().unwrap();
        let entry = networks.get_mut(&network_id).ok_or_else(|| {
            anyhow::anyhow!("network {network_id} does not exist")
        })?;
        entry.reference = Some((network.clone(), instance_uuid.to_string()));
        Ok(())
    }

    async fn clear_network_ref(&self, network_id: u64) -> anyhow::Result<()> {
        if let Some(entry) = self.networks.lock().unwrap().get_mut(&network_id)
        {
            entry.reference = None;
        }
        Ok(())
    }
}
