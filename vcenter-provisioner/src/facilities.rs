// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Control-plane records the engine consults or updates.
//!
//! The engine does not own these records. It only needs to ask whether a
//! disk file belongs to a persistent image, and to keep each virtual
//! network's record pointing at the port group created for it.

use crate::desired::PortGroupType;
use async_trait::async_trait;
use vcenter_api::NetworkRef;

/// Read access to the control plane's image catalog.
#[async_trait]
pub trait ImageRegistry: Send + Sync {
    /// Whether the datastore-relative `path` is the file of a persistent
    /// image. Such files must survive being detached from a VM.
    async fn is_persistent_image(&self, path: &str) -> anyhow::Result<bool>;
}

/// A virtual network whose switch infrastructure the engine created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedNetwork {
    pub network_id: u64,
    pub port_group_name: String,
    pub port_group_type: PortGroupType,
    pub switch_name: String,
}

/// Access to the control plane's virtual network records.
#[async_trait]
pub trait NetworkCatalog: Send + Sync {
    /// The managed network backed by port group `network` on the endpoint
    /// instance `instance_uuid`, if any.
    async fn managed_network(
        &self,
        network: &NetworkRef,
        instance_uuid: &str,
    ) -> anyhow::Result<Option<ManagedNetwork>>;

    /// Points network `network_id` at the port group it is now backed by.
    async fn record_network_ref(
        &self,
        network_id: u64,
        network: &NetworkRef,
        instance_uuid: &str,
    ) -> anyhow::Result<()>;

    /// Forgets the port group of network `network_id` once it is torn down.
    async fn clear_network_ref(&self, network_id: u64) -> anyhow::Result<()>;
}
