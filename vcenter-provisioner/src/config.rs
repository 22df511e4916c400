// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for working with provisioner configuration

use dropshot::ConfigLogging;
use serde::Deserialize;
use slog::Logger;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use vcenter_api::NicModel;

/// Configuration for the provisioner
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Configuration for the provisioner debug log
    pub log: ConfigLogging,
    #[serde(default)]
    pub provisioner: ProvisionerConfig,
}

/// Tunables of the provisioning engine.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ProvisionerConfig {
    /// Template for the endpoint-side VM name; `$i` is replaced by the VM id
    /// and the VM name is appended.
    pub vm_prefix: String,
    /// How long a guest gets to shut down before it is powered off.
    pub shutdown_timeout_secs: u64,
    /// How long a new distributed port group may take to show up in its
    /// switch's listing.
    pub port_group_visibility_timeout_secs: u64,
    pub snapshot_poll_interval_secs: u64,
    pub snapshot_poll_timeout_secs: u64,
    /// Endpoint API versions whose snapshot tasks never report completion.
    pub snapshot_poll_api_versions: Vec<String>,
    pub default_nic_model: NicModel,
    /// Inbound peak bandwidth (KB/s) assumed for NICs that leave it unset.
    pub default_inbound_peak_bw: Option<u64>,
    pub standard_switch_ports: u32,
    pub distributed_port_group_ports: u32,
    pub default_mtu: u32,
    /// Datastore directory holding volatile disks.
    pub volatile_dir: String,
    /// How far back the performance provider keeps real-time samples.
    pub monitor_retention_secs: u64,
    /// Samples requested when nothing is known about the previous poll.
    pub monitor_default_samples: u32,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            vm_prefix: "one-$i-".to_string(),
            shutdown_timeout_secs: 600,
            port_group_visibility_timeout_secs: 240,
            snapshot_poll_interval_secs: 60,
            snapshot_poll_timeout_secs: 24 * 60 * 60,
            snapshot_poll_api_versions: vec!["5.5".to_string()],
            default_nic_model: NicModel::E1000,
            default_inbound_peak_bw: None,
            standard_switch_ports: 128,
            distributed_port_group_ports: 8,
            default_mtu: 1500,
            volatile_dir: "one-volatile".to_string(),
            monitor_retention_secs: 3600,
            monitor_default_samples: 9,
        }
    }
}

impl ProvisionerConfig {
    /// Endpoint-side name of the VM with the given id and name.
    pub fn vm_name(&self, vm_id: u64, name: &str) -> String {
        format!("{}{}", self.vm_prefix.replace("$i", &vm_id.to_string()), name)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn port_group_visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.port_group_visibility_timeout_secs)
    }

    pub fn snapshot_poll_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_poll_interval_secs)
    }

    pub fn snapshot_poll_timeout(&self) -> Duration {
        Duration::from_secs(self.snapshot_poll_timeout_secs)
    }

    /// Whether snapshot creation on this API version must be confirmed by
    /// polling the snapshot tree instead of waiting on the task.
    pub fn polls_for_snapshots(&self, api_version: &str) -> bool {
        self.snapshot_poll_api_versions.iter().any(|v| v == api_version)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config from {path}: {err}")]
    Io {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("Failed to parse config from {path}: {err}")]
    Parse {
        path: PathBuf,
        #[source]
        err: toml::de::Error,
    },
    #[error("Failed to build logger: {0}")]
    Logger(#[source] std::io::Error),
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(&path)
            .map_err(|err| ConfigError::Io { path: path.into(), err })?;
        let config = toml::from_str(&contents)
            .map_err(|err| ConfigError::Parse { path: path.into(), err })?;
        Ok(config)
    }

    pub fn build_logger(&self) -> Result<Logger, ConfigError> {
        self.log.to_logger("vcenter-provisioner").map_err(ConfigError::Logger)
    }
}
