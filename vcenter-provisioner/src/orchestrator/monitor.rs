// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-VM usage reports.

use super::Provisioner;
use crate::error::Error;
use crate::metrics;
use crate::metrics::CumulativeCounters;
use crate::metrics::MONITORED_COUNTERS;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use slog::debug;
use std::time::Duration;
use vcenter_api::Fault;
use vcenter_api::PowerState;
use vcenter_api::VmInfo;
use vcenter_api::VmRef;

/// State of a VM as reported to the control plane.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum VmState {
    Active,
    Paused,
    Deleted,
    Unknown,
}

impl From<PowerState> for VmState {
    fn from(state: PowerState) -> Self {
        match state {
            PowerState::PoweredOn => VmState::Active,
            PowerState::Suspended => VmState::Paused,
            PowerState::PoweredOff => VmState::Deleted,
        }
    }
}

/// What the previous poll of a VM left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviousPoll {
    pub at: DateTime<Utc>,
    pub counters: CumulativeCounters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmMonitor {
    pub state: VmState,
    pub polled_at: DateTime<Utc>,
    pub used_cpu_percent: f64,
    pub used_memory_kb: u64,
    pub guest_ip_addresses: Vec<String>,
    pub counters: CumulativeCounters,
}

impl VmMonitor {
    fn idle(
        state: VmState,
        polled_at: DateTime<Utc>,
        previous: Option<&PreviousPoll>,
    ) -> Self {
        let counters = previous
            .map(|p| p.counters)
            .unwrap_or_else(|| CumulativeCounters::with_start_time(polled_at));
        VmMonitor {
            state,
            polled_at,
            used_cpu_percent: 0.0,
            used_memory_kb: 0,
            guest_ip_addresses: Vec::new(),
            counters,
        }
    }

    /// The record to hand to the next poll of the same VM.
    pub fn to_previous(&self) -> PreviousPoll {
        PreviousPoll { at: self.polled_at, counters: self.counters }
    }
}

impl Provisioner {
    /// Reports the state and usage of `vm`, accumulating its I/O counters
    /// onto those of the previous poll.
    pub async fn monitor(
        &self,
        vm: &VmRef,
        previous: Option<&PreviousPoll>,
    ) -> Result<VmMonitor, Error> {
        let log = self.vm_log(vm);
        let now = Utc::now();
        let info = match self.vim.vm(vm).await {
            Ok(info) => info,
            Err(err) if err.fault == Fault::NotFound => {
                debug!(log, "VM is gone");
                return Ok(VmMonitor::idle(VmState::Unknown, now, previous));
            }
            Err(err) => return Err(err.into()),
        };

        let state = VmState::from(info.power_state);
        if state != VmState::Active {
            return Ok(VmMonitor::idle(state, now, previous));
        }

        let used_cpu_percent = self.cpu_percent(&info).await?;
        let stats = &info.quick_stats;
        let used_memory_kb =
            u64::try_from(stats.host_memory_usage_mb).unwrap_or(0) * 1024;

        let refresh_secs = self.vim.perf_refresh_rate(vm).await?;
        let since = previous.and_then(|p| (now - p.at).to_std().ok());
        let samples = metrics::sample_count(
            since,
            refresh_secs,
            Duration::from_secs(self.config.monitor_retention_secs),
            self.config.monitor_default_samples,
        );
        let window =
            self.vim.query_perf(vm, &MONITORED_COUNTERS, samples).await?;
        let start = previous
            .map(|p| p.counters)
            .unwrap_or_else(|| CumulativeCounters::with_start_time(now));
        let counters = metrics::accumulate(&start, &window, refresh_secs);
        debug!(
            log,
            "polled VM";
            "samples" => samples,
            "cpu" => used_cpu_percent,
            "memory_kb" => used_memory_kb,
        );

        Ok(VmMonitor {
            state,
            polled_at: now,
            used_cpu_percent,
            used_memory_kb,
            guest_ip_addresses: stats.guest_ip_addresses.clone(),
            counters,
        })
    }

    async fn cpu_percent(&self, info: &VmInfo) -> Result<f64, Error> {
        let host = self.vim.host(&info.host).await?;
        if host.cpu_mhz == 0 {
            return Ok(0.0);
        }
        let usage = info.quick_stats.overall_cpu_usage_mhz.max(0) as f64;
        Ok(usage / host.cpu_mhz as f64 * 100.0)
    }
}
