// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;

/// Real-time performance counters sampled for a VM.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
)]
pub enum PerfCounter {
    /// KB/s transmitted.
    #[strum(to_string = "net.transmitted")]
    NetTransmitted,
    /// KB/s received.
    #[strum(to_string = "net.bytesRx")]
    NetBytesRx,
    /// KB/s read from virtual disks.
    #[strum(to_string = "virtualDisk.read")]
    DiskRead,
    /// KB/s written to virtual disks.
    #[strum(to_string = "virtualDisk.write")]
    DiskWrite,
    /// Average read operations per second.
    #[strum(to_string = "virtualDisk.numberReadAveraged")]
    DiskReadOps,
    /// Average write operations per second.
    #[strum(to_string = "virtualDisk.numberWriteAveraged")]
    DiskWriteOps,
}

/// Samples returned for each requested counter, oldest first. The endpoint
/// reports `-1` for intervals it has no data for.
pub type PerfSamples = BTreeMap<PerfCounter, Vec<i64>>;
