// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::SnapshotRef;
use serde::Deserialize;
use serde::Serialize;

/// One node of a VM's snapshot tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotTree {
    pub snapshot: SnapshotRef,
    pub name: String,
    pub description: String,
    pub children: Vec<SnapshotTree>,
}

/// The snapshot state of a VM.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub current: Option<SnapshotRef>,
    pub roots: Vec<SnapshotTree>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSpec {
    pub name: String,
    pub description: String,
    pub memory: bool,
    pub quiesce: bool,
}
