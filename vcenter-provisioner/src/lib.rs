// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Library interface to the vCenter provisioning engine
//!
//! The engine turns a control plane's description of a VM into objects on a
//! vCenter endpoint and keeps the two in step: it clones VMs from templates,
//! reconciles their disks and NICs, provisions the switches and port groups
//! their networks need, drives power actions and snapshots, and reports
//! usage.

// We only use rustdoc for internal documentation, including private items, so
// it's expected that we'll have links to private items in the docs.
#![allow(rustdoc::private_intra_doc_links)]

pub mod annotations;
pub mod config;
pub mod desired;
mod error;
pub mod facilities;
pub mod lock;
pub mod metrics;
pub mod network;
mod nic;
mod orchestrator;
pub mod placement;
mod poll;
pub mod reconciler;
pub mod slots;
pub mod snapshot;

#[cfg(test)]
mod fakes;
#[cfg(test)]
mod test_util;

pub use error::ConfigurationConflict;
pub use error::Error;
pub use orchestrator::DetachedDisk;
pub use orchestrator::PreviousPoll;
pub use orchestrator::Provisioner;
pub use orchestrator::VmMonitor;
pub use orchestrator::VmState;
