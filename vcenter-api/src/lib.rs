// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interface to a virtualization management endpoint.
//!
//! The provisioning engine never talks to the endpoint directly: everything
//! goes through [`VimApi`], and every object is named by a typed reference
//! (see [`refs`]). The `testing` feature adds an in-memory implementation of
//! the API under [`fakes`].

mod api;
mod device;
mod inventory;
mod network;
mod perf;
pub mod refs;
mod snapshot;
mod spec;

#[cfg(any(test, feature = "testing"))]
pub mod fakes;

pub use api::*;
pub use device::*;
pub use inventory::*;
pub use network::*;
pub use perf::*;
pub use refs::*;
pub use snapshot::*;
pub use spec::*;

/// Classification of a failure reported by the endpoint.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter,
)]
pub enum Fault {
    /// An object with the requested name already exists.
    DuplicateName,
    /// The object no longer exists.
    NotFound,
    /// The object is in use and cannot be removed.
    ResourceInUse,
    /// The object is not in a state that permits the operation.
    InvalidState,
    InvalidArgument,
    Other,
}

/// An operation submitted to the endpoint failed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{op} on {object} failed ({fault}): {message}")]
pub struct VimError {
    pub op: VimOp,
    pub object: String,
    pub fault: Fault,
    /// The endpoint's own description of the failure.
    pub message: String,
}

impl VimError {
    pub fn new(
        op: VimOp,
        object: impl ToString,
        fault: Fault,
        message: impl Into<String>,
    ) -> Self {
        Self { op, object: object.to_string(), fault, message: message.into() }
    }

    pub fn not_found(op: VimOp, object: impl ToString) -> Self {
        let object = object.to_string();
        let message = format!("object {object} does not exist");
        Self::new(op, object, Fault::NotFound, message)
    }

    pub fn is_duplicate_name(&self) -> bool {
        self.fault == Fault::DuplicateName
    }

    pub fn is_not_found(&self) -> bool {
        self.fault == Fault::NotFound
    }

    /// Failures that mean a removal already achieved its intent, or cannot
    /// and need not: the object is gone, or something still uses it.
    pub fn is_benign_teardown(&self) -> bool {
        matches!(self.fault, Fault::NotFound | Fault::ResourceInUse)
    }
}
