// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed managed-object references.
//!
//! Every entity on the management endpoint (virtual machines, datastores,
//! switches, ...) is addressed by an opaque reference string such as
//! `vm-1042` or `group-p7`. Those strings are all the same type on the wire,
//! which makes it easy to hand a datastore reference to something expecting a
//! VM. This module attaches a marker type to each reference so the compiler
//! catches such mix-ups.
//!
//! A reference is never a live handle: it is resolved through the
//! [`crate::VimApi`] each time it is used, so destroying and recreating the
//! object between calls cannot leave stale in-process state behind.

use derive_where::derive_where;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::marker::PhantomData;

/// Describes one kind of managed object.
pub trait RefKind: Send + Sync + 'static {
    /// A short tag naming the kind, used in debug output.
    fn tag() -> &'static str;
}

/// An opaque managed-object reference with type-level information about what
/// it refers to.
#[derive_where(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypedRef<K: RefKind> {
    value: String,
    #[serde(skip)]
    _phantom: PhantomData<K>,
}

impl<K: RefKind> TypedRef<K> {
    pub fn new(value: impl Into<String>) -> Self {
        Self { value: value.into(), _phantom: PhantomData }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }
}

impl<K: RefKind> fmt::Debug for TypedRef<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.value, K::tag())
    }
}

impl<K: RefKind> fmt::Display for TypedRef<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl<K: RefKind> From<&str> for TypedRef<K> {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

macro_rules! impl_ref_kind {
    ($($kind:ident => $alias:ident, $tag:literal),* $(,)?) => {
        $(
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub enum $kind {}

            impl RefKind for $kind {
                #[inline]
                fn tag() -> &'static str {
                    $tag
                }
            }

            pub type $alias = TypedRef<$kind>;
        )*
    };
}

impl_ref_kind! {
    VmKind => VmRef, "vm",
    DatacenterKind => DatacenterRef, "datacenter",
    ClusterKind => ClusterRef, "cluster",
    HostKind => HostRef, "host",
    DatastoreKind => DatastoreRef, "datastore",
    StoragePodKind => StoragePodRef, "storage_pod",
    ResourcePoolKind => ResourcePoolRef, "resource_pool",
    FolderKind => FolderRef, "folder",
    NetworkKind => NetworkRef, "network",
    DvsKind => DvsRef, "distributed_switch",
    SnapshotKind => SnapshotRef, "snapshot",
    TaskKind => TaskRef, "task",
}

/// Prefix the endpoint uses for storage pod (pooled datastore) references.
pub const STORAGE_POD_PREFIX: &str = "group-";

/// Where a disk should be placed: a single datastore, or a storage pod whose
/// concrete datastore is chosen by the placement service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum DatastoreTarget {
    Datastore(DatastoreRef),
    Pod(StoragePodRef),
}

impl DatastoreTarget {
    pub fn is_pod(&self) -> bool {
        matches!(self, DatastoreTarget::Pod(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            DatastoreTarget::Datastore(ds) => ds.as_str(),
            DatastoreTarget::Pod(pod) => pod.as_str(),
        }
    }
}

impl From<String> for DatastoreTarget {
    fn from(value: String) -> Self {
        if value.starts_with(STORAGE_POD_PREFIX) {
            DatastoreTarget::Pod(StoragePodRef::new(value))
        } else {
            DatastoreTarget::Datastore(DatastoreRef::new(value))
        }
    }
}

impl From<&str> for DatastoreTarget {
    fn from(value: &str) -> Self {
        DatastoreTarget::from(value.to_string())
    }
}

impl From<DatastoreTarget> for String {
    fn from(target: DatastoreTarget) -> Self {
        target.as_str().to_string()
    }
}

impl fmt::Display for DatastoreTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datastore_target_parsing() {
        assert_eq!(
            DatastoreTarget::from("group-p12"),
            DatastoreTarget::Pod(StoragePodRef::new("group-p12"))
        );
        assert_eq!(
            DatastoreTarget::from("datastore-15"),
            DatastoreTarget::Datastore(DatastoreRef::new("datastore-15"))
        );
        assert!(DatastoreTarget::from("group-p1").is_pod());
    }

    #[test]
    fn test_typed_ref_formatting() {
        let vm = VmRef::new("vm-42");
        assert_eq!(vm.to_string(), "vm-42");
        assert_eq!(format!("{vm:?}"), "vm-42 (vm)");
    }
}
