// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Advisory locks serializing network changes per host and per datacenter.
//!
//! Switch and port group mutations for a given host (standard switches) or
//! datacenter (distributed switches) must not interleave. Callers acquire a
//! [`NamedLockGuard`] for the target before touching the endpoint; the lock
//! is released when the guard is dropped, on every exit path.
//!
//! When both are needed, the datacenter lock is taken before the host lock.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::OwnedMutexGuard;

/// The object a lock protects.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockTarget {
    Host(String),
    Datacenter(String),
}

impl LockTarget {
    /// The lock name: the kind plus the object name lower-cased, with spaces
    /// replaced by underscores.
    pub fn lock_name(&self) -> String {
        let (kind, name) = match self {
            LockTarget::Host(name) => ("host", name),
            LockTarget::Datacenter(name) => ("datacenter", name),
        };
        format!("{kind}-{}", name.to_lowercase().replace(' ', "_"))
    }
}

impl fmt::Display for LockTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.lock_name())
    }
}

/// Held while a lock is owned.
#[derive(Debug)]
pub struct NamedLockGuard {
    name: String,
    _guard: OwnedMutexGuard<()>,
}

impl NamedLockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A registry of named locks shared by every provisioning operation of the
/// process.
#[derive(Debug, Clone, Default)]
pub struct NamedLocks {
    locks: Arc<Mutex<BTreeMap<String, Arc<AsyncMutex<()>>>>>,
}

impl NamedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until the lock for `target` is available and takes it.
    pub async fn acquire(&self, target: &LockTarget) -> NamedLockGuard {
        let name = target.lock_name();
        let lock = {
            let mut locks = self.locks.lock().unwrap();
            locks.entry(name.clone()).or_default().clone()
        };
        NamedLockGuard { name, _guard: lock.lock_owned().await }
    }

    /// Takes the lock for `target` only if nobody holds it.
    pub fn try_acquire(&self, target: &LockTarget) -> Option<NamedLockGuard> {
        let name = target.lock_name();
        let lock = {
            let mut locks = self.locks.lock().unwrap();
            locks.entry(name.clone()).or_default().clone()
        };
        lock.try_lock_owned()
            .ok()
            .map(|guard| NamedLockGuard { name, _guard: guard })
    }
}
