// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Key/value annotations the engine keeps on the VM object.
//!
//! The endpoint only offers untyped string annotations, so everything here
//! is about turning typed values into [`OptionValue`]s and back. An empty
//! value deletes a key.

use crate::desired::DesiredVm;
use crate::desired::Graphics;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::collections::BTreeMap;
use vcenter_api::OptionValue;

/// Prefix of the keys recording which live device backs an unmanaged disk.
pub const DISK_KEY_PREFIX: &str = "opennebula.disk.";
/// `yes` while the control plane considers the VM running.
pub const RUNNING_KEY: &str = "opennebula.vm.running";
/// Base64-encoded contextualization variables read by the guest.
pub const CONTEXT_KEY: &str = "guestinfo.opennebula.context";

const CONTEXT_HEADER: &str = "# Context variables generated by OpenNebula\n";
const VNC_DEFAULT_LISTEN: &str = "0.0.0.0";

/// Unmanaged disk id to live device key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnmanagedKeyMap(BTreeMap<u32, i32>);

impl UnmanagedKeyMap {
    /// Reads the associations out of a VM's annotations. Keys or values that
    /// do not parse are ignored.
    pub fn from_extra_config(extra_config: &BTreeMap<String, String>) -> Self {
        Self(
            extra_config
                .iter()
                .filter_map(|(key, value)| {
                    let disk_id = key.strip_prefix(DISK_KEY_PREFIX)?;
                    Some((disk_id.parse().ok()?, value.parse().ok()?))
                })
                .collect(),
        )
    }

    pub fn get(&self, disk_id: u32) -> Option<i32> {
        self.0.get(&disk_id).copied()
    }

    /// The unmanaged disk a live device key is recorded for.
    pub fn disk_for_key(&self, device_key: i32) -> Option<u32> {
        self.0.iter().find(|(_, key)| **key == device_key).map(|(id, _)| *id)
    }

    pub fn insert(&mut self, disk_id: u32, device_key: i32) {
        self.0.insert(disk_id, device_key);
    }

    pub fn remove(&mut self, disk_id: u32) -> Option<i32> {
        self.0.remove(&disk_id)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, i32)> + '_ {
        self.0.iter().map(|(id, key)| (*id, *key))
    }
}

pub fn disk_key(disk_id: u32) -> String {
    format!("{DISK_KEY_PREFIX}{disk_id}")
}

/// Records that `device_key` backs unmanaged disk `disk_id`.
pub fn set_disk_key(disk_id: u32, device_key: i32) -> OptionValue {
    OptionValue::new(disk_key(disk_id), device_key.to_string())
}

pub fn clear_disk_key(disk_id: u32) -> OptionValue {
    OptionValue::removal(disk_key(disk_id))
}

pub fn running(running: bool) -> OptionValue {
    OptionValue::new(RUNNING_KEY, if running { "yes" } else { "no" })
}

/// The contextualization text handed to the guest.
pub fn context_text(vm: &DesiredVm) -> String {
    let mut text = CONTEXT_HEADER.to_string();
    for (name, value) in &vm.context {
        text.push_str(&format!("{name}='{}'\n", value.replace('\'', "\\'")));
    }
    if let Some(token) = &vm.onegate_token {
        text.push_str(&format!("ONEGATE_TOKEN='{token}'\n"));
    }
    text
}

pub fn context(vm: &DesiredVm) -> OptionValue {
    OptionValue::new(CONTEXT_KEY, STANDARD.encode(context_text(vm)))
}

/// Console settings; nothing when the VM has no graphics.
pub fn vnc(graphics: Option<&Graphics>) -> Vec<OptionValue> {
    let Some(graphics) = graphics else {
        return Vec::new();
    };
    let listen = graphics.listen.as_deref().unwrap_or(VNC_DEFAULT_LISTEN);
    let mut options = vec![
        OptionValue::new("remotedisplay.vnc.enabled", "TRUE"),
        OptionValue::new("remotedisplay.vnc.port", graphics.port.to_string()),
        OptionValue::new("remotedisplay.vnc.ip", listen),
    ];
    if let Some(keymap) = &graphics.keymap {
        options.push(OptionValue::new("remotedisplay.vnc.keymap", keymap));
    }
    options
}
