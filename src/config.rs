//! Configuration registry: named typed keys with persistence and the
//! semantics the OCPP `ChangeConfiguration` / `GetConfiguration` pair needs.
//!
//! Keys are declared once with a default and a set of flags; redeclaration
//! is idempotent but a conflicting type is an error. Non-volatile values are
//! persisted as one JSON snapshot blob, written atomically.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::storage::Filesystem;

/// Blob name of the configuration snapshot.
pub const CONFIG_BLOB: &str = "ocpp-config.jsn";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("key {0:?} already declared with a different type")]
    TypeConflict(String),
    #[error("key {0:?} is read-only")]
    ReadOnly(String),
    #[error("key {0:?} is not declared")]
    Unknown(String),
    #[error("value {value:?} is not valid for key {key:?}")]
    InvalidValue { key: String, value: String },
}

/// Typed configuration value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ConfigValue {
    Int(i32),
    Bool(bool),
    Text(String),
}

impl ConfigValue {
    fn same_type(&self, other: &ConfigValue) -> bool {
        matches!(
            (self, other),
            (ConfigValue::Int(_), ConfigValue::Int(_))
                | (ConfigValue::Bool(_), ConfigValue::Bool(_))
                | (ConfigValue::Text(_), ConfigValue::Text(_))
        )
    }

    /// Parses `raw` with the same type as `self` (the declared type wins).
    fn parse_as_same(&self, raw: &str) -> Option<ConfigValue> {
        match self {
            ConfigValue::Int(_) => raw.trim().parse().ok().map(ConfigValue::Int),
            ConfigValue::Bool(_) => match raw.trim() {
                "true" | "True" | "TRUE" => Some(ConfigValue::Bool(true)),
                "false" | "False" | "FALSE" => Some(ConfigValue::Bool(false)),
                _ => None,
            },
            ConfigValue::Text(_) => Some(ConfigValue::Text(raw.to_string())),
        }
    }

    pub fn render(&self) -> String {
        match self {
            ConfigValue::Int(v) => v.to_string(),
            ConfigValue::Bool(v) => v.to_string(),
            ConfigValue::Text(v) => v.clone(),
        }
    }
}

/// Behavior flags of a configuration key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigFlags {
    /// Server writes are rejected.
    pub readonly: bool,
    /// Writes are accepted but only take effect after a reboot; reported as
    /// `RebootRequired` to the server.
    pub reboot_required: bool,
    /// Never persisted; the value lives only in memory.
    pub volatile: bool,
    /// Included in a `GetConfiguration` response without an explicit key list.
    pub report: bool,
}

impl ConfigFlags {
    pub fn readonly() -> ConfigFlags {
        ConfigFlags { readonly: true, report: true, ..Default::default() }
    }

    pub fn writable() -> ConfigFlags {
        ConfigFlags { report: true, ..Default::default() }
    }

    pub fn volatile() -> ConfigFlags {
        ConfigFlags { volatile: true, report: true, ..Default::default() }
    }
}

#[derive(Debug)]
pub struct ConfigEntry {
    key: String,
    value: ConfigValue,
    flags: ConfigFlags,
}

/// Shared handle onto one declared key. Cheap to clone; the registry and all
/// handles observe the same value.
#[derive(Clone)]
pub struct ConfigHandle(Rc<RefCell<ConfigEntry>>);

impl ConfigHandle {
    pub fn key(&self) -> String {
        self.0.borrow().key.clone()
    }

    pub fn int(&self) -> i32 {
        match &self.0.borrow().value {
            ConfigValue::Int(v) => *v,
            other => {
                warn!(key = %self.0.borrow().key, ?other, "int read on non-int key");
                0
            }
        }
    }

    pub fn bool(&self) -> bool {
        matches!(self.0.borrow().value, ConfigValue::Bool(true))
    }

    pub fn text(&self) -> String {
        match &self.0.borrow().value {
            ConfigValue::Text(v) => v.clone(),
            other => other.render(),
        }
    }

    pub fn set_int(&self, v: i32) {
        self.0.borrow_mut().value = ConfigValue::Int(v);
    }

    pub fn set_bool(&self, v: bool) {
        self.0.borrow_mut().value = ConfigValue::Bool(v);
    }

    pub fn set_text(&self, v: impl Into<String>) {
        self.0.borrow_mut().value = ConfigValue::Text(v.into());
    }
}

/// Outcome of a server-driven write, mirroring the OCPP
/// `ChangeConfiguration` status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    Accepted,
    RebootRequired,
    Rejected,
    NotSupported,
}

/// One key as reported to `GetConfiguration`.
#[derive(Debug, Clone)]
pub struct KeyReport {
    pub key: String,
    pub readonly: bool,
    pub value: String,
}

#[derive(Serialize, Deserialize)]
struct PersistedEntry {
    key: String,
    #[serde(flatten)]
    value: ConfigValue,
}

pub struct ConfigRegistry {
    entries: Vec<Rc<RefCell<ConfigEntry>>>,
    filesystem: Rc<dyn Filesystem>,
}

impl ConfigRegistry {
    pub fn new(filesystem: Rc<dyn Filesystem>) -> ConfigRegistry {
        ConfigRegistry { entries: Vec::new(), filesystem }
    }

    fn find(&self, key: &str) -> Option<Rc<RefCell<ConfigEntry>>> {
        self.entries.iter().find(|e| e.borrow().key == key).cloned()
    }

    /// Declares a key with its default value. Idempotent: a second
    /// declaration of the same key returns the existing handle (keeping the
    /// current value); a conflicting type fails.
    pub fn declare(
        &mut self,
        key: &str,
        default: ConfigValue,
        flags: ConfigFlags,
    ) -> Result<ConfigHandle, ConfigError> {
        if let Some(existing) = self.find(key) {
            if !existing.borrow().value.same_type(&default) {
                return Err(ConfigError::TypeConflict(key.to_string()));
            }
            return Ok(ConfigHandle(existing));
        }
        debug!(key, ?default, "configuration key declared");
        let entry = Rc::new(RefCell::new(ConfigEntry {
            key: key.to_string(),
            value: default,
            flags,
        }));
        self.entries.push(entry.clone());
        Ok(ConfigHandle(entry))
    }

    pub fn declare_int(
        &mut self,
        key: &str,
        default: i32,
        flags: ConfigFlags,
    ) -> Result<ConfigHandle, ConfigError> {
        self.declare(key, ConfigValue::Int(default), flags)
    }

    pub fn declare_bool(
        &mut self,
        key: &str,
        default: bool,
        flags: ConfigFlags,
    ) -> Result<ConfigHandle, ConfigError> {
        self.declare(key, ConfigValue::Bool(default), flags)
    }

    pub fn declare_text(
        &mut self,
        key: &str,
        default: &str,
        flags: ConfigFlags,
    ) -> Result<ConfigHandle, ConfigError> {
        self.declare(key, ConfigValue::Text(default.to_string()), flags)
    }

    pub fn get(&self, key: &str) -> Option<ConfigValue> {
        self.find(key).map(|e| e.borrow().value.clone())
    }

    pub fn get_int(&self, key: &str) -> Option<i32> {
        match self.get(key) {
            Some(ConfigValue::Int(v)) => Some(v),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key) {
            Some(ConfigValue::Bool(v)) => Some(v),
            _ => None,
        }
    }

    pub fn handle(&self, key: &str) -> Option<ConfigHandle> {
        self.find(key).map(ConfigHandle)
    }

    /// Local (host-side) write. Does not consult `readonly`, which only
    /// guards server writes.
    pub fn set(&mut self, key: &str, value: ConfigValue) -> Result<(), ConfigError> {
        let entry = self.find(key).ok_or_else(|| ConfigError::Unknown(key.to_string()))?;
        if !entry.borrow().value.same_type(&value) {
            return Err(ConfigError::TypeConflict(key.to_string()));
        }
        entry.borrow_mut().value = value;
        Ok(())
    }

    /// Server-driven write with string coercion, used by the
    /// `ChangeConfiguration` handler. Persists on success.
    pub fn set_from_string(&mut self, key: &str, raw: &str) -> SetOutcome {
        let Some(entry) = self.find(key) else {
            return SetOutcome::NotSupported;
        };
        let (flags, parsed) = {
            let e = entry.borrow();
            (e.flags, e.value.parse_as_same(raw))
        };
        if flags.readonly {
            return SetOutcome::Rejected;
        }
        let Some(value) = parsed else {
            return SetOutcome::Rejected;
        };
        entry.borrow_mut().value = value;
        if !flags.volatile {
            if let Err(err) = self.save() {
                warn!(key, %err, "configuration save failed; value kept in memory");
            }
        }
        if flags.reboot_required {
            SetOutcome::RebootRequired
        } else {
            SetOutcome::Accepted
        }
    }

    /// Reports keys for `GetConfiguration`. With an empty filter, all keys
    /// flagged for reporting are returned; otherwise the requested keys are
    /// split into known reports and unknown names.
    pub fn enumerate(&self, filter: &[String]) -> (Vec<KeyReport>, Vec<String>) {
        if filter.is_empty() {
            let reports = self
                .entries
                .iter()
                .filter(|e| e.borrow().flags.report)
                .map(|e| {
                    let e = e.borrow();
                    KeyReport {
                        key: e.key.clone(),
                        readonly: e.flags.readonly,
                        value: e.value.render(),
                    }
                })
                .collect();
            return (reports, Vec::new());
        }
        let mut reports = Vec::new();
        let mut unknown = Vec::new();
        for key in filter {
            match self.find(key) {
                Some(e) => {
                    let e = e.borrow();
                    reports.push(KeyReport {
                        key: e.key.clone(),
                        readonly: e.flags.readonly,
                        value: e.value.render(),
                    });
                }
                None => unknown.push(key.clone()),
            }
        }
        (reports, unknown)
    }

    /// Writes the non-volatile entries as one snapshot blob (atomic replace
    /// is the filesystem's contract).
    pub fn save(&self) -> io::Result<()> {
        let snapshot: Vec<PersistedEntry> = self
            .entries
            .iter()
            .filter(|e| !e.borrow().flags.volatile)
            .map(|e| {
                let e = e.borrow();
                PersistedEntry { key: e.key.clone(), value: e.value.clone() }
            })
            .collect();
        let data = serde_json::to_vec(&snapshot)?;
        self.filesystem.write(CONFIG_BLOB, &data)
    }

    /// Overlays persisted values onto the declared defaults. Keys that are
    /// no longer declared are dropped; a corrupt snapshot is ignored.
    pub fn load(&mut self) {
        let Ok(data) = self.filesystem.read(CONFIG_BLOB) else {
            return;
        };
        let snapshot: Vec<PersistedEntry> = match serde_json::from_slice(&data) {
            Ok(s) => s,
            Err(err) => {
                warn!(%err, "configuration snapshot corrupt; using defaults");
                return;
            }
        };
        for persisted in snapshot {
            match self.find(&persisted.key) {
                Some(entry) => {
                    if entry.borrow().value.same_type(&persisted.value) {
                        entry.borrow_mut().value = persisted.value;
                    } else {
                        warn!(key = %persisted.key, "persisted type mismatch; default kept");
                    }
                }
                None => debug!(key = %persisted.key, "persisted key no longer declared"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemFilesystem;

    fn registry() -> (ConfigRegistry, MemFilesystem) {
        let fs = MemFilesystem::new();
        (ConfigRegistry::new(Rc::new(fs.clone())), fs)
    }

    #[test]
    fn declaration_is_idempotent() {
        let (mut reg, _fs) = registry();
        let a = reg.declare_int("ConnectionTimeOut", 30, ConfigFlags::writable()).unwrap();
        a.set_int(45);
        let b = reg.declare_int("ConnectionTimeOut", 30, ConfigFlags::writable()).unwrap();
        assert_eq!(b.int(), 45);
    }

    #[test]
    fn conflicting_redeclaration_fails() {
        let (mut reg, _fs) = registry();
        reg.declare_int("HeartbeatInterval", 60, ConfigFlags::writable()).unwrap();
        assert!(matches!(
            reg.declare_bool("HeartbeatInterval", false, ConfigFlags::writable()),
            Err(ConfigError::TypeConflict(_))
        ));
    }

    #[test]
    fn readonly_rejects_server_writes() {
        let (mut reg, _fs) = registry();
        reg.declare_text("SupportedFeatureProfiles", "Core", ConfigFlags::readonly()).unwrap();
        assert_eq!(reg.set_from_string("SupportedFeatureProfiles", "x"), SetOutcome::Rejected);
    }

    #[test]
    fn reboot_required_is_reported() {
        let (mut reg, _fs) = registry();
        let flags = ConfigFlags { reboot_required: true, ..ConfigFlags::writable() };
        reg.declare_int("WebSocketPingInterval", 10, flags).unwrap();
        assert_eq!(
            reg.set_from_string("WebSocketPingInterval", "20"),
            SetOutcome::RebootRequired
        );
        assert_eq!(reg.get_int("WebSocketPingInterval"), Some(20));
    }

    #[test]
    fn bad_value_and_unknown_key() {
        let (mut reg, _fs) = registry();
        reg.declare_int("ConnectionTimeOut", 30, ConfigFlags::writable()).unwrap();
        assert_eq!(reg.set_from_string("ConnectionTimeOut", "soon"), SetOutcome::Rejected);
        assert_eq!(reg.set_from_string("NoSuchKey", "1"), SetOutcome::NotSupported);
    }

    #[test]
    fn save_load_round_trip() {
        let (mut reg, fs) = registry();
        reg.declare_int("ConnectionTimeOut", 30, ConfigFlags::writable()).unwrap();
        reg.declare_bool("AO_PreBootTransactions", false, ConfigFlags::writable()).unwrap();
        reg.declare_int("Scratch", 1, ConfigFlags::volatile()).unwrap();
        reg.set("ConnectionTimeOut", ConfigValue::Int(99)).unwrap();
        reg.set("Scratch", ConfigValue::Int(7)).unwrap();
        reg.save().unwrap();

        let mut fresh = ConfigRegistry::new(Rc::new(fs));
        fresh.declare_int("ConnectionTimeOut", 30, ConfigFlags::writable()).unwrap();
        fresh.declare_bool("AO_PreBootTransactions", false, ConfigFlags::writable()).unwrap();
        fresh.declare_int("Scratch", 1, ConfigFlags::volatile()).unwrap();
        fresh.load();
        assert_eq!(fresh.get_int("ConnectionTimeOut"), Some(99));
        // volatile keys fall back to their default
        assert_eq!(fresh.get_int("Scratch"), Some(1));
    }

    #[test]
    fn enumerate_splits_known_and_unknown() {
        let (mut reg, _fs) = registry();
        reg.declare_int("ConnectionTimeOut", 30, ConfigFlags::writable()).unwrap();
        let (known, unknown) =
            reg.enumerate(&["ConnectionTimeOut".to_string(), "Bogus".to_string()]);
        assert_eq!(known.len(), 1);
        assert_eq!(known[0].value, "30");
        assert_eq!(unknown, vec!["Bogus".to_string()]);
    }
}
