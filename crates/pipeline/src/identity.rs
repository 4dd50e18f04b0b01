// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Persistent device identity and the sensor permission gate.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rand::Rng;

use crate::reading::{epoch_ms, to_base36};

const DEVICE_ID_KEY: &str = "sensor_device_id";
const PERMISSION_KEY: &str = "sensor_streaming_permission";

/// JSON-file-backed key-value store for the handful of values that must
/// survive reinstalls of the pipeline state. Load and save are best-effort;
/// a broken file degrades to an empty store.
pub struct KeyStore {
    path: PathBuf,
    values: Mutex<HashMap<String, String>>,
}

impl KeyStore {
    pub fn open(path: &Path) -> Self {
        let values = match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(values) => values,
                Err(e) => {
                    tracing::warn!(path = %path.display(), err = %e, "keystore unreadable, starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Self { path: path.to_owned(), values: Mutex::new(values) }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values.lock().ok()?.get(key).cloned()
    }

    pub fn set(&self, key: &str, value: &str) {
        if let Ok(mut values) = self.values.lock() {
            values.insert(key.to_owned(), value.to_owned());
            self.save(&values);
        }
    }

    pub fn remove(&self, key: &str) {
        if let Ok(mut values) = self.values.lock() {
            values.remove(key);
            self.save(&values);
        }
    }

    fn save(&self, values: &HashMap<String, String>) {
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(values) {
            Ok(contents) => {
                if let Err(e) = std::fs::write(&self.path, contents) {
                    tracing::warn!(path = %self.path.display(), err = %e, "keystore write failed");
                }
            }
            Err(e) => tracing::warn!(err = %e, "keystore serialization failed"),
        }
    }
}

/// Device id, created on first use and cached for the process lifetime.
/// Format: `dev_<time36>_<rand_hex>`.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    id: String,
}

impl DeviceIdentity {
    pub fn resolve(store: &KeyStore) -> Self {
        if let Some(id) = store.get(DEVICE_ID_KEY) {
            return Self { id };
        }
        let id = format!("dev_{}_{:08x}", to_base36(epoch_ms()), rand::rng().random::<u32>());
        store.set(DEVICE_ID_KEY, &id);
        tracing::info!(device_id = %id, "created device identity");
        Self { id }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

/// The user's sensor-capture decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionDecision {
    Undetermined,
    /// Foreground and background capture allowed.
    Granted,
    /// Foreground only; background escalation was declined.
    Limited,
    Denied,
}

impl PermissionDecision {
    pub fn allows_capture(&self) -> bool {
        matches!(self, Self::Granted | Self::Limited)
    }
}

/// OS permission dialog seam. The embedding app shows the actual prompts;
/// tests script the answers.
pub trait PermissionHost: Send + Sync + 'static {
    /// Explain data usage and ask for consent. `false` means deferred.
    fn request_consent(&self) -> bool;

    /// Request foreground location/motion capability.
    fn request_foreground(&self) -> bool;

    /// Request background location ("keep tracking when you switch to a
    /// map app"). Declining is non-fatal.
    fn request_background(&self) -> bool;

    /// Whether the OS-level foreground permission currently holds.
    fn check_foreground(&self) -> bool;
}

/// Host that grants everything; used by the soak harness.
pub struct AlwaysGrant;

impl PermissionHost for AlwaysGrant {
    fn request_consent(&self) -> bool {
        true
    }
    fn request_foreground(&self) -> bool {
        true
    }
    fn request_background(&self) -> bool {
        true
    }
    fn check_foreground(&self) -> bool {
        true
    }
}

/// Persists the capture decision and re-verifies it against the OS on
/// resume.
pub struct PermissionGate {
    store: Arc<KeyStore>,
    host: Arc<dyn PermissionHost>,
    state: Mutex<PermissionDecision>,
}

impl PermissionGate {
    pub fn new(store: Arc<KeyStore>, host: Arc<dyn PermissionHost>) -> Self {
        let state = match store.get(PERMISSION_KEY).as_deref() {
            Some("granted") => PermissionDecision::Granted,
            Some("denied") => PermissionDecision::Denied,
            _ => PermissionDecision::Undetermined,
        };
        Self { store, host, state: Mutex::new(state) }
    }

    pub fn status(&self) -> PermissionDecision {
        self.state.lock().map(|s| *s).unwrap_or(PermissionDecision::Undetermined)
    }

    /// Run the request flow: consent, foreground capability, then the
    /// background escalation. A declined escalation leaves capture limited
    /// rather than absent.
    pub fn request(&self) -> PermissionDecision {
        let decision = if !self.host.request_consent() {
            PermissionDecision::Undetermined
        } else if !self.host.request_foreground() {
            PermissionDecision::Denied
        } else if self.host.request_background() {
            PermissionDecision::Granted
        } else {
            tracing::info!("background location declined, capture limited to foreground");
            PermissionDecision::Limited
        };

        match decision {
            PermissionDecision::Granted | PermissionDecision::Limited => {
                self.store.set(PERMISSION_KEY, "granted");
            }
            PermissionDecision::Denied => self.store.set(PERMISSION_KEY, "denied"),
            PermissionDecision::Undetermined => {}
        }
        if let Ok(mut state) = self.state.lock() {
            *state = decision;
        }
        decision
    }

    /// On resume, make sure the OS still agrees with the persisted grant.
    /// A revocation resets to undetermined so the coordinator can re-trigger
    /// the request once.
    pub fn verify_on_resume(&self) -> PermissionDecision {
        let current = self.status();
        if current.allows_capture() && !self.host.check_foreground() {
            tracing::warn!("sensor permission revoked while suspended");
            self.store.remove(PERMISSION_KEY);
            if let Ok(mut state) = self.state.lock() {
                *state = PermissionDecision::Undetermined;
            }
            return PermissionDecision::Undetermined;
        }
        current
    }
}

#[cfg(test)]
#[path = "identity_tests.rs"]
mod tests;
