use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::{identity::RawIdentity, storage::Storage, Detector};

const ID_KEYS: [&str; 3] = ["VID", "PID", "SNR"];

/// Whether `stored` is the device `printer` describes: every identifying
/// key `printer` sets must agree.
fn describes(printer: &RawIdentity, stored: &RawIdentity) -> bool {
    ID_KEYS.iter().all(|key| match printer.0.get(*key) {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) if s.is_empty() => true,
        value => stored.0.get(*key) == value,
    })
}

/// An explicit `enabled: true` is dropped; disabled entries are kept so the
/// orchestrator can stop their sessions.
fn prepare(printer: &RawIdentity) -> RawIdentity {
    let mut printer = printer.clone();
    if printer.0.get("enabled") == Some(&Value::Bool(true)) {
        printer.0.remove("enabled");
    }
    printer
}

/// Devices listed in the configuration plus those the operator stored.
pub struct StaticDetector {
    from_config: Vec<RawIdentity>,
    stored: Mutex<Vec<RawIdentity>>,
    // Held across the file write so saves land in edit order.
    saving: tokio::sync::Mutex<()>,
    storage: Storage,
}

impl StaticDetector {
    /// Detector over the configured list and the list kept in `storage`.
    pub async fn load(from_config: Vec<RawIdentity>, storage: Storage) -> Self {
        let stored = storage.load_static_printers().await;
        if !from_config.is_empty() || !stored.is_empty() {
            tracing::info!(configured = from_config.len(), stored = stored.len(), "static printers loaded");
        }
        Self {
            from_config,
            stored: Mutex::new(stored),
            saving: tokio::sync::Mutex::new(()),
            storage,
        }
    }

    /// Every configured and stored entry, as written.
    pub fn list(&self) -> Vec<RawIdentity> {
        self.from_config
            .iter()
            .chain(self.stored.lock().iter())
            .cloned()
            .collect()
    }

    /// Store a device, merging it into an entry describing the same device.
    pub async fn add(&self, printer: RawIdentity) -> Result<()> {
        let _saving = self.saving.lock().await;
        let snapshot = {
            let mut stored = self.stored.lock();
            match stored.iter_mut().find(|existing| describes(&printer, existing)) {
                Some(existing) => existing.0.extend(printer.0),
                None => {
                    tracing::info!(printer = serde_json::Value::Object(printer.0.clone()).to_string(), "adding static printer");
                    stored.push(printer);
                }
            }
            stored.clone()
        };
        self.storage.save_static_printers(&snapshot).await
    }

    /// Forget a stored device. Configured entries can't be removed.
    pub async fn remove(&self, printer: &RawIdentity) -> Result<bool> {
        let _saving = self.saving.lock().await;
        let snapshot = {
            let mut stored = self.stored.lock();
            let before = stored.len();
            stored.retain(|existing| {
                ID_KEYS
                    .iter()
                    .any(|key| existing.0.get(*key) != printer.0.get(*key))
            });
            if stored.len() == before {
                return Ok(false);
            }
            stored.clone()
        };
        self.storage.save_static_printers(&snapshot).await?;
        Ok(true)
    }
}

#[async_trait]
impl Detector for StaticDetector {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn poll(&self) -> Result<Vec<RawIdentity>> {
        Ok(self.list().iter().map(prepare).collect())
    }
}
