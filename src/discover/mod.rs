//! Discovery: every enabled detector is polled in a fixed priority order, a
//! detector that reports anything pre-empts the detectors it conflicts with
//! for the rest of the tick, and whatever is reported gets validated.

#[cfg(feature = "bambu")]
mod bambu;
mod network;
mod static_list;
#[cfg(feature = "serial")]
mod usb;

use std::{collections::HashSet, panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt as _;

#[cfg(feature = "bambu")]
pub use bambu::BambuDetector;
pub use network::NetworkDetector;
pub use static_list::StaticDetector;
#[cfg(feature = "serial")]
pub use usb::UsbDetector;

use crate::{
    identity::{IdentityValidator, RawIdentity},
    profile::ProfileBook,
    storage::Storage,
    Config, Detector, DeviceIdentity,
};

/// A device reported this tick.
#[derive(Clone, Debug, PartialEq)]
pub struct Candidate {
    /// Validated identity.
    pub identity: DeviceIdentity,
    /// The operator disabled the device.
    pub disabled: bool,
}

/// Reports the configured simulated device ahead of everything else.
pub struct VirtualDetector {
    identity: RawIdentity,
}

impl VirtualDetector {
    /// Detector always reporting `identity`.
    pub fn new(identity: &DeviceIdentity) -> Self {
        Self {
            identity: identity.into(),
        }
    }
}

#[async_trait::async_trait]
impl Detector for VirtualDetector {
    fn name(&self) -> &'static str {
        "virtual"
    }

    async fn poll(&self) -> anyhow::Result<Vec<RawIdentity>> {
        Ok(vec![self.identity.clone()])
    }
}

/// The detectors in priority order.
pub struct Discovery {
    detectors: Vec<Arc<dyn Detector>>,
    validator: IdentityValidator,
}

impl Discovery {
    /// Discovery over `detectors`, polled in the given order.
    pub fn new(detectors: Vec<Arc<dyn Detector>>) -> Self {
        Self {
            detectors,
            validator: IdentityValidator::default(),
        }
    }

    /// Build the enabled detectors. The static detector is returned as well
    /// so the local API can edit its stored list.
    pub async fn from_config(config: &Config, profiles: Arc<ProfileBook>, storage: &Storage) -> (Self, Arc<StaticDetector>) {
        let mut detectors: Vec<Arc<dyn Detector>> = Vec::new();
        let static_list = Arc::new(StaticDetector::load(config.static_printers.clone(), storage.clone()).await);

        if let Some(printer) = &config.virtual_printer {
            let identity = DeviceIdentity::new(&printer.vid, &printer.pid).with_serial(&printer.serial);
            detectors.push(Arc::new(VirtualDetector::new(&identity)));
        }

        #[cfg(feature = "bambu")]
        if config.detectors.bambu {
            match BambuDetector::listen().await {
                Ok(detector) => detectors.push(Arc::new(detector)),
                Err(e) => tracing::warn!(error = format!("{:#}", e), "bambu detector unavailable"),
            }
        }

        #[cfg(feature = "serial")]
        if config.detectors.usb {
            detectors.push(Arc::new(UsbDetector::new(profiles.clone(), config.detectors.usb_report_unknown)));
        }
        #[cfg(not(feature = "serial"))]
        let _ = profiles;

        if config.detectors.network && !config.network_printers.is_empty() {
            detectors.push(Arc::new(NetworkDetector::new(config.network_printers.clone())));
        }

        if config.detectors.static_list {
            let detector: Arc<dyn Detector> = static_list.clone();
            detectors.push(detector);
        }

        tracing::info!(
            detectors = detectors.iter().map(|d| d.name()).collect::<Vec<_>>().join(","),
            "discovery ready"
        );
        (Self::new(detectors), static_list)
    }

    /// Names of the detectors, in priority order.
    pub fn names(&self) -> Vec<&'static str> {
        self.detectors.iter().map(|d| d.name()).collect()
    }

    /// Poll every detector once. A failing or panicking detector is logged
    /// and skipped; the others still run.
    pub async fn poll(&self) -> Vec<Candidate> {
        let mut skipped: HashSet<&'static str> = HashSet::new();
        let mut candidates: Vec<Candidate> = Vec::new();

        for detector in &self.detectors {
            let name = detector.name();
            if skipped.contains(name) {
                tracing::trace!(detector = name, "pre-empted this tick");
                continue;
            }

            let found = match AssertUnwindSafe(detector.poll()).catch_unwind().await {
                Ok(Ok(found)) => found,
                Ok(Err(e)) => {
                    tracing::warn!(detector = name, error = format!("{:#}", e), "detector failed");
                    continue;
                }
                Err(_) => {
                    tracing::error!(detector = name, "detector panicked");
                    continue;
                }
            };

            if !found.is_empty() {
                skipped.extend(detector.conflicts().iter().copied());
            }

            for raw in found {
                let Some(identity) = self.validator.validate(&raw) else {
                    continue;
                };
                if candidates.iter().any(|c| c.identity.is_same_device(&identity)) {
                    tracing::trace!(detector = name, identity = identity.to_string(), "already reported");
                    continue;
                }
                candidates.push(Candidate {
                    disabled: raw.is_disabled(),
                    identity,
                });
            }
        }
        candidates
    }
}

#[cfg(test)]
mod tests {
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    struct Fixed {
        name: &'static str,
        conflicts: &'static [&'static str],
        found: Vec<serde_json::Value>,
    }

    #[async_trait]
    impl Detector for Fixed {
        fn name(&self) -> &'static str {
            self.name
        }

        fn conflicts(&self) -> &'static [&'static str] {
            self.conflicts
        }

        async fn poll(&self) -> Result<Vec<RawIdentity>> {
            Ok(self
                .found
                .iter()
                .filter_map(|v| v.as_object().cloned().map(RawIdentity))
                .collect())
        }
    }

    struct Broken;

    #[async_trait]
    impl Detector for Broken {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn poll(&self) -> Result<Vec<RawIdentity>> {
            bail!("bus went away")
        }
    }

    struct Panicky;

    #[async_trait]
    impl Detector for Panicky {
        fn name(&self) -> &'static str {
            "panicky"
        }

        async fn poll(&self) -> Result<Vec<RawIdentity>> {
            panic!("detector bug")
        }
    }

    fn fixed(name: &'static str, conflicts: &'static [&'static str], found: Vec<serde_json::Value>) -> Arc<dyn Detector> {
        Arc::new(Fixed { name, conflicts, found })
    }

    #[tokio::test]
    async fn test_conflicting_detector_is_skipped() {
        let discovery = Discovery::new(vec![
            fixed("bambu", &["network"], vec![json!({"VID": "BBL0", "PID": "X1C", "SNR": "00M1"})]),
            fixed("network", &[], vec![json!({"VID": "AAAA", "PID": "BBBB", "IP": "10.0.0.2"})]),
            fixed("static", &[], vec![json!({"VID": "CCCC", "PID": "DDDD"})]),
        ]);
        let found: Vec<String> = discovery.poll().await.into_iter().map(|c| c.identity.vid).collect();
        assert_eq!(found, vec!["BBL0".to_owned(), "CCCC".to_owned()]);
    }

    #[tokio::test]
    async fn test_empty_result_does_not_pre_empt() {
        let discovery = Discovery::new(vec![
            fixed("bambu", &["network"], vec![]),
            fixed("network", &[], vec![json!({"VID": "AAAA", "PID": "BBBB", "IP": "10.0.0.2"})]),
        ]);
        assert_eq!(discovery.poll().await.len(), 1);
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let broken: Arc<dyn Detector> = Arc::new(Broken);
        let panicky: Arc<dyn Detector> = Arc::new(Panicky);
        let discovery = Discovery::new(vec![
            broken,
            panicky,
            fixed("static", &[], vec![json!({"VID": "CCCC", "PID": "DDDD"})]),
        ]);
        assert_eq!(discovery.poll().await.len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_and_disabled() {
        let discovery = Discovery::new(vec![fixed(
            "static",
            &[],
            vec![
                json!({"VID": "", "PID": "DDDD"}),
                json!({"VID": 12, "PID": "DDDD"}),
                json!({"VID": "CCCC", "PID": "DDDD", "enabled": false}),
            ],
        )]);
        let found = discovery.poll().await;
        assert_eq!(found.len(), 1);
        assert!(found[0].disabled);
        assert_eq!(discovery.validator.rejected(), 2);

        // Same bad values again are not logged twice.
        discovery.poll().await;
        assert_eq!(discovery.validator.rejected(), 2);
    }

    #[tokio::test]
    async fn test_same_device_reported_once() {
        let discovery = Discovery::new(vec![
            fixed("usb", &[], vec![json!({"VID": "AAAA", "PID": "BBBB", "SNR": "1", "COM": "/dev/ttyACM0"})]),
            fixed("static", &[], vec![json!({"VID": "AAAA", "PID": "BBBB", "SNR": "1"})]),
        ]);
        assert_eq!(discovery.poll().await.len(), 1);
    }
}
