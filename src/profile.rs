//! Device-type profiles: what kind of printer a device is, and which driver
//! speaks to it.

use std::time::Duration;

use anyhow::Result;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::identity::DeviceIdentity;

/// Sender name of the built-in simulated driver.
pub const VIRTUAL_SENDER: &str = "virtual";

/// A device-type profile, as served by the remote service or configured
/// locally.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
pub struct DeviceProfile {
    /// Short unique name.
    pub alias: String,
    /// Human readable name.
    pub name: String,
    /// Driver to instantiate.
    pub sender: String,
    /// Vendor/product id pairs this profile applies to.
    #[serde(default)]
    pub vids_pids: Vec<[String; 2]>,
    /// Per-type non-operational timeout, in seconds.
    #[serde(default)]
    pub operational_timeout: Option<u64>,
    /// Driver specific settings.
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

impl DeviceProfile {
    /// Profile of the built-in simulated device.
    pub fn virtual_printer(vid: &str, pid: &str) -> Self {
        Self {
            alias: VIRTUAL_SENDER.to_owned(),
            name: "Virtual printer".to_owned(),
            sender: VIRTUAL_SENDER.to_owned(),
            vids_pids: vec![[vid.to_owned(), pid.to_owned()]],
            operational_timeout: None,
            extra: Map::new(),
        }
    }

    /// Parse a profile as sent by the remote service, which may encode it
    /// as a JSON string.
    pub fn from_server(value: &Value) -> Result<Self> {
        match value {
            Value::String(s) => Ok(serde_json::from_str(s)?),
            other => Ok(serde_json::from_value(other.clone())?),
        }
    }

    /// Whether this profile applies to the identity's vendor/product id.
    pub fn matches(&self, identity: &DeviceIdentity) -> bool {
        self.vids_pids
            .iter()
            .any(|[vid, pid]| vid.eq_ignore_ascii_case(&identity.vid) && pid.eq_ignore_ascii_case(&identity.pid))
    }

    /// Non-operational timeout for this type.
    pub fn operational_timeout(&self, default: Duration) -> Duration {
        self.operational_timeout.map(Duration::from_secs).unwrap_or(default)
    }
}

/// All locally known profiles.
#[derive(Clone, Debug, Default)]
pub struct ProfileBook {
    profiles: Vec<DeviceProfile>,
}

impl ProfileBook {
    /// Build a book; later entries with a repeated alias replace earlier
    /// ones.
    pub fn new(profiles: impl IntoIterator<Item = DeviceProfile>) -> Self {
        let mut book = Self::default();
        for profile in profiles {
            book.insert(profile);
        }
        book
    }

    /// Add or replace a profile by alias.
    pub fn insert(&mut self, profile: DeviceProfile) {
        match self.profiles.iter_mut().find(|p| p.alias == profile.alias) {
            Some(existing) => *existing = profile,
            None => self.profiles.push(profile),
        }
    }

    /// Look a profile up by alias.
    pub fn get(&self, alias: &str) -> Option<&DeviceProfile> {
        self.profiles.iter().find(|p| p.alias == alias)
    }

    /// Profiles applying to the identity.
    pub fn matching(&self, identity: &DeviceIdentity) -> Vec<&DeviceProfile> {
        self.profiles.iter().filter(|p| p.matches(identity)).collect()
    }

    /// The only profile applying to the identity, if there is exactly one.
    pub fn auto_select(&self, identity: &DeviceIdentity) -> Option<&DeviceProfile> {
        match self.matching(identity).as_slice() {
            [only] => Some(only),
            _ => None,
        }
    }

    /// Whether any profile applies to this vendor/product id.
    pub fn knows(&self, vid: &str, pid: &str) -> bool {
        self.matching(&DeviceIdentity::new(vid, pid)).first().is_some()
    }

    /// Every profile.
    pub fn all(&self) -> &[DeviceProfile] {
        &self.profiles
    }
}
