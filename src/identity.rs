//! Device identities, and the rule deciding whether two of them describe
//! the same physical device.

use std::{collections::HashSet, fmt};

use parking_lot::Mutex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const ID_SEPARATOR: char = '_';
const INVALID_ID: &str = "invalid_printer_id";

/// Errors produced when validating a [RawIdentity].
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum IdentityError {
    /// A mandatory field is missing or empty.
    #[error("missing {0}")]
    Missing(&'static str),

    /// A field holds a value of the wrong type.
    #[error("bad value for {field}: {value}")]
    WrongType {
        /// Wire name of the field.
        field: &'static str,
        /// Offending value.
        value: String,
    },
}

/// An identity as produced by a detector, before validation. Detectors are
/// free to attach extra keys; only the known ones are interpreted.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(transparent)]
pub struct RawIdentity(pub Map<String, Value>);

impl RawIdentity {
    /// Whether the operator marked this device as disabled.
    pub fn is_disabled(&self) -> bool {
        self.0.get("disabled").and_then(Value::as_bool).unwrap_or(false)
            || self.0.get("enabled").and_then(Value::as_bool) == Some(false)
    }

    fn string(&self, field: &'static str) -> Result<Option<String>, IdentityError> {
        match self.0.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) if s.is_empty() => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(other) => Err(IdentityError::WrongType {
                field,
                value: other.to_string(),
            }),
        }
    }
}

impl From<&DeviceIdentity> for RawIdentity {
    fn from(identity: &DeviceIdentity) -> Self {
        match serde_json::to_value(identity) {
            Ok(Value::Object(map)) => RawIdentity(map),
            _ => RawIdentity::default(),
        }
    }
}

/// A validated device identity. Immutable once a session is created from
/// it.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash, JsonSchema)]
pub struct DeviceIdentity {
    /// Vendor id.
    #[serde(rename = "VID")]
    pub vid: String,

    /// Product id.
    #[serde(rename = "PID")]
    pub pid: String,

    /// Serial number.
    #[serde(rename = "SNR", default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,

    /// Local path of the device (serial port).
    #[serde(rename = "COM", default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Network address.
    #[serde(rename = "IP", default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,

    /// Network port.
    #[serde(rename = "PORT", default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Bus port the device is plugged into.
    #[serde(rename = "PRT", default, skip_serializing_if = "Option::is_none")]
    pub bus_port: Option<String>,

    /// Access code or password for the device.
    #[serde(rename = "PASS", default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Password for ssh access to the device.
    #[serde(rename = "SSHP", default, skip_serializing_if = "Option::is_none")]
    pub ssh_password: Option<String>,
}

impl TryFrom<&RawIdentity> for DeviceIdentity {
    type Error = IdentityError;

    fn try_from(raw: &RawIdentity) -> Result<Self, Self::Error> {
        let port = match raw.0.get("PORT") {
            None | Some(Value::Null) => None,
            Some(Value::Number(n)) => Some(n.as_u64().and_then(|n| u16::try_from(n).ok()).ok_or_else(|| {
                IdentityError::WrongType {
                    field: "PORT",
                    value: n.to_string(),
                }
            })?),
            Some(Value::String(s)) => Some(s.parse().map_err(|_| IdentityError::WrongType {
                field: "PORT",
                value: s.clone(),
            })?),
            Some(other) => {
                return Err(IdentityError::WrongType {
                    field: "PORT",
                    value: other.to_string(),
                })
            }
        };

        Ok(DeviceIdentity {
            vid: raw.string("VID")?.ok_or(IdentityError::Missing("VID"))?,
            pid: raw.string("PID")?.ok_or(IdentityError::Missing("PID"))?,
            serial: raw.string("SNR")?,
            path: raw.string("COM")?,
            ip: raw.string("IP")?,
            port,
            bus_port: raw.string("PRT")?,
            password: raw.string("PASS")?,
            ssh_password: raw.string("SSHP")?,
        })
    }
}

impl DeviceIdentity {
    /// Identity with only vendor and product id set.
    pub fn new(vid: &str, pid: &str) -> Self {
        Self {
            vid: vid.to_owned(),
            pid: pid.to_owned(),
            ..Default::default()
        }
    }

    /// Set the serial number.
    pub fn with_serial(mut self, serial: &str) -> Self {
        self.serial = Some(serial.to_owned());
        self
    }

    /// Set the local path.
    pub fn with_path(mut self, path: &str) -> Self {
        self.path = Some(path.to_owned());
        self
    }

    /// Set the bus port.
    pub fn with_bus_port(mut self, bus_port: &str) -> Self {
        self.bus_port = Some(bus_port.to_owned());
        self
    }

    /// Set the network address.
    pub fn with_ip(mut self, ip: &str, port: Option<u16>) -> Self {
        self.ip = Some(ip.to_owned());
        self.port = port;
        self
    }

    /// Whether `self` and `other` refer to the same physical device.
    ///
    /// Vendor and product must match. Then, first applicable wins: both
    /// serials present must match; a local path on either side must match
    /// the other's when both are present; bus ports present on both sides
    /// must match; otherwise the bare vendor/product match decides.
    pub fn is_same_device(&self, other: &DeviceIdentity) -> bool {
        if self.vid != other.vid || self.pid != other.pid {
            return false;
        }

        if let (Some(a), Some(b)) = (&self.serial, &other.serial) {
            return a == b;
        }

        if self.path.is_some() || other.path.is_some() {
            return match (&self.path, &other.path) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            };
        }

        if let (Some(a), Some(b)) = (&self.bus_port, &other.bus_port) {
            return a == b;
        }

        true
    }

    /// Filesystem- and log-safe identifier: `VID_PID_SNR` with every
    /// non-alphanumeric character replaced by `_`.
    pub fn id_string(&self) -> String {
        if self.vid.is_empty() || self.pid.is_empty() {
            return INVALID_ID.to_owned();
        }

        [self.vid.as_str(), self.pid.as_str(), self.serial.as_deref().unwrap_or_default()]
            .join(&ID_SEPARATOR.to_string())
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { ID_SEPARATOR })
            .collect()
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.vid, self.pid)?;
        if let Some(serial) = &self.serial {
            write!(f, ":{}", serial)?;
        }
        Ok(())
    }
}

/// Validates raw identities, logging each distinct malformed value once.
#[derive(Default)]
pub struct IdentityValidator {
    seen: Mutex<HashSet<String>>,
}

impl IdentityValidator {
    /// Validate `raw`, returning `None` (and logging on first sight) when it
    /// is malformed.
    pub fn validate(&self, raw: &RawIdentity) -> Option<DeviceIdentity> {
        match DeviceIdentity::try_from(raw) {
            Ok(identity) => Some(identity),
            Err(e) => {
                let key = serde_json::to_string(&raw.0).unwrap_or_default();
                if self.seen.lock().insert(key.clone()) {
                    tracing::error!(identity = key, error = e.to_string(), "invalid printer info");
                }
                None
            }
        }
    }

    /// Number of distinct malformed identities seen so far.
    pub fn rejected(&self) -> usize {
        self.seen.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use testresult::TestResult;

    use super::*;

    fn raw(value: Value) -> RawIdentity {
        RawIdentity(value.as_object().cloned().unwrap_or_default())
    }

    fn check(a: &DeviceIdentity, b: &DeviceIdentity, expected: bool) {
        assert_eq!(a.is_same_device(b), expected, "{:?} vs {:?}", a, b);
        assert_eq!(b.is_same_device(a), expected, "{:?} vs {:?} (reversed)", b, a);
    }

    #[test]
    fn test_vid_pid_must_match() {
        let a = DeviceIdentity::new("2C99", "0002");
        check(&a, &DeviceIdentity::new("2C99", "0003"), false);
        check(&a, &DeviceIdentity::new("2C98", "0002"), false);
        check(&a, &a.clone(), true);
    }

    #[test]
    fn test_serials_decide_when_both_present() {
        let a = DeviceIdentity::new("A", "B").with_serial("C").with_path("/dev/ttyACM0");
        check(&a, &DeviceIdentity::new("A", "B").with_serial("C").with_path("/dev/ttyACM1"), true);
        check(&a, &DeviceIdentity::new("A", "B").with_serial("D").with_path("/dev/ttyACM0"), false);
    }

    #[test]
    fn test_path_when_serial_missing_on_either_side() {
        let a = DeviceIdentity::new("A", "B").with_serial("C").with_path("/dev/ttyACM0");
        check(&a, &DeviceIdentity::new("A", "B").with_path("/dev/ttyACM0"), true);
        check(&a, &DeviceIdentity::new("A", "B").with_path("/dev/ttyACM1"), false);
        // One side without a path matches the other side's path.
        check(&a, &DeviceIdentity::new("A", "B"), true);
        check(
            &DeviceIdentity::new("A", "B").with_bus_port("1-1"),
            &DeviceIdentity::new("A", "B").with_bus_port("1-2").with_path("/dev/ttyUSB0"),
            true,
        );
    }

    #[test]
    fn test_bus_port_when_no_serial_or_path() {
        let a = DeviceIdentity::new("A", "B").with_bus_port("1-1");
        check(&a, &DeviceIdentity::new("A", "B").with_bus_port("1-1"), true);
        check(&a, &DeviceIdentity::new("A", "B").with_bus_port("1-2"), false);
        check(&a, &DeviceIdentity::new("A", "B").with_serial("X").with_bus_port("1-2"), false);
        check(&a, &DeviceIdentity::new("A", "B").with_serial("X"), true);
    }

    #[test]
    fn test_network_hints_do_not_separate() {
        let a = DeviceIdentity::new("A", "B").with_ip("10.0.0.2", Some(80));
        check(&a, &DeviceIdentity::new("A", "B").with_ip("10.0.0.3", None), true);
    }

    #[test]
    fn test_id_string() {
        let identity = DeviceIdentity::new("2C99", "0002").with_serial("CZPX-1234/a");
        assert_eq!(identity.id_string(), "2C99_0002_CZPX_1234_a");
        assert_eq!(DeviceIdentity::new("A", "B").id_string(), "A_B_");
        assert_eq!(DeviceIdentity::default().id_string(), "invalid_printer_id");
    }

    #[test]
    fn test_try_from_raw() -> TestResult {
        let identity = DeviceIdentity::try_from(&raw(json!({
            "VID": "2C99", "PID": "0002", "SNR": "", "PORT": "8080", "IP": "10.0.0.5", "extra": [1, 2]
        })))?;
        assert_eq!(identity.serial, None);
        assert_eq!(identity.port, Some(8080));
        assert_eq!(identity.ip.as_deref(), Some("10.0.0.5"));

        assert_eq!(
            DeviceIdentity::try_from(&raw(json!({"VID": "2C99"}))),
            Err(IdentityError::Missing("PID"))
        );
        assert_eq!(
            DeviceIdentity::try_from(&raw(json!({"VID": 11, "PID": "2"}))),
            Err(IdentityError::WrongType {
                field: "VID",
                value: "11".to_owned()
            })
        );
        Ok(())
    }

    #[test]
    fn test_disabled_markers() {
        assert!(raw(json!({"VID": "A", "PID": "B", "disabled": true})).is_disabled());
        assert!(raw(json!({"VID": "A", "PID": "B", "enabled": false})).is_disabled());
        assert!(!raw(json!({"VID": "A", "PID": "B", "enabled": true})).is_disabled());
        assert!(!raw(json!({"VID": "A", "PID": "B"})).is_disabled());
    }

    #[test]
    fn test_validator_logs_once() {
        let validator = IdentityValidator::default();
        let bad = raw(json!({"VID": 1}));
        assert!(validator.validate(&bad).is_none());
        assert!(validator.validate(&bad).is_none());
        assert_eq!(validator.rejected(), 1);
        assert!(validator.validate(&raw(json!({"VID": "A", "PID": "B"}))).is_some());
        assert_eq!(validator.rejected(), 1);
    }
}
