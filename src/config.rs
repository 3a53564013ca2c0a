//! Code for the configuration of the agent.
//!
//! The configuration is read once at startup and shared as an
//! `Arc<Config>`; nothing mutates it afterwards.

use std::{path::PathBuf, time::Duration};

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};

use crate::{identity::RawIdentity, profile::DeviceProfile};

/// The configuration of the agent.
#[derive(Default, Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Remote control service.
    pub cloud: CloudConfig,
    /// Saved credentials.
    pub auth: AuthConfig,
    /// Session and orchestrator timing.
    pub agent: AgentConfig,
    /// Which detectors run.
    pub detectors: DetectorsConfig,
    /// Devices that are always reported, regardless of what is attached.
    pub static_printers: Vec<RawIdentity>,
    /// Devices probed over the network.
    pub network_printers: Vec<NetworkPrinterConfig>,
    /// Simulated device, reported ahead of every detector when set.
    pub virtual_printer: Option<VirtualPrinterConfig>,
    /// Locally known device-type profiles.
    pub profiles: Vec<DeviceProfile>,
    /// Local status API.
    pub api: ApiConfig,
    /// On-disk state.
    pub storage: StorageConfig,
}

impl Config {
    /// Parse a configuration from a toml file.
    pub fn from_file(file: &PathBuf) -> Result<Self> {
        let config = std::fs::read_to_string(file).with_context(|| format!("config file not found at {:?}", file))?;
        Self::from_str(&config)
    }

    /// Parse a configuration from a toml string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(config: &str) -> Result<Self> {
        Ok(toml::from_str(config)?)
    }
}

/// The remote control service.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CloudConfig {
    /// Base URL of the service.
    pub url: String,
    /// Run without the remote service.
    pub offline: bool,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            url: "https://cloud.3dprinteros.com".to_owned(),
            offline: false,
        }
    }
}

/// Credentials used when no saved token exists.
#[derive(Default, Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    /// User name.
    pub login: Option<String>,
    /// Password.
    pub password: Option<String>,
}

/// Timing and limits for sessions and the orchestrator.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
#[allow(missing_copy_implementations)]
pub struct AgentConfig {
    /// Period of the session status/command loop, in seconds.
    pub loop_period_secs: f64,
    /// Period of the orchestrator discovery loop, in seconds.
    pub discovery_period_secs: f64,
    /// How long a driver may stay non-operational before a blocking error
    /// is raised, in seconds. Profiles may override it.
    pub operational_timeout_secs: u64,
    /// How long an error record is kept when nobody acknowledges it, in
    /// seconds.
    pub error_forget_secs: u64,
    /// Maximum number of retained error records per session.
    pub error_capacity: usize,
    /// Default local mode duration, in seconds.
    pub local_mode_secs: u64,
    /// How long a stopping session may take to exit, in seconds.
    pub join_timeout_secs: u64,
    /// Live worker count above which a warning is logged.
    pub worker_warning_threshold: usize,
    /// Period of the timestamped heartbeat log line, in seconds.
    pub heartbeat_secs: u64,
    /// Retries for a download before giving up.
    pub download_retries: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            loop_period_secs: 1.5,
            discovery_period_secs: 2.0,
            operational_timeout_secs: 10,
            error_forget_secs: 300,
            error_capacity: 64,
            local_mode_secs: 600,
            join_timeout_secs: 21,
            worker_warning_threshold: 40,
            heartbeat_secs: 3600,
            download_retries: 15,
        }
    }
}

impl AgentConfig {
    /// Session loop period.
    pub fn loop_period(&self) -> Duration {
        Duration::from_secs_f64(self.loop_period_secs.max(0.01))
    }

    /// Orchestrator loop period.
    pub fn discovery_period(&self) -> Duration {
        Duration::from_secs_f64(self.discovery_period_secs.max(0.01))
    }

    /// Default non-operational timeout.
    pub fn operational_timeout(&self) -> Duration {
        Duration::from_secs(self.operational_timeout_secs)
    }

    /// Error forget timeout.
    pub fn error_forget(&self) -> Duration {
        Duration::from_secs(self.error_forget_secs)
    }

    /// Default local mode duration.
    pub fn local_mode(&self) -> Duration {
        Duration::from_secs(self.local_mode_secs)
    }

    /// Join timeout for stopping sessions.
    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }

    /// Heartbeat period.
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

/// Enable flags for each detector.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
#[allow(missing_copy_implementations)]
pub struct DetectorsConfig {
    /// Vendor SSDP announcements.
    pub bambu: bool,
    /// Serial bus scan.
    pub usb: bool,
    /// Report serial devices no profile knows about.
    pub usb_report_unknown: bool,
    /// Network probes of `network_printers`.
    pub network: bool,
    /// `static_printers` and the stored static list.
    #[serde(rename = "static")]
    pub static_list: bool,
}

impl Default for DetectorsConfig {
    fn default() -> Self {
        Self {
            bambu: true,
            usb: true,
            usb_report_unknown: false,
            network: true,
            static_list: true,
        }
    }
}

/// A device probed over the network.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkPrinterConfig {
    /// Address of the device.
    pub ip: String,
    /// Port to probe.
    pub port: u16,
    /// Vendor id to report.
    pub vid: String,
    /// Product id to report.
    pub pid: String,
    /// Serial to report.
    pub serial: Option<String>,
    /// Access code or password.
    pub password: Option<String>,
    /// Probe timeout, in milliseconds.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

fn default_probe_timeout_ms() -> u64 {
    1000
}

/// The simulated device.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct VirtualPrinterConfig {
    /// Vendor id to report.
    pub vid: String,
    /// Product id to report.
    pub pid: String,
    /// Serial to report.
    pub serial: String,
    /// Seconds a simulated job takes.
    pub job_secs: u64,
}

impl Default for VirtualPrinterConfig {
    fn default() -> Self {
        Self {
            vid: "XXXX".to_owned(),
            pid: "XXXX".to_owned(),
            serial: "0".to_owned(),
            job_secs: 60,
        }
    }
}

/// The local status API.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Serve the API.
    pub enabled: bool,
    /// `host:port` to bind to.
    pub bind: String,
    /// Advertise the API over mDNS.
    pub mdns: bool,
    /// How long a job request relayed to the remote service may take, in
    /// seconds.
    pub relay_timeout_secs: f64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1:8008".to_owned(),
            mdns: false,
            relay_timeout_secs: 10.0,
        }
    }
}

impl ApiConfig {
    /// Deadline for relayed job requests.
    pub fn relay_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.relay_timeout_secs.max(0.01))
    }
}

/// Where on-disk state lives.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for per-device settings and the auth store.
    pub dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("printer-agent-data"),
        }
    }
}
