//! Common traits used throughout this crate: the contract a device driver
//! must satisfy, how drivers are made, and what a detector looks like.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{identity::RawIdentity, DeviceIdentity, DeviceProfile, TemporaryFile};

/// A print job handed to a [Driver].
pub enum JobPayload {
    /// Job held in memory.
    Inline(Bytes),
    /// Job written to a file, removed once the payload is dropped.
    File(TemporaryFile),
}

impl JobPayload {
    /// Size of the payload in bytes.
    pub async fn size(&self) -> Result<u64> {
        match self {
            JobPayload::Inline(bytes) => Ok(bytes.len() as u64),
            JobPayload::File(file) => Ok(tokio::fs::metadata(file.path()).await?.len()),
        }
    }

    /// Read the whole payload into memory.
    pub async fn into_bytes(self) -> Result<Bytes> {
        match self {
            JobPayload::Inline(bytes) => Ok(bytes),
            JobPayload::File(file) => Ok(Bytes::from(tokio::fs::read(file.path()).await?)),
        }
    }
}

impl std::fmt::Debug for JobPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobPayload::Inline(bytes) => write!(f, "Inline({} bytes)", bytes.len()),
            JobPayload::File(file) => write!(f, "File({:?})", file.path()),
        }
    }
}

/// Hotend and bed temperatures, in degrees celsius. The first entry is the
/// bed, the rest are tools.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
pub struct Temperatures {
    /// Measured temperatures.
    pub actual: Vec<f64>,
    /// Target temperatures.
    pub target: Vec<f64>,
}

/// A [Driver] speaks one printer's wire protocol. Queries never fail: a
/// driver that can't answer reports the device as not operational.
/// Commands may fail; the session turns failures into error reports.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Whether the device is connected and responsive.
    async fn is_operational(&self) -> bool;

    /// Whether a job is running.
    async fn is_printing(&self) -> bool;

    /// Whether the running job is paused.
    async fn is_paused(&self) -> bool;

    /// Whether the bed is clear for the next job.
    async fn is_bed_clear(&self) -> bool {
        true
    }

    /// Progress of the running job, 0 to 100.
    async fn get_percent(&self) -> f64;

    /// Current temperatures.
    async fn get_temperatures(&self) -> Temperatures;

    /// Current toolhead position, if known.
    async fn get_position(&self) -> Option<Vec<f64>>;

    /// Line of the job currently executing, if tracked.
    async fn get_line_number(&self) -> Option<u64> {
        None
    }

    /// Identifier of the running job, if any.
    async fn get_job_id(&self) -> Option<String> {
        None
    }

    /// Loaded materials, if the device reports them.
    async fn get_materials(&self) -> Option<Value> {
        None
    }

    /// Free-form fields appended to every status report.
    async fn extension_fields(&self) -> Map<String, Value> {
        Map::new()
    }

    /// Pause the running job.
    async fn pause(&mut self) -> Result<()>;

    /// Resume a paused job.
    async fn unpause(&mut self) -> Result<()>;

    /// Whether [Driver::cancel] is supported.
    fn can_cancel(&self) -> bool {
        true
    }

    /// Cancel the running job.
    async fn cancel(&mut self) -> Result<()>;

    /// Queue a job for buffered printing.
    async fn load_job(&mut self, payload: JobPayload) -> Result<()>;

    /// Send commands straight to the device, bypassing the job buffer.
    async fn send_unbuffered(&mut self, text: &str) -> Result<()>;

    /// Name of the next job.
    async fn set_filename(&mut self, _name: &str) {}

    /// Release the device. Must be idempotent, and safe to call on a driver
    /// that never fully connected.
    async fn close(&mut self);
}

/// Instantiates the [Driver] named by a profile.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    /// Create and connect a driver.
    async fn create(&self, identity: &DeviceIdentity, profile: &DeviceProfile) -> Result<Box<dyn Driver>>;
}

/// A source of device identities.
#[async_trait]
pub trait Detector: Send + Sync {
    /// Name other detectors use to refer to this one.
    fn name(&self) -> &'static str;

    /// Detectors skipped for the rest of a tick when this one reports
    /// anything.
    fn conflicts(&self) -> &'static [&'static str] {
        &[]
    }

    /// Devices present right now.
    async fn poll(&self) -> Result<Vec<RawIdentity>>;
}
