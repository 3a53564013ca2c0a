//! Drivers that ship with the agent.

use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::{noop::Noop, profile::VIRTUAL_SENDER, Config, DeviceIdentity, DeviceProfile, Driver, DriverFactory};

/// Creates the built-in drivers by profile sender.
#[derive(Clone, Debug)]
#[allow(missing_copy_implementations)]
pub struct BuiltinDrivers {
    job_time: Duration,
}

impl BuiltinDrivers {
    /// Factory configured from the agent configuration.
    pub fn new(config: &Config) -> Self {
        let job_secs = config.virtual_printer.as_ref().map_or(60, |v| v.job_secs);
        Self {
            job_time: Duration::from_secs(job_secs),
        }
    }
}

#[async_trait]
impl DriverFactory for BuiltinDrivers {
    async fn create(&self, identity: &DeviceIdentity, profile: &DeviceProfile) -> Result<Box<dyn Driver>> {
        match profile.sender.as_str() {
            VIRTUAL_SENDER => {
                tracing::info!(identity = identity.to_string(), "starting simulated printer");
                Ok(Box::new(Noop::new(self.job_time)))
            }
            other => bail!("no driver for sender {}", other),
        }
    }
}
