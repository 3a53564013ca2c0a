//! Wires the agent together: login, profiles, discovery, the orchestrator
//! and the local API.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use cloudapi::TransportConfig;
use tokio_util::sync::CancellationToken;

use crate::{
    discover::Discovery,
    drivers::BuiltinDrivers,
    login::{login, UserSession},
    orchestrator::Orchestrator,
    profile::ProfileBook,
    server::{self, context::Context},
    session::SessionContext,
    storage::Storage,
    Config, DeviceProfile, DriverFactory,
};

/// Transport settings for the configured service.
pub fn transport_config(config: &Config) -> Result<TransportConfig> {
    let url = config
        .cloud
        .url
        .parse()
        .with_context(|| format!("invalid cloud url {:?}", config.cloud.url))?;
    let mut transport = TransportConfig::new(url);
    transport.offline = config.cloud.offline;
    Ok(transport)
}

/// Profiles from the service first, overridden by configured ones with the
/// same alias. The simulated device's profile is always known.
pub fn profile_book(config: &Config, user: Option<&UserSession>) -> ProfileBook {
    let mut book = ProfileBook::new(user.map(|u| u.profiles.clone()).unwrap_or_default());
    if let Some(printer) = &config.virtual_printer {
        book.insert(DeviceProfile::virtual_printer(&printer.vid, &printer.pid));
    }
    for profile in &config.profiles {
        book.insert(profile.clone());
    }
    book
}

/// Run the agent until `cancel` fires, with the built-in drivers.
pub async fn run(config: Config, cancel: CancellationToken) -> Result<()> {
    let drivers = Arc::new(BuiltinDrivers::new(&config));
    run_with_drivers(config, drivers, cancel).await
}

/// Run the agent until `cancel` fires.
pub async fn run_with_drivers(config: Config, drivers: Arc<dyn DriverFactory>, cancel: CancellationToken) -> Result<()> {
    let config = Arc::new(config);
    let storage = Storage::new(&config.storage.dir);
    let transport = transport_config(&config)?;

    let user = if config.cloud.offline {
        tracing::info!("running offline");
        None
    } else {
        match login(&config, &storage, transport.clone(), cancel.clone()).await? {
            Some(user) => Some(user),
            None => return Ok(()),
        }
    };

    let profiles = Arc::new(profile_book(&config, user.as_ref()));
    tracing::info!(profiles = profiles.all().len(), "printer profiles loaded");

    let (discovery, static_printers) = Discovery::from_config(&config, profiles.clone(), &storage).await;
    let ctx = Arc::new(SessionContext {
        config: config.clone(),
        profiles,
        storage,
        drivers,
        transport: transport.clone(),
        user_token: user.map(|u| u.user_token),
    });
    let orchestrator = Orchestrator::new(ctx, discovery);

    let api = if config.api.enabled {
        let context = Context {
            config: config.clone(),
            sessions: orchestrator.sessions(),
            static_printers,
            transport,
        };
        Some(tokio::spawn(server::serve(context, cancel.clone())))
    } else {
        None
    };

    orchestrator.run(cancel).await;

    if let Some(api) = api {
        api.await??;
    }
    tracing::info!("agent stopped");
    Ok(())
}
