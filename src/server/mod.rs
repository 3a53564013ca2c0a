//! Local status API.

/// Shared state handed to API handlers.
pub mod context;
/// HTTP endpoint handlers.
pub mod endpoints;

use std::{net::SocketAddr, sync::Arc};

use anyhow::{anyhow, Result};
use dropshot::{ApiDescription, ConfigDropshot, HttpServer, ServerBuilder};
use tokio_util::sync::CancellationToken;

use crate::server::context::Context;

/// Create an API description for the server.
pub fn create_api_description() -> Result<ApiDescription<Arc<Context>>> {
    fn register_endpoints(api: &mut ApiDescription<Arc<Context>>) -> Result<(), String> {
        api.register(endpoints::ping).map_err(|e| e.to_string())?;
        api.register(endpoints::get_printers).map_err(|e| e.to_string())?;
        api.register(endpoints::get_printer).map_err(|e| e.to_string())?;
        api.register(endpoints::set_local_mode).map_err(|e| e.to_string())?;
        api.register(endpoints::set_printer_type).map_err(|e| e.to_string())?;
        api.register(endpoints::set_camera).map_err(|e| e.to_string())?;
        api.register(endpoints::get_jobs).map_err(|e| e.to_string())?;
        api.register(endpoints::start_job).map_err(|e| e.to_string())?;
        api.register(endpoints::get_static_printers).map_err(|e| e.to_string())?;
        api.register(endpoints::add_static_printer).map_err(|e| e.to_string())?;
        api.register(endpoints::remove_static_printer).map_err(|e| e.to_string())?;
        Ok(())
    }

    // Describe the API.
    let tag_config = serde_json::from_str(include_str!("../../openapi/tag-config.json"))?;
    let mut api = ApiDescription::new().tag_config(tag_config);

    register_endpoints(&mut api).map_err(|err| anyhow!("failed to register entrypoints: {}", err))?;

    Ok(api)
}

/// Start the local API on `bind`.
pub fn create_server(bind: SocketAddr, context: Context) -> Result<HttpServer<Arc<Context>>> {
    let api = create_api_description()?;

    let config_dropshot = ConfigDropshot {
        bind_address: bind,
        ..Default::default()
    };

    // Dropshot logs through slog; route it into tracing.
    let logger = slog::Logger::root(tracing_slog::TracingSlogDrain, slog::o!("component" => "dropshot"));

    let server = ServerBuilder::new(api, Arc::new(context), logger)
        .config(config_dropshot)
        .start()
        .map_err(|error| anyhow!("failed to create server: {}", error))?;

    Ok(server)
}

/// Serve the local API until `cancel` fires, advertising it over mDNS if
/// configured.
pub async fn serve(context: Context, cancel: CancellationToken) -> Result<()> {
    let bind: SocketAddr = context.config.api.bind.parse()?;
    let mdns = context.config.api.mdns;
    let server = create_server(bind, context)?;
    let addr = server.local_addr();
    tracing::info!(address = addr.to_string(), "local api listening");

    let _advertised = if mdns {
        let responder = libmdns::Responder::new_with_ip_list(Vec::new())?;
        let service = responder.register(
            "_printer-agent._tcp",
            "Printer Agent",
            addr.port(),
            &["path=/"],
        );
        Some((responder, service))
    } else {
        None
    };

    cancel.cancelled().await;
    server
        .close()
        .await
        .map_err(|error| anyhow!("closing the server failed: {}", error))?;
    tracing::info!("local api stopped");
    Ok(())
}
