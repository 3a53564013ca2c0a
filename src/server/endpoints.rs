use std::{sync::Arc, time::Duration};

use cloudapi::Request;
use dropshot::{
    endpoint, HttpError, HttpResponseDeleted, HttpResponseOk, HttpResponseUpdatedNoContent, Path, Query,
    RequestContext, TypedBody,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::context::Context;
use crate::{
    identity::RawIdentity,
    session::{ErrorReport, Requester, SessionHandle, SessionMessage, SessionSnapshot},
    DeviceIdentity,
};

/// The response from the `/ping` endpoint.
#[derive(Deserialize, Debug, JsonSchema, Serialize)]
pub struct Pong {
    /// The pong response.
    pub message: String,
}

/** Return pong. */
#[endpoint {
    method = GET,
    path = "/ping",
    tags = ["meta"],
}]
pub async fn ping(_rqctx: RequestContext<Arc<Context>>) -> Result<HttpResponseOk<Pong>, HttpError> {
    Ok(HttpResponseOk(Pong {
        message: "pong".to_string(),
    }))
}

/// A printer with a running session.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Printer {
    /// Session status.
    #[serde(flatten)]
    pub status: SessionSnapshot,

    /// Errors not yet shown to a local client. Each error is returned once.
    pub errors: Vec<ErrorReport>,
}

impl Printer {
    fn from_session(session: &SessionHandle) -> Self {
        let pending = session.errors.pending_for(Requester::Local);
        session
            .errors
            .mark_delivered(Requester::Local, &pending, std::time::Instant::now());
        Printer {
            status: session.snapshot(),
            errors: pending.reports,
        }
    }
}

/// The path parameters for performing operations on a printer.
#[derive(Deserialize, Debug, JsonSchema, Serialize)]
pub struct PrinterPathParams {
    /// The printer id.
    pub id: String,
}

fn find(ctx: &Context, id: &str) -> Result<Arc<SessionHandle>, HttpError> {
    ctx.find_session(id)
        .ok_or_else(|| HttpError::for_not_found(None, format!("printer not found by id: {:?}", id)))
}

fn deliver(session: &SessionHandle, message: SessionMessage) -> Result<(), HttpError> {
    if session.send(message) {
        Ok(())
    } else {
        Err(HttpError::for_unavail(None, format!("printer {} is shutting down", session.id)))
    }
}

/// List printers and their statuses
#[endpoint {
    method = GET,
    path = "/printers",
    tags = ["printers"],
}]
pub async fn get_printers(rqctx: RequestContext<Arc<Context>>) -> Result<HttpResponseOk<Vec<Printer>>, HttpError> {
    tracing::debug!("listing printers");
    let sessions = rqctx.context().sessions.read().clone();
    Ok(HttpResponseOk(
        sessions.iter().map(|s| Printer::from_session(s)).collect(),
    ))
}

/// Get the status of a specific printer
#[endpoint {
    method = GET,
    path = "/printers/{id}",
    tags = ["printers"],
}]
pub async fn get_printer(
    rqctx: RequestContext<Arc<Context>>,
    path_params: Path<PrinterPathParams>,
) -> Result<HttpResponseOk<Printer>, HttpError> {
    let params = path_params.into_inner();
    let session = find(rqctx.context(), &params.id)?;
    Ok(HttpResponseOk(Printer::from_session(&session)))
}

/// Local mode change.
#[derive(Deserialize, Debug, JsonSchema, Serialize)]
#[allow(missing_copy_implementations)]
pub struct LocalModeParams {
    /// Turn local mode on or off.
    pub enabled: bool,

    /// How long local mode lasts, in seconds. Defaults to the configured
    /// duration.
    #[serde(default)]
    pub duration_secs: Option<u64>,
}

/** Take or release local control of a printer. Remote commands are refused
 * while local mode is on. */
#[endpoint {
    method = PUT,
    path = "/printers/{id}/local_mode",
    tags = ["printers"],
}]
pub async fn set_local_mode(
    rqctx: RequestContext<Arc<Context>>,
    path_params: Path<PrinterPathParams>,
    body: TypedBody<LocalModeParams>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let ctx = rqctx.context();
    let session = find(ctx, &path_params.into_inner().id)?;
    let params = body.into_inner();
    let duration = params.enabled.then(|| {
        params
            .duration_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| ctx.config.agent.local_mode())
    });
    session.set_local_mode(duration);
    Ok(HttpResponseUpdatedNoContent())
}

/// Device-type selection.
#[derive(Deserialize, Debug, JsonSchema, Serialize)]
pub struct PrinterTypeParams {
    /// Alias of the device-type profile.
    pub alias: String,
}

/** Select the device type of a printer. */
#[endpoint {
    method = PUT,
    path = "/printers/{id}/printer_type",
    tags = ["printers"],
}]
pub async fn set_printer_type(
    rqctx: RequestContext<Arc<Context>>,
    path_params: Path<PrinterPathParams>,
    body: TypedBody<PrinterTypeParams>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let session = find(rqctx.context(), &path_params.into_inner().id)?;
    let alias = body.into_inner().alias;
    if alias.is_empty() {
        return Err(HttpError::for_bad_request(None, "empty printer type".to_owned()));
    }
    tracing::info!(id = session.id.as_str(), alias = alias.as_str(), "printer type selected locally");
    deliver(&session, SessionMessage::SelectProfile(alias))?;
    Ok(HttpResponseUpdatedNoContent())
}

/// Camera toggle.
#[derive(Deserialize, Debug, JsonSchema, Serialize)]
#[allow(missing_copy_implementations)]
pub struct CameraParams {
    /// Turn the camera on or off.
    pub enabled: bool,
}

/** Turn a printer's camera on or off. */
#[endpoint {
    method = PUT,
    path = "/printers/{id}/camera",
    tags = ["printers"],
}]
pub async fn set_camera(
    rqctx: RequestContext<Arc<Context>>,
    path_params: Path<PrinterPathParams>,
    body: TypedBody<CameraParams>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let session = find(rqctx.context(), &path_params.into_inner().id)?;
    deliver(&session, SessionMessage::Camera(body.into_inner().enabled))?;
    Ok(HttpResponseUpdatedNoContent())
}

fn registered(ctx: &Context, session: &SessionHandle) -> Result<String, HttpError> {
    if ctx.config.cloud.offline {
        return Err(HttpError::for_unavail(None, "agent runs offline".to_owned()));
    }
    session
        .auth_token()
        .ok_or_else(|| HttpError::for_unavail(None, format!("printer {} is not registered", session.id)))
}

fn relayed(reply: Option<Map<String, Value>>) -> Result<Value, HttpError> {
    let reply = reply.ok_or_else(|| HttpError::for_unavail(None, "remote service unreachable".to_owned()))?;
    if let Some(error) = reply.get("error").filter(|e| !e.is_null()) {
        tracing::warn!(error = error.to_string(), "remote service refused job request");
        return Err(HttpError::for_bad_request(None, error.to_string()));
    }
    Ok(Value::Object(reply))
}

/** List the jobs queued for a printer on the remote service. */
#[endpoint {
    method = GET,
    path = "/printers/{id}/jobs",
    tags = ["printers"],
}]
pub async fn get_jobs(
    rqctx: RequestContext<Arc<Context>>,
    path_params: Path<PrinterPathParams>,
) -> Result<HttpResponseOk<Value>, HttpError> {
    let ctx = rqctx.context();
    let session = find(ctx, &path_params.into_inner().id)?;
    let auth_token = registered(ctx, &session)?;
    let reply = ctx.proxy(&session, Request::JobList { auth_token }).await;
    Ok(HttpResponseOk(relayed(reply)?))
}

/// The path parameters for starting a queued job.
#[derive(Deserialize, Debug, JsonSchema, Serialize)]
pub struct JobPathParams {
    /// The printer id.
    pub id: String,
    /// The queued job id.
    pub job_id: String,
}

/** Start a job queued on the remote service. The job reaches the printer as
 * a regular command on the next poll. */
#[endpoint {
    method = POST,
    path = "/printers/{id}/jobs/{job_id}/start",
    tags = ["printers"],
}]
pub async fn start_job(
    rqctx: RequestContext<Arc<Context>>,
    path_params: Path<JobPathParams>,
) -> Result<HttpResponseOk<Value>, HttpError> {
    let ctx = rqctx.context();
    let params = path_params.into_inner();
    let session = find(ctx, &params.id)?;
    let auth_token = registered(ctx, &session)?;
    tracing::info!(id = session.id.as_str(), job_id = params.job_id.as_str(), "starting queued job");
    let reply = ctx
        .proxy(
            &session,
            Request::JobStart {
                auth_token,
                job_id: params.job_id,
            },
        )
        .await;
    Ok(HttpResponseOk(relayed(reply)?))
}

/// List the configured and stored static printers
#[endpoint {
    method = GET,
    path = "/static_printers",
    tags = ["static_printers"],
}]
pub async fn get_static_printers(
    rqctx: RequestContext<Arc<Context>>,
) -> Result<HttpResponseOk<Vec<Map<String, Value>>>, HttpError> {
    let printers = rqctx.context().static_printers.list();
    Ok(HttpResponseOk(printers.into_iter().map(|p| p.0).collect()))
}

/** Store a static printer. An entry for the same device is updated in place. */
#[endpoint {
    method = POST,
    path = "/static_printers",
    tags = ["static_printers"],
}]
pub async fn add_static_printer(
    rqctx: RequestContext<Arc<Context>>,
    body: TypedBody<Map<String, Value>>,
) -> Result<HttpResponseUpdatedNoContent, HttpError> {
    let printer = RawIdentity(body.into_inner());
    if let Err(e) = DeviceIdentity::try_from(&printer) {
        return Err(HttpError::for_bad_request(None, e.to_string()));
    }
    rqctx.context().static_printers.add(printer).await.map_err(|e| {
        tracing::warn!(error = format!("{:?}", e), "failed to store static printer");
        HttpError::for_internal_error(format!("{:?}", e))
    })?;
    Ok(HttpResponseUpdatedNoContent())
}

/// Which stored static printer to remove.
#[derive(Deserialize, Debug, JsonSchema, Serialize)]
pub struct StaticPrinterQuery {
    /// Vendor id.
    pub vid: String,
    /// Product id.
    pub pid: String,
    /// Serial number, if the entry has one.
    #[serde(default)]
    pub serial: Option<String>,
}

/** Remove a stored static printer. Printers listed in the configuration file
 * can't be removed here. */
#[endpoint {
    method = DELETE,
    path = "/static_printers",
    tags = ["static_printers"],
}]
pub async fn remove_static_printer(
    rqctx: RequestContext<Arc<Context>>,
    query: Query<StaticPrinterQuery>,
) -> Result<HttpResponseDeleted, HttpError> {
    let query = query.into_inner();
    let mut printer = Map::new();
    printer.insert("VID".to_owned(), Value::String(query.vid));
    printer.insert("PID".to_owned(), Value::String(query.pid));
    if let Some(serial) = query.serial {
        printer.insert("SNR".to_owned(), Value::String(serial));
    }

    let removed = rqctx
        .context()
        .static_printers
        .remove(&RawIdentity(printer))
        .await
        .map_err(|e| {
            tracing::warn!(error = format!("{:?}", e), "failed to store static printers");
            HttpError::for_internal_error(format!("{:?}", e))
        })?;
    if !removed {
        return Err(HttpError::for_not_found(None, "no such stored printer".to_owned()));
    }
    Ok(HttpResponseDeleted())
}
