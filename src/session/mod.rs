//! One worker per device. A session registers the device with the remote
//! service, resolves its device-type profile, holds the driver, and runs the
//! status/command loop until it is told to stop.

mod command;
pub mod errors;
mod handle;
mod local_mode;
mod report;
pub mod state;

use std::{
    panic::AssertUnwindSafe,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Result};
use base64::Engine as _;
use bytes::Bytes;
use cloudapi::{codes, Ack, CommandReply, ErrorSink, Request, Severity, Transport, TransportConfig};
use futures::FutureExt as _;
use serde_json::{json, Map, Value};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::Instrument as _;

pub use command::{Admission, CommandLedger, CommandName, LedgerError};
pub use errors::{ErrorBook, ErrorReport, PendingErrors, Requester};
pub use handle::{SessionHandle, SessionMessage, SessionSnapshot};
pub use local_mode::LocalMode;
pub use report::ReportDiffer;
pub use state::{derive_state, CancelDetector, DriverStatus, ForcedState, SessionState, StateInputs};

use crate::{
    download::{Destination, DownloadJob, Downloader},
    profile::ProfileBook,
    storage::{DeviceSettings, Storage},
    Config, DeviceIdentity, DeviceProfile, Driver, DriverFactory, JobPayload,
};

/// Out-of-band request key asking the service to forget the device type.
pub const RESET_PRINTER_TYPE: &str = "reset_printer_type";
/// Out-of-band request key announcing a camera toggle.
pub const CAMERA_CHANGE: &str = "camera_change";

const CAMERA_ON: &str = "Dual camera";
const CAMERA_OFF: &str = "Disable camera";
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
#[error("printer does not support cancelling")]
struct CancelUnsupported;

/// Everything sessions share.
pub struct SessionContext {
    /// Agent configuration.
    pub config: Arc<Config>,
    /// Locally known device-type profiles.
    pub profiles: Arc<ProfileBook>,
    /// On-disk state.
    pub storage: Storage,
    /// Creates drivers by profile sender.
    pub drivers: Arc<dyn DriverFactory>,
    /// How to reach the remote service.
    pub transport: TransportConfig,
    /// Token of the logged in user. Unused offline.
    pub user_token: Option<String>,
}

impl SessionContext {
    fn is_offline(&self) -> bool {
        self.config.cloud.offline
    }
}

/// Start a session for `identity` on the runtime.
pub fn spawn(ctx: Arc<SessionContext>, identity: DeviceIdentity) -> (Arc<SessionHandle>, JoinHandle<()>) {
    let session = Session::new(ctx, identity);
    let handle = session.handle.clone();
    (handle, tokio::spawn(session.run()))
}

/// Work deferred until the current send is acknowledged.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Hook {
    Reconnect,
    ResetProfile,
}

enum Exit {
    Stopped,
    Restart,
}

enum Registration {
    Registered,
    SelectorPending(Vec<String>),
    Failed,
}

struct Session {
    ctx: Arc<SessionContext>,
    handle: Arc<SessionHandle>,
    inbox: mpsc::UnboundedReceiver<SessionMessage>,
    transport: Transport,
    downloader: Downloader,
    download: Option<DownloadJob>,
    driver: Option<Box<dyn Driver>>,
    profile: Option<DeviceProfile>,
    selected_profile: Option<String>,
    settings: DeviceSettings,
    forced: Option<ForcedState>,
    ledger: CommandLedger,
    differ: ReportDiffer,
    cancel_detector: CancelDetector,
    first_request: bool,
    hooks: Vec<Hook>,
    restart: bool,
    last_operational: Instant,
}

impl Session {
    fn new(ctx: Arc<SessionContext>, identity: DeviceIdentity) -> Self {
        let errors = Arc::new(ErrorBook::new(
            ctx.config.agent.error_forget(),
            ctx.config.agent.error_capacity,
        ));
        let (tx, inbox) = mpsc::unbounded_channel();
        let handle = Arc::new(SessionHandle::new(identity, errors.clone(), tx));
        let sink: Arc<dyn ErrorSink> = errors;

        // Sends made by the loop are raced against the stop signal instead,
        // so the transport stays usable for the final flush.
        let transport = Transport::new(ctx.transport.clone(), sink.clone(), CancellationToken::new());
        let downloader = Downloader::new(sink, ctx.config.agent.download_retries);
        Self {
            ctx,
            handle,
            inbox,
            transport,
            downloader,
            download: None,
            driver: None,
            profile: None,
            selected_profile: None,
            settings: DeviceSettings::default(),
            forced: None,
            ledger: CommandLedger::default(),
            differ: ReportDiffer::default(),
            cancel_detector: CancelDetector::default(),
            first_request: true,
            hooks: Vec::new(),
            restart: false,
            last_operational: Instant::now(),
        }
    }

    async fn run(mut self) {
        let span = tracing::info_span!("session", id = self.handle.id.as_str());
        async move {
            tracing::info!(identity = self.handle.identity.to_string(), "session started");
            self.settings = self.ctx.storage.load_device(&self.handle.id).await;
            let name = self.settings.name.clone();
            self.handle.update_snapshot(|s| s.name = name);
            loop {
                match self.run_once().await {
                    Exit::Stopped => break,
                    Exit::Restart if self.handle.is_stopping() => break,
                    Exit::Restart => {
                        tracing::info!("restarting session");
                        self.reset().await;
                    }
                }
            }
            self.shutdown().await;
            tracing::info!("session stopped");
        }
        .instrument(span)
        .await
    }

    async fn run_once(&mut self) -> Exit {
        if !self.start().await {
            return Exit::Stopped;
        }
        let period = self.ctx.config.agent.loop_period();
        loop {
            if self.handle.is_stopping() {
                return Exit::Stopped;
            }
            if self.driver.is_none() {
                self.connect_driver().await;
            }
            if let Some(exit) = self.tick().await {
                return exit;
            }
            if !self.idle(period).await {
                return Exit::Stopped;
            }
            if self.restart {
                return Exit::Restart;
            }
        }
    }

    /// Wait for `period` while serving the inbox. Returns false once the
    /// session is told to stop.
    async fn idle(&mut self, period: Duration) -> bool {
        let cancel = self.handle.cancel_token();
        let deadline = tokio::time::sleep(period);
        tokio::pin!(deadline);
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = &mut deadline => return true,
                message = self.inbox.recv() => message,
            };
            match message {
                Some(message) => self.handle_message(message).await,
                None => {
                    return tokio::select! {
                        _ = cancel.cancelled() => false,
                        _ = &mut deadline => true,
                    }
                }
            }
        }
    }

    /// Resolve the profile and, online, register the device. Retries until
    /// done; returns false if told to stop first.
    async fn start(&mut self) -> bool {
        let period = self.ctx.config.agent.loop_period();
        loop {
            if self.handle.is_stopping() {
                return false;
            }

            let registered = if self.ctx.is_offline() {
                self.resolve_local_profile().await
            } else {
                match self.register().await {
                    Registration::Registered => true,
                    Registration::SelectorPending(types) => {
                        tracing::info!(choices = types.len(), "waiting for printer type selection");
                        self.handle.update_snapshot(|s| s.printer_types = types);
                        false
                    }
                    Registration::Failed => false,
                }
            };

            if registered {
                // Fresh connection: nothing from the previous one is owed.
                self.handle.errors.clear();
                self.forced = None;
                self.first_request = true;
                self.differ.reset();
                self.cancel_detector.reset();
                self.handle.update_snapshot(|s| s.printer_types.clear());
                return true;
            }

            if !self.idle(period).await {
                return false;
            }
        }
    }

    /// Pick a profile without the remote service: an explicit selection,
    /// else the cached one, else the only local profile matching the
    /// device.
    async fn resolve_local_profile(&mut self) -> bool {
        let alias = self.selected_profile.clone().or_else(|| self.settings.profile_alias.clone());
        let profile = match &alias {
            Some(alias) => self.ctx.profiles.get(alias).cloned(),
            None => self.ctx.profiles.auto_select(&self.handle.identity).cloned(),
        };

        match profile {
            Some(profile) => {
                self.remember_profile(profile).await;
                true
            }
            None => {
                if let Some(alias) = alias {
                    tracing::warn!(alias, "unknown printer type");
                    self.selected_profile = None;
                }
                let mut types: Vec<String> = self
                    .ctx
                    .profiles
                    .matching(&self.handle.identity)
                    .into_iter()
                    .map(|p| p.alias.clone())
                    .collect();
                if types.is_empty() {
                    types = self.ctx.profiles.all().iter().map(|p| p.alias.clone()).collect();
                }
                self.handle.update_snapshot(|s| s.printer_types = types);
                false
            }
        }
    }

    async fn remember_profile(&mut self, profile: DeviceProfile) {
        if self.settings.profile_alias.as_deref() != Some(profile.alias.as_str()) {
            let alias = profile.alias.clone();
            self.update_settings(|s| s.profile_alias = Some(alias)).await;
        }
        tracing::info!(profile = profile.alias, sender = profile.sender, "printer type resolved");
        let alias = profile.alias.clone();
        self.handle.update_snapshot(|s| s.profile = Some(alias));
        self.profile = Some(profile);
    }

    async fn update_settings(&mut self, f: impl FnOnce(&mut DeviceSettings)) {
        match self.ctx.storage.update_device(&self.handle.id, f).await {
            Ok(settings) => self.settings = settings,
            Err(e) => tracing::warn!(error = format!("{:#}", e), "can't save device settings"),
        }
    }

    async fn register(&mut self) -> Registration {
        let Some(user_token) = self.ctx.user_token.clone() else {
            tracing::warn!("no user token, can't register printer");
            return Registration::Failed;
        };

        let request = Request::PrinterLogin {
            user_token,
            printer: serde_json::to_value(&self.handle.identity).unwrap_or_default(),
            version: crate::VERSION.to_owned(),
            data_time: chrono::Utc::now().to_rfc2822(),
            camera: self.settings.camera_enabled.then(|| CAMERA_ON.to_owned()),
            select_printer_type: self.selected_profile.clone(),
        };
        let Some(reply) = self.exchange(&request, Map::new()).await else {
            return Registration::Failed;
        };

        if let Some(token) = reply.get("auth_token").and_then(Value::as_str) {
            let resolved = match reply.get("printer_profile") {
                Some(value) => match DeviceProfile::from_server(value) {
                    Ok(profile) => {
                        self.remember_profile(profile).await;
                        true
                    }
                    Err(e) => {
                        tracing::warn!(error = format!("{:#}", e), "bad printer profile from server");
                        false
                    }
                },
                None => self.resolve_local_profile().await,
            };
            if resolved {
                tracing::info!("printer registered");
                self.handle.set_auth_token(Some(token.to_owned()));
                return Registration::Registered;
            }
            return Registration::Failed;
        }

        if let Some(types) = reply.get("printer_types").and_then(Value::as_array) {
            let types = types
                .iter()
                .filter_map(|t| match t {
                    Value::String(alias) => Some(alias.clone()),
                    other => other.get("alias").and_then(Value::as_str).map(str::to_owned),
                })
                .collect();
            return Registration::SelectorPending(types);
        }

        tracing::warn!(reply = serde_json::Value::Object(reply).to_string(), "printer registration refused");
        Registration::Failed
    }

    /// Send, giving up as soon as the session is told to stop.
    async fn exchange(&mut self, request: &Request, extra: Map<String, Value>) -> Option<Map<String, Value>> {
        let cancel = self.handle.cancel_token();
        tokio::select! {
            _ = cancel.cancelled() => None,
            reply = self.transport.pack_and_send(request, extra) => reply,
        }
    }

    async fn connect_driver(&mut self) {
        let Some(profile) = self.profile.as_ref() else {
            return;
        };
        let cancel = self.handle.cancel_token();
        let created = tokio::select! {
            _ = cancel.cancelled() => return,
            created = self.ctx.drivers.create(&self.handle.identity, profile) => created,
        };
        match created {
            Ok(driver) => {
                tracing::info!(profile = profile.alias, "printer connected");
                self.driver = Some(driver);
                self.last_operational = Instant::now();
            }
            Err(e) => self.handle.errors.register(
                codes::DRIVER_CONNECT_FAILED,
                format!("can't connect to printer {} {}: {:#}", profile.name, self.handle.identity, e),
                Severity::Blocking,
            ),
        }
    }

    async fn close_driver(&mut self) {
        if let Some(mut driver) = self.driver.take() {
            driver.close().await;
            tracing::info!("printer closed");
        }
    }

    fn is_downloading(&self) -> bool {
        self.download.as_ref().is_some_and(DownloadJob::is_running)
    }

    fn arm(&mut self, hook: Hook) {
        if !self.hooks.contains(&hook) {
            self.hooks.push(hook);
        }
    }

    async fn driver_status(&self) -> Option<DriverStatus> {
        let driver = self.driver.as_ref()?;
        Some(DriverStatus {
            operational: driver.is_operational().await,
            printing: driver.is_printing().await,
            paused: driver.is_paused().await,
            bed_clear: driver.is_bed_clear().await,
        })
    }

    /// One pass of the status/command loop.
    async fn tick(&mut self) -> Option<Exit> {
        let errors = self.handle.errors.clone();

        // Everything below decides from this one snapshot, so an error
        // raised mid-tick waits for the next one.
        let pending = errors.pending_for(Requester::Remote);
        if pending.has_blocking() {
            self.forced = Some(ForcedState::Error);
            self.arm(Hook::Reconnect);
        }
        let critical = pending.has_critical();

        let inputs = StateInputs {
            forced: self.forced,
            driver: self.driver_status().await,
            downloading: self.is_downloading(),
            local_mode: self.handle.local_mode.is_enabled(),
        };
        let mut state = derive_state(&inputs);
        let download_percent = self
            .download
            .as_ref()
            .filter(|d| d.is_running())
            .map(|d| f64::from(d.progress().percent()));
        let mut full = report::collect(self.driver.as_deref(), state, download_percent).await;

        if self.cancel_detector.observe(state, report::percent_of(&full)) && self.forced.is_none() {
            tracing::info!("job cancel detected");
            self.forced = Some(ForcedState::Cancel);
            state = SessionState::Cancel;
            full.insert("state".to_owned(), json!(state));
        }
        let percent = full.get("percent").and_then(Value::as_f64);
        let local_mode = inputs.local_mode;
        self.handle.update_snapshot(|s| {
            s.state = state;
            s.percent = percent;
            s.local_mode = local_mode;
        });

        let mut report = self.differ.diff(&full);
        let event = self.handle.take_event();
        if let Some(event) = &event {
            report.extend(event.clone());
        }

        let mut extra = Map::new();
        if !pending.is_empty() {
            extra.insert("error".to_owned(), json!(pending.reports));
        }
        if self.first_request {
            extra.insert("reset_job".to_owned(), json!(true));
        }
        let request = self.handle.take_request();
        if let Some((key, value)) = &request {
            if key == RESET_PRINTER_TYPE {
                self.arm(Hook::ResetProfile);
            }
            extra.insert(key.clone(), value.clone());
        }

        let sent_at = Instant::now();
        let reply = if self.ctx.is_offline() {
            Some(Map::new())
        } else if let Some(auth_token) = self.handle.auth_token() {
            let command = Request::Command {
                auth_token,
                report: report.clone(),
                command_ack: self.ledger.outstanding(),
            };
            self.exchange(&command, extra).await
        } else {
            None
        };

        let mut exit = None;
        match reply {
            Some(reply) => {
                self.differ.commit(&report);
                self.ledger.delivered();
                errors.mark_delivered(Requester::Remote, &pending, sent_at);
                self.first_request = false;
                if self.forced == Some(ForcedState::Cancel) {
                    self.forced = None;
                }
                self.handle_reply(reply).await;

                for hook in std::mem::take(&mut self.hooks) {
                    match hook {
                        Hook::Reconnect => self.reconnect().await,
                        Hook::ResetProfile => {
                            self.forget_profile().await;
                            exit = Some(Exit::Restart);
                        }
                    }
                }
            }
            None => {
                if let Some(event) = event {
                    self.handle.requeue_event(event);
                }
                if let Some((key, value)) = request {
                    self.handle.requeue_request(key, value);
                }
                self.hooks.clear();
            }
        }

        if critical {
            return Some(Exit::Restart);
        }
        if exit.is_some() {
            return exit;
        }
        self.check_operational().await;
        None
    }

    async fn check_operational(&mut self) {
        let Some(driver) = self.driver.as_ref() else {
            return;
        };
        if driver.is_operational().await {
            self.last_operational = Instant::now();
            if self.forced == Some(ForcedState::Error) && !self.handle.errors.has_undelivered_blocking(Requester::Remote) {
                self.forced = None;
            }
            return;
        }
        if self.forced.is_some() {
            return;
        }

        let default = self.ctx.config.agent.operational_timeout();
        let timeout = self.profile.as_ref().map_or(default, |p| p.operational_timeout(default));
        if self.last_operational.elapsed() > timeout {
            self.handle.errors.register(
                codes::OPERATIONAL_TIMEOUT,
                "printer is not operational for too long".to_owned(),
                Severity::Blocking,
            );
        } else {
            self.handle
                .errors
                .register(codes::NOT_OPERATIONAL, "printer is not operational".to_owned(), Severity::Info);
        }
    }

    /// Drop the driver and the connection, then register again.
    async fn reconnect(&mut self) {
        tracing::info!("reconnecting");
        if let Some(download) = self.download.take() {
            download.cancel();
        }
        self.close_driver().await;
        self.transport.close();
        if self.start().await {
            tracing::info!("reconnected");
        }
    }

    async fn forget_profile(&mut self) {
        tracing::info!("printer type reset");
        self.selected_profile = None;
        self.update_settings(|s| s.profile_alias = None).await;
    }

    async fn reset(&mut self) {
        if let Some(download) = self.download.take() {
            download.cancel();
        }
        self.close_driver().await;
        self.transport.close();
        self.handle.set_auth_token(None);
        self.profile = None;
        self.ledger = CommandLedger::default();
        self.hooks.clear();
        self.restart = false;
        self.handle.update_snapshot(|s| {
            s.state = SessionState::Connecting;
            s.profile = None;
            s.percent = None;
        });
    }

    async fn shutdown(&mut self) {
        if !self.ctx.is_offline() && !self.handle.errors.pending_for(Requester::Remote).is_empty() {
            self.flush().await;
        }
        if let Some(download) = self.download.take() {
            download.cancel();
        }
        self.close_driver().await;
        self.transport.close();
    }

    /// One last bounded send so errors raised while stopping reach the
    /// service.
    async fn flush(&mut self) {
        let Some(auth_token) = self.handle.auth_token() else {
            return;
        };
        let pending = self.handle.errors.pending_for(Requester::Remote);
        let mut report = Map::new();
        report.insert("state".to_owned(), json!(self.handle.snapshot().state));
        let mut extra = Map::new();
        extra.insert("error".to_owned(), json!(pending.reports));
        let request = Request::Command {
            auth_token,
            report,
            command_ack: self.ledger.outstanding(),
        };

        let sent_at = Instant::now();
        match tokio::time::timeout(FLUSH_TIMEOUT, self.transport.pack_and_send(&request, extra)).await {
            Ok(Some(_)) => {
                self.handle.errors.mark_delivered(Requester::Remote, &pending, sent_at);
                tracing::info!("final report delivered");
            }
            Ok(None) => tracing::warn!("final report not delivered"),
            Err(_) => tracing::warn!("final report timed out"),
        }
    }

    async fn handle_message(&mut self, message: SessionMessage) {
        match message {
            SessionMessage::SelectProfile(alias) => {
                tracing::info!(alias, "printer type selected");
                self.selected_profile = Some(alias.clone());
                if self.profile.as_ref().is_some_and(|p| p.alias != alias) {
                    self.update_settings(|s| s.profile_alias = Some(alias)).await;
                    self.restart = true;
                }
            }
            SessionMessage::Camera(enabled) => self.set_camera(enabled).await,
            SessionMessage::DownloadFinished(payload) => {
                self.download = None;
                let result = match self.driver.as_mut() {
                    Some(driver) => driver.load_job(payload).await,
                    None => Err(anyhow!("printer is not connected")),
                };
                if let Err(e) = result {
                    self.handle.errors.register(
                        codes::COMMAND_FAILED,
                        format!("can't start downloaded job: {:#}", e),
                        Severity::Info,
                    );
                }
            }
            SessionMessage::DownloadCancelled => {
                self.download = None;
                self.forced = Some(ForcedState::Cancel);
                self.handle.push_event("download_cancelled", Map::new());
            }
        }
    }

    async fn set_camera(&mut self, enabled: bool) {
        if self.settings.camera_enabled == enabled {
            return;
        }
        self.update_settings(|s| s.camera_enabled = enabled).await;
        self.settings.camera_enabled = enabled;
        let module = if enabled { CAMERA_ON } else { CAMERA_OFF };
        self.handle.queue_request(CAMERA_CHANGE, json!(module));
    }

    async fn handle_reply(&mut self, reply: Map<String, Value>) {
        if reply.is_empty() {
            return;
        }
        let reply = match CommandReply::from_map(reply) {
            Ok(reply) => reply,
            Err(e) => {
                self.reject_unnumbered(codes::INVALID_JSON, format!("malformed command: {}", e));
                return;
            }
        };
        if let Some(error) = &reply.error {
            tracing::warn!(code = ?error.code, reason = ?error.message, "server returned error");
        }
        let Some(command) = reply.command.clone() else {
            return;
        };
        let Some(number) = reply.number() else {
            self.reject_unnumbered(
                codes::BAD_COMMAND_NUMBER,
                format!("error in number field of command {}: {:?}", command, reply.number),
            );
            return;
        };

        if self.handle.local_mode.is_enabled() {
            self.reject(
                number,
                codes::LOCAL_MODE,
                format!("can't execute command {} while in local mode", command),
            );
            return;
        }

        match self.ledger.admit(number) {
            Ok(Admission::Fresh) => {}
            Ok(Admission::Repeat(ack)) => {
                tracing::info!(number, "repeated command, resending acknowledgment");
                self.ledger.resend(ack);
                return;
            }
            Err(e @ LedgerError::AckOutstanding { .. }) => {
                self.reject_unnumbered(codes::COMMAND_OUT_OF_ORDER, e.to_string());
                return;
            }
            Err(e @ LedgerError::OutOfOrder { .. }) => {
                self.reject(number, codes::COMMAND_OUT_OF_ORDER, e.to_string());
                return;
            }
        }

        let Ok(name) = command.parse::<CommandName>() else {
            self.reject(number, codes::UNKNOWN_COMMAND, format!("unknown command: '{}'", command));
            return;
        };

        tracing::info!(number, command = name.to_string(), "executing command");
        let result = if reply.is_link {
            self.start_download(name, &reply).await
        } else {
            self.execute(name, number, reply.payload).await
        };
        self.ledger.record(Ack { number, result });
    }

    fn reject_unnumbered(&self, code: u32, message: String) {
        self.handle.errors.register(code, message, Severity::Info);
    }

    fn reject(&mut self, number: i64, code: u32, message: String) {
        self.handle.errors.register(code, message, Severity::Info);
        self.ledger.reject(number);
    }

    async fn start_download(&mut self, name: CommandName, reply: &CommandReply) -> bool {
        if !name.accepts_link() {
            self.reject_unnumbered(codes::COMMAND_FAILED, format!("command {} does not accept a link", name));
            return false;
        }
        if self.is_downloading() {
            self.reject_unnumbered(codes::DOWNLOAD_IN_PROGRESS, "download already in progress".to_owned());
            return false;
        }
        let Some(url) = reply.payload.as_ref().and_then(Value::as_str) else {
            self.reject_unnumbered(codes::COMMAND_FAILED, "link command without a url".to_owned());
            return false;
        };

        if let (Some(driver), Some(filename)) = (self.driver.as_mut(), reply.filename.as_deref()) {
            driver.set_filename(filename).await;
        }
        let finished = self.handle.clone();
        let cancelled = self.handle.clone();
        let destination = Destination::Disk(self.ctx.config.storage.dir.join("downloads"));
        self.download = Some(self.downloader.start(
            url,
            destination,
            reply.zip,
            move |payload| {
                finished.send(SessionMessage::DownloadFinished(payload));
            },
            move || {
                cancelled.send(SessionMessage::DownloadCancelled);
            },
        ));
        true
    }

    /// Run a command, turning failures and panics into error reports.
    async fn execute(&mut self, name: CommandName, number: i64, payload: Option<Value>) -> bool {
        match AssertUnwindSafe(self.dispatch(name, payload)).catch_unwind().await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                let code = if e.is::<CancelUnsupported>() {
                    codes::CANCEL_UNSUPPORTED
                } else {
                    codes::COMMAND_FAILED
                };
                self.reject_unnumbered(
                    code,
                    format!("error while executing command {}, number {}: {:#}", name, number, e),
                );
                false
            }
            Err(_) => {
                self.reject_unnumbered(
                    codes::COMMAND_FAILED,
                    format!("command {}, number {} panicked", name, number),
                );
                false
            }
        }
    }

    fn driver_mut(&mut self) -> Result<&mut Box<dyn Driver>> {
        self.driver.as_mut().ok_or_else(|| anyhow!("printer is not connected"))
    }

    async fn dispatch(&mut self, name: CommandName, payload: Option<Value>) -> Result<()> {
        match name {
            CommandName::Gcodes => match decode_job(payload.as_ref())? {
                Job::Unbuffered(text) => self.driver_mut()?.send_unbuffered(&text).await,
                Job::Buffered(bytes) => self.driver_mut()?.load_job(JobPayload::Inline(bytes)).await,
            },
            CommandName::UnbufferedGcodes => {
                let text = payload_text(payload.as_ref())?;
                self.driver_mut()?.send_unbuffered(&text).await
            }
            CommandName::Pause => self.driver_mut()?.pause().await,
            CommandName::Unpause => self.driver_mut()?.unpause().await,
            CommandName::Cancel if self.is_downloading() => {
                tracing::info!("cancelling download");
                if let Some(download) = &self.download {
                    download.cancel();
                }
                Ok(())
            }
            CommandName::Cancel => {
                let driver = self.driver_mut()?;
                if !driver.can_cancel() {
                    bail!(CancelUnsupported);
                }
                driver.cancel().await
            }
            CommandName::SetName => {
                let name = payload
                    .as_ref()
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow!("set_name needs a name"))?
                    .to_owned();
                self.settings = self
                    .ctx
                    .storage
                    .update_device(&self.handle.id, |s| s.name = Some(name.clone()))
                    .await?;
                self.handle.update_snapshot(|s| s.name = Some(name));
                Ok(())
            }
            CommandName::SwitchCamera => {
                let module = payload.as_ref().and_then(Value::as_str).unwrap_or(CAMERA_OFF);
                self.set_camera(module != CAMERA_OFF).await;
                Ok(())
            }
            CommandName::ResetPrinterType => {
                self.handle.queue_request(RESET_PRINTER_TYPE, json!(true));
                Ok(())
            }
        }
    }
}

enum Job {
    Unbuffered(String),
    Buffered(Bytes),
}

fn payload_text(payload: Option<&Value>) -> Result<String> {
    match payload {
        Some(Value::String(text)) => Ok(text.clone()),
        Some(Value::Array(lines)) => Ok(lines
            .iter()
            .map(|line| line.as_str().map_or_else(|| line.to_string(), str::to_owned))
            .collect::<Vec<_>>()
            .join("\n")),
        _ => bail!("command needs a gcode payload"),
    }
}

/// A base64 payload carries a handful of commands to run now; anything
/// else is a job.
fn decode_job(payload: Option<&Value>) -> Result<Job> {
    let text = payload_text(payload)?;
    if let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(text.as_bytes()) {
        if let Ok(commands) = String::from_utf8(decoded) {
            return Ok(Job::Unbuffered(commands));
        }
    }
    Ok(Job::Buffered(Bytes::from(text)))
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use testresult::TestResult;

    use super::*;
    use crate::Temperatures;

    #[derive(Default)]
    struct Calls(Mutex<Vec<String>>);

    struct FakeDriver {
        calls: Arc<Calls>,
        fail: bool,
        cancels: bool,
    }

    impl FakeDriver {
        fn call(&self, what: String) -> Result<()> {
            self.calls.0.lock().push(what);
            if self.fail {
                bail!("printer said no");
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Driver for FakeDriver {
        async fn is_operational(&self) -> bool {
            true
        }
        async fn is_printing(&self) -> bool {
            false
        }
        async fn is_paused(&self) -> bool {
            false
        }
        async fn get_percent(&self) -> f64 {
            0.0
        }
        async fn get_temperatures(&self) -> Temperatures {
            Temperatures::default()
        }
        async fn get_position(&self) -> Option<Vec<f64>> {
            None
        }
        async fn pause(&mut self) -> Result<()> {
            self.call("pause".to_owned())
        }
        async fn unpause(&mut self) -> Result<()> {
            self.call("unpause".to_owned())
        }
        fn can_cancel(&self) -> bool {
            self.cancels
        }
        async fn cancel(&mut self) -> Result<()> {
            self.call("cancel".to_owned())
        }
        async fn load_job(&mut self, payload: JobPayload) -> Result<()> {
            let bytes = payload.into_bytes().await?;
            self.call(format!("job {}", String::from_utf8_lossy(&bytes)))
        }
        async fn send_unbuffered(&mut self, text: &str) -> Result<()> {
            self.call(format!("now {}", text))
        }
        async fn close(&mut self) {}
    }

    struct FakeDrivers(Arc<Calls>);

    #[async_trait]
    impl DriverFactory for FakeDrivers {
        async fn create(&self, _: &DeviceIdentity, _: &DeviceProfile) -> Result<Box<dyn Driver>> {
            Ok(Box::new(FakeDriver {
                calls: self.0.clone(),
                fail: false,
                cancels: true,
            }))
        }
    }

    fn context(dir: &std::path::Path, calls: Arc<Calls>) -> Arc<SessionContext> {
        let mut config = Config::default();
        config.cloud.offline = true;
        config.agent.loop_period_secs = 0.02;
        config.storage.dir = dir.to_owned();
        let profile = DeviceProfile::virtual_printer("AAAA", "BBBB");
        Arc::new(SessionContext {
            transport: TransportConfig::new("http://127.0.0.1:9".parse().unwrap()),
            config: Arc::new(config),
            profiles: Arc::new(ProfileBook::new([profile])),
            storage: Storage::new(dir),
            drivers: Arc::new(FakeDrivers(calls)),
            user_token: None,
        })
    }

    fn session(dir: &std::path::Path, fail: bool) -> (Session, Arc<Calls>) {
        let calls = Arc::new(Calls::default());
        let mut session = Session::new(context(dir, calls.clone()), DeviceIdentity::new("AAAA", "BBBB"));
        session.driver = Some(Box::new(FakeDriver {
            calls: calls.clone(),
            fail,
            cancels: true,
        }));
        (session, calls)
    }

    fn command(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_command_runs_once_per_number() -> TestResult {
        let dir = tempfile::tempdir()?;
        let (mut session, calls) = session(dir.path(), false);

        session.handle_reply(command(json!({"command": "pause", "number": 1}))).await;
        assert_eq!(session.ledger.outstanding(), Some(Ack { number: 1, result: true }));

        // Acknowledgment not delivered yet: the next command waits.
        session.handle_reply(command(json!({"command": "unpause", "number": 2}))).await;
        assert!(session.handle.errors.contains(codes::COMMAND_OUT_OF_ORDER));

        session.ledger.delivered();
        session.handle_reply(command(json!({"command": "pause", "number": 1}))).await;
        assert_eq!(session.ledger.outstanding(), Some(Ack { number: 1, result: true }));
        assert_eq!(*calls.0.lock(), vec!["pause".to_owned()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_command_is_acked_false() -> TestResult {
        let dir = tempfile::tempdir()?;
        let (mut session, calls) = session(dir.path(), false);

        session.handle_reply(command(json!({"command": "explode", "number": 7}))).await;
        assert!(session.handle.errors.contains(codes::UNKNOWN_COMMAND));
        assert_eq!(session.ledger.outstanding(), Some(Ack { number: 7, result: false }));
        assert!(calls.0.lock().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_number_is_reported() -> TestResult {
        let dir = tempfile::tempdir()?;
        let (mut session, _) = session(dir.path(), false);

        session.handle_reply(command(json!({"command": "pause"}))).await;
        assert!(session.handle.errors.contains(codes::BAD_COMMAND_NUMBER));
        assert_eq!(session.ledger.outstanding(), None);
        Ok(())
    }

    #[tokio::test]
    async fn test_local_mode_refuses_commands() -> TestResult {
        let dir = tempfile::tempdir()?;
        let (mut session, calls) = session(dir.path(), false);
        session.handle.local_mode.enable(Duration::from_secs(60));

        session.handle_reply(command(json!({"command": "cancel", "number": 3}))).await;
        assert!(session.handle.errors.contains(codes::LOCAL_MODE));
        assert_eq!(session.ledger.outstanding(), Some(Ack { number: 3, result: false }));
        assert!(calls.0.lock().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_command_is_reported() -> TestResult {
        let dir = tempfile::tempdir()?;
        let (mut session, _) = session(dir.path(), true);

        session.handle_reply(command(json!({"command": "cancel", "number": 4}))).await;
        assert!(session.handle.errors.contains(codes::COMMAND_FAILED));
        assert_eq!(session.ledger.outstanding(), Some(Ack { number: 4, result: false }));
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_without_support_is_reported() -> TestResult {
        let dir = tempfile::tempdir()?;
        let (mut session, calls) = session(dir.path(), false);
        session.driver = Some(Box::new(FakeDriver {
            calls: calls.clone(),
            fail: false,
            cancels: false,
        }));

        session.handle_reply(command(json!({"command": "cancel", "number": 5}))).await;
        assert!(session.handle.errors.contains(codes::CANCEL_UNSUPPORTED));
        assert!(!session.handle.errors.contains(codes::COMMAND_FAILED));
        assert_eq!(session.ledger.outstanding(), Some(Ack { number: 5, result: false }));
        assert!(calls.0.lock().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_gcodes_payload_forms() -> TestResult {
        let dir = tempfile::tempdir()?;
        let (mut session, calls) = session(dir.path(), false);

        // "G28\n" in base64.
        session.handle_reply(command(json!({"command": "gcodes", "number": 1, "payload": "RzI4Cg=="}))).await;
        session.ledger.delivered();
        session.handle_reply(command(json!({"command": "gcodes", "number": 2, "payload": "G1 X10\nG1 Y10"}))).await;

        assert_eq!(
            *calls.0.lock(),
            vec!["now G28\n".to_owned(), "job G1 X10\nG1 Y10".to_owned()]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_set_name_is_stored() -> TestResult {
        let dir = tempfile::tempdir()?;
        let (mut session, _) = session(dir.path(), false);

        session.handle_reply(command(json!({"command": "set_name", "number": 1, "payload": "Shelf"}))).await;
        assert_eq!(session.handle.snapshot().name.as_deref(), Some("Shelf"));
        assert_eq!(
            session.ctx.storage.load_device(&session.handle.id).await.name.as_deref(),
            Some("Shelf")
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_camera_toggle_queues_request() -> TestResult {
        let dir = tempfile::tempdir()?;
        let (mut session, _) = session(dir.path(), false);

        session.handle_message(SessionMessage::Camera(true)).await;
        assert_eq!(
            session.handle.take_request(),
            Some((CAMERA_CHANGE.to_owned(), json!(CAMERA_ON)))
        );
        // Same value again is not a change.
        session.handle_message(SessionMessage::Camera(true)).await;
        assert_eq!(session.handle.take_request(), None);
        Ok(())
    }

    #[tokio::test]
    async fn test_cancelled_download_is_announced() -> TestResult {
        let dir = tempfile::tempdir()?;
        let (mut session, _) = session(dir.path(), false);

        session.handle_message(SessionMessage::DownloadCancelled).await;
        assert_eq!(session.forced, Some(ForcedState::Cancel));
        let event = session.handle.take_event().unwrap_or_default();
        assert_eq!(event["event"], "download_cancelled");
        Ok(())
    }

    #[tokio::test]
    async fn test_offline_session_reaches_ready() -> TestResult {
        let dir = tempfile::tempdir()?;
        let calls = Arc::new(Calls::default());
        let (handle, task) = spawn(context(dir.path(), calls), DeviceIdentity::new("AAAA", "BBBB"));

        let ready = async {
            while handle.snapshot().state != SessionState::Ready {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), ready).await?;
        assert_eq!(handle.snapshot().profile.as_deref(), Some("virtual"));

        handle.stop();
        tokio::time::timeout(Duration::from_secs(5), task).await??;
        Ok(())
    }
}
