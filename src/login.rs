//! User login. Sessions register devices on behalf of a user, so the agent
//! needs a user token before any session starts.

use std::{sync::Arc, time::Duration};

use anyhow::{bail, Result};
use cloudapi::{codes, ErrorSink, Login, Request, Severity, Transport, TransportConfig};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::{
    storage::{AuthRecord, Storage},
    Config, DeviceProfile,
};

const RETRY_PAUSE: Duration = Duration::from_secs(2);

/// A logged in user.
#[derive(Clone, Debug, PartialEq)]
pub struct UserSession {
    /// Token sessions register devices with.
    pub user_token: String,
    /// Login name, when known.
    pub login: Option<String>,
    /// Device-type profiles the service sent along, if any.
    pub profiles: Vec<DeviceProfile>,
}

/// Why a login reply was not accepted.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum LoginError {
    /// The service refused the credentials.
    #[error("login rejected ({code}): {message}")]
    Rejected {
        /// Error code sent by the service.
        code: i64,
        /// Error message sent by the service.
        message: String,
    },

    /// The reply carried no token.
    #[error("server returned empty user token")]
    NoToken,
}

/// Transport failures during login have no session to go to; they are
/// logged.
struct LogSink;

impl ErrorSink for LogSink {
    fn report(&self, code: u32, message: String, severity: Severity) {
        tracing::warn!(code, severity = severity.to_string(), "login transport error: {}", message);
    }
}

fn parse_profiles(value: &Value) -> Vec<DeviceProfile> {
    let list = match value {
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::error!(error = e.to_string(), "server sent invalid printer profiles, not json");
                return Vec::new();
            }
        },
        other => other.clone(),
    };
    let Value::Array(list) = list else {
        tracing::error!("server sent invalid printer profiles, not a list");
        return Vec::new();
    };
    list.iter()
        .filter_map(|profile| match DeviceProfile::from_server(profile) {
            Ok(profile) => Some(profile),
            Err(e) => {
                tracing::warn!(error = format!("{:#}", e), profile = profile.to_string(), "invalid profile");
                None
            }
        })
        .collect()
}

/// Interpret a reply to a user login.
pub fn parse_login(reply: &Map<String, Value>, login: Option<&str>) -> Result<UserSession, LoginError> {
    if let Some(settings_mod) = reply.get("settings_mod").filter(|v| !v.is_null()) {
        tracing::info!(settings_mod = settings_mod.to_string(), "ignoring server's settings changes");
    }

    if let Some(error) = reply.get("error").filter(|v| !v.is_null()) {
        return Err(LoginError::Rejected {
            code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .map_or_else(|| error.to_string(), str::to_owned),
        });
    }

    let user_token = reply
        .get("user_token")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .ok_or(LoginError::NoToken)?;
    let login = login
        .map(str::to_owned)
        .or_else(|| reply.get("user_login").and_then(Value::as_str).map(str::to_owned));
    let profiles = reply.get("all_profiles").map(parse_profiles).unwrap_or_default();
    if !profiles.is_empty() {
        tracing::info!(count = profiles.len(), "received printer profiles");
    }

    Ok(UserSession {
        user_token: user_token.to_owned(),
        login,
        profiles,
    })
}

/// Log in: the saved token if there is one, else the configured
/// credentials, retried until the service answers. Returns `None` if
/// cancelled first.
pub async fn login(
    config: &Config,
    storage: &Storage,
    transport: TransportConfig,
    cancel: CancellationToken,
) -> Result<Option<UserSession>> {
    let saved = storage.load_auth().await;
    if let Some(user_token) = saved.user_token {
        tracing::info!(login = ?saved.login, "using saved login");
        return Ok(Some(UserSession {
            user_token,
            login: saved.login,
            profiles: Vec::new(),
        }));
    }

    let (Some(user), Some(password)) = (config.auth.login.clone(), config.auth.password.clone()) else {
        bail!("no saved login and no credentials configured");
    };

    let sink: Arc<dyn ErrorSink> = Arc::new(LogSink);
    let mut transport = Transport::new(transport, sink, cancel.clone());
    loop {
        if cancel.is_cancelled() {
            return Ok(None);
        }

        let request = Request::UserLogin {
            login: Login {
                user: user.clone(),
                password: password.clone(),
                disposable_token: None,
            },
            platform: std::env::consts::OS.to_owned(),
            host_mac: None,
            local_ip: transport.local_ip().map(|ip| ip.to_string()),
            version: crate::VERSION.to_owned(),
        };

        if let Some(reply) = transport.pack_and_send(&request, Map::new()).await {
            match parse_login(&reply, Some(&user)) {
                Ok(session) => {
                    tracing::info!(login = user.as_str(), "successful login");
                    storage
                        .save_auth(&AuthRecord {
                            user_token: Some(session.user_token.clone()),
                            login: session.login.clone(),
                        })
                        .await?;
                    return Ok(Some(session));
                }
                Err(LoginError::Rejected { code, message }) if code == i64::from(codes::LOGIN_REJECTED) => {
                    storage.clear_auth().await?;
                    bail!("login rejected: {}", message);
                }
                Err(e) => tracing::warn!(error = e.to_string(), "login failed"),
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            _ = tokio::time::sleep(RETRY_PAUSE) => {}
        }
    }
}
