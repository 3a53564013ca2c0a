use std::{collections::VecDeque, sync::Arc, time::Duration};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{errors::ErrorBook, local_mode::LocalMode, state::SessionState};
use crate::{DeviceIdentity, JobPayload};

/// Messages other workers send to a running session.
#[derive(Debug)]
pub enum SessionMessage {
    /// An external actor picked the device-type profile.
    SelectProfile(String),
    /// The operator toggled the camera.
    Camera(bool),
    /// A download finished; hand the payload to the driver.
    DownloadFinished(JobPayload),
    /// A download was cancelled.
    DownloadCancelled,
}

/// Point-in-time view of a session, for the local status API.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct SessionSnapshot {
    /// Sanitized identity string.
    pub id: String,
    /// Device identity.
    pub identity: DeviceIdentity,
    /// Last reported state.
    pub state: SessionState,
    /// Alias of the resolved device-type profile.
    pub profile: Option<String>,
    /// Profiles to choose from while a selection is pending.
    pub printer_types: Vec<String>,
    /// Name given by the remote service.
    pub name: Option<String>,
    /// Job or download progress.
    pub percent: Option<f64>,
    /// Whether local mode is on.
    pub local_mode: bool,
}

/// The part of a session other workers may touch. Every field is guarded
/// by its own lock; none is held across an await.
pub struct SessionHandle {
    /// Device this session serves.
    pub identity: DeviceIdentity,
    /// Sanitized identity string.
    pub id: String,
    /// Outstanding errors.
    pub errors: Arc<ErrorBook>,
    /// Local mode flag and timer.
    pub local_mode: LocalMode,
    requests: DashMap<String, Value>,
    events: Mutex<VecDeque<Map<String, Value>>>,
    snapshot: RwLock<SessionSnapshot>,
    auth_token: RwLock<Option<String>>,
    inbox: mpsc::UnboundedSender<SessionMessage>,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub(crate) fn new(
        identity: DeviceIdentity,
        errors: Arc<ErrorBook>,
        inbox: mpsc::UnboundedSender<SessionMessage>,
    ) -> Self {
        let id = identity.id_string();
        Self {
            snapshot: RwLock::new(SessionSnapshot {
                id: id.clone(),
                identity: identity.clone(),
                state: SessionState::Connecting,
                profile: None,
                printer_types: Vec::new(),
                name: None,
                percent: None,
                local_mode: false,
            }),
            identity,
            id,
            errors,
            local_mode: LocalMode::default(),
            requests: DashMap::new(),
            events: Mutex::new(VecDeque::new()),
            auth_token: RwLock::new(None),
            inbox,
            cancel: CancellationToken::new(),
        }
    }

    /// Queue an out-of-band request for the next send. A later request with
    /// the same key replaces an unsent one.
    pub fn queue_request(&self, key: &str, value: Value) {
        self.requests.insert(key.to_owned(), value);
    }

    pub(crate) fn take_request(&self) -> Option<(String, Value)> {
        let key = self.requests.iter().next().map(|entry| entry.key().clone())?;
        self.requests.remove(&key)
    }

    /// Put back a request that was not delivered, unless a newer one with
    /// the same key was queued meanwhile.
    pub(crate) fn requeue_request(&self, key: String, value: Value) {
        self.requests.entry(key).or_insert(value);
    }

    /// Queue an event to merge into a future report. `name` goes in the
    /// `event` field, next to `fields`.
    pub fn push_event(&self, name: &str, mut fields: Map<String, Value>) {
        tracing::debug!(id = self.id.as_str(), event = name, "event queued");
        fields.insert("event".to_owned(), Value::String(name.to_owned()));
        self.events.lock().push_back(fields);
    }

    pub(crate) fn take_event(&self) -> Option<Map<String, Value>> {
        self.events.lock().pop_front()
    }

    pub(crate) fn requeue_event(&self, event: Map<String, Value>) {
        self.events.lock().push_front(event);
    }

    /// Turn local mode on for `duration`, or off when `None`, and let the
    /// remote service know.
    pub fn set_local_mode(&self, duration: Option<Duration>) {
        let mut fields = Map::new();
        match duration {
            Some(duration) => {
                self.local_mode.enable(duration);
                fields.insert("enabled".to_owned(), json!(true));
                fields.insert("duration_secs".to_owned(), json!(duration.as_secs()));
            }
            None => {
                self.local_mode.disable();
                fields.insert("enabled".to_owned(), json!(false));
            }
        }
        self.push_event("local_mode", fields);
    }

    /// Deliver a message to the session. Returns false once it exited.
    pub fn send(&self, message: SessionMessage) -> bool {
        self.inbox.send(message).is_ok()
    }

    /// Current view of the session.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.read().clone()
    }

    pub(crate) fn update_snapshot(&self, f: impl FnOnce(&mut SessionSnapshot)) {
        f(&mut self.snapshot.write());
    }

    /// Device token from the last registration.
    pub fn auth_token(&self) -> Option<String> {
        self.auth_token.read().clone()
    }

    pub(crate) fn set_auth_token(&self, token: Option<String>) {
        *self.auth_token.write() = token;
    }

    /// Ask the session to stop.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Whether a stop was requested.
    pub fn is_stopping(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn handle() -> SessionHandle {
        let (tx, _rx) = mpsc::unbounded_channel();
        SessionHandle::new(
            DeviceIdentity::new("A", "B").with_serial("C"),
            Arc::new(ErrorBook::new(Duration::from_secs(60), 8)),
            tx,
        )
    }

    #[test]
    fn test_requests_one_at_a_time() {
        let handle = handle();
        handle.queue_request("camera_change", json!("Dual camera"));
        handle.queue_request("reset_printer_type", json!(true));

        let first = handle.take_request().unwrap();
        let second = handle.take_request().unwrap();
        assert_ne!(first.0, second.0);
        assert!(handle.take_request().is_none());

        handle.queue_request("camera_change", json!("Disable camera"));
        handle.requeue_request("camera_change".to_owned(), json!("Dual camera"));
        assert_eq!(handle.take_request(), Some(("camera_change".to_owned(), json!("Disable camera"))));
    }

    #[test]
    fn test_requeued_event_goes_first() {
        let handle = handle();
        handle.push_event("a", Map::new());
        handle.push_event("b", Map::new());
        let first = handle.take_event().unwrap();
        assert_eq!(first["event"], "a");
        handle.requeue_event(first.clone());
        assert_eq!(handle.take_event(), Some(first));
    }

    #[tokio::test]
    async fn test_local_mode_queues_event() {
        let handle = handle();
        handle.set_local_mode(Some(Duration::from_secs(60)));
        assert!(handle.local_mode.is_enabled());
        handle.set_local_mode(None);
        assert!(!handle.local_mode.is_enabled());

        assert_eq!(
            handle.take_event(),
            Some(Map::from_iter([
                ("enabled".to_owned(), json!(true)),
                ("duration_secs".to_owned(), json!(60)),
                ("event".to_owned(), json!("local_mode")),
            ]))
        );
        assert_eq!(
            handle.take_event(),
            Some(Map::from_iter([
                ("enabled".to_owned(), json!(false)),
                ("event".to_owned(), json!("local_mode")),
            ]))
        );
        assert_eq!(handle.take_event(), None);
    }

    #[test]
    fn test_snapshot_defaults() {
        let handle = handle();
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.id, "A_B_C");
        assert_eq!(snapshot.state, SessionState::Connecting);
        assert!(!handle.is_stopping());
        handle.stop();
        assert!(handle.is_stopping());
    }
}
