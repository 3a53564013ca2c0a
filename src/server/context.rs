use std::sync::Arc;

use cloudapi::{ErrorSink, Request, Transport, TransportConfig};
use serde_json::{Map, Value};

use crate::{discover::StaticDetector, orchestrator::Sessions, session::SessionHandle, Config};

/**
 * Application-specific context (state shared by handler functions)
 */
pub struct Context {
    /// Agent configuration.
    pub config: Arc<Config>,
    /// Live sessions, as published by the orchestrator.
    pub sessions: Sessions,
    /// The static detector, whose stored list the API edits.
    pub static_printers: Arc<StaticDetector>,
    /// How to reach the remote service for proxied job requests.
    pub transport: TransportConfig,
}

impl Context {
    /// Find a live session by its id string.
    pub fn find_session(&self, id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.read().iter().find(|h| h.id == id).cloned()
    }

    /// Send `request` on behalf of `session` over a dedicated connection.
    /// Transport errors land in the session's error book. Gives up with
    /// `None` once the relay timeout passes or the session stops.
    pub async fn proxy(&self, session: &SessionHandle, request: Request) -> Option<Map<String, Value>> {
        let sink: Arc<dyn ErrorSink> = session.errors.clone();
        let cancel = session.cancel_token().child_token();
        let mut transport = Transport::new(self.transport.clone(), sink, cancel.clone());
        let timeout = self.config.api.relay_timeout();
        let reply = match tokio::time::timeout(timeout, transport.pack_and_send(&request, Map::new())).await {
            Ok(reply) => reply,
            Err(_) => {
                tracing::warn!(
                    id = session.id.as_str(),
                    timeout = format!("{:?}", timeout),
                    "remote service did not answer relayed request"
                );
                None
            }
        };
        cancel.cancel();
        transport.close();
        reply
    }
}
