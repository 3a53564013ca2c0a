//! The top-level loop: reconcile what discovery reports with the sessions
//! that are running, and keep an eye on the workers.

use std::{sync::Arc, time::Instant};

use cloudapi::{codes, Severity};
use futures::future::join_all;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    discover::{Candidate, Discovery},
    session::{self, SessionContext, SessionHandle},
    DeviceIdentity,
};

/// Handles of the running sessions, shared with the local API.
pub type Sessions = Arc<RwLock<Vec<Arc<SessionHandle>>>>;

struct RunningSession {
    handle: Arc<SessionHandle>,
    task: JoinHandle<()>,
}

struct Stopping {
    handle: Arc<SessionHandle>,
    task: JoinHandle<()>,
    deadline: Instant,
}

/// Owns every session worker.
pub struct Orchestrator {
    ctx: Arc<SessionContext>,
    discovery: Discovery,
    running: Vec<RunningSession>,
    stopping: Vec<Stopping>,
    sessions: Sessions,
    last_heartbeat: Option<Instant>,
}

impl Orchestrator {
    /// Orchestrator starting sessions with `ctx` for what `discovery` reports.
    pub fn new(ctx: Arc<SessionContext>, discovery: Discovery) -> Self {
        Self {
            ctx,
            discovery,
            running: Vec::new(),
            stopping: Vec::new(),
            sessions: Arc::default(),
            last_heartbeat: None,
        }
    }

    /// The live session list.
    pub fn sessions(&self) -> Sessions {
        self.sessions.clone()
    }

    /// Run until `cancel` fires, then stop every session.
    pub async fn run(mut self, cancel: CancellationToken) {
        let period = self.ctx.config.agent.discovery_period();
        tracing::info!(detectors = self.discovery.names().join(","), "orchestrator started");
        loop {
            self.tick().await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(period) => {}
            }
        }
        self.shutdown().await;
    }

    /// One discovery poll and reconciliation.
    pub async fn tick(&mut self) {
        let candidates = self.discovery.poll().await;
        self.reconcile(candidates);
        self.reap().await;
        self.housekeeping();
    }

    fn reconcile(&mut self, candidates: Vec<Candidate>) {
        let join_timeout = self.ctx.config.agent.join_timeout();
        let mut kept = Vec::new();

        for session in std::mem::take(&mut self.running) {
            let found = candidates
                .iter()
                .find(|c| c.identity.is_same_device(&session.handle.identity));
            let reason = match found {
                _ if session.task.is_finished() => None,
                None => Some((codes::NOT_DETECTED, "Printer is no longer detected")),
                Some(c) if c.disabled => Some((codes::DISABLED, "Printer was disabled")),
                Some(_) => {
                    kept.push(session);
                    continue;
                }
            };

            if let Some((code, message)) = reason {
                tracing::info!(id = session.handle.id.as_str(), code, "stopping session: {}", message);
                session.handle.errors.register(code, message.to_owned(), Severity::Critical);
            } else {
                tracing::warn!(id = session.handle.id.as_str(), "session exited on its own");
            }
            session.handle.stop();
            self.stopping.push(Stopping {
                handle: session.handle,
                task: session.task,
                deadline: Instant::now() + join_timeout,
            });
        }
        self.running = kept;

        for candidate in candidates {
            if candidate.disabled {
                continue;
            }
            if self.is_known(&candidate.identity) {
                continue;
            }
            tracing::info!(identity = candidate.identity.to_string(), "starting session");
            let (handle, task) = session::spawn(self.ctx.clone(), candidate.identity);
            self.running.push(RunningSession { handle, task });
        }

        self.publish();
    }

    /// A device whose previous session is still winding down gets a new one
    /// only after the old one exited.
    fn is_known(&self, identity: &DeviceIdentity) -> bool {
        self.running
            .iter()
            .map(|s| &s.handle)
            .chain(self.stopping.iter().map(|s| &s.handle))
            .any(|handle| handle.identity.is_same_device(identity))
    }

    fn publish(&self) {
        *self.sessions.write() = self.running.iter().map(|s| s.handle.clone()).collect();
    }

    async fn reap(&mut self) {
        let now = Instant::now();
        let mut waiting = Vec::new();
        for stopping in std::mem::take(&mut self.stopping) {
            if stopping.task.is_finished() {
                if let Err(e) = stopping.task.await {
                    tracing::error!(id = stopping.handle.id.as_str(), error = format!("{:?}", e), "session worker panicked");
                }
            } else if now >= stopping.deadline {
                tracing::error!(id = stopping.handle.id.as_str(), "session worker did not exit in time, abandoning it");
                stopping.task.abort();
            } else {
                waiting.push(stopping);
            }
        }
        self.stopping = waiting;
    }

    fn housekeeping(&mut self) {
        let workers = self.running.len() + self.stopping.len();
        let threshold = self.ctx.config.agent.worker_warning_threshold;
        if workers > threshold {
            tracing::warn!(workers, threshold, "unusually many session workers");
        }

        let due = self
            .last_heartbeat
            .map_or(true, |last| last.elapsed() >= self.ctx.config.agent.heartbeat());
        if due {
            self.last_heartbeat = Some(Instant::now());
            tracing::info!(
                time = chrono::Local::now().to_rfc3339(),
                sessions = self.running.len(),
                workers,
                "heartbeat"
            );
        }
    }

    async fn shutdown(&mut self) {
        let timeout = self.ctx.config.agent.join_timeout();
        let running = std::mem::take(&mut self.running);
        let stopping = std::mem::take(&mut self.stopping);
        self.publish();

        let tasks: Vec<_> = running
            .into_iter()
            .map(|s| (s.handle, s.task))
            .chain(stopping.into_iter().map(|s| (s.handle, s.task)))
            .map(|(handle, task)| {
                handle.stop();
                async move {
                    let abort = task.abort_handle();
                    match tokio::time::timeout(timeout, task).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            tracing::error!(id = handle.id.as_str(), error = format!("{:?}", e), "session worker panicked")
                        }
                        Err(_) => {
                            tracing::error!(id = handle.id.as_str(), "session worker did not exit in time, abandoning it");
                            abort.abort();
                        }
                    }
                }
            })
            .collect();
        tracing::info!(sessions = tasks.len(), "stopping sessions");
        join_all(tasks).await;
    }
}
