//! Error bookkeeping for one session.
//!
//! Records are deduplicated by code while outstanding, delivered
//! independently to each requester, and dropped once every requester has
//! seen them or once they outlive the forget timeout.

use std::{
    collections::{HashSet, VecDeque},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use cloudapi::{ErrorSink, Severity};
use parking_lot::Mutex;
use parse_display::{Display, FromStr};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Who an error is delivered to.
#[derive(Copy, Clone, Debug, Display, FromStr, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[display(style = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Requester {
    /// The remote control service, via the status poll.
    Remote,
    /// The local status API.
    Local,
}

/// An error as delivered to a requester.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
pub struct ErrorReport {
    /// Numeric code.
    pub code: u32,
    /// Human readable message.
    pub message: String,
    /// Whether the error forces the error state.
    pub is_blocking: bool,
    /// Whether the error is purely informational.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_info: bool,
    /// When the error was last raised.
    pub timestamp: DateTime<Utc>,
}

struct ErrorRecord {
    id: u64,
    code: u32,
    message: String,
    severity: Severity,
    raised: Instant,
    timestamp: DateTime<Utc>,
    delivered: HashSet<Requester>,
}

impl ErrorRecord {
    fn report(&self) -> ErrorReport {
        ErrorReport {
            code: self.code,
            message: self.message.clone(),
            is_blocking: self.severity != Severity::Info,
            is_info: self.severity == Severity::Info,
            timestamp: self.timestamp,
        }
    }
}

#[derive(Default)]
struct Inner {
    records: VecDeque<ErrorRecord>,
    requesters: HashSet<Requester>,
    next_id: u64,
}

impl Inner {
    fn forget_expired(&mut self, forget_after: Duration) {
        let now = Instant::now();
        self.records
            .retain(|r| now.saturating_duration_since(r.raised) <= forget_after);
    }
}

/// Errors collected by [ErrorBook::pending_for], to be passed back to
/// [ErrorBook::mark_delivered] once the send succeeded.
#[derive(Clone, Debug, Default)]
pub struct PendingErrors {
    ids: Vec<u64>,
    severities: Vec<Severity>,
    /// Reports to deliver.
    pub reports: Vec<ErrorReport>,
}

impl PendingErrors {
    /// Whether there is nothing to deliver.
    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }

    /// Whether any of these errors is at least blocking.
    pub fn has_blocking(&self) -> bool {
        self.severities.iter().any(|s| *s != Severity::Info)
    }

    /// Whether any of these errors is critical.
    pub fn has_critical(&self) -> bool {
        self.severities.contains(&Severity::Critical)
    }
}

/// Bounded set of outstanding errors for one session.
pub struct ErrorBook {
    inner: Mutex<Inner>,
    forget_after: Duration,
    capacity: usize,
}

impl ErrorBook {
    /// An empty book.
    pub fn new(forget_after: Duration, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            forget_after,
            capacity: capacity.max(1),
        }
    }

    /// Record an error. A code that is already outstanding has its message
    /// and timestamp refreshed, and is due again for every requester.
    pub fn register(&self, code: u32, message: String, severity: Severity) {
        tracing::warn!(code = code, severity = severity.to_string(), "error N{}. {}", code, message);

        let mut inner = self.inner.lock();
        inner.forget_expired(self.forget_after);

        if let Some(record) = inner.records.iter_mut().find(|r| r.code == code) {
            record.raised = Instant::now();
            record.timestamp = Utc::now();
            record.message = message;
            record.delivered.clear();
            return;
        }

        let id = inner.next_id;
        inner.next_id += 1;
        inner.records.push_back(ErrorRecord {
            id,
            code,
            message,
            severity,
            raised: Instant::now(),
            timestamp: Utc::now(),
            delivered: HashSet::new(),
        });
        while inner.records.len() > self.capacity {
            inner.records.pop_front();
        }
    }

    /// Errors `requester` has not seen yet. Registers the requester, so
    /// records are only dropped once it has seen them too.
    pub fn pending_for(&self, requester: Requester) -> PendingErrors {
        let mut inner = self.inner.lock();
        inner.forget_expired(self.forget_after);
        inner.requesters.insert(requester);

        let mut pending = PendingErrors::default();
        for record in inner.records.iter().filter(|r| !r.delivered.contains(&requester)) {
            pending.ids.push(record.id);
            pending.severities.push(record.severity);
            pending.reports.push(record.report());
        }
        pending
    }

    /// Mark errors as delivered to `requester`, then drop every record that
    /// all requesters have seen and that was last raised before `sent_at`.
    /// A record raised again after `sent_at` stays due.
    pub fn mark_delivered(&self, requester: Requester, pending: &PendingErrors, sent_at: Instant) {
        let mut inner = self.inner.lock();
        for record in inner.records.iter_mut() {
            if pending.ids.contains(&record.id) && record.raised <= sent_at {
                record.delivered.insert(requester);
            }
        }

        let requesters = inner.requesters.clone();
        inner
            .records
            .retain(|r| !(requesters.is_subset(&r.delivered) && r.raised <= sent_at));
        inner.forget_expired(self.forget_after);
    }

    /// Whether an error of at least blocking severity has not reached
    /// `requester` yet.
    pub fn has_undelivered_blocking(&self, requester: Requester) -> bool {
        let mut inner = self.inner.lock();
        inner.forget_expired(self.forget_after);
        inner
            .records
            .iter()
            .any(|r| r.severity != Severity::Info && !r.delivered.contains(&requester))
    }

    /// Whether any error with this code is outstanding.
    pub fn contains(&self, code: u32) -> bool {
        self.inner.lock().records.iter().any(|r| r.code == code)
    }

    /// Drop every record. Used on a fresh connection.
    pub fn clear(&self) {
        self.inner.lock().records.clear();
    }

    /// Number of outstanding records.
    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    /// Whether no records are outstanding.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ErrorSink for ErrorBook {
    fn report(&self, code: u32, message: String, severity: Severity) {
        self.register(code, message, severity);
    }
}
