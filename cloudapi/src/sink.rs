use parse_display::{Display, FromStr};
use serde::{Deserialize, Serialize};

/// How an error affects the session that raised it.
#[derive(Copy, Clone, Debug, Deserialize, Serialize, Display, FromStr, PartialEq, Eq, Hash)]
#[display(style = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Cosmetic; never changes state.
    Info,
    /// Forces the session into the error state, usually followed by a
    /// reconnect.
    Blocking,
    /// Forces an immediate session restart.
    Critical,
}

/// Receiver for errors raised inside components that never return errors
/// to their caller.
pub trait ErrorSink: Send + Sync {
    /// Record an error.
    fn report(&self, code: u32, message: String, severity: Severity);
}
