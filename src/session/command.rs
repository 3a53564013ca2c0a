//! The closed set of commands the remote service may issue, and the ledger
//! enforcing one outstanding command at a time.

use cloudapi::Ack;
use parse_display::{Display, FromStr};

/// Every command a session executes. Anything else is rejected before
/// dispatch.
#[derive(Copy, Clone, Debug, Display, FromStr, PartialEq, Eq)]
#[display(style = "snake_case")]
pub enum CommandName {
    /// Load a job, inline or from a link.
    Gcodes,
    /// Send commands straight to the device.
    UnbufferedGcodes,
    /// Pause the running job.
    Pause,
    /// Resume a paused job.
    Unpause,
    /// Cancel the running job or download.
    Cancel,
    /// Rename the device.
    SetName,
    /// Enable or disable the camera.
    SwitchCamera,
    /// Forget the device type and register again.
    ResetPrinterType,
}

impl CommandName {
    /// Whether this command accepts a payload given as a link.
    pub fn accepts_link(&self) -> bool {
        matches!(self, CommandName::Gcodes)
    }
}

/// Reasons a command number is refused.
#[derive(Copy, Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum LedgerError {
    /// A new command arrived before the previous acknowledgment went out.
    #[error("command {number} received while the acknowledgment of command {outstanding} is outstanding")]
    AckOutstanding {
        /// Number of the refused command.
        number: i64,
        /// Number still awaiting acknowledgment.
        outstanding: i64,
    },

    /// The command is older than the last one executed.
    #[error("command {number} is older than the last command {last}")]
    OutOfOrder {
        /// Number of the refused command.
        number: i64,
        /// Number of the last command.
        last: i64,
    },
}

/// How an accepted command number should be handled.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Admission {
    /// New command; execute it.
    Fresh,
    /// Repeat of the last command; resend its acknowledgment without
    /// executing it again.
    Repeat(Ack),
}

/// Tracks command numbers and acknowledgments for one session.
#[derive(Clone, Debug, Default)]
#[allow(missing_copy_implementations)]
pub struct CommandLedger {
    last: Option<Ack>,
    outstanding: Option<Ack>,
}

impl CommandLedger {
    /// Decide whether command `number` may run.
    pub fn admit(&self, number: i64) -> Result<Admission, LedgerError> {
        if let Some(outstanding) = self.outstanding {
            return Err(LedgerError::AckOutstanding {
                number,
                outstanding: outstanding.number,
            });
        }
        match self.last {
            Some(last) if last.number == number => Ok(Admission::Repeat(last)),
            Some(last) if number < last.number => Err(LedgerError::OutOfOrder {
                number,
                last: last.number,
            }),
            _ => Ok(Admission::Fresh),
        }
    }

    /// Record the result of an executed command; its acknowledgment goes out
    /// with the next send.
    pub fn record(&mut self, ack: Ack) {
        self.last = Some(ack);
        self.outstanding = Some(ack);
    }

    /// Acknowledge a command as failed without executing it.
    pub fn reject(&mut self, number: i64) {
        let ack = Ack { number, result: false };
        if self.last.is_none_or(|last| number > last.number) {
            self.last = Some(ack);
        }
        self.outstanding = Some(ack);
    }

    /// Queue the acknowledgment of a repeated command again.
    pub fn resend(&mut self, ack: Ack) {
        self.outstanding = Some(ack);
    }

    /// Acknowledgment to attach to the next send.
    pub fn outstanding(&self) -> Option<Ack> {
        self.outstanding
    }

    /// The outstanding acknowledgment reached the server.
    pub fn delivered(&mut self) {
        self.outstanding = None;
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_command_names() {
        assert_eq!("unbuffered_gcodes".parse::<CommandName>().ok(), Some(CommandName::UnbufferedGcodes));
        assert_eq!(CommandName::ResetPrinterType.to_string(), "reset_printer_type");
        assert!("__init__".parse::<CommandName>().is_err());
        assert!("close".parse::<CommandName>().is_err());
        assert!(CommandName::Gcodes.accepts_link());
        assert!(!CommandName::Pause.accepts_link());
    }

    #[test]
    fn test_second_command_before_ack_is_rejected() {
        let mut ledger = CommandLedger::default();
        assert_eq!(ledger.admit(1), Ok(Admission::Fresh));
        ledger.record(Ack { number: 1, result: true });

        assert_eq!(
            ledger.admit(2),
            Err(LedgerError::AckOutstanding {
                number: 2,
                outstanding: 1
            })
        );

        assert_eq!(ledger.outstanding(), Some(Ack { number: 1, result: true }));
        ledger.delivered();
        assert_eq!(ledger.outstanding(), None);
        assert_eq!(ledger.admit(2), Ok(Admission::Fresh));
    }

    #[test]
    fn test_old_numbers_are_rejected_and_repeats_resent() {
        let mut ledger = CommandLedger::default();
        ledger.record(Ack { number: 5, result: true });
        ledger.delivered();

        assert_eq!(ledger.admit(4), Err(LedgerError::OutOfOrder { number: 4, last: 5 }));
        assert_eq!(ledger.admit(5), Ok(Admission::Repeat(Ack { number: 5, result: true })));

        ledger.reject(4);
        assert_eq!(ledger.outstanding(), Some(Ack { number: 4, result: false }));
        ledger.delivered();
        // Rejecting an old number does not move the ledger backwards.
        assert_eq!(ledger.admit(5), Ok(Admission::Repeat(Ack { number: 5, result: true })));
    }
}
