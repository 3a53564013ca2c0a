//! Session states. The reported state is derived on every tick from driver
//! queries and an optional forced override; it is never stored redundantly.

use parse_display::{Display, FromStr};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// State reported to the remote service.
#[derive(Copy, Clone, Debug, Display, FromStr, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[display(style = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Trying to reach the server or the device.
    Connecting,
    /// Idle and accepting jobs.
    Ready,
    /// Running a job.
    Printing,
    /// Job paused.
    Paused,
    /// Fetching a job.
    Downloading,
    /// Operator has taken local control.
    LocalMode,
    /// Waiting for the bed to be cleared.
    BedNotClear,
    /// A blocking error is outstanding.
    Error,
    /// A job was just cancelled. Reported once.
    Cancel,
}

/// Override that wins over the derived state until cleared.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ForcedState {
    /// Set while a blocking error is outstanding.
    Error,
    /// Set for one report after a cancel.
    Cancel,
}

impl From<ForcedState> for SessionState {
    fn from(forced: ForcedState) -> Self {
        match forced {
            ForcedState::Error => SessionState::Error,
            ForcedState::Cancel => SessionState::Cancel,
        }
    }
}

/// What the driver said this tick.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DriverStatus {
    /// Connected and responsive.
    pub operational: bool,
    /// Running a job.
    pub printing: bool,
    /// Job paused.
    pub paused: bool,
    /// Bed is clear.
    pub bed_clear: bool,
}

/// Everything the state is derived from.
#[derive(Copy, Clone, Debug, Default)]
pub struct StateInputs {
    /// Active override.
    pub forced: Option<ForcedState>,
    /// `None` while no driver is held.
    pub driver: Option<DriverStatus>,
    /// A download is running.
    pub downloading: bool,
    /// Local mode is on.
    pub local_mode: bool,
}

/// Derive the state. A forced state always wins.
pub fn derive_state(inputs: &StateInputs) -> SessionState {
    if let Some(forced) = inputs.forced {
        return forced.into();
    }
    let Some(driver) = inputs.driver else {
        return SessionState::Connecting;
    };

    if !driver.operational {
        SessionState::Connecting
    } else if driver.paused {
        SessionState::Paused
    } else if inputs.downloading {
        SessionState::Downloading
    } else if driver.printing {
        SessionState::Printing
    } else if !driver.bed_clear {
        SessionState::BedNotClear
    } else if inputs.local_mode {
        SessionState::LocalMode
    } else {
        SessionState::Ready
    }
}

/// Percent below which leaving `printing` counts as a cancel.
const CANCEL_THRESHOLD: f64 = 99.0;

/// Spots jobs that stopped without finishing.
#[derive(Clone, Debug, Default)]
#[allow(missing_copy_implementations)]
pub struct CancelDetector {
    last: Option<(SessionState, f64)>,
}

impl CancelDetector {
    /// Feed the state and percent of this tick; returns whether the job
    /// was cancelled since the previous tick.
    pub fn observe(&mut self, state: SessionState, percent: f64) -> bool {
        let cancelled = match self.last {
            Some((SessionState::Printing, previous)) => {
                !matches!(state, SessionState::Printing | SessionState::Paused)
                    && previous > 0.0
                    && previous < 100.0
                    && percent < CANCEL_THRESHOLD
            }
            _ => false,
        };
        self.last = Some((state, percent));
        cancelled
    }

    /// Forget history, e.g. after a reconnect.
    pub fn reset(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn operational() -> DriverStatus {
        DriverStatus {
            operational: true,
            bed_clear: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_forced_state_wins() {
        let inputs = StateInputs {
            forced: Some(ForcedState::Error),
            driver: Some(DriverStatus {
                printing: true,
                ..operational()
            }),
            ..Default::default()
        };
        assert_eq!(derive_state(&inputs), SessionState::Error);
    }

    #[test]
    fn test_derived_order() {
        let mut inputs = StateInputs::default();
        assert_eq!(derive_state(&inputs), SessionState::Connecting);

        inputs.driver = Some(DriverStatus::default());
        assert_eq!(derive_state(&inputs), SessionState::Connecting);

        inputs.driver = Some(operational());
        assert_eq!(derive_state(&inputs), SessionState::Ready);

        inputs.local_mode = true;
        assert_eq!(derive_state(&inputs), SessionState::LocalMode);

        inputs.driver = Some(DriverStatus {
            bed_clear: false,
            ..operational()
        });
        assert_eq!(derive_state(&inputs), SessionState::BedNotClear);

        inputs.driver = Some(DriverStatus {
            printing: true,
            ..operational()
        });
        assert_eq!(derive_state(&inputs), SessionState::Printing);

        inputs.downloading = true;
        assert_eq!(derive_state(&inputs), SessionState::Downloading);

        inputs.driver = Some(DriverStatus {
            printing: true,
            paused: true,
            ..operational()
        });
        assert_eq!(derive_state(&inputs), SessionState::Paused);
    }

    #[test]
    fn test_state_names() {
        assert_eq!(SessionState::BedNotClear.to_string(), "bed_not_clear");
        assert_eq!("local_mode".parse::<SessionState>().ok(), Some(SessionState::LocalMode));
    }

    #[test]
    fn test_cancel_detection() {
        let mut detector = CancelDetector::default();
        assert!(!detector.observe(SessionState::Printing, 40.0));
        assert!(detector.observe(SessionState::Ready, 40.0));

        // Finished jobs are not cancels.
        assert!(!detector.observe(SessionState::Printing, 99.5));
        assert!(!detector.observe(SessionState::Ready, 99.5));

        // Neither is pausing.
        assert!(!detector.observe(SessionState::Printing, 10.0));
        assert!(!detector.observe(SessionState::Paused, 10.0));

        // A job that never started is not a cancel.
        assert!(!detector.observe(SessionState::Printing, 0.0));
        assert!(!detector.observe(SessionState::Ready, 0.0));
    }
}
