//! Per-monitor hysteresis state machine.
//!
//! Raw check classifications are debounced into a confirmed UP/DOWN status
//! with consecutive-count thresholds, so a single transient failure never
//! opens an incident.

mod incident;
mod uptime;

pub use incident::*;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::analysis::CheckStatus;

/// Consecutive DOWN checks needed to confirm an outage.
pub const FAILURE_THRESHOLD: u32 = 3;
/// Consecutive non-DOWN checks needed to confirm recovery.
pub const RECOVERY_THRESHOLD: u32 = 2;

/// Debounced status that drives incidents and alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MonitorStatus {
    Up,
    Down,
}

impl MonitorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorStatus::Up => "UP",
            MonitorStatus::Down => "DOWN",
        }
    }
}

impl fmt::Display for MonitorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MonitorStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UP" => Ok(MonitorStatus::Up),
            "DOWN" => Ok(MonitorStatus::Down),
            other => Err(format!("unknown monitor status: {}", other)),
        }
    }
}

/// Thresholds for confirming a status flip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HysteresisPolicy {
    pub failure_threshold: u32,
    pub recovery_threshold: u32,
}

impl Default for HysteresisPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: FAILURE_THRESHOLD,
            recovery_threshold: RECOVERY_THRESHOLD,
        }
    }
}

/// The persisted part of a monitor the state machine reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorState {
    pub confirmed: MonitorStatus,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
}

impl Default for MonitorState {
    fn default() -> Self {
        Self {
            confirmed: MonitorStatus::Up,
            consecutive_failures: 0,
            consecutive_successes: 0,
        }
    }
}

/// Confirmed-status change produced by one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    /// Confirmed DOWN; an incident must be opened.
    WentDown,
    /// Confirmed UP after being DOWN; the open incident must be resolved.
    Recovered,
}

impl Transition {
    pub fn is_change(&self) -> bool {
        !matches!(self, Transition::Unchanged)
    }
}

/// Pure state machine: fold one check classification into the monitor state.
///
/// SLOW counts towards recovery like UP. Incrementing one counter always
/// resets the other.
pub fn transition(
    state: &MonitorState,
    status: CheckStatus,
    policy: &HysteresisPolicy,
) -> (MonitorState, Transition) {
    let failure_threshold = policy.failure_threshold.max(1);
    let recovery_threshold = policy.recovery_threshold.max(1);

    match status {
        CheckStatus::Down => {
            let consecutive_failures = state.consecutive_failures.saturating_add(1);
            let went_down = consecutive_failures >= failure_threshold
                && state.confirmed != MonitorStatus::Down;

            let next = MonitorState {
                confirmed: if went_down { MonitorStatus::Down } else { state.confirmed },
                consecutive_failures,
                consecutive_successes: 0,
            };
            let change = if went_down { Transition::WentDown } else { Transition::Unchanged };
            (next, change)
        }
        CheckStatus::Up | CheckStatus::Slow => {
            let consecutive_successes = state.consecutive_successes.saturating_add(1);
            let recovered = state.confirmed == MonitorStatus::Down
                && consecutive_successes >= recovery_threshold;

            let next = MonitorState {
                confirmed: if recovered { MonitorStatus::Up } else { state.confirmed },
                consecutive_failures: 0,
                consecutive_successes,
            };
            let change = if recovered { Transition::Recovered } else { Transition::Unchanged };
            (next, change)
        }
    }
}
