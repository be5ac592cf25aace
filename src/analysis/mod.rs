//! Classifiers that turn a probe report into a status and a cause.
//!
//! Both are pure and total over every report the pipeline can produce.

mod diagnosis;
mod root_cause;

pub use diagnosis::*;
pub use root_cause::*;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Coarse per-check status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckStatus {
    Up,
    Slow,
    Down,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Up => "UP",
            CheckStatus::Slow => "SLOW",
            CheckStatus::Down => "DOWN",
        }
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UP" => Ok(CheckStatus::Up),
            "SLOW" => Ok(CheckStatus::Slow),
            "DOWN" => Ok(CheckStatus::Down),
            other => Err(format!("unknown check status: {}", other)),
        }
    }
}
