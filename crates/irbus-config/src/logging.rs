//! Log level names and their mapping onto tracing filters.
//!
//! The historical daemon accepted both symbolic names and the numeric levels
//! 3..10; both forms parse here. The extra trace levels collapse onto
//! `trace`, which is the finest granularity tracing offers.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

/// Supported log verbosity levels.
#[derive(
    Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, EnumString, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum LogLevel {
    /// Errors only.
    Error,
    /// Warnings and errors.
    Warning,
    /// Noteworthy events.
    Notice,
    /// Normal operational logging.
    #[default]
    Info,
    /// Debug detail.
    Debug,
    /// Per-line protocol tracing.
    Trace,
    /// Historical alias for [`LogLevel::Trace`].
    Trace1,
    /// Historical alias for [`LogLevel::Trace`].
    Trace2,
}

impl LogLevel {
    /// Parses a level from a symbolic name or a numeric 3..10 value.
    ///
    /// The symbolic form comes from the `strum`-derived [`FromStr`];
    /// this wrapper adds the numeric spellings.
    ///
    /// # Errors
    ///
    /// Returns [`LogLevelParseError`] when the input is neither.
    ///
    /// [`FromStr`]: std::str::FromStr
    pub fn parse(input: &str) -> Result<Self, LogLevelParseError> {
        if let Ok(number) = input.parse::<u8>() {
            return Self::from_number(number).ok_or_else(|| LogLevelParseError(input.to_owned()));
        }
        input
            .parse::<Self>()
            .map_err(|_| LogLevelParseError(input.to_owned()))
    }

    fn from_number(number: u8) -> Option<Self> {
        match number {
            3 => Some(Self::Error),
            4 => Some(Self::Warning),
            5 => Some(Self::Notice),
            6 => Some(Self::Info),
            7 => Some(Self::Debug),
            8 => Some(Self::Trace),
            9 => Some(Self::Trace1),
            10 => Some(Self::Trace2),
            _ => None,
        }
    }

    /// The tracing filter directive corresponding to this level.
    #[must_use]
    pub fn as_filter(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warn",
            Self::Notice | Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace | Self::Trace1 | Self::Trace2 => "trace",
        }
    }
}

/// Error raised for unrecognised log level spellings.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("bad log level '{0}': expected 'error', 'warning', 'notice', etc., or 3..10")]
pub struct LogLevelParseError(pub String);
