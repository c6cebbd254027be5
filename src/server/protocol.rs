//! Device protocol
//!
//! The clock speaks plain text frames. On connect it pushes its current
//! temperature, display settings and night schedule; afterwards it answers a
//! small set of query commands. Everything else a client sends is accepted
//! and ignored.

use serde::{Deserialize, Serialize};

/// Temperature report pushed on connect and in reply to [`MODE_TEMP`]
pub const TEMP_MSG: &str = "TEMP:9";

/// Display settings: mode, RGB colour, brightness
pub const SETTINGS_MSG: &str = "SETTINGS: DIGITAL, 255,0,255,200";

/// Night schedule: enabled, off hour/minute, on hour/minute
pub const SCHEDULE_MSG: &str = "SCHEDULE:1,22,0,7,0";

/// Command requesting the current display settings
pub const GET_SETTINGS: &str = "GET_SETTINGS";

/// Command switching the clock into temperature mode
pub const MODE_TEMP: &str = "MODE:TEMP";

// ============================================================================
// Canned Messages
// ============================================================================

/// The fixed status payloads the simulated device reports.
///
/// Loaded once at startup and shared read-only between all connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CannedMessages {
    /// Temperature report
    pub temperature: String,
    /// Display settings report
    pub settings: String,
    /// Night schedule report
    pub schedule: String,
}

impl Default for CannedMessages {
    fn default() -> Self {
        Self {
            temperature: TEMP_MSG.to_string(),
            settings: SETTINGS_MSG.to_string(),
            schedule: SCHEDULE_MSG.to_string(),
        }
    }
}

impl CannedMessages {
    /// Messages sent unconditionally to every new connection, in send order
    pub fn initial_sequence(&self) -> [&str; 3] {
        [
            self.temperature.as_str(),
            self.settings.as_str(),
            self.schedule.as_str(),
        ]
    }

    /// The reply for a client command, if the device answers it
    pub fn reply_to(&self, command: &Command<'_>) -> Option<&str> {
        match command {
            Command::GetSettings => Some(self.settings.as_str()),
            Command::ModeTemp => Some(self.temperature.as_str()),
            Command::Unrecognized(_) => None,
        }
    }
}

// ============================================================================
// Client Commands
// ============================================================================

/// A text frame received from a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    /// `GET_SETTINGS`
    GetSettings,
    /// `MODE:TEMP`
    ModeTemp,
    /// Any other text, kept verbatim for logging
    Unrecognized(&'a str),
}

impl<'a> Command<'a> {
    /// Classify a frame by exact, case-sensitive comparison.
    ///
    /// No trimming or normalisation happens: `" GET_SETTINGS"` and
    /// `"get_settings"` are both unrecognized.
    pub fn parse(text: &'a str) -> Self {
        match text {
            GET_SETTINGS => Command::GetSettings,
            MODE_TEMP => Command::ModeTemp,
            other => Command::Unrecognized(other),
        }
    }
}
