use serde::{Deserialize, Serialize};

/// Highest rule priority (most important).
pub const HIGHEST_PRIORITY: u8 = 1;
/// Lowest rule priority (least important).
pub const LOWEST_PRIORITY: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }

    /// Map a rule priority (1 = highest, 5 = lowest) to a severity.
    ///
    /// Out-of-range priorities are clamped into `1..=5`.
    pub fn from_priority(priority: u8) -> Self {
        match priority.clamp(HIGHEST_PRIORITY, LOWEST_PRIORITY) {
            1 | 2 => Severity::Error,
            3 | 4 => Severity::Warning,
            _ => Severity::Info,
        }
    }
}

impl Default for Severity {
    fn default() -> Self {
        Self::Warning
    }
}
