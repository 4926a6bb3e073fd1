use anyhow::Error as AnyhowError;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias for errors emitted by the incremental pipeline.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Structured error type for the incremental analysis pipeline.
///
/// Every variant is recoverable: cache failures drop a single configuration,
/// analysis failures drop a single file, location failures drop a single
/// diagnostic.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("rule set `{location}` is unreachable: {reason}")]
    ConfigurationUnreachable { location: String, reason: String },

    #[error("rule set `{location}` is invalid: {reason}")]
    ConfigurationInvalid { location: String, reason: String },

    #[error("failed to parse {}: {reason}", .file.display())]
    ParseFailed { file: PathBuf, reason: String },

    #[error("analysis engine failed on {}: {reason}", .file.display())]
    EngineFailure { file: PathBuf, reason: String },

    #[error("cannot resolve line {line} (column {column:?}): {reason}")]
    LocationResolutionFailed {
        line: usize,
        column: Option<usize>,
        reason: String,
    },

    #[error("analysis of {} was superseded", .0.display())]
    Cancelled(PathBuf),

    #[error("unknown project `{0}`")]
    UnknownProject(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl PipelineError {
    pub fn unreachable(location: impl ToString, reason: impl ToString) -> Self {
        Self::ConfigurationUnreachable {
            location: location.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn invalid(location: impl ToString, reason: impl ToString) -> Self {
        Self::ConfigurationInvalid {
            location: location.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn parse_failed(file: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::ParseFailed {
            file: file.into(),
            reason: reason.to_string(),
        }
    }

    pub fn engine(file: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::EngineFailure {
            file: file.into(),
            reason: reason.to_string(),
        }
    }

    pub fn location(line: usize, column: Option<usize>, reason: impl ToString) -> Self {
        Self::LocationResolutionFailed {
            line,
            column,
            reason: reason.to_string(),
        }
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Configuration-level failures: the run continues without that rule set.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigurationUnreachable { .. } | Self::ConfigurationInvalid { .. }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// No failure in the pipeline is fatal to the host process.
    pub fn is_recoverable(&self) -> bool {
        true
    }

    /// Convert to anyhow::Error for interop with anyhow-based code.
    pub fn into_anyhow(self) -> AnyhowError {
        AnyhowError::new(self)
    }
}

impl From<AnyhowError> for PipelineError {
    fn from(err: AnyhowError) -> Self {
        PipelineError::other(format!("{err:#}"))
    }
}

/// Convenience macro mirroring `anyhow::bail!` but returning PipelineError.
#[macro_export]
macro_rules! pipeline_bail {
    ($($arg:tt)*) => {
        return Err($crate::error::PipelineError::other(format!($($arg)*)));
    };
}

/// Convenience macro mirroring `anyhow::ensure!`.
#[macro_export]
macro_rules! pipeline_ensure {
    ($cond:expr, $($arg:tt)*) => {
        if !($cond) {
            $crate::pipeline_bail!($($arg)*);
        }
    };
}
