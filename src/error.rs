//! Error types for provisioning operations.

use std::fmt;
use std::time::Duration;

/// Errors that can occur while provisioning or tearing down lab nodes.
#[derive(Debug)]
pub enum LabError {
    /// The requested quest is not in the quest file.
    QuestNotFound {
        quest: String,
        known: Vec<String>,
    },

    /// The quest file could not be parsed or failed validation.
    InvalidQuestFile(String),

    /// An external command ran but exited unsuccessfully.
    CommandFailed {
        program: String,
        args: Vec<String>,
        status: Option<i32>,
        stderr: String,
    },

    /// An external command could not be started at all.
    Spawn {
        program: String,
        source: std::io::Error,
    },

    /// A polled condition never became true within its retry budget.
    Timeout {
        what: String,
        attempts: u32,
        interval: Duration,
    },

    /// The container has no address to reach it by.
    MissingAddress(String),

    /// An external tool printed something we could not interpret.
    UnexpectedOutput(String),

    /// Filesystem error.
    Io(std::io::Error),
}

impl fmt::Display for LabError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QuestNotFound { quest, known } => {
                write!(f, "Quest '{}' not found", quest)?;
                if !known.is_empty() {
                    write!(f, " (known quests: {})", known.join(", "))?;
                }
                Ok(())
            }
            Self::InvalidQuestFile(msg) => write!(f, "Invalid quest file: {}", msg),
            Self::CommandFailed {
                program,
                args,
                status,
                stderr,
            } => {
                let status = status
                    .map(|code| code.to_string())
                    .unwrap_or_else(|| "signal".to_string());
                write!(
                    f,
                    "`{} {}` failed with status {}: {}",
                    program,
                    args.join(" "),
                    status,
                    stderr.trim()
                )
            }
            Self::Spawn { program, source } => {
                write!(f, "Failed to start `{}`: {}", program, source)
            }
            Self::Timeout {
                what,
                attempts,
                interval,
            } => write!(
                f,
                "Timed out waiting for {} after {} attempts ({:?} apart)",
                what, attempts, interval
            ),
            Self::MissingAddress(node) => write!(f, "Node '{}' has no IP address", node),
            Self::UnexpectedOutput(msg) => write!(f, "Unexpected tool output: {}", msg),
            Self::Io(err) => write!(f, "I/O error: {}", err),
        }
    }
}

impl std::error::Error for LabError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Spawn { source, .. } => Some(source),
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for LabError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

/// Result type for provisioning operations.
pub type LabResult<T> = Result<T, LabError>;

impl LabError {
    /// Whether this error came from a readiness poll running out of attempts.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
