//! Error type shared by every scheduler component.

use crate::common::TaskHandle;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong inside the scheduler.
///
/// Precondition and lookup failures are returned to the immediate caller.
/// `Task` failures come back from job execution and are turned into error
/// notifications by the dispatcher. `Aborted` signals a busy or disabled
/// job and is never forwarded.
#[derive(Debug, Error)]
pub enum Error {
    #[error("component is not initialized")]
    NotInitialized,

    #[error("component is already initialized")]
    AlreadyInitialized,

    #[error("value out of range: {0}")]
    InvalidRange(&'static str),

    #[error("handle {0} was never issued")]
    InvalidHandle(TaskHandle),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0} already exists")]
    AlreadyExists(&'static str),

    #[error("execution aborted: job is busy or disabled")]
    Aborted,

    #[error("identifier space exhausted: {0}")]
    Exhausted(&'static str),

    #[error("nested error dispatch suppressed at depth {depth}")]
    ErrorStorm { depth: u32 },

    #[error("task failed with code {code:#x}: {reason}")]
    Task { code: u32, reason: String },

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl Error {
    /// A task-defined failure with an application error code.
    pub fn task(code: u32, reason: impl Into<String>) -> Self {
        Error::Task {
            code,
            reason: reason.into(),
        }
    }

    /// Stable numeric code, used as the key filter of error notifications.
    pub fn code(&self) -> u32 {
        match self {
            Error::NotInitialized => 0x1001,
            Error::AlreadyInitialized => 0x1002,
            Error::InvalidRange(_) => 0x1003,
            Error::InvalidHandle(_) => 0x2001,
            Error::NotFound(_) => 0x2002,
            Error::AlreadyExists(_) => 0x2003,
            Error::Aborted => 0x3001,
            Error::ErrorStorm { .. } => 0x3002,
            Error::Exhausted(_) => 0x4001,
            Error::Config(_) => 0x5001,
            Error::Task { code, .. } => *code,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Error::Aborted)
    }
}
