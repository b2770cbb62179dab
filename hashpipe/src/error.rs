//! Typed error for hashpipe core operations.
//!
//! Collapses the original five C error codes into the five handling classes
//! a caller needs to branch on: `Fatal` system errors abort with a
//! diagnostic, `Transient` block-wait timeouts are silently retried,
//! `Signal`/interrupt conditions are silently retried or exit, `Protocol`
//! errors (e.g. a failed IBV work completion) are logged and trigger
//! shutdown, and `Parameter` errors are returned from init and prevent the
//! pipeline from starting.

use std::fmt;
use std::io;

#[derive(Debug)]
pub enum HpError {
    /// Unrecoverable system call failure (shmget, shmat, sem_open, ...).
    Fatal(String),
    /// A bounded wait (e.g. `wait_free`/`wait_filled`) timed out.
    Transient(String),
    /// A system call was interrupted by a signal.
    Signal(String),
    /// A hardware/driver-level protocol violation (bad work completion).
    Protocol(String),
    /// A malformed or out-of-range parameter supplied by configuration
    /// or the command line.
    Parameter(String),
}

impl HpError {
    pub fn fatal(msg: impl Into<String>) -> Self {
        HpError::Fatal(msg.into())
    }

    pub fn parameter(msg: impl Into<String>) -> Self {
        HpError::Parameter(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        HpError::Protocol(msg.into())
    }

    /// True for `Transient` and `Signal` errors, i.e. the caller should
    /// silently retry rather than surface the error further.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HpError::Transient(_) | HpError::Signal(_))
    }
}

impl fmt::Display for HpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HpError::Fatal(m) => write!(f, "fatal: {m}"),
            HpError::Transient(m) => write!(f, "timeout: {m}"),
            HpError::Signal(m) => write!(f, "interrupted: {m}"),
            HpError::Protocol(m) => write!(f, "protocol error: {m}"),
            HpError::Parameter(m) => write!(f, "bad parameter: {m}"),
        }
    }
}

impl std::error::Error for HpError {}

impl From<io::Error> for HpError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                HpError::Transient(e.to_string())
            }
            io::ErrorKind::Interrupted => HpError::Signal(e.to_string()),
            _ => HpError::Fatal(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, HpError>;

/// Returns the last `errno` as an `io::Error`, matching the C code's
/// `perror`-then-return idiom.
pub fn last_os_error() -> io::Error {
    io::Error::last_os_error()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classes() {
        assert!(HpError::Transient("x".into()).is_retryable());
        assert!(HpError::Signal("x".into()).is_retryable());
        assert!(!HpError::Fatal("x".into()).is_retryable());
        assert!(!HpError::Parameter("x".into()).is_retryable());
        assert!(!HpError::Protocol("x".into()).is_retryable());
    }

    #[test]
    fn io_error_mapping() {
        let e: HpError = io::Error::from(io::ErrorKind::TimedOut).into();
        assert!(matches!(e, HpError::Transient(_)));
        let e: HpError = io::Error::from(io::ErrorKind::Interrupted).into();
        assert!(matches!(e, HpError::Signal(_)));
        let e: HpError = io::Error::from(io::ErrorKind::PermissionDenied).into();
        assert!(matches!(e, HpError::Fatal(_)));
    }
}
