//! Error types for Jicama
//!
//! This module defines:
//! - `JicamaError`: the application-specific error enum shared by the
//!   client and server lock managers
//! - `AppError`: wrapper for integration with embedding applications

use std::fmt::{Display, Formatter};

/// Application-specific error types
#[derive(thiserror::Error, Debug)]
pub enum JicamaError {
    /// An operation other than recall-commit arrived before the lock
    /// manager was started. Upstream sequencing is broken; not retriable.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// wait/notify issued by an owner that does not hold the lock, or a
    /// recall-commit from a client that was never the greedy holder.
    #[error("illegal monitor state: {0}")]
    IllegalMonitorState(String),

    /// unlock issued by an owner with no hold on the lock.
    #[error("lock not held: {0}")]
    NotHeld(String),

    /// A blocked acquisition or wait was cancelled via interrupt().
    #[error("interrupted: {0}")]
    Interrupted(String),

    /// The transport refused to deliver a message.
    #[error("channel error: {0}")]
    ChannelError(String),

    /// A reconnection or recall context could not be applied.
    #[error("invalid lock context: {0}")]
    InvalidContext(String),

    #[error("internal error: {0}")]
    InternalError(String),
}

impl JicamaError {
    /// Whether this error marks a programming-level invariant violation
    /// that must not be retried
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            JicamaError::ProtocolViolation(_) | JicamaError::IllegalMonitorState(_)
        )
    }
}

/// Wrapper for application errors
#[derive(Debug)]
pub struct AppError {
    inner: anyhow::Error,
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        AppError { inner: value }
    }
}

impl From<JicamaError> for AppError {
    fn from(value: JicamaError) -> Self {
        AppError {
            inner: anyhow::Error::new(value),
        }
    }
}

impl AppError {
    pub fn inner(&self) -> &anyhow::Error {
        &self.inner
    }

    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        self.inner.downcast_ref::<E>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = JicamaError::ProtocolViolation("unlock before start".to_string());
        assert_eq!(format!("{}", err), "protocol violation: unlock before start");

        let err = JicamaError::NotHeld("lock 'a' thread 3".to_string());
        assert_eq!(format!("{}", err), "lock not held: lock 'a' thread 3");

        let err = JicamaError::Interrupted("lock 'a'".to_string());
        assert_eq!(format!("{}", err), "interrupted: lock 'a'");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(JicamaError::ProtocolViolation(String::new()).is_fatal());
        assert!(JicamaError::IllegalMonitorState(String::new()).is_fatal());
        assert!(!JicamaError::Interrupted(String::new()).is_fatal());
        assert!(!JicamaError::NotHeld(String::new()).is_fatal());
    }

    #[test]
    fn test_app_error_downcast() {
        let app_err = AppError::from(JicamaError::NotHeld("lock 'x'".to_string()));
        assert_eq!(format!("{}", app_err), "lock not held: lock 'x'");
        assert!(app_err.downcast_ref::<JicamaError>().is_some());
    }
}
