//! Engine error kinds and the per-thread last-error slot

use std::cell::RefCell;
use thiserror::Error;

/// Errors produced by engine operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FlowError {
    #[error("invalid handle: {0}")]
    InvalidHandle(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("node not found: {0}")]
    NodeNotFound(String),
    #[error("port not found: {0}")]
    PortNotFound(String),
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("module load failed: {0}")]
    ModuleLoadFailed(String),
    #[error("computation failed: {0}")]
    ComputationFailed(String),
    #[error("out of memory: {0}")]
    OutOfMemory(String),
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("not implemented: {0}")]
    NotImplemented(String),
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl FlowError {
    /// Numeric code for callers whose boundary cannot carry rich values
    pub fn code(&self) -> i32 {
        match self {
            FlowError::InvalidHandle(_) => -1,
            FlowError::InvalidArgument(_) => -2,
            FlowError::NodeNotFound(_) => -3,
            FlowError::PortNotFound(_) => -4,
            FlowError::ConnectionFailed(_) => -5,
            FlowError::ModuleLoadFailed(_) => -6,
            FlowError::ComputationFailed(_) => -7,
            FlowError::OutOfMemory(_) => -8,
            FlowError::TypeMismatch(_) => -9,
            FlowError::NotImplemented(_) => -10,
            FlowError::Unknown(_) => -999,
        }
    }

    /// The human-readable detail carried by this error
    pub fn message(&self) -> &str {
        match self {
            FlowError::InvalidHandle(m)
            | FlowError::InvalidArgument(m)
            | FlowError::NodeNotFound(m)
            | FlowError::PortNotFound(m)
            | FlowError::ConnectionFailed(m)
            | FlowError::ModuleLoadFailed(m)
            | FlowError::ComputationFailed(m)
            | FlowError::OutOfMemory(m)
            | FlowError::TypeMismatch(m)
            | FlowError::NotImplemented(m)
            | FlowError::Unknown(m) => m,
        }
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;

thread_local! {
    static LAST_ERROR: RefCell<Option<FlowError>> = const { RefCell::new(None) };
}

/// Record `err` in the calling thread's last-error slot and hand it back.
///
/// Every engine failure path routes through this, so callers that cannot
/// carry rich error values can still query `last_error` afterwards.
pub fn raise(err: FlowError) -> FlowError {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(err.clone()));
    err
}

/// Most recent error recorded on this thread, if any
pub fn last_error() -> Option<FlowError> {
    LAST_ERROR.with(|slot| slot.borrow().clone())
}

/// Clear this thread's last-error slot
pub fn clear_last_error() {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = None);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_contract() {
        assert_eq!(FlowError::InvalidHandle(String::new()).code(), -1);
        assert_eq!(FlowError::ComputationFailed(String::new()).code(), -7);
        assert_eq!(FlowError::TypeMismatch(String::new()).code(), -9);
        assert_eq!(FlowError::Unknown(String::new()).code(), -999);
    }

    #[test]
    fn last_error_slot_records_and_clears() {
        clear_last_error();
        assert!(last_error().is_none());

        let err = raise(FlowError::NodeNotFound("missing".to_string()));
        assert_eq!(err.code(), -3);
        assert_eq!(last_error(), Some(err));

        clear_last_error();
        assert!(last_error().is_none());
    }

    #[test]
    fn last_error_is_per_thread() {
        clear_last_error();
        raise(FlowError::Unknown("main thread".to_string()));

        let seen = std::thread::spawn(last_error).join().unwrap();
        assert!(seen.is_none());
        assert!(last_error().is_some());
    }
}
