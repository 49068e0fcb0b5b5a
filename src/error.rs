//! Error types and LDAP result-code mapping.
//!
//! Every failure the core can surface is resolved at operation or
//! connection granularity. `CoreError::result_code` gives the protocol
//! result that a client sees when an error ends a single operation.

use serde::Serialize;
use thiserror::Error;

use crate::protocol::TransportHandle;
use crate::scheduler::WorkerPoolError;
use crate::txn::StorageError;

/// LDAP result codes produced by the core itself.
///
/// Handlers may report any code; these are the ones the request-processing
/// machinery needs to name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u32)]
pub enum ResultCode {
    Success = 0,
    OperationsError = 1,
    ProtocolError = 2,
    TimeLimitExceeded = 3,
    CompareFalse = 5,
    CompareTrue = 6,
    AuthMethodNotSupported = 7,
    NoSuchObject = 32,
    InvalidCredentials = 49,
    InsufficientAccessRights = 50,
    Busy = 51,
    Unavailable = 52,
    UnwillingToPerform = 53,
    Other = 80,
    Canceled = 118,
    NoSuchOperation = 119,
    TooLate = 120,
    CannotCancel = 121,
}

impl ResultCode {
    /// Numeric wire value.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Look up a code by wire value.
    pub fn from_code(code: u32) -> Option<Self> {
        use ResultCode::*;
        let rc = match code {
            0 => Success,
            1 => OperationsError,
            2 => ProtocolError,
            3 => TimeLimitExceeded,
            5 => CompareFalse,
            6 => CompareTrue,
            7 => AuthMethodNotSupported,
            32 => NoSuchObject,
            49 => InvalidCredentials,
            50 => InsufficientAccessRights,
            51 => Busy,
            52 => Unavailable,
            53 => UnwillingToPerform,
            80 => Other,
            118 => Canceled,
            119 => NoSuchOperation,
            120 => TooLate,
            121 => CannotCancel,
            _ => return None,
        };
        Some(rc)
    }

    pub fn is_success(self) -> bool {
        matches!(self, ResultCode::Success | ResultCode::CompareTrue | ResultCode::CompareFalse)
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

/// Crate-level error.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("connection table full ({capacity} slots)")]
    TableFull { capacity: usize },

    #[error("transport handle {0} already registered")]
    DuplicateHandle(TransportHandle),

    #[error("no connection for transport handle {0}")]
    UnknownHandle(TransportHandle),

    #[error("connection key is stale")]
    StaleKey,

    #[error("connection {0} is closing")]
    Closing(u64),

    #[error("too many pending operations ({pending} > {max})")]
    Busy { pending: usize, max: usize },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("worker pool error: {0}")]
    WorkerPool(#[from] WorkerPoolError),

    #[error("transport write failed: {0}")]
    Write(#[from] std::io::Error),

    #[error("response write timed out")]
    WriteTimeout,

    #[error("server is shutting down")]
    ShuttingDown,
}

impl CoreError {
    /// Result code reported to the client when this error ends an operation.
    pub fn result_code(&self) -> ResultCode {
        match self {
            CoreError::Busy { .. } => ResultCode::Busy,
            CoreError::Storage(_) => ResultCode::Unavailable,
            CoreError::Protocol(_) => ResultCode::ProtocolError,
            CoreError::ShuttingDown | CoreError::WorkerPool(_) => ResultCode::Unavailable,
            CoreError::TableFull { .. } => ResultCode::Busy,
            CoreError::Closing(_)
            | CoreError::StaleKey
            | CoreError::UnknownHandle(_)
            | CoreError::DuplicateHandle(_) => ResultCode::OperationsError,
            CoreError::Write(_) | CoreError::WriteTimeout => ResultCode::Other,
        }
    }

    /// Errors that end the connection rather than a single operation.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            CoreError::Protocol(_) | CoreError::Write(_) | CoreError::WriteTimeout
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_code_round_trip_for_named_codes() {
        for rc in [
            ResultCode::Success,
            ResultCode::Busy,
            ResultCode::Unavailable,
            ResultCode::Canceled,
            ResultCode::CannotCancel,
        ] {
            assert_eq!(ResultCode::from_code(rc.code()), Some(rc));
        }
        assert_eq!(ResultCode::from_code(4), None);
    }

    #[test]
    fn test_storage_errors_map_to_unavailable() {
        let err = CoreError::from(StorageError::Begin("no readers".into()));
        assert_eq!(err.result_code(), ResultCode::Unavailable);
        assert!(!err.is_connection_fatal());
    }

    #[test]
    fn test_busy_maps_to_busy() {
        let err = CoreError::Busy { pending: 17, max: 16 };
        assert_eq!(err.result_code(), ResultCode::Busy);
        assert_eq!(err.to_string(), "too many pending operations (17 > 16)");
    }

    #[test]
    fn test_protocol_errors_are_connection_fatal() {
        assert!(CoreError::Protocol("bad tag".into()).is_connection_fatal());
        assert!(CoreError::WriteTimeout.is_connection_fatal());
    }
}
