use crate::storage::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("The queue name cannot be empty")]
    QueueNameEmpty,

    #[error("The queue does not exist: {0}")]
    QueueNotExist(String),

    #[error("Get the queue info failed: {0}")]
    QueueInfoFetchFailed(String),

    #[error("The queue {name} exists, but type conflict")]
    QueueExistsTypeConflict { name: String },

    #[error("The queue message cannot be empty")]
    QueueMessageEmpty,

    #[error("The queue message transfer failed: {0}")]
    QueueMessageTransferFailed(String),

    #[error("The queue message confirm failed: {0}")]
    QueueMessageConfirmFailed(String),

    #[error("The transfer queue is empty")]
    TransferQueueEmpty,

    #[error("Redis client does not exist: {0}")]
    ClientNotExist(String),

    #[error("Redis client cannot connect: {0}")]
    ClientCannotConnect(String),

    #[error("Redis client get lock fail: {operation} is held by {holder}")]
    ClientLockFail { operation: String, holder: i64 },

    #[error("The queue operation failed, try again later: {0}")]
    QueueOperationFailed(String),
}

/// Stable classification of [`QueueError`], independent of the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    QueueNameEmpty,
    QueueNotExist,
    QueueInfoFetchFailed,
    QueueExistsTypeConflict,
    QueueMessageEmpty,
    QueueMessageTransferFailed,
    QueueMessageConfirmFailed,
    TransferQueueEmpty,
    ClientNotExist,
    ClientCannotConnect,
    ClientLockFail,
    QueueOperationFailed,
}

impl ErrorKind {
    pub fn code(&self) -> u32 {
        match self {
            ErrorKind::QueueNameEmpty => 1,
            ErrorKind::QueueNotExist => 2,
            ErrorKind::QueueInfoFetchFailed => 3,
            ErrorKind::QueueExistsTypeConflict => 4,
            ErrorKind::QueueMessageEmpty => 5,
            ErrorKind::QueueMessageTransferFailed => 6,
            ErrorKind::QueueMessageConfirmFailed => 7,
            ErrorKind::TransferQueueEmpty => 8,
            ErrorKind::ClientNotExist => 9,
            ErrorKind::ClientCannotConnect => 10,
            ErrorKind::ClientLockFail => 11,
            ErrorKind::QueueOperationFailed => 99,
        }
    }

    /// Whether a later retry of the same call can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::ClientCannotConnect
                | ErrorKind::ClientLockFail
                | ErrorKind::QueueOperationFailed
                | ErrorKind::QueueMessageTransferFailed
                | ErrorKind::QueueMessageConfirmFailed
        )
    }
}

impl QueueError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueueError::QueueNameEmpty => ErrorKind::QueueNameEmpty,
            QueueError::QueueNotExist(_) => ErrorKind::QueueNotExist,
            QueueError::QueueInfoFetchFailed(_) => ErrorKind::QueueInfoFetchFailed,
            QueueError::QueueExistsTypeConflict { .. } => ErrorKind::QueueExistsTypeConflict,
            QueueError::QueueMessageEmpty => ErrorKind::QueueMessageEmpty,
            QueueError::QueueMessageTransferFailed(_) => ErrorKind::QueueMessageTransferFailed,
            QueueError::QueueMessageConfirmFailed(_) => ErrorKind::QueueMessageConfirmFailed,
            QueueError::TransferQueueEmpty => ErrorKind::TransferQueueEmpty,
            QueueError::ClientNotExist(_) => ErrorKind::ClientNotExist,
            QueueError::ClientCannotConnect(_) => ErrorKind::ClientCannotConnect,
            QueueError::ClientLockFail { .. } => ErrorKind::ClientLockFail,
            QueueError::QueueOperationFailed(_) => ErrorKind::QueueOperationFailed,
        }
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;

impl From<StoreError> for QueueError {
    fn from(value: StoreError) -> Self {
        QueueError::ClientCannotConnect(value.to_string())
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(value: serde_json::Error) -> Self {
        QueueError::QueueOperationFailed(format!("serialization: {}", value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_surface_as_connect_failures() {
        let err: QueueError = StoreError::Connection("refused".into()).into();
        assert_eq!(err.kind(), ErrorKind::ClientCannotConnect);
        assert_eq!(err.kind().code(), 10);
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(QueueError::QueueNameEmpty.kind().code(), 1);
        assert_eq!(
            QueueError::ClientLockFail {
                operation: "reclaim_pending".into(),
                holder: 7
            }
            .kind()
            .code(),
            11
        );
        assert_eq!(ErrorKind::QueueOperationFailed.code(), 99);
        assert!(!ErrorKind::QueueExistsTypeConflict.is_retryable());
        assert!(ErrorKind::ClientLockFail.is_retryable());
    }
}
