//! SFTP error types

use russh_sftp::protocol::StatusCode;
use thiserror::Error;

use crate::communicator::CommunicatorError;

/// SFTP-specific errors
#[derive(Debug, Error)]
pub enum SftpError {
    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Unknown handle: {0}")]
    UnknownHandle(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("End of file")]
    Eof,

    #[error("Transfer error: {0}")]
    TransferError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<CommunicatorError> for SftpError {
    fn from(err: CommunicatorError) -> Self {
        match err {
            CommunicatorError::Unsupported(op) => SftpError::Unsupported(op),
            CommunicatorError::NotFound(path) => SftpError::FileNotFound(path),
            CommunicatorError::PermissionDenied(path) => SftpError::PermissionDenied(path),
            CommunicatorError::Io(e) => SftpError::IoError(e),
            other => SftpError::TransferError(other.to_string()),
        }
    }
}

impl From<SftpError> for StatusCode {
    fn from(err: SftpError) -> Self {
        match err {
            SftpError::Unsupported(_) => StatusCode::OpUnsupported,
            SftpError::PermissionDenied(_) => StatusCode::PermissionDenied,
            SftpError::FileNotFound(_) => StatusCode::NoSuchFile,
            SftpError::ProtocolError(_) => StatusCode::BadMessage,
            SftpError::Eof => StatusCode::Eof,
            SftpError::UnknownHandle(_)
            | SftpError::TransferError(_)
            | SftpError::IoError(_) => StatusCode::Failure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            StatusCode::from(SftpError::Unsupported("symlink")),
            StatusCode::OpUnsupported
        );
        assert_eq!(
            StatusCode::from(SftpError::ProtocolError("offset".into())),
            StatusCode::BadMessage
        );
        assert_eq!(
            StatusCode::from(SftpError::UnknownHandle("7".into())),
            StatusCode::Failure
        );
        assert_eq!(StatusCode::from(SftpError::Eof), StatusCode::Eof);
    }

    #[test]
    fn test_from_communicator_error() {
        let err: SftpError = CommunicatorError::NotFound("/etc/x".into()).into();
        assert!(matches!(err, SftpError::FileNotFound(_)));
        assert_eq!(StatusCode::from(err), StatusCode::NoSuchFile);

        let err: SftpError = CommunicatorError::StartFailed("gone".into()).into();
        assert!(matches!(err, SftpError::TransferError(_)));
        assert_eq!(StatusCode::from(err), StatusCode::Failure);
    }
}
