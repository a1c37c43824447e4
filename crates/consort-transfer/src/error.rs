//! Transfer error types.

use std::error::Error as StdError;
use std::io;
use thiserror::Error;

/// Errors that can occur while archiving or moving files.
#[derive(Error, Debug)]
pub enum TransferError {
    /// Building or unpacking an archive failed
    #[error("Archive failed: {0}")]
    Archive(String),

    /// HTTP transport failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The peer answered with a non-success status
    #[error("File transfer error for {file}: {status}")]
    Status { file: String, status: u16 },

    /// Every retry hit a transient failure
    #[error("Service down, file retry limit reached: {0}")]
    RetryExhausted(String),

    /// The file server could not start
    #[error("File server failed: {0}")]
    Server(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl TransferError {
    /// Whether the failure is a dropped or refused connection worth retrying.
    ///
    /// Walks the whole source chain, since connection errors usually surface
    /// as an `io::Error` a few levels below the HTTP client's error.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        let mut current: Option<&(dyn StdError + 'static)> = Some(self);
        while let Some(err) = current {
            if let Some(io) = err.downcast_ref::<io::Error>() {
                if matches!(
                    io.kind(),
                    io::ErrorKind::ConnectionRefused
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::BrokenPipe
                        | io::ErrorKind::WouldBlock
                ) {
                    return true;
                }
                // io::Error hides a wrapped error from `source()`.
                if let Some(inner) = io.get_ref() {
                    current = Some(inner as &(dyn StdError + 'static));
                    continue;
                }
            }
            if let Some(http) = err.downcast_ref::<reqwest::Error>() {
                if http.is_connect() {
                    return true;
                }
            }
            current = err.source();
        }
        false
    }
}

impl From<TransferError> for consort_core::PipelineError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::RetryExhausted(file) => Self::TransferRetryExhausted(file),
            TransferError::Io(e) => Self::Io(e),
            other => Self::RemoteCommunication(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_io_kinds() {
        for kind in [
            io::ErrorKind::ConnectionRefused,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::WouldBlock,
        ] {
            assert!(TransferError::Io(io::Error::from(kind)).is_transient());
        }
        assert!(!TransferError::Io(io::Error::from(io::ErrorKind::NotFound)).is_transient());
    }

    #[test]
    fn test_nested_io_error_is_found() {
        let inner = io::Error::from(io::ErrorKind::ConnectionReset);
        let wrapped = io::Error::new(io::ErrorKind::Other, inner);

        // `Other` at the top, `ConnectionReset` one level down
        assert!(TransferError::Io(wrapped).is_transient());
    }

    #[test]
    fn test_status_is_not_transient() {
        let err = TransferError::Status {
            file: "a.tar.gz.0".into(),
            status: 500,
        };
        assert!(!err.is_transient());
    }
}
