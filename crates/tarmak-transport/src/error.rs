use std::path::PathBuf;

/// Errors that can occur in transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to bind to the specified address.
    #[error("failed to bind to {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to connect to the specified address.
    #[error("failed to connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// Failed to start a child process.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    /// A child process was spawned without one of its stdio pipes.
    #[error("child process has no {0} pipe")]
    MissingPipe(&'static str),

    /// An I/O error occurred on the transport stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The socket path is too long for the platform.
    #[error("socket path too long ({len} bytes, max {max}): {path}")]
    PathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },
}

impl TransportError {
    /// Whether an accept loop should keep going after this error.
    ///
    /// Aborted handshakes and descriptor/buffer exhaustion clear up on their
    /// own; anything else means the listener itself is unusable.
    pub fn is_transient(&self) -> bool {
        let TransportError::Accept(err) = self else {
            return false;
        };
        match err.kind() {
            std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::OutOfMemory => true,
            _ => matches!(
                err.raw_os_error(),
                Some(code) if code == EMFILE || code == ENFILE || code == ENOBUFS
            ),
        }
    }
}

// errno values shared by Linux and the BSDs for descriptor/buffer exhaustion.
const ENFILE: i32 = 23;
const EMFILE: i32 = 24;
#[cfg(target_os = "linux")]
const ENOBUFS: i32 = 105;
#[cfg(not(target_os = "linux"))]
const ENOBUFS: i32 = 55;

pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aborted_accept_is_transient() {
        let err = TransportError::Accept(std::io::Error::from(
            std::io::ErrorKind::ConnectionAborted,
        ));
        assert!(err.is_transient());
    }

    #[test]
    fn descriptor_exhaustion_is_transient() {
        let err = TransportError::Accept(std::io::Error::from_raw_os_error(EMFILE));
        assert!(err.is_transient());
    }

    #[test]
    fn other_accept_failures_are_fatal() {
        let err = TransportError::Accept(std::io::Error::from(std::io::ErrorKind::InvalidInput));
        assert!(!err.is_transient());
        let err = TransportError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionAborted));
        assert!(!err.is_transient());
    }
}
