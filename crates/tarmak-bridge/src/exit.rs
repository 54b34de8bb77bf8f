use std::fmt;
use std::io;

use tarmak_mux::MuxError;
use tarmak_rpc::RpcError;
use tarmak_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound => TRANSPORT_ERROR,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Bind { ref source, .. } | TransportError::Spawn { ref source, .. }
            if source.kind() == io::ErrorKind::PermissionDenied =>
        {
            CliError::new(PERMISSION_DENIED, format!("{context}: {err}"))
        }
        TransportError::Accept(source) | TransportError::Io(source) => io_error(context, source),
        TransportError::PathTooLong { .. } => CliError::new(USAGE, format!("{context}: {err}")),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn mux_error(context: &str, err: MuxError) -> CliError {
    let code = if err.is_clean() {
        FAILURE
    } else if err.is_protocol() {
        DATA_INVALID
    } else if matches!(err, MuxError::Io(_)) {
        TRANSPORT_ERROR
    } else {
        INTERNAL
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn rpc_error(context: &str, err: RpcError) -> CliError {
    match err {
        RpcError::Transport(err) => transport_error(context, err),
        RpcError::Mux(err) => mux_error(context, err),
        RpcError::Io(err) => io_error(context, err),
        RpcError::Connect { .. } | RpcError::Disconnected => {
            CliError::new(TRANSPORT_ERROR, format!("{context}: {err}"))
        }
        RpcError::Json(_) | RpcError::Protocol(_) => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        RpcError::UnknownProcedure(_) => CliError::new(USAGE, format!("{context}: {err}")),
        RpcError::Remote { .. } | RpcError::Backend(_) => {
            CliError::new(FAILURE, format!("{context}: {err}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn unreachable_host_is_a_transport_failure() {
        let err = RpcError::Connect {
            path: PathBuf::from("/run/tarmak.sock"),
            attempts: 20,
            source: TransportError::Connect {
                path: PathBuf::from("/run/tarmak.sock"),
                source: io::Error::from(io::ErrorKind::NotFound),
            },
        };
        let cli = rpc_error("ping failed", err);
        assert_eq!(cli.code, TRANSPORT_ERROR);
        assert!(cli.message.starts_with("ping failed: could not reach tarmak at /run/tarmak.sock"));
    }

    #[test]
    fn remote_failure_keeps_procedure_name() {
        let err = RpcError::Remote {
            procedure: "Tarmak.VaultClusterStatus".into(),
            message: "vault cluster is not ready".into(),
        };
        let cli = rpc_error("call failed", err);
        assert_eq!(cli.code, FAILURE);
        assert!(cli.message.contains("Tarmak.VaultClusterStatus"));
    }

    #[test]
    fn mux_errors_by_kind() {
        assert_eq!(mux_error("x", MuxError::ConnectionClosed).code, FAILURE);
        assert_eq!(mux_error("x", MuxError::UnknownChannel(9)).code, DATA_INVALID);
        assert_eq!(
            mux_error("x", io::Error::from(io::ErrorKind::BrokenPipe).into()).code,
            TRANSPORT_ERROR
        );
    }

    #[test]
    fn permission_denied_bind() {
        let err = TransportError::Bind {
            path: PathBuf::from("/root/x.sock"),
            source: io::Error::from(io::ErrorKind::PermissionDenied),
        };
        assert_eq!(transport_error("bind failed", err).code, PERMISSION_DENIED);
    }
}
