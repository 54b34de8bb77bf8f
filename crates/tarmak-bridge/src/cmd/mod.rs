use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Subcommand};
use tarmak_rpc::{HandlerRetry, HostService, ProcedureTable, RetryPolicy, StateFile};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::exit::{io_error, rpc_error, CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod call;
pub mod connector;
pub mod exec;
pub mod ping;
pub mod serve;
pub mod version;

/// How long blocked stdio reads may hold up process exit.
const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Sandbox side: expose a local socket, tunnelled over stdin/stdout.
    Connector(ConnectorArgs),
    /// Host side: serve the catalog on a Unix socket.
    Serve(ServeArgs),
    /// Host side: run a command and serve the catalog over its stdio.
    Exec(ExecArgs),
    /// Check that the host answers and print its version.
    Ping(PingArgs),
    /// Call one procedure and print the reply.
    Call(CallArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Connector(args) => block_on(connector::run(args)),
        Command::Serve(args) => block_on(serve::run(args)),
        Command::Exec(args) => block_on(exec::run(args)),
        Command::Ping(args) => block_on(ping::run(args, format)),
        Command::Call(args) => block_on(call::run(args, format)),
        Command::Version(args) => version::run(args),
    }
}

fn block_on<F>(command: F) -> CliResult<i32>
where
    F: Future<Output = CliResult<i32>>,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| io_error("failed to start async runtime", err))?;
    let result = runtime.block_on(command);
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_GRACE);
    result
}

#[derive(Args, Debug)]
pub struct ConnectorArgs {
    /// Local socket path to expose inside the sandbox.
    #[arg(long, env = "TARMAK_CONNECTOR_SOCKET")]
    pub socket: PathBuf,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Socket path to serve on. A stale socket left there is replaced.
    #[arg(long, env = "TARMAK_SOCKET")]
    pub socket: PathBuf,
    #[command(flatten)]
    pub host: HostArgs,
}

#[derive(Args, Debug)]
pub struct ExecArgs {
    #[command(flatten)]
    pub host: HostArgs,
    /// Command whose stdin/stdout carry the session (after `--`).
    #[arg(required = true, num_args = 1.., last = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

#[derive(Args, Debug)]
pub struct PingArgs {
    /// Socket path to connect to.
    #[arg(long, env = "TARMAK_SOCKET")]
    pub socket: PathBuf,
    #[command(flatten)]
    pub retry: RetryArgs,
}

#[derive(Args, Debug)]
pub struct CallArgs {
    /// Socket path to connect to.
    #[arg(long, env = "TARMAK_SOCKET")]
    pub socket: PathBuf,
    /// Procedure name, with or without the `Tarmak.` prefix.
    pub procedure: String,
    /// Arguments as a JSON object.
    #[arg(long)]
    pub json: Option<String>,
    #[command(flatten)]
    pub retry: RetryArgs,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Host state and handler patience, shared by `serve` and `exec`.
#[derive(Args, Debug)]
pub struct HostArgs {
    /// JSON state file answering inventory and credential lookups.
    #[arg(long, env = "TARMAK_STATE")]
    pub state: PathBuf,
    /// Attempts handlers make against collaborators that are not ready.
    #[arg(long, env = "TARMAK_HANDLER_ATTEMPTS", default_value = "60")]
    pub handler_attempts: u32,
    /// Pause between handler attempts (e.g. 1s, 500ms).
    #[arg(long, env = "TARMAK_HANDLER_DELAY", default_value = "1s")]
    pub handler_delay: String,
}

impl HostArgs {
    pub async fn table(&self) -> CliResult<ProcedureTable> {
        let retry = HandlerRetry {
            attempts: self.handler_attempts,
            delay: parse_duration(&self.handler_delay)?,
        };
        let state = Arc::new(
            StateFile::open(&self.state)
                .await
                .map_err(|err| rpc_error("failed to load host state", err))?,
        );
        let service = HostService::new(state.clone(), state).with_retry(retry);
        Ok(ProcedureTable::for_service(Arc::new(service)))
    }
}

#[derive(Args, Debug)]
pub struct RetryArgs {
    /// Dial attempts before giving up, including the first.
    #[arg(long, env = "TARMAK_DIAL_ATTEMPTS", default_value = "20")]
    pub attempts: u32,
    /// Pause between dial attempts (e.g. 1s, 500ms).
    #[arg(long, env = "TARMAK_DIAL_DELAY", default_value = "1s")]
    pub retry_delay: String,
}

impl RetryArgs {
    pub fn policy(&self) -> CliResult<RetryPolicy> {
        if self.attempts == 0 {
            return Err(CliError::new(USAGE, "--attempts must be at least 1"));
        }
        Ok(RetryPolicy {
            attempts: self.attempts,
            delay: parse_duration(&self.retry_delay)?,
        })
    }
}

/// Cancel `token` on the first SIGINT or SIGTERM.
pub fn cancel_on_signal(token: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let (mut interrupt, mut terminate) =
            match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
                (Ok(interrupt), Ok(terminate)) => (interrupt, terminate),
                (Err(err), _) | (_, Err(err)) => {
                    warn!(error = %err, "signal handlers unavailable");
                    return;
                }
            };
        tokio::select! {
            _ = token.cancelled() => return,
            _ = interrupt.recv() => info!("received SIGINT; shutting down"),
            _ = terminate.recv() => info!("received SIGTERM; shutting down"),
        }
        token.cancel();
    });
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        _ => Ok(Duration::from_secs(value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_duration("0ms").unwrap(), Duration::ZERO);
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("bad").is_err());
        assert!(parse_duration("5m").is_err());
    }

    #[test]
    fn retry_policy_from_flags() {
        let args = RetryArgs {
            attempts: 3,
            retry_delay: "250ms".into(),
        };
        let policy = args.policy().unwrap();
        assert_eq!(policy.attempts, 3);
        assert_eq!(policy.budget(), Duration::from_millis(500));

        let none = RetryArgs {
            attempts: 0,
            retry_delay: "1s".into(),
        };
        assert_eq!(none.policy().unwrap_err().code, USAGE);
    }
}
