//! Process stdio used as a duplex byte transport.
//!
//! The sandboxed side talks over its own stdin/stdout; the host side spawns
//! that process and talks over the child's pipes. Standard error is left for
//! diagnostics and is forwarded into the host's log.

use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{Result, TransportError};

/// This process's stdin (reader) and stdout (writer).
///
/// Nothing else may write to stdout once this pair carries a session.
pub fn stdio() -> (tokio::io::Stdin, tokio::io::Stdout) {
    (tokio::io::stdin(), tokio::io::stdout())
}

/// A child process whose stdin/stdout carry a session.
#[derive(Debug)]
pub struct ChildTransport {
    child: Child,
    program: String,
    stderr_task: Option<JoinHandle<()>>,
}

impl ChildTransport {
    /// Spawn `command` with all three stdio streams piped.
    ///
    /// Returns the handle together with the child's stdout (to read from) and
    /// stdin (to write to). Each stderr line is logged at debug level.
    pub fn spawn(mut command: Command) -> Result<(Self, ChildStdout, ChildStdin)> {
        let program = command
            .as_std()
            .get_program()
            .to_string_lossy()
            .into_owned();

        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| TransportError::Spawn {
            program: program.clone(),
            source,
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or(TransportError::MissingPipe("stdout"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or(TransportError::MissingPipe("stdin"))?;

        let stderr_task = child.stderr.take().map(|stderr| {
            let app = program.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(app = %app, "{line}");
                }
            })
        });

        debug!(program = %program, pid = ?child.id(), "spawned child transport");

        Ok((
            Self {
                child,
                program,
                stderr_task,
            },
            stdout,
            stdin,
        ))
    }

    /// OS process id, while the child is running.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Program name the child was started with.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Kill the child and reap it.
    pub async fn kill(&mut self) -> Result<()> {
        debug!(program = %self.program, pid = ?self.child.id(), "killing child transport");
        self.child.kill().await.map_err(TransportError::Io)
    }

    /// Wait for the child to exit and for its stderr to drain.
    ///
    /// Cancel safe; after [`kill`](Self::kill) this returns the status at once.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        let status = self.child.wait().await?;
        if let Some(task) = self.stderr_task.take() {
            let _ = task.await;
        }
        debug!(program = %self.program, ?status, "child transport exited");
        Ok(status)
    }
}
