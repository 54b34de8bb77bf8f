use std::process::ExitStatus;

use tarmak_mux::Session;
use tarmak_rpc::RpcServer;
use tarmak_transport::ChildTransport;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cmd::{cancel_on_signal, ExecArgs};
use crate::exit::{transport_error, CliError, CliResult, FAILURE, USAGE};

pub async fn run(args: ExecArgs) -> CliResult<i32> {
    let table = args.host.table().await?;
    let (program, rest) = args
        .command
        .split_first()
        .ok_or_else(|| CliError::new(USAGE, "no command given"))?;

    let mut command = Command::new(program);
    command.args(rest);
    let (mut child, stdout, stdin) = ChildTransport::spawn(command)
        .map_err(|err| transport_error("failed to start command", err))?;
    info!(program = %program, pid = ?child.id(), "serving tarmak over command stdio");

    let session = Session::server(stdout, stdin);
    let serving = {
        let session = session.clone();
        let server = RpcServer::new(table);
        tokio::spawn(async move { server.serve_session(&session).await })
    };

    let shutdown = CancellationToken::new();
    cancel_on_signal(shutdown.clone());

    let status = tokio::select! {
        waited = child.wait() => waited
            .map_err(|err| transport_error(&format!("waiting for {program} failed"), err))?,
        _ = shutdown.cancelled() => {
            if let Err(err) = child.kill().await {
                warn!(program = %program, error = %err, "failed to kill command");
            }
            let _ = session.close().await;
            return Err(CliError::new(FAILURE, format!("{program} interrupted")));
        }
    };

    if let Err(err) = session.close().await {
        warn!(error = %err, "session to command ended with error");
    }
    match serving.await {
        Ok(Err(err)) => warn!(error = %err, "rpc server stopped with error"),
        Err(err) => warn!(error = %err, "rpc server task failed"),
        Ok(Ok(())) => {}
    }

    Ok(exit_code(program, status))
}

fn exit_code(program: &str, status: ExitStatus) -> i32 {
    match status.code() {
        Some(code) => {
            info!(program = %program, code, "command exited");
            code
        }
        None => {
            warn!(program = %program, ?status, "command killed by signal");
            FAILURE
        }
    }
}
