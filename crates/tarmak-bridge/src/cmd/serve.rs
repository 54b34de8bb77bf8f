use tarmak_rpc::RpcServer;
use tokio_util::sync::CancellationToken;

use crate::cmd::{cancel_on_signal, ServeArgs};
use crate::exit::{rpc_error, CliResult, SUCCESS};

pub async fn run(args: ServeArgs) -> CliResult<i32> {
    let table = args.host.table().await?;
    let shutdown = CancellationToken::new();
    cancel_on_signal(shutdown.clone());

    RpcServer::new(table)
        .serve_unix(&args.socket, shutdown)
        .await
        .map_err(|err| rpc_error("rpc server failed", err))?;
    Ok(SUCCESS)
}
