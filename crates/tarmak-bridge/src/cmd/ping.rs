use serde_json::json;
use tarmak_rpc::catalog::{Ping, Procedure};
use tarmak_rpc::RpcClient;

use crate::cmd::PingArgs;
use crate::exit::{rpc_error, CliResult, SUCCESS};
use crate::output::{print_reply, OutputFormat};

pub async fn run(args: PingArgs, format: OutputFormat) -> CliResult<i32> {
    let client = RpcClient::with_retry(&args.socket, args.retry.policy()?);
    let version = client
        .handshake()
        .await
        .map_err(|err| rpc_error("ping failed", err))?;
    print_reply(Ping::NAME, &json!({ "version": version }), format);
    Ok(SUCCESS)
}
