use tarmak_mux::{Proxy, Session};
use tracing::{info, warn};

use crate::cmd::ConnectorArgs;
use crate::exit::{mux_error, transport_error, CliResult, SUCCESS};

/// Never writes to stdout: it carries the session.
pub async fn run(args: ConnectorArgs) -> CliResult<i32> {
    let (reader, writer) = tarmak_transport::stdio();
    let session = Session::client(reader, writer);

    let proxy = Proxy::bind(&args.socket, session.clone())
        .map_err(|err| transport_error("failed to bind connector socket", err))?;
    let signals = {
        let shutdown = proxy.shutdown_handle();
        tokio::spawn(async move {
            if let Err(err) = shutdown.stop_on_signal().await {
                warn!(error = %err, "signal handlers unavailable");
            }
        })
    };

    info!(path = ?args.socket, "connector ready");
    let served = proxy.run().await;
    signals.abort();

    let closed = session.close().await;
    served.map_err(|err| transport_error("connector socket failed", err))?;
    closed.map_err(|err| mux_error("session to host failed", err))?;
    Ok(SUCCESS)
}
