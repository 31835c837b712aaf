use std::{net::SocketAddr, time::Duration};

use tokio::net::TcpListener;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    agent::AgentContext,
    connection::{self, ConnectionSpec},
    error::Error,
};

/// Bind a server port on all interfaces. Port 0 picks any free port.
pub async fn bind(port: u16) -> Result<TcpListener, Error> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    TcpListener::bind(addr).await.map_err(|e| Error::Bind {
        port,
        problem: e.to_string(),
    })
}

async fn accept_loop(listener: TcpListener, spec: ConnectionSpec, ctx: AgentContext) -> Result<(), Error> {
    info!("Accepting connections");

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "Accepted");
                let spec = spec.clone();
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = connection::drive(stream, spec, ctx, None).await {
                        debug!(%e, %peer, "Connection ended with an error");
                    }
                });
            }
            Err(e) => {
                // Usually running out of file descriptors; back off a little.
                warn!(%e, "Accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Accept connections forever, running each as described by `spec`.
pub async fn serve(listener: TcpListener, spec: ConnectionSpec, ctx: AgentContext) -> Result<(), Error> {
    let port = listener.local_addr()?.port();
    let span = info_span!("server", kind = %spec.endpoint_type, %port);

    accept_loop(listener, spec, ctx).instrument(span).await
}
