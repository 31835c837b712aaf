use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::{net::TcpStream, sync::oneshot, task::JoinSet};
use tracing::{info, info_span, warn, Instrument};

use crate::{
    agent::AgentContext,
    config::Timing,
    connection::{self, ConnectionSpec},
    endpoint::Connection,
    error::Error,
};

const INITIAL_DELAY: Duration = Duration::from_millis(500);

/// Exponential reconnect delays.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    /// Start at `initial`, doubling up to `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial.min(max),
        }
    }

    /// How long to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Start over after a successful connection.
    pub fn reset(&mut self) {
        self.current = self.initial.min(self.max);
    }
}

fn keepalive(timing: &Timing) -> TcpKeepalive {
    let keepalive = TcpKeepalive::new().with_time(timing.keepalive_idle());

    #[cfg(any(target_os = "linux", target_os = "macos", windows))]
    let keepalive = keepalive.with_interval(timing.keepalive_interval());

    keepalive
}

/// Connect to an instrument, without Nagle's algorithm.
///
/// Keepalive probes make sure an instrument that vanishes without closing
/// the connection is noticed on links we only ever read from.
pub async fn connect(address: &str, port: u16, timing: &Timing) -> Result<TcpStream, Error> {
    let stream = TcpStream::connect((address, port)).await?;
    stream.set_nodelay(true)?;
    SockRef::from(&stream).set_tcp_keepalive(&keepalive(timing))?;

    Ok(stream)
}

async fn run_link(address: String, port: u16, spec: ConnectionSpec, ctx: AgentContext) -> Result<(), Error> {
    let mut backoff = Backoff::new(INITIAL_DELAY, ctx.config().timing.max_reconnect());

    info!("Attempting to connect");
    loop {
        match connect(&address, port, &ctx.config().timing).await {
            Ok(stream) => {
                backoff.reset();
                if let Err(e) = connection::drive(stream, spec.clone(), ctx.clone(), None).await {
                    warn!(%e, "Link lost");
                }
            }
            Err(e) => {
                warn!(%e, "Could not connect");
            }
        }

        let delay = backoff.next_delay();
        info!(?delay, "Reconnecting");
        tokio::time::sleep(delay).await;
    }
}

/// Keep a link to the instrument up for as long as the agent runs.
pub fn spawn(
    tasks: &mut JoinSet<Result<(), Error>>,
    name: &'static str,
    address: &str,
    port: u16,
    spec: ConnectionSpec,
    ctx: &AgentContext,
) {
    let span = info_span!("link", %name, %address, %port);

    tasks.spawn(run_link(address.to_owned(), port, spec, ctx.clone()).instrument(span));
}

/// Connect once and run the connection in the background.
///
/// Returns when the connection is registered with the router.
pub async fn connect_once(
    name: &'static str,
    address: &str,
    port: u16,
    spec: ConnectionSpec,
    ctx: &AgentContext,
) -> Result<Connection, Error> {
    let stream = connect(address, port, &ctx.config().timing).await?;
    let (ready_tx, ready_rx) = oneshot::channel();

    let ctx = ctx.clone();
    tokio::spawn(
        async move {
            if let Err(e) = connection::drive(stream, spec, ctx, Some(ready_tx)).await {
                warn!(%e, "Link lost");
            }
        }
        .instrument(info_span!("link", %name, %address, %port)),
    );

    ready_rx.await.map_err(|_| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionAborted,
            "link closed before it was ready",
        ))
    })
}
