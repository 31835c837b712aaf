use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{channel::mpsc::UnboundedReceiver, stream::BoxStream, SinkExt, StreamExt, TryStreamExt};
use tokio::{net::TcpStream, sync::oneshot};
use tokio_util::codec::{BytesCodec, FramedRead, FramedWrite};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    agent::{AgentContext, Inform},
    codecs::{framed::PacketCodec, lines::LinesCodec, raw::RawCodec},
    command::CommandRegistry,
    endpoint::{Connection, EndpointType},
    error::Error,
    packet::{Packet, PacketType},
};

/// What inbound bytes become.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    /// Each read is wrapped into a packet of this type.
    Raw(PacketType),
    /// The peer sends framed packets.
    Framed,
    /// The peer sends command lines.
    Commands,
}

/// What a connection means for the agent's connectivity bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Counts towards the instrument connection target.
    Instrument,
    /// A driver or observer.
    Client,
    /// Nobody needs to know.
    Passive,
}

/// How to run a TCP connection.
#[derive(Debug, Clone)]
pub struct ConnectionSpec {
    /// The role the connection is registered with.
    pub endpoint_type: EndpointType,
    /// How inbound bytes are interpreted.
    pub inbound: Inbound,
    /// Connectivity bookkeeping.
    pub role: Role,
    /// Written once, before anything is routed to the peer.
    pub greeting: Option<Bytes>,
    /// Close the connection after this long without traffic.
    pub idle_timeout: Option<Duration>,
}

impl ConnectionSpec {
    /// An outbound instrument link.
    pub fn instrument(endpoint_type: EndpointType, inbound: Inbound) -> Self {
        Self {
            endpoint_type,
            inbound,
            role: Role::Instrument,
            greeting: None,
            idle_timeout: None,
        }
    }

    /// An accepted server connection.
    pub fn server(endpoint_type: EndpointType, inbound: Inbound) -> Self {
        Self {
            endpoint_type,
            inbound,
            role: Role::Client,
            greeting: None,
            idle_timeout: None,
        }
    }

    /// Write `greeting` first thing.
    pub fn with_greeting(mut self, greeting: &'static [u8]) -> Self {
        self.greeting = Some(Bytes::from_static(greeting));
        self
    }
}

enum Incoming {
    Packets(Vec<Packet>),
    Line(BytesMut),
}

fn incoming(read: tokio::net::tcp::OwnedReadHalf, inbound: Inbound) -> BoxStream<'static, std::io::Result<Incoming>> {
    match inbound {
        Inbound::Raw(packet_type) => FramedRead::new(read, RawCodec::new(packet_type))
            .map_ok(Incoming::Packets)
            .boxed(),
        Inbound::Framed => FramedRead::new(read, PacketCodec::new())
            .map_ok(|packet| Incoming::Packets(vec![packet]))
            .boxed(),
        Inbound::Commands => FramedRead::new(read, LinesCodec::default())
            .map_ok(Incoming::Line)
            .boxed(),
    }
}

fn inform_connected(ctx: &AgentContext, role: Role, connection: &Connection) {
    match role {
        Role::Instrument => ctx.agent().inform(Inform::InstrumentConnected(connection.id())),
        Role::Client => ctx.agent().inform(Inform::ClientConnected(connection.id())),
        Role::Passive => {}
    }
}

fn inform_disconnected(ctx: &AgentContext, role: Role, connection: &Connection) {
    match role {
        Role::Instrument => ctx
            .agent()
            .inform(Inform::InstrumentDisconnected(connection.id())),
        Role::Client => ctx.agent().inform(Inform::ClientDisconnected(connection.id())),
        Role::Passive => {}
    }
}

/// Run a connection until the peer leaves or an I/O error occurs.
///
/// The connection is registered with the router for its whole lifetime.
/// If given, `ready` gets the registered connection once anything routed
/// from then on will reach the peer.
pub async fn drive(
    stream: TcpStream,
    spec: ConnectionSpec,
    ctx: AgentContext,
    ready: Option<oneshot::Sender<Connection>>,
) -> Result<(), Error> {
    let (connection, outgoing) = Connection::new(spec.endpoint_type);
    let span = info_span!("conn", id = %connection.id(), kind = %spec.endpoint_type);

    run(stream, spec, ctx, ready, connection, outgoing)
        .instrument(span)
        .await
}

async fn run(
    stream: TcpStream,
    spec: ConnectionSpec,
    ctx: AgentContext,
    ready: Option<oneshot::Sender<Connection>>,
    connection: Connection,
    mut outgoing: UnboundedReceiver<Bytes>,
) -> Result<(), Error> {
    info!(peer = ?stream.peer_addr().ok(), "Connected");

    let (read, write) = stream.into_split();
    let mut writer = FramedWrite::new(write, BytesCodec::new());
    let mut incoming = incoming(read, spec.inbound);

    if let Some(greeting) = &spec.greeting {
        writer.send(greeting.clone()).await?;
    }

    let registry = matches!(spec.inbound, Inbound::Commands)
        .then(|| CommandRegistry::for_topology(ctx.topology()));

    ctx.router().register(connection.clone());
    inform_connected(&ctx, spec.role, &connection);
    if let Some(ready) = ready {
        let _ = ready.send(connection.clone());
    }

    let result = loop {
        let idle = async {
            match spec.idle_timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            next = incoming.next() => match next {
                Some(Ok(Incoming::Packets(packets))) => ctx.router().got_data(packets),
                Some(Ok(Incoming::Line(line))) => {
                    if let Some(registry) = &registry {
                        if let Err(e) = handle_line(line.freeze(), registry, &ctx, &mut writer).await {
                            break Err(e);
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(%e, "Read failed");
                    break Err(e.into());
                }
                None => break Ok(()),
            },
            data = outgoing.next() => match data {
                Some(data) => {
                    if let Err(e) = writer.send(data).await {
                        warn!(%e, "Write failed");
                        break Err(e.into());
                    }
                }
                None => break Ok(()),
            },
            _ = idle => {
                debug!("Idle, closing");
                break Ok(());
            }
        }
    };

    ctx.router()
        .deregister(spec.endpoint_type, connection.id());
    inform_disconnected(&ctx, spec.role, &connection);
    info!("Disconnected");

    result
}

async fn handle_line(
    line: Bytes,
    registry: &CommandRegistry,
    ctx: &AgentContext,
    writer: &mut FramedWrite<tokio::net::tcp::OwnedWriteHalf, BytesCodec>,
) -> Result<(), Error> {
    ctx.router()
        .got_data(Packet::create(line.clone(), PacketType::PaCommand));

    let responses = registry.handle_line(&line, ctx).await;
    for packet in &responses {
        writer.send(packet.serialize()).await?;
    }
    ctx.router().got_data(responses);

    Ok(())
}
