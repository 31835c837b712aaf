#![allow(dead_code)]

use std::{net::SocketAddr, time::Duration};

use color_eyre::{eyre::eyre, Result};
use futures::StreamExt;
use port_agent::{
    agent::{connectivity::LinkState, Collaborators, PortAgent},
    codecs::framed::PacketCodec,
    config::{Config, Instrument, Timing},
    endpoint::EndpointType,
    packet::{Packet, PacketType},
};
use socket2::{Domain, Socket, Type};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time::timeout,
};
use tokio_util::codec::Framed;
use tracing::{info, Level};

pub const REFDES: &str = "CE02SHBP-LJ01D-06-CTDBPN106";

const PATIENCE: Duration = Duration::from_secs(5);

pub async fn init_logging() {
    port_agent::logging::init(Level::DEBUG, None).await;
}

/// A listener standing in for an instrument.
pub async fn instrument() -> Result<(TcpListener, u16)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();

    Ok((listener, port))
}

/// A port nothing listens on.
pub async fn refusing_port() -> Result<u16> {
    let (listener, port) = instrument().await?;
    drop(listener);

    Ok(port)
}

/// A listener that never accepts, with its backlog filled up.
///
/// Connecting to it hangs until the caller gives up.
pub struct Unresponsive {
    _listener: Socket,
    _queued: Vec<TcpStream>,
    pub port: u16,
}

pub async fn unresponsive() -> Result<Unresponsive> {
    let listener = Socket::new(Domain::IPV4, Type::STREAM, None)?;
    listener.bind(&"127.0.0.1:0".parse::<SocketAddr>()?.into())?;
    listener.listen(0)?;
    let port = listener
        .local_addr()?
        .as_socket()
        .ok_or_else(|| eyre!("Not an inet socket"))?
        .port();

    let mut queued = vec![];
    for _ in 0..64 {
        match timeout(Duration::from_millis(200), TcpStream::connect(("127.0.0.1", port))).await {
            Ok(Ok(stream)) => queued.push(stream),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Ok(Unresponsive {
                    _listener: listener,
                    _queued: queued,
                    port,
                })
            }
        }
    }

    Err(eyre!("The backlog never filled up"))
}

/// Timings suitable for tests: nothing periodic gets in the way.
pub fn quiet_timing() -> Timing {
    Timing {
        heartbeat_secs: 3600,
        stats_secs: 3600,
        forgiveness_millis: 100,
        max_reconnect_secs: 1,
        aux_idle_millis: 500,
        ..Default::default()
    }
}

pub fn config(instrument: Instrument) -> Config {
    Config {
        timing: quiet_timing(),
        ..Config::new(REFDES, instrument)
    }
}

pub fn tcp_config(port: u16) -> Config {
    config(Instrument::Tcp {
        address: "127.0.0.1".into(),
        port,
    })
}

pub async fn start(config: Config) -> Result<PortAgent> {
    start_with(config, Collaborators::default()).await
}

pub async fn start_with(config: Config, collaborators: Collaborators) -> Result<PortAgent> {
    init_logging().await;

    let agent = PortAgent::start(config, collaborators).await?;
    info!(ports = ?agent.ports(), "Agent started");

    Ok(agent)
}

/// Accept the agent's link to a fake instrument.
pub async fn accept(listener: &TcpListener) -> Result<TcpStream> {
    let (stream, _) = timeout(PATIENCE, listener.accept()).await??;

    Ok(stream)
}

pub type PacketStream = Framed<TcpStream, PacketCodec>;

/// Connect to one of the agent's servers, speaking packets.
pub async fn connect(port: u16) -> Result<PacketStream> {
    let stream = TcpStream::connect(("127.0.0.1", port)).await?;

    Ok(Framed::new(stream, PacketCodec::new()))
}

pub async fn receive(client: &mut PacketStream) -> Result<Packet> {
    let packet = timeout(PATIENCE, client.next())
        .await?
        .ok_or_else(|| eyre!("Stream closed"))??;

    Ok(packet)
}

/// Receive until a packet of the given type shows up.
pub async fn receive_type(client: &mut PacketStream, packet_type: PacketType) -> Result<Packet> {
    loop {
        let packet = receive(client).await?;
        if packet.packet_type() == packet_type {
            return Ok(packet);
        }
        info!(%packet, "Skipping");
    }
}

/// Receive packets of the given type until their payloads add up to `len` bytes.
pub async fn receive_payload(
    client: &mut PacketStream,
    packet_type: PacketType,
    len: usize,
) -> Result<Vec<u8>> {
    let mut payload = vec![];
    while payload.len() < len {
        let packet = receive_type(client, packet_type).await?;
        payload.extend_from_slice(packet.payload());
    }

    Ok(payload)
}

/// Send a command line and wait for its first response.
pub async fn command(client: &mut PacketStream, line: &str) -> Result<Packet> {
    client.get_mut().write_all(line.as_bytes()).await?;
    client.get_mut().write_all(b"\n").await?;

    receive(client).await
}

/// Read exactly `len` bytes from a fake instrument.
pub async fn read_exact(stream: &mut TcpStream, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0; len];
    timeout(PATIENCE, stream.read_exact(&mut buf)).await??;

    Ok(buf)
}

/// Wait until the router has seen `count` connections of a type register.
pub async fn wait_for_adds(agent: &PortAgent, endpoint_type: EndpointType, count: u64) -> Result<()> {
    let poll = async {
        loop {
            let stats = agent.context().router().statistics().await?;
            if stats.get(endpoint_type).adds >= count {
                return Ok::<_, color_eyre::Report>(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };

    timeout(PATIENCE, poll)
        .await
        .map_err(|_| eyre!("No {endpoint_type} connection registered"))?
}

/// Wait until the agent reports `state`.
pub async fn wait_for_state(agent: &PortAgent, state: LinkState) -> Result<()> {
    let poll = async {
        loop {
            if agent.context().agent().state().await? == state {
                return Ok::<_, color_eyre::Report>(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };

    timeout(PATIENCE, poll)
        .await
        .map_err(|_| eyre!("Agent never became {state}"))?
}
