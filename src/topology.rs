use std::fmt::Debug;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::{sync::Mutex, task::JoinSet};
use tracing::{debug, warn};

use crate::{
    agent::AgentContext,
    command::fault,
    connection::{ConnectionSpec, Inbound, Role},
    endpoint::{Connection, EndpointType},
    error::Error,
    packet::{Packet, PacketType},
};

/// Reconnecting outbound links.
pub mod link;

/// How an agent is wired to its instrument.
#[async_trait]
pub trait Topology: Send + Sync + Debug {
    /// Short name, as used on the command line.
    fn name(&self) -> &'static str;

    /// How many instrument links this topology holds open.
    fn link_count(&self) -> usize;

    /// Live links needed for `CONNECTED` unless configured otherwise.
    fn target_connection_count(&self) -> usize {
        self.link_count()
    }

    /// Start the outbound instrument links.
    fn start_instrument_links(&self, ctx: &AgentContext, tasks: &mut JoinSet<Result<(), Error>>);

    /// Commands beyond the base set, all handled by [`Topology::vendor_command`].
    fn extra_commands(&self) -> &'static [&'static str] {
        &[]
    }

    /// Handle one of [`Topology::extra_commands`].
    async fn vendor_command(&self, _ctx: &AgentContext, name: &str, _args: &[Vec<u8>]) -> Vec<Packet> {
        fault(format!(
            "The command {name:?} is not supported by {} port agents",
            self.name()
        ))
    }
}

/// One TCP connection to the instrument, carrying data both ways.
#[derive(Debug, Clone)]
pub struct SingleLink {
    address: String,
    port: u16,
}

impl SingleLink {
    /// Connect to `address:port`.
    pub fn new(address: String, port: u16) -> Self {
        Self { address, port }
    }
}

#[async_trait]
impl Topology for SingleLink {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn link_count(&self) -> usize {
        1
    }

    fn start_instrument_links(&self, ctx: &AgentContext, tasks: &mut JoinSet<Result<(), Error>>) {
        link::spawn(
            tasks,
            "instrument",
            &self.address,
            self.port,
            ConnectionSpec::instrument(
                EndpointType::Instrument,
                Inbound::Raw(PacketType::FromInstrument),
            ),
            ctx,
        );
    }
}

/// Separate links for instrument output (RX) and driver input (TX).
#[derive(Debug, Clone)]
pub struct DualLink {
    address: String,
    rx_port: u16,
    tx_port: u16,
}

impl DualLink {
    /// Read from `address:rx_port`, write to `address:tx_port`.
    pub fn new(address: String, rx_port: u16, tx_port: u16) -> Self {
        Self {
            address,
            rx_port,
            tx_port,
        }
    }
}

#[async_trait]
impl Topology for DualLink {
    fn name(&self) -> &'static str {
        "botpt"
    }

    fn link_count(&self) -> usize {
        2
    }

    fn start_instrument_links(&self, ctx: &AgentContext, tasks: &mut JoinSet<Result<(), Error>>) {
        link::spawn(
            tasks,
            "rx",
            &self.address,
            self.rx_port,
            ConnectionSpec::instrument(
                EndpointType::InstrumentData,
                Inbound::Raw(PacketType::FromInstrument),
            ),
            ctx,
        );
        // Anything the TX side says is not instrument data.
        link::spawn(
            tasks,
            "tx",
            &self.address,
            self.tx_port,
            ConnectionSpec::instrument(EndpointType::Instrument, Inbound::Raw(PacketType::Unknown)),
            ctx,
        );
    }
}

/// Whether the auxiliary command link is held open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuxMode {
    /// Always connected, reconnecting like the data link. Counts towards the target.
    #[default]
    Persistent,
    /// Connected when a command needs it, closed again when idle.
    OnDemand,
}

/// Commands understood by the serial-over-IP server's command port.
const VENDOR_COMMANDS: &[&str] = &[
    "help",
    "tinfo",
    "cinfo",
    "time",
    "timestamp",
    "power",
    "break",
    "gettime",
    "getver",
];

/// Asks the server to timestamp its frames in binary.
const BINARY_TIMESTAMP: &[u8] = b"time 2\n";

/// A serial-over-IP server: one link with framed, timestamped instrument
/// data plus an auxiliary link for server commands.
#[derive(Debug)]
pub struct CommandLink {
    address: String,
    port: u16,
    digi_port: u16,
    aux: AuxMode,
    on_demand: Mutex<Option<Connection>>,
}

impl CommandLink {
    /// Data on `address:port`, commands on `address:digi_port`.
    pub fn new(address: String, port: u16, digi_port: u16, aux: AuxMode) -> Self {
        Self {
            address,
            port,
            digi_port,
            aux,
            on_demand: Mutex::new(None),
        }
    }

    fn aux_spec(&self, ctx: &AgentContext) -> ConnectionSpec {
        let spec = ConnectionSpec::instrument(EndpointType::Digi, Inbound::Raw(PacketType::DigiRsp))
            .with_greeting(BINARY_TIMESTAMP);

        match self.aux {
            AuxMode::Persistent => spec,
            AuxMode::OnDemand => ConnectionSpec {
                role: Role::Passive,
                idle_timeout: Some(ctx.config().timing.aux_idle()),
                ..spec
            },
        }
    }

    /// Make sure an on-demand auxiliary link is up and registered.
    async fn ensure_aux(&self, ctx: &AgentContext) -> Result<(), Error> {
        let mut aux = self.on_demand.lock().await;

        if aux.as_ref().is_some_and(|connection| !connection.is_closed()) {
            debug!("Reusing auxiliary link");
            return Ok(());
        }

        // The lock is held while connecting, so this has to be bounded.
        let patience = ctx.config().timing.aux_connect();
        let connection = tokio::time::timeout(
            patience,
            link::connect_once("aux", &self.address, self.digi_port, self.aux_spec(ctx), ctx),
        )
        .await
        .map_err(|_| {
            Error::ConnectTimeout(patience, format!("{}:{}", self.address, self.digi_port))
        })??;
        *aux = Some(connection);

        Ok(())
    }
}

#[async_trait]
impl Topology for CommandLink {
    fn name(&self) -> &'static str {
        "rsn"
    }

    fn link_count(&self) -> usize {
        match self.aux {
            AuxMode::Persistent => 2,
            AuxMode::OnDemand => 1,
        }
    }

    fn start_instrument_links(&self, ctx: &AgentContext, tasks: &mut JoinSet<Result<(), Error>>) {
        link::spawn(
            tasks,
            "instrument",
            &self.address,
            self.port,
            ConnectionSpec::instrument(EndpointType::Instrument, Inbound::Framed),
            ctx,
        );

        if self.aux == AuxMode::Persistent {
            link::spawn(tasks, "aux", &self.address, self.digi_port, self.aux_spec(ctx), ctx);
        }
    }

    fn extra_commands(&self) -> &'static [&'static str] {
        VENDOR_COMMANDS
    }

    async fn vendor_command(&self, ctx: &AgentContext, name: &str, args: &[Vec<u8>]) -> Vec<Packet> {
        if self.aux == AuxMode::OnDemand {
            if let Err(e) = self.ensure_aux(ctx).await {
                warn!(%e, "Auxiliary link unavailable");
                return fault(format!(
                    "Unable to reach the auxiliary command port: {e}"
                ));
            }
        }

        let mut payload = BytesMut::from(name.as_bytes());
        for arg in args {
            payload.put_u8(b' ');
            payload.extend_from_slice(arg);
        }
        payload.put_u8(b'\n');

        Packet::create(payload.freeze(), PacketType::DigiCmd)
    }
}
