use std::fmt::Display;

use bytes::Bytes;
use futures::channel::mpsc;
use serde::Serialize;
use uuid::Uuid;

use crate::error::Error;

/// Rolling log files fed by the router.
pub mod logfile;

/// The role of a registered sink.
///
/// The router delivers packets by endpoint type; any number of live
/// connections may share a type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointType {
    /// The (TX) link to the instrument.
    Instrument,
    /// The RX link of instruments using separate links per direction.
    InstrumentData,
    /// The auxiliary command channel of a serial-over-IP server.
    Digi,
    /// A driver on the data port.
    Client,
    /// A driver on the raw driver-assist port.
    RawClient,
    /// A connection on the command port.
    Command,
    /// Interested in every command line received.
    CommandHandler,
    /// Human readable log file.
    Logger,
    /// Framed packet log file.
    DataLogger,
    /// Passive observer on the sniff port.
    Sniffer,
}

impl EndpointType {
    /// Every endpoint type.
    pub const ALL: [EndpointType; 10] = [
        EndpointType::Instrument,
        EndpointType::InstrumentData,
        EndpointType::Digi,
        EndpointType::Client,
        EndpointType::RawClient,
        EndpointType::Command,
        EndpointType::CommandHandler,
        EndpointType::Logger,
        EndpointType::DataLogger,
        EndpointType::Sniffer,
    ];
}

impl Display for EndpointType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EndpointType::Instrument => "instrument",
            EndpointType::InstrumentData => "instrument-data",
            EndpointType::Digi => "digi",
            EndpointType::Client => "client",
            EndpointType::RawClient => "raw-client",
            EndpointType::Command => "command",
            EndpointType::CommandHandler => "command-handler",
            EndpointType::Logger => "logger",
            EndpointType::DataLogger => "data-logger",
            EndpointType::Sniffer => "sniffer",
        };
        f.write_str(name)
    }
}

/// How a routed packet is rendered for an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Format {
    /// Payload bytes only.
    Raw,
    /// The full serialized frame.
    Packet,
    /// One human readable line, see [`crate::packet::Packet::logstring`].
    Ascii,
}

/// Identifies one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// A fresh, unique id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The first group is plenty to tell connections apart in logs.
        let full = self.0.to_string();
        write!(f, "{}", &full[..8])
    }
}

/// A sink registered with the router.
///
/// Writes are queued to whichever task owns the other end, so the router
/// never waits on a slow peer and writes to one connection never interleave.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    endpoint_type: EndpointType,
    sender: mpsc::UnboundedSender<Bytes>,
}

impl Connection {
    /// Create a connection and the receiving end its owner drains.
    pub fn new(endpoint_type: EndpointType) -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (sender, receiver) = mpsc::unbounded();

        (
            Self {
                id: ConnectionId::new(),
                endpoint_type,
                sender,
            },
            receiver,
        )
    }

    /// The id of this connection.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The role of this connection.
    pub fn endpoint_type(&self) -> EndpointType {
        self.endpoint_type
    }

    /// Queue bytes for the peer.
    ///
    /// Fails if the owner has gone away.
    pub fn write(&self, data: Bytes) -> Result<(), Error> {
        self.sender
            .unbounded_send(data)
            .map_err(|_| Error::ConnectionClosed(self.id))
    }

    /// Whether the owner has gone away.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl Display for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.endpoint_type, self.id)
    }
}
