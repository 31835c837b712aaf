#![deny(missing_docs)]

//! A port agent sits between a networked instrument and the drivers talking to it.
//!
//! The agent keeps one or more TCP links open to the instrument, reconnecting
//! when they drop. Whatever the instrument sends is framed into timestamped
//! packets and routed to every interested endpoint: drivers on the data port,
//! passive sniffers, and log files.
//! Bytes written by drivers are routed back to the instrument.
//!
//! A separate command port takes one command per line.
//! See [`command`] for the line format.
//!
//! Instrument connectivity is reported to drivers as `CONNECTED`/`DISCONNECTED`
//! status packets, with short link blips forgiven.

/// Per-connection-kind agent task, connectivity bookkeeping and startup.
pub mod agent;

/// Command line interface.
pub mod cli;

/// Codecs turning byte streams into packets and lines.
pub mod codecs;

/// The command port protocol.
pub mod command;

/// Configuration.
pub mod config;

/// Driving a single TCP connection.
pub mod connection;

/// Service directory collaborator.
pub mod directory;

/// Things packets can be routed to.
pub mod endpoint;

/// Possible errors in this library.
pub mod error;

/// Logging setup.
pub mod logging;

/// The port agent packet format.
pub mod packet;

/// Routing packets to endpoints.
pub mod router;

/// Listening for drivers, commands and sniffers.
pub mod server;

/// How an agent is connected to its instrument.
pub mod topology;
