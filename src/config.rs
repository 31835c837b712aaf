use std::{collections::HashSet, path::Path, path::PathBuf, sync::Arc, time::Duration};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{
    error::Error,
    topology::{AuxMode, CommandLink, DualLink, SingleLink, Topology},
};

/// How the agent reaches the instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Instrument {
    /// One TCP connection carrying data both ways.
    Tcp {
        /// Instrument host.
        address: String,
        /// Instrument port.
        port: u16,
    },

    /// Separate connections for receiving from and transmitting to the instrument.
    Botpt {
        /// Instrument host.
        address: String,
        /// Where instrument data is read from.
        rx_port: u16,
        /// Where driver data is written to.
        tx_port: u16,
    },

    /// A serial-over-IP server which frames instrument data itself,
    /// with an auxiliary port for server commands.
    Rsn {
        /// Server host.
        address: String,
        /// The framed data port.
        port: u16,
        /// The auxiliary command port.
        digi_port: u16,
        /// Whether the auxiliary link is held open.
        #[serde(default)]
        aux: AuxMode,
    },
}

/// Server ports. Zero means any free port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerPorts {
    /// Drivers exchange instrument data here.
    pub data: u16,
    /// Line based commands.
    pub command: u16,
    /// Passive observers.
    pub sniff: u16,
    /// Optional raw driver-assist port.
    pub raw: Option<u16>,
}

/// Timers and intervals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    /// Seconds between heartbeats.
    pub heartbeat_secs: u64,
    /// Seconds between statistics flushes.
    pub stats_secs: u64,
    /// How long an instrument may be gone before `DISCONNECTED` is reported.
    pub forgiveness_millis: u64,
    /// Seconds between service registration attempts.
    pub registration_retry_secs: u64,
    /// Health check TTL given to the service directory.
    pub ttl_secs: u64,
    /// Upper bound for the reconnect backoff.
    pub max_reconnect_secs: u64,
    /// An on-demand auxiliary link closes after this long without traffic.
    pub aux_idle_millis: u64,
    /// Give up opening an on-demand auxiliary link after this long.
    pub aux_connect_millis: u64,
    /// Idle seconds before TCP keepalive probes start on instrument links.
    pub keepalive_idle_secs: u64,
    /// Seconds between unanswered keepalive probes.
    pub keepalive_interval_secs: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            heartbeat_secs: 10,
            stats_secs: 60,
            forgiveness_millis: 5000,
            registration_retry_secs: 10,
            ttl_secs: 30,
            max_reconnect_secs: 30,
            aux_idle_millis: 5000,
            aux_connect_millis: 5000,
            keepalive_idle_secs: 100,
            keepalive_interval_secs: 5,
        }
    }
}

impl Timing {
    /// See [`Timing::heartbeat_secs`].
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    /// See [`Timing::stats_secs`].
    pub fn stats(&self) -> Duration {
        Duration::from_secs(self.stats_secs)
    }

    /// See [`Timing::forgiveness_millis`].
    pub fn forgiveness(&self) -> Duration {
        Duration::from_millis(self.forgiveness_millis)
    }

    /// See [`Timing::registration_retry_secs`].
    pub fn registration_retry(&self) -> Duration {
        Duration::from_secs(self.registration_retry_secs)
    }

    /// See [`Timing::max_reconnect_secs`].
    pub fn max_reconnect(&self) -> Duration {
        Duration::from_secs(self.max_reconnect_secs)
    }

    /// See [`Timing::aux_idle_millis`].
    pub fn aux_idle(&self) -> Duration {
        Duration::from_millis(self.aux_idle_millis)
    }

    /// See [`Timing::aux_connect_millis`].
    pub fn aux_connect(&self) -> Duration {
        Duration::from_millis(self.aux_connect_millis)
    }

    /// See [`Timing::keepalive_idle_secs`].
    pub fn keepalive_idle(&self) -> Duration {
        Duration::from_secs(self.keepalive_idle_secs)
    }

    /// See [`Timing::keepalive_interval_secs`].
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }
}

/// The configuration used for running an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Reference designator of the instrument.
    /// Used for service registration and log file names.
    pub refdes: String,

    /// How to reach the instrument.
    pub instrument: Instrument,

    /// Which ports to listen on.
    #[serde(default)]
    pub ports: ServerPorts,

    /// Live instrument links needed for `CONNECTED`.
    /// Defaults to what the instrument topology opens.
    #[serde(default)]
    pub target_connections: Option<usize>,

    /// Timers.
    #[serde(default)]
    pub timing: Timing,

    /// Where the packet log files go. No log files if not set.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

impl Config {
    fn ron() -> ron::Options {
        ron::Options::default()
            .with_default_extension(ron::extensions::Extensions::IMPLICIT_SOME)
            .with_default_extension(ron::extensions::Extensions::UNWRAP_NEWTYPES)
    }

    /// A configuration for an instrument with defaults for everything else.
    pub fn new(refdes: impl Into<String>, instrument: Instrument) -> Self {
        Self {
            refdes: refdes.into(),
            instrument,
            ports: ServerPorts::default(),
            target_connections: None,
            timing: Timing::default(),
            log_dir: None,
        }
    }

    /// Deserialize a .ron file's contents.
    pub fn deserialize(input: &str) -> Result<Self, Error> {
        Self::ron()
            .from_str::<Config>(input)
            .map_err(|e| Error::BadConfig(format!("Could not parse config: {e}")))
    }

    /// An example configuration with some fields filled in.
    pub fn example() -> Self {
        Self {
            ports: ServerPorts {
                data: 4000,
                command: 4001,
                sniff: 4002,
                raw: None,
            },
            log_dir: Some(PathBuf::from("/var/log/port-agent")),
            ..Self::new(
                "RS03AXBS-MJ03A-06-PRESTA301",
                Instrument::Rsn {
                    address: "10.31.8.7".into(),
                    port: 2101,
                    digi_port: 2102,
                    aux: AuxMode::Persistent,
                },
            )
        }
    }

    /// Serialize the configuration in a "pretty" (i.e. non-compact) fashion.
    pub fn serialize_pretty(&self) -> Result<String, Error> {
        Self::ron()
            .to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| Error::BadConfig(format!("Could not serialize config: {e}")))
    }

    /// Setup a new configuration from a RON file.
    pub fn new_from_path<P: AsRef<Path>>(p: P) -> Result<Self, Error> {
        let s = std::fs::read_to_string(p)?;

        Self::deserialize(&s)
    }

    /// The instrument topology this configuration describes.
    pub fn topology(&self) -> Arc<dyn Topology> {
        match &self.instrument {
            Instrument::Tcp { address, port } => Arc::new(SingleLink::new(address.clone(), *port)),
            Instrument::Botpt {
                address,
                rx_port,
                tx_port,
            } => Arc::new(DualLink::new(address.clone(), *rx_port, *tx_port)),
            Instrument::Rsn {
                address,
                port,
                digi_port,
                aux,
            } => Arc::new(CommandLink::new(address.clone(), *port, *digi_port, *aux)),
        }
    }

    /// Live instrument links needed for `CONNECTED`.
    pub fn target_connections(&self, topology: &dyn Topology) -> usize {
        self.target_connections
            .unwrap_or_else(|| topology.target_connection_count())
    }

    fn check_refdes(&self) -> Result<(), Error> {
        if self.refdes.trim().is_empty() {
            return Err(Error::BadConfig(
                "The reference designator is empty. It names the agent's services and log files, please set it.".into(),
            ));
        }

        Ok(())
    }

    fn check_instrument(&self) -> Result<(), Error> {
        let (address, ports): (&str, Vec<(&str, u16)>) = match &self.instrument {
            Instrument::Tcp { address, port } => (address, vec![("port", *port)]),
            Instrument::Botpt {
                address,
                rx_port,
                tx_port,
            } => (address, vec![("rx_port", *rx_port), ("tx_port", *tx_port)]),
            Instrument::Rsn {
                address,
                port,
                digi_port,
                ..
            } => (address, vec![("port", *port), ("digi_port", *digi_port)]),
        };

        if address.trim().is_empty() {
            return Err(Error::BadConfig("The instrument address is empty.".into()));
        }

        let missing = ports
            .iter()
            .filter(|(_, port)| *port == 0)
            .map(|(name, _)| *name)
            .collect::<Vec<_>>();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::BadConfig(format!(
                "The instrument needs these ports set (non-zero): {}",
                missing.iter().join(", ")
            )))
        }
    }

    fn check_server_ports(&self) -> Result<(), Error> {
        let ports = &self.ports;
        let mut seen = HashSet::new();

        for (name, port) in [
            ("data", Some(ports.data)),
            ("command", Some(ports.command)),
            ("sniff", Some(ports.sniff)),
            ("raw", ports.raw),
        ] {
            match port {
                Some(0) | None => continue,
                Some(port) if !seen.insert(port) => {
                    return Err(Error::BadConfig(format!(
                        "The {name} port {port} is used for more than one server."
                    )))
                }
                Some(_) => {}
            }
        }

        Ok(())
    }

    fn check_timing(&self) -> Result<(), Error> {
        let t = &self.timing;

        let zero = [
            ("heartbeat_secs", t.heartbeat_secs),
            ("stats_secs", t.stats_secs),
            ("forgiveness_millis", t.forgiveness_millis),
            ("registration_retry_secs", t.registration_retry_secs),
            ("ttl_secs", t.ttl_secs),
            ("max_reconnect_secs", t.max_reconnect_secs),
            ("aux_idle_millis", t.aux_idle_millis),
            ("aux_connect_millis", t.aux_connect_millis),
            ("keepalive_idle_secs", t.keepalive_idle_secs),
            ("keepalive_interval_secs", t.keepalive_interval_secs),
        ]
        .into_iter()
        .filter(|(_, value)| *value == 0)
        .map(|(name, _)| name)
        .collect::<Vec<_>>();

        if zero.is_empty() {
            Ok(())
        } else {
            Err(Error::BadConfig(format!(
                "Intervals must be non-zero, these are not: {}",
                zero.iter().join(", ")
            )))
        }
    }

    fn check_target(&self) -> Result<(), Error> {
        let Some(target) = self.target_connections else {
            return Ok(());
        };

        let topology = self.topology();
        let links = topology.link_count();

        if target == 0 || target > links {
            return Err(Error::BadConfig(format!(
                "target_connections is {target}, but the {} topology opens {links} instrument link(s). Use a value from 1 to {links}.",
                topology.name()
            )));
        }

        Ok(())
    }

    /// Check that the configuration describes a working agent.
    pub fn validate(&self) -> Result<(), Error> {
        self.check_refdes()?;
        self.check_instrument()?;
        self.check_server_ports()?;
        self.check_timing()?;
        self.check_target()?;

        Ok(())
    }
}
