use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::Level;

use crate::{
    config::{Config, Instrument},
    error::Error,
    topology::AuxMode,
};

/// The command line interface for the port agent.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Write packet log files (and the agent's own log) to this directory.
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    /// More output. Repeat for even more.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Subcommands
    #[command(subcommand)]
    pub command: Commands,
}

/// Commands available in the command line interface.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run an agent from a configuration file.
    Run {
        /// Path to a configuration file.
        config: PathBuf,
    },

    /// Run an agent for an instrument on a single TCP port.
    Tcp {
        /// Instrument host.
        instaddr: String,
        /// Instrument port.
        instport: u16,
        /// Reference designator.
        refdes: String,
        /// Service health check TTL in seconds.
        #[arg(long, default_value_t = 30)]
        ttl: u64,
    },

    /// Run an agent for an instrument behind a serial-over-IP server.
    Rsn {
        /// Server host.
        instaddr: String,
        /// Framed data port.
        instport: u16,
        /// Auxiliary command port.
        digiport: u16,
        /// Reference designator.
        refdes: String,
        /// Service health check TTL in seconds.
        #[arg(long, default_value_t = 30)]
        ttl: u64,
        /// Only connect the auxiliary port while commands need it.
        #[arg(long)]
        on_demand: bool,
    },

    /// Run an agent for an instrument with separate receive and transmit ports.
    Botpt {
        /// Instrument host.
        instaddr: String,
        /// Port instrument data is read from.
        rxport: u16,
        /// Port driver data is written to.
        txport: u16,
        /// Reference designator.
        refdes: String,
        /// Service health check TTL in seconds.
        #[arg(long, default_value_t = 30)]
        ttl: u64,
    },

    /// Show examples.
    #[command(subcommand)]
    Examples(Examples),
}

/// Things we can show examples of.
#[derive(Subcommand, Debug, Clone, Copy)]
pub enum Examples {
    /// Show an example of a configuration file's contents.
    Config,
}

impl Cli {
    /// Log level for stdout.
    pub fn level(&self) -> Level {
        match self.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    }

    /// The configuration to run with, if the command runs an agent.
    pub fn config(&self) -> Result<Option<Config>, Error> {
        let (refdes, instrument, ttl) = match &self.command {
            Commands::Examples(_) => return Ok(None),
            Commands::Run { config } => {
                let mut config = Config::new_from_path(config)?;
                if self.log_dir.is_some() {
                    config.log_dir = self.log_dir.clone();
                }
                return Ok(Some(config));
            }
            Commands::Tcp {
                instaddr,
                instport,
                refdes,
                ttl,
            } => (
                refdes,
                Instrument::Tcp {
                    address: instaddr.clone(),
                    port: *instport,
                },
                *ttl,
            ),
            Commands::Rsn {
                instaddr,
                instport,
                digiport,
                refdes,
                ttl,
                on_demand,
            } => (
                refdes,
                Instrument::Rsn {
                    address: instaddr.clone(),
                    port: *instport,
                    digi_port: *digiport,
                    aux: if *on_demand {
                        AuxMode::OnDemand
                    } else {
                        AuxMode::Persistent
                    },
                },
                *ttl,
            ),
            Commands::Botpt {
                instaddr,
                rxport,
                txport,
                refdes,
                ttl,
            } => (
                refdes,
                Instrument::Botpt {
                    address: instaddr.clone(),
                    rx_port: *rxport,
                    tx_port: *txport,
                },
                *ttl,
            ),
        };

        let mut config = Config::new(refdes.clone(), instrument);
        config.timing.ttl_secs = ttl;
        config.log_dir = self.log_dir.clone();

        Ok(Some(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("port-agent").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn rsn_on_demand() {
        let cli = parse(&["rsn", "10.0.0.1", "2101", "2102", "REFDES", "--on-demand", "-vv"]);
        let config = cli.config().unwrap().unwrap();

        assert_eq!(cli.level(), Level::TRACE);
        assert_eq!(
            config.instrument,
            Instrument::Rsn {
                address: "10.0.0.1".into(),
                port: 2101,
                digi_port: 2102,
                aux: AuxMode::OnDemand,
            }
        );
        assert_eq!(config.refdes, "REFDES");
        assert_eq!(config.timing.ttl_secs, 30);
        config.validate().unwrap();
    }

    #[test]
    fn botpt_with_log_dir_and_ttl() {
        let cli = parse(&[
            "--log-dir", "/tmp/pa", "botpt", "host", "1", "2", "REFDES", "--ttl", "90",
        ]);
        let config = cli.config().unwrap().unwrap();

        assert_eq!(cli.level(), Level::INFO);
        assert_eq!(config.timing.ttl_secs, 90);
        assert_eq!(config.log_dir, Some(PathBuf::from("/tmp/pa")));
    }

    #[test]
    fn examples_has_no_config() {
        let cli = parse(&["examples", "config"]);
        assert!(cli.config().unwrap().is_none());
    }

    #[test]
    fn run_missing_file_is_an_error() {
        let cli = parse(&["run", "/definitely/not/here.ron"]);
        assert!(cli.config().is_err());
    }
}
