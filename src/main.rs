use clap::Parser;
use color_eyre::Result;
use port_agent::{
    agent::{Collaborators, PortAgent},
    cli::{self, Examples},
    config::Config,
    logging,
};
use tracing::{debug, error, info, Level};

#[cfg(unix)]
async fn hangup() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::hangup()) {
        Ok(mut hangup) => {
            hangup.recv().await;
        }
        Err(e) => {
            error!(%e, "Could not listen for SIGHUP");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn hangup() {
    std::future::pending::<()>().await;
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = cli::Cli::parse();

    if let cli::Commands::Examples(Examples::Config) = cli.command {
        println!("{}", Config::example().serialize_pretty()?);
        return Ok(());
    }

    logging::init(
        cli.level(),
        cli.log_dir.clone().map(|dir| (Level::DEBUG, dir)),
    )
    .await;

    let Some(config) = cli.config()? else {
        return Ok(());
    };
    debug!(?config, "Config");

    let mut agent = PortAgent::start(config, Collaborators::default()).await?;
    info!(ports = ?agent.ports(), "Port agent running");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C, quitting")
        }
        _ = hangup() => {
            info!("Hangup, quitting")
        }
        result = agent.wait() => {
            error!(?result, "Agent stopped");
            result?;
        }
    }

    Ok(())
}
