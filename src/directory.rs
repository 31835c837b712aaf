use std::{fmt::Debug, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::error::Error;

/// A service as announced to the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceRegistration {
    /// Unique id, `<name>-<refdes>`.
    pub id: String,
    /// The kind of service, e.g. `command-port-agent`.
    pub name: String,
    /// Where it listens.
    pub port: u16,
    /// The health check fails if not refreshed within this many seconds.
    pub ttl_secs: u64,
    /// The reference designator.
    pub tags: Vec<String>,
}

impl ServiceRegistration {
    /// Describe the service `name` of the agent for `refdes`.
    pub fn new(name: &str, refdes: &str, port: u16, ttl_secs: u64) -> Self {
        Self {
            id: format!("{name}-{refdes}"),
            name: name.to_owned(),
            port,
            ttl_secs,
            tags: vec![refdes.to_owned()],
        }
    }
}

/// Where agents announce their ports, e.g. Consul.
///
/// Calls may be slow; they are always made from their own tasks.
#[async_trait]
pub trait ServiceDirectory: Send + Sync + Debug {
    /// Announce a service with a TTL health check.
    async fn register_service(&self, registration: &ServiceRegistration) -> Result<(), Error>;

    /// Mark the health check of a service as passing.
    async fn refresh_check(&self, id: &str) -> Result<(), Error>;
}

/// A directory which only logs what it is told.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingDirectory;

#[async_trait]
impl ServiceDirectory for LoggingDirectory {
    async fn register_service(&self, registration: &ServiceRegistration) -> Result<(), Error> {
        info!(?registration, "Register service");
        Ok(())
    }

    async fn refresh_check(&self, id: &str) -> Result<(), Error> {
        debug!(%id, "Refresh check");
        Ok(())
    }
}

/// Register every service, retrying each until the directory accepts it.
pub async fn register_all(
    directory: Arc<dyn ServiceDirectory>,
    registrations: Vec<ServiceRegistration>,
    retry: Duration,
) -> Result<(), Error> {
    for registration in registrations {
        async {
            loop {
                match directory.register_service(&registration).await {
                    Ok(()) => {
                        info!("Registered");
                        break;
                    }
                    Err(e) => {
                        warn!(%e, ?retry, "Registration failed, retrying");
                        tokio::time::sleep(retry).await;
                    }
                }
            }
        }
        .instrument(info_span!("register", id = %registration.id, port = registration.port))
        .await;
    }

    Ok(())
}

/// Refresh the health checks of the given services in the background.
pub fn spawn_refresh(directory: Arc<dyn ServiceDirectory>, ids: Vec<String>) {
    tokio::spawn(async move {
        for id in ids {
            if let Err(e) = directory.refresh_check(&id).await {
                warn!(%e, %id, "Health check refresh failed");
            }
        }
    });
}
