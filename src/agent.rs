use std::{collections::HashSet, fmt::Display, pin::Pin, sync::Arc, time::Duration};

use futures::{channel::mpsc, StreamExt};
use tokio::{
    sync::oneshot,
    task::JoinSet,
    time::{Instant, MissedTickBehavior, Sleep},
};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    config::{Config, ServerPorts},
    connection::{ConnectionSpec, Inbound},
    directory::{self, LoggingDirectory, ServiceDirectory, ServiceRegistration},
    endpoint::{logfile, ConnectionId, EndpointType},
    error::Error,
    packet::{Packet, PacketType},
    router::{
        statistics::{LoggingPublisher, StatsPublisher},
        Reporting, RouteTable, RouterHandle,
    },
    server,
    topology::Topology,
};

/// Debounced instrument connectivity.
pub mod connectivity;

use connectivity::{Connectivity, Effect, LinkState};

/// Inform the agent of connection lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inform {
    /// An instrument link came up.
    InstrumentConnected(ConnectionId),
    /// An instrument link went down.
    InstrumentDisconnected(ConnectionId),
    /// A driver, observer or command client connected.
    ClientConnected(ConnectionId),
    /// A driver, observer or command client left.
    ClientDisconnected(ConnectionId),
}

impl Display for Inform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Inform::InstrumentConnected(id) => write!(f, "instrument connected: {id}"),
            Inform::InstrumentDisconnected(id) => write!(f, "instrument disconnected: {id}"),
            Inform::ClientConnected(id) => write!(f, "client connected: {id}"),
            Inform::ClientDisconnected(id) => write!(f, "client disconnected: {id}"),
        }
    }
}

/// What the agent task needs to know.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// Live instrument links needed for `CONNECTED`.
    pub target: usize,
    /// Delay before a lost link is reported.
    pub forgiveness: Duration,
    /// Time between heartbeats.
    pub heartbeat: Duration,
    /// Services whose health checks are refreshed on every heartbeat.
    pub service_ids: Vec<String>,
}

enum AgentMessage {
    Inform(Inform),
    State(oneshot::Sender<LinkState>),
}

impl std::fmt::Debug for AgentMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentMessage::Inform(inform) => write!(f, "Inform({inform})"),
            AgentMessage::State(_) => write!(f, "State"),
        }
    }
}

type Forgiveness = Option<(u64, Pin<Box<Sleep>>)>;

struct Agent {
    messages: mpsc::UnboundedReceiver<AgentMessage>,
    connectivity: Connectivity,
    clients: HashSet<ConnectionId>,
    router: RouterHandle,
    directory: Arc<dyn ServiceDirectory>,
    settings: AgentSettings,
}

impl Agent {
    async fn run(mut self) {
        let period = self.settings.heartbeat;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut forgiveness: Forgiveness = None;

        loop {
            tokio::select! {
                message = self.messages.next() => match message {
                    Some(message) => self.handle(message, &mut forgiveness),
                    None => break,
                },
                _ = heartbeat.tick() => self.heartbeat(),
                generation = expire(&mut forgiveness) => {
                    forgiveness = None;
                    let effect = self.connectivity.timer_fired(generation);
                    self.apply(effect, &mut forgiveness);
                }
            }
        }

        debug!("All agent handles dropped, stopping");
    }

    fn handle(&mut self, message: AgentMessage, forgiveness: &mut Forgiveness) {
        match message {
            AgentMessage::Inform(inform) => {
                info!(%inform);
                let effect = match inform {
                    Inform::InstrumentConnected(id) => self.connectivity.connected(id),
                    Inform::InstrumentDisconnected(id) => self.connectivity.disconnected(id),
                    Inform::ClientConnected(id) => {
                        self.clients.insert(id);
                        None
                    }
                    Inform::ClientDisconnected(id) => {
                        self.clients.remove(&id);
                        None
                    }
                };
                debug!(
                    instruments = self.connectivity.live(),
                    target = self.settings.target,
                    clients = self.clients.len(),
                    "Connections"
                );
                self.apply(effect, forgiveness);
            }
            AgentMessage::State(reply) => {
                let _ = reply.send(self.connectivity.state());
            }
        }
    }

    fn apply(&mut self, effect: Option<Effect>, forgiveness: &mut Forgiveness) {
        match effect {
            None => {}
            Some(Effect::ReportConnected) => {
                *forgiveness = None;
                self.report(LinkState::Connected);
            }
            Some(Effect::ReportDisconnected) => self.report(LinkState::Disconnected),
            Some(Effect::ArmTimer(generation)) => {
                debug!(forgiveness = ?self.settings.forgiveness, "Instrument link lost, waiting before reporting");
                *forgiveness = Some((
                    generation,
                    Box::pin(tokio::time::sleep(self.settings.forgiveness)),
                ));
            }
        }
    }

    fn report(&self, state: LinkState) {
        info!(%state, "Instrument");
        self.router
            .got_data(Packet::create(state.to_string(), PacketType::PaStatus));
    }

    fn heartbeat(&self) {
        debug!("Heartbeat");
        self.router
            .got_data(Packet::create("HB", PacketType::PaHeartbeat));
        directory::spawn_refresh(self.directory.clone(), self.settings.service_ids.clone());
    }
}

async fn expire(forgiveness: &mut Forgiveness) -> u64 {
    match forgiveness {
        Some((generation, sleep)) => {
            sleep.as_mut().await;
            *generation
        }
        None => std::future::pending().await,
    }
}

/// Shared access to the agent task, which owns connectivity bookkeeping
/// and the heartbeat.
#[derive(Debug, Clone)]
pub struct AgentHandle(mpsc::UnboundedSender<AgentMessage>);

impl AgentHandle {
    /// Start the agent task.
    pub fn new(
        settings: AgentSettings,
        router: RouterHandle,
        directory: Arc<dyn ServiceDirectory>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded();

        let agent = Agent {
            messages: rx,
            connectivity: Connectivity::new(settings.target),
            clients: HashSet::new(),
            router,
            directory,
            settings,
        };

        tokio::spawn(agent.run().instrument(info_span!("agent")));

        Self(tx)
    }

    /// Inform the agent of some event.
    pub fn inform(&self, information: Inform) {
        if let Err(e) = self.0.unbounded_send(AgentMessage::Inform(information)) {
            debug!(message = ?e.into_inner(), "Agent gone");
        }
    }

    /// Current instrument connectivity.
    pub async fn state(&self) -> Result<LinkState, Error> {
        let (tx, rx) = oneshot::channel();
        self.0
            .unbounded_send(AgentMessage::State(tx))
            .map_err(|_| Error::AgentGone)?;

        rx.await.map_err(|_| Error::AgentGone)
    }
}

#[derive(Debug)]
struct Shared {
    config: Config,
    topology: Arc<dyn Topology>,
}

/// Everything a connection, link or command handler needs to reach the agent.
#[derive(Debug, Clone)]
pub struct AgentContext {
    router: RouterHandle,
    agent: AgentHandle,
    shared: Arc<Shared>,
}

impl AgentContext {
    /// Bundle the agent's parts.
    pub fn new(
        router: RouterHandle,
        agent: AgentHandle,
        config: Config,
        topology: Arc<dyn Topology>,
    ) -> Self {
        Self {
            router,
            agent,
            shared: Arc::new(Shared { config, topology }),
        }
    }

    /// The router.
    pub fn router(&self) -> &RouterHandle {
        &self.router
    }

    /// The agent task.
    pub fn agent(&self) -> &AgentHandle {
        &self.agent
    }

    /// The running configuration.
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// The instrument topology.
    pub fn topology(&self) -> &dyn Topology {
        self.shared.topology.as_ref()
    }
}

/// External collaborators of an agent.
#[derive(Debug, Clone)]
pub struct Collaborators {
    /// Where services are announced.
    pub directory: Arc<dyn ServiceDirectory>,
    /// Where statistics go.
    pub publisher: Arc<dyn StatsPublisher>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            directory: Arc::new(LoggingDirectory),
            publisher: Arc::new(LoggingPublisher),
        }
    }
}

/// The ports an agent ended up listening on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ports {
    /// Driver data.
    pub data: u16,
    /// Commands.
    pub command: u16,
    /// Sniffers.
    pub sniff: u16,
    /// Raw driver-assist, if enabled.
    pub raw: Option<u16>,
}

struct Server {
    service: &'static str,
    port: u16,
    spec: ConnectionSpec,
}

fn servers(ports: &ServerPorts) -> Vec<Server> {
    let mut servers = vec![
        Server {
            service: "port-agent",
            port: ports.data,
            spec: ConnectionSpec::server(EndpointType::Client, Inbound::Raw(PacketType::FromDriver)),
        },
        Server {
            service: "command-port-agent",
            port: ports.command,
            spec: ConnectionSpec::server(EndpointType::Command, Inbound::Commands),
        },
        Server {
            service: "sniff-port-agent",
            port: ports.sniff,
            spec: ConnectionSpec::server(EndpointType::Sniffer, Inbound::Raw(PacketType::Unknown)),
        },
    ];

    if let Some(port) = ports.raw {
        servers.push(Server {
            service: "raw-port-agent",
            port,
            spec: ConnectionSpec::server(
                EndpointType::RawClient,
                Inbound::Raw(PacketType::FromDriver),
            ),
        });
    }

    servers
}

/// A running port agent.
///
/// Dropping it stops the servers and instrument links.
#[derive(Debug)]
pub struct PortAgent {
    ports: Ports,
    context: AgentContext,
    tasks: JoinSet<Result<(), Error>>,
}

impl PortAgent {
    /// Bring up an agent.
    ///
    /// Only an invalid configuration, a server port which can not be bound
    /// or a log file which can not be opened make this fail. Instrument and
    /// service directory trouble is retried in the background.
    pub async fn start(config: Config, collaborators: Collaborators) -> Result<Self, Error> {
        config.validate()?;

        let topology = config.topology();
        let target = config.target_connections(topology.as_ref());
        info!(refdes = %config.refdes, topology = topology.name(), %target, "Starting port agent");

        let router = RouterHandle::new(
            RouteTable::port_agent_defaults(),
            Some(Reporting {
                interval: config.timing.stats(),
                reference_designator: config.refdes.clone(),
                publisher: collaborators.publisher,
            }),
        );

        let mut listeners = vec![];
        let mut registrations = vec![];
        for server in servers(&config.ports) {
            let listener = server::bind(server.port).await?;
            let port = listener.local_addr()?.port();
            info!(service = server.service, %port, "Listening");

            registrations.push(ServiceRegistration::new(
                server.service,
                &config.refdes,
                port,
                config.timing.ttl_secs,
            ));
            listeners.push((listener, port, server.spec));
        }

        let ports = Ports {
            data: listeners[0].1,
            command: listeners[1].1,
            sniff: listeners[2].1,
            raw: listeners.get(3).map(|(_, port, _)| *port),
        };

        let agent = AgentHandle::new(
            AgentSettings {
                target,
                forgiveness: config.timing.forgiveness(),
                heartbeat: config.timing.heartbeat(),
                service_ids: registrations.iter().map(|r| r.id.clone()).collect(),
            },
            router.clone(),
            collaborators.directory.clone(),
        );

        let mut tasks = JoinSet::new();
        tasks.spawn(directory::register_all(
            collaborators.directory,
            registrations,
            config.timing.registration_retry(),
        ));

        if let Some(dir) = &config.log_dir {
            std::fs::create_dir_all(dir)?;
            router.register(logfile::spawn(EndpointType::Logger, dir, &config.refdes, "log")?);
            router.register(logfile::spawn(
                EndpointType::DataLogger,
                dir,
                &config.refdes,
                "datalog",
            )?);
        }

        let context = AgentContext::new(router, agent, config, topology.clone());

        for (listener, _, spec) in listeners {
            tasks.spawn(server::serve(listener, spec, context.clone()));
        }

        topology.start_instrument_links(&context, &mut tasks);

        Ok(Self {
            ports,
            context,
            tasks,
        })
    }

    /// The ports the servers listen on.
    pub fn ports(&self) -> Ports {
        self.ports
    }

    /// Handles to the agent's parts.
    pub fn context(&self) -> &AgentContext {
        &self.context
    }

    /// Run until a server or link task fails.
    pub async fn wait(&mut self) -> Result<(), Error> {
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => return Err(e),
                Err(e) => {
                    warn!(%e, "Task failed");
                    return Err(Error::TaskFailed(e.to_string()));
                }
            }
        }

        Ok(())
    }
}
