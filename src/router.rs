use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::{Duration, SystemTime},
};

use bytes::Bytes;
use futures::{channel::mpsc, StreamExt};
use tokio::{
    sync::oneshot,
    time::{Instant, Interval},
};
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::{
    endpoint::{Connection, ConnectionId, EndpointType, Format},
    error::Error,
    packet::{Packet, PacketType},
};

/// Counters and the statistics publishing collaborator.
pub mod statistics;

use statistics::{StatsPublisher, StatsReport, Statistics};

/// Which packet types a route applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketFilter {
    /// Every concrete packet type.
    All,
    /// A single packet type.
    Only(PacketType),
}

impl From<PacketType> for PacketFilter {
    fn from(packet_type: PacketType) -> Self {
        Self::Only(packet_type)
    }
}

/// Packet type to (endpoint type, format) mapping.
///
/// Built before the router starts, read only afterwards.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: HashMap<PacketType, Vec<(EndpointType, Format)>>,
    added: BTreeMap<EndpointType, u64>,
}

impl RouteTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route packets matching `filter` to every endpoint of `endpoint_type`,
    /// rendered as `format`.
    ///
    /// Adding the same route twice has no further effect.
    pub fn add_route(
        &mut self,
        filter: impl Into<PacketFilter>,
        endpoint_type: EndpointType,
        format: Format,
    ) -> &mut Self {
        let packet_types = match filter.into() {
            PacketFilter::All => PacketType::ALL.to_vec(),
            PacketFilter::Only(packet_type) => vec![packet_type],
        };

        for packet_type in packet_types {
            debug!(%packet_type, %endpoint_type, ?format, "Add route");
            let entries = self.routes.entry(packet_type).or_default();
            if !entries.contains(&(endpoint_type, format)) {
                entries.push((endpoint_type, format));
            }
        }
        *self.added.entry(endpoint_type).or_default() += 1;

        self
    }

    /// Where packets of this type go.
    pub fn routes_for(&self, packet_type: PacketType) -> &[(EndpointType, Format)] {
        self.routes
            .get(&packet_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// The routes every port agent installs.
    pub fn port_agent_defaults() -> Self {
        use EndpointType::*;
        use PacketType::*;

        let mut table = Self::new();

        table
            .add_route(PacketFilter::All, Logger, Format::Ascii)
            .add_route(PacketFilter::All, DataLogger, Format::Packet)
            .add_route(PacketFilter::All, Sniffer, Format::Ascii)
            .add_route(FromDriver, Instrument, Format::Raw)
            .add_route(FromInstrument, Client, Format::Packet)
            .add_route(FromInstrument, RawClient, Format::Raw)
            .add_route(PickledFromInstrument, Client, Format::Packet)
            .add_route(PaCommand, CommandHandler, Format::Packet)
            .add_route(PaConfig, Client, Format::Packet)
            .add_route(PaFault, Client, Format::Packet)
            .add_route(PaHeartbeat, Client, Format::Packet)
            .add_route(PaStatus, Client, Format::Packet)
            .add_route(DigiCmd, Digi, Format::Raw)
            .add_route(DigiRsp, Client, Format::Packet)
            .add_route(DigiRsp, Command, Format::Packet);

        table
    }
}

/// Periodic statistics flushing.
#[derive(Debug, Clone)]
pub struct Reporting {
    /// How often counters are flushed.
    pub interval: Duration,
    /// Put in every report.
    pub reference_designator: String,
    /// Receives reports.
    pub publisher: Arc<dyn StatsPublisher>,
}

/// Renders a packet at most once per format.
struct Renderings<'a> {
    packet: &'a Packet,
    frame: Option<Bytes>,
    ascii: Option<Bytes>,
}

impl<'a> Renderings<'a> {
    fn new(packet: &'a Packet) -> Self {
        Self {
            packet,
            frame: None,
            ascii: None,
        }
    }

    fn get(&mut self, format: Format) -> Bytes {
        let packet = self.packet;
        match format {
            Format::Raw => packet.payload().clone(),
            Format::Packet => self.frame.get_or_insert_with(|| packet.serialize()).clone(),
            Format::Ascii => self
                .ascii
                .get_or_insert_with(|| Bytes::from(packet.logstring()))
                .clone(),
        }
    }
}

enum RouterMessage {
    GotData(Vec<Packet>),
    Register(Connection),
    Deregister(EndpointType, ConnectionId),
    Statistics(oneshot::Sender<Statistics>),
}

struct Router {
    messages: mpsc::UnboundedReceiver<RouterMessage>,
    routes: RouteTable,
    endpoints: BTreeMap<EndpointType, HashMap<ConnectionId, Connection>>,
    statistics: Statistics,
    reporting: Option<Reporting>,
    interval_started: Option<SystemTime>,
}

impl Router {
    fn new(routes: RouteTable, messages: mpsc::UnboundedReceiver<RouterMessage>) -> Self {
        let mut statistics = Statistics::default();
        for (endpoint_type, count) in &routes.added {
            statistics.entry(*endpoint_type).routes = *count;
        }

        Self {
            messages,
            routes,
            endpoints: BTreeMap::new(),
            statistics,
            reporting: None,
            interval_started: None,
        }
    }

    async fn run(mut self) {
        let mut flush = self.reporting.as_ref().map(|reporting| {
            tokio::time::interval_at(Instant::now() + reporting.interval, reporting.interval)
        });
        self.interval_started = Some(SystemTime::now());

        loop {
            tokio::select! {
                message = self.messages.next() => match message {
                    Some(message) => self.handle(message),
                    None => break,
                },
                _ = tick(&mut flush) => self.flush(),
            }
        }

        debug!("All router handles dropped, stopping");
    }

    fn handle(&mut self, message: RouterMessage) {
        match message {
            RouterMessage::GotData(packets) => {
                for packet in &packets {
                    self.route(packet);
                }
            }
            RouterMessage::Register(connection) => {
                info!(%connection, "Register");
                self.statistics.entry(connection.endpoint_type()).adds += 1;
                self.endpoints
                    .entry(connection.endpoint_type())
                    .or_default()
                    .insert(connection.id(), connection);
            }
            RouterMessage::Deregister(endpoint_type, id) => {
                let removed = self
                    .endpoints
                    .get_mut(&endpoint_type)
                    .and_then(|connections| connections.remove(&id));

                if removed.is_some() {
                    info!(%endpoint_type, %id, "Deregister");
                    self.statistics.entry(endpoint_type).removes += 1;
                } else {
                    trace!(%endpoint_type, %id, "Deregister of unknown connection ignored");
                }
            }
            RouterMessage::Statistics(reply) => {
                let _ = reply.send(self.statistics.clone());
            }
        }
    }

    fn route(&mut self, packet: &Packet) {
        let routes = self.routes.routes_for(packet.packet_type());
        if routes.is_empty() {
            trace!(%packet, "No route");
            return;
        }

        let size = packet.frame_size() as u64;
        let mut renderings = Renderings::new(packet);

        for &(endpoint_type, format) in routes {
            let counters = self.statistics.entry(endpoint_type);
            counters.packets_in += 1;
            counters.bytes_in += size;

            let Some(connections) = self.endpoints.get_mut(&endpoint_type) else {
                continue;
            };

            let mut dead = vec![];
            for (id, connection) in connections.iter() {
                match connection.write(renderings.get(format)) {
                    Ok(()) => {
                        counters.packets_out += 1;
                        counters.bytes_out += size;
                    }
                    Err(e) => {
                        warn!(%e, %connection, "Write failed, dropping connection");
                        dead.push(*id);
                    }
                }
            }

            for id in dead {
                connections.remove(&id);
                counters.removes += 1;
            }
        }
    }

    fn flush(&mut self) {
        let Some(reporting) = &self.reporting else {
            return;
        };

        let now = SystemTime::now();
        let elapsed = self
            .interval_started
            .and_then(|started| now.duration_since(started).ok())
            .unwrap_or(reporting.interval);

        if self.statistics.contains(EndpointType::Client) {
            let num_clients = EndpointType::ALL
                .into_iter()
                .map(|endpoint_type| {
                    let live = self.endpoints.get(&endpoint_type).map_or(0, HashMap::len);
                    (endpoint_type, live)
                })
                .collect();

            let report = StatsReport::new(
                &self.statistics,
                num_clients,
                elapsed,
                now,
                &reporting.reference_designator,
            );
            reporting.publisher.publish(&report);
        }

        self.statistics.log_rates(reporting.interval);
        self.statistics.clear();
        self.interval_started = Some(now);
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Shared access to the router task.
///
/// The task owns the endpoint registry and the statistics, so registrations,
/// routing and counter resets never race. It stops when every handle is dropped.
#[derive(Debug, Clone)]
pub struct RouterHandle(mpsc::UnboundedSender<RouterMessage>);

impl std::fmt::Debug for RouterMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouterMessage::GotData(packets) => write!(f, "GotData({} packets)", packets.len()),
            RouterMessage::Register(connection) => write!(f, "Register({connection})"),
            RouterMessage::Deregister(endpoint_type, id) => {
                write!(f, "Deregister({endpoint_type}/{id})")
            }
            RouterMessage::Statistics(_) => write!(f, "Statistics"),
        }
    }
}

impl RouterHandle {
    /// Start a router with a fixed route table.
    ///
    /// Statistics are flushed and published periodically if `reporting` is given.
    pub fn new(routes: RouteTable, reporting: Option<Reporting>) -> Self {
        let (tx, rx) = mpsc::unbounded();

        let mut router = Router::new(routes, rx);
        router.reporting = reporting;

        tokio::spawn(router.run().instrument(info_span!("router")));

        Self(tx)
    }

    fn send(&self, message: RouterMessage) {
        if let Err(e) = self.0.unbounded_send(message) {
            // Only happens while shutting down.
            debug!(message = ?e.into_inner(), "Router gone");
        }
    }

    /// Route packets to every endpoint subscribed to their type.
    pub fn got_data(&self, packets: Vec<Packet>) {
        if !packets.is_empty() {
            self.send(RouterMessage::GotData(packets));
        }
    }

    /// Start delivering to a connection.
    pub fn register(&self, connection: Connection) {
        self.send(RouterMessage::Register(connection));
    }

    /// Stop delivering to a connection. Unknown connections are ignored.
    pub fn deregister(&self, endpoint_type: EndpointType, id: ConnectionId) {
        self.send(RouterMessage::Deregister(endpoint_type, id));
    }

    /// Counters since the last flush.
    pub async fn statistics(&self) -> Result<Statistics, Error> {
        let (tx, rx) = oneshot::channel();
        self.0
            .unbounded_send(RouterMessage::Statistics(tx))
            .map_err(|_| Error::RouterGone)?;

        rx.await.map_err(|_| Error::RouterGone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Timestamp;
    use futures::channel::mpsc::UnboundedReceiver;
    use pretty_assertions::assert_eq;

    fn packets(packet_type: PacketType, payload: &'static [u8]) -> Vec<Packet> {
        Packet::create_at(payload, packet_type, Timestamp::from_bits(7 << 32))
    }

    fn drain(receiver: &mut UnboundedReceiver<Bytes>) -> Vec<Bytes> {
        let mut got = vec![];
        while let Ok(bytes) = receiver.try_recv() {
            got.push(bytes);
        }
        got
    }

    /// Statistics are answered in order, so once they arrive every earlier message was handled.
    async fn settle(router: &RouterHandle) -> Statistics {
        router.statistics().await.unwrap()
    }

    #[test]
    fn all_expands_and_is_idempotent() {
        let mut table = RouteTable::new();
        table.add_route(PacketFilter::All, EndpointType::Logger, Format::Ascii);
        table.add_route(PacketType::PaStatus, EndpointType::Logger, Format::Ascii);

        for packet_type in PacketType::ALL {
            assert_eq!(
                table.routes_for(packet_type),
                &[(EndpointType::Logger, Format::Ascii)]
            );
        }
    }

    #[tokio::test]
    async fn unrouted_packet_type_writes_nothing() {
        let router = RouterHandle::new(RouteTable::new(), None);
        let (client, mut receiver) = Connection::new(EndpointType::Client);
        router.register(client);

        router.got_data(packets(PacketType::FromInstrument, b"nobody listens"));

        let statistics = settle(&router).await;
        assert!(drain(&mut receiver).is_empty());
        assert_eq!(statistics.get(EndpointType::Client).packets_out, 0);
    }

    #[tokio::test]
    async fn ascii_routes_for_every_type() {
        let mut table = RouteTable::new();
        table.add_route(PacketFilter::All, EndpointType::Sniffer, Format::Ascii);
        let router = RouterHandle::new(table, None);

        let (first, mut first_rx) = Connection::new(EndpointType::Sniffer);
        let (second, mut second_rx) = Connection::new(EndpointType::Sniffer);
        router.register(first);
        router.register(second);

        for packet_type in PacketType::ALL {
            router.got_data(packets(packet_type, b"x"));
        }
        settle(&router).await;

        for receiver in [&mut first_rx, &mut second_rx] {
            let got = drain(receiver);
            assert_eq!(got.len(), PacketType::ALL.len());
            for (bytes, packet_type) in got.iter().zip(PacketType::ALL) {
                let expected = packets(packet_type, b"x")[0].logstring();
                assert_eq!(bytes, &Bytes::from(expected));
            }
        }
    }

    #[tokio::test]
    async fn formats() {
        let mut table = RouteTable::new();
        table
            .add_route(PacketType::FromInstrument, EndpointType::Client, Format::Packet)
            .add_route(PacketType::FromInstrument, EndpointType::RawClient, Format::Raw);
        let router = RouterHandle::new(table, None);

        let (client, mut client_rx) = Connection::new(EndpointType::Client);
        let (raw, mut raw_rx) = Connection::new(EndpointType::RawClient);
        router.register(client);
        router.register(raw);

        let sent = packets(PacketType::FromInstrument, b"data");
        router.got_data(sent.clone());
        settle(&router).await;

        assert_eq!(drain(&mut client_rx), vec![sent[0].serialize()]);
        assert_eq!(drain(&mut raw_rx), vec![Bytes::from_static(b"data")]);
    }

    #[tokio::test]
    async fn dead_connection_does_not_stop_delivery() {
        let mut table = RouteTable::new();
        table.add_route(PacketType::FromInstrument, EndpointType::Client, Format::Raw);
        let router = RouterHandle::new(table, None);

        let (dead, dead_rx) = Connection::new(EndpointType::Client);
        let (alive, mut alive_rx) = Connection::new(EndpointType::Client);
        router.register(dead);
        router.register(alive);
        drop(dead_rx);

        router.got_data(packets(PacketType::FromInstrument, b"one"));
        router.got_data(packets(PacketType::FromInstrument, b"two"));
        let statistics = settle(&router).await;

        assert_eq!(
            drain(&mut alive_rx),
            vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]
        );
        assert_eq!(statistics.get(EndpointType::Client).removes, 1);
        assert_eq!(statistics.get(EndpointType::Client).packets_out, 2);
    }

    #[tokio::test]
    async fn double_deregister_is_harmless() {
        let router = RouterHandle::new(RouteTable::port_agent_defaults(), None);
        let (client, _rx) = Connection::new(EndpointType::Client);
        let id = client.id();

        router.register(client);
        router.deregister(EndpointType::Client, id);
        router.deregister(EndpointType::Client, id);

        let counters = settle(&router).await.get(EndpointType::Client);
        assert_eq!(counters.adds, 1);
        assert_eq!(counters.removes, 1);
    }

    #[tokio::test]
    async fn bytes_out_is_packets_times_size_times_connections() {
        let mut table = RouteTable::new();
        table.add_route(PacketType::FromInstrument, EndpointType::Client, Format::Packet);
        let router = RouterHandle::new(table, None);

        let mut receivers = vec![];
        for _ in 0..3 {
            let (client, rx) = Connection::new(EndpointType::Client);
            router.register(client);
            receivers.push(rx);
        }

        let payload = b"0123456789";
        let n = 5;
        for _ in 0..n {
            router.got_data(packets(PacketType::FromInstrument, payload));
        }

        let counters = settle(&router).await.get(EndpointType::Client);
        let frame_size = (crate::packet::HEADER_SIZE + payload.len()) as u64;
        assert_eq!(counters.bytes_out, n * frame_size * 3);
        assert_eq!(counters.bytes_in, n * frame_size);
        assert_eq!(counters.packets_out, n * 3);
    }

    #[derive(Debug, Default)]
    struct Recording(std::sync::Mutex<Vec<StatsReport>>);

    impl StatsPublisher for Recording {
        fn publish(&self, report: &StatsReport) {
            self.0.lock().unwrap().push(report.clone());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn flush_publishes_and_resets() {
        let publisher = Arc::new(Recording::default());
        let router = RouterHandle::new(
            RouteTable::port_agent_defaults(),
            Some(Reporting {
                interval: Duration::from_secs(60),
                reference_designator: "CE02SHBP-LJ01D".into(),
                publisher: publisher.clone(),
            }),
        );

        let (client, _rx) = Connection::new(EndpointType::Client);
        router.register(client);
        router.got_data(packets(PacketType::FromInstrument, b"abc"));
        settle(&router).await;

        tokio::time::sleep(Duration::from_secs(61)).await;
        let statistics = settle(&router).await;

        let reports = publisher.0.lock().unwrap().clone();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].reference_designator, "CE02SHBP-LJ01D");
        assert_eq!(reports[0].bytes_out, 19);
        assert_eq!(reports[0].adds, 1);
        assert_eq!(reports[0].num_clients[&EndpointType::Client], 1);
        assert_eq!(statistics, Statistics::default());
    }
}
