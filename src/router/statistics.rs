use std::{
    collections::BTreeMap,
    fmt::Debug,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::Serialize;
use tracing::{debug, info};

use crate::endpoint::EndpointType;

/// Traffic counters for one endpoint type.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Counters {
    /// Packets routed towards this endpoint type, once per route entry.
    pub packets_in: u64,
    /// Frame bytes routed towards this endpoint type, once per route entry.
    pub bytes_in: u64,
    /// Packets written, once per live connection.
    pub packets_out: u64,
    /// Frame bytes written, once per live connection.
    pub bytes_out: u64,
    /// Connections registered.
    pub adds: u64,
    /// Connections removed.
    pub removes: u64,
    /// Routes added.
    pub routes: u64,
}

/// Counters per endpoint type, since the last flush.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Statistics {
    counters: BTreeMap<EndpointType, Counters>,
}

impl Statistics {
    /// The counters for an endpoint type, zero if nothing happened.
    pub fn get(&self, endpoint_type: EndpointType) -> Counters {
        self.counters
            .get(&endpoint_type)
            .copied()
            .unwrap_or_default()
    }

    /// Whether anything was counted for this endpoint type.
    pub fn contains(&self, endpoint_type: EndpointType) -> bool {
        self.counters.contains_key(&endpoint_type)
    }

    pub(crate) fn entry(&mut self, endpoint_type: EndpointType) -> &mut Counters {
        self.counters.entry(endpoint_type).or_default()
    }

    pub(crate) fn clear(&mut self) {
        self.counters.clear();
    }

    /// Log per endpoint rates over `interval`.
    pub(crate) fn log_rates(&self, interval: Duration) {
        let seconds = interval.as_secs_f64().max(f64::EPSILON);

        for (endpoint_type, c) in &self.counters {
            debug!(
                %endpoint_type,
                adds = c.adds,
                removes = c.removes,
                packets_in = c.packets_in,
                packets_in_rate = c.packets_in as f64 / seconds,
                packets_out = c.packets_out,
                packets_out_rate = c.packets_out as f64 / seconds,
                kb_in = c.bytes_in / 1000,
                kb_in_rate = c.bytes_in as f64 / seconds / 1000.,
                kb_out = c.bytes_out / 1000,
                kb_out_rate = c.bytes_out as f64 / seconds / 1000.,
                "Router stats"
            );
        }
    }
}

/// The periodic summary handed to a [`StatsPublisher`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsReport {
    /// Bytes routed towards drivers.
    pub bytes_in: u64,
    /// Bytes written to drivers.
    pub bytes_out: u64,
    /// Live connections per endpoint type.
    pub num_clients: BTreeMap<EndpointType, usize>,
    /// Seconds covered by this report.
    pub elapsed: f64,
    /// Unix time at the end of the interval.
    pub end_time: f64,
    /// The instrument this agent serves.
    pub reference_designator: String,
    /// Drivers that connected during the interval.
    pub adds: u64,
}

impl StatsReport {
    pub(crate) fn new(
        statistics: &Statistics,
        num_clients: BTreeMap<EndpointType, usize>,
        elapsed: Duration,
        end_time: SystemTime,
        reference_designator: &str,
    ) -> Self {
        let client = statistics.get(EndpointType::Client);

        Self {
            bytes_in: client.bytes_in,
            bytes_out: client.bytes_out,
            num_clients,
            elapsed: elapsed.as_secs_f64(),
            end_time: end_time
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs_f64(),
            reference_designator: reference_designator.to_owned(),
            adds: client.adds,
        }
    }
}

/// Where statistics reports go, e.g. a message queue.
///
/// Called from the router task, so implementations must not block.
/// Failures are the publisher's to log; they never reach the router.
pub trait StatsPublisher: Send + Sync + Debug {
    /// Publish one report.
    fn publish(&self, report: &StatsReport);
}

/// Publishes reports to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingPublisher;

impl StatsPublisher for LoggingPublisher {
    fn publish(&self, report: &StatsReport) {
        match serde_json::to_string(report) {
            Ok(json) => info!(%json, "Statistics"),
            Err(e) => debug!(?e, "Could not serialize statistics"),
        }
    }
}
