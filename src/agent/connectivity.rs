use std::{collections::HashSet, fmt::Display};

use crate::endpoint::ConnectionId;

/// The observable instrument connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// The target number of instrument links are up.
    Connected,
    /// Fewer than the target number of instrument links are up.
    Disconnected,
}

impl Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkState::Connected => f.write_str("CONNECTED"),
            LinkState::Disconnected => f.write_str("DISCONNECTED"),
        }
    }
}

/// What the owner of a [`Connectivity`] has to do after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Tell everyone the instrument is connected.
    ReportConnected,
    /// Tell everyone the instrument is disconnected.
    ReportDisconnected,
    /// Start the forgiveness timer, calling [`Connectivity::timer_fired`]
    /// with this generation when it runs out.
    ArmTimer(u64),
}

/// Debounced instrument connectivity.
///
/// Connecting the last missing link reports `CONNECTED` right away.
/// Losing a link while `CONNECTED` only arms a timer; `DISCONNECTED` is
/// reported if the target is still not met when it fires. Links lost after
/// that arm nothing, so each state is reported once per change. At most one
/// timer is pending, and a timer from before a reconnect is recognised by
/// its generation and ignored.
#[derive(Debug, Clone)]
pub struct Connectivity {
    live: HashSet<ConnectionId>,
    target: usize,
    reported: LinkState,
    pending: Option<u64>,
    generation: u64,
}

impl Connectivity {
    /// Start with no live links.
    pub fn new(target: usize) -> Self {
        Self {
            live: HashSet::new(),
            target,
            reported: LinkState::Disconnected,
            pending: None,
            generation: 0,
        }
    }

    /// Current state, recomputed from the live set.
    pub fn state(&self) -> LinkState {
        if self.live.len() >= self.target {
            LinkState::Connected
        } else {
            LinkState::Disconnected
        }
    }

    /// Number of live links.
    pub fn live(&self) -> usize {
        self.live.len()
    }

    /// The generation of the armed timer, if any.
    pub fn pending(&self) -> Option<u64> {
        self.pending
    }

    /// A link came up.
    pub fn connected(&mut self, id: ConnectionId) -> Option<Effect> {
        let before = self.live.len();
        if !self.live.insert(id) {
            return None;
        }

        if before < self.target && self.live.len() >= self.target {
            self.pending = None;
            self.reported = LinkState::Connected;
            Some(Effect::ReportConnected)
        } else {
            None
        }
    }

    /// A link went down. Unknown links are ignored.
    pub fn disconnected(&mut self, id: ConnectionId) -> Option<Effect> {
        if !self.live.remove(&id) {
            return None;
        }

        if self.pending.is_some() || self.reported == LinkState::Disconnected {
            return None;
        }

        self.generation += 1;
        self.pending = Some(self.generation);
        Some(Effect::ArmTimer(self.generation))
    }

    /// The forgiveness timer of `generation` ran out.
    pub fn timer_fired(&mut self, generation: u64) -> Option<Effect> {
        if self.pending != Some(generation) {
            return None;
        }
        self.pending = None;

        if self.state() == LinkState::Disconnected {
            self.reported = LinkState::Disconnected;
            Some(Effect::ReportDisconnected)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn second_of_two_links_reports_connected_once() {
        let (a, b) = (ConnectionId::new(), ConnectionId::new());
        let mut c = Connectivity::new(2);

        assert_eq!(c.connected(a), None);
        assert_eq!(c.state(), LinkState::Disconnected);
        assert_eq!(c.connected(b), Some(Effect::ReportConnected));
        assert_eq!(c.connected(b), None);
        assert_eq!(c.state(), LinkState::Connected);
    }

    #[test]
    fn reconnect_before_timer_cancels_it() {
        let (a, b, b2) = (ConnectionId::new(), ConnectionId::new(), ConnectionId::new());
        let mut c = Connectivity::new(2);
        c.connected(a);
        c.connected(b);

        assert_eq!(c.disconnected(b), Some(Effect::ArmTimer(1)));
        assert_eq!(c.state(), LinkState::Disconnected);
        assert_eq!(c.connected(b2), Some(Effect::ReportConnected));
        assert_eq!(c.pending(), None);
        assert_eq!(c.timer_fired(1), None);
    }

    #[test]
    fn timer_reports_disconnected_once() {
        let (a, b) = (ConnectionId::new(), ConnectionId::new());
        let mut c = Connectivity::new(2);
        c.connected(a);
        c.connected(b);

        assert_eq!(c.disconnected(a), Some(Effect::ArmTimer(1)));
        // Already pending, no second timer.
        assert_eq!(c.disconnected(b), None);
        assert_eq!(c.timer_fired(1), Some(Effect::ReportDisconnected));
        assert_eq!(c.timer_fired(1), None);
    }

    #[test]
    fn stale_generation_is_ignored() {
        let a = ConnectionId::new();
        let mut c = Connectivity::new(1);
        c.connected(a);

        assert_eq!(c.disconnected(a), Some(Effect::ArmTimer(1)));
        let a2 = ConnectionId::new();
        c.connected(a2);
        assert_eq!(c.disconnected(a2), Some(Effect::ArmTimer(2)));

        assert_eq!(c.timer_fired(1), None);
        assert_eq!(c.timer_fired(2), Some(Effect::ReportDisconnected));
    }

    #[test]
    fn losing_more_links_after_disconnected_reports_nothing() {
        let (a, b) = (ConnectionId::new(), ConnectionId::new());
        let mut c = Connectivity::new(2);
        c.connected(a);
        c.connected(b);

        assert_eq!(c.disconnected(a), Some(Effect::ArmTimer(1)));
        assert_eq!(c.timer_fired(1), Some(Effect::ReportDisconnected));

        assert_eq!(c.disconnected(b), None);
        assert_eq!(c.pending(), None);
    }

    #[test]
    fn link_lost_before_ever_connecting_reports_nothing() {
        let (a, b) = (ConnectionId::new(), ConnectionId::new());
        let mut c = Connectivity::new(2);
        c.connected(a);

        assert_eq!(c.disconnected(a), None);
        assert_eq!(c.connected(a), None);
        assert_eq!(c.connected(b), Some(Effect::ReportConnected));
    }

    #[test]
    fn unknown_disconnect_is_ignored() {
        let mut c = Connectivity::new(1);
        assert_eq!(c.disconnected(ConnectionId::new()), None);
        assert_eq!(c.pending(), None);
    }
}
