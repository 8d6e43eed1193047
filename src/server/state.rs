use std::collections::BTreeSet;
use std::fmt;
use std::time::SystemTime;

use serde::Serialize;
use tracing::debug;

use super::classifier::Event;

/// Lifecycle phase of the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
pub enum Phase {
    #[default]
    Unknown,
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

impl Phase {
    /// Stopped and Crashed are only left by reattaching
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Stopped | Phase::Crashed)
    }

    /// Phase after `event`, or `None` when the table has no such transition
    fn transition(self, event: &Event) -> Option<Phase> {
        use Phase::*;
        match (event, self) {
            (Event::ServerStarted, Unknown | Starting | Running) => Some(Running),
            (Event::ServerStopped, Running | Stopping) => Some(Stopped),
            (Event::ServerCrashed, Starting | Running) => Some(Crashed),
            (Event::ServerStarted | Event::ServerStopped | Event::ServerCrashed, _) => None,
            (Event::PlayerJoined { .. } | Event::PlayerLeft { .. }, Starting | Running) => Some(self),
            (Event::PlayerJoined { .. } | Event::PlayerLeft { .. }, _) => None,
            (Event::WorldSaved | Event::Unrecognized { .. }, _) => Some(self),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Aggregate model of the server, folded from events.
///
/// Owned by the controller's read loop; everyone else sees [`ServerStateView`]
/// snapshots.
#[derive(Debug, Clone, Default)]
pub struct ServerState {
    phase: Phase,
    players: BTreeSet<String>,
    last_activity: Option<SystemTime>,
    unrecognized_since_event: u64,
    anomalous_events: u64,
    last_seq: Option<u64>,
    gaps: u64,
}

impl ServerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Fold one event into the state. Never fails: events that make no sense
    /// in the current phase leave the phase alone and are counted.
    pub fn apply(mut self, event: &Event, at: SystemTime) -> Self {
        match self.phase.transition(event) {
            Some(next) => self.phase = next,
            None => {
                self.anomalous_events += 1;
                debug!(phase = %self.phase, ?event, "event not expected in current phase");
            }
        }

        match event {
            Event::ServerStarted => self.players.clear(),
            Event::PlayerJoined { name } => {
                self.players.insert(name.clone());
            }
            Event::PlayerLeft { name } => {
                self.players.remove(name);
            }
            _ => {}
        }

        if event.is_recognized() {
            self.last_activity = Some(at);
            self.unrecognized_since_event = 0;
        } else {
            self.unrecognized_since_event += 1;
        }
        self
    }

    /// Fold an event read from the scrollback captured at attach time.
    ///
    /// Scrollback may cover earlier runs of the server, so a stop or crash
    /// found there only ends that run: players are cleared and the phase goes
    /// back to Starting instead of a terminal phase. Everything else folds as
    /// in [`apply`](Self::apply).
    pub fn recall(mut self, event: &Event, at: SystemTime) -> Self {
        match event {
            Event::ServerStopped | Event::ServerCrashed => {
                debug!(?event, "earlier run ended in scrollback");
                if matches!(self.phase, Phase::Unknown | Phase::Running) {
                    self.phase = Phase::Starting;
                }
                self.players.clear();
                self.last_activity = Some(at);
                self.unrecognized_since_event = 0;
                self
            }
            _ => self.apply(event, at),
        }
    }

    /// Record the sequence number of the line just applied, counting gaps
    pub fn observe_seq(mut self, seq: u64) -> Self {
        if let Some(last) = self.last_seq {
            if seq > last + 1 {
                self.gaps += 1;
            }
        }
        self.last_seq = Some(seq);
        self
    }

    /// Attach bootstrap: the process may already be mid-run
    pub fn begin_bootstrap(mut self) -> Self {
        if self.phase == Phase::Unknown {
            self.phase = Phase::Starting;
        }
        self
    }

    /// Bootstrap window elapsed without a start line
    pub fn end_bootstrap(mut self) -> Self {
        if self.phase == Phase::Starting {
            self.phase = Phase::Running;
        }
        self
    }

    /// The operator asked the server to stop
    pub fn stop_requested(mut self) -> Self {
        if self.phase == Phase::Running {
            self.phase = Phase::Stopping;
        }
        self
    }

    pub fn snapshot(&self) -> ServerStateView {
        ServerStateView {
            phase: self.phase,
            players: self.players.iter().cloned().collect(),
            last_activity: self.last_activity,
            unrecognized_since_event: self.unrecognized_since_event,
            anomalous_events: self.anomalous_events,
            last_seq: self.last_seq,
            gaps: self.gaps,
        }
    }
}

/// Read-only copy of [`ServerState`] handed to observers
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ServerStateView {
    pub phase: Phase,
    /// Online players, sorted by name
    pub players: Vec<String>,
    pub last_activity: Option<SystemTime>,
    pub unrecognized_since_event: u64,
    pub anomalous_events: u64,
    pub last_seq: Option<u64>,
    pub gaps: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joined(name: &str) -> Event {
        Event::PlayerJoined { name: name.into() }
    }

    fn left(name: &str) -> Event {
        Event::PlayerLeft { name: name.into() }
    }

    fn replay(state: ServerState, events: &[Event]) -> ServerState {
        events
            .iter()
            .fold(state, |s, e| s.apply(e, SystemTime::now()))
    }

    fn running() -> ServerState {
        replay(ServerState::new(), &[Event::ServerStarted])
    }

    #[test]
    fn test_player_fold() {
        let state = replay(running(), &[joined("Alice"), joined("Bob"), left("Alice")]);
        assert_eq!(state.snapshot().players, vec!["Bob".to_string()]);
    }

    #[test]
    fn test_start_resets_players() {
        let state = replay(running(), &[joined("Alice"), Event::ServerStarted]);
        assert!(state.snapshot().players.is_empty());
        assert_eq!(state.phase(), Phase::Running);
    }

    #[test]
    fn test_unknown_player_leaving_is_noop() {
        let state = replay(running(), &[joined("Bob"), left("Carol")]);
        assert_eq!(state.snapshot().players, vec!["Bob".to_string()]);
        assert_eq!(state.snapshot().anomalous_events, 0);
    }

    #[test]
    fn test_unrecognized_leaves_phase_and_counts() {
        let before = running();
        let noise = Event::Unrecognized { raw: "noise".into() };
        let after = replay(before.clone(), &[noise.clone(), noise]);
        assert_eq!(after.phase(), before.phase());
        assert_eq!(after.snapshot().unrecognized_since_event, 2);

        let after = replay(after, &[Event::WorldSaved]);
        assert_eq!(after.snapshot().unrecognized_since_event, 0);
        assert!(after.snapshot().last_activity.is_some());
    }

    #[test]
    fn test_lifecycle_transitions() {
        let state = replay(running(), &[Event::ServerStopped]);
        assert_eq!(state.phase(), Phase::Stopped);

        let state = replay(running(), &[Event::ServerCrashed]);
        assert_eq!(state.phase(), Phase::Crashed);

        let state = ServerState::new().begin_bootstrap();
        assert_eq!(state.phase(), Phase::Starting);
        assert_eq!(replay(state.clone(), &[Event::ServerStarted]).phase(), Phase::Running);
        assert_eq!(replay(state.clone(), &[Event::ServerCrashed]).phase(), Phase::Crashed);
        assert_eq!(state.end_bootstrap().phase(), Phase::Running);

        let state = running().stop_requested();
        assert_eq!(state.phase(), Phase::Stopping);
        assert_eq!(replay(state, &[Event::ServerStopped]).phase(), Phase::Stopped);
    }

    #[test]
    fn test_terminal_phases_hold() {
        let stopped = replay(running(), &[Event::ServerStopped]);
        let after = replay(stopped, &[Event::ServerStarted, Event::ServerCrashed, joined("Eve")]);
        assert_eq!(after.phase(), Phase::Stopped);
        assert!(after.phase().is_terminal());
        assert_eq!(after.snapshot().anomalous_events, 3);
        // the roster still follows the fold
        assert_eq!(after.snapshot().players, vec!["Eve".to_string()]);
    }

    #[test]
    fn test_unexpected_events_are_anomalous() {
        let state = replay(ServerState::new(), &[Event::ServerStopped, joined("Bob")]);
        assert_eq!(state.phase(), Phase::Unknown);
        assert_eq!(state.snapshot().anomalous_events, 2);
    }

    #[test]
    fn test_replay_stays_within_table() {
        let events = [
            Event::ServerCrashed,
            Event::ServerStarted,
            joined("A"),
            Event::WorldSaved,
            Event::ServerStopped,
            Event::ServerStarted,
            Event::Unrecognized { raw: String::new() },
            Event::ServerCrashed,
        ];
        // every prefix of every rotation lands on a phase reachable from Unknown
        for shift in 0..events.len() {
            let mut state = ServerState::new();
            let mut previous = state.phase();
            for i in 0..events.len() {
                let event = &events[(i + shift) % events.len()];
                state = state.apply(event, SystemTime::now());
                let next = state.phase();
                let allowed = next == previous || previous.transition(event) == Some(next);
                assert!(allowed, "{previous:?} -> {next:?} on {event:?}");
                previous = next;
            }
        }
    }

    #[test]
    fn test_scrollback_never_ends_in_terminal_phase() {
        let recall = |events: &[Event]| {
            events
                .iter()
                .fold(ServerState::new().begin_bootstrap(), |s, e| s.recall(e, SystemTime::now()))
        };

        let state = recall(&[Event::ServerStarted, joined("Bob"), Event::ServerCrashed]);
        assert_eq!(state.phase(), Phase::Starting);
        assert!(state.snapshot().players.is_empty());
        assert_eq!(state.snapshot().anomalous_events, 0);

        let state = recall(&[Event::ServerCrashed, Event::ServerStarted, joined("Alex")]);
        assert_eq!(state.phase(), Phase::Running);
        assert_eq!(state.snapshot().players, vec!["Alex".to_string()]);

        // live output after the scrollback still ends a run for good
        let state = state.apply(&Event::ServerStopped, SystemTime::now());
        assert!(state.phase().is_terminal());
    }

    #[test]
    fn test_sequence_gaps_are_counted() {
        let state = ServerState::new().observe_seq(0).observe_seq(1).observe_seq(3);
        assert_eq!(state.snapshot().gaps, 1);
        assert_eq!(state.snapshot().last_seq, Some(3));
    }
}
