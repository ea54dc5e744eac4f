use tokio::time::{self, Duration, Interval, MissedTickBehavior};

use crate::protocol::{now_unix_ms, EventFrame, Heartbeat, HEARTBEAT_STATUS_ALIVE};
use crate::session::Session;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(15);

/// Peer-side heartbeat source. Ticks on an untrusted channel are dropped,
/// never queued.
#[derive(Debug)]
pub struct LivenessForwarder {
    interval: Duration,
    sent: u64,
    skipped: u64,
}

impl Default for LivenessForwarder {
    fn default() -> Self {
        Self::new(DEFAULT_INTERVAL)
    }
}

impl LivenessForwarder {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            sent: 0,
            skipped: 0,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// A ticker whose first tick lands one period from now. Late ticks are
    /// skipped rather than bursted.
    pub fn ticker(&self) -> Interval {
        let mut ticker = time::interval_at(time::Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
    }

    pub fn on_tick(&mut self, session: &Session) -> Option<EventFrame> {
        let identity = match session.identity() {
            Some(identity) if session.is_trusted() => identity,
            _ => {
                self.skipped += 1;
                tracing::debug!(
                    handshake = ?session.handshake_state(),
                    connection = ?session.connection_state(),
                    "heartbeat skipped, channel not trusted"
                );
                return None;
            }
        };
        self.sent += 1;
        Some(EventFrame::Heartbeat(Heartbeat {
            profile_id: identity.profile_id.clone(),
            launch_id: identity.launch_id.clone(),
            timestamp: now_unix_ms(),
            status: HEARTBEAT_STATUS_ALIVE.to_string(),
        }))
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayDecision {
    Relay,
    Untrusted,
    IdentityMismatch,
}

/// Host-side check before a heartbeat is passed on to the supervisor.
pub fn relay_decision(session: &Session, heartbeat: &Heartbeat) -> RelayDecision {
    if !session.is_trusted() {
        return RelayDecision::Untrusted;
    }
    if !session.matches_identity(&heartbeat.profile_id, &heartbeat.launch_id) {
        return RelayDecision::IdentityMismatch;
    }
    RelayDecision::Relay
}
