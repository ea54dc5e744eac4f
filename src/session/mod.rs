use thiserror::Error;
use uuid::Uuid;

use crate::protocol::{
    now_unix_ms, HandshakeConfirm, HandshakeFrame, HostReady, InboundMessage, PeerReady,
};
use crate::reconnect::{BackoffConfig, ReconnectPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HandshakeState {
    None,
    PeerReady,
    HostReady,
    Confirmed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub profile_id: String,
    pub launch_id: String,
    pub peer_id: String,
    pub profile_alias: String,
}

impl SessionIdentity {
    /// Fresh launch and peer ids for a profile.
    pub fn generate(profile_id: impl Into<String>, profile_alias: impl Into<String>) -> Self {
        Self {
            profile_id: profile_id.into(),
            launch_id: Uuid::new_v4().to_string(),
            peer_id: Uuid::new_v4().to_string(),
            profile_alias: profile_alias.into(),
        }
    }

    fn from_peer_ready(frame: &PeerReady) -> Self {
        Self {
            profile_id: frame.profile_id.clone(),
            launch_id: frame.launch_id.clone(),
            peer_id: frame.peer_id.clone(),
            profile_alias: frame.profile_alias.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub capabilities: Vec<String>,
    pub version: String,
    pub max_message_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("{event} is not allowed in handshake state {state:?}")]
    OutOfOrder {
        state: HandshakeState,
        event: &'static str,
    },
    #[error("{event} is not allowed while {state:?}")]
    Connection {
        state: ConnectionState,
        event: &'static str,
    },
    #[error("handshake_confirm {field} does not match the announced identity")]
    IdentityMismatch { field: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostReadyOutcome {
    Accepted,
    /// A repeated `host_ready` after the session already advanced.
    Ignored,
}

/// Connection and handshake state for one peer/host pairing.
///
/// The handshake only moves forward one step at a time; the sole way back is
/// [`Session::on_disconnect`], which resets both states together.
#[derive(Debug)]
pub struct Session {
    connection: ConnectionState,
    handshake: HandshakeState,
    identity: Option<SessionIdentity>,
    host_info: Option<HostInfo>,
    reconnect: ReconnectPolicy,
}

impl Session {
    pub fn new(backoff: BackoffConfig) -> Self {
        Self {
            connection: ConnectionState::Disconnected,
            handshake: HandshakeState::None,
            identity: None,
            host_info: None,
            reconnect: ReconnectPolicy::new(backoff),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.handshake
    }

    pub fn identity(&self) -> Option<&SessionIdentity> {
        self.identity.as_ref()
    }

    pub fn host_info(&self) -> Option<&HostInfo> {
        self.host_info.as_ref()
    }

    pub fn reconnect(&self) -> &ReconnectPolicy {
        &self.reconnect
    }

    pub fn reconnect_mut(&mut self) -> &mut ReconnectPolicy {
        &mut self.reconnect
    }

    /// Confirmed over a live transport.
    pub fn is_trusted(&self) -> bool {
        self.handshake == HandshakeState::Confirmed && self.connection == ConnectionState::Connected
    }

    pub fn matches_identity(&self, profile_id: &str, launch_id: &str) -> bool {
        self.identity
            .as_ref()
            .is_some_and(|id| id.profile_id == profile_id && id.launch_id == launch_id)
    }

    /// Handshake frames always pass; everything else needs the remote side's
    /// readiness first.
    pub fn admits(&self, message: &InboundMessage) -> bool {
        message.is_handshake()
            || matches!(
                self.handshake,
                HandshakeState::HostReady | HandshakeState::Confirmed
            )
    }

    pub fn begin_connect(&mut self) -> Result<(), HandshakeError> {
        if self.connection != ConnectionState::Disconnected {
            return Err(HandshakeError::Connection {
                state: self.connection,
                event: "connect",
            });
        }
        self.connection = ConnectionState::Connecting;
        Ok(())
    }

    pub fn on_connect_failed(&mut self) {
        if self.connection == ConnectionState::Connecting {
            self.connection = ConnectionState::Disconnected;
        }
    }

    /// Peer side: the transport is up, announce identity.
    pub fn on_transport_connected(
        &mut self,
        identity: SessionIdentity,
    ) -> Result<HandshakeFrame, HandshakeError> {
        if self.connection == ConnectionState::Connected {
            return Err(HandshakeError::Connection {
                state: self.connection,
                event: "transport connected",
            });
        }
        self.advance(HandshakeState::None, HandshakeState::PeerReady, "peer_ready")?;
        self.connection = ConnectionState::Connected;
        self.reconnect.reset();

        let frame = HandshakeFrame::PeerReady(PeerReady {
            profile_id: identity.profile_id.clone(),
            launch_id: identity.launch_id.clone(),
            peer_id: identity.peer_id.clone(),
            profile_alias: identity.profile_alias.clone(),
            timestamp: now_unix_ms(),
        });
        self.identity = Some(identity);
        Ok(frame)
    }

    pub fn on_host_ready(&mut self, frame: &HostReady) -> Result<HostReadyOutcome, HandshakeError> {
        match self.handshake {
            HandshakeState::HostReady | HandshakeState::Confirmed => {
                tracing::warn!(state = ?self.handshake, "repeated host_ready ignored");
                Ok(HostReadyOutcome::Ignored)
            }
            _ => {
                self.advance(HandshakeState::PeerReady, HandshakeState::HostReady, "host_ready")?;
                self.host_info = Some(HostInfo {
                    capabilities: frame.capabilities.clone(),
                    version: frame.version.clone(),
                    max_message_size: frame.max_message_size,
                });
                Ok(HostReadyOutcome::Accepted)
            }
        }
    }

    /// Peer side: acknowledge the host and trust the channel.
    pub fn confirm(&mut self) -> Result<HandshakeFrame, HandshakeError> {
        let Some(identity) = self.identity.clone() else {
            return Err(HandshakeError::OutOfOrder {
                state: self.handshake,
                event: "handshake_confirm",
            });
        };
        self.advance(
            HandshakeState::HostReady,
            HandshakeState::Confirmed,
            "handshake_confirm",
        )?;
        Ok(HandshakeFrame::HandshakeConfirm(HandshakeConfirm {
            profile_id: identity.profile_id,
            launch_id: identity.launch_id,
            peer_id: identity.peer_id,
            timestamp: now_unix_ms(),
        }))
    }

    /// Host side: the peer announced itself.
    pub fn on_peer_ready(&mut self, frame: &PeerReady) -> Result<(), HandshakeError> {
        self.advance(HandshakeState::None, HandshakeState::PeerReady, "peer_ready")?;
        self.connection = ConnectionState::Connected;
        self.identity = Some(SessionIdentity::from_peer_ready(frame));
        Ok(())
    }

    pub fn mark_host_ready_sent(&mut self) -> Result<(), HandshakeError> {
        self.advance(HandshakeState::PeerReady, HandshakeState::HostReady, "host_ready")
    }

    pub fn on_confirm(&mut self, frame: &HandshakeConfirm) -> Result<(), HandshakeError> {
        if self.handshake != HandshakeState::HostReady {
            return Err(HandshakeError::OutOfOrder {
                state: self.handshake,
                event: "handshake_confirm",
            });
        }
        if let Some(identity) = &self.identity {
            if identity.profile_id != frame.profile_id {
                return Err(HandshakeError::IdentityMismatch { field: "profile_id" });
            }
            if identity.launch_id != frame.launch_id {
                return Err(HandshakeError::IdentityMismatch { field: "launch_id" });
            }
            if identity.peer_id != frame.peer_id {
                return Err(HandshakeError::IdentityMismatch { field: "peer_id" });
            }
        }
        self.advance(
            HandshakeState::HostReady,
            HandshakeState::Confirmed,
            "handshake_confirm",
        )
    }

    /// Forces `None` + `Disconnected` and returns the handshake state that was
    /// lost. The reconnect counter is kept.
    pub fn on_disconnect(&mut self) -> HandshakeState {
        let previous = self.handshake;
        self.handshake = HandshakeState::None;
        self.connection = ConnectionState::Disconnected;
        self.host_info = None;
        previous
    }

    fn advance(
        &mut self,
        from: HandshakeState,
        to: HandshakeState,
        event: &'static str,
    ) -> Result<(), HandshakeError> {
        if self.handshake != from {
            return Err(HandshakeError::OutOfOrder {
                state: self.handshake,
                event,
            });
        }
        tracing::debug!(from = ?from, to = ?to, "handshake advanced");
        self.handshake = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CommandFrame;
    use crate::reconnect::ScheduleDecision;
    use serde_json::Value;

    fn host_ready() -> HostReady {
        HostReady {
            capabilities: vec!["chunking".to_string()],
            version: "1.0.0".to_string(),
            max_message_size: 1024 * 1024,
        }
    }

    fn command() -> InboundMessage {
        InboundMessage::Command(CommandFrame {
            command: "element-click".to_string(),
            id: "c1".to_string(),
            target: Value::Null,
            payload: Value::Null,
        })
    }

    fn peer_session() -> Session {
        let mut session = Session::new(BackoffConfig::default());
        session.begin_connect().unwrap();
        session
            .on_transport_connected(SessionIdentity::generate("profile-a", "Work"))
            .unwrap();
        session
    }

    #[test]
    fn peer_handshake_runs_forward() {
        let mut session = peer_session();
        assert_eq!(session.handshake_state(), HandshakeState::PeerReady);
        assert_eq!(
            session.on_host_ready(&host_ready()).unwrap(),
            HostReadyOutcome::Accepted
        );
        let frame = session.confirm().unwrap();
        assert_eq!(frame.name(), "handshake_confirm");
        assert!(session.is_trusted());
        assert_eq!(session.host_info().unwrap().max_message_size, 1024 * 1024);
    }

    #[test]
    fn skipping_host_ready_is_rejected() {
        let mut session = peer_session();
        let err = session.confirm().unwrap_err();
        assert_eq!(
            err,
            HandshakeError::OutOfOrder {
                state: HandshakeState::PeerReady,
                event: "handshake_confirm"
            }
        );
        assert_eq!(session.handshake_state(), HandshakeState::PeerReady);
    }

    #[test]
    fn host_ready_before_peer_ready_is_rejected() {
        let mut session = Session::new(BackoffConfig::default());
        assert!(session.on_host_ready(&host_ready()).is_err());
        assert_eq!(session.handshake_state(), HandshakeState::None);
    }

    #[test]
    fn repeated_host_ready_is_ignored() {
        let mut session = peer_session();
        session.on_host_ready(&host_ready()).unwrap();
        session.confirm().unwrap();
        assert_eq!(
            session.on_host_ready(&host_ready()).unwrap(),
            HostReadyOutcome::Ignored
        );
        assert_eq!(session.handshake_state(), HandshakeState::Confirmed);
    }

    #[test]
    fn disconnect_resets_both_states_from_anywhere() {
        let mut session = peer_session();
        session.on_host_ready(&host_ready()).unwrap();
        session.confirm().unwrap();
        assert_eq!(session.on_disconnect(), HandshakeState::Confirmed);
        assert_eq!(session.handshake_state(), HandshakeState::None);
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
        assert!(session.host_info().is_none());
    }

    #[test]
    fn gating_admits_commands_only_after_host_ready() {
        let mut session = Session::new(BackoffConfig::default());
        let handshake = InboundMessage::Handshake(HandshakeFrame::HostReady(host_ready()));
        assert!(!session.admits(&command()));
        assert!(session.admits(&handshake));

        session.begin_connect().unwrap();
        session
            .on_transport_connected(SessionIdentity::generate("p", ""))
            .unwrap();
        assert!(!session.admits(&command()));

        session.on_host_ready(&host_ready()).unwrap();
        assert!(session.admits(&command()));
        session.confirm().unwrap();
        assert!(session.admits(&command()));

        session.on_disconnect();
        assert!(!session.admits(&command()));
    }

    #[test]
    fn reconnect_attempts_reset_only_on_peer_ready() {
        let mut session = Session::new(BackoffConfig::default());
        for _ in 0..3 {
            assert!(matches!(
                session.reconnect_mut().schedule(),
                ScheduleDecision::Scheduled { .. }
            ));
            session.reconnect_mut().fire();
        }
        session.on_disconnect();
        assert_eq!(session.reconnect().attempts(), 3);

        session.begin_connect().unwrap();
        session.on_connect_failed();
        assert_eq!(session.reconnect().attempts(), 3);

        session.begin_connect().unwrap();
        session
            .on_transport_connected(SessionIdentity::generate("p", ""))
            .unwrap();
        assert_eq!(session.reconnect().attempts(), 0);
    }

    #[test]
    fn host_role_checks_confirm_identity() {
        let mut session = Session::new(BackoffConfig::default());
        let ready = PeerReady {
            profile_id: "p1".to_string(),
            launch_id: "l1".to_string(),
            peer_id: "x1".to_string(),
            profile_alias: String::new(),
            timestamp: 1,
        };
        session.on_peer_ready(&ready).unwrap();
        assert!(session.on_peer_ready(&ready).is_err());
        session.mark_host_ready_sent().unwrap();

        let mut confirm = HandshakeConfirm {
            profile_id: "p1".to_string(),
            launch_id: "other".to_string(),
            peer_id: "x1".to_string(),
            timestamp: 2,
        };
        assert_eq!(
            session.on_confirm(&confirm).unwrap_err(),
            HandshakeError::IdentityMismatch { field: "launch_id" }
        );
        assert_eq!(session.handshake_state(), HandshakeState::HostReady);

        confirm.launch_id = "l1".to_string();
        session.on_confirm(&confirm).unwrap();
        assert!(session.is_trusted());
        assert!(session.matches_identity("p1", "l1"));
        assert!(!session.matches_identity("p1", "l2"));
    }
}
