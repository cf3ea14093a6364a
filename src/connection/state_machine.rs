use std::fmt::{Display, Formatter};

use tracing::{debug, warn};

use crate::error::IpmiError;

/// Lifecycle states of one connection's RMCP+ session.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum SessionState {
    /// Transport up, no BMC contact yet.
    Uninitialized,
    /// Cipher suites discovered.
    CiphersRetrieved,
    /// Authentication capabilities known.
    AuthCapabilitiesReceived,
    /// Open-session request dispatched, awaiting the response.
    OpenSessionSent,
    /// BMC accepted; the managed-system session ID is known.
    OpenSessionComplete,
    Rakp1Sent,
    /// RAKP-2 validated; ready to send RAKP-3.
    Rakp3Waiting,
    Rakp3Sent,
    /// RAKP-4 validated; session keys installed.
    SessionValid,
    /// Local close initiated, close-session command in flight.
    SessionClosing,
    /// Terminal error state.
    Failed,
    /// Terminal.
    Closed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Failed | SessionState::Closed)
    }
}

impl Display for SessionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Events driving the session state machine. Response events are applied
/// only after the corresponding payload validated, so the machine never sees
/// a malformed ack.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Cipher-agnostic ack used to advance after a successful response that
    /// has no dedicated event.
    Default,
    AuthenticationCapabilitiesReceived,
    OpenSessionAck,
    Rakp2Ack,
    Rakp4Ack,
    /// A request's retry budget ran out.
    Timeout,
    SessionCloseRequested,
    ProtocolError(IpmiError),
}

/// Deterministic per-connection state machine for the RMCP+ handshake and
/// session lifecycle. Every (state, event) pair maps to exactly one
/// successor; unexpected pairs fail the connection with a
/// protocol-violation error. Terminal states absorb all further events.
pub struct StateMachine {
    state: SessionState,
    error: Option<IpmiError>,
}

impl StateMachine {
    pub fn new() -> StateMachine {
        StateMachine {
            state: SessionState::Uninitialized,
            error: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The error that moved the machine into `Failed`, if any.
    pub fn error(&self) -> Option<&IpmiError> {
        self.error.as_ref()
    }

    /// Applies an event and returns the successor state.
    pub fn on_event(&mut self, event: SessionEvent) -> SessionState {
        use SessionEvent::*;
        use SessionState::*;

        if self.state.is_terminal() {
            debug!(state = %self.state, ?event, "event in terminal state - ignoring");
            return self.state;
        }

        let next = match (self.state, &event) {
            (Uninitialized, Default) => CiphersRetrieved,
            (CiphersRetrieved, AuthenticationCapabilitiesReceived) => AuthCapabilitiesReceived,
            (OpenSessionSent, OpenSessionAck) => OpenSessionComplete,
            (Rakp1Sent, Rakp2Ack) => Rakp3Waiting,
            (Rakp3Sent, Rakp4Ack) => SessionValid,
            (SessionClosing, Default) => Closed,

            // a local close before the session exists tears down without
            // wire traffic; in-session it first goes through SessionClosing
            (SessionValid, SessionCloseRequested) => SessionClosing,
            (_, SessionCloseRequested) => Closed,

            (_, Timeout) => {
                self.error = Some(IpmiError::ResponseTimeout);
                Failed
            }
            (_, ProtocolError(e)) => {
                self.error = Some(e.clone());
                Failed
            }

            (state, event) => {
                warn!(%state, ?event, "unexpected event for state - failing connection");
                self.error = Some(IpmiError::ProtocolViolation(format!(
                    "unexpected event {:?} in state {}",
                    event, state
                )));
                Failed
            }
        };

        debug!(from = %self.state, to = %next, ?event, "state transition");
        self.state = next;
        next
    }

    /// Transition taken when a handshake request is handed to the messenger.
    /// Fails with *illegal-state* when the operation does not match the
    /// machine's position in the protocol, without touching the wire.
    pub fn on_dispatch(&mut self, operation: HandshakeSend) -> Result<(), IpmiError> {
        use SessionState::*;

        let (required, next) = match operation {
            HandshakeSend::GetCipherSuites => (Uninitialized, Uninitialized),
            HandshakeSend::GetAuthCapabilities => (CiphersRetrieved, CiphersRetrieved),
            HandshakeSend::OpenSession => (AuthCapabilitiesReceived, OpenSessionSent),
            HandshakeSend::Rakp1 => (OpenSessionComplete, Rakp1Sent),
            HandshakeSend::Rakp3 => (Rakp3Waiting, Rakp3Sent),
            HandshakeSend::CloseSession => (SessionClosing, SessionClosing),
        };

        if self.state != required {
            return Err(IpmiError::IllegalState(format!(
                "{:?} requires state {}, connection is in {}",
                operation, required, self.state
            )));
        }
        if next != self.state {
            debug!(from = %self.state, to = %next, "state transition on dispatch");
            self.state = next;
        }
        Ok(())
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// Outbound handshake operations, each valid in exactly one state.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum HandshakeSend {
    GetCipherSuites,
    GetAuthCapabilities,
    OpenSession,
    Rakp1,
    Rakp3,
    CloseSession,
}
