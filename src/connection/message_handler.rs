use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use bytes::BytesMut;
use rustc_hash::FxHashMap;
use tokio::sync::{oneshot, Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace, warn};

use crate::config::IpmiConfig;
use crate::connection::events::{
    ConnectionEvent, ConnectionEventNotifier, SessionFailedData, UnsolicitedResponseData,
};
use crate::connection::session::SessionRecord;
use crate::connection::session_id::SessionIdGenerator;
use crate::connection::state_machine::{SessionEvent, SessionState, StateMachine};
use crate::connection::Credentials;
use crate::error::IpmiError;
use crate::protocol::asf::{PresencePing, PresencePong};
use crate::protocol::handshake::{OpenSessionResponse, PrivilegeLevel, Rakp2, Rakp4};
use crate::protocol::ipmi_lan::{
    self, encode_request, try_decode_response, IpmiRequest, IpmiResponse,
};
use crate::protocol::rmcp::{RmcpClass, RmcpHeader};
use crate::protocol::session::{PayloadType, SessionHeader, NEXT_HEADER};
use crate::security::CipherSuite;
use crate::timer::{TimerHandle, TimerService, TimerTask};
use crate::transport::{MessageListener, UdpMessenger};

/// A response payload delivered to a waiting sender.
#[derive(Debug)]
pub(crate) enum InboundBody {
    Ipmi(IpmiResponse),
    OpenSession(OpenSessionResponse),
    Rakp2(Rakp2),
    Rakp4(Rakp4),
    Pong(PresencePong),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum ExpectedResponse {
    Ipmi,
    OpenSession,
    Rakp2,
    Rakp4,
    Pong,
}

impl ExpectedResponse {
    fn matches(&self, body: &InboundBody) -> bool {
        matches!(
            (self, body),
            (ExpectedResponse::Ipmi, InboundBody::Ipmi(_))
                | (ExpectedResponse::OpenSession, InboundBody::OpenSession(_))
                | (ExpectedResponse::Rakp2, InboundBody::Rakp2(_))
                | (ExpectedResponse::Rakp4, InboundBody::Rakp4(_))
                | (ExpectedResponse::Pong, InboundBody::Pong(_))
        )
    }
}

/// One outbound request awaiting its response. Destroyed when the matching
/// response arrives, the retry budget runs out, or the connection is torn
/// down.
struct PendingRequest {
    /// The encoded datagram, re-sent verbatim on retry.
    datagram: Vec<u8>,
    expected: ExpectedResponse,
    /// Full correlation key for in-session requests; `None` before a session
    /// exists (the wire key then is a sessionless tag).
    session_seq: Option<u32>,
    retries_left: u32,
    /// Bumped on every re-send so a stale timeout cannot race a response
    /// that was already delivered.
    attempt: u64,
    timeout: TimerHandle,
    completion: Option<oneshot::Sender<Result<InboundBody, IpmiError>>>,
    /// Pipeline slot, returned when this entry is destroyed.
    _permit: Option<OwnedSemaphorePermit>,
}

pub(crate) struct HandlerState {
    pub machine: StateMachine,
    pub session: Option<SessionRecord>,
    pub requested_suite: Option<CipherSuite>,
    pub requested_privilege: Option<PrivilegeLevel>,
    pub credentials: Option<Credentials>,
    pub keep_alive: Option<TimerHandle>,
    pending: FxHashMap<u8, PendingRequest>,
    closed: bool,
}

/// Correlates outgoing requests with incoming responses for one connection:
/// selects correlation keys, wraps payloads in the session envelope, retries
/// on timeout and dispatches strays to listeners.
///
/// The handler subscribes to the shared messenger and filters by remote
/// address and session ID; the messenger itself never demultiplexes.
pub(crate) struct HandlerInner {
    pub remote: SocketAddr,
    weak_self: Weak<HandlerInner>,
    messenger: Arc<UdpMessenger>,
    timer: Arc<TimerService>,
    config: Arc<IpmiConfig>,
    pub notifier: Arc<ConnectionEventNotifier>,
    session_ids: Arc<SessionIdGenerator>,
    pub state: Mutex<HandlerState>,
    pipeline: Arc<Semaphore>,
}

impl HandlerInner {
    pub fn new(
        remote: SocketAddr,
        messenger: Arc<UdpMessenger>,
        timer: Arc<TimerService>,
        config: Arc<IpmiConfig>,
        notifier: Arc<ConnectionEventNotifier>,
        session_ids: Arc<SessionIdGenerator>,
    ) -> Arc<HandlerInner> {
        let pipeline = Arc::new(Semaphore::new(config.pipeline_limit.min(63).max(1)));
        Arc::new_cyclic(|weak| HandlerInner {
            remote,
            weak_self: weak.clone(),
            messenger,
            timer,
            config,
            notifier,
            session_ids,
            state: Mutex::new(HandlerState {
                machine: StateMachine::new(),
                session: None,
                requested_suite: None,
                requested_privilege: None,
                credentials: None,
                keep_alive: None,
                pending: FxHashMap::default(),
                closed: false,
            }),
            pipeline,
        })
    }

    /// Sends a sessionless IPMI command correlated by `tag`.
    pub async fn send_sessionless(
        &self,
        tag: u8,
        request: &IpmiRequest,
    ) -> Result<IpmiResponse, IpmiError> {
        let mut payload = BytesMut::new();
        encode_request(request, tag, &mut payload);

        let mut datagram = BytesMut::new();
        SessionHeader::sessionless(PayloadType::IpmiMessage).write(payload.len() as u16, &mut datagram);
        datagram.extend_from_slice(&payload);

        match self
            .submit(tag, datagram.to_vec(), ExpectedResponse::Ipmi, None, None)
            .await?
        {
            InboundBody::Ipmi(response) => Ok(response),
            other => Err(IpmiError::ProtocolViolation(format!(
                "unexpected response body: {:?}",
                other
            ))),
        }
    }

    /// Sends one RMCP+ handshake payload correlated by its message tag.
    pub async fn send_handshake(
        &self,
        tag: u8,
        payload_type: PayloadType,
        payload: &[u8],
        expected: ExpectedResponse,
    ) -> Result<InboundBody, IpmiError> {
        let mut datagram = BytesMut::new();
        SessionHeader::sessionless(payload_type).write(payload.len() as u16, &mut datagram);
        datagram.extend_from_slice(payload);

        self.submit(tag, datagram.to_vec(), expected, None, None).await
    }

    /// Sends an ASF presence ping correlated by its message tag.
    pub async fn send_ping(&self, tag: u8) -> Result<PresencePong, IpmiError> {
        let mut datagram = BytesMut::new();
        PresencePing { message_tag: tag }.write(&mut datagram);

        match self
            .submit(tag, datagram.to_vec(), ExpectedResponse::Pong, None, None)
            .await?
        {
            InboundBody::Pong(pong) => Ok(pong),
            other => Err(IpmiError::ProtocolViolation(format!(
                "unexpected response body: {:?}",
                other
            ))),
        }
    }

    /// Sends an IPMI command inside the established session. The correlation
    /// key is the session sequence number; its low 6 bits travel as the LAN
    /// requester sequence, so the key is chosen to keep those bits unique
    /// among in-flight requests.
    pub async fn send_in_session(&self, request: &IpmiRequest) -> Result<IpmiResponse, IpmiError> {
        let permit = self
            .pipeline
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| IpmiError::ConnectionClosed)?;

        let (wire_key, seq, datagram) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            if state.closed {
                return Err(IpmiError::ConnectionClosed);
            }
            if !matches!(
                state.machine.state(),
                SessionState::SessionValid | SessionState::SessionClosing
            ) {
                return Err(IpmiError::IllegalState(format!(
                    "cannot send in-session command in state {}",
                    state.machine.state()
                )));
            }
            let session = state
                .session
                .as_mut()
                .ok_or_else(|| IpmiError::IllegalState("no session record".into()))?;

            let authenticated = session.cipher_suite.authenticated();
            let mut seq = session.next_outbound_seq(authenticated);
            let mut wire_key = (seq & 0x3F) as u8;
            let mut burned = 0;
            while state.pending.contains_key(&wire_key) {
                seq = session.next_outbound_seq(authenticated);
                wire_key = (seq & 0x3F) as u8;
                burned += 1;
                if burned > 64 {
                    return Err(IpmiError::IllegalState(
                        "no free correlation key".into(),
                    ));
                }
            }

            let mut payload = BytesMut::new();
            encode_request(request, wire_key, &mut payload);
            let datagram = seal(session, seq, &payload)?;
            (wire_key, seq, datagram)
        };

        match self
            .submit(wire_key, datagram, ExpectedResponse::Ipmi, Some(seq), Some(permit))
            .await?
        {
            InboundBody::Ipmi(response) => Ok(response),
            other => Err(IpmiError::ProtocolViolation(format!(
                "unexpected response body: {:?}",
                other
            ))),
        }
    }

    /// Registers a pending entry for an encoded datagram, sends it and waits
    /// for exactly one of response, exhausted retries or teardown.
    async fn submit(
        &self,
        wire_key: u8,
        datagram: Vec<u8>,
        expected: ExpectedResponse,
        session_seq: Option<u32>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Result<InboundBody, IpmiError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(IpmiError::ConnectionClosed);
            }
            if state.pending.contains_key(&wire_key) {
                return Err(IpmiError::IllegalState(format!(
                    "correlation key {} already in flight",
                    wire_key
                )));
            }

            let timeout = self.schedule_timeout(wire_key, 0);
            state.pending.insert(
                wire_key,
                PendingRequest {
                    datagram: datagram.clone(),
                    expected,
                    session_seq,
                    retries_left: self.config.retries,
                    attempt: 0,
                    timeout,
                    completion: Some(tx),
                    _permit: permit,
                },
            );
            trace!(wire_key, ?session_seq, "registered pending request");

            if let Err(e) = self.messenger.send(self.remote, &datagram).await {
                let entry = state
                    .pending
                    .remove(&wire_key)
                    .expect("entry inserted above");
                entry.timeout.cancel();
                return Err(e);
            }
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(IpmiError::ConnectionClosed),
        }
    }

    fn schedule_timeout(&self, wire_key: u8, attempt: u64) -> TimerHandle {
        let task = Arc::new(TimeoutTask {
            handler: self.weak_self.clone(),
            wire_key,
            attempt,
        });
        self.timer.schedule_after(self.config.request_timeout, task)
    }

    /// Fails the connection: moves the state machine to `Failed`, completes
    /// all pending requests, stops the keep-alive and notifies listeners.
    pub async fn fail(&self, error: IpmiError) {
        let mut state = self.state.lock().await;
        self.fail_locked(&mut state, error).await;
    }

    async fn fail_locked(&self, state: &mut HandlerState, error: IpmiError) {
        if state.machine.state() == SessionState::Failed {
            return;
        }
        let event = match &error {
            IpmiError::ResponseTimeout => SessionEvent::Timeout,
            other => SessionEvent::ProtocolError(other.clone()),
        };
        state.machine.on_event(event);
        self.teardown_locked(state, error.clone()).await;
        self.notifier
            .notify(ConnectionEvent::SessionFailed(SessionFailedData {
                remote: self.remote,
                error,
            }))
            .await;
    }

    /// Completes every pending request with `error` and releases per-session
    /// resources. The state machine is left untouched.
    pub async fn teardown_locked(&self, state: &mut HandlerState, error: IpmiError) {
        if let Some(handle) = state.keep_alive.take() {
            handle.cancel();
        }
        for (_, entry) in state.pending.drain() {
            entry.timeout.cancel();
            if let Some(tx) = entry.completion {
                let _ = tx.send(Err(error.clone()));
            }
        }
        if let Some(session) = state.session.take() {
            self.session_ids.release(session.console_session_id).await;
        }
    }

    /// Marks the handler closed and completes everything pending with
    /// *connection-closed*. Idempotent.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if state.closed {
            return;
        }
        state.closed = true;
        self.teardown_locked(&mut state, IpmiError::ConnectionClosed)
            .await;
    }

    fn complete_pending(
        &self,
        state: &mut HandlerState,
        wire_key: u8,
        in_session: bool,
        body: InboundBody,
    ) -> Option<InboundBody> {
        let matches = state
            .pending
            .get(&wire_key)
            .map(|entry| entry.session_seq.is_some() == in_session && entry.expected.matches(&body))
            .unwrap_or(false);
        if !matches {
            // most strays are another connection's traffic on the shared
            // socket
            debug!(wire_key, in_session, "no pending request for correlation key");
            return Some(body);
        }

        let entry = state.pending.remove(&wire_key).expect("checked above");
        entry.timeout.cancel();
        if let Some(tx) = entry.completion {
            let _ = tx.send(Ok(body));
        }
        trace!(wire_key, "completed pending request");
        None
    }

    async fn handle_datagram(&self, datagram: &[u8]) -> anyhow::Result<()> {
        let mut peek = datagram;
        let rmcp = RmcpHeader::try_read(&mut peek)?;
        if rmcp.class == RmcpClass::Asf {
            let pong = PresencePong::try_read(&mut peek)?;
            let mut state = self.state.lock().await;
            if !state.closed {
                self.complete_pending(&mut state, pong.message_tag, false, InboundBody::Pong(pong));
            }
            return Ok(());
        }

        let mut buf = datagram;
        let (header, payload_len) = SessionHeader::try_read(&mut buf)?;
        let payload = &datagram[SessionHeader::SERIALIZED_LEN..SessionHeader::SERIALIZED_LEN + payload_len];

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.closed {
            return Ok(());
        }

        if header.session_id != 0 {
            self.handle_in_session(state, header, payload, datagram).await;
            return Ok(());
        }

        let completed = match header.payload_type {
            PayloadType::IpmiMessage => {
                let response = try_decode_response(payload)?;
                let key = response.rq_seq;
                self.complete_pending(state, key, false, InboundBody::Ipmi(response))
            }
            PayloadType::OpenSessionResponse => {
                let response = OpenSessionResponse::try_read(&mut &payload[..])?;
                let key = response.message_tag;
                self.complete_pending(state, key, false, InboundBody::OpenSession(response))
            }
            PayloadType::Rakp2 => {
                let response = Rakp2::try_read(&mut &payload[..])?;
                let key = response.message_tag;
                self.complete_pending(state, key, false, InboundBody::Rakp2(response))
            }
            PayloadType::Rakp4 => {
                let response = Rakp4::try_read(&mut &payload[..])?;
                let key = response.message_tag;
                self.complete_pending(state, key, false, InboundBody::Rakp4(response))
            }
            other => {
                return Err(anyhow::anyhow!(
                    "unexpected sessionless payload type {:?}",
                    other
                ));
            }
        };
        // sessionless strays were already logged in complete_pending
        let _ = completed;
        Ok(())
    }

    async fn handle_in_session(
        &self,
        state: &mut HandlerState,
        header: SessionHeader,
        payload: &[u8],
        datagram: &[u8],
    ) {
        let Some(session) = state.session.as_mut() else {
            trace!("in-session packet without a session - dropping");
            return;
        };
        if header.session_id != session.console_session_id {
            // another connection's session on the shared socket
            trace!(session_id = header.session_id, "packet for a different session");
            return;
        }

        if session.cipher_suite.authenticated() {
            let tag_len = session.cipher_suite.integrity.tag_len();
            let trailer_ok = header.authenticated
                && datagram.len() >= SessionHeader::SERIALIZED_LEN + payload_len_with_trailer(payload.len(), tag_len);
            let mac_ok = trailer_ok && {
                let presented = &datagram[datagram.len() - tag_len..];
                let computed = session
                    .cipher_suite
                    .integrity
                    .tag(&session.keys.k1, &datagram[4..datagram.len() - tag_len]);
                presented == computed
            };
            if !mac_ok {
                warn!("integrity check failed on in-session packet - failing session");
                self.fail_locked(state, IpmiError::IntegrityCheckFailed).await;
                return;
            }
        }

        if !session.accept_inbound(header.session_seq, header.authenticated) {
            return;
        }

        let body = if header.encrypted {
            match session
                .cipher_suite
                .decrypt_payload(&session.keys.k2, payload)
            {
                Ok(body) => body,
                Err(e) => {
                    warn!("failed to decrypt in-session payload: {} - dropping", e);
                    return;
                }
            }
        } else {
            payload.to_vec()
        };

        let response = match try_decode_response(&body) {
            Ok(response) => response,
            Err(e) => {
                warn!("undecodable in-session IPMI message: {} - dropping", e);
                return;
            }
        };

        if response.completion_code == ipmi_lan::COMPLETION_CODE_INVALID_SESSION_ID {
            warn!("BMC reports the session expired - failing session");
            self.fail_locked(state, IpmiError::SessionExpired).await;
            return;
        }

        let key = response.rq_seq;
        if let Some(InboundBody::Ipmi(stray)) =
            self.complete_pending(state, key, true, InboundBody::Ipmi(response))
        {
            debug!("delivering unsolicited response to listeners");
            self.notifier
                .notify(ConnectionEvent::UnsolicitedResponse(UnsolicitedResponseData {
                    remote: self.remote,
                    response: stray,
                }))
                .await;
        }
    }
}

/// Minimum trailer bytes after the payload of an authenticated packet:
/// pad-length byte, next-header byte and the AuthCode itself.
fn payload_len_with_trailer(payload_len: usize, tag_len: usize) -> usize {
    payload_len + 2 + tag_len
}

/// Wraps an encoded IPMI message in the session's confidentiality and
/// integrity envelope.
fn seal(session: &SessionRecord, seq: u32, payload: &[u8]) -> Result<Vec<u8>, IpmiError> {
    let suite = session.cipher_suite;
    let body = suite.encrypt_payload(&session.keys.k2, payload)?;

    let header = SessionHeader {
        payload_type: PayloadType::IpmiMessage,
        encrypted: suite.encrypted(),
        authenticated: suite.authenticated(),
        session_id: session.managed_system_session_id,
        session_seq: seq,
    };

    let mut buf = BytesMut::with_capacity(SessionHeader::SERIALIZED_LEN + body.len() + 32);
    header.write(body.len() as u16, &mut buf);
    buf.extend_from_slice(&body);

    if suite.authenticated() {
        // pad the span from auth-type through next-header to a 4-byte
        // boundary
        let span = buf.len() - 4 + 2;
        let pad = (4 - span % 4) % 4;
        for _ in 0..pad {
            buf.extend_from_slice(&[0xFF]);
        }
        buf.extend_from_slice(&[pad as u8, NEXT_HEADER]);
        let tag = suite.integrity.tag(&session.keys.k1, &buf[4..]);
        buf.extend_from_slice(&tag);
    }

    Ok(buf.to_vec())
}

#[async_trait::async_trait]
impl MessageListener for HandlerInner {
    async fn on_datagram(&self, datagram: &[u8], sender: SocketAddr) {
        if sender != self.remote {
            return;
        }
        if let Err(e) = self.handle_datagram(datagram).await {
            debug!("discarding datagram from {:?}: {}", sender, e);
        }
    }
}

/// Fires when a pending request saw no response within the timeout: re-sends
/// while the retry budget lasts, then completes the request with
/// *response-timeout*. A response that arrived concurrently wins because it
/// removes the entry (or bumps the attempt counter) under the state lock.
struct TimeoutTask {
    handler: Weak<HandlerInner>,
    wire_key: u8,
    attempt: u64,
}

#[async_trait::async_trait]
impl TimerTask for TimeoutTask {
    async fn run(&self) {
        let Some(handler) = self.handler.upgrade() else {
            return;
        };
        let mut state = handler.state.lock().await;

        let Some(entry) = state.pending.get_mut(&self.wire_key) else {
            return;
        };
        if entry.attempt != self.attempt {
            return;
        }

        if entry.retries_left > 0 {
            entry.retries_left -= 1;
            entry.attempt += 1;
            entry.timeout = handler.schedule_timeout(self.wire_key, entry.attempt);
            let datagram = entry.datagram.clone();
            debug!(
                wire_key = self.wire_key,
                retries_left = entry.retries_left,
                "response timeout - retrying"
            );
            if let Err(e) = handler.messenger.send(handler.remote, &datagram).await {
                let entry = state
                    .pending
                    .remove(&self.wire_key)
                    .expect("entry checked above");
                entry.timeout.cancel();
                if let Some(tx) = entry.completion {
                    let _ = tx.send(Err(e));
                }
            }
        } else {
            debug!(wire_key = self.wire_key, "retry budget exhausted");
            let entry = state
                .pending
                .remove(&self.wire_key)
                .expect("entry checked above");
            if let Some(tx) = entry.completion {
                let _ = tx.send(Err(IpmiError::ResponseTimeout));
            }
        }
    }
}

/// Periodic no-op keeping the BMC-side session alive. Only an exhausted
/// retry budget on the no-op fails the session.
pub(crate) struct KeepAliveTask {
    pub handler: Weak<HandlerInner>,
}

#[async_trait::async_trait]
impl TimerTask for KeepAliveTask {
    async fn run(&self) {
        let Some(handler) = self.handler.upgrade() else {
            return;
        };

        let privilege = {
            let state = handler.state.lock().await;
            if state.machine.state() != SessionState::SessionValid {
                return;
            }
            match state.session.as_ref() {
                Some(session) => session.privilege,
                None => return,
            }
        };

        let request = ipmi_lan::get_channel_authentication_capabilities(
            ipmi_lan::CHANNEL_CURRENT,
            privilege,
        );
        match handler.send_in_session(&request).await {
            Ok(_) => trace!("keep-alive acknowledged"),
            Err(IpmiError::ResponseTimeout) => {
                warn!("keep-alive retry budget exhausted - failing session");
                // failing the session cancels this timer task, so the
                // teardown must not run on it
                tokio::spawn(async move { handler.fail(IpmiError::ResponseTimeout).await });
            }
            Err(e) => debug!("keep-alive not sent: {}", e),
        }
    }
}
