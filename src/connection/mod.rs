//! A single logical connection to one BMC: the session state machine, the
//! message handler and the listener notifier bound to a remote address.

pub mod events;
pub(crate) mod message_handler;
pub mod session;
pub mod session_id;
pub mod state_machine;
pub mod tag_pool;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use rand::RngCore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::IpmiConfig;
use crate::connection::events::{
    ConnectionEvent, ConnectionEventNotifier, ConnectionListener, SessionClosedData,
    SessionEstablishedData,
};
use crate::connection::message_handler::{
    ExpectedResponse, HandlerInner, InboundBody, KeepAliveTask,
};
use crate::connection::session::SessionRecord;
use crate::connection::session_id::SessionIdGenerator;
use crate::connection::state_machine::{HandshakeSend, SessionEvent, SessionState};
use crate::error::IpmiError;
use crate::protocol::handshake::{
    OpenSessionRequest, PrivilegeLevel, Rakp1, Rakp3, RakpStatusCode,
};
use crate::protocol::ipmi_lan::{self, AuthCapabilities, IpmiRequest, IpmiResponse};
use crate::protocol::session::PayloadType;
use crate::security::{AuthenticationAlgorithm, CipherSuite, ConfidentialityAlgorithm};
use crate::timer::TimerService;
use crate::transport::UdpMessenger;

/// Credentials a session authenticates with.
#[derive(Debug, Clone)]
pub(crate) struct Credentials {
    pub username: Vec<u8>,
    pub password: Vec<u8>,
    pub bmc_key: Option<Vec<u8>>,
}

/// A logical connection to one managed system. Thin facade over the session
/// state machine and the message handler; handshake methods are valid only
/// in the protocol position they belong to and fail with *illegal-state*
/// otherwise, without touching the wire.
pub struct Connection {
    remote: SocketAddr,
    handler: Arc<HandlerInner>,
    notifier: Arc<ConnectionEventNotifier>,
    session_ids: Arc<SessionIdGenerator>,
    timer: Arc<TimerService>,
    ping_period: Duration,
}

impl Connection {
    /// Binds a new connection to `remote` and subscribes it to the shared
    /// messenger.
    pub(crate) async fn connect(
        remote: SocketAddr,
        ping_period: Duration,
        messenger: Arc<UdpMessenger>,
        timer: Arc<TimerService>,
        session_ids: Arc<SessionIdGenerator>,
        config: Arc<IpmiConfig>,
    ) -> Connection {
        let notifier = Arc::new(ConnectionEventNotifier::new());
        let handler = HandlerInner::new(
            remote,
            messenger.clone(),
            timer.clone(),
            config,
            notifier.clone(),
            session_ids.clone(),
        );
        messenger.subscribe(handler.clone()).await;
        debug!(?remote, "connection created");

        Connection {
            remote,
            handler,
            notifier,
            session_ids,
            timer,
            ping_period,
        }
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.remote
    }

    pub async fn state(&self) -> SessionState {
        self.handler.state.lock().await.machine.state()
    }

    /// True until the connection reached a terminal state.
    pub async fn is_active(&self) -> bool {
        !self.state().await.is_terminal()
    }

    /// ASF presence ping, usable before any IPMI exchange to probe whether
    /// something IPMI-capable answers at the remote address.
    pub async fn check_presence(&self, tag: u8) -> Result<bool, IpmiError> {
        let pong = self.handler.send_ping(tag).await?;
        Ok(pong.ipmi_supported)
    }

    /// Retrieves the cipher suites the BMC supports. Valid only as the first
    /// exchange on a fresh connection.
    pub async fn get_available_cipher_suites(
        &self,
        tag: u8,
    ) -> Result<Vec<CipherSuite>, IpmiError> {
        {
            let mut state = self.handler.state.lock().await;
            state.machine.on_dispatch(HandshakeSend::GetCipherSuites)?;
        }

        let mut records = Vec::new();
        for index in 0..64u8 {
            let request = ipmi_lan::get_channel_cipher_suites(ipmi_lan::CHANNEL_CURRENT, index);
            let response = match self.handler.send_sessionless(tag, &request).await {
                Ok(response) => response,
                Err(e) => return Err(self.fail_handshake(e).await),
            };
            if !response.is_ok() {
                let error = IpmiError::ProtocolViolation(format!(
                    "GetChannelCipherSuites failed with completion code {:#04x}",
                    response.completion_code
                ));
                return Err(self.fail_handshake(error).await);
            }
            let chunk = match ipmi_lan::cipher_suite_chunk(&response) {
                Ok(chunk) => chunk,
                Err(e) => {
                    return Err(self
                        .fail_handshake(IpmiError::ProtocolViolation(e.to_string()))
                        .await)
                }
            };
            records.extend_from_slice(chunk);
            if chunk.len() < 16 {
                break;
            }
        }

        let suites = ipmi_lan::cipher_suite_ids(&records)
            .into_iter()
            .filter_map(|id| {
                let suite = CipherSuite::from_id(id);
                if suite.is_none() {
                    warn!(id, "BMC advertises a cipher suite this library does not know - skipping");
                }
                suite
            })
            .collect::<Vec<_>>();

        let mut state = self.handler.state.lock().await;
        state.machine.on_event(SessionEvent::Default);
        info!(?suites, "cipher suites retrieved");
        Ok(suites)
    }

    /// Queries the authentication capabilities for the requested cipher
    /// suite and privilege level. Valid after cipher-suite retrieval.
    pub async fn get_channel_authentication_capabilities(
        &self,
        tag: u8,
        cipher_suite: CipherSuite,
        privilege: PrivilegeLevel,
    ) -> Result<AuthCapabilities, IpmiError> {
        {
            let mut state = self.handler.state.lock().await;
            state.machine.on_dispatch(HandshakeSend::GetAuthCapabilities)?;
            state.requested_suite = Some(cipher_suite);
            state.requested_privilege = Some(privilege);
        }

        let request =
            ipmi_lan::get_channel_authentication_capabilities(ipmi_lan::CHANNEL_CURRENT, privilege);
        let response = match self.handler.send_sessionless(tag, &request).await {
            Ok(response) => response,
            Err(e) => return Err(self.fail_handshake(e).await),
        };
        if !response.is_ok() {
            let error = IpmiError::ProtocolViolation(format!(
                "GetChannelAuthenticationCapabilities failed with completion code {:#04x}",
                response.completion_code
            ));
            return Err(self.fail_handshake(error).await);
        }
        let capabilities = match AuthCapabilities::try_from_response(&response) {
            Ok(capabilities) => capabilities,
            Err(e) => {
                return Err(self
                    .fail_handshake(IpmiError::ProtocolViolation(e.to_string()))
                    .await)
            }
        };

        let mut state = self.handler.state.lock().await;
        state
            .machine
            .on_event(SessionEvent::AuthenticationCapabilitiesReceived);
        Ok(capabilities)
    }

    /// Runs the RMCP+ open-session / RAKP handshake and installs the session
    /// keys. Valid after the authentication capabilities were retrieved.
    pub async fn start_session(
        &self,
        tag: u8,
        cipher_suite: CipherSuite,
        privilege: PrivilegeLevel,
        username: &str,
        password: &str,
        bmc_key: Option<&[u8]>,
    ) -> Result<(), IpmiError> {
        if matches!(
            cipher_suite.confidentiality,
            ConfidentialityAlgorithm::Xrc4_128 | ConfidentialityAlgorithm::Xrc4_40
        ) {
            return Err(IpmiError::IllegalState(
                "xRC4 confidentiality is not implemented".into(),
            ));
        }

        let console_session_id = self.session_ids.acquire().await;
        if let Err(e) = self
            .run_handshake(
                tag,
                console_session_id,
                cipher_suite,
                privilege,
                username,
                password,
                bmc_key,
            )
            .await
        {
            // the handshake failed before a session record existed, so the
            // console session ID is still this method's to return
            self.session_ids.release(console_session_id).await;
            return Err(e);
        }

        // activate the negotiated privilege level on the new session; from
        // here on teardown paths release the session ID with the record
        let activation = ipmi_lan::set_session_privilege_level(privilege);
        match self.handler.send_in_session(&activation).await {
            Ok(response) if response.is_ok() => {}
            Ok(response) => {
                let error = IpmiError::ProtocolViolation(format!(
                    "SetSessionPrivilegeLevel failed with completion code {:#04x}",
                    response.completion_code
                ));
                self.handler.fail(error.clone()).await;
                return Err(error);
            }
            Err(e) => {
                self.handler.fail(e.clone()).await;
                return Err(e);
            }
        }

        self.notifier
            .notify(ConnectionEvent::SessionEstablished(SessionEstablishedData {
                remote: self.remote,
                managed_system_session_id: self
                    .handler
                    .state
                    .lock()
                    .await
                    .session
                    .as_ref()
                    .map(|s| s.managed_system_session_id)
                    .unwrap_or_default(),
            }))
            .await;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_handshake(
        &self,
        tag: u8,
        console_session_id: u32,
        cipher_suite: CipherSuite,
        privilege: PrivilegeLevel,
        username: &str,
        password: &str,
        bmc_key: Option<&[u8]>,
    ) -> Result<(), IpmiError> {
        let credentials = {
            let mut state = self.handler.state.lock().await;
            state.machine.on_dispatch(HandshakeSend::OpenSession)?;
            if state.requested_suite.is_some_and(|s| s != cipher_suite) {
                warn!("session uses a different cipher suite than the capability stage requested");
            }
            if state.requested_privilege.is_some_and(|p| p != privilege) {
                warn!("session uses a different privilege level than the capability stage requested");
            }
            let credentials = Credentials {
                username: username.as_bytes().to_vec(),
                password: password.as_bytes().to_vec(),
                bmc_key: bmc_key.map(<[u8]>::to_vec),
            };
            state.credentials = Some(credentials.clone());
            credentials
        };

        // stage 1: open session
        let mut payload = BytesMut::new();
        OpenSessionRequest {
            message_tag: tag,
            requested_privilege: privilege,
            console_session_id,
            cipher_suite,
        }
        .write(&mut payload);
        let body = match self
            .handler
            .send_handshake(
                tag,
                PayloadType::OpenSessionRequest,
                &payload,
                ExpectedResponse::OpenSession,
            )
            .await
        {
            Ok(body) => body,
            Err(e) => return Err(self.fail_handshake(e).await),
        };
        let InboundBody::OpenSession(open_response) = body else {
            return Err(self
                .fail_handshake(IpmiError::ProtocolViolation(
                    "open-session response of unexpected kind".into(),
                ))
                .await);
        };
        if open_response.status != RakpStatusCode::NoErrors {
            return Err(self
                .fail_handshake(IpmiError::AuthenticationFailed(open_response.status.into()))
                .await);
        }
        if open_response.console_session_id != console_session_id {
            return Err(self
                .fail_handshake(IpmiError::ProtocolViolation(
                    "open-session response for a different console session".into(),
                ))
                .await);
        }
        if open_response.authentication != u8::from(cipher_suite.authentication)
            || open_response.integrity != u8::from(cipher_suite.integrity)
            || open_response.confidentiality != u8::from(cipher_suite.confidentiality)
        {
            return Err(self
                .fail_handshake(IpmiError::ProtocolViolation(
                    "BMC negotiated different algorithms than requested".into(),
                ))
                .await);
        }
        let managed_system_session_id = open_response.managed_system_session_id;
        {
            let mut state = self.handler.state.lock().await;
            state.machine.on_event(SessionEvent::OpenSessionAck);
            state.machine.on_dispatch(HandshakeSend::Rakp1)?;
        }

        // stage 2: RAKP 1/2
        let mut console_nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut console_nonce);

        let mut payload = BytesMut::new();
        Rakp1 {
            message_tag: tag,
            managed_system_session_id,
            console_nonce,
            requested_privilege: privilege,
            username: credentials.username.clone(),
        }
        .write(&mut payload);
        let body = match self
            .handler
            .send_handshake(tag, PayloadType::Rakp1, &payload, ExpectedResponse::Rakp2)
            .await
        {
            Ok(body) => body,
            Err(e) => return Err(self.fail_handshake(e).await),
        };
        let InboundBody::Rakp2(rakp2) = body else {
            return Err(self
                .fail_handshake(IpmiError::ProtocolViolation(
                    "RAKP2 response of unexpected kind".into(),
                ))
                .await);
        };
        if rakp2.status != RakpStatusCode::NoErrors {
            return Err(self
                .fail_handshake(IpmiError::AuthenticationFailed(rakp2.status.into()))
                .await);
        }
        if rakp2.console_session_id != console_session_id {
            return Err(self
                .fail_handshake(IpmiError::ProtocolViolation(
                    "RAKP2 for a different console session".into(),
                ))
                .await);
        }
        if cipher_suite.authentication != AuthenticationAlgorithm::None {
            let expected = cipher_suite.rakp2_auth_code(
                &credentials.password,
                console_session_id,
                managed_system_session_id,
                &console_nonce,
                &rakp2.bmc_nonce,
                &rakp2.bmc_guid,
                privilege.into(),
                &credentials.username,
            );
            if rakp2.key_exchange_auth_code != expected {
                return Err(self
                    .fail_handshake(IpmiError::AuthenticationFailed(
                        RakpStatusCode::InvalidIntegrityCheckValue.into(),
                    ))
                    .await);
            }
        }
        {
            let mut state = self.handler.state.lock().await;
            state.machine.on_event(SessionEvent::Rakp2Ack);
            state.machine.on_dispatch(HandshakeSend::Rakp3)?;
        }

        // stage 3: RAKP 3/4, key installation
        let keys = cipher_suite.derive_session_keys(
            &credentials.password,
            credentials.bmc_key.as_deref(),
            &console_nonce,
            &rakp2.bmc_nonce,
            privilege.into(),
            &credentials.username,
        );

        let mut payload = BytesMut::new();
        Rakp3 {
            message_tag: tag,
            status: RakpStatusCode::NoErrors,
            managed_system_session_id,
            key_exchange_auth_code: cipher_suite.rakp3_auth_code(
                &credentials.password,
                &rakp2.bmc_nonce,
                console_session_id,
                privilege.into(),
                &credentials.username,
            ),
        }
        .write(&mut payload);
        let body = match self
            .handler
            .send_handshake(tag, PayloadType::Rakp3, &payload, ExpectedResponse::Rakp4)
            .await
        {
            Ok(body) => body,
            Err(e) => return Err(self.fail_handshake(e).await),
        };
        let InboundBody::Rakp4(rakp4) = body else {
            return Err(self
                .fail_handshake(IpmiError::ProtocolViolation(
                    "RAKP4 response of unexpected kind".into(),
                ))
                .await);
        };
        if rakp4.status != RakpStatusCode::NoErrors {
            return Err(self
                .fail_handshake(IpmiError::AuthenticationFailed(rakp4.status.into()))
                .await);
        }
        if rakp4.console_session_id != console_session_id {
            return Err(self
                .fail_handshake(IpmiError::ProtocolViolation(
                    "RAKP4 for a different console session".into(),
                ))
                .await);
        }
        if cipher_suite.authentication != AuthenticationAlgorithm::None {
            let expected = cipher_suite.rakp4_integrity_check(
                &keys.sik,
                &console_nonce,
                managed_system_session_id,
                &rakp2.bmc_guid,
            );
            if rakp4.integrity_check_value != expected {
                return Err(self
                    .fail_handshake(IpmiError::AuthenticationFailed(
                        RakpStatusCode::InvalidIntegrityCheckValue.into(),
                    ))
                    .await);
            }
        }

        {
            let mut state = self.handler.state.lock().await;
            state.machine.on_event(SessionEvent::Rakp4Ack);
            state.session = Some(SessionRecord::new(
                managed_system_session_id,
                console_session_id,
                cipher_suite,
                privilege,
                keys,
            ));
            state.keep_alive = Some(self.timer.schedule_at_fixed_rate(
                self.ping_period,
                Arc::new(KeepAliveTask {
                    handler: Arc::downgrade(&self.handler),
                }),
            ));
        }
        info!(
            remote = ?self.remote,
            managed_system_session_id,
            "session keys installed"
        );
        Ok(())
    }

    /// Submits an in-session command and waits for the matching response.
    pub async fn send_command(&self, request: IpmiRequest) -> Result<IpmiResponse, IpmiError> {
        self.handler.send_in_session(&request).await
    }

    /// Closes the session (best effort on the wire) and tears the connection
    /// down. All pending requests complete with *connection-closed*.
    pub async fn disconnect(&self) {
        let close_on_wire = {
            let mut state = self.handler.state.lock().await;
            if state.machine.state().is_terminal() {
                None
            } else {
                state.machine.on_event(SessionEvent::SessionCloseRequested);
                state
                    .session
                    .as_ref()
                    .map(|session| session.managed_system_session_id)
            }
        };

        if let Some(managed_system_session_id) = close_on_wire {
            {
                let mut state = self.handler.state.lock().await;
                if state.machine.on_dispatch(HandshakeSend::CloseSession).is_err() {
                    // the session failed concurrently; nothing to close
                    warn!("session vanished while closing");
                }
            }
            let request = ipmi_lan::close_session(managed_system_session_id);
            if let Err(e) = self.handler.send_in_session(&request).await {
                debug!("close-session command not acknowledged: {}", e);
            }
            let mut state = self.handler.state.lock().await;
            state.machine.on_event(SessionEvent::Default);
        }

        self.handler.close().await;
        if close_on_wire.is_some() {
            self.notifier
                .notify(ConnectionEvent::SessionClosed(SessionClosedData {
                    remote: self.remote,
                }))
                .await;
        }
        info!(remote = ?self.remote, "connection closed");
    }

    /// Registers a listener for session lifecycle events and unsolicited
    /// responses.
    pub async fn register_listener(&self, listener: Arc<dyn ConnectionListener>) -> Uuid {
        self.notifier.add_listener(listener).await
    }

    pub async fn unregister_listener(&self, listener_id: &Uuid) -> Result<(), IpmiError> {
        self.notifier
            .try_remove_listener(listener_id)
            .await
            .map_err(|e| IpmiError::IllegalState(e.to_string()))
    }

    /// Applies a failed handshake exchange to the state machine, tears down
    /// and returns the error for the caller to propagate.
    async fn fail_handshake(&self, error: IpmiError) -> IpmiError {
        warn!(remote = ?self.remote, "handshake failed: {}", error);
        self.handler.fail(error.clone()).await;
        error
    }
}
