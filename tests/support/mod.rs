//! In-process mock BMC answering RMCP+ traffic on a loopback socket, plus
//! small recording helpers shared by the scenario tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use rustipmi::protocol::asf::PresencePong;
use rustipmi::protocol::handshake::{
    OpenSessionRequest, OpenSessionResponse, Rakp1, Rakp2, Rakp3, Rakp4, RakpStatusCode,
};
use rustipmi::protocol::ipmi_lan::{
    checksum, BMC_SLAVE_ADDRESS, CMD_CLOSE_SESSION, CMD_GET_CHANNEL_AUTH_CAPABILITIES,
    CMD_GET_CHANNEL_CIPHER_SUITES, CMD_SET_SESSION_PRIVILEGE_LEVEL, NETFN_APP_RESPONSE,
    REMOTE_CONSOLE_SOFTWARE_ID,
};
use rustipmi::protocol::rmcp::{RmcpClass, RmcpHeader};
use rustipmi::protocol::session::{PayloadType, SessionHeader, NEXT_HEADER};
use rustipmi::security::{CipherSuite, SessionKeys};

/// Command number the mock never answers; used to park a request in flight.
pub const CMD_NEVER_ANSWERED: u8 = 0xDE;

pub struct BmcSession {
    pub suite: CipherSuite,
    pub keys: SessionKeys,
    pub console_session_id: u32,
    pub managed_system_session_id: u32,
    pub privilege: u8,
    pub outbound_seq: u32,
    pub peer: SocketAddr,
}

/// Handshake state between open-session and RAKP-4.
struct PendingHandshake {
    suite: CipherSuite,
    console_session_id: u32,
    managed_system_session_id: u32,
    privilege: u8,
    console_nonce: [u8; 16],
}

pub struct BmcState {
    /// Swallow every received datagram (response-loss scenarios).
    pub drop_all: bool,
    pub username: Vec<u8>,
    pub password: Vec<u8>,
    pub advertised_suites: Vec<u8>,
    pub bmc_nonce: [u8; 16],
    pub bmc_guid: [u8; 16],
    next_managed_sid: u32,
    pending_handshakes: HashMap<u32, PendingHandshake>,
    pub sessions: HashMap<u32, BmcSession>,

    pub datagrams_received: usize,
    pub keep_alive_count: usize,
    /// Session-header sequence of every in-session request, in arrival order.
    pub in_session_seqs: Vec<u32>,
}

/// A scripted BMC on a loopback UDP socket. It speaks just enough RMCP+ to
/// take a console through the handshake and echo in-session commands back.
pub struct MockBmc {
    pub addr: SocketAddr,
    pub state: Arc<Mutex<BmcState>>,
    socket: Arc<UdpSocket>,
    task: JoinHandle<()>,
}

impl MockBmc {
    pub async fn start() -> MockBmc {
        let socket = Arc::new(
            UdpSocket::bind("127.0.0.1:0".parse::<SocketAddr>().unwrap())
                .await
                .unwrap(),
        );
        let addr = socket.local_addr().unwrap();

        let state = Arc::new(Mutex::new(BmcState {
            drop_all: false,
            username: b"admin".to_vec(),
            password: b"password".to_vec(),
            advertised_suites: vec![0, 3],
            bmc_nonce: core::array::from_fn(|i| i as u8),
            bmc_guid: [0xB1; 16],
            next_managed_sid: 0xAABB_CCDD,
            pending_handshakes: HashMap::new(),
            sessions: HashMap::new(),
            datagrams_received: 0,
            keep_alive_count: 0,
            in_session_seqs: Vec::new(),
        }));

        let task = tokio::spawn(run_bmc(socket.clone(), state.clone()));

        MockBmc {
            addr,
            state,
            socket,
            task,
        }
    }

    pub async fn set_drop_all(&self, drop_all: bool) {
        self.state.lock().await.drop_all = drop_all;
    }

    pub async fn datagrams_received(&self) -> usize {
        self.state.lock().await.datagrams_received
    }

    pub async fn keep_alive_count(&self) -> usize {
        self.state.lock().await.keep_alive_count
    }

    /// Re-sends a validly sealed in-session response with a stale sequence
    /// number, `back` steps below the newest one the console has seen.
    pub async fn inject_stale_response(&self, console_session_id: u32, back: u32) {
        let state = self.state.lock().await;
        let session = state
            .sessions
            .get(&console_session_id)
            .expect("session must be established");
        assert!(session.outbound_seq > back);

        let lan = encode_lan_response(0x3F, CMD_NEVER_ANSWERED, 0x00, &[]);
        let datagram = seal_response(session, session.outbound_seq - back, &lan);
        self.socket.send_to(&datagram, session.peer).await.unwrap();
    }

    pub async fn stop(self) {
        self.task.abort();
    }
}

async fn run_bmc(socket: Arc<UdpSocket>, state: Arc<Mutex<BmcState>>) {
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
            return;
        };
        let datagram = &buf[..len];

        let mut state = state.lock().await;
        state.datagrams_received += 1;
        if state.drop_all {
            continue;
        }
        if let Some(response) = handle_datagram(&mut state, datagram, peer) {
            let _ = socket.send_to(&response, peer).await;
        }
    }
}

fn handle_datagram(state: &mut BmcState, datagram: &[u8], peer: SocketAddr) -> Option<Vec<u8>> {
    let mut peek = datagram;
    let rmcp = RmcpHeader::try_read(&mut peek).ok()?;
    if rmcp.class == RmcpClass::Asf {
        return handle_ping(peek);
    }

    let mut buf = datagram;
    let (header, payload_len) = SessionHeader::try_read(&mut buf).ok()?;
    let payload = &datagram[SessionHeader::SERIALIZED_LEN..SessionHeader::SERIALIZED_LEN + payload_len];

    if header.session_id != 0 {
        return handle_in_session(state, &header, payload, peer);
    }

    match header.payload_type {
        PayloadType::OpenSessionRequest => handle_open_session(state, payload),
        PayloadType::Rakp1 => handle_rakp1(state, payload),
        PayloadType::Rakp3 => handle_rakp3(state, payload, peer),
        PayloadType::IpmiMessage => handle_sessionless_command(state, payload),
        _ => None,
    }
}

fn handle_ping(asf_body: &[u8]) -> Option<Vec<u8>> {
    // IANA (4 bytes), message type, tag
    let message_tag = *asf_body.get(5)?;
    let mut out = BytesMut::new();
    PresencePong {
        message_tag,
        ipmi_supported: true,
    }
    .write(&mut out);
    Some(out.to_vec())
}

fn handle_open_session(state: &mut BmcState, payload: &[u8]) -> Option<Vec<u8>> {
    let request = OpenSessionRequest::try_read(&mut &payload[..]).ok()?;
    let managed_system_session_id = state.next_managed_sid;
    state.next_managed_sid += 1;

    state.pending_handshakes.insert(
        request.console_session_id,
        PendingHandshake {
            suite: request.cipher_suite,
            console_session_id: request.console_session_id,
            managed_system_session_id,
            privilege: request.requested_privilege.into(),
            console_nonce: [0; 16],
        },
    );

    let response = OpenSessionResponse {
        message_tag: request.message_tag,
        status: RakpStatusCode::NoErrors,
        maximum_privilege: request.requested_privilege.into(),
        console_session_id: request.console_session_id,
        managed_system_session_id,
        authentication: request.cipher_suite.authentication.into(),
        integrity: request.cipher_suite.integrity.into(),
        confidentiality: request.cipher_suite.confidentiality.into(),
    };
    Some(sessionless_datagram(PayloadType::OpenSessionResponse, |buf| {
        response.write(buf)
    }))
}

fn handle_rakp1(state: &mut BmcState, payload: &[u8]) -> Option<Vec<u8>> {
    let rakp1 = Rakp1::try_read(&mut &payload[..]).ok()?;
    let handshake = state
        .pending_handshakes
        .values_mut()
        .find(|h| h.managed_system_session_id == rakp1.managed_system_session_id)?;
    handshake.console_nonce = rakp1.console_nonce;

    let auth_code = handshake.suite.rakp2_auth_code(
        &state.password,
        handshake.console_session_id,
        handshake.managed_system_session_id,
        &rakp1.console_nonce,
        &state.bmc_nonce,
        &state.bmc_guid,
        handshake.privilege,
        &rakp1.username,
    );

    let response = Rakp2 {
        message_tag: rakp1.message_tag,
        status: RakpStatusCode::NoErrors,
        console_session_id: handshake.console_session_id,
        bmc_nonce: state.bmc_nonce,
        bmc_guid: state.bmc_guid,
        key_exchange_auth_code: auth_code,
    };
    Some(sessionless_datagram(PayloadType::Rakp2, |buf| {
        response.write(buf)
    }))
}

fn handle_rakp3(state: &mut BmcState, payload: &[u8], peer: SocketAddr) -> Option<Vec<u8>> {
    let rakp3 = Rakp3::try_read(&mut &payload[..]).ok()?;
    let handshake = state
        .pending_handshakes
        .values()
        .find(|h| h.managed_system_session_id == rakp3.managed_system_session_id)?;

    let keys = handshake.suite.derive_session_keys(
        &state.password,
        None,
        &handshake.console_nonce,
        &state.bmc_nonce,
        handshake.privilege,
        &state.username,
    );
    let integrity_check_value = handshake.suite.rakp4_integrity_check(
        &keys.sik,
        &handshake.console_nonce,
        handshake.managed_system_session_id,
        &state.bmc_guid,
    );

    let response = Rakp4 {
        message_tag: rakp3.message_tag,
        status: RakpStatusCode::NoErrors,
        console_session_id: handshake.console_session_id,
        integrity_check_value,
    };

    let session = BmcSession {
        suite: handshake.suite,
        keys,
        console_session_id: handshake.console_session_id,
        managed_system_session_id: handshake.managed_system_session_id,
        privilege: handshake.privilege,
        outbound_seq: 0,
        peer,
    };
    let console_session_id = handshake.console_session_id;
    state.pending_handshakes.remove(&console_session_id);
    state.sessions.insert(console_session_id, session);

    Some(sessionless_datagram(PayloadType::Rakp4, |buf| {
        response.write(buf)
    }))
}

fn handle_sessionless_command(state: &mut BmcState, payload: &[u8]) -> Option<Vec<u8>> {
    let request = try_decode_lan_request(payload)?;
    let data = match request.command {
        CMD_GET_CHANNEL_CIPHER_SUITES => {
            let mut records = vec![0x0E];
            for id in &state.advertised_suites {
                records.push(0xC0);
                records.push(*id);
            }
            records
        }
        CMD_GET_CHANNEL_AUTH_CAPABILITIES => auth_capabilities_data(),
        _ => return None,
    };

    let lan = encode_lan_response(request.rq_seq, request.command, 0x00, &data);
    let mut out = BytesMut::new();
    SessionHeader::sessionless(PayloadType::IpmiMessage).write(lan.len() as u16, &mut out);
    out.extend_from_slice(&lan);
    Some(out.to_vec())
}

fn handle_in_session(
    state: &mut BmcState,
    header: &SessionHeader,
    payload: &[u8],
    peer: SocketAddr,
) -> Option<Vec<u8>> {
    let console_session_id = state
        .sessions
        .values()
        .find(|s| s.managed_system_session_id == header.session_id)?
        .console_session_id;
    state.in_session_seqs.push(header.session_seq);

    let session = state.sessions.get_mut(&console_session_id)?;
    session.peer = peer;
    let body = if header.encrypted {
        session
            .suite
            .decrypt_payload(&session.keys.k2, payload)
            .ok()?
    } else {
        payload.to_vec()
    };
    let request = try_decode_lan_request(&body)?;

    let (completion, data, close_after) = match request.command {
        CMD_GET_CHANNEL_AUTH_CAPABILITIES => (0x00, auth_capabilities_data(), false),
        CMD_SET_SESSION_PRIVILEGE_LEVEL => (0x00, vec![session.privilege], false),
        CMD_CLOSE_SESSION => (0x00, vec![], true),
        CMD_NEVER_ANSWERED => return None,
        // anything else echoes its data so callers can match responses to
        // their own requests
        _ => (0x00, request.data.clone(), false),
    };
    if request.command == CMD_GET_CHANNEL_AUTH_CAPABILITIES {
        state.keep_alive_count += 1;
    }

    let session = state.sessions.get_mut(&console_session_id)?;
    session.outbound_seq += 1;
    let lan = encode_lan_response(request.rq_seq, request.command, completion, &data);
    let datagram = seal_response(session, session.outbound_seq, &lan);

    if close_after {
        state.sessions.remove(&console_session_id);
    }
    Some(datagram)
}

fn auth_capabilities_data() -> Vec<u8> {
    vec![0x0E, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
}

fn sessionless_datagram(payload_type: PayloadType, write: impl FnOnce(&mut BytesMut)) -> Vec<u8> {
    let mut payload = BytesMut::new();
    write(&mut payload);
    let mut out = BytesMut::new();
    SessionHeader::sessionless(payload_type).write(payload.len() as u16, &mut out);
    out.extend_from_slice(&payload);
    out.to_vec()
}

/// Seals an in-session response the way the BMC does: console session ID in
/// the header, the BMC's own outbound sequence, suite envelope on top.
pub fn seal_response(session: &BmcSession, seq: u32, lan: &[u8]) -> Vec<u8> {
    let suite = session.suite;
    let body = suite
        .encrypt_payload(&session.keys.k2, lan)
        .expect("mock seals with supported suites only");

    let header = SessionHeader {
        payload_type: PayloadType::IpmiMessage,
        encrypted: suite.encrypted(),
        authenticated: suite.authenticated(),
        session_id: session.console_session_id,
        session_seq: seq,
    };
    let mut buf = BytesMut::new();
    header.write(body.len() as u16, &mut buf);
    buf.extend_from_slice(&body);

    if suite.authenticated() {
        let span = buf.len() - 4 + 2;
        let pad = (4 - span % 4) % 4;
        for _ in 0..pad {
            buf.extend_from_slice(&[0xFF]);
        }
        buf.extend_from_slice(&[pad as u8, NEXT_HEADER]);
        let tag = suite.integrity.tag(&session.keys.k1, &buf[4..]);
        buf.extend_from_slice(&tag);
    }
    buf.to_vec()
}

struct LanRequest {
    command: u8,
    rq_seq: u8,
    data: Vec<u8>,
}

fn try_decode_lan_request(raw: &[u8]) -> Option<LanRequest> {
    if raw.len() < 7 {
        return None;
    }
    if checksum(&raw[..2]) != raw[2] {
        return None;
    }
    let body = &raw[3..raw.len() - 1];
    if checksum(body) != raw[raw.len() - 1] {
        return None;
    }
    Some(LanRequest {
        command: body[2],
        rq_seq: body[1] >> 2,
        data: body[3..].to_vec(),
    })
}

pub fn encode_lan_response(rq_seq: u8, command: u8, completion: u8, data: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    let header = [REMOTE_CONSOLE_SOFTWARE_ID, NETFN_APP_RESPONSE << 2];
    buf.extend_from_slice(&header);
    buf.extend_from_slice(&[checksum(&header)]);
    let body_start = buf.len();
    buf.extend_from_slice(&[BMC_SLAVE_ADDRESS, (rq_seq & 0x3F) << 2, command, completion]);
    buf.extend_from_slice(data);
    let cs = checksum(&buf[body_start..]);
    buf.extend_from_slice(&[cs]);
    buf.to_vec()
}

/// Runs the full handshake against a mock BMC and returns the connection
/// handle.
pub async fn establish_session(
    manager: &rustipmi::manager::ConnectionManager,
    remote: SocketAddr,
    ping_period: std::time::Duration,
) -> usize {
    use rustipmi::protocol::handshake::PrivilegeLevel;

    let handle = manager
        .create_connection_with_ping_period(remote, ping_period)
        .await
        .unwrap();
    let suite = CipherSuite::from_id(3).unwrap();
    manager.get_available_cipher_suites(handle).await.unwrap();
    manager
        .get_channel_authentication_capabilities(handle, suite, PrivilegeLevel::Administrator)
        .await
        .unwrap();
    manager
        .start_session(
            handle,
            suite,
            PrivilegeLevel::Administrator,
            "admin",
            "password",
            None,
        )
        .await
        .unwrap();
    handle
}

/// Event recorder listener used to observe the listener path.
pub mod recorder {
    use std::sync::{Arc, Mutex};

    use rustipmi::connection::events::{ConnectionEvent, ConnectionListener};

    pub struct RecordingListener {
        pub events: Arc<Mutex<Vec<ConnectionEvent>>>,
    }

    impl RecordingListener {
        pub fn new() -> (Arc<RecordingListener>, Arc<Mutex<Vec<ConnectionEvent>>>) {
            let events = Arc::new(Mutex::new(Vec::new()));
            (
                Arc::new(RecordingListener {
                    events: events.clone(),
                }),
                events,
            )
        }
    }

    #[async_trait::async_trait]
    impl ConnectionListener for RecordingListener {
        async fn on_connection_event(&self, event: ConnectionEvent) {
            self.events.lock().unwrap().push(event);
        }
    }
}
