use anyhow::anyhow;
use bytes::{BufMut, BytesMut};

use crate::protocol::handshake::PrivilegeLevel;

pub const BMC_SLAVE_ADDRESS: u8 = 0x20;
pub const REMOTE_CONSOLE_SOFTWARE_ID: u8 = 0x81;

pub const NETFN_APP_REQUEST: u8 = 0x06;
pub const NETFN_APP_RESPONSE: u8 = 0x07;

pub const CMD_GET_CHANNEL_AUTH_CAPABILITIES: u8 = 0x38;
pub const CMD_SET_SESSION_PRIVILEGE_LEVEL: u8 = 0x3B;
pub const CMD_CLOSE_SESSION: u8 = 0x3C;
pub const CMD_GET_CHANNEL_CIPHER_SUITES: u8 = 0x54;

/// "This channel" selector accepted by channel-scoped commands.
pub const CHANNEL_CURRENT: u8 = 0x0E;

pub const COMPLETION_CODE_OK: u8 = 0x00;

/// Completion code the BMC reports when the addressed session has already
/// been reaped.
pub const COMPLETION_CODE_INVALID_SESSION_ID: u8 = 0x87;

/// An IPMI command about to be submitted. Commands other than the handshake
/// set carried here are built by callers from raw bytes.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct IpmiRequest {
    pub net_fn: u8,
    pub command: u8,
    pub data: Vec<u8>,
}

/// A decoded IPMI response message.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct IpmiResponse {
    pub net_fn: u8,
    pub command: u8,
    pub rq_seq: u8,
    pub completion_code: u8,
    pub data: Vec<u8>,
}

impl IpmiResponse {
    pub fn is_ok(&self) -> bool {
        self.completion_code == COMPLETION_CODE_OK
    }
}

/// 2's-complement checksum over a connection header or message body.
pub fn checksum(data: &[u8]) -> u8 {
    let sum: u8 = data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    sum.wrapping_neg()
}

/// Encodes an IPMI LAN message. `rq_seq` is the 6-bit requester sequence the
/// response will echo back, which is what request/response correlation keys
/// off.
pub fn encode_request(request: &IpmiRequest, rq_seq: u8, buf: &mut BytesMut) {
    let connection_header = [BMC_SLAVE_ADDRESS, request.net_fn << 2];
    buf.put_slice(&connection_header);
    buf.put_u8(checksum(&connection_header));

    let body_start = buf.len();
    buf.put_u8(REMOTE_CONSOLE_SOFTWARE_ID);
    buf.put_u8((rq_seq & 0x3F) << 2);
    buf.put_u8(request.command);
    buf.put_slice(&request.data);
    let body_checksum = checksum(&buf[body_start..]);
    buf.put_u8(body_checksum);
}

/// Decodes an IPMI LAN response message, verifying both checksums.
pub fn try_decode_response(raw: &[u8]) -> anyhow::Result<IpmiResponse> {
    if raw.len() < 8 {
        return Err(anyhow!("IPMI message too short: {} bytes", raw.len()));
    }

    let header = &raw[..2];
    if checksum(header) != raw[2] {
        return Err(anyhow!("IPMI connection header checksum mismatch"));
    }
    let net_fn = raw[1] >> 2;

    let body = &raw[3..raw.len() - 1];
    if checksum(body) != raw[raw.len() - 1] {
        return Err(anyhow!("IPMI message body checksum mismatch"));
    }

    let rq_seq = body[1] >> 2;
    let command = body[2];
    let completion_code = body[3];
    let data = body[4..].to_vec();

    Ok(IpmiResponse {
        net_fn,
        command,
        rq_seq,
        completion_code,
        data,
    })
}

/// GetChannelCipherSuites, issued repeatedly with increasing list index until
/// a chunk shorter than 16 bytes signals the end of the list.
pub fn get_channel_cipher_suites(channel: u8, list_index: u8) -> IpmiRequest {
    IpmiRequest {
        net_fn: NETFN_APP_REQUEST,
        command: CMD_GET_CHANNEL_CIPHER_SUITES,
        data: vec![channel, 0x00, 0x80 | (list_index & 0x3F)],
    }
}

/// Parses one GetChannelCipherSuites response chunk into the raw record
/// bytes. The first data byte echoes the channel number.
pub fn cipher_suite_chunk(response: &IpmiResponse) -> anyhow::Result<&[u8]> {
    if response.data.is_empty() {
        return Err(anyhow!("cipher suite response carries no channel number"));
    }
    Ok(&response.data[1..])
}

const RECORD_START: u8 = 0xC0;
const RECORD_START_OEM: u8 = 0xC1;

/// Extracts the cipher-suite IDs from concatenated cipher suite record
/// bytes. OEM records are skipped over, unknown bytes between records are
/// ignored.
pub fn cipher_suite_ids(records: &[u8]) -> Vec<u8> {
    let mut ids = Vec::new();
    let mut i = 0;
    while i < records.len() {
        match records[i] {
            RECORD_START => {
                if let Some(id) = records.get(i + 1) {
                    ids.push(*id);
                }
                i += 2;
            }
            RECORD_START_OEM => {
                // id byte plus 3-byte OEM IANA
                i += 5;
            }
            _ => {
                i += 1;
            }
        }
    }
    ids
}

/// GetChannelAuthenticationCapabilities with the IPMI v2.0 extended-data bit
/// set. Doubles as the session keep-alive no-op.
pub fn get_channel_authentication_capabilities(
    channel: u8,
    privilege: PrivilegeLevel,
) -> IpmiRequest {
    IpmiRequest {
        net_fn: NETFN_APP_REQUEST,
        command: CMD_GET_CHANNEL_AUTH_CAPABILITIES,
        data: vec![channel | 0x80, privilege.into()],
    }
}

/// Decoded GetChannelAuthenticationCapabilities response data.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct AuthCapabilities {
    pub channel_number: u8,
    pub rmcp_plus_supported: bool,
    /// Two-key (K_g) authentication is required by the BMC.
    pub bmc_key_required: bool,
    pub oem_id: u32,
}

impl AuthCapabilities {
    pub fn try_from_response(response: &IpmiResponse) -> anyhow::Result<AuthCapabilities> {
        if response.data.len() < 8 {
            return Err(anyhow!(
                "auth capabilities response too short: {} bytes",
                response.data.len()
            ));
        }
        let channel_number = response.data[0];
        let rmcp_plus_supported = response.data[1] & 0x80 != 0;
        let bmc_key_required = response.data[2] & 0x20 != 0;
        let oem_id = u32::from_le_bytes([
            response.data[4],
            response.data[5],
            response.data[6],
            0,
        ]);

        Ok(AuthCapabilities {
            channel_number,
            rmcp_plus_supported,
            bmc_key_required,
            oem_id,
        })
    }
}

pub fn set_session_privilege_level(privilege: PrivilegeLevel) -> IpmiRequest {
    IpmiRequest {
        net_fn: NETFN_APP_REQUEST,
        command: CMD_SET_SESSION_PRIVILEGE_LEVEL,
        data: vec![privilege.into()],
    }
}

pub fn close_session(managed_system_session_id: u32) -> IpmiRequest {
    IpmiRequest {
        net_fn: NETFN_APP_REQUEST,
        command: CMD_CLOSE_SESSION,
        data: managed_system_session_id.to_le_bytes().to_vec(),
    }
}
