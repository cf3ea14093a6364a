use anyhow::anyhow;
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use num_enum::{FromPrimitive, IntoPrimitive, TryFromPrimitive};

use crate::security::CipherSuite;

/// Privilege level requested for (and granted to) a session.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum PrivilegeLevel {
    Callback = 1,
    User = 2,
    Operator = 3,
    Administrator = 4,
}

/// RMCP+ status code carried in OpenSessionResponse and RAKP 2-4. Anything
/// other than `NoErrors` terminates the handshake.
#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum RakpStatusCode {
    NoErrors = 0x00,
    InsufficientResources = 0x01,
    InvalidSessionId = 0x02,
    InvalidPayloadType = 0x03,
    InvalidAuthenticationAlgorithm = 0x04,
    InvalidIntegrityAlgorithm = 0x05,
    NoMatchingAuthenticationPayload = 0x06,
    NoMatchingIntegrityPayload = 0x07,
    InactiveSessionId = 0x08,
    InvalidRole = 0x09,
    UnauthorizedRoleRequested = 0x0A,
    InsufficientResourcesForRole = 0x0B,
    InvalidNameLength = 0x0C,
    UnauthorizedName = 0x0D,
    UnauthorizedGuid = 0x0E,
    InvalidIntegrityCheckValue = 0x0F,
    InvalidConfidentialityAlgorithm = 0x10,
    NoCipherSuiteMatch = 0x11,
    IllegalParameter = 0x12,
    #[num_enum(catch_all)]
    Other(u8),
}

const RECORD_AUTHENTICATION: u8 = 0x00;
const RECORD_INTEGRITY: u8 = 0x01;
const RECORD_CONFIDENTIALITY: u8 = 0x02;
const RECORD_LEN: u8 = 0x08;

fn write_algorithm_record(record_type: u8, algorithm: u8, buf: &mut BytesMut) {
    buf.put_u8(record_type);
    buf.put_u16(0); // reserved
    buf.put_u8(RECORD_LEN);
    buf.put_u8(algorithm);
    buf.put_u8(0);
    buf.put_u16(0); // reserved
}

fn try_read_algorithm_record(expected_type: u8, buf: &mut impl Buf) -> anyhow::Result<u8> {
    let record_type = buf.try_get_u8()?;
    if record_type != expected_type {
        return Err(anyhow!(
            "expected algorithm record {:#04x}, got {:#04x}",
            expected_type,
            record_type
        ));
    }
    let _reserved = buf.try_get_u16()?;
    let len = buf.try_get_u8()?;
    if len != RECORD_LEN {
        return Err(anyhow!("unsupported algorithm record length: {}", len));
    }
    let algorithm = buf.try_get_u8()?;
    let _ = buf.try_get_u8()?;
    let _reserved = buf.try_get_u16()?;
    Ok(algorithm)
}

/// RMCP+ Open Session Request (payload type 0x10).
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct OpenSessionRequest {
    pub message_tag: u8,
    pub requested_privilege: PrivilegeLevel,
    pub console_session_id: u32,
    pub cipher_suite: CipherSuite,
}

impl OpenSessionRequest {
    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u8(self.message_tag);
        buf.put_u8(self.requested_privilege.into());
        buf.put_u16(0); // reserved
        buf.put_u32_le(self.console_session_id);
        write_algorithm_record(
            RECORD_AUTHENTICATION,
            self.cipher_suite.authentication.into(),
            buf,
        );
        write_algorithm_record(RECORD_INTEGRITY, self.cipher_suite.integrity.into(), buf);
        write_algorithm_record(
            RECORD_CONFIDENTIALITY,
            self.cipher_suite.confidentiality.into(),
            buf,
        );
    }

    pub fn try_read(buf: &mut impl Buf) -> anyhow::Result<OpenSessionRequest> {
        let message_tag = buf.try_get_u8()?;
        let requested_privilege = PrivilegeLevel::try_from(buf.try_get_u8()?)
            .map_err(|e| anyhow!("invalid privilege level: {:#04x}", e.number))?;
        let _reserved = buf.try_get_u16()?;
        let console_session_id = buf.try_get_u32_le()?;
        let authentication = try_read_algorithm_record(RECORD_AUTHENTICATION, buf)?;
        let integrity = try_read_algorithm_record(RECORD_INTEGRITY, buf)?;
        let confidentiality = try_read_algorithm_record(RECORD_CONFIDENTIALITY, buf)?;
        let cipher_suite = CipherSuite::from_algorithms(authentication, integrity, confidentiality)
            .ok_or_else(|| anyhow!("no cipher suite matches the requested algorithms"))?;

        Ok(OpenSessionRequest {
            message_tag,
            requested_privilege,
            console_session_id,
            cipher_suite,
        })
    }
}

/// RMCP+ Open Session Response (payload type 0x11). On any status other than
/// `NoErrors` only the tag and status are meaningful.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct OpenSessionResponse {
    pub message_tag: u8,
    pub status: RakpStatusCode,
    pub maximum_privilege: u8,
    pub console_session_id: u32,
    pub managed_system_session_id: u32,
    pub authentication: u8,
    pub integrity: u8,
    pub confidentiality: u8,
}

impl OpenSessionResponse {
    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u8(self.message_tag);
        buf.put_u8(self.status.into());
        buf.put_u8(self.maximum_privilege);
        buf.put_u8(0);
        buf.put_u32_le(self.console_session_id);
        if self.status != RakpStatusCode::NoErrors {
            return;
        }
        buf.put_u32_le(self.managed_system_session_id);
        write_algorithm_record(RECORD_AUTHENTICATION, self.authentication, buf);
        write_algorithm_record(RECORD_INTEGRITY, self.integrity, buf);
        write_algorithm_record(RECORD_CONFIDENTIALITY, self.confidentiality, buf);
    }

    pub fn try_read(buf: &mut impl Buf) -> anyhow::Result<OpenSessionResponse> {
        let message_tag = buf.try_get_u8()?;
        let status = RakpStatusCode::from(buf.try_get_u8()?);
        let maximum_privilege = buf.try_get_u8()?;
        let _reserved = buf.try_get_u8()?;
        let console_session_id = buf.try_get_u32_le()?;
        if status != RakpStatusCode::NoErrors {
            return Ok(OpenSessionResponse {
                message_tag,
                status,
                maximum_privilege,
                console_session_id,
                managed_system_session_id: 0,
                authentication: 0,
                integrity: 0,
                confidentiality: 0,
            });
        }
        let managed_system_session_id = buf.try_get_u32_le()?;
        let authentication = try_read_algorithm_record(RECORD_AUTHENTICATION, buf)?;
        let integrity = try_read_algorithm_record(RECORD_INTEGRITY, buf)?;
        let confidentiality = try_read_algorithm_record(RECORD_CONFIDENTIALITY, buf)?;

        Ok(OpenSessionResponse {
            message_tag,
            status,
            maximum_privilege,
            console_session_id,
            managed_system_session_id,
            authentication,
            integrity,
            confidentiality,
        })
    }
}

/// RAKP Message 1 (payload type 0x12): console nonce and identity.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Rakp1 {
    pub message_tag: u8,
    pub managed_system_session_id: u32,
    pub console_nonce: [u8; 16],
    pub requested_privilege: PrivilegeLevel,
    pub username: Vec<u8>,
}

impl Rakp1 {
    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u8(self.message_tag);
        buf.put_slice(&[0; 3]);
        buf.put_u32_le(self.managed_system_session_id);
        buf.put_slice(&self.console_nonce);
        buf.put_u8(self.requested_privilege.into());
        buf.put_u16(0); // reserved
        buf.put_u8(self.username.len() as u8);
        buf.put_slice(&self.username);
    }

    pub fn try_read(buf: &mut impl Buf) -> anyhow::Result<Rakp1> {
        let message_tag = buf.try_get_u8()?;
        let _ = buf.try_get_u8()?;
        let _reserved = buf.try_get_u16()?;
        let managed_system_session_id = buf.try_get_u32_le()?;
        let mut console_nonce = [0u8; 16];
        try_copy(buf, &mut console_nonce)?;
        let requested_privilege = PrivilegeLevel::try_from(buf.try_get_u8()?)
            .map_err(|e| anyhow!("invalid privilege level: {:#04x}", e.number))?;
        let _reserved = buf.try_get_u16()?;
        let username_len = buf.try_get_u8()? as usize;
        if buf.remaining() < username_len {
            return Err(anyhow!("truncated RAKP1 username"));
        }
        let mut username = vec![0u8; username_len];
        buf.copy_to_slice(&mut username);

        Ok(Rakp1 {
            message_tag,
            managed_system_session_id,
            console_nonce,
            requested_privilege,
            username,
        })
    }
}

/// RAKP Message 2 (payload type 0x13): BMC nonce, GUID and the key-exchange
/// authentication code proving the BMC knows K_uid.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Rakp2 {
    pub message_tag: u8,
    pub status: RakpStatusCode,
    pub console_session_id: u32,
    pub bmc_nonce: [u8; 16],
    pub bmc_guid: [u8; 16],
    pub key_exchange_auth_code: Vec<u8>,
}

impl Rakp2 {
    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u8(self.message_tag);
        buf.put_u8(self.status.into());
        buf.put_u16(0); // reserved
        buf.put_u32_le(self.console_session_id);
        if self.status != RakpStatusCode::NoErrors {
            return;
        }
        buf.put_slice(&self.bmc_nonce);
        buf.put_slice(&self.bmc_guid);
        buf.put_slice(&self.key_exchange_auth_code);
    }

    pub fn try_read(buf: &mut impl Buf) -> anyhow::Result<Rakp2> {
        let message_tag = buf.try_get_u8()?;
        let status = RakpStatusCode::from(buf.try_get_u8()?);
        let _reserved = buf.try_get_u16()?;
        let console_session_id = buf.try_get_u32_le()?;
        let mut bmc_nonce = [0u8; 16];
        let mut bmc_guid = [0u8; 16];
        if status == RakpStatusCode::NoErrors {
            try_copy(buf, &mut bmc_nonce)?;
            try_copy(buf, &mut bmc_guid)?;
        }
        let mut key_exchange_auth_code = vec![0u8; buf.remaining()];
        buf.copy_to_slice(&mut key_exchange_auth_code);

        Ok(Rakp2 {
            message_tag,
            status,
            console_session_id,
            bmc_nonce,
            bmc_guid,
            key_exchange_auth_code,
        })
    }
}

/// RAKP Message 3 (payload type 0x14): console proof of K_uid.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Rakp3 {
    pub message_tag: u8,
    pub status: RakpStatusCode,
    pub managed_system_session_id: u32,
    pub key_exchange_auth_code: Vec<u8>,
}

impl Rakp3 {
    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u8(self.message_tag);
        buf.put_u8(self.status.into());
        buf.put_u16(0); // reserved
        buf.put_u32_le(self.managed_system_session_id);
        buf.put_slice(&self.key_exchange_auth_code);
    }

    pub fn try_read(buf: &mut impl Buf) -> anyhow::Result<Rakp3> {
        let message_tag = buf.try_get_u8()?;
        let status = RakpStatusCode::from(buf.try_get_u8()?);
        let _reserved = buf.try_get_u16()?;
        let managed_system_session_id = buf.try_get_u32_le()?;
        let mut key_exchange_auth_code = vec![0u8; buf.remaining()];
        buf.copy_to_slice(&mut key_exchange_auth_code);

        Ok(Rakp3 {
            message_tag,
            status,
            managed_system_session_id,
            key_exchange_auth_code,
        })
    }
}

/// RAKP Message 4 (payload type 0x15): BMC integrity check value over the new
/// session, keyed with the SIK.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Rakp4 {
    pub message_tag: u8,
    pub status: RakpStatusCode,
    pub console_session_id: u32,
    pub integrity_check_value: Vec<u8>,
}

impl Rakp4 {
    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u8(self.message_tag);
        buf.put_u8(self.status.into());
        buf.put_u16(0); // reserved
        buf.put_u32_le(self.console_session_id);
        buf.put_slice(&self.integrity_check_value);
    }

    pub fn try_read(buf: &mut impl Buf) -> anyhow::Result<Rakp4> {
        let message_tag = buf.try_get_u8()?;
        let status = RakpStatusCode::from(buf.try_get_u8()?);
        let _reserved = buf.try_get_u16()?;
        let console_session_id = buf.try_get_u32_le()?;
        let mut integrity_check_value = vec![0u8; buf.remaining()];
        buf.copy_to_slice(&mut integrity_check_value);

        Ok(Rakp4 {
            message_tag,
            status,
            console_session_id,
            integrity_check_value,
        })
    }
}

fn try_copy(buf: &mut impl Buf, target: &mut [u8]) -> anyhow::Result<()> {
    if buf.remaining() < target.len() {
        return Err(anyhow!("buffer too short for {} byte field", target.len()));
    }
    buf.copy_to_slice(target);
    Ok(())
}
