use anyhow::anyhow;
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::protocol::rmcp::{RmcpClass, RmcpHeader};

/// Authentication type marking an RMCP+ (IPMI v2.0) session wrapper.
pub const AUTH_TYPE_RMCP_PLUS: u8 = 0x06;

const PAYLOAD_ENCRYPTED_BIT: u8 = 0x80;
const PAYLOAD_AUTHENTICATED_BIT: u8 = 0x40;
const PAYLOAD_TYPE_MASK: u8 = 0x3F;

/// Byte closing the integrity trailer of an authenticated packet.
pub const NEXT_HEADER: u8 = 0x07;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum PayloadType {
    IpmiMessage = 0x00,
    OpenSessionRequest = 0x10,
    OpenSessionResponse = 0x11,
    Rakp1 = 0x12,
    Rakp2 = 0x13,
    Rakp3 = 0x14,
    Rakp4 = 0x15,
}

/// The IPMI v2.0 session wrapper between the RMCP header and the payload.
///
/// Sessionless traffic (the handshake) carries session ID and sequence 0.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SessionHeader {
    pub payload_type: PayloadType,
    pub encrypted: bool,
    pub authenticated: bool,
    pub session_id: u32,
    pub session_seq: u32,
}

impl SessionHeader {
    pub fn sessionless(payload_type: PayloadType) -> SessionHeader {
        SessionHeader {
            payload_type,
            encrypted: false,
            authenticated: false,
            session_id: 0,
            session_seq: 0,
        }
    }

    /// Writes RMCP header plus session wrapper for a payload of the given
    /// length.
    pub fn write(&self, payload_len: u16, buf: &mut BytesMut) {
        RmcpHeader::ipmi().write(buf);
        buf.put_u8(AUTH_TYPE_RMCP_PLUS);
        let mut type_byte: u8 = self.payload_type.into();
        if self.encrypted {
            type_byte |= PAYLOAD_ENCRYPTED_BIT;
        }
        if self.authenticated {
            type_byte |= PAYLOAD_AUTHENTICATED_BIT;
        }
        buf.put_u8(type_byte);
        buf.put_u32_le(self.session_id);
        buf.put_u32_le(self.session_seq);
        buf.put_u16_le(payload_len);
    }

    /// Parses the session wrapper including the leading RMCP header and
    /// returns it together with the payload length. The buffer is left at the
    /// first payload byte.
    pub fn try_read(buf: &mut impl Buf) -> anyhow::Result<(SessionHeader, usize)> {
        let rmcp = RmcpHeader::try_read(buf)?;
        if rmcp.class != RmcpClass::Ipmi {
            return Err(anyhow!("not an IPMI-class RMCP message"));
        }

        let auth_type = buf.try_get_u8()?;
        if auth_type != AUTH_TYPE_RMCP_PLUS {
            return Err(anyhow!("unsupported session auth type: {:#04x}", auth_type));
        }

        let type_byte = buf.try_get_u8()?;
        let payload_type = PayloadType::try_from(type_byte & PAYLOAD_TYPE_MASK)
            .map_err(|e| anyhow!("unsupported payload type: {:#04x}", e.number))?;
        let session_id = buf.try_get_u32_le()?;
        let session_seq = buf.try_get_u32_le()?;
        let payload_len = buf.try_get_u16_le()? as usize;

        if buf.remaining() < payload_len {
            return Err(anyhow!(
                "payload length {} exceeds remaining {} bytes",
                payload_len,
                buf.remaining()
            ));
        }

        Ok((
            SessionHeader {
                payload_type,
                encrypted: type_byte & PAYLOAD_ENCRYPTED_BIT != 0,
                authenticated: type_byte & PAYLOAD_AUTHENTICATED_BIT != 0,
                session_id,
                session_seq,
            },
            payload_len,
        ))
    }

    /// Number of bytes [`SessionHeader::write`] produces, RMCP header
    /// included.
    pub const SERIALIZED_LEN: usize = 16;
}
