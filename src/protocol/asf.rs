use anyhow::anyhow;
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;

use crate::protocol::rmcp::RmcpHeader;

/// IANA enterprise number of the ASF forum, carried in every ASF message.
pub const ASF_IANA: u32 = 4542;

pub const ASF_TYPE_PRESENCE_PING: u8 = 0x80;
pub const ASF_TYPE_PRESENCE_PONG: u8 = 0x40;

/// Bit in the pong's supported-entities field advertising IPMI support.
const ENTITY_IPMI_SUPPORTED: u8 = 0x80;

/// ASF presence ping, the pre-session reachability probe. The managed system
/// answers with a [`PresencePong`] carrying the same tag.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PresencePing {
    pub message_tag: u8,
}

impl PresencePing {
    pub fn write(&self, buf: &mut BytesMut) {
        RmcpHeader::asf().write(buf);
        buf.put_u32(ASF_IANA);
        buf.put_u8(ASF_TYPE_PRESENCE_PING);
        buf.put_u8(self.message_tag);
        buf.put_u8(0x00);
        buf.put_u8(0x00); // no data
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PresencePong {
    pub message_tag: u8,
    pub ipmi_supported: bool,
}

impl PresencePong {
    /// Parses the ASF body following the RMCP header.
    pub fn try_read(buf: &mut impl Buf) -> anyhow::Result<PresencePong> {
        let iana = buf.try_get_u32()?;
        if iana != ASF_IANA {
            return Err(anyhow!("unexpected ASF IANA number: {}", iana));
        }
        let message_type = buf.try_get_u8()?;
        if message_type != ASF_TYPE_PRESENCE_PONG {
            return Err(anyhow!("unexpected ASF message type: {:#04x}", message_type));
        }
        let message_tag = buf.try_get_u8()?;
        let _reserved = buf.try_get_u8()?;
        let data_len = buf.try_get_u8()? as usize;
        if data_len < 12 || buf.remaining() < data_len {
            return Err(anyhow!("truncated ASF pong data: {} bytes", data_len));
        }
        let _oem_iana = buf.try_get_u32()?;
        let _oem_defined = buf.try_get_u32()?;
        let entities = buf.try_get_u8()?;

        Ok(PresencePong {
            message_tag,
            ipmi_supported: entities & ENTITY_IPMI_SUPPORTED != 0,
        })
    }

    /// Serialises a pong; the client itself never sends one, but test
    /// harnesses acting as the managed system do.
    pub fn write(&self, buf: &mut BytesMut) {
        RmcpHeader::asf().write(buf);
        buf.put_u32(ASF_IANA);
        buf.put_u8(ASF_TYPE_PRESENCE_PONG);
        buf.put_u8(self.message_tag);
        buf.put_u8(0x00);
        buf.put_u8(16);
        buf.put_u32(ASF_IANA);
        buf.put_u32(0);
        buf.put_u8(if self.ipmi_supported { ENTITY_IPMI_SUPPORTED } else { 0 });
        buf.put_u8(0x00);
        buf.put_slice(&[0u8; 6]);
    }
}
