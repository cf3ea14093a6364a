use anyhow::anyhow;
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use num_enum::{IntoPrimitive, TryFromPrimitive};

pub const RMCP_VERSION_1: u8 = 0x06;

/// Sequence number for RMCP messages that must not be ACKed at the RMCP
/// level, which is all traffic this library produces.
pub const RMCP_NO_ACK_SEQUENCE: u8 = 0xFF;

#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum RmcpClass {
    Asf = 0x06,
    Ipmi = 0x07,
}

/// The 4-byte RMCP encapsulation preceding every datagram.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct RmcpHeader {
    pub version: u8,
    pub sequence: u8,
    pub class: RmcpClass,
}

impl RmcpHeader {
    pub fn ipmi() -> RmcpHeader {
        RmcpHeader {
            version: RMCP_VERSION_1,
            sequence: RMCP_NO_ACK_SEQUENCE,
            class: RmcpClass::Ipmi,
        }
    }

    pub fn asf() -> RmcpHeader {
        RmcpHeader {
            version: RMCP_VERSION_1,
            sequence: RMCP_NO_ACK_SEQUENCE,
            class: RmcpClass::Asf,
        }
    }

    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        buf.put_u8(0x00);
        buf.put_u8(self.sequence);
        buf.put_u8(self.class.into());
    }

    pub fn try_read(buf: &mut impl Buf) -> anyhow::Result<RmcpHeader> {
        let version = buf.try_get_u8()?;
        if version != RMCP_VERSION_1 {
            return Err(anyhow!("unsupported RMCP version: {:#04x}", version));
        }
        let _reserved = buf.try_get_u8()?;
        let sequence = buf.try_get_u8()?;
        let class = RmcpClass::try_from(buf.try_get_u8()?)
            .map_err(|e| anyhow!("unsupported RMCP class: {:#04x}", e.number))?;

        Ok(RmcpHeader {
            version,
            sequence,
            class,
        })
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::ipmi(RmcpHeader::ipmi(), b"\x06\x00\xff\x07")]
    #[case::asf(RmcpHeader::asf(), b"\x06\x00\xff\x06")]
    fn test_rmcp_write(#[case] header: RmcpHeader, #[case] expected: &[u8]) {
        let mut buf = BytesMut::new();
        header.write(&mut buf);
        assert_eq!(&buf[..], expected);
    }

    #[rstest]
    #[case::ipmi(b"\x06\x00\xff\x07" as &[u8], Some(RmcpClass::Ipmi))]
    #[case::asf(b"\x06\x00\xff\x06", Some(RmcpClass::Asf))]
    #[case::bad_version(b"\x07\x00\xff\x07", None)]
    #[case::bad_class(b"\x06\x00\xff\x09", None)]
    #[case::truncated(b"\x06\x00", None)]
    fn test_rmcp_try_read(#[case] raw: &[u8], #[case] expected_class: Option<RmcpClass>) {
        let mut buf = raw;
        match RmcpHeader::try_read(&mut buf) {
            Ok(header) => {
                assert_eq!(Some(header.class), expected_class);
                assert_eq!(header.version, RMCP_VERSION_1);
            }
            Err(_) => assert!(expected_class.is_none()),
        }
    }
}
