//! Wire codecs for the RMCP/RMCP+ framing and the payloads this library
//! produces and consumes. Parse functions return `anyhow::Result`; the
//! message handler maps failures to protocol-violation errors at its
//! boundary.

pub mod asf;
pub mod handshake;
pub mod ipmi_lan;
pub mod rmcp;
pub mod session;
