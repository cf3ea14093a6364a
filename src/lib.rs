//! Client-side IPMI v2.0 / RMCP+ library: authenticated, encrypted sessions
//! to baseboard management controllers over UDP.
//!
//! The [`manager::ConnectionManager`] owns one UDP endpoint and multiplexes
//! many logical [`connection::Connection`]s over it. Each connection drives
//! the RMCP+ open-session / RAKP handshake through a deterministic state
//! machine and correlates in-flight commands with their responses, retrying
//! on datagram loss and keeping established sessions alive with periodic
//! no-op commands.

pub mod config;
pub mod connection;
pub mod error;
pub mod manager;
pub mod protocol;
pub mod security;
pub mod timer;
pub mod transport;
