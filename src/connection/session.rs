use tokio::time::Instant;
use tracing::{debug, warn};

use crate::protocol::handshake::PrivilegeLevel;
use crate::security::{CipherSuite, SessionKeys};

/// Width of the inbound anti-replay window.
const WINDOW_SIZE: u32 = 16;

/// Sliding acceptance window over the BMC's outbound sequence numbers.
/// Tracks the highest sequence seen and a bitmap of the 16 sequences at and
/// below it; anything below the low-water mark or already seen is a replay.
#[derive(Debug, Clone, Copy)]
pub struct SequenceWindow {
    top: u32,
    /// bit 0 = `top`, bit n = `top - n`
    seen: u16,
}

impl SequenceWindow {
    pub fn new() -> SequenceWindow {
        SequenceWindow { top: 0, seen: 0 }
    }

    /// Checks a received sequence number and advances the window when it is
    /// fresh. Returns false for replays and for sequences that regressed
    /// below the low-water mark.
    pub fn accept(&mut self, seq: u32) -> bool {
        if seq == 0 {
            // 0 marks unsequenced traffic and never advances the window
            return false;
        }

        if seq > self.top {
            let shift = seq - self.top;
            self.seen = if shift >= WINDOW_SIZE {
                0
            } else {
                self.seen << shift
            };
            self.seen |= 1;
            self.top = seq;
            return true;
        }

        let offset = self.top - seq;
        if offset >= WINDOW_SIZE {
            warn!(seq, top = self.top, "sequence below replay window low-water mark");
            return false;
        }
        let bit = 1u16 << offset;
        if self.seen & bit != 0 {
            warn!(seq, "replayed sequence number");
            return false;
        }
        self.seen |= bit;
        true
    }

    pub fn low_water(&self) -> u32 {
        self.top.saturating_sub(WINDOW_SIZE - 1)
    }
}

impl Default for SequenceWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// State of an established RMCP+ session, created once RAKP-4 validates and
/// mutated only by the message handler.
pub struct SessionRecord {
    pub managed_system_session_id: u32,
    pub console_session_id: u32,
    pub cipher_suite: CipherSuite,
    pub privilege: PrivilegeLevel,
    pub keys: SessionKeys,

    outbound_authenticated: u32,
    outbound_unauthenticated: u32,
    inbound_authenticated: SequenceWindow,
    inbound_unauthenticated: SequenceWindow,

    pub last_activity: Instant,
}

impl SessionRecord {
    pub fn new(
        managed_system_session_id: u32,
        console_session_id: u32,
        cipher_suite: CipherSuite,
        privilege: PrivilegeLevel,
        keys: SessionKeys,
    ) -> SessionRecord {
        SessionRecord {
            managed_system_session_id,
            console_session_id,
            cipher_suite,
            privilege,
            keys,
            outbound_authenticated: 0,
            outbound_unauthenticated: 0,
            inbound_authenticated: SequenceWindow::new(),
            inbound_unauthenticated: SequenceWindow::new(),
            last_activity: Instant::now(),
        }
    }

    /// Issues the next outbound sequence number, strictly increasing within
    /// the session. Sequence 0 is reserved for sessionless traffic.
    pub fn next_outbound_seq(&mut self, authenticated: bool) -> u32 {
        let counter = if authenticated {
            &mut self.outbound_authenticated
        } else {
            &mut self.outbound_unauthenticated
        };
        *counter += 1;
        *counter
    }

    /// Validates an inbound sequence number against the replay window.
    pub fn accept_inbound(&mut self, seq: u32, authenticated: bool) -> bool {
        let window = if authenticated {
            &mut self.inbound_authenticated
        } else {
            &mut self.inbound_unauthenticated
        };
        let accepted = window.accept(seq);
        if accepted {
            self.last_activity = Instant::now();
        } else {
            debug!(
                seq,
                authenticated,
                low_water = self.inbound_low_water(authenticated),
                "discarding replayed or stale packet"
            );
        }
        accepted
    }

    pub fn inbound_low_water(&self, authenticated: bool) -> u32 {
        if authenticated {
            self.inbound_authenticated.low_water()
        } else {
            self.inbound_unauthenticated.low_water()
        }
    }
}
