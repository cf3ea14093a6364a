use rustc_hash::FxHashSet;
use tokio::sync::Mutex;
use tracing::trace;

/// First session ID ever issued; the values below are left for
/// implementations with fixed well-known IDs.
const FIRST_SESSION_ID: u32 = 100;

/// Wrap bound. Staying in the lowest quarter of the 31-bit space leaves
/// headroom for the BMC-side counterpart and avoids reserved session IDs.
const WRAP_BOUND: u32 = (i32::MAX / 4) as u32;

struct IdState {
    next: u32,
    in_use: FxHashSet<u32>,
}

/// Issues console-side session IDs, monotonically per generator. IDs stay
/// reserved until released on session teardown, so a wrapped counter never
/// reissues a live ID.
pub struct SessionIdGenerator {
    state: Mutex<IdState>,
}

impl SessionIdGenerator {
    pub fn new() -> SessionIdGenerator {
        SessionIdGenerator {
            state: Mutex::new(IdState {
                next: FIRST_SESSION_ID,
                in_use: FxHashSet::default(),
            }),
        }
    }

    pub async fn acquire(&self) -> u32 {
        let mut state = self.state.lock().await;
        loop {
            if state.next >= WRAP_BOUND {
                state.next = FIRST_SESSION_ID;
            }
            let candidate = state.next;
            state.next += 1;
            if state.in_use.insert(candidate) {
                trace!(session_id = candidate, "issued console session id");
                return candidate;
            }
        }
    }

    pub async fn release(&self, id: u32) {
        self.state.lock().await.in_use.remove(&id);
    }
}

impl Default for SessionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
