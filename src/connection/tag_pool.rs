use tokio::sync::{Mutex, Notify};
use tracing::trace;

/// Number of message tags available for sessionless traffic. RMCP+ allots a
/// 6-bit tag; the top values are left to implementations that use fixed
/// tags.
pub const TAG_COUNT: u8 = 60;

struct TagPoolState {
    last_issued: u8,
    /// bit i set = tag i currently reserved
    reserved: u64,
}

/// Pool of message tags used to correlate requests sent before a session
/// exists. At most one owner per tag at any time; allocation rotates through
/// the range so a slow BMC echoing an old tag cannot collide with a fresh
/// request.
pub struct SessionlessTagPool {
    state: Mutex<TagPoolState>,
    released: Notify,
}

impl SessionlessTagPool {
    pub fn new() -> SessionlessTagPool {
        SessionlessTagPool {
            state: Mutex::new(TagPoolState {
                last_issued: TAG_COUNT - 1,
                reserved: 0,
            }),
            released: Notify::new(),
        }
    }

    /// Reserves the first free tag after the last-issued one (mod 60).
    /// Suspends while all tags are reserved; dropping the returned future
    /// while suspended reserves nothing.
    pub async fn acquire(&self) -> u8 {
        loop {
            {
                let mut state = self.state.lock().await;
                for offset in 1..=TAG_COUNT {
                    let tag = (state.last_issued + offset) % TAG_COUNT;
                    if state.reserved & (1u64 << tag) == 0 {
                        state.reserved |= 1u64 << tag;
                        state.last_issued = tag;
                        trace!(tag, "acquired sessionless tag");
                        return tag;
                    }
                }
            }
            self.released.notified().await;
        }
    }

    /// Frees a tag and wakes one waiter. Releasing a free tag is a no-op.
    pub async fn release(&self, tag: u8) {
        let mut state = self.state.lock().await;
        state.reserved &= !(1u64 << (tag % TAG_COUNT));
        trace!(tag, "released sessionless tag");
        drop(state);
        self.released.notify_one();
    }

    pub async fn reserved_count(&self) -> u32 {
        self.state.lock().await.reserved.count_ones()
    }
}

impl Default for SessionlessTagPool {
    fn default() -> Self {
        Self::new()
    }
}
