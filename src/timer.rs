//! A bounded pool of scheduled tasks shared by all connections: request
//! timeouts, retries and session keep-alives all run here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::trace;

/// A unit of work the timer service runs. Tasks must not block indefinitely;
/// they share the bounded pool with every other connection.
#[async_trait::async_trait]
pub trait TimerTask: Sync + Send + 'static {
    async fn run(&self);
}

/// Cancellable handle for a scheduled task. Cancellation is best-effort and
/// idempotent: a task that already started running finishes its current run.
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.task.abort();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Schedules one-shot and fixed-rate tasks with task concurrency bounded by
/// a fixed number of pool permits.
pub struct TimerService {
    permits: Arc<Semaphore>,
}

impl TimerService {
    pub fn new(pool_size: usize) -> TimerService {
        TimerService {
            permits: Arc::new(Semaphore::new(pool_size.max(1))),
        }
    }

    /// Runs `task` once after `delay`.
    pub fn schedule_after(&self, delay: Duration, task: Arc<dyn TimerTask>) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let permits = self.permits.clone();

        let handle = tokio::spawn(async move {
            sleep(delay).await;
            if flag.load(Ordering::Acquire) {
                return;
            }
            let Ok(_permit) = permits.acquire().await else {
                return;
            };
            if flag.load(Ordering::Acquire) {
                return;
            }
            trace!("running one-shot timer task");
            task.run().await;
        });

        TimerHandle {
            cancelled,
            task: handle,
        }
    }

    /// Runs `task` every `period`, first run one period from now. A run that
    /// outlasts the period delays subsequent runs instead of stacking them.
    pub fn schedule_at_fixed_rate(&self, period: Duration, task: Arc<dyn TimerTask>) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let permits = self.permits.clone();

        let handle = tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                if flag.load(Ordering::Acquire) {
                    return;
                }
                let Ok(_permit) = permits.acquire().await else {
                    return;
                };
                if flag.load(Ordering::Acquire) {
                    return;
                }
                trace!("running fixed-rate timer task");
                task.run().await;
            }
        });

        TimerHandle {
            cancelled,
            task: handle,
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicU32;

    use tokio::time;

    use super::*;

    struct Counter {
        runs: AtomicU32,
    }

    #[async_trait::async_trait]
    impl TimerTask for Counter {
        async fn run(&self) {
            self.runs.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counter() -> Arc<Counter> {
        Arc::new(Counter {
            runs: AtomicU32::new(0),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_after_fires_once() {
        let timer = TimerService::new(2);
        let task = counter();
        let _handle = timer.schedule_after(Duration::from_millis(100), task.clone());

        time::sleep(Duration::from_millis(90)).await;
        assert_eq!(task.runs.load(Ordering::SeqCst), 0);

        time::sleep(Duration::from_millis(500)).await;
        assert_eq!(task.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_fire() {
        let timer = TimerService::new(2);
        let task = counter();
        let handle = timer.schedule_after(Duration::from_millis(100), task.clone());

        handle.cancel();
        handle.cancel(); // idempotent
        assert!(handle.is_cancelled());

        time::sleep(Duration::from_millis(500)).await;
        assert_eq!(task.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_rate_fires_repeatedly() {
        let timer = TimerService::new(2);
        let task = counter();
        let handle = timer.schedule_at_fixed_rate(Duration::from_millis(50), task.clone());

        time::sleep(Duration::from_millis(275)).await;
        let fired = task.runs.load(Ordering::SeqCst);
        assert!(fired >= 4, "expected at least 4 runs, got {}", fired);

        handle.cancel();
        let after_cancel = task.runs.load(Ordering::SeqCst);
        time::sleep(Duration::from_millis(500)).await;
        assert_eq!(task.runs.load(Ordering::SeqCst), after_cancel);
    }
}
