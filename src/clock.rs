use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Upper bound on one underlying relative sleep. Re-checking the wall clock
/// at this cadence keeps absolute deadlines honest across host suspend.
const MAX_SLEEP_SLICE: Duration = Duration::from_secs(60);

#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Sleep until an absolute instant. Completes at or after `deadline`;
    /// early wakeups are re-armed internally.
    async fn sleep_until(&self, deadline: DateTime<Utc>);
}

#[derive(Debug, PartialEq, Eq)]
pub enum SleepOutcome {
    Elapsed,
    Cancelled,
}

/// Absolute sleep that returns immediately with a distinct outcome when the
/// token fires.
pub async fn sleep_or_cancel(
    clock: &dyn Clock,
    deadline: DateTime<Utc>,
    token: &CancellationToken,
) -> SleepOutcome {
    tokio::select! {
        _ = clock.sleep_until(deadline) => SleepOutcome::Elapsed,
        _ = token.cancelled() => SleepOutcome::Cancelled,
    }
}

#[derive(Debug, Default, Clone)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        loop {
            let now = Utc::now();
            if now >= deadline {
                return;
            }
            let remaining = (deadline - now).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(remaining.min(MAX_SLEEP_SLICE)).await;
        }
    }
}

/// Manually advanced clock for tests. Waiters whose deadline has been
/// reached are released in deadline order (registration order on ties).
pub struct ManualClock {
    inner: Mutex<ManualState>,
}

struct ManualState {
    now: DateTime<Utc>,
    seq: u64,
    waiters: Vec<Waiter>,
}

struct Waiter {
    deadline: DateTime<Utc>,
    seq: u64,
    tx: oneshot::Sender<()>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            inner: Mutex::new(ManualState {
                now: start,
                seq: 0,
                waiters: Vec::new(),
            }),
        }
    }

    pub fn advance(&self, step: Duration) {
        let due = {
            let mut st = self.inner.lock().unwrap();
            st.now = st.now + TimeDelta::from_std(step).expect("step out of range");
            let now = st.now;
            let mut due: Vec<Waiter> = Vec::new();
            let mut remaining = Vec::new();
            for w in st.waiters.drain(..) {
                if w.deadline <= now {
                    due.push(w);
                } else {
                    remaining.push(w);
                }
            }
            st.waiters = remaining;
            due.sort_by_key(|w| (w.deadline, w.seq));
            due
        };
        for w in due {
            let _ = w.tx.send(());
        }
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.inner.lock().unwrap().now
    }

    async fn sleep_until(&self, deadline: DateTime<Utc>) {
        let rx = {
            let mut st = self.inner.lock().unwrap();
            if st.now >= deadline {
                return;
            }
            let (tx, rx) = oneshot::channel();
            st.seq += 1;
            let seq = st.seq;
            st.waiters.push(Waiter { deadline, seq, tx });
            rx
        };
        let _ = rx.await;
    }
}
