use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex;

use crate::upstream::UpstreamError;

type Flight<T> = Shared<BoxFuture<'static, Result<Arc<T>, UpstreamError>>>;

struct Slot<T> {
    value: Option<(Arc<T>, Instant)>,
    flight: Option<Flight<T>>,
}

/// Process-wide cache with lazy refresh and single-flight coalescing:
/// concurrent callers past the TTL share one in-flight fetch, and a failed
/// refresh is delivered to every waiter of that flight.
pub struct SharedCache<T> {
    ttl: Duration,
    slot: Mutex<Slot<T>>,
}

impl<T: Send + Sync + 'static> SharedCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: Mutex::new(Slot {
                value: None,
                flight: None,
            }),
        }
    }

    pub async fn get_with<F>(&self, fetch: F) -> Result<Arc<T>, UpstreamError>
    where
        F: FnOnce() -> BoxFuture<'static, Result<Arc<T>, UpstreamError>>,
    {
        let flight = {
            let mut slot = self.slot.lock().await;
            if let Some((value, stored_at)) = &slot.value {
                if stored_at.elapsed() < self.ttl {
                    return Ok(value.clone());
                }
            }
            match &slot.flight {
                Some(flight) => flight.clone(),
                None => {
                    let flight = fetch().shared();
                    slot.flight = Some(flight.clone());
                    flight
                }
            }
        };

        let result = flight.clone().await;

        let mut slot = self.slot.lock().await;
        if let Some(current) = &slot.flight {
            if current.ptr_eq(&flight) {
                slot.flight = None;
            }
        }
        if let Ok(value) = &result {
            slot.value = Some((value.clone(), Instant::now()));
        }
        result
    }
}
