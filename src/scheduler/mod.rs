use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capture::{CaptureError, CaptureWorker};
use crate::clock::Clock;
use crate::config;
use crate::model::{
    Reservation, ReservationStatus, SeriesWatchReservation, SingleEventReservation,
};
use crate::store::{Store, StoreError};
use crate::upstream::UpstreamClient;

/// A plan started after its scheduled start must still have this much of the
/// broadcast left, or the reservation fails instead of arming.
const MIN_LATE_WINDOW_SECONDS: i64 = 60;

struct PlanHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owner of the live capture plans.
///
/// One background task reconciles the persisted reservation set against the
/// upstream schedule and the plan map, both on a fixed tick and whenever an
/// API mutation signals the wake channel. The plan map guarantees at most
/// one capture worker per reservation id; a full tick runs under the plan
/// lock, so reconciliation is re-entrancy safe.
pub struct Scheduler {
    store: Arc<Store>,
    upstream: Arc<UpstreamClient>,
    clock: Arc<dyn Clock>,
    cfg: config::Recorder,
    plans: Mutex<HashMap<Uuid, PlanHandle>>,
    wake: Notify,
    stopping: CancellationToken,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        upstream: Arc<UpstreamClient>,
        clock: Arc<dyn Clock>,
        cfg: config::Recorder,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            upstream,
            clock,
            cfg,
            plans: Mutex::new(HashMap::new()),
            wake: Notify::new(),
            stopping: CancellationToken::new(),
        })
    }

    /// Nudge the reconciliation loop after a mutation.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Cancel the live capture for a reservation, if any.
    pub async fn cancel(&self, reservation_id: Uuid) {
        let plans = self.plans.lock().await;
        if let Some(plan) = plans.get(&reservation_id) {
            info!("cancelling capture plan for reservation {reservation_id}");
            plan.cancel.cancel();
        }
    }

    pub async fn run(self: Arc<Self>) {
        let mut tick = tokio::time::interval(Duration::from_secs(
            self.cfg.reconcile_interval_seconds,
        ));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = self.wake.notified() => {}
                _ = self.stopping.cancelled() => break,
            }
            if let Err(e) = self.reconcile().await {
                warn!("reconciliation tick aborted: {e}");
            }
        }
        debug!("scheduler loop stopped");
    }

    /// One reconciliation pass. Upstream failures skip the affected watch
    /// and the next tick retries; store failures abort the whole tick.
    pub async fn reconcile(&self) -> Result<(), StoreError> {
        let mut plans = self.plans.lock().await;
        plans.retain(|_, plan| !plan.handle.is_finished());

        for reservation in self.store.list_reservations().await {
            if let Reservation::SeriesWatch(watch) = reservation {
                if watch.status == ReservationStatus::Pending {
                    self.expand_watch(&watch).await?;
                }
            }
        }

        // Fresh snapshot: watch expansion may have materialised children.
        let snapshot = self.store.list_reservations().await;
        let now = self.clock.now();
        let horizon = now + TimeDelta::hours(self.cfg.scheduling_horizon_hours as i64);
        let tail_out = TimeDelta::seconds(self.cfg.tail_out_seconds as i64);

        for reservation in &snapshot {
            let Reservation::SingleEvent(single) = reservation else {
                continue;
            };
            if single.status != ReservationStatus::Pending || plans.contains_key(&single.id) {
                continue;
            }
            if single.event.start > horizon {
                continue;
            }

            let late = single.event.start < now;
            let remaining = (single.event.end - now).num_seconds();
            if single.event.end + tail_out <= now
                || (late && remaining < MIN_LATE_WINDOW_SECONDS)
            {
                warn!(
                    "reservation {} window has passed ({}s left), marking failed",
                    single.id, remaining
                );
                self.store
                    .set_reservation_status(single.id, ReservationStatus::Failed)
                    .await?;
                continue;
            }
            self.spawn_worker(&mut plans, single.clone());
        }

        // Plans whose reservation vanished get cancelled; the finished
        // handle is reaped on a later tick.
        let live: HashSet<Uuid> = snapshot.iter().map(Reservation::id).collect();
        for (id, plan) in plans.iter() {
            if !live.contains(id) {
                debug!("reaping plan for deleted reservation {id}");
                plan.cancel.cancel();
            }
        }
        Ok(())
    }

    /// Materialise unseen upcoming events of one watch as child
    /// reservations, extending the seen set in the same store transaction.
    async fn expand_watch(&self, watch: &SeriesWatchReservation) -> Result<(), StoreError> {
        let key = watch
            .series_code
            .clone()
            .or_else(|| watch.series_id.map(|id| id.to_string()));
        let Some(key) = key else {
            return Ok(());
        };

        let events = match self.upstream.fetch_events(&key).await {
            Ok(events) => events,
            Err(e) => {
                warn!("series watch {} skipped this tick: {e}", watch.id);
                return Ok(());
            }
        };

        let now = self.clock.now();
        let mut children = Vec::new();
        let mut materialised: HashSet<String> = HashSet::new();
        for event in events {
            if event.broadcast_event_id.is_empty() {
                continue;
            }
            if watch
                .seen_broadcast_event_ids
                .contains(&event.broadcast_event_id)
                || materialised.contains(&event.broadcast_event_id)
            {
                continue;
            }
            if let Some(area) = &watch.area_id {
                if !event.area_id.eq_ignore_ascii_case(area) {
                    continue;
                }
            }
            if event.end <= now {
                continue;
            }
            materialised.insert(event.broadcast_event_id.clone());
            children.push(Reservation::SingleEvent(SingleEventReservation {
                id: Uuid::new_v4(),
                created_at: now,
                status: ReservationStatus::Pending,
                series_id: watch.series_id,
                series_code: watch.series_code.clone(),
                event,
                recording_id: None,
                from_series_watch: Some(watch.id),
            }));
        }
        if children.is_empty() {
            return Ok(());
        }
        info!(
            "series watch {} materialised {} new reservation(s)",
            watch.id,
            children.len()
        );
        self.store.materialize_children(watch.id, children).await
    }

    fn spawn_worker(&self, plans: &mut HashMap<Uuid, PlanHandle>, single: SingleEventReservation) {
        let cancel = self.stopping.child_token();
        let worker = CaptureWorker {
            reservation_id: single.id,
            event: single.event.clone(),
            store: self.store.clone(),
            upstream: self.upstream.clone(),
            clock: self.clock.clone(),
            cfg: self.cfg.clone(),
            cancel: cancel.clone(),
        };
        info!(
            "arming capture plan: reservation={} start={} end={}",
            single.id, single.event.start, single.event.end
        );

        let store = self.store.clone();
        let id = single.id;
        let handle = tokio::spawn(async move {
            match worker.run().await {
                Ok(recording) => {
                    info!("reservation {id} done, recording {}", recording.id);
                }
                Err(CaptureError::Canceled) => {
                    debug!("capture for reservation {id} canceled");
                }
                Err(e) => {
                    warn!("capture for reservation {id} failed: {e}");
                    if let Err(store_err) = store
                        .set_reservation_status(id, ReservationStatus::Failed)
                        .await
                    {
                        warn!("could not mark reservation {id} failed: {store_err}");
                    }
                }
            }
        });
        plans.insert(id, PlanHandle { cancel, handle });
    }

    /// Cancel all live captures and wait out the grace period; stragglers
    /// are aborted. Partial captures are discarded by their workers.
    pub async fn shutdown(&self) {
        self.stopping.cancel();
        let drained: Vec<(Uuid, PlanHandle)> = {
            let mut plans = self.plans.lock().await;
            plans.drain().collect()
        };
        let grace = Duration::from_secs(self.cfg.stop_grace_seconds + 5);
        for (id, plan) in drained {
            plan.cancel.cancel();
            let mut handle = plan.handle;
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                warn!("capture worker {id} ignored shutdown, aborting");
                handle.abort();
            }
        }
    }
}
