use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{sleep_or_cancel, Clock, SleepOutcome};
use crate::config;
use crate::model::{metadata_tags, BroadcastEvent, Recording, ReservationStatus};
use crate::store::{Store, StoreError};
use crate::upstream::UpstreamClient;

pub mod muxer;
pub mod playlist;

use muxer::{stop_gracefully, MuxerCommand, PLAYLIST_NAME, SEGMENTS_DIR};
use playlist::{ensure_end_marker, MediaPlaylist};

/// Further attempts after the first spawn failure.
const SPAWN_RETRIES: u32 = 2;
const SPAWN_RETRY_DELAY: Duration = Duration::from_secs(2);

/// A capture below this floor never commits, however short the show was.
const MIN_COMMIT_SECONDS: f64 = 60.0;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("muxer spawn failed: {0}")]
    MuxerSpawnFailed(String),
    #[error("muxer produced no usable output: {0}")]
    MuxerCrashed(String),
    #[error("captured data below commit threshold: {0}")]
    InsufficientData(String),
    #[error("no stream source: {0}")]
    SourceUnavailable(String),
    #[error("capture canceled")]
    Canceled,
    #[error("storage: {0}")]
    Storage(StoreError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<StoreError> for CaptureError {
    fn from(err: StoreError) -> Self {
        match err {
            // The reservation vanished under us: the user deleted it.
            StoreError::NotFound(_) => CaptureError::Canceled,
            other => CaptureError::Storage(other),
        }
    }
}

/// One supervised capture attempt for one reservation.
///
/// Arms at `start - lead_in`, drives the segment muxer until
/// `end + tail_out` (or cancellation), then either commits the staging tree
/// atomically or discards it. The scheduler guarantees at most one worker
/// per reservation id.
pub struct CaptureWorker {
    pub reservation_id: Uuid,
    pub event: BroadcastEvent,
    pub store: Arc<Store>,
    pub upstream: Arc<UpstreamClient>,
    pub clock: Arc<dyn Clock>,
    pub cfg: config::Recorder,
    pub cancel: CancellationToken,
}

impl CaptureWorker {
    pub async fn run(self) -> Result<Recording, CaptureError> {
        let arm_at = self.event.start - TimeDelta::seconds(self.cfg.lead_in_seconds as i64);
        let stop_at = self.event.end + TimeDelta::seconds(self.cfg.tail_out_seconds as i64);

        if sleep_or_cancel(self.clock.as_ref(), arm_at, &self.cancel).await
            == SleepOutcome::Cancelled
        {
            return Err(CaptureError::Canceled);
        }

        self.store
            .set_reservation_status(self.reservation_id, ReservationStatus::InProgress)
            .await?;

        let source = self
            .upstream
            .fetch_hls_source(self.event.service_id, &self.event.area_id)
            .await
            .map_err(|e| CaptureError::SourceUnavailable(e.to_string()))?;

        let capture_id = Uuid::new_v4();
        let staging = self.store.staging_root().join(capture_id.to_string());
        tokio::fs::create_dir_all(staging.join(SEGMENTS_DIR)).await?;
        info!(
            "capture armed: reservation={} event={} staging={:?}",
            self.reservation_id, self.event.broadcast_event_id, staging
        );

        let result = self.capture_into(&staging, &source, stop_at).await;
        if result.is_err() {
            let _ = tokio::fs::remove_dir_all(&staging).await;
        }
        result
    }

    async fn capture_into(
        &self,
        staging: &Path,
        source: &str,
        stop_at: DateTime<Utc>,
    ) -> Result<Recording, CaptureError> {
        let mut child = self.spawn_with_retry(source, staging, stop_at).await?;
        let grace = Duration::from_secs(self.cfg.stop_grace_seconds);

        tokio::select! {
            status = child.wait() => {
                // The muxer stopped on its own; the commit policy decides
                // whether what it left behind counts.
                debug!("muxer exited early: {:?}", status?);
            }
            _ = self.clock.sleep_until(stop_at) => {
                stop_gracefully(&mut child, grace).await?;
            }
            _ = self.cancel.cancelled() => {
                info!("capture canceled: reservation={}", self.reservation_id);
                let _ = stop_gracefully(&mut child, grace).await;
                return Err(CaptureError::Canceled);
            }
        }

        self.evaluate_and_commit(staging).await
    }

    async fn spawn_with_retry(
        &self,
        source: &str,
        staging: &Path,
        stop_at: DateTime<Utc>,
    ) -> Result<Child, CaptureError> {
        let command = MuxerCommand {
            program: self.cfg.muxer_program.clone(),
            loglevel: self.cfg.muxer_loglevel.clone(),
            segment_seconds: self.cfg.segment_seconds,
        };
        let mut attempt = 0;
        loop {
            match command.capture(source, staging).spawn() {
                Ok(child) => return Ok(child),
                Err(e) => {
                    attempt += 1;
                    if attempt > SPAWN_RETRIES || self.clock.now() >= stop_at {
                        return Err(CaptureError::MuxerSpawnFailed(e.to_string()));
                    }
                    warn!("muxer spawn failed (attempt {attempt}): {e}, retrying");
                    let retry_at = self.clock.now()
                        + TimeDelta::from_std(SPAWN_RETRY_DELAY).expect("short delay");
                    if sleep_or_cancel(self.clock.as_ref(), retry_at, &self.cancel).await
                        == SleepOutcome::Cancelled
                    {
                        return Err(CaptureError::Canceled);
                    }
                }
            }
        }
    }

    /// Commit policy: the playlist must parse with at least one segment, the
    /// captured duration must reach half the scheduled window (or the fixed
    /// floor, whichever is smaller), and the last segment must be non-empty.
    async fn evaluate_and_commit(&self, staging: &Path) -> Result<Recording, CaptureError> {
        let playlist_path = staging.join(PLAYLIST_NAME);
        let text = tokio::fs::read_to_string(&playlist_path)
            .await
            .map_err(|_| CaptureError::InsufficientData("playlist missing".to_string()))?;
        let parsed = MediaPlaylist::parse(&text)
            .map_err(|e| CaptureError::MuxerCrashed(e.to_string()))?;

        if parsed.segments.is_empty() {
            return Err(CaptureError::InsufficientData(
                "playlist has no segments".to_string(),
            ));
        }

        let scheduled = self.event.duration_seconds() as f64;
        let floor = (scheduled * 0.5).min(MIN_COMMIT_SECONDS);
        let captured = parsed.total_duration();
        if captured < floor {
            return Err(CaptureError::InsufficientData(format!(
                "captured {captured:.1}s of {scheduled:.0}s scheduled (floor {floor:.1}s)"
            )));
        }

        let last = parsed.last_segment().expect("nonempty checked above");
        let last_path = staging.join(&last.uri);
        match tokio::fs::metadata(&last_path).await {
            Ok(meta) if meta.len() > 0 => {}
            _ => {
                return Err(CaptureError::InsufficientData(format!(
                    "last segment {} missing or empty",
                    last.uri
                )));
            }
        }

        ensure_end_marker(&playlist_path).await?;

        let recording_id = Uuid::new_v4();
        let recording = Recording {
            id: recording_id,
            reservation_id: self.reservation_id,
            event: self.event.clone(),
            hls_dir: format!("recordings/{recording_id}"),
            metadata: metadata_tags(&self.event),
            created_at: self.clock.now(),
            size_bytes: dir_size(staging).await?,
            duration_seconds: captured,
        };
        let committed = self.store.commit_recording(recording, staging).await?;
        info!(
            "capture committed: reservation={} recording={} ({:.1}s, {} bytes)",
            self.reservation_id, committed.id, committed.duration_seconds, committed.size_bytes
        );
        Ok(committed)
    }
}

async fn dir_size(root: &Path) -> io::Result<u64> {
    let mut total = 0u64;
    let mut stack: Vec<PathBuf> = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                stack.push(entry.path());
            } else {
                total += meta.len();
            }
        }
    }
    Ok(total)
}
