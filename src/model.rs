use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Radio service on the wire.
///
/// Upstream schedules name services loosely ("r1", "radio2", "NHK-FM", "r3");
/// the canonical set is fixed. `r3` is the legacy alias the broadcaster uses
/// for the FM service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceId {
    R1,
    R2,
    Fm,
}

impl ServiceId {
    /// Key of this service inside the area stream table.
    pub fn stream_key(&self) -> &'static str {
        match self {
            ServiceId::R1 => "r1",
            ServiceId::R2 => "r2",
            ServiceId::Fm => "fm",
        }
    }

    /// Map a raw upstream service label by case-insensitive substring.
    pub fn from_raw(raw: &str) -> Option<ServiceId> {
        let lower = raw.to_ascii_lowercase();
        if lower.contains("r1") {
            Some(ServiceId::R1)
        } else if lower.contains("r2") || lower.contains("rs") {
            Some(ServiceId::R2)
        } else if lower.contains("fm") || lower.contains("r3") {
            Some(ServiceId::Fm)
        } else {
            None
        }
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.stream_key())
    }
}

/// A broadcast event in canonical form, normalised from the upstream feed.
///
/// Instants are absolute UTC. `end > start` is enforced at the normaliser
/// and again at reservation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastEvent {
    pub broadcast_event_id: String,
    pub radio_series_id: Option<String>,
    pub radio_episode_id: Option<String>,
    pub service_id: ServiceId,
    pub area_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub genres: Vec<String>,
    pub duration_iso: Option<String>,
    pub location: Option<String>,
    pub event_url: Option<String>,
    pub episode_url: Option<String>,
    pub series_url: Option<String>,
}

impl BroadcastEvent {
    pub fn duration_seconds(&self) -> i64 {
        (self.end - self.start).num_seconds()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Pending,
    InProgress,
    Done,
    Failed,
    Canceled,
}

/// A user-created reservation.
///
/// Serialised with a `type` tag; unknown tags are rejected at the serde
/// boundary so the catalogue never carries shapes the scheduler cannot run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reservation {
    SingleEvent(SingleEventReservation),
    SeriesWatch(SeriesWatchReservation),
}

impl Reservation {
    pub fn id(&self) -> Uuid {
        match self {
            Reservation::SingleEvent(r) => r.id,
            Reservation::SeriesWatch(r) => r.id,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Reservation::SingleEvent(r) => r.created_at,
            Reservation::SeriesWatch(r) => r.created_at,
        }
    }

    pub fn status(&self) -> ReservationStatus {
        match self {
            Reservation::SingleEvent(r) => r.status,
            Reservation::SeriesWatch(r) => r.status,
        }
    }
}

/// One dated episode frozen at reservation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingleEventReservation {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub status: ReservationStatus,
    pub series_id: Option<i64>,
    pub series_code: Option<String>,
    pub event: BroadcastEvent,
    /// Set once the capture commits.
    pub recording_id: Option<Uuid>,
    /// Parent watch when this reservation was materialised by one.
    pub from_series_watch: Option<Uuid>,
}

/// A standing "record everything this series airs" rule.
///
/// A watch never records by itself; it emits [`SingleEventReservation`]
/// children and remembers their broadcast-event ids so each episode is
/// materialised exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesWatchReservation {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub status: ReservationStatus,
    pub series_id: Option<i64>,
    pub series_code: Option<String>,
    pub area_id: Option<String>,
    pub seen_broadcast_event_ids: BTreeSet<String>,
    pub series_title: Option<String>,
    pub series_url: Option<String>,
    pub series_schedule: Option<String>,
    pub series_thumbnail_url: Option<String>,
}

/// A committed capture. Only ever visible after its HLS tree has been
/// renamed into the recordings root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    pub id: Uuid,
    pub reservation_id: Uuid,
    pub event: BroadcastEvent,
    /// Directory of the HLS tree, relative to the data root.
    pub hls_dir: String,
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub duration_seconds: f64,
}

/// Row of the upstream series index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub id: i64,
    pub title: String,
    pub broadcasts: Vec<String>,
    pub url: String,
    pub thumbnail_url: Option<String>,
    pub schedule_text: Option<String>,
    pub area_name: Option<String>,
}

/// Seed metadata tags for a freshly committed recording.
pub fn metadata_tags(event: &BroadcastEvent) -> BTreeMap<String, String> {
    let mut tags = BTreeMap::new();
    tags.insert("title".to_string(), event.name.clone());
    if let Some(description) = &event.description {
        tags.insert("description".to_string(), description.clone());
    }
    if !event.genres.is_empty() {
        tags.insert("genres".to_string(), event.genres.join(", "));
    }
    if let Some(location) = &event.location {
        tags.insert("location".to_string(), location.clone());
    }
    tags
}
