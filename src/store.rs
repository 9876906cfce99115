use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::model::{Recording, Reservation, ReservationStatus};

const CATALOGUE_FILE: &str = "catalogue.json";
const RECORDINGS_DIR: &str = "recordings";
const STAGING_DIR: &str = "staging";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(Uuid),
    #[error("already exists: {0}")]
    Conflict(Uuid),
    #[error("catalogue io: {0}")]
    Io(#[from] io::Error),
    #[error("catalogue encode: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogueFile {
    #[serde(default)]
    reservations: Vec<Reservation>,
    #[serde(default)]
    recordings: Vec<Recording>,
}

#[derive(Default)]
struct State {
    reservations: HashMap<Uuid, Reservation>,
    recordings: HashMap<Uuid, Recording>,
}

/// Durable catalogue of reservations and recordings.
///
/// All entities live in one JSON file replaced by copy-on-write: sibling
/// temp file, fsync, rename. Readers work against the in-memory index; a
/// write mutex serialises persists so the file on disk is always one
/// consistent snapshot.
pub struct Store {
    data_root: PathBuf,
    path: PathBuf,
    state: RwLock<State>,
    write_lock: Mutex<()>,
}

impl Store {
    pub async fn open(data_root: &Path) -> Result<Self, StoreError> {
        let data_root = data_root.to_path_buf();
        tokio::fs::create_dir_all(data_root.join(RECORDINGS_DIR)).await?;
        tokio::fs::create_dir_all(data_root.join(STAGING_DIR)).await?;

        let path = data_root.join(CATALOGUE_FILE);
        let mut state = State::default();
        match tokio::fs::read_to_string(&path).await {
            Ok(content) if !content.trim().is_empty() => {
                let parsed: CatalogueFile = serde_json::from_str(&content)?;
                for r in parsed.reservations {
                    state.reservations.insert(r.id(), r);
                }
                for rec in parsed.recordings {
                    state.recordings.insert(rec.id, rec);
                }
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let store = Self {
            data_root,
            path,
            state: RwLock::new(state),
            write_lock: Mutex::new(()),
        };
        store.recover().await?;
        Ok(store)
    }

    pub fn recordings_root(&self) -> PathBuf {
        self.data_root.join(RECORDINGS_DIR)
    }

    pub fn staging_root(&self) -> PathBuf {
        self.data_root.join(STAGING_DIR)
    }

    pub fn recording_dir(&self, id: Uuid) -> PathBuf {
        self.recordings_root().join(id.to_string())
    }

    /// Startup recovery: abandoned staging trees are removed, catalogue rows
    /// whose directory vanished are dropped (their source reservation goes to
    /// failed), directories without a row are deleted.
    async fn recover(&self) -> Result<(), StoreError> {
        let staging = self.staging_root();
        let mut leftovers = tokio::fs::read_dir(&staging).await?;
        while let Some(entry) = leftovers.next_entry().await? {
            warn!("removing abandoned staging tree {:?}", entry.path());
            let _ = tokio::fs::remove_dir_all(entry.path()).await;
        }

        let mut changed = false;
        {
            let mut st = self.state.write().await;
            let mut missing = Vec::new();
            for rec in st.recordings.values() {
                if !self.recording_dir(rec.id).is_dir() {
                    missing.push((rec.id, rec.reservation_id));
                }
            }
            for (rec_id, reservation_id) in missing {
                warn!("recording {rec_id} has no directory on disk, dropping");
                st.recordings.remove(&rec_id);
                if let Some(Reservation::SingleEvent(r)) =
                    st.reservations.get_mut(&reservation_id)
                {
                    r.status = ReservationStatus::Failed;
                    r.recording_id = None;
                }
                changed = true;
            }

            let known: HashSet<Uuid> = st.recordings.keys().copied().collect();
            let mut dirs = tokio::fs::read_dir(self.recordings_root()).await?;
            while let Some(entry) = dirs.next_entry().await? {
                let name = entry.file_name();
                let orphan = match name.to_str().and_then(|s| Uuid::parse_str(s).ok()) {
                    Some(id) => !known.contains(&id),
                    None => true,
                };
                if orphan {
                    warn!("removing orphaned recording directory {:?}", entry.path());
                    let _ = tokio::fs::remove_dir_all(entry.path()).await;
                }
            }
        }
        if changed {
            self.persist().await?;
        }
        info!("catalogue opened at {:?}", self.path);
        Ok(())
    }

    pub async fn list_reservations(&self) -> Vec<Reservation> {
        let st = self.state.read().await;
        let mut rows: Vec<Reservation> = st.reservations.values().cloned().collect();
        rows.sort_by(|a, b| a.created_at().cmp(&b.created_at()).then(a.id().cmp(&b.id())));
        rows
    }

    pub async fn get_reservation(&self, id: Uuid) -> Option<Reservation> {
        self.state.read().await.reservations.get(&id).cloned()
    }

    pub async fn insert_reservation(&self, reservation: Reservation) -> Result<(), StoreError> {
        {
            let mut st = self.state.write().await;
            let id = reservation.id();
            if st.reservations.contains_key(&id) {
                return Err(StoreError::Conflict(id));
            }
            st.reservations.insert(id, reservation);
        }
        self.persist().await
    }

    pub async fn delete_reservation(&self, id: Uuid) -> Result<Reservation, StoreError> {
        let removed = {
            let mut st = self.state.write().await;
            st.reservations.remove(&id).ok_or(StoreError::NotFound(id))?
        };
        self.persist().await?;
        Ok(removed)
    }

    pub async fn set_reservation_status(
        &self,
        id: Uuid,
        status: ReservationStatus,
    ) -> Result<(), StoreError> {
        {
            let mut st = self.state.write().await;
            match st.reservations.get_mut(&id) {
                Some(Reservation::SingleEvent(r)) => r.status = status,
                Some(Reservation::SeriesWatch(r)) => r.status = status,
                None => return Err(StoreError::NotFound(id)),
            }
        }
        self.persist().await
    }

    /// Record freshly discovered episodes of a watch: extend the seen set
    /// and insert the child reservations in one persisted transaction.
    pub async fn materialize_children(
        &self,
        watch_id: Uuid,
        children: Vec<Reservation>,
    ) -> Result<(), StoreError> {
        {
            let mut st = self.state.write().await;
            let seen: Vec<String> = children
                .iter()
                .filter_map(|c| match c {
                    Reservation::SingleEvent(r) => Some(r.event.broadcast_event_id.clone()),
                    Reservation::SeriesWatch(_) => None,
                })
                .collect();
            match st.reservations.get_mut(&watch_id) {
                Some(Reservation::SeriesWatch(watch)) => {
                    watch.seen_broadcast_event_ids.extend(seen);
                }
                _ => return Err(StoreError::NotFound(watch_id)),
            }
            for child in children {
                let id = child.id();
                if st.reservations.contains_key(&id) {
                    return Err(StoreError::Conflict(id));
                }
                st.reservations.insert(id, child);
            }
        }
        self.persist().await
    }

    pub async fn list_recordings(&self) -> Vec<Recording> {
        let st = self.state.read().await;
        let mut rows: Vec<Recording> = st.recordings.values().cloned().collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        rows
    }

    pub async fn get_recording(&self, id: Uuid) -> Option<Recording> {
        self.state.read().await.recordings.get(&id).cloned()
    }

    /// Insert a recording row as-is. Capture commits go through
    /// [`Store::commit_recording`]; this exists for rows whose directory is
    /// already in place (restores, imports).
    pub async fn insert_recording(&self, recording: Recording) -> Result<(), StoreError> {
        {
            let mut st = self.state.write().await;
            if st.recordings.contains_key(&recording.id) {
                return Err(StoreError::Conflict(recording.id));
            }
            st.recordings.insert(recording.id, recording);
        }
        self.persist().await
    }

    pub async fn update_recording_metadata(
        &self,
        id: Uuid,
        patch: BTreeMap<String, String>,
    ) -> Result<Recording, StoreError> {
        let updated = {
            let mut st = self.state.write().await;
            let rec = st.recordings.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            rec.metadata.extend(patch);
            rec.clone()
        };
        self.persist().await?;
        Ok(updated)
    }

    /// Delete the recording row and its directory. The directory is owned
    /// exclusively by the row, so removal failures only leave an orphan that
    /// the next startup sweep reclaims.
    pub async fn delete_recording(&self, id: Uuid) -> Result<(), StoreError> {
        {
            let mut st = self.state.write().await;
            if st.recordings.remove(&id).is_none() {
                return Err(StoreError::NotFound(id));
            }
        }
        self.persist().await?;
        let _ = tokio::fs::remove_dir_all(self.recording_dir(id)).await;
        Ok(())
    }

    /// Atomically publish a finished capture: move the staging tree under
    /// the recording id and insert the row in the same logical transaction.
    /// On failure nothing observable changes; the staging tree is restored
    /// for the caller to discard.
    pub async fn commit_recording(
        &self,
        recording: Recording,
        staging_dir: &Path,
    ) -> Result<Recording, StoreError> {
        let final_dir = self.recording_dir(recording.id);
        tokio::fs::rename(staging_dir, &final_dir).await?;

        let inserted = {
            let mut st = self.state.write().await;
            if st.recordings.contains_key(&recording.id) {
                let _ = tokio::fs::rename(&final_dir, staging_dir).await;
                return Err(StoreError::Conflict(recording.id));
            }
            // A reservation deleted mid-capture must never publish: the
            // delete and this check are both serialised by the state lock.
            match st.reservations.get_mut(&recording.reservation_id) {
                Some(Reservation::SingleEvent(r)) => {
                    r.status = ReservationStatus::Done;
                    r.recording_id = Some(recording.id);
                }
                _ => {
                    let _ = tokio::fs::rename(&final_dir, staging_dir).await;
                    return Err(StoreError::NotFound(recording.reservation_id));
                }
            }
            st.recordings.insert(recording.id, recording.clone());
            recording
        };

        if let Err(e) = self.persist().await {
            let mut st = self.state.write().await;
            st.recordings.remove(&inserted.id);
            if let Some(Reservation::SingleEvent(r)) =
                st.reservations.get_mut(&inserted.reservation_id)
            {
                r.status = ReservationStatus::InProgress;
                r.recording_id = None;
            }
            drop(st);
            let _ = tokio::fs::rename(&final_dir, staging_dir).await;
            return Err(e);
        }
        Ok(inserted)
    }

    async fn persist(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let file = {
            let st = self.state.read().await;
            let mut reservations: Vec<Reservation> = st.reservations.values().cloned().collect();
            reservations
                .sort_by(|a, b| a.created_at().cmp(&b.created_at()).then(a.id().cmp(&b.id())));
            let mut recordings: Vec<Recording> = st.recordings.values().cloned().collect();
            recordings.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            CatalogueFile {
                reservations,
                recordings,
            }
        };

        let json = serde_json::to_string_pretty(&file)?;
        let tmp = tmp_path_for(&self.path);
        let mut f = tokio::fs::File::create(&tmp).await?;
        f.write_all(json.as_bytes()).await?;
        f.sync_all().await?;
        drop(f);
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.to_path_buf();
    if let Some(ext) = path.extension() {
        let mut ext = ext.to_os_string();
        ext.push(".tmp");
        tmp.set_extension(ext);
    } else {
        tmp.set_extension("tmp");
    }
    tmp
}
