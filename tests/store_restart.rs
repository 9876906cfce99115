use std::collections::{BTreeMap, BTreeSet};

use chrono::{TimeDelta, Utc};
use tempfile::TempDir;
use uuid::Uuid;

use aircheck::model::{
    BroadcastEvent, Recording, Reservation, ReservationStatus, SeriesWatchReservation,
    ServiceId, SingleEventReservation,
};
use aircheck::store::Store;

fn sample_event() -> BroadcastEvent {
    let start = Utc::now() + TimeDelta::hours(1);
    BroadcastEvent {
        broadcast_event_id: "be-restart".to_string(),
        radio_series_id: Some("rs-1".to_string()),
        radio_episode_id: None,
        service_id: ServiceId::Fm,
        area_id: "tokyo".to_string(),
        start,
        end: start + TimeDelta::minutes(50),
        name: "restart survivor".to_string(),
        description: Some("round trip".to_string()),
        genres: vec!["music".to_string()],
        duration_iso: Some("PT50M".to_string()),
        location: None,
        event_url: None,
        episode_url: None,
        series_url: None,
    }
}

fn sample_single(event: BroadcastEvent) -> SingleEventReservation {
    SingleEventReservation {
        id: Uuid::new_v4(),
        created_at: Utc::now(),
        status: ReservationStatus::Pending,
        series_id: Some(3),
        series_code: Some("CODE3".to_string()),
        event,
        recording_id: None,
        from_series_watch: None,
    }
}

#[tokio::test]
async fn catalogue_round_trips_across_restart() {
    let dir = TempDir::new().unwrap();

    let single = sample_single(sample_event());
    let single_id = single.id;
    let watch = SeriesWatchReservation {
        id: Uuid::new_v4(),
        created_at: Utc::now(),
        status: ReservationStatus::Pending,
        series_id: Some(3),
        series_code: Some("CODE3".to_string()),
        area_id: Some("tokyo".to_string()),
        seen_broadcast_event_ids: BTreeSet::from(["be-restart".to_string()]),
        series_title: Some("restart show".to_string()),
        series_url: None,
        series_schedule: None,
        series_thumbnail_url: None,
    };

    {
        let store = Store::open(dir.path()).await.unwrap();
        store
            .insert_reservation(Reservation::SingleEvent(single.clone()))
            .await
            .unwrap();
        store
            .insert_reservation(Reservation::SeriesWatch(watch.clone()))
            .await
            .unwrap();

        // Commit a capture the way a worker would: staging tree in, row in.
        let staging = store.staging_root().join("cap-1");
        tokio::fs::create_dir_all(staging.join("segments"))
            .await
            .unwrap();
        tokio::fs::write(
            staging.join("recording.m3u8"),
            "#EXTM3U\n#EXTINF:60.0,\nsegments/00000.ts\n#EXT-X-ENDLIST\n",
        )
        .await
        .unwrap();
        tokio::fs::write(staging.join("segments/00000.ts"), vec![0u8; 512])
            .await
            .unwrap();
        let recording_id = Uuid::new_v4();
        store
            .commit_recording(
                Recording {
                    id: recording_id,
                    reservation_id: single_id,
                    event: sample_event(),
                    hls_dir: format!("recordings/{recording_id}"),
                    metadata: BTreeMap::from([(
                        "title".to_string(),
                        "restart survivor".to_string(),
                    )]),
                    created_at: Utc::now(),
                    size_bytes: 512,
                    duration_seconds: 60.0,
                },
                &staging,
            )
            .await
            .unwrap();

        let before = store.list_reservations().await;
        assert_eq!(before.len(), 2);
        assert_eq!(
            store.get_reservation(single_id).await.unwrap().status(),
            ReservationStatus::Done
        );
    }

    // Reopen: everything reads back identically.
    let store = Store::open(dir.path()).await.unwrap();
    let reservations = store.list_reservations().await;
    assert_eq!(reservations.len(), 2);
    let Reservation::SeriesWatch(reloaded_watch) = store
        .get_reservation(watch.id)
        .await
        .unwrap()
    else {
        panic!("watch came back as the wrong variant");
    };
    assert_eq!(reloaded_watch, watch);

    let recordings = store.list_recordings().await;
    assert_eq!(recordings.len(), 1);
    assert_eq!(recordings[0].reservation_id, single_id);
    assert!(store.recording_dir(recordings[0].id).join("recording.m3u8").is_file());
}

#[tokio::test]
async fn startup_recovery_reclaims_disk_and_rows() {
    let dir = TempDir::new().unwrap();

    let single = sample_single(sample_event());
    let single_id = single.id;
    let ghost_recording = Uuid::new_v4();
    {
        let store = Store::open(dir.path()).await.unwrap();
        store
            .insert_reservation(Reservation::SingleEvent(single))
            .await
            .unwrap();
        // A row without a directory: the capture vanished mid-flight.
        store
            .insert_recording(Recording {
                id: ghost_recording,
                reservation_id: single_id,
                event: sample_event(),
                hls_dir: format!("recordings/{ghost_recording}"),
                metadata: BTreeMap::new(),
                created_at: Utc::now(),
                size_bytes: 0,
                duration_seconds: 0.0,
            })
            .await
            .unwrap();
    }

    // An orphaned directory and an abandoned staging tree on disk.
    let orphan = dir.path().join("recordings").join(Uuid::new_v4().to_string());
    std::fs::create_dir_all(&orphan).unwrap();
    std::fs::write(orphan.join("recording.m3u8"), "#EXTM3U\n").unwrap();
    let stale = dir.path().join("staging").join("leftover");
    std::fs::create_dir_all(&stale).unwrap();

    let store = Store::open(dir.path()).await.unwrap();

    assert!(store.list_recordings().await.is_empty(), "ghost row dropped");
    assert_eq!(
        store.get_reservation(single_id).await.unwrap().status(),
        ReservationStatus::Failed,
        "source reservation of the ghost row is failed"
    );
    assert!(!orphan.exists(), "orphan directory deleted");
    assert!(!stale.exists(), "staging cleared");
}
