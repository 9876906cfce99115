use std::collections::HashMap;

use chrono::{TimeDelta, Utc};
use serde_json::{json, Value};
use tempfile::TempDir;

mod common;
use common::{fetch_rows, spawn_app, spawn_stub_upstream, wait_rows, write_fake_muxer};

fn event_json(id: &str, start_offset_secs: i64, end_offset_secs: i64, service: &str) -> Value {
    let now = Utc::now();
    json!({
        "broadcast_event_id": id,
        "service_id": service,
        "area_id": "tokyo",
        "start": (now + TimeDelta::seconds(start_offset_secs)).to_rfc3339(),
        "end": (now + TimeDelta::seconds(end_offset_secs)).to_rfc3339(),
        "name": format!("programme {id}"),
    })
}

/// Upstream-shaped schedule payload for the stub feed.
fn upstream_payload(ids_and_offsets: &[(&str, i64, i64)]) -> Value {
    let now = Utc::now();
    let rows: Vec<Value> = ids_and_offsets
        .iter()
        .map(|(id, start, end)| {
            json!({
                "name": format!("programme {id}"),
                "startDate": (now + TimeDelta::seconds(*start)).to_rfc3339(),
                "endDate": (now + TimeDelta::seconds(*end)).to_rfc3339(),
                "identifierGroup": {
                    "broadcastEventId": id,
                    "serviceId": "r2",
                    "areaId": "tokyo"
                }
            })
        })
        .collect();
    json!({ "result": rows })
}

#[tokio::test]
async fn series_index_and_events_endpoints() {
    let series = json!({"series": [
        {"id": 11, "title": "Morning Classics", "url": "https://example.org/rs/AAA111/",
         "radio_broadcast": "R2, FM", "schedule": "weekdays 6am", "area": "tokyo"},
        {"id": 11, "title": "duplicate row", "url": "https://example.org/rs/AAA111/",
         "radio_broadcast": "R2"},
        {"id": 12, "title": "broken row without url", "radio_broadcast": "R1"}
    ]});
    let events = HashMap::from([(
        "AAA111".to_string(),
        upstream_payload(&[("ev-1", 600, 1200)]),
    )]);
    let upstream = spawn_stub_upstream(events, series).await;

    let tools = TempDir::new().unwrap();
    let muxer = write_fake_muxer(tools.path(), false);
    let app = spawn_app(upstream, &muxer, |_| {}).await;

    let series: Value = app
        .client
        .get(app.url("/series"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let rows = series.as_array().unwrap();
    assert_eq!(rows.len(), 1, "broken and duplicate rows are dropped");
    assert_eq!(rows[0]["id"], 11);
    assert_eq!(rows[0]["broadcasts"], json!(["R2", "FM"]));

    let resolved: Value = app
        .client
        .get(app.url("/series/resolve"))
        .query(&[("series_url", "https://example.org/radio/rs/AAA111/")])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resolved["seriesCode"], "AAA111");

    let events: Value = app
        .client
        .get(app.url("/events"))
        .query(&[("series_code", "AAA111")])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(events.as_array().unwrap().len(), 1);
    assert_eq!(events[0]["broadcast_event_id"], "ev-1");
    assert_eq!(events[0]["service_id"], "r2");

    let missing = app
        .client
        .get(app.url("/events"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 400);
}

#[tokio::test]
async fn single_event_validation_and_conflict() {
    let upstream = spawn_stub_upstream(HashMap::new(), json!({"series": []})).await;
    let tools = TempDir::new().unwrap();
    let muxer = write_fake_muxer(tools.path(), false);
    let app = spawn_app(upstream, &muxer, |_| {}).await;

    // Zero-length window.
    let res = app
        .client
        .post(app.url("/reservation/single-event"))
        .json(&json!({"series_id": 1, "event": event_json("E0", 60, 60, "r1")}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 400);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"]["kind"], "bad_request");
    assert_eq!(body["error"]["field"], "event.end");

    // Start too far in the past.
    let res = app
        .client
        .post(app.url("/reservation/single-event"))
        .json(&json!({"series_id": 1, "event": event_json("E0", -120, 600, "r1")}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 400);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"]["field"], "event.start");

    // First reservation is accepted, the identical payload conflicts.
    let res = app
        .client
        .post(app.url("/reservation/single-event"))
        .json(&json!({"series_id": 1, "event": event_json("E1", 3600, 5400, "r1")}))
        .send()
        .await
        .unwrap();
    assert!(res.status().is_success());

    let res = app
        .client
        .post(app.url("/reservation/single-event"))
        .json(&json!({"series_id": 1, "event": event_json("E1", 3600, 5400, "r1")}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 409);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"]["kind"], "conflict");

    // Unknown reservation type is rejected at the serde boundary.
    let reservations: Value = app
        .client
        .get(app.url("/reservations"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(reservations.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn series_watch_materialises_children_exactly_once() {
    let events = HashMap::from([(
        "Z9L1V2M24L".to_string(),
        upstream_payload(&[("E1", 3600, 5400), ("E2", 7200, 9000)]),
    )]);
    let upstream = spawn_stub_upstream(events, json!({"series": []})).await;
    let tools = TempDir::new().unwrap();
    let muxer = write_fake_muxer(tools.path(), false);
    let app = spawn_app(upstream, &muxer, |_| {}).await;

    let created: Value = app
        .client
        .post(app.url("/reservation/watch-series"))
        .json(&json!({"series_id": 5, "series_code": "Z9L1V2M24L"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let watch_id = created["id"].as_str().unwrap().to_string();

    let rows = wait_rows(&app.client, &app.url("/reservations"), 3, 10).await;
    let watch = rows
        .iter()
        .find(|r| r["type"] == "series_watch")
        .expect("watch row");
    assert_eq!(
        watch["seen_broadcast_event_ids"],
        json!(["E1", "E2"]),
        "seen set covers both materialised events"
    );
    for child in rows.iter().filter(|r| r["type"] == "single_event") {
        assert_eq!(child["from_series_watch"].as_str().unwrap(), watch_id);
        assert_eq!(child["status"], "pending");
    }

    // Further ticks with the same upstream answer add nothing.
    tokio::time::sleep(std::time::Duration::from_millis(2500)).await;
    let rows = fetch_rows(&app.client, &app.url("/reservations")).await;
    assert_eq!(rows.len(), 3);
}

#[tokio::test]
async fn series_watch_tolerates_upstream_404() {
    let upstream = spawn_stub_upstream(HashMap::new(), json!({"series": []})).await;
    let tools = TempDir::new().unwrap();
    let muxer = write_fake_muxer(tools.path(), false);
    let app = spawn_app(upstream, &muxer, |_| {}).await;

    app.client
        .post(app.url("/reservation/watch-series"))
        .json(&json!({"series_code": "GONE404"}))
        .send()
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(2500)).await;
    let rows = fetch_rows(&app.client, &app.url("/reservations")).await;
    assert_eq!(rows.len(), 1, "404 yields no children");
    assert_eq!(rows[0]["status"], "pending", "watch is never failed by 404");
}
