use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::model::{BroadcastEvent, ServiceId};

// Candidate field names per canonical field, tried in order. The upstream
// schedule payload is heterogeneous; any object carrying both a start-like
// and an end-like timestamp is treated as an event.
const START_KEYS: &[&str] = &["start_time", "startTime", "startDateTime", "startDate", "start"];
const END_KEYS: &[&str] = &["end_time", "endTime", "endDateTime", "endDate", "end"];
const TITLE_KEYS: &[&str] = &["title", "event_title", "program_title", "name"];
const SERVICE_KEYS: &[&str] = &[
    "service",
    "serviceId",
    "broadcastServiceId",
    "onair_service",
    "channel",
];
const AREA_KEYS: &[&str] = &["area", "areaId", "areaKey", "areakey", "region", "regionCode"];
const ID_KEYS: &[&str] = &[
    "broadcastEventId",
    "event_id",
    "id",
    "be_id",
    "item_id",
    "content_id",
];

/// The broadcaster does not observe DST, so a fixed UTC+09:00 offset stands
/// in for its IANA zone.
pub fn broadcaster_tz() -> FixedOffset {
    FixedOffset::east_opt(9 * 3600).unwrap()
}

/// Parse one loosely formatted timestamp: RFC 3339 (with or without
/// fractional seconds, `Z` or explicit offset), bare ISO date-times and the
/// compact `YYYYMMDDHHMMSS` form in broadcaster-local time, or numeric epoch
/// seconds.
pub fn parse_instant(value: &Value) -> Option<DateTime<Utc>> {
    if let Some(secs) = value.as_i64() {
        return Utc.timestamp_opt(secs, 0).single();
    }
    if let Some(secs) = value.as_f64() {
        return Utc.timestamp_opt(secs as i64, 0).single();
    }

    let s = value.as_str()?.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y%m%d%H%M%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return broadcaster_tz()
                .from_local_datetime(&naive)
                .single()
                .map(|dt| dt.with_timezone(&Utc));
        }
    }
    None
}

/// Extract canonical events from an arbitrary schedule payload, sorted by
/// start instant. Events with a non-positive duration, or without a
/// resolvable service and area, are dropped.
pub fn extract_events(payload: &Value) -> Vec<BroadcastEvent> {
    let mut candidates = Vec::new();
    walk(payload, &mut candidates);

    let mut events = Vec::new();
    for obj in candidates {
        let Some(start) = field(obj, START_KEYS).and_then(parse_instant) else {
            continue;
        };
        let Some(end) = field(obj, END_KEYS).and_then(parse_instant) else {
            continue;
        };
        if end <= start {
            continue;
        }

        let Some(service_id) = field(obj, SERVICE_KEYS)
            .and_then(value_label)
            .and_then(|s| ServiceId::from_raw(&s))
        else {
            continue;
        };
        let Some(area_id) = field(obj, AREA_KEYS)
            .and_then(value_label)
            .map(|s| s.to_ascii_lowercase())
        else {
            continue;
        };

        let name = field(obj, TITLE_KEYS)
            .and_then(value_label)
            .unwrap_or_else(|| "Untitled".to_string());
        let broadcast_event_id = field(obj, ID_KEYS)
            .and_then(value_label)
            .unwrap_or_default();

        let about = obj.get("about").and_then(Value::as_object);
        let part_of_series = about
            .and_then(|a| a.get("partOfSeries"))
            .and_then(Value::as_object);

        events.push(BroadcastEvent {
            broadcast_event_id,
            radio_series_id: field(obj, &["radioSeriesId"]).and_then(value_label),
            radio_episode_id: field(obj, &["radioEpisodeId"]).and_then(value_label),
            service_id,
            area_id,
            start,
            end,
            name,
            description: obj.get("description").and_then(value_label),
            genres: genres_of(obj),
            duration_iso: obj.get("duration").and_then(value_label),
            location: obj
                .get("location")
                .and_then(|l| l.get("name"))
                .and_then(value_label),
            event_url: obj.get("url").and_then(value_label),
            episode_url: about.and_then(|a| a.get("canonical")).and_then(value_label),
            series_url: part_of_series
                .and_then(|p| p.get("canonical"))
                .and_then(value_label),
        });
    }
    events.sort_by(|a, b| a.start.cmp(&b.start));
    events
}

/// Does this payload carry a 404 inside its body? The upstream encodes
/// "unknown series" both as an HTTP 404 and as `{error: {statuscode: 404}}`.
pub fn is_not_found_payload(payload: &Value) -> bool {
    let Some(error) = payload.get("error") else {
        return false;
    };
    for key in ["statuscode", "code", "status"] {
        if error.get(key).and_then(Value::as_i64) == Some(404) {
            return true;
        }
    }
    false
}

/// Does this payload even claim to carry schedule rows? Used to tell an
/// empty result apart from a malformed one.
pub fn claims_results(payload: &Value) -> bool {
    payload
        .get("result")
        .and_then(Value::as_array)
        .map(|rows| !rows.is_empty())
        .unwrap_or(false)
}

fn walk<'v>(value: &'v Value, out: &mut Vec<&'v Map<String, Value>>) {
    match value {
        Value::Object(map) => {
            out.push(map);
            for v in map.values() {
                walk(v, out);
            }
        }
        Value::Array(items) => {
            for v in items {
                walk(v, out);
            }
        }
        _ => {}
    }
}

/// First value under any of `keys`, looked up on the object itself and then
/// inside its `identifierGroup` child where the canonical feed nests ids.
fn field<'v>(obj: &'v Map<String, Value>, keys: &[&str]) -> Option<&'v Value> {
    for key in keys {
        if let Some(v) = obj.get(*key) {
            return Some(v);
        }
    }
    let group = obj.get("identifierGroup").and_then(Value::as_object)?;
    for key in keys {
        if let Some(v) = group.get(*key) {
            return Some(v);
        }
    }
    None
}

/// A human-usable label out of a scalar or an `{id | name}` object.
fn value_label(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Object(map) => map
            .get("id")
            .or_else(|| map.get("name"))
            .and_then(value_label),
        _ => None,
    }
}

fn genres_of(obj: &Map<String, Value>) -> Vec<String> {
    let Some(genre) = field(obj, &["genre"]).and_then(Value::as_array) else {
        return Vec::new();
    };
    genre
        .iter()
        .filter_map(|g| {
            let g = g.as_object()?;
            g.get("name2")
                .or_else(|| g.get("name1"))
                .and_then(value_label)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_timestamp_variants() {
        let with_offset = parse_instant(&json!("2026-03-01T12:30:00+09:00")).unwrap();
        assert_eq!(parse_instant(&json!("20260301123000")).unwrap(), with_offset);
        assert_eq!(
            parse_instant(&json!("2026-03-01T12:30:00")).unwrap(),
            with_offset
        );
        assert_eq!(
            parse_instant(&json!("2026-03-01T03:30:00Z")).unwrap(),
            with_offset
        );
        assert!(parse_instant(&json!("2026-03-01T12:30:00.250Z")).is_some());
        assert_eq!(
            parse_instant(&json!(0)).unwrap(),
            Utc.timestamp_opt(0, 0).single().unwrap()
        );
        assert!(parse_instant(&json!("")).is_none());
        assert!(parse_instant(&json!("next tuesday")).is_none());
    }

    #[test]
    fn extracts_canonical_feed_shape() {
        let payload = json!({
            "result": [{
                "name": "Morning Classics",
                "description": "strings",
                "startDate": "2026-03-01T06:00:00+09:00",
                "endDate": "2026-03-01T06:55:00+09:00",
                "duration": "PT55M",
                "identifierGroup": {
                    "broadcastEventId": "be-123",
                    "serviceId": "r2",
                    "areaId": "Tokyo",
                    "radioSeriesId": "rs-9",
                    "radioEpisodeId": "re-4",
                    "genre": [{"name1": "music", "name2": "classical"}]
                },
                "about": {
                    "canonical": "https://example.org/ep/4",
                    "partOfSeries": {"canonical": "https://example.org/rs/9"}
                }
            }]
        });
        let events = extract_events(&payload);
        assert_eq!(events.len(), 1);
        let ev = &events[0];
        assert_eq!(ev.broadcast_event_id, "be-123");
        assert_eq!(ev.service_id, ServiceId::R2);
        assert_eq!(ev.area_id, "tokyo");
        assert_eq!(ev.name, "Morning Classics");
        assert_eq!(ev.genres, vec!["classical".to_string()]);
        assert_eq!(ev.episode_url.as_deref(), Some("https://example.org/ep/4"));
        assert_eq!(ev.series_url.as_deref(), Some("https://example.org/rs/9"));
        assert_eq!(ev.duration_seconds(), 55 * 60);
    }

    #[test]
    fn drops_non_positive_durations_and_unknown_services() {
        let payload = json!([
            {"start": "2026-03-01T06:00:00+09:00", "end": "2026-03-01T06:00:00+09:00",
             "service": "r1", "area": "tokyo"},
            {"start": "2026-03-01T06:00:00+09:00", "end": "2026-03-01T07:00:00+09:00",
             "service": "tv5", "area": "tokyo"},
            {"start": "2026-03-01T06:00:00+09:00", "end": "2026-03-01T07:00:00+09:00",
             "service": "NHK-FM", "area": "OSAKA", "title": "late show", "id": "e1"}
        ]);
        let events = extract_events(&payload);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].service_id, ServiceId::Fm);
        assert_eq!(events[0].area_id, "osaka");
        assert_eq!(events[0].broadcast_event_id, "e1");
    }

    #[test]
    fn canonical_event_reserialises_to_identity() {
        let payload = json!({
            "result": [{
                "name": "Night Jazz",
                "startDate": "2026-03-02T23:00:00+09:00",
                "endDate": "2026-03-03T00:00:00+09:00",
                "identifierGroup": {
                    "broadcastEventId": "be-7",
                    "serviceId": "r1",
                    "areaId": "tokyo"
                }
            }]
        });
        let events = extract_events(&payload);
        let first = serde_json::to_value(&events[0]).unwrap();
        let reparsed: BroadcastEvent = serde_json::from_value(first.clone()).unwrap();
        assert_eq!(serde_json::to_value(&reparsed).unwrap(), first);
        assert_eq!(reparsed, events[0]);
    }

    #[test]
    fn not_found_payload_shapes() {
        assert!(is_not_found_payload(&json!({"error": {"statuscode": 404}})));
        assert!(is_not_found_payload(&json!({"error": {"code": 404}})));
        assert!(!is_not_found_payload(&json!({"error": {"code": 500}})));
        assert!(!is_not_found_payload(&json!({"result": []})));
    }
}
