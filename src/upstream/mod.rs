use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, Utc};
use futures::FutureExt;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::config;
use crate::model::{BroadcastEvent, Series, ServiceId};

mod cache;
pub mod normalise;

use cache::SharedCache;
use normalise::{broadcaster_tz, claims_results, extract_events, is_not_found_payload};

const SERIES_KANA_PAGES: &[&str] = &["a", "k", "s", "t", "n", "h", "m", "y", "r", "w"];

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(4);

/// Area key or slug (lowercased) → service stream key → live HLS URL.
type StreamTable = HashMap<String, HashMap<String, String>>;

#[derive(Debug, Clone, Error)]
pub enum UpstreamError {
    #[error("upstream unavailable: {0}")]
    Unavailable(String),
    #[error("upstream payload malformed: {0}")]
    Malformed(String),
}

/// Client for the broadcaster's schedule feed and stream configuration.
///
/// The series index and the area stream table are cached process-wide with
/// the same TTL; refreshes are lazy and coalesced through [`SharedCache`].
pub struct UpstreamClient {
    http: reqwest::Client,
    /// Redirect-free client, used to read `Location` when resolving series
    /// codes out of share URLs.
    probe: reqwest::Client,
    cfg: config::Upstream,
    series: SharedCache<Vec<Series>>,
    streams: SharedCache<StreamTable>,
}

impl UpstreamClient {
    pub fn new(cfg: config::Upstream) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(cfg.timeout_seconds);
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let probe = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        let ttl = Duration::from_secs(cfg.cache_ttl_seconds);
        Ok(Self {
            http,
            probe,
            cfg,
            series: SharedCache::new(ttl),
            streams: SharedCache::new(ttl),
        })
    }

    pub async fn list_series(&self) -> Result<Arc<Vec<Series>>, UpstreamError> {
        let http = self.http.clone();
        let cfg = self.cfg.clone();
        self.series
            .get_with(move || fetch_series(http, cfg).boxed())
            .await
    }

    /// Resolve a series code from a programme URL. Prefers the `/rs/{code}`
    /// path form; falls back to the redirect target, then to the last path
    /// segment.
    pub async fn resolve_series_code(&self, series_url: &str) -> Option<String> {
        if let Some(code) = code_in_path(series_url) {
            return Some(code);
        }
        match self.probe.head(series_url).send().await {
            Ok(res) => {
                if let Some(location) = res
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                {
                    let absolute = Url::parse(series_url)
                        .ok()
                        .and_then(|base| base.join(location).ok())
                        .map(|u| u.to_string())
                        .unwrap_or_else(|| location.to_string());
                    if let Some(code) = code_in_path(&absolute) {
                        return Some(code);
                    }
                }
            }
            Err(e) => debug!("series code probe failed for {series_url}: {e}"),
        }
        last_path_segment(series_url)
    }

    /// Fetch upcoming broadcast events for a series key over the configured
    /// lookahead horizon. An HTTP 404 or a 404-shaped payload is an empty
    /// result, not an error.
    pub async fn fetch_events(&self, series_key: &str) -> Result<Vec<BroadcastEvent>, UpstreamError> {
        let to_time = Utc::now()
            .with_timezone(&broadcaster_tz())
            .checked_add_days(Days::new(self.cfg.lookahead_days as u64))
            .map(|t| t.format("%Y-%m-%dT%H:%M").to_string())
            .unwrap_or_default();
        let url = format!(
            "{}/{}.json?offset=0&size=10&to={}&status=scheduled",
            self.cfg.events_url, series_key, to_time
        );

        let (status, payload) = get_json(&self.http, &url).await?;
        if status == 404 || is_not_found_payload(&payload) {
            return Ok(Vec::new());
        }
        let events = extract_events(&payload);
        if events.is_empty() && claims_results(&payload) {
            return Err(UpstreamError::Malformed(format!(
                "schedule rows for '{series_key}' carry no recognisable events"
            )));
        }
        Ok(events)
    }

    /// Resolve the live HLS playlist URL for a service in an area.
    pub async fn fetch_hls_source(
        &self,
        service: ServiceId,
        area_id: &str,
    ) -> Result<String, UpstreamError> {
        let http = self.http.clone();
        let cfg = self.cfg.clone();
        let table = self
            .streams
            .get_with(move || fetch_stream_table(http, cfg).boxed())
            .await?;

        let area_key = area_id.trim().to_ascii_lowercase();
        let streams = table.get(&area_key).ok_or_else(|| {
            UpstreamError::Malformed(format!("area '{area_id}' not in stream table"))
        })?;
        streams.get(service.stream_key()).cloned().ok_or_else(|| {
            UpstreamError::Malformed(format!("no {service} stream for area '{area_id}'"))
        })
    }
}

async fn fetch_series(
    http: reqwest::Client,
    cfg: config::Upstream,
) -> Result<Arc<Vec<Series>>, UpstreamError> {
    let mut out = Vec::new();
    let mut seen_ids = HashSet::new();
    for kana in SERIES_KANA_PAGES {
        let url = cfg.series_url.replace("{kana}", kana);
        let (status, payload) = get_json(&http, &url).await?;
        if status == 404 {
            continue;
        }
        let Some(rows) = payload.get("series").and_then(Value::as_array) else {
            debug!("series page '{kana}' carries no rows");
            continue;
        };
        for item in rows {
            let Some(id) = series_row_id(item) else {
                continue;
            };
            let title = non_empty(item.get("title"));
            let url = non_empty(item.get("url"));
            let broadcasts = non_empty(item.get("radio_broadcast"));
            let (Some(title), Some(url), Some(broadcasts)) = (title, url, broadcasts) else {
                continue;
            };
            if !seen_ids.insert(id) {
                continue;
            }
            out.push(Series {
                id,
                title,
                broadcasts: broadcasts
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
                url,
                thumbnail_url: non_empty(item.get("thumbnail_url")),
                schedule_text: non_empty(item.get("schedule")),
                area_name: non_empty(item.get("area")),
            });
        }
    }
    debug!("series index refreshed: {} rows", out.len());
    Ok(Arc::new(out))
}

async fn fetch_stream_table(
    http: reqwest::Client,
    cfg: config::Upstream,
) -> Result<Arc<StreamTable>, UpstreamError> {
    let text = get_text(&http, &cfg.stream_config_url).await?;
    let table = parse_stream_config(&text);
    if table.is_empty() {
        return Err(UpstreamError::Malformed(
            "stream configuration document yields no areas".to_string(),
        ));
    }
    Ok(Arc::new(table))
}

/// GET a JSON document with bounded exponential backoff on transport errors
/// and 5xx. 404 returns with a null payload; other 4xx surface immediately.
async fn get_json(http: &reqwest::Client, url: &str) -> Result<(u16, Value), UpstreamError> {
    let mut delay = RETRY_BASE_DELAY;
    for attempt in 1..=RETRY_ATTEMPTS {
        match http.get(url).send().await {
            Ok(res) => {
                let status = res.status();
                if status.is_server_error() && attempt < RETRY_ATTEMPTS {
                    warn!("GET {url}: http {status}, retrying");
                } else if status.as_u16() == 404 {
                    return Ok((404, Value::Null));
                } else if !status.is_success() {
                    return Err(UpstreamError::Unavailable(format!("{url}: http {status}")));
                } else {
                    let payload = res.json::<Value>().await.map_err(|e| {
                        UpstreamError::Malformed(format!("{url}: invalid json: {e}"))
                    })?;
                    return Ok((status.as_u16(), payload));
                }
            }
            Err(e) => {
                if attempt == RETRY_ATTEMPTS {
                    return Err(UpstreamError::Unavailable(format!("{url}: {e}")));
                }
                warn!("GET {url}: {e}, retrying");
            }
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(RETRY_MAX_DELAY);
    }
    unreachable!("retry loop always returns")
}

async fn get_text(http: &reqwest::Client, url: &str) -> Result<String, UpstreamError> {
    let mut delay = RETRY_BASE_DELAY;
    for attempt in 1..=RETRY_ATTEMPTS {
        match http.get(url).send().await {
            Ok(res) => {
                let status = res.status();
                if status.is_server_error() && attempt < RETRY_ATTEMPTS {
                    warn!("GET {url}: http {status}, retrying");
                } else if !status.is_success() {
                    return Err(UpstreamError::Unavailable(format!("{url}: http {status}")));
                } else {
                    return res
                        .text()
                        .await
                        .map_err(|e| UpstreamError::Unavailable(format!("{url}: {e}")));
                }
            }
            Err(e) => {
                if attempt == RETRY_ATTEMPTS {
                    return Err(UpstreamError::Unavailable(format!("{url}: {e}")));
                }
                warn!("GET {url}: {e}, retrying");
            }
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(RETRY_MAX_DELAY);
    }
    unreachable!("retry loop always returns")
}

/// The area-to-HLS table lives in an upstream configuration document whose
/// schema is not stable; it is scanned opaquely for `<data>` blocks carrying
/// area names and per-service playlist URLs.
fn parse_stream_config(text: &str) -> StreamTable {
    let mut out = StreamTable::new();
    for block in blocks_of(text, "data") {
        let area_slug = tag_text(block, "area")
            .map(|s| s.to_ascii_lowercase())
            .unwrap_or_default();
        let area_key = tag_text(block, "areakey")
            .map(|s| s.to_ascii_lowercase())
            .unwrap_or_default();

        let mut streams = HashMap::new();
        for (service, tag) in [("r1", "r1hls"), ("r2", "r2hls"), ("fm", "fmhls")] {
            if let Some(url) = tag_text(block, tag) {
                streams.insert(service.to_string(), url);
            }
        }
        if streams.is_empty() || (area_key.is_empty() && area_slug.is_empty()) {
            continue;
        }
        if !area_key.is_empty() {
            out.insert(area_key, streams.clone());
        }
        if !area_slug.is_empty() {
            out.entry(area_slug).or_insert(streams);
        }
    }
    out
}

fn blocks_of<'a>(text: &'a str, tag: &str) -> Vec<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find(&open) {
        let body = &rest[start + open.len()..];
        let Some(end) = body.find(&close) else {
            break;
        };
        out.push(&body[..end]);
        rest = &body[end + close.len()..];
    }
    out
}

fn tag_text(block: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = block.find(&open)? + open.len();
    let end = block[start..].find(&close)? + start;
    let text = block[start..end].trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Series code out of a `/rs/{code}` URL path.
fn code_in_path(raw: &str) -> Option<String> {
    let url = Url::parse(raw).ok()?;
    let segments: Vec<&str> = url.path_segments()?.filter(|s| !s.is_empty()).collect();
    let pos = segments.iter().position(|s| s.eq_ignore_ascii_case("rs"))?;
    let code: String = segments
        .get(pos + 1)?
        .chars()
        .take_while(char::is_ascii_alphanumeric)
        .collect();
    (!code.is_empty()).then(|| code.to_ascii_uppercase())
}

fn last_path_segment(raw: &str) -> Option<String> {
    let url = Url::parse(raw).ok()?;
    url.path_segments()?
        .filter(|s| !s.is_empty())
        .next_back()
        .map(str::to_string)
}

fn non_empty(value: Option<&Value>) -> Option<String> {
    let s = value?.as_str()?.trim();
    (!s.is_empty()).then(|| s.to_string())
}

fn series_row_id(item: &Value) -> Option<i64> {
    let id = item.get("id")?;
    id.as_i64().or_else(|| id.as_str()?.trim().parse().ok())
}
