use std::{env, fs, net::SocketAddr, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub http: Http,
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub recorder: Recorder,
    #[serde(default)]
    pub upstream: Upstream,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Http {
    #[serde(default = "default_http_listen")]
    pub listen: SocketAddr,
    #[serde(default)]
    pub cors: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Log {
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recorder {
    /// Root for the catalogue, committed recordings and staging captures.
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,

    /// Seconds between reconciliation passes over the reservation set.
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_seconds: u64,

    /// How far ahead single-event reservations are armed.
    #[serde(default = "default_scheduling_horizon")]
    pub scheduling_horizon_hours: u64,

    /// Capture starts this many seconds before the scheduled start.
    #[serde(default = "default_lead_in")]
    pub lead_in_seconds: u64,

    /// Capture keeps running this many seconds past the scheduled end.
    #[serde(default = "default_tail_out")]
    pub tail_out_seconds: u64,

    /// Segment muxer executable, also used for the download converter.
    #[serde(default = "default_muxer_program")]
    pub muxer_program: String,

    #[serde(default = "default_muxer_loglevel")]
    pub muxer_loglevel: String,

    /// Target duration of one HLS segment.
    #[serde(default = "default_segment_seconds")]
    pub segment_seconds: u32,

    /// Grace period between asking the muxer to quit and killing it.
    #[serde(default = "default_stop_grace")]
    pub stop_grace_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Upstream {
    /// Series index endpoint; `{kana}` is substituted per page.
    #[serde(default = "default_series_url")]
    pub series_url: String,

    /// Base of the broadcast-event endpoint; `/{series}.json` is appended.
    #[serde(default = "default_events_url")]
    pub events_url: String,

    /// Configuration document holding the area-to-HLS table.
    #[serde(default = "default_stream_config_url")]
    pub stream_config_url: String,

    /// Horizon of the schedule query for series watches.
    #[serde(default = "default_lookahead_days")]
    pub lookahead_days: i64,

    /// TTL of the series list and the area stream table.
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_seconds: u64,

    /// Total deadline for one outbound request.
    #[serde(default = "default_upstream_timeout")]
    pub timeout_seconds: u64,
}

fn default_http_listen() -> SocketAddr {
    SocketAddr::from_str(&format!(
        "0.0.0.0:{}",
        env::var("PORT").unwrap_or(String::from("7797"))
    ))
    .expect("invalid listen address")
}

fn default_log_level() -> String {
    env::var("LOG_LEVEL").unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            "debug".to_string()
        } else {
            "info".to_string()
        }
    })
}

fn default_data_root() -> PathBuf {
    PathBuf::from("./data")
}

fn default_reconcile_interval() -> u64 {
    30
}

fn default_scheduling_horizon() -> u64 {
    25
}

fn default_lead_in() -> u64 {
    5
}

fn default_tail_out() -> u64 {
    30
}

fn default_muxer_program() -> String {
    "ffmpeg".to_string()
}

fn default_muxer_loglevel() -> String {
    "error".to_string()
}

fn default_segment_seconds() -> u32 {
    6
}

fn default_stop_grace() -> u64 {
    10
}

fn default_series_url() -> String {
    "https://www.nhk.or.jp/radio-api/app/v1/web/series?kana={kana}".to_string()
}

fn default_events_url() -> String {
    "https://api.nhk.jp/r7/f/broadcastevent/rs".to_string()
}

fn default_stream_config_url() -> String {
    "https://www.nhk.or.jp/radio/config/config_web.xml".to_string()
}

fn default_lookahead_days() -> i64 {
    7
}

fn default_cache_ttl() -> u64 {
    6 * 60 * 60
}

fn default_upstream_timeout() -> u64 {
    60
}

impl Default for Http {
    fn default() -> Self {
        Self {
            listen: default_http_listen(),
            cors: Default::default(),
        }
    }
}

impl Default for Log {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Recorder {
    fn default() -> Self {
        Self {
            data_root: default_data_root(),
            reconcile_interval_seconds: default_reconcile_interval(),
            scheduling_horizon_hours: default_scheduling_horizon(),
            lead_in_seconds: default_lead_in(),
            tail_out_seconds: default_tail_out(),
            muxer_program: default_muxer_program(),
            muxer_loglevel: default_muxer_loglevel(),
            segment_seconds: default_segment_seconds(),
            stop_grace_seconds: default_stop_grace(),
        }
    }
}

impl Default for Upstream {
    fn default() -> Self {
        Self {
            series_url: default_series_url(),
            events_url: default_events_url(),
            stream_config_url: default_stream_config_url(),
            lookahead_days: default_lookahead_days(),
            cache_ttl_seconds: default_cache_ttl(),
            timeout_seconds: default_upstream_timeout(),
        }
    }
}

impl Config {
    pub fn parse(path: Option<String>) -> Self {
        let result = fs::read_to_string(path.unwrap_or(String::from("aircheck.toml")))
            .or(fs::read_to_string("/etc/aircheck/aircheck.toml"))
            .unwrap_or("".to_string());
        let cfg: Self = toml::from_str(result.as_str()).expect("config parse error");
        cfg
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.recorder.muxer_program.trim().is_empty() {
            anyhow::bail!("recorder.muxer_program cannot be empty");
        }
        if self.recorder.segment_seconds == 0 {
            anyhow::bail!("recorder.segment_seconds must be positive");
        }
        if self.recorder.reconcile_interval_seconds == 0 {
            anyhow::bail!("recorder.reconcile_interval_seconds must be positive");
        }
        if self.upstream.lookahead_days <= 0 {
            anyhow::bail!("upstream.lookahead_days must be positive");
        }
        Ok(())
    }
}
