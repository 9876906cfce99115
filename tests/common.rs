#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use axum::extract::Path as AxumPath;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::Value;
use tempfile::TempDir;
use tokio::net::TcpListener;

use aircheck::config::Config;

pub struct TestApp {
    pub base: String,
    pub client: reqwest::Client,
    pub data_root: PathBuf,
    _tmp: TempDir,
}

impl TestApp {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub fn staging_entries(&self) -> Vec<PathBuf> {
        std::fs::read_dir(self.data_root.join("staging"))
            .map(|entries| entries.filter_map(|e| e.ok()).map(|e| e.path()).collect())
            .unwrap_or_default()
    }
}

/// Serve a canned upstream: kana-paged series index, per-key schedule
/// payloads (missing keys answer 404) and the stream configuration document.
pub async fn spawn_stub_upstream(
    events_by_key: HashMap<String, Value>,
    series: Value,
) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let events_route = move |AxumPath(file): AxumPath<String>| {
        let events_by_key = events_by_key.clone();
        async move {
            let key = file.trim_end_matches(".json");
            match events_by_key.get(key) {
                Some(payload) => Json(payload.clone()).into_response(),
                None => (StatusCode::NOT_FOUND, "no such series").into_response(),
            }
        }
    };
    let series_route = move || {
        let series = series.clone();
        async move { Json(series) }
    };
    let config_route = move || async move { stream_config_xml(addr) };

    let app = Router::new()
        .route("/series", get(series_route))
        .route("/rs/{file}", get(events_route))
        .route("/config_web.xml", get(config_route));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn stream_config_xml(addr: SocketAddr) -> String {
    format!(
        "<config><stream_url><data>\
         <areajp>tokyo</areajp><area>tokyo</area><areakey>130</areakey>\
         <r1hls>http://{addr}/live/r1.m3u8</r1hls>\
         <r2hls>http://{addr}/live/r2.m3u8</r2hls>\
         <fmhls>http://{addr}/live/fm.m3u8</fmhls>\
         </data></stream_url></config>"
    )
}

/// Boot the full appliance against the stub upstream on an ephemeral port.
pub async fn spawn_app<F>(
    upstream: SocketAddr,
    muxer_program: &Path,
    tweak: F,
) -> TestApp
where
    F: FnOnce(&mut Config),
{
    let tmp = TempDir::new().unwrap();
    let mut cfg = Config::default();
    cfg.recorder.data_root = tmp.path().to_path_buf();
    cfg.recorder.muxer_program = muxer_program.to_string_lossy().into_owned();
    cfg.recorder.reconcile_interval_seconds = 1;
    cfg.recorder.lead_in_seconds = 0;
    cfg.recorder.tail_out_seconds = 0;
    cfg.recorder.stop_grace_seconds = 2;
    cfg.upstream.series_url = format!("http://{upstream}/series?kana={{kana}}");
    cfg.upstream.events_url = format!("http://{upstream}/rs");
    cfg.upstream.stream_config_url = format!("http://{upstream}/config_web.xml");
    cfg.upstream.timeout_seconds = 5;
    tweak(&mut cfg);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let data_root = tmp.path().to_path_buf();
    tokio::spawn(aircheck::serve(cfg, listener, std::future::pending()));

    TestApp {
        base: format!("http://{addr}"),
        client: reqwest::Client::new(),
        data_root,
        _tmp: tmp,
    }
}

/// A shell stand-in for the segment muxer and converter. In capture mode
/// (`-f hls` present) it writes a small HLS tree into the working directory
/// and blocks until the quit convention fires; in convert mode it writes the
/// output container named by the last argument. `crash` mode exits at once
/// with no output.
pub fn write_fake_muxer(dir: &Path, crash: bool) -> PathBuf {
    let body = if crash {
        "#!/bin/sh\nexit 1\n".to_string()
    } else {
        r##"#!/bin/sh
case "$*" in
  *"-f hls"*)
    mkdir -p segments
    head -c 2048 /dev/zero > segments/00000.ts
    {
      echo "#EXTM3U"
      echo "#EXT-X-VERSION:3"
      echo "#EXT-X-TARGETDURATION:6"
      echo "#EXTINF:120.000,"
      echo "segments/00000.ts"
      echo "#EXT-X-ENDLIST"
    } > recording.m3u8
    read -r _quit
    exit 0
    ;;
  *)
    for out in "$@"; do :; done
    printf 'container-bytes' > "$out"
    exit 0
    ;;
esac
"##
        .to_string()
    };
    let path = dir.join(if crash { "muxer-crash.sh" } else { "muxer.sh" });
    std::fs::write(&path, body).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}

/// Fetch a JSON-array endpoint.
pub async fn fetch_rows(client: &reqwest::Client, url: &str) -> Vec<Value> {
    client
        .get(url)
        .send()
        .await
        .unwrap()
        .json::<Value>()
        .await
        .unwrap()
        .as_array()
        .unwrap()
        .clone()
}

/// Poll a JSON-array endpoint until it carries `want` rows.
pub async fn wait_rows(
    client: &reqwest::Client,
    url: &str,
    want: usize,
    seconds: u64,
) -> Vec<Value> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(seconds);
    loop {
        let rows = fetch_rows(client, url).await;
        if rows.len() == want {
            return rows;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {want} rows at {url}, have {}", rows.len());
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

/// Poll a JSON-array endpoint until its first row reaches `status`.
pub async fn wait_first_status(client: &reqwest::Client, url: &str, status: &str, seconds: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(seconds);
    loop {
        let rows = fetch_rows(client, url).await;
        if rows.first().map(|r| r["status"] == status).unwrap_or(false) {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for status {status} at {url}: {rows:?}");
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

/// Poll until the staging root is empty again.
pub async fn wait_staging_empty(app: &TestApp, seconds: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(seconds);
    loop {
        if app.staging_entries().is_empty() {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for staging to drain: {:?}", app.staging_entries());
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
