use std::env;
use std::time::Instant;

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

pub fn set(env_filter: String) {
    let _ = env::var("RUST_LOG").is_err_and(|_| {
        env::set_var("RUST_LOG", env_filter);
        true
    });
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .compact()
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(true)
        .init();
}

/// Request/latency log line per response. Bodies are not buffered; download
/// responses stream entire recordings.
pub async fn print_request_response(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let uri = req.uri().clone();

    let res = next.run(req).await;
    let duration = start.elapsed();

    if res.status().is_success() || res.status().is_redirection() {
        if duration.as_millis() > 500 {
            warn!(
                "[{} {}] [{}] {}ms",
                method,
                uri,
                res.status().as_u16(),
                duration.as_millis()
            );
        } else {
            info!(
                "[{} {}] [{}] {}ms",
                method,
                uri,
                res.status().as_u16(),
                duration.as_millis()
            );
        }
    } else {
        error!(
            "[{} {}] [{}] {}ms",
            method,
            uri,
            res.status().as_u16(),
            duration.as_millis()
        );
    }
    res
}
