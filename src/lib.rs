use std::future::Future;
use std::sync::Arc;

use axum::extract::Request;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info_span};

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::route::AppState;
use crate::scheduler::Scheduler;
use crate::store::Store;
use crate::upstream::UpstreamClient;

pub mod capture;
pub mod clock;
pub mod config;
pub mod convert;
pub mod error;
pub mod log;
pub mod model;
pub mod result;
pub mod route;
pub mod scheduler;
pub mod signal;
pub mod store;
pub mod upstream;

pub async fn serve<F>(cfg: Config, listener: TcpListener, signal: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let store = Arc::new(
        Store::open(&cfg.recorder.data_root)
            .await
            .expect("open catalogue"),
    );
    let upstream =
        Arc::new(UpstreamClient::new(cfg.upstream.clone()).expect("build upstream client"));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let scheduler = Scheduler::new(
        store.clone(),
        upstream.clone(),
        clock,
        cfg.recorder.clone(),
    );

    let app_state = AppState {
        config: cfg.clone(),
        store,
        upstream,
        scheduler: scheduler.clone(),
    };
    let app = Router::new()
        .merge(route::series::route())
        .merge(route::reservation::route())
        .merge(route::recording::route())
        .with_state(app_state)
        .layer(if cfg.http.cors {
            CorsLayer::permissive()
        } else {
            CorsLayer::new()
        })
        .layer(axum::middleware::from_fn(log::print_request_response))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
                let span = info_span!(
                    "http_request",
                    uri = ?request.uri(),
                    method = ?request.method(),
                    span_id = tracing::field::Empty,
                );
                span.record(
                    "span_id",
                    span.id().unwrap_or(tracing::Id::from_u64(42)).into_u64(),
                );
                span
            }),
        );

    tokio::spawn(scheduler.clone().run());

    axum::serve(listener, app)
        .with_graceful_shutdown(signal)
        .await
        .unwrap_or_else(|e| error!("Application error: {e}"));
    scheduler.shutdown().await;
}
