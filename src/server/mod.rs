//! HTTP surface of the router
//!
//! Routes:
//!
//! - `POST /v1/run` - synchronous run, replies with the result envelope
//! - `POST /v1/run/stream` - streamed run, replies with server-sent events
//! - `GET /health` - liveness
//! - `GET /health/ready` - readiness from the latest preflight snapshot
//! - `GET /metrics` - metrics snapshot
//! - `POST /v1/entities/{id}/archive` and `/restore` - archival pass-through
//! - `GET /` - endpoint listing

pub mod handlers;

use crate::collaborators::ArchivalService;
use crate::dispatch::Dispatcher;
use crate::preflight::ReadinessState;
use handlers::ArchiveAction;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use warp::Filter;

/// Largest accepted request body
pub const MAX_BODY_BYTES: u64 = 1024 * 1024;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub readiness: Arc<ReadinessState>,
    pub archival: Option<Arc<dyn ArchivalService>>,
}

impl AppState {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            readiness: dispatcher.readiness(),
            dispatcher,
            archival: None,
        }
    }

    pub fn with_archival(mut self, archival: Arc<dyn ArchivalService>) -> Self {
        self.archival = Some(archival);
        self
    }
}

fn with_state(state: AppState) -> impl Filter<Extract = (AppState,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

fn json_body() -> impl Filter<Extract = (bytes::Bytes,), Error = warp::Rejection> + Clone {
    warp::body::content_length_limit(MAX_BODY_BYTES).and(warp::body::bytes())
}

/// All routes, with rejections rendered as JSON
pub fn routes(
    state: AppState,
) -> impl Filter<Extract = (impl warp::Reply,), Error = Infallible> + Clone {
    let run = warp::path!("v1" / "run")
        .and(warp::post())
        .and(with_state(state.clone()))
        .and(json_body())
        .and_then(handlers::run);

    let run_stream = warp::path!("v1" / "run" / "stream")
        .and(warp::post())
        .and(with_state(state.clone()))
        .and(json_body())
        .and_then(handlers::run_stream);

    let health = warp::path!("health")
        .and(warp::get())
        .and_then(handlers::health);

    let ready = warp::path!("health" / "ready")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(handlers::ready);

    let metrics = warp::path!("metrics")
        .and(warp::get())
        .and_then(handlers::metrics_snapshot);

    let archive = warp::path!("v1" / "entities" / String / "archive")
        .and(warp::post())
        .map(|id: String| (id, ArchiveAction::Archive))
        .untuple_one()
        .and(with_state(state.clone()))
        .and(json_body())
        .and_then(handlers::archive);

    let restore = warp::path!("v1" / "entities" / String / "restore")
        .and(warp::post())
        .map(|id: String| (id, ArchiveAction::Restore))
        .untuple_one()
        .and(with_state(state))
        .and(json_body())
        .and_then(handlers::archive);

    let index = warp::path::end().and(warp::get()).and_then(handlers::index);

    run.or(run_stream)
        .or(health)
        .or(ready)
        .or(metrics)
        .or(archive)
        .or(restore)
        .or(index)
        .recover(handlers::handle_rejection)
}

/// Serve until `shutdown` resolves
pub async fn serve(
    state: AppState,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), warp::Error> {
    let (bound, server) =
        warp::serve(routes(state)).try_bind_with_graceful_shutdown(addr, shutdown)?;

    info!(addr = %bound, "Router listening");
    server.await;
    info!("Router stopped");
    Ok(())
}
