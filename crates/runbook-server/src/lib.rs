pub mod auth;
pub mod channel;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod routes;
pub mod state;

use std::sync::Arc;

use axum::routing::get;
use axum::{middleware, Router};
use runbook_core::config::Config;
use runbook_core::registry::Registry;
use runbook_core::store::RunStore;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::Operators;
use crate::channel::EventChannel;
use crate::coordinator::RunCoordinator;
use crate::executor::Executor;

/// Build the axum Router with all API routes and middleware.
/// Used by `serve()` and available for integration testing.
pub fn build_router(app_state: state::AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/whoami", get(routes::servers::whoami))
        .route("/api/servers", get(routes::servers::list_servers))
        .route(
            "/api/runs",
            get(routes::runs::list_runs).post(routes::runs::submit_run),
        )
        .route("/api/runs/{run_id}", get(routes::runs::get_run))
        .route("/api/runs/{run_id}/events", get(routes::runs::run_events))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&app_state.operators),
            auth::auth_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state)
}

/// Wire registry, event channel, coordinator and (optionally) the run store
/// from `config`.
///
/// When `state_dir` is set, runs left non-terminal by a previous process are
/// recovered as errors before anything new is accepted. The channel reaper
/// is only spawned inside a Tokio runtime.
pub fn build_state(config: &Config, executor: Arc<dyn Executor>) -> anyhow::Result<state::AppState> {
    let registry = Arc::new(Registry::from_config(config));
    let channel = EventChannel::new(config.replay_capacity);
    let mut coordinator =
        RunCoordinator::new(registry, executor, Arc::clone(&channel), config.watchdog());

    if let Some(dir) = &config.state_dir {
        let store = RunStore::open(&dir.join("runs.redb"))?;
        let recovered = store.startup_recovery()?;
        if recovered > 0 {
            tracing::warn!(recovered, "recovered interrupted runs as errors");
        }
        coordinator = coordinator.with_store(Arc::new(store));
    }

    if tokio::runtime::Handle::try_current().is_ok() {
        channel.spawn_reaper(config.reap_interval(), config.observer_ttl());
    }

    let operators = Operators::from_config(&config.operators);
    if operators.is_empty() {
        tracing::warn!("no operators configured; every request will be rejected");
    }
    Ok(state::AppState::new(operators, Arc::new(coordinator)))
}

/// Start the runbook server on `config.listen`.
pub async fn serve(config: Config, executor: Arc<dyn Executor>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    serve_on(config, listener, executor).await
}

/// Start the runbook server on a pre-bound listener.
///
/// Unlike `serve`, this accepts a `TcpListener` that was already bound so the
/// caller can read the actual port before starting (useful when the port is
/// 0 and the OS picks a free one).
pub async fn serve_on(
    config: Config,
    listener: tokio::net::TcpListener,
    executor: Arc<dyn Executor>,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    let app_state = build_state(&config, executor)?;
    let servers = app_state.registry.listing().len();
    let app = build_router(app_state);

    tracing::info!(%addr, servers, "runbook server listening on http://{addr}");

    axum::serve(listener, app).await?;
    Ok(())
}
