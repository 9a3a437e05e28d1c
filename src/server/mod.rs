// src/server/mod.rs

//! Server bootstrap: builds `ClusterDaemonState`, starts the HTTP API and background
//! tasks, and runs until a shutdown signal arrives.

pub mod api;
pub mod initialization;
pub mod spawner;

use anyhow::Result;
use axum::extract::State;
use axum::routing::get;
use axum::Router;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::core::state::ClusterDaemonState;

/// Runs the daemon to completion: builds state, spawns the HTTP listener and
/// background tasks, and blocks until a termination signal drains local instances and
/// tears the process down.
pub async fn run(config: Config) -> Result<()> {
    let state = initialization::setup(config).await?;
    let (shutdown_tx, _) = broadcast::channel(1);

    let router = build_router(state.clone());

    let handles = spawner::spawn_all(state.clone(), shutdown_tx.subscribe());

    let listener = tokio::net::TcpListener::bind((state.config.host.as_str(), state.config.port)).await?;
    info!(addr = %listener.local_addr()?, "clusterd listening");

    let drain_state = state.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            wait_for_termination().await;
            info!("termination signal received, draining local instances");
            let instances = match drain_state
                .instance_runtime
                .list_on_member(&drain_state.local_member_name)
                .await
            {
                Ok(instances) => instances,
                Err(e) => {
                    tracing::error!(error = %e, "failed to list local instances for shutdown drain");
                    Vec::new()
                }
            };
            drain_state
                .shutdown_orchestrator
                .run(instances, HashMap::new())
                .await;
        })
        .await?;

    drop(shutdown_tx);
    for handle in handles {
        let _ = handle.await;
    }

    Ok(())
}

/// Waits for either Ctrl-C or SIGTERM, whichever arrives first.
async fn wait_for_termination() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Assembles the HTTP router over a pre-built daemon state. Exposed so integration
/// tests can drive the API without a bound TCP listener.
pub fn build_router(state: Arc<ClusterDaemonState>) -> Router {
    Router::new()
        .route(
            "/cluster/members",
            get(api::members::list_members).post(api::members::request_join_token),
        )
        .route(
            "/cluster/members/{name}",
            get(api::members::get_member)
                .put(api::members::update_member)
                .patch(api::members::update_member)
                .post(api::members::rename_member)
                .delete(api::members::delete_member),
        )
        .route(
            "/cluster/members/{name}/state",
            get(api::members::get_member_state).post(api::members::post_member_state),
        )
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Updates the gauges that reflect current state before encoding the registry.
async fn metrics_handler(State(state): State<Arc<ClusterDaemonState>>) -> String {
    let members = state.registry.snapshot().await;
    crate::core::metrics::MEMBERS_TOTAL.set(members.len() as f64);
    let evacuated = members
        .iter()
        .filter(|m| m.state == crate::core::member::MemberState::Evacuated)
        .count();
    crate::core::metrics::EVACUATED_MEMBERS.set(evacuated as f64);
    crate::core::metrics::IS_LEADER.set(if state.is_leader().await { 1.0 } else { 0.0 });

    crate::core::metrics::gather_metrics()
}
