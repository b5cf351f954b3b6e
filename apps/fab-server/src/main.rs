use std::sync::Arc;

use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod activator;
mod api_admin;
mod api_dut;
mod app_state;
mod deploy;
mod env;
mod error;
mod migrations;
mod payloads;
mod router;
mod services;
mod slots;
mod sync_worker;
#[cfg(test)]
mod test_support;

pub(crate) use app_state::AppState;

fn init_logging() {
    let filter = EnvFilter::try_from_env("FAB_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() {
    init_logging();

    if std::env::args().nth(1).as_deref() == Some("sync-worker") {
        if let Err(err) = sync_worker::run().await {
            error!(target: "fab::sync", error = %err, "sync worker exited");
            std::process::exit(1);
        }
        return;
    }

    let environment = Arc::new(env::Environment::from_env());
    // Migrations run to completion before any socket binds; a failure leaves
    // nothing listening and the environment untouched past the failed step.
    if let Err(err) = migrations::run_pending(&environment) {
        error!(target: "fab::migrate", error = %err, "migration failed; aborting startup");
        std::process::exit(2);
    }

    let state = AppState::new(Arc::clone(&environment), slots::DownloadSlots::from_env());
    if let Err(err) = deploy::reconcile_on_startup(&state).await {
        error!(target: "fab::deploy", error = %err, "startup reconciliation failed");
        std::process::exit(2);
    }

    let app = router::build_router()
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let addr = environment.http_addr();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("bind server socket");
    info!(target: "fab::http", %addr, "listening");

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    if let Err(err) = server.await {
        error!(target: "fab::http", error = %err, "http server exited with error");
    }

    info!(target: "fab::service", "stopping supervised services");
    state.registry().shutdown().await;
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("shutdown signal received");
}
