//! HTTP servers with graceful shutdown
//!
//! Two listeners: the admin API (control plane) and the ingress redirect
//! listener (data plane). Both drain on SIGINT/SIGTERM.

use std::net::SocketAddr;
use std::time::Duration;

use axum::{middleware::from_fn, Router};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tower_http::{
    catch_panic::CatchPanicLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::{config::Config, error::Result, middleware};

/// Run both planes until shutdown
pub async fn serve(config: &Config, admin: Router, ingress: Router) -> Result<()> {
    let admin_app = admin
        .layer(from_fn(middleware::cors))
        .layer(TimeoutLayer::new(Duration::from_secs(config.admin.timeout_secs)))
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(CatchPanicLayer::new());

    let ingress_app = ingress.layer(TraceLayer::new_for_http());

    let admin_listener =
        TcpListener::bind((config.admin.host.as_str(), config.admin.port)).await?;
    let ingress_listener =
        TcpListener::bind((config.ingress.host.as_str(), config.ingress.port)).await?;

    tracing::info!(
        "admin API on {}, redirect listener on {}",
        admin_listener.local_addr()?,
        ingress_listener.local_addr()?
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received, draining");
        let _ = shutdown_tx.send(true);
    });

    let mut admin_shutdown = shutdown_rx.clone();
    let admin_server = axum::serve(admin_listener, admin_app).with_graceful_shutdown(async move {
        let _ = admin_shutdown.changed().await;
    });

    let mut ingress_shutdown = shutdown_rx;
    let ingress_server = axum::serve(
        ingress_listener,
        ingress_app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = ingress_shutdown.changed().await;
    });

    tokio::try_join!(admin_server, ingress_server)?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
