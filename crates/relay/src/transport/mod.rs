// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP + WebSocket transport for the relay.

pub mod auth;
pub mod frame;
pub mod http;
pub mod ws;
pub mod ws_events;

use std::sync::Arc;

use axum::middleware;
use axum::routing::{delete, get, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

use crate::error::FatalError;
use crate::orchestrator::Relay;

/// Build the axum `Router` with all relay routes.
pub fn build_router(relay: Arc<Relay>) -> Router {
    Router::new()
        // Health (no auth)
        .route("/api/v1/health", get(http::health))
        // Observability
        .route("/api/v1/metrics", get(http::metrics))
        .route("/api/v1/dlq", get(http::dlq))
        // Tenants
        .route("/api/v1/tenants", post(http::register_tenant).get(http::list_tenants))
        .route("/api/v1/tenants/{id}", delete(http::remove_tenant))
        .route("/api/v1/tenants/{id}/metrics", get(http::tenant_metrics))
        // Webhooks
        .route("/api/v1/webhooks", post(http::register_webhook).get(http::list_webhooks))
        .route("/api/v1/webhooks/{id}", delete(http::unregister_webhook))
        .route("/api/v1/webhooks/{id}/stats", get(http::webhook_stats))
        // Trigger rules
        .route("/api/v1/triggers", post(http::install_trigger).get(http::list_triggers))
        .route("/api/v1/triggers/{id}", delete(http::remove_trigger))
        // Bus publish and replay (host-database integration)
        .route("/api/v1/publish", post(http::publish))
        .route("/api/v1/replay/{topic}", get(http::replay))
        // WebSocket: relay clients and observers
        .route("/ws", get(ws::ws_handler))
        .route("/ws/events", get(ws_events::ws_events_handler))
        // Middleware
        .layer(middleware::from_fn_with_state(Arc::clone(&relay), auth::auth_layer))
        .layer(CorsLayer::permissive())
        .with_state(relay)
}

/// Bind and serve until the relay's shutdown token fires. Terminates TLS
/// when a cert/key pair is configured.
pub async fn serve(relay: Arc<Relay>) -> Result<(), FatalError> {
    let addr = format!("{}:{}", relay.config.host, relay.config.port);
    let listener = TcpListener::bind(&addr).await.map_err(FatalError::Listener)?;
    serve_on(relay, listener).await
}

/// Serve on an already-bound listener (tests bind port 0 themselves).
pub async fn serve_on(relay: Arc<Relay>, listener: TcpListener) -> Result<(), FatalError> {
    let router = build_router(Arc::clone(&relay));
    let shutdown = relay.shutdown.clone();

    match tls_acceptor(&relay)? {
        Some(acceptor) => serve_tls(listener, acceptor, router, shutdown).await,
        None => {
            tracing::info!(addr = %display_addr(&listener), "relay listening");
            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
                .map_err(|e| FatalError::Internal(e.into()))
        }
    }
}

fn display_addr(listener: &TcpListener) -> String {
    listener.local_addr().map(|a| a.to_string()).unwrap_or_else(|_| "?".to_owned())
}

/// Load the TLS acceptor from the configured PEM files, if any.
fn tls_acceptor(relay: &Relay) -> Result<Option<tokio_rustls::TlsAcceptor>, FatalError> {
    use rustls_pki_types::pem::PemObject;
    use rustls_pki_types::{CertificateDer, PrivateKeyDer};

    let (Some(cert_path), Some(key_path)) = (&relay.config.tls_cert, &relay.config.tls_key)
    else {
        return Ok(None);
    };

    let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_file_iter(cert_path)
        .map_err(|e| FatalError::Config(format!("tls cert {}: {e}", cert_path.display())))?
        .collect::<Result<_, _>>()
        .map_err(|e| FatalError::Config(format!("tls cert {}: {e}", cert_path.display())))?;
    let key = PrivateKeyDer::from_pem_file(key_path)
        .map_err(|e| FatalError::Config(format!("tls key {}: {e}", key_path.display())))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| FatalError::Config(format!("tls config: {e}")))?;
    Ok(Some(tokio_rustls::TlsAcceptor::from(Arc::new(config))))
}

/// Accept loop for TLS connections, serving each over hyper with upgrade
/// support so WebSockets work through the TLS layer.
async fn serve_tls(
    listener: TcpListener,
    acceptor: tokio_rustls::TlsAcceptor,
    router: Router,
    shutdown: tokio_util::sync::CancellationToken,
) -> Result<(), FatalError> {
    tracing::info!(addr = %display_addr(&listener), "relay listening (tls)");
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(err = %e, "accept failed");
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let router = router.clone();
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(tls) => tls,
                Err(e) => {
                    tracing::debug!(peer = %peer, err = %e, "tls handshake failed");
                    return;
                }
            };
            let io = hyper_util::rt::TokioIo::new(tls_stream);
            let service = hyper_util::service::TowerToHyperService::new(router);
            let result = hyper_util::server::conn::auto::Builder::new(
                hyper_util::rt::TokioExecutor::new(),
            )
            .serve_connection_with_upgrades(io, service)
            .await;
            if let Err(e) = result {
                tracing::debug!(peer = %peer, err = %e, "connection error");
            }
        });
    }
    Ok(())
}
