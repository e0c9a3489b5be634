// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Satchel relay: multi-tenant message relay and event distribution core.
//!
//! Terminates client connections over WebSocket, routes sync messages within
//! tenant boundaries, buffers for absent peers under bounded memory, and
//! publishes collection-change events to in-process subscribers and outbound
//! webhooks with retries and a dead-letter queue.

pub mod bus;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod limiter;
pub mod metrics;
pub mod orchestrator;
pub mod registry;
pub mod router;
pub mod test_support;
pub mod transport;
pub mod trigger;
pub mod webhook;
pub mod window;

use std::sync::Arc;

use crate::config::RelayConfig;
use crate::error::FatalError;
use crate::orchestrator::{Phase, Relay};

/// Run the relay server until shutdown.
pub async fn run(config: RelayConfig) -> Result<(), FatalError> {
    let relay = Arc::new(Relay::new(config)?);
    Relay::start(&relay).map_err(|e| FatalError::Internal(anyhow::anyhow!("start failed: {e}")))?;

    // First Ctrl-C drains; a stuck drain can be cut short with a second one.
    {
        let relay = Arc::clone(&relay);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown signal received, draining");
                let stopper = Arc::clone(&relay);
                tokio::spawn(async move {
                    let _ = stopper.stop().await;
                });
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("second signal, destroying");
                    relay.destroy();
                }
            }
        });
    }

    transport::serve(Arc::clone(&relay)).await?;

    if relay.phase() != Phase::Stopped && relay.phase() != Phase::Destroyed {
        let _ = relay.stop().await;
    }
    Ok(())
}
