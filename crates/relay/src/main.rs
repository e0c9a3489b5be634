// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;
use tracing::error;

use satchel_relay::config::RelayConfig;

#[derive(Debug, Parser)]
#[command(name = "satchel-relay", about = "Multi-tenant message relay and event bus", version)]
struct Cli {
    #[command(flatten)]
    config: RelayConfig,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = satchel_relay::run(cli.config).await {
        error!("fatal: {e}");
        std::process::exit(e.exit_code());
    }
}
