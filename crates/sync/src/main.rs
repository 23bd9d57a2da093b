// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;
use tracing::error;

use arena_sync::config::{LogFormat, SyncConfig};

#[tokio::main]
async fn main() {
    let config = SyncConfig::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt().with_env_filter(filter).json().init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }

    if let Err(e) = arena_sync::run(config).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}
