// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::process::ExitCode;

use blossom_server::{api::router, config::Config, logging, state::AppState};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    logging::init(config.log_format);

    let bind_addr = config.bind_addr;
    let state = match AppState::build(config).await {
        Ok(state) => state,
        Err(e) => {
            error!(error = %e, "Startup failed");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = CancellationToken::new();
    let pruner = tokio::spawn(state.pruner().run(shutdown.clone()));

    let listener = match TcpListener::bind(bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, addr = %bind_addr, "Failed to bind");
            return ExitCode::FAILURE;
        }
    };
    info!(addr = %bind_addr, "Blossom server listening (docs at /docs)");

    let served = axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown signal received");
        })
        .await;

    shutdown.cancel();
    if let Err(e) = pruner.await {
        error!(error = %e, "Pruner task panicked");
    }

    match served {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Server error");
            ExitCode::FAILURE
        }
    }
}
