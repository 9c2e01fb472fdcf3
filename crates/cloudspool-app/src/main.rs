// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Cloudspool: cloud print proxy for a local CUPS printer fleet.
//
// Entry point. Loads configuration, verifies the robot credential, starts the
// push session, the printer manager, and the diagnostic monitor, then waits
// for a termination signal.

mod monitor;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cloudspool_cloud::{
    CloudClient, CredentialStore, KeepaliveConfig, OAuthConfig, PushSession, TokenSource,
    WsTransport, build_http_client,
};
use cloudspool_core::ConnectorConfig;
use cloudspool_core::error::{CloudspoolError, Result};
use cloudspool_core::types::Identity;
use cloudspool_cups::CupsClient;
use cloudspool_manager::PrinterManager;

use monitor::Monitor;

#[derive(Debug, Parser)]
#[command(name = "cloudspool", version, about = "Cloud print proxy for local CUPS printers")]
struct Args {
    /// Connector configuration file (JSON).
    #[arg(long, default_value = "cloudspool.config.json")]
    config_filename: PathBuf,

    /// Log filter used when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "cloudspool stopped with an error");
            ExitCode::FAILURE
        }
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn termination_signal() -> Result<()> {
    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = term.recv() => {}
    }
    Ok(())
}

async fn run(args: Args) -> Result<()> {
    let config = ConnectorConfig::load(&args.config_filename)?;
    info!(
        proxy = %config.proxy_name,
        config = %args.config_filename.display(),
        "cloudspool starting"
    );
    monitor::ensure_not_running(&config.monitor_socket_filename)?;

    let http = build_http_client(config.request_timeout())?;
    let tokens = Arc::new(CredentialStore::new(
        http.clone(),
        OAuthConfig {
            client_id: config.oauth_client_id.clone(),
            client_secret: config.oauth_client_secret.clone(),
            token_url: config.oauth_token_url.clone(),
        },
        config.robot_refresh_token.clone(),
        config.user_refresh_token.clone(),
    ));

    // Nothing works without the robot identity, so prove it before starting.
    tokens.access_token(Identity::Robot).await?;
    info!("robot credential verified");
    if config.share_scope.is_some() && !tokens.has_identity(Identity::User) {
        warn!("share_scope is set but no user refresh token is configured; printers will not be shared");
    }

    let cloud = Arc::new(CloudClient::from_config(&config, http, tokens.clone()));
    let cups = Arc::new(CupsClient::from_config(&config)?);

    let (push, events) = PushSession::new(
        Arc::new(WsTransport::new(&config.push_url, config.request_timeout())),
        tokens,
        &config.proxy_name,
        KeepaliveConfig::from_config(&config),
    )
    .start();

    let mut manager = match PrinterManager::start(&config, cloud, cups, Some(events)).await {
        Ok(manager) => manager,
        Err(e) => {
            push.shutdown().await;
            return Err(e);
        }
    };
    let mut fatal = manager
        .take_fatal_receiver()
        .ok_or_else(|| CloudspoolError::Config("fatal error channel already taken".into()))?;

    let monitor = match Monitor::start(
        &config.monitor_socket_filename,
        push.state_watch(),
        manager.snapshot_reader(),
    ) {
        Ok(monitor) => Some(monitor),
        Err(e) => {
            warn!(error = %e, "diagnostic monitor unavailable");
            None
        }
    };

    info!("cloudspool running");
    let outcome = tokio::select! {
        signalled = termination_signal() => {
            signalled.map(|()| info!("termination requested, draining"))
        }
        Some(err) = fatal.recv() => {
            error!(error = %err, "fatal error, shutting down");
            Err(err)
        }
    };

    // A second signal during the drain exits immediately.
    tokio::spawn(async {
        if termination_signal().await.is_ok() {
            warn!("second termination signal, exiting now");
            std::process::exit(1);
        }
    });

    manager.stop().await;
    push.shutdown().await;
    if let Some(monitor) = monitor {
        monitor.stop().await;
    }
    info!("cloudspool stopped");
    outcome
}
