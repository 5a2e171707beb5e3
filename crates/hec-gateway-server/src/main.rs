// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use hec_gateway::{
    ack::spawn_sweeper, AckManager, GatewayConfig, HecServer, HecService, SenderPool,
};

#[tokio::main]
pub async fn main() {
    let config = match GatewayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let env_filter = format!("h2=off,hyper=off,{}", config.log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let cancel = CancellationToken::new();
    let manager = Arc::new(AckManager::new(config.ack_limits()));
    let sweeper_handle = spawn_sweeper(manager.clone(), config.poll_time, cancel.clone());

    let settings = config.sender_settings();
    info!(
        "Connecting {} sender(s) to {}:{} over {}",
        settings.connections, settings.host, settings.port, settings.protocol
    );
    let pool = match SenderPool::connect(&settings).await {
        Ok(pool) => Arc::new(pool),
        Err(e) => {
            error!("Unable to start senders: {e}");
            cancel.cancel();
            return;
        }
    };

    let service = Arc::new(HecService::new(
        manager,
        pool.clone(),
        config.syslog_hostname.clone(),
        config.syslog_appname.clone(),
    ));
    let server = HecServer::new(service, config.max_request_content_length);

    let addr = config.listen_addr();
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Unable to listen on {addr}: {e}");
            cancel.cancel();
            pool.close().await;
            return;
        }
    };
    info!("hec-gateway: starting to listen on {addr}");

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                shutdown.cancel();
            }
            Err(e) => error!("Unable to listen for shutdown signal: {e}"),
        }
    });

    if let Err(e) = server.serve(listener, cancel.clone()).await {
        error!("HTTP server stopped: {e}");
        cancel.cancel();
    }

    pool.close().await;
    if let Err(e) = sweeper_handle.await {
        error!("Ack sweeper task failed: {e}");
    }
    info!("hec-gateway stopped");
}
