// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use loggle::egress::build_sink;
use loggle::entry::Severity;
use loggle::logger::{Logger, LoggerFactory};
use loggle::orchestrator::IngestionOrchestrator;
use loggle_agent::config::Config;
use loggle_agent::ingest_server::IngestServer;

const LOG_LEVEL_ENV: &str = "LOGGLE_LOG_LEVEL";
const SELF_LOG_CATEGORY: &str = "loggle-server";

#[tokio::main]
pub async fn main() -> ExitCode {
    let config = Config::load(Some(&Config::default_path()));

    let log_level = match &config {
        Ok(config) => config.log_level.to_lowercase(),
        Err(_) => std::env::var(LOG_LEVEL_ENV)
            .map(|val| val.to_lowercase())
            .unwrap_or("info".to_string()),
    };
    if let Err(e) = init_logging(&log_level) {
        eprintln!("Unable to initialize logging: {e:#}");
        return ExitCode::FAILURE;
    }

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(log_level: &str) -> anyhow::Result<()> {
    let env_filter = format!("h2=off,hyper=off,rustls=off,rdkafka=off,{log_level}");

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).context("could not parse log level in configuration")?,
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    debug!("Logging subsystem enabled");
    Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
    let now = Instant::now();

    let orchestrator = Arc::new(
        IngestionOrchestrator::from_config(config.limits.clone(), &config.egress)
            .with_context(|| format!("unable to start {} egress", config.egress.egress_type))?,
    );

    let self_logs = if config.self_logs.enabled {
        let sink = build_sink(&config.egress).context("unable to start self log egress")?;
        let buffer = config.egress.batching().cloned().unwrap_or_default();
        let factory = LoggerFactory::new(config.self_logs.clone(), sink, buffer);
        let logger = factory.create_logger(SELF_LOG_CATEGORY);
        Some((factory, logger))
    } else {
        None
    };

    let cancel_token = CancellationToken::new();
    let server = IngestServer::new(
        config.receiver.clone(),
        Arc::clone(&orchestrator),
        cancel_token.clone(),
    );
    let mut server_task = tokio::spawn(async move { server.start().await });

    info!(
        "Loggle server started on {}:{} with {} egress in {} ms",
        config.receiver.host,
        config.receiver.port,
        config.egress.egress_type,
        now.elapsed().as_millis()
    );
    self_log(
        &self_logs,
        Severity::Info,
        &format!(
            "Listening on {}:{} with {} egress",
            config.receiver.host, config.receiver.port, config.egress.egress_type
        ),
    )
    .await;

    let mut egress_stopped = false;
    let server_result = tokio::select! {
        () = shutdown_signal() => {
            info!("Shutdown signal received, draining");
            cancel_token.cancel();
            server_task.await
        }
        () = orchestrator.stopped() => {
            error!("Buffered egress stopped, shutting down the ingest server");
            egress_stopped = true;
            cancel_token.cancel();
            server_task.await
        }
        result = &mut server_task => result,
    };

    let server_result = server_result
        .context("ingest server task failed")
        .and_then(|result| result.context("ingest server failed"));
    if let (Err(e), Some((_, logger))) = (&server_result, &self_logs) {
        if let Err(log_err) = logger
            .log_error(Severity::Error, "Ingest server failed", &**e)
            .await
        {
            debug!("Dropped self log: {log_err}");
        }
    }

    let drain_result = orchestrator.shutdown().await;
    if let Err(e) = &drain_result {
        error!("Failed to drain buffered egress: {e}");
    }
    if let Some(stats) = orchestrator.stats() {
        info!(
            "Egress totals: batches={}, attempted={}, failed={}",
            stats.batches, stats.attempted, stats.failed
        );
    }

    if let Some((factory, _)) = &self_logs {
        self_log(&self_logs, Severity::Info, "Stopped").await;
        if let Err(e) = factory.shutdown().await {
            error!("Failed to drain self logs: {e}");
        }
    }

    server_result?;
    if egress_stopped {
        return Err(match drain_result {
            Err(e) => anyhow::Error::from(e).context("buffered egress stopped"),
            Ok(()) => anyhow::anyhow!("buffered egress stopped unexpectedly"),
        });
    }
    Ok(())
}

async fn self_log(self_logs: &Option<(LoggerFactory, Logger)>, level: Severity, message: &str) {
    if let Some((_, logger)) = self_logs {
        if let Err(e) = logger.log(level, message).await {
            debug!("Dropped self log: {e}");
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
