// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod lag_sampler;
mod logger;

use std::{env, process::ExitCode, sync::Arc};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use trace_agent::{config, error::ServicesError, proc::ProcfsProbe, services::TraceAgent};

use lag_sampler::LagSampler;

#[tokio::main]
pub async fn main() -> ExitCode {
    let log_level = env::var("TRACE_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_ansi(false)
        .event_format(logger::Formatter)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    match run().await {
        Ok(()) => {
            info!("Trace agent stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Trace agent aborted: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Runs the agent until Ctrl-C or SIGTERM.
async fn run() -> Result<(), ServicesError> {
    let config =
        config::Config::new().map_err(|e| ServicesError::InvalidConfig(e.to_string()))?;

    let probe = ProcfsProbe::default();
    let handle = TraceAgent::new(config, Arc::new(probe.clone())).start()?;

    let lag_sampler = LagSampler::new(handle.apm_metrics(), handle.agent(), probe);
    let cancel = handle.cancellation_token();
    tokio::spawn(async move { lag_sampler.start(cancel).await });

    shutdown_signal().await;
    handle.shutdown().await
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Unable to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Unable to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
