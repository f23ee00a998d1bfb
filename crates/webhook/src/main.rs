//! Vigil webhook server: wires the admission pipeline, leader election,
//! cluster facts and telemetry into one process.

#![forbid(unsafe_code)]

mod config;
mod server;
mod tls;

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use vigil_api::{AdmissionPipeline, BackendClient, CommandEvaluator};
use vigil_core::ErrorReporter;
use vigil_kubehub::{ClusterApi, ClusterFactsProvider, KubeClusterApi, KubeLeaseStore, LeaderElector, LeaseStore};
use vigil_telemetry::TelemetryAggregator;

use crate::config::Cli;

fn init_tracing() {
    let env = std::env::var("VIGIL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::from_str(&env).unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("VIGIL_LOG_FORMAT").map(|v| v.eq_ignore_ascii_case("json")).unwrap_or(false);
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).with_target(true).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
    }
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("VIGIL_METRICS_ADDR") {
        match addr.parse::<SocketAddr>() {
            Ok(sock) => match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(sock).install() {
                Ok(()) => info!(addr = %sock, "metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            },
            Err(_) => warn!(addr = %addr, "invalid VIGIL_METRICS_ADDR; expected host:port"),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let term = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let term = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => {},
        _ = term => {},
    }
}

/// Flush telemetry and refresh cluster facts every `every` until shutdown.
async fn periodic(
    telemetry: Arc<TelemetryAggregator>,
    facts: Arc<ClusterFactsProvider>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let sent = telemetry.flush().await;
                let refreshed = facts.refresh().await;
                debug!(sent, refreshed, "periodic: tick");
            }
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    info!(version = config::WEBHOOK_VERSION, port = cli.port, enforce = cli.enforce, "vigil-webhook starting");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    let backend = Arc::new(BackendClient::new(cli.backend_settings())?);
    let reporter: Arc<dyn ErrorReporter> = backend.clone();
    let client = vigil_kubehub::try_client().await;

    let election = cli.election_config();
    let lease_store = client
        .clone()
        .map(|c| Arc::new(KubeLeaseStore::new(c, &election.namespace, &election.lease_name)) as Arc<dyn LeaseStore>);
    let elector = LeaderElector::start(lease_store, election, reporter.clone(), shutdown_rx.clone()).await;

    let cluster_api = client.map(|c| Arc::new(KubeClusterApi::new(c)) as Arc<dyn ClusterApi>);
    let facts = Arc::new(ClusterFactsProvider::new(cluster_api, elector.state()).with_reporter(backend.clone()));
    facts.bootstrap().await;
    backend.set_cluster_context(&facts.cluster_uuid_or_empty().await, &facts.k8s_version());
    facts.refresh().await;

    let telemetry = Arc::new(TelemetryAggregator::new(backend.clone(), cli.aggregator_config()));
    let evaluator = CommandEvaluator::from_command_line(&cli.engine_cmd)
        .ok_or_else(|| anyhow!("VIGIL_ENGINE_CMD is empty"))?;
    let skip_list = config::load_skip_list(&cli.config_dir);
    let pipeline = Arc::new(AdmissionPipeline::new(
        cli.pipeline_config(skip_list),
        backend.clone(),
        Arc::new(evaluator),
        facts.clone(),
        telemetry.clone(),
        reporter,
    ));

    let ticker = tokio::spawn(periodic(telemetry.clone(), facts.clone(), cli.flush_interval(), shutdown_rx.clone()));

    let acceptor = tls::load_acceptor(&cli.tls_dir)?;
    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    server::serve(server::router(pipeline), addr, acceptor, shutdown_rx).await?;

    if let Err(e) = ticker.await {
        warn!(error = %e, "periodic task failed");
    }
    let sent = telemetry.flush().await;
    elector.stopped().await;
    info!(sent, "vigil-webhook stopped");
    Ok(())
}
