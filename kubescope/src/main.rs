//! The kubescope consumer daemon.
//!
//! Wires the stores, the Kubernetes client, the consumer's background tasks
//! and the HTTP server together, and tears them down on SIGINT/SIGTERM.
//! Errors here are the only fatal ones in the system; everything past
//! initialisation degrades and retries instead of exiting.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use hyper::service::{make_service_fn, service_fn};
use hyper::Server;
use identity_catalog::IdentityCatalog;
use observability_deps::tracing::{error, info};
use ring_window::RingWindow;
use sample_store::SampleStore;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "kubescope", about = "Cluster metrics consumer")]
struct Config {
    /// Directory holding the identity and sample databases.
    #[clap(long = "data-dir", env = "DATA_DIR", default_value = ".data")]
    data_dir: PathBuf,

    /// Address the HTTP server binds for ingest and queries.
    #[clap(
        long = "http-bind",
        env = "KUBESCOPE_HTTP_BIND",
        default_value = "0.0.0.0:8080"
    )]
    http_bind: SocketAddr,

    /// Interval between drains of the live window into the sample store.
    #[clap(
        long = "flush-interval",
        env = "KUBESCOPE_FLUSH_INTERVAL",
        default_value = "60s",
        value_parser = humantime::parse_duration
    )]
    flush_interval: Duration,

    /// Capacity of the live window, in samples; overflowing samples are
    /// dropped rather than back-pressuring ingest.
    #[clap(
        long = "ring-capacity",
        env = "KUBESCOPE_RING_CAPACITY",
        default_value = "10000"
    )]
    ring_capacity: usize,

    /// Interval between full orchestrator re-lists.
    #[clap(
        long = "resync-interval",
        env = "KUBESCOPE_RESYNC_INTERVAL",
        default_value = "10m",
        value_parser = humantime::parse_duration
    )]
    resync_interval: Duration,
}

#[derive(Debug, Error)]
enum Error {
    #[error("failed to create data directory: {0}")]
    DataDir(std::io::Error),

    #[error("failed to open identity catalog: {0}")]
    Catalog(#[from] identity_catalog::Error),

    #[error("failed to open sample store: {0}")]
    SampleStore(#[from] sample_store::Error),

    #[error("failed to initialise kubernetes client: {0}")]
    Kube(#[from] kube::Error),

    #[error("http server error: {0}")]
    Serve(#[from] hyper::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), Error> {
    std::fs::create_dir_all(&config.data_dir).map_err(Error::DataDir)?;
    let catalog = Arc::new(IdentityCatalog::open(config.data_dir.join("identity.db")).await?);
    let samples = Arc::new(SampleStore::open(config.data_dir.join("samples.db")).await?);
    let ring = Arc::new(RingWindow::new(config.ring_capacity));

    // In-cluster service-account credentials win when the standard service
    // host variable is present; KUBECONFIG applies otherwise.
    let client = kube::Client::try_default().await?;

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(shutdown.clone()));

    let guard = consumer::new(
        catalog,
        samples,
        ring,
        client,
        config.flush_interval,
        config.resync_interval,
        shutdown.clone(),
    );

    let http = guard.http();
    let make_svc = make_service_fn(move |_conn| {
        let http = Arc::clone(&http);
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let http = Arc::clone(&http);
                async move { Ok::<_, Infallible>(http.route(req).await) }
            }))
        }
    });

    let server = Server::try_bind(&config.http_bind)?
        .serve(make_svc)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());
    info!(bind = %config.http_bind, data_dir = %config.data_dir.display(), "serving");

    server.await?;

    // Let the flush worker drain the live window one final time.
    guard.join().await;
    info!("shut down cleanly");
    Ok(())
}

async fn shutdown_on_signal(shutdown: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(error) => {
                error!(%error, "failed to register SIGTERM handler");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    let _ = ctrl_c.await;

    shutdown.cancel();
}
