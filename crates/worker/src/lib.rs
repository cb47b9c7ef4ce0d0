mod metrics;
mod options;
mod pool;
mod proxy_server;
mod script;
mod server;
mod session;
mod stats;
mod stealth;

pub use metrics::Metrics;
pub use options::{Geolocation, ResolvedSessionOptions, SessionOptions, Viewport};
pub use pool::{worker_ceiling, BrowserWorkerPool, TaskCallback};
pub use proxy_server::ProxyServer;
pub use server::{router, AppState};
pub use session::SessionHandle;
pub use stats::{Stats, StatsSnapshot, TaskCounters};

use anyhow::{bail, Result};
use browserpool_common::{ProxyConfig, WorkerConfig};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Run the worker with given configuration.
///
/// This is the main entry point: it starts the optional local proxy relay,
/// launches the shared browser, runs the dispatch loop and serves the HTTP
/// submission API until SIGTERM/Ctrl+C. Returns an error when startup fails
/// or when the worker dies on the unrecoverable browser path.
///
/// # Example
///
/// ```rust,ignore
/// use browserpool_worker::run_worker;
/// use browserpool_common::WorkerConfig;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = WorkerConfig::default();
///     run_worker(config).await
/// }
/// ```
pub async fn run_worker(mut config: WorkerConfig) -> Result<()> {
    info!(
        host = %config.server.host,
        port = config.server.port,
        geo_provider = config.geo_provider.name(),
        "starting browser pool worker"
    );

    let cancellation_token = CancellationToken::new();

    let metrics = Metrics::new("browserpool")?;
    let stats = Stats::new();

    // The relay binds before the browser launches so sessions routed through
    // it never race its startup.
    if config.run.use_local_proxy {
        let proxy =
            ProxyServer::start(config.run.local_proxy_port, cancellation_token.clone()).await?;
        if config.run.launch.proxy.is_none() {
            config.run.launch.proxy = Some(ProxyConfig::from_server(format!(
                "socks5://{}",
                proxy.address()
            )));
        }
    }

    let pool = BrowserWorkerPool::new(
        stats,
        config.run.clone(),
        config.geo_provider,
        cancellation_token.clone(),
    );

    // A failed first launch is a startup error, not something to retry.
    pool.launch_browser().await?;
    pool.run_task_manager();

    let state = AppState {
        pool: pool.clone(),
        metrics,
        auth_key: config.server.auth_key.clone(),
    };

    let signal_token = cancellation_token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    let result = server::serve(&config.server, state, cancellation_token.clone()).await;

    cancellation_token.cancel();
    pool.close().await;

    result?;
    if pool.is_fatal() {
        bail!("worker terminated after unrecoverable browser failure");
    }

    info!("worker shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("Received Ctrl+C signal");
        },
        _ = terminate => {
            warn!("Received SIGTERM signal");
        },
    }
}
