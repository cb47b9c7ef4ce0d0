use anyhow::Result;
use browserpool_worker::run_worker;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Load configuration from environment
    let config = load_config_from_env();

    // Run worker
    run_worker(config).await
}

fn load_config_from_env() -> browserpool_common::WorkerConfig {
    use browserpool_common::{
        BrowserLaunchOptions, NoGeoProvider, ProxyConfig, RunOptions, ServerConfig, WorkerConfig,
    };
    use std::env;
    use std::path::PathBuf;
    use std::time::Duration;

    let port = env::var("PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(8080);
    let auth_key = env::var("KEY").ok().filter(|k| !k.is_empty());

    let workers_per_cpu = env::var("WORKERS_PER_CPU")
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(1.0);

    let max_task_timeout = env::var("MAX_TASK_TIMEOUT_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_secs(30));

    let accept_language = env::var("ACCEPT_LANGUAGE").ok().filter(|v| !v.is_empty());
    let user_agent = env::var("USER_AGENT").ok().filter(|v| !v.is_empty());

    let headless = env::var("HEADLESS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(true);

    // Custom browser path (e.g., /usr/bin/chromium for distro builds)
    // If not set, uses default Chrome/Chromium auto-detection
    let executable: Option<PathBuf> = env::var("BROWSER_PATH").ok().map(PathBuf::from);

    // Upstream proxy applied to every session that brings no proxy of its own
    let task_proxy = env::var("PW_TASK_PROXY")
        .ok()
        .filter(|v| !v.is_empty())
        .map(|server| ProxyConfig {
            server,
            bypass: env::var("PW_TASK_BYPASS").ok().filter(|v| !v.is_empty()),
            username: env::var("PW_TASK_USERNAME").ok().filter(|v| !v.is_empty()),
            password: env::var("PW_TASK_PASSWORD").ok().filter(|v| !v.is_empty()),
        });

    let use_local_proxy = env::var("USE_TASK_PROXY")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let local_proxy_port = env::var("LOCAL_PROXY_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(8888);

    // Chromium's setuid sandbox does not work inside containers.
    let disable_sandbox = in_container();

    WorkerConfig {
        run: RunOptions {
            workers_per_cpu,
            max_task_timeout,
            accept_language,
            user_agent,
            launch: BrowserLaunchOptions {
                headless,
                executable,
                proxy: task_proxy.clone(),
                disable_sandbox,
                ..Default::default()
            },
            task_proxy,
            use_local_proxy,
            local_proxy_port,
        },
        server: ServerConfig {
            host: "0.0.0.0".to_string(),
            port,
            auth_key,
        },
        geo_provider: Box::new(NoGeoProvider),
    }
}

fn in_container() -> bool {
    std::path::Path::new("/.dockerenv").exists()
        || std::env::var("container").is_ok()
        || std::env::var("KUBERNETES_SERVICE_HOST").is_ok()
}
