use std::path::PathBuf;
use std::time::Duration;

use crate::geo::GeoProvider;
use crate::proxy::ProxyConfig;

/// Pool runtime configuration.
///
/// Resolved once at startup (environment reads happen in the binary, not
/// here) and passed into the pool's constructor as already-final values.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Worker ceiling = ceil(workers_per_cpu * detected cpus), floored at 1.
    pub workers_per_cpu: f64,
    /// Hard per-script deadline. The loser of the timeout race is abandoned,
    /// not cancelled; session teardown is what actually stops it.
    pub max_task_timeout: Duration,
    /// Default locale / Accept-Language for sessions that do not set one.
    pub accept_language: Option<String>,
    /// Global user-agent default. Also appended to the browser launch args.
    pub user_agent: Option<String>,
    /// Environment-supplied proxy used when a task carries no explicit proxy.
    pub task_proxy: Option<ProxyConfig>,
    /// Route proxy-less tasks through the local SOCKS relay.
    pub use_local_proxy: bool,
    /// Port for the local SOCKS relay.
    pub local_proxy_port: u16,
    pub launch: BrowserLaunchOptions,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            workers_per_cpu: 1.0,
            max_task_timeout: Duration::from_secs(30),
            accept_language: None,
            user_agent: None,
            task_proxy: None,
            use_local_proxy: false,
            local_proxy_port: 8888,
            launch: BrowserLaunchOptions::default(),
        }
    }
}

/// Pass-through configuration for the shared browser process launch.
#[derive(Debug, Clone)]
pub struct BrowserLaunchOptions {
    pub headless: bool,
    /// Path to the browser binary. If None, default Chrome/Chromium
    /// auto-detection is used.
    pub executable: Option<PathBuf>,
    /// Extra command line arguments appended after the built-in set.
    pub args: Vec<String>,
    /// Browser-level proxy applied at launch.
    pub proxy: Option<ProxyConfig>,
    /// Launch with Chromium's sandbox disabled. The setuid sandbox does not
    /// work inside containers, so the binary turns this on when it detects
    /// one.
    pub disable_sandbox: bool,
    pub launch_timeout: Duration,
}

impl Default for BrowserLaunchOptions {
    fn default() -> Self {
        Self {
            headless: true,
            executable: None,
            args: Vec::new(),
            proxy: None,
            disable_sandbox: false,
            launch_timeout: Duration::from_secs(30),
        }
    }
}

/// HTTP submission server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// When set, POST /task and GET /stats require an Authorization header
    /// equal to this key.
    pub auth_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            auth_key: None,
        }
    }
}

/// Full worker configuration: pool options, HTTP surface and the geo
/// provider used to derive timezone/geolocation from proxy addresses.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub run: RunOptions,
    pub server: ServerConfig,
    pub geo_provider: Box<dyn GeoProvider>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            run: RunOptions::default(),
            server: ServerConfig::default(),
            geo_provider: Box::new(crate::geo::NoGeoProvider),
        }
    }
}
