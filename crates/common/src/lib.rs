pub mod config;
pub mod geo;
pub mod proxy;
pub mod types;
pub mod user_agent;

pub use config::{BrowserLaunchOptions, RunOptions, ServerConfig, WorkerConfig};
pub use geo::{resolve_proxy_geo, GeoInfo, GeoProvider, NoGeoProvider};
pub use proxy::ProxyConfig;
pub use types::{epoch_millis, is_browser_gone_error, TaskError, TaskStatus, TaskTiming};
pub use user_agent::{chrome_major_version, random_chrome_user_agent};
