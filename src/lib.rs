//! # Browserpool
//!
//! Browserpool is a remote task-execution service that runs user-supplied
//! scripts inside managed headless-browser sessions, applies anti-detection
//! countermeasures, and returns structured results over HTTP.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use browserpool::prelude::*;
//! use browserpool::worker::run_worker;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = WorkerConfig {
//!         run: RunOptions {
//!             workers_per_cpu: 1.5,
//!             max_task_timeout: std::time::Duration::from_secs(30),
//!             ..Default::default()
//!         },
//!         server: ServerConfig::default(),
//!         ..Default::default()
//!     };
//!
//!     run_worker(config).await
//! }
//! ```
//!
//! ## Architecture
//!
//! - **Worker**: owns the browser process, the task queue and the dispatch
//!   loop; executes scripts in fresh stealth-hardened sessions
//! - **Common**: shared configuration, proxy and error types

/// Re-export of common types and traits
pub use browserpool_common as common;

/// Re-export of worker functionality
pub use browserpool_worker as worker;

/// Convenient re-exports of commonly used types
pub mod prelude {
    pub use crate::common::{
        BrowserLaunchOptions, GeoInfo, GeoProvider, NoGeoProvider, ProxyConfig, RunOptions,
        ServerConfig, TaskError, TaskStatus, TaskTiming, WorkerConfig,
    };

    pub use crate::worker::{run_worker, BrowserWorkerPool, Metrics, Stats};
}
