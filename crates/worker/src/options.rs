use browserpool_common::{
    random_chrome_user_agent, resolve_proxy_geo, GeoInfo, GeoProvider, ProxyConfig, RunOptions,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_VIEWPORT_WIDTH: u32 = 1920;
pub const DEFAULT_VIEWPORT_HEIGHT: u32 = 1080;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: DEFAULT_VIEWPORT_WIDTH,
            height: DEFAULT_VIEWPORT_HEIGHT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geolocation {
    pub latitude: f64,
    pub longitude: f64,
}

/// Per-task session configuration as submitted by the caller. Every field
/// is optional; gaps are filled by `resolve`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionOptions {
    pub viewport: Option<Viewport>,
    pub locale: Option<String>,
    pub proxy: Option<ProxyConfig>,
    pub user_agent: Option<String>,
    pub timezone_id: Option<String>,
    pub geolocation: Option<Geolocation>,
    pub permissions: Vec<String>,
}

/// Fully resolved session configuration, every gap filled.
#[derive(Debug, Clone)]
pub struct ResolvedSessionOptions {
    pub viewport: Viewport,
    pub locale: Option<String>,
    pub proxy: Option<ProxyConfig>,
    pub user_agent: String,
    pub timezone_id: String,
    pub geolocation: Geolocation,
    pub permissions: Vec<String>,
}

/// Fill gaps in task options: explicit per-task value, then the
/// environment-level override, then the global default.
///
/// Timezone and geolocation come from a best-effort geo lookup on the proxy
/// host when the task does not pin them; lookup failure silently falls back
/// to the fixed default location. The geolocation permission is always
/// granted so the spoofed coordinates are actually served.
pub async fn resolve(
    options: &SessionOptions,
    run: &RunOptions,
    geo: &dyn GeoProvider,
) -> ResolvedSessionOptions {
    let viewport = options.viewport.unwrap_or_default();

    let locale = options
        .locale
        .clone()
        .or_else(|| run.accept_language.clone());

    let proxy = options.proxy.clone().or_else(|| {
        run.task_proxy.clone().or_else(|| {
            run.use_local_proxy
                .then(|| ProxyConfig::from_server(format!("socks5://localhost:{}", run.local_proxy_port)))
        })
    });

    let user_agent = options
        .user_agent
        .clone()
        .or_else(|| run.user_agent.clone())
        .unwrap_or_else(random_chrome_user_agent);

    let looked_up = match (&options.timezone_id, &options.geolocation) {
        // Both pinned by the task, no lookup needed.
        (Some(_), Some(_)) => GeoInfo::default_location(),
        _ => match proxy.as_ref().and_then(|p| p.host()) {
            Some(host) => resolve_proxy_geo(&host, geo).await,
            None => GeoInfo::default_location(),
        },
    };

    let timezone_id = options
        .timezone_id
        .clone()
        .unwrap_or_else(|| looked_up.timezone.clone());

    let geolocation = options.geolocation.unwrap_or(Geolocation {
        latitude: looked_up.latitude,
        longitude: looked_up.longitude,
    });

    let mut permissions = options.permissions.clone();
    if !permissions.iter().any(|p| p == "geolocation") {
        permissions.push("geolocation".to_string());
    }

    ResolvedSessionOptions {
        viewport,
        locale,
        proxy,
        user_agent,
        timezone_id,
        geolocation,
        permissions,
    }
}
