use std::fmt::Debug;
use std::net::IpAddr;

/// Timezone and coordinates attributed to a proxy exit address.
#[derive(Debug, Clone, PartialEq)]
pub struct GeoInfo {
    pub timezone: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoInfo {
    /// Fallback used whenever lookup is impossible or yields nothing.
    pub fn default_location() -> Self {
        Self {
            timezone: "Europe/London".to_string(),
            latitude: 51.528308,
            longitude: -0.3817765,
        }
    }
}

/// Maps a resolved proxy IP to an approximate location.
///
/// Implement this to plug in a real geo database. The default provider
/// returns `None`, which makes every session fall back to the fixed
/// default location.
pub trait GeoProvider: Debug + Send + Sync {
    fn lookup(&self, ip: IpAddr) -> Option<GeoInfo>;

    /// Unique identifier for this provider (used in logging)
    fn name(&self) -> &str;

    /// Clone this provider into a Box.
    ///
    /// Standard implementation: `Box::new(self.clone())`
    fn clone_box(&self) -> Box<dyn GeoProvider>;
}

impl Clone for Box<dyn GeoProvider> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Provider that knows nothing; all sessions get the default location.
#[derive(Debug, Clone)]
pub struct NoGeoProvider;

impl GeoProvider for NoGeoProvider {
    fn lookup(&self, _ip: IpAddr) -> Option<GeoInfo> {
        None
    }

    fn name(&self) -> &str {
        "no_geo"
    }

    fn clone_box(&self) -> Box<dyn GeoProvider> {
        Box::new(self.clone())
    }
}

/// Best-effort geo resolution for a proxy hostname.
///
/// Loopback hosts are skipped and every failure path is silent: DNS errors,
/// empty answers and unknown IPs all degrade to the default location.
pub async fn resolve_proxy_geo(host: &str, provider: &dyn GeoProvider) -> GeoInfo {
    if host == "localhost" || host == "127.0.0.1" || host == "::1" {
        return GeoInfo::default_location();
    }

    let ip = match host.parse::<IpAddr>() {
        Ok(ip) => Some(ip),
        // Port is required by lookup_host but irrelevant to the answer.
        Err(_) => tokio::net::lookup_host((host, 80))
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
            .map(|addr| addr.ip()),
    };

    match ip {
        Some(ip) => provider
            .lookup(ip)
            .unwrap_or_else(GeoInfo::default_location),
        None => GeoInfo::default_location(),
    }
}
