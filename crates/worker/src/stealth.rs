use anyhow::{anyhow, Result};
use async_trait::async_trait;
use browserpool_common::chrome_major_version;
use chromiumoxide::cdp::browser_protocol::browser::{GrantPermissionsParams, PermissionType};
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetDeviceMetricsOverrideParams, SetGeolocationOverrideParams, SetTimezoneOverrideParams,
    SetUserAgentOverrideParams, UserAgentBrandVersion, UserAgentMetadata,
};
use chromiumoxide::cdp::browser_protocol::network::{Headers, SetExtraHttpHeadersParams};
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::Page;
use tracing::{debug, warn};

use crate::options::ResolvedSessionOptions;

/// Session-level overrides applied before the task script runs: viewport,
/// timezone, geolocation and the geolocation permission grant. These are the
/// option-derived patches; the injected evasions follow separately.
pub async fn prepare_session(page: &Page, options: &ResolvedSessionOptions) -> Result<()> {
    let metrics = SetDeviceMetricsOverrideParams::builder()
        .width(options.viewport.width as i64)
        .height(options.viewport.height as i64)
        .device_scale_factor(1.0)
        .mobile(false)
        .build()
        .map_err(|e| anyhow!("device metrics params: {e}"))?;
    page.execute(metrics).await?;

    page.execute(SetTimezoneOverrideParams::new(options.timezone_id.clone()))
        .await?;

    let geolocation = SetGeolocationOverrideParams::builder()
        .latitude(options.geolocation.latitude)
        .longitude(options.geolocation.longitude)
        .accuracy(100.0)
        .build();
    page.execute(geolocation).await?;

    let permissions: Vec<PermissionType> = options
        .permissions
        .iter()
        .filter_map(|name| match name.as_str() {
            "geolocation" => Some(PermissionType::Geolocation),
            "notifications" => Some(PermissionType::Notifications),
            "clipboard-read" => Some(PermissionType::ClipboardReadWrite),
            _ => None,
        })
        .collect();
    if !permissions.is_empty() {
        page.execute(GrantPermissionsParams::new(permissions)).await?;
    }

    Ok(())
}

/// One independent browser-environment patch.
///
/// Patches are idempotent and self-contained; the applier runs them in a
/// fixed order but none may depend on another having run.
#[async_trait]
pub trait Evasion: Send + Sync {
    fn name(&self) -> &'static str;

    async fn apply(&self, page: &Page, options: &ResolvedSessionOptions) -> Result<()>;
}

/// Ordered pipeline of evasions applied to every new session.
///
/// A single patch failing is logged and skipped; the rest still run.
pub struct StealthApplier {
    evasions: Vec<Box<dyn Evasion>>,
}

impl StealthApplier {
    pub fn new() -> Self {
        Self {
            evasions: vec![
                Box::new(ConsoleRecorder),
                Box::new(ExtraHeaders),
                Box::new(ChromeApp),
                Box::new(ChromeCsi),
                Box::new(ChromeLoadTimes),
                Box::new(ConnectionRtt),
                Box::new(PluginsAndMimeTypes),
                Box::new(PermissionsQuery),
                Box::new(UserAgentOverride),
                Box::new(NavigatorVendor),
                Box::new(NavigatorWebdriver),
                Box::new(WebGlVendor),
            ],
        }
    }

    pub fn evasion_names(&self) -> Vec<&'static str> {
        self.evasions.iter().map(|e| e.name()).collect()
    }

    pub async fn apply(&self, page: &Page, options: &ResolvedSessionOptions) {
        for evasion in &self.evasions {
            match evasion.apply(page, options).await {
                Ok(()) => debug!(evasion = evasion.name(), "evasion applied"),
                Err(e) => {
                    warn!(evasion = evasion.name(), error = %e, "evasion failed, skipping")
                }
            }
        }
    }
}

impl Default for StealthApplier {
    fn default() -> Self {
        Self::new()
    }
}

async fn inject_on_new_document(page: &Page, source: &str) -> Result<()> {
    let params = AddScriptToEvaluateOnNewDocumentParams::builder()
        .source(source)
        .build()
        .map_err(|e| anyhow!("init script params: {e}"))?;
    page.execute(params).await?;
    Ok(())
}

/// Records console output into `window.__poolConsoleLog` for debugging
/// while leaving the original console methods working.
struct ConsoleRecorder;

#[async_trait]
impl Evasion for ConsoleRecorder {
    fn name(&self) -> &'static str {
        "console_recorder"
    }

    async fn apply(&self, page: &Page, _options: &ResolvedSessionOptions) -> Result<()> {
        inject_on_new_document(
            page,
            r#"
            (() => {
                const store = [];
                window.__poolConsoleLog = store;
                for (const level of ['log', 'debug', 'info', 'warn', 'error']) {
                    const original = console[level];
                    console[level] = function (...args) {
                        try { store.push({ level, args: args.map(String) }); } catch (e) {}
                        return original.apply(this, args);
                    };
                }
            })();
            "#,
        )
        .await
    }
}

/// Cache-busting and language headers on every request from the session.
struct ExtraHeaders;

#[async_trait]
impl Evasion for ExtraHeaders {
    fn name(&self) -> &'static str {
        "extra_headers"
    }

    async fn apply(&self, page: &Page, options: &ResolvedSessionOptions) -> Result<()> {
        let mut headers = serde_json::json!({ "Cache-Control": "max-age=0" });
        if let Some(locale) = &options.locale {
            headers["Accept-Language"] = serde_json::Value::String(locale.clone());
        }
        page.execute(SetExtraHttpHeadersParams::new(Headers::new(headers)))
            .await?;
        Ok(())
    }
}

/// `chrome.app` stub matching headful Chrome.
struct ChromeApp;

#[async_trait]
impl Evasion for ChromeApp {
    fn name(&self) -> &'static str {
        "chrome_app"
    }

    async fn apply(&self, page: &Page, _options: &ResolvedSessionOptions) -> Result<()> {
        inject_on_new_document(
            page,
            r#"
            (() => {
                if (!window.chrome) {
                    Object.defineProperty(window, 'chrome', {
                        writable: true,
                        enumerable: true,
                        configurable: false,
                        value: {}
                    });
                }
                if ('app' in window.chrome) {
                    return;
                }
                Object.defineProperty(window.chrome, 'app', {
                    value: {
                        isInstalled: false,
                        InstallState: {
                            DISABLED: 'disabled',
                            INSTALLED: 'installed',
                            NOT_INSTALLED: 'not_installed'
                        },
                        RunningState: {
                            CANNOT_RUN: 'cannot_run',
                            READY_TO_RUN: 'ready_to_run',
                            RUNNING: 'running'
                        },
                        getDetails: function getDetails() { return null; },
                        getIsInstalled: function getIsInstalled() { return false; },
                        runningState: function runningState() { return 'cannot_run'; }
                    }
                });
            })();
            "#,
        )
        .await
    }
}

/// `chrome.csi()` timing stub backed by the Navigation Timing API.
struct ChromeCsi;

#[async_trait]
impl Evasion for ChromeCsi {
    fn name(&self) -> &'static str {
        "chrome_csi"
    }

    async fn apply(&self, page: &Page, _options: &ResolvedSessionOptions) -> Result<()> {
        inject_on_new_document(
            page,
            r#"
            (() => {
                if (!window.chrome) {
                    Object.defineProperty(window, 'chrome', {
                        writable: true, enumerable: true, configurable: false, value: {}
                    });
                }
                if ('csi' in window.chrome) { return; }
                if (!window.performance || !window.performance.timing) { return; }
                const { timing } = window.performance;
                Object.defineProperty(window.chrome, 'csi', {
                    get: function () {
                        return {
                            onloadT: timing.domContentLoadedEventEnd,
                            startE: timing.navigationStart,
                            pageT: Date.now() - timing.navigationStart,
                            tran: 15
                        };
                    },
                    set: function (a) {}
                });
            })();
            "#,
        )
        .await
    }
}

/// `chrome.loadTimes()` stub backed by the Navigation Timing API.
struct ChromeLoadTimes;

#[async_trait]
impl Evasion for ChromeLoadTimes {
    fn name(&self) -> &'static str {
        "chrome_load_times"
    }

    async fn apply(&self, page: &Page, _options: &ResolvedSessionOptions) -> Result<()> {
        inject_on_new_document(
            page,
            r#"
            (() => {
                if (!window.chrome) {
                    Object.defineProperty(window, 'chrome', {
                        writable: true, enumerable: true, configurable: false, value: {}
                    });
                }
                if ('loadTimes' in window.chrome) { return; }
                if (!window.performance || !window.performance.timing) { return; }
                const { timing } = window.performance;
                window.chrome.loadTimes = function () {
                    return {
                        requestTime: timing.navigationStart / 1000,
                        startLoadTime: timing.navigationStart / 1000,
                        commitLoadTime: timing.responseStart / 1000,
                        finishDocumentLoadTime: timing.domContentLoadedEventEnd / 1000,
                        finishLoadTime: timing.loadEventEnd / 1000,
                        firstPaintTime: timing.responseEnd / 1000,
                        firstPaintAfterLoadTime: 0,
                        navigationType: 'Other',
                        wasFetchedViaSpdy: true,
                        wasNpnNegotiated: true,
                        npnNegotiatedProtocol: 'h2',
                        wasAlternateProtocolAvailable: false,
                        connectionInfo: 'h2'
                    };
                };
            })();
            "#,
        )
        .await
    }
}

/// Fixed `navigator.connection.rtt`; headless reports 0 which is a common
/// fingerprinting check.
struct ConnectionRtt;

#[async_trait]
impl Evasion for ConnectionRtt {
    fn name(&self) -> &'static str {
        "connection_rtt"
    }

    async fn apply(&self, page: &Page, _options: &ResolvedSessionOptions) -> Result<()> {
        inject_on_new_document(
            page,
            r#"
            (() => {
                if (!navigator.connection) { return; }
                Object.defineProperty(navigator.connection, 'rtt', {
                    get: () => 50,
                });
            })();
            "#,
        )
        .await
    }
}

/// Non-empty plugin and mime-type lists shaped like headful Chrome's
/// built-in PDF viewer.
struct PluginsAndMimeTypes;

#[async_trait]
impl Evasion for PluginsAndMimeTypes {
    fn name(&self) -> &'static str {
        "plugins_and_mime_types"
    }

    async fn apply(&self, page: &Page, _options: &ResolvedSessionOptions) -> Result<()> {
        inject_on_new_document(
            page,
            r#"
            (() => {
                let pdfMime = {
                    description: 'Native Client Executable',
                    suffixes: '',
                    type: 'application/x-nacl',
                    enabledPlugin: {},
                    __proto__: MimeType.prototype
                };

                Object.defineProperty(navigator, 'plugins', {
                    get: () => {
                        let pdfPlugin = {
                            0: {},
                            description: 'Portable Document Format',
                            filename: 'internal-pdf-viewer',
                            length: 1,
                            name: 'Chrome PDF Plugin',
                            __proto__: Plugin.prototype
                        };
                        pdfMime['enabledPlugin'] = pdfPlugin;
                        pdfPlugin[0] = pdfMime;
                        return {
                            0: pdfPlugin,
                            'Chrome PDF Plugin': pdfPlugin,
                            length: 1,
                            __proto__: PluginArray.prototype
                        };
                    },
                });

                Object.defineProperty(navigator, 'mimeTypes', {
                    get: () => {
                        return {
                            0: pdfMime,
                            'application/x-nacl': pdfMime,
                            length: 1,
                            __proto__: MimeTypeArray.prototype
                        };
                    },
                });
            })();
            "#,
        )
        .await
    }
}

/// Permission query consistency: notifications must answer from
/// `Notification.permission` like real Chrome, not "denied".
struct PermissionsQuery;

#[async_trait]
impl Evasion for PermissionsQuery {
    fn name(&self) -> &'static str {
        "permissions_query"
    }

    async fn apply(&self, page: &Page, _options: &ResolvedSessionOptions) -> Result<()> {
        inject_on_new_document(
            page,
            r#"
            (() => {
                const originalQuery = window.navigator.permissions.query.bind(window.navigator.permissions);
                window.navigator.permissions.query = function (parameters) {
                    if (parameters && parameters.name === 'notifications') {
                        return Promise.resolve({ state: Notification.permission });
                    }
                    return originalQuery(parameters);
                };
            })();
            "#,
        )
        .await
    }
}

/// CDP user-agent override with client-hints metadata derived from the
/// assigned UA. Covers both the UA header and `navigator.userAgentData`;
/// the brand versions track the Chrome major version embedded in the UA so
/// the two surfaces never disagree.
struct UserAgentOverride;

#[async_trait]
impl Evasion for UserAgentOverride {
    fn name(&self) -> &'static str {
        "user_agent_override"
    }

    async fn apply(&self, page: &Page, options: &ResolvedSessionOptions) -> Result<()> {
        let ua = options.user_agent.as_str();
        let major = chrome_major_version(ua).unwrap_or(99).to_string();
        let mobile = ua.contains(" Mobile");

        let (platform, platform_version) = if ua.contains("Windows") {
            ("Windows", "10.0.0")
        } else if ua.contains("Macintosh") {
            ("macOS", "13.0.0")
        } else if ua.contains("iPhone") || ua.contains("iPad") || ua.contains("iPod") {
            ("iOS", "16.0.0")
        } else if ua.contains("Android") {
            ("Android", "12.0.0")
        } else {
            ("Linux", "6.1.0")
        };

        let brands = vec![
            UserAgentBrandVersion::new("Not;A=Brand", "99"),
            UserAgentBrandVersion::new("Google Chrome", major.as_str()),
            UserAgentBrandVersion::new("Chromium", major.as_str()),
        ];

        let metadata = UserAgentMetadata::builder()
            .brands(brands)
            .platform(platform)
            .platform_version(platform_version)
            .architecture(if mobile { "" } else { "x86" })
            .model("")
            .mobile(mobile)
            .build()
            .map_err(|e| anyhow!("user agent metadata: {e}"))?;

        let mut builder = SetUserAgentOverrideParams::builder()
            .user_agent(ua)
            .user_agent_metadata(metadata)
            .platform(format!("{platform} x86_64"));
        if let Some(locale) = &options.locale {
            builder = builder.accept_language(locale.clone());
        }
        let params = builder
            .build()
            .map_err(|e| anyhow!("user agent override: {e}"))?;

        page.execute(params).await?;
        Ok(())
    }
}

/// `navigator.vendor` pinned to Google Inc.
struct NavigatorVendor;

#[async_trait]
impl Evasion for NavigatorVendor {
    fn name(&self) -> &'static str {
        "navigator_vendor"
    }

    async fn apply(&self, page: &Page, _options: &ResolvedSessionOptions) -> Result<()> {
        inject_on_new_document(
            page,
            r#"
            (() => {
                Object.defineProperty(navigator, 'vendor', {
                    get: function () { return 'Google Inc.'; },
                    set: function (a) {}
                });
            })();
            "#,
        )
        .await
    }
}

/// Hide `navigator.webdriver` on Chrome builds that still expose it as
/// true; newer builds already report false or undefined and are left alone.
struct NavigatorWebdriver;

#[async_trait]
impl Evasion for NavigatorWebdriver {
    fn name(&self) -> &'static str {
        "navigator_webdriver"
    }

    async fn apply(&self, page: &Page, _options: &ResolvedSessionOptions) -> Result<()> {
        inject_on_new_document(
            page,
            r#"
            (() => {
                if (navigator.webdriver === false || navigator.webdriver === undefined) {
                    return;
                }
                Object.defineProperty(navigator, 'webdriver', {
                    get: function () { return false; },
                    set: function (a) {}
                });
            })();
            "#,
        )
        .await
    }
}

/// Plausible WebGL vendor and renderer strings instead of the SwiftShader
/// giveaway.
struct WebGlVendor;

#[async_trait]
impl Evasion for WebGlVendor {
    fn name(&self) -> &'static str {
        "webgl_vendor"
    }

    async fn apply(&self, page: &Page, _options: &ResolvedSessionOptions) -> Result<()> {
        inject_on_new_document(
            page,
            r#"
            (() => {
                function randomInteger(min, max) {
                    return Math.floor(min + Math.random() * (max + 1 - min));
                }
                const gpus = [
                    'Titan', '1080 Ti', '1080', '1070 Ti', '1070', '1060',
                    '1050 Ti', '1050', '1030', '980 Ti', '980', '970', '960',
                    '950', '780 Ti', '780', '770', '760 Ti', '760', '750 Ti',
                    '750', '745', '740', '730', '720', '710'
                ];
                const patched = function (original) {
                    return function (parameter) {
                        // UNMASKED_VENDOR_WEBGL
                        if (parameter === 37445) {
                            return 'Google Inc. (NVIDIA)';
                        }
                        // UNMASKED_RENDERER_WEBGL
                        if (parameter === 37446) {
                            return 'Nvidia GTX ' + gpus[randomInteger(0, gpus.length - 1)];
                        }
                        return original.call(this, parameter);
                    };
                };
                WebGLRenderingContext.prototype.getParameter =
                    patched(WebGLRenderingContext.prototype.getParameter);
                if (window.WebGL2RenderingContext) {
                    WebGL2RenderingContext.prototype.getParameter =
                        patched(WebGL2RenderingContext.prototype.getParameter);
                }
            })();
            "#,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_order_is_fixed() {
        let applier = StealthApplier::new();
        let names = applier.evasion_names();
        assert_eq!(names.first(), Some(&"console_recorder"));
        assert_eq!(names.last(), Some(&"webgl_vendor"));
        assert!(names.contains(&"navigator_webdriver"));
        assert!(names.contains(&"user_agent_override"));
        assert_eq!(names.len(), 12);
    }
}
