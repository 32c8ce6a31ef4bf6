//! Chromium DevTools Protocol adapter used by flowprobe.
//!
//! The adapter owns one browser connection, opens pages on it, and republishes the page
//! events a debugging driver cares about (console output, network traffic, uncaught
//! exceptions) on a broadcast bus. Page interaction goes through the [`Cdp`] trait so
//! drivers can be exercised against scripted fakes.

use std::{env, path::PathBuf};
use tokio::sync::broadcast;
use which::which;

pub mod ids {
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    /// Unique identifier for the browser instance managed by the adapter.
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
    pub struct BrowserId(pub Uuid);

    /// Unique identifier for a page/tab.
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
    pub struct PageId(pub Uuid);

    impl BrowserId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    impl PageId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    impl Default for PageId {
        fn default() -> Self {
            Self::new()
        }
    }
}

pub mod error {
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use thiserror::Error;

    /// High-level error categories surfaced by the adapter.
    #[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
    pub enum AdapterErrorKind {
        #[error("navigation timed out")]
        NavTimeout,
        #[error("navigation failed")]
        NavFailed,
        #[error("cdp i/o failure")]
        CdpIo,
        #[error("target element not found")]
        TargetNotFound,
        #[error("internal error")]
        Internal,
    }

    /// Enriched error metadata passed back to higher layers.
    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct AdapterError {
        pub kind: AdapterErrorKind,
        pub hint: Option<String>,
        pub retriable: bool,
        pub data: Option<serde_json::Value>,
    }

    impl fmt::Display for AdapterError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.kind)?;
            if let Some(hint) = &self.hint {
                write!(f, ": {}", hint)?;
            }
            Ok(())
        }
    }

    impl std::error::Error for AdapterError {}

    impl AdapterError {
        pub fn new(kind: AdapterErrorKind) -> Self {
            Self {
                kind,
                hint: None,
                retriable: false,
                data: None,
            }
        }

        pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
            self.hint = Some(hint.into());
            self
        }

        pub fn retriable(mut self, flag: bool) -> Self {
            self.retriable = flag;
            self
        }

        pub fn with_data(mut self, data: serde_json::Value) -> Self {
            self.data = Some(data);
            self
        }
    }
}

pub mod events {
    use super::ids::PageId;
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeMap;

    /// Where a console message was emitted from.
    #[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct SourceLocation {
        pub url: String,
        pub line: Option<u64>,
        pub column: Option<u64>,
    }

    /// Raw events emitted by the adapter.
    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub enum RawEvent {
        Console {
            page: PageId,
            kind: String,
            text: String,
            location: Option<SourceLocation>,
        },
        Request {
            page: PageId,
            request_id: String,
            method: String,
            url: String,
            /// Header names are lower-cased.
            headers: BTreeMap<String, String>,
        },
        Response {
            page: PageId,
            request_id: String,
            url: String,
            status: i64,
        },
        PageError {
            page: PageId,
            message: String,
        },
        Error {
            page: Option<PageId>,
            message: String,
        },
    }
}

pub mod config {
    use crate::detect_chrome_executable;
    use serde::{Deserialize, Serialize};
    use std::{env, path::PathBuf};

    /// Configuration for launching and tuning the adapter.
    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct CdpConfig {
        pub executable: PathBuf,
        /// Profile directory; a temporary one is created per launch when unset.
        pub user_data_dir: Option<PathBuf>,
        pub headless: bool,
        pub no_sandbox: bool,
        pub default_deadline_ms: u64,
        pub launch_timeout_ms: u64,
        /// Attach to an already running browser instead of launching one.
        pub websocket_url: Option<String>,
        pub idle_window_ms: u64,
    }

    impl Default for CdpConfig {
        fn default() -> Self {
            Self {
                executable: detect_chrome_executable().unwrap_or_default(),
                user_data_dir: None,
                headless: resolve_headless_default(),
                no_sandbox: env_flag("FLOWPROBE_DISABLE_SANDBOX"),
                default_deadline_ms: 30_000,
                launch_timeout_ms: 20_000,
                websocket_url: None,
                idle_window_ms: 500,
            }
        }
    }

    pub(crate) fn resolve_headless_default() -> bool {
        match env::var("FLOWPROBE_HEADLESS") {
            Ok(value) => {
                let lower = value.trim().to_ascii_lowercase();
                !matches!(lower.as_str(), "0" | "false" | "no" | "off")
            }
            Err(_) => true,
        }
    }

    fn env_flag(key: &str) -> bool {
        env::var(key)
            .map(|value| {
                matches!(
                    value.trim().to_ascii_lowercase().as_str(),
                    "1" | "true" | "yes" | "on"
                )
            })
            .unwrap_or(false)
    }
}

/// Locate a Chrome/Chromium binary: `FLOWPROBE_CHROME`, then `PATH`, then OS install paths.
pub fn detect_chrome_executable() -> Option<PathBuf> {
    if let Ok(raw) = env::var("FLOWPROBE_CHROME") {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            let candidate = PathBuf::from(trimmed);
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    if let Some(path) = chrome_executable_names()
        .iter()
        .find_map(|name| which(name).ok())
    {
        return Some(path);
    }

    let skip_defaults = env::var("FLOWPROBE_SKIP_OS_PATHS")
        .map(|value| !value.trim().is_empty())
        .unwrap_or(false);
    if skip_defaults {
        return None;
    }

    os_specific_chrome_paths()
        .into_iter()
        .find(|candidate| candidate.exists())
}

fn chrome_executable_names() -> &'static [&'static str] {
    #[cfg(target_os = "windows")]
    {
        &["chrome.exe", "chromium.exe", "msedge.exe"]
    }

    #[cfg(not(target_os = "windows"))]
    {
        &[
            "google-chrome-stable",
            "google-chrome",
            "chromium",
            "chromium-browser",
        ]
    }
}

fn os_specific_chrome_paths() -> Vec<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        ["PROGRAMFILES", "PROGRAMFILES(X86)", "LOCALAPPDATA"]
            .iter()
            .filter_map(|key| env::var(key).ok())
            .filter(|root| !root.trim().is_empty())
            .flat_map(|root| {
                let root = PathBuf::from(root.trim());
                [
                    root.join("Google/Chrome/Application/chrome.exe"),
                    root.join("Chromium/Application/chrome.exe"),
                    root.join("Microsoft/Edge/Application/msedge.exe"),
                ]
            })
            .collect()
    }

    #[cfg(target_os = "macos")]
    {
        vec![
            PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
            PathBuf::from("/Applications/Chromium.app/Contents/MacOS/Chromium"),
        ]
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        vec![
            PathBuf::from("/usr/bin/google-chrome-stable"),
            PathBuf::from("/usr/bin/google-chrome"),
            PathBuf::from("/usr/bin/chromium-browser"),
            PathBuf::from("/usr/bin/chromium"),
            PathBuf::from("/snap/bin/chromium"),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::config::resolve_headless_default;
    use super::{chrome_executable_names, detect_chrome_executable};
    use serial_test::serial;
    use std::{env, fs};
    use tempfile::tempdir;

    struct EnvGuard(Vec<(&'static str, Option<String>)>);

    impl EnvGuard {
        fn set(vars: &[(&'static str, &str)]) -> Self {
            let saved = vars
                .iter()
                .map(|(key, value)| {
                    let previous = env::var(key).ok();
                    env::set_var(key, value);
                    (*key, previous)
                })
                .collect();
            Self(saved)
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, previous) in self.0.drain(..) {
                match previous {
                    Some(value) => env::set_var(key, value),
                    None => env::remove_var(key),
                }
            }
        }
    }

    #[test]
    #[serial(chrome_env)]
    fn detects_from_env_var() {
        let dir = tempdir().unwrap();
        let exe_path = dir.path().join("my-chrome");
        fs::write(&exe_path, b"").unwrap();
        let _guard = EnvGuard::set(&[("FLOWPROBE_CHROME", &exe_path.to_string_lossy())]);

        assert_eq!(detect_chrome_executable(), Some(exe_path));
    }

    #[test]
    #[serial(chrome_env)]
    fn detects_from_path_entries() {
        let dir = tempdir().unwrap();
        let name = chrome_executable_names()[0];
        let exe_path = dir.path().join(name);
        fs::write(&exe_path, b"").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&exe_path, fs::Permissions::from_mode(0o755)).unwrap();
        }
        let path = dir.path().to_string_lossy().to_string();
        let _guard = EnvGuard::set(&[
            ("FLOWPROBE_CHROME", ""),
            ("FLOWPROBE_SKIP_OS_PATHS", "1"),
            ("PATH", &path),
        ]);

        assert_eq!(detect_chrome_executable(), Some(exe_path));
    }

    #[test]
    #[serial(chrome_env)]
    fn skip_os_paths_stops_discovery_after_path_lookup() {
        let dir = tempdir().unwrap();
        let path = dir.path().to_string_lossy().to_string();
        let _guard = EnvGuard::set(&[
            ("FLOWPROBE_CHROME", ""),
            ("FLOWPROBE_SKIP_OS_PATHS", "yes"),
            ("PATH", &path),
        ]);

        assert_eq!(detect_chrome_executable(), None);
    }

    #[test]
    #[serial(chrome_env)]
    fn headless_env_switch() {
        {
            let _guard = EnvGuard::set(&[("FLOWPROBE_HEADLESS", "off")]);
            assert!(!resolve_headless_default());
        }
        {
            let _guard = EnvGuard::set(&[("FLOWPROBE_HEADLESS", "1")]);
            assert!(resolve_headless_default());
        }
    }
}

pub mod adapter {
    use super::commands::{ElementInfo, ElementRef, Locator, WaitGate};
    use super::config::CdpConfig;
    use super::detect_chrome_executable;
    use super::error::{AdapterError, AdapterErrorKind};
    use super::events::{RawEvent, SourceLocation};
    use super::ids::{BrowserId, PageId};
    use super::metrics::{AdapterMetrics, AdapterMetricsSnapshot};
    use super::registry::Registry;
    use super::script::{locator_expression, parse_status, LocatorAction, LocatorStatus};
    use super::transport::{CdpTransport, ChromiumTransport, CommandTarget, TransportEvent};
    use async_trait::async_trait;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use dashmap::DashMap;
    use network_tap_light::{
        config::TapConfig, NetworkTapLight, PageId as TapPageId, TapEvent as NetworkTapEvent,
    };
    use serde::Deserialize;
    use serde_json::{json, Map, Value};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tokio::sync::broadcast;
    use tokio::sync::Mutex;
    use tokio::task::JoinHandle;
    use tokio::time::sleep;
    use tokio::{select, spawn};
    use tokio_util::sync::CancellationToken;
    use tracing::{debug, info, warn};

    /// Shared event bus type alias used by the adapter.
    pub type EventBus = broadcast::Sender<RawEvent>;

    const POLL_INTERVAL: Duration = Duration::from_millis(100);

    /// Page interaction surface used by drivers.
    ///
    /// Element arguments are locators, resolved against the live DOM on every call.
    #[async_trait]
    pub trait Cdp: Send + Sync {
        async fn navigate(&self, page: PageId, url: &str, deadline: Duration)
            -> Result<(), AdapterError>;
        async fn wait_basic(
            &self,
            page: PageId,
            gate: WaitGate,
            timeout: Duration,
        ) -> Result<(), AdapterError>;
        async fn screenshot(
            &self,
            page: PageId,
            full_page: bool,
            deadline: Duration,
        ) -> Result<Vec<u8>, AdapterError>;
        async fn evaluate_script(&self, page: PageId, expression: &str)
            -> Result<Value, AdapterError>;
        /// Every match of `locator`, in document order.
        async fn query(&self, page: PageId, locator: &Locator)
            -> Result<Vec<ElementInfo>, AdapterError>;
        async fn count(&self, page: PageId, locator: &Locator) -> Result<usize, AdapterError>;
        /// `false` when nothing matches.
        async fn is_visible(&self, page: PageId, target: &ElementRef) -> Result<bool, AdapterError>;
        async fn click(
            &self,
            page: PageId,
            target: &ElementRef,
            deadline: Duration,
        ) -> Result<(), AdapterError>;
        async fn fill(
            &self,
            page: PageId,
            target: &ElementRef,
            text: &str,
            deadline: Duration,
        ) -> Result<(), AdapterError>;
        async fn inner_text(&self, page: PageId, target: &ElementRef)
            -> Result<String, AdapterError>;
    }

    /// Adapter implementation with pluggable transport.
    pub struct CdpAdapter {
        pub browser_id: BrowserId,
        pub cfg: CdpConfig,
        pub bus: EventBus,
        pub registry: Arc<Registry>,
        metrics: AdapterMetrics,
        shutdown: CancellationToken,
        tasks: Mutex<Vec<JoinHandle<()>>>,
        transport: Arc<dyn CdpTransport>,
        network_tap: Arc<NetworkTapLight>,
        load_events: DashMap<PageId, u64>,
    }

    impl CdpAdapter {
        pub fn new(mut cfg: CdpConfig, bus: EventBus) -> Self {
            if cfg.websocket_url.is_none() && cfg.executable.as_os_str().is_empty() {
                match detect_chrome_executable() {
                    Some(path) => cfg.executable = path,
                    None => warn!(
                        target: "cdp-adapter",
                        "Chrome executable not found; set FLOWPROBE_CHROME or pass --chrome-path"
                    ),
                }
            }
            let transport = Arc::new(ChromiumTransport::new(cfg.clone()));
            Self::with_transport(cfg, bus, transport)
        }

        pub fn with_transport(
            cfg: CdpConfig,
            bus: EventBus,
            transport: Arc<dyn CdpTransport>,
        ) -> Self {
            let network_tap = Arc::new(NetworkTapLight::with_config(TapConfig {
                idle_window_ms: cfg.idle_window_ms,
            }));
            Self {
                browser_id: BrowserId::new(),
                cfg,
                bus,
                registry: Arc::new(Registry::new()),
                metrics: AdapterMetrics::default(),
                shutdown: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
                transport,
                network_tap,
                load_events: DashMap::new(),
            }
        }

        pub fn metrics(&self) -> AdapterMetricsSnapshot {
            self.metrics.snapshot()
        }

        pub async fn start(self: Arc<Self>) -> Result<(), AdapterError> {
            {
                let guard = self.tasks.lock().await;
                if !guard.is_empty() {
                    return Ok(());
                }
            }

            self.transport.start().await?;
            let loop_task = spawn(Self::event_loop(Arc::clone(&self)));
            self.tasks.lock().await.push(loop_task);
            info!(target: "cdp-adapter", browser = %self.browser_id.0, "adapter started");
            Ok(())
        }

        pub async fn shutdown(&self) {
            if self.cfg.websocket_url.is_some() {
                for (page, _) in self.registry.pages() {
                    if let Err(err) = self.close_page(page).await {
                        debug!(target: "cdp-adapter", %err, "failed to close page");
                    }
                }
            }

            self.shutdown.cancel();
            let mut handles = self.tasks.lock().await;
            while let Some(handle) = handles.pop() {
                let _ = handle.await;
            }
            drop(handles);

            self.transport.shutdown().await;
            let metrics = self.metrics.snapshot();
            debug!(
                target: "cdp-adapter",
                commands = metrics.commands,
                failures = metrics.command_failures,
                events = metrics.events,
                mean_latency = ?metrics.mean_latency(),
                "adapter shut down"
            );
        }

        /// Open a new tab on `url`, attach a flattened session and enable the event domains.
        pub async fn create_page(&self, url: &str) -> Result<PageId, AdapterError> {
            let created = self
                .send_command("Target.createTarget", json!({ "url": url }))
                .await?;
            let target_id = created
                .get("targetId")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    AdapterError::new(AdapterErrorKind::Internal)
                        .with_hint("Target.createTarget returned no targetId")
                })?
                .to_string();

            let attached = self
                .send_command(
                    "Target.attachToTarget",
                    json!({ "targetId": target_id, "flatten": true }),
                )
                .await?;
            let session = attached
                .get("sessionId")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    AdapterError::new(AdapterErrorKind::Internal)
                        .with_hint("Target.attachToTarget returned no sessionId")
                })?
                .to_string();

            let page = PageId::new();
            self.registry
                .insert_page(page, target_id.clone(), session.clone());
            self.network_tap
                .enable(Self::tap_page_id(page))
                .await
                .map_err(|err| {
                    AdapterError::new(AdapterErrorKind::Internal).with_hint(err.to_string())
                })?;

            for method in ["Page.enable", "Runtime.enable", "Network.enable", "Log.enable"] {
                self.send_page_command(page, method, json!({})).await?;
            }

            info!(target: "cdp-adapter", page = %page.0, target = %target_id, "page attached");
            Ok(page)
        }

        pub async fn close_page(&self, page: PageId) -> Result<(), AdapterError> {
            let Some(ctx) = self.registry.remove_page(&page) else {
                return Ok(());
            };
            let _ = self.network_tap.disable(Self::tap_page_id(page)).await;
            self.load_events.remove(&page);
            self.send_command("Target.closeTarget", json!({ "targetId": ctx.target_id }))
                .await
                .map(|_| ())
        }

        fn tap_page_id(page: PageId) -> TapPageId {
            TapPageId(page.0)
        }

        async fn tap_ingest(&self, page: PageId, event: NetworkTapEvent) {
            if let Err(err) = self
                .network_tap
                .ingest(Self::tap_page_id(page), event)
                .await
            {
                debug!(target: "cdp-adapter", %err, "network tap ingest skipped");
            }
        }

        fn load_generation(&self, page: PageId) -> u64 {
            self.load_events
                .get(&page)
                .map(|entry| *entry.value())
                .unwrap_or(0)
        }

        async fn event_loop(self: Arc<Self>) {
            debug!(target: "cdp-adapter", "event loop entered");
            loop {
                select! {
                    _ = self.shutdown.cancelled() => {
                        break;
                    }
                    event = self.transport.next_event() => {
                        match event {
                            Some(ev) => self.handle_event(ev).await,
                            None => {
                                if !self.shutdown.is_cancelled() {
                                    warn!(target: "cdp-adapter", "transport stream ended");
                                    let _ = self.bus.send(RawEvent::Error {
                                        page: None,
                                        message: "cdp transport closed".to_string(),
                                    });
                                }
                                break;
                            }
                        }
                    }
                }
            }
            debug!(target: "cdp-adapter", "event loop exiting");
        }

        async fn handle_event(&self, event: TransportEvent) {
            let method = event.method.clone();
            if let Err(err) = self.process_event(event).await {
                let _ = self.bus.send(RawEvent::Error {
                    page: None,
                    message: format!("cdp event handling error ({method}): {err}"),
                });
            }
        }

        async fn process_event(&self, event: TransportEvent) -> Result<(), AdapterError> {
            self.metrics.record_event();
            if event.method == "Target.detachedFromTarget" {
                return self.on_target_detached(event.params).await;
            }

            let Some(page) = event
                .session_id
                .as_deref()
                .and_then(|sid| self.registry.page_for_session(sid))
            else {
                debug!(target: "cdp-adapter", method = %event.method, "event without page session");
                return Ok(());
            };

            match event.method.as_str() {
                "Page.loadEventFired" => {
                    *self.load_events.entry(page).or_insert(0) += 1;
                }
                "Network.requestWillBeSent" => self.on_network_request(page, event.params).await?,
                "Network.responseReceived" => {
                    self.on_network_response(page, event.params).await?
                }
                "Network.loadingFinished" => {
                    let payload: LoadingParams = decode(event.params)?;
                    self.tap_ingest(
                        page,
                        NetworkTapEvent::LoadingFinished {
                            request_id: payload.request_id,
                        },
                    )
                    .await;
                }
                "Network.loadingFailed" => {
                    let payload: LoadingParams = decode(event.params)?;
                    self.tap_ingest(
                        page,
                        NetworkTapEvent::LoadingFailed {
                            request_id: payload.request_id,
                        },
                    )
                    .await;
                }
                "Runtime.consoleAPICalled" => self.on_console_api(page, event.params)?,
                "Log.entryAdded" => self.on_log_entry(page, event.params)?,
                "Runtime.exceptionThrown" => self.on_exception_thrown(page, event.params)?,
                "Inspector.targetCrashed" => {
                    let _ = self.bus.send(RawEvent::Error {
                        page: Some(page),
                        message: "page crashed".to_string(),
                    });
                }
                _ => {
                    debug!(target: "cdp-adapter", method = %event.method, "unhandled cdp event");
                }
            }
            Ok(())
        }

        async fn on_target_detached(&self, params: Value) -> Result<(), AdapterError> {
            let payload: DetachedParams = decode(params)?;
            let Some(page) = self.registry.page_for_session(&payload.session_id) else {
                return Ok(());
            };
            self.registry.remove_page(&page);
            let _ = self.network_tap.disable(Self::tap_page_id(page)).await;
            if !self.shutdown.is_cancelled() {
                let _ = self.bus.send(RawEvent::Error {
                    page: Some(page),
                    message: "page session detached".to_string(),
                });
            }
            Ok(())
        }

        async fn on_network_request(&self, page: PageId, params: Value) -> Result<(), AdapterError> {
            let payload: RequestWillBeSentParams = decode(params)?;
            self.tap_ingest(
                page,
                NetworkTapEvent::RequestWillBeSent {
                    request_id: payload.request_id.clone(),
                },
            )
            .await;

            if let Some(redirect) = payload.redirect_response {
                let _ = self.bus.send(RawEvent::Response {
                    page,
                    request_id: payload.request_id.clone(),
                    url: redirect.url,
                    status: redirect.status,
                });
            }

            let headers = payload
                .request
                .headers
                .into_iter()
                .map(|(name, value)| {
                    let value = match value {
                        Value::String(text) => text,
                        other => other.to_string(),
                    };
                    (name.to_ascii_lowercase(), value)
                })
                .collect::<BTreeMap<_, _>>();

            let _ = self.bus.send(RawEvent::Request {
                page,
                request_id: payload.request_id,
                method: payload.request.method,
                url: payload.request.url,
                headers,
            });
            Ok(())
        }

        async fn on_network_response(
            &self,
            page: PageId,
            params: Value,
        ) -> Result<(), AdapterError> {
            let payload: ResponseReceivedParams = decode(params)?;
            self.tap_ingest(
                page,
                NetworkTapEvent::ResponseReceived {
                    request_id: payload.request_id.clone(),
                    status: payload.response.status,
                },
            )
            .await;

            let _ = self.bus.send(RawEvent::Response {
                page,
                request_id: payload.request_id,
                url: payload.response.url,
                status: payload.response.status,
            });
            Ok(())
        }

        fn on_console_api(&self, page: PageId, params: Value) -> Result<(), AdapterError> {
            let payload: ConsoleApiParams = decode(params)?;
            let text = payload
                .args
                .iter()
                .map(RemoteObject::preview)
                .collect::<Vec<_>>()
                .join(" ");
            let location = payload
                .stack_trace
                .and_then(|trace| trace.call_frames.into_iter().next())
                .map(|frame| SourceLocation {
                    url: frame.url,
                    line: Some(frame.line_number),
                    column: Some(frame.column_number),
                });

            let _ = self.bus.send(RawEvent::Console {
                page,
                kind: payload.kind,
                text,
                location,
            });
            Ok(())
        }

        fn on_log_entry(&self, page: PageId, params: Value) -> Result<(), AdapterError> {
            let payload: LogEntryParams = decode(params)?;
            let entry = payload.entry;
            // Console API calls already arrive through Runtime.consoleAPICalled.
            if entry.source.as_deref() == Some("console-api") {
                return Ok(());
            }
            let kind = match entry.level.as_str() {
                "verbose" => "debug".to_string(),
                other => other.to_string(),
            };
            let location = entry.url.map(|url| SourceLocation {
                url,
                line: entry.line_number,
                column: None,
            });

            let _ = self.bus.send(RawEvent::Console {
                page,
                kind,
                text: entry.text,
                location,
            });
            Ok(())
        }

        fn on_exception_thrown(&self, page: PageId, params: Value) -> Result<(), AdapterError> {
            let payload: ExceptionThrownParams = decode(params)?;
            let details = payload.exception_details;
            let message = details
                .exception
                .and_then(|ex| ex.description)
                .or(details.text)
                .unwrap_or_else(|| "runtime exception".to_string());

            let _ = self.bus.send(RawEvent::PageError { page, message });
            Ok(())
        }

        async fn wait_for_load_event(
            &self,
            page: PageId,
            seen: u64,
            deadline: Instant,
        ) -> Result<(), AdapterError> {
            loop {
                if self.load_generation(page) > seen {
                    return Ok(());
                }
                if Instant::now() >= deadline {
                    return Err(AdapterError::new(AdapterErrorKind::NavTimeout)
                        .with_hint("timed out waiting for the load event")
                        .retriable(true));
                }
                sleep(Duration::from_millis(50)).await;
            }
        }

        async fn wait_for_dom_ready(
            &self,
            page: PageId,
            deadline: Instant,
        ) -> Result<(), AdapterError> {
            loop {
                let state = self.evaluate_script(page, "document.readyState").await?;
                if matches!(state.as_str(), Some("interactive" | "complete")) {
                    return Ok(());
                }
                if Instant::now() >= deadline {
                    return Err(AdapterError::new(AdapterErrorKind::NavTimeout)
                        .with_hint(format!("document still {state} at deadline")));
                }
                sleep(POLL_INTERVAL).await;
            }
        }

        async fn wait_for_network_idle(
            &self,
            page: PageId,
            idle_ms: u64,
            deadline: Instant,
        ) -> Result<(), AdapterError> {
            let window = Duration::from_millis(idle_ms);
            loop {
                let idle = self
                    .network_tap
                    .is_idle(Self::tap_page_id(page), window)
                    .await
                    .map_err(|err| {
                        AdapterError::new(AdapterErrorKind::Internal).with_hint(err.to_string())
                    })?;
                if idle {
                    return Ok(());
                }
                if Instant::now() >= deadline {
                    let inflight = self
                        .network_tap
                        .current_snapshot(Self::tap_page_id(page))
                        .await
                        .map(|snapshot| snapshot.inflight)
                        .unwrap_or(0);
                    return Err(AdapterError::new(AdapterErrorKind::NavTimeout)
                        .with_hint("wait_basic NetworkIdle timed out")
                        .with_data(json!({ "inflight": inflight })));
                }
                sleep(Duration::from_millis(50)).await;
            }
        }

        async fn send_command(&self, method: &str, params: Value) -> Result<Value, AdapterError> {
            self.dispatch(CommandTarget::Browser, method, params).await
        }

        async fn send_page_command(
            &self,
            page: PageId,
            method: &str,
            params: Value,
        ) -> Result<Value, AdapterError> {
            let session = self.registry.get_cdp_session(&page).ok_or_else(|| {
                AdapterError::new(AdapterErrorKind::Internal)
                    .with_hint(format!("missing cdp session for page {}", page.0))
            })?;
            self.dispatch(CommandTarget::Session(session), method, params)
                .await
        }

        async fn dispatch(
            &self,
            target: CommandTarget,
            method: &str,
            params: Value,
        ) -> Result<Value, AdapterError> {
            let start = Instant::now();
            self.metrics.record_command();
            match self.transport.send_command(target, method, params).await {
                Ok(value) => {
                    self.metrics.record_command_success(start.elapsed());
                    Ok(value)
                }
                Err(err) => {
                    self.metrics.record_command_failure();
                    debug!(target: "cdp-adapter", method, %err, "cdp command failed");
                    Err(err)
                }
            }
        }

        async fn run_locator(
            &self,
            page: PageId,
            locator: &Locator,
            index: usize,
            action: LocatorAction,
        ) -> Result<LocatorStatus, AdapterError> {
            let expression = locator_expression(locator, index, action)?;
            let value = self.evaluate_script(page, &expression).await?;
            parse_status(&value)
        }

        /// Poll `action` until the element resolves or the deadline passes.
        async fn resolve_until(
            &self,
            page: PageId,
            target: &ElementRef,
            action: LocatorAction,
            deadline: Duration,
        ) -> Result<Value, AdapterError> {
            let deadline_at = Instant::now() + deadline;
            loop {
                let status = self
                    .run_locator(page, &target.locator, target.index, action)
                    .await?;
                match status {
                    LocatorStatus::Ok(value) => return Ok(value),
                    other if Instant::now() >= deadline_at => {
                        return Err(unresolved(target, &other));
                    }
                    _ => sleep(POLL_INTERVAL).await,
                }
            }
        }

        async fn mouse_click(&self, page: PageId, x: f64, y: f64) -> Result<(), AdapterError> {
            for kind in ["mousePressed", "mouseReleased"] {
                self.send_page_command(
                    page,
                    "Input.dispatchMouseEvent",
                    json!({
                        "type": kind,
                        "x": x,
                        "y": y,
                        "button": "left",
                        "buttons": 1,
                        "clickCount": 1,
                        "pointerType": "mouse",
                    }),
                )
                .await?;
            }
            Ok(())
        }
    }

    fn unresolved(target: &ElementRef, status: &LocatorStatus) -> AdapterError {
        let reason = match status {
            LocatorStatus::NotFound { count } => {
                format!("{count} element(s) match, index {} requested", target.index)
            }
            LocatorStatus::Hidden => "element is not visible".to_string(),
            LocatorStatus::Disabled => "element is disabled".to_string(),
            LocatorStatus::Ok(_) => "element resolved".to_string(),
        };
        AdapterError::new(AdapterErrorKind::TargetNotFound)
            .with_hint(format!("{}: {reason}", target.locator))
    }

    fn decode<T: for<'de> Deserialize<'de>>(params: Value) -> Result<T, AdapterError> {
        serde_json::from_value(params)
            .map_err(|err| AdapterError::new(AdapterErrorKind::Internal).with_hint(err.to_string()))
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct RequestWillBeSentParams {
        request_id: String,
        request: RequestPayload,
        /// Set when this request follows a redirect; it is the response of the previous hop.
        #[serde(default)]
        redirect_response: Option<ResponsePayload>,
    }

    #[derive(Debug, Deserialize)]
    struct RequestPayload {
        url: String,
        method: String,
        #[serde(default)]
        headers: Map<String, Value>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct ResponseReceivedParams {
        request_id: String,
        response: ResponsePayload,
    }

    #[derive(Debug, Deserialize)]
    struct ResponsePayload {
        url: String,
        status: i64,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct LoadingParams {
        request_id: String,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct DetachedParams {
        session_id: String,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct ConsoleApiParams {
        #[serde(rename = "type")]
        kind: String,
        #[serde(default)]
        args: Vec<RemoteObject>,
        stack_trace: Option<StackTrace>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct RemoteObject {
        #[serde(rename = "type")]
        kind: String,
        subtype: Option<String>,
        value: Option<Value>,
        unserializable_value: Option<String>,
        description: Option<String>,
    }

    impl RemoteObject {
        fn preview(&self) -> String {
            match &self.value {
                Some(Value::String(text)) => return text.clone(),
                Some(other) => return other.to_string(),
                None => {}
            }
            if let Some(raw) = &self.unserializable_value {
                return raw.clone();
            }
            if self.subtype.as_deref() == Some("null") {
                return "null".to_string();
            }
            self.description.clone().unwrap_or_else(|| self.kind.clone())
        }
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct StackTrace {
        #[serde(default)]
        call_frames: Vec<CallFrame>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct CallFrame {
        url: String,
        line_number: u64,
        column_number: u64,
    }

    #[derive(Debug, Deserialize)]
    struct LogEntryParams {
        entry: LogEntry,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct LogEntry {
        level: String,
        text: String,
        source: Option<String>,
        url: Option<String>,
        line_number: Option<u64>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct ExceptionThrownParams {
        exception_details: ExceptionDetails,
    }

    #[derive(Debug, Deserialize)]
    struct ExceptionDetails {
        text: Option<String>,
        exception: Option<RemoteObject>,
    }

    #[async_trait]
    impl Cdp for CdpAdapter {
        async fn navigate(
            &self,
            page: PageId,
            url: &str,
            deadline: Duration,
        ) -> Result<(), AdapterError> {
            let deadline_at = Instant::now() + deadline;
            let seen = self.load_generation(page);
            let response = self
                .send_page_command(page, "Page.navigate", json!({ "url": url }))
                .await?;

            if let Some(error_text) = response
                .get("errorText")
                .and_then(Value::as_str)
                .filter(|text| !text.is_empty())
            {
                return Err(AdapterError::new(AdapterErrorKind::NavFailed)
                    .with_hint(format!("{error_text} at {url}"))
                    .with_data(json!({ "url": url, "errorText": error_text })));
            }

            // Same-document navigations carry no loader and fire no load event.
            if response.get("loaderId").and_then(Value::as_str).is_some() {
                self.wait_for_load_event(page, seen, deadline_at).await?;
            }
            self.wait_for_dom_ready(page, deadline_at).await
        }

        async fn wait_basic(
            &self,
            page: PageId,
            gate: WaitGate,
            timeout: Duration,
        ) -> Result<(), AdapterError> {
            let deadline = Instant::now() + timeout;
            match gate {
                WaitGate::DomReady => self.wait_for_dom_ready(page, deadline).await,
                WaitGate::NetworkIdle { idle_ms } => {
                    self.wait_for_network_idle(page, idle_ms, deadline).await
                }
            }
        }

        async fn screenshot(
            &self,
            page: PageId,
            full_page: bool,
            deadline: Duration,
        ) -> Result<Vec<u8>, AdapterError> {
            let capture = async {
                let mut params = json!({ "format": "png" });
                if full_page {
                    let layout = self
                        .send_page_command(page, "Page.getLayoutMetrics", json!({}))
                        .await?;
                    let size = layout
                        .get("cssContentSize")
                        .or_else(|| layout.get("contentSize"));
                    let dimension = |key: &str| {
                        size.and_then(|s| s.get(key))
                            .and_then(Value::as_f64)
                            .map(f64::ceil)
                            .unwrap_or(0.0)
                    };
                    let (width, height) = (dimension("width"), dimension("height"));
                    if width > 0.0 && height > 0.0 {
                        params = json!({
                            "format": "png",
                            "captureBeyondViewport": true,
                            "clip": { "x": 0, "y": 0, "width": width, "height": height, "scale": 1 },
                        });
                    }
                }

                let response = self
                    .send_page_command(page, "Page.captureScreenshot", params)
                    .await?;
                let data = response
                    .get("data")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        AdapterError::new(AdapterErrorKind::Internal)
                            .with_hint("missing screenshot data")
                    })?;
                STANDARD.decode(data).map_err(|err| {
                    AdapterError::new(AdapterErrorKind::Internal).with_hint(err.to_string())
                })
            };

            tokio::time::timeout(deadline, capture)
                .await
                .map_err(|_| {
                    AdapterError::new(AdapterErrorKind::NavTimeout)
                        .with_hint("screenshot timed out")
                })?
        }

        async fn evaluate_script(
            &self,
            page: PageId,
            expression: &str,
        ) -> Result<Value, AdapterError> {
            let response = self
                .send_page_command(
                    page,
                    "Runtime.evaluate",
                    json!({
                        "expression": expression,
                        "awaitPromise": true,
                        "returnByValue": true,
                        "userGesture": true,
                    }),
                )
                .await?;

            if let Some(details) = response.get("exceptionDetails") {
                let description = details
                    .get("exception")
                    .and_then(|ex| ex.get("description"))
                    .or_else(|| details.get("text"))
                    .and_then(Value::as_str)
                    .unwrap_or("exception");
                return Err(AdapterError::new(AdapterErrorKind::Internal)
                    .with_hint(format!("evaluate_script raised: {description}"))
                    .with_data(details.clone()));
            }

            Ok(response
                .get("result")
                .and_then(|res| res.get("value"))
                .cloned()
                .unwrap_or(Value::Null))
        }

        async fn query(
            &self,
            page: PageId,
            locator: &Locator,
        ) -> Result<Vec<ElementInfo>, AdapterError> {
            match self
                .run_locator(page, locator, 0, LocatorAction::Describe)
                .await?
            {
                LocatorStatus::Ok(value) => decode(value),
                other => Err(AdapterError::new(AdapterErrorKind::Internal)
                    .with_hint(format!("query returned {other:?}"))),
            }
        }

        async fn count(&self, page: PageId, locator: &Locator) -> Result<usize, AdapterError> {
            match self.run_locator(page, locator, 0, LocatorAction::Count).await? {
                LocatorStatus::Ok(value) => Ok(value.as_u64().unwrap_or(0) as usize),
                other => Err(AdapterError::new(AdapterErrorKind::Internal)
                    .with_hint(format!("count returned {other:?}"))),
            }
        }

        async fn is_visible(&self, page: PageId, target: &ElementRef) -> Result<bool, AdapterError> {
            match self
                .run_locator(page, &target.locator, target.index, LocatorAction::Visible)
                .await?
            {
                LocatorStatus::Ok(value) => Ok(value.as_bool().unwrap_or(false)),
                _ => Ok(false),
            }
        }

        async fn click(
            &self,
            page: PageId,
            target: &ElementRef,
            deadline: Duration,
        ) -> Result<(), AdapterError> {
            let point = self
                .resolve_until(page, target, LocatorAction::Point, deadline)
                .await?;
            let coordinate = |key: &str| {
                point.get(key).and_then(Value::as_f64).ok_or_else(|| {
                    AdapterError::new(AdapterErrorKind::Internal)
                        .with_hint(format!("click point missing {key}"))
                })
            };
            let (x, y) = (coordinate("x")?, coordinate("y")?);
            debug!(target: "cdp-adapter", locator = %target.locator, x, y, "click");
            self.mouse_click(page, x, y).await
        }

        async fn fill(
            &self,
            page: PageId,
            target: &ElementRef,
            text: &str,
            deadline: Duration,
        ) -> Result<(), AdapterError> {
            self.resolve_until(page, target, LocatorAction::Focus, deadline)
                .await?;
            if text.is_empty() {
                self.evaluate_script(page, "document.execCommand('delete')")
                    .await?;
                return Ok(());
            }
            self.send_page_command(page, "Input.insertText", json!({ "text": text }))
                .await
                .map(|_| ())
        }

        async fn inner_text(
            &self,
            page: PageId,
            target: &ElementRef,
        ) -> Result<String, AdapterError> {
            match self
                .run_locator(page, &target.locator, target.index, LocatorAction::Text)
                .await?
            {
                LocatorStatus::Ok(value) => Ok(value.as_str().unwrap_or_default().to_string()),
                other => Err(unresolved(target, &other)),
            }
        }
    }

}

pub mod commands;
pub mod metrics;
pub mod registry;
mod script;
pub mod transport;
pub mod util;

pub use adapter::{Cdp, CdpAdapter, EventBus};
pub use commands::*;
pub use config::CdpConfig;
pub use error::{AdapterError, AdapterErrorKind};
pub use events::{RawEvent, SourceLocation};
pub use ids::{BrowserId, PageId};
pub use metrics::AdapterMetricsSnapshot;
pub use transport::{CdpTransport, CommandTarget, NoopTransport, TransportEvent};

/// Create an event bus suitable for hooking into the adapter.
pub fn event_bus(buffer: usize) -> (EventBus, broadcast::Receiver<RawEvent>) {
    let bus = broadcast::channel(buffer);
    (bus.0, bus.1)
}
