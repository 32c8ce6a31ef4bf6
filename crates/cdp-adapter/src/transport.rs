//! Raw CDP plumbing.
//!
//! The adapter only needs three things from a browser connection: a way to send a command
//! (browser-level or into a flattened target session), a stream of events, and a way to tear
//! everything down. [`ChromiumTransport`] provides them on top of chromiumoxide's low-level
//! `Connection`, launching a throwaway Chromium unless a DevTools websocket is configured.

use std::collections::HashMap;
use std::convert::TryInto;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::async_process::Child;
use chromiumoxide::browser::BrowserConfig;
use chromiumoxide::cdp::browser_protocol::target::SessionId as CdpSessionId;
use chromiumoxide::cdp::events::CdpEventMessage;
use chromiumoxide::conn::Connection;
use chromiumoxide::error::CdpError;
use chromiumoxide_types::{CallId, CdpJsonEventMessage, Message, MethodId, Response};
use futures::{future::BoxFuture, StreamExt};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::CdpConfig;
use crate::error::{AdapterError, AdapterErrorKind};
use crate::util::extract_ws_url;

const CALL_QUEUE: usize = 128;
const EVENT_QUEUE: usize = 1024;
const CLOSE_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct TransportEvent {
    pub method: String,
    pub params: Value,
    pub session_id: Option<String>,
}

#[derive(Clone, Debug)]
pub enum CommandTarget {
    Browser,
    Session(String),
}

#[async_trait]
pub trait CdpTransport: Send + Sync {
    async fn start(&self) -> Result<(), AdapterError>;
    /// `None` once the connection is gone.
    async fn next_event(&self) -> Option<TransportEvent>;
    async fn send_command(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, AdapterError>;

    /// Release the browser connection. Launched browsers are closed as well.
    async fn shutdown(&self) {}
}

/// Transport that never connects. Every command fails.
#[derive(Default)]
pub struct NoopTransport;

#[async_trait]
impl CdpTransport for NoopTransport {
    async fn start(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        None
    }

    async fn send_command(
        &self,
        _target: CommandTarget,
        method: &str,
        _params: Value,
    ) -> Result<Value, AdapterError> {
        Err(AdapterError::new(AdapterErrorKind::Internal)
            .with_hint(format!("no browser connection for {method}")))
    }
}

type Connector =
    Arc<dyn Fn(CdpConfig) -> BoxFuture<'static, Result<Link, AdapterError>> + Send + Sync>;

enum LinkState {
    Idle,
    Open(Arc<Link>),
    /// Shut down, or the connection dropped. Never reopened.
    Closed,
}

/// A single Chromium connection for the lifetime of one probe run.
pub struct ChromiumTransport {
    cfg: CdpConfig,
    state: Mutex<LinkState>,
    connect: Connector,
}

impl ChromiumTransport {
    pub fn new(cfg: CdpConfig) -> Self {
        let connect: Connector = Arc::new(|cfg: CdpConfig| Box::pin(Link::open(cfg)));
        Self::with_connector(cfg, connect)
    }

    fn with_connector(cfg: CdpConfig, connect: Connector) -> Self {
        Self {
            cfg,
            state: Mutex::new(LinkState::Idle),
            connect,
        }
    }

    fn deadline(&self) -> Duration {
        Duration::from_millis(self.cfg.default_deadline_ms)
    }

    /// The open link, connecting on first use.
    async fn link(&self) -> Result<Arc<Link>, AdapterError> {
        let mut state = self.state.lock().await;
        match &*state {
            LinkState::Open(link) if link.is_open() => Ok(link.clone()),
            LinkState::Open(_) | LinkState::Closed => {
                *state = LinkState::Closed;
                Err(AdapterError::new(AdapterErrorKind::CdpIo)
                    .with_hint("browser connection is closed"))
            }
            LinkState::Idle => {
                let link = Arc::new((self.connect)(self.cfg.clone()).await?);
                *state = LinkState::Open(link.clone());
                Ok(link)
            }
        }
    }

    async fn current(&self) -> Option<Arc<Link>> {
        match &*self.state.lock().await {
            LinkState::Open(link) => Some(link.clone()),
            LinkState::Idle | LinkState::Closed => None,
        }
    }
}

#[async_trait]
impl CdpTransport for ChromiumTransport {
    async fn start(&self) -> Result<(), AdapterError> {
        let link = self.link().await?;
        let version = link
            .call(
                CommandTarget::Browser,
                "Browser.getVersion",
                json!({}),
                self.deadline(),
            )
            .await?;
        let product = version
            .get("product")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("unknown");
        info!(target: "cdp-transport", product, "browser ready");
        Ok(())
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        self.current().await?.next_event().await
    }

    async fn send_command(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, AdapterError> {
        let link = self.link().await?;
        link.call(target, method, params, self.deadline()).await
    }

    async fn shutdown(&self) {
        let previous = std::mem::replace(&mut *self.state.lock().await, LinkState::Closed);
        if let LinkState::Open(link) = previous {
            link.close().await;
        }
    }
}

type Reply = oneshot::Sender<Result<Value, AdapterError>>;

struct Call {
    target: CommandTarget,
    method: String,
    params: Value,
    reply: Reply,
}

struct Link {
    calls: mpsc::Sender<Call>,
    events: Mutex<mpsc::Receiver<TransportEvent>>,
    pump: JoinHandle<()>,
    open: Arc<AtomicBool>,
    browser: Mutex<Option<Child>>,
    // Declared after `browser` so the profile is removed once Chromium is gone.
    _profile: Option<TempDir>,
}

impl Link {
    async fn open(cfg: CdpConfig) -> Result<Self, AdapterError> {
        let (browser, ws_url, profile) = match cfg.websocket_url.clone() {
            Some(url) => (None, url, None),
            None => {
                let launched = launch(&cfg).await?;
                (Some(launched.child), launched.ws_url, launched.profile)
            }
        };

        let conn = Connection::<CdpEventMessage>::connect(&ws_url)
            .await
            .map_err(|err| AdapterError::new(AdapterErrorKind::CdpIo).with_hint(err.to_string()))?;
        info!(target: "cdp-transport", url = %ws_url, "devtools connection established");

        let (calls, call_rx) = mpsc::channel(CALL_QUEUE);
        let (event_tx, events) = mpsc::channel(EVENT_QUEUE);
        let open = Arc::new(AtomicBool::new(true));
        let flag = open.clone();
        let pump = tokio::spawn(async move {
            if let Err(err) = relay(conn, call_rx, event_tx).await {
                warn!(target: "cdp-transport", %err, "devtools connection failed");
            }
            flag.store(false, Ordering::Relaxed);
        });

        Ok(Self {
            calls,
            events: Mutex::new(events),
            pump,
            open,
            browser: Mutex::new(browser),
            _profile: profile,
        })
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    async fn call(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Value, AdapterError> {
        let (reply, answer) = oneshot::channel();
        self.calls
            .send(Call {
                target,
                method: method.to_string(),
                params,
                reply,
            })
            .await
            .map_err(|_| {
                AdapterError::new(AdapterErrorKind::CdpIo).with_hint("browser connection is closed")
            })?;

        match tokio::time::timeout(deadline, answer).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AdapterError::new(AdapterErrorKind::CdpIo)
                .with_hint(format!("connection dropped while waiting for {method}"))),
            Err(_) => Err(AdapterError::new(AdapterErrorKind::NavTimeout)
                .with_hint(format!("{method} timed out after {}ms", deadline.as_millis()))),
        }
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        self.events.lock().await.recv().await
    }

    async fn close(&self) {
        let mut browser = self.browser.lock().await.take();
        if browser.is_some() && self.is_open() {
            if let Err(err) = self
                .call(CommandTarget::Browser, "Browser.close", json!({}), CLOSE_GRACE)
                .await
            {
                debug!(target: "cdp-transport", %err, "Browser.close failed; killing process");
            }
        }
        self.open.store(false, Ordering::Relaxed);
        self.pump.abort();

        if let Some(child) = browser.as_mut() {
            if let Err(err) = child.kill().await {
                debug!(target: "cdp-transport", ?err, "chromium already exited");
            }
        }
        info!(target: "cdp-transport", "browser connection closed");
    }

    #[cfg(test)]
    fn detached() -> (Self, Arc<AtomicBool>) {
        let (calls, _) = mpsc::channel(1);
        let (_, events) = mpsc::channel(1);
        let open = Arc::new(AtomicBool::new(true));
        let link = Self {
            calls,
            events: Mutex::new(events),
            pump: tokio::spawn(futures::future::pending::<()>()),
            open: open.clone(),
            browser: Mutex::new(None),
            _profile: None,
        };
        (link, open)
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.pump.abort();
        let Ok(mut guard) = self.browser.try_lock() else {
            return;
        };
        let Some(mut child) = guard.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = child.kill().await {
                        warn!(target: "cdp-transport", ?err, "failed to kill chromium");
                    }
                });
            }
            Err(_) => debug!(target: "cdp-transport", "no runtime left to kill chromium"),
        }
    }
}

struct Launched {
    child: Child,
    ws_url: String,
    profile: Option<TempDir>,
}

async fn launch(cfg: &CdpConfig) -> Result<Launched, AdapterError> {
    let (profile_dir, profile) = profile_dir(cfg)?;
    let config = browser_config(cfg, profile_dir)?;
    let mut child = config.launch().map_err(|err| {
        AdapterError::new(AdapterErrorKind::CdpIo)
            .with_hint(format!("failed to launch chromium: {err}"))
    })?;

    match extract_ws_url(&mut child, Duration::from_millis(cfg.launch_timeout_ms)).await {
        Ok(ws_url) => Ok(Launched {
            child,
            ws_url,
            profile,
        }),
        Err(err) => {
            let _ = child.kill().await;
            Err(err)
        }
    }
}

/// A configured profile directory, or a fresh temporary one removed with the link.
fn profile_dir(cfg: &CdpConfig) -> Result<(PathBuf, Option<TempDir>), AdapterError> {
    if let Some(dir) = &cfg.user_data_dir {
        std::fs::create_dir_all(dir).map_err(|err| {
            AdapterError::new(AdapterErrorKind::Internal)
                .with_hint(format!("cannot create profile dir {}: {err}", dir.display()))
        })?;
        return Ok((dir.clone(), None));
    }

    let temp = tempfile::Builder::new()
        .prefix("flowprobe-profile-")
        .tempdir()
        .map_err(|err| {
            AdapterError::new(AdapterErrorKind::Internal)
                .with_hint(format!("cannot create temporary profile: {err}"))
        })?;
    Ok((temp.path().to_path_buf(), Some(temp)))
}

fn launch_args(headless: bool) -> Vec<&'static str> {
    let mut args = vec![
        "--disable-background-networking",
        "--disable-breakpad",
        "--disable-component-update",
        "--disable-default-apps",
        "--disable-dev-shm-usage",
        "--disable-extensions",
        "--disable-sync",
        "--no-first-run",
        "--no-default-browser-check",
        "--password-store=basic",
        "--remote-allow-origins=*",
    ];
    if headless {
        args.extend(["--headless=new", "--hide-scrollbars", "--mute-audio"]);
    }
    args
}

fn browser_config(cfg: &CdpConfig, profile_dir: PathBuf) -> Result<BrowserConfig, AdapterError> {
    let explicit = !cfg.executable.as_os_str().is_empty();
    if explicit && !cfg.executable.exists() {
        return Err(AdapterError::new(AdapterErrorKind::CdpIo)
            .with_hint(format!(
                "chrome executable not found at {}",
                cfg.executable.display()
            ))
            .with_data(json!({
                "expected": cfg.executable,
                "hint": "Set FLOWPROBE_CHROME to the full path of chrome/chromium."
            })));
    }

    let mut builder = BrowserConfig::builder()
        .request_timeout(Duration::from_millis(cfg.default_deadline_ms))
        .launch_timeout(Duration::from_millis(cfg.launch_timeout_ms))
        .args(launch_args(cfg.headless))
        .user_data_dir(profile_dir);
    if !cfg.headless {
        builder = builder.with_head();
    }
    if cfg.no_sandbox {
        builder = builder.no_sandbox();
    }
    if explicit {
        builder = builder.chrome_executable(cfg.executable.clone());
    }

    builder.build().map_err(|err| {
        AdapterError::new(AdapterErrorKind::Internal).with_hint(format!("browser config: {err}"))
    })
}

/// Moves calls onto the socket and routes replies and events back until either side closes.
async fn relay(
    mut conn: Connection<CdpEventMessage>,
    mut calls: mpsc::Receiver<Call>,
    events: mpsc::Sender<TransportEvent>,
) -> Result<(), AdapterError> {
    let mut pending: HashMap<CallId, Reply> = HashMap::new();

    let failure = loop {
        tokio::select! {
            Some(call) = calls.recv() => {
                let session = match call.target {
                    CommandTarget::Browser => None,
                    CommandTarget::Session(id) => Some(CdpSessionId::from(id)),
                };
                let method: MethodId = call.method.clone().into();
                match conn.submit_command(method, session, call.params) {
                    Ok(id) => {
                        pending.insert(id, call.reply);
                    }
                    Err(err) => {
                        let _ = call.reply.send(Err(AdapterError::new(AdapterErrorKind::CdpIo)
                            .with_hint(format!("cannot encode {}: {err}", call.method))));
                    }
                }
            }
            message = conn.next() => match message {
                Some(Ok(Message::Response(resp))) => {
                    if let Some(reply) = pending.remove(&resp.id) {
                        let _ = reply.send(payload(resp));
                    }
                }
                Some(Ok(Message::Event(event))) => forward(event, &events).await,
                Some(Err(err)) => break Some(classify(err)),
                None => break None,
            },
        }
    };

    let closed = failure
        .clone()
        .unwrap_or_else(|| AdapterError::new(AdapterErrorKind::CdpIo).with_hint("cdp connection closed"));
    for (_, reply) in pending.drain() {
        let _ = reply.send(Err(closed.clone()));
    }
    failure.map_or(Ok(()), Err)
}

async fn forward(event: CdpEventMessage, events: &mpsc::Sender<TransportEvent>) {
    let raw: Result<CdpJsonEventMessage, _> = event.try_into();
    match raw {
        Ok(raw) => {
            let event = TransportEvent {
                method: raw.method.into_owned(),
                params: raw.params,
                session_id: raw.session_id,
            };
            if events.send(event).await.is_err() {
                debug!(target: "cdp-transport", "event receiver gone");
            }
        }
        Err(err) => warn!(target: "cdp-transport", %err, "undecodable cdp event"),
    }
}

fn payload(resp: Response) -> Result<Value, AdapterError> {
    match (resp.result, resp.error) {
        (Some(result), _) => Ok(result),
        (None, Some(error)) => Err(AdapterError::new(AdapterErrorKind::CdpIo)
            .with_hint(format!("cdp error {}: {}", error.code, error.message))),
        (None, None) => {
            Err(AdapterError::new(AdapterErrorKind::Internal).with_hint("empty cdp response"))
        }
    }
}

fn classify(err: CdpError) -> AdapterError {
    let hint = err.to_string();
    match err {
        CdpError::Timeout => AdapterError::new(AdapterErrorKind::NavTimeout)
            .with_hint(hint)
            .retriable(true),
        CdpError::Serde(_) => AdapterError::new(AdapterErrorKind::Internal).with_hint(hint),
        _ => AdapterError::new(AdapterErrorKind::CdpIo)
            .with_hint(hint)
            .retriable(true),
    }
}
