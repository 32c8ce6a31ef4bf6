//! Network tap (light) used for network-idle detection.
//!
//! The tap keeps per-page counters fed from CDP network events. It answers one question for
//! the driver: has the page stopped talking to the network long enough to be called idle?

pub mod config;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::TapConfig;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::trace;
use uuid::Uuid;

/// Identifier representing a page for which the tap is collecting data.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PageId(pub Uuid);

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

/// Point-in-time view of a page's network counters.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    pub req: u64,
    pub res2xx: u64,
    pub res4xx: u64,
    pub res5xx: u64,
    pub inflight: u64,
    pub since_last_activity_ms: u64,
}

/// Errors emitted by the tap surface.
#[derive(Clone, Debug, Error)]
pub enum TapError {
    #[error("page not enabled")]
    PageNotEnabled,
}

/// CDP-inspired events understood by the tap. Request ids are the raw `Network.RequestId`.
#[derive(Clone, Debug)]
pub enum TapEvent {
    RequestWillBeSent { request_id: String },
    ResponseReceived { request_id: String, status: i64 },
    LoadingFinished { request_id: String },
    LoadingFailed { request_id: String },
}

#[derive(Debug)]
struct Counters {
    requests: u64,
    res2xx: u64,
    res4xx: u64,
    res5xx: u64,
    inflight: HashSet<String>,
    last_activity: Instant,
}

impl Counters {
    fn new() -> Self {
        Self {
            requests: 0,
            res2xx: 0,
            res4xx: 0,
            res5xx: 0,
            inflight: HashSet::new(),
            last_activity: Instant::now(),
        }
    }

    fn register(&mut self, event: &TapEvent, now: Instant) {
        match event {
            TapEvent::RequestWillBeSent { request_id } => {
                // Redirects re-announce the same id; count the hop but track one in-flight slot.
                self.requests += 1;
                self.inflight.insert(request_id.clone());
            }
            TapEvent::ResponseReceived { status, .. } => match *status {
                200..=299 => self.res2xx += 1,
                400..=499 => self.res4xx += 1,
                500..=599 => self.res5xx += 1,
                _ => {}
            },
            TapEvent::LoadingFinished { request_id } | TapEvent::LoadingFailed { request_id } => {
                self.inflight.remove(request_id);
            }
        }
        self.last_activity = now;
    }

    fn idle(&self, now: Instant, window: Duration) -> bool {
        self.inflight.is_empty() && now.saturating_duration_since(self.last_activity) >= window
    }

    fn snapshot(&self, now: Instant) -> NetworkSnapshot {
        NetworkSnapshot {
            req: self.requests,
            res2xx: self.res2xx,
            res4xx: self.res4xx,
            res5xx: self.res5xx,
            inflight: self.inflight.len() as u64,
            since_last_activity_ms: now
                .saturating_duration_since(self.last_activity)
                .as_millis() as u64,
        }
    }
}

/// Per-page network bookkeeping.
pub struct NetworkTapLight {
    states: DashMap<PageId, Arc<Mutex<Counters>>>,
    config: TapConfig,
}

impl NetworkTapLight {
    pub fn new() -> Self {
        Self::with_config(TapConfig::default())
    }

    pub fn with_config(config: TapConfig) -> Self {
        Self {
            states: DashMap::new(),
            config,
        }
    }

    pub async fn enable(&self, page: PageId) -> Result<(), TapError> {
        self.states
            .entry(page)
            .or_insert_with(|| Arc::new(Mutex::new(Counters::new())));
        Ok(())
    }

    pub async fn disable(&self, page: PageId) -> Result<(), TapError> {
        self.states
            .remove(&page)
            .map(|_| ())
            .ok_or(TapError::PageNotEnabled)
    }

    pub async fn ingest(&self, page: PageId, event: TapEvent) -> Result<(), TapError> {
        let state = self
            .states
            .get(&page)
            .ok_or(TapError::PageNotEnabled)?
            .clone();
        let mut counters = state.lock().await;
        counters.register(&event, Instant::now());
        trace!(target: "network-tap", ?event, inflight = counters.inflight.len(), "tap ingest");
        Ok(())
    }

    pub async fn current_snapshot(&self, page: PageId) -> Option<NetworkSnapshot> {
        let state = self.states.get(&page)?.clone();
        let counters = state.lock().await;
        Some(counters.snapshot(Instant::now()))
    }

    /// Whether `page` has had nothing in flight for at least `window`.
    pub async fn is_idle(&self, page: PageId, window: Duration) -> Result<bool, TapError> {
        let state = self
            .states
            .get(&page)
            .ok_or(TapError::PageNotEnabled)?
            .clone();
        let counters = state.lock().await;
        Ok(counters.idle(Instant::now(), window))
    }

    /// [`Self::is_idle`] using the configured idle window.
    pub async fn is_idle_default(&self, page: PageId) -> Result<bool, TapError> {
        self.is_idle(page, Duration::from_millis(self.config.idle_window_ms))
            .await
    }
}

impl Default for NetworkTapLight {
    fn default() -> Self {
        Self::new()
    }
}
