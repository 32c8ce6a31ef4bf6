//! Passive capture of page activity.
//!
//! The [`Recorder`] listens on the adapter's event bus for the whole run and keeps console
//! messages, network traffic and uncaught page errors in arrival order.

use std::collections::BTreeMap;

use cdp_adapter::{RawEvent, SourceLocation};
use serde::{Deserialize, Serialize};
use tokio::select;
use tokio::sync::broadcast::{
    self,
    error::{RecvError, TryRecvError},
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleEntry {
    pub kind: String,
    pub text: String,
    pub location: Option<SourceLocation>,
}

/// Requests and responses share one list so their interleaving is preserved.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NetworkEntry {
    Request {
        method: String,
        url: String,
        headers: BTreeMap<String, String>,
    },
    Response {
        status: i64,
        url: String,
        ok: bool,
    },
}

impl NetworkEntry {
    pub fn url(&self) -> &str {
        match self {
            NetworkEntry::Request { url, .. } | NetworkEntry::Response { url, .. } => url,
        }
    }
}

/// A response counts as ok for status 0 (opaque) and 2xx.
pub fn status_ok(status: i64) -> bool {
    status == 0 || (200..=299).contains(&status)
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CaptureLog {
    pub console: Vec<ConsoleEntry>,
    pub network: Vec<NetworkEntry>,
    pub page_errors: Vec<String>,
    /// Adapter-level failures (transport closed, detached page).
    pub adapter_errors: Vec<String>,
}

impl CaptureLog {
    pub fn record(&mut self, event: RawEvent) {
        match event {
            RawEvent::Console {
                kind,
                text,
                location,
                ..
            } => self.console.push(ConsoleEntry {
                kind,
                text,
                location,
            }),
            RawEvent::Request {
                method,
                url,
                headers,
                ..
            } => self.network.push(NetworkEntry::Request {
                method,
                url,
                headers,
            }),
            RawEvent::Response { url, status, .. } => self.network.push(NetworkEntry::Response {
                status,
                url,
                ok: status_ok(status),
            }),
            RawEvent::PageError { message, .. } => self.page_errors.push(message),
            RawEvent::Error { message, .. } => {
                warn!(target: "flowprobe", %message, "adapter reported an error");
                self.adapter_errors.push(message);
            }
        }
    }
}

/// Background task appending bus events to a [`CaptureLog`].
pub struct Recorder {
    stop: CancellationToken,
    handle: JoinHandle<CaptureLog>,
}

impl Recorder {
    /// Subscribe before the browser launches so no early event is missed.
    pub fn spawn(mut rx: broadcast::Receiver<RawEvent>) -> Self {
        let stop = CancellationToken::new();
        let token = stop.clone();
        let handle = tokio::spawn(async move {
            let mut log = CaptureLog::default();
            loop {
                select! {
                    biased;
                    event = rx.recv() => match event {
                        Ok(event) => log.record(event),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(target: "flowprobe", skipped, "capture lagged; events dropped");
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = token.cancelled() => {
                        drain(&mut rx, &mut log);
                        break;
                    }
                }
            }
            debug!(
                target: "flowprobe",
                console = log.console.len(),
                network = log.network.len(),
                errors = log.page_errors.len(),
                "capture finished"
            );
            log
        });
        Self { stop, handle }
    }

    /// Stop listening and return everything captured, including still-buffered events.
    pub async fn finish(self) -> CaptureLog {
        self.stop.cancel();
        match self.handle.await {
            Ok(log) => log,
            Err(err) => {
                warn!(target: "flowprobe", %err, "capture task failed");
                CaptureLog::default()
            }
        }
    }
}

fn drain(rx: &mut broadcast::Receiver<RawEvent>, log: &mut CaptureLog) {
    loop {
        match rx.try_recv() {
            Ok(event) => log.record(event),
            Err(TryRecvError::Lagged(skipped)) => {
                warn!(target: "flowprobe", skipped, "capture lagged; events dropped");
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdp_adapter::{event_bus, PageId};

    #[tokio::test]
    async fn records_events_in_arrival_order() {
        let (bus, rx) = event_bus(16);
        let recorder = Recorder::spawn(rx);
        let page = PageId::new();

        bus.send(RawEvent::Request {
            page,
            request_id: "1".into(),
            method: "GET".into(),
            url: "http://localhost:5000/api/children".into(),
            headers: BTreeMap::new(),
        })
        .unwrap();
        bus.send(RawEvent::Console {
            page,
            kind: "log".into(),
            text: "hello".into(),
            location: None,
        })
        .unwrap();
        bus.send(RawEvent::Response {
            page,
            request_id: "1".into(),
            url: "http://localhost:5000/api/children".into(),
            status: 404,
        })
        .unwrap();
        bus.send(RawEvent::PageError {
            page,
            message: "TypeError: boom".into(),
        })
        .unwrap();

        let log = recorder.finish().await;
        assert_eq!(log.console.len(), 1);
        assert_eq!(log.network.len(), 2);
        assert!(matches!(log.network[0], NetworkEntry::Request { .. }));
        assert_eq!(
            log.network[1],
            NetworkEntry::Response {
                status: 404,
                url: "http://localhost:5000/api/children".into(),
                ok: false
            }
        );
        assert_eq!(log.page_errors, vec!["TypeError: boom".to_string()]);
    }

    #[tokio::test]
    async fn closed_bus_ends_capture() {
        let (bus, rx) = event_bus(4);
        let recorder = Recorder::spawn(rx);
        bus.send(RawEvent::Error {
            page: None,
            message: "cdp transport closed".into(),
        })
        .unwrap();
        drop(bus);

        let log = recorder.finish().await;
        assert_eq!(log.adapter_errors, vec!["cdp transport closed".to_string()]);
    }

    #[tokio::test]
    async fn lagged_capture_keeps_newest_events() {
        let (bus, rx) = event_bus(2);
        let recorder = Recorder::spawn(rx);
        let page = PageId::new();

        for idx in 0..6 {
            bus.send(RawEvent::Console {
                page,
                kind: "log".into(),
                text: format!("e{idx}"),
                location: None,
            })
            .unwrap();
        }

        let log = recorder.finish().await;
        let texts: Vec<&str> = log.console.iter().map(|entry| entry.text.as_str()).collect();
        assert_eq!(texts, vec!["e4", "e5"]);
        assert!(log.adapter_errors.is_empty());
    }

    #[test]
    fn opaque_and_success_statuses_are_ok() {
        assert!(status_ok(0));
        assert!(status_ok(204));
        assert!(!status_ok(304));
        assert!(!status_ok(500));
    }
}
