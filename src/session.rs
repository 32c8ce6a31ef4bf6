//! Scoped browser acquisition.

use std::sync::Arc;

use cdp_adapter::{AdapterError, Cdp, CdpAdapter, CdpConfig, EventBus, PageId};
use tracing::{info, warn};

/// One launched browser with a single blank page.
///
/// Call [`BrowserSession::close`] on every exit path; the transport kills the Chromium child
/// on drop as a last resort.
pub struct BrowserSession {
    adapter: Arc<CdpAdapter>,
    page: PageId,
}

impl BrowserSession {
    pub async fn launch(cfg: CdpConfig, bus: EventBus) -> Result<Self, AdapterError> {
        let headless = cfg.headless;
        let adapter = Arc::new(CdpAdapter::new(cfg, bus));
        Self::attach(adapter, headless).await
    }

    /// Start `adapter` and open the page. The adapter is shut down if either step fails.
    pub async fn attach(adapter: Arc<CdpAdapter>, headless: bool) -> Result<Self, AdapterError> {
        if let Err(err) = Arc::clone(&adapter).start().await {
            adapter.shutdown().await;
            return Err(err);
        }

        match adapter.create_page("about:blank").await {
            Ok(page) => {
                info!(target: "flowprobe", page = %page.0, headless, "browser session ready");
                Ok(Self { adapter, page })
            }
            Err(err) => {
                warn!(target: "flowprobe", %err, "page creation failed; closing browser");
                adapter.shutdown().await;
                Err(err)
            }
        }
    }

    pub fn page(&self) -> PageId {
        self.page
    }

    pub fn cdp(&self) -> &dyn Cdp {
        self.adapter.as_ref()
    }

    pub async fn close(self) {
        self.adapter.shutdown().await;
        info!(target: "flowprobe", "browser closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdp_adapter::{event_bus, AdapterErrorKind, NoopTransport};

    #[tokio::test]
    async fn failed_page_creation_is_reported() {
        let (bus, _rx) = event_bus(8);
        let adapter = Arc::new(CdpAdapter::with_transport(
            CdpConfig::default(),
            bus,
            Arc::new(NoopTransport),
        ));

        let err = match BrowserSession::attach(adapter, true).await {
            Ok(_) => panic!("noop transport cannot open pages"),
            Err(err) => err,
        };
        assert_eq!(err.kind, AdapterErrorKind::Internal);
        assert!(err.to_string().contains("Target.createTarget"));
    }
}
