//! Pages opened by the adapter and the CDP targets/sessions behind them.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::ids::PageId;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TargetContext {
    pub target_id: String,
    pub cdp_session: String,
}

#[derive(Default)]
pub struct Registry {
    pages: DashMap<PageId, TargetContext>,
    sessions: DashMap<String, PageId>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_page(&self, page: PageId, target_id: String, cdp_session: String) {
        self.sessions.insert(cdp_session.clone(), page);
        self.pages.insert(
            page,
            TargetContext {
                target_id,
                cdp_session,
            },
        );
    }

    pub fn remove_page(&self, page: &PageId) -> Option<TargetContext> {
        let (_, ctx) = self.pages.remove(page)?;
        self.sessions.remove(&ctx.cdp_session);
        Some(ctx)
    }

    pub fn get(&self, page: &PageId) -> Option<TargetContext> {
        self.pages.get(page).map(|entry| entry.value().clone())
    }

    pub fn pages(&self) -> Vec<(PageId, TargetContext)> {
        self.pages
            .iter()
            .map(|kv| (*kv.key(), kv.value().clone()))
            .collect()
    }

    pub fn page_for_session(&self, session: &str) -> Option<PageId> {
        self.sessions.get(session).map(|entry| *entry.value())
    }

    pub fn get_cdp_session(&self, page: &PageId) -> Option<String> {
        self.pages.get(page).map(|entry| entry.cdp_session.clone())
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}
