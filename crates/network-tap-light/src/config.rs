//! Configuration types for the network tap (light).

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TapConfig {
    /// Quiet period with zero in-flight requests before a page counts as idle.
    pub idle_window_ms: u64,
}

impl Default for TapConfig {
    fn default() -> Self {
        Self { idle_window_ms: 500 }
    }
}
