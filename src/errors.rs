//! Errors that abort a probe run.
//!
//! Optional UI steps never surface these; they print a warning and move on.

use std::path::PathBuf;

use cdp_adapter::{AdapterError, LocatorError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("navigation to {url} failed: {source}")]
    Navigation {
        url: String,
        #[source]
        source: AdapterError,
    },

    #[error("failed to write {}: {source}", path.display())]
    Artifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid selector '{selector}': {source}")]
    Selector {
        selector: String,
        #[source]
        source: LocatorError,
    },

    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

pub type FlowResult<T> = Result<T, FlowError>;
