//! flowprobe library
//!
//! Drives the guest login → add child flow of a local web app in headless Chromium and
//! reports what the page logged, requested and threw along the way.

pub mod capture;
pub mod cli;
pub mod config;
pub mod errors;
pub mod flow;
pub mod report;
pub mod session;

pub use capture::{CaptureLog, Recorder};
pub use config::ProbeConfig;
pub use errors::FlowError;
pub use flow::{run_flow, FlowOutcome, Shot, Transcript};
pub use report::DebugReport;
pub use session::BrowserSession;
