//! Probe configuration
//!
//! Every section carries serde defaults, so a partial YAML file (or none at all) yields a
//! runnable configuration aimed at the local dev server.

use std::path::PathBuf;

use cdp_adapter::{CdpConfig, Locator};
use serde::{Deserialize, Serialize};

use crate::errors::FlowError;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Display name used in the narration.
    pub app_name: String,
    pub base_url: String,
    pub children_path: String,
    /// Directory receiving the screenshots; created when missing.
    pub output_dir: PathBuf,
    pub browser: BrowserSettings,
    pub timing: TimingSettings,
    pub form: FormSettings,
    pub storage: StorageSettings,
    pub selectors: SelectorSettings,
    pub report: ReportSettings,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            app_name: "BabySU".to_string(),
            base_url: "http://localhost:5173".to_string(),
            children_path: "/children".to_string(),
            output_dir: PathBuf::from("."),
            browser: BrowserSettings::default(),
            timing: TimingSettings::default(),
            form: FormSettings::default(),
            storage: StorageSettings::default(),
            selectors: SelectorSettings::default(),
            report: ReportSettings::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    pub headless: bool,
    pub chrome_path: Option<PathBuf>,
    pub no_sandbox: bool,
    /// DevTools websocket of an already running browser; skips the launch.
    pub websocket_url: Option<String>,
    pub launch_timeout_ms: u64,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            headless: true,
            chrome_path: None,
            no_sandbox: false,
            websocket_url: None,
            launch_timeout_ms: 20_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingSettings {
    /// Pause after navigations and clicks for client-side rendering.
    pub settle_ms: u64,
    pub form_settle_ms: u64,
    pub save_settle_ms: u64,
    pub navigation_timeout_ms: u64,
    pub action_timeout_ms: u64,
    pub idle_window_ms: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            settle_ms: 2_000,
            form_settle_ms: 1_000,
            save_settle_ms: 3_000,
            navigation_timeout_ms: 30_000,
            action_timeout_ms: 30_000,
            idle_window_ms: 500,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FormSettings {
    pub child_name: String,
    pub child_age: String,
}

impl Default for FormSettings {
    fn default() -> Self {
        Self {
            child_name: "Emma Test".to_string(),
            child_age: "2".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// localStorage key holding the persisted children list.
    pub children_key: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            children_key: "babysu_children".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorSettings {
    pub guest_text: String,
    pub guest_button: String,
    pub buttons: String,
    /// Lower-case fragments that identify a guest entry button in the fallback scan.
    pub fallback_keywords: Vec<String>,
    pub add_button: String,
    pub name_input: String,
    pub age_input: String,
    pub save_buttons: String,
}

impl Default for SelectorSettings {
    fn default() -> Self {
        Self {
            guest_text: "text=/guest/i".to_string(),
            guest_button: r#"button:has-text("Guest")"#.to_string(),
            buttons: "button".to_string(),
            fallback_keywords: vec!["guest".to_string(), "continue".to_string()],
            add_button: r#"button:has-text("Add")"#.to_string(),
            name_input: r#"input[name="name"], input[placeholder*="name" i]"#.to_string(),
            age_input: r#"input[name="age"], input[type="number"]"#.to_string(),
            save_buttons:
                r#"button:has-text("Save"), button:has-text("Create"), button:has-text("Add")"#
                    .to_string(),
        }
    }
}

/// Parsed form of [`SelectorSettings`].
#[derive(Clone, Debug)]
pub struct Selectors {
    pub guest_text: Locator,
    pub guest_button: Locator,
    pub buttons: Locator,
    pub add_button: Locator,
    pub name_input: Locator,
    pub age_input: Locator,
    pub save_buttons: Locator,
}

impl SelectorSettings {
    pub fn compile(&self) -> Result<Selectors, FlowError> {
        let parse = |raw: &str| {
            Locator::parse(raw).map_err(|source| FlowError::Selector {
                selector: raw.to_string(),
                source,
            })
        };
        Ok(Selectors {
            guest_text: parse(&self.guest_text)?,
            guest_button: parse(&self.guest_button)?,
            buttons: parse(&self.buttons)?,
            add_button: parse(&self.add_button)?,
            name_input: parse(&self.name_input)?,
            age_input: parse(&self.age_input)?,
            save_buttons: parse(&self.save_buttons)?,
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportSettings {
    /// Number of trailing console entries printed.
    pub console_tail: usize,
    /// URL fragments that mark a request as an API call.
    pub api_markers: Vec<String>,
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            console_tail: 20,
            api_markers: vec!["localhost:5000".to_string(), "/api/".to_string()],
        }
    }
}

impl ProbeConfig {
    pub fn children_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        let path = self.children_path.trim();
        if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        }
    }

    /// Adapter settings derived from the browser and timing sections.
    pub fn cdp_config(&self) -> CdpConfig {
        let mut cfg = CdpConfig::default();
        if let Some(path) = &self.browser.chrome_path {
            cfg.executable = path.clone();
        }
        cfg.headless = self.browser.headless;
        cfg.no_sandbox = self.browser.no_sandbox;
        cfg.websocket_url = self.browser.websocket_url.clone();
        cfg.launch_timeout_ms = self.browser.launch_timeout_ms;
        cfg.default_deadline_ms = self.timing.action_timeout_ms;
        cfg.idle_window_ms = self.timing.idle_window_ms;
        cfg
    }
}
