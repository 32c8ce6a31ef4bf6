//! End-of-run debug report.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::capture::{CaptureLog, ConsoleEntry, NetworkEntry};
use crate::config::ReportSettings;
use crate::flow::{FlowOutcome, Shot};

const RULE_WIDTH: usize = 60;

#[derive(Clone, Debug, Serialize)]
pub struct ScreenshotLine {
    pub ordinal: usize,
    pub file: &'static str,
    pub label: &'static str,
    pub captured: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct DebugReport {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub console_total: usize,
    /// Trailing console entries, oldest first.
    pub console: Vec<ConsoleEntry>,
    /// API traffic only, in observation order.
    pub api_activity: Vec<NetworkEntry>,
    pub page_errors: Vec<String>,
    pub screenshots: Vec<ScreenshotLine>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub adapter_errors: Vec<String>,
}

impl DebugReport {
    pub fn build(
        run_id: Uuid,
        log: &CaptureLog,
        outcome: &FlowOutcome,
        settings: &ReportSettings,
    ) -> Self {
        let skip = log.console.len().saturating_sub(settings.console_tail);
        let api_activity = log
            .network
            .iter()
            .filter(|entry| is_api_call(entry.url(), &settings.api_markers))
            .cloned()
            .collect();
        let screenshots = Shot::ALL
            .iter()
            .enumerate()
            .map(|(idx, shot)| ScreenshotLine {
                ordinal: idx + 1,
                file: shot.file_name(),
                label: shot.label(),
                captured: outcome.screenshots.iter().any(|saved| saved.shot == *shot),
            })
            .collect();

        Self {
            run_id,
            generated_at: Utc::now(),
            console_total: log.console.len(),
            console: log.console[skip..].to_vec(),
            api_activity,
            page_errors: log.page_errors.clone(),
            screenshots,
            adapter_errors: log.adapter_errors.clone(),
        }
    }

    /// Human-readable rendering printed after the browser has closed.
    pub fn render(&self) -> String {
        let rule = "=".repeat(RULE_WIDTH);
        let mut out = String::new();

        let _ = writeln!(out, "\n{rule}");
        let _ = writeln!(out, "📊 DEBUG REPORT");
        let _ = writeln!(out, "{rule}");

        let _ = writeln!(out, "\n🖥️  CONSOLE LOGS:");
        for entry in &self.console {
            let _ = writeln!(out, "  [{}] {}", entry.kind, entry.text);
        }

        let _ = writeln!(out, "\n🌐 NETWORK ACTIVITY (API calls only):");
        for entry in &self.api_activity {
            match entry {
                NetworkEntry::Request {
                    method,
                    url,
                    headers,
                } => {
                    let _ = writeln!(out, "  {method} {url}");
                    if let Some(user) = headers.get("x-user-id") {
                        let _ = writeln!(out, "    └─ User-ID: {user}");
                    }
                }
                NetworkEntry::Response { status, ok, .. } => {
                    let mark = if *ok { "✅" } else { "❌" };
                    let _ = writeln!(out, "  └─ Response: {status} {mark}");
                }
            }
        }

        let _ = writeln!(out, "\n❌ PAGE ERRORS:");
        if self.page_errors.is_empty() {
            let _ = writeln!(out, "  None");
        } else {
            for error in &self.page_errors {
                let _ = writeln!(out, "  {error}");
            }
        }

        let _ = writeln!(out, "\n📸 Screenshots saved:");
        for line in &self.screenshots {
            let missing = if line.captured { "" } else { " (not captured)" };
            let _ = writeln!(
                out,
                "  {}. {} - {}{missing}",
                line.ordinal, line.file, line.label
            );
        }

        out
    }
}

pub fn is_api_call(url: &str, markers: &[String]) -> bool {
    markers.iter().any(|marker| url.contains(marker.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::SavedShot;
    use serde_json::Value;
    use std::collections::BTreeMap;

    fn outcome(shots: &[Shot]) -> FlowOutcome {
        FlowOutcome {
            title: "BabySU".into(),
            url: "http://localhost:5173/".into(),
            guest_matches: 1,
            path_after_login: "/".into(),
            initial_storage: Value::Null,
            children_buttons: 0,
            final_storage: Value::Null,
            screenshots: shots
                .iter()
                .map(|shot| SavedShot {
                    shot: *shot,
                    path: shot.file_name().into(),
                })
                .collect(),
        }
    }

    fn request(url: &str, user: Option<&str>) -> NetworkEntry {
        let mut headers = BTreeMap::new();
        if let Some(user) = user {
            headers.insert("x-user-id".to_string(), user.to_string());
        }
        NetworkEntry::Request {
            method: "POST".into(),
            url: url.into(),
            headers,
        }
    }

    fn response(url: &str, status: i64) -> NetworkEntry {
        NetworkEntry::Response {
            status,
            url: url.into(),
            ok: crate::capture::status_ok(status),
        }
    }

    #[test]
    fn api_section_keeps_only_marked_urls() {
        let log = CaptureLog {
            network: vec![
                request("http://localhost:5173/src/main.tsx", None),
                request("http://localhost:5000/children", Some("guest-42")),
                response("http://localhost:5000/children", 201),
                request("https://cdn.example.com/font.woff2", None),
                response("http://localhost:5173/api/health", 500),
                response("https://cdn.example.com/font.woff2", 200),
            ],
            ..CaptureLog::default()
        };

        let report = DebugReport::build(
            Uuid::new_v4(),
            &log,
            &outcome(&Shot::ALL),
            &ReportSettings::default(),
        );
        assert_eq!(report.api_activity.len(), 3);

        let text = report.render();
        assert!(text.contains("  POST http://localhost:5000/children\n"));
        assert!(text.contains("    └─ User-ID: guest-42\n"));
        assert!(text.contains("  └─ Response: 201 ✅\n"));
        assert!(text.contains("  └─ Response: 500 ❌\n"));
        assert!(!text.contains("cdn.example.com"));
        assert!(!text.contains("main.tsx"));
    }

    #[test]
    fn console_is_trimmed_to_tail() {
        let log = CaptureLog {
            console: (0..25)
                .map(|idx| ConsoleEntry {
                    kind: "log".into(),
                    text: format!("message {idx}"),
                    location: None,
                })
                .collect(),
            ..CaptureLog::default()
        };

        let report = DebugReport::build(
            Uuid::new_v4(),
            &log,
            &outcome(&[]),
            &ReportSettings::default(),
        );
        assert_eq!(report.console_total, 25);
        assert_eq!(report.console.len(), 20);
        assert_eq!(report.console[0].text, "message 5");
        assert!(report.render().contains("  [log] message 24\n"));
    }

    #[test]
    fn empty_errors_and_missing_screenshots() {
        let report = DebugReport::build(
            Uuid::new_v4(),
            &CaptureLog::default(),
            &outcome(&[Shot::Initial, Shot::ChildrenPage]),
            &ReportSettings::default(),
        );
        let text = report.render();

        assert!(text.starts_with(&format!("\n{}\n📊 DEBUG REPORT\n", "=".repeat(60))));
        assert!(text.contains("❌ PAGE ERRORS:\n  None\n"));
        assert!(text.contains("  1. screenshot_1_initial.png - Initial page load\n"));
        assert!(text.contains(
            "  2. screenshot_2_after_guest_login.png - After guest login (not captured)\n"
        ));
        assert!(text.contains("  3. screenshot_3_children_page.png - Children list page\n"));
    }
}
