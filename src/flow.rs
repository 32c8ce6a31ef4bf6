//! The guest login → add child probe.
//!
//! One straight-line procedure. Navigations and the unconditional screenshots abort the run;
//! the UI interactions in between are guarded and only print a warning when they fail.

use std::path::{Path, PathBuf};
use std::time::Duration;

use cdp_adapter::{Cdp, ElementRef, PageId, WaitGate};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::fs;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::{ProbeConfig, Selectors};
use crate::errors::{FlowError, FlowResult};

/// The five screenshots the probe can take, in flow order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Shot {
    Initial,
    AfterGuestLogin,
    ChildrenPage,
    AddForm,
    AfterSave,
}

impl Shot {
    pub const ALL: [Shot; 5] = [
        Shot::Initial,
        Shot::AfterGuestLogin,
        Shot::ChildrenPage,
        Shot::AddForm,
        Shot::AfterSave,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            Shot::Initial => "screenshot_1_initial.png",
            Shot::AfterGuestLogin => "screenshot_2_after_guest_login.png",
            Shot::ChildrenPage => "screenshot_3_children_page.png",
            Shot::AddForm => "screenshot_4_add_form.png",
            Shot::AfterSave => "screenshot_5_after_save.png",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Shot::Initial => "Initial page load",
            Shot::AfterGuestLogin => "After guest login",
            Shot::ChildrenPage => "Children list page",
            Shot::AddForm => "Add child form",
            Shot::AfterSave => "After clicking save",
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SavedShot {
    pub shot: Shot,
    pub path: PathBuf,
}

/// What a completed run observed.
#[derive(Clone, Debug, Serialize)]
pub struct FlowOutcome {
    pub title: String,
    pub url: String,
    pub guest_matches: usize,
    pub path_after_login: String,
    pub initial_storage: Value,
    pub children_buttons: usize,
    pub final_storage: Value,
    /// Screenshots actually written, in the order they were taken.
    pub screenshots: Vec<SavedShot>,
}

/// Narration sink. Lines are kept and optionally echoed to stdout as they happen.
#[derive(Debug, Default)]
pub struct Transcript {
    echo: bool,
    lines: Vec<String>,
}

impl Transcript {
    pub fn stdout() -> Self {
        Self {
            echo: true,
            lines: Vec::new(),
        }
    }

    pub fn quiet() -> Self {
        Self::default()
    }

    pub fn say(&mut self, line: impl Into<String>) {
        let line = line.into();
        if self.echo {
            println!("{line}");
        }
        self.lines.push(line);
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines.iter().any(|line| line.contains(needle))
    }
}

/// Run the probe against `page`.
pub async fn run_flow(
    cdp: &dyn Cdp,
    page: PageId,
    cfg: &ProbeConfig,
    transcript: &mut Transcript,
) -> FlowResult<FlowOutcome> {
    let selectors = cfg.selectors.compile()?;
    let mut probe = Probe {
        cdp,
        page,
        cfg,
        selectors,
        out: transcript,
        shots: Vec::new(),
    };
    probe.run().await
}

struct Probe<'a> {
    cdp: &'a dyn Cdp,
    page: PageId,
    cfg: &'a ProbeConfig,
    selectors: Selectors,
    out: &'a mut Transcript,
    shots: Vec<SavedShot>,
}

impl Probe<'_> {
    async fn run(&mut self) -> FlowResult<FlowOutcome> {
        let cfg = self.cfg;

        self.out
            .say(format!("🌐 Navigating to {} webapp...", cfg.app_name));
        self.goto(&cfg.base_url).await?;

        self.out.say("📸 Taking screenshot of initial page...");
        self.shoot(Shot::Initial).await?;

        let title = self.eval_string("document.title").await?;
        let url = self.eval_string("window.location.href").await?;
        self.out.say(format!("✅ Page loaded: {title}"));
        self.out.say(format!("✅ Current URL: {url}"));

        self.settle().await;

        self.out.say("\n🔍 Looking for guest login button...");
        let guest_matches = self
            .cdp
            .count(self.page, &self.selectors.guest_text)
            .await?;
        self.out
            .say(format!("Found {guest_matches} elements with 'guest' text"));

        if let Err(err) = self.guest_login().await {
            self.out.say(format!("⚠️ Could not click guest button: {err}"));
            self.out.say("Trying alternative selectors...");
            self.guest_fallback().await;
        }

        self.out.say("\n🔍 Checking localStorage...");
        let initial_storage = self
            .storage(&[
                ("userId", "userId"),
                ("guestMode", "guestMode"),
                ("guestUserId", "guestUserId"),
            ])
            .await;
        self.out
            .say(format!("LocalStorage: {}", pretty(&initial_storage)));

        self.out.say("\n🔍 Checking authentication state...");
        let path_after_login = self.eval_string("window.location.pathname").await?;
        self.out.say(format!("Current path: {path_after_login}"));

        self.out.say("\n🔍 Navigating to children page...");
        self.goto(&cfg.children_url()).await?;
        self.settle().await;
        self.out.say("📸 Taking screenshot of children page...");
        self.shoot(Shot::ChildrenPage).await?;

        self.out.say("\n🔍 Looking for Add Child button...");
        let children_buttons = self.list_buttons().await?;

        if let Err(err) = self.add_child().await {
            self.out
                .say(format!("❌ Error during form interaction: {err}"));
        }

        self.out.say("\n🔍 Final localStorage check...");
        let final_storage = self
            .storage(&[
                ("userId", "userId"),
                ("guestMode", "guestMode"),
                ("children", cfg.storage.children_key.as_str()),
            ])
            .await;
        self.out
            .say(format!("Final LocalStorage: {}", pretty(&final_storage)));

        info!(
            target: "flowprobe",
            screenshots = self.shots.len(),
            "probe flow complete"
        );
        Ok(FlowOutcome {
            title,
            url,
            guest_matches,
            path_after_login,
            initial_storage,
            children_buttons,
            final_storage,
            screenshots: std::mem::take(&mut self.shots),
        })
    }

    async fn guest_login(&mut self) -> FlowResult<()> {
        let guest = self.selectors.guest_button.first();
        if !self.cdp.is_visible(self.page, &guest).await? {
            warn!(target: "flowprobe", locator = %guest.locator, "guest button not visible");
            self.out.say("⚠️ Guest button not visible");
            return Ok(());
        }

        self.out.say("✅ Found guest button, clicking...");
        self.click(&guest).await?;
        self.settle().await;
        self.out.say("📸 Taking screenshot after guest login...");
        self.shoot(Shot::AfterGuestLogin).await
    }

    /// Click the first button whose text mentions a fallback keyword.
    async fn guest_fallback(&mut self) {
        let buttons = self.selectors.buttons.clone();
        let total = match self.cdp.count(self.page, &buttons).await {
            Ok(total) => total,
            Err(err) => {
                warn!(target: "flowprobe", %err, "fallback button scan failed");
                return;
            }
        };
        self.out.say(format!("Found {total} total buttons"));

        for index in 0..total {
            let button = buttons.nth(index);
            let Ok(text) = self.cdp.inner_text(self.page, &button).await else {
                continue;
            };
            let lower = text.to_lowercase();
            if !self
                .cfg
                .selectors
                .fallback_keywords
                .iter()
                .any(|keyword| lower.contains(&keyword.to_lowercase()))
            {
                continue;
            }
            self.out.say(format!("Found button {index}: {text}"));
            match self.click(&button).await {
                Ok(()) => {
                    self.settle().await;
                    break;
                }
                Err(err) => debug!(target: "flowprobe", index, %err, "fallback click failed"),
            }
        }
    }

    async fn list_buttons(&mut self) -> FlowResult<usize> {
        let buttons = self.selectors.buttons.clone();
        let total = self.cdp.count(self.page, &buttons).await?;
        self.out
            .say(format!("Found {total} buttons on children page"));

        for index in 0..total {
            match self.cdp.inner_text(self.page, &buttons.nth(index)).await {
                Ok(text) if !text.is_empty() && text.chars().count() < 50 => {
                    self.out.say(format!("  Button {index}: '{text}'"));
                }
                Ok(_) => {}
                Err(err) => debug!(target: "flowprobe", index, %err, "button text unavailable"),
            }
        }
        Ok(total)
    }

    async fn add_child(&mut self) -> FlowResult<()> {
        let add = self.selectors.add_button.first();
        if !self.cdp.is_visible(self.page, &add).await? {
            warn!(target: "flowprobe", locator = %add.locator, "add button not visible; skipping form");
            return Ok(());
        }

        self.out.say("✅ Clicking Add Child button...");
        self.click(&add).await?;
        self.settle().await;
        self.out.say("📸 Taking screenshot of add child form...");
        self.shoot(Shot::AddForm).await?;

        self.out.say("\n📝 Filling child form...");
        let name_input = self.selectors.name_input.first();
        let age_input = self.selectors.age_input.first();
        let form = &self.cfg.form;

        if self.cdp.is_visible(self.page, &name_input).await? {
            self.fill(&name_input, &form.child_name).await?;
            self.out
                .say(format!("✅ Filled name: {}", form.child_name));
        } else {
            warn!(target: "flowprobe", locator = %name_input.locator, "name input not visible");
        }

        if self.cdp.is_visible(self.page, &age_input).await? {
            self.fill(&age_input, &form.child_age).await?;
            self.out.say(format!("✅ Filled age: {}", form.child_age));
        } else {
            warn!(target: "flowprobe", locator = %age_input.locator, "age input not visible");
        }

        self.pause(self.cfg.timing.form_settle_ms).await;

        self.out.say("\n🔍 Looking for Save button...");
        let save_buttons = self.selectors.save_buttons.clone();
        let candidates = self.cdp.count(self.page, &save_buttons).await?;
        self.out
            .say(format!("Found {candidates} potential save buttons"));

        if candidates == 0 {
            self.out.say("❌ No save button found");
            return Ok(());
        }

        self.out.say("✅ Clicking Save button...");
        self.click(&save_buttons.first()).await?;
        self.out.say("⏳ Waiting for API response...");
        self.pause(self.cfg.timing.save_settle_ms).await;
        self.out.say("📸 Taking screenshot after save...");
        self.shoot(Shot::AfterSave).await
    }

    async fn goto(&mut self, url: &str) -> FlowResult<()> {
        let deadline = Duration::from_millis(self.cfg.timing.navigation_timeout_ms);
        let navigation = |source| FlowError::Navigation {
            url: url.to_string(),
            source,
        };

        self.cdp
            .navigate(self.page, url, deadline)
            .await
            .map_err(navigation)?;
        self.cdp
            .wait_basic(
                self.page,
                WaitGate::NetworkIdle {
                    idle_ms: self.cfg.timing.idle_window_ms,
                },
                deadline,
            )
            .await
            .map_err(navigation)?;
        debug!(target: "flowprobe", url, "navigation settled");
        Ok(())
    }

    async fn click(&self, target: &ElementRef) -> FlowResult<()> {
        let deadline = Duration::from_millis(self.cfg.timing.action_timeout_ms);
        self.cdp.click(self.page, target, deadline).await?;
        Ok(())
    }

    async fn fill(&self, target: &ElementRef, text: &str) -> FlowResult<()> {
        let deadline = Duration::from_millis(self.cfg.timing.action_timeout_ms);
        self.cdp.fill(self.page, target, text, deadline).await?;
        Ok(())
    }

    async fn shoot(&mut self, shot: Shot) -> FlowResult<()> {
        let deadline = Duration::from_millis(self.cfg.timing.action_timeout_ms);
        let png = self.cdp.screenshot(self.page, true, deadline).await?;
        let path = write_artifact(&self.cfg.output_dir, shot.file_name(), &png).await?;
        info!(target: "flowprobe", path = %path.display(), bytes = png.len(), "screenshot saved");
        self.shots.push(SavedShot { shot, path });
        Ok(())
    }

    async fn eval_string(&self, expression: &str) -> FlowResult<String> {
        let value = self.cdp.evaluate_script(self.page, expression).await?;
        Ok(match value {
            Value::String(text) => text,
            Value::Null => String::new(),
            other => other.to_string(),
        })
    }

    /// Read localStorage entries as `{label: value}`. Failures degrade to nulls.
    async fn storage(&mut self, entries: &[(&str, &str)]) -> Value {
        let fields = entries
            .iter()
            .map(|(label, key)| {
                format!(
                    "{}: localStorage.getItem({})",
                    Value::String(label.to_string()),
                    Value::String(key.to_string())
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        let expression = format!("(() => ({{ {fields} }}))()");

        match self.cdp.evaluate_script(self.page, &expression).await {
            Ok(value) => value,
            Err(err) => {
                self.out
                    .say(format!("⚠️ Could not read localStorage: {err}"));
                let nulls = entries
                    .iter()
                    .map(|(label, _)| (label.to_string(), Value::Null))
                    .collect::<Map<_, _>>();
                Value::Object(nulls)
            }
        }
    }

    async fn settle(&self) {
        self.pause(self.cfg.timing.settle_ms).await;
    }

    async fn pause(&self, millis: u64) {
        if millis > 0 {
            sleep(Duration::from_millis(millis)).await;
        }
    }
}

async fn write_artifact(dir: &Path, name: &str, bytes: &[u8]) -> FlowResult<PathBuf> {
    fs::create_dir_all(dir)
        .await
        .map_err(|source| FlowError::Artifact {
            path: dir.to_path_buf(),
            source,
        })?;
    let path = dir.join(name);
    fs::write(&path, bytes)
        .await
        .map_err(|source| FlowError::Artifact {
            path: path.clone(),
            source,
        })?;
    Ok(path)
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shot_names_are_ordered() {
        let names: Vec<_> = Shot::ALL.iter().map(|shot| shot.file_name()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert!(names.iter().all(|name| name.ends_with(".png")));
    }

    #[test]
    fn transcript_keeps_lines() {
        let mut transcript = Transcript::quiet();
        transcript.say("one");
        transcript.say(String::from("two"));
        assert_eq!(transcript.lines(), ["one", "two"]);
        assert!(transcript.contains("tw"));
    }
}
