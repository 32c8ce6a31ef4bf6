//! Drives the probe against a scripted in-memory page instead of Chromium.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use cdp_adapter::{
    event_bus, AdapterError, AdapterErrorKind, Cdp, ElementInfo, ElementRef, EventBus, Locator,
    PageId, RawEvent, WaitGate,
};
use flowprobe::capture::{NetworkEntry, Recorder};
use flowprobe::config::ProbeConfig;
use flowprobe::flow::{run_flow, Shot, Transcript};
use flowprobe::report::DebugReport;
use flowprobe::FlowError;
use serde_json::{json, Value};
use tempfile::tempdir;
use uuid::Uuid;

const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];

#[derive(Clone)]
struct FakeElement {
    text: String,
    visible: bool,
    click_fails: bool,
}

fn el(text: &str) -> FakeElement {
    FakeElement {
        text: text.to_string(),
        visible: true,
        click_fails: false,
    }
}

/// A page whose elements are looked up by the locator's rendered form.
struct FakePage {
    reachable: bool,
    tag: String,
    elements: HashMap<String, Vec<FakeElement>>,
    bus: Option<EventBus>,
    actions: Mutex<Vec<String>>,
}

impl FakePage {
    fn new() -> Self {
        Self {
            reachable: true,
            tag: "run".to_string(),
            elements: HashMap::new(),
            bus: None,
            actions: Mutex::new(Vec::new()),
        }
    }

    fn with(mut self, selector: &str, elements: Vec<FakeElement>) -> Self {
        let key = Locator::parse(selector).expect("selector").to_string();
        self.elements.insert(key, elements);
        self
    }

    /// Guest entry, children list with an add button and a complete form.
    fn happy(cfg: &ProbeConfig) -> Self {
        let s = &cfg.selectors;
        Self::new()
            .with(&s.guest_text, vec![el("Continue as Guest")])
            .with(&s.guest_button, vec![el("Continue as Guest")])
            .with(&s.buttons, vec![el("Add Child"), el("Save")])
            .with(&s.add_button, vec![el("Add Child")])
            .with(&s.name_input, vec![el("")])
            .with(&s.age_input, vec![el("")])
            .with(&s.save_buttons, vec![el("Add Child"), el("Save")])
    }

    fn matches(&self, locator: &Locator) -> Vec<FakeElement> {
        self.elements
            .get(&locator.to_string())
            .cloned()
            .unwrap_or_default()
    }

    fn element(&self, target: &ElementRef) -> Result<FakeElement, AdapterError> {
        self.matches(&target.locator)
            .get(target.index)
            .cloned()
            .ok_or_else(|| {
                AdapterError::new(AdapterErrorKind::TargetNotFound)
                    .with_hint(format!("{} #{}", target.locator, target.index))
            })
    }

    fn act(&self, action: String) {
        self.actions.lock().unwrap().push(action);
    }

    fn actions(&self) -> Vec<String> {
        self.actions.lock().unwrap().clone()
    }

    fn publish(&self, url: &str) {
        let Some(bus) = &self.bus else { return };
        let page = PageId::new();
        let api = "http://localhost:5000/api/children".to_string();
        let mut headers = BTreeMap::new();
        headers.insert("x-user-id".to_string(), format!("{}-user", self.tag));
        let _ = bus.send(RawEvent::Console {
            page,
            kind: "log".into(),
            text: format!("{} loaded {url}", self.tag),
            location: None,
        });
        let _ = bus.send(RawEvent::Request {
            page,
            request_id: format!("{}-{url}", self.tag),
            method: "GET".into(),
            url: api.clone(),
            headers,
        });
        let _ = bus.send(RawEvent::Response {
            page,
            request_id: format!("{}-{url}", self.tag),
            url: api,
            status: 200,
        });
        let _ = bus.send(RawEvent::Request {
            page,
            request_id: format!("{}-asset", self.tag),
            method: "GET".into(),
            url: "http://localhost:5173/assets/logo.svg".into(),
            headers: BTreeMap::new(),
        });
    }
}

#[async_trait]
impl Cdp for FakePage {
    async fn navigate(
        &self,
        _page: PageId,
        url: &str,
        _deadline: Duration,
    ) -> Result<(), AdapterError> {
        self.act(format!("navigate {url}"));
        if !self.reachable {
            return Err(AdapterError::new(AdapterErrorKind::NavFailed)
                .with_hint(format!("net::ERR_CONNECTION_REFUSED at {url}")));
        }
        self.publish(url);
        Ok(())
    }

    async fn wait_basic(
        &self,
        _page: PageId,
        _gate: WaitGate,
        _timeout: Duration,
    ) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn screenshot(
        &self,
        _page: PageId,
        full_page: bool,
        _deadline: Duration,
    ) -> Result<Vec<u8>, AdapterError> {
        assert!(full_page);
        Ok(PNG.to_vec())
    }

    async fn evaluate_script(&self, _page: PageId, expression: &str) -> Result<Value, AdapterError> {
        if expression.contains("localStorage") {
            let mut map = serde_json::Map::new();
            for key in ["userId", "guestMode", "guestUserId", "children"] {
                if expression.contains(&format!("\"{key}\":")) {
                    map.insert(key.to_string(), Value::Null);
                }
            }
            map.insert("userId".to_string(), json!("guest-1"));
            return Ok(Value::Object(map));
        }
        Ok(match expression {
            "document.title" => json!("BabySU"),
            "window.location.href" => json!("http://localhost:5173/"),
            "window.location.pathname" => json!("/"),
            _ => Value::Null,
        })
    }

    async fn query(&self, _page: PageId, locator: &Locator) -> Result<Vec<ElementInfo>, AdapterError> {
        Ok(self
            .matches(locator)
            .into_iter()
            .enumerate()
            .map(|(index, element)| ElementInfo {
                index,
                tag: "button".into(),
                text: element.text,
                visible: element.visible,
            })
            .collect())
    }

    async fn count(&self, _page: PageId, locator: &Locator) -> Result<usize, AdapterError> {
        Ok(self.matches(locator).len())
    }

    async fn is_visible(&self, _page: PageId, target: &ElementRef) -> Result<bool, AdapterError> {
        Ok(self.element(target).map(|e| e.visible).unwrap_or(false))
    }

    async fn click(
        &self,
        _page: PageId,
        target: &ElementRef,
        _deadline: Duration,
    ) -> Result<(), AdapterError> {
        let element = self.element(target)?;
        if element.click_fails {
            return Err(AdapterError::new(AdapterErrorKind::Internal)
                .with_hint("element is covered by another element"));
        }
        self.act(format!("click {}", element.text));
        Ok(())
    }

    async fn fill(
        &self,
        _page: PageId,
        target: &ElementRef,
        text: &str,
        _deadline: Duration,
    ) -> Result<(), AdapterError> {
        self.element(target)?;
        self.act(format!("fill {} = {text}", target.locator));
        Ok(())
    }

    async fn inner_text(&self, _page: PageId, target: &ElementRef) -> Result<String, AdapterError> {
        self.element(target).map(|e| e.text)
    }
}

fn quick_config(dir: &Path) -> ProbeConfig {
    let mut cfg = ProbeConfig::default();
    cfg.output_dir = dir.to_path_buf();
    cfg.timing.settle_ms = 0;
    cfg.timing.form_settle_ms = 0;
    cfg.timing.save_settle_ms = 0;
    cfg
}

fn png_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .filter(|name| name.ends_with(".png"))
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn unreachable_target_aborts_without_screenshots() {
    let dir = tempdir().unwrap();
    let cfg = quick_config(dir.path());
    let mut fake = FakePage::happy(&cfg);
    fake.reachable = false;
    let mut transcript = Transcript::quiet();

    let err = run_flow(&fake, PageId::new(), &cfg, &mut transcript)
        .await
        .expect_err("unreachable app must abort");

    match err {
        FlowError::Navigation { url, source } => {
            assert_eq!(url, "http://localhost:5173");
            assert_eq!(source.kind, AdapterErrorKind::NavFailed);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(png_files(dir.path()).is_empty());
    assert_eq!(fake.actions(), vec!["navigate http://localhost:5173"]);
}

#[tokio::test]
async fn full_flow_writes_five_screenshots_in_order() {
    let dir = tempdir().unwrap();
    let cfg = quick_config(dir.path());
    let fake = FakePage::happy(&cfg);
    let mut transcript = Transcript::quiet();

    let outcome = run_flow(&fake, PageId::new(), &cfg, &mut transcript)
        .await
        .expect("flow completes");

    let taken: Vec<Shot> = outcome.screenshots.iter().map(|s| s.shot).collect();
    assert_eq!(taken, Shot::ALL.to_vec());
    let expected: Vec<String> = Shot::ALL.iter().map(|s| s.file_name().to_string()).collect();
    assert_eq!(png_files(dir.path()), expected);
    for saved in &outcome.screenshots {
        assert_eq!(std::fs::read(&saved.path).unwrap(), PNG);
    }

    assert_eq!(outcome.title, "BabySU");
    assert_eq!(outcome.guest_matches, 1);
    assert_eq!(outcome.children_buttons, 2);
    assert_eq!(outcome.final_storage["userId"], json!("guest-1"));
    assert!(outcome.final_storage.get("children").is_some());

    let actions = fake.actions();
    assert_eq!(
        actions,
        vec![
            "navigate http://localhost:5173".to_string(),
            "click Continue as Guest".to_string(),
            "navigate http://localhost:5173/children".to_string(),
            "click Add Child".to_string(),
            format!("fill {} = Emma Test", Locator::parse(&cfg.selectors.name_input).unwrap()),
            format!("fill {} = 2", Locator::parse(&cfg.selectors.age_input).unwrap()),
            "click Add Child".to_string(),
        ]
    );
    assert!(transcript.contains("Found 2 potential save buttons"));
    assert!(transcript.contains("  Button 0: 'Add Child'"));
    assert!(transcript.contains("✅ Filled name: Emma Test"));
}

#[tokio::test]
async fn missing_guest_button_warns_and_still_checks_storage() {
    let dir = tempdir().unwrap();
    let cfg = quick_config(dir.path());
    let fake = FakePage::new();
    let mut transcript = Transcript::quiet();

    let outcome = run_flow(&fake, PageId::new(), &cfg, &mut transcript)
        .await
        .expect("flow completes");

    assert!(transcript.contains("Found 0 elements with 'guest' text"));
    assert!(transcript.contains("⚠️ Guest button not visible"));
    assert!(transcript.contains("LocalStorage: {"));
    assert!(!transcript.contains("Trying alternative selectors"));
    assert_eq!(outcome.path_after_login, "/");
    assert!(!fake.actions().iter().any(|a| a.starts_with("click")));
}

#[tokio::test]
async fn zero_buttons_on_children_page_raise_nothing() {
    let dir = tempdir().unwrap();
    let cfg = quick_config(dir.path());
    let fake = FakePage::new();
    let mut transcript = Transcript::quiet();

    let outcome = run_flow(&fake, PageId::new(), &cfg, &mut transcript)
        .await
        .expect("flow completes");

    assert_eq!(outcome.children_buttons, 0);
    assert!(transcript.contains("Found 0 buttons on children page"));
    assert!(!transcript.contains("Error during form interaction"));
    let taken: Vec<Shot> = outcome.screenshots.iter().map(|s| s.shot).collect();
    assert_eq!(taken, vec![Shot::Initial, Shot::ChildrenPage]);
    assert!(transcript.contains("Final LocalStorage: {"));
}

#[tokio::test]
async fn failing_guest_click_falls_back_to_button_scan() {
    let dir = tempdir().unwrap();
    let cfg = quick_config(dir.path());
    let fake = FakePage::new()
        .with(
            &cfg.selectors.guest_button,
            vec![FakeElement {
                click_fails: true,
                ..el("Guest")
            }],
        )
        .with(
            &cfg.selectors.buttons,
            vec![el("Sign in"), el("Continue as Guest"), el("Guest tour")],
        );
    let mut transcript = Transcript::quiet();

    let outcome = run_flow(&fake, PageId::new(), &cfg, &mut transcript)
        .await
        .expect("flow completes");

    assert!(transcript.contains("⚠️ Could not click guest button"));
    assert!(transcript.contains("Found 3 total buttons"));
    assert!(transcript.contains("Found button 1: Continue as Guest"));
    let clicks: Vec<String> = fake
        .actions()
        .into_iter()
        .filter(|a| a.starts_with("click"))
        .collect();
    assert_eq!(clicks, vec!["click Continue as Guest"]);
    assert!(!outcome
        .screenshots
        .iter()
        .any(|s| s.shot == Shot::AfterGuestLogin));
}

#[tokio::test]
async fn fallback_keywords_ignore_case() {
    let dir = tempdir().unwrap();
    let mut cfg = quick_config(dir.path());
    cfg.selectors.fallback_keywords = vec!["CONTINUE".to_string()];
    let fake = FakePage::new()
        .with(
            &cfg.selectors.guest_button,
            vec![FakeElement {
                click_fails: true,
                ..el("Guest")
            }],
        )
        .with(&cfg.selectors.buttons, vec![el("Sign in"), el("Continue")]);
    let mut transcript = Transcript::quiet();

    run_flow(&fake, PageId::new(), &cfg, &mut transcript)
        .await
        .expect("flow completes");

    assert!(transcript.contains("Found button 1: Continue"));
    assert!(fake.actions().contains(&"click Continue".to_string()));
}

#[tokio::test]
async fn unclickable_add_button_is_reported_and_skips_form() {
    let dir = tempdir().unwrap();
    let cfg = quick_config(dir.path());
    let fake = FakePage::new()
        .with(
            &cfg.selectors.add_button,
            vec![FakeElement {
                click_fails: true,
                ..el("Add Child")
            }],
        )
        .with(&cfg.selectors.name_input, vec![el("")]);
    let mut transcript = Transcript::quiet();

    let outcome = run_flow(&fake, PageId::new(), &cfg, &mut transcript)
        .await
        .expect("flow completes");

    assert!(transcript.contains("❌ Error during form interaction"));
    assert!(!transcript.contains("✅ Filled name"));
    let taken: Vec<Shot> = outcome.screenshots.iter().map(|s| s.shot).collect();
    assert_eq!(taken, vec![Shot::Initial, Shot::ChildrenPage]);
    assert!(transcript.contains("Final LocalStorage: {"));
}

#[tokio::test]
async fn missing_save_button_stops_after_form() {
    let dir = tempdir().unwrap();
    let cfg = quick_config(dir.path());
    let fake = FakePage::new()
        .with(&cfg.selectors.add_button, vec![el("Add Child")])
        .with(&cfg.selectors.name_input, vec![el("")]);
    let mut transcript = Transcript::quiet();

    let outcome = run_flow(&fake, PageId::new(), &cfg, &mut transcript)
        .await
        .expect("flow completes");

    assert!(transcript.contains("✅ Filled name: Emma Test"));
    assert!(!transcript.contains("✅ Filled age"));
    assert!(transcript.contains("❌ No save button found"));
    assert_eq!(outcome.screenshots.len(), 3);
    assert_eq!(outcome.screenshots[2].shot, Shot::AddForm);
}

#[tokio::test]
async fn sequential_runs_are_independent() {
    let mut reports = Vec::new();
    let mut dirs = Vec::new();

    for tag in ["first", "second"] {
        let dir = tempdir().unwrap();
        let cfg = quick_config(dir.path());
        let (bus, rx) = event_bus(64);
        let recorder = Recorder::spawn(rx);
        let mut fake = FakePage::happy(&cfg);
        fake.tag = tag.to_string();
        fake.bus = Some(bus);
        let mut transcript = Transcript::quiet();

        let outcome = run_flow(&fake, PageId::new(), &cfg, &mut transcript)
            .await
            .expect("flow completes");
        drop(fake);
        let capture = recorder.finish().await;

        assert_eq!(png_files(dir.path()).len(), 5);
        assert_eq!(capture.console.len(), 2);
        assert!(capture
            .console
            .iter()
            .all(|entry| entry.text.starts_with(tag)));

        reports.push(DebugReport::build(
            Uuid::new_v4(),
            &capture,
            &outcome,
            &cfg.report,
        ));
        dirs.push(dir);
    }

    assert_ne!(dirs[0].path(), dirs[1].path());
    for (report, tag) in reports.iter().zip(["first", "second"]) {
        assert_eq!(report.api_activity.len(), 4);
        assert!(report.api_activity.iter().all(|entry| !entry.url().contains("assets")));
        let text = report.render();
        assert!(text.contains(&format!("    └─ User-ID: {tag}-user")));
        assert!(text.contains("  └─ Response: 200 ✅"));
        assert!(report.screenshots.iter().all(|line| line.captured));
        assert!(matches!(report.api_activity[0], NetworkEntry::Request { .. }));
    }
}
