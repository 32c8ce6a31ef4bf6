//! In-page locator runtime.
//!
//! Every locator action is a single `Runtime.evaluate` of [`LOCATOR_RUNTIME`] applied to the
//! serialized locator, so elements are resolved against the live DOM at the moment of use.

use serde_json::Value;

use crate::commands::Locator;
use crate::error::{AdapterError, AdapterErrorKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LocatorAction {
    Count,
    Describe,
    Visible,
    Text,
    Point,
    Focus,
}

impl LocatorAction {
    fn as_str(self) -> &'static str {
        match self {
            LocatorAction::Count => "count",
            LocatorAction::Describe => "describe",
            LocatorAction::Visible => "visible",
            LocatorAction::Text => "text",
            LocatorAction::Point => "point",
            LocatorAction::Focus => "focus",
        }
    }
}

/// Outcome reported by the runtime for single-element actions.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum LocatorStatus {
    Ok(Value),
    NotFound { count: u64 },
    Hidden,
    Disabled,
}

pub(crate) const LOCATOR_RUNTIME: &str = r#"(query, index, action) => {
  const norm = (s) => (s || '').replace(/\s+/g, ' ').trim();
  const matches = (m, raw) => {
    const text = norm(raw);
    if (m.mode === 'contains') return text.toLowerCase().includes(m.value.toLowerCase());
    if (m.mode === 'exact') return text === m.value;
    try { return new RegExp(m.pattern, m.flags).test(text); } catch (e) { return false; }
  };
  const skip = new Set(['SCRIPT', 'STYLE', 'NOSCRIPT', 'TEMPLATE', 'HEAD', 'HTML']);
  const seen = new Set();
  const out = [];
  for (const part of query.parts) {
    let nodes = [];
    if (part.kind === 'css') {
      try { nodes = Array.from(document.querySelectorAll(part.selector)); } catch (e) { nodes = []; }
      if (part.has_text) nodes = nodes.filter((el) => matches(part.has_text, el.textContent));
    } else {
      const all = Array.from(document.querySelectorAll('*'));
      const hits = all.filter((el) => !skip.has(el.tagName) && matches(part.text, el.textContent));
      nodes = hits.filter((el) => !hits.some((other) => other !== el && el.contains(other)));
    }
    for (const el of nodes) {
      if (!seen.has(el)) { seen.add(el); out.push(el); }
    }
  }
  out.sort((a, b) => (a.compareDocumentPosition(b) & Node.DOCUMENT_POSITION_FOLLOWING) ? -1 : 1);
  const visible = (el) => {
    const rect = el.getBoundingClientRect();
    const style = window.getComputedStyle(el);
    return rect.width > 0 && rect.height > 0 && style.visibility !== 'hidden' && style.display !== 'none';
  };
  const inner = (el) => (typeof el.innerText === 'string' ? el.innerText : el.textContent) || '';
  if (action === 'count') return { status: 'ok', value: out.length };
  if (action === 'describe') {
    return {
      status: 'ok',
      value: out.map((el, i) => ({
        index: i,
        tag: el.tagName.toLowerCase(),
        text: norm(inner(el)).slice(0, 200),
        visible: visible(el),
      })),
    };
  }
  const el = out[index];
  if (!el) return { status: 'not-found', count: out.length };
  if (action === 'visible') return { status: 'ok', value: visible(el) };
  if (action === 'text') return { status: 'ok', value: inner(el) };
  if (action === 'point') {
    el.scrollIntoView({ block: 'center', inline: 'center' });
    if (!visible(el)) return { status: 'hidden' };
    if (el.disabled) return { status: 'disabled' };
    const rect = el.getBoundingClientRect();
    return { status: 'ok', value: { x: rect.left + rect.width / 2, y: rect.top + rect.height / 2 } };
  }
  if (action === 'focus') {
    if (el.disabled) return { status: 'disabled' };
    el.scrollIntoView({ block: 'center', inline: 'center' });
    el.focus();
    if (typeof el.select === 'function') {
      try { el.select(); } catch (e) {}
    } else {
      const range = document.createRange();
      range.selectNodeContents(el);
      const selection = window.getSelection();
      selection.removeAllRanges();
      selection.addRange(range);
    }
    return { status: 'ok', value: null };
  }
  return { status: 'unsupported' };
}"#;

/// Build the expression evaluating `action` for `locator` at `index`.
pub(crate) fn locator_expression(
    locator: &Locator,
    index: usize,
    action: LocatorAction,
) -> Result<String, AdapterError> {
    let query = serde_json::to_string(locator)
        .map_err(|err| AdapterError::new(AdapterErrorKind::Internal).with_hint(err.to_string()))?;
    Ok(format!(
        "({LOCATOR_RUNTIME})({query}, {index}, \"{}\")",
        action.as_str()
    ))
}

pub(crate) fn parse_status(value: &Value) -> Result<LocatorStatus, AdapterError> {
    let status = value.get("status").and_then(Value::as_str).unwrap_or("");
    match status {
        "ok" => Ok(LocatorStatus::Ok(
            value.get("value").cloned().unwrap_or(Value::Null),
        )),
        "not-found" => Ok(LocatorStatus::NotFound {
            count: value.get("count").and_then(Value::as_u64).unwrap_or(0),
        }),
        "hidden" => Ok(LocatorStatus::Hidden),
        "disabled" => Ok(LocatorStatus::Disabled),
        other => Err(AdapterError::new(AdapterErrorKind::Internal)
            .with_hint(format!("unexpected locator status '{other}'"))
            .with_data(value.clone())),
    }
}
