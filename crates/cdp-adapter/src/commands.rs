//! Command parameter types exposed by the CDP adapter interface.
//!
//! Locators follow the selector dialect most UI test scripts are written in: CSS with an
//! optional `:has-text("...")` filter, `text=` queries (plain, quoted or `/regex/flags`), and
//! comma-separated unions of both. They are resolved inside the page every time an action runs.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How an element's text is compared.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TextMatch {
    /// Case-insensitive substring over whitespace-normalised text.
    Contains { value: String },
    /// Exact, case-sensitive match over whitespace-normalised text.
    Exact { value: String },
    /// JavaScript regular expression.
    Regex { pattern: String, flags: String },
}

impl TextMatch {
    pub fn contains(value: impl Into<String>) -> Self {
        Self::Contains {
            value: value.into(),
        }
    }

    pub fn regex(pattern: impl Into<String>, flags: impl Into<String>) -> Self {
        Self::Regex {
            pattern: pattern.into(),
            flags: flags.into(),
        }
    }
}

/// One alternative of a locator union.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LocatorPart {
    Css {
        selector: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        has_text: Option<TextMatch>,
    },
    /// Deepest elements whose text content matches.
    Text { text: TextMatch },
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LocatorError {
    #[error("locator is empty")]
    Empty,
    #[error("unterminated {0} in locator '{1}'")]
    Unterminated(&'static str, String),
    #[error("invalid :has-text() in '{0}'")]
    InvalidHasText(String),
}

/// A union of alternatives, resolved in document order without duplicates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locator {
    pub parts: Vec<LocatorPart>,
}

impl Locator {
    pub fn css(selector: impl Into<String>) -> Self {
        Self {
            parts: vec![LocatorPart::Css {
                selector: selector.into(),
                has_text: None,
            }],
        }
    }

    pub fn css_has_text(selector: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            parts: vec![LocatorPart::Css {
                selector: selector.into(),
                has_text: Some(TextMatch::contains(text)),
            }],
        }
    }

    pub fn text(text: TextMatch) -> Self {
        Self {
            parts: vec![LocatorPart::Text { text }],
        }
    }

    pub fn or(mut self, other: Locator) -> Self {
        self.parts.extend(other.parts);
        self
    }

    pub fn first(&self) -> ElementRef {
        self.nth(0)
    }

    pub fn nth(&self, index: usize) -> ElementRef {
        ElementRef {
            locator: self.clone(),
            index,
        }
    }

    /// Parse a selector such as `button:has-text("Save"), text=/guest/i`.
    pub fn parse(raw: &str) -> Result<Self, LocatorError> {
        let mut parts = Vec::new();
        for chunk in split_top_level(raw)? {
            let chunk = chunk.trim();
            if chunk.is_empty() {
                continue;
            }
            parts.push(parse_part(chunk)?);
        }
        if parts.is_empty() {
            return Err(LocatorError::Empty);
        }
        Ok(Self { parts })
    }
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (idx, part) in self.parts.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            match part {
                LocatorPart::Css { selector, has_text } => {
                    f.write_str(selector)?;
                    if let Some(text) = has_text {
                        write!(f, ":has-text({})", display_text(text))?;
                    }
                }
                LocatorPart::Text { text } => write!(f, "text={}", display_text(text))?,
            }
        }
        Ok(())
    }
}

fn display_text(text: &TextMatch) -> String {
    match text {
        TextMatch::Contains { value } => format!("{value:?}"),
        TextMatch::Exact { value } => format!("{value:?}!"),
        TextMatch::Regex { pattern, flags } => format!("/{pattern}/{flags}"),
    }
}

fn split_top_level(raw: &str) -> Result<Vec<&str>, LocatorError> {
    let mut chunks = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut start = 0usize;
    let mut escaped = false;

    for (idx, ch) in raw.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match quote {
            Some(q) => match ch {
                '\\' => escaped = true,
                c if c == q => quote = None,
                _ => {}
            },
            None => match ch {
                '"' | '\'' => quote = Some(ch),
                '(' | '[' => depth += 1,
                ')' | ']' => depth -= 1,
                ',' if depth == 0 => {
                    chunks.push(&raw[start..idx]);
                    start = idx + 1;
                }
                _ => {}
            },
        }
    }

    if quote.is_some() {
        return Err(LocatorError::Unterminated("quote", raw.to_string()));
    }
    if depth != 0 {
        return Err(LocatorError::Unterminated("bracket", raw.to_string()));
    }
    chunks.push(&raw[start..]);
    Ok(chunks)
}

fn parse_part(chunk: &str) -> Result<LocatorPart, LocatorError> {
    if let Some(rest) = chunk.strip_prefix("text=") {
        return Ok(LocatorPart::Text {
            text: parse_text(rest.trim()),
        });
    }

    const HAS_TEXT: &str = ":has-text(";
    let Some(pos) = chunk.find(HAS_TEXT) else {
        return Ok(LocatorPart::Css {
            selector: chunk.to_string(),
            has_text: None,
        });
    };

    let inner_start = pos + HAS_TEXT.len();
    let close = chunk[inner_start..]
        .rfind(')')
        .map(|offset| inner_start + offset)
        .ok_or_else(|| LocatorError::InvalidHasText(chunk.to_string()))?;
    let inner = chunk[inner_start..close].trim();
    let value = unquote(inner).ok_or_else(|| LocatorError::InvalidHasText(chunk.to_string()))?;

    let mut selector = chunk[..pos].to_string();
    selector.push_str(&chunk[close + 1..]);
    let selector = if selector.trim().is_empty() {
        "*".to_string()
    } else {
        selector.trim().to_string()
    };

    Ok(LocatorPart::Css {
        selector,
        has_text: Some(TextMatch::contains(value)),
    })
}

fn parse_text(body: &str) -> TextMatch {
    if body.len() >= 2 && body.starts_with('/') {
        if let Some(end) = body.rfind('/') {
            if end > 0 {
                return TextMatch::regex(&body[1..end], &body[end + 1..]);
            }
        }
    }
    match unquote(body) {
        Some(value) if body.starts_with('"') || body.starts_with('\'') => {
            TextMatch::Exact { value }
        }
        _ => TextMatch::contains(body),
    }
}

fn unquote(raw: &str) -> Option<String> {
    let mut chars = raw.chars();
    let open = chars.next()?;
    if !(open == '"' || open == '\'') || raw.len() < 2 || !raw.ends_with(open) {
        return None;
    }
    let inner = &raw[1..raw.len() - 1];
    Some(inner.replace(&format!("\\{open}"), &open.to_string()))
}

/// A locator narrowed to one match; resolved again on every action.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementRef {
    pub locator: Locator,
    pub index: usize,
}

/// Summary of a resolved element.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ElementInfo {
    pub index: usize,
    pub tag: String,
    pub text: String,
    pub visible: bool,
}

/// Wait gate definitions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum WaitGate {
    DomReady,
    NetworkIdle { idle_ms: u64 },
}
