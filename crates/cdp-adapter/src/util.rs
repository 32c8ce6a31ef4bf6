use chromiumoxide::async_process::Child;
use futures::io::{AsyncBufReadExt, BufReader};
use futures::stream::StreamExt;
use tokio::time::{timeout, Duration};

use crate::error::{AdapterError, AdapterErrorKind};

const STDERR_PREVIEW_LINES: usize = 8;

/// Read Chromium's stderr until it announces the browser DevTools websocket.
pub async fn extract_ws_url(child: &mut Child, wait: Duration) -> Result<String, AdapterError> {
    let stderr = child.stderr.take().ok_or_else(|| {
        AdapterError::new(AdapterErrorKind::CdpIo).with_hint("chromium process missing stderr")
    })?;
    let mut lines = BufReader::new(stderr).lines();
    let mut preview = Vec::new();

    let reader = async {
        while let Some(line) = lines.next().await {
            let line = line.map_err(|err| {
                AdapterError::new(AdapterErrorKind::CdpIo).with_hint(err.to_string())
            })?;
            if let Some(ws) = parse_listening_line(&line) {
                return Ok(ws);
            }
            if preview.len() < STDERR_PREVIEW_LINES {
                preview.push(line);
            }
        }
        Err(AdapterError::new(AdapterErrorKind::CdpIo).with_hint(format!(
            "chromium exited before exposing a devtools url; stderr: {}",
            preview.join(" | ")
        )))
    };

    timeout(wait, reader).await.map_err(|_| {
        AdapterError::new(AdapterErrorKind::CdpIo)
            .with_hint("timed out waiting for chromium devtools url")
            .retriable(true)
    })?
}

fn parse_listening_line(line: &str) -> Option<String> {
    let (_, ws) = line.rsplit_once("listening on ")?;
    let ws = ws.trim();
    (ws.starts_with("ws") && ws.contains("devtools/browser")).then(|| ws.to_string())
}

#[cfg(test)]
mod tests {
    use super::parse_listening_line;

    #[test]
    fn picks_browser_websocket() {
        let line = "DevTools listening on ws://127.0.0.1:40123/devtools/browser/abc-123";
        assert_eq!(
            parse_listening_line(line).as_deref(),
            Some("ws://127.0.0.1:40123/devtools/browser/abc-123")
        );
        assert_eq!(parse_listening_line("[WARNING] gpu process crashed"), None);
        assert_eq!(
            parse_listening_line("listening on ws://host/devtools/page/1"),
            None
        );
    }
}
