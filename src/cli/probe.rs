use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use cdp_adapter::event_bus;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::capture::Recorder;
use crate::cli::output::OutputFormat;
use crate::config::ProbeConfig;
use crate::flow::{run_flow, FlowOutcome, Transcript};
use crate::report::DebugReport;
use crate::session::BrowserSession;

const EVENT_BUFFER: usize = 1024;

#[derive(Serialize)]
struct ProbeRun<'a> {
    transcript: &'a [String],
    outcome: &'a FlowOutcome,
    report: &'a DebugReport,
}

pub async fn cmd_run(config: &ProbeConfig, output: OutputFormat) -> Result<()> {
    let run_id = Uuid::new_v4();
    let started = Instant::now();
    info!(target: "flowprobe", %run_id, base_url = %config.base_url, "probe run starting");

    let mut transcript = match output {
        OutputFormat::Human => Transcript::stdout(),
        OutputFormat::Json => Transcript::quiet(),
    };

    let (bus, rx) = event_bus(EVENT_BUFFER);
    let recorder = Recorder::spawn(rx);

    let session = match BrowserSession::launch(config.cdp_config(), bus).await {
        Ok(session) => session,
        Err(err) => {
            recorder.finish().await;
            return Err(err).context("failed to launch the browser");
        }
    };

    let result = run_flow(session.cdp(), session.page(), config, &mut transcript).await;
    session.close().await;
    let capture = recorder.finish().await;

    let outcome = result.context("probe aborted")?;
    let report = DebugReport::build(run_id, &capture, &outcome, &config.report);
    match output {
        OutputFormat::Human => print!("{}", report.render()),
        OutputFormat::Json => {
            let run = ProbeRun {
                transcript: transcript.lines(),
                outcome: &outcome,
                report: &report,
            };
            println!("{}", serde_json::to_string_pretty(&run)?);
        }
    }

    if !capture.adapter_errors.is_empty() {
        warn!(
            target: "flowprobe",
            count = capture.adapter_errors.len(),
            "browser connection reported errors during the run"
        );
    }
    let elapsed = Duration::from_millis(started.elapsed().as_millis() as u64);
    info!(
        target: "flowprobe",
        %run_id,
        elapsed = %humantime::format_duration(elapsed),
        screenshots = outcome.screenshots.len(),
        "probe run finished"
    );
    Ok(())
}
