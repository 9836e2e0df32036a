use crate::generator::profile::build_capture;
use crate::workflow::config::WorkflowConfig;
use anyhow::Context;
use basinmet::interface::RawMessage;
use basinmet::{Session, SessionReport};
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct Runner {
    config: WorkflowConfig,
}

impl Runner {
    pub fn new(config: WorkflowConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    pub fn synthesize(&self) -> anyhow::Result<Vec<RawMessage>> {
        build_capture(&self.config.capture).context("generating synthetic capture")
    }

    pub async fn execute(
        &self,
        messages: Vec<RawMessage>,
        cancel: CancellationToken,
    ) -> anyhow::Result<SessionReport> {
        let session =
            Session::new(self.config.pipeline.clone()).context("initializing session")?;
        log::info!("processing {} messages", messages.len());
        session
            .run_batch(messages, cancel)
            .await
            .context("running session")
    }
}

/// Reads a decoded capture with one JSON message per line. Lines that do
/// not parse are skipped with a warning.
pub fn load_capture<P: AsRef<Path>>(path: P) -> anyhow::Result<Vec<RawMessage>> {
    let path_ref = path.as_ref();
    let contents = fs::read_to_string(path_ref)
        .with_context(|| format!("reading capture {}", path_ref.display()))?;
    let mut messages = Vec::new();
    for (number, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<RawMessage>(line) {
            Ok(message) => messages.push(message),
            Err(err) => log::warn!(
                "skipping malformed line {} of {}: {}",
                number + 1,
                path_ref.display(),
                err
            ),
        }
    }
    Ok(messages)
}

/// Plain-text run summary in the layout of the capture statistics table.
pub fn summarize(report: &SessionReport) -> String {
    let metrics = &report.metrics;
    let aircraft: BTreeSet<_> = report.records.core.iter().map(|row| row.icao).collect();
    let mut out = String::new();

    let _ = writeln!(out, "Message Statistics:");
    for (category, count) in &metrics.categories {
        let _ = writeln!(out, "  {}: {}", category, count);
    }
    let _ = writeln!(out, "\nTotal records: {}", report.records.core.len());
    let _ = writeln!(out, "Unique aircraft: {}", aircraft.len());
    let _ = writeln!(out, "Duplicates: {}", metrics.duplicates);
    for (title, table) in [
        ("Sealed bins", &metrics.seals),
        ("Errors", &metrics.errors),
        ("Omitted features", &metrics.omissions),
    ] {
        if table.is_empty() {
            continue;
        }
        let _ = writeln!(out, "{}:", title);
        for (key, count) in table {
            let _ = writeln!(out, "  {}: {}", key, count);
        }
    }
    let _ = writeln!(out, "Cells: {}", report.cells.len());
    let _ = writeln!(out, "Cold-air pools: {:?}", report.cold_pool_ids());
    let _ = writeln!(out, "Air-mass segments: {}", report.segment_count());
    let _ = writeln!(out, "Completion: {}", report.completion.as_str());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use basinmet::interface::SealReason;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn small_workflow() -> WorkflowConfig {
        let mut cfg = WorkflowConfig::from_args(3, 900.0, 5);
        cfg.capture.noise = 0.0;
        cfg.capture.comm_b_fraction = 1.0;
        cfg
    }

    #[tokio::test]
    async fn runner_executes_workflow() {
        let runner = Runner::new(small_workflow());
        let messages = runner.synthesize().unwrap();
        let count = messages.len();
        let report = runner
            .execute(messages, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.completion, SealReason::EndOfStream);
        assert_eq!(report.metrics.processed, count as u64);
        assert_eq!(report.records.core.len(), report.records.derived.len());

        let wind = runner.config().capture.wind();
        assert!(report.records.derived.iter().any(|row| {
            matches!((row.wind_u_ms, row.wind_v_ms), (Some(u), Some(v))
                if (u - wind.u).abs() < 0.5 && (v - wind.v).abs() < 0.5)
        }));
        assert!(summarize(&report).contains("Unique aircraft: 3"));
    }

    #[test]
    fn capture_loader_skips_malformed_lines() {
        let runner = Runner::new(WorkflowConfig::from_args(1, 30.0, 1));
        let messages = runner.synthesize().unwrap();
        let mut temp = NamedTempFile::new().unwrap();
        for message in messages.iter().take(2) {
            writeln!(temp, "{}", serde_json::to_string(message).unwrap()).unwrap();
        }
        writeln!(temp).unwrap();
        writeln!(temp, "{{\"icao\": \"not-hex\"}}").unwrap();
        let path = temp.into_temp_path();

        let loaded = load_capture(&path).unwrap();
        assert_eq!(loaded, messages[..2].to_vec());
    }
}
