use crate::types::{OutcomeData, ScanOutcome, ScanStatus};
use serde_json::Value;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

const SEPARATOR_WIDTH: usize = 80;

fn format_value(value: &Value) -> String {
    match value {
        // JSON string encoding gives quoted, escaped output.
        Value::String(_) => value.to_string(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// `key=value` pairs in key order, strings quoted.
pub fn format_data(data: &OutcomeData) -> String {
    let mut pairs: Vec<(&String, &Value)> = data.iter().collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));
    pairs
        .into_iter()
        .map(|(key, value)| format!("{}={}", key, format_value(value)))
        .collect::<Vec<_>>()
        .join(" ")
}

/// One report line: `agent="<id>" key=value ...`.
pub fn format_outcome(outcome: &ScanOutcome) -> String {
    let data = format_data(&outcome.data);
    if data.is_empty() {
        format!("agent=\"{}\"", outcome.worker_id)
    } else {
        format!("agent=\"{}\" {}", outcome.worker_id, data)
    }
}

/// Report destination: `path` truncated for this run, or stdout.
pub fn open_report(path: Option<&Path>) -> io::Result<Box<dyn Write + Send>> {
    match path {
        Some(path) => {
            let file = OpenOptions::new().create(true).write(true).truncate(true).open(path)?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(io::stdout())),
    }
}

/// Write every completed outcome from `feed` to `writer` until the feed closes.
///
/// Returns the number of lines written.
pub async fn report_outcomes<W: Write>(mut feed: broadcast::Receiver<ScanOutcome>, mut writer: W) -> usize {
    let mut written = 0;
    let mut skipped_total = 0u64;
    loop {
        let outcome = match feed.recv().await {
            Ok(outcome) => outcome,
            Err(RecvError::Lagged(skipped)) => {
                skipped_total += skipped;
                log::warn!("[pretty] report_lagged: skipped={} total_skipped={}", skipped, skipped_total);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        if outcome.status != ScanStatus::Completed || outcome.data.is_empty() {
            continue;
        }

        let line = format_outcome(&outcome);
        log::debug!("[pretty] received_output: {}", line);
        if let Err(e) = writeln!(writer, "{}", line).and_then(|_| writer.flush()) {
            log::error!("[pretty] write_failed: error={}", e);
            continue;
        }
        written += 1;
    }
    if skipped_total > 0 {
        log::warn!("[pretty] report_incomplete: written={} skipped={}", written, skipped_total);
    }
    written
}

/// Final per-worker status, on stderr so it never mixes with report lines.
pub fn print_status_table(outcomes: &[ScanOutcome]) {
    eprintln!("{}", "─".repeat(SEPARATOR_WIDTH));
    for outcome in outcomes {
        let icon = match outcome.status {
            ScanStatus::Pending => "⏳",
            ScanStatus::Running => "🔄",
            ScanStatus::Completed => "✅",
            ScanStatus::Failed => "❌",
        };
        eprintln!("{} {}: {} ({})", icon, outcome.worker_id.to_uppercase(),
            outcome.status.as_str(), outcome.updated_at.format("%H:%M:%S"));
    }
    eprintln!("{}", "─".repeat(SEPARATOR_WIDTH));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OutcomeSink;
    use chrono::Utc;
    use serde_json::json;

    fn outcome(status: ScanStatus, data: OutcomeData) -> ScanOutcome {
        ScanOutcome {
            worker_id: "tls".to_string(),
            status,
            data,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_format_outcome_line() {
        let mut data = OutcomeData::new();
        data.insert("ip".to_string(), json!("10.0.0.1"));
        data.insert("feasible".to_string(), json!(true));
        data.insert("elapsed_ms".to_string(), json!(42));
        data.insert("tls_version".to_string(), Value::Null);

        let line = format_outcome(&outcome(ScanStatus::Completed, data));
        assert_eq!(line, "agent=\"tls\" elapsed_ms=42 feasible=true ip=\"10.0.0.1\" tls_version=null");
    }

    #[test]
    fn test_format_escapes_strings() {
        let mut data = OutcomeData::new();
        data.insert("issuer".to_string(), json!("A \"quoted\" CA"));
        assert_eq!(format_data(&data), "issuer=\"A \\\"quoted\\\" CA\"");
    }

    #[test]
    fn test_format_empty_data() {
        assert_eq!(format_outcome(&outcome(ScanStatus::Completed, OutcomeData::new())), "agent=\"tls\"");
    }

    #[test]
    fn test_open_report_truncates_previous_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.log");
        std::fs::write(&path, "agent=\"tls\" stale=true\n").unwrap();

        {
            let mut out = open_report(Some(&path)).unwrap();
            writeln!(out, "agent=\"tcp\" connected=true").unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "agent=\"tcp\" connected=true\n");
    }

    #[tokio::test]
    async fn test_report_keeps_up_with_large_batches() {
        let sink = OutcomeSink::new();
        let feed = sink.subscribe();
        for i in 0..1000 {
            let mut data = OutcomeData::new();
            data.insert("ip".to_string(), json!(format!("10.0.{}.{}", i / 256, i % 256)));
            sink.record("tls", ScanStatus::Completed, data);
        }
        drop(sink);

        let written = report_outcomes(feed, io::sink()).await;
        assert_eq!(written, 1000);
    }

    #[tokio::test]
    async fn test_report_only_completed() {
        let sink = OutcomeSink::new();
        let feed = sink.subscribe();

        let mut data = OutcomeData::new();
        data.insert("feasible".to_string(), json!(false));
        sink.record("tls", ScanStatus::Running, OutcomeData::new());
        sink.record("tls", ScanStatus::Failed, OutcomeData::new());
        sink.record("tls", ScanStatus::Completed, data);
        drop(sink);

        let mut buffer = Vec::new();
        let written = report_outcomes(feed, &mut buffer).await;
        assert_eq!(written, 1);
        assert_eq!(String::from_utf8(buffer).unwrap(), "agent=\"tls\" feasible=false\n");
    }
}
