//! Static alert thresholds and the append-only alert log.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::metrics::MetricSample;

/// Limits a sample must stay at or under. Comparisons are strictly
/// greater-than: a sample exactly at a limit raises nothing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub cpu_percent: f64,
    pub latency_ms: f64,
    pub mismatch_count: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu_percent: 85.0,
            latency_ms: 500.0,
            mismatch_count: 0,
        }
    }
}

/// A threshold violation raised by one sample.
#[derive(Debug, Clone, PartialEq)]
pub enum Alert {
    HighCpu { operation: String, cpu_percent: f64 },
    SlowOperation { operation: String, latency_ms: f64 },
    DataMismatch { operation: String, mismatches: u64 },
}

impl Alert {
    pub fn message(&self) -> String {
        match self {
            Self::HighCpu {
                operation,
                cpu_percent,
            } => format!("HIGH CPU: {cpu_percent:.2}% during {operation}"),
            Self::SlowOperation {
                operation,
                latency_ms,
            } => format!("SLOW OPERATION: {operation} took {latency_ms:.2}ms"),
            Self::DataMismatch {
                operation,
                mismatches,
            } => format!("DATA MISMATCH: {mismatches} mismatches reported by {operation}"),
        }
    }
}

/// Evaluate one sample against `thresholds`.
pub fn evaluate(sample: &MetricSample, thresholds: &Thresholds) -> Vec<Alert> {
    let mut alerts = Vec::new();
    if sample.cpu_percent > thresholds.cpu_percent {
        alerts.push(Alert::HighCpu {
            operation: sample.operation.clone(),
            cpu_percent: sample.cpu_percent,
        });
    }
    if sample.latency_ms > thresholds.latency_ms {
        alerts.push(Alert::SlowOperation {
            operation: sample.operation.clone(),
            latency_ms: sample.latency_ms,
        });
    }
    if sample.mismatch_count > thresholds.mismatch_count {
        alerts.push(Alert::DataMismatch {
            operation: sample.operation.clone(),
            mismatches: sample.mismatch_count,
        });
    }
    alerts
}

/// Append-only text log of alert events.
#[derive(Debug, Clone)]
pub struct AlertLog {
    path: PathBuf,
}

impl AlertLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one timestamped line per message.
    pub fn append(&self, at: DateTime<Utc>, messages: &[String]) -> std::io::Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let mut file = self.open()?;
        let stamp = at.format("%Y-%m-%d %H:%M:%S");
        for message in messages {
            writeln!(file, "[{stamp}] {message}")?;
        }
        Ok(())
    }

    /// Append a titled block, as written by an alert check.
    pub fn append_block(&self, title: &str, at: DateTime<Utc>, lines: &[String]) -> std::io::Result<()> {
        let mut file = self.open()?;
        let rule = "=".repeat(60);
        writeln!(file, "{rule}")?;
        writeln!(file, "{title} ({})", at.format("%Y-%m-%d %H:%M:%S"))?;
        writeln!(file, "{rule}")?;
        if lines.is_empty() {
            writeln!(file, "No alerts triggered - all metrics within normal range")?;
        }
        for line in lines {
            writeln!(file, "{line}")?;
        }
        Ok(())
    }

    fn open(&self) -> std::io::Result<std::fs::File> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(cpu: f64, latency: f64, mismatches: u64) -> MetricSample {
        MetricSample {
            store_kind: "relational".into(),
            operation: "sync_write".into(),
            cpu_percent: cpu,
            mem_percent: 10.0,
            latency_ms: latency,
            error_count: 0,
            mismatch_count: mismatches,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn cpu_boundary_is_exclusive() {
        let t = Thresholds::default();
        assert!(evaluate(&sample(85.0, 1.0, 0), &t).is_empty());
        let alerts = evaluate(&sample(85.01, 1.0, 0), &t);
        assert!(matches!(alerts.as_slice(), [Alert::HighCpu { .. }]));
    }

    #[test]
    fn latency_boundary_is_exclusive() {
        let t = Thresholds::default();
        assert!(evaluate(&sample(1.0, 500.0, 0), &t).is_empty());
        let alerts = evaluate(&sample(1.0, 500.01, 0), &t);
        assert!(matches!(alerts.as_slice(), [Alert::SlowOperation { .. }]));
    }

    #[test]
    fn any_mismatch_alerts() {
        let t = Thresholds::default();
        let alerts = evaluate(&sample(1.0, 1.0, 1), &t);
        assert_eq!(
            alerts,
            vec![Alert::DataMismatch {
                operation: "sync_write".into(),
                mismatches: 1
            }]
        );
    }

    #[test]
    fn all_three_can_fire_together() {
        let alerts = evaluate(&sample(99.0, 900.0, 3), &Thresholds::default());
        assert_eq!(alerts.len(), 3);
    }

    #[test]
    fn alert_log_appends() {
        let dir = tempfile::TempDir::new().unwrap();
        let log = AlertLog::new(dir.path().join("logs/alerts.log"));
        let now = Utc::now();
        log.append(now, &["first".into()]).unwrap();
        log.append(now, &["second".into()]).unwrap();
        log.append(now, &[]).unwrap();
        let content = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("first"));
        assert!(lines[1].ends_with("second"));
    }
}
