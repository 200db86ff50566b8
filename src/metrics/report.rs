//! Aggregation over recorded metric samples: alert checks, the monitoring
//! report and coverage verification.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use chrono::{DateTime, Utc};

use crate::error::{ReportError, ReportResult};
use crate::metrics::{AlertLog, MetricSample, Thresholds};

/// Operations that every complete pipeline run is expected to report.
pub const CRITICAL_OPERATIONS: [&str; 4] =
    ["etl_chunk", "sync_write", "validation", "concurrent_insert"];

/// Number of entries in the slowest-operations table.
const SLOWEST_LIMIT: usize = 5;

/// Averages over a group of samples.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupStats {
    pub name: String,
    pub count: usize,
    pub avg_cpu: f64,
    pub avg_mem: f64,
    pub avg_latency: f64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MetricsSummary {
    pub total: usize,
    pub store_kinds: usize,
    pub operations: usize,
    pub avg_cpu: f64,
    pub max_cpu: f64,
    pub avg_mem: f64,
    pub max_mem: f64,
    pub avg_latency: f64,
    pub max_latency: f64,
    pub total_errors: u64,
    pub total_mismatches: u64,
    pub by_store: Vec<GroupStats>,
    pub by_operation: Vec<GroupStats>,
    /// Slowest samples, descending by latency.
    pub slowest: Vec<MetricSample>,
}

/// Outcome of an alert check over all samples.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AlertCheck {
    pub high_cpu: usize,
    pub max_cpu: f64,
    pub slow_operations: usize,
    pub max_latency: f64,
    pub total_mismatches: u64,
    pub total_errors: u64,
    pub alerts: Vec<String>,
}

impl AlertCheck {
    pub fn passed(&self) -> bool {
        self.alerts.is_empty()
    }

    pub fn exit_code(&self) -> i32 {
        if self.passed() { 0 } else { 1 }
    }
}

/// Which critical operations have samples.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CoverageCheck {
    pub total: usize,
    pub missing: Vec<&'static str>,
    pub by_operation: Vec<GroupStats>,
}

impl CoverageCheck {
    /// Coverage fails only when nothing was recorded at all; missing
    /// critical operations are reported as warnings.
    pub fn passed(&self) -> bool {
        self.total > 0
    }

    pub fn exit_code(&self) -> i32 {
        if self.passed() { 0 } else { 1 }
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 { 0.0 } else { sum / n as f64 }
}

fn max(values: impl Iterator<Item = f64>) -> f64 {
    values.fold(0.0, f64::max)
}

fn group_by<'a>(
    samples: &'a [MetricSample],
    key: impl Fn(&'a MetricSample) -> &'a str,
) -> Vec<GroupStats> {
    let mut groups: BTreeMap<&str, Vec<&MetricSample>> = BTreeMap::new();
    for sample in samples {
        groups.entry(key(sample)).or_default().push(sample);
    }
    groups
        .into_iter()
        .map(|(name, members)| GroupStats {
            name: name.to_string(),
            count: members.len(),
            avg_cpu: mean(members.iter().map(|s| s.cpu_percent)),
            avg_mem: mean(members.iter().map(|s| s.mem_percent)),
            avg_latency: mean(members.iter().map(|s| s.latency_ms)),
        })
        .collect()
}

pub fn summarize(samples: &[MetricSample]) -> MetricsSummary {
    let by_store = group_by(samples, |s| s.store_kind.as_str());
    let mut by_operation = group_by(samples, |s| s.operation.as_str());
    by_operation.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));

    let mut slowest = samples.to_vec();
    slowest.sort_by(|a, b| b.latency_ms.total_cmp(&a.latency_ms));
    slowest.truncate(SLOWEST_LIMIT);

    MetricsSummary {
        total: samples.len(),
        store_kinds: by_store.len(),
        operations: by_operation.len(),
        avg_cpu: mean(samples.iter().map(|s| s.cpu_percent)),
        max_cpu: max(samples.iter().map(|s| s.cpu_percent)),
        avg_mem: mean(samples.iter().map(|s| s.mem_percent)),
        max_mem: max(samples.iter().map(|s| s.mem_percent)),
        avg_latency: mean(samples.iter().map(|s| s.latency_ms)),
        max_latency: max(samples.iter().map(|s| s.latency_ms)),
        total_errors: samples.iter().map(|s| s.error_count).sum(),
        total_mismatches: samples.iter().map(|s| s.mismatch_count).sum(),
        by_store,
        by_operation,
        slowest,
    }
}

pub fn verify_coverage(samples: &[MetricSample]) -> CoverageCheck {
    let missing = CRITICAL_OPERATIONS
        .into_iter()
        .filter(|op| !samples.iter().any(|s| s.operation == *op))
        .collect();
    let mut by_operation = group_by(samples, |s| s.operation.as_str());
    by_operation.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
    CoverageCheck {
        total: samples.len(),
        missing,
        by_operation,
    }
}

/// Judges accumulated samples against the alert thresholds.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlertReporter {
    thresholds: Thresholds,
}

impl AlertReporter {
    pub fn new(thresholds: Thresholds) -> Self {
        Self { thresholds }
    }

    pub fn check_alerts(&self, samples: &[MetricSample]) -> AlertCheck {
        let t = &self.thresholds;
        let hot: Vec<f64> = samples
            .iter()
            .map(|s| s.cpu_percent)
            .filter(|cpu| *cpu > t.cpu_percent)
            .collect();
        let slow: Vec<f64> = samples
            .iter()
            .map(|s| s.latency_ms)
            .filter(|ms| *ms > t.latency_ms)
            .collect();

        let mut check = AlertCheck {
            high_cpu: hot.len(),
            max_cpu: max(hot.into_iter()),
            slow_operations: slow.len(),
            max_latency: max(slow.into_iter()),
            total_mismatches: samples.iter().map(|s| s.mismatch_count).sum(),
            total_errors: samples.iter().map(|s| s.error_count).sum(),
            alerts: Vec::new(),
        };
        if check.high_cpu > 0 {
            check.alerts.push(format!(
                "HIGH CPU: {} instances, Max: {:.1}%",
                check.high_cpu, check.max_cpu
            ));
        }
        if check.slow_operations > 0 {
            check.alerts.push(format!(
                "SLOW OPERATIONS: {} instances, Max: {:.1}ms",
                check.slow_operations, check.max_latency
            ));
        }
        if check.total_mismatches > t.mismatch_count {
            check.alerts.push(format!(
                "DATA MISMATCHES: {} total mismatches found",
                check.total_mismatches
            ));
        }
        if check.total_errors > 0 {
            check
                .alerts
                .push(format!("ERRORS: {} errors encountered", check.total_errors));
        }
        check
    }

    /// Run [`check_alerts`](Self::check_alerts) and append the outcome to `log`.
    pub fn check_and_log(&self, samples: &[MetricSample], log: &AlertLog) -> ReportResult<AlertCheck> {
        let check = self.check_alerts(samples);
        log.append_block("Pipeline Alert Check", Utc::now(), &check.alerts)
            .map_err(|source| ReportError::Write {
                path: log.path().display().to_string(),
                source,
            })?;
        Ok(check)
    }

    pub fn render_report(&self, samples: &[MetricSample], generated_at: DateTime<Utc>) -> String {
        let summary = summarize(samples);
        let check = self.check_alerts(samples);
        let heavy = "=".repeat(70);
        let light = "-".repeat(70);
        let mut out = String::new();

        let _ = writeln!(out, "{heavy}");
        let _ = writeln!(out, "       TRIP REPLICATION PIPELINE - MONITORING REPORT");
        let _ = writeln!(out, "{heavy}");
        let _ = writeln!(out, "Generated: {}", generated_at.format("%Y-%m-%d %H:%M:%S"));
        let _ = writeln!(out, "{heavy}\n");

        let _ = writeln!(out, "1. OVERALL METRICS SUMMARY\n{light}");
        let rows: [(&str, String); 11] = [
            ("Total Operations Monitored:", summary.total.to_string()),
            ("Stores:", summary.store_kinds.to_string()),
            ("Operation Types:", summary.operations.to_string()),
            ("Average CPU Usage:", format!("{:.2}%", summary.avg_cpu)),
            ("Peak CPU Usage:", format!("{:.2}%", summary.max_cpu)),
            ("Average Memory Usage:", format!("{:.2}%", summary.avg_mem)),
            ("Peak Memory Usage:", format!("{:.2}%", summary.max_mem)),
            ("Average Latency:", format!("{:.2}ms", summary.avg_latency)),
            ("Maximum Latency:", format!("{:.2}ms", summary.max_latency)),
            ("Total Errors:", summary.total_errors.to_string()),
            ("Total Mismatches:", summary.total_mismatches.to_string()),
        ];
        for (label, value) in rows {
            let _ = writeln!(out, "   {label:<31} {value}");
        }
        out.push('\n');

        let _ = writeln!(out, "2. PERFORMANCE BY STORE TYPE\n{light}");
        let _ = writeln!(
            out,
            "{:<15} {:<15} {:<15} {:<15}\n{light}",
            "Store", "Operations", "Avg CPU%", "Avg Latency"
        );
        for group in &summary.by_store {
            let _ = writeln!(
                out,
                "{:<15} {:<15} {:<15.2} {:<15.2}",
                group.name, group.count, group.avg_cpu, group.avg_latency
            );
        }
        out.push('\n');

        let _ = writeln!(out, "3. TOP {SLOWEST_LIMIT} SLOWEST OPERATIONS\n{light}");
        let _ = writeln!(
            out,
            "{:<25} {:<15} {:<15} {:<10}\n{light}",
            "Operation", "Store", "Latency (ms)", "CPU%"
        );
        for sample in &summary.slowest {
            let _ = writeln!(
                out,
                "{:<25} {:<15} {:<15.2} {:<10.2}",
                sample.operation, sample.store_kind, sample.latency_ms, sample.cpu_percent
            );
        }
        out.push('\n');

        let t = &self.thresholds;
        let _ = writeln!(out, "4. ALERT THRESHOLD ANALYSIS\n{light}");
        let cpu_label = format!("High CPU Alerts (>{}%):", t.cpu_percent);
        let slow_label = format!("Slow Operation Alerts (>{}ms):", t.latency_ms);
        let _ = writeln!(out, "   {cpu_label:<31} {}", check.high_cpu);
        let _ = writeln!(out, "   {slow_label:<31} {}", check.slow_operations);
        let _ = writeln!(out, "   {:<31} {}", "Data Sync Mismatches:", check.total_mismatches);
        let _ = writeln!(out, "   {:<31} {}", "Errors Encountered:", check.total_errors);
        out.push('\n');

        let _ = writeln!(out, "5. RECOMMENDATIONS\n{light}");
        if check.high_cpu > 0 {
            let _ = writeln!(out, "   Consider optimizing high CPU operations");
        }
        if check.slow_operations > 0 {
            let _ = writeln!(out, "   Review and optimize slow operations");
        }
        if check.total_mismatches > 0 {
            let _ = writeln!(out, "   Investigate data sync mismatches immediately");
        }
        if check.total_errors > 0 {
            let _ = writeln!(out, "   Review error logs and fix root causes");
        }
        if check.high_cpu == 0
            && check.slow_operations == 0
            && check.total_mismatches == 0
            && check.total_errors == 0
        {
            let _ = writeln!(out, "   All metrics within acceptable thresholds");
            let _ = writeln!(out, "   Pipeline performance is optimal");
        }
        out.push('\n');

        let _ = writeln!(out, "{heavy}\n                     END OF REPORT\n{heavy}");
        out
    }

    /// Render the report to `path`, creating parent directories.
    pub fn write_report(&self, samples: &[MetricSample], path: &Path) -> ReportResult<MetricsSummary> {
        let write_err = |source| ReportError::Write {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        std::fs::write(path, self.render_report(samples, Utc::now())).map_err(write_err)?;
        tracing::info!(path = %path.display(), samples = samples.len(), "monitoring report written");
        Ok(summarize(samples))
    }
}
