//! tripmirror CLI: taxi trip replication pipeline.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use miette::Result;

use tripmirror::config::PipelineConfig;
use tripmirror::loadgen::WorkerKind;
use tripmirror::metrics::report::{AlertCheck, CoverageCheck};
use tripmirror::pipeline::Pipeline;
use tripmirror::validate::ValidationReport;

#[derive(Parser)]
#[command(
    name = "tripmirror",
    version,
    about = "Relational to document store replication with built-in monitoring"
)]
struct Cli {
    /// TOML config file (overrides TRIPMIRROR_CONFIG).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download the dataset and load it into the record store.
    Load {
        /// Dataset URI (http(s)://, file:// or a local path). Defaults to DATASET_URL.
        #[arg(long)]
        dataset: Option<String>,
    },
    /// Replicate the most recent window into the document store.
    Sync,
    /// Compare sampled documents against the record store.
    Validate {
        /// Instead, sample the record-store window and report keys missing
        /// from the document store.
        #[arg(long)]
        source_coverage: bool,
    },
    /// Run concurrent insert, update and read workers against the record store.
    LoadTest,
    /// Evaluate all recorded metrics against the alert thresholds.
    CheckAlerts,
    /// Write the monitoring report.
    Report,
    /// Confirm that metrics were recorded for the critical operations.
    Verify,
    /// load, sync, validate, check-alerts and report in sequence.
    Run,
}

fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))
    .ok(); // Ignore error if hook already set (e.g., in tests)

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env(cli.config.as_deref())?;
    let pipeline = Pipeline::open(config)?;

    let code = match cli.command {
        Commands::Load { dataset } => {
            let report = match dataset {
                Some(uri) => pipeline.load_uri(&uri)?,
                None => pipeline.load()?,
            };
            println!(
                "ETL complete. Total rows: {} | Errors: {} | Chunks: {} | Time: {:.2}s",
                report.rows_loaded,
                report.row_errors,
                report.chunks,
                report.duration.as_secs_f64()
            );
            0
        }

        Commands::Sync => {
            let report = pipeline.sync()?;
            println!(
                "Synced {} documents ({} inserted, {} replaced) in {} batches",
                report.synced(),
                report.inserted,
                report.replaced,
                report.batches
            );
            if report.error_count() > 0 {
                println!(
                    "  Errors: {} conversion, {} document, {} batch",
                    report.conversion_errors, report.document_errors, report.failed_batches
                );
            }
            0
        }

        Commands::Validate {
            source_coverage: true,
        } => {
            let report = pipeline.check_source_coverage()?;
            println!("Source coverage:");
            println!("  Keys checked:  {}", report.checked);
            println!("  Missing:       {}", report.missing.len());
            if !report.passed() {
                let preview: Vec<String> =
                    report.missing.iter().take(10).map(i64::to_string).collect();
                println!("  First missing: {}", preview.join(", "));
            }
            report.exit_code()
        }

        Commands::Validate {
            source_coverage: false,
        } => {
            let report = pipeline.validate()?;
            print_validation(&report);
            report.exit_code()
        }

        Commands::LoadTest => {
            let report = pipeline.load_test();
            for worker in &report.workers {
                println!(
                    "[worker {}] {} completed in {:.2}s (rows: {}, errors: {})",
                    worker.worker,
                    worker.kind.operation(),
                    worker.elapsed.as_secs_f64(),
                    worker.rows,
                    worker.errors
                );
            }
            println!(
                "All concurrent operations complete in {:.2}s: {} workers, {} rows inserted, {} errors",
                report.duration.as_secs_f64(),
                report.workers.len(),
                report.rows(WorkerKind::Insert),
                report.error_count()
            );
            0
        }

        Commands::CheckAlerts => {
            let check = pipeline.check_alerts()?;
            print_alerts(&check);
            check.exit_code()
        }

        Commands::Report => {
            let summary = pipeline.write_report()?;
            println!(
                "Monitoring report written to {}",
                pipeline.config().outputs.report.display()
            );
            println!("  Total operations: {}", summary.total);
            println!("  Average CPU:      {:.2}%", summary.avg_cpu);
            println!("  Average latency:  {:.2}ms", summary.avg_latency);
            println!("  Errors:           {}", summary.total_errors);
            println!("  Mismatches:       {}", summary.total_mismatches);
            0
        }

        Commands::Verify => {
            let coverage = pipeline.verify()?;
            print_coverage(&coverage);
            coverage.exit_code()
        }

        Commands::Run => {
            let summary = pipeline.run()?;
            println!(
                "Loaded {} rows, synced {} documents",
                summary.load.rows_loaded,
                summary.sync.synced()
            );
            print_validation(&summary.validation);
            print_alerts(&summary.alerts);
            println!(
                "Monitoring report written to {}",
                pipeline.config().outputs.report.display()
            );
            summary.exit_code()
        }
    };

    std::process::exit(code);
}

fn print_validation(report: &ValidationReport) {
    println!("Validation results:");
    println!("  Rows checked:  {}", report.checked);
    println!("  Not found:     {}", report.not_found);
    println!("  Mismatches:    {}", report.mismatches);
    if report.passed() {
        println!("Validation PASSED");
    } else {
        println!("Validation FAILED with {} issues", report.issues());
    }
}

fn print_alerts(check: &AlertCheck) {
    if check.passed() {
        println!("No alerts triggered, all metrics within thresholds");
        return;
    }
    println!("Alerts triggered:");
    for alert in &check.alerts {
        println!("  {alert}");
    }
}

fn print_coverage(coverage: &CoverageCheck) {
    println!("Metric samples found: {}", coverage.total);
    if !coverage.passed() {
        println!("No monitoring metrics collected");
        return;
    }
    println!("{:<25} {:<10} {:<12} {:<12}", "Operation", "Count", "Avg CPU%", "Avg Latency");
    for group in &coverage.by_operation {
        println!(
            "{:<25} {:<10} {:<12.2} {:<12.2}",
            group.name, group.count, group.avg_cpu, group.avg_latency
        );
    }
    if coverage.missing.is_empty() {
        println!("All critical operations monitored");
    } else {
        println!("Missing monitoring for operations: {}", coverage.missing.join(", "));
    }
}
