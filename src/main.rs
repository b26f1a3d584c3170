use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fp_pipeline::{
    db, logging, parse_period, quality, spawn_run, Method, Pipeline, PipelineConfig, RunStatus,
    SummaryFilter,
};

/// Family planning pipeline - raw KHIS extracts to county and national summaries
#[derive(Parser, Debug)]
#[command(name = "fp-pipeline", version, about)]
struct Cli {
    /// Config file (defaults to ./fp_pipeline.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database, overrides config and FP_DB_PATH
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Debug logging (RUST_LOG still wins)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create tables (WAL mode)
    Init,

    /// Append raw data values from a CSV extract
    ImportRaw {
        csv: PathBuf,

        /// Delete existing rows for the periods in the file first
        #[arg(long)]
        replace_periods: bool,
    },

    /// Replace the organisation unit snapshot from CSV
    ImportOrgUnits { csv: PathBuf },

    /// Replace the data element snapshot from CSV
    ImportDataElements { csv: PathBuf },

    /// Run the pipeline and replace the summary table
    Run {
        /// Run on a background thread and poll its status
        #[arg(long)]
        background: bool,
    },

    /// Query the cleaned summary
    Query {
        #[arg(long)]
        analytic: Option<String>,

        /// Service or Consumption
        #[arg(long, value_parser = parse_method)]
        method: Option<Method>,

        #[arg(long)]
        org_unit: Option<String>,

        /// First period (YYYY-MM or YYYYMM)
        #[arg(long, value_parser = parse_period_arg)]
        start: Option<NaiveDate>,

        /// Last period (YYYY-MM or YYYYMM)
        #[arg(long, value_parser = parse_period_arg)]
        end: Option<NaiveDate>,

        /// Write results to CSV instead of printing
        #[arg(long)]
        csv: Option<PathBuf>,
    },

    /// Show recent pipeline runs
    Runs {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Report exact duplicate rows in raw_fp_data
    Audit,
}

fn parse_method(s: &str) -> Result<Method, String> {
    Method::parse(s).ok_or_else(|| format!("expected Service or Consumption, got '{}'", s))
}

fn parse_period_arg(s: &str) -> Result<NaiveDate, String> {
    parse_period(s).map_err(|e| e.to_string())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);

    let mut config = PipelineConfig::load(cli.config.as_deref()).context("Failed to load config")?;
    if let Some(db_path) = &cli.db {
        config.database.path = db_path.display().to_string();
    }

    match cli.command {
        Command::Init => run_init(&config),
        Command::ImportRaw { csv, replace_periods } => run_import_raw(&config, &csv, replace_periods),
        Command::ImportOrgUnits { csv } => run_import_org_units(&config, &csv),
        Command::ImportDataElements { csv } => run_import_data_elements(&config, &csv),
        Command::Run { background } => {
            if background {
                run_background(config)
            } else {
                run_foreground(config)
            }
        }
        Command::Query {
            analytic,
            method,
            org_unit,
            start,
            end,
            csv,
        } => {
            let filter = SummaryFilter {
                analytic,
                method,
                org_unit,
                start,
                end,
            };
            run_query(&config, &filter, csv)
        }
        Command::Runs { limit } => run_history(&config, limit),
        Command::Audit => run_audit(&config),
    }
}

fn open(config: &PipelineConfig) -> Result<Connection> {
    fp_pipeline::open_database(config)
        .with_context(|| format!("Failed to open database {}", config.database.path))
}

fn run_init(config: &PipelineConfig) -> Result<()> {
    println!("🔧 Setting up database...");
    open(config)?;
    println!("✓ Database initialized with WAL mode: {}", config.database.path);
    Ok(())
}

fn run_import_raw(config: &PipelineConfig, csv: &Path, replace_periods: bool) -> Result<()> {
    println!("📂 Loading raw data CSV...");
    let rows = db::load_raw_csv(csv)?;
    println!("✓ Loaded {} rows from CSV", rows.len());

    let mut conn = open(config)?;

    if replace_periods {
        let mut periods: Vec<String> = rows.iter().filter_map(|r| r.period.clone()).collect();
        periods.sort();
        periods.dedup();
        let removed = db::delete_raw_for_periods(&conn, &periods)?;
        println!("✓ Removed {} existing rows for {} periods", removed, periods.len());
    }

    let inserted = db::insert_raw_rows(&mut conn, &rows)?;
    let total = db::count_raw_rows(&conn)?;
    println!("💾 Inserted {} rows ({} total in raw_fp_data)", inserted, total);
    Ok(())
}

fn run_import_org_units(config: &PipelineConfig, csv: &Path) -> Result<()> {
    let units = db::load_org_units_csv(csv)?;
    let mut conn = open(config)?;
    let count = db::replace_org_units(&mut conn, &units)?;
    println!("✓ Organisation units snapshot replaced: {} units", count);
    Ok(())
}

fn run_import_data_elements(config: &PipelineConfig, csv: &Path) -> Result<()> {
    let elements = db::load_data_elements_csv(csv)?;
    let mut conn = open(config)?;
    let count = db::replace_data_elements(&mut conn, &elements)?;
    println!("✓ Data elements snapshot replaced: {} elements", count);
    Ok(())
}

fn print_report(report: &fp_pipeline::RunReport) {
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Processed:  {}", report.processed);
    println!("Dropped:    {}", report.dropped);
    for (reason, count) in &report.dropped_by_reason {
        println!("  - {}: {}", reason.as_str(), count);
    }
    println!("Written:    {}", report.written);
    if report.duplicate_rows > 0 {
        println!("⚠️  Duplicate raw rows: {}", report.duplicate_rows);
    }
}

fn run_foreground(config: PipelineConfig) -> Result<()> {
    println!("🚀 Running pipeline...");
    let pipeline = Pipeline::new(config)?;
    let mut conn = open(pipeline.config())?;

    match pipeline.run(&mut conn) {
        Ok(report) => {
            print_report(&report);
            println!("✅ Summary table updated");
            Ok(())
        }
        Err(failure) => {
            print_report(&failure.report);
            Err(anyhow!(failure.error)).context("Pipeline run failed")
        }
    }
}

fn run_background(config: PipelineConfig) -> Result<()> {
    let handle = spawn_run(config)?;
    println!("🚀 Run {} started in background", handle.run_id());

    while !handle.is_finished() {
        if let RunStatus::Running { started_at } = handle.status() {
            println!("⏳ running since {}", started_at.format("%H:%M:%S"));
        }
        std::thread::sleep(Duration::from_millis(500));
    }

    match handle.wait() {
        RunStatus::Succeeded { report } => {
            print_report(&report);
            println!("✅ Summary table updated");
            Ok(())
        }
        RunStatus::Failed { error, report } => {
            print_report(&report);
            Err(anyhow!("Pipeline run failed: {}", error))
        }
        other => Err(anyhow!("Run ended in unexpected state: {:?}", other)),
    }
}

fn run_query(config: &PipelineConfig, filter: &SummaryFilter, csv: Option<PathBuf>) -> Result<()> {
    let conn = open(config)?;
    let rows = db::query_summary(&conn, &config.database.summary_table, filter)?;

    if let Some(path) = csv {
        db::export_summary_csv(&rows, &path)?;
        println!("✓ Wrote {} rows to {}", rows.len(), path.display());
        return Ok(());
    }

    println!("{:<20} {:<12} {:<10} {:<28} {:>14}", "ANALYTIC", "METHOD", "PERIOD", "ORG UNIT", "VALUE");
    for row in &rows {
        println!(
            "{:<20} {:<12} {:<10} {:<28} {:>14.2}",
            row.analytic,
            row.method,
            row.period.format("%Y-%m"),
            row.org_unit,
            row.value
        );
    }
    println!("({} rows)", rows.len());
    Ok(())
}

fn run_history(config: &PipelineConfig, limit: usize) -> Result<()> {
    let conn = open(config)?;
    let runs = db::list_runs(&conn, limit)?;

    if runs.is_empty() {
        println!("No pipeline runs recorded yet");
        return Ok(());
    }

    for run in runs {
        let marker = match run.outcome {
            db::RunOutcome::Succeeded => "✅",
            db::RunOutcome::Failed => "❌",
        };
        println!(
            "{} {} {}  processed={} dropped={} written={}",
            marker,
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            run.run_id,
            run.report.processed,
            run.report.dropped,
            run.report.written,
        );
        if let Some(digest) = &run.digest {
            println!("     digest {}", &digest[..16.min(digest.len())]);
        }
        if let Some(error) = &run.error {
            println!("     error: {}", error);
        }
    }
    Ok(())
}

fn run_audit(config: &PipelineConfig) -> Result<()> {
    let conn = open(config)?;
    let rows = db::load_raw_rows(&conn)?;
    let report = quality::audit_duplicates(&rows);

    println!("🔍 {}", report.summary());
    for key in report.sample(20) {
        println!("  {} {}", key.org_unit, key.period);
    }
    Ok(())
}
