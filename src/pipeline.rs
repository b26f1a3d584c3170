//! Pipeline orchestration.
//!
//! ```text
//! raw_fp_data ──▶ validate ──▶ Lookup ──▶ RuleEngine ──▶ Accumulator ─┐
//!                 (per record, parallel over chunks)                    │ merge
//!                                                                       ▼
//!                           cleaned_fp_summary_data ◀── replace ◀── Aggregator
//! ```
//!
//! Per-record failures are counted in the [`RunReport`]; run-level failures
//! abort before the summary table is touched.

use chrono::Utc;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::{debug, error, info, warn};

use crate::aggregator::{Accumulator, Aggregator};
use crate::config::{PipelineConfig, RuntimeConfig};
use crate::db::{self, RunOutcome, RunRecord};
use crate::error::{DropReason, PipelineError, PipelineFailure};
use crate::lookup::{LookupTables, MetadataSnapshot};
use crate::quality;
use crate::records::{CleanedSummary, RawRecord, RawRow};
use crate::rules::RuleEngine;

// ============================================================================
// RUN REPORT
// ============================================================================

/// Counts returned to whoever triggered the run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    /// Raw rows read from the source table
    pub processed: usize,

    /// Raw rows that contributed nothing to the summary
    pub dropped: usize,

    #[serde(default)]
    pub dropped_by_reason: BTreeMap<DropReason, usize>,

    /// Summary rows written (county + national)
    pub written: usize,

    /// Raw rows with an identical twin (reported, not removed)
    #[serde(default)]
    pub duplicate_rows: usize,
}

impl RunReport {
    pub fn record_drop(&mut self, reason: DropReason) {
        self.dropped += 1;
        *self.dropped_by_reason.entry(reason).or_insert(0) += 1;
    }

    pub fn dropped_for(&self, reason: DropReason) -> usize {
        self.dropped_by_reason.get(&reason).copied().unwrap_or(0)
    }

    /// Fold a worker's counts into this report.
    pub fn absorb(&mut self, other: RunReport) {
        self.processed += other.processed;
        self.dropped += other.dropped;
        for (reason, count) in other.dropped_by_reason {
            *self.dropped_by_reason.entry(reason).or_insert(0) += count;
        }
    }
}

// ============================================================================
// TRANSFORMATION
// ============================================================================

fn transform_chunk(
    rows: &[RawRow],
    tables: &LookupTables,
    engine: &RuleEngine,
) -> (Accumulator, RunReport) {
    let mut acc = Accumulator::new();
    let mut report = RunReport::default();

    for row in rows {
        report.processed += 1;

        match RawRecord::try_from(row).and_then(|record| engine.apply(&record, tables)) {
            Ok(records) => acc.extend(records),
            Err(err) => {
                debug!(org_unit = %row.org_unit, element = %row.analytic, "dropped: {}", err);
                report.record_drop(err.reason());
            }
        }
    }

    (acc, report)
}

/// Resolve and transform every row, spreading contiguous partitions over
/// scoped worker threads. Tables and engine are shared read-only.
fn transform_parallel(
    rows: &[RawRow],
    tables: &LookupTables,
    engine: &RuleEngine,
    runtime: &RuntimeConfig,
) -> (Accumulator, RunReport) {
    let chunk_size = runtime.chunk_size.max(1);
    let partitions = runtime
        .effective_workers()
        .min(rows.len().div_ceil(chunk_size))
        .max(1);

    if partitions == 1 {
        return transform_chunk(rows, tables, engine);
    }

    let partition_len = rows.len().div_ceil(partitions);
    debug!(partitions, partition_len, "transforming in parallel");

    let partials: Vec<(Accumulator, RunReport)> = std::thread::scope(|scope| {
        let handles: Vec<_> = rows
            .chunks(partition_len)
            .map(|part| scope.spawn(move || transform_chunk(part, tables, engine)))
            .collect();

        handles
            .into_iter()
            .map(|handle| handle.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
            .collect()
    });

    let mut acc = Accumulator::new();
    let mut report = RunReport::default();
    for (partial_acc, partial_report) in partials {
        acc.merge(partial_acc);
        report.absorb(partial_report);
    }
    (acc, report)
}

/// SHA-256 over the summary rows, bit-exact on values.
pub fn summary_digest(rows: &[CleanedSummary]) -> String {
    let mut hasher = Sha256::new();
    for row in rows {
        hasher.update(format!(
            "{}\u{1f}{}\u{1f}{}\u{1f}{}\u{1f}{}\u{1f}{:016x}\n",
            row.analytic,
            row.method,
            row.org_unit,
            row.org_level,
            row.period,
            row.value.to_bits()
        ));
    }
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// PIPELINE
// ============================================================================

pub struct Pipeline {
    config: PipelineConfig,
    engine: RuleEngine,
    aggregator: Aggregator,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        let engine = RuleEngine::new(&config.rules);
        let aggregator = Aggregator::new(config.rules.national_label.clone());
        Ok(Pipeline {
            config,
            engine,
            aggregator,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn engine(&self) -> &RuleEngine {
        &self.engine
    }

    /// Lookup tables for a snapshot, built once per run.
    pub fn build_tables(&self, snapshot: &MetadataSnapshot) -> LookupTables {
        LookupTables::build(snapshot, &self.config.rules.analytic_ids, |name| {
            self.engine.classify_method(name)
        })
    }

    /// Pure transformation of a dataset into summary rows.
    ///
    /// `written` in the returned report stays 0; nothing is persisted here.
    pub fn transform_dataset(
        &self,
        rows: &[RawRow],
        snapshot: &MetadataSnapshot,
    ) -> Result<(Vec<CleanedSummary>, RunReport), PipelineError> {
        let tables = self.build_tables(snapshot);
        tables.ensure_populated()?;

        let national_label = &self.config.rules.national_label;
        if tables.has_county_named(national_label) {
            return Err(PipelineError::NationalLabelCollision(national_label.clone()));
        }
        info!(
            org_units = tables.org_unit_count(),
            analytics = tables.analytic_count(),
            "lookup tables ready"
        );

        info!(rows = rows.len(), "transforming raw data to county level");
        let (acc, report) = transform_parallel(rows, &tables, &self.engine, &self.config.runtime);
        info!(keys = acc.key_count(), "county level transformation complete");

        let summary = self.aggregator.finish(acc);
        info!(rows = summary.len(), "county and national aggregates generated");

        Ok((summary, report))
    }

    /// Run against an open connection with a fresh run id.
    pub fn run(&self, conn: &mut Connection) -> Result<RunReport, PipelineFailure> {
        self.run_with_id(conn, &uuid::Uuid::new_v4().to_string())
    }

    /// Run against an open connection, recording the outcome in run history.
    pub fn run_with_id(
        &self,
        conn: &mut Connection,
        run_id: &str,
    ) -> Result<RunReport, PipelineFailure> {
        let started_at = Utc::now();
        info!(run_id, "pipeline run started");

        let mut report = RunReport::default();
        let result = self.execute(conn, &mut report);

        let (outcome, digest, error_msg) = match &result {
            Ok(digest) => (RunOutcome::Succeeded, Some(digest.clone()), None),
            Err(err) => (RunOutcome::Failed, None, Some(err.to_string())),
        };

        let record = RunRecord {
            run_id: run_id.to_string(),
            started_at,
            finished_at: Utc::now(),
            outcome,
            report: report.clone(),
            digest,
            error: error_msg,
        };
        if let Err(e) = db::insert_run(conn, &record) {
            warn!(run_id, "failed to record run history: {:#}", e);
        }

        match result {
            Ok(_) => {
                info!(
                    run_id,
                    processed = report.processed,
                    dropped = report.dropped,
                    written = report.written,
                    "pipeline finished successfully"
                );
                Ok(report)
            }
            Err(error) => {
                error!(run_id, "pipeline failed: {}", error);
                Err(PipelineFailure { error, report })
            }
        }
    }

    /// Open the configured database and run.
    pub fn run_in_database(&self, run_id: &str) -> Result<RunReport, PipelineFailure> {
        let mut conn = open_database(&self.config).map_err(|error| PipelineFailure {
            error,
            report: RunReport::default(),
        })?;
        self.run_with_id(&mut conn, run_id)
    }

    fn execute(&self, conn: &mut Connection, report: &mut RunReport) -> Result<String, PipelineError> {
        info!("starting data extraction");
        let (snapshot, rows) = db::load_source(conn)
            .map_err(|e| PipelineError::source_unavailable(format!("{:#}", e)))?;
        info!(
            raw_rows = rows.len(),
            org_units = snapshot.org_units.len(),
            data_elements = snapshot.data_elements.len(),
            "source tables loaded"
        );

        report.processed = rows.len();
        let audit = quality::log_duplicate_audit(&rows, "raw_fp_data");
        report.duplicate_rows = audit.duplicate_rows;

        let (summary, counts) = self.transform_dataset(&rows, &snapshot)?;
        report.dropped = counts.dropped;
        report.dropped_by_reason = counts.dropped_by_reason;

        for (reason, count) in &report.dropped_by_reason {
            warn!(reason = reason.as_str(), count, "records dropped");
        }

        let table = &self.config.database.summary_table;
        report.written = db::replace_summary(conn, table, &summary)
            .map_err(|e| PipelineError::write_failure(format!("{:#}", e)))?;
        info!(table = %table, rows = report.written, "summary table replaced");

        Ok(summary_digest(&summary))
    }
}

/// Open (and if needed create) the configured database.
pub fn open_database(config: &PipelineConfig) -> Result<Connection, PipelineError> {
    let conn = Connection::open(&config.database.path).map_err(|e| {
        PipelineError::source_unavailable(format!("opening {}: {}", config.database.path, e))
    })?;
    db::setup_database(&conn, &config.database.summary_table)
        .map_err(|e| PipelineError::source_unavailable(format!("{:#}", e)))?;
    Ok(conn)
}

/// Trigger one run with the given configuration.
pub fn run_pipeline(config: &PipelineConfig) -> Result<RunReport, PipelineFailure> {
    let pipeline = Pipeline::new(config.clone()).map_err(|error| PipelineFailure {
        error,
        report: RunReport::default(),
    })?;
    pipeline.run_in_database(&uuid::Uuid::new_v4().to_string())
}
