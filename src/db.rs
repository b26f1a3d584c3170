use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

use crate::lookup::{DataElement, MetadataSnapshot, OrgUnit};
use crate::pipeline::RunReport;
use crate::records::{CleanedSummary, Method, OrgLevel, RawRow};

const PERIOD_FORMAT: &str = "%Y-%m-%d";

// ============================================================================
// SCHEMA
// ============================================================================

/// Plain SQL identifier: ASCII alphanumerics and `_`, not starting with a digit.
pub fn is_valid_identifier(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Reject anything but a plain SQL identifier before it is spliced into SQL.
fn ensure_identifier(table: &str) -> Result<()> {
    if !is_valid_identifier(table) {
        bail!("invalid table name '{}'", table);
    }
    Ok(())
}

pub fn setup_database(conn: &Connection, summary_table: &str) -> Result<()> {
    ensure_identifier(summary_table)?;

    // WAL lets readers keep querying the summary while a run replaces it
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // ==========================================================================
    // Source tables (written by the extractor)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS raw_fp_data (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            org_unit TEXT NOT NULL,
            analytic TEXT NOT NULL,
            category_option TEXT,
            period TEXT,
            value TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS organisation_units (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            level INTEGER NOT NULL,
            parent_id TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS data_elements (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Cleaned summary (replaced on every run)
    // ==========================================================================
    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS {} (
                analytic TEXT NOT NULL,
                method TEXT NOT NULL,
                org_unit TEXT NOT NULL,
                org_level TEXT NOT NULL,
                period TEXT NOT NULL,
                value REAL NOT NULL,
                PRIMARY KEY (analytic, method, org_unit, period)
            )",
            summary_table
        ),
        [],
    )?;

    // ==========================================================================
    // Run history
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS pipeline_runs (
            run_id TEXT PRIMARY KEY,
            started_at TEXT NOT NULL,
            finished_at TEXT NOT NULL,
            status TEXT NOT NULL,
            processed INTEGER NOT NULL,
            dropped INTEGER NOT NULL,
            written INTEGER NOT NULL,
            report TEXT NOT NULL,
            digest TEXT,
            error TEXT
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_raw_period ON raw_fp_data(period)",
        [],
    )?;

    conn.execute(
        &format!(
            "CREATE INDEX IF NOT EXISTS idx_{0}_period ON {0}(period)",
            summary_table
        ),
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_runs_started ON pipeline_runs(started_at)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// CSV IMPORT (extraction side)
// ============================================================================

pub fn load_raw_csv(csv_path: &Path) -> Result<Vec<RawRow>> {
    let mut rdr = csv::Reader::from_path(csv_path)
        .with_context(|| format!("Failed to open CSV file {:?}", csv_path))?;

    let mut rows = Vec::new();
    for (line, result) in rdr.deserialize().enumerate() {
        let row: RawRow =
            result.with_context(|| format!("Failed to deserialize raw row {}", line + 2))?;
        rows.push(row);
    }

    Ok(rows)
}

#[derive(Debug, Deserialize)]
struct OrgUnitCsvRow {
    id: String,
    name: String,
    level: String,
    #[serde(default)]
    parent_id: Option<String>,
}

pub fn load_org_units_csv(csv_path: &Path) -> Result<Vec<OrgUnit>> {
    let mut rdr = csv::Reader::from_path(csv_path)
        .with_context(|| format!("Failed to open CSV file {:?}", csv_path))?;

    let mut units = Vec::new();
    for (line, result) in rdr.deserialize().enumerate() {
        let row: OrgUnitCsvRow =
            result.with_context(|| format!("Failed to deserialize org unit row {}", line + 2))?;
        let level = OrgLevel::parse(&row.level)
            .ok_or_else(|| anyhow!("unknown level '{}' for org unit {}", row.level, row.id))?;
        units.push(OrgUnit {
            id: row.id,
            name: row.name,
            level,
            parent_id: row.parent_id.filter(|p| !p.trim().is_empty()),
        });
    }

    Ok(units)
}

pub fn load_data_elements_csv(csv_path: &Path) -> Result<Vec<DataElement>> {
    let mut rdr = csv::Reader::from_path(csv_path)
        .with_context(|| format!("Failed to open CSV file {:?}", csv_path))?;

    rdr.deserialize::<DataElement>()
        .enumerate()
        .map(|(line, result)| {
            result.with_context(|| format!("Failed to deserialize data element row {}", line + 2))
        })
        .collect()
}

pub fn export_summary_csv(rows: &[CleanedSummary], csv_path: &Path) -> Result<()> {
    let mut wtr = csv::Writer::from_path(csv_path)
        .with_context(|| format!("Failed to create CSV file {:?}", csv_path))?;
    for row in rows {
        wtr.serialize(row)?;
    }
    wtr.flush()?;
    Ok(())
}

// ============================================================================
// SOURCE TABLE WRITES
// ============================================================================

/// Append raw rows (the extractor appends batch by batch).
pub fn insert_raw_rows(conn: &mut Connection, rows: &[RawRow]) -> Result<usize> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO raw_fp_data (org_unit, analytic, category_option, period, value)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for row in rows {
            stmt.execute(params![
                row.org_unit,
                row.analytic,
                row.category_option,
                row.period,
                row.value,
            ])?;
        }
    }
    tx.commit()?;

    info!(rows = rows.len(), "appended raw rows");
    Ok(rows.len())
}

/// Remove raw rows for the given periods before they are re-extracted.
pub fn delete_raw_for_periods(conn: &Connection, periods: &[String]) -> Result<usize> {
    let mut deleted = 0;
    for period in periods {
        deleted += conn.execute("DELETE FROM raw_fp_data WHERE period = ?1", params![period])?;
    }
    Ok(deleted)
}

pub fn replace_org_units(conn: &mut Connection, units: &[OrgUnit]) -> Result<usize> {
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM organisation_units", [])?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO organisation_units (id, name, level, parent_id) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for ou in units {
            stmt.execute(params![ou.id, ou.name, ou.level.depth(), ou.parent_id])?;
        }
    }
    tx.commit()?;
    Ok(units.len())
}

pub fn replace_data_elements(conn: &mut Connection, elements: &[DataElement]) -> Result<usize> {
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM data_elements", [])?;
    {
        let mut stmt = tx.prepare("INSERT INTO data_elements (id, name) VALUES (?1, ?2)")?;
        for de in elements {
            stmt.execute(params![de.id, de.name])?;
        }
    }
    tx.commit()?;
    Ok(elements.len())
}

// ============================================================================
// SOURCE TABLE READS
// ============================================================================

/// Read a column as text whatever storage class the extractor used.
fn text_column(row: &Row, idx: usize) -> rusqlite::Result<Option<String>> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(t) => Some(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(_) => None,
    })
}

pub fn load_raw_rows(conn: &Connection) -> Result<Vec<RawRow>> {
    let mut stmt = conn.prepare(
        "SELECT org_unit, analytic, category_option, period, value
         FROM raw_fp_data
         ORDER BY id",
    )?;

    let rows = stmt
        .query_map([], |row| {
            Ok(RawRow {
                org_unit: text_column(row, 0)?.unwrap_or_default(),
                analytic: text_column(row, 1)?.unwrap_or_default(),
                category_option: text_column(row, 2)?,
                period: text_column(row, 3)?,
                value: text_column(row, 4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows)
}

pub fn load_metadata(conn: &Connection) -> Result<MetadataSnapshot> {
    let mut stmt = conn.prepare(
        "SELECT id, name, level, parent_id FROM organisation_units ORDER BY id",
    )?;
    let raw_units = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                text_column(row, 2)?.unwrap_or_default(),
                row.get::<_, Option<String>>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut org_units = Vec::with_capacity(raw_units.len());
    for (id, name, level, parent_id) in raw_units {
        match OrgLevel::parse(&level) {
            Some(level) => org_units.push(OrgUnit {
                id,
                name,
                level,
                parent_id: parent_id.filter(|p| !p.is_empty()),
            }),
            None => warn!(org_unit = %id, level = %level, "skipping org unit with unknown level"),
        }
    }

    let mut stmt = conn.prepare("SELECT id, name FROM data_elements ORDER BY id")?;
    let data_elements = stmt
        .query_map([], |row| {
            Ok(DataElement {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(MetadataSnapshot {
        org_units,
        data_elements,
    })
}

/// Metadata and raw rows read inside one deferred transaction, so both come
/// from the same database snapshot even while the extractor is writing.
pub fn load_source(conn: &mut Connection) -> Result<(MetadataSnapshot, Vec<RawRow>)> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
    let snapshot = load_metadata(&tx).context("Failed to load metadata")?;
    let rows = load_raw_rows(&tx).context("Failed to load raw_fp_data")?;
    tx.commit()?;
    Ok((snapshot, rows))
}

pub fn count_raw_rows(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM raw_fp_data", [], |row| row.get(0))?;
    Ok(count)
}

// ============================================================================
// SUMMARY TABLE
// ============================================================================

/// Replace the whole summary in one transaction.
///
/// Readers on other connections keep seeing the previous contents until the
/// commit; on any error the transaction rolls back and the old rows stay.
pub fn replace_summary(
    conn: &mut Connection,
    summary_table: &str,
    rows: &[CleanedSummary],
) -> Result<usize> {
    ensure_identifier(summary_table)?;

    let tx = conn.transaction()?;
    tx.execute(&format!("DELETE FROM {}", summary_table), [])?;
    {
        let mut stmt = tx.prepare(&format!(
            "INSERT INTO {} (analytic, method, org_unit, org_level, period, value)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            summary_table
        ))?;
        for row in rows {
            stmt.execute(params![
                row.analytic,
                row.method.as_str(),
                row.org_unit,
                row.org_level.as_str(),
                row.period.format(PERIOD_FORMAT).to_string(),
                row.value,
            ])?;
        }
    }
    tx.commit()?;

    Ok(rows.len())
}

/// Filter used by the visualization side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryFilter {
    pub analytic: Option<String>,
    pub method: Option<Method>,
    pub org_unit: Option<String>,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

pub fn query_summary(
    conn: &Connection,
    summary_table: &str,
    filter: &SummaryFilter,
) -> Result<Vec<CleanedSummary>> {
    ensure_identifier(summary_table)?;

    let mut stmt = conn.prepare(&format!(
        "SELECT analytic, method, org_unit, org_level, period, value
         FROM {}
         WHERE (?1 IS NULL OR analytic = ?1)
           AND (?2 IS NULL OR method = ?2)
           AND (?3 IS NULL OR org_unit = ?3)
           AND (?4 IS NULL OR period >= ?4)
           AND (?5 IS NULL OR period <= ?5)
         ORDER BY period, analytic, method, org_unit",
        summary_table
    ))?;

    let start = filter.start.map(|d| d.format(PERIOD_FORMAT).to_string());
    let end = filter.end.map(|d| d.format(PERIOD_FORMAT).to_string());

    let raw = stmt
        .query_map(
            params![
                filter.analytic,
                filter.method.map(|m| m.as_str()),
                filter.org_unit,
                start,
                end,
            ],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, f64>(5)?,
                ))
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;

    raw.into_iter()
        .map(|(analytic, method, org_unit, org_level, period, value)| {
            Ok(CleanedSummary {
                method: Method::parse(&method)
                    .ok_or_else(|| anyhow!("unknown method '{}' in summary", method))?,
                org_level: OrgLevel::parse(&org_level)
                    .ok_or_else(|| anyhow!("unknown org level '{}' in summary", org_level))?,
                period: NaiveDate::parse_from_str(&period, PERIOD_FORMAT)
                    .with_context(|| format!("bad period '{}' in summary", period))?,
                analytic,
                org_unit,
                value,
            })
        })
        .collect()
}

pub fn count_summary(conn: &Connection, summary_table: &str) -> Result<i64> {
    ensure_identifier(summary_table)?;
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", summary_table),
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}

// ============================================================================
// RUN HISTORY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Failed,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Succeeded => "succeeded",
            RunOutcome::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub report: RunReport,
    /// SHA-256 of the written summary (identical for identical inputs)
    pub digest: Option<String>,
    pub error: Option<String>,
}

pub fn insert_run(conn: &Connection, run: &RunRecord) -> Result<()> {
    let report_json = serde_json::to_string(&run.report)?;

    conn.execute(
        "INSERT INTO pipeline_runs (
            run_id, started_at, finished_at, status, processed, dropped, written, report, digest, error
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            run.run_id,
            run.started_at.to_rfc3339(),
            run.finished_at.to_rfc3339(),
            run.outcome.as_str(),
            run.report.processed as i64,
            run.report.dropped as i64,
            run.report.written as i64,
            report_json,
            run.digest,
            run.error,
        ],
    )?;

    Ok(())
}

/// Most recent runs first.
pub fn list_runs(conn: &Connection, limit: usize) -> Result<Vec<RunRecord>> {
    let mut stmt = conn.prepare(
        "SELECT run_id, started_at, finished_at, status, report, digest, error
         FROM pipeline_runs
         ORDER BY started_at DESC
         LIMIT ?1",
    )?;

    let runs = stmt
        .query_map(params![limit as i64], |row| {
            let started_str: String = row.get(1)?;
            let finished_str: String = row.get(2)?;
            let status: String = row.get(3)?;
            let report_json: String = row.get(4)?;

            let parse_time = |s: &str, idx: usize| {
                DateTime::parse_from_rfc3339(s)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            idx,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })
            };

            Ok(RunRecord {
                run_id: row.get(0)?,
                started_at: parse_time(&started_str, 1)?,
                finished_at: parse_time(&finished_str, 2)?,
                outcome: if status == RunOutcome::Succeeded.as_str() {
                    RunOutcome::Succeeded
                } else {
                    RunOutcome::Failed
                },
                report: serde_json::from_str(&report_json).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        4,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })?,
                digest: row.get(5)?,
                error: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(runs)
}
