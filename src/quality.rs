// 🔍 Raw data quality - duplicate audit
//
// The extractor appends per facility batch, so an interrupted or repeated
// extraction leaves exact duplicate rows in raw_fp_data. The audit only
// reports them; it never removes rows.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use tracing::{info, warn};

use crate::records::RawRow;

/// Number of affected (org_unit, period) pairs echoed to the log.
const LOG_SAMPLE: usize = 5;

/// Stable fingerprint over every column of a raw row.
pub fn row_fingerprint(row: &RawRow) -> String {
    let mut hasher = Sha256::new();
    for field in [
        Some(row.org_unit.as_str()),
        Some(row.analytic.as_str()),
        row.category_option.as_deref(),
        row.period.as_deref(),
        row.value.as_deref(),
    ] {
        // Length-prefix each field so ("ab","c") and ("a","bc") differ
        match field {
            Some(s) => hasher.update(format!("{}:{}|", s.len(), s)),
            None => hasher.update("-|"),
        }
    }
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AffectedKey {
    pub org_unit: String,
    pub period: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DuplicateReport {
    pub total_rows: usize,

    /// Every row that has at least one identical twin (all copies counted)
    pub duplicate_rows: usize,

    /// Distinct (org_unit, period) pairs touched by duplicates, sorted
    pub affected: Vec<AffectedKey>,
}

impl DuplicateReport {
    pub fn has_duplicates(&self) -> bool {
        self.duplicate_rows > 0
    }

    pub fn sample(&self, n: usize) -> &[AffectedKey] {
        &self.affected[..n.min(self.affected.len())]
    }

    pub fn summary(&self) -> String {
        format!(
            "{} of {} rows duplicated across {} (org_unit, period) pairs",
            self.duplicate_rows,
            self.total_rows,
            self.affected.len()
        )
    }
}

/// Find rows duplicated across all columns.
pub fn audit_duplicates(rows: &[RawRow]) -> DuplicateReport {
    let mut counts: HashMap<String, usize> = HashMap::with_capacity(rows.len());
    let fingerprints: Vec<String> = rows.iter().map(row_fingerprint).collect();
    for fp in &fingerprints {
        *counts.entry(fp.clone()).or_insert(0) += 1;
    }

    let mut duplicate_rows = 0;
    let mut affected = BTreeSet::new();
    for (row, fp) in rows.iter().zip(&fingerprints) {
        if counts.get(fp).copied().unwrap_or(0) > 1 {
            duplicate_rows += 1;
            affected.insert(AffectedKey {
                org_unit: row.org_unit.clone(),
                period: row.period.clone().unwrap_or_default(),
            });
        }
    }

    DuplicateReport {
        total_rows: rows.len(),
        duplicate_rows,
        affected: affected.into_iter().collect(),
    }
}

/// Audit and log the findings, the way the pipeline does before transforming.
pub fn log_duplicate_audit(rows: &[RawRow], dataset: &str) -> DuplicateReport {
    info!(dataset, rows = rows.len(), "auditing for duplicate rows");
    let report = audit_duplicates(rows);

    if !report.has_duplicates() {
        info!(dataset, "no duplicates found");
        return report;
    }

    warn!(dataset, "{}", report.summary());
    for key in report.sample(LOG_SAMPLE) {
        warn!(dataset, org_unit = %key.org_unit, period = %key.period, "duplicate rows");
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(org: &str, element: &str, period: &str, value: &str) -> RawRow {
        RawRow {
            org_unit: org.to_string(),
            analytic: element.to_string(),
            category_option: None,
            period: Some(period.to_string()),
            value: Some(value.to_string()),
        }
    }

    #[test]
    fn test_fingerprint_is_stable_and_field_aware() {
        let a = row("F1", "E1", "202401", "5");
        assert_eq!(row_fingerprint(&a), row_fingerprint(&a.clone()));
        assert_eq!(row_fingerprint(&a).len(), 64);

        let shifted = row("F1E", "1", "202401", "5");
        assert_ne!(row_fingerprint(&a), row_fingerprint(&shifted));

        let mut with_cat = a.clone();
        with_cat.category_option = Some("CAT".to_string());
        assert_ne!(row_fingerprint(&a), row_fingerprint(&with_cat));
    }

    #[test]
    fn test_no_duplicates() {
        let rows = vec![row("F1", "E1", "202401", "5"), row("F1", "E1", "202402", "5")];
        let report = audit_duplicates(&rows);
        assert!(!report.has_duplicates());
        assert_eq!(report.total_rows, 2);
        assert!(report.affected.is_empty());
    }

    #[test]
    fn test_duplicates_counted_with_all_copies() {
        let rows = vec![
            row("F2", "E1", "202401", "5"),
            row("F1", "E1", "202401", "5"),
            row("F1", "E1", "202401", "5"),
            row("F1", "E1", "202401", "5"),
            row("F1", "E1", "202401", "6"),
            row("F2", "E1", "202401", "5"),
        ];
        let report = audit_duplicates(&rows);
        assert_eq!(report.duplicate_rows, 5);
        assert_eq!(
            report.affected,
            vec![
                AffectedKey { org_unit: "F1".into(), period: "202401".into() },
                AffectedKey { org_unit: "F2".into(), period: "202401".into() },
            ]
        );
        assert_eq!(report.sample(1).len(), 1);
        assert_eq!(report.sample(10).len(), 2);
    }
}
