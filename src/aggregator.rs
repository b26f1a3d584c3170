// ➕ Aggregator - county sums and the national rollup
//
// Contributions are kept per key and summed in sorted order, so the output is
// bit-identical however the input was ordered or partitioned.

use std::collections::{BTreeMap, HashMap};

use crate::records::{CleanedSummary, Method, OrgLevel, SummaryKey, TransformedRecord};

// ============================================================================
// ACCUMULATOR
// ============================================================================

/// Partial aggregation state; one per worker, merged before `finish`.
#[derive(Debug, Clone, Default)]
pub struct Accumulator {
    contributions: HashMap<SummaryKey, Vec<f64>>,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, record: TransformedRecord) {
        let key = SummaryKey {
            analytic: record.analytic,
            method: record.method,
            org_unit: record.org_unit,
            period: record.period,
        };
        self.contributions.entry(key).or_default().push(record.value);
    }

    pub fn merge(&mut self, other: Accumulator) {
        for (key, mut values) in other.contributions {
            self.contributions.entry(key).or_default().append(&mut values);
        }
    }

    /// Number of distinct county-level keys seen so far.
    pub fn key_count(&self) -> usize {
        self.contributions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contributions.is_empty()
    }
}

impl Extend<TransformedRecord> for Accumulator {
    fn extend<I: IntoIterator<Item = TransformedRecord>>(&mut self, iter: I) {
        for record in iter {
            self.add(record);
        }
    }
}

fn canonical_sum(values: &mut [f64]) -> f64 {
    values.sort_by(|a, b| a.total_cmp(b));
    values.iter().sum()
}

// ============================================================================
// AGGREGATOR
// ============================================================================

pub struct Aggregator {
    national_label: String,
}

impl Aggregator {
    pub fn new(national_label: impl Into<String>) -> Self {
        Aggregator {
            national_label: national_label.into(),
        }
    }

    /// Group, sum, and add national rows in one call.
    pub fn aggregate<I>(&self, records: I) -> Vec<CleanedSummary>
    where
        I: IntoIterator<Item = TransformedRecord>,
    {
        let mut acc = Accumulator::new();
        acc.extend(records);
        self.finish(acc)
    }

    /// County rows plus one national row per (analytic, method, period),
    /// sorted by (analytic, method, org_unit, period).
    pub fn finish(&self, acc: Accumulator) -> Vec<CleanedSummary> {
        let county: BTreeMap<SummaryKey, f64> = acc
            .contributions
            .into_iter()
            .map(|(key, mut values)| {
                let total = canonical_sum(&mut values);
                (key, total)
            })
            .collect();

        // County rows are visited in key order, which fixes the summation order
        let mut national: BTreeMap<(String, Method, chrono::NaiveDate), f64> = BTreeMap::new();
        for (key, value) in &county {
            *national
                .entry((key.analytic.clone(), key.method, key.period))
                .or_insert(0.0) += value;
        }

        let mut rows: Vec<CleanedSummary> = county
            .into_iter()
            .map(|(key, value)| CleanedSummary {
                analytic: key.analytic,
                method: key.method,
                org_unit: key.org_unit,
                org_level: OrgLevel::County,
                period: key.period,
                value,
            })
            .chain(national.into_iter().map(|((analytic, method, period), value)| {
                CleanedSummary {
                    analytic,
                    method,
                    org_unit: self.national_label.clone(),
                    org_level: OrgLevel::Country,
                    period,
                    value,
                }
            }))
            .collect();

        rows.sort_by(|a, b| a.key().cmp(&b.key()));
        rows
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new("National")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn rec(analytic: &str, method: Method, county: &str, month: u32, value: f64) -> TransformedRecord {
        TransformedRecord {
            analytic: analytic.to_string(),
            method,
            period: NaiveDate::from_ymd_opt(2024, month, 1).unwrap(),
            org_unit: county.to_string(),
            org_level: OrgLevel::County,
            value,
        }
    }

    fn sample() -> Vec<TransformedRecord> {
        vec![
            rec("COCs", Method::Service, "Kisumu", 1, 0.1),
            rec("COCs", Method::Service, "Kisumu", 1, 0.2),
            rec("COCs", Method::Service, "Nairobi", 1, 0.3),
            rec("COCs", Method::Service, "Nairobi", 2, 1e16),
            rec("COCs", Method::Service, "Nairobi", 2, 1.0),
            rec("COCs", Method::Service, "Nairobi", 2, -0.0),
            rec("COCs", Method::Consumption, "Nairobi", 1, 5.0),
            rec("Jadelle", Method::Service, "Mombasa", 1, 80.0),
            rec("Jadelle", Method::Service, "Nairobi", 1, 8.0),
        ]
    }

    #[test]
    fn test_empty_input() {
        assert!(Aggregator::default().aggregate(Vec::new()).is_empty());
    }

    #[test]
    fn test_county_and_national_rows() {
        let rows = Aggregator::default().aggregate(sample());

        let get = |analytic: &str, method: Method, org: &str, month: u32| {
            rows.iter()
                .find(|r| {
                    r.analytic == analytic
                        && r.method == method
                        && r.org_unit == org
                        && r.period == NaiveDate::from_ymd_opt(2024, month, 1).unwrap()
                })
                .map(|r| r.value)
        };

        assert!((get("COCs", Method::Service, "Kisumu", 1).unwrap() - 0.3).abs() < 1e-12);
        assert!((get("COCs", Method::Service, "National", 1).unwrap() - 0.6).abs() < 1e-12);
        assert_eq!(get("COCs", Method::Consumption, "National", 1), Some(5.0));
        assert_eq!(get("Jadelle", Method::Service, "National", 1), Some(88.0));
        assert_eq!(get("Jadelle", Method::Consumption, "National", 1), None);

        // No duplicate keys
        let mut keys: Vec<_> = rows.iter().map(|r| r.key()).collect();
        let before = keys.len();
        keys.dedup();
        assert_eq!(before, keys.len());
    }

    #[test]
    fn test_national_equals_sum_of_counties() {
        let rows = Aggregator::default().aggregate(sample());

        for national in rows.iter().filter(|r| r.org_level == OrgLevel::Country) {
            let county_total: f64 = rows
                .iter()
                .filter(|r| {
                    r.org_level == OrgLevel::County
                        && r.analytic == national.analytic
                        && r.method == national.method
                        && r.period == national.period
                })
                .map(|r| r.value)
                .sum();
            assert_eq!(national.value, county_total);
        }
    }

    #[test]
    fn test_order_independent() {
        let forward = Aggregator::default().aggregate(sample());

        let mut reversed_input = sample();
        reversed_input.reverse();
        let reversed = Aggregator::default().aggregate(reversed_input);

        let mut rotated_input = sample();
        rotated_input.rotate_left(4);
        let rotated = Aggregator::default().aggregate(rotated_input);

        assert_eq!(forward, reversed);
        assert_eq!(forward, rotated);
    }

    #[test]
    fn test_partitioned_merge_matches_single_pass() {
        let single = Aggregator::default().aggregate(sample());

        let records = sample();
        let (left, right) = records.split_at(5);
        let mut a = Accumulator::new();
        a.extend(right.to_vec());
        let mut b = Accumulator::new();
        b.extend(left.to_vec());
        a.merge(b);

        assert_eq!(Aggregator::default().finish(a), single);
    }

    #[test]
    fn test_custom_national_label() {
        let rows = Aggregator::new("Kenya").aggregate(sample());
        assert!(rows.iter().any(|r| r.org_unit == "Kenya"));
        assert!(!rows.iter().any(|r| r.org_unit == "National"));
    }
}
