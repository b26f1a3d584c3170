// 🏷️ Business Rules - Rules as Data
// Method classification, category splitting, and reporting multipliers.
//
// Every constant lives in RuleSet (overridable from the config file); the
// engine only sequences them.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::error::{ConfigError, RecordError};
use crate::lookup::LookupTables;
use crate::records::{Method, OrgLevel, RawRecord, TransformedRecord};

/// Analytic name of the composite implant category.
pub const TWO_ROD: &str = "2 Rod";

const SHARE_TOLERANCE: f64 = 1e-9;

// ============================================================================
// METHOD RULE
// ============================================================================

/// Derives the method from a data element's display name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodRule {
    /// Rule ID for tracking
    pub id: String,

    /// Pattern to match (supports wildcards with *)
    pub pattern: String,

    pub method: Method,

    /// Priority (higher = applied first)
    #[serde(default)]
    pub priority: i32,
}

impl MethodRule {
    pub fn new(id: &str, pattern: &str, method: Method, priority: i32) -> Self {
        MethodRule {
            id: id.to_string(),
            pattern: pattern.to_string(),
            method,
            priority,
        }
    }

    /// Check if pattern matches the given text
    pub fn matches(&self, text: &str) -> bool {
        let pattern_lower = self.pattern.to_lowercase();
        let text_lower = text.to_lowercase();

        if !pattern_lower.contains('*') {
            return text_lower.contains(&pattern_lower);
        }

        let parts: Vec<&str> = pattern_lower.split('*').collect();
        let first = parts[0];
        let last = parts[parts.len() - 1];

        if !first.is_empty() && !text_lower.starts_with(first) {
            return false;
        }
        if !last.is_empty() && !text_lower.ends_with(last) {
            return false;
        }

        // Middle parts must appear in order
        let mut current_pos = first.len();
        for part in &parts[1..parts.len() - 1] {
            if part.is_empty() {
                continue;
            }
            match text_lower.get(current_pos..).and_then(|rest| rest.find(part)) {
                Some(pos) => current_pos += pos + part.len(),
                None => return false,
            }
        }

        true
    }
}

// ============================================================================
// SPLIT RULE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitPart {
    pub analytic: String,
    pub share: f64,
}

/// Replaces one composite analytic with weighted component analytics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitRule {
    /// Composite analytic being split
    pub source: String,

    pub parts: Vec<SplitPart>,

    /// Restrict the split to one method (None = every method)
    #[serde(default)]
    pub method: Option<Method>,
}

impl SplitRule {
    fn applies_to(&self, analytic: &str, method: Method) -> bool {
        self.source == analytic && self.method.map_or(true, |m| m == method)
    }

    fn share_total(&self) -> f64 {
        self.parts.iter().map(|p| p.share).sum()
    }
}

// ============================================================================
// RULE SET
// ============================================================================

/// Which records reporting multipliers apply to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultiplierScope {
    ServiceOnly,
    AllMethods,
}

impl MultiplierScope {
    fn covers(&self, method: Method) -> bool {
        match self {
            MultiplierScope::ServiceOnly => method == Method::Service,
            MultiplierScope::AllMethods => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleSet {
    /// Data element id → analytic short name (many-to-one)
    pub analytic_ids: BTreeMap<String, String>,

    pub method_rules: Vec<MethodRule>,

    /// Analytic → reporting multiplier (missing = 1.0)
    pub multipliers: BTreeMap<String, f64>,

    pub multiplier_scope: MultiplierScope,

    pub split_rules: Vec<SplitRule>,

    /// org_unit value used for the national rollup rows
    pub national_label: String,
}

impl Default for RuleSet {
    fn default() -> Self {
        let analytic_ids = [
            ("dl4JcBnxu0X", "POPs"),
            ("uHM6lzLXDBd", "POPs"),
            ("tfPZ6sGgh4q", "Non-Hormonal IUCD"),
            ("hRktPfPEegP", "Non-Hormonal IUCD"),
            ("cV4qoKSYiBs", "Male Condoms"),
            ("AVDzuypqGt9", "Male Condoms"),
            ("APbXNRovb5w", "Levoplant"),
            ("CJdFYcZ1zOq", "Implanon"),
            ("XgJfT71Unkn", "Implanon"),
            ("MsS41X1GEFr", "Jadelle"),
            ("zXbxl6y97mi", "Hormonal IUCD"),
            ("Wv02gixbRpT", "Hormonal IUCD"),
            ("Fxb4iVJdw2g", "Female Condoms"),
            ("AR7RhdC90IV", "Female Condoms"),
            ("paDQStynGGD", "EC Pills"),
            ("qaBPR9wbWku", "EC Pills"),
            ("NMCIxSeGpS3", "DMPA-SC"),
            ("hXa1xyUMfTa", "DMPA-SC"),
            ("PgQIx7Hq1kp", "DMPA-IM"),
            ("J6qnTev1LXw", "DMPA-IM"),
            ("fYCo4peO0yE", "Cycle Beads"),
            ("bGGT0F7iRxt", "Cycle Beads"),
            ("BQmcVE8fex4", "COCs"),
            ("hH9gmEmEhH4", "COCs"),
            ("TUHzoPGLM3t", TWO_ROD),
        ]
        .into_iter()
        .map(|(id, name)| (id.to_string(), name.to_string()))
        .collect();

        let multipliers = [
            ("Female Condoms", 10.0),
            ("Male Condoms", 10.0),
            ("COCs", 1.25),
            ("POPs", 0.5),
        ]
        .into_iter()
        .map(|(name, m)| (name.to_string(), m))
        .collect();

        RuleSet {
            analytic_ids,
            // MOH 711 is the service register, MOH 747A the commodity register
            method_rules: vec![
                MethodRule::new("moh_711", "711", Method::Service, 20),
                MethodRule::new("moh_747", "747", Method::Consumption, 10),
            ],
            multipliers,
            multiplier_scope: MultiplierScope::ServiceOnly,
            split_rules: vec![SplitRule {
                source: TWO_ROD.to_string(),
                parts: vec![
                    SplitPart { analytic: "Jadelle".to_string(), share: 0.8 },
                    SplitPart { analytic: "Levoplant".to_string(), share: 0.2 },
                ],
                method: None,
            }],
            national_label: "National".to_string(),
        }
    }
}

impl RuleSet {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for rule in &self.split_rules {
            let total = rule.share_total();
            if (total - 1.0).abs() > SHARE_TOLERANCE || rule.parts.iter().any(|p| p.share < 0.0) {
                return Err(ConfigError::InvalidSplitShares {
                    analytic: rule.source.clone(),
                    total,
                });
            }
        }

        for (analytic, value) in &self.multipliers {
            if !value.is_finite() || *value < 0.0 {
                return Err(ConfigError::InvalidMultiplier {
                    analytic: analytic.clone(),
                    value: *value,
                });
            }
        }

        if self.national_label.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "rules.national_label".to_string(),
                message: "must not be empty".to_string(),
            });
        }

        Ok(())
    }
}

// ============================================================================
// RULE ENGINE
// ============================================================================

pub struct RuleEngine {
    method_rules: Vec<MethodRule>,
    multipliers: HashMap<String, f64>,
    multiplier_scope: MultiplierScope,
    split_rules: Vec<SplitRule>,
}

impl RuleEngine {
    pub fn new(rules: &RuleSet) -> Self {
        let mut method_rules = rules.method_rules.clone();
        method_rules.sort_by(|a, b| b.priority.cmp(&a.priority));

        RuleEngine {
            method_rules,
            multipliers: rules
                .multipliers
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
            multiplier_scope: rules.multiplier_scope,
            split_rules: rules.split_rules.clone(),
        }
    }

    /// Method implied by a data element name (first matching rule wins).
    pub fn classify_method(&self, element_name: &str) -> Option<Method> {
        self.method_rules
            .iter()
            .find(|rule| rule.matches(element_name))
            .map(|rule| rule.method)
    }

    pub fn multiplier_for(&self, analytic: &str, method: Method) -> f64 {
        if !self.multiplier_scope.covers(method) {
            return 1.0;
        }
        self.multipliers.get(analytic).copied().unwrap_or(1.0)
    }

    /// Splits a value into (analytic, value) fragments; identity when no rule applies.
    pub fn split(&self, analytic: &str, method: Method, value: f64) -> Vec<(String, f64)> {
        match self.split_rules.iter().find(|r| r.applies_to(analytic, method)) {
            Some(rule) => rule
                .parts
                .iter()
                .map(|part| (part.analytic.clone(), value * part.share))
                .collect(),
            None => vec![(analytic.to_string(), value)],
        }
    }

    /// Turn one raw record into county-level transformed records.
    ///
    /// Order: analytic/method normalization, category split, multiplier,
    /// org-unit flattening to the county.
    pub fn apply(
        &self,
        record: &RawRecord,
        tables: &LookupTables,
    ) -> Result<Vec<TransformedRecord>, RecordError> {
        let (analytic, method) = tables.resolve_analytic(&record.data_element_id)?;
        let county = tables.county_of(&record.org_unit_id)?;

        let transformed = self
            .split(analytic, method, record.value)
            .into_iter()
            .map(|(part, value)| {
                let multiplier = self.multiplier_for(&part, method);
                TransformedRecord {
                    analytic: part,
                    method,
                    period: record.period,
                    org_unit: county.name.clone(),
                    org_level: OrgLevel::County,
                    value: value * multiplier,
                }
            })
            .collect();

        Ok(transformed)
    }
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new(&RuleSet::default())
    }
}

// ============================================================================
// TESTS
// ============================================================================
