// 📄 Record types flowing through the pipeline
//
// RawRow (untyped, as extracted) → RawRecord (validated) → TransformedRecord
// (in memory) → CleanedSummary (persisted)

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::RecordError;

// ============================================================================
// METHOD
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Method {
    /// Commodity issued (MOH 747A)
    Consumption,

    /// Service rendered (MOH 711)
    Service,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Consumption => "Consumption",
            Method::Service => "Service",
        }
    }

    pub fn parse(s: &str) -> Option<Method> {
        match s.trim().to_lowercase().as_str() {
            "consumption" => Some(Method::Consumption),
            "service" => Some(Method::Service),
            _ => None,
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// ORG LEVEL
// ============================================================================

/// Administrative level, ordered root first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OrgLevel {
    Country,
    County,
    SubCounty,
    Ward,
    Facility,
}

impl OrgLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrgLevel::Country => "Country",
            OrgLevel::County => "County",
            OrgLevel::SubCounty => "SubCounty",
            OrgLevel::Ward => "Ward",
            OrgLevel::Facility => "Facility",
        }
    }

    /// DHIS2 level number (1 = Country ... 5 = Facility).
    pub fn depth(&self) -> u8 {
        match self {
            OrgLevel::Country => 1,
            OrgLevel::County => 2,
            OrgLevel::SubCounty => 3,
            OrgLevel::Ward => 4,
            OrgLevel::Facility => 5,
        }
    }

    pub fn from_depth(depth: u8) -> Option<OrgLevel> {
        match depth {
            1 => Some(OrgLevel::Country),
            2 => Some(OrgLevel::County),
            3 => Some(OrgLevel::SubCounty),
            4 => Some(OrgLevel::Ward),
            5 => Some(OrgLevel::Facility),
            _ => None,
        }
    }

    /// Accepts either a level number ("2") or a name ("County", "sub-county").
    pub fn parse(s: &str) -> Option<OrgLevel> {
        let trimmed = s.trim();
        if let Ok(depth) = trimmed.parse::<u8>() {
            return OrgLevel::from_depth(depth);
        }

        let normalized: String = trimmed
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect::<String>()
            .to_lowercase();

        match normalized.as_str() {
            "country" | "national" => Some(OrgLevel::Country),
            "county" => Some(OrgLevel::County),
            "subcounty" => Some(OrgLevel::SubCounty),
            "ward" => Some(OrgLevel::Ward),
            "facility" => Some(OrgLevel::Facility),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrgLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// PERIOD PARSING
// ============================================================================

/// Parse a reporting period into the first day of its month.
///
/// Accepts `YYYYMM`, `YYYY-MM`, `YYYY-MM-DD` and timestamps starting with an
/// ISO date (`2024-01-01T00:00:00`).
pub fn parse_period(raw: &str) -> Result<NaiveDate, RecordError> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(RecordError::malformed("missing period"));
    }

    let date = if s.len() == 6 && s.chars().all(|c| c.is_ascii_digit()) {
        NaiveDate::parse_from_str(&format!("{}01", s), "%Y%m%d").ok()
    } else if s.len() == 7 {
        NaiveDate::parse_from_str(&format!("{}-01", s), "%Y-%m-%d").ok()
    } else if let Some(day) = s.get(..10) {
        NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
    } else {
        None
    };

    date.and_then(first_day_of_month)
        .ok_or_else(|| RecordError::malformed(format!("unparseable period '{}'", s)))
}

pub fn first_day_of_month(date: NaiveDate) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(date.year(), date.month(), 1)
}

// ============================================================================
// RAW ROW / RAW RECORD
// ============================================================================

/// One row of `raw_fp_data` exactly as the extractor stored it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRow {
    pub org_unit: String,

    /// Data element / indicator id
    pub analytic: String,

    #[serde(default)]
    pub category_option: Option<String>,

    #[serde(default)]
    pub period: Option<String>,

    #[serde(default)]
    pub value: Option<String>,
}

/// A validated observation. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub org_unit_id: String,
    pub data_element_id: String,
    pub category_option_id: Option<String>,
    pub period: NaiveDate,
    pub value: f64,
}

impl TryFrom<&RawRow> for RawRecord {
    type Error = RecordError;

    fn try_from(row: &RawRow) -> Result<Self, Self::Error> {
        let period = match row.period.as_deref() {
            Some(p) => parse_period(p)?,
            None => return Err(RecordError::malformed("missing period")),
        };

        let raw_value = row
            .value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| RecordError::malformed("missing value"))?;

        let value: f64 = raw_value
            .parse()
            .map_err(|_| RecordError::malformed(format!("value '{}' is not numeric", raw_value)))?;

        if !value.is_finite() {
            return Err(RecordError::malformed(format!("value '{}' is not finite", raw_value)));
        }
        if value < 0.0 {
            return Err(RecordError::malformed(format!("value {} is negative", value)));
        }

        Ok(RawRecord {
            org_unit_id: row.org_unit.trim().to_string(),
            data_element_id: row.analytic.trim().to_string(),
            category_option_id: row
                .category_option
                .as_deref()
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(String::from),
            period,
            value,
        })
    }
}

// ============================================================================
// TRANSFORMED RECORD / CLEANED SUMMARY
// ============================================================================

/// Output of the rule engine; possibly a fractional split of one raw record.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformedRecord {
    pub analytic: String,
    pub method: Method,
    pub period: NaiveDate,
    pub org_unit: String,
    pub org_level: OrgLevel,
    pub value: f64,
}

/// Grouping key of the summary table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SummaryKey {
    pub analytic: String,
    pub method: Method,
    pub org_unit: String,
    pub period: NaiveDate,
}

/// One row of `cleaned_fp_summary_data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanedSummary {
    pub analytic: String,
    pub method: Method,
    pub org_unit: String,
    pub org_level: OrgLevel,
    pub period: NaiveDate,
    pub value: f64,
}

impl CleanedSummary {
    pub fn key(&self) -> SummaryKey {
        SummaryKey {
            analytic: self.analytic.clone(),
            method: self.method,
            org_unit: self.org_unit.clone(),
            period: self.period,
        }
    }
}
