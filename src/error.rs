// ⚠️ Error taxonomy for the cleaning pipeline
//
// Two tiers:
// - RecordError: one raw row is skipped and counted, the run continues
// - PipelineError: the whole run aborts and the summary table is left untouched

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::RunReport;

// ============================================================================
// IDENTIFIER KINDS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IdentifierKind {
    /// Organisation unit (facility, ward, sub-county, county, country)
    OrgUnit,

    /// Data element / indicator id
    DataElement,
}

impl IdentifierKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentifierKind::OrgUnit => "org_unit",
            IdentifierKind::DataElement => "data_element",
        }
    }
}

impl std::fmt::Display for IdentifierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// PER-RECORD ERRORS (recoverable)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecordError {
    /// No metadata entry exists for this identifier.
    #[error("unresolved {kind} identifier '{id}'")]
    UnresolvedIdentifier { kind: IdentifierKind, id: String },

    /// The data element resolved but its name carries no method marker.
    #[error("data element '{id}' has no Service/Consumption marker")]
    UnresolvedMethod { id: String },

    /// The org unit resolved but has no County ancestor (e.g. the Country node).
    #[error("org unit '{id}' has no county ancestor")]
    NoCountyAncestor { id: String },

    /// Missing or unparseable value/period.
    #[error("malformed record: {reason}")]
    MalformedRecord { reason: String },
}

impl RecordError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        RecordError::MalformedRecord { reason: reason.into() }
    }

    pub fn unresolved(kind: IdentifierKind, id: impl Into<String>) -> Self {
        RecordError::UnresolvedIdentifier { kind, id: id.into() }
    }

    /// Bucket used for the run report's drop counters.
    pub fn reason(&self) -> DropReason {
        match self {
            RecordError::UnresolvedIdentifier { kind: IdentifierKind::OrgUnit, .. } => {
                DropReason::UnresolvedOrgUnit
            }
            RecordError::UnresolvedIdentifier { kind: IdentifierKind::DataElement, .. } => {
                DropReason::UnresolvedDataElement
            }
            RecordError::UnresolvedMethod { .. } => DropReason::UnresolvedMethod,
            RecordError::NoCountyAncestor { .. } => DropReason::NoCountyAncestor,
            RecordError::MalformedRecord { .. } => DropReason::Malformed,
        }
    }
}

/// Why a raw record did not make it into the summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    UnresolvedOrgUnit,
    UnresolvedDataElement,
    UnresolvedMethod,
    NoCountyAncestor,
    Malformed,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::UnresolvedOrgUnit => "unresolved_org_unit",
            DropReason::UnresolvedDataElement => "unresolved_data_element",
            DropReason::UnresolvedMethod => "unresolved_method",
            DropReason::NoCountyAncestor => "no_county_ancestor",
            DropReason::Malformed => "malformed",
        }
    }
}

// ============================================================================
// RUN-LEVEL ERRORS (fatal)
// ============================================================================

#[derive(Debug, Error)]
pub enum PipelineError {
    /// A metadata table needed for resolution has no rows.
    #[error("lookup table '{0}' is empty")]
    LookupTableEmpty(String),

    /// The source tables could not be read.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// The summary replace was rolled back.
    #[error("write failure: {0}")]
    WriteFailure(String),

    /// Configuration rejected before the run started.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A County shares its name with the national rollup label.
    #[error("county '{0}' has the same name as the national label; set rules.national_label to a distinct value")]
    NationalLabelCollision(String),

    /// The background run thread could not be started.
    #[error("could not start run: {0}")]
    Spawn(String),
}

impl PipelineError {
    pub fn source_unavailable(err: impl std::fmt::Display) -> Self {
        PipelineError::SourceUnavailable(err.to_string())
    }

    pub fn write_failure(err: impl std::fmt::Display) -> Self {
        PipelineError::WriteFailure(err.to_string())
    }
}

/// A fatal run failure together with the counts gathered before it happened.
#[derive(Debug, Error)]
#[error("pipeline run failed: {error}")]
pub struct PipelineFailure {
    #[source]
    pub error: PipelineError,
    pub report: RunReport,
}

// ============================================================================
// CONFIGURATION ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("split rule for '{analytic}' has shares summing to {total}, expected 1.0")]
    InvalidSplitShares { analytic: String, total: f64 },

    #[error("multiplier for '{analytic}' must be finite and non-negative, got {value}")]
    InvalidMultiplier { analytic: String, value: f64 },

    #[error("invalid setting '{key}': {message}")]
    Invalid { key: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_error_reasons() {
        let err = RecordError::unresolved(IdentifierKind::DataElement, "XYZ");
        assert_eq!(err.reason(), DropReason::UnresolvedDataElement);
        assert!(err.to_string().contains("XYZ"));

        let err = RecordError::unresolved(IdentifierKind::OrgUnit, "FAC1");
        assert_eq!(err.reason(), DropReason::UnresolvedOrgUnit);

        let err = RecordError::malformed("value 'abc' is not numeric");
        assert_eq!(err.reason(), DropReason::Malformed);
        assert!(err.to_string().contains("abc"));
    }

    #[test]
    fn test_config_error_converts_to_pipeline_error() {
        let err: PipelineError = ConfigError::InvalidSplitShares {
            analytic: "2 Rod".into(),
            total: 0.9,
        }
        .into();
        assert!(err.to_string().contains("2 Rod"));
    }
}
