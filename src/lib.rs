// Family Planning Pipeline - Core Library
// Exposes all modules for use in CLI, API server, and tests

pub mod error;      // Record-level and run-level error taxonomy
pub mod records;    // Raw rows, validated records, summary rows
pub mod lookup;     // Metadata snapshot → lookup tables
pub mod rules;      // Method, split, and multiplier rules as data
pub mod aggregator; // County sums + national rollup
pub mod quality;    // Duplicate audit over raw rows
pub mod config;     // TOML + env configuration
pub mod db;         // SQLite storage (WAL) + CSV import/export
pub mod pipeline;   // Orchestration and run reports
pub mod task;       // Background runs with status polling
pub mod logging;    // tracing subscriber setup

// Re-export commonly used types
pub use error::{
    ConfigError, DropReason, IdentifierKind, PipelineError, PipelineFailure, RecordError,
};
pub use records::{
    parse_period, CleanedSummary, Method, OrgLevel, RawRecord, RawRow, SummaryKey,
    TransformedRecord,
};
pub use lookup::{AnalyticEntry, DataElement, LookupTables, MetadataSnapshot, OrgUnit};
pub use rules::{MethodRule, MultiplierScope, RuleEngine, RuleSet, SplitPart, SplitRule, TWO_ROD};
pub use aggregator::{Accumulator, Aggregator};
pub use quality::{audit_duplicates, DuplicateReport};
pub use config::{DatabaseConfig, PipelineConfig, RuntimeConfig};
pub use db::{query_summary, setup_database, RunOutcome, RunRecord, SummaryFilter};
pub use pipeline::{open_database, run_pipeline, summary_digest, Pipeline, RunReport};
pub use task::{spawn_run, RunHandle, RunStatus};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
