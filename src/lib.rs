// ANS Expense Pipeline - Core Library
// Quarterly expense files → consolidated, validated, enriched and aggregated tables

pub mod error;
pub mod config;
pub mod logging;
pub mod flags;          // Inconsistency flags (set-valued, never remove records)
pub mod cnpj;           // CNPJ cleaning + modulo-11 check digits
pub mod normalizer;     // Stage 1: format detection + header aliasing
pub mod consolidation;  // Stage 2: one file (or archive member) at a time into one table
pub mod validation;     // Stage 3: flag, never drop
pub mod registry;       // Operator registry load + dedup
pub mod enrichment;     // Stage 4: left join on CNPJ
pub mod aggregation;    // Stage 5: per (razão social, UF) statistics
pub mod export;
pub mod pipeline;

// Re-export commonly used types
pub use error::{PipelineError, Result};
pub use config::{
    PipelineConfig, AliasTable, ValidationSettings, AggregationSettings,
    IngestionSettings, OutputSettings,
};
pub use flags::{FlagSet, InconsistencyFlag};
pub use normalizer::{
    FormatNormalizer, HeaderMapping, NormalizedRecord, Period, RecordStream,
    SourceFile, SourceFormat, SourceReader, SourceShape, detect_format, get_reader,
};
pub use consolidation::{
    ConsolidatedRecord, Consolidation, Consolidator, FileReport, FileStatus,
    IngestionReport, discover_sources, select_recent_periods,
};
pub use validation::{ValidatedRecord, ValidationReport, Validator};
pub use registry::{
    DedupReport, LoadedRegistry, Registry, RegistryEntry, RegistryIndex, load_registry,
};
pub use enrichment::{EnrichedRecord, Enricher, EnrichmentReport, JoinStatus};
pub use aggregation::{AggregateGroup, AggregationSummary, Aggregator};
pub use pipeline::{OutputFiles, Pipeline, PipelineOutput, RunReport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
