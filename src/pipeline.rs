// 🚀 Pipeline - normalize → consolidate → validate → enrich → aggregate
//
// Each stage returns its data plus its own report; the reports are gathered
// into one RunReport per run. Nothing is shared between runs.

use crate::aggregation::{AggregateGroup, AggregationSummary, Aggregator};
use crate::config::PipelineConfig;
use crate::consolidation::{Consolidator, IngestionReport};
use crate::enrichment::{EnrichedRecord, Enricher, EnrichmentReport};
use crate::error::Result;
use crate::export;
use crate::normalizer::SourceFile;
use crate::registry::{LoadedRegistry, RegistryIndex};
use crate::validation::{ValidationReport, Validator};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

pub const CONSOLIDATED_FILE: &str = "consolidado_despesas.csv";
pub const ENRICHED_FILE: &str = "despesas_enriquecidas.csv";
pub const AGGREGATED_FILE: &str = "despesas_agregadas.csv";
pub const REPORT_FILE: &str = "run_report.json";

// ============================================================================
// RUN REPORT
// ============================================================================

/// Diagnostics for one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub ingestion: IngestionReport,
    pub validation: ValidationReport,
    /// Registry rows dropped at load time for a malformed CNPJ
    pub registry_discarded_invalid: usize,
    pub enrichment: EnrichmentReport,
    pub aggregation: AggregationSummary,
}

impl RunReport {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Every dataset a run produces, plus its report
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    /// Validated + enriched records, one per consolidated row, input order
    pub records: Vec<EnrichedRecord>,
    /// Aggregate groups in ranking order
    pub groups: Vec<AggregateGroup>,
    pub report: RunReport,
}

/// Paths written by `PipelineOutput::write_to`
#[derive(Debug, Clone, PartialEq)]
pub struct OutputFiles {
    pub consolidated: PathBuf,
    pub enriched: PathBuf,
    pub aggregated: PathBuf,
    pub report: PathBuf,
}

impl PipelineOutput {
    /// Write the three tables and the JSON report into `dir`
    pub fn write_to(&self, dir: &Path, config: &PipelineConfig) -> Result<OutputFiles> {
        fs::create_dir_all(dir)?;
        let settings = &config.output;
        let files = OutputFiles {
            consolidated: dir.join(CONSOLIDATED_FILE),
            enriched: dir.join(ENRICHED_FILE),
            aggregated: dir.join(AGGREGATED_FILE),
            report: dir.join(REPORT_FILE),
        };

        export::to_file(&files.consolidated, |w| {
            export::write_consolidated(w, self.records.iter().map(|r| &r.validated), settings)
        })?;
        export::to_file(&files.enriched, |w| {
            export::write_enriched(w, &self.records, settings)
        })?;
        export::to_file(&files.aggregated, |w| {
            export::write_aggregated(w, &self.groups, settings)
        })?;
        export::to_file(&files.report, |w| export::write_json(w, &self.report))?;

        Ok(files)
    }
}

// ============================================================================
// PIPELINE
// ============================================================================

pub struct Pipeline {
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Pipeline { config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run every stage over `sources` with an already loaded registry.
    ///
    /// Fails only when no source yields a usable row.
    pub fn run(&self, sources: &[SourceFile], registry: LoadedRegistry) -> Result<PipelineOutput> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, files = sources.len(), "pipeline started");

        let consolidation = Consolidator::new(&self.config)
            .with_registry_index(RegistryIndex::from_entries(&registry.entries))
            .consolidate(sources)?;

        let (validated, validation) =
            Validator::new(&self.config).validate_batch(consolidation.records);

        let (records, enrichment) = Enricher::new().enrich(validated, registry.entries);

        let (groups, aggregation) = Aggregator::new(&self.config).run(&records);

        let report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            ingestion: consolidation.report,
            validation,
            registry_discarded_invalid: registry.discarded_invalid,
            enrichment,
            aggregation,
        };

        info!(
            %run_id,
            records = records.len(),
            groups = groups.len(),
            "pipeline finished"
        );

        Ok(PipelineOutput {
            records,
            groups,
            report,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
