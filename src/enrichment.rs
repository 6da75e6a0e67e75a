// 🔗 Enricher - left join validated records against the operator registry
//
// The registry is deduplicated first (first entry per CNPJ wins), then every
// validated record looks up its cleaned CNPJ. Misses are flagged, never dropped.

use crate::cnpj;
use crate::flags::{FlagSet, InconsistencyFlag};
use crate::registry::{DedupReport, Registry, RegistryEntry};
use crate::validation::ValidatedRecord;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

const TOP_UNMATCHED: usize = 10;

// ============================================================================
// ENRICHED RECORD
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinStatus {
    Matched,
    Unmatched,
}

impl JoinStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JoinStatus::Matched => "matched",
            JoinStatus::Unmatched => "unmatched",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    pub validated: ValidatedRecord,
    pub registro_ans: Option<String>,
    pub modalidade: Option<String>,
    pub uf: Option<String>,
    pub data_cadastro: Option<NaiveDate>,
    pub razao_social_cadastro: Option<String>,
    pub join_status: JoinStatus,
    /// Validation flags plus CNPJ_SEM_MATCH on a miss
    pub flags: FlagSet,
}

impl EnrichedRecord {
    fn matched(validated: ValidatedRecord, entry: &RegistryEntry) -> Self {
        let flags = validated.flags.clone();
        EnrichedRecord {
            validated,
            registro_ans: Some(entry.registro_ans.clone()),
            modalidade: Some(entry.modalidade.clone()),
            uf: Some(entry.uf.clone()).filter(|uf| !uf.is_empty()),
            data_cadastro: entry.data_cadastro,
            razao_social_cadastro: Some(entry.razao_social.clone()),
            join_status: JoinStatus::Matched,
            flags,
        }
    }

    fn unmatched(validated: ValidatedRecord) -> Self {
        let flags = validated.flags.clone().with(InconsistencyFlag::CnpjSemMatch);
        EnrichedRecord {
            validated,
            registro_ans: None,
            modalidade: None,
            uf: None,
            data_cadastro: None,
            razao_social_cadastro: None,
            join_status: JoinStatus::Unmatched,
            flags,
        }
    }

    pub fn is_matched(&self) -> bool {
        self.join_status == JoinStatus::Matched
    }

    pub fn cnpj(&self) -> &str {
        &self.validated.cnpj
    }
}

// ============================================================================
// ENRICHMENT REPORT
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentReport {
    pub registry_raw_count: usize,
    pub registry_unique_count: usize,
    pub duplicates_removed_count: usize,
    /// (cnpj, entries dropped) in first-seen order
    pub duplicate_cnpjs: Vec<(String, usize)>,
    pub matched: usize,
    pub unmatched: usize,
    /// Percentage of records matched, 2 decimals
    pub match_rate: f64,
    /// Most frequent unmatched CNPJs with their record counts
    pub top_unmatched: Vec<(String, usize)>,
}

impl EnrichmentReport {
    pub fn summary(&self) -> String {
        format!(
            "{} matched, {} unmatched ({:.2}% match), {} registry duplicates removed",
            self.matched, self.unmatched, self.match_rate, self.duplicates_removed_count
        )
    }

    /// Top unmatched CNPJs as "11.444.777/0001-61 (2 records)"; malformed
    /// ones are shown as they arrived
    pub fn top_unmatched_display(&self) -> Vec<String> {
        self.top_unmatched
            .iter()
            .map(|(raw, count)| {
                let shown = match cnpj::format(raw) {
                    Some(formatted) => formatted,
                    None if raw.is_empty() => "<blank>".to_string(),
                    None => raw.clone(),
                };
                format!("{} ({} records)", shown, count)
            })
            .collect()
    }
}

// ============================================================================
// ENRICHER
// ============================================================================

#[derive(Debug, Default)]
pub struct Enricher;

impl Enricher {
    pub fn new() -> Self {
        Enricher
    }

    /// Deduplicate `registry` and left-join `records` against it.
    ///
    /// The output has exactly `records.len()` rows in input order.
    pub fn enrich(
        &self,
        records: Vec<ValidatedRecord>,
        registry: Vec<RegistryEntry>,
    ) -> (Vec<EnrichedRecord>, EnrichmentReport) {
        let (registry, dedup) = Registry::deduplicate(registry);
        self.join(records, &registry, dedup)
    }

    /// Left join against an already deduplicated registry
    pub fn join(
        &self,
        records: Vec<ValidatedRecord>,
        registry: &Registry,
        dedup: DedupReport,
    ) -> (Vec<EnrichedRecord>, EnrichmentReport) {
        let mut enriched = Vec::with_capacity(records.len());
        let mut unmatched_counts: HashMap<String, usize> = HashMap::new();

        for record in records {
            match registry.get(&record.cnpj) {
                Some(entry) => enriched.push(EnrichedRecord::matched(record, entry)),
                None => {
                    *unmatched_counts.entry(record.cnpj.clone()).or_insert(0) += 1;
                    enriched.push(EnrichedRecord::unmatched(record));
                }
            }
        }

        let matched = enriched.iter().filter(|r| r.is_matched()).count();
        let unmatched = enriched.len() - matched;
        let match_rate = if enriched.is_empty() {
            0.0
        } else {
            round2(matched as f64 / enriched.len() as f64 * 100.0)
        };

        let mut top_unmatched: Vec<(String, usize)> = unmatched_counts.into_iter().collect();
        top_unmatched.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top_unmatched.truncate(TOP_UNMATCHED);

        let report = EnrichmentReport {
            registry_raw_count: dedup.raw_count,
            registry_unique_count: registry.len(),
            duplicates_removed_count: dedup.duplicates_removed_count,
            duplicate_cnpjs: dedup.duplicate_cnpjs,
            matched,
            unmatched,
            match_rate,
            top_unmatched,
        };

        info!("enrichment: {}", report.summary());
        for line in report.top_unmatched_display() {
            debug!("CNPJ without registry match: {}", line);
        }

        (enriched, report)
    }
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::consolidation::ConsolidatedRecord;
    use crate::normalizer::NormalizedRecord;
    use crate::validation::Validator;

    fn create_test_record(cnpj: &str, razao: &str, valor: &str) -> ValidatedRecord {
        let consolidated = ConsolidatedRecord {
            record: NormalizedRecord {
                cnpj_raw: cnpj.to_string(),
                razao_social: razao.to_string(),
                trimestre: "1".to_string(),
                ano: "2024".to_string(),
                valor_despesas: valor.to_string(),
                source_file: "1T2024.csv".to_string(),
            },
            row_index: 1,
        };
        Validator::new(&PipelineConfig::default()).validate(consolidated)
    }

    fn scenario_c_registry() -> Vec<RegistryEntry> {
        vec![
            RegistryEntry::new("12345678000190", "111", "PRIMEIRA SAUDE", "Medicina de Grupo", "SP"),
            RegistryEntry::new("12345678000190", "222", "SEGUNDA SAUDE", "Autogestão", "MG"),
        ]
    }

    #[test]
    fn test_duplicate_registry_uses_first_entry() {
        let records = vec![create_test_record("12.345.678/0001-90", "OPERADORA X", "100,00")];

        let (enriched, report) = Enricher::new().enrich(records, scenario_c_registry());

        assert_eq!(report.duplicates_removed_count, 1);
        assert_eq!(report.duplicate_cnpjs, vec![("12345678000190".to_string(), 1)]);
        assert_eq!(enriched.len(), 1);

        let record = &enriched[0];
        assert_eq!(record.join_status, JoinStatus::Matched);
        assert_eq!(record.registro_ans.as_deref(), Some("111"));
        assert_eq!(record.uf.as_deref(), Some("SP"));
        assert_eq!(record.modalidade.as_deref(), Some("Medicina de Grupo"));
        assert_eq!(record.razao_social_cadastro.as_deref(), Some("PRIMEIRA SAUDE"));
        assert!(!record.flags.contains(InconsistencyFlag::CnpjSemMatch));
    }

    #[test]
    fn test_unmatched_record_is_kept_and_flagged() {
        let records = vec![
            create_test_record("11444777000161", "ACME", "100"),
            create_test_record("11444777000161", "ACME", "200"),
            create_test_record("12345678000190", "OPERADORA X", "300"),
        ];

        let (enriched, report) = Enricher::new().enrich(records, scenario_c_registry());

        assert_eq!(enriched.len(), 3);
        assert_eq!(report.matched, 1);
        assert_eq!(report.unmatched, 2);
        assert_eq!(report.match_rate, 33.33);
        assert_eq!(report.top_unmatched, vec![("11444777000161".to_string(), 2)]);
        assert_eq!(report.top_unmatched_display(), vec!["11.444.777/0001-61 (2 records)"]);

        let miss = &enriched[0];
        assert_eq!(miss.join_status, JoinStatus::Unmatched);
        assert!(miss.flags.contains(InconsistencyFlag::CnpjSemMatch));
        assert!(miss.uf.is_none());
        assert!(miss.registro_ans.is_none());
        // validation flags stay on the validated record
        assert!(!miss.validated.flags.contains(InconsistencyFlag::CnpjSemMatch));
    }

    #[test]
    fn test_flags_are_carried_forward() {
        let records = vec![create_test_record("11444777000160", "", "-5")];

        let (enriched, _) = Enricher::new().enrich(records, Vec::new());

        let flags = &enriched[0].flags;
        assert!(flags.contains(InconsistencyFlag::CnpjInvalido));
        assert!(flags.contains(InconsistencyFlag::RazaoVazia));
        assert!(flags.contains(InconsistencyFlag::ValorNegativo));
        assert!(flags.contains(InconsistencyFlag::CnpjSemMatch));
        assert_eq!(flags.len(), 4);
    }

    #[test]
    fn test_empty_input() {
        let (enriched, report) = Enricher::new().enrich(Vec::new(), scenario_c_registry());
        assert!(enriched.is_empty());
        assert_eq!(report.match_rate, 0.0);
        assert_eq!(report.registry_unique_count, 1);
    }
}
