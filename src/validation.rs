// ✅ Validator - flag, never drop
//
// Every rule is evaluated independently and only attaches flags; the output
// always has exactly as many rows as the consolidated input.

use crate::cnpj;
use crate::config::{PipelineConfig, ValidationSettings};
use crate::consolidation::ConsolidatedRecord;
use crate::flags::{FlagSet, InconsistencyFlag};
use crate::normalizer::{parse_decimal, parse_integer};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

// ============================================================================
// VALIDATED RECORD
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedRecord {
    pub consolidated: ConsolidatedRecord,
    /// Digits-only CNPJ (may be any length)
    pub cnpj: String,
    /// Trimmed razão social
    pub razao_social: String,
    pub trimestre: Option<i64>,
    pub ano: Option<i64>,
    pub valor_despesas: Option<f64>,
    pub flags: FlagSet,
}

impl ValidatedRecord {
    pub fn has_flag(&self, flag: InconsistencyFlag) -> bool {
        self.flags.contains(flag)
    }
}

// ============================================================================
// VALIDATION REPORT
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub total_records: usize,
    pub flagged_records: usize,
    /// Every flag kind, 0 when never raised
    pub flag_counts: BTreeMap<InconsistencyFlag, usize>,
    /// CNPJs reported under more than one razão social (audit only)
    pub divergent_cnpjs: Vec<String>,
}

impl ValidationReport {
    pub fn count(&self, flag: InconsistencyFlag) -> usize {
        self.flag_counts.get(&flag).copied().unwrap_or(0)
    }

    pub fn clean_records(&self) -> usize {
        self.total_records - self.flagged_records
    }

    pub fn summary(&self) -> String {
        let raised: Vec<String> = self
            .flag_counts
            .iter()
            .filter(|(_, n)| **n > 0)
            .map(|(flag, n)| format!("{}={}", flag, n))
            .collect();
        format!(
            "{} records, {} flagged ({})",
            self.total_records,
            self.flagged_records,
            if raised.is_empty() {
                "none".to_string()
            } else {
                raised.join(", ")
            }
        )
    }
}

// ============================================================================
// VALIDATOR
// ============================================================================

pub struct Validator {
    settings: ValidationSettings,
}

impl Validator {
    pub fn new(config: &PipelineConfig) -> Self {
        Validator {
            settings: config.validation.clone(),
        }
    }

    pub fn with_settings(settings: ValidationSettings) -> Self {
        Validator { settings }
    }

    /// Validate one record
    pub fn validate(&self, consolidated: ConsolidatedRecord) -> ValidatedRecord {
        let mut flags = FlagSet::new();
        let raw = &consolidated.record;

        // Rule 1: CNPJ length + check digits
        let cnpj = cnpj::clean(&raw.cnpj_raw);
        if cnpj::check(&cnpj).is_err() {
            flags.insert(InconsistencyFlag::CnpjInvalido);
        }

        // Rule 2: razão social present
        let razao_social = raw.razao_social.trim().to_string();
        if razao_social.is_empty() || razao_social.eq_ignore_ascii_case("nan") {
            flags.insert(InconsistencyFlag::RazaoVazia);
        }

        // Rule 3: valor parses, sign
        let valor_despesas = parse_decimal(&raw.valor_despesas);
        if let Some(flag) = Self::value_flag(valor_despesas) {
            flags.insert(flag);
        }

        // Rule 4: trimestre in 1..=4
        let trimestre = parse_integer(&raw.trimestre);
        if !matches!(trimestre, Some(1..=4)) {
            flags.insert(InconsistencyFlag::TrimestreInvalido);
        }

        // Rule 5: ano within configured bounds
        let ano = parse_integer(&raw.ano);
        let ano_ok = ano
            .map(|a| a >= self.settings.ano_min as i64 && a <= self.settings.ano_max as i64)
            .unwrap_or(false);
        if !ano_ok {
            flags.insert(InconsistencyFlag::AnoInvalido);
        }

        ValidatedRecord {
            consolidated,
            cnpj,
            razao_social,
            trimestre,
            ano,
            valor_despesas,
            flags,
        }
    }

    /// VALOR_NULO, VALOR_NEGATIVO and VALOR_ZERADO are mutually exclusive
    fn value_flag(valor: Option<f64>) -> Option<InconsistencyFlag> {
        match valor {
            None => Some(InconsistencyFlag::ValorNulo),
            Some(v) if v < 0.0 => Some(InconsistencyFlag::ValorNegativo),
            Some(v) if v == 0.0 => Some(InconsistencyFlag::ValorZerado),
            Some(_) => None,
        }
    }

    /// Validate the whole consolidated table; cardinality is preserved
    pub fn validate_batch(
        &self,
        records: Vec<ConsolidatedRecord>,
    ) -> (Vec<ValidatedRecord>, ValidationReport) {
        let validated: Vec<ValidatedRecord> =
            records.into_iter().map(|r| self.validate(r)).collect();
        let report = Self::batch_summary(&validated);

        info!("validation: {}", report.summary());
        if !report.divergent_cnpjs.is_empty() {
            warn!(
                count = report.divergent_cnpjs.len(),
                "CNPJs reported under more than one razão social"
            );
        }

        (validated, report)
    }

    /// Summary counts for a validated batch
    pub fn batch_summary(records: &[ValidatedRecord]) -> ValidationReport {
        let mut flag_counts: BTreeMap<InconsistencyFlag, usize> =
            InconsistencyFlag::ALL.iter().map(|f| (*f, 0)).collect();
        let mut names_by_cnpj: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        let mut flagged_records = 0;

        for record in records {
            if !record.flags.is_empty() {
                flagged_records += 1;
            }
            for flag in record.flags.iter() {
                *flag_counts.entry(flag).or_insert(0) += 1;
            }
            if !record.cnpj.is_empty() && !record.razao_social.is_empty() {
                names_by_cnpj
                    .entry(record.cnpj.as_str())
                    .or_default()
                    .insert(record.razao_social.as_str());
            }
        }

        let divergent_cnpjs = names_by_cnpj
            .into_iter()
            .filter(|(_, names)| names.len() > 1)
            .map(|(cnpj, _)| cnpj.to_string())
            .collect();

        ValidationReport {
            total_records: records.len(),
            flagged_records,
            flag_counts,
            divergent_cnpjs,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
