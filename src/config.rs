// ⚙️ Pipeline configuration - aliases and thresholds as data
//
// Loaded from TOML; every section is optional and falls back to the defaults
// below, which cover the header spellings seen in the regulator's files.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

// ============================================================================
// CANONICAL FIELDS
// ============================================================================

pub const FIELD_CNPJ: &str = "cnpj";
pub const FIELD_RAZAO_SOCIAL: &str = "razao_social";
pub const FIELD_TRIMESTRE: &str = "trimestre";
pub const FIELD_ANO: &str = "ano";
pub const FIELD_VALOR_DESPESAS: &str = "valor_despesas";

/// Canonical expense schema, in output order
pub const EXPENSE_FIELDS: [&str; 5] = [
    FIELD_CNPJ,
    FIELD_RAZAO_SOCIAL,
    FIELD_TRIMESTRE,
    FIELD_ANO,
    FIELD_VALOR_DESPESAS,
];

pub const FIELD_REGISTRO_ANS: &str = "registro_ans";
pub const FIELD_MODALIDADE: &str = "modalidade";
pub const FIELD_UF: &str = "uf";
pub const FIELD_DATA_CADASTRO: &str = "data_cadastro";

/// Accounting-line description (REG_ANS balance files)
pub const FIELD_DESCRICAO: &str = "descricao";

/// Fields an accounting balance file must provide
pub const ACCOUNTING_FIELDS: [&str; 5] = [
    FIELD_REGISTRO_ANS,
    FIELD_DESCRICAO,
    FIELD_TRIMESTRE,
    FIELD_ANO,
    FIELD_VALOR_DESPESAS,
];

/// Canonical registry schema
pub const REGISTRY_FIELDS: [&str; 6] = [
    FIELD_CNPJ,
    FIELD_REGISTRO_ANS,
    FIELD_RAZAO_SOCIAL,
    FIELD_MODALIDADE,
    FIELD_UF,
    FIELD_DATA_CADASTRO,
];

/// canonical field → accepted header spellings
pub type AliasTable = BTreeMap<String, Vec<String>>;

fn table(entries: &[(&str, &[&str])]) -> AliasTable {
    entries
        .iter()
        .map(|(field, spellings)| {
            (
                field.to_string(),
                spellings.iter().map(|s| s.to_string()).collect(),
            )
        })
        .collect()
}

pub fn default_expense_aliases() -> AliasTable {
    table(&[
        (
            FIELD_CNPJ,
            &["cnpj", "cnpj_operadora", "cd_cnpj", "num_cnpj", "nr_cnpj"],
        ),
        (
            FIELD_RAZAO_SOCIAL,
            &[
                "razao_social",
                "razão social",
                "razaosocial",
                "nm_razao_social",
                "nome",
                "operadora",
                "nome_operadora",
            ],
        ),
        (
            FIELD_TRIMESTRE,
            &["trimestre", "tri", "cd_trimestre", "num_trimestre", "nr_trimestre"],
        ),
        (FIELD_ANO, &["ano", "ano_competencia", "cd_ano", "exercicio"]),
        (
            FIELD_VALOR_DESPESAS,
            &[
                "valor_despesas",
                "valor_despesa",
                "valor",
                "vl_despesa",
                "vl_despesas",
                "despesa",
                "despesas",
                "eventos",
                "sinistros",
                "vl_saldo_final",
            ],
        ),
        // Accounting balance files carry these instead of cnpj/razao_social
        (
            FIELD_REGISTRO_ANS,
            &["registro_ans", "reg_ans", "cd_registro_ans", "registro_operadora"],
        ),
        (
            FIELD_DESCRICAO,
            &["descricao", "ds_conta", "descricao_conta", "ds_conta_contabil"],
        ),
    ])
}

pub fn default_registry_aliases() -> AliasTable {
    table(&[
        (FIELD_CNPJ, &["cnpj", "cd_cnpj", "nr_cnpj"]),
        (
            FIELD_REGISTRO_ANS,
            &[
                "registro_ans",
                "cd_registro_ans",
                "registro_operadora",
                "registro_operadora_ans",
                "reg_ans",
            ],
        ),
        (
            FIELD_RAZAO_SOCIAL,
            &["razao_social", "nm_razao_social", "razaosocial"],
        ),
        (
            FIELD_MODALIDADE,
            &["modalidade", "ds_modalidade", "sg_modalidade"],
        ),
        (FIELD_UF, &["uf", "sg_uf", "estado"]),
        (
            FIELD_DATA_CADASTRO,
            &["data_registro_ans", "data_cadastro", "dt_registro_ans", "dt_cadastro"],
        ),
    ])
}

// ============================================================================
// SECTIONS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationSettings {
    /// Lowest plausible year (inclusive)
    pub ano_min: i32,
    /// Highest plausible year (inclusive)
    pub ano_max: i32,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        ValidationSettings {
            ano_min: 2000,
            ano_max: 2030,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationSettings {
    /// Groups with coeficiente_variacao above this (%) are high variability
    pub cv_threshold: f64,
}

impl Default for AggregationSettings {
    fn default() -> Self {
        AggregationSettings { cv_threshold: 50.0 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionSettings {
    /// How many distinct periods are consolidated
    pub recent_periods: usize,
    /// Decode as Windows-1252 (a Latin-1 superset) when a file is not valid UTF-8
    pub latin1_fallback: bool,
    /// Accounting lines are kept only when their description contains one of these
    pub accounting_keywords: Vec<String>,
}

impl Default for IngestionSettings {
    fn default() -> Self {
        IngestionSettings {
            recent_periods: 3,
            latin1_fallback: true,
            accounting_keywords: vec!["evento".to_string(), "sinistro".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    pub delimiter: char,
    pub decimal_places: usize,
}

impl Default for OutputSettings {
    fn default() -> Self {
        OutputSettings {
            delimiter: ';',
            decimal_places: 2,
        }
    }
}

// ============================================================================
// PIPELINE CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub aliases: AliasTable,
    pub registry_aliases: AliasTable,
    pub validation: ValidationSettings,
    pub aggregation: AggregationSettings,
    pub ingestion: IngestionSettings,
    pub output: OutputSettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            aliases: default_expense_aliases(),
            registry_aliases: default_registry_aliases(),
            validation: ValidationSettings::default(),
            aggregation: AggregationSettings::default(),
            ingestion: IngestionSettings::default(),
            output: OutputSettings::default(),
        }
    }
}

impl PipelineConfig {
    /// Load config from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            PipelineError::Config(format!(
                "failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_toml(&content)
    }

    /// Parse config from TOML text; alias tables given here extend the defaults
    pub fn from_toml(content: &str) -> Result<Self> {
        let raw: PipelineConfig = toml::from_str(content)
            .map_err(|e| PipelineError::Config(format!("invalid TOML: {}", e)))?;

        let mut config = PipelineConfig {
            aliases: default_expense_aliases(),
            registry_aliases: default_registry_aliases(),
            ..raw.clone()
        };
        merge_aliases(&mut config.aliases, raw.aliases);
        merge_aliases(&mut config.registry_aliases, raw.registry_aliases);

        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        if self.validation.ano_min > self.validation.ano_max {
            return Err(PipelineError::Config(format!(
                "ano_min ({}) is greater than ano_max ({})",
                self.validation.ano_min, self.validation.ano_max
            )));
        }
        if self.ingestion.recent_periods == 0 {
            return Err(PipelineError::Config(
                "recent_periods must be at least 1".to_string(),
            ));
        }
        if !self.aggregation.cv_threshold.is_finite() || self.aggregation.cv_threshold < 0.0 {
            return Err(PipelineError::Config(
                "cv_threshold must be a non-negative number".to_string(),
            ));
        }
        if !self.output.delimiter.is_ascii() {
            return Err(PipelineError::Config(
                "output delimiter must be a single ASCII character".to_string(),
            ));
        }
        Ok(())
    }
}

fn merge_aliases(base: &mut AliasTable, extra: AliasTable) {
    for (field, spellings) in extra {
        let entry = base.entry(field).or_default();
        for spelling in spellings {
            if !entry.contains(&spelling) {
                entry.push(spelling);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.validation.ano_min, 2000);
        assert_eq!(config.validation.ano_max, 2030);
        assert_eq!(config.aggregation.cv_threshold, 50.0);
        assert_eq!(config.ingestion.recent_periods, 3);
        assert_eq!(config.output.delimiter, ';');
        assert_eq!(config.ingestion.accounting_keywords, vec!["evento", "sinistro"]);
        assert!(config.aliases[FIELD_REGISTRO_ANS].contains(&"reg_ans".to_string()));
        for field in EXPENSE_FIELDS {
            assert!(config.aliases.contains_key(field), "missing aliases for {}", field);
        }
    }

    #[test]
    fn test_from_toml_partial() {
        let config = PipelineConfig::from_toml(
            r#"
            [aggregation]
            cv_threshold = 30.0

            [aliases]
            valor_despesas = ["total_eventos"]
            "#,
        )
        .unwrap();

        assert_eq!(config.aggregation.cv_threshold, 30.0);
        assert_eq!(config.validation.ano_min, 2000);
        let valor = &config.aliases[FIELD_VALOR_DESPESAS];
        assert!(valor.contains(&"total_eventos".to_string()));
        assert!(valor.contains(&"vl_despesa".to_string()));
    }

    #[test]
    fn test_rejects_inverted_year_bounds() {
        let result = PipelineConfig::from_toml(
            r#"
            [validation]
            ano_min = 2030
            ano_max = 2000
            "#,
        );
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_rejects_bad_toml() {
        assert!(PipelineConfig::from_toml("aggregation = [").is_err());
    }
}
