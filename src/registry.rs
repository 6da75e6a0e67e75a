// 🗂️ Operator Registry - load + deduplicate by CNPJ
//
// The registry is the reference dataset of known operators. Duplicates are
// resolved by keeping the FIRST entry per CNPJ in source order; every dropped
// entry is counted for audit.

use crate::cnpj;
use crate::config::{
    AliasTable, PipelineConfig, FIELD_CNPJ, FIELD_DATA_CADASTRO, FIELD_MODALIDADE,
    FIELD_RAZAO_SOCIAL, FIELD_REGISTRO_ANS, FIELD_UF,
};
use crate::normalizer::{decode_text, sniff_delimiter, HeaderMapping};
use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Cursor;
use std::path::Path;
use tracing::{info, warn};

// ============================================================================
// REGISTRY ENTRY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    /// Digits-only CNPJ
    pub cnpj: String,
    pub registro_ans: String,
    pub razao_social: String,
    pub modalidade: String,
    pub uf: String,
    pub data_cadastro: Option<NaiveDate>,
}

impl RegistryEntry {
    pub fn new(cnpj: &str, registro_ans: &str, razao_social: &str, modalidade: &str, uf: &str) -> Self {
        RegistryEntry {
            cnpj: cnpj::clean(cnpj),
            registro_ans: registro_ans.trim().to_string(),
            razao_social: razao_social.trim().to_string(),
            modalidade: modalidade.trim().to_string(),
            uf: uf.trim().to_uppercase(),
            data_cadastro: None,
        }
    }

    /// Builder pattern: add registration date
    pub fn with_data_cadastro(mut self, date: NaiveDate) -> Self {
        self.data_cadastro = Some(date);
        self
    }
}

/// Registration dates arrive as ISO or dd/mm/yyyy
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let text = raw.trim();
    ["%Y-%m-%d", "%d/%m/%Y", "%Y/%m/%d"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
}

// ============================================================================
// LOADING
// ============================================================================

/// Raw registry as read from disk
#[derive(Debug, Clone, Default)]
pub struct LoadedRegistry {
    pub entries: Vec<RegistryEntry>,
    /// Rows whose CNPJ is not 14 digits; never joined
    pub discarded_invalid: usize,
}

/// Load the registry CSV using the registry alias table
pub fn load_registry(path: &Path, config: &PipelineConfig) -> Result<LoadedRegistry> {
    let bytes = fs::read(path)
        .with_context(|| format!("Failed to read registry file: {}", path.display()))?;
    let text = decode_text(bytes, config.ingestion.latin1_fallback, path)?;
    parse_registry(&text, &config.registry_aliases)
        .with_context(|| format!("Failed to parse registry file: {}", path.display()))
}

/// Parse registry text (header row + data rows)
pub fn parse_registry(text: &str, aliases: &AliasTable) -> Result<LoadedRegistry> {
    let header_line = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let delimiter = sniff_delimiter(header_line).unwrap_or(b';');

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .from_reader(Cursor::new(text.as_bytes()));

    let headers: Vec<String> = reader.headers()?.iter().map(|h| h.to_string()).collect();
    let mapping = HeaderMapping::resolve(&headers, aliases, &[FIELD_CNPJ]).map_err(|missing| {
        anyhow!("registry is missing required columns: {}", missing.join(", "))
    })?;

    let mut loaded = LoadedRegistry::default();
    for (line, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("Failed to parse registry line {}", line + 2))?;
        let row: Vec<String> = record.iter().map(|v| v.to_string()).collect();

        let mut entry = RegistryEntry::new(
            mapping.value(&row, FIELD_CNPJ),
            mapping.value(&row, FIELD_REGISTRO_ANS),
            mapping.value(&row, FIELD_RAZAO_SOCIAL),
            mapping.value(&row, FIELD_MODALIDADE),
            mapping.value(&row, FIELD_UF),
        );
        if let Some(date) = parse_date(mapping.value(&row, FIELD_DATA_CADASTRO)) {
            entry = entry.with_data_cadastro(date);
        }

        if entry.cnpj.len() != 14 {
            loaded.discarded_invalid += 1;
            continue;
        }
        loaded.entries.push(entry);
    }

    info!(
        entries = loaded.entries.len(),
        discarded = loaded.discarded_invalid,
        "registry loaded"
    );
    Ok(loaded)
}

// ============================================================================
// DEDUPLICATION
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DedupReport {
    pub raw_count: usize,
    pub duplicates_removed_count: usize,
    /// (cnpj, entries dropped) in first-seen order
    pub duplicate_cnpjs: Vec<(String, usize)>,
}

/// Registry keyed by CNPJ, first occurrence wins
#[derive(Debug, Clone, Default)]
pub struct Registry {
    entries: Vec<RegistryEntry>,
    index: HashMap<String, usize>,
}

impl Registry {
    /// Deduplicate `entries` by CNPJ keeping source order
    pub fn deduplicate(entries: Vec<RegistryEntry>) -> (Registry, DedupReport) {
        let raw_count = entries.len();
        let mut registry = Registry::default();
        let mut dropped: Vec<(String, usize)> = Vec::new();
        let mut dropped_index: HashMap<String, usize> = HashMap::new();

        for entry in entries {
            if registry.index.contains_key(&entry.cnpj) {
                match dropped_index.get(&entry.cnpj) {
                    Some(&i) => dropped[i].1 += 1,
                    None => {
                        dropped_index.insert(entry.cnpj.clone(), dropped.len());
                        dropped.push((entry.cnpj.clone(), 1));
                    }
                }
                continue;
            }
            registry.index.insert(entry.cnpj.clone(), registry.entries.len());
            registry.entries.push(entry);
        }

        let report = DedupReport {
            raw_count,
            duplicates_removed_count: dropped.iter().map(|(_, n)| n).sum(),
            duplicate_cnpjs: dropped,
        };

        if report.duplicates_removed_count > 0 {
            warn!(
                removed = report.duplicates_removed_count,
                cnpjs = report.duplicate_cnpjs.len(),
                "duplicate registry entries removed"
            );
        }

        (registry, report)
    }

    pub fn get(&self, cnpj: &str) -> Option<&RegistryEntry> {
        self.index.get(cnpj).map(|&i| &self.entries[i])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[RegistryEntry] {
        &self.entries
    }
}

// ============================================================================
// REGISTRO ANS INDEX
// ============================================================================

/// Registro ANS as a lookup key: digits only, leading zeros dropped
pub fn registro_key(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    digits.trim_start_matches('0').to_string()
}

/// registro ANS → (cnpj, razão social), used to resolve accounting files
/// that identify operators only by their registration number
#[derive(Debug, Clone, Default)]
pub struct RegistryIndex {
    by_registro: HashMap<String, (String, String)>,
}

impl RegistryIndex {
    /// First entry per registro ANS wins, as in `Registry::deduplicate`
    pub fn from_entries(entries: &[RegistryEntry]) -> Self {
        let mut by_registro = HashMap::new();
        for entry in entries {
            let key = registro_key(&entry.registro_ans);
            if key.is_empty() {
                continue;
            }
            by_registro
                .entry(key)
                .or_insert_with(|| (entry.cnpj.clone(), entry.razao_social.clone()));
        }
        RegistryIndex { by_registro }
    }

    pub fn lookup(&self, registro_ans: &str) -> Option<(&str, &str)> {
        self.by_registro
            .get(&registro_key(registro_ans))
            .map(|(cnpj, razao)| (cnpj.as_str(), razao.as_str()))
    }

    pub fn len(&self) -> usize {
        self.by_registro.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_registro.is_empty()
    }
}

// ============================================================================
// TESTS
// ============================================================================
