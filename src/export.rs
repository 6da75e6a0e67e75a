// 📤 Export - delimited output tables and the JSON run report

use crate::aggregation::AggregateGroup;
use crate::config::OutputSettings;
use crate::enrichment::EnrichedRecord;
use crate::error::{PipelineError, Result};
use crate::validation::ValidatedRecord;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::info;

pub const CONSOLIDATED_HEADER: [&str; 6] = [
    "cnpj",
    "razao_social",
    "trimestre",
    "ano",
    "valor_despesas",
    "inconsistencia_flags",
];

pub const ENRICHED_EXTRA_HEADER: [&str; 4] = ["registro_ans", "modalidade", "uf", "join_status"];

pub const AGGREGATED_HEADER: [&str; 10] = [
    "razao_social",
    "uf",
    "ranking",
    "total_despesas",
    "media_despesas",
    "media_por_trimestre",
    "desvio_padrao",
    "coeficiente_variacao",
    "numero_trimestres",
    "alta_variabilidade",
];

fn csv_writer<W: Write>(writer: W, settings: &OutputSettings) -> csv::Writer<W> {
    csv::WriterBuilder::new()
        .delimiter(settings.delimiter as u8)
        .from_writer(writer)
}

fn decimal(value: f64, settings: &OutputSettings) -> String {
    format!("{:.*}", settings.decimal_places, value)
}

/// Typed value when it parsed, the raw text otherwise
fn int_or_raw(value: Option<i64>, raw: &str) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| raw.trim().to_string())
}

fn consolidated_fields(record: &ValidatedRecord, settings: &OutputSettings) -> Vec<String> {
    let raw = &record.consolidated.record;
    let cnpj = if record.cnpj.is_empty() {
        raw.cnpj_raw.trim().to_string()
    } else {
        record.cnpj.clone()
    };
    vec![
        cnpj,
        record.razao_social.clone(),
        int_or_raw(record.trimestre, &raw.trimestre),
        int_or_raw(record.ano, &raw.ano),
        record
            .valor_despesas
            .map(|v| decimal(v, settings))
            .unwrap_or_default(),
    ]
}

// ============================================================================
// WRITERS
// ============================================================================

/// Consolidated table with validation flags
pub fn write_consolidated<'a, W, I>(writer: W, records: I, settings: &OutputSettings) -> Result<usize>
where
    W: Write,
    I: IntoIterator<Item = &'a ValidatedRecord>,
{
    let mut wtr = csv_writer(writer, settings);
    wtr.write_record(CONSOLIDATED_HEADER)?;

    let mut rows = 0;
    for record in records {
        let mut fields = consolidated_fields(record, settings);
        fields.push(record.flags.to_field());
        wtr.write_record(&fields)?;
        rows += 1;
    }
    wtr.flush()?;
    Ok(rows)
}

/// Enriched table: consolidated columns plus registry columns and join status
pub fn write_enriched<W: Write>(
    writer: W,
    records: &[EnrichedRecord],
    settings: &OutputSettings,
) -> Result<usize> {
    let mut wtr = csv_writer(writer, settings);
    let header: Vec<&str> = CONSOLIDATED_HEADER
        .iter()
        .chain(ENRICHED_EXTRA_HEADER.iter())
        .copied()
        .collect();
    wtr.write_record(&header)?;

    for record in records {
        let mut fields = consolidated_fields(&record.validated, settings);
        fields.push(record.flags.to_field());
        fields.push(record.registro_ans.clone().unwrap_or_default());
        fields.push(record.modalidade.clone().unwrap_or_default());
        fields.push(record.uf.clone().unwrap_or_default());
        fields.push(record.join_status.as_str().to_string());
        wtr.write_record(&fields)?;
    }
    wtr.flush()?;
    Ok(records.len())
}

/// Aggregated table in ranking order
pub fn write_aggregated<W: Write>(
    writer: W,
    groups: &[AggregateGroup],
    settings: &OutputSettings,
) -> Result<usize> {
    let mut wtr = csv_writer(writer, settings);
    wtr.write_record(AGGREGATED_HEADER)?;

    for group in groups {
        wtr.write_record(&[
            group.razao_social.clone(),
            group.uf.clone(),
            group.ranking.to_string(),
            decimal(group.total_despesas, settings),
            decimal(group.media_despesas, settings),
            decimal(group.media_por_trimestre, settings),
            decimal(group.desvio_padrao, settings),
            decimal(group.coeficiente_variacao, settings),
            group.numero_trimestres.to_string(),
            group.alta_variabilidade.to_string(),
        ])?;
    }
    wtr.flush()?;
    Ok(groups.len())
}

/// Pretty JSON, used for the diagnostics report
pub fn write_json<W: Write, T: Serialize>(mut writer: W, value: &T) -> Result<()> {
    serde_json::to_writer_pretty(&mut writer, value)
        .map_err(|e| PipelineError::Io(std::io::Error::from(e)))?;
    writer.flush()?;
    Ok(())
}

/// Create `path` and hand a buffered writer to `write`. The buffer is
/// flushed here so a failed final write is an error, not a silent drop.
pub fn to_file<F, T>(path: &Path, write: F) -> Result<T>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<T>,
{
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    let result = write(&mut writer)?;
    writer.flush()?;
    info!(path = %path.display(), "wrote output");
    Ok(result)
}

// ============================================================================
// TESTS
// ============================================================================
