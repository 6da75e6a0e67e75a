// 🏗️ Format Normalizer
// Detects the shape of a source file and maps its headers onto the canonical
// expense schema through the alias table.
//
// Readers are polymorphic (one per file shape) and hand back raw rows lazily;
// the normalizer resolves the header mapping once per file and applies it row
// by row.

use crate::config::{
    AliasTable, IngestionSettings, PipelineConfig, ACCOUNTING_FIELDS, EXPENSE_FIELDS, FIELD_ANO,
    FIELD_CNPJ, FIELD_DESCRICAO, FIELD_RAZAO_SOCIAL, FIELD_REGISTRO_ANS, FIELD_TRIMESTRE,
    FIELD_VALOR_DESPESAS,
};
use crate::error::{PipelineError, Result};
use crate::registry::RegistryIndex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

// ============================================================================
// CORE TYPES
// ============================================================================

/// Shape of a source file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceFormat {
    /// Delimited text; the delimiter byte is sniffed from the header line
    Delimited { delimiter: u8 },
    /// Column boundaries inferred from the header line
    FixedWidth,
    /// First worksheet of a workbook
    Spreadsheet,
}

impl SourceFormat {
    pub fn name(&self) -> &str {
        match self {
            SourceFormat::Delimited { .. } => "delimited",
            SourceFormat::FixedWidth => "fixed-width",
            SourceFormat::Spreadsheet => "spreadsheet",
        }
    }
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceFormat::Delimited { delimiter } => {
                write!(f, "delimited ({:?})", *delimiter as char)
            }
            other => f.write_str(other.name()),
        }
    }
}

/// Column layout of a source file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceShape {
    /// One expense row per operator and quarter, keyed by CNPJ
    Expense,
    /// Accounting balance lines keyed by registro ANS; only expense
    /// (evento/sinistro) lines are kept
    Accounting,
}

impl SourceShape {
    /// Accounting when the operator is identified by registro ANS alone
    pub fn of(mapping: &HeaderMapping) -> Self {
        if mapping.index_of(FIELD_REGISTRO_ANS).is_some() && mapping.index_of(FIELD_CNPJ).is_none() {
            SourceShape::Accounting
        } else {
            SourceShape::Expense
        }
    }

    fn fields(&self) -> &'static [&'static str] {
        match self {
            SourceShape::Expense => &EXPENSE_FIELDS,
            SourceShape::Accounting => &ACCOUNTING_FIELDS,
        }
    }
}

/// Fiscal period a file reports on
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Period {
    pub ano: i32,
    pub trimestre: u8,
}

impl Period {
    pub fn new(ano: i32, trimestre: u8) -> Self {
        Period { ano, trimestre }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}T{}", self.trimestre, self.ano)
    }
}

/// One source file handed to the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFile {
    pub path: PathBuf,
    /// Declared format; detected when None
    pub format: Option<SourceFormat>,
    /// Declared period; fills ano/trimestre when the file has no such column
    pub period: Option<Period>,
}

impl SourceFile {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        SourceFile {
            path: path.into(),
            format: None,
            period: None,
        }
    }

    /// Builder pattern: declare the format instead of detecting it
    pub fn with_format(mut self, format: SourceFormat) -> Self {
        self.format = Some(format);
        self
    }

    /// Builder pattern: declare the reporting period
    pub fn with_period(mut self, period: Period) -> Self {
        self.period = Some(period);
        self
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string()
    }
}

/// Canonical expense row. Values stay as text; typing happens in validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub cnpj_raw: String,
    pub razao_social: String,
    pub trimestre: String,
    pub ano: String,
    pub valor_despesas: String,
    pub source_file: String,
}

/// Data row index (1-based, header excluded) paired with its record
pub type IndexedRecord = (usize, NormalizedRecord);

// ============================================================================
// HEADER NORMALIZATION & MAPPING
// ============================================================================

/// Lowercase with accents stripped: "Sinistros Conhecidos" → "sinistros conhecidos"
pub fn fold_text(text: &str) -> String {
    text.nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// Fold a header for comparison: "Razão  Social" → "razao_social"
pub fn normalize_header(header: &str) -> String {
    let folded: String = fold_text(header.trim().trim_start_matches('\u{feff}'))
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();

    folded
        .split('_')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

/// Canonical field → column index, resolved once per file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeaderMapping {
    pub columns: BTreeMap<String, usize>,
}

impl HeaderMapping {
    /// Resolve `headers` against the alias table.
    ///
    /// The canonical name itself is always accepted. When several columns
    /// match, the alias listed first wins, then the leftmost column.
    /// Returns the missing `required` fields on failure.
    pub fn resolve(
        headers: &[String],
        aliases: &AliasTable,
        required: &[&str],
    ) -> std::result::Result<Self, Vec<String>> {
        let mapping = Self::from_headers(headers, aliases);
        let missing = mapping.missing(required);
        if missing.is_empty() {
            Ok(mapping)
        } else {
            Err(missing)
        }
    }

    /// Map every canonical field that has a column, requiring none
    pub fn from_headers(headers: &[String], aliases: &AliasTable) -> Self {
        let folded: Vec<String> = headers.iter().map(|h| normalize_header(h)).collect();
        let mut columns = BTreeMap::new();

        for (field, spellings) in aliases {
            let candidates = std::iter::once(field.as_str()).chain(spellings.iter().map(|s| s.as_str()));
            for spelling in candidates {
                let wanted = normalize_header(spelling);
                if let Some(index) = folded.iter().position(|h| *h == wanted) {
                    columns.insert(field.clone(), index);
                    break;
                }
            }
        }

        HeaderMapping { columns }
    }

    /// `required` fields without a column, in the given order
    pub fn missing(&self, required: &[&str]) -> Vec<String> {
        required
            .iter()
            .filter(|field| !self.columns.contains_key(**field))
            .map(|field| field.to_string())
            .collect()
    }

    pub fn index_of(&self, field: &str) -> Option<usize> {
        self.columns.get(field).copied()
    }

    /// Trimmed cell for `field`, empty when unmapped or short row
    pub fn value<'a>(&self, row: &'a [String], field: &str) -> &'a str {
        self.index_of(field)
            .and_then(|i| row.get(i))
            .map(|v| v.trim())
            .unwrap_or("")
    }
}

// ============================================================================
// NUMBER PARSING
// ============================================================================

/// Parse a monetary value written the Brazilian or the plain way.
///
/// Accepts "R$ 1.234,56", "1234,56", "1234.56", "-100", "(100,00)".
/// Returns None for blank or unparseable text.
pub fn parse_decimal(raw: &str) -> Option<f64> {
    let mut text = raw.trim().replace("R$", "");
    text.retain(|c| !c.is_whitespace());
    if text.is_empty() {
        return None;
    }

    let mut negative = false;
    if text.starts_with('(') && text.ends_with(')') {
        negative = true;
        text = text[1..text.len() - 1].to_string();
    }

    let normalized = if text.contains(',') {
        // 1.234,56 → 1234.56
        text.replace('.', "").replace(',', ".")
    } else if text.matches('.').count() > 1 {
        // 1.234.567 → thousands only
        text.replace('.', "")
    } else {
        text
    };

    let value: f64 = normalized.parse().ok()?;
    if !value.is_finite() {
        return None;
    }
    Some(if negative { -value } else { value })
}

/// Parse an integer field that may arrive as "3", "3.0" or " 2024 "
pub fn parse_integer(raw: &str) -> Option<i64> {
    let text = raw.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(value) = text.parse::<i64>() {
        return Some(value);
    }
    let value: f64 = text.replace(',', ".").parse().ok()?;
    if value.is_finite() && value.fract() == 0.0 {
        Some(value as i64)
    } else {
        None
    }
}

// ============================================================================
// TEXT DECODING & SNIFFING
// ============================================================================

/// Windows-1252 code points for 0x80..=0x9F; the five unassigned bytes
/// keep their C1 control value
const CP1252_HIGH: [char; 32] = [
    '€', '\u{81}', '‚', 'ƒ', '„', '…', '†', '‡', 'ˆ', '‰', 'Š', '‹', 'Œ', '\u{8d}', 'Ž', '\u{8f}',
    '\u{90}', '‘', '’', '“', '”', '•', '–', '—', '˜', '™', 'š', '›', 'œ', '\u{9d}', 'ž', 'Ÿ',
];

fn cp1252_char(byte: u8) -> char {
    match byte {
        0x80..=0x9F => CP1252_HIGH[(byte - 0x80) as usize],
        _ => byte as char,
    }
}

/// Decode file bytes: UTF-8 (BOM stripped), Windows-1252 as fallback
pub fn decode_text(bytes: Vec<u8>, latin1_fallback: bool, path: &Path) -> Result<String> {
    let bytes = if bytes.starts_with(&[0xEF, 0xBB, 0xBF]) {
        bytes[3..].to_vec()
    } else {
        bytes
    };

    match String::from_utf8(bytes) {
        Ok(text) => Ok(text),
        Err(err) if latin1_fallback => {
            debug!(file = %path.display(), "not UTF-8, decoding as Windows-1252");
            Ok(err.into_bytes().into_iter().map(cp1252_char).collect())
        }
        Err(err) => Err(PipelineError::format(
            path,
            format!("file is not valid UTF-8: {}", err),
        )),
    }
}

const CANDIDATE_DELIMITERS: [u8; 4] = [b';', b',', b'\t', b'|'];

/// Most frequent candidate delimiter in `line`; ties go to the earlier one
pub fn sniff_delimiter(line: &str) -> Option<u8> {
    let mut best: Option<(u8, usize)> = None;
    for delimiter in CANDIDATE_DELIMITERS {
        let count = line.bytes().filter(|b| *b == delimiter).count();
        if count == 0 {
            continue;
        }
        match best {
            Some((_, best_count)) if best_count >= count => {}
            _ => best = Some((delimiter, count)),
        }
    }
    best.map(|(d, _)| d)
}

const SNIFF_BYTES: usize = 64 * 1024;

fn first_line(head: &[u8], path: &Path) -> Result<String> {
    let head = &head[..head.len().min(SNIFF_BYTES)];
    let text = decode_text(head.to_vec(), true, path)?;
    Ok(text
        .lines()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("")
        .to_string())
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default()
}

pub fn is_spreadsheet(path: &Path) -> bool {
    matches!(extension_of(path).as_str(), "xlsx" | "xls" | "xlsm" | "xlsb" | "ods")
}

/// Detect the format of a file on disk.
///
/// Spreadsheets are recognised by extension alone; everything else is
/// sniffed from the first bytes.
pub fn detect_format(path: &Path) -> Result<SourceFormat> {
    if is_spreadsheet(path) {
        return Ok(SourceFormat::Spreadsheet);
    }

    let mut file = fs::File::open(path)
        .map_err(|e| PipelineError::format(path, format!("cannot open file: {}", e)))?;
    let mut head = Vec::with_capacity(SNIFF_BYTES);
    file.by_ref().take(SNIFF_BYTES as u64).read_to_end(&mut head)?;
    detect_format_of(path, &head)
}

/// Detect the format of `head`, the leading bytes of the file `name`.
///
/// # Strategy:
/// 1. Extension (.csv, .txt, .xlsx, .xls, .xlsm, .xlsb, .ods)
/// 2. Content sniffing of the first line for anything else
pub fn detect_format_of(name: &Path, head: &[u8]) -> Result<SourceFormat> {
    let extension = extension_of(name);

    match extension.as_str() {
        "xlsx" | "xls" | "xlsm" | "xlsb" | "ods" => return Ok(SourceFormat::Spreadsheet),
        "zip" => {
            return Err(PipelineError::format(
                name,
                "archives must be expanded before normalization",
            ))
        }
        "csv" => {
            let header = first_line(head, name)?;
            let delimiter = sniff_delimiter(&header).unwrap_or(b';');
            return Ok(SourceFormat::Delimited { delimiter });
        }
        _ => {}
    }

    let header = first_line(head, name)?;
    if let Some(delimiter) = sniff_delimiter(&header) {
        return Ok(SourceFormat::Delimited { delimiter });
    }

    let printable = !header.is_empty() && header.chars().all(|c| !c.is_control() || c == '\t');
    if extension == "txt" || printable {
        return Ok(SourceFormat::FixedWidth);
    }

    Err(PipelineError::format(
        name,
        format!("could not detect format (extension: {:?})", extension),
    ))
}

// ============================================================================
// READERS
// ============================================================================

pub type RowIter = Box<dyn Iterator<Item = Result<Vec<String>>>>;

/// Header row plus a lazy iterator over data rows
pub struct RawRows {
    pub headers: Vec<String>,
    pub rows: RowIter,
}

/// SourceReader - one implementation per file shape.
///
/// Readers work on the file's bytes so archive members and files on disk go
/// through the same path; `origin` only names the file in errors.
pub trait SourceReader {
    fn read_rows(&self, bytes: Vec<u8>, origin: &Path, settings: &IngestionSettings) -> Result<RawRows>;

    fn format(&self) -> SourceFormat;
}

/// Factory: reader for a detected or declared format
pub fn get_reader(format: SourceFormat) -> Box<dyn SourceReader> {
    match format {
        SourceFormat::Delimited { delimiter } => Box::new(DelimitedReader::new(delimiter)),
        SourceFormat::FixedWidth => Box::new(FixedWidthReader),
        SourceFormat::Spreadsheet => Box::new(SpreadsheetReader),
    }
}

/// Delimited text (CSV / TXT with separators)
pub struct DelimitedReader {
    delimiter: u8,
}

impl DelimitedReader {
    pub fn new(delimiter: u8) -> Self {
        DelimitedReader { delimiter }
    }
}

impl SourceReader for DelimitedReader {
    fn read_rows(&self, bytes: Vec<u8>, path: &Path, settings: &IngestionSettings) -> Result<RawRows> {
        let text = decode_text(bytes, settings.latin1_fallback, path)?;

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(true)
            .flexible(true)
            .from_reader(Cursor::new(text.into_bytes()));

        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| PipelineError::format(path, format!("cannot read header row: {}", e)))?
            .iter()
            .map(|h| h.to_string())
            .collect();

        if headers.iter().all(|h| h.trim().is_empty()) {
            return Err(PipelineError::format(path, "file has no header row"));
        }

        let rows = reader.into_records().map(|record| {
            record
                .map(|r| r.iter().map(|v| v.to_string()).collect())
                .map_err(PipelineError::from)
        });

        Ok(RawRows {
            headers,
            rows: Box::new(rows),
        })
    }

    fn format(&self) -> SourceFormat {
        SourceFormat::Delimited {
            delimiter: self.delimiter,
        }
    }
}

/// Fixed-width text; each header token's start offset opens a column
pub struct FixedWidthReader;

impl FixedWidthReader {
    /// Column start offsets (in chars). Columns are separated by 2+ spaces;
    /// a header with single spaces only is split on every space run.
    pub fn column_starts(header: &[char]) -> Vec<usize> {
        let starts_with_gap = |min_gap: usize| {
            let mut starts = Vec::new();
            let mut gap = usize::MAX;
            for (i, c) in header.iter().enumerate() {
                if c.is_whitespace() {
                    gap = gap.saturating_add(1);
                } else {
                    if gap >= min_gap {
                        starts.push(i);
                    }
                    gap = 0;
                }
            }
            starts
        };

        let starts = starts_with_gap(2);
        if starts.len() > 1 {
            starts
        } else {
            starts_with_gap(1)
        }
    }

    fn slice(line: &[char], starts: &[usize]) -> Vec<String> {
        starts
            .iter()
            .enumerate()
            .map(|(i, &start)| {
                let end = starts.get(i + 1).copied().unwrap_or(line.len()).min(line.len());
                if start >= end {
                    String::new()
                } else {
                    line[start..end].iter().collect::<String>().trim().to_string()
                }
            })
            .collect()
    }
}

impl SourceReader for FixedWidthReader {
    fn read_rows(&self, bytes: Vec<u8>, path: &Path, settings: &IngestionSettings) -> Result<RawRows> {
        let text = decode_text(bytes, settings.latin1_fallback, path)?;
        let mut lines = text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| l.chars().collect::<Vec<char>>());

        let header = lines
            .next()
            .ok_or_else(|| PipelineError::format(path, "file is empty"))?;
        let starts = Self::column_starts(&header);
        if starts.is_empty() {
            return Err(PipelineError::format(path, "file has no header row"));
        }

        let headers = Self::slice(&header, &starts);
        let body: Vec<Vec<char>> = lines.collect();
        let rows = body
            .into_iter()
            .map(move |line| Ok::<_, PipelineError>(Self::slice(&line, &starts)));

        Ok(RawRows {
            headers,
            rows: Box::new(rows),
        })
    }

    fn format(&self) -> SourceFormat {
        SourceFormat::FixedWidth
    }
}

/// Spreadsheet workbook; reads the first worksheet
pub struct SpreadsheetReader;

#[cfg(feature = "excel")]
fn cell_to_string(cell: &calamine::Data) -> String {
    use calamine::Data;
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Int(i) => i.to_string(),
        // Whole floats are usually codes (CNPJ, ano) typed as numbers
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", *f as i64),
        other => other.to_string(),
    }
}

impl SourceReader for SpreadsheetReader {
    #[cfg(feature = "excel")]
    fn read_rows(&self, bytes: Vec<u8>, path: &Path, _settings: &IngestionSettings) -> Result<RawRows> {
        use calamine::{open_workbook_auto_from_rs, Reader};

        let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes))
            .map_err(|e| PipelineError::Spreadsheet(format!("{}: {}", path.display(), e)))?;
        let range = workbook
            .worksheet_range_at(0)
            .ok_or_else(|| PipelineError::format(path, "workbook has no worksheet"))?
            .map_err(|e| PipelineError::Spreadsheet(format!("{}: {}", path.display(), e)))?;

        let mut rows = range
            .rows()
            .map(|row| row.iter().map(cell_to_string).collect::<Vec<String>>())
            .collect::<Vec<_>>()
            .into_iter();

        let headers = rows
            .next()
            .ok_or_else(|| PipelineError::format(path, "worksheet is empty"))?;

        Ok(RawRows {
            headers,
            rows: Box::new(rows.map(Ok::<_, PipelineError>)),
        })
    }

    #[cfg(not(feature = "excel"))]
    fn read_rows(&self, _bytes: Vec<u8>, path: &Path, _settings: &IngestionSettings) -> Result<RawRows> {
        Err(PipelineError::format(
            path,
            "spreadsheet support not compiled in (enable the `excel` feature)",
        ))
    }

    fn format(&self) -> SourceFormat {
        SourceFormat::Spreadsheet
    }
}

// ============================================================================
// FORMAT NORMALIZER
// ============================================================================

pub struct FormatNormalizer {
    aliases: AliasTable,
    settings: IngestionSettings,
    registry_index: Arc<RegistryIndex>,
}

impl FormatNormalizer {
    pub fn new(config: &PipelineConfig) -> Self {
        FormatNormalizer {
            aliases: config.aliases.clone(),
            settings: config.ingestion.clone(),
            registry_index: Arc::new(RegistryIndex::default()),
        }
    }

    /// Builder pattern: resolve accounting files' registro ANS through `index`
    pub fn with_registry_index(mut self, index: RegistryIndex) -> Self {
        self.registry_index = Arc::new(index);
        self
    }

    /// Canonical fields a file must provide; ano/trimestre may come from the
    /// declared period instead
    fn required_fields(shape: SourceShape, period: Option<Period>) -> Vec<&'static str> {
        shape
            .fields()
            .iter()
            .copied()
            .filter(|f| period.is_none() || (*f != FIELD_ANO && *f != FIELD_TRIMESTRE))
            .collect()
    }

    /// Open a source on disk and resolve its header mapping.
    ///
    /// Fails with `Format` when the file cannot be read and `Schema` when a
    /// required field has no column after alias resolution.
    pub fn open(&self, source: &SourceFile) -> Result<RecordStream> {
        let bytes = fs::read(&source.path)
            .map_err(|e| PipelineError::format(&source.path, format!("cannot read file: {}", e)))?;
        self.open_bytes(source, bytes)
    }

    /// Same as `open` over contents already in memory (archive members)
    pub fn open_bytes(&self, source: &SourceFile, bytes: Vec<u8>) -> Result<RecordStream> {
        let format = match source.format {
            Some(f) => f,
            None => detect_format_of(&source.path, &bytes)?,
        };

        let reader = get_reader(format);
        let raw = reader.read_rows(bytes, &source.path, &self.settings)?;

        let mapping = HeaderMapping::from_headers(&raw.headers, &self.aliases);
        let shape = SourceShape::of(&mapping);
        let missing = mapping.missing(&Self::required_fields(shape, source.period));
        if !missing.is_empty() {
            return Err(PipelineError::Schema {
                path: source.path.clone(),
                missing,
            });
        }

        debug!(
            file = %source.path.display(),
            format = %format,
            shape = ?shape,
            columns = ?mapping.columns,
            "header mapping resolved"
        );

        Ok(RecordStream {
            source_file: source.file_name(),
            format,
            shape,
            mapping,
            period: source.period,
            rows: raw.rows,
            row_index: 0,
            rows_filtered: 0,
            keywords: self.settings.accounting_keywords.iter().map(|k| fold_text(k)).collect(),
            registry_index: Arc::clone(&self.registry_index),
        })
    }
}

/// Lazy, finite sequence of one file's records
pub struct RecordStream {
    source_file: String,
    format: SourceFormat,
    shape: SourceShape,
    mapping: HeaderMapping,
    period: Option<Period>,
    rows: RowIter,
    row_index: usize,
    rows_filtered: usize,
    keywords: Vec<String>,
    registry_index: Arc<RegistryIndex>,
}

impl RecordStream {
    pub fn format(&self) -> SourceFormat {
        self.format
    }

    pub fn shape(&self) -> SourceShape {
        self.shape
    }

    pub fn mapping(&self) -> &HeaderMapping {
        &self.mapping
    }

    /// Accounting lines dropped so far for not being expense lines
    pub fn rows_filtered(&self) -> usize {
        self.rows_filtered
    }

    fn is_expense_line(&self, row: &[String]) -> bool {
        let description = fold_text(self.mapping.value(row, FIELD_DESCRICAO));
        self.keywords.iter().any(|k| description.contains(k.as_str()))
    }

    fn build(&self, row: &[String]) -> NormalizedRecord {
        let mut trimestre = self.mapping.value(row, FIELD_TRIMESTRE).to_string();
        let mut ano = self.mapping.value(row, FIELD_ANO).to_string();

        if let Some(period) = self.period {
            if self.mapping.index_of(FIELD_TRIMESTRE).is_none() {
                trimestre = period.trimestre.to_string();
            }
            if self.mapping.index_of(FIELD_ANO).is_none() {
                ano = period.ano.to_string();
            }
        }

        let (cnpj_raw, razao_social) = match self.shape {
            SourceShape::Expense => (
                self.mapping.value(row, FIELD_CNPJ).to_string(),
                self.mapping.value(row, FIELD_RAZAO_SOCIAL).to_string(),
            ),
            // Unknown registro ANS: left blank, flagged downstream
            SourceShape::Accounting => self
                .registry_index
                .lookup(self.mapping.value(row, FIELD_REGISTRO_ANS))
                .map(|(cnpj, razao)| (cnpj.to_string(), razao.to_string()))
                .unwrap_or_default(),
        };

        NormalizedRecord {
            cnpj_raw,
            razao_social,
            trimestre,
            ano,
            valor_despesas: self.mapping.value(row, FIELD_VALOR_DESPESAS).to_string(),
            source_file: self.source_file.clone(),
        }
    }
}

impl Iterator for RecordStream {
    type Item = Result<IndexedRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let row = match self.rows.next()? {
                Ok(row) => row,
                Err(e) => return Some(Err(e)),
            };
            self.row_index += 1;

            // Trailing separators / blank lines
            if row.iter().all(|v| v.trim().is_empty()) {
                continue;
            }

            if self.shape == SourceShape::Accounting && !self.is_expense_line(&row) {
                self.rows_filtered += 1;
                continue;
            }

            return Some(Ok((self.row_index, self.build(&row))));
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
