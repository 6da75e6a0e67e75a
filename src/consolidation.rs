// 📚 Consolidator - one file at a time into a single table
//
// Each file's stream is drained into a per-file buffer and appended only when
// the whole file read cleanly, so a failure mid-file never leaves a partial
// file in the table and peak memory stays at one source file. ZIP archives are
// expanded member by member in memory and each member is consolidated as a
// file of its own.

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::normalizer::{
    FormatNormalizer, HeaderMapping, IndexedRecord, NormalizedRecord, Period, SourceFile,
    SourceFormat, SourceShape,
};
use crate::registry::RegistryIndex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

// ============================================================================
// RECORDS & REPORT
// ============================================================================

/// Normalized record plus provenance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidatedRecord {
    pub record: NormalizedRecord,
    /// Data row index within the source file (1-based)
    pub row_index: usize,
}

impl ConsolidatedRecord {
    pub fn source_file(&self) -> &str {
        &self.record.source_file
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FileStatus {
    Loaded,
    Skipped { reason: String },
}

/// Ingestion outcome for one source file. Archive members are reported as
/// `<archive>/<member>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileReport {
    pub path: PathBuf,
    pub format: Option<SourceFormat>,
    pub shape: Option<SourceShape>,
    pub period: Option<Period>,
    pub mapping: Option<HeaderMapping>,
    pub rows_read: usize,
    /// Accounting lines that were not expense lines
    #[serde(default)]
    pub rows_filtered: usize,
    pub sha256: Option<String>,
    #[serde(flatten)]
    pub status: FileStatus,
}

impl FileReport {
    fn skipped(source: &SourceFile, sha256: Option<String>, error: &PipelineError) -> Self {
        FileReport {
            path: source.path.clone(),
            format: source.format,
            shape: None,
            period: source.period,
            mapping: None,
            rows_read: 0,
            rows_filtered: 0,
            sha256,
            status: FileStatus::Skipped {
                reason: error.to_string(),
            },
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.status == FileStatus::Loaded
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestionReport {
    pub files: Vec<FileReport>,
    pub rows_read: usize,
}

impl IngestionReport {
    /// (file name, rows) for every file, skipped ones with 0
    pub fn rows_per_file(&self) -> Vec<(String, usize)> {
        self.files
            .iter()
            .map(|f| {
                let name = f
                    .path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("unknown")
                    .to_string();
                (name, f.rows_read)
            })
            .collect()
    }

    pub fn files_loaded(&self) -> usize {
        self.files.iter().filter(|f| f.is_loaded()).count()
    }

    pub fn files_skipped(&self) -> usize {
        self.files.len() - self.files_loaded()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} file(s) attempted, {} loaded, {} skipped, {} rows read",
            self.files.len(),
            self.files_loaded(),
            self.files_skipped(),
            self.rows_read
        )
    }
}

/// Consolidated table plus how it was built
#[derive(Debug, Clone, Default)]
pub struct Consolidation {
    pub records: Vec<ConsolidatedRecord>,
    pub report: IngestionReport,
}

// ============================================================================
// PERIOD DISCOVERY
// ============================================================================

/// Period encoded in a file name: 1T2024, 2024_1T, 2024Q1, 1Q2024
pub fn period_from_name(name: &str) -> Option<Period> {
    let patterns: [(&str, bool); 4] = [
        (r"(?i)(?:^|[^0-9])([1-4])T(\d{4})(?:[^0-9]|$)", true),
        (r"(?i)(?:^|[^0-9])(\d{4})[_\-]?([1-4])T(?:[^0-9]|$)", false),
        (r"(?i)(?:^|[^0-9])(\d{4})[_\-]?Q([1-4])(?:[^0-9]|$)", false),
        (r"(?i)(?:^|[^0-9])([1-4])Q[_\-]?(\d{4})(?:[^0-9]|$)", true),
    ];

    for (pattern, quarter_first) in patterns {
        let re = Regex::new(pattern).ok()?;
        if let Some(caps) = re.captures(name) {
            let (q, y) = if quarter_first { (1, 2) } else { (2, 1) };
            let trimestre: u8 = caps.get(q)?.as_str().parse().ok()?;
            let ano: i32 = caps.get(y)?.as_str().parse().ok()?;
            return Some(Period::new(ano, trimestre));
        }
    }
    None
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
}

fn is_supported_extension(path: &Path) -> bool {
    matches!(
        extension_of(path).as_deref(),
        Some("csv" | "txt" | "xlsx" | "xls" | "xlsm" | "xlsb" | "ods" | "zip")
    )
}

pub fn is_archive(path: &Path) -> bool {
    extension_of(path).as_deref() == Some("zip")
}

/// List supported files in `dir` (non-recursive) with the period in their name
pub fn discover_sources(dir: &Path) -> Result<Vec<SourceFile>> {
    let mut sources = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() || !is_supported_extension(&path) {
            continue;
        }
        let mut source = SourceFile::new(&path);
        if let Some(period) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(period_from_name)
        {
            source = source.with_period(period);
        }
        sources.push(source);
    }
    sources.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(sources)
}

/// Keep every file of the `n` most recent periods, oldest first.
/// Files without a period are dropped when any file has one.
pub fn select_recent_periods(sources: Vec<SourceFile>, n: usize) -> Vec<SourceFile> {
    let periods: BTreeSet<Period> = sources.iter().filter_map(|s| s.period).collect();
    if periods.is_empty() {
        return sources;
    }

    let keep: BTreeSet<Period> = periods.iter().rev().take(n).copied().collect();
    let mut selected: Vec<SourceFile> = sources
        .into_iter()
        .filter(|s| s.period.map(|p| keep.contains(&p)).unwrap_or(false))
        .collect();
    selected.sort_by(|a, b| a.period.cmp(&b.period).then_with(|| a.path.cmp(&b.path)));
    selected
}

// ============================================================================
// CONSOLIDATOR
// ============================================================================

pub struct Consolidator {
    normalizer: FormatNormalizer,
}

/// One file read to the end
struct FileContents {
    format: SourceFormat,
    shape: SourceShape,
    mapping: HeaderMapping,
    rows: Vec<IndexedRecord>,
    rows_filtered: usize,
}

impl Consolidator {
    pub fn new(config: &PipelineConfig) -> Self {
        Consolidator {
            normalizer: FormatNormalizer::new(config),
        }
    }

    /// Builder pattern: registry lookup for accounting files
    pub fn with_registry_index(mut self, index: RegistryIndex) -> Self {
        self.normalizer = self.normalizer.with_registry_index(index);
        self
    }

    fn fingerprint(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        format!("{:x}", hasher.finalize())
    }

    /// Read one file completely; nothing is returned unless the whole file
    /// streamed without error
    fn read_file(&self, source: &SourceFile, bytes: Vec<u8>) -> Result<FileContents> {
        let mut stream = self.normalizer.open_bytes(source, bytes)?;
        let format = stream.format();
        let shape = stream.shape();
        let mapping = stream.mapping().clone();
        let rows = stream.by_ref().collect::<Result<Vec<IndexedRecord>>>()?;
        Ok(FileContents {
            format,
            shape,
            mapping,
            rows,
            rows_filtered: stream.rows_filtered(),
        })
    }

    /// Append one file (or archive member) to `consolidation` and report it
    fn consolidate_file(
        &self,
        source: &SourceFile,
        bytes: Result<Vec<u8>>,
        consolidation: &mut Consolidation,
    ) {
        let sha256 = bytes.as_ref().ok().map(|b| Self::fingerprint(b));

        let file_report = match bytes.and_then(|b| self.read_file(source, b)) {
            Ok(contents) => {
                let rows_read = contents.rows.len();
                consolidation.records.extend(
                    contents
                        .rows
                        .into_iter()
                        .map(|(row_index, record)| ConsolidatedRecord { record, row_index }),
                );
                consolidation.report.rows_read += rows_read;
                info!(
                    file = %source.path.display(),
                    rows = rows_read,
                    filtered = contents.rows_filtered,
                    "file consolidated"
                );

                FileReport {
                    path: source.path.clone(),
                    format: Some(contents.format),
                    shape: Some(contents.shape),
                    period: source.period,
                    mapping: Some(contents.mapping),
                    rows_read,
                    rows_filtered: contents.rows_filtered,
                    sha256,
                    status: FileStatus::Loaded,
                }
            }
            Err(e) => {
                warn!(file = %source.path.display(), error = %e, "skipping source file");
                FileReport::skipped(source, sha256, &e)
            }
        };

        consolidation.report.files.push(file_report);
    }

    /// Consolidate every supported member of a ZIP archive, one at a time.
    /// Members take the archive's period, or the one in their own name.
    fn consolidate_archive(&self, archive: &SourceFile, consolidation: &mut Consolidation) {
        info!(archive = %archive.path.display(), "expanding archive");

        let opened = fs::File::open(&archive.path)
            .map_err(|e| PipelineError::format(&archive.path, format!("cannot open archive: {}", e)))
            .and_then(|file| {
                zip::ZipArchive::new(file).map_err(|e| {
                    PipelineError::format(&archive.path, format!("not a valid ZIP archive: {}", e))
                })
            });
        let mut zip = match opened {
            Ok(zip) => zip,
            Err(e) => {
                warn!(file = %archive.path.display(), error = %e, "skipping archive");
                consolidation.report.files.push(FileReport::skipped(archive, None, &e));
                return;
            }
        };

        for i in 0..zip.len() {
            let mut entry = match zip.by_index(i) {
                Ok(entry) => entry,
                Err(e) => {
                    let error = PipelineError::format(
                        &archive.path,
                        format!("cannot read archive entry {}: {}", i, e),
                    );
                    warn!(file = %archive.path.display(), error = %error, "skipping archive entry");
                    consolidation.report.files.push(FileReport::skipped(archive, None, &error));
                    continue;
                }
            };
            if !entry.is_file() {
                continue;
            }
            let name = match entry.enclosed_name() {
                Some(name) => name,
                None => {
                    warn!(archive = %archive.path.display(), entry = entry.name(), "unsafe entry path ignored");
                    continue;
                }
            };

            let path = archive.path.join(&name);
            if !is_supported_extension(&path) || is_archive(&path) {
                debug!(entry = %path.display(), "unsupported archive entry ignored");
                continue;
            }

            let period = archive.period.or_else(|| {
                name.file_name()
                    .and_then(|n| n.to_str())
                    .and_then(period_from_name)
            });
            let member = SourceFile {
                path,
                format: None,
                period,
            };

            let mut bytes = Vec::new();
            let bytes = entry
                .read_to_end(&mut bytes)
                .map(|_| bytes)
                .map_err(|e| PipelineError::format(&member.path, format!("cannot read archive entry: {}", e)));
            drop(entry);

            info!(file = %member.path.display(), "reading archive entry");
            self.consolidate_file(&member, bytes, consolidation);
        }
    }

    /// Consolidate `sources` in order.
    ///
    /// Per-file failures are recorded and skipped. Fails with `NoUsableInput`
    /// only when no file yielded a single row.
    pub fn consolidate(&self, sources: &[SourceFile]) -> Result<Consolidation> {
        let mut consolidation = Consolidation::default();

        for source in sources {
            if is_archive(&source.path) {
                self.consolidate_archive(source, &mut consolidation);
                continue;
            }

            info!(file = %source.path.display(), "reading source file");
            let bytes = fs::read(&source.path).map_err(|e| {
                PipelineError::format(&source.path, format!("cannot read file: {}", e))
            });
            self.consolidate_file(source, bytes, &mut consolidation);
        }

        if consolidation.records.is_empty() {
            return Err(PipelineError::NoUsableInput {
                files_attempted: consolidation.report.files.len(),
            });
        }

        info!("{}", consolidation.report.summary());
        Ok(consolidation)
    }
}

// ============================================================================
// TESTS
// ============================================================================
