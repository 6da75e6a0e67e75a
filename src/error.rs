// ⚠️ Error taxonomy
// Only `NoUsableInput` is fatal for a run; every other variant is caught at the
// file boundary and turned into a report entry.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// File cannot be read or its shape is not supported
    #[error("format error in {}: {message}", path.display())]
    Format { path: PathBuf, message: String },

    /// Required canonical fields have no matching source column
    #[error("schema error in {}: missing required fields {missing:?}", path.display())]
    Schema { path: PathBuf, missing: Vec<String> },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("spreadsheet error: {0}")]
    Spreadsheet(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// Every source file was skipped or empty
    #[error("no usable input: {files_attempted} file(s) attempted, none yielded rows")]
    NoUsableInput { files_attempted: usize },
}

impl PipelineError {
    pub fn format(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        PipelineError::Format {
            path: path.into(),
            message: message.into(),
        }
    }

    /// True only for the run-level failure
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::NoUsableInput { .. })
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
