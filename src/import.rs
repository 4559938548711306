//! CSV ingestion: validate the upload, parse every row, then replace the
//! record store in one transaction.

use crate::models::ElectionRecord;
use crate::parser::{parse_row, HeaderIndex, RowFailure};
use crate::store::RecordStore;
use csv::{ByteRecord, ReaderBuilder, StringRecord, Trim};
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

pub const NO_FILE_MESSAGE: &str = "No file uploaded";
pub const NO_FILE_ERROR: &str = "CSV file is required";
pub const INVALID_FORMAT_MESSAGE: &str = "Invalid file format";
pub const INVALID_FORMAT_ERROR: &str = "Only CSV files are allowed";
pub const NO_VALID_RECORDS_MESSAGE: &str = "No valid records to import";
pub const IMPORT_FAILED_MESSAGE: &str = "Error during CSV import";
pub const INTERNAL_ERROR: &str = "Internal server error";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportOutcome {
    Imported,
    ValidationFailure,
    InternalFailure,
}

impl ImportOutcome {
    pub fn status_code(&self) -> u16 {
        match self {
            ImportOutcome::Imported => 200,
            ImportOutcome::ValidationFailure => 400,
            ImportOutcome::InternalFailure => 500,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ImportOptions {
    /// Validate and parse only. The store is never touched.
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportResult {
    pub success: bool,
    pub message: String,
    pub records_imported: usize,
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub dry_run: bool,
    #[serde(skip)]
    pub outcome: ImportOutcome,
}

impl ImportResult {
    fn failure(outcome: ImportOutcome, message: &str, errors: Vec<String>) -> Self {
        Self {
            success: false,
            message: message.to_string(),
            records_imported: 0,
            errors,
            dry_run: false,
            outcome,
        }
    }

    fn rejected(message: &str, errors: Vec<String>) -> Self {
        Self::failure(ImportOutcome::ValidationFailure, message, errors)
    }

    fn internal(mut errors: Vec<String>) -> Self {
        errors.push(INTERNAL_ERROR.to_string());
        Self::failure(ImportOutcome::InternalFailure, IMPORT_FAILED_MESSAGE, errors)
    }

    pub fn status_code(&self) -> u16 {
        self.outcome.status_code()
    }
}

/// Check the upload before any parsing. `size` is the byte length of the file.
pub fn validate_upload(file_name: Option<&str>, size: u64) -> Option<ImportResult> {
    let Some(name) = file_name.filter(|_| size > 0) else {
        return Some(ImportResult::rejected(
            NO_FILE_MESSAGE,
            vec![NO_FILE_ERROR.to_string()],
        ));
    };
    if !name.to_ascii_lowercase().ends_with(".csv") {
        return Some(ImportResult::rejected(
            INVALID_FORMAT_MESSAGE,
            vec![INVALID_FORMAT_ERROR.to_string()],
        ));
    }
    None
}

/// Valid records and per-line failures from one pass over a file.
#[derive(Debug, Default)]
pub struct ParsedBatch {
    pub records: Vec<ElectionRecord>,
    pub failures: Vec<RowFailure>,
}

/// Parse a whole CSV stream. Row problems are collected; only an I/O error
/// while reading stops the pass.
pub fn parse_csv<R: Read>(reader: R) -> Result<ParsedBatch, csv::Error> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(reader);

    let headers = HeaderIndex::new(&StringRecord::from_byte_record_lossy(
        rdr.byte_headers()?.clone(),
    ));
    let missing = headers.missing_columns();
    if !missing.is_empty() {
        warn!(?missing, "CSV header lacks expected columns");
    }

    let mut batch = ParsedBatch::default();
    let mut row = ByteRecord::new();
    let mut line = 1usize;

    while rdr.read_byte_record(&mut row)? {
        line += 1;
        let record = StringRecord::from_byte_record_lossy(row.clone());
        match parse_row(&headers, &record) {
            Ok(parsed) => batch.records.push(parsed),
            Err(failure) => {
                warn!(line, error = %failure, "Skipping CSV row");
                batch.failures.push(RowFailure {
                    line,
                    error: failure,
                });
            }
        }
    }

    Ok(batch)
}

pub struct Importer {
    store: Arc<dyn RecordStore>,
}

impl Importer {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Import the CSV file at `path`, replacing the whole dataset.
    pub async fn import_file(&self, path: impl AsRef<Path>, options: ImportOptions) -> ImportResult {
        let path = path.as_ref();
        let file_name = path.file_name().map(|n| n.to_string_lossy().into_owned());
        let owned = path.to_path_buf();
        let parsed = tokio::task::spawn_blocking(move || {
            let size = match std::fs::metadata(&owned) {
                Ok(meta) => meta.len(),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!(path = %owned.display(), "Import file not found");
                    0
                }
                Err(e) => return Err(csv::Error::from(e)),
            };
            if let Some(rejected) = validate_upload(file_name.as_deref(), size) {
                return Ok(Err(rejected));
            }

            let file = File::open(&owned).map_err(csv::Error::from)?;
            parse_csv(BufReader::new(file)).map(Ok)
        })
        .await;

        match parsed {
            Ok(Ok(Ok(batch))) => self.commit(batch, options).await,
            Ok(Ok(Err(rejected))) => rejected,
            Ok(Err(e)) => {
                error!(path = %path.display(), error = %e, "Failed to read CSV");
                ImportResult::internal(Vec::new())
            }
            Err(e) => {
                error!(error = %e, "CSV parse task failed");
                ImportResult::internal(Vec::new())
            }
        }
    }

    /// Import an uploaded file held in memory.
    pub async fn import_upload(
        &self,
        file_name: Option<&str>,
        contents: Vec<u8>,
        options: ImportOptions,
    ) -> ImportResult {
        if let Some(rejected) = validate_upload(file_name, contents.len() as u64) {
            return rejected;
        }

        let parsed = tokio::task::spawn_blocking(move || parse_csv(contents.as_slice())).await;
        match parsed {
            Ok(Ok(batch)) => self.commit(batch, options).await,
            Ok(Err(e)) => {
                error!(error = %e, "Failed to read CSV upload");
                ImportResult::internal(Vec::new())
            }
            Err(e) => {
                error!(error = %e, "CSV parse task failed");
                ImportResult::internal(Vec::new())
            }
        }
    }

    async fn commit(&self, batch: ParsedBatch, options: ImportOptions) -> ImportResult {
        let errors: Vec<String> = batch.failures.iter().map(ToString::to_string).collect();

        if batch.records.is_empty() {
            warn!(skipped = errors.len(), "No valid records to import");
            return ImportResult::rejected(NO_VALID_RECORDS_MESSAGE, errors);
        }

        let count = batch.records.len();
        if options.dry_run {
            info!(valid = count, skipped = errors.len(), "Dry run, store left untouched");
            return ImportResult {
                success: true,
                message: format!("Dry run: {count} records would be imported"),
                records_imported: count,
                errors,
                dry_run: true,
                outcome: ImportOutcome::Imported,
            };
        }

        let start = Instant::now();
        match self.store.replace_all(batch.records).await {
            Ok(imported) => {
                info!(
                    imported,
                    skipped = errors.len(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Successfully imported {imported} records from CSV"
                );
                ImportResult {
                    success: true,
                    message: format!("Successfully imported {imported} records"),
                    records_imported: imported,
                    errors,
                    dry_run: false,
                    outcome: ImportOutcome::Imported,
                }
            }
            Err(e) => {
                error!(error = %e, "Error importing CSV file, previous dataset kept");
                ImportResult::internal(errors)
            }
        }
    }
}
