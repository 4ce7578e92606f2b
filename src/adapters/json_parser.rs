//! JSON exposure-list parser and validator
//!
//! A file is a JSON array of exposure objects:
//!
//! ```json
//! [{"exposure_id": "E1", "amount": 1500.0, "currency": "EUR",
//!   "country": "IT", "sector": "RETAIL"}]
//! ```

use std::collections::HashSet;

use serde_json::Value;
use tracing::debug;

use crate::ingestion::{
    FailureCategory, FileMetadata, FileParser, FileValidator, IngestionError, ParsedFile,
    ValidationReport,
};

/// Larger files must be split by the submitter
pub const MAX_EXPOSURES_PER_FILE: usize = 1_000_000;

const REQUIRED_TEXT_FIELDS: [&str; 4] = ["exposure_id", "currency", "country", "sector"];

#[derive(Debug, Clone)]
pub struct JsonExposureParser {
    max_exposures: usize,
}

impl Default for JsonExposureParser {
    fn default() -> Self {
        Self {
            max_exposures: MAX_EXPOSURES_PER_FILE,
        }
    }
}

impl JsonExposureParser {
    pub fn with_max_exposures(max_exposures: usize) -> Self {
        Self { max_exposures }
    }
}

impl FileParser for JsonExposureParser {
    fn parse(&self, content: &[u8], metadata: &FileMetadata) -> Result<ParsedFile, IngestionError> {
        let document: Value = serde_json::from_slice(content).map_err(|e| {
            IngestionError::rejected(
                FailureCategory::Parse,
                format!("{} is not valid JSON: {}", metadata.file_name, e),
            )
        })?;

        let Value::Array(records) = document else {
            return Err(IngestionError::rejected(
                FailureCategory::Parse,
                "JSON file must contain an array of exposure objects",
            ));
        };
        if records.len() > self.max_exposures {
            return Err(IngestionError::rejected(
                FailureCategory::Validation,
                format!(
                    "File contains more than {} exposures. Please split the file.",
                    self.max_exposures
                ),
            ));
        }
        if let Some(index) = records.iter().position(|r| !r.is_object()) {
            return Err(IngestionError::rejected(
                FailureCategory::Parse,
                format!("Record {} is not a JSON object", index + 1),
            ));
        }

        debug!(file = %metadata.file_name, exposures = records.len(), "Parsed exposure file");
        Ok(ParsedFile {
            exposure_count: records.len(),
            records,
        })
    }
}

/// Required fields, positive amounts and unique exposure ids
#[derive(Debug, Clone, Default)]
pub struct JsonExposureValidator;

impl FileValidator for JsonExposureValidator {
    fn validate(&self, parsed: &ParsedFile) -> Result<ValidationReport, IngestionError> {
        if parsed.records.is_empty() {
            return Err(IngestionError::rejected(
                FailureCategory::Validation,
                "File contains no exposure records",
            ));
        }

        let mut seen = HashSet::with_capacity(parsed.records.len());
        let mut warnings = Vec::new();
        for (index, record) in parsed.records.iter().enumerate() {
            let position = index + 1;
            for field in REQUIRED_TEXT_FIELDS {
                let present = record
                    .get(field)
                    .and_then(Value::as_str)
                    .is_some_and(|s| !s.trim().is_empty());
                if !present {
                    return Err(IngestionError::rejected(
                        FailureCategory::Validation,
                        format!("Missing or empty {} in record {}", field, position),
                    ));
                }
            }

            match record.get("amount").and_then(Value::as_f64) {
                Some(amount) if amount > 0.0 => {}
                Some(_) => {
                    return Err(IngestionError::rejected(
                        FailureCategory::Validation,
                        format!("Amount must be positive in record {}", position),
                    ));
                }
                None => {
                    return Err(IngestionError::rejected(
                        FailureCategory::Validation,
                        format!("Missing or non-numeric amount in record {}", position),
                    ));
                }
            }

            let exposure_id = record
                .get("exposure_id")
                .and_then(Value::as_str)
                .map(str::trim)
                .unwrap_or_default();
            if !seen.insert(exposure_id) {
                return Err(IngestionError::rejected(
                    FailureCategory::Validation,
                    format!(
                        "Duplicate exposure_id '{}' found in record {}",
                        exposure_id, position
                    ),
                ));
            }

            let currency = record.get("currency").and_then(Value::as_str).unwrap_or_default();
            if currency.len() != 3 {
                warnings.push(format!(
                    "Record {} has non ISO-4217 currency '{}'",
                    position, currency
                ));
            }
        }

        Ok(ValidationReport {
            total_exposures: parsed.records.len() as u64,
            warnings,
        })
    }
}
