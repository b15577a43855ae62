//! # Row → Document Transformation
//!
//! Turns one tabular batch into canonical documents:
//!
//! ```text
//! CSV bytes → header row → classify (batch-wide)
//!           → per row: coerce cells → flatten paths → build twin|relationship
//! ```
//!
//! Every row of a batch is independent once the batch kind is fixed. A row
//! that fails to build is never silently skipped: depending on the
//! configured [`FailurePolicy`] it either aborts the batch or is recorded on
//! the [`BatchReport`].

pub mod classify;
pub mod coerce;
pub mod flatten;
pub mod relationship;
pub mod twin;

use std::io::Read;

use tracing::{debug, info, warn};

use crate::config::{FailurePolicy, SyncConfig};
use crate::model::{keys, CanonicalDocument, PropertyMap, Value};
use crate::{Error, Result};

pub use classify::{classify, BatchKind};
pub use coerce::{coerce_scalar, Coerced};
pub use flatten::{flatten, insert_path, PathConflict};
pub use relationship::build_relationship;
pub use twin::build_twin;

// ============================================================================
// Batch source
// ============================================================================

/// Logical origin of a batch, supplied by whatever obtained the bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSource {
    /// Logical batch name. Used for error context, for model references and
    /// as the default relationship name.
    pub name: String,
    /// Optional version tag for synthesized model references.
    pub version: Option<String>,
}

impl BatchSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), version: None }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// `"<namespace>:<name>;<version>"`, falling back to `default_version`.
    pub fn model_ref(&self, namespace: &str, default_version: &str) -> String {
        let version = self
            .version
            .as_deref()
            .filter(|v| !v.is_empty())
            .unwrap_or(default_version);
        format!("{namespace}:{};{version}", self.name)
    }
}

// ============================================================================
// Batch report
// ============================================================================

/// A row-scoped condition. `row` counts data rows from 1; the header row is
/// not counted.
#[derive(Debug)]
pub struct RowIssue {
    pub row: usize,
    pub error: Error,
}

/// Result of transforming one batch.
#[derive(Debug)]
pub struct BatchReport {
    pub batch: String,
    pub kind: BatchKind,
    /// Documents in row order.
    pub documents: Vec<CanonicalDocument>,
    /// Data-row number of each document, parallel to `documents`.
    pub rows: Vec<usize>,
    /// Rows that failed to build. Only populated under `ReportAndContinue`.
    pub failures: Vec<RowIssue>,
    /// Coercion ambiguities. The affected cells were kept as raw strings.
    pub warnings: Vec<RowIssue>,
}

impl BatchReport {
    fn new(batch: &str, kind: BatchKind) -> Self {
        Self {
            batch: batch.to_owned(),
            kind,
            documents: Vec::new(),
            rows: Vec::new(),
            failures: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.warnings.is_empty()
    }

    /// Documents paired with the row they came from.
    pub fn numbered(&self) -> impl Iterator<Item = (usize, &CanonicalDocument)> {
        self.rows.iter().copied().zip(&self.documents)
    }
}

// ============================================================================
// Transformer
// ============================================================================

/// Stateless batch transformer. Holds only its configuration.
#[derive(Debug, Clone, Default)]
pub struct Transformer {
    config: SyncConfig,
}

/// What a single row turned into.
#[derive(Debug)]
pub struct RowOutput {
    pub document: CanonicalDocument,
    pub warnings: Vec<Error>,
}

impl Transformer {
    pub fn new(config: SyncConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Transform a comma-delimited, double-quoted UTF-8 batch with a header row.
    pub fn transform_csv<R: Read>(&self, source: &BatchSource, input: R) -> Result<BatchReport> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(input);

        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| malformed(source, e))?
            .iter()
            .map(str::to_owned)
            .collect();

        let kind = classify(&source.name, &headers, self.config.path_separator)?;
        info!(batch = %source.name, %kind, columns = headers.len(), "classified batch");

        let mut report = BatchReport::new(&source.name, kind);
        for (index, record) in reader.records().enumerate() {
            let row = index + 1;
            let outcome = record
                .map_err(|e| malformed(source, e))
                .and_then(|record| {
                    let cells: Vec<&str> = record.iter().collect();
                    self.transform_row(source, kind, &headers, &cells)
                });

            match outcome {
                Ok(out) => {
                    report.warnings.extend(out.warnings.into_iter().map(|error| RowIssue { row, error }));
                    report.documents.push(out.document);
                    report.rows.push(row);
                }
                Err(error) => match self.config.failure_policy {
                    FailurePolicy::AbortBatch => return Err(error),
                    FailurePolicy::ReportAndContinue => {
                        warn!(batch = %source.name, row, %error, "row failed; continuing");
                        report.failures.push(RowIssue { row, error });
                    }
                },
            }
        }

        info!(
            batch = %source.name,
            documents = report.documents.len(),
            failures = report.failures.len(),
            warnings = report.warnings.len(),
            "transformed batch"
        );
        Ok(report)
    }

    /// Build one document from a row already classified as `kind`.
    ///
    /// Cells beyond the header width are an error; missing trailing cells
    /// are read as empty.
    pub fn transform_row<H: AsRef<str>>(
        &self,
        source: &BatchSource,
        kind: BatchKind,
        headers: &[H],
        cells: &[&str],
    ) -> Result<RowOutput> {
        if cells.len() > headers.len() {
            return Err(Error::MalformedBatch {
                batch: source.name.clone(),
                reason: format!("row has {} cells but the header has {}", cells.len(), headers.len()),
            });
        }

        let sep = self.config.path_separator;
        let mut warnings = Vec::new();
        let mut row = PropertyMap::new();

        for (header, raw) in headers.iter().zip(cells.iter().copied()) {
            let column = header.as_ref();
            let Some(value) = self.coerce_cell(source, column, raw, &mut warnings) else {
                continue;
            };
            insert_path(&mut row, column, sep, value).map_err(|c| Error::ConflictingPath {
                batch: source.name.clone(),
                path: c.path,
            })?;
        }
        debug!(batch = %source.name, %kind, cells = row.len(), "row flattened");

        let document = match kind {
            BatchKind::Twins => build_twin(row, source, &self.config)?.into(),
            BatchKind::Relationships => build_relationship(row, source)?.into(),
        };
        Ok(RowOutput { document, warnings })
    }

    /// Coerce one cell. `None` means the cell is null and is dropped.
    fn coerce_cell(
        &self,
        source: &BatchSource,
        column: &str,
        raw: &str,
        warnings: &mut Vec<Error>,
    ) -> Option<Value> {
        if raw.is_empty() {
            return None;
        }
        if is_identifier_column(column, self.config.path_separator) {
            return Some(Value::String(raw.to_owned()));
        }

        let exempt = self.config.is_json_exempt(column)
            || self.config.is_json_exempt(last_segment(column, self.config.path_separator));
        let Coerced { value, ambiguity } = coerce_scalar(raw, exempt);
        if let Some(reason) = ambiguity {
            warn!(batch = %source.name, column, %reason, "cell looks like JSON but does not parse; kept as text");
            warnings.push(Error::StructuralCoercionAmbiguity {
                batch: source.name.clone(),
                column: column.to_owned(),
                reason,
            });
        }
        (!value.is_null()).then_some(value)
    }
}

// ============================================================================
// Helpers shared by the builders
// ============================================================================

fn malformed(source: &BatchSource, e: csv::Error) -> Error {
    Error::MalformedBatch { batch: source.name.clone(), reason: e.to_string() }
}

fn last_segment(column: &str, separator: char) -> &str {
    column.rsplit(separator).next().unwrap_or(column)
}

/// Identifier and reference columns are carried as text, never coerced.
fn is_identifier_column(column: &str, separator: char) -> bool {
    matches!(column, keys::FALLBACK_ID | keys::FALLBACK_SOURCE | keys::FALLBACK_TARGET)
        || matches!(
            last_segment(column, separator),
            keys::ID
                | keys::MODEL
                | keys::SOURCE_ID
                | keys::TARGET_ID
                | keys::RELATIONSHIP_ID
                | keys::RELATIONSHIP_NAME
        )
}

/// Remove `key` and return it as non-empty text.
pub(crate) fn take_text(row: &mut PropertyMap, key: &str) -> Option<String> {
    match row.remove(key)? {
        Value::String(s) if !s.is_empty() => Some(s),
        Value::String(_) | Value::Null | Value::Array(_) | Value::Object(_) => None,
        scalar => Some(scalar.to_string()),
    }
}

/// Remove a delete marker and report whether it was set.
pub(crate) fn take_flag(row: &mut PropertyMap, key: &str) -> bool {
    row.remove(key).is_some_and(|v| v.is_flag_set())
}

/// Drop every remaining reserved key, logging the ones that were ignored.
pub(crate) fn strip_reserved(row: PropertyMap, batch: &str) -> PropertyMap {
    row.into_iter()
        .filter(|(k, _)| {
            let reserved = crate::model::is_reserved(k);
            if reserved {
                debug!(batch, key = %k, "ignoring unsupported reserved column");
            }
            !reserved
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn transformer() -> Transformer {
        Transformer::new(SyncConfig::without_throttle())
    }

    fn to_json(report: &BatchReport) -> Vec<serde_json::Value> {
        report.documents.iter().map(CanonicalDocument::to_json).collect()
    }

    #[test]
    fn test_model_ref_defaults_version() {
        assert_eq!(BatchSource::new("widget").model_ref("dtmi", "1"), "dtmi:widget;1");
        assert_eq!(
            BatchSource::new("widget").with_version("2").model_ref("dtmi", "1"),
            "dtmi:widget;2"
        );
        assert_eq!(
            BatchSource::new("widget").with_version("").model_ref("dtmi", "1"),
            "dtmi:widget;1"
        );
    }

    #[test]
    fn test_twin_batch() {
        let csv = "id,name,size,pos.x,pos.y\nt1,alpha,3,1.5,2\nt2,beta,,,\n";
        let report = transformer()
            .transform_csv(&BatchSource::new("widget").with_version("2"), csv.as_bytes())
            .unwrap();

        assert_eq!(report.kind, BatchKind::Twins);
        assert!(report.is_clean());
        assert_eq!(
            to_json(&report),
            vec![
                json!({
                    "$id": "t1",
                    "$metadata": {"$model": "dtmi:widget;2"},
                    "name": "alpha",
                    "size": 3,
                    "pos": {"x": 1.5, "y": 2}
                }),
                json!({"$id": "t2", "$metadata": {"$model": "dtmi:widget;2"}, "name": "beta"}),
            ]
        );
    }

    #[test]
    fn test_identifier_columns_stay_text() {
        let csv = "id,code\n007,007\n";
        let report = transformer().transform_csv(&BatchSource::new("w"), csv.as_bytes()).unwrap();
        let twin = report.documents[0].as_twin().unwrap();
        assert_eq!(twin.id, "007");
        assert_eq!(twin.get("code"), Some(&Value::Int(7)));
    }

    #[test]
    fn test_exempt_column_by_last_segment() {
        let csv = "id,rules.CriteriaFormula\nt,\"{a} > 1\"\n";
        let report = transformer().transform_csv(&BatchSource::new("w"), csv.as_bytes()).unwrap();
        let twin = report.documents[0].as_twin().unwrap();
        assert_eq!(
            twin.get("rules").and_then(|v| v.pointer(["CriteriaFormula"])),
            Some(&Value::from("{a} > 1"))
        );
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_ambiguous_json_is_a_warning() {
        let csv = "id,blob\nt,{broken}\n";
        let report = transformer().transform_csv(&BatchSource::new("w"), csv.as_bytes()).unwrap();
        assert_eq!(report.documents.len(), 1);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].row, 1);
        assert!(matches!(
            report.warnings[0].error,
            Error::StructuralCoercionAmbiguity { ref column, .. } if column == "blob"
        ));
    }

    #[test]
    fn test_abort_policy_returns_first_failure() {
        let csv = "id,a,a.b\nt1,1,2\n";
        let err = transformer().transform_csv(&BatchSource::new("w"), csv.as_bytes()).unwrap_err();
        assert!(matches!(err, Error::ConflictingPath { ref batch, ref path } if batch == "w" && path == "a"));
    }

    #[test]
    fn test_report_policy_collects_failures() {
        let cfg = SyncConfig::without_throttle().with_failure_policy(FailurePolicy::ReportAndContinue);
        let csv = "id,name\nt1,a\n,b\nt3,c\n";
        let report = Transformer::new(cfg).transform_csv(&BatchSource::new("w"), csv.as_bytes()).unwrap();
        assert_eq!(report.documents.len(), 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].row, 2);
        assert!(matches!(report.failures[0].error, Error::MissingRequiredField { .. }));
    }

    #[test]
    fn test_extra_cells_are_malformed() {
        let csv = "id\nt1,extra\n";
        let err = transformer().transform_csv(&BatchSource::new("w"), csv.as_bytes()).unwrap_err();
        assert!(matches!(err, Error::MalformedBatch { .. }));
    }

    #[test]
    fn test_unrecognized_header() {
        let err = transformer()
            .transform_csv(&BatchSource::new("mystery"), "a,b\n1,2\n".as_bytes())
            .unwrap_err();
        assert!(matches!(err, Error::UnrecognizedFormat { ref origin } if origin == "mystery"));
    }
}
