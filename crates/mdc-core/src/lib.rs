//! Core domain model for the metadata catalog: record tables, typed cells,
//! store column types and the shared error taxonomy.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use thiserror::Error;

pub const CRATE_NAME: &str = "mdc-core";

/// Name of the leading label column every manifest table carries.
pub const COMPONENT_COLUMN: &str = "Component";

/// Column holding the source row identifier attached by the table store.
pub const ENTITY_ID_COLUMN: &str = "entityId";

const SUGGESTION_THRESHOLD: f64 = 0.85;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("unsupported record type `{name}`{}", suggestion_suffix(.suggestion))]
    UnsupportedRecordType {
        name: String,
        suggestion: Option<&'static str>,
    },
    #[error(
        "ambiguous vocabulary mapping in category `{category}`: `{term}` maps to both `{previous}` and `{replacement}`"
    )]
    AmbiguousVocabularyMapping {
        category: String,
        term: String,
        previous: String,
        replacement: String,
    },
    #[error("validation engine failed for {record_type} (exit code {exit_code:?}): {stderr}")]
    ValidationEngineFailure {
        record_type: String,
        exit_code: Option<i32>,
        stderr: String,
    },
    #[error("validator could not be started for {record_type}: {source}")]
    ValidatorSpawn {
        record_type: String,
        #[source]
        source: std::io::Error,
    },
    #[error("validation log {} does not contain the `], ` delimiter", .path.display())]
    MalformedLogFormat { path: PathBuf },
    #[error("column `{column}` not found in table")]
    MissingColumn { column: String },
    #[error("table has no `Component` label to identify its record type")]
    MissingComponent,
    #[error("row {row} has {found} cells but the table has {expected} columns")]
    RaggedRow {
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("cannot coerce `{value}` in column `{column}` to {column_type}")]
    Coercion {
        column: String,
        value: String,
        column_type: ColumnType,
    },
}

fn suggestion_suffix(suggestion: &Option<&'static str>) -> String {
    match suggestion {
        Some(name) => format!(" (did you mean `{name}`?)"),
        None => String::new(),
    }
}

/// Catalog entity kinds with a hand-authored merge rule set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RecordType {
    #[serde(rename = "PublicationView")]
    Publication,
    #[serde(rename = "DatasetView")]
    Dataset,
    #[serde(rename = "ToolView")]
    Tool,
    #[serde(rename = "EducationalResource")]
    EducationalResource,
}

impl RecordType {
    pub const ALL: [RecordType; 4] = [
        RecordType::Publication,
        RecordType::Dataset,
        RecordType::Tool,
        RecordType::EducationalResource,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Publication => "PublicationView",
            Self::Dataset => "DatasetView",
            Self::Tool => "ToolView",
            Self::EducationalResource => "EducationalResource",
        }
    }

    /// Closest known record type name, if any is similar enough to be a typo.
    pub fn suggest(name: &str) -> Option<&'static str> {
        Self::ALL
            .iter()
            .map(|rt| (rt.as_str(), jaro_winkler(name, rt.as_str())))
            .filter(|(_, score)| *score >= SUGGESTION_THRESHOLD)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(candidate, _)| candidate)
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordType {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|rt| rt.as_str() == s)
            .ok_or_else(|| CatalogError::UnsupportedRecordType {
                name: s.to_string(),
                suggestion: Self::suggest(s),
            })
    }
}

/// Column types reported by the table store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    #[serde(rename = "STRING")]
    String,
    #[serde(rename = "INTEGER")]
    Integer,
    #[serde(rename = "LARGETEXT")]
    LargeText,
    #[serde(rename = "STRING_LIST")]
    StringList,
    #[serde(rename = "DOUBLE")]
    Double,
    #[serde(rename = "LINK")]
    Link,
    #[serde(rename = "USERID")]
    UserId,
    #[serde(rename = "BOOLEAN")]
    Boolean,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "STRING",
            Self::Integer => "INTEGER",
            Self::LargeText => "LARGETEXT",
            Self::StringList => "STRING_LIST",
            Self::Double => "DOUBLE",
            Self::Link => "LINK",
            Self::UserId => "USERID",
            Self::Boolean => "BOOLEAN",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Separator used when a list cell is rendered to, or parsed from, text.
pub const LIST_SEPARATOR: &str = ", ";

/// A single table cell. The variant records the value's original type so
/// coercion back to the store schema never has to re-infer it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum CellValue {
    #[default]
    Null,
    Text(String),
    Integer(i64),
    Double(f64),
    Boolean(bool),
    List(Vec<String>),
}

impl CellValue {
    /// Cell read from CSV or other untyped text: empty means null.
    pub fn from_text(text: &str) -> Self {
        if text.is_empty() {
            Self::Null
        } else {
            Self::Text(text.to_string())
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Canonical string form used for grouping, aggregation, lookups and CSV output.
    pub fn to_canonical_string(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Text(s) => s.clone(),
            Self::Integer(v) => v.to_string(),
            Self::Double(v) => v.to_string(),
            Self::Boolean(v) => v.to_string(),
            Self::List(items) => items.join(LIST_SEPARATOR),
        }
    }

    /// Convert to the representation the store expects for `column_type`.
    pub fn coerce(&self, column: &str, column_type: ColumnType) -> Result<Self, CatalogError> {
        let text = self.to_canonical_string();
        if text.is_empty() {
            return Ok(Self::Null);
        }
        let fail = || CatalogError::Coercion {
            column: column.to_string(),
            value: text.clone(),
            column_type,
        };
        let coerced = match column_type {
            ColumnType::String | ColumnType::LargeText | ColumnType::Link | ColumnType::UserId => {
                Self::Text(text.clone())
            }
            ColumnType::StringList => match self {
                Self::List(items) => Self::List(items.clone()),
                _ => Self::List(split_string_list(&text)),
            },
            ColumnType::Integer => match self {
                Self::Integer(v) => Self::Integer(*v),
                // `i64::MAX as f64` rounds up to 2^63, which is already out of range.
                Self::Double(v) if v.fract() != 0.0 || *v < i64::MIN as f64 || *v >= i64::MAX as f64 => {
                    return Err(fail());
                }
                Self::Double(v) => Self::Integer(*v as i64),
                _ => Self::Integer(text.trim().parse().map_err(|_| fail())?),
            },
            ColumnType::Double => match self {
                Self::Double(v) => Self::Double(*v),
                Self::Integer(v) => Self::Double(*v as f64),
                _ => Self::Double(text.trim().parse().map_err(|_| fail())?),
            },
            ColumnType::Boolean => match self {
                Self::Boolean(v) => Self::Boolean(*v),
                _ => Self::Boolean(parse_bool(&text).ok_or_else(fail)?),
            },
        };
        Ok(coerced)
    }
}

/// Split a STRING_LIST cell on `", "`. Joining the parts with the same
/// separator reproduces the input when no item contains an embedded comma.
pub fn split_string_list(text: &str) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    text.split(LIST_SEPARATOR).map(ToString::to_string).collect()
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "yes" | "1" => Some(true),
        "false" | "f" | "no" | "0" => Some(false),
        _ => None,
    }
}

/// Column name → store column type.
pub type ColumnSchema = BTreeMap<String, ColumnType>;

/// A rectangular, named dataset: ordered columns and rows of typed cells.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RecordTable {
    columns: Vec<String>,
    rows: Vec<Vec<CellValue>>,
}

impl RecordTable {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<CellValue>>) -> Result<Self, CatalogError> {
        for (idx, row) in rows.iter().enumerate() {
            if row.len() != columns.len() {
                return Err(CatalogError::RaggedRow {
                    row: idx,
                    expected: columns.len(),
                    found: row.len(),
                });
            }
        }
        Ok(Self { columns, rows })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<CellValue>] {
        &self.rows
    }

    /// Mutable row access; rows are slices so their width cannot change.
    pub fn rows_mut(&mut self) -> impl Iterator<Item = &mut [CellValue]> {
        self.rows.iter_mut().map(Vec::as_mut_slice)
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }

    pub fn require_column(&self, column: &str) -> Result<usize, CatalogError> {
        self.column_index(column)
            .ok_or_else(|| CatalogError::MissingColumn {
                column: column.to_string(),
            })
    }

    pub fn column_values(&self, column: &str) -> Result<Vec<&CellValue>, CatalogError> {
        let idx = self.require_column(column)?;
        Ok(self.rows.iter().map(|row| &row[idx]).collect())
    }

    /// Record type label taken from the leading `Component` column.
    pub fn record_type_name(&self) -> Result<String, CatalogError> {
        if self.columns.first().map(String::as_str) != Some(COMPONENT_COLUMN) {
            return Err(CatalogError::MissingComponent);
        }
        self.rows
            .iter()
            .map(|row| row[0].to_canonical_string())
            .find(|label| !label.is_empty())
            .ok_or(CatalogError::MissingComponent)
    }

    /// Projection onto `columns`, in the requested order.
    pub fn select(&self, columns: &[String]) -> Result<Self, CatalogError> {
        let indices = columns
            .iter()
            .map(|c| self.require_column(c))
            .collect::<Result<Vec<_>, _>>()?;
        let rows = self
            .rows
            .iter()
            .map(|row| indices.iter().map(|&i| row[i].clone()).collect())
            .collect();
        Ok(Self {
            columns: columns.to_vec(),
            rows,
        })
    }

    /// Coerce every column named in `schema` to its declared type. Columns the
    /// schema does not mention are left untouched.
    pub fn coerce_to_schema(&self, schema: &ColumnSchema) -> Result<Self, CatalogError> {
        let mut rows = self.rows.clone();
        for (idx, column) in self.columns.iter().enumerate() {
            let Some(column_type) = schema.get(column) else {
                continue;
            };
            for row in &mut rows {
                row[idx] = row[idx].coerce(column, *column_type)?;
            }
        }
        Ok(Self {
            columns: self.columns.clone(),
            rows,
        })
    }
}

/// Artifacts produced for one record type by one validation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub record_type_name: String,
    pub raw_log_path: PathBuf,
    pub structured_log_path: PathBuf,
    pub source_table_path: PathBuf,
    pub validated_at: DateTime<Utc>,
}
