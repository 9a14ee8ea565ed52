//! Controlled vocabulary: nonpreferred term → canonical term, per category.

use std::collections::{BTreeMap, HashMap};

use anyhow::Context;
use mdc_core::{CatalogError, CellValue, RecordTable};
use mdc_storage::HttpFetcher;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::ColumnAliases;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VocabularyEntry {
    pub category: String,
    pub canonical_term: String,
    pub nonpreferred_terms: Vec<String>,
}

/// A nonpreferred term that was claimed by two canonical terms in one category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VocabularyConflict {
    pub category: String,
    pub term: String,
    pub previous: String,
    pub replacement: String,
}

impl VocabularyConflict {
    pub fn to_error(&self) -> CatalogError {
        CatalogError::AmbiguousVocabularyMapping {
            category: self.category.clone(),
            term: self.term.clone(),
            previous: self.previous.clone(),
            replacement: self.replacement.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Keep the later mapping and log a warning.
    #[default]
    LastWriteWins,
    /// Fail with `AmbiguousVocabularyMapping`.
    Reject,
}

#[derive(Debug, Deserialize)]
struct ReferenceRow {
    category: String,
    valid_value: String,
    #[serde(default)]
    nonpreferred_values: Option<String>,
}

/// Split a `nonpreferred_values` cell on `,`, tolerating one following space.
pub fn split_nonpreferred(cell: &str) -> Vec<String> {
    cell.replace(", ", ",")
        .split(',')
        .filter(|term| !term.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Parse the reference CSV (`category`, `valid_value`, `nonpreferred_values`).
/// Rows without nonpreferred values are skipped.
pub fn parse_reference_entries(bytes: &[u8]) -> Result<Vec<VocabularyEntry>, csv::Error> {
    // Rows may omit the trailing `nonpreferred_values` cell.
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(bytes);
    let mut entries = Vec::new();
    for row in reader.deserialize::<ReferenceRow>() {
        let row = row?;
        let terms = row
            .nonpreferred_values
            .as_deref()
            .map(split_nonpreferred)
            .unwrap_or_default();
        if terms.is_empty() {
            continue;
        }
        entries.push(VocabularyEntry {
            category: row.category,
            canonical_term: row.valid_value,
            nonpreferred_terms: terms,
        });
    }
    Ok(entries)
}

/// `{category → {nonpreferred term → canonical term}}`.
#[derive(Debug, Clone, Default)]
pub struct VocabularyMap {
    categories: BTreeMap<String, HashMap<String, String>>,
    conflicts: Vec<VocabularyConflict>,
}

impl VocabularyMap {
    pub fn from_entries(
        entries: impl IntoIterator<Item = VocabularyEntry>,
        policy: ConflictPolicy,
    ) -> Result<Self, CatalogError> {
        let mut map = Self::default();
        for entry in entries {
            let terms = map.categories.entry(entry.category.clone()).or_default();
            for term in entry.nonpreferred_terms {
                let previous = terms.insert(term.clone(), entry.canonical_term.clone());
                let Some(previous) = previous.filter(|p| *p != entry.canonical_term) else {
                    continue;
                };
                let conflict = VocabularyConflict {
                    category: entry.category.clone(),
                    term,
                    previous,
                    replacement: entry.canonical_term.clone(),
                };
                if policy == ConflictPolicy::Reject {
                    return Err(conflict.to_error());
                }
                warn!(
                    category = %conflict.category,
                    term = %conflict.term,
                    previous = %conflict.previous,
                    replacement = %conflict.replacement,
                    "ambiguous vocabulary mapping; keeping the later canonical term"
                );
                map.conflicts.push(conflict);
            }
        }
        Ok(map)
    }

    pub fn lookup(&self, category: &str, term: &str) -> Option<&str> {
        self.categories
            .get(category)
            .and_then(|terms| terms.get(term))
            .map(String::as_str)
    }

    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.categories.keys().map(String::as_str)
    }

    pub fn conflicts(&self) -> &[VocabularyConflict] {
        &self.conflicts
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    /// Replace nonpreferred values cell by cell. Column names are translated
    /// to categories through `aliases` for matching only; the returned table
    /// keeps the input's column names.
    pub fn apply(&self, table: &RecordTable, aliases: &ColumnAliases) -> VocabularyApplication {
        let mut updated = table.clone();
        let mut substitutions = 0usize;
        let mut categories_checked = Vec::new();

        for (idx, column) in table.columns().iter().enumerate() {
            let category = aliases.category_for(column);
            let Some(terms) = self.categories.get(category) else {
                continue;
            };
            debug!(column, category, "checking vocabulary");
            categories_checked.push(category.to_string());

            for row in updated.rows_mut() {
                let replaced = match &row[idx] {
                    CellValue::Null => None,
                    CellValue::List(items) => {
                        let mut changed = false;
                        let mapped = items
                            .iter()
                            .map(|item| match terms.get(item) {
                                Some(canonical) => {
                                    changed = true;
                                    substitutions += 1;
                                    canonical.clone()
                                }
                                None => item.clone(),
                            })
                            .collect();
                        changed.then_some(CellValue::List(mapped))
                    }
                    other => terms.get(&other.to_canonical_string()).map(|canonical| {
                        substitutions += 1;
                        CellValue::Text(canonical.clone())
                    }),
                };
                if let Some(value) = replaced {
                    row[idx] = value;
                }
            }
        }

        VocabularyApplication {
            table: updated,
            substitutions,
            categories_checked,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VocabularyApplication {
    pub table: RecordTable,
    pub substitutions: usize,
    pub categories_checked: Vec<String>,
}

/// Build the nested vocabulary map from reference CSV bytes.
pub fn build_vocabulary_map(bytes: &[u8], policy: ConflictPolicy) -> anyhow::Result<VocabularyMap> {
    let entries = parse_reference_entries(bytes).context("parsing vocabulary reference CSV")?;
    Ok(VocabularyMap::from_entries(entries, policy)?)
}

/// Apply `map` to `table`, returning the updated table.
pub fn apply_vocabulary_map(
    table: &RecordTable,
    map: &VocabularyMap,
    aliases: &ColumnAliases,
) -> RecordTable {
    map.apply(table, aliases).table
}

/// Read the reference CSV from a local path or an `http(s)://` URL.
pub async fn load_reference(source: &str, http: &HttpFetcher) -> anyhow::Result<Vec<u8>> {
    if source.starts_with("http://") || source.starts_with("https://") {
        http.fetch_bytes(source)
            .await
            .with_context(|| format!("downloading vocabulary reference {source}"))
    } else {
        tokio::fs::read(source)
            .await
            .with_context(|| format!("reading vocabulary reference {source}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdc_storage::HttpClientConfig;

    const REFERENCE: &str = "category,valid_value,nonpreferred_values\n\
assay,RNA-seq,\"RNAseq,RNA Seq\"\n\
assay,Flow Cytometry,\n\
tumorType,Breast Carcinoma,\"breast cancer, Breast Cancer\"\n\
species,Homo sapiens,human\n";

    fn text(s: &str) -> CellValue {
        CellValue::from_text(s)
    }

    fn table(columns: &[&str], rows: &[&[&str]]) -> RecordTable {
        RecordTable::new(
            columns.iter().map(|c| c.to_string()).collect(),
            rows.iter()
                .map(|row| row.iter().map(|v| text(v)).collect())
                .collect(),
        )
        .unwrap()
    }

    fn reference_map() -> VocabularyMap {
        build_vocabulary_map(REFERENCE.as_bytes(), ConflictPolicy::LastWriteWins).unwrap()
    }

    #[test]
    fn splitting_tolerates_optional_space() {
        assert_eq!(split_nonpreferred("a,b, c"), ["a", "b", "c"]);
        assert_eq!(split_nonpreferred("RNA Seq"), ["RNA Seq"]);
        assert!(split_nonpreferred("").is_empty());
        assert_eq!(split_nonpreferred("a,,b,"), ["a", "b"]);
    }

    #[test]
    fn canonical_only_rows_are_excluded() {
        let map = reference_map();
        assert_eq!(map.lookup("assay", "RNAseq"), Some("RNA-seq"));
        assert_eq!(map.lookup("assay", "RNA Seq"), Some("RNA-seq"));
        assert_eq!(map.lookup("assay", "Flow Cytometry"), None);
        assert_eq!(map.lookup("tumorType", "Breast Cancer"), Some("Breast Carcinoma"));
        assert_eq!(map.categories().collect::<Vec<_>>(), ["assay", "species", "tumorType"]);
    }

    #[test]
    fn missing_nonpreferred_column_yields_empty_map() {
        let map = build_vocabulary_map(
            b"category,valid_value\nassay,RNA-seq\n",
            ConflictPolicy::LastWriteWins,
        )
        .unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn short_rows_omit_nonpreferred_values() {
        let map = build_vocabulary_map(
            b"category,valid_value,nonpreferred_values\nassay,RNA-seq,\"RNAseq,RNA Seq\"\nspecies,Homo sapiens\n",
            ConflictPolicy::LastWriteWins,
        )
        .unwrap();
        assert_eq!(map.lookup("assay", "RNA Seq"), Some("RNA-seq"));
        assert_eq!(map.categories().collect::<Vec<_>>(), ["assay"]);
    }

    #[test]
    fn aliased_columns_are_mapped_value_by_value() {
        let map = reference_map();
        let input = table(
            &["Component", "Publication Assay", "Publication Title"],
            &[
                &["PublicationView", "RNAseq", "RNAseq in practice"],
                &["PublicationView", "Flow Cytometry", "Cells"],
                &["PublicationView", "RNA-seq", "Already canonical"],
            ],
        );
        let applied = map.apply(&input, &ColumnAliases::builtin());
        assert_eq!(applied.substitutions, 1);
        assert_eq!(applied.table.columns(), input.columns());
        let assays = applied
            .table
            .column_values("Publication Assay")
            .unwrap()
            .into_iter()
            .map(CellValue::to_canonical_string)
            .collect::<Vec<_>>();
        assert_eq!(assays, ["RNA-seq", "Flow Cytometry", "RNA-seq"]);
        assert_eq!(
            applied.table.rows()[0][2],
            text("RNAseq in practice"),
            "unaliased, uncategorised columns stay untouched"
        );
    }

    #[test]
    fn list_cells_are_mapped_per_item() {
        let map = reference_map();
        let input = RecordTable::new(
            vec!["assay".into()],
            vec![vec![CellValue::List(vec!["RNAseq".into(), "ATAC-seq".into()])]],
        )
        .unwrap();
        let output = apply_vocabulary_map(&input, &map, &ColumnAliases::default());
        assert_eq!(
            output.rows()[0][0],
            CellValue::List(vec!["RNA-seq".into(), "ATAC-seq".into()])
        );
    }

    #[test]
    fn mapping_is_idempotent() {
        let map = reference_map();
        let aliases = ColumnAliases::builtin();
        let input = table(
            &["Component", "Dataset Assay", "Dataset Species", "Dataset Tumor Type"],
            &[
                &["DatasetView", "RNA Seq", "human", "breast cancer"],
                &["DatasetView", "Flow Cytometry", "Homo sapiens", ""],
            ],
        );
        let once = apply_vocabulary_map(&input, &map, &aliases);
        let twice = apply_vocabulary_map(&once, &map, &aliases);
        assert_eq!(once, twice);
        assert_ne!(once, input);
    }

    #[test]
    fn conflicting_synonyms_last_write_wins_with_record() {
        let reference = "category,valid_value,nonpreferred_values\n\
assay,RNA-seq,RNAseq\n\
assay,scRNA-seq,RNAseq\n";
        let map = build_vocabulary_map(reference.as_bytes(), ConflictPolicy::LastWriteWins).unwrap();
        assert_eq!(map.lookup("assay", "RNAseq"), Some("scRNA-seq"));
        assert_eq!(map.conflicts().len(), 1);
        assert_eq!(map.conflicts()[0].previous, "RNA-seq");

        let err = build_vocabulary_map(reference.as_bytes(), ConflictPolicy::Reject).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CatalogError>(),
            Some(CatalogError::AmbiguousVocabularyMapping { .. })
        ));
    }

    #[test]
    fn repeated_identical_mapping_is_not_a_conflict() {
        let entries = vec![
            VocabularyEntry {
                category: "assay".into(),
                canonical_term: "RNA-seq".into(),
                nonpreferred_terms: vec!["RNAseq".into()],
            },
            VocabularyEntry {
                category: "assay".into(),
                canonical_term: "RNA-seq".into(),
                nonpreferred_terms: vec!["RNAseq".into()],
            },
        ];
        let map = VocabularyMap::from_entries(entries, ConflictPolicy::Reject).unwrap();
        assert!(map.conflicts().is_empty());
    }

    #[tokio::test]
    async fn reference_loads_from_local_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("all_valid_values.csv");
        std::fs::write(&path, REFERENCE).unwrap();
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let bytes = load_reference(path.to_str().unwrap(), &http).await.unwrap();
        assert_eq!(bytes, REFERENCE.as_bytes());
    }
}
