//! Record reconciliation: the static per-record-type merge rule registry, the
//! row merger and controlled-vocabulary mapping.

use std::collections::{BTreeMap, HashMap};

use mdc_core::{CatalogError, CellValue, RecordTable, RecordType};
use tracing::debug;

use AggregationStrategy::{ConcatenateCommaJoined as Join, KeepFirst as First};

pub mod vocabulary;

pub use vocabulary::{
    apply_vocabulary_map, build_vocabulary_map, load_reference, ConflictPolicy,
    VocabularyApplication, VocabularyConflict, VocabularyEntry, VocabularyMap,
};

pub const CRATE_NAME: &str = "mdc-reconcile";

/// Separator for `ConcatenateCommaJoined` columns.
pub const CONCAT_SEPARATOR: &str = ",";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationStrategy {
    KeepFirst,
    ConcatenateCommaJoined,
}

impl AggregationStrategy {
    /// Aggregate the group's values, given in input row order.
    pub fn aggregate(&self, values: &[String]) -> String {
        match self {
            Self::KeepFirst => values.first().cloned().unwrap_or_default(),
            Self::ConcatenateCommaJoined => values.join(CONCAT_SEPARATOR),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnRule {
    pub column: &'static str,
    pub strategy: AggregationStrategy,
}

impl ColumnRule {
    const fn new(column: &'static str, strategy: AggregationStrategy) -> Self {
        Self { column, strategy }
    }
}

/// Grouping key plus per-column aggregation rules for one record type.
#[derive(Debug)]
pub struct MergeRules {
    pub record_type: RecordType,
    pub grouping_key: &'static str,
    pub columns: &'static [ColumnRule],
}

static PUBLICATION_RULES: MergeRules = MergeRules {
    record_type: RecordType::Publication,
    grouping_key: "Pubmed Id",
    columns: &[
        ColumnRule::new("Component", First),
        ColumnRule::new("PublicationView_id", Join),
        ColumnRule::new("Publication Grant Number", Join),
        ColumnRule::new("Publication Doi", First),
        ColumnRule::new("Publication Journal", First),
        ColumnRule::new("Pubmed Url", First),
        ColumnRule::new("Publication Title", First),
        ColumnRule::new("Publication Year", First),
        ColumnRule::new("Publication Keywords", First),
        ColumnRule::new("Publication Authors", First),
        ColumnRule::new("Publication Abstract", First),
        ColumnRule::new("Publication Assay", First),
        ColumnRule::new("Publication Tumor Type", First),
        ColumnRule::new("Publication Tissue", First),
        ColumnRule::new("Publication Accessibility", First),
        ColumnRule::new("Publication Dataset Alias", First),
        ColumnRule::new("entityId", Join),
    ],
};

static DATASET_RULES: MergeRules = MergeRules {
    record_type: RecordType::Dataset,
    grouping_key: "Dataset Alias",
    columns: &[
        ColumnRule::new("Component", First),
        ColumnRule::new("DatasetView_id", Join),
        ColumnRule::new("Dataset Pubmed Id", First),
        ColumnRule::new("Dataset Grant Number", Join),
        ColumnRule::new("Dataset Name", First),
        ColumnRule::new("Dataset Description", First),
        ColumnRule::new("Dataset Design", First),
        ColumnRule::new("Dataset Assay", First),
        ColumnRule::new("Dataset Species", First),
        ColumnRule::new("Dataset Tumor Type", First),
        ColumnRule::new("Dataset Tissue", First),
        ColumnRule::new("Dataset Url", First),
        ColumnRule::new("Dataset File Formats", First),
        ColumnRule::new("entityId", Join),
    ],
};

static TOOL_RULES: MergeRules = MergeRules {
    record_type: RecordType::Tool,
    grouping_key: "Tool Name",
    columns: &[
        ColumnRule::new("Component", First),
        ColumnRule::new("ToolView_id", Join),
        ColumnRule::new("Tool Pubmed Id", First),
        ColumnRule::new("Tool Grant Number", Join),
        ColumnRule::new("Tool Description", First),
        ColumnRule::new("Tool Homepage", First),
        ColumnRule::new("Tool Version", First),
        ColumnRule::new("Tool Operation", First),
        ColumnRule::new("Tool Input Data", First),
        ColumnRule::new("Tool Output Data", First),
        ColumnRule::new("Tool Input Format", First),
        ColumnRule::new("Tool Output Format", First),
        ColumnRule::new("Tool Function Note", First),
        ColumnRule::new("Tool Cmd", First),
        ColumnRule::new("Tool Type", First),
        ColumnRule::new("Tool Topic", First),
        ColumnRule::new("Tool Operating System", First),
        ColumnRule::new("Tool Language", First),
        ColumnRule::new("Tool License", First),
        ColumnRule::new("Tool Cost", First),
        ColumnRule::new("Tool Accessibility", First),
        ColumnRule::new("Tool Download Url", First),
        ColumnRule::new("Tool Download Type", First),
        ColumnRule::new("Tool Download Note", First),
        ColumnRule::new("Tool Download Version", First),
        ColumnRule::new("Tool Documentation Url", First),
        ColumnRule::new("Tool Documentation Type", First),
        ColumnRule::new("Tool Documentation Note", First),
        ColumnRule::new("Tool Link Url", First),
        ColumnRule::new("Tool Link Type", First),
        ColumnRule::new("Tool Link Note", First),
        ColumnRule::new("entityId", Join),
    ],
};

static EDUCATIONAL_RESOURCE_RULES: MergeRules = MergeRules {
    record_type: RecordType::EducationalResource,
    grouping_key: "Resource Alias",
    columns: &[
        ColumnRule::new("Component", First),
        ColumnRule::new("EducationalResource_id", Join),
        ColumnRule::new("Resource Title", First),
        ColumnRule::new("Resource Link", First),
        ColumnRule::new("Resource Topic", First),
        ColumnRule::new("Resource Activity Type", First),
        ColumnRule::new("Resource Primary Format", First),
        ColumnRule::new("Resource Intended Use", First),
        ColumnRule::new("Resource Primary Audience", First),
        ColumnRule::new("Resource Educational Level", First),
        ColumnRule::new("Resource Description", First),
        ColumnRule::new("Resource Origin Institution", First),
        ColumnRule::new("Resource Language", First),
        ColumnRule::new("Resource Contributors", First),
        ColumnRule::new("Resource Grant Number", Join),
        ColumnRule::new("Resource Secondary Topic", First),
        ColumnRule::new("Resource License", First),
        ColumnRule::new("Resource Use Requirements", First),
        ColumnRule::new("Resource Internal Identifier", First),
        ColumnRule::new("Resource Media Accessibility", First),
        ColumnRule::new("Resource Access Hazard", First),
        ColumnRule::new("Resource Dataset Alias", First),
        ColumnRule::new("Resource Tool Link", First),
        ColumnRule::new("entityId", Join),
    ],
};

/// Registry lookup. Adding a record type means adding a rule table here.
pub fn rules_for(record_type: RecordType) -> &'static MergeRules {
    match record_type {
        RecordType::Publication => &PUBLICATION_RULES,
        RecordType::Dataset => &DATASET_RULES,
        RecordType::Tool => &TOOL_RULES,
        RecordType::EducationalResource => &EDUCATIONAL_RESOURCE_RULES,
    }
}

pub fn rules_for_name(record_type_name: &str) -> Result<&'static MergeRules, CatalogError> {
    Ok(rules_for(record_type_name.parse()?))
}

impl MergeRules {
    pub fn strategy_for(&self, column: &str) -> Option<AggregationStrategy> {
        self.columns
            .iter()
            .find(|rule| rule.column == column)
            .map(|rule| rule.strategy)
    }

    /// Collapse rows sharing a grouping-key value into one row per key.
    ///
    /// Output rows follow the first appearance of each key. Output columns are
    /// the input columns (in input order) that are the grouping key or carry a
    /// rule; the rest are dropped.
    pub fn merge(&self, table: &RecordTable) -> Result<RecordTable, CatalogError> {
        let key_idx = table.require_column(self.grouping_key)?;

        let mut plan: Vec<(usize, Option<AggregationStrategy>)> = Vec::new();
        let mut columns = Vec::new();
        for (idx, column) in table.columns().iter().enumerate() {
            if idx == key_idx {
                plan.push((idx, None));
                columns.push(column.clone());
            } else if let Some(strategy) = self.strategy_for(column) {
                plan.push((idx, Some(strategy)));
                columns.push(column.clone());
            } else {
                debug!(record_type = %self.record_type, column, "dropping column without merge rule");
            }
        }

        let mut key_order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<&[CellValue]>> = HashMap::new();
        for row in table.rows() {
            let key = row[key_idx].to_canonical_string();
            groups
                .entry(key.clone())
                .or_insert_with(|| {
                    key_order.push(key);
                    Vec::new()
                })
                .push(row.as_slice());
        }

        let mut rows = Vec::with_capacity(key_order.len());
        for key in &key_order {
            let members = &groups[key];
            let merged: Vec<CellValue> = plan
                .iter()
                .map(|(idx, strategy)| match strategy {
                    None => CellValue::from_text(key),
                    Some(strategy) => {
                        let values = members
                            .iter()
                            .map(|row| row[*idx].to_canonical_string())
                            .collect::<Vec<_>>();
                        CellValue::from_text(&strategy.aggregate(&values))
                    }
                })
                .collect();
            rows.push(merged);
        }

        debug!(
            record_type = %self.record_type,
            input_rows = table.num_rows(),
            merged_rows = rows.len(),
            "rows merged"
        );
        RecordTable::new(columns, rows)
    }
}

/// Merge `table` with the rules registered for `record_type_name`.
pub fn merge_rows(table: &RecordTable, record_type_name: &str) -> Result<RecordTable, CatalogError> {
    rules_for_name(record_type_name)?.merge(table)
}

/// Translation from manifest column names to vocabulary category names.
#[derive(Debug, Clone, Default)]
pub struct ColumnAliases {
    aliases: BTreeMap<String, String>,
}

const BUILTIN_COLUMN_ALIASES: &[(&str, &str)] = &[
    ("Publication Assay", "assay"),
    ("Publication Tumor Type", "tumorType"),
    ("Publication Tissue", "tissue"),
    ("Publication Accessibility", "accessibility"),
    ("Dataset Assay", "assay"),
    ("Dataset Species", "species"),
    ("Dataset Tumor Type", "tumorType"),
    ("Dataset Tissue", "tissue"),
    ("Dataset File Formats", "fileFormat"),
    ("Tool Operation", "operation"),
    ("Tool Input Data", "inputData"),
    ("Tool Output Data", "outputData"),
    ("Tool Input Format", "inputFormat"),
    ("Tool Output Format", "outputFormat"),
    ("Tool Type", "toolType"),
    ("Tool Topic", "topic"),
    ("Tool Operating System", "operatingSystem"),
    ("Tool Language", "programmingLanguage"),
    ("Tool License", "license"),
    ("Tool Cost", "cost"),
    ("Tool Accessibility", "accessibility"),
    ("Tool Download Type", "downloadType"),
    ("Tool Documentation Type", "documentationType"),
    ("Tool Link Type", "linkType"),
    ("Resource Topic", "topic"),
    ("Resource Secondary Topic", "topic"),
    ("Resource Activity Type", "activityType"),
    ("Resource Primary Format", "primaryFormat"),
    ("Resource Intended Use", "intendedUse"),
    ("Resource Primary Audience", "primaryAudience"),
    ("Resource Educational Level", "educationalLevel"),
    ("Resource Language", "language"),
    ("Resource License", "license"),
    ("Resource Media Accessibility", "mediaAccessibility"),
    ("Resource Access Hazard", "accessHazard"),
];

impl ColumnAliases {
    pub fn builtin() -> Self {
        Self::from_pairs(BUILTIN_COLUMN_ALIASES.iter().copied())
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            aliases: pairs
                .into_iter()
                .map(|(column, category)| (column.to_string(), category.to_string()))
                .collect(),
        }
    }

    /// Category a column is matched against; unaliased columns match by their own name.
    pub fn category_for<'a>(&'a self, column: &'a str) -> &'a str {
        self.aliases.get(column).map(String::as_str).unwrap_or(column)
    }
}
