//! QC run orchestration: fetch, merge, validate and parse per record type,
//! plus the controlled-vocabulary update of annotation tables.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use mdc_core::{RecordTable, ValidationResult, ENTITY_ID_COLUMN};
use mdc_reconcile::{
    build_vocabulary_map, load_reference, merge_rows, ColumnAliases, ConflictPolicy, VocabularyMap,
};
use mdc_storage::{
    write_atomic, HttpClientConfig, HttpFetcher, LocalTableStore, OutputStore, TableQuery, TableStore,
};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod validation;

pub use validation::{parse_log, ParsedLog, SchematicValidator, ValidationOutcome, Validator};

pub const CRATE_NAME: &str = "mdc-sync";

pub const DEFAULT_VOCABULARY_URL: &str =
    "https://raw.githubusercontent.com/mc2-center/data-models/main/all_valid_values.csv";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub output_dir: PathBuf,
    pub store_root: PathBuf,
    pub validator_program: PathBuf,
    /// Config file handed to the validator; required for `qc` runs.
    pub validator_config: Option<PathBuf>,
    pub merge: bool,
    pub max_parallel: usize,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub vocabulary_source: String,
    pub strict_vocabulary: bool,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            output_dir: std::env::var("MDC_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./output")),
            store_root: std::env::var("MDC_STORE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./tables")),
            validator_program: std::env::var("MDC_VALIDATOR_BIN")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("schematic")),
            validator_config: None,
            merge: false,
            max_parallel: std::env::var("MDC_MAX_PARALLEL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1),
            http_timeout_secs: std::env::var("MDC_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            user_agent: std::env::var("MDC_USER_AGENT")
                .unwrap_or_else(|_| "mdc-qc/0.1".to_string()),
            vocabulary_source: DEFAULT_VOCABULARY_URL.to_string(),
            strict_vocabulary: false,
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }

    pub fn conflict_policy(&self) -> ConflictPolicy {
        if self.strict_vocabulary {
            ConflictPolicy::Reject
        } else {
            ConflictPolicy::LastWriteWins
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStage {
    Merge,
    Validate,
    Parse,
}

impl fmt::Display for ChainStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Merge => "merge",
            Self::Validate => "validate",
            Self::Parse => "parse",
        })
    }
}

/// A record type whose chain stopped; other record types are unaffected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainFailure {
    pub record_type: String,
    pub table_id: String,
    pub stage: ChainStage,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QcRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub merged: bool,
    pub tables: Vec<String>,
    pub results: Vec<ValidationResult>,
    pub failures: Vec<ChainFailure>,
    pub reports_dir: PathBuf,
}

impl QcRunSummary {
    pub fn first_failure(&self) -> Option<&ChainFailure> {
        self.failures.first()
    }
}

#[derive(Debug, Clone)]
struct FetchedTable {
    table_id: String,
    record_type: String,
    table: RecordTable,
}

pub struct QcPipeline {
    config: PipelineConfig,
    output: OutputStore,
    store: Arc<dyn TableStore>,
    validator: Arc<dyn Validator>,
}

impl QcPipeline {
    pub fn new(config: PipelineConfig, store: Arc<dyn TableStore>, validator: Arc<dyn Validator>) -> Self {
        let output = OutputStore::new(config.output_dir.clone());
        Self {
            config,
            output,
            store,
            validator,
        }
    }

    /// Local table store plus the `schematic` validator, as configured.
    pub fn from_config(config: PipelineConfig) -> Result<Self> {
        let validator_config = config
            .validator_config
            .clone()
            .context("a validator config path is required for QC runs")?;
        let store = Arc::new(LocalTableStore::new(config.store_root.clone()));
        let validator = Arc::new(SchematicValidator::new(
            config.validator_program.clone(),
            validator_config,
            OutputStore::new(config.output_dir.clone()),
        ));
        Ok(Self::new(config, store, validator))
    }

    pub fn output(&self) -> &OutputStore {
        &self.output
    }

    pub async fn run_once(&self, table_ids: &[String]) -> Result<QcRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        if table_ids.is_empty() {
            bail!("no table ids requested");
        }
        self.output.ensure_root().await?;

        let fetched = self.fetch_tables(table_ids).await?;
        for item in &fetched {
            let path = self.output.raw_table_path(&item.record_type);
            self.output
                .write_table(&path, &item.table)
                .await
                .with_context(|| format!("writing raw table for {}", item.record_type))?;
        }
        info!(%run_id, tables = fetched.len(), merge = self.config.merge, "tables fetched");

        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel.max(1)));
        let mut chains = JoinSet::new();
        for (position, item) in fetched.iter().cloned().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let validator = Arc::clone(&self.validator);
            let output = self.output.clone();
            let merge = self.config.merge;
            let span = info_span!("qc_chain", %run_id, record_type = %item.record_type, table_id = %item.table_id);
            chains.spawn(
                async move {
                    let outcome = match semaphore.acquire_owned().await {
                        Ok(_permit) => run_chain(validator.as_ref(), &output, merge, &item).await,
                        Err(err) => Err(ChainFailure {
                            record_type: item.record_type.clone(),
                            table_id: item.table_id.clone(),
                            stage: ChainStage::Validate,
                            message: err.to_string(),
                        }),
                    };
                    (position, outcome)
                }
                .instrument(span),
            );
        }

        let mut outcomes = Vec::with_capacity(fetched.len());
        while let Some(joined) = chains.join_next().await {
            outcomes.push(joined.context("QC chain task panicked")?);
        }
        outcomes.sort_by_key(|(position, _)| *position);

        let mut results = Vec::new();
        let mut failures = Vec::new();
        for (_, outcome) in outcomes {
            match outcome {
                Ok(result) => results.push(result),
                Err(failure) => {
                    warn!(
                        record_type = %failure.record_type,
                        stage = %failure.stage,
                        error = %failure.message,
                        "QC chain failed"
                    );
                    failures.push(failure);
                }
            }
        }

        let mut summary = QcRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            merged: self.config.merge,
            tables: fetched.iter().map(|f| f.table_id.clone()).collect(),
            results,
            failures,
            reports_dir: self.output.reports_dir(run_id),
        };
        self.write_reports(&mut summary).await?;
        Ok(summary)
    }

    /// All-or-nothing: any failed query aborts before a file is written.
    async fn fetch_tables(&self, table_ids: &[String]) -> Result<Vec<FetchedTable>> {
        let mut fetched = Vec::with_capacity(table_ids.len());
        let mut seen: HashMap<String, String> = HashMap::new();
        for table_id in table_ids {
            let queried = self
                .store
                .query(&TableQuery::select_all(table_id))
                .await
                .with_context(|| format!("fetching table {table_id}"))?;
            let record_type = queried
                .table
                .record_type_name()
                .with_context(|| format!("identifying record type of table {table_id}"))?;
            if let Some(previous) = seen.insert(record_type.clone(), table_id.clone()) {
                bail!(
                    "tables {previous} and {table_id} both hold {record_type} records; request one table per record type"
                );
            }
            fetched.push(FetchedTable {
                table_id: table_id.clone(),
                record_type,
                table: queried.table,
            });
        }
        Ok(fetched)
    }

    async fn write_reports(&self, summary: &mut QcRunSummary) -> Result<()> {
        let reports_dir = self.output.reports_dir(summary.run_id);
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;
        summary.finished_at = Utc::now();

        let summary_json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        write_atomic(&reports_dir.join("summary.json"), &summary_json)
            .await
            .context("writing summary.json")?;
        write_atomic(&reports_dir.join("brief.md"), render_brief(summary).as_bytes())
            .await
            .context("writing brief.md")?;
        Ok(())
    }
}

async fn run_chain(
    validator: &dyn Validator,
    output: &OutputStore,
    merge: bool,
    item: &FetchedTable,
) -> std::result::Result<ValidationResult, ChainFailure> {
    let fail = |stage: ChainStage, err: anyhow::Error| ChainFailure {
        record_type: item.record_type.clone(),
        table_id: item.table_id.clone(),
        stage,
        message: format!("{err:#}"),
    };

    let manifest_path = if merge {
        let merged = merge_rows(&item.table, &item.record_type)
            .map_err(|err| fail(ChainStage::Merge, err.into()))?;
        let path = output.merged_table_path(&item.record_type);
        output
            .write_table(&path, &merged)
            .await
            .map_err(|err| fail(ChainStage::Merge, err))?;
        info!(rows_in = item.table.num_rows(), rows_out = merged.num_rows(), "rows merged");
        path
    } else {
        output.raw_table_path(&item.record_type)
    };

    // A log left by an earlier run must not outlive a failed validation.
    let structured_log_path = output.structured_log_path(&item.record_type);
    match fs::remove_file(&structured_log_path).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            let err = anyhow::Error::new(err)
                .context(format!("removing stale log {}", structured_log_path.display()));
            return Err(fail(ChainStage::Validate, err));
        }
    }

    let outcome = validator
        .run(&item.record_type, &manifest_path)
        .await
        .map_err(|err| fail(ChainStage::Validate, err.into()))?;

    let parsed = parse_log(&outcome.stdout_log_path, &structured_log_path)
        .await
        .map_err(|err| fail(ChainStage::Parse, err))?;
    info!(messages = parsed.messages.len(), "validation finished");

    Ok(ValidationResult {
        record_type_name: item.record_type.clone(),
        raw_log_path: outcome.stdout_log_path,
        structured_log_path,
        source_table_path: manifest_path,
        validated_at: Utc::now(),
    })
}

fn render_brief(summary: &QcRunSummary) -> String {
    let results = if summary.results.is_empty() {
        "- none\n".to_string()
    } else {
        summary
            .results
            .iter()
            .map(|r| {
                format!(
                    "- `{}`: `{}` (manifest `{}`)\n",
                    r.record_type_name,
                    r.structured_log_path.display(),
                    r.source_table_path.display()
                )
            })
            .collect()
    };
    let failures = if summary.failures.is_empty() {
        "- none\n".to_string()
    } else {
        summary
            .failures
            .iter()
            .map(|f| format!("- `{}` ({}) failed at {}: {}\n", f.record_type, f.table_id, f.stage, f.message))
            .collect()
    };
    format!(
        "# Metadata QC Brief\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Tables: {}\n- Rows merged: {}\n\n## Validated\n{}\n## Failed\n{}",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.tables.join(", "),
        if summary.merged { "yes" } else { "no" },
        results,
        failures,
    )
}

/// Markdown digest of the most recent QC runs found under `<output>/reports`.
pub fn report_recent_runs_markdown(runs: usize, output_dir: &Path) -> Result<String> {
    let reports_root = output_dir.join("reports");
    let mut summaries = Vec::new();
    for entry in std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
    {
        let path = entry.path().join("summary.json");
        let Ok(bytes) = std::fs::read(&path) else {
            continue;
        };
        let summary: QcRunSummary =
            serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))?;
        summaries.push(summary);
    }
    summaries.sort_by_key(|s| std::cmp::Reverse(s.started_at));

    let mut out = String::from("# Recent QC Runs\n\n");
    if summaries.is_empty() {
        out.push_str("No runs recorded yet.\n");
    }
    for summary in summaries.into_iter().take(runs.max(1)) {
        out.push_str(&format!(
            "- `{}` {}: {} validated, {} failed\n",
            summary.run_id,
            summary.started_at.format("%Y-%m-%d %H:%M:%S"),
            summary.results.len(),
            summary.failures.len()
        ));
        for failure in &summary.failures {
            out.push_str(&format!("  - {} at {}: {}\n", failure.record_type, failure.stage, failure.message));
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, Serialize)]
pub struct TableUpdate {
    pub table_id: String,
    pub rows: usize,
    pub substitutions: usize,
    /// Dry-run output file.
    pub written_to: Option<PathBuf>,
    /// Version tag after a real store.
    pub new_version_tag: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateSummary {
    pub union_table_id: String,
    pub dry_run: bool,
    pub tables: Vec<TableUpdate>,
    pub vocabulary_conflicts: usize,
}

/// Rewrites annotation tables listed in a union table with canonical terms.
pub struct VocabularyUpdate {
    store: Arc<dyn TableStore>,
    output: OutputStore,
    vocabulary: VocabularyMap,
    aliases: ColumnAliases,
}

impl VocabularyUpdate {
    pub fn new(store: Arc<dyn TableStore>, output: OutputStore, vocabulary: VocabularyMap) -> Self {
        Self {
            store,
            output,
            vocabulary,
            aliases: ColumnAliases::builtin(),
        }
    }

    /// Local table store plus the configured vocabulary reference.
    pub async fn from_config(config: &PipelineConfig) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config())?;
        let reference = load_reference(&config.vocabulary_source, &http).await?;
        let vocabulary = build_vocabulary_map(&reference, config.conflict_policy())?;
        info!(
            source = %config.vocabulary_source,
            categories = vocabulary.categories().count(),
            conflicts = vocabulary.conflicts().len(),
            "vocabulary loaded"
        );
        Ok(Self::new(
            Arc::new(LocalTableStore::new(config.store_root.clone())),
            OutputStore::new(config.output_dir.clone()),
            vocabulary,
        ))
    }

    pub async fn run(&self, union_table_id: &str, dry_run: bool) -> Result<UpdateSummary> {
        let query = format!("SELECT {ENTITY_ID_COLUMN} FROM {union_table_id}");
        let union = self
            .store
            .query(&query)
            .await
            .with_context(|| format!("listing tables in {union_table_id}"))?;

        let mut seen = HashSet::new();
        let table_ids: Vec<String> = union
            .table
            .column_values(ENTITY_ID_COLUMN)?
            .into_iter()
            .map(|cell| cell.to_canonical_string())
            .filter(|id| !id.is_empty() && seen.insert(id.clone()))
            .collect();
        info!(union = union_table_id, tables = table_ids.len(), dry_run, "updating annotation tables");

        if dry_run {
            self.output.ensure_root().await?;
        }
        let mut tables = Vec::with_capacity(table_ids.len());
        for table_id in table_ids {
            let span = info_span!("vocabulary_update", table_id = %table_id);
            tables.push(self.update_table(&table_id, dry_run).instrument(span).await?);
        }

        Ok(UpdateSummary {
            union_table_id: union_table_id.to_string(),
            dry_run,
            tables,
            vocabulary_conflicts: self.vocabulary.conflicts().len(),
        })
    }

    async fn update_table(&self, table_id: &str, dry_run: bool) -> Result<TableUpdate> {
        let queried = self
            .store
            .query(&TableQuery::select_all(table_id))
            .await
            .with_context(|| format!("fetching table {table_id}"))?;
        let schema = self
            .store
            .fetch_column_schema(table_id)
            .await
            .with_context(|| format!("fetching column schema of {table_id}"))?;
        // Coerce first so STRING_LIST cells are matched item by item.
        let coerced = queried
            .table
            .coerce_to_schema(&schema)
            .with_context(|| format!("coercing {table_id} to its column schema"))?;
        let applied = self.vocabulary.apply(&coerced, &self.aliases);
        info!(
            substitutions = applied.substitutions,
            categories = ?applied.categories_checked,
            "vocabulary applied"
        );

        let mut update = TableUpdate {
            table_id: table_id.to_string(),
            rows: applied.table.num_rows(),
            substitutions: applied.substitutions,
            written_to: None,
            new_version_tag: None,
        };
        if dry_run {
            let path = self.output.updated_table_path(table_id);
            self.output.write_table(&path, &applied.table).await?;
            update.written_to = Some(path);
        } else {
            let tag = self
                .store
                .store(table_id, &applied.table, &queried.version_tag)
                .await
                .with_context(|| format!("storing updated table {table_id}"))?;
            update.new_version_tag = Some(tag);
        }
        Ok(update)
    }
}

/// Per-record-type counts of a finished run, for CLI output.
pub fn summarize_results(summary: &QcRunSummary) -> BTreeMap<String, &'static str> {
    let mut status = BTreeMap::new();
    for result in &summary.results {
        status.insert(result.record_type_name.clone(), "validated");
    }
    for failure in &summary.failures {
        status.insert(failure.record_type.clone(), "failed");
    }
    status
}
