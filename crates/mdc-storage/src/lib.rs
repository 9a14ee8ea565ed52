//! Table store contract, local output files and HTTP fetch utilities.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use mdc_core::{CatalogError, CellValue, ColumnSchema, RecordTable};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mdc-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Write `bytes` to `path` through a temp file and an atomic rename so readers
/// never observe a half-written file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

/// Deterministic, record-type keyed layout of the local output directory.
#[derive(Debug, Clone)]
pub struct OutputStore {
    root: PathBuf,
}

impl OutputStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn raw_table_path(&self, record_type: &str) -> PathBuf {
        self.root.join(format!("{record_type}.csv"))
    }

    pub fn merged_table_path(&self, record_type: &str) -> PathBuf {
        self.root.join(format!("{record_type}_merged.csv"))
    }

    pub fn stdout_log_path(&self, record_type: &str) -> PathBuf {
        self.root.join(format!("{record_type}_out.txt"))
    }

    pub fn stderr_log_path(&self, record_type: &str) -> PathBuf {
        self.root.join(format!("{record_type}_error.txt"))
    }

    pub fn structured_log_path(&self, record_type: &str) -> PathBuf {
        self.root.join(format!("{record_type}_out.csv"))
    }

    pub fn updated_table_path(&self, table_id: &str) -> PathBuf {
        self.root.join(format!("{table_id}-updated.csv"))
    }

    pub fn reports_dir(&self, run_id: Uuid) -> PathBuf {
        self.root.join("reports").join(run_id.to_string())
    }

    pub async fn ensure_root(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating output directory {}", self.root.display()))
    }

    pub async fn write_table(&self, path: &Path, table: &RecordTable) -> anyhow::Result<()> {
        let bytes = table_to_csv(table)
            .with_context(|| format!("rendering CSV for {}", path.display()))?;
        write_atomic(path, &bytes).await
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Table(#[from] CatalogError),
    #[error("unsupported query `{query}`: {reason}")]
    Query { query: String, reason: String },
    #[error("unknown table `{0}`")]
    UnknownTable(String),
    #[error("schema error for table `{table_id}`: {reason}")]
    Schema { table_id: String, reason: String },
    #[error("version conflict on `{table_id}`: expected {expected}, found {actual}")]
    VersionConflict {
        table_id: String,
        expected: String,
        actual: String,
    },
}

/// Render a table as CSV with a header row and `\n` line endings.
pub fn table_to_csv(table: &RecordTable) -> Result<Vec<u8>, StoreError> {
    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    writer.write_record(table.columns())?;
    for row in table.rows() {
        writer.write_record(row.iter().map(CellValue::to_canonical_string))?;
    }
    writer
        .into_inner()
        .map_err(|err| StoreError::Csv(err.into_error().into()))
}

/// Parse CSV with a header row. Every cell is read as text; empty cells are null.
pub fn table_from_csv(bytes: &[u8]) -> Result<RecordTable, StoreError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(bytes);
    let columns = reader
        .headers()?
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(record.iter().map(CellValue::from_text).collect());
    }
    Ok(RecordTable::new(columns, rows)?)
}

/// `SELECT <columns> FROM <table id>`; anything beyond that is rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableQuery {
    pub table_id: String,
    /// `None` selects every column.
    pub columns: Option<Vec<String>>,
}

impl TableQuery {
    pub fn select_all(table_id: &str) -> String {
        format!("SELECT * FROM {table_id}")
    }

    pub fn parse(query: &str) -> Result<Self, StoreError> {
        let fail = |reason: &str| StoreError::Query {
            query: query.to_string(),
            reason: reason.to_string(),
        };
        let trimmed = query.trim();
        let lower = trimmed.to_ascii_lowercase();
        if !lower.starts_with("select ") {
            return Err(fail("expected SELECT"));
        }
        let from_at = lower.find(" from ").ok_or_else(|| fail("expected FROM"))?;
        if from_at < "select ".len() {
            return Err(fail("missing projection"));
        }
        let projection = trimmed["select ".len()..from_at].trim();
        let table_id = trimmed[from_at + " from ".len()..].trim();

        if table_id.is_empty() {
            return Err(fail("missing table id"));
        }
        if !is_valid_table_id(table_id) {
            return Err(fail("only a bare table id may follow FROM"));
        }

        let columns = if projection == "*" {
            None
        } else {
            let cols = projection
                .split(',')
                .map(|c| c.trim().to_string())
                .collect::<Vec<_>>();
            if cols.iter().any(String::is_empty) {
                return Err(fail("empty column in projection"));
            }
            Some(cols)
        };

        Ok(Self {
            table_id: table_id.to_string(),
            columns,
        })
    }
}

fn is_valid_table_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
        && !id.starts_with('.')
}

#[derive(Debug, Clone)]
pub struct QueriedTable {
    pub table_id: String,
    pub table: RecordTable,
    /// Opaque tag of the version that was read; pass it back to `store`.
    pub version_tag: String,
}

/// Remote table storage as seen by the pipeline.
#[async_trait]
pub trait TableStore: Send + Sync {
    async fn query(&self, query: &str) -> Result<QueriedTable, StoreError>;

    async fn fetch_column_schema(&self, table_id: &str) -> Result<ColumnSchema, StoreError>;

    /// Replace the table contents. Fails with `VersionConflict` when the
    /// stored version no longer matches `expected_version_tag`.
    async fn store(
        &self,
        table_id: &str,
        table: &RecordTable,
        expected_version_tag: &str,
    ) -> Result<String, StoreError>;
}

/// Directory-backed table store: `<id>.csv` holds rows and `<id>.schema.yaml`
/// maps column names to store column types. Version tags are content hashes.
#[derive(Debug)]
pub struct LocalTableStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl LocalTableStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn table_path(&self, table_id: &str) -> PathBuf {
        self.root.join(format!("{table_id}.csv"))
    }

    pub fn schema_path(&self, table_id: &str) -> PathBuf {
        self.root.join(format!("{table_id}.schema.yaml"))
    }

    async fn read_table_bytes(&self, table_id: &str) -> Result<Vec<u8>, StoreError> {
        if !is_valid_table_id(table_id) {
            return Err(StoreError::UnknownTable(table_id.to_string()));
        }
        let path = self.table_path(table_id);
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::UnknownTable(table_id.to_string()))
            }
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }
}

#[async_trait]
impl TableStore for LocalTableStore {
    async fn query(&self, query: &str) -> Result<QueriedTable, StoreError> {
        let parsed = TableQuery::parse(query)?;
        let span = info_span!("table_query", table_id = %parsed.table_id);
        async move {
            let bytes = self.read_table_bytes(&parsed.table_id).await?;
            let version_tag = sha256_hex(&bytes);
            let table = table_from_csv(&bytes)?;
            let table = match &parsed.columns {
                Some(columns) => table.select(columns)?,
                None => table,
            };
            debug!(rows = table.num_rows(), %version_tag, "table fetched");
            Ok::<_, StoreError>(QueriedTable {
                table_id: parsed.table_id.clone(),
                table,
                version_tag,
            })
        }
        .instrument(span)
        .await
    }

    async fn fetch_column_schema(&self, table_id: &str) -> Result<ColumnSchema, StoreError> {
        if !is_valid_table_id(table_id) {
            return Err(StoreError::UnknownTable(table_id.to_string()));
        }
        let path = self.schema_path(table_id);
        let text = fs::read_to_string(&path)
            .await
            .map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;
        let schema: BTreeMap<String, mdc_core::ColumnType> =
            serde_yaml::from_str(&text).map_err(|err| StoreError::Schema {
                table_id: table_id.to_string(),
                reason: err.to_string(),
            })?;
        Ok(schema)
    }

    async fn store(
        &self,
        table_id: &str,
        table: &RecordTable,
        expected_version_tag: &str,
    ) -> Result<String, StoreError> {
        let _guard = self.write_lock.lock().await;

        let current = self.read_table_bytes(table_id).await?;
        let actual = sha256_hex(&current);
        if actual != expected_version_tag {
            return Err(StoreError::VersionConflict {
                table_id: table_id.to_string(),
                expected: expected_version_tag.to_string(),
                actual,
            });
        }

        let schema = self.fetch_column_schema(table_id).await?;
        if let Some(unknown) = table.columns().iter().find(|c| !schema.contains_key(*c)) {
            return Err(StoreError::Schema {
                table_id: table_id.to_string(),
                reason: format!("column `{unknown}` is not part of the table schema"),
            });
        }

        let bytes = table_to_csv(table)?;
        let path = self.table_path(table_id);
        write_atomic(&path, &bytes)
            .await
            .map_err(|err| StoreError::Io {
                path: path.clone(),
                source: std::io::Error::other(format!("{err:#}")),
            })?;
        Ok(sha256_hex(&bytes))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Downloads reference files (e.g. the controlled vocabulary CSV).
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let span = info_span!("http_fetch", url);
        async move {
            let mut attempt = 0usize;
            loop {
                match self.client.get(url).send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        if status.is_success() {
                            return Ok(resp.bytes().await?.to_vec());
                        }
                        if classify_status(status) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            debug!(attempt, %status, "retrying after http status");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: resp.url().to_string(),
                        });
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            debug!(attempt, error = %err, "retrying after request error");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(FetchError::Request(err));
                    }
                }
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdc_core::ColumnType;
    use tempfile::tempdir;

    const PUBLICATIONS_CSV: &str = "Component,Pubmed Id,Publication Assay,entityId\n\
PublicationView,12345,RNAseq,syn1\n\
PublicationView,12345,,syn2\n";

    #[test]
    fn content_hash_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn csv_round_trip_preserves_cells() {
        let table = table_from_csv(PUBLICATIONS_CSV.as_bytes()).unwrap();
        assert_eq!(table.columns()[0], "Component");
        assert_eq!(table.num_rows(), 2);
        assert!(table.rows()[1][2].is_null());
        let rendered = table_to_csv(&table).unwrap();
        assert_eq!(String::from_utf8(rendered).unwrap(), PUBLICATIONS_CSV);
    }

    #[test]
    fn list_cells_render_comma_space_joined() {
        let table = RecordTable::new(
            vec!["species".into()],
            vec![vec![CellValue::List(vec!["Homo sapiens".into(), "Mus musculus".into()])]],
        )
        .unwrap();
        let rendered = String::from_utf8(table_to_csv(&table).unwrap()).unwrap();
        assert_eq!(rendered, "species\n\"Homo sapiens, Mus musculus\"\n");
    }

    #[test]
    fn query_parser_accepts_projection_and_rejects_clauses() {
        let all = TableQuery::parse("SELECT * FROM syn123").unwrap();
        assert_eq!(all.table_id, "syn123");
        assert!(all.columns.is_none());

        let some = TableQuery::parse("select entityId, Component from syn9").unwrap();
        assert_eq!(
            some.columns,
            Some(vec!["entityId".to_string(), "Component".to_string()])
        );

        assert!(TableQuery::parse("SELECT * FROM syn1 WHERE x = 1").is_err());
        assert!(TableQuery::parse("DELETE FROM syn1").is_err());
        assert!(TableQuery::parse("SELECT * FROM ../etc/passwd").is_err());
    }

    #[test]
    fn output_paths_are_keyed_by_record_type() {
        let store = OutputStore::new("output");
        assert_eq!(store.raw_table_path("ToolView"), PathBuf::from("output/ToolView.csv"));
        assert_eq!(
            store.merged_table_path("ToolView"),
            PathBuf::from("output/ToolView_merged.csv")
        );
        assert_eq!(store.stdout_log_path("ToolView"), PathBuf::from("output/ToolView_out.txt"));
        assert_eq!(store.stderr_log_path("ToolView"), PathBuf::from("output/ToolView_error.txt"));
        assert_eq!(
            store.structured_log_path("ToolView"),
            PathBuf::from("output/ToolView_out.csv")
        );
    }

    #[tokio::test]
    async fn atomic_write_replaces_existing_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("table.csv");
        write_atomic(&path, b"first").await.expect("first write");
        write_atomic(&path, b"second").await.expect("second write");
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        let leftovers = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    fn seeded_store() -> (tempfile::TempDir, LocalTableStore) {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("syn1.csv"), PUBLICATIONS_CSV).unwrap();
        std::fs::write(
            dir.path().join("syn1.schema.yaml"),
            "Component: STRING\nPubmed Id: INTEGER\nPublication Assay: STRING_LIST\nentityId: STRING\n",
        )
        .unwrap();
        let store = LocalTableStore::new(dir.path());
        (dir, store)
    }

    #[tokio::test]
    async fn local_store_queries_and_reports_schema() {
        let (_dir, store) = seeded_store();
        let queried = store.query("SELECT * FROM syn1").await.unwrap();
        assert_eq!(queried.table.num_rows(), 2);
        assert_eq!(queried.version_tag, sha256_hex(PUBLICATIONS_CSV.as_bytes()));

        let ids = store.query("SELECT entityId FROM syn1").await.unwrap();
        assert_eq!(ids.table.columns(), ["entityId".to_string()]);

        let schema = store.fetch_column_schema("syn1").await.unwrap();
        assert_eq!(schema["Pubmed Id"], ColumnType::Integer);
        assert_eq!(schema["Publication Assay"], ColumnType::StringList);

        assert!(matches!(
            store.query("SELECT * FROM syn404").await,
            Err(StoreError::UnknownTable(_))
        ));
    }

    #[tokio::test]
    async fn local_store_rejects_stale_version_tag() {
        let (_dir, store) = seeded_store();
        let queried = store.query("SELECT * FROM syn1").await.unwrap();

        let new_tag = store
            .store("syn1", &queried.table, &queried.version_tag)
            .await
            .expect("first store");
        let second = store
            .store("syn1", &queried.table, "stale-tag")
            .await
            .unwrap_err();
        assert!(matches!(second, StoreError::VersionConflict { .. }));

        let reread = store.query("SELECT * FROM syn1").await.unwrap();
        assert_eq!(reread.version_tag, new_tag);
    }

    #[tokio::test]
    async fn local_store_rejects_columns_outside_schema() {
        let (_dir, store) = seeded_store();
        let queried = store.query("SELECT * FROM syn1").await.unwrap();
        let extra = RecordTable::new(
            vec!["Component".into(), "Unknown".into()],
            vec![vec![CellValue::from_text("PublicationView"), CellValue::Null]],
        )
        .unwrap();
        let err = store
            .store("syn1", &extra, &queried.version_tag)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Schema { .. }));
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }
}
