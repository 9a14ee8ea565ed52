//! External manifest validation and validation log post-processing.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::Context;
use async_trait::async_trait;
use mdc_core::CatalogError;
use mdc_storage::{write_atomic, OutputStore};
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, warn};

/// Literal separating messages inside one validator log line.
pub const LOG_MESSAGE_DELIMITER: &str = "], ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationOutcome {
    pub stdout_log_path: PathBuf,
    pub stderr_log_path: PathBuf,
}

#[async_trait]
pub trait Validator: Send + Sync {
    /// Validate the manifest at `manifest_path` as `record_type`. Resolves once
    /// the validation has finished and its logs are on disk.
    async fn run(
        &self,
        record_type: &str,
        manifest_path: &Path,
    ) -> Result<ValidationOutcome, CatalogError>;
}

/// Runs the `schematic` CLI:
/// `<program> model -c <config> validate -dt <record type> -mp <manifest>`.
#[derive(Debug, Clone)]
pub struct SchematicValidator {
    program: PathBuf,
    config_path: PathBuf,
    output: OutputStore,
}

impl SchematicValidator {
    pub fn new(program: impl Into<PathBuf>, config_path: impl Into<PathBuf>, output: OutputStore) -> Self {
        Self {
            program: program.into(),
            config_path: config_path.into(),
            output,
        }
    }

    fn command(&self, record_type: &str, manifest_path: &Path) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("model")
            .arg("-c")
            .arg(&self.config_path)
            .arg("validate")
            .arg("-dt")
            .arg(record_type)
            .arg("-mp")
            .arg(manifest_path)
            .stdin(Stdio::null());
        command
    }
}

async fn log_sink(path: &Path) -> std::io::Result<Stdio> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let file = fs::File::create(path).await?;
    Ok(Stdio::from(file.into_std().await))
}

#[async_trait]
impl Validator for SchematicValidator {
    async fn run(
        &self,
        record_type: &str,
        manifest_path: &Path,
    ) -> Result<ValidationOutcome, CatalogError> {
        let stdout_log_path = self.output.stdout_log_path(record_type);
        let stderr_log_path = self.output.stderr_log_path(record_type);
        let spawn_error = |source| CatalogError::ValidatorSpawn {
            record_type: record_type.to_string(),
            source,
        };

        let stdout = log_sink(&stdout_log_path).await.map_err(spawn_error)?;
        let stderr = log_sink(&stderr_log_path).await.map_err(spawn_error)?;

        debug!(manifest = %manifest_path.display(), "starting validator");
        let status = self
            .command(record_type, manifest_path)
            .stdout(stdout)
            .stderr(stderr)
            .status()
            .await
            .map_err(spawn_error)?;

        if !status.success() {
            let stderr = fs::read_to_string(&stderr_log_path).await.unwrap_or_default();
            return Err(CatalogError::ValidationEngineFailure {
                record_type: record_type.to_string(),
                exit_code: status.code(),
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(ValidationOutcome {
            stdout_log_path,
            stderr_log_path,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLog {
    pub messages: Vec<String>,
    /// False when no line contained the delimiter and the whole log became one message.
    pub delimiter_found: bool,
}

/// Split raw validator output into one message per fragment.
pub fn split_log_messages(raw: &str) -> ParsedLog {
    if !raw.contains(LOG_MESSAGE_DELIMITER) {
        let whole = raw.trim();
        return ParsedLog {
            messages: if whole.is_empty() { Vec::new() } else { vec![whole.to_string()] },
            delimiter_found: false,
        };
    }

    let messages = raw
        .lines()
        .flat_map(|line| line.split(LOG_MESSAGE_DELIMITER))
        .map(str::trim)
        .filter(|fragment| !fragment.is_empty())
        .map(ToString::to_string)
        .collect();
    ParsedLog {
        messages,
        delimiter_found: true,
    }
}

/// Convert the validator's stdout log into a one-message-per-line file.
pub async fn parse_log(stdout_log_path: &Path, structured_log_path: &Path) -> anyhow::Result<ParsedLog> {
    let raw = fs::read_to_string(stdout_log_path)
        .await
        .with_context(|| format!("reading validation log {}", stdout_log_path.display()))?;
    let parsed = split_log_messages(&raw);
    if !parsed.delimiter_found {
        let err = CatalogError::MalformedLogFormat {
            path: stdout_log_path.to_path_buf(),
        };
        warn!(error = %err, "treating the validation log as a single message");
    }

    let mut body = parsed.messages.join("\n");
    if !body.is_empty() {
        body.push('\n');
    }
    write_atomic(structured_log_path, body.as_bytes()).await?;
    debug!(messages = parsed.messages.len(), "validation log parsed");
    Ok(parsed)
}
