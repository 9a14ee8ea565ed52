use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use mdc_sync::{summarize_results, PipelineConfig, QcPipeline, VocabularyUpdate};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mdc-cli")]
#[command(about = "Metadata catalog QC and vocabulary maintenance")]
struct Cli {
    /// Output directory (defaults to MDC_OUTPUT_DIR or ./output).
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,
    /// Table store directory (defaults to MDC_STORE_ROOT or ./tables).
    #[arg(long, global = true)]
    store_root: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch tables, optionally merge rows, then validate each record type.
    Qc {
        /// Table ids to check, one per record type.
        #[arg(short = 'l', required = true, num_args = 1..)]
        tables: Vec<String>,
        /// Validator config file.
        #[arg(short = 'c')]
        config: PathBuf,
        /// Merge rows sharing the record type's grouping key before validation.
        #[arg(short = 'm')]
        merge: bool,
        /// Record types validated at once.
        #[arg(long)]
        parallel: Option<usize>,
        /// Validator executable (defaults to MDC_VALIDATOR_BIN or `schematic`).
        #[arg(long)]
        validator: Option<PathBuf>,
    },
    /// Replace nonpreferred terms in every table listed by a union table.
    UpdateTerms {
        /// Union table whose `entityId` column lists the tables to update.
        #[arg(short = 'u')]
        union: String,
        /// Vocabulary reference CSV, path or URL.
        #[arg(long = "cv-list")]
        cv_list: Option<String>,
        /// Write `<id>-updated.csv` files instead of storing.
        #[arg(long)]
        dryrun: bool,
        /// Fail when a nonpreferred term maps to two canonical terms.
        #[arg(long)]
        strict_vocabulary: bool,
    },
    /// Summarize recent QC runs from their reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let mut config = PipelineConfig::from_env();
    if let Some(output_dir) = cli.output_dir {
        config.output_dir = output_dir;
    }
    if let Some(store_root) = cli.store_root {
        config.store_root = store_root;
    }

    match cli.command {
        Commands::Qc {
            tables,
            config: validator_config,
            merge,
            parallel,
            validator,
        } => {
            config.validator_config = Some(validator_config);
            config.merge = merge;
            if let Some(parallel) = parallel {
                config.max_parallel = parallel;
            }
            if let Some(validator) = validator {
                config.validator_program = validator;
            }

            let pipeline = QcPipeline::from_config(config)?;
            let summary = pipeline.run_once(&tables).await?;
            for (record_type, status) in summarize_results(&summary) {
                println!("{record_type}: {status}");
            }
            println!(
                "qc complete: run_id={} validated={} failed={} reports={}",
                summary.run_id,
                summary.results.len(),
                summary.failures.len(),
                summary.reports_dir.display()
            );
            if let Some(failure) = summary.first_failure() {
                bail!(
                    "{} ({}) failed at {}: {}",
                    failure.record_type,
                    failure.table_id,
                    failure.stage,
                    failure.message
                );
            }
        }
        Commands::UpdateTerms {
            union,
            cv_list,
            dryrun,
            strict_vocabulary,
        } => {
            if let Some(source) = cv_list {
                config.vocabulary_source = source;
            }
            config.strict_vocabulary = strict_vocabulary;

            let update = VocabularyUpdate::from_config(&config).await?;
            let summary = update.run(&union, dryrun).await?;
            for table in &summary.tables {
                match (&table.written_to, &table.new_version_tag) {
                    (Some(path), _) => println!(
                        "{}: {} substitutions, written to {}",
                        table.table_id,
                        table.substitutions,
                        path.display()
                    ),
                    (None, Some(tag)) => println!(
                        "{}: {} substitutions, stored as version {tag}",
                        table.table_id, table.substitutions
                    ),
                    (None, None) => println!("{}: {} substitutions", table.table_id, table.substitutions),
                }
            }
            info!(
                tables = summary.tables.len(),
                conflicts = summary.vocabulary_conflicts,
                dry_run = summary.dry_run,
                "vocabulary update complete"
            );
        }
        Commands::Report { runs } => {
            print!("{}", mdc_sync::report_recent_runs_markdown(runs, &config.output_dir)?);
        }
    }

    Ok(())
}
