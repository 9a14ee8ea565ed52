#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use mdc_storage::sha256_hex;
use mdc_sync::{ChainStage, PipelineConfig, QcPipeline, VocabularyUpdate};

const PUBLICATIONS_CSV: &str = "\
Component,Pubmed Id,Publication Grant Number,Publication Title,Internal Notes,entityId
PublicationView,12345,CA1,Tumour atlas,dup,syn1
PublicationView,12345,CA2,Tumour atlas,dup,syn2
PublicationView,999,CA3,Other paper,,syn3
";

const TOOLS_CSV: &str = "\
Component,Tool Name,Tool Language,entityId
ToolView,hammer,python,syn20
";

const DATASETS_CSV: &str = "\
Component,Dataset Alias,Dataset Assay,Dataset Species,entityId
DatasetView,ds1,\"RNAseq, Flow Cytometry\",human,syn10
DatasetView,ds2,RNA-seq,mouse,syn10
";

const REFERENCE_CSV: &str = "\
category,valid_value,nonpreferred_values
assay,RNA-seq,\"RNAseq,RNA Seq\"
assay,Flow Cytometry,
species,Homo sapiens,human
programmingLanguage,Python,\"python, py\"
";

/// Stand-in for the validator CLI: `$6` is the record type.
const FAKE_VALIDATOR: &str = r#"#!/bin/sh
case "$6" in
  ToolView) echo "tool manifest rejected" >&2; exit 1 ;;
esac
echo "[['row 2', 'missing title'], ['row 3', 'bad grant']]"
"#;

fn write(path: &Path, contents: &str) {
    std::fs::write(path, contents).unwrap();
}

fn workspace(dir: &Path) -> PipelineConfig {
    let tables = dir.join("tables");
    std::fs::create_dir_all(&tables).unwrap();
    write(&tables.join("syn100.csv"), PUBLICATIONS_CSV);
    write(&tables.join("syn200.csv"), TOOLS_CSV);
    write(&tables.join("syn20.csv"), TOOLS_CSV);
    write(
        &tables.join("syn20.schema.yaml"),
        "Component: STRING\nTool Name: STRING\nTool Language: STRING_LIST\nentityId: STRING\n",
    );
    write(&tables.join("syn10.csv"), DATASETS_CSV);
    write(
        &tables.join("syn10.schema.yaml"),
        "Component: STRING\nDataset Alias: STRING\nDataset Assay: STRING_LIST\nDataset Species: STRING\nentityId: STRING\n",
    );
    write(
        &tables.join("union.csv"),
        "Component,entityId\nDatasetView,syn10\nDatasetView,syn10\nToolView,syn20\n",
    );

    let reference = dir.join("all_valid_values.csv");
    write(&reference, REFERENCE_CSV);

    let validator = dir.join("fake-schematic.sh");
    write(&validator, FAKE_VALIDATOR);
    std::fs::set_permissions(&validator, std::fs::Permissions::from_mode(0o755)).unwrap();

    PipelineConfig {
        output_dir: dir.join("output"),
        store_root: tables,
        validator_program: validator,
        validator_config: Some(dir.join("config.yml")),
        merge: true,
        max_parallel: 2,
        http_timeout_secs: 5,
        user_agent: "mdc-test".into(),
        vocabulary_source: reference.display().to_string(),
        strict_vocabulary: false,
    }
}

fn read(path: PathBuf) -> String {
    std::fs::read_to_string(&path).unwrap_or_else(|err| panic!("reading {}: {err}", path.display()))
}

#[tokio::test]
async fn qc_run_merges_validates_and_reports() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = workspace(dir.path());
    let pipeline = QcPipeline::from_config(config).unwrap();

    let summary = pipeline
        .run_once(&["syn100".to_string(), "syn200".to_string()])
        .await
        .unwrap();
    let output = pipeline.output();

    assert_eq!(summary.results.len(), 1);
    assert_eq!(summary.results[0].record_type_name, "PublicationView");
    assert_eq!(
        summary.results[0].source_table_path,
        output.merged_table_path("PublicationView")
    );

    let merged = read(output.merged_table_path("PublicationView"));
    let mut lines = merged.lines();
    assert_eq!(
        lines.next(),
        Some("Component,Pubmed Id,Publication Grant Number,Publication Title,entityId")
    );
    assert_eq!(
        lines.next(),
        Some("PublicationView,12345,\"CA1,CA2\",Tumour atlas,\"syn1,syn2\"")
    );
    assert_eq!(lines.next(), Some("PublicationView,999,CA3,Other paper,syn3"));
    assert_eq!(lines.next(), None);

    assert_eq!(
        read(output.structured_log_path("PublicationView")),
        "[['row 2', 'missing title'\n['row 3', 'bad grant']]\n"
    );

    let failure = summary.first_failure().unwrap();
    assert_eq!(failure.record_type, "ToolView");
    assert_eq!(failure.stage, ChainStage::Validate);
    assert!(failure.message.contains("tool manifest rejected"));
    assert!(output.raw_table_path("ToolView").exists());
    assert!(!output.structured_log_path("ToolView").exists());

    let brief = read(summary.reports_dir.join("brief.md"));
    assert!(brief.contains("`ToolView` (syn200) failed at validate"));
    let json: serde_json::Value =
        serde_json::from_str(&read(summary.reports_dir.join("summary.json"))).unwrap();
    assert_eq!(json["failures"][0]["stage"], "validate");
}

#[tokio::test]
async fn dry_run_update_writes_files_and_leaves_store_untouched() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = workspace(dir.path());
    let update = VocabularyUpdate::from_config(&config).await.unwrap();

    let summary = update.run("union", true).await.unwrap();
    let ids: Vec<_> = summary.tables.iter().map(|t| t.table_id.as_str()).collect();
    assert_eq!(ids, ["syn10", "syn20"]);
    assert_eq!(summary.tables[0].substitutions, 2);

    let updated = read(config.output_dir.join("syn10-updated.csv"));
    assert!(updated.contains("DatasetView,ds1,\"RNA-seq, Flow Cytometry\",Homo sapiens,syn10"));
    assert!(updated.contains("DatasetView,ds2,RNA-seq,mouse,syn10"));
    assert!(read(config.output_dir.join("syn20-updated.csv")).contains("ToolView,hammer,Python,syn20"));

    assert_eq!(read(config.store_root.join("syn10.csv")), DATASETS_CSV);
    assert!(summary.tables.iter().all(|t| t.new_version_tag.is_none()));
}

#[tokio::test]
async fn update_stores_new_versions() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = workspace(dir.path());
    let update = VocabularyUpdate::from_config(&config).await.unwrap();

    let summary = update.run("union", false).await.unwrap();
    let stored = std::fs::read(config.store_root.join("syn20.csv")).unwrap();
    assert_eq!(
        summary.tables[1].new_version_tag.as_deref(),
        Some(sha256_hex(&stored).as_str())
    );
    assert!(String::from_utf8(stored).unwrap().contains("hammer,Python"));
    assert!(!config.output_dir.join("syn20-updated.csv").exists());
}
