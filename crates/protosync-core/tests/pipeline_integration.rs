//! End-to-end runs of the pipeline with in-process fetch and compiler fakes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use protosync_core::fakes::{FakeCompiler, FakeRepoSync};
use protosync_core::{
    ConfigOverrides, Pipeline, PipelineError, ProtosyncConfig, RunState, STAGING_MARKER,
};

const DOC_V1: &str = "syntax = \"proto3\";\n\npackage google.x.v1;\n\nmessage Document {\n  string name = 1;\n}\n";

const CONFIG: &str = r#"
output_dir = "generated"
target_languages = ["python"]

[[repos]]
name = "googleapis"
remote = "https://example.com/googleapis.git"

[[sources]]
repo = "googleapis"
include = ["google/x/v1/*.proto"]
strip_prefix = "google/x/v1"
dest_prefix = "google/y/proto"

[[rules]]
match = "google.x.v1"
replace = "google.y.proto"
applies_to = "*.proto"
"#;

fn load(base: &Path, text: &str) -> ProtosyncConfig {
    ProtosyncConfig::from_toml_str(text, base, &ConfigOverrides::default()).unwrap()
}

fn upstream() -> Arc<FakeRepoSync> {
    Arc::new(FakeRepoSync::new().with_file("googleapis", "google/x/v1/document.proto", DOC_V1))
}

#[tokio::test]
async fn package_rename_changes_only_the_package_line() {
    let dir = tempfile::tempdir().unwrap();
    let config = load(dir.path(), CONFIG);
    let pipeline =
        Pipeline::with_backends(config, upstream(), Arc::new(FakeCompiler::new())).unwrap();

    let report = pipeline.run().await.unwrap();

    assert_eq!(report.state, RunState::Done);
    assert_eq!(report.staged.len(), 1);
    let staged = &report.staged[0];
    assert_eq!(
        staged.relative_destination,
        PathBuf::from("google/y/proto/document.proto")
    );
    assert_eq!(staged.applied_rules, vec![0]);

    let text = std::fs::read_to_string(&staged.destination).unwrap();
    assert_eq!(text, DOC_V1.replace("package google.x.v1;", "package google.y.proto;"));
    assert_eq!(staged.content_hash.to_hex().len(), 64);
}

#[tokio::test]
async fn repeated_runs_stage_identical_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let config = load(dir.path(), CONFIG);
    let pipeline =
        Pipeline::with_backends(config, upstream(), Arc::new(FakeCompiler::new())).unwrap();

    let first = pipeline.run().await.unwrap();
    let first_bytes = std::fs::read(&first.staged[0].destination).unwrap();
    let second = pipeline.run().await.unwrap();
    let second_bytes = std::fs::read(&second.staged[0].destination).unwrap();

    assert_ne!(first.run_id, second.run_id);
    assert_eq!(first.staging_digest, second.staging_digest);
    assert_eq!(first_bytes, second_bytes);
    assert!(pipeline.config().staging_dir.join(STAGING_MARKER).exists());
}

#[tokio::test]
async fn upstream_drift_fails_with_rewrite_not_applied() {
    let dir = tempfile::tempdir().unwrap();
    let sync = upstream();
    let compiler = Arc::new(FakeCompiler::new());
    let pipeline =
        Pipeline::with_backends(load(dir.path(), CONFIG), sync.clone(), compiler.clone()).unwrap();
    pipeline.run().await.unwrap();

    // Upstream renames the package; the rule no longer matches.
    sync.set_file(
        "googleapis",
        "google/x/v1/document.proto",
        &DOC_V1.replace("google.x.v1", "google.x.v2"),
    );
    let err = pipeline.run().await.unwrap_err();

    match &err {
        PipelineError::RewriteNotApplied {
            rule_index,
            pattern,
            repo,
            path,
        } => {
            assert_eq!(*rule_index, 0);
            assert_eq!(pattern, "google.x.v1");
            assert_eq!(repo, "googleapis");
            assert_eq!(path, &PathBuf::from("google/x/v1/document.proto"));
        }
        other => panic!("expected RewriteNotApplied, got {other:?}"),
    }
    assert_eq!(err.exit_code(), 5);
    assert_eq!(compiler.calls().len(), 1, "compiler must not run after drift");
}

#[tokio::test]
async fn stale_output_file_survives_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let config = load(dir.path(), CONFIG);
    std::fs::create_dir_all(&config.output_dir).unwrap();
    let stale = config.output_dir.join("removed_upstream_pb2.py");
    std::fs::write(&stale, "# from an older run\n").unwrap();
    let pipeline =
        Pipeline::with_backends(config, upstream(), Arc::new(FakeCompiler::new())).unwrap();

    let report = pipeline.run().await.unwrap();

    assert!(stale.exists());
    let generated = &report.compiled[0].generated_files;
    assert_eq!(generated.len(), 1);
    assert!(!generated.contains(&stale));
}

#[tokio::test]
async fn missing_literal_source_stops_before_compiling() {
    let dir = tempfile::tempdir().unwrap();
    let text = CONFIG.replace(
        "include = [\"google/x/v1/*.proto\"]",
        "include = [\"google/x/v1/document.proto\", \"google/x/v1/query.proto\"]",
    );
    let compiler = Arc::new(FakeCompiler::new());
    let pipeline =
        Pipeline::with_backends(load(dir.path(), &text), upstream(), compiler.clone()).unwrap();

    let err = pipeline.run().await.unwrap_err();

    assert!(matches!(
        err,
        PipelineError::MissingSource { ref repo, ref path }
            if repo.as_deref() == Some("googleapis") && path.ends_with("query.proto")
    ));
    assert_eq!(err.exit_code(), 4);
    assert!(compiler.calls().is_empty());
}

#[tokio::test]
async fn compiler_diagnostics_are_reported_verbatim() {
    let dir = tempfile::tempdir().unwrap();
    let diagnostics = "google/y/proto/document.proto:5:9: \"Document\" is already defined.";
    let pipeline = Pipeline::with_backends(
        load(dir.path(), CONFIG),
        upstream(),
        Arc::new(FakeCompiler::new().failing(1, diagnostics)),
    )
    .unwrap();

    let err = pipeline.run().await.unwrap_err();

    assert!(err.to_string().contains(diagnostics));
    assert_eq!(err.exit_code(), 6);
}

#[tokio::test(start_paused = true)]
async fn slow_compiler_hits_the_compile_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let text = format!("{CONFIG}\n[timeouts]\ncompile_secs = 1\n");
    let pipeline = Pipeline::with_backends(
        load(dir.path(), &text),
        upstream(),
        Arc::new(FakeCompiler::new().with_delay(Duration::from_secs(60))),
    )
    .unwrap();

    let err = pipeline.run().await.unwrap_err();

    assert!(matches!(
        err,
        PipelineError::Timeout {
            operation: "compile",
            ..
        }
    ));
    assert_eq!(err.exit_code(), 7);
}

const TWO_REPOS: &str = r#"
output_dir = "generated"
target_languages = ["python"]
max_concurrent_fetches = 2

[[repos]]
name = "googleapis"
remote = "https://example.com/googleapis.git"

[[repos]]
name = "conformance"
remote = "https://example.com/conformance.git"
revision = "v1.4.0"

[[sources]]
repo = "googleapis"
include = ["google/x/v1/*.proto"]

[[sources]]
repo = "conformance"
include = ["tests/*.proto"]
"#;

#[tokio::test]
async fn best_effort_reports_every_failed_repo() {
    let dir = tempfile::tempdir().unwrap();
    let text = TWO_REPOS.replace(
        "max_concurrent_fetches = 2",
        "max_concurrent_fetches = 2\nfetch_policy = \"best_effort\"",
    );
    let sync = Arc::new(FakeRepoSync::new().failing("googleapis").failing("conformance"));
    let pipeline =
        Pipeline::with_backends(load(dir.path(), &text), sync.clone(), Arc::new(FakeCompiler::new()))
            .unwrap();

    let err = pipeline.run().await.unwrap_err();

    match &err {
        PipelineError::FetchBatch(errors) => {
            let repos: Vec<&str> = errors.iter().map(|e| e.repo()).collect();
            assert_eq!(repos, vec!["googleapis", "conformance"]);
        }
        other => panic!("expected FetchBatch, got {other:?}"),
    }
    assert_eq!(err.exit_code(), 3);
    assert_eq!(sync.calls().len(), 2);
}

#[tokio::test]
async fn require_pinned_rejects_latest_before_fetching() {
    let dir = tempfile::tempdir().unwrap();
    let overrides = ConfigOverrides {
        require_pinned: true,
        ..Default::default()
    };
    let config = ProtosyncConfig::from_toml_str(TWO_REPOS, dir.path(), &overrides).unwrap();
    let sync = Arc::new(FakeRepoSync::new());
    let pipeline =
        Pipeline::with_backends(config, sync.clone(), Arc::new(FakeCompiler::new())).unwrap();

    let err = pipeline.run().await.unwrap_err();

    assert!(err.to_string().contains("googleapis"));
    assert_eq!(err.exit_code(), 3);
    assert!(sync.calls().is_empty());
}

#[tokio::test]
async fn concurrent_fetches_respect_the_limit() {
    let dir = tempfile::tempdir().unwrap();
    let sync = Arc::new(
        FakeRepoSync::new()
            .with_file("googleapis", "google/x/v1/document.proto", DOC_V1)
            .with_file("conformance", "tests/query.proto", "syntax = \"proto3\";\n")
            .with_delay(Duration::from_millis(50)),
    );
    let pipeline = Pipeline::with_backends(
        load(dir.path(), TWO_REPOS),
        sync.clone(),
        Arc::new(FakeCompiler::new()),
    )
    .unwrap();

    let report = pipeline.run().await.unwrap();

    assert_eq!(sync.max_in_flight(), 2);
    assert_eq!(report.repos[0].name, "googleapis");
    assert_eq!(report.repos[1].name, "conformance");
    assert_eq!(report.repos[1].revision, "v1.4.0");
    assert_eq!(report.staged.len(), 2);
}

#[tokio::test]
async fn report_serializes_to_json() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = Pipeline::with_backends(
        load(dir.path(), CONFIG),
        upstream(),
        Arc::new(FakeCompiler::new()),
    )
    .unwrap();

    let report = pipeline.run().await.unwrap();
    let json: serde_json::Value = serde_json::to_value(&report).unwrap();

    assert_eq!(json["state"], "done");
    assert_eq!(json["repos"][0]["requested"], "latest");
    assert_eq!(json["compiled"][0]["language"], "python");
    assert_eq!(
        json["staged"][0]["content_hash"],
        report.staged[0].content_hash.to_hex()
    );
}
