//! Runs against real `git` using throwaway local repositories as remotes.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use protosync_core::{
    ConfigOverrides, FetchOptions, Fetcher, GitRepoSync, Pipeline, ProtosyncConfig, RepoSpec,
    Revision,
};
use sha2::{Digest, Sha256};

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn make_upstream(files: &[(&str, &str)]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    git(dir.path(), &["init"]);
    git(dir.path(), &["config", "user.name", "test-user"]);
    git(dir.path(), &["config", "user.email", "test@example.com"]);
    for (rel, contents) in files {
        let path = dir.path().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }
    git(dir.path(), &["add", "."]);
    git(dir.path(), &["commit", "-m", "initial"]);
    dir
}

/// SHA-256 over every file outside `.git`, by relative path.
fn tree_checksum(root: &Path) -> String {
    fn walk(dir: &Path, out: &mut Vec<PathBuf>) {
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.file_name().is_some_and(|n| n == ".git") {
                continue;
            }
            if path.is_dir() {
                walk(&path, out);
            } else {
                out.push(path);
            }
        }
    }
    let mut files = Vec::new();
    walk(root, &mut files);
    files.sort();

    let mut hasher = Sha256::new();
    for file in files {
        hasher.update(file.strip_prefix(root).unwrap().to_string_lossy().as_bytes());
        hasher.update(std::fs::read(&file).unwrap());
    }
    hex::encode(hasher.finalize())
}

#[tokio::test]
async fn concurrent_clones_populate_independent_caches() {
    let googleapis = make_upstream(&[
        ("google/x/v1/document.proto", "syntax = \"proto3\";\npackage google.x.v1;\n"),
        ("google/x/v1/query.proto", "syntax = \"proto3\";\npackage google.x.v1;\n"),
    ]);
    let conformance = make_upstream(&[("tests/query-test.proto", "syntax = \"proto3\";\n")]);
    let caches = tempfile::tempdir().unwrap();

    let specs = vec![
        RepoSpec {
            name: "googleapis".to_string(),
            remote: googleapis.path().display().to_string(),
            cache_path: caches.path().join("googleapis"),
            revision: Revision::Latest,
        },
        RepoSpec {
            name: "conformance".to_string(),
            remote: conformance.path().display().to_string(),
            cache_path: caches.path().join("conformance"),
            revision: Revision::Latest,
        },
    ];
    let fetcher = Fetcher::new(
        Arc::new(GitRepoSync::new()),
        FetchOptions {
            max_concurrent: 2,
            ..Default::default()
        },
    );

    let resolved = fetcher.sync(&specs).await.unwrap();

    assert_eq!(resolved[0].revision, git(googleapis.path(), &["rev-parse", "HEAD"]));
    assert_eq!(resolved[1].revision, git(conformance.path(), &["rev-parse", "HEAD"]));
    assert_eq!(
        tree_checksum(&caches.path().join("googleapis")),
        tree_checksum(googleapis.path())
    );
    assert_eq!(
        tree_checksum(&caches.path().join("conformance")),
        tree_checksum(conformance.path())
    );
}

#[tokio::test]
async fn full_run_with_git_and_compiler_process() {
    let upstream = make_upstream(&[(
        "google/x/v1/document.proto",
        "syntax = \"proto3\";\n\npackage google.x.v1;\n\nmessage Document {}\n",
    )]);
    git(upstream.path(), &["tag", "v1.0.0"]);
    let work = tempfile::tempdir().unwrap();

    let text = format!(
        r#"
output_dir = "generated"
target_languages = ["python"]

[compiler]
command = ["sh", "-c", "for a in \"$@\"; do case \"$a\" in --python_out=*) touch \"${{a#--python_out=}}/document_pb2.py\";; esac; done", "protoc"]

[[repos]]
name = "upstream"
remote = "{remote}"
revision = "v1.0.0"

[[sources]]
repo = "upstream"
include = ["google/**/*.proto"]

[[rules]]
match = "package google.x.v1;"
replace = "package google.y.proto;"
"#,
        remote = upstream.path().display()
    );
    let config =
        ProtosyncConfig::from_toml_str(&text, work.path(), &ConfigOverrides::default()).unwrap();

    let report = Pipeline::from_config(config.clone(), false)
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(report.repos[0].revision, git(upstream.path(), &["rev-parse", "v1.0.0"]));
    let staged = std::fs::read_to_string(&report.staged[0].destination).unwrap();
    assert!(staged.contains("package google.y.proto;"));
    assert_eq!(
        report.compiled[0].generated_files,
        vec![config.output_dir.join("document_pb2.py")]
    );

    // A second run offline reuses the cache and stages the same bytes.
    let offline = Pipeline::from_config(config, true)
        .unwrap()
        .run()
        .await
        .unwrap();
    assert_eq!(offline.staging_digest, report.staging_digest);
    assert_eq!(offline.repos[0].revision, report.repos[0].revision);
}
