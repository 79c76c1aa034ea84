//! In-process fakes for the fetch and compiler backends (testing only).
//!
//! `FakeRepoSync` writes canned files into cache directories instead of
//! running git; `FakeCompiler` writes one output file per input instead of
//! running protoc. Both record their calls.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::compile::{CompilerBackend, ProcessOutput};
use crate::digest::ContentHash;
use crate::error::{FetchError, PipelineError, PipelineResult};
use crate::fetch::RepoSync;
use crate::model::{RepoSpec, Revision};

// ---------------------------------------------------------------------------
// FakeRepoSync
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct FakeRepoSync {
    files: Mutex<HashMap<String, Vec<(PathBuf, String)>>>,
    failing: HashSet<String>,
    delay: Option<Duration>,
    calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeRepoSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `contents` at `rel` inside `repo`'s cache.
    pub fn with_file(self, repo: &str, rel: &str, contents: &str) -> Self {
        self.set_file(repo, rel, contents);
        self
    }

    /// Change upstream content after construction, e.g. between runs.
    pub fn set_file(&self, repo: &str, rel: &str, contents: &str) {
        let mut files = self.files.lock().unwrap();
        let entries = files.entry(repo.to_string()).or_default();
        entries.retain(|(path, _)| path != Path::new(rel));
        entries.push((PathBuf::from(rel), contents.to_string()));
    }

    pub fn failing(mut self, repo: &str) -> Self {
        self.failing.insert(repo.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Repo names in the order their sync started.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Highest number of syncs observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn write_files(&self, spec: &RepoSpec) -> Result<String, FetchError> {
        let files = self.files.lock().unwrap();
        let entries = files.get(&spec.name).cloned().unwrap_or_default();
        let mut fingerprint = spec.name.clone();
        for (rel, contents) in &entries {
            let path = spec.cache_path.join(rel);
            let written = path
                .parent()
                .map_or(Ok(()), std::fs::create_dir_all)
                .and_then(|_| std::fs::write(&path, contents));
            written.map_err(|e| FetchError::CommandFailed {
                repo: spec.name.clone(),
                command: "fake write".to_string(),
                stderr: e.to_string(),
            })?;
            fingerprint.push_str(contents);
        }
        Ok(ContentHash::compute(fingerprint.as_bytes()).to_hex()[..40].to_string())
    }
}

#[async_trait]
impl RepoSync for FakeRepoSync {
    async fn sync_repo(&self, spec: &RepoSpec) -> Result<String, FetchError> {
        self.calls.lock().unwrap().push(spec.name.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        match self.delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }

        if self.failing.contains(&spec.name) {
            return Err(FetchError::CommandFailed {
                repo: spec.name.clone(),
                command: "git fetch".to_string(),
                stderr: "fatal: could not read from remote repository".to_string(),
            });
        }

        let commit = self.write_files(spec)?;
        Ok(match &spec.revision {
            Revision::Pinned(rev) => rev.clone(),
            Revision::Latest => commit,
        })
    }
}

// ---------------------------------------------------------------------------
// FakeCompiler
// ---------------------------------------------------------------------------

/// Writes `<out>/<stem>_<lang>.gen` for every `.proto` input.
#[derive(Debug, Default)]
pub struct FakeCompiler {
    failure: Option<(i32, String)>,
    delay: Option<Duration>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl FakeCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exit with `code` and `stderr` instead of generating anything.
    pub fn failing(mut self, code: i32, stderr: &str) -> Self {
        self.failure = Some((code, stderr.to_string()));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Argument lists of every invocation.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompilerBackend for FakeCompiler {
    async fn execute(&self, args: &[String]) -> PipelineResult<ProcessOutput> {
        self.calls.lock().unwrap().push(args.to_vec());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some((code, stderr)) = &self.failure {
            return Ok(ProcessOutput {
                exit_code: Some(*code),
                stdout: String::new(),
                stderr: stderr.clone(),
            });
        }

        let out = args.iter().find_map(|arg| {
            let flag = arg.strip_prefix("--")?;
            let (name, dir) = flag.split_once("_out=")?;
            Some((name.to_string(), PathBuf::from(dir)))
        });
        let Some((lang, out_dir)) = out else {
            return Ok(ProcessOutput {
                exit_code: Some(1),
                stdout: String::new(),
                stderr: "Missing output directives.".to_string(),
            });
        };

        for input in args.iter().filter(|a| a.ends_with(".proto")) {
            let stem = Path::new(input)
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let target = out_dir.join(format!("{stem}_{lang}.gen"));
            std::fs::write(&target, format!("// generated from {input}\n"))
                .map_err(|e| PipelineError::io(&target, e))?;
        }
        Ok(ProcessOutput {
            exit_code: Some(0),
            ..Default::default()
        })
    }
}
