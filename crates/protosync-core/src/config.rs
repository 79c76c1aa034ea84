//! Run configuration: a TOML file plus command-line overrides, resolved once
//! into an immutable [`ProtosyncConfig`].

use std::collections::HashSet;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};
use crate::model::{RepoSpec, Revision, RewriteRule, SourceSet, TargetLanguage};

pub const DEFAULT_CONFIG_FILE: &str = "protosync.toml";

/// What to do when one repository fails to fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchPolicy {
    /// Abort outstanding fetches on the first failure.
    #[default]
    FailFast,
    /// Attempt every repository, then report all failures.
    BestEffort,
}

impl FromStr for FetchPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.replace('-', "_").as_str() {
            "fail_fast" => Ok(FetchPolicy::FailFast),
            "best_effort" => Ok(FetchPolicy::BestEffort),
            other => Err(format!("unknown fetch policy: {other}")),
        }
    }
}

impl fmt::Display for FetchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchPolicy::FailFast => f.write_str("fail_fast"),
            FetchPolicy::BestEffort => f.write_str("best_effort"),
        }
    }
}

/// Whether "latest" revisions are acceptable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevisionPolicy {
    #[default]
    AllowLatest,
    RequirePinned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub fetch_secs: u64,
    pub compile_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            fetch_secs: 300,
            compile_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerSettings {
    /// Program and leading arguments, e.g. `["python", "-m", "grpc_tools.protoc"]`.
    pub command: Vec<String>,
    /// Extra include paths searched after the staging root.
    pub include_paths: Vec<PathBuf>,
    /// Passed to the compiler before the input files.
    pub extra_args: Vec<String>,
}

impl Default for CompilerSettings {
    fn default() -> Self {
        Self {
            command: vec!["protoc".to_string()],
            include_paths: Vec::new(),
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RepoEntry {
    name: String,
    remote: String,
    #[serde(default)]
    revision: Revision,
    #[serde(default)]
    cache_dir: Option<PathBuf>,
}

/// On-disk shape of `protosync.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default = "default_repo_root")]
    repo_root: PathBuf,
    #[serde(default = "default_staging_dir")]
    staging_dir: PathBuf,
    output_dir: PathBuf,
    #[serde(default)]
    target_languages: Vec<TargetLanguage>,
    #[serde(default)]
    fetch_policy: FetchPolicy,
    #[serde(default)]
    revision_policy: RevisionPolicy,
    #[serde(default = "default_max_concurrent_fetches")]
    max_concurrent_fetches: usize,
    #[serde(default = "default_allowed_syntaxes")]
    allowed_syntaxes: Vec<String>,
    #[serde(default)]
    timeouts: Timeouts,
    #[serde(default)]
    compiler: CompilerSettings,
    #[serde(default)]
    repos: Vec<RepoEntry>,
    #[serde(default)]
    sources: Vec<SourceSet>,
    #[serde(default)]
    rules: Vec<RewriteRule>,
}

fn default_repo_root() -> PathBuf {
    PathBuf::from(".protosync/repos")
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from(".protosync/staging")
}

fn default_max_concurrent_fetches() -> usize {
    3
}

fn default_allowed_syntaxes() -> Vec<String> {
    vec!["proto2".to_string(), "proto3".to_string()]
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub repo_root: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub staging_dir: Option<PathBuf>,
    pub target_languages: Vec<TargetLanguage>,
    pub fetch_policy: Option<FetchPolicy>,
    pub require_pinned: bool,
}

/// Fully resolved configuration. Paths are absolute or relative to the
/// process working directory; nothing here changes during a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProtosyncConfig {
    pub repo_root: PathBuf,
    pub staging_dir: PathBuf,
    pub output_dir: PathBuf,
    pub target_languages: Vec<TargetLanguage>,
    pub fetch_policy: FetchPolicy,
    pub revision_policy: RevisionPolicy,
    pub max_concurrent_fetches: usize,
    pub allowed_syntaxes: Vec<String>,
    pub timeouts: Timeouts,
    pub compiler: CompilerSettings,
    pub repos: Vec<RepoSpec>,
    pub sources: Vec<SourceSet>,
    pub rules: Vec<RewriteRule>,
}

impl ProtosyncConfig {
    /// Read, resolve and validate a config file.
    pub fn load(path: &Path, overrides: &ConfigOverrides) -> PipelineResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PipelineError::Config(format!("config file {} not found", path.display()))
            } else {
                PipelineError::io(path, e)
            }
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new(""));
        Self::from_toml_str(&text, base, overrides)
    }

    /// Parse TOML text; relative paths in the file resolve against `base`.
    pub fn from_toml_str(
        text: &str,
        base: &Path,
        overrides: &ConfigOverrides,
    ) -> PipelineResult<Self> {
        let file: ConfigFile =
            toml::from_str(text).map_err(|e| PipelineError::Config(e.to_string()))?;

        let resolve = |p: &Path| -> PathBuf {
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                base.join(p)
            }
        };

        // Override paths come from the command line and stay relative to
        // the working directory.
        let repo_root = overrides
            .repo_root
            .clone()
            .unwrap_or_else(|| resolve(&file.repo_root));
        let staging_dir = overrides
            .staging_dir
            .clone()
            .unwrap_or_else(|| resolve(&file.staging_dir));
        let output_dir = overrides
            .output_dir
            .clone()
            .unwrap_or_else(|| resolve(&file.output_dir));

        let repos = file
            .repos
            .into_iter()
            .map(|entry| RepoSpec {
                cache_path: match &entry.cache_dir {
                    Some(dir) => resolve(dir),
                    None => repo_root.join(&entry.name),
                },
                name: entry.name,
                remote: entry.remote,
                revision: entry.revision,
            })
            .collect();

        let mut compiler = file.compiler;
        compiler.include_paths = compiler.include_paths.iter().map(|p| resolve(p)).collect();

        let target_languages = if overrides.target_languages.is_empty() {
            file.target_languages
        } else {
            overrides.target_languages.clone()
        };

        let revision_policy = if overrides.require_pinned {
            RevisionPolicy::RequirePinned
        } else {
            file.revision_policy
        };

        let config = Self {
            repo_root,
            staging_dir,
            output_dir,
            target_languages,
            fetch_policy: overrides.fetch_policy.unwrap_or(file.fetch_policy),
            revision_policy,
            max_concurrent_fetches: file.max_concurrent_fetches,
            allowed_syntaxes: file.allowed_syntaxes,
            timeouts: file.timeouts,
            compiler,
            repos,
            sources: file.sources,
            rules: file.rules,
        };
        config.validate()?;
        Ok(config)
    }

    /// Structural checks that need no filesystem or network access.
    pub fn validate(&self) -> PipelineResult<()> {
        if self.repos.is_empty() {
            return Err(PipelineError::Config("no repos configured".into()));
        }
        if self.target_languages.is_empty() {
            return Err(PipelineError::Config(
                "at least one target language is required".into(),
            ));
        }
        if self.max_concurrent_fetches == 0 {
            return Err(PipelineError::Config(
                "max_concurrent_fetches must be at least 1".into(),
            ));
        }
        if self.timeouts.fetch_secs == 0 || self.timeouts.compile_secs == 0 {
            return Err(PipelineError::Config("timeouts must be non-zero".into()));
        }
        if self.compiler.command.is_empty() {
            return Err(PipelineError::Config("compiler command is empty".into()));
        }
        // The staging root is cleared on every run, so nothing else may live
        // under it.
        let staging = lexical(&self.staging_dir);
        let output = lexical(&self.output_dir);
        if output.starts_with(&staging) || staging.starts_with(&output) {
            return Err(PipelineError::Config(format!(
                "staging_dir {:?} and output_dir {:?} must not overlap",
                self.staging_dir, self.output_dir
            )));
        }
        if lexical(&self.repo_root).starts_with(&staging) {
            return Err(PipelineError::Config(format!(
                "repo_root {:?} is inside staging_dir {:?}",
                self.repo_root, self.staging_dir
            )));
        }
        for include in &self.compiler.include_paths {
            if lexical(include).starts_with(&staging) {
                return Err(PipelineError::Config(format!(
                    "compiler include path {include:?} is inside staging_dir {:?}",
                    self.staging_dir
                )));
            }
        }

        let mut names = HashSet::new();
        for repo in &self.repos {
            let bad_name = repo.name.is_empty()
                || repo.name == "."
                || repo.name == ".."
                || repo.name.contains(|c: char| c == '/' || c == '\\');
            if bad_name {
                return Err(PipelineError::Config(format!(
                    "invalid repo name '{}'",
                    repo.name
                )));
            }
            if repo.remote.starts_with('-') {
                return Err(PipelineError::Config(format!(
                    "repo '{}': remote must not start with '-'",
                    repo.name
                )));
            }
            let cache = lexical(&repo.cache_path);
            if cache.starts_with(&staging) || staging.starts_with(&cache) {
                return Err(PipelineError::Config(format!(
                    "repo '{}': cache path {:?} overlaps staging_dir {:?}",
                    repo.name, repo.cache_path, self.staging_dir
                )));
            }
            if !names.insert(repo.name.as_str()) {
                return Err(PipelineError::Config(format!(
                    "duplicate repo name '{}'",
                    repo.name
                )));
            }
        }

        if self.sources.is_empty() {
            return Err(PipelineError::Config("no sources configured".into()));
        }
        for source in &self.sources {
            if !names.contains(source.repo.as_str()) {
                return Err(PipelineError::Config(format!(
                    "source refers to unknown repo '{}'",
                    source.repo
                )));
            }
            if source.include.is_empty() {
                return Err(PipelineError::Config(format!(
                    "source for repo '{}' has no include entries",
                    source.repo
                )));
            }
        }
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.fetch_secs)
    }

    pub fn compile_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.compile_secs)
    }
}

/// `path` without `.` components, for prefix comparisons.
fn lexical(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}
