//! Error taxonomy for the sync pipeline.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::state::RunState;

/// Errors produced while bringing a single repository cache up to date.
#[derive(Debug, Error)]
pub enum FetchError {
    /// A git command exited non-zero (unreachable remote, bad ref, ...).
    #[error("repo '{repo}': `{command}` failed: {stderr}")]
    CommandFailed {
        repo: String,
        command: String,
        stderr: String,
    },

    /// The git binary could not be started.
    #[error("repo '{repo}': failed to spawn git: {source}")]
    Spawn {
        repo: String,
        #[source]
        source: std::io::Error,
    },

    /// A pinned revision does not resolve to a commit after fetching.
    #[error("repo '{repo}': revision '{revision}' does not exist")]
    UnknownRevision { repo: String, revision: String },

    /// "latest" was requested while pinned revisions are required.
    #[error("repo '{repo}': revision 'latest' is not allowed, a pinned revision is required")]
    UnpinnedRevision { repo: String },

    /// The cache path exists, is not empty, and is not a git checkout.
    #[error("repo '{repo}': cache path {path:?} exists and is not a git repository")]
    CacheNotRepository { repo: String, path: PathBuf },

    /// Offline mode found a checkout at a different commit than pinned.
    #[error("repo '{repo}': cache is at {actual} but {expected} is pinned (offline)")]
    RevisionMismatch {
        repo: String,
        expected: String,
        actual: String,
    },

    #[error("repo '{repo}': fetch timed out after {timeout:?}")]
    Timeout { repo: String, timeout: Duration },
}

impl FetchError {
    /// Name of the repository this error belongs to.
    pub fn repo(&self) -> &str {
        match self {
            FetchError::CommandFailed { repo, .. }
            | FetchError::Spawn { repo, .. }
            | FetchError::UnknownRevision { repo, .. }
            | FetchError::UnpinnedRevision { repo }
            | FetchError::CacheNotRepository { repo, .. }
            | FetchError::RevisionMismatch { repo, .. }
            | FetchError::Timeout { repo, .. } => repo,
        }
    }
}

/// Pipeline-level errors. Every variant aborts the run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("fetch failed: {0}")]
    Fetch(FetchError),

    /// Best-effort fetching collected more than one failure.
    #[error("fetch failed for {} repos: {}", .0.len(), join_errors(.0))]
    FetchBatch(Vec<FetchError>),

    #[error("missing source {path:?}{}", repo_suffix(.repo))]
    MissingSource { repo: Option<String>, path: PathBuf },

    /// A rewrite rule did not match a file it targets (upstream drift).
    #[error("rewrite rule #{rule_index} (`{pattern}`) did not match {path:?} in repo '{repo}'")]
    RewriteNotApplied {
        rule_index: usize,
        pattern: String,
        repo: String,
        path: PathBuf,
    },

    #[error("{path:?} declares syntax '{syntax}', allowed: {allowed:?}")]
    IncompatibleSyntax {
        path: PathBuf,
        syntax: String,
        allowed: Vec<String>,
    },

    #[error("staging destination {dest:?} is produced by both {first:?} and {second:?}")]
    DestinationConflict {
        dest: PathBuf,
        first: PathBuf,
        second: PathBuf,
    },

    /// The compiler exited non-zero. Diagnostics are carried verbatim.
    #[error("compiler failed for {language} (exit code {}):\n{stderr}{stdout}", exit_display(.exit_code))]
    Compile {
        language: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("failed to spawn compiler `{program}`: {source}")]
    CompilerSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{operation} timed out after {timeout:?} ({subject})")]
    Timeout {
        operation: &'static str,
        subject: String,
        timeout: Duration,
    },

    #[error("invalid run state transition {from} -> {to}")]
    InvalidTransition { from: RunState, to: RunState },

    /// A pipeline task panicked or was cancelled.
    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }

    /// Process exit code for this error class.
    pub fn exit_code(&self) -> u8 {
        match self {
            PipelineError::Io { .. }
            | PipelineError::Internal(_)
            | PipelineError::InvalidTransition { .. }
            | PipelineError::CompilerSpawn { .. } => 1,
            PipelineError::Config(_) | PipelineError::DestinationConflict { .. } => 2,
            // A timed-out member outranks the other failures in a batch.
            PipelineError::FetchBatch(errors)
                if errors.iter().any(|e| matches!(e, FetchError::Timeout { .. })) =>
            {
                7
            }
            PipelineError::Fetch(_) | PipelineError::FetchBatch(_) => 3,
            PipelineError::MissingSource { .. } => 4,
            PipelineError::RewriteNotApplied { .. } => 5,
            PipelineError::Compile { .. } => 6,
            PipelineError::Timeout { .. } => 7,
            PipelineError::IncompatibleSyntax { .. } => 8,
        }
    }
}

impl From<FetchError> for PipelineError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Timeout { repo, timeout } => PipelineError::Timeout {
                operation: "fetch",
                subject: repo,
                timeout,
            },
            other => PipelineError::Fetch(other),
        }
    }
}

/// Result type for pipeline operations.
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

fn join_errors(errors: &[FetchError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

fn repo_suffix(repo: &Option<String>) -> String {
    match repo {
        Some(repo) => format!(" in repo '{repo}'"),
        None => String::new(),
    }
}

fn exit_display(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "signal".to_string(),
    }
}
