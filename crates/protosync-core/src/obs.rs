//! Structured lifecycle events for a sync run.
//!
//! Every event carries an `event` field (`run.started`, `repo.synced`, ...)
//! so log pipelines can filter on it. All events of a run are emitted inside
//! the span returned by [`run_span`].

use std::path::Path;

use tracing::{info, warn, Span};

use crate::digest::ContentHash;
use crate::model::{Revision, TargetLanguage};
use crate::state::RunState;

/// Span tagged with the run id. Attach it with `Instrument::instrument` so
/// it stays correct across `.await` points.
pub fn run_span(run_id: &str) -> Span {
    tracing::info_span!("protosync.run", run_id = %run_id)
}

pub fn emit_run_started(run_id: &str, repos: usize, languages: usize) {
    info!(event = "run.started", run_id = %run_id, repos = repos, languages = languages);
}

pub fn emit_state(from: RunState, to: RunState) {
    info!(event = "run.state", from = %from, to = %to);
}

pub fn emit_repo_synced(repo: &str, requested: &Revision, resolved: &str) {
    info!(
        event = "repo.synced",
        repo = %repo,
        requested = %requested,
        revision = %resolved,
    );
}

pub fn emit_file_staged(dest: &Path, hash: &ContentHash, applied_rules: &[usize]) {
    info!(
        event = "file.staged",
        dest = %dest.display(),
        sha256 = %hash,
        rules = ?applied_rules,
    );
}

pub fn emit_compile_finished(language: TargetLanguage, generated: usize, duration_ms: u64) {
    info!(
        event = "compile.finished",
        language = %language,
        generated = generated,
        duration_ms = duration_ms,
    );
}

pub fn emit_run_finished(run_id: &str, duration_ms: u64, staged: usize, staging_digest: &str) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        staged = staged,
        staging_digest = %staging_digest,
    );
}

/// Warn level; `failed_in` is the state the run was in when it failed.
pub fn emit_run_failed(run_id: &str, failed_in: RunState, error: &dyn std::fmt::Display) {
    warn!(event = "run.failed", run_id = %run_id, state = %failed_in, error = %error);
}
