//! One sync run: fetch, stage, compile, in that order.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::Instrument;
use uuid::Uuid;

use crate::compile::{CompileJob, CompileOutcome, CompilerBackend, CompilerInvoker, ProtocBackend};
use crate::config::ProtosyncConfig;
use crate::error::PipelineResult;
use crate::fetch::{FetchOptions, Fetcher, GitRepoSync, RepoSync, ResolvedRepo};
use crate::obs;
use crate::state::{RunState, RunTracker};
use crate::transform::{collect_sources, staging_digest, StagedFile, Transformer};

/// Everything a successful run produced. Printed by the CLI as JSON.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub state: RunState,
    pub repos: Vec<ResolvedRepo>,
    pub staged: Vec<StagedFile>,
    pub compiled: Vec<CompileOutcome>,
    /// Equal across runs that staged identical bytes at identical paths.
    pub staging_digest: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

pub struct Pipeline {
    config: ProtosyncConfig,
    fetcher: Fetcher,
    transformer: Transformer,
    invoker: CompilerInvoker,
}

impl Pipeline {
    /// Pipeline backed by real `git` and the configured compiler command.
    pub fn from_config(config: ProtosyncConfig, offline: bool) -> PipelineResult<Self> {
        let sync: Arc<dyn RepoSync> = if offline {
            Arc::new(GitRepoSync::offline())
        } else {
            Arc::new(GitRepoSync::new())
        };
        let compiler = Arc::new(ProtocBackend::new(config.compiler.command.clone())?);
        Self::with_backends(config, sync, compiler)
    }

    pub fn with_backends(
        config: ProtosyncConfig,
        sync: Arc<dyn RepoSync>,
        compiler: Arc<dyn CompilerBackend>,
    ) -> PipelineResult<Self> {
        config.validate()?;
        let fetcher = Fetcher::new(sync, FetchOptions::from_config(&config));
        let transformer = Transformer::new(&config.rules, &config.allowed_syntaxes)?;
        let invoker = CompilerInvoker::new(compiler, config.compile_timeout())
            .with_extra_args(config.compiler.extra_args.clone());
        Ok(Self {
            config,
            fetcher,
            transformer,
            invoker,
        })
    }

    pub fn config(&self) -> &ProtosyncConfig {
        &self.config
    }

    /// Run every stage once. A retry needs a new call; nothing carries over
    /// except the repository caches and the output directory.
    pub async fn run(&self) -> PipelineResult<RunReport> {
        let run_id = Uuid::new_v4().to_string();
        let span = obs::run_span(&run_id);
        self.run_with_id(run_id).instrument(span).await
    }

    async fn run_with_id(&self, run_id: String) -> PipelineResult<RunReport> {
        let started_at = Utc::now();
        let start = Instant::now();
        let mut tracker = RunTracker::new();
        obs::emit_run_started(
            &run_id,
            self.config.repos.len(),
            self.config.target_languages.len(),
        );

        match self.execute(&mut tracker).await {
            Ok((repos, staged, compiled)) => {
                let duration_ms = start.elapsed().as_millis() as u64;
                let digest = staging_digest(&staged);
                obs::emit_run_finished(&run_id, duration_ms, staged.len(), &digest);
                Ok(RunReport {
                    run_id,
                    state: tracker.current(),
                    repos,
                    staged,
                    compiled,
                    staging_digest: digest,
                    started_at,
                    duration_ms,
                })
            }
            Err(err) => {
                let failed_in = tracker.fail();
                obs::emit_state(failed_in, RunState::Failed);
                obs::emit_run_failed(&run_id, failed_in, &err);
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        tracker: &mut RunTracker,
    ) -> PipelineResult<(Vec<ResolvedRepo>, Vec<StagedFile>, Vec<CompileOutcome>)> {
        transition(tracker, RunState::Fetching)?;
        let repos = self.fetcher.sync(&self.config.repos).await?;

        transition(tracker, RunState::Staging)?;
        let sources = collect_sources(&self.config.sources, &repos)?;
        let staged = self.transformer.stage(&sources, &self.config.staging_dir)?;

        transition(tracker, RunState::Compiling)?;
        let mut compiled = Vec::with_capacity(self.config.target_languages.len());
        for job in self.compile_jobs(&staged) {
            compiled.push(self.invoker.compile(&job).await?);
        }

        transition(tracker, RunState::Done)?;
        Ok((repos, staged, compiled))
    }

    /// One job per target language over every staged `.proto` file.
    fn compile_jobs(&self, staged: &[StagedFile]) -> Vec<CompileJob> {
        let inputs: Vec<PathBuf> = staged
            .iter()
            .filter(|f| f.is_proto())
            .map(|f| f.destination.clone())
            .collect();
        let include_paths: Vec<PathBuf> = std::iter::once(self.config.staging_dir.clone())
            .chain(self.config.compiler.include_paths.iter().cloned())
            .collect();

        self.config
            .target_languages
            .iter()
            .map(|&language| CompileJob {
                inputs: inputs.clone(),
                include_paths: include_paths.clone(),
                output_dir: self.config.output_dir.clone(),
                language,
            })
            .collect()
    }
}

fn transition(tracker: &mut RunTracker, to: RunState) -> PipelineResult<()> {
    let from = tracker.current();
    tracker.advance(to)?;
    obs::emit_state(from, to);
    Ok(())
}
