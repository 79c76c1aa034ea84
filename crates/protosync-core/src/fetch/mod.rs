//! Fetcher: brings every configured repository cache up to date.
//!
//! The actual VCS work sits behind [`RepoSync`]; [`Fetcher`] owns policy
//! (fail-fast vs best-effort, pinned revisions), bounded concurrency and
//! timeouts.

pub mod git;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn, Instrument};

use crate::config::{FetchPolicy, ProtosyncConfig, RevisionPolicy};
use crate::error::{FetchError, PipelineError, PipelineResult};
use crate::model::{RepoSpec, Revision};
use crate::obs;

pub use git::GitRepoSync;

/// A repository after a successful sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedRepo {
    pub name: String,
    pub cache_path: PathBuf,
    pub requested: Revision,
    /// Commit id the cache is checked out at.
    pub revision: String,
}

/// Injectable backend that syncs one repository cache.
///
/// Implementations must only write inside `spec.cache_path`.
#[async_trait]
pub trait RepoSync: Send + Sync {
    /// Ensure the cache exists and is at the requested revision; return the
    /// resolved commit id.
    async fn sync_repo(&self, spec: &RepoSpec) -> Result<String, FetchError>;
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub policy: FetchPolicy,
    pub revision_policy: RevisionPolicy,
    pub max_concurrent: usize,
    pub timeout: Duration,
}

impl FetchOptions {
    pub fn from_config(config: &ProtosyncConfig) -> Self {
        Self {
            policy: config.fetch_policy,
            revision_policy: config.revision_policy,
            max_concurrent: config.max_concurrent_fetches,
            timeout: config.fetch_timeout(),
        }
    }
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            policy: FetchPolicy::FailFast,
            revision_policy: RevisionPolicy::AllowLatest,
            max_concurrent: 3,
            timeout: Duration::from_secs(300),
        }
    }
}

pub struct Fetcher {
    backend: Arc<dyn RepoSync>,
    options: FetchOptions,
}

impl Fetcher {
    pub fn new(backend: Arc<dyn RepoSync>, options: FetchOptions) -> Self {
        Self { backend, options }
    }

    /// Sync every repo. Results come back in `specs` order.
    ///
    /// Repos are fetched concurrently, at most `max_concurrent` at a time.
    /// Distinct cache paths are required so no two tasks write the same
    /// directory.
    pub async fn sync(&self, specs: &[RepoSpec]) -> PipelineResult<Vec<ResolvedRepo>> {
        self.preflight(specs)?;

        let permits = Arc::new(Semaphore::new(self.options.max_concurrent.max(1)));
        let mut join_set = JoinSet::new();
        for (idx, spec) in specs.iter().cloned().enumerate() {
            let backend = Arc::clone(&self.backend);
            let permits = Arc::clone(&permits);
            let timeout = self.options.timeout;
            let task = async move {
                let _permit = permits.acquire_owned().await.ok();
                debug!(repo = %spec.name, remote = %spec.remote, "syncing repo");
                let outcome = match tokio::time::timeout(timeout, backend.sync_repo(&spec)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(FetchError::Timeout {
                        repo: spec.name.clone(),
                        timeout,
                    }),
                };
                (idx, spec, outcome)
            };
            join_set.spawn(task.in_current_span());
        }

        let mut resolved: Vec<Option<ResolvedRepo>> = vec![None; specs.len()];
        let mut failures = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            let (idx, spec, outcome) =
                joined.map_err(|e| PipelineError::Internal(format!("fetch task failed: {e}")))?;
            match outcome {
                Ok(revision) => {
                    obs::emit_repo_synced(&spec.name, &spec.revision, &revision);
                    resolved[idx] = Some(ResolvedRepo {
                        name: spec.name,
                        cache_path: spec.cache_path,
                        requested: spec.revision,
                        revision,
                    });
                }
                Err(err) => {
                    warn!(repo = %spec.name, error = %err, "repo sync failed");
                    if self.options.policy == FetchPolicy::FailFast {
                        // Dropping the aborted futures kills their git children.
                        join_set.abort_all();
                        return Err(err.into());
                    }
                    failures.push((idx, err));
                }
            }
        }

        if !failures.is_empty() {
            failures.sort_by_key(|(idx, _)| *idx);
            let mut errors: Vec<FetchError> = failures.into_iter().map(|(_, e)| e).collect();
            return Err(if errors.len() == 1 {
                errors.remove(0).into()
            } else {
                PipelineError::FetchBatch(errors)
            });
        }

        resolved
            .into_iter()
            .zip(specs)
            .map(|(slot, spec)| {
                slot.ok_or_else(|| {
                    PipelineError::Internal(format!(
                        "missing fetch result for repo '{}'",
                        spec.name
                    ))
                })
            })
            .collect()
    }

    /// Checks that must pass before any network access.
    fn preflight(&self, specs: &[RepoSpec]) -> PipelineResult<()> {
        let mut paths = HashSet::new();
        for spec in specs {
            if !paths.insert(spec.cache_path.clone()) {
                return Err(PipelineError::Config(format!(
                    "repo '{}' shares cache path {:?} with another repo",
                    spec.name, spec.cache_path
                )));
            }
        }

        let unpinned: Vec<&RepoSpec> = specs.iter().filter(|s| !s.revision.is_pinned()).collect();
        match self.options.revision_policy {
            RevisionPolicy::RequirePinned => {
                if let Some(spec) = unpinned.first() {
                    return Err(FetchError::UnpinnedRevision {
                        repo: spec.name.clone(),
                    }
                    .into());
                }
            }
            RevisionPolicy::AllowLatest => {
                for spec in unpinned {
                    warn!(repo = %spec.name, "tracking 'latest'; output is not reproducible");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeRepoSync;

    fn spec(name: &str, revision: Revision) -> RepoSpec {
        RepoSpec {
            name: name.to_string(),
            remote: format!("https://example.com/{name}.git"),
            cache_path: PathBuf::from(format!("/cache/{name}")),
            revision,
        }
    }

    #[tokio::test]
    async fn test_results_keep_spec_order() {
        let fake = Arc::new(FakeRepoSync::new());
        let fetcher = Fetcher::new(fake.clone(), FetchOptions::default());
        let specs = vec![spec("a", Revision::Latest), spec("b", Revision::Latest)];
        let resolved = fetcher.sync(&specs).await.unwrap();
        assert_eq!(resolved[0].name, "a");
        assert_eq!(resolved[1].name, "b");
        assert_eq!(fake.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_require_pinned_fails_before_fetching() {
        let fake = Arc::new(FakeRepoSync::new());
        let options = FetchOptions {
            revision_policy: RevisionPolicy::RequirePinned,
            ..Default::default()
        };
        let fetcher = Fetcher::new(fake.clone(), options);
        let specs = vec![
            spec("a", Revision::Pinned("v1".to_string())),
            spec("b", Revision::Latest),
        ];
        let err = fetcher.sync(&specs).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Fetch(FetchError::UnpinnedRevision { ref repo }) if repo == "b"
        ));
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn test_shared_cache_path_rejected() {
        let fake = Arc::new(FakeRepoSync::new());
        let fetcher = Fetcher::new(fake.clone(), FetchOptions::default());
        let mut b = spec("b", Revision::Latest);
        b.cache_path = PathBuf::from("/cache/a");
        let err = fetcher
            .sync(&[spec("a", Revision::Latest), b])
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn test_best_effort_attempts_every_repo() {
        let fake = Arc::new(FakeRepoSync::new().failing("a").failing("c"));
        let options = FetchOptions {
            policy: FetchPolicy::BestEffort,
            ..Default::default()
        };
        let fetcher = Fetcher::new(fake.clone(), options);
        let specs = vec![
            spec("a", Revision::Latest),
            spec("b", Revision::Latest),
            spec("c", Revision::Latest),
        ];
        let err = fetcher.sync(&specs).await.unwrap_err();
        match err {
            PipelineError::FetchBatch(errors) => {
                let repos: Vec<&str> = errors.iter().map(|e| e.repo()).collect();
                assert_eq!(repos, vec!["a", "c"]);
            }
            other => panic!("expected FetchBatch, got {other:?}"),
        }
        assert_eq!(fake.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_fail_fast_reports_first_failure() {
        let fake = Arc::new(FakeRepoSync::new().failing("a"));
        let options = FetchOptions {
            max_concurrent: 1,
            ..Default::default()
        };
        let fetcher = Fetcher::new(fake, options);
        let err = fetcher
            .sync(&[spec("a", Revision::Latest), spec("b", Revision::Latest)])
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Fetch(ref e) if e.repo() == "a"));
    }

    struct PanickingSync;

    #[async_trait]
    impl RepoSync for PanickingSync {
        async fn sync_repo(&self, spec: &RepoSpec) -> Result<String, FetchError> {
            panic!("sync of {} blew up", spec.name);
        }
    }

    #[tokio::test]
    async fn test_panicked_task_is_internal_error() {
        let fetcher = Fetcher::new(Arc::new(PanickingSync), FetchOptions::default());
        let err = fetcher.sync(&[spec("a", Revision::Latest)]).await.unwrap_err();
        assert!(matches!(err, PipelineError::Internal(_)));
        assert_eq!(err.exit_code(), 1);
    }

    /// Fails "a" at once and stalls every other repo.
    struct FailOrStall;

    #[async_trait]
    impl RepoSync for FailOrStall {
        async fn sync_repo(&self, spec: &RepoSpec) -> Result<String, FetchError> {
            if spec.name == "a" {
                return Err(FetchError::UnknownRevision {
                    repo: spec.name.clone(),
                    revision: "v9".to_string(),
                });
            }
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok("never".to_string())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_best_effort_batch_with_timeout_exits_as_timeout() {
        let options = FetchOptions {
            policy: FetchPolicy::BestEffort,
            timeout: Duration::from_secs(1),
            ..Default::default()
        };
        let fetcher = Fetcher::new(Arc::new(FailOrStall), options);
        let err = fetcher
            .sync(&[spec("a", Revision::Latest), spec("b", Revision::Latest)])
            .await
            .unwrap_err();
        match &err {
            PipelineError::FetchBatch(errors) => {
                assert!(matches!(errors[0], FetchError::UnknownRevision { .. }));
                assert!(matches!(errors[1], FetchError::Timeout { .. }));
            }
            other => panic!("expected FetchBatch, got {other:?}"),
        }
        assert_eq!(err.exit_code(), 7);
    }

    #[tokio::test]
    async fn test_slow_repo_times_out() {
        let fake = Arc::new(FakeRepoSync::new().with_delay(Duration::from_secs(5)));
        let options = FetchOptions {
            timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let fetcher = Fetcher::new(fake, options);
        let err = fetcher.sync(&[spec("a", Revision::Latest)]).await.unwrap_err();
        assert!(matches!(err, PipelineError::Timeout { operation: "fetch", .. }));
        assert_eq!(err.exit_code(), 7);
    }
}
