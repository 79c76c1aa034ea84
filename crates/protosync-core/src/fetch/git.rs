//! [`RepoSync`] backed by the `git` binary.

use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::RepoSync;
use crate::error::FetchError;
use crate::model::{RepoSpec, Revision};

/// Clones or updates repository caches by shelling out to `git`.
///
/// In offline mode nothing touches the network: the existing checkout is
/// used as-is and a pinned revision must already be checked out.
#[derive(Debug, Clone, Default)]
pub struct GitRepoSync {
    offline: bool,
}

impl GitRepoSync {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offline() -> Self {
        Self { offline: true }
    }

    async fn sync_online(&self, spec: &RepoSpec) -> Result<String, FetchError> {
        let cache = spec.cache_path.as_path();
        if !cache.join(".git").exists() {
            if !dir_is_empty(cache).await {
                return Err(FetchError::CacheNotRepository {
                    repo: spec.name.clone(),
                    path: spec.cache_path.clone(),
                });
            }
            if let Some(parent) = cache.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| FetchError::CommandFailed {
                        repo: spec.name.clone(),
                        command: format!("create_dir_all {}", parent.display()),
                        stderr: e.to_string(),
                    })?;
            }
            debug!(repo = %spec.name, path = %cache.display(), "cloning");
            run_git(
                &spec.name,
                None,
                [
                    OsStr::new("clone"),
                    OsStr::new("--no-checkout"),
                    OsStr::new("--"),
                    OsStr::new(&spec.remote),
                    cache.as_os_str(),
                ],
            )
            .await?;
        }

        let target = match &spec.revision {
            Revision::Latest => {
                run_git(&spec.name, Some(cache), ["fetch", "--force", "origin", "HEAD"]).await?;
                "FETCH_HEAD".to_string()
            }
            Revision::Pinned(rev) => {
                run_git(
                    &spec.name,
                    Some(cache),
                    ["fetch", "--tags", "--force", "origin"],
                )
                .await?;
                // Branch names resolve through the remote-tracking ref so a
                // moved branch is picked up; tags and ids resolve directly.
                match resolve_commit(&spec.name, cache, &format!("origin/{rev}")).await? {
                    Some(commit) => commit,
                    None => resolve_commit(&spec.name, cache, rev).await?.ok_or_else(|| {
                        FetchError::UnknownRevision {
                            repo: spec.name.clone(),
                            revision: rev.clone(),
                        }
                    })?,
                }
            }
        };

        run_git(
            &spec.name,
            Some(cache),
            ["checkout", "--quiet", "--force", "--detach", target.as_str()],
        )
        .await?;
        head_commit(&spec.name, cache).await
    }

    async fn sync_offline(&self, spec: &RepoSpec) -> Result<String, FetchError> {
        let cache = spec.cache_path.as_path();
        if !cache.join(".git").exists() {
            return Err(FetchError::CacheNotRepository {
                repo: spec.name.clone(),
                path: spec.cache_path.clone(),
            });
        }
        let head = head_commit(&spec.name, cache).await?;
        if let Revision::Pinned(rev) = &spec.revision {
            let expected = resolve_commit(&spec.name, cache, rev)
                .await?
                .ok_or_else(|| FetchError::UnknownRevision {
                    repo: spec.name.clone(),
                    revision: rev.clone(),
                })?;
            if expected != head {
                return Err(FetchError::RevisionMismatch {
                    repo: spec.name.clone(),
                    expected,
                    actual: head,
                });
            }
        }
        Ok(head)
    }
}

#[async_trait]
impl RepoSync for GitRepoSync {
    async fn sync_repo(&self, spec: &RepoSpec) -> Result<String, FetchError> {
        if self.offline {
            self.sync_offline(spec).await
        } else {
            self.sync_online(spec).await
        }
    }
}

async fn dir_is_empty(path: &Path) -> bool {
    match tokio::fs::read_dir(path).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(None)),
        Err(_) => true,
    }
}

async fn head_commit(repo: &str, dir: &Path) -> Result<String, FetchError> {
    let sha = run_git(repo, Some(dir), ["rev-parse", "HEAD"]).await?;
    if sha.is_empty() {
        return Err(FetchError::CommandFailed {
            repo: repo.to_string(),
            command: "git rev-parse HEAD".to_string(),
            stderr: "empty output".to_string(),
        });
    }
    Ok(sha)
}

/// `None` when the revision does not name a commit.
async fn resolve_commit(repo: &str, dir: &Path, rev: &str) -> Result<Option<String>, FetchError> {
    let spec = format!("{rev}^{{commit}}");
    let output = git_command(Some(dir), ["rev-parse", "--verify", "--quiet", spec.as_str()])
        .output()
        .await
        .map_err(|source| FetchError::Spawn {
            repo: repo.to_string(),
            source,
        })?;
    if !output.status.success() {
        return Ok(None);
    }
    let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
    Ok((!sha.is_empty()).then_some(sha))
}

fn git_command<I, S>(dir: Option<&Path>, args: I) -> Command
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new("git");
    cmd.args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }
    cmd
}

/// Run git and return trimmed stdout, or `CommandFailed` with stderr.
async fn run_git<I, S>(repo: &str, dir: Option<&Path>, args: I) -> Result<String, FetchError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let args: Vec<S> = args.into_iter().collect();
    let command = std::iter::once("git".to_string())
        .chain(args.iter().map(|a| a.as_ref().to_string_lossy().into_owned()))
        .collect::<Vec<_>>()
        .join(" ");

    let output = git_command(dir, &args)
        .output()
        .await
        .map_err(|source| FetchError::Spawn {
            repo: repo.to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(FetchError::CommandFailed {
            repo: repo.to_string(),
            command,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
