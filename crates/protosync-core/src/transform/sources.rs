//! Resolves [`SourceSet`]s against fetched repositories into concrete files.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use globset::{Glob, GlobBuilder, GlobSet, GlobSetBuilder};
use serde::Serialize;

use crate::error::{PipelineError, PipelineResult};
use crate::fetch::ResolvedRepo;
use crate::model::SourceSet;

/// One file selected for staging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceFile {
    pub repo: String,
    pub source_path: PathBuf,
    /// Path relative to the repository root; rule globs match against this.
    pub relative_path: PathBuf,
    /// Path relative to the staging root.
    pub dest_relative: PathBuf,
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains(|c: char| matches!(c, '*' | '?' | '[' | '{'))
}

/// Directory part of a glob before its first wildcard component.
fn literal_prefix(pattern: &str) -> PathBuf {
    Path::new(pattern)
        .components()
        .take_while(|c| !is_glob(&c.as_os_str().to_string_lossy()))
        .collect()
}

/// Source selection globs: `*` stays within one directory, `**` crosses.
fn path_glob(pattern: &str) -> Result<Glob, globset::Error> {
    GlobBuilder::new(pattern).literal_separator(true).build()
}

fn walk_files(dir: &Path, files: &mut Vec<PathBuf>) -> PipelineResult<()> {
    let entries = std::fs::read_dir(dir).map_err(|e| PipelineError::io(dir, e))?;
    let mut paths = Vec::new();
    for entry in entries {
        paths.push(entry.map_err(|e| PipelineError::io(dir, e))?.path());
    }
    paths.sort();

    for path in paths {
        if path.file_name().is_some_and(|n| n == ".git") {
            continue;
        }
        if path.is_dir() {
            walk_files(&path, files)?;
        } else if path.is_file() {
            files.push(path);
        }
    }
    Ok(())
}

fn build_excludes(set: &SourceSet) -> PipelineResult<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in &set.exclude {
        let glob = path_glob(pattern).map_err(|e| {
            PipelineError::Config(format!("sources for '{}': bad exclude glob: {e}", set.repo))
        })?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| PipelineError::Config(format!("sources for '{}': {e}", set.repo)))
}

fn dest_for(set: &SourceSet, relative: &Path) -> PipelineResult<PathBuf> {
    let remainder = match &set.strip_prefix {
        Some(prefix) => relative.strip_prefix(prefix).map_err(|_| {
            PipelineError::Config(format!(
                "sources for '{}': strip_prefix {:?} is not a prefix of {:?}",
                set.repo, prefix, relative
            ))
        })?,
        None => relative,
    };
    Ok(match &set.dest_prefix {
        Some(prefix) => prefix.join(remainder),
        None => remainder.to_path_buf(),
    })
}

fn select(set: &SourceSet, root: &Path) -> PipelineResult<BTreeSet<PathBuf>> {
    let mut selected = BTreeSet::new();
    for include in &set.include {
        if Path::new(include)
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir))
        {
            return Err(PipelineError::Config(format!(
                "sources for '{}': include {include:?} escapes the repository",
                set.repo
            )));
        }

        if !is_glob(include) {
            if !root.join(include).is_file() {
                return Err(PipelineError::MissingSource {
                    repo: Some(set.repo.clone()),
                    path: PathBuf::from(include),
                });
            }
            selected.insert(PathBuf::from(include));
            continue;
        }

        let matcher = path_glob(include)
            .map_err(|e| {
                PipelineError::Config(format!("sources for '{}': bad include glob: {e}", set.repo))
            })?
            .compile_matcher();
        let start = root.join(literal_prefix(include));
        let mut files = Vec::new();
        if start.is_dir() {
            walk_files(&start, &mut files)?;
        }
        let mut matched = false;
        for file in files {
            let Ok(relative) = file.strip_prefix(root) else {
                continue;
            };
            if matcher.is_match(relative) {
                matched = true;
                selected.insert(relative.to_path_buf());
            }
        }
        if !matched {
            return Err(PipelineError::MissingSource {
                repo: Some(set.repo.clone()),
                path: PathBuf::from(include),
            });
        }
    }
    Ok(selected)
}

/// Expand every source set into files, in set order then path order.
pub fn collect_sources(sets: &[SourceSet], repos: &[ResolvedRepo]) -> PipelineResult<Vec<SourceFile>> {
    let mut out = Vec::new();
    for set in sets {
        let repo = repos.iter().find(|r| r.name == set.repo).ok_or_else(|| {
            PipelineError::Config(format!("sources reference unknown repo '{}'", set.repo))
        })?;
        let excludes = build_excludes(set)?;

        for relative in select(set, &repo.cache_path)? {
            if excludes.is_match(&relative) {
                continue;
            }
            out.push(SourceFile {
                repo: set.repo.clone(),
                source_path: repo.cache_path.join(&relative),
                dest_relative: dest_for(set, &relative)?,
                relative_path: relative,
            });
        }
    }
    Ok(out)
}
