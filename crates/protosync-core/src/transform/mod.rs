//! Transformer: copies selected sources into the staging tree, applying
//! rewrite rules and checking declared syntax.
//!
//! The staging root belongs to the pipeline. It carries a marker file and is
//! emptied at the start of every stage, so output depends only on the
//! inputs and the rules. A directory that holds data but no marker is never
//! touched.

pub mod rules;
pub mod sources;
pub mod syntax;

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::digest::{ordered_digest, ContentHash};
use crate::error::{PipelineError, PipelineResult};
use crate::model::RewriteRule;
use crate::obs;

pub use rules::{apply_rules, compile_rules, CompiledRule, Rewritten};
pub use sources::{collect_sources, SourceFile};
pub use syntax::SyntaxChecker;

/// Marker file identifying a pipeline-owned staging root.
pub const STAGING_MARKER: &str = ".protosync-staging";

/// A file written into the staging tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagedFile {
    pub repo: String,
    pub source: PathBuf,
    /// Absolute path inside the staging root.
    pub destination: PathBuf,
    /// `destination` relative to the staging root.
    pub relative_destination: PathBuf,
    /// Declared rule indices, in application order.
    pub applied_rules: Vec<usize>,
    pub content_hash: ContentHash,
}

impl StagedFile {
    pub fn is_proto(&self) -> bool {
        is_proto(&self.relative_destination)
    }
}

fn is_proto(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "proto")
}

#[derive(Debug, Clone)]
pub struct Transformer {
    rules: Vec<CompiledRule>,
    syntax: SyntaxChecker,
}

impl Transformer {
    pub fn new(rules: &[RewriteRule], allowed_syntaxes: &[String]) -> PipelineResult<Self> {
        Ok(Self {
            rules: compile_rules(rules)?,
            syntax: SyntaxChecker::new(allowed_syntaxes)?,
        })
    }

    /// Stage `sources` under `dest_root`. Output is ordered by destination.
    pub fn stage(&self, sources: &[SourceFile], dest_root: &Path) -> PipelineResult<Vec<StagedFile>> {
        let mut ordered: Vec<&SourceFile> = sources.iter().collect();
        ordered.sort_by(|a, b| a.dest_relative.cmp(&b.dest_relative));
        for pair in ordered.windows(2) {
            if pair[0].dest_relative == pair[1].dest_relative {
                return Err(PipelineError::DestinationConflict {
                    dest: pair[0].dest_relative.clone(),
                    first: pair[0].source_path.clone(),
                    second: pair[1].source_path.clone(),
                });
            }
        }

        prepare_staging_root(dest_root)?;

        let mut staged = Vec::with_capacity(ordered.len());
        for source in ordered {
            staged.push(self.stage_one(source, dest_root)?);
        }
        Ok(staged)
    }

    fn stage_one(&self, source: &SourceFile, dest_root: &Path) -> PipelineResult<StagedFile> {
        let bytes = fs::read(&source.source_path).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                PipelineError::MissingSource {
                    repo: Some(source.repo.clone()),
                    path: source.relative_path.clone(),
                }
            } else {
                PipelineError::io(&source.source_path, e)
            }
        })?;

        let targeted = self.rules.iter().any(|r| r.targets(&source.relative_path));
        let proto = is_proto(&source.dest_relative);
        let (content, applied_rules) = if targeted || proto {
            let text = String::from_utf8(bytes).map_err(|e| {
                PipelineError::io(
                    &source.source_path,
                    std::io::Error::new(ErrorKind::InvalidData, e),
                )
            })?;
            let rewritten = apply_rules(&self.rules, &source.repo, &source.relative_path, &text)?;
            if proto {
                self.syntax.check(&source.relative_path, &rewritten.content)?;
            }
            (rewritten.content.into_bytes(), rewritten.applied)
        } else {
            (bytes, Vec::new())
        };

        let destination = dest_root.join(&source.dest_relative);
        write_atomic(&destination, &content)?;
        let content_hash = ContentHash::compute(&content);
        debug!(
            src = %source.source_path.display(),
            dest = %destination.display(),
            rules = ?applied_rules,
            "staged"
        );
        obs::emit_file_staged(&source.dest_relative, &content_hash, &applied_rules);

        Ok(StagedFile {
            repo: source.repo.clone(),
            source: source.source_path.clone(),
            destination,
            relative_destination: source.dest_relative.clone(),
            applied_rules,
            content_hash,
        })
    }
}

/// SHA-256 over relative destinations and content hashes, in staged order.
pub fn staging_digest(staged: &[StagedFile]) -> String {
    let names: Vec<String> = staged
        .iter()
        .map(|f| f.relative_destination.to_string_lossy().into_owned())
        .collect();
    ordered_digest(
        names
            .iter()
            .zip(staged)
            .map(|(name, f)| (name.as_str(), &f.content_hash)),
    )
}

/// Create or empty the staging root, keeping its marker.
fn prepare_staging_root(root: &Path) -> PipelineResult<()> {
    let marker = root.join(STAGING_MARKER);
    if root.exists() {
        let mut entries: Vec<PathBuf> = Vec::new();
        for entry in fs::read_dir(root).map_err(|e| PipelineError::io(root, e))? {
            entries.push(entry.map_err(|e| PipelineError::io(root, e))?.path());
        }
        if !entries.is_empty() && !marker.exists() {
            return Err(PipelineError::Config(format!(
                "staging dir {root:?} is not empty and was not created by protosync \
                 (no {STAGING_MARKER} marker); refusing to clear it"
            )));
        }
        for path in entries.into_iter().filter(|p| *p != marker) {
            let removed = if path.is_dir() && !path.is_symlink() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            removed.map_err(|e| PipelineError::io(&path, e))?;
        }
    } else {
        fs::create_dir_all(root).map_err(|e| PipelineError::io(root, e))?;
    }
    if !marker.exists() {
        fs::write(&marker, b"").map_err(|e| PipelineError::io(&marker, e))?;
    }
    Ok(())
}

fn write_atomic(path: &Path, data: &[u8]) -> PipelineResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| PipelineError::Config(format!("invalid staging path {path:?}")))?;
    fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
    let mut tmp = NamedTempFile::new_in(parent).map_err(|e| PipelineError::io(parent, e))?;
    tmp.write_all(data).map_err(|e| PipelineError::io(path, e))?;
    tmp.persist(path)
        .map_err(|e| PipelineError::io(path, e.error))?;
    Ok(())
}
