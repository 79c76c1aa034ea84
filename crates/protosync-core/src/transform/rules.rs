//! Rewrite rule compilation and application on in-memory text.

use std::path::Path;

use globset::{Glob, GlobMatcher};
use regex::Regex;

use crate::error::{PipelineError, PipelineResult};
use crate::model::{MatchKind, RewriteRule};

/// A [`RewriteRule`] with its glob and pattern compiled.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub index: usize,
    pub rule: RewriteRule,
    glob: GlobMatcher,
    regex: Option<Regex>,
}

impl CompiledRule {
    pub fn compile(index: usize, rule: &RewriteRule) -> PipelineResult<Self> {
        if rule.pattern.is_empty() {
            return Err(PipelineError::Config(format!(
                "rule #{index}: match pattern is empty"
            )));
        }
        let glob = Glob::new(&rule.applies_to)
            .map_err(|e| PipelineError::Config(format!("rule #{index}: bad applies_to glob: {e}")))?
            .compile_matcher();
        let regex = match rule.kind {
            MatchKind::Literal => None,
            MatchKind::Regex => Some(Regex::new(&rule.pattern).map_err(|e| {
                PipelineError::Config(format!("rule #{index}: bad regex: {e}"))
            })?),
        };
        Ok(Self {
            index,
            rule: rule.clone(),
            glob,
            regex,
        })
    }

    /// Whether this rule applies to a file at `rel_path` (relative to its
    /// repository root).
    pub fn targets(&self, rel_path: &Path) -> bool {
        self.glob.is_match(rel_path)
    }

    /// Rewritten text, or `None` if the pattern does not occur.
    pub fn apply(&self, text: &str) -> Option<String> {
        match &self.regex {
            Some(re) => re
                .is_match(text)
                .then(|| re.replace_all(text, self.rule.replacement.as_str()).into_owned()),
            None => text
                .contains(self.rule.pattern.as_str())
                .then(|| text.replace(self.rule.pattern.as_str(), &self.rule.replacement)),
        }
    }
}

pub fn compile_rules(rules: &[RewriteRule]) -> PipelineResult<Vec<CompiledRule>> {
    rules
        .iter()
        .enumerate()
        .map(|(idx, rule)| CompiledRule::compile(idx, rule))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewritten {
    pub content: String,
    /// Indices of the rules that were applied, in order.
    pub applied: Vec<usize>,
}

/// Apply every rule targeting `rel_path` in `repo`, in declared order.
///
/// Each targeting rule must match the text produced by the rules before it.
pub fn apply_rules(
    rules: &[CompiledRule],
    repo: &str,
    rel_path: &Path,
    text: &str,
) -> PipelineResult<Rewritten> {
    let mut content = text.to_string();
    let mut applied = Vec::new();
    for rule in rules.iter().filter(|r| r.targets(rel_path)) {
        content = rule
            .apply(&content)
            .ok_or_else(|| PipelineError::RewriteNotApplied {
                rule_index: rule.index,
                pattern: rule.rule.pattern.clone(),
                repo: repo.to_string(),
                path: rel_path.to_path_buf(),
            })?;
        applied.push(rule.index);
    }
    Ok(Rewritten { content, applied })
}
