//! Declared-syntax detection for `.proto` files.

use std::path::Path;

use regex::Regex;

use crate::error::{PipelineError, PipelineResult};

/// Syntax assumed when a file declares none.
pub const IMPLICIT_SYNTAX: &str = "proto2";

#[derive(Debug, Clone)]
pub struct SyntaxChecker {
    allowed: Vec<String>,
    comments: Regex,
    declaration: Regex,
}

impl SyntaxChecker {
    pub fn new(allowed: &[String]) -> PipelineResult<Self> {
        let build = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|e| PipelineError::Config(format!("syntax pattern: {e}")))
        };
        Ok(Self {
            allowed: allowed.to_vec(),
            comments: build(r"(?s)/\*.*?\*/|//[^\n]*")?,
            declaration: build(r#"^(syntax|edition)\s*=\s*["']([^"']*)["']\s*;"#)?,
        })
    }

    /// The syntax a file declares: `proto2`, `proto3`, or `edition-<year>`.
    ///
    /// Only the first statement counts; a file without a declaration is
    /// proto2.
    pub fn detect(&self, text: &str) -> String {
        let stripped = self.comments.replace_all(text, "");
        match self.declaration.captures(stripped.trim_start()) {
            Some(caps) if &caps[1] == "edition" => format!("edition-{}", &caps[2]),
            Some(caps) => caps[2].to_string(),
            None => IMPLICIT_SYNTAX.to_string(),
        }
    }

    pub fn check(&self, path: &Path, text: &str) -> PipelineResult<String> {
        let syntax = self.detect(text);
        if !self.allowed.iter().any(|a| *a == syntax) {
            return Err(PipelineError::IncompatibleSyntax {
                path: path.to_path_buf(),
                syntax,
                allowed: self.allowed.clone(),
            });
        }
        Ok(syntax)
    }
}
