//! Immutable run inputs: repository specs, rewrite rules, source sets and
//! target languages.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Revision requested for a repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Revision {
    /// Whatever the remote's default branch points at.
    Latest,
    /// A tag, branch, or commit id.
    Pinned(String),
}

impl Revision {
    pub fn is_pinned(&self) -> bool {
        matches!(self, Revision::Pinned(_))
    }
}

impl Default for Revision {
    fn default() -> Self {
        Revision::Latest
    }
}

impl From<String> for Revision {
    fn from(value: String) -> Self {
        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("latest") {
            Revision::Latest
        } else {
            Revision::Pinned(trimmed.to_string())
        }
    }
}

impl From<Revision> for String {
    fn from(value: Revision) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Revision::Latest => f.write_str("latest"),
            Revision::Pinned(rev) => f.write_str(rev),
        }
    }
}

/// A repository to keep cached locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoSpec {
    pub name: String,
    /// Anything `git clone` accepts: URL or local path.
    pub remote: String,
    pub cache_path: PathBuf,
    pub revision: Revision,
}

/// How a rewrite rule's pattern is matched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    /// Exact text; the replacement is inserted verbatim.
    #[default]
    Literal,
    /// Regular expression; the replacement may reference captures.
    Regex,
}

/// One content rewrite. Rules apply in declared order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteRule {
    #[serde(rename = "match")]
    pub pattern: String,
    #[serde(rename = "replace")]
    pub replacement: String,
    #[serde(default = "default_applies_to")]
    pub applies_to: String,
    #[serde(default)]
    pub kind: MatchKind,
}

fn default_applies_to() -> String {
    "*.proto".to_string()
}

impl RewriteRule {
    pub fn literal(
        pattern: impl Into<String>,
        replacement: impl Into<String>,
        applies_to: impl Into<String>,
    ) -> Self {
        Self {
            pattern: pattern.into(),
            replacement: replacement.into(),
            applies_to: applies_to.into(),
            kind: MatchKind::Literal,
        }
    }

    pub fn regex(
        pattern: impl Into<String>,
        replacement: impl Into<String>,
        applies_to: impl Into<String>,
    ) -> Self {
        Self {
            kind: MatchKind::Regex,
            ..Self::literal(pattern, replacement, applies_to)
        }
    }
}

/// Selects files from one fetched repository and optionally remaps their
/// directory inside the staging tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSet {
    pub repo: String,
    /// Literal paths or globs, relative to the repository root.
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub strip_prefix: Option<PathBuf>,
    #[serde(default)]
    pub dest_prefix: Option<PathBuf>,
}

/// Code generator selected with the compiler's `--<lang>_out` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetLanguage {
    Cpp,
    Csharp,
    Java,
    Kotlin,
    Objc,
    Php,
    Pyi,
    Python,
    Ruby,
    Rust,
}

impl TargetLanguage {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetLanguage::Cpp => "cpp",
            TargetLanguage::Csharp => "csharp",
            TargetLanguage::Java => "java",
            TargetLanguage::Kotlin => "kotlin",
            TargetLanguage::Objc => "objc",
            TargetLanguage::Php => "php",
            TargetLanguage::Pyi => "pyi",
            TargetLanguage::Python => "python",
            TargetLanguage::Ruby => "ruby",
            TargetLanguage::Rust => "rust",
        }
    }

    /// e.g. `--python_out=<dir>`
    pub fn out_flag(&self, output_dir: &std::path::Path) -> String {
        format!("--{}_out={}", self.as_str(), output_dir.display())
    }
}

impl fmt::Display for TargetLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetLanguage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpp" | "c++" => Ok(TargetLanguage::Cpp),
            "csharp" | "c#" => Ok(TargetLanguage::Csharp),
            "java" => Ok(TargetLanguage::Java),
            "kotlin" => Ok(TargetLanguage::Kotlin),
            "objc" => Ok(TargetLanguage::Objc),
            "php" => Ok(TargetLanguage::Php),
            "pyi" => Ok(TargetLanguage::Pyi),
            "python" | "py" => Ok(TargetLanguage::Python),
            "ruby" => Ok(TargetLanguage::Ruby),
            "rust" => Ok(TargetLanguage::Rust),
            other => Err(format!("unknown target language: {other}")),
        }
    }
}
