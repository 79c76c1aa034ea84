//! protosync core library
//!
//! Keeps protocol-buffer definitions from external repositories in sync:
//! fetches the repositories, stages selected `.proto` files with content
//! rewrites, and runs the proto compiler over the staged tree.

pub mod compile;
pub mod config;
pub mod digest;
pub mod error;
pub mod fakes;
pub mod fetch;
pub mod model;
pub mod obs;
pub mod pipeline;
pub mod state;
pub mod telemetry;
pub mod transform;

pub use compile::{
    CompileJob, CompileOutcome, CompilerBackend, CompilerInvoker, Diagnostics, ProcessOutput,
    ProtocBackend,
};
pub use config::{
    CompilerSettings, ConfigOverrides, FetchPolicy, ProtosyncConfig, RevisionPolicy, Timeouts,
    DEFAULT_CONFIG_FILE,
};
pub use digest::ContentHash;
pub use error::{FetchError, PipelineError, PipelineResult};
pub use fetch::{FetchOptions, Fetcher, GitRepoSync, RepoSync, ResolvedRepo};
pub use model::{MatchKind, RepoSpec, Revision, RewriteRule, SourceSet, TargetLanguage};
pub use pipeline::{Pipeline, RunReport};
pub use state::{RunState, RunTracker};
pub use telemetry::init_tracing;
pub use transform::{
    apply_rules, collect_sources, staging_digest, SourceFile, StagedFile, Transformer,
    STAGING_MARKER,
};

/// protosync version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
