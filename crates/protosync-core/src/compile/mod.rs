//! Compiler Invoker: validates a [`CompileJob`] and runs the proto compiler.

pub mod protoc;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::model::TargetLanguage;
use crate::obs;

pub use protoc::ProtocBackend;

/// One compiler invocation for one target language.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileJob {
    pub inputs: Vec<PathBuf>,
    pub include_paths: Vec<PathBuf>,
    pub output_dir: PathBuf,
    pub language: TargetLanguage,
}

impl CompileJob {
    /// Every include path and input must exist, and every input must live
    /// under an include path. Nothing is spawned until this passes.
    pub fn validate(&self) -> PipelineResult<()> {
        if self.inputs.is_empty() {
            return Err(PipelineError::Config(format!(
                "compile job for {} has no input files",
                self.language
            )));
        }
        for include in &self.include_paths {
            if !include.is_dir() {
                return Err(PipelineError::MissingSource {
                    repo: None,
                    path: include.clone(),
                });
            }
        }
        for input in &self.inputs {
            if !input.is_file() {
                return Err(PipelineError::MissingSource {
                    repo: None,
                    path: input.clone(),
                });
            }
            if !self.include_paths.iter().any(|inc| input.starts_with(inc)) {
                return Err(PipelineError::Config(format!(
                    "input {input:?} is not under any include path"
                )));
            }
        }
        Ok(())
    }

    /// Compiler arguments, without the command itself.
    pub fn to_args(&self, extra_args: &[String]) -> Vec<String> {
        let mut args: Vec<String> = self
            .include_paths
            .iter()
            .map(|p| format!("-I{}", p.display()))
            .collect();
        args.push(self.language.out_flag(&self.output_dir));
        args.extend(extra_args.iter().cloned());
        args.extend(self.inputs.iter().map(|p| p.display().to_string()));
        args
    }
}

/// Captured result of a finished compiler process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs the external compiler with the given arguments.
#[async_trait]
pub trait CompilerBackend: Send + Sync {
    async fn execute(&self, args: &[String]) -> PipelineResult<ProcessOutput>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompileOutcome {
    pub language: TargetLanguage,
    /// Files new or modified by this invocation, sorted.
    pub generated_files: Vec<PathBuf>,
    pub diagnostics: Diagnostics,
    pub duration_ms: u64,
}

pub struct CompilerInvoker {
    backend: Arc<dyn CompilerBackend>,
    timeout: Duration,
    extra_args: Vec<String>,
}

impl CompilerInvoker {
    pub fn new(backend: Arc<dyn CompilerBackend>, timeout: Duration) -> Self {
        Self {
            backend,
            timeout,
            extra_args: Vec::new(),
        }
    }

    pub fn with_extra_args(mut self, extra_args: Vec<String>) -> Self {
        self.extra_args = extra_args;
        self
    }

    pub async fn compile(&self, job: &CompileJob) -> PipelineResult<CompileOutcome> {
        job.validate()?;
        std::fs::create_dir_all(&job.output_dir)
            .map_err(|e| PipelineError::io(&job.output_dir, e))?;

        let before = snapshot(&job.output_dir)?;
        let args = job.to_args(&self.extra_args);
        debug!(language = %job.language, ?args, "invoking compiler");

        let start = Instant::now();
        let output = tokio::time::timeout(self.timeout, self.backend.execute(&args))
            .await
            .map_err(|_| PipelineError::Timeout {
                operation: "compile",
                subject: job.language.to_string(),
                timeout: self.timeout,
            })??;
        let duration_ms = start.elapsed().as_millis() as u64;

        if !output.success() {
            warn!(language = %job.language, exit_code = ?output.exit_code, "compiler failed");
            return Err(PipelineError::Compile {
                language: job.language.to_string(),
                exit_code: output.exit_code,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }
        if !output.stderr.is_empty() {
            info!(language = %job.language, stderr = %output.stderr, "compiler diagnostics");
        }

        let after = snapshot(&job.output_dir)?;
        let mut generated_files: Vec<PathBuf> = after
            .into_iter()
            .filter(|(path, mtime)| before.get(path) != Some(mtime))
            .map(|(path, _)| path)
            .collect();
        generated_files.sort();

        obs::emit_compile_finished(job.language, generated_files.len(), duration_ms);
        Ok(CompileOutcome {
            language: job.language,
            generated_files,
            diagnostics: Diagnostics {
                stdout: output.stdout,
                stderr: output.stderr,
            },
            duration_ms,
        })
    }
}

/// Modification times of every file under `dir`.
fn snapshot(dir: &Path) -> PipelineResult<HashMap<PathBuf, Option<SystemTime>>> {
    let mut out = HashMap::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let entries = std::fs::read_dir(&current).map_err(|e| PipelineError::io(&current, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| PipelineError::io(&current, e))?;
            let path = entry.path();
            let meta = entry
                .metadata()
                .map_err(|e| PipelineError::io(&path, e))?;
            if meta.is_dir() {
                stack.push(path);
            } else {
                out.insert(path, meta.modified().ok());
            }
        }
    }
    Ok(out)
}
