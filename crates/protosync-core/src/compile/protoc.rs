//! [`CompilerBackend`] that spawns a real compiler process.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use super::{CompilerBackend, ProcessOutput};
use crate::error::{PipelineError, PipelineResult};

/// Runs `command[0] command[1..] <args>`, e.g. `protoc` or
/// `python -m grpc_tools.protoc`.
#[derive(Debug, Clone)]
pub struct ProtocBackend {
    command: Vec<String>,
}

impl ProtocBackend {
    pub fn new(command: Vec<String>) -> PipelineResult<Self> {
        if command.is_empty() {
            return Err(PipelineError::Config("compiler command is empty".into()));
        }
        Ok(Self { command })
    }
}

#[async_trait]
impl CompilerBackend for ProtocBackend {
    async fn execute(&self, args: &[String]) -> PipelineResult<ProcessOutput> {
        let program = &self.command[0];
        let child = Command::new(program)
            .args(&self.command[1..])
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| PipelineError::CompilerSpawn {
                program: program.clone(),
                source,
            })?;

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| PipelineError::io(program, e))?;

        Ok(ProcessOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}
