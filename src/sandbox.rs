//! Code execution sandbox
//!
//! The engine only ever reaches a sandbox through the `execute_code` tool.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::types::ExecutionOutput;

/// Arguments of `execute_code`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeRequest {
    pub code: String,
    #[serde(default)]
    pub language: Option<String>,
    /// JSON handed to the program on stdin
    #[serde(default)]
    pub inputs: Value,
}

/// Opaque execution capability
#[async_trait]
pub trait CodeSandbox: Send + Sync {
    /// Run code. Program failures are reported in [`ExecutionOutput::error`];
    /// `Err` means the sandbox itself could not run it.
    async fn run(&self, request: CodeRequest) -> anyhow::Result<ExecutionOutput>;
}

/// Runs each program as a subprocess inside one workspace directory
pub struct ProcessSandbox {
    work_dir: PathBuf,
    program: String,
    args: Vec<String>,
    extension: String,
    /// Language this interpreter accepts; `None` accepts any request
    language: Option<String>,
    runs: AtomicU64,
}

impl ProcessSandbox {
    pub fn new(work_dir: impl Into<PathBuf>, program: impl Into<String>) -> Self {
        Self {
            work_dir: work_dir.into(),
            program: program.into(),
            args: Vec::new(),
            extension: "txt".into(),
            language: None,
            runs: AtomicU64::new(0),
        }
    }

    /// Python interpreter sandbox
    pub fn python(work_dir: impl Into<PathBuf>) -> Self {
        Self::new(work_dir, "python3")
            .with_extension("py")
            .with_language("python")
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }
}

#[async_trait]
impl CodeSandbox for ProcessSandbox {
    async fn run(&self, request: CodeRequest) -> anyhow::Result<ExecutionOutput> {
        if let (Some(accepted), Some(requested)) = (&self.language, &request.language) {
            if !accepted.eq_ignore_ascii_case(requested) {
                bail!("sandbox runs {accepted} code, got {requested}");
            }
        }

        tokio::fs::create_dir_all(&self.work_dir)
            .await
            .with_context(|| format!("cannot create workspace {}", self.work_dir.display()))?;

        let run = self.runs.fetch_add(1, Ordering::SeqCst);
        let file = self
            .work_dir
            .join(format!("program_generated_{run:04}.{}", self.extension));
        tokio::fs::write(&file, &request.code)
            .await
            .with_context(|| format!("cannot write {}", file.display()))?;

        debug!(program = %self.program, file = %file.display(), "Running sandboxed code");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(&file)
            .current_dir(&self.work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("cannot start {}", self.program))?;

        // Feed stdin while the program runs; it may exit without reading it all
        let stdin = child.stdin.take();
        let payload = (!request.inputs.is_null()).then(|| request.inputs.to_string());
        let feed = async move {
            let (Some(mut stdin), Some(payload)) = (stdin, payload) else {
                return Ok(());
            };
            match stdin.write_all(payload.as_bytes()).await {
                Err(e) if e.kind() != ErrorKind::BrokenPipe => Err(e),
                _ => Ok(()),
            }
        };

        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        fed.context("cannot write program inputs")?;
        let output = output?;
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        let result = stdout
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .and_then(|line| serde_json::from_str(line).ok());

        let error = if output.status.success() {
            None
        } else {
            let code = output.status.code().unwrap_or(-1);
            Some(format!("exitcode: {code}\n{stderr}"))
        };

        Ok(ExecutionOutput {
            stdout,
            result,
            error,
        })
    }
}
