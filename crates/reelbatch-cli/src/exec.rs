//! Subprocess work function
//!
//! Runs one external command per item. `{item}` in any argument is replaced
//! with the item ID; the process exit status decides success.

use std::process::Stdio;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use reelbatch_lib::core::batch::WorkFunction;

use crate::process::{configure_tokio_command, find_program};

/// Placeholder substituted with the item ID
pub const ITEM_PLACEHOLDER: &str = "{item}";

/// Longest stderr excerpt kept in an item error
const STDERR_EXCERPT: usize = 400;

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("command line is empty")]
    EmptyCommand,

    #[error("program not found: {0}")]
    ProgramNotFound(String),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
}

/// Work function that shells out to a program for every item
#[derive(Clone, Debug)]
pub struct CommandWork {
    program: String,
    args: Vec<String>,
}

impl CommandWork {
    /// Parses a whitespace-separated command line (no shell quoting)
    pub fn parse(command_line: &str) -> Result<Self, ExecError> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or(ExecError::EmptyCommand)?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }

    /// Program to run
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments for one item
    pub fn args_for(&self, item_id: &str) -> Vec<String> {
        let mut args: Vec<String> = self
            .args
            .iter()
            .map(|arg| arg.replace(ITEM_PLACEHOLDER, item_id))
            .collect();
        // Without a placeholder the item goes last
        if !self.args.iter().any(|arg| arg.contains(ITEM_PLACEHOLDER)) {
            args.push(item_id.to_string());
        }
        args
    }

    async fn run(&self, item_id: &str) -> Result<Value, ExecError> {
        let args = self.args_for(item_id);
        debug!(program = %self.program, ?args, item_id, "Spawning item command");

        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        configure_tokio_command(&mut cmd);

        let output = cmd.output().await.map_err(|source| ExecError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExecError::Failed {
                status: output.status.to_string(),
                stderr: excerpt(stderr.trim(), STDERR_EXCERPT),
            });
        }

        Ok(json!({
            "exitCode": output.status.code(),
            "stdout": String::from_utf8_lossy(&output.stdout).trim_end(),
        }))
    }
}

fn excerpt(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}

#[async_trait]
impl WorkFunction for CommandWork {
    async fn execute(&self, item_id: &str, _options: &Value) -> Result<Value, String> {
        self.run(item_id).await.map_err(|e| e.to_string())
    }

    async fn prepare(&self, _options: &Value) -> Result<(), String> {
        match find_program(&self.program) {
            Some(_) => Ok(()),
            None => Err(ExecError::ProgramNotFound(self.program.clone()).to_string()),
        }
    }
}
