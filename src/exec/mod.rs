//! External command execution.
//!
//! The cache never spawns processes itself. It builds [`Invocation`]s (ordered
//! argv lists plus a working directory) and hands them to an [`Executor`],
//! which streams combined stdout/stderr to an [`OutputSink`] and collapses the
//! run into a single [`ExecResult`].

mod process;
#[cfg(test)]
pub(crate) mod scripted;
mod sink;

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use process::ProcessExecutor;
pub use sink::{BufferSink, LogSink, NullSink, OutputSink, WriterSink};

/// One program invocation as a structured argument list.
///
/// Arguments are passed to the program verbatim; nothing is interpreted by a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    program: String,
    args: Vec<OsString>,
    envs: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    pub fn get_envs(&self) -> &[(String, String)] {
        &self.envs
    }

    /// Arguments as UTF-8 (lossy), mostly for display and assertions.
    pub fn args_lossy(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// An ordered batch of commands run in one working directory.
///
/// Commands run in sequence and the batch stops at the first failure. The
/// working directory applies to this invocation only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub working_dir: PathBuf,
    pub commands: Vec<CommandSpec>,
    /// Upper bound for each command. `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

impl Invocation {
    pub fn new(working_dir: impl AsRef<Path>, command: CommandSpec) -> Self {
        Self {
            working_dir: working_dir.as_ref().to_path_buf(),
            commands: vec![command],
            timeout: None,
        }
    }

    pub fn then(mut self, command: CommandSpec) -> Self {
        self.commands.push(command);
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Collapsed outcome of an [`Invocation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    /// Whether every command in the batch succeeded.
    pub success: bool,
    /// Exit code of the last command that ran, when it exited normally.
    pub exit_code: Option<i32>,
    /// Combined stdout/stderr lines, in arrival order, without line endings.
    pub output: Vec<String>,
    /// Raw stdout bytes exactly as the program wrote them.
    pub stdout: Vec<u8>,
}

impl ExecResult {
    /// Success whose stdout is `output` joined with newlines.
    pub fn succeeded(output: Vec<String>) -> Self {
        let stdout = joined_lines(&output);
        Self {
            success: true,
            exit_code: Some(0),
            output,
            stdout,
        }
    }

    pub fn failed(exit_code: Option<i32>, output: Vec<String>) -> Self {
        Self {
            success: false,
            exit_code,
            output,
            stdout: Vec::new(),
        }
    }

    /// Replace the raw stdout, keeping `output` as is.
    pub fn with_stdout(mut self, stdout: impl Into<Vec<u8>>) -> Self {
        self.stdout = stdout.into();
        self
    }

    /// Captured output joined with newlines and trimmed.
    pub fn text(&self) -> String {
        self.output.join("\n").trim().to_string()
    }
}

fn joined_lines(lines: &[String]) -> Vec<u8> {
    let mut bytes = Vec::new();
    for line in lines {
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
    }
    bytes
}

/// Runs invocations on behalf of the cache.
pub trait Executor: Send + Sync {
    /// Run every command in `invocation`, streaming output lines to `sink`.
    ///
    /// Spawn failures, timeouts and non-zero exits all surface as
    /// `success == false` with the diagnostic text in `output`.
    fn execute(&self, invocation: &Invocation, sink: &dyn OutputSink) -> ExecResult;
}
