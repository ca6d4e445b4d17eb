//! External process execution used for `ssh`, `scp`, and `ansible-playbook`.
//!
//! Every shelled-out step goes through a [`CommandRunner`] so the workflow can
//! be driven by scripted outputs in tests. Non-zero exits are turned into
//! [`CommandError::Failed`] carrying the rendered command line.

use std::ffi::OsString;
use std::process::{Command, Stdio};

use shell_escape::unix::escape;
use thiserror::Error;
use tracing::info;

/// Result of running an external command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output (empty when output is inherited).
    pub stdout: String,
    /// Captured standard error (empty when output is inherited).
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// Errors raised while running external commands.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CommandError {
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a command exits with a non-zero status.
    #[error("`{command}` failed with status {status_text}")]
    Failed {
        /// Rendered command line.
        command: String,
        /// Exit status as reported by the OS.
        status: Option<i32>,
        /// Human readable representation of the exit status.
        status_text: String,
    },
}

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner {
    /// Runs `program` with the given arguments.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Spawn`] if the command cannot be started.
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError>;
}

/// Runner that captures stdout and stderr of the child process.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|err| CommandError::Spawn {
                program: program.to_owned(),
                message: err.to_string(),
            })?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Runner that hands the terminal to the child process.
///
/// Used for interactive SSH sessions and playbook runs whose output the
/// operator watches live.
#[derive(Clone, Debug, Default)]
pub struct InheritedCommandRunner;

impl CommandRunner for InheritedCommandRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        let status = Command::new(program)
            .args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .map_err(|err| CommandError::Spawn {
                program: program.to_owned(),
                message: err.to_string(),
            })?;

        Ok(CommandOutput {
            code: status.code(),
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}

/// Renders `program` and `args` as a shell-quoted command line.
#[must_use]
pub fn render_command(program: &str, args: &[OsString]) -> String {
    let mut rendered = escape(program.into()).into_owned();
    for arg in args {
        rendered.push(' ');
        let lossy = arg.to_string_lossy();
        rendered.push_str(escape(lossy).as_ref());
    }
    rendered
}

/// Runs a command and fails unless it exits with status zero.
///
/// # Errors
///
/// Returns [`CommandError::Spawn`] when the process cannot start and
/// [`CommandError::Failed`] when it exits unsuccessfully.
pub fn run_checked<R: CommandRunner + ?Sized>(
    runner: &R,
    program: &str,
    args: &[OsString],
) -> Result<CommandOutput, CommandError> {
    let command = render_command(program, args);
    info!(%command, "about to run");
    let output = runner.run(program, args)?;
    if output.is_success() {
        return Ok(output);
    }

    let status_text = output
        .code
        .map_or_else(|| String::from("unknown"), |code| code.to_string());
    Err(CommandError::Failed {
        command,
        status: output.code,
        status_text,
    })
}
