//! External command execution.
//!
//! Mounting goes through the system `mount`/`umount` utilities. The
//! [`CommandRunner`] seam lets tests record invocations instead of running
//! them.

use std::io;
use std::process::Command;

use tracing::debug;

/// Result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// stdout and stderr joined, trimmed, for diagnostics.
    pub fn combined(&self) -> String {
        let stdout = self.stdout.trim();
        let stderr = self.stderr.trim();
        match (stdout.is_empty(), stderr.is_empty()) {
            (true, true) => match self.code {
                Some(code) => format!("exit status {code}"),
                None => "terminated by signal".to_string(),
            },
            (false, true) => stdout.to_string(),
            (true, false) => stderr.to_string(),
            (false, false) => format!("{stdout}\n{stderr}"),
        }
    }
}

pub trait CommandRunner: Send + Sync {
    /// Runs `program` with `args` to completion, capturing its output.
    fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput>;
}

/// Runs commands on the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        debug!(program, ?args, "Running command");
        let output = Command::new(program).args(args).output()?;
        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Whether mount commands need a `sudo` prefix.
pub fn needs_elevation() -> bool {
    !nix::unistd::geteuid().is_root()
}

/// A program and its arguments, optionally prefixed with `sudo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new(program: &str, args: Vec<String>, elevate: bool) -> Self {
        if elevate {
            let mut full = Vec::with_capacity(args.len() + 1);
            full.push(program.to_string());
            full.extend(args);
            Self {
                program: "sudo".to_string(),
                args: full,
            }
        } else {
            Self {
                program: program.to_string(),
                args,
            }
        }
    }

    pub fn run(&self, runner: &dyn CommandRunner) -> io::Result<CommandOutput> {
        runner.run(&self.program, &self.args)
    }

    /// Shell-like rendering for logs and errors.
    pub fn display(&self) -> String {
        let mut s = self.program.clone();
        for arg in &self.args {
            s.push(' ');
            s.push_str(arg);
        }
        s
    }
}
