//! Command runner double for unit tests.

use std::collections::VecDeque;
use std::io;

use parking_lot::Mutex;

use crate::command::{CommandOutput, CommandRunner};

/// Records every invocation and answers from a script. Once the script is
/// exhausted every command succeeds.
#[derive(Default)]
pub struct ScriptedRunner {
    calls: Mutex<Vec<Vec<String>>>,
    script: Mutex<VecDeque<io::Result<CommandOutput>>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then_succeed(self) -> Self {
        self.script.lock().push_back(Ok(CommandOutput {
            success: true,
            code: Some(0),
            ..CommandOutput::default()
        }));
        self
    }

    pub fn then_fail(self, stderr: &str) -> Self {
        self.script.lock().push_back(Ok(CommandOutput {
            success: false,
            code: Some(32),
            stderr: stderr.to_string(),
            ..CommandOutput::default()
        }));
        self
    }

    pub fn then_spawn_error(self) -> Self {
        self.script
            .lock()
            .push_back(Err(io::Error::from(io::ErrorKind::NotFound)));
        self
    }

    /// Each call as `program arg...`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().iter().map(|c| c.join(" ")).collect()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        let mut call = vec![program.to_string()];
        call.extend_from_slice(args);
        self.calls.lock().push(call);
        self.script.lock().pop_front().unwrap_or_else(|| {
            Ok(CommandOutput {
                success: true,
                code: Some(0),
                ..CommandOutput::default()
            })
        })
    }
}
