//! Shell command execution for command-driven provisioners and test runners.
//!
//! `CommandRunner` is the seam; `ShellRunner` spawns `sh -c` and
//! `MockRunner` records commands and replays scripted responses.

use std::path::PathBuf;
use std::process::Command;

use parking_lot::Mutex;

/// Executes a shell command string. `Ok` carries stdout of a zero exit,
/// `Err` carries stderr (or the spawn error) otherwise.
pub trait CommandRunner: Send + Sync {
    fn run(&self, cmd: &str) -> Result<String, String>;
}

/// Production runner that spawns `sh -c <cmd>`.
#[derive(Debug, Clone, Default)]
pub struct ShellRunner {
    workdir: Option<PathBuf>,
}

impl ShellRunner {
    pub fn new() -> Self {
        ShellRunner::default()
    }

    pub fn in_dir(workdir: PathBuf) -> Self {
        ShellRunner {
            workdir: Some(workdir),
        }
    }
}

impl CommandRunner for ShellRunner {
    fn run(&self, cmd: &str) -> Result<String, String> {
        let mut command = Command::new("sh");
        command.arg("-c").arg(cmd);
        if let Some(dir) = &self.workdir {
            command.current_dir(dir);
        }
        let output = command
            .output()
            .map_err(|e| format!("failed to spawn: {}", e))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            match output.status.code() {
                Some(code) if stderr.is_empty() => Err(format!("exit status {}", code)),
                Some(code) => Err(format!("exit status {}: {}", code, stderr)),
                None => Err(format!("terminated by signal: {}", stderr)),
            }
        }
    }
}

/// Substitute `{name}` placeholders in a command template.
pub fn render_template(template: &str, vars: &[(&str, String)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (name, value)| {
        acc.replace(&format!("{{{}}}", name), value)
    })
}

// ---------------------------------------------------------------------------
// MockRunner
// ---------------------------------------------------------------------------

/// Test double: records every command and answers from a script.
///
/// Rules are checked in insertion order; the first rule whose pattern is a
/// substring of the command decides the response. Unmatched commands succeed
/// with empty output.
#[derive(Debug, Default)]
pub struct MockRunner {
    rules: Mutex<Vec<(String, Result<String, String>)>>,
    commands: Mutex<Vec<String>>,
}

impl MockRunner {
    pub fn new() -> Self {
        MockRunner::default()
    }

    /// Answer commands containing `pattern` with `response`.
    pub fn respond(&self, pattern: &str, response: Result<String, String>) {
        self.rules.lock().push((pattern.to_string(), response));
    }

    pub fn executed_commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }
}

impl CommandRunner for MockRunner {
    fn run(&self, cmd: &str) -> Result<String, String> {
        self.commands.lock().push(cmd.to_string());
        self.rules
            .lock()
            .iter()
            .find(|(pattern, _)| cmd.contains(pattern.as_str()))
            .map(|(_, response)| response.clone())
            .unwrap_or_else(|| Ok(String::new()))
    }
}
