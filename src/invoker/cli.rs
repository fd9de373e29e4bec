//! CLI backend adapter.
//!
//! Resolves the backend executable on the process PATH at call time and
//! shells out with each backend's own argument conventions. Output streams
//! are inherited: the backends render their own progress, and the
//! orchestrator only cares about the exit code.

use std::env;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::RunnerInvoker;
use crate::error::InvokerError;
use crate::job::{RunnerConfig, RunnerKind};

/// Reasoning effort sent to Codex when the runner config leaves it unset.
const DEFAULT_REASONING_EFFORT: &str = "high";

/// Production invoker that launches the real backend CLIs.
#[derive(Debug, Clone, Default)]
pub struct CliInvoker;

impl CliInvoker {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RunnerInvoker for CliInvoker {
    async fn invoke(&self, runner: &RunnerConfig, workdir: &Path) -> Result<(), InvokerError> {
        let name = runner.kind.executable();
        let exe = resolve_executable(name)?;
        debug!(
            runner = %runner.kind,
            exe = %exe.display(),
            workdir = %workdir.display(),
            "Launching runner"
        );

        let mut cmd = build_command(&exe, runner, workdir);
        let status = cmd.status().await.map_err(|source| InvokerError::Spawn {
            name: name.to_string(),
            source,
        })?;

        let code = status.code().unwrap_or(-1);
        if code == 0 {
            info!(runner = %runner.kind, "Runner completed");
            Ok(())
        } else {
            Err(InvokerError::RunnerExit { code })
        }
    }
}

/// Resolves `name` against the process PATH, failing with the searched
/// PATH when no matching file exists.
pub fn resolve_executable(name: &str) -> Result<PathBuf, InvokerError> {
    let path_var = env::var_os("PATH").unwrap_or_default();
    for dir in env::split_paths(&path_var) {
        if dir.as_os_str().is_empty() {
            continue;
        }
        for candidate in candidate_names(name) {
            let full = dir.join(candidate);
            if full.is_file() {
                return Ok(full);
            }
        }
    }
    Err(InvokerError::ExecutableNotFound {
        name: name.to_string(),
        path: path_var.to_string_lossy().into_owned(),
    })
}

#[cfg(windows)]
fn candidate_names(name: &str) -> Vec<String> {
    let mut names = vec![name.to_string()];
    let pathext = env::var("PATHEXT").unwrap_or_else(|_| ".EXE;.CMD;.BAT;.COM".to_string());
    for ext in pathext.split(';').filter(|ext| !ext.is_empty()) {
        names.push(format!("{}{}", name, ext.to_lowercase()));
    }
    names
}

#[cfg(not(windows))]
fn candidate_names(name: &str) -> Vec<String> {
    vec![name.to_string()]
}

fn build_command(exe: &Path, runner: &RunnerConfig, workdir: &Path) -> Command {
    let mut cmd = Command::new(exe);
    match runner.kind {
        RunnerKind::Codex => {
            let effort = runner
                .reasoning_effort
                .as_deref()
                .unwrap_or(DEFAULT_REASONING_EFFORT);
            cmd.arg("exec")
                .arg("--skip-git-repo-check")
                .args(["--sandbox", "danger-full-access"])
                .args(["--model", &runner.model])
                .arg("-c")
                .arg(format!("model_reasoning_effort=\"{}\"", effort))
                .arg("--")
                .arg(runner.instruction_text());
        }
        RunnerKind::Gemini => {
            cmd.args(["--model", &runner.model])
                .arg("--yolo")
                .arg(runner.instruction_text());
        }
    }
    cmd.current_dir(workdir);

    // Presentation only: give the backend its own console window.
    #[cfg(windows)]
    if runner.new_console {
        const CREATE_NEW_CONSOLE: u32 = 0x0000_0010;
        cmd.creation_flags(CREATE_NEW_CONSOLE);
    }

    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn args_of(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_codex_command_shape() {
        let runner = RunnerConfig::new(RunnerKind::Codex, "p.md", "gpt-5.2")
            .with_reasoning_effort("medium")
            .with_instruction("Go.");
        let cmd = build_command(Path::new("codex"), &runner, Path::new("/tmp/ws"));

        let args = args_of(&cmd);
        assert_eq!(
            args,
            vec![
                "exec",
                "--skip-git-repo-check",
                "--sandbox",
                "danger-full-access",
                "--model",
                "gpt-5.2",
                "-c",
                "model_reasoning_effort=\"medium\"",
                "--",
                "Go.",
            ]
        );
    }

    #[test]
    fn test_codex_defaults_reasoning_effort_to_high() {
        let runner = RunnerConfig::new(RunnerKind::Codex, "p.md", "m");
        let cmd = build_command(Path::new("codex"), &runner, Path::new("."));
        assert!(args_of(&cmd).contains(&"model_reasoning_effort=\"high\"".to_string()));
    }

    #[test]
    fn test_gemini_command_shape() {
        let runner = RunnerConfig::new(RunnerKind::Gemini, "p.md", "gemini-3-pro-preview");
        let cmd = build_command(Path::new("gemini"), &runner, Path::new("."));

        let args = args_of(&cmd);
        assert_eq!(args, vec!["--model", "gemini-3-pro-preview", "--yolo", "Proceed."]);
    }

    #[test]
    fn test_resolve_executable_finds_file_and_reports_searched_path() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("codex"), "#!/bin/sh\n").unwrap();

        let original_path = env::var_os("PATH");
        env::set_var("PATH", temp.path());

        let resolved = resolve_executable("codex");
        let missing = resolve_executable("gemini");

        match original_path {
            Some(path) => env::set_var("PATH", path),
            None => env::remove_var("PATH"),
        }

        assert_eq!(resolved.unwrap(), temp.path().join("codex"));
        match missing.unwrap_err() {
            InvokerError::ExecutableNotFound { name, path } => {
                assert_eq!(name, "gemini");
                assert!(path.contains(temp.path().to_str().unwrap()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
