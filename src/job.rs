//! Job and runner descriptors.
//!
//! This module defines the declarative data model the executor consumes:
//!
//! - `RunnerKind`: the closed set of supported backends
//! - `RunnerConfig`: one backend invocation within a job
//! - `AgentJob`: a full unit of orchestrated work
//! - `AgentRunResult`: the outcome of a successful run
//! - `JobHooks`: optional lifecycle notifications around each runner

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::InvokerError;

/// Instruction sent to a backend when the runner config leaves it unset.
pub const DEFAULT_INSTRUCTION: &str = "Proceed.";

/// Supported runner backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerKind {
    /// The `codex` CLI. Accepts a reasoning-effort parameter.
    Codex,
    /// The `gemini` CLI.
    Gemini,
}

impl RunnerKind {
    /// Returns the logical executable name resolved on PATH.
    pub fn executable(&self) -> &'static str {
        match self {
            RunnerKind::Codex => "codex",
            RunnerKind::Gemini => "gemini",
        }
    }
}

impl fmt::Display for RunnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.executable())
    }
}

impl std::str::FromStr for RunnerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "codex" => Ok(RunnerKind::Codex),
            "gemini" => Ok(RunnerKind::Gemini),
            other => Err(format!("Unknown runner kind: {}", other)),
        }
    }
}

/// Immutable description of one backend invocation within a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Which backend to launch.
    pub kind: RunnerKind,
    /// Prompt file staged into the workspace root before launch.
    pub prompt_path: PathBuf,
    /// Model identifier passed to the backend.
    pub model: String,
    /// Reasoning effort (Codex only; other backends ignore it).
    #[serde(default)]
    pub reasoning_effort: Option<String>,
    /// Presentation only: open the backend in its own console window where
    /// the platform supports it. No semantic effect.
    #[serde(default = "default_new_console")]
    pub new_console: bool,
    /// Instruction text handed to the backend. `None` or blank falls back
    /// to [`DEFAULT_INSTRUCTION`].
    #[serde(default)]
    pub instruction: Option<String>,
    /// Filename the staged prompt gets inside the workspace. `None` keeps
    /// the source file name.
    #[serde(default)]
    pub prompt_filename: Option<String>,
}

fn default_new_console() -> bool {
    true
}

impl RunnerConfig {
    /// Creates a runner config with the default console and instruction
    /// settings.
    pub fn new(kind: RunnerKind, prompt_path: impl Into<PathBuf>, model: impl Into<String>) -> Self {
        Self {
            kind,
            prompt_path: prompt_path.into(),
            model: model.into(),
            reasoning_effort: None,
            new_console: true,
            instruction: None,
            prompt_filename: None,
        }
    }

    /// Sets the reasoning effort (meaningful for Codex only).
    pub fn with_reasoning_effort(mut self, effort: impl Into<String>) -> Self {
        self.reasoning_effort = Some(effort.into());
        self
    }

    /// Sets the console-presentation flag.
    pub fn with_new_console(mut self, new_console: bool) -> Self {
        self.new_console = new_console;
        self
    }

    /// Overrides the instruction text sent to the backend.
    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = Some(instruction.into());
        self
    }

    /// Overrides the staged prompt's filename.
    pub fn with_prompt_filename(mut self, name: impl Into<String>) -> Self {
        self.prompt_filename = Some(name.into());
        self
    }

    /// The instruction text actually sent to the backend.
    pub fn instruction_text(&self) -> &str {
        match self.instruction.as_deref() {
            Some(text) if !text.trim().is_empty() => text,
            _ => DEFAULT_INSTRUCTION,
        }
    }
}

/// Lifecycle notifications for a job's runners.
///
/// Every method has a no-op default, so implementors override only the
/// events they care about. `on_finish` and `on_failure` fire inside the
/// runner's own task immediately after its process exits, before the job
/// moves on to aggregation — side effects like archiving a partial output
/// run while the workspace still exists.
pub trait JobHooks: Send + Sync {
    /// Fired right before the backend process is launched.
    fn on_start(&self, job: &str, runner: &RunnerConfig, workspace: &Path) {
        let _ = (job, runner, workspace);
    }

    /// Fired after the backend process exits with code 0.
    fn on_finish(&self, job: &str, runner: &RunnerConfig, workspace: &Path) {
        let _ = (job, runner, workspace);
    }

    /// Fired after the backend fails to resolve, launch, or exit cleanly.
    fn on_failure(&self, job: &str, runner: &RunnerConfig, workspace: &Path, error: &InvokerError) {
        let _ = (job, runner, workspace, error);
    }
}

/// One declarative unit of orchestrated work.
///
/// File lists name sources outside the workspace; the rename maps key on
/// the source file name and give the name used inside the workspace (or,
/// for `deliver_rename`, the name used in the delivery directory).
#[derive(Clone)]
pub struct AgentJob {
    /// Job name, used in logs and error messages.
    pub name: String,
    /// Runners launched concurrently in the shared workspace. Runners must
    /// not write colliding filenames; that contract is on the job author.
    pub runners: Vec<RunnerConfig>,
    /// Files copied into `input/`.
    pub input_files: Vec<PathBuf>,
    pub input_rename: BTreeMap<String, String>,
    /// Files copied into `references/`.
    pub reference_files: Vec<PathBuf>,
    pub reference_rename: BTreeMap<String, String>,
    /// Files copied into `output/` before any runner starts.
    pub output_seed_files: Vec<PathBuf>,
    pub output_rename: BTreeMap<String, String>,
    /// Where finished outputs go. `None` skips delivery entirely.
    pub deliver_dir: Option<PathBuf>,
    /// `output/` file name → delivered file name. Only files named here
    /// are moved out of the workspace.
    pub deliver_rename: BTreeMap<String, String>,
    /// Run the markdown cleaner over `output/*.md` before delivery.
    pub clean_markdown: bool,
    /// Optional lifecycle hooks.
    pub hooks: Option<Arc<dyn JobHooks>>,
}

impl AgentJob {
    /// Creates an empty job with markdown cleanup enabled.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            runners: Vec::new(),
            input_files: Vec::new(),
            input_rename: BTreeMap::new(),
            reference_files: Vec::new(),
            reference_rename: BTreeMap::new(),
            output_seed_files: Vec::new(),
            output_rename: BTreeMap::new(),
            deliver_dir: None,
            deliver_rename: BTreeMap::new(),
            clean_markdown: true,
            hooks: None,
        }
    }

    /// Appends a runner.
    pub fn with_runner(mut self, runner: RunnerConfig) -> Self {
        self.runners.push(runner);
        self
    }

    /// Appends an input file.
    pub fn with_input_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.input_files.push(path.into());
        self
    }

    /// Renames an input file inside the workspace.
    pub fn with_input_rename(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.input_rename.insert(from.into(), to.into());
        self
    }

    /// Appends a reference file.
    pub fn with_reference_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.reference_files.push(path.into());
        self
    }

    /// Renames a reference file inside the workspace.
    pub fn with_reference_rename(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.reference_rename.insert(from.into(), to.into());
        self
    }

    /// Appends a file seeded into `output/` before the runners start.
    pub fn with_output_seed_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_seed_files.push(path.into());
        self
    }

    /// Renames an output-seed file inside the workspace.
    pub fn with_output_rename(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.output_rename.insert(from.into(), to.into());
        self
    }

    /// Sets the delivery directory. Relative paths resolve against the
    /// executor's project root.
    pub fn with_deliver_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.deliver_dir = Some(dir.into());
        self
    }

    /// Maps an `output/` file to its delivered name.
    pub fn with_delivery(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.deliver_rename.insert(from.into(), to.into());
        self
    }

    /// Enables or disables markdown cleanup before delivery.
    pub fn with_clean_markdown(mut self, clean: bool) -> Self {
        self.clean_markdown = clean;
        self
    }

    /// Installs lifecycle hooks.
    pub fn with_hooks(mut self, hooks: Arc<dyn JobHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }
}

impl fmt::Debug for AgentJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentJob")
            .field("name", &self.name)
            .field("runners", &self.runners)
            .field("input_files", &self.input_files)
            .field("reference_files", &self.reference_files)
            .field("output_seed_files", &self.output_seed_files)
            .field("deliver_dir", &self.deliver_dir)
            .field("deliver_rename", &self.deliver_rename)
            .field("clean_markdown", &self.clean_markdown)
            .field("hooks", &self.hooks.is_some())
            .finish()
    }
}

/// Outcome of a successful job run.
#[derive(Debug, Clone)]
pub struct AgentRunResult {
    /// The job that produced this result.
    pub job: AgentJob,
    /// Workspace the job ran in. Already deleted; kept for diagnostics.
    pub workspace: PathBuf,
    /// Files moved into the delivery directory, in delivery-map order.
    pub delivered: Vec<PathBuf>,
    /// Exit code per runner kind. A job listing the same kind twice sees
    /// the later runner's code.
    pub exit_codes: BTreeMap<RunnerKind, i32>,
    /// When the run finished, teardown included.
    pub completed_at: DateTime<Utc>,
    /// Wall-clock duration of the run.
    pub duration: Duration,
}
