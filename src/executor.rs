//! Job execution state machine.
//!
//! A job moves through allocate → stage → launch → join → aggregate →
//! deliver. Once a workspace exists there is exactly one teardown attempt,
//! regardless of which stage failed; teardown failures are logged and
//! never mask the job's outcome.
//!
//! Runners of one job share the workspace and run to completion no matter
//! how their siblings fare: there is no cross-runner cancellation and no
//! per-runner timeout.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::JobError;
use crate::invoker::RunnerInvoker;
use crate::job::{AgentJob, AgentRunResult, JobHooks, RunnerConfig, RunnerKind};
use crate::markdown;
use crate::workspace::{cleanup, WorkspaceAllocator};

const INPUT_DIR: &str = "input";
const OUTPUT_DIR: &str = "output";
const REFERENCES_DIR: &str = "references";

/// Executes agent jobs, one freshly allocated workspace per run.
pub struct JobExecutor {
    allocator: Arc<WorkspaceAllocator>,
    invoker: Arc<dyn RunnerInvoker>,
    project_root: PathBuf,
}

impl JobExecutor {
    /// Creates an executor. Relative delivery directories resolve against
    /// `project_root`.
    pub fn new(
        allocator: Arc<WorkspaceAllocator>,
        invoker: Arc<dyn RunnerInvoker>,
        project_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            allocator,
            invoker,
            project_root: project_root.into(),
        }
    }

    /// Runs `job` to completion and returns its result.
    ///
    /// The workspace is deleted before this returns, success or failure.
    /// On failure the error identifies the failing stage: staging and
    /// delivery problems abort with nothing partially delivered, and
    /// runner failures arrive as one aggregate error carrying every
    /// runner's exit code.
    pub async fn run(&self, job: AgentJob) -> Result<AgentRunResult, JobError> {
        let run_id = format!("run-{}", Uuid::new_v4());
        let start = Instant::now();

        let workspace = self.allocator.allocate().await?;
        info!(
            run_id = %run_id,
            job = %job.name,
            workspace = %workspace.display(),
            runners = job.runners.len(),
            "Starting agent job"
        );

        let outcome = self.run_in_workspace(&job, &workspace).await;

        cleanup::remove_workspace(&workspace);

        match outcome {
            Ok((delivered, exit_codes)) => {
                let duration = start.elapsed();
                info!(
                    run_id = %run_id,
                    job = %job.name,
                    ?duration,
                    delivered = delivered.len(),
                    "Agent job succeeded"
                );
                Ok(AgentRunResult {
                    job,
                    workspace,
                    delivered,
                    exit_codes,
                    completed_at: Utc::now(),
                    duration,
                })
            }
            Err(e) => {
                error!(run_id = %run_id, job = %job.name, error = %e, "Agent job failed");
                Err(e)
            }
        }
    }

    async fn run_in_workspace(
        &self,
        job: &AgentJob,
        workspace: &Path,
    ) -> Result<(Vec<PathBuf>, BTreeMap<RunnerKind, i32>), JobError> {
        self.stage(job, workspace)?;

        let exit_codes = self.launch_runners(job, workspace).await;

        if exit_codes.values().any(|code| *code != 0) {
            return Err(JobError::RunnersFailed {
                job: job.name.clone(),
                exit_codes,
            });
        }

        let delivered = self.deliver(job, workspace)?;
        Ok((delivered, exit_codes))
    }

    /// Populates the workspace: every runner's prompt at the root and the
    /// declared files under `input/`, `references/` and `output/`. Any
    /// missing source aborts before a single runner starts.
    fn stage(&self, job: &AgentJob, workspace: &Path) -> Result<(), JobError> {
        for runner in &job.runners {
            self.stage_prompt(job, runner, workspace)?;
        }
        self.stage_files(job, &job.input_files, &job.input_rename, &workspace.join(INPUT_DIR))?;
        self.stage_files(
            job,
            &job.reference_files,
            &job.reference_rename,
            &workspace.join(REFERENCES_DIR),
        )?;
        self.stage_files(
            job,
            &job.output_seed_files,
            &job.output_rename,
            &workspace.join(OUTPUT_DIR),
        )?;
        Ok(())
    }

    fn stage_prompt(
        &self,
        job: &AgentJob,
        runner: &RunnerConfig,
        workspace: &Path,
    ) -> Result<(), JobError> {
        if !runner.prompt_path.is_file() {
            return Err(JobError::Staging {
                job: job.name.clone(),
                path: runner.prompt_path.clone(),
            });
        }
        let default_name = runner
            .prompt_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned());
        let file_name = runner
            .prompt_filename
            .clone()
            .or(default_name)
            .ok_or_else(|| JobError::Staging {
                job: job.name.clone(),
                path: runner.prompt_path.clone(),
            })?;
        copy_file(&runner.prompt_path, &workspace.join(file_name)).map_err(|source| {
            JobError::StagingIo {
                job: job.name.clone(),
                source,
            }
        })
    }

    /// Copies `sources` into `dest_dir`, applying the rename map.
    fn stage_files(
        &self,
        job: &AgentJob,
        sources: &[PathBuf],
        rename: &BTreeMap<String, String>,
        dest_dir: &Path,
    ) -> Result<(), JobError> {
        fs::create_dir_all(dest_dir).map_err(|source| JobError::StagingIo {
            job: job.name.clone(),
            source,
        })?;
        for source_path in sources {
            if !source_path.is_file() {
                return Err(JobError::Staging {
                    job: job.name.clone(),
                    path: source_path.clone(),
                });
            }
            let original = source_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            let target_name = rename.get(&original).cloned().unwrap_or(original);
            copy_file(source_path, &dest_dir.join(target_name)).map_err(|source| {
                JobError::StagingIo {
                    job: job.name.clone(),
                    source,
                }
            })?;
        }
        Ok(())
    }

    /// Launches every runner as its own task and waits for all of them.
    /// One runner's failure never cancels or blocks its siblings.
    async fn launch_runners(&self, job: &AgentJob, workspace: &Path) -> BTreeMap<RunnerKind, i32> {
        let mut handles = Vec::with_capacity(job.runners.len());
        for runner in &job.runners {
            let invoker = Arc::clone(&self.invoker);
            let runner = runner.clone();
            let job_name = job.name.clone();
            let hooks = job.hooks.clone();
            let workspace = workspace.to_path_buf();
            let kind = runner.kind;
            let handle =
                tokio::spawn(
                    async move { launch_runner(invoker, job_name, runner, workspace, hooks).await },
                );
            handles.push((kind, handle));
        }

        let mut exit_codes = BTreeMap::new();
        for (kind, handle) in handles {
            let code = match handle.await {
                Ok(code) => code,
                Err(join_error) => {
                    error!(runner = %kind, error = %join_error, "Runner task panicked");
                    1
                }
            };
            exit_codes.insert(kind, code);
        }
        exit_codes
    }

    /// Moves the delivery map's files out of `output/`. Every source is
    /// verified before the first move, so a missing output means nothing
    /// was delivered.
    fn deliver(&self, job: &AgentJob, workspace: &Path) -> Result<Vec<PathBuf>, JobError> {
        let Some(deliver_dir) = &job.deliver_dir else {
            return Ok(Vec::new());
        };

        let output_dir = workspace.join(OUTPUT_DIR);
        if job.clean_markdown && output_dir.is_dir() {
            self.clean_markdown_outputs(job, &output_dir)?;
        }

        let deliver_dir = if deliver_dir.is_absolute() {
            deliver_dir.clone()
        } else {
            self.project_root.join(deliver_dir)
        };
        fs::create_dir_all(&deliver_dir).map_err(|source| JobError::DeliveryIo {
            job: job.name.clone(),
            source,
        })?;

        for src_name in job.deliver_rename.keys() {
            let source = output_dir.join(src_name);
            if !source.is_file() {
                return Err(JobError::MissingOutput {
                    job: job.name.clone(),
                    path: source,
                });
            }
        }

        let mut delivered = Vec::with_capacity(job.deliver_rename.len());
        for (src_name, target_name) in &job.deliver_rename {
            let source = output_dir.join(src_name);
            let destination = deliver_dir.join(target_name);
            move_file(&source, &destination).map_err(|source| JobError::DeliveryIo {
                job: job.name.clone(),
                source,
            })?;
            debug!(job = %job.name, delivered = %destination.display(), "Delivered output");
            delivered.push(destination);
        }
        Ok(delivered)
    }

    /// Runs the markdown cleaner over every top-level `.md` in `output/`.
    fn clean_markdown_outputs(&self, job: &AgentJob, output_dir: &Path) -> Result<(), JobError> {
        let entries = fs::read_dir(output_dir).map_err(|source| JobError::DeliveryIo {
            job: job.name.clone(),
            source,
        })?;
        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            let is_markdown = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("md"));
            if path.is_file() && is_markdown {
                markdown::clean_markdown_file(&path).map_err(|source| JobError::DeliveryIo {
                    job: job.name.clone(),
                    source,
                })?;
            }
        }
        Ok(())
    }
}

/// Runs one backend process, firing hooks around it, and returns the exit
/// code recorded for aggregation.
async fn launch_runner(
    invoker: Arc<dyn RunnerInvoker>,
    job_name: String,
    runner: RunnerConfig,
    workspace: PathBuf,
    hooks: Option<Arc<dyn JobHooks>>,
) -> i32 {
    if let Some(hooks) = &hooks {
        hooks.on_start(&job_name, &runner, &workspace);
    }

    match invoker.invoke(&runner, &workspace).await {
        Ok(()) => {
            if let Some(hooks) = &hooks {
                hooks.on_finish(&job_name, &runner, &workspace);
            }
            0
        }
        Err(invoke_error) => {
            warn!(
                job = %job_name,
                runner = %runner.kind,
                error = %invoke_error,
                "Runner failed"
            );
            if let Some(hooks) = &hooks {
                hooks.on_failure(&job_name, &runner, &workspace, &invoke_error);
            }
            invoke_error.exit_code()
        }
    }
}

/// Copies a file, creating the destination's parent directories and
/// replacing any existing file.
fn copy_file(source: &Path, destination: &Path) -> io::Result<()> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)?;
    }
    remove_existing(destination)?;
    fs::copy(source, destination)?;
    Ok(())
}

/// Moves a file, clobbering the destination and falling back to
/// copy-then-remove when rename crosses filesystems.
fn move_file(source: &Path, destination: &Path) -> io::Result<()> {
    remove_existing(destination)?;
    match fs::rename(source, destination) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(source, destination)?;
            fs::remove_file(source)
        }
    }
}

fn remove_existing(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_copy_file_creates_parents_and_replaces() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("a.txt");
        fs::write(&source, "new").unwrap();

        let destination = temp.path().join("nested/dir/b.txt");
        copy_file(&source, &destination).unwrap();
        assert_eq!(fs::read_to_string(&destination).unwrap(), "new");

        fs::write(&source, "newer").unwrap();
        copy_file(&source, &destination).unwrap();
        assert_eq!(fs::read_to_string(&destination).unwrap(), "newer");
        assert!(source.exists());
    }

    #[test]
    fn test_move_file_removes_source() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("out.md");
        fs::write(&source, "content").unwrap();

        let destination = temp.path().join("final.md");
        fs::write(&destination, "old").unwrap();

        move_file(&source, &destination).unwrap();
        assert!(!source.exists());
        assert_eq!(fs::read_to_string(&destination).unwrap(), "content");
    }
}
