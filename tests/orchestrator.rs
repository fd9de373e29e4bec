//! End-to-end orchestrator tests against a recording fake invoker.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use jobforge::{
    AgentJob, BatchExecutor, InvokerError, JobError, JobExecutor, JobHooks, RunnerConfig,
    RunnerInvoker, RunnerKind, WorkspaceAllocator,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// What a fake runner does when invoked: write files into the workspace,
/// then exit with the configured code.
#[derive(Clone, Default)]
struct Behavior {
    exit_code: i32,
    writes: Vec<(String, String)>,
}

impl Behavior {
    fn succeed() -> Self {
        Self::default()
    }

    fn exit(code: i32) -> Self {
        Self {
            exit_code: code,
            ..Self::default()
        }
    }

    fn writing(mut self, rel_path: &str, content: &str) -> Self {
        self.writes.push((rel_path.to_string(), content.to_string()));
        self
    }
}

/// Records every invocation and simulates backend behavior per kind.
#[derive(Default)]
struct FakeInvoker {
    behaviors: HashMap<RunnerKind, Behavior>,
    calls: Mutex<Vec<RunnerKind>>,
}

impl FakeInvoker {
    fn with_behavior(mut self, kind: RunnerKind, behavior: Behavior) -> Self {
        self.behaviors.insert(kind, behavior);
        self
    }

    fn calls(&self) -> Vec<RunnerKind> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RunnerInvoker for FakeInvoker {
    async fn invoke(&self, runner: &RunnerConfig, workdir: &Path) -> Result<(), InvokerError> {
        self.calls.lock().unwrap().push(runner.kind);

        let behavior = self.behaviors.get(&runner.kind).cloned().unwrap_or_default();
        for (rel_path, content) in &behavior.writes {
            let path = workdir.join(rel_path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(&path, content).unwrap();
        }

        if behavior.exit_code == 0 {
            Ok(())
        } else {
            Err(InvokerError::RunnerExit {
                code: behavior.exit_code,
            })
        }
    }
}

#[derive(Default)]
struct RecordingHooks {
    started: Mutex<Vec<RunnerKind>>,
    finished: Mutex<Vec<RunnerKind>>,
    failed: Mutex<Vec<(RunnerKind, i32)>>,
}

impl JobHooks for RecordingHooks {
    fn on_start(&self, _job: &str, runner: &RunnerConfig, _workspace: &Path) {
        self.started.lock().unwrap().push(runner.kind);
    }

    fn on_finish(&self, _job: &str, runner: &RunnerConfig, _workspace: &Path) {
        self.finished.lock().unwrap().push(runner.kind);
    }

    fn on_failure(&self, _job: &str, runner: &RunnerConfig, _workspace: &Path, error: &InvokerError) {
        self.failed.lock().unwrap().push((runner.kind, error.exit_code()));
    }
}

struct Fixture {
    _temp: TempDir,
    project_root: PathBuf,
    workspace_root: PathBuf,
    prompt: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let project_root = temp.path().join("project");
        let workspace_root = temp.path().join("agent_workspace");
        fs::create_dir_all(&project_root).unwrap();

        let prompt = project_root.join("prompt.md");
        fs::write(&prompt, "# Task\nDo the thing.\n").unwrap();

        Self {
            _temp: temp,
            project_root,
            workspace_root,
            prompt,
        }
    }

    fn executor(&self, invoker: Arc<dyn RunnerInvoker>) -> JobExecutor {
        let allocator = Arc::new(WorkspaceAllocator::new(&self.workspace_root));
        JobExecutor::new(allocator, invoker, &self.project_root)
    }

    /// Workspace directories still present under the root (the counter
    /// file does not count).
    fn leftover_workspaces(&self) -> usize {
        match fs::read_dir(&self.workspace_root) {
            Ok(entries) => entries
                .filter_map(Result::ok)
                .filter(|entry| entry.path().is_dir())
                .count(),
            Err(_) => 0,
        }
    }
}

#[tokio::test]
async fn test_successful_job_delivers_and_tears_down() {
    init_tracing();
    let fixture = Fixture::new();
    fs::write(fixture.project_root.join("a.png"), [0u8; 4]).unwrap();

    let invoker = Arc::new(FakeInvoker::default().with_behavior(
        RunnerKind::Codex,
        Behavior::succeed().writing("output/result.md", "\\( x \\) done\n"),
    ));
    let executor = fixture.executor(invoker.clone());

    let job = AgentJob::new("demo")
        .with_runner(RunnerConfig::new(RunnerKind::Codex, &fixture.prompt, "m1"))
        .with_input_file(fixture.project_root.join("a.png"))
        .with_deliver_dir("out")
        .with_delivery("result.md", "final.md");

    let result = executor.run(job).await.unwrap();

    let delivered = fixture.project_root.join("out").join("final.md");
    assert_eq!(result.delivered, vec![delivered.clone()]);
    assert_eq!(result.exit_codes.get(&RunnerKind::Codex), Some(&0));
    assert!(!result.workspace.exists());
    assert_eq!(fixture.leftover_workspaces(), 0);

    // Markdown cleanup ran before the move.
    assert_eq!(fs::read_to_string(&delivered).unwrap(), "$x$ done\n");
    assert_eq!(invoker.calls(), vec![RunnerKind::Codex]);
}

#[tokio::test]
async fn test_missing_input_fails_staging_and_never_invokes() {
    init_tracing();
    let fixture = Fixture::new();

    let invoker = Arc::new(FakeInvoker::default());
    let executor = fixture.executor(invoker.clone());

    let missing = fixture.project_root.join("absent.png");
    let job = AgentJob::new("demo")
        .with_runner(RunnerConfig::new(RunnerKind::Codex, &fixture.prompt, "m1"))
        .with_input_file(&missing);

    let error = executor.run(job).await.unwrap_err();
    match error {
        JobError::Staging { job, path } => {
            assert_eq!(job, "demo");
            assert_eq!(path, missing);
        }
        other => panic!("unexpected error: {other}"),
    }

    assert!(invoker.calls().is_empty());
    assert_eq!(fixture.leftover_workspaces(), 0);
}

#[tokio::test]
async fn test_missing_prompt_fails_staging_and_never_invokes() {
    init_tracing();
    let fixture = Fixture::new();

    let invoker = Arc::new(FakeInvoker::default());
    let executor = fixture.executor(invoker.clone());

    let job = AgentJob::new("demo").with_runner(RunnerConfig::new(
        RunnerKind::Codex,
        fixture.project_root.join("no_such_prompt.md"),
        "m1",
    ));

    assert!(matches!(
        executor.run(job).await.unwrap_err(),
        JobError::Staging { .. }
    ));
    assert!(invoker.calls().is_empty());
    assert_eq!(fixture.leftover_workspaces(), 0);
}

#[tokio::test]
async fn test_runner_failure_aggregates_and_siblings_still_finish() {
    init_tracing();
    let fixture = Fixture::new();

    let invoker = Arc::new(
        FakeInvoker::default()
            .with_behavior(RunnerKind::Codex, Behavior::exit(3))
            .with_behavior(
                RunnerKind::Gemini,
                Behavior::succeed().writing("output/summary.md", "fine\n"),
            ),
    );
    let hooks = Arc::new(RecordingHooks::default());
    let executor = fixture.executor(invoker.clone());

    let job = AgentJob::new("demo")
        .with_runner(RunnerConfig::new(RunnerKind::Codex, &fixture.prompt, "m1"))
        .with_runner(RunnerConfig::new(RunnerKind::Gemini, &fixture.prompt, "m2"))
        .with_deliver_dir("out")
        .with_delivery("summary.md", "summary.md")
        .with_hooks(hooks.clone());

    let error = executor.run(job).await.unwrap_err();
    match &error {
        JobError::RunnersFailed { job, exit_codes } => {
            assert_eq!(job, "demo");
            assert_eq!(exit_codes.get(&RunnerKind::Codex), Some(&3));
            assert_eq!(exit_codes.get(&RunnerKind::Gemini), Some(&0));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(error.to_string().contains("codex=3"));

    // Both runners launched; the succeeding sibling finished normally.
    let mut calls = invoker.calls();
    calls.sort();
    assert_eq!(calls, vec![RunnerKind::Codex, RunnerKind::Gemini]);
    assert_eq!(hooks.started.lock().unwrap().len(), 2);
    assert_eq!(*hooks.finished.lock().unwrap(), vec![RunnerKind::Gemini]);
    assert_eq!(*hooks.failed.lock().unwrap(), vec![(RunnerKind::Codex, 3)]);

    // Delivery was skipped entirely and the workspace is gone.
    assert!(!fixture.project_root.join("out").exists());
    assert_eq!(fixture.leftover_workspaces(), 0);
}

#[tokio::test]
async fn test_missing_delivery_source_moves_nothing() {
    init_tracing();
    let fixture = Fixture::new();

    let invoker = Arc::new(FakeInvoker::default().with_behavior(
        RunnerKind::Codex,
        Behavior::succeed().writing("output/present.md", "here\n"),
    ));
    let executor = fixture.executor(invoker);

    let job = AgentJob::new("demo")
        .with_runner(RunnerConfig::new(RunnerKind::Codex, &fixture.prompt, "m1"))
        .with_deliver_dir("out")
        .with_delivery("present.md", "kept.md")
        .with_delivery("missing.md", "lost.md");

    let error = executor.run(job).await.unwrap_err();
    assert!(matches!(error, JobError::MissingOutput { .. }));

    // Not even the file that did exist was moved.
    let deliver_dir = fixture.project_root.join("out");
    let moved = fs::read_dir(&deliver_dir)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(moved, 0);
    assert_eq!(fixture.leftover_workspaces(), 0);
}

#[tokio::test]
async fn test_job_without_deliver_dir_delivers_nothing() {
    init_tracing();
    let fixture = Fixture::new();

    let invoker = Arc::new(FakeInvoker::default().with_behavior(
        RunnerKind::Gemini,
        Behavior::succeed().writing("output/notes.md", "kept in workspace\n"),
    ));
    let executor = fixture.executor(invoker);

    let job = AgentJob::new("demo").with_runner(RunnerConfig::new(
        RunnerKind::Gemini,
        &fixture.prompt,
        "m2",
    ));

    let result = executor.run(job).await.unwrap();
    assert!(result.delivered.is_empty());
    assert_eq!(fixture.leftover_workspaces(), 0);
}

#[tokio::test]
async fn test_staging_applies_rename_maps() {
    init_tracing();
    let fixture = Fixture::new();
    fs::write(fixture.project_root.join("page1.png"), [0u8; 2]).unwrap();

    // The fake checks the staged layout from inside the workspace.
    struct LayoutCheck;
    #[async_trait]
    impl RunnerInvoker for LayoutCheck {
        async fn invoke(&self, _runner: &RunnerConfig, workdir: &Path) -> Result<(), InvokerError> {
            assert!(workdir.join("task.md").is_file());
            assert!(workdir.join("input").join("input_1.png").is_file());
            assert!(workdir.join("references").is_dir());
            assert!(workdir.join("output").is_dir());
            Ok(())
        }
    }

    let executor = fixture.executor(Arc::new(LayoutCheck));
    let job = AgentJob::new("demo")
        .with_runner(
            RunnerConfig::new(RunnerKind::Codex, &fixture.prompt, "m1")
                .with_prompt_filename("task.md"),
        )
        .with_input_file(fixture.project_root.join("page1.png"))
        .with_input_rename("page1.png", "input_1.png");

    executor.run(job).await.unwrap();
}

#[tokio::test]
async fn test_batch_completes_all_jobs_with_one_worker() {
    init_tracing();
    let fixture = Fixture::new();

    let invoker = Arc::new(FakeInvoker::default().with_behavior(
        RunnerKind::Codex,
        Behavior::succeed().writing("output/r.md", "ok\n"),
    ));
    let executor = Arc::new(fixture.executor(invoker));
    let batch = BatchExecutor::new(executor);

    let make_job = |name: &str, target: &str| {
        AgentJob::new(name)
            .with_runner(RunnerConfig::new(RunnerKind::Codex, &fixture.prompt, "m1"))
            .with_deliver_dir("out")
            .with_delivery("r.md", target)
    };

    let results = batch
        .run_batch(
            vec![make_job("first", "first.md"), make_job("second", "second.md")],
            Some(1),
        )
        .await;

    assert_eq!(results.len(), 2);
    let first = results[0].as_ref().unwrap();
    let second = results[1].as_ref().unwrap();
    assert_eq!(first.job.name, "first");
    assert_eq!(second.job.name, "second");

    // Each job got its own workspace id.
    assert_ne!(first.workspace, second.workspace);
    assert_eq!(fixture.leftover_workspaces(), 0);
    assert!(fixture.project_root.join("out").join("first.md").is_file());
    assert!(fixture.project_root.join("out").join("second.md").is_file());
}

#[tokio::test]
async fn test_batch_failure_stays_in_its_slot() {
    init_tracing();
    let fixture = Fixture::new();

    let invoker = Arc::new(FakeInvoker::default().with_behavior(
        RunnerKind::Gemini,
        Behavior::succeed().writing("output/r.md", "ok\n"),
    ));
    let executor = Arc::new(fixture.executor(invoker));
    let batch = BatchExecutor::new(executor);

    let failing = AgentJob::new("broken").with_runner(RunnerConfig::new(
        RunnerKind::Gemini,
        fixture.project_root.join("missing_prompt.md"),
        "m2",
    ));
    let healthy = AgentJob::new("healthy")
        .with_runner(RunnerConfig::new(RunnerKind::Gemini, &fixture.prompt, "m2"))
        .with_deliver_dir("out")
        .with_delivery("r.md", "r.md");

    let results = batch.run_batch(vec![failing, healthy], None).await;

    assert_eq!(results.len(), 2);
    assert!(matches!(results[0], Err(JobError::Staging { .. })));
    assert_eq!(results[1].as_ref().unwrap().job.name, "healthy");
    assert_eq!(fixture.leftover_workspaces(), 0);
}
