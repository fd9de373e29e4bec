//! Error types for the orchestrator subsystems.
//!
//! Defines typed errors for each stage of a job's lifecycle so callers can
//! branch on kind rather than message text:
//! - Workspace allocation
//! - Runner invocation
//! - Job execution (staging, aggregation, delivery)
//!
//! Teardown failures are deliberately absent: workspace cleanup is
//! best-effort and is reported through `tracing::warn!` so it can never
//! mask a job's real outcome.

use std::collections::BTreeMap;
use std::path::PathBuf;

use thiserror::Error;

use crate::job::RunnerKind;

/// Errors that can occur while allocating a workspace.
#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("Failed to create workspace root '{}': {source}", .path.display())]
    RootUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to scan workspace root '{}': {source}", .path.display())]
    ScanFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create workspace directory '{}': {source}", .path.display())]
    CreateFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors that can occur while invoking an external runner backend.
#[derive(Debug, Error)]
pub enum InvokerError {
    /// The backend binary could not be resolved. Distinct from a non-zero
    /// exit: the process never started.
    #[error("`{name}` not found on PATH; current PATH={path}")]
    ExecutableNotFound { name: String, path: String },

    /// The backend ran to completion and exited with a non-zero code.
    #[error("Runner exited with code {code}")]
    RunnerExit { code: i32 },

    #[error("Failed to launch `{name}`: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl InvokerError {
    /// Exit code recorded for aggregation: a non-zero exit keeps its code,
    /// anything that prevented the process from running counts as 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            InvokerError::RunnerExit { code } => *code,
            _ => 1,
        }
    }
}

/// Errors that can occur while executing an agent job.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Workspace allocation failed: {0}")]
    Allocation(#[from] AllocationError),

    /// A declared prompt, input, reference or output-seed file is missing.
    /// No runner was launched.
    #[error("Staging failed for job '{job}': source file not found: {}", .path.display())]
    Staging { job: String, path: PathBuf },

    #[error("Staging failed for job '{job}': {source}")]
    StagingIo {
        job: String,
        #[source]
        source: std::io::Error,
    },

    /// At least one runner exited non-zero. Carries every runner's exit
    /// code, so partial successes stay visible to the caller.
    #[error("Agent '{job}' failed: {}", format_failures(.exit_codes))]
    RunnersFailed {
        job: String,
        exit_codes: BTreeMap<RunnerKind, i32>,
    },

    /// An expected delivery source was absent after all runners succeeded.
    /// Nothing was moved.
    #[error("Delivery failed for job '{job}': expected output not found: {}", .path.display())]
    MissingOutput { job: String, path: PathBuf },

    #[error("Delivery failed for job '{job}': {source}")]
    DeliveryIo {
        job: String,
        #[source]
        source: std::io::Error,
    },
}

impl JobError {
    /// The per-runner exit codes, when this error carries them.
    pub fn exit_codes(&self) -> Option<&BTreeMap<RunnerKind, i32>> {
        match self {
            JobError::RunnersFailed { exit_codes, .. } => Some(exit_codes),
            _ => None,
        }
    }
}

fn format_failures(exit_codes: &BTreeMap<RunnerKind, i32>) -> String {
    let failures: Vec<String> = exit_codes
        .iter()
        .filter(|(_, code)| **code != 0)
        .map(|(kind, code)| format!("{kind}={code}"))
        .collect();
    failures.join(", ")
}
