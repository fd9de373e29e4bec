//! Runner invocation.
//!
//! [`RunnerInvoker`] is the seam between the executor and the external
//! backend processes: production code uses [`CliInvoker`], tests substitute
//! recording fakes. An invoker launches one process in a working directory
//! and reports how it exited — it never inspects the files the backend
//! produced; that is the caller's job.

pub mod cli;

use std::path::Path;

use async_trait::async_trait;

use crate::error::InvokerError;
use crate::job::RunnerConfig;

pub use cli::{resolve_executable, CliInvoker};

/// Launches one backend process and blocks until it exits.
#[async_trait]
pub trait RunnerInvoker: Send + Sync {
    /// Runs `runner` in `workdir`. `Ok(())` means exit code 0; a non-zero
    /// exit is [`InvokerError::RunnerExit`].
    async fn invoke(&self, runner: &RunnerConfig, workdir: &Path) -> Result<(), InvokerError>;
}
