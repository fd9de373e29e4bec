//! Numbered workspace allocation.
//!
//! Hands out uniquely numbered working directories under a single root.
//! The next id is persisted in a `.counter` file; if that file is lost or
//! unreadable, the allocator recovers by scanning the numeric directory
//! names already on disk. Directory creation uses fail-if-exists
//! semantics, so even a concurrent external process can never be handed
//! the same directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::cleanup;
use crate::error::AllocationError;

/// Name of the counter file inside the workspace root.
const COUNTER_FILE: &str = ".counter";

/// Allocates uniquely numbered, collision-free working directories.
///
/// Ids are strictly increasing for the lifetime of the allocator. Stale
/// workspaces from a previous process are wiped the first time the
/// allocator touches the root. Construct one per workspace root and share
/// it (`Arc`) across executors; tests back it with a temp directory.
pub struct WorkspaceAllocator {
    root: PathBuf,
    state: Mutex<AllocatorState>,
}

#[derive(Default)]
struct AllocatorState {
    initialized: bool,
}

impl WorkspaceAllocator {
    /// Creates an allocator rooted at `root`. Nothing touches the
    /// filesystem until [`initialize`](Self::initialize) or
    /// [`allocate`](Self::allocate) runs.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            state: Mutex::new(AllocatorState::default()),
        }
    }

    /// Returns the workspace root path.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Ensures the workspace root exists and, on the first call, wipes any
    /// children left behind by a previous process. Idempotent.
    pub async fn initialize(&self) -> Result<(), AllocationError> {
        let mut state = self.state.lock().await;
        self.initialize_locked(&mut state)
    }

    /// Allocates a fresh workspace directory and returns its path.
    ///
    /// The id comes from the persisted counter, falling back to a scan of
    /// existing numeric directory names. On a create collision the next id
    /// is tried; the incremented counter is persisted once creation
    /// succeeds.
    pub async fn allocate(&self) -> Result<PathBuf, AllocationError> {
        let mut state = self.state.lock().await;
        self.initialize_locked(&mut state)?;

        let mut id = match self.read_counter() {
            Some(value) => value,
            None => self.scan_next_id()?,
        };

        let workspace = loop {
            let candidate = self.root.join(id.to_string());
            match fs::create_dir(&candidate) {
                Ok(()) => break candidate,
                Err(source) if source.kind() == io::ErrorKind::AlreadyExists => {
                    debug!(id, "Workspace id already taken; trying the next one");
                    id += 1;
                }
                Err(source) => {
                    return Err(AllocationError::CreateFailed {
                        path: candidate,
                        source,
                    });
                }
            }
        };

        self.write_counter(id + 1);
        debug!(id, workspace = %workspace.display(), "Allocated workspace");
        Ok(workspace)
    }

    fn initialize_locked(&self, state: &mut AllocatorState) -> Result<(), AllocationError> {
        if state.initialized {
            return Ok(());
        }
        fs::create_dir_all(&self.root).map_err(|source| AllocationError::RootUnavailable {
            path: self.root.clone(),
            source,
        })?;
        self.wipe_root();
        state.initialized = true;
        Ok(())
    }

    /// Best-effort removal of everything under the root, counter included.
    /// Locked entries are logged and skipped.
    fn wipe_root(&self) {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(error) => {
                warn!(root = %self.root.display(), %error, "Failed to list workspace root for reset");
                return;
            }
        };
        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            let result = if path.is_dir() {
                cleanup::remove_tree(&path)
            } else {
                cleanup::remove_file_forced(&path)
            };
            if let Err(error) = result {
                warn!(entry = %path.display(), %error, "Failed to remove stale workspace entry");
            }
        }
    }

    /// Reads the persisted counter. `None` when the file is absent,
    /// unreadable, or holds a non-positive value.
    fn read_counter(&self) -> Option<u64> {
        let raw = fs::read_to_string(self.root.join(COUNTER_FILE)).ok()?;
        let value = raw.trim().parse::<u64>().ok()?;
        (value > 0).then_some(value)
    }

    /// Recovers the next id by scanning numeric child directory names.
    fn scan_next_id(&self) -> Result<u64, AllocationError> {
        let entries = fs::read_dir(&self.root).map_err(|source| AllocationError::ScanFailed {
            path: self.root.clone(),
            source,
        })?;
        let mut max_id = 0;
        for entry in entries.filter_map(Result::ok) {
            if !entry.path().is_dir() {
                continue;
            }
            if let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u64>().ok())
            {
                max_id = max_id.max(id);
            }
        }
        Ok(max_id + 1)
    }

    /// Persists the counter. A failed write is logged only: scan recovery
    /// keeps ids correct, and the workspace already exists.
    fn write_counter(&self, next: u64) {
        let path = self.root.join(COUNTER_FILE);
        if let Err(error) = fs::write(&path, next.to_string()) {
            warn!(counter = %path.display(), %error, "Failed to persist workspace counter");
        }
    }
}
