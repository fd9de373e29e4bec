//! Workspace allocation and cleanup.
//!
//! A workspace is an ephemeral, exclusively-owned working directory for one
//! job invocation, identified by a monotonically increasing integer id.
//! [`WorkspaceAllocator`] hands them out collision-free; [`cleanup`]
//! removes them, tolerating read-only and locked entries.

pub mod allocator;
pub mod cleanup;

pub use allocator::WorkspaceAllocator;
