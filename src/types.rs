//! Shared data-model types used across subsystem boundaries.
//!
//! Kept free of subsystem-specific logic so `watcher`, `registry`, `scanner`,
//! `pipeline`, and `broker` can all depend on this module without depending
//! on each other.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::SystemTime;

/// One parameter in a component's declaration. The type string is treated as
/// opaque by the scanner (`spec.md` §9, Open Question (a)).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub type_name: String,
    pub optional: bool,
}

/// Parsed metadata for a single component declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentInfo {
    pub name: String,
    pub package: String,
    pub file_path: PathBuf,
    pub parameters: Vec<Parameter>,
    pub references: Vec<String>,
    pub last_modified: SystemTime,
    pub content_hash: String,
    pub metadata: HashMap<String, String>,
}

impl ComponentInfo {
    /// Hash of this component's parameter list, used as a cache-key input so
    /// that adding/removing/reordering parameters invalidates the cache even
    /// if the file's raw bytes happen to hash the same (they never would in
    /// practice, but the cache key is defined independently of that).
    pub fn parameter_list_hash(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for param in &self.parameters {
            hasher.update(param.name.as_bytes());
            hasher.update(b"\0");
            hasher.update(param.type_name.as_bytes());
            hasher.update(&[param.optional as u8]);
        }
        hasher.finalize().to_hex().to_string()
    }
}

/// Kind of filesystem change observed for a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
    Renamed,
}

/// A single observed filesystem change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub sequence: u64,
    pub timestamp: SystemTime,
}

/// A deduplicated, ordered batch of changes flushed by the watcher's
/// debouncer. Each path appears at most once (latest kind wins).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeBatch {
    pub events: Vec<ChangeEvent>,
}

impl ChangeBatch {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }
}

/// Scheduling priority for a build task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Normal,
    High,
}

/// A unit of work enqueued for the build pipeline.
#[derive(Debug, Clone)]
pub struct BuildTask {
    pub component: ComponentInfo,
    pub priority: Priority,
    pub enqueued_at: SystemTime,
}

/// Classification of a build failure, mirrors the `Error` taxonomy entries
/// relevant to builds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildErrorKind {
    ToolchainMissing,
    ToolchainTimeout,
    CompileError,
    IoError,
    CacheCorrupt,
}

/// Outcome of compiling one component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildResult {
    pub component_name: String,
    pub success: bool,
    pub cached: bool,
    pub duration: std::time::Duration,
    pub stdout: String,
    pub stderr: String,
    pub error_kind: Option<BuildErrorKind>,
    pub artifact_hash: Option<String>,
}

/// A cached compilation outcome, keyed by content-addressed hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub artifact_hash: String,
    pub toolchain_version: String,
    pub compiled_at: SystemTime,
}

/// A change to the registry's index, delivered to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryChange {
    pub kind: RegistryChangeKind,
    pub name: String,
    pub package: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryChangeKind {
    Added,
    Updated,
    Removed,
}
