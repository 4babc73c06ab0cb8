//! Templar change-propagation engine.
//!
//! Wires together the five subsystems that turn a filesystem edit into a
//! browser reload:
//!
//! - **Watcher** (`watcher`) — debounced, batched, backpressured filesystem
//!   change events.
//! - **Registry** (`registry`) — authoritative in-memory component index
//!   with a multi-subscriber change stream.
//! - **Scanner** (`scanner`) — parses component source files and upserts
//!   them into the registry.
//! - **Build pipeline** (`pipeline`) — content-addressed, cached, sandboxed
//!   compilation via an external generator/compiler toolchain.
//! - **Reload broker** (`broker`) — fans successful builds out to connected
//!   browser clients over WebSocket.
//!
//! ```text
//! Watcher ──ChangeBatch──▶ Scanner ──register──▶ Registry
//!                                                    │
//!                                          watch() changes
//!                                                    ▼
//!                                              Build Pipeline
//!                                                    │
//!                                             BuildResult
//!                                                    ▼
//!                                              Reload Broker ──▶ clients
//! ```
//!
//! Collaborators compose these independently — there is no required global
//! facade. A thin binary or test harness typically: scans the project once,
//! starts the watcher with a handler that re-scans changed files, registers
//! a pipeline callback that feeds the broker, and starts the broker's
//! listener.

pub mod broker;
pub mod config;
pub mod error;
pub mod paths;
pub mod pipeline;
pub mod pool;
pub mod registry;
pub mod scanner;
pub mod types;
pub mod watcher;

pub use broker::Broker;
pub use config::Config;
pub use error::{Error, Result};
pub use pipeline::{Pipeline, ToolchainPaths};
pub use registry::Registry;
pub use scanner::Scanner;
pub use watcher::Watcher;
