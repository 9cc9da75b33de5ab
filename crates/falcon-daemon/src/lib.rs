//! Falcon Daemon - Build Server
//!
//! The long-running half of falcon:
//! - Control API over TCP (start/interrupt builds, query dirty state)
//! - Stream server broadcasting each build's JSON log to subscribers
//! - File watcher feeding dirty-state updates into the graph

pub mod api;
pub mod daemon;
pub mod stream;
pub mod watcher;

pub use api::{ControlRequest, ControlResponse};
pub use daemon::{DaemonInstance, DaemonStatus, StartBuildResult};
pub use stream::StreamServer;
pub use watcher::FileWatcher;
