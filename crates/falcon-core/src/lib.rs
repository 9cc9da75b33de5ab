//! Falcon Core - Graph Build Engine
//!
//! The heart of the falcon build daemon:
//! - Arena-backed dependency graph with dirty-state propagation
//! - JSON build description parser with consistency checking
//! - Dependency scanner comparing BLAKE3 hashes across runs
//! - Sequential builder driving one subprocess at a time
//! - Persistent hash/artifact cache (sled)
//! - Makefile and Graphviz printers

pub mod builder;
pub mod cache;
pub mod error;
pub mod graph;
pub mod hasher;
pub mod parser;
pub mod printers;
pub mod process;
pub mod scanner;

pub use builder::{BuildEventSink, BuildResult, SequentialBuilder};
pub use cache::CacheManager;
pub use error::FalconError;
pub use graph::{Graph, GraphVisitor, Node, NodeId, Rule, RuleId, State};
pub use process::{CommandStatus, StreamConsumer, SubProcess};
pub use scanner::DependencyScanner;
