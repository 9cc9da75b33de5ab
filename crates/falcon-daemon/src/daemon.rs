//! Daemon instance - owns the graph, the current build, and the servers
//!
//! One coarse mutex protects the daemon bookkeeping; the graph lives under
//! its own shared mutex so the builder worker can take it per build step.
//! Control operations are all O(1) or O(sources) under a lock.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

use falcon_core::builder::{BuildResult, SequentialBuilder};
use falcon_core::cache::CacheManager;
use falcon_core::BuildEventSink;
use falcon_core::error::FalconError;
use falcon_core::graph::Graph;
use falcon_core::printers;

use crate::stream::StreamServer;

/// Reply of `start_build`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartBuildResult {
    Ok,
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DaemonStatus {
    Idle,
    Building,
}

struct Bookkeeping {
    build_id: u32,
    building: bool,
    builder: Option<Arc<SequentialBuilder<StreamServer>>>,
}

/// The falcon daemon. Shared by the control API, the watcher, and build
/// completion callbacks.
pub struct DaemonInstance {
    graph: Arc<Mutex<Graph>>,
    cache: Arc<CacheManager>,
    working_dir: PathBuf,
    stream: StreamServer,
    state: Mutex<Bookkeeping>,
    shutdown: watch::Sender<bool>,
}

impl DaemonInstance {
    pub fn new(graph: Graph, cache: CacheManager, working_dir: PathBuf) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            graph: Arc::new(Mutex::new(graph)),
            cache: Arc::new(cache),
            working_dir,
            stream: StreamServer::new(),
            state: Mutex::new(Bookkeeping {
                build_id: 0,
                building: false,
                builder: None,
            }),
            shutdown,
        })
    }

    pub fn stream(&self) -> &StreamServer {
        &self.stream
    }

    pub fn graph(&self) -> &Arc<Mutex<Graph>> {
        &self.graph
    }

    /// Fires when `shutdown()` runs.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Start building the graph roots. `Busy` while a previous build's
    /// completion has not come back yet.
    pub fn start_build(self: &Arc<Self>) -> StartBuildResult {
        let mut state = self.state.lock().unwrap();
        if state.building {
            return StartBuildResult::Busy;
        }
        state.building = true;

        let build_id = state.build_id;
        info!("Starting build {}", build_id);
        self.stream.new_build(build_id);

        let targets = self.graph.lock().unwrap().roots();
        let builder = Arc::new(SequentialBuilder::new(
            Arc::clone(&self.graph),
            Arc::clone(&self.cache),
            &self.working_dir,
            Arc::new(self.stream.clone()),
        ));

        let daemon = Arc::clone(self);
        builder.start_build(targets, move |result| daemon.on_build_completed(result));
        state.builder = Some(builder);

        StartBuildResult::Ok
    }

    fn on_build_completed(&self, result: BuildResult) {
        let mut state = self.state.lock().unwrap();
        state.building = false;
        state.build_id += 1;
        info!("Build completed: {}", result);
    }

    pub fn get_status(&self) -> DaemonStatus {
        if self.state.lock().unwrap().building {
            DaemonStatus::Building
        } else {
            DaemonStatus::Idle
        }
    }

    /// Paths of the source nodes currently out of date.
    pub fn get_dirty_sources(&self) -> Vec<String> {
        let graph = self.graph.lock().unwrap();
        let mut sources: Vec<String> = graph
            .sources()
            .into_iter()
            .filter(|&id| graph.node(id).is_dirty())
            .map(|id| graph.node(id).path().to_string())
            .collect();
        sources.sort();
        sources
    }

    /// Mark a node (and its transitive dependents) out of date.
    pub fn set_dirty(&self, target: &str) -> Result<(), FalconError> {
        let mut graph = self.graph.lock().unwrap();
        let id = graph
            .node_by_path(target)
            .ok_or_else(|| FalconError::TargetNotFound(target.to_string()))?;
        graph.mark_dirty(id);
        Ok(())
    }

    /// Interrupt the build in progress, if any.
    pub fn interrupt_build(&self) {
        let builder = self.state.lock().unwrap().builder.clone();
        if let Some(builder) = builder {
            builder.interrupt();
        }
    }

    /// Wait for the build in progress to finish.
    pub async fn wait_for_build(&self) {
        let builder = self.state.lock().unwrap().builder.clone();
        if let Some(builder) = builder {
            builder.wait().await;
        }
    }

    /// Result of the most recent build.
    pub fn last_build_result(&self) -> BuildResult {
        let builder = self.state.lock().unwrap().builder.clone();
        builder
            .map(|b| b.get_result())
            .unwrap_or(BuildResult::Unknown)
    }

    pub fn get_graphviz(&self) -> String {
        printers::graphviz(&self.graph.lock().unwrap())
    }

    /// Interrupt the running build, stop the stream server, and signal the
    /// run loops to exit.
    pub fn shutdown(&self) {
        info!("Shutting down");
        self.interrupt_build();
        self.stream.stop();
        self.shutdown.send_replace(true);
    }
}
