//! Sequential builder - walks the dirty subgraph and runs commands in order
//!
//! Depth-first, left-to-right over inputs, one subprocess at a time. The
//! worker runs on its own task; interruption is a watch flag observed
//! between rules and inside the running subprocess's select loop.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::CacheManager;
use crate::graph::{Graph, NodeId, State};
use crate::process::{CommandStatus, StreamConsumer, SubProcess};

/// Final outcome of one build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildResult {
    Unknown,
    Succeeded,
    Interrupted,
    Failed,
}

impl BuildResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildResult::Unknown => "UNKNOWN",
            BuildResult::Succeeded => "SUCCEEDED",
            BuildResult::Interrupted => "INTERRUPTED",
            BuildResult::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for BuildResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sink for the lifecycle events of a build. The stream server implements
/// this; tests record the calls.
pub trait BuildEventSink: StreamConsumer {
    fn new_build(&self, build_id: u32);
    fn new_command(&self, cmd_id: u32, command: &str);
    fn end_command(&self, cmd_id: u32, status: CommandStatus);
    fn end_build(&self, result: BuildResult);
    /// A cache hit reported by the external cache collaborator. Appears in
    /// the stream in place of a command; the builder itself never emits it.
    fn cache_retrieve(&self, path: &str);
}

/// Builds a target set sequentially. One instance per build.
pub struct SequentialBuilder<S: BuildEventSink + 'static> {
    graph: Arc<Mutex<Graph>>,
    cache: Arc<CacheManager>,
    working_dir: PathBuf,
    sink: Arc<S>,
    interrupt: watch::Sender<bool>,
    next_cmd_id: AtomicU32,
    result: Mutex<BuildResult>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<S: BuildEventSink + 'static> SequentialBuilder<S> {
    pub fn new(
        graph: Arc<Mutex<Graph>>,
        cache: Arc<CacheManager>,
        working_dir: impl AsRef<Path>,
        sink: Arc<S>,
    ) -> Self {
        let (interrupt, _) = watch::channel(false);
        Self {
            graph,
            cache,
            working_dir: working_dir.as_ref().to_path_buf(),
            sink,
            interrupt,
            next_cmd_id: AtomicU32::new(0),
            result: Mutex::new(BuildResult::Unknown),
            handle: Mutex::new(None),
        }
    }

    /// Launch the build of `targets` on a worker task and return
    /// immediately. `end_build` is emitted right before `on_completed`
    /// runs.
    pub fn start_build(
        self: &Arc<Self>,
        targets: Vec<NodeId>,
        on_completed: impl FnOnce(BuildResult) + Send + 'static,
    ) {
        let builder = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let result = builder.run(targets).await;
            *builder.result.lock().unwrap() = result;
            builder.sink.end_build(result);
            on_completed(result);
        });
        *self.handle.lock().unwrap() = Some(handle);
    }

    /// Flag the build as interrupted and kill the running command, if any.
    pub fn interrupt(&self) {
        self.interrupt.send_replace(true);
    }

    /// Wait for the worker to finish.
    pub async fn wait(&self) {
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.await.ok();
        }
    }

    pub fn get_result(&self) -> BuildResult {
        *self.result.lock().unwrap()
    }

    fn interrupted(&self) -> bool {
        *self.interrupt.borrow()
    }

    async fn run(&self, targets: Vec<NodeId>) -> BuildResult {
        for target in targets {
            match self.build_node(target).await {
                Ok(BuildResult::Succeeded) => continue,
                Ok(other) => return other,
                Err(err) => {
                    warn!("build step failed: {:#}", err);
                    return BuildResult::Failed;
                }
            }
        }
        BuildResult::Succeeded
    }

    /// Build one node: build its inputs first, then run its producing rule.
    fn build_node(
        &self,
        id: NodeId,
    ) -> Pin<Box<dyn Future<Output = Result<BuildResult>> + Send + '_>> {
        Box::pin(async move {
            if self.interrupted() {
                return Ok(BuildResult::Interrupted);
            }

            let (state, producer) = {
                let graph = self.graph.lock().unwrap();
                (graph.node(id).state(), graph.node(id).producer())
            };
            if state == State::UpToDate {
                return Ok(BuildResult::Succeeded);
            }

            // A source has no rule to run: accept its current content, or
            // fail if there is nothing on disk to accept.
            let Some(rule_id) = producer else {
                return Ok(self.accept_source(id));
            };

            let (inputs, outputs, command, phony) = {
                let graph = self.graph.lock().unwrap();
                let rule = graph.rule(rule_id);
                (
                    rule.inputs().to_vec(),
                    rule.outputs().to_vec(),
                    rule.command().to_string(),
                    rule.is_phony(),
                )
            };

            for input in inputs {
                let result = self.build_node(input).await?;
                if result != BuildResult::Succeeded {
                    return Ok(result);
                }
            }

            if self.interrupted() {
                return Ok(BuildResult::Interrupted);
            }

            if phony {
                let cmd_id = self.next_cmd_id.fetch_add(1, Ordering::SeqCst);
                self.sink.new_command(cmd_id, "<phony>");
                self.sink.end_command(cmd_id, CommandStatus::Succeeded);
                let mut graph = self.graph.lock().unwrap();
                for &out in &outputs {
                    graph.mark_up_to_date(out);
                }
                return Ok(BuildResult::Succeeded);
            }

            let cmd_id = self.next_cmd_id.fetch_add(1, Ordering::SeqCst);
            self.sink.new_command(cmd_id, &command);

            let process = SubProcess::new(command, &self.working_dir, cmd_id);
            let mut interrupt_rx = self.interrupt.subscribe();
            let status = process.run(&*self.sink, &mut interrupt_rx).await?;

            self.sink.end_command(cmd_id, status);
            debug!("command {} finished: {}", cmd_id, status);

            match status {
                CommandStatus::Succeeded => {
                    self.refresh_outputs(&outputs)?;
                    Ok(BuildResult::Succeeded)
                }
                CommandStatus::Interrupted => Ok(BuildResult::Interrupted),
                CommandStatus::Failed | CommandStatus::Unknown => Ok(BuildResult::Failed),
            }
        })
    }

    /// Hash freshly built outputs, persist the hashes, and mark the nodes
    /// (and thereby their rule) up to date.
    fn refresh_outputs(&self, outputs: &[NodeId]) -> Result<()> {
        let mut graph = self.graph.lock().unwrap();
        for &out in outputs {
            let path = graph.node(out).path().to_string();
            let hash = self.cache.hash_file(self.working_dir.join(&path))?;
            self.cache.store_hash(&path, &hash)?;
            graph.node_mut(out).update_hash(hash);
            graph.mark_up_to_date(out);
        }
        Ok(())
    }

    fn accept_source(&self, id: NodeId) -> BuildResult {
        let mut graph = self.graph.lock().unwrap();
        let path = graph.node(id).path().to_string();
        let file = self.working_dir.join(&path);
        if file.exists() {
            match self.cache.hash_file(&file) {
                Ok(hash) => {
                    self.cache.store_hash(&path, &hash).ok();
                    graph.node_mut(id).update_hash(hash);
                }
                Err(err) => {
                    warn!("hashing source {}: {:#}", path, err);
                    return BuildResult::Failed;
                }
            }
        } else if graph.node(id).hash().is_none() {
            warn!("source {} does not exist", path);
            return BuildResult::Failed;
        }
        graph.mark_up_to_date(id);
        BuildResult::Succeeded
    }
}
