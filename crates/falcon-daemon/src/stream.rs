//! Build output stream server - broadcasts each build's JSON log over TCP
//!
//! One build is one JSON document, grown incrementally as the builder
//! emits events. Every subscriber gets the document from its first byte:
//! a client connecting mid-build catches up from the buffer, a client
//! connecting between builds waits for the next one. Each subscriber is
//! served by its own task, so a slow reader never stalls the others.
//!
//! No handshake, no framing: connect to the port, read the document,
//! connection closes when the build is over.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info};

use falcon_core::builder::{BuildEventSink, BuildResult};
use falcon_core::process::{CommandStatus, StreamConsumer};

/// The accumulated JSON document of one build.
struct BuildLog {
    id: u32,
    buf: Mutex<Vec<u8>>,
    completed: AtomicBool,
    /// Bumped on every append and on completion, to wake draining clients.
    progress: watch::Sender<usize>,
}

impl BuildLog {
    fn new(id: u32) -> Self {
        let (progress, _) = watch::channel(0);
        Self {
            id,
            buf: Mutex::new(Vec::new()),
            completed: AtomicBool::new(false),
            progress,
        }
    }

    fn append(&self, bytes: &[u8]) {
        let mut buf = self.buf.lock().unwrap();
        buf.extend_from_slice(bytes);
        self.progress.send_replace(buf.len());
    }

    fn complete(&self) {
        self.completed.store(true, Ordering::Release);
        self.progress.send_modify(|_| {});
    }

    fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Bytes not yet sent to a client at `offset`, if any.
    fn pending_from(&self, offset: usize) -> Option<Vec<u8>> {
        let buf = self.buf.lock().unwrap();
        if offset < buf.len() {
            Some(buf[offset..].to_vec())
        } else {
            None
        }
    }

    #[cfg(test)]
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buf.lock().unwrap()).into_owned()
    }
}

struct StreamState {
    current: Option<Arc<BuildLog>>,
    /// No `cmds` element written yet for the current build.
    first_chunk: bool,
}

struct StreamInner {
    state: Mutex<StreamState>,
    /// Publishes each new build to subscriber tasks.
    builds: watch::Sender<Option<Arc<BuildLog>>>,
    shutdown: watch::Sender<bool>,
}

/// Shared handle to the stream server. Cloning shares the same state.
#[derive(Clone)]
pub struct StreamServer {
    inner: Arc<StreamInner>,
}

impl Default for StreamServer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamServer {
    pub fn new() -> Self {
        let (builds, _) = watch::channel(None);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(StreamInner {
                state: Mutex::new(StreamState {
                    current: None,
                    first_chunk: true,
                }),
                builds,
                shutdown,
            }),
        }
    }

    /// Accept subscribers until `stop()` is called. An accept failure is
    /// fatal to the server; per-client failures only drop that client.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!(
            "Stream server listening on {}",
            listener.local_addr().context("stream listener address")?
        );
        let mut shutdown = self.inner.shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (socket, addr) = accepted.context("accept on stream socket")?;
                    debug!("stream subscriber connected: {}", addr);
                    let inner = Arc::clone(&self.inner);
                    tokio::spawn(async move {
                        if let Err(err) = serve_subscriber(inner, socket).await {
                            debug!("stream subscriber dropped: {:#}", err);
                        }
                    });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("stream server stopping");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Stop the accept loop and every subscriber task.
    pub fn stop(&self) {
        self.inner.shutdown.send_replace(true);
    }

    fn current(&self) -> Option<Arc<BuildLog>> {
        self.inner.state.lock().unwrap().current.clone()
    }

    /// Append a `cmds` element, inserting the separator unless it is the
    /// first one of the build.
    fn append_element(&self, element: &str) {
        let (log, first) = {
            let mut state = self.inner.state.lock().unwrap();
            let Some(log) = state.current.clone() else {
                return;
            };
            let first = state.first_chunk;
            state.first_chunk = false;
            (log, first)
        };
        if first {
            log.append(element.as_bytes());
        } else {
            log.append(format!(",\n{}", element).as_bytes());
        }
    }
}

/// A JSON string literal (quotes included) for arbitrary text.
fn json_string(text: &str) -> String {
    serde_json::to_string(text).unwrap_or_else(|_| "\"\"".to_string())
}

impl StreamConsumer for StreamServer {
    fn write_stdout(&self, cmd_id: u32, chunk: &[u8]) {
        let text = String::from_utf8_lossy(chunk);
        if let Some(log) = self.current() {
            log.append(
                format!(
                    ",\n    {{ \"id\": {}, \"stdout\": {} }}",
                    cmd_id,
                    json_string(&text)
                )
                .as_bytes(),
            );
        }
    }

    fn write_stderr(&self, cmd_id: u32, chunk: &[u8]) {
        let text = String::from_utf8_lossy(chunk);
        if let Some(log) = self.current() {
            log.append(
                format!(
                    ",\n    {{ \"id\": {}, \"stderr\": {} }}",
                    cmd_id,
                    json_string(&text)
                )
                .as_bytes(),
            );
        }
    }
}

impl BuildEventSink for StreamServer {
    fn new_build(&self, build_id: u32) {
        let log = Arc::new(BuildLog::new(build_id));
        log.append(format!("{{\n  \"id\": {},\n  \"cmds\": [\n", build_id).as_bytes());
        {
            let mut state = self.inner.state.lock().unwrap();
            state.current = Some(Arc::clone(&log));
            state.first_chunk = true;
        }
        self.inner.builds.send_replace(Some(log));
    }

    fn new_command(&self, cmd_id: u32, command: &str) {
        self.append_element(&format!(
            "    {{ \"id\": {}, \"cmd\": {} }}",
            cmd_id,
            json_string(command)
        ));
    }

    fn end_command(&self, cmd_id: u32, status: CommandStatus) {
        if let Some(log) = self.current() {
            log.append(
                format!(
                    ",\n    {{ \"id\": {}, \"status\": \"{}\" }}",
                    cmd_id,
                    status.as_str()
                )
                .as_bytes(),
            );
        }
    }

    fn end_build(&self, result: BuildResult) {
        if let Some(log) = self.current() {
            log.append(format!("\n  ],\n  \"result\": \"{}\"\n}}\n", result.as_str()).as_bytes());
            log.complete();
        }
    }

    fn cache_retrieve(&self, path: &str) {
        self.append_element(&format!("    {{ \"cache\": {} }}", json_string(path)));
    }
}

/// Stream one build document to one subscriber, then close.
async fn serve_subscriber(inner: Arc<StreamInner>, mut socket: TcpStream) -> Result<()> {
    let mut builds = inner.builds.subscribe();
    let mut shutdown = inner.shutdown.subscribe();

    // Pick the build to stream: the in-progress one, or the next to start.
    let log = loop {
        if let Some(log) = builds.borrow_and_update().clone() {
            if !log.is_completed() {
                break log;
            }
        }
        tokio::select! {
            changed = builds.changed() => {
                changed.context("stream server gone")?;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
        }
    };

    debug!("subscriber attached to build {}", log.id);
    let mut progress = log.progress.subscribe();
    let mut offset = 0usize;
    loop {
        match log.pending_from(offset) {
            Some(bytes) => {
                socket
                    .write_all(&bytes)
                    .await
                    .context("writing to subscriber")?;
                offset += bytes.len();
            }
            None if log.is_completed() => break,
            None => {
                tokio::select! {
                    changed = progress.changed() => {
                        changed.context("build log gone")?;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
    socket.shutdown().await.ok();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    fn sample_build(server: &StreamServer) {
        server.new_build(7);
        server.new_command(0, "echo hi");
        server.write_stdout(0, b"hi\n");
        server.end_command(0, CommandStatus::Succeeded);
        server.end_build(BuildResult::Succeeded);
    }

    #[test]
    fn test_document_layout() {
        let server = StreamServer::new();
        sample_build(&server);

        let doc = server.current().unwrap().contents();
        let expected = concat!(
            "{\n",
            "  \"id\": 7,\n",
            "  \"cmds\": [\n",
            "    { \"id\": 0, \"cmd\": \"echo hi\" },\n",
            "    { \"id\": 0, \"stdout\": \"hi\\n\" },\n",
            "    { \"id\": 0, \"status\": \"SUCCEEDED\" }\n",
            "  ],\n",
            "  \"result\": \"SUCCEEDED\"\n",
            "}\n",
        );
        assert_eq!(doc, expected);
    }

    #[test]
    fn test_document_parses_back() {
        let server = StreamServer::new();
        server.new_build(1);
        server.new_command(0, "echo \"quoted\"");
        server.write_stdout(0, b"line1\nline2");
        server.write_stderr(0, b"oops");
        server.end_command(0, CommandStatus::Failed);
        server.end_build(BuildResult::Failed);

        let doc = server.current().unwrap().contents();
        let value: serde_json::Value = serde_json::from_str(&doc).unwrap();
        assert_eq!(value["id"], 1);
        assert_eq!(value["result"], "FAILED");
        let cmds = value["cmds"].as_array().unwrap();
        assert_eq!(cmds.len(), 4);
        assert_eq!(cmds[0]["cmd"], "echo \"quoted\"");
        assert_eq!(cmds[1]["stdout"], "line1\nline2");
        assert_eq!(cmds[2]["stderr"], "oops");
        assert_eq!(cmds[3]["status"], "FAILED");
    }

    #[test]
    fn test_cache_element_and_empty_build() {
        let server = StreamServer::new();
        server.new_build(0);
        server.cache_retrieve("a.out");
        server.end_build(BuildResult::Succeeded);

        let doc = server.current().unwrap().contents();
        let value: serde_json::Value = serde_json::from_str(&doc).unwrap();
        assert_eq!(value["cmds"][0]["cache"], "a.out");

        server.new_build(1);
        server.end_build(BuildResult::Succeeded);
        let doc = server.current().unwrap().contents();
        let value: serde_json::Value = serde_json::from_str(&doc).unwrap();
        assert_eq!(value["cmds"].as_array().unwrap().len(), 0);
    }

    async fn start_server(server: &StreamServer) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = server.clone();
        tokio::spawn(async move { server.serve(listener).await });
        addr
    }

    async fn read_to_end(mut socket: TcpStream) -> String {
        let mut buf = Vec::new();
        socket.read_to_end(&mut buf).await.unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_full_document() {
        let server = StreamServer::new();
        let addr = start_server(&server).await;

        server.new_build(3);
        server.new_command(0, "slow");
        server.write_stdout(0, b"line1\n");

        // Connect mid-build.
        let socket = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        server.write_stdout(0, b"line2");
        server.end_command(0, CommandStatus::Succeeded);
        server.end_build(BuildResult::Succeeded);

        let doc = read_to_end(socket).await;
        let value: serde_json::Value = serde_json::from_str(&doc).unwrap();
        assert_eq!(value["id"], 3);
        let cmds = value["cmds"].as_array().unwrap();
        assert_eq!(cmds[1]["stdout"], "line1\n");
        assert_eq!(cmds[2]["stdout"], "line2");
    }

    #[tokio::test]
    async fn test_between_builds_subscriber_waits_for_next() {
        let server = StreamServer::new();
        let addr = start_server(&server).await;

        server.new_build(0);
        server.end_build(BuildResult::Succeeded);

        let socket = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        server.new_build(1);
        server.new_command(0, "echo next");
        server.end_command(0, CommandStatus::Succeeded);
        server.end_build(BuildResult::Succeeded);

        let doc = read_to_end(socket).await;
        let value: serde_json::Value = serde_json::from_str(&doc).unwrap();
        assert_eq!(value["id"], 1);
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_block_others() {
        let server = StreamServer::new();
        let addr = start_server(&server).await;

        server.new_build(5);
        server.new_command(0, "echo hi");

        // B connects but never reads.
        let _slow = TcpStream::connect(addr).await.unwrap();
        let fast = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        server.write_stdout(0, b"hi\n");
        server.end_command(0, CommandStatus::Succeeded);
        server.end_build(BuildResult::Succeeded);

        let doc = tokio::time::timeout(Duration::from_secs(5), read_to_end(fast))
            .await
            .expect("fast subscriber must not be blocked by the slow one");
        assert!(doc.contains("\"result\": \"SUCCEEDED\""));
    }

    #[tokio::test]
    async fn test_stop_ends_serve() {
        let server = StreamServer::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let run = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.stop();
        let result = tokio::time::timeout(Duration::from_secs(1), run)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
