//! Control API - newline-framed JSON over TCP
//!
//! One request per connection: read a JSON line, act on the daemon, write
//! a JSON line back. Clients needing more send more connections.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use crate::daemon::{DaemonInstance, DaemonStatus, StartBuildResult};

/// Request from a control client to the daemon.
#[derive(Debug, Serialize, Deserialize)]
pub enum ControlRequest {
    StartBuild,
    GetStatus,
    GetDirtySources,
    SetDirty { target: String },
    InterruptBuild,
    Shutdown,
    GetGraphviz,
}

/// Response from the daemon to a control client.
#[derive(Debug, Serialize, Deserialize)]
pub enum ControlResponse {
    Ok,
    Busy,
    Status(DaemonStatus),
    DirtySources(Vec<String>),
    Graphviz(String),
    Error(String),
}

/// Accept control clients until the daemon shuts down.
pub async fn serve(daemon: Arc<DaemonInstance>, listener: TcpListener) -> Result<()> {
    info!(
        "Control API listening on {}",
        listener.local_addr().context("control listener address")?
    );
    let mut shutdown = daemon.shutdown_signal();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, addr) = accepted.context("accept on control socket")?;
                debug!("control client connected: {}", addr);
                let daemon = Arc::clone(&daemon);
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(daemon, stream).await {
                        error!("control connection error: {:#}", err);
                    }
                });
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("control API stopping");
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_connection(daemon: Arc<DaemonInstance>, mut stream: TcpStream) -> Result<()> {
    let (reader, mut writer) = stream.split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    reader.read_line(&mut line).await?;

    let request: ControlRequest = serde_json::from_str(&line)?;
    debug!("Request: {:?}", request);
    let response = dispatch(&daemon, request);

    writer
        .write_all(serde_json::to_string(&response)?.as_bytes())
        .await?;
    writer.write_all(b"\n").await?;
    Ok(())
}

fn dispatch(daemon: &Arc<DaemonInstance>, request: ControlRequest) -> ControlResponse {
    match request {
        ControlRequest::StartBuild => match daemon.start_build() {
            StartBuildResult::Ok => ControlResponse::Ok,
            StartBuildResult::Busy => ControlResponse::Busy,
        },
        ControlRequest::GetStatus => ControlResponse::Status(daemon.get_status()),
        ControlRequest::GetDirtySources => {
            ControlResponse::DirtySources(daemon.get_dirty_sources())
        }
        ControlRequest::SetDirty { target } => match daemon.set_dirty(&target) {
            Ok(()) => ControlResponse::Ok,
            Err(err) => ControlResponse::Error(err.to_string()),
        },
        ControlRequest::InterruptBuild => {
            daemon.interrupt_build();
            ControlResponse::Ok
        }
        ControlRequest::Shutdown => {
            daemon.shutdown();
            ControlResponse::Ok
        }
        ControlRequest::GetGraphviz => ControlResponse::Graphviz(daemon.get_graphviz()),
    }
}
