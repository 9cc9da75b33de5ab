//! Falcon - daemonized build system
//!
//! Startup sequence: parse the graph description, check it for cycles,
//! open the cache, scan for out-of-date nodes, then either print a module
//! (dot/make) and exit, run one sequential build, or serve the control API
//! and output stream.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

use falcon_core::builder::BuildResult;
use falcon_core::cache::CacheManager;
use falcon_core::graph::Graph;
use falcon_core::parser::load_graph_file;
use falcon_core::printers;
use falcon_core::scanner::DependencyScanner;
use falcon_daemon::daemon::{DaemonInstance, StartBuildResult};
use falcon_daemon::{api, watcher, FileWatcher};

/// Falcon - daemonized graph build system
#[derive(Parser)]
#[command(name = "falcon", version, about = "Daemonized graph build system")]
struct Cli {
    /// Working directory for builds (defaults to the current directory)
    #[arg(long, value_name = "DIR")]
    working_directory: Option<PathBuf>,

    /// Path of the JSON build description
    #[arg(long, default_value = "makefile.json")]
    graph: PathBuf,

    /// Control API port
    #[arg(long, default_value_t = 4242)]
    api_port: u16,

    /// Build output stream port
    #[arg(long, default_value_t = 4343)]
    stream_port: u16,

    /// Log level: trace, debug, info, warn, error
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Write logs to a file in this directory instead of stderr
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    /// Run one build and exit instead of serving the control API
    #[arg(long)]
    sequential_build: bool,

    /// Print the graph and exit: dot, make, or help
    #[arg(long, value_name = "MODULE")]
    module: Option<String>,
}

fn init_logging(cli: &Cli) -> Result<()> {
    let level: tracing::Level = cli
        .log_level
        .parse()
        .with_context(|| format!("invalid log level '{}'", cli.log_level))?;

    match &cli.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file = File::create(dir.join("falcon.log"))
                .with_context(|| format!("creating log file in {}", dir.display()))?;
            tracing_subscriber::fmt()
                .with_max_level(level)
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_max_level(level).init();
        }
    }
    Ok(())
}

fn run_module(module: &str, graph: &Graph) -> Result<()> {
    match module {
        "dot" => print!("{}", printers::graphviz(graph)),
        "make" => print!("{}", printers::makefile(graph)),
        "help" => {
            println!("list of available modules:");
            println!("  dot    show the graph in DOT format");
            println!("  make   show the graph in Makefile format");
        }
        other => bail!("module '{}' not supported", other),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    let working_dir = match &cli.working_directory {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("getting current directory")?,
    };
    let graph_path = if cli.graph.is_absolute() {
        cli.graph.clone()
    } else {
        working_dir.join(&cli.graph)
    };

    let mut graph = load_graph_file(&graph_path)?;
    info!(
        "Loaded graph: {} nodes, {} rules",
        graph.node_count(),
        graph.rule_count()
    );

    let falcon_dir = working_dir.join(".falcon");
    std::fs::create_dir_all(&falcon_dir)
        .with_context(|| format!("creating {}", falcon_dir.display()))?;
    let cache = CacheManager::open(&falcon_dir)?;

    DependencyScanner::new(&mut graph, &cache, &working_dir).scan()?;

    if let Some(module) = &cli.module {
        return run_module(module, &graph);
    }

    let daemon = DaemonInstance::new(graph, cache, working_dir.clone());

    let stream_listener = TcpListener::bind(("0.0.0.0", cli.stream_port))
        .await
        .with_context(|| format!("binding stream port {}", cli.stream_port))?;
    let stream = daemon.stream().clone();
    tokio::spawn(async move {
        if let Err(err) = stream.serve(stream_listener).await {
            error!("stream server failed: {:#}", err);
        }
    });

    let mut file_watcher = FileWatcher::new(&working_dir);
    file_watcher.start()?;
    tokio::spawn(watcher::run(daemon.clone(), file_watcher));

    if cli.sequential_build {
        println!("🔨 Building...");
        match daemon.start_build() {
            StartBuildResult::Ok => {}
            StartBuildResult::Busy => bail!("a build is already running"),
        }
        daemon.wait_for_build().await;
        let result = daemon.last_build_result();
        daemon.shutdown();
        println!("Build finished: {}", result);
        if result != BuildResult::Succeeded {
            std::process::exit(1);
        }
        return Ok(());
    }

    let api_listener = TcpListener::bind(("0.0.0.0", cli.api_port))
        .await
        .with_context(|| format!("binding API port {}", cli.api_port))?;
    println!("🚀 Falcon daemon up (api :{}, stream :{})", cli.api_port, cli.stream_port);
    api::serve(daemon, api_listener).await
}
