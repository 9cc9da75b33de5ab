//! Build description parser - JSON file into a wired Graph
//!
//! The description lists rules only; nodes are created on first mention.
//! An absent or empty `cmd` makes the rule phony.
//!
//! ```json
//! { "rules": [ { "inputs":  ["a.in"],
//!                "outputs": ["a.out"],
//!                "cmd":     "cat a.in > a.out" } ] }
//! ```

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::graph::Graph;

#[derive(Debug, Deserialize)]
struct GraphFile {
    rules: Vec<RuleEntry>,
}

#[derive(Debug, Deserialize)]
struct RuleEntry {
    inputs: Vec<String>,
    outputs: Vec<String>,
    #[serde(default)]
    cmd: String,
    #[serde(default)]
    depfile: Option<String>,
}

/// Parse a JSON build description and verify it forms a DAG.
pub fn parse_graph(text: &str) -> Result<Graph> {
    let file: GraphFile = serde_json::from_str(text).context("invalid graph description")?;

    let mut graph = Graph::new();
    for entry in file.rules {
        let inputs = entry.inputs.iter().map(|p| graph.add_node(p)).collect();
        let outputs = entry.outputs.iter().map(|p| graph.add_node(p)).collect();
        graph.add_rule(inputs, outputs, entry.cmd, entry.depfile)?;
    }
    graph.check_consistency()?;

    Ok(graph)
}

/// Load and parse the graph description at `path`.
pub fn load_graph_file(path: &Path) -> Result<Graph> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading graph file {}", path.display()))?;
    parse_graph(&text)
}
