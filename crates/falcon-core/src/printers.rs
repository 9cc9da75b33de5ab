//! Graph printers - render the graph as a Makefile or a Graphviz document
//!
//! Both printers are visitors over the graph; out-of-date elements are
//! drawn red in the DOT output.

use crate::graph::{Graph, GraphVisitor, Node, NodeId, Rule, RuleId, State};

fn state_color(state: State) -> &'static str {
    match state {
        State::OutOfDate => "red",
        State::UpToDate => "black",
    }
}

#[derive(Default)]
struct MakefilePrinter {
    out: String,
}

impl GraphVisitor for MakefilePrinter {
    fn visit_graph(&mut self, _graph: &Graph) {}

    fn visit_node(&mut self, _graph: &Graph, _id: NodeId, _node: &Node) {}

    fn visit_rule(&mut self, graph: &Graph, _id: RuleId, rule: &Rule) {
        for &out in rule.outputs() {
            self.out.push_str(graph.node(out).path());
            self.out.push(' ');
        }
        self.out.push_str(": ");
        for &inp in rule.inputs() {
            self.out.push_str(graph.node(inp).path());
            self.out.push(' ');
        }
        self.out.push('\n');
        self.out.push('\t');
        self.out.push_str(rule.command());
        self.out.push('\n');
    }
}

/// Render every rule in Makefile syntax.
pub fn makefile(graph: &Graph) -> String {
    let mut printer = MakefilePrinter::default();
    graph.accept(&mut printer);
    printer.out
}

#[derive(Default)]
struct GraphvizPrinter {
    out: String,
}

impl GraphVisitor for GraphvizPrinter {
    fn visit_graph(&mut self, _graph: &Graph) {
        self.out.push_str("digraph falcon {\n");
        self.out.push_str("rankdir=\"LR\"\n");
        self.out.push_str("edge [fontsize=10, arrowhead=vee]\n");
    }

    fn visit_node(&mut self, _graph: &Graph, _id: NodeId, node: &Node) {
        self.out
            .push_str("node [fontsize=10, shape=box, height=0.25, style=filled]\n");
        self.out.push_str(&format!(
            "\"{}\" [label=\"{}\" color=\"{}\" fillcolor=\"white\"]\n",
            node.path(),
            node.path(),
            state_color(node.state()),
        ));
    }

    fn visit_rule(&mut self, graph: &Graph, id: RuleId, rule: &Rule) {
        let color = state_color(rule.state());
        let name = format!("rule_{}", id.0);
        self.out
            .push_str("node [fontsize=10, shape=point, height=0.25, style=filled]\n");
        self.out
            .push_str(&format!("\"{}\" [color=\"{}\"]\n", name, color));
        for &inp in rule.inputs() {
            self.out.push_str(&format!(
                "\"{}\" -> \"{}\" [color=\"{}\"]\n",
                graph.node(inp).path(),
                name,
                color,
            ));
        }
        for &out in rule.outputs() {
            self.out.push_str(&format!(
                "\"{}\" -> \"{}\" [color=\"{}\"]\n",
                name,
                graph.node(out).path(),
                color,
            ));
        }
    }
}

/// Render the graph as a DOT document.
pub fn graphviz(graph: &Graph) -> String {
    let mut printer = GraphvizPrinter::default();
    graph.accept(&mut printer);
    printer.out.push_str("}\n");
    printer.out
}
