//! # Mermaid Export
//!
//! Renders a dependency graph as a Mermaid `flowchart TD`. Node IDs are
//! renumbered `n0, n1, …` in element order, so output is deterministic for
//! a given graph and safe to paste into documentation.

use std::collections::HashMap;
use std::fmt::Write;

use crate::types::{Element, Graph};

/// Converts a graph to Mermaid flowchart syntax. Edge types become arrow
/// labels; an empty graph renders a single placeholder node.
pub fn to_mermaid(graph: &Graph) -> String {
    if graph.elements.is_empty() {
        return "flowchart TD\n  empty[\"empty graph\"]\n".to_string();
    }

    let mut safe_ids: HashMap<&str, String> = HashMap::new();
    let mut order: Vec<&str> = Vec::new();
    for element in &graph.elements {
        if let Element::Nodes { data } = element {
            if !safe_ids.contains_key(data.id.as_str()) {
                safe_ids.insert(&data.id, format!("n{}", order.len()));
                order.push(&data.id);
            }
        }
    }

    let mut out = String::with_capacity(4096);
    let _ = out.write_str("flowchart TD\n");

    for id in &order {
        let node = graph
            .elements
            .iter()
            .filter_map(Element::as_node)
            .find(|n| n.id == *id);
        let label = match node {
            Some(n) if !n.label.is_empty() => n.label.as_str(),
            _ => id,
        };
        let _ = writeln!(out, "  {}[\"{}\"]", safe_ids[*id], escape_label(label));
    }

    for element in &graph.elements {
        let Element::Edges { data } = element else {
            continue;
        };
        let (Some(src), Some(tgt)) = (
            safe_ids.get(data.source.as_str()),
            safe_ids.get(data.target.as_str()),
        ) else {
            continue;
        };
        let _ = writeln!(
            out,
            "  {src} -->|\"{}\"| {tgt}",
            escape_label(data.edge_type.as_str())
        );
    }

    out.trim_end_matches('\n').to_string()
}

/// Escapes backslashes and double quotes for use inside `"..."`.
fn escape_label(label: &str) -> String {
    label.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EdgeType, NodeType};

    fn sample_graph() -> Graph {
        let mut g = Graph::new();
        g.add_node(
            "github:o/r/overlay@main",
            NodeType::Overlay,
            "overlay",
            None,
            "https://github.com",
        );
        g.add_node(
            "github:o/r/base@main",
            NodeType::Resource,
            "base",
            None,
            "https://github.com",
        );
        g.add_node(
            "github:o/r/base/deploy.yaml@main",
            NodeType::Resource,
            "base/deploy.yaml",
            None,
            "https://github.com",
        );
        g.add_edge(
            "github:o/r/overlay@main",
            "github:o/r/base@main",
            EdgeType::Resource,
        );
        g.add_edge(
            "github:o/r/base@main",
            "github:o/r/base/deploy.yaml@main",
            EdgeType::Resource,
        );
        g
    }

    #[test]
    fn empty_graph_renders_placeholder() {
        assert_eq!(
            to_mermaid(&Graph::new()),
            "flowchart TD\n  empty[\"empty graph\"]\n"
        );
    }

    #[test]
    fn renders_nodes_then_edges() {
        let out = to_mermaid(&sample_graph());
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "flowchart TD");
        assert_eq!(lines[1], "  n0[\"overlay\"]");
        assert_eq!(lines[2], "  n1[\"base\"]");
        assert_eq!(lines[3], "  n2[\"base/deploy.yaml\"]");
        assert_eq!(lines[4], "  n0 -->|\"resource\"| n1");
        assert_eq!(lines[5], "  n1 -->|\"resource\"| n2");
        assert_eq!(lines.len(), 6);
    }

    #[test]
    fn deterministic_across_runs() {
        let g = sample_graph();
        assert_eq!(to_mermaid(&g), to_mermaid(&g));
    }

    #[test]
    fn labels_are_escaped() {
        let mut g = Graph::new();
        g.add_node("a", NodeType::Resource, "we\"ird\\path", None, "");
        let out = to_mermaid(&g);
        assert!(out.contains(r#"n0["we\"ird\\path"]"#));
    }

    #[test]
    fn edges_with_unknown_endpoints_are_dropped() {
        let mut g = Graph::new();
        g.add_node("a", NodeType::Overlay, "a", None, "");
        g.add_edge("a", "ghost", EdgeType::Resource);
        let out = to_mermaid(&g);
        assert!(!out.contains("ghost"));
        assert!(!out.contains("-->"));
    }
}
