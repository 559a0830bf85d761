//! # Graph Data Model
//!
//! Nodes, edges and the graph container produced by the overlay walker.
//!
//! Elements are kept in one ordered vector (nodes and edges interleaved in
//! visit order) and serialized in the cytoscape envelope the UI consumes:
//! `{"group": "nodes"|"edges", "data": {...}}`.
//!
//! Node identity is the canonical ID string:
//! - `github:owner/repo/path@ref` / `gitlab:owner/repo/path@ref`
//! - `local:path@ref`
//! - `error:<original reference>`
//!
//! The only permitted in-place mutation is upgrading an `error` node to a
//! concrete node once a later fetch for the same ID succeeds. A concrete
//! node is never downgraded.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Kind of a graph node. The entry point is always `Overlay`; descendants
/// take the kind of the edge that reached them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Overlay,
    Resource,
    Component,
    Error,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Overlay => "overlay",
            NodeType::Resource => "resource",
            NodeType::Component => "component",
            NodeType::Error => "error",
        }
    }
}

/// Kind of edge between two nodes, named after the kustomization list the
/// reference came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeType {
    Resource,
    Component,
    Patch,
}

impl EdgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeType::Resource => "resource",
            EdgeType::Component => "component",
            EdgeType::Patch => "patch",
        }
    }

    /// The node type a reference of this edge type produces.
    pub fn node_type(&self) -> NodeType {
        match self {
            EdgeType::Component => NodeType::Component,
            _ => NodeType::Resource,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeData {
    pub id: String,
    pub label: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub path: String,
    /// Parsed kustomization dictionary for concrete nodes; `{"error": msg}`
    /// for error nodes; absent for plain YAML leaves.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeData {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(rename = "edgeType")]
    pub edge_type: EdgeType,
}

/// A graph element: either a node or an edge, tagged by `group`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "group", rename_all = "lowercase")]
pub enum Element {
    Nodes { data: NodeData },
    Edges { data: EdgeData },
}

impl Element {
    pub fn as_node(&self) -> Option<&NodeData> {
        match self {
            Element::Nodes { data } => Some(data),
            Element::Edges { .. } => None,
        }
    }

    pub fn as_edge(&self) -> Option<&EdgeData> {
        match self {
            Element::Edges { data } => Some(data),
            Element::Nodes { .. } => None,
        }
    }
}

/// The complete dependency graph for one analyzed overlay stack.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Graph {
    pub id: String,
    pub created: String,
    pub elements: Vec<Element>,

    /// Node ID -> repo base URL (e.g. `https://gitlab.example.com`), used by
    /// the build endpoint and the CA collector. Empty for local nodes.
    #[serde(rename = "base_urls", default, skip_serializing_if = "HashMap::is_empty")]
    pub base_urls: HashMap<String, String>,

    /// Node ID -> local repository root, recorded for nodes that live in an
    /// external local repo (outside the entry repo root).
    #[serde(
        rename = "local_root_paths",
        default,
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub local_root_paths: HashMap<String, String>,

    /// Concatenated PEM of unique CA certs from all hosts in the stack.
    #[serde(rename = "ca_bundle", default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle: Option<String>,
    /// When the CA bundle is considered stale (RFC 3339).
    #[serde(
        rename = "ca_bundle_expires",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub ca_bundle_expires: Option<String>,
}

impl Graph {
    pub fn new() -> Self {
        Graph::default()
    }

    /// Look up a node by ID.
    pub fn node(&self, id: &str) -> Option<&NodeData> {
        self.elements
            .iter()
            .filter_map(Element::as_node)
            .find(|n| n.id == id)
    }

    /// Add a concrete node. If a node with the same ID already exists it is
    /// left alone, except that an `error` node is replaced in place (a later
    /// successful resolution wins over an earlier failed fetch; the element
    /// keeps its original position). The base URL mapping is refreshed either
    /// way.
    pub fn add_node(
        &mut self,
        id: &str,
        node_type: NodeType,
        path: &str,
        content: Option<serde_json::Value>,
        base_url: &str,
    ) {
        let data = NodeData {
            id: id.to_string(),
            label: short_label(path),
            node_type,
            path: path.to_string(),
            content,
        };

        for elem in &mut self.elements {
            if let Element::Nodes { data: existing } = elem {
                if existing.id == id {
                    if existing.node_type == NodeType::Error {
                        tracing::debug!(id, "replacing error node with concrete node");
                        *existing = data;
                    }
                    if !base_url.is_empty() {
                        self.base_urls.insert(id.to_string(), base_url.to_string());
                    }
                    return;
                }
            }
        }

        if !base_url.is_empty() {
            self.base_urls.insert(id.to_string(), base_url.to_string());
        }
        tracing::debug!(id, node_type = node_type.as_str(), "added node");
        self.elements.push(Element::Nodes { data });
    }

    /// Add an error node for a reference that could not be resolved. A no-op
    /// when any node with this ID already exists (an error never overwrites
    /// a concrete node, and the first error message wins).
    pub fn add_error_node(&mut self, id: &str, path: &str, message: &str, base_url: &str) {
        if self.node(id).is_some() {
            return;
        }
        if !base_url.is_empty() {
            self.base_urls.insert(id.to_string(), base_url.to_string());
        }
        tracing::debug!(id, message, "added error node");
        self.elements.push(Element::Nodes {
            data: NodeData {
                id: id.to_string(),
                label: short_label(path),
                node_type: NodeType::Error,
                path: path.to_string(),
                content: Some(serde_json::json!({ "error": message })),
            },
        });
    }

    /// Add an edge, deduplicated by its `source->target` ID.
    pub fn add_edge(&mut self, source: &str, target: &str, edge_type: EdgeType) {
        let edge_id = format!("{source}->{target}");
        let exists = self
            .elements
            .iter()
            .filter_map(Element::as_edge)
            .any(|e| e.id == edge_id);
        if exists {
            return;
        }
        self.elements.push(Element::Edges {
            data: EdgeData {
                id: edge_id,
                source: source.to_string(),
                target: target.to_string(),
                edge_type,
            },
        });
    }

    /// Node details for the node endpoint: the node itself plus the IDs of
    /// its parents (edges pointing to it) and children (edges leaving it).
    pub fn node_details(&self, node_id: &str) -> Option<NodeDetails> {
        let node = self.node(node_id)?;
        let mut parents = Vec::new();
        let mut children = Vec::new();
        for edge in self.elements.iter().filter_map(Element::as_edge) {
            if edge.target == node_id {
                parents.push(edge.source.clone());
            }
            if edge.source == node_id {
                children.push(edge.target.clone());
            }
        }
        Some(NodeDetails {
            id: node.id.clone(),
            label: node.label.clone(),
            node_type: node.node_type,
            path: node.path.clone(),
            content: node.content.clone(),
            parents,
            children,
        })
    }
}

/// Response shape for the node-details endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDetails {
    pub id: String,
    pub label: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub path: String,
    pub content: Option<serde_json::Value>,
    pub parents: Vec<String>,
    pub children: Vec<String>,
}

/// Max label length when the label spans multiple path segments.
const MAX_LABEL_MULTI: usize = 35;
/// Max label length for a single segment; filenames get more room so they
/// usually show in full.
const MAX_LABEL_SINGLE: usize = 50;

/// Short, readable label from a path: as many trailing segments as fit the
/// multi-segment limit, truncated with `...` when even one segment is too
/// long.
pub fn short_label(full_path: &str) -> String {
    let trimmed = full_path.trim_matches('/');
    let segs: Vec<&str> = trimmed.split('/').filter(|s| !s.is_empty()).collect();
    if segs.is_empty() {
        return "unknown".to_string();
    }

    let mut label = segs[segs.len() - 1].to_string();
    for n in 2..=segs.len() {
        let candidate = segs[segs.len() - n..].join("/");
        if candidate.len() <= MAX_LABEL_MULTI {
            label = candidate;
        } else {
            break;
        }
    }

    let max_len = if label.contains('/') {
        MAX_LABEL_MULTI
    } else {
        MAX_LABEL_SINGLE
    };
    if label.chars().count() > max_len {
        let head: String = label.chars().take(max_len - 3).collect();
        label = format!("{head}...");
    }
    label
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_label_cases() {
        let cases = [
            ("", "unknown"),
            ("base", "base"),
            ("overlay/base", "overlay/base"),
            ("/overlay/base/", "overlay/base"),
            (
                "openstackcontrolplane.yaml",
                "openstackcontrolplane.yaml",
            ),
            ("a/b/c/d/e", "a/b/c/d/e"),
            (
                "this_is_a_very_long_filename_that_exceeds_multi_limit.yaml",
                "this_is_a_very_long_filename_that_exceeds_multi...",
            ),
        ];
        for (path, want) in cases {
            assert_eq!(short_label(path), want, "short_label({path:?})");
        }
    }

    #[test]
    fn add_node_dedupes_by_id() {
        let mut g = Graph::new();
        g.add_node("a", NodeType::Overlay, "overlay", None, "https://x");
        g.add_node("a", NodeType::Resource, "overlay", None, "https://x");
        assert_eq!(g.elements.len(), 1);
        // First success wins: type stays overlay.
        assert_eq!(g.node("a").unwrap().node_type, NodeType::Overlay);
    }

    #[test]
    fn error_node_upgrades_to_concrete_in_place() {
        let mut g = Graph::new();
        g.add_node("first", NodeType::Overlay, "overlay", None, "");
        g.add_error_node("a", "base", "boom", "");
        g.add_node("last", NodeType::Resource, "x", None, "");

        g.add_node("a", NodeType::Resource, "base", None, "https://x");

        assert_eq!(g.elements.len(), 3);
        let node = g.node("a").unwrap();
        assert_eq!(node.node_type, NodeType::Resource);
        // Position preserved: still the second element.
        assert_eq!(g.elements[1].as_node().unwrap().id, "a");
        assert_eq!(g.base_urls.get("a").map(String::as_str), Some("https://x"));
    }

    #[test]
    fn error_never_overwrites_concrete() {
        let mut g = Graph::new();
        g.add_node("a", NodeType::Resource, "base", None, "");
        g.add_error_node("a", "base", "boom", "");
        assert_eq!(g.elements.len(), 1);
        assert_eq!(g.node("a").unwrap().node_type, NodeType::Resource);
    }

    #[test]
    fn edges_dedupe_by_id() {
        let mut g = Graph::new();
        g.add_edge("a", "b", EdgeType::Resource);
        g.add_edge("a", "b", EdgeType::Resource);
        g.add_edge("a", "b", EdgeType::Component);
        assert_eq!(g.elements.len(), 1);
    }

    #[test]
    fn node_details_collects_relations() {
        let mut g = Graph::new();
        g.add_node("root", NodeType::Overlay, "overlay", None, "");
        g.add_node("base", NodeType::Resource, "base", None, "");
        g.add_node("leaf", NodeType::Resource, "base/deploy.yaml", None, "");
        g.add_edge("root", "base", EdgeType::Resource);
        g.add_edge("base", "leaf", EdgeType::Resource);

        let details = g.node_details("base").unwrap();
        assert_eq!(details.parents, vec!["root"]);
        assert_eq!(details.children, vec!["leaf"]);
        assert!(g.node_details("missing").is_none());
    }

    #[test]
    fn element_wire_format() {
        let mut g = Graph::new();
        g.add_node("a", NodeType::Overlay, "overlay", None, "");
        g.add_edge("a", "a", EdgeType::Patch);
        let json = serde_json::to_value(&g.elements).unwrap();
        assert_eq!(json[0]["group"], "nodes");
        assert_eq!(json[0]["data"]["type"], "overlay");
        assert_eq!(json[1]["group"], "edges");
        assert_eq!(json[1]["data"]["edgeType"], "patch");
    }
}
