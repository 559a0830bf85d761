//! # Graph Store
//!
//! In-memory store for finished graphs. Graphs are saved once, immutable
//! afterwards, and gone on restart. A reader/writer lock allows concurrent
//! readers; the only writer is `save_graph`.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{Error, Result};
use crate::types::{Graph, NodeDetails};

#[derive(Default)]
pub struct MemoryStore {
    graphs: RwLock<HashMap<String, Graph>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Saves a graph. The graph must already carry its ID.
    pub fn save_graph(&self, graph: Graph) -> Result<()> {
        if graph.id.is_empty() {
            return Err(Error::Internal("graph ID is required".into()));
        }
        let mut graphs = self
            .graphs
            .write()
            .map_err(|_| Error::Internal("graph store lock poisoned".into()))?;
        graphs.insert(graph.id.clone(), graph);
        Ok(())
    }

    pub fn get_graph(&self, id: &str) -> Result<Graph> {
        let graphs = self
            .graphs
            .read()
            .map_err(|_| Error::Internal("graph store lock poisoned".into()))?;
        graphs
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("graph not found: {id}")))
    }

    /// Node details (with parents/children) for one node of a stored graph.
    pub fn get_node(&self, graph_id: &str, node_id: &str) -> Result<NodeDetails> {
        let graphs = self
            .graphs
            .read()
            .map_err(|_| Error::Internal("graph store lock poisoned".into()))?;
        let graph = graphs
            .get(graph_id)
            .ok_or_else(|| Error::NotFound(format!("graph not found: {graph_id}")))?;
        graph
            .node_details(node_id)
            .ok_or_else(|| Error::NotFound(format!("node not found: {node_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EdgeType, NodeType};

    fn stored_graph() -> Graph {
        let mut g = Graph::new();
        g.id = "11111111-2222-3333-4444-555555555555".into();
        g.created = "2025-06-01T00:00:00Z".into();
        g.add_node("root", NodeType::Overlay, "overlay", None, "");
        g.add_node("base", NodeType::Resource, "base", None, "");
        g.add_edge("root", "base", EdgeType::Resource);
        g
    }

    #[test]
    fn save_and_get_round_trip() {
        let store = MemoryStore::new();
        let graph = stored_graph();
        let id = graph.id.clone();
        store.save_graph(graph).unwrap();

        let loaded = store.get_graph(&id).unwrap();
        assert_eq!(loaded.elements.len(), 3);
        assert!(matches!(
            store.get_graph("missing"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn save_requires_id() {
        let store = MemoryStore::new();
        assert!(store.save_graph(Graph::new()).is_err());
    }

    #[test]
    fn node_lookup_with_relations() {
        let store = MemoryStore::new();
        let graph = stored_graph();
        let id = graph.id.clone();
        store.save_graph(graph).unwrap();

        let details = store.get_node(&id, "base").unwrap();
        assert_eq!(details.parents, vec!["root"]);
        assert!(details.children.is_empty());

        assert!(matches!(
            store.get_node(&id, "ghost"),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            store.get_node("missing", "base"),
            Err(Error::NotFound(_))
        ));
    }
}
