//! End-to-end walker tests over injected mock fetchers.
//!
//! A mock registry maps `(owner/repo | root)` to a set of kustomization
//! documents keyed by directory path, so whole multi-repo stacks can be
//! described inline without touching any provider.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use kustomize_atlas::error::{Error, Result};
use kustomize_atlas::fetcher::Fetcher;
use kustomize_atlas::parser::{FetcherFactory, Parser};
use kustomize_atlas::repository::{RepoInfo, RepoKind};
use kustomize_atlas::types::{EdgeType, Element, Graph, NodeType};

struct MockFetcher {
    files: HashMap<String, String>,
    /// Paths that fail on their first lookup only (for upgrade tests).
    fail_once: Arc<Mutex<HashSet<String>>>,
}

impl MockFetcher {
    fn new(files: HashMap<String, String>) -> Self {
        MockFetcher {
            files,
            fail_once: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch_file(&self, path: &str) -> Result<Vec<u8>> {
        self.files
            .get(path.trim_matches('/'))
            .map(|c| c.as_bytes().to_vec())
            .ok_or_else(|| Error::NotFound(format!("file not found: {path}")))
    }

    async fn list_files(&self) -> Result<Vec<String>> {
        Ok(self.files.keys().cloned().collect())
    }

    async fn find_kustomization(&self, path: &str) -> Result<String> {
        let key = path.trim_matches('/');
        if self.fail_once.lock().unwrap().remove(key) {
            return Err(Error::Upstream(format!("transient failure for {key}")));
        }
        self.files
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no kustomization file found in path: {key}")))
    }
}

/// Registry of mock repositories, keyed like the walker's same-repo rule.
#[derive(Default, Clone)]
struct Registry {
    repos: HashMap<String, HashMap<String, String>>,
    fail_once: HashMap<String, HashSet<String>>,
}

fn repo_key(info: &RepoInfo) -> String {
    if info.kind == RepoKind::Local {
        info.root_path
            .as_ref()
            .map(|r| r.to_string_lossy().into_owned())
            .unwrap_or_default()
    } else {
        format!("{}/{}", info.owner, info.repo)
    }
}

impl Registry {
    fn add_repo(&mut self, key: &str, files: &[(&str, &str)]) {
        self.repos.insert(
            key.to_string(),
            files
                .iter()
                .map(|(p, c)| (p.to_string(), c.to_string()))
                .collect(),
        );
    }

    fn fail_once(&mut self, key: &str, path: &str) {
        self.fail_once
            .entry(key.to_string())
            .or_default()
            .insert(path.to_string());
    }

    fn fetcher_for(&self, info: &RepoInfo) -> Result<Arc<dyn Fetcher>> {
        let key = repo_key(info);
        let files = self
            .repos
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("unknown mock repo: {key}")))?;
        let fetcher = MockFetcher::new(files);
        if let Some(paths) = self.fail_once.get(&key) {
            fetcher.fail_once.lock().unwrap().extend(paths.iter().cloned());
        }
        Ok(Arc::new(fetcher))
    }

    fn factory(&self) -> FetcherFactory {
        let registry = self.clone();
        Box::new(move |repo, _token| registry.fetcher_for(repo))
    }
}

fn github_repo(owner: &str, repo: &str) -> RepoInfo {
    RepoInfo {
        kind: RepoKind::GitHub,
        owner: owner.into(),
        repo: repo.into(),
        git_ref: "main".into(),
        base_url: "https://github.com".into(),
        path: String::new(),
        ambiguous_suffix: String::new(),
        root_path: None,
    }
}

fn gitlab_repo(owner: &str, repo: &str) -> RepoInfo {
    RepoInfo {
        kind: RepoKind::GitLab,
        owner: owner.into(),
        repo: repo.into(),
        git_ref: "main".into(),
        base_url: "https://gitlab.com".into(),
        path: String::new(),
        ambiguous_suffix: String::new(),
        root_path: None,
    }
}

async fn walk(registry: &Registry, entry: RepoInfo, start_path: &str) -> Graph {
    let entry_fetcher = registry.fetcher_for(&entry).unwrap();
    let parser = Parser::with_factory(entry_fetcher, entry, registry.factory());
    parser.parse(start_path).await.unwrap()
}

fn nodes(graph: &Graph) -> Vec<&kustomize_atlas::types::NodeData> {
    graph.elements.iter().filter_map(Element::as_node).collect()
}

fn edges(graph: &Graph) -> Vec<&kustomize_atlas::types::EdgeData> {
    graph.elements.iter().filter_map(Element::as_edge).collect()
}

/// Every edge endpoint must exist among the graph's nodes.
fn assert_edges_closed(graph: &Graph) {
    let ids: HashSet<&str> = nodes(graph).iter().map(|n| n.id.as_str()).collect();
    for edge in edges(graph) {
        assert!(ids.contains(edge.source.as_str()), "dangling source {}", edge.source);
        assert!(ids.contains(edge.target.as_str()), "dangling target {}", edge.target);
    }
}

#[tokio::test]
async fn overlay_base_and_yaml_leaf() {
    let mut registry = Registry::default();
    registry.add_repo(
        "o/r",
        &[
            ("overlay", "resources:\n- ../base\n"),
            ("base", "resources:\n- deploy.yaml\n"),
        ],
    );

    let graph = walk(&registry, github_repo("o", "r"), "overlay").await;

    let nodes = nodes(&graph);
    assert_eq!(nodes.len(), 3);
    assert_eq!(edges(&graph).len(), 2);
    assert_edges_closed(&graph);

    let overlay = graph.node("github:o/r/overlay@main").unwrap();
    assert_eq!(overlay.node_type, NodeType::Overlay);
    let base = graph.node("github:o/r/base@main").unwrap();
    assert_eq!(base.node_type, NodeType::Resource);
    assert!(base.content.is_some());

    // The YAML leaf has no content and was never recursed into.
    let leaf = graph.node("github:o/r/base/deploy.yaml@main").unwrap();
    assert_eq!(leaf.node_type, NodeType::Resource);
    assert!(leaf.content.is_none());

    let edge_ids: Vec<&str> = edges(&graph).iter().map(|e| e.id.as_str()).collect();
    assert!(edge_ids.contains(&"github:o/r/overlay@main->github:o/r/base@main"));
    assert!(edge_ids.contains(&"github:o/r/base@main->github:o/r/base/deploy.yaml@main"));
    for edge in edges(&graph) {
        assert_eq!(edge.edge_type, EdgeType::Resource);
    }

    // Every non-local node carries its base URL.
    for node in &nodes {
        assert_eq!(
            graph.base_urls.get(&node.id).map(String::as_str),
            Some("https://github.com")
        );
    }
}

#[tokio::test]
async fn deprecated_bases_merge_into_resources() {
    let mut registry = Registry::default();
    registry.add_repo(
        "o/r",
        &[
            ("overlay", "bases:\n- ../base\n"),
            ("base", "resources: []\n"),
        ],
    );

    let graph = walk(&registry, github_repo("o", "r"), "overlay").await;
    let base = graph.node("github:o/r/base@main").unwrap();
    assert_eq!(base.node_type, NodeType::Resource);
    let edge = edges(&graph)[0];
    assert_eq!(edge.edge_type, EdgeType::Resource);
}

#[tokio::test]
async fn remote_component_with_nested_relative_uses_target_repo() {
    // GitLab entry pulls a GitHub component; that component's own `./nested`
    // must resolve against the GitHub repo, not the GitLab entry.
    let mut registry = Registry::default();
    registry.add_repo(
        "g/p",
        &[(
            "overlay",
            "components:\n- https://github.com/x/y//components/c?ref=v1\n",
        )],
    );
    registry.add_repo(
        "x/y",
        &[
            ("components/c", "components:\n- ./nested\n"),
            ("components/c/nested", "resources: []\n"),
        ],
    );

    let graph = walk(&registry, gitlab_repo("g", "p"), "overlay").await;
    assert_edges_closed(&graph);

    let component = graph.node("github:x/y/components/c@v1").unwrap();
    assert_eq!(component.node_type, NodeType::Component);
    let nested = graph.node("github:x/y/components/c/nested@v1").unwrap();
    assert_eq!(nested.node_type, NodeType::Component);

    for edge in edges(&graph) {
        assert_eq!(edge.edge_type, EdgeType::Component);
    }

    // Both component nodes were fetched from GitHub.
    assert_eq!(
        graph
            .base_urls
            .get("github:x/y/components/c@v1")
            .map(String::as_str),
        Some("https://github.com")
    );
    assert_eq!(
        graph
            .base_urls
            .get("github:x/y/components/c/nested@v1")
            .map(String::as_str),
        Some("https://github.com")
    );
}

#[tokio::test]
async fn cycles_are_cut() {
    let mut registry = Registry::default();
    registry.add_repo(
        "o/r",
        &[
            ("a", "resources:\n- ../b\n"),
            ("b", "resources:\n- ../a\n"),
        ],
    );

    let graph = walk(&registry, github_repo("o", "r"), "a").await;
    assert_eq!(nodes(&graph).len(), 2);
    assert_eq!(edges(&graph).len(), 2);
    assert_edges_closed(&graph);
}

#[tokio::test]
async fn diamond_expands_each_node_once() {
    let mut registry = Registry::default();
    registry.add_repo(
        "o/r",
        &[
            ("a", "resources:\n- ../b\n- ../c\n"),
            ("b", "resources:\n- ../d\n"),
            ("c", "resources:\n- ../d\n"),
            ("d", "resources: []\n"),
        ],
    );

    let graph = walk(&registry, github_repo("o", "r"), "a").await;
    assert_eq!(nodes(&graph).len(), 4);
    assert_eq!(edges(&graph).len(), 4);
    assert_edges_closed(&graph);
}

#[tokio::test]
async fn missing_directory_becomes_error_node() {
    let mut registry = Registry::default();
    registry.add_repo("o/r", &[("overlay", "resources:\n- ../nothere\n")]);

    let graph = walk(&registry, github_repo("o", "r"), "overlay").await;
    assert_edges_closed(&graph);

    let error_node = graph.node("github:o/r/nothere@main").unwrap();
    assert_eq!(error_node.node_type, NodeType::Error);
    let content = error_node.content.as_ref().unwrap();
    assert!(content["error"]
        .as_str()
        .unwrap()
        .contains("File not found or inaccessible"));

    // The edge from the parent is preserved.
    assert_eq!(edges(&graph).len(), 1);
}

#[tokio::test]
async fn invalid_child_yaml_becomes_error_node() {
    let mut registry = Registry::default();
    registry.add_repo(
        "o/r",
        &[
            ("overlay", "resources:\n- ../broken\n"),
            ("broken", "resources: {not: [a, list\n"),
        ],
    );

    let graph = walk(&registry, github_repo("o", "r"), "overlay").await;
    assert_edges_closed(&graph);
    let broken = graph.node("github:o/r/broken@main").unwrap();
    assert_eq!(broken.node_type, NodeType::Error);
}

#[tokio::test]
async fn entry_failure_is_fatal() {
    let mut registry = Registry::default();
    registry.add_repo("o/r", &[]);

    let entry = github_repo("o", "r");
    let fetcher = registry.fetcher_for(&entry).unwrap();
    let parser = Parser::with_factory(fetcher, entry, registry.factory());
    assert!(parser.parse("overlay").await.is_err());
}

#[tokio::test]
async fn error_node_upgrades_when_later_fetch_succeeds() {
    let mut registry = Registry::default();
    registry.add_repo(
        "o/r",
        &[
            ("overlay", "resources:\n- ../base\n- ../mid\n"),
            ("mid", "resources:\n- ../base\n"),
            ("base", "resources: []\n"),
        ],
    );
    // First lookup of base fails; the retry through mid succeeds.
    registry.fail_once("o/r", "base");

    let entry = github_repo("o", "r");
    // One shared entry fetcher so the fail-once state spans the whole walk.
    let entry_fetcher = registry.fetcher_for(&entry).unwrap();
    let parser = Parser::with_factory(entry_fetcher, entry, registry.factory());
    let graph = parser.parse("overlay").await.unwrap();

    assert_edges_closed(&graph);
    let base = graph.node("github:o/r/base@main").unwrap();
    assert_eq!(base.node_type, NodeType::Resource, "error node was upgraded");

    // Both edges into base exist.
    let edge_ids: Vec<&str> = edges(&graph).iter().map(|e| e.id.as_str()).collect();
    assert!(edge_ids.contains(&"github:o/r/overlay@main->github:o/r/base@main"));
    assert!(edge_ids.contains(&"github:o/r/mid@main->github:o/r/base@main"));
}

#[tokio::test]
async fn node_ids_are_unique() {
    let mut registry = Registry::default();
    registry.add_repo(
        "o/r",
        &[
            ("a", "resources:\n- ../b\n- ../b\n"),
            ("b", "resources: []\n"),
        ],
    );

    let graph = walk(&registry, github_repo("o", "r"), "a").await;
    let mut seen = HashSet::new();
    for node in nodes(&graph) {
        assert!(seen.insert(node.id.clone()), "duplicate node {}", node.id);
    }
    // Duplicate references produce one node and one edge.
    assert_eq!(nodes(&graph).len(), 2);
    assert_eq!(edges(&graph).len(), 1);
}
