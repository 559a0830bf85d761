//! # Overlay Walker
//!
//! Recursively expands a kustomization into the dependency graph.
//!
//! ## Walking rules
//!
//! - The entry node is an `overlay`; every descendant takes the type of the
//!   edge that reached it (`resources`/`bases` → resource, `components` →
//!   component). Plain `.yaml`/`.yml` entries become resource leaves and are
//!   never recursed into.
//! - A node ID is visited-marked on first expansion; meeting it again
//!   short-circuits, which cuts reference cycles.
//! - Fetcher selection per hop: a relative reference inside the entry repo
//!   reuses the entry fetcher; a relative reference inside a *different*
//!   repo gets a fetcher for that repo (with the token for its kind); a
//!   remote reference gets a fresh fetcher built from the target info. This
//!   matters when, say, a GitLab entry pulls a GitHub component whose own
//!   kustomization says `./nodeset`: that path must resolve against GitHub.
//! - A relative reference that escapes a local repository root is
//!   re-validated and re-detected as an external local repo; its root is
//!   recorded on the graph so the build endpoint can find it again.
//! - Failed references localize as error nodes (the edge from the parent is
//!   kept); only a failure at the entry kustomization aborts the parse.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use path_clean::PathClean;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::fetcher::{self, Fetcher};
use crate::reference::{self, ReferenceKind};
use crate::repository::{self, RepoInfo, RepoKind};
use crate::types::{EdgeType, Graph, NodeType};
use crate::validation;

/// A `kustomization.yaml` document, reduced to the lists the walker follows.
#[derive(Debug, Default, Deserialize)]
pub struct Kustomization {
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub components: Vec<String>,
    #[serde(default)]
    pub patches: Vec<serde_yaml::Value>,

    /// Deprecated upstream but still common; merged into resources.
    #[serde(default)]
    pub bases: Vec<String>,
}

/// Builds a fetcher for a repo and token. Injectable so tests can supply
/// mock fetchers instead of hitting providers.
pub type FetcherFactory =
    Box<dyn Fn(&RepoInfo, &str) -> Result<Arc<dyn Fetcher>> + Send + Sync>;

/// One parse run: entry repo, per-kind tokens, visited set and the graph
/// being accumulated. Single-task by design, so element order is the DFS
/// visit order.
pub struct Parser {
    fetcher: Arc<dyn Fetcher>,
    repo_info: RepoInfo,
    tokens: HashMap<RepoKind, String>,
    graph: Graph,
    visited: HashSet<String>,
    factory: FetcherFactory,
}

impl Parser {
    pub fn new(fetcher: Arc<dyn Fetcher>, repo_info: RepoInfo) -> Self {
        Parser::with_factory(
            fetcher,
            repo_info,
            Box::new(|repo, token| fetcher::new_fetcher(repo, token).map(Arc::from)),
        )
    }

    /// Like [`Parser::new`] but with an injected fetcher factory (tests).
    pub fn with_factory(
        fetcher: Arc<dyn Fetcher>,
        repo_info: RepoInfo,
        factory: FetcherFactory,
    ) -> Self {
        Parser {
            fetcher,
            repo_info,
            tokens: HashMap::new(),
            graph: Graph::new(),
            visited: HashSet::new(),
            factory,
        }
    }

    /// Sets the authentication token used for repositories of `kind`.
    pub fn set_token(&mut self, kind: RepoKind, token: &str) {
        if !token.is_empty() {
            self.tokens.insert(kind, token.to_string());
        }
    }

    fn token(&self, kind: RepoKind) -> String {
        self.tokens.get(&kind).cloned().unwrap_or_default()
    }

    /// Parses from the initial path and returns the finished graph. Failing
    /// to fetch or parse the entry kustomization is fatal; everything below
    /// it degrades to error nodes.
    pub async fn parse(mut self, start_path: &str) -> Result<Graph> {
        info!(path = start_path, repo = %self.repo_info, "starting parse");

        let content = self.fetcher.find_kustomization(start_path).await?;

        let node_id = build_node_id(&self.repo_info, start_path);
        let entry_repo = self.repo_info.clone();
        self.process_kustomization(
            node_id,
            content,
            start_path.to_string(),
            entry_repo,
            NodeType::Overlay,
        )
        .await?;

        info!(elements = self.graph.elements.len(), "graph built");
        Ok(self.graph)
    }

    fn process_kustomization<'a>(
        &'a mut self,
        node_id: String,
        content: String,
        current_path: String,
        current_repo: RepoInfo,
        node_type: NodeType,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            // Cycle cutoff: expand every node ID at most once per parse.
            if !self.visited.insert(node_id.clone()) {
                debug!(id = %node_id, "already visited");
                return Ok(());
            }

            debug!(id = %node_id, node_type = node_type.as_str(), "processing kustomization");

            // An empty document is a valid (if useless) kustomization.
            let kust: Kustomization = if content.trim().is_empty() {
                Kustomization::default()
            } else {
                match serde_yaml::from_str(&content) {
                    Ok(kust) => kust,
                    Err(err) => {
                        if node_type == NodeType::Overlay {
                            return Err(Error::Parse(format!(
                                "failed to parse kustomization YAML: {err}"
                            )));
                        }
                        // A descendant with broken YAML degrades to an error
                        // node so the edge that reached it keeps a real
                        // endpoint.
                        self.graph.add_error_node(
                            &node_id,
                            &current_path,
                            &format!("failed to parse kustomization YAML: {err}"),
                            &current_repo.base_url,
                        );
                        return Ok(());
                    }
                }
            };

            self.graph.add_node(
                &node_id,
                node_type,
                &current_path,
                Some(kustomization_content(&kust)),
                &current_repo.base_url,
            );

            // bases: is deprecated sugar for resources:.
            let all_resources: Vec<String> = kust
                .resources
                .iter()
                .chain(kust.bases.iter())
                .cloned()
                .collect();

            for resource in &all_resources {
                if let Err(err) = self
                    .process_resource(&node_id, resource, &current_path, &current_repo)
                    .await
                {
                    warn!(resource = %resource, error = %err, "failed to process resource");
                }
            }

            for component in &kust.components {
                if let Err(err) = self
                    .process_reference(
                        &node_id,
                        component,
                        EdgeType::Component,
                        &current_path,
                        &current_repo,
                    )
                    .await
                {
                    warn!(component = %component, error = %err, "failed to process component");
                }
            }

            Ok(())
        })
    }

    /// Handles one `resources`/`bases` entry: plain YAML files become leaf
    /// nodes, everything else is a kustomization reference.
    async fn process_resource(
        &mut self,
        parent_id: &str,
        resource: &str,
        current_path: &str,
        current_repo: &RepoInfo,
    ) -> Result<()> {
        if is_yaml_file(resource) {
            let resource_path = resolve_path(current_path, resource);
            let resource_id = build_node_id(current_repo, &resource_path);
            self.graph.add_node(
                &resource_id,
                NodeType::Resource,
                &resource_path,
                None,
                &current_repo.base_url,
            );
            self.graph
                .add_edge(parent_id, &resource_id, EdgeType::Resource);
            return Ok(());
        }

        self.process_reference(
            parent_id,
            resource,
            EdgeType::Resource,
            current_path,
            current_repo,
        )
        .await
    }

    /// Handles a directory or remote reference: resolves the target repo and
    /// path, picks the right fetcher, fetches the child kustomization and
    /// recurses. All failures localize as error nodes.
    async fn process_reference(
        &mut self,
        parent_id: &str,
        raw_ref: &str,
        edge_type: EdgeType,
        current_path: &str,
        current_repo: &RepoInfo,
    ) -> Result<()> {
        debug!(reference = raw_ref, edge_type = edge_type.as_str(), "processing reference");

        let token = self.token(current_repo.kind);
        let parsed = match reference::parse_reference(raw_ref, &token).await {
            Ok(parsed) => parsed,
            Err(err) => {
                let child_id = format!("error:{raw_ref}");
                self.graph.add_error_node(
                    &child_id,
                    raw_ref,
                    &format!("Failed to parse reference: {err}"),
                    &current_repo.base_url,
                );
                self.graph.add_edge(parent_id, &child_id, edge_type);
                return Ok(());
            }
        };

        let (child_repo, child_path, child_fetcher) = match parsed.kind {
            ReferenceKind::Relative => {
                match self
                    .resolve_relative(&parsed.relative_path, current_path, current_repo)
                    .await
                {
                    Ok(resolved) => resolved,
                    Err((path, err)) => {
                        let child_id = build_node_id(current_repo, &path);
                        self.graph.add_error_node(
                            &child_id,
                            &path,
                            &err.to_string(),
                            &current_repo.base_url,
                        );
                        self.graph.add_edge(parent_id, &child_id, edge_type);
                        return Ok(());
                    }
                }
            }
            ReferenceKind::Remote => {
                let child_repo = parsed
                    .repo_info
                    .ok_or_else(|| Error::Internal("remote reference without repo info".into()))?;
                let child_path = parsed.path.clone();
                let token = self.token(child_repo.kind);
                match (self.factory)(&child_repo, &token) {
                    Ok(f) => (child_repo, child_path, f),
                    Err(err) => {
                        let child_id = build_node_id(&child_repo, &child_path);
                        self.graph.add_error_node(
                            &child_id,
                            &child_path,
                            &format!("Failed to create fetcher: {err}"),
                            &child_repo.base_url,
                        );
                        self.graph.add_edge(parent_id, &child_id, edge_type);
                        return Ok(());
                    }
                }
            }
        };

        let child_id = build_node_id(&child_repo, &child_path);

        // Nodes in external local repos remember their root so the build
        // endpoint can reach them later.
        if child_repo.kind == RepoKind::Local && !same_repo(&self.repo_info, &child_repo) {
            if let Some(root) = &child_repo.root_path {
                self.graph
                    .local_root_paths
                    .insert(child_id.clone(), root.to_string_lossy().into_owned());
            }
        }

        let content = match child_fetcher.find_kustomization(&child_path).await {
            Ok(content) => content,
            Err(err) => {
                warn!(path = %child_path, error = %err, "failed to fetch kustomization");
                self.graph.add_error_node(
                    &child_id,
                    &child_path,
                    &format!("File not found or inaccessible: {err}"),
                    &child_repo.base_url,
                );
                self.graph.add_edge(parent_id, &child_id, edge_type);
                return Ok(());
            }
        };

        // Edge first, so the node created during recursion completes it.
        self.graph.add_edge(parent_id, &child_id, edge_type);

        self.process_kustomization(
            child_id,
            content,
            child_path,
            child_repo,
            edge_type.node_type(),
        )
        .await
    }

    /// Resolves a relative reference against the current hop: same-repo
    /// paths reuse or rebuild a fetcher for the *current* repo; paths that
    /// escape a local root are re-detected as an external local repo.
    ///
    /// Errors carry the path the error node should be attributed to.
    async fn resolve_relative(
        &self,
        relative: &str,
        current_path: &str,
        current_repo: &RepoInfo,
    ) -> std::result::Result<(RepoInfo, String, Arc<dyn Fetcher>), (String, Error)> {
        let child_path = resolve_path(current_path, relative);

        if let (RepoKind::Local, Some(root)) = (current_repo.kind, current_repo.root_path.as_ref())
        {
            let abs = root.join(Path::new(current_path)).join(Path::new(relative)).clean();
            let escapes = abs != *root && !abs.starts_with(root);

            if escapes {
                let validated = validation::validate_local_path(&abs.to_string_lossy())
                    .map_err(|e| {
                        (
                            child_path.clone(),
                            Error::InvalidInput(format!("Invalid local path: {e}")),
                        )
                    })?;
                let ext_repo = repository::detect_local_repository(&validated).map_err(|e| {
                    (
                        child_path.clone(),
                        Error::InvalidInput(format!("Failed to detect repository: {e}")),
                    )
                })?;
                let ext_path = ext_repo.path.clone();
                let fetcher = (self.factory)(&ext_repo, "").map_err(|e| {
                    (
                        ext_path.clone(),
                        Error::Internal(format!("Failed to create fetcher: {e}")),
                    )
                })?;
                return Ok((ext_repo, ext_path, fetcher));
            }
        }

        let fetcher = if same_repo(&self.repo_info, current_repo) {
            Arc::clone(&self.fetcher)
        } else {
            let token = self.token(current_repo.kind);
            (self.factory)(current_repo, &token).map_err(|e| {
                (
                    child_path.clone(),
                    Error::Internal(format!("Failed to create fetcher: {e}")),
                )
            })?
        };

        Ok((current_repo.clone(), child_path, fetcher))
    }
}

/// Same-repo equality: canonical root path for local repos, `(owner, repo)`
/// for remotes.
pub fn same_repo(entry: &RepoInfo, current: &RepoInfo) -> bool {
    if entry.kind == RepoKind::Local && current.kind == RepoKind::Local {
        return match (&entry.root_path, &current.root_path) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        };
    }
    if entry.kind == RepoKind::Local || current.kind == RepoKind::Local {
        return false;
    }
    entry.owner == current.owner && entry.repo == current.repo
}

/// Canonical node ID: `local:<path>@<ref>` or `<kind>:<owner>/<repo>/<path>@<ref>`.
pub fn build_node_id(repo: &RepoInfo, path: &str) -> String {
    if repo.kind == RepoKind::Local {
        format!("local:{path}@{}", repo.git_ref)
    } else {
        format!(
            "{}:{}/{}/{}@{}",
            repo.kind, repo.owner, repo.repo, path, repo.git_ref
        )
    }
}

/// True for `.yaml`/`.yml` paths (case-insensitive).
pub fn is_yaml_file(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    lower.ends_with(".yaml") || lower.ends_with(".yml")
}

/// POSIX-style join of slash-separated paths: `.` is dropped and `..` pops
/// the previous segment. Used for in-repo paths, which are never absolute.
pub fn resolve_path(base: &str, relative: &str) -> String {
    let mut stack: Vec<&str> = Vec::new();
    for segment in base.split('/').chain(relative.split('/')) {
        match segment {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            seg => stack.push(seg),
        }
    }
    stack.join("/")
}

/// Projects the kustomization lists into the JSON dictionary stored as node
/// content.
fn kustomization_content(kust: &Kustomization) -> serde_json::Value {
    serde_json::json!({
        "resources": kust.resources,
        "bases": kust.bases,
        "components": kust.components,
        "patches": serde_json::to_value(&kust.patches).unwrap_or(serde_json::Value::Null),
    })
}
