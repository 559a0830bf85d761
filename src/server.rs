//! # HTTP Server
//!
//! REST API over the analysis pipeline.
//!
//! Endpoints:
//! - `POST /api/v1/analyze`: detect, walk and store a graph
//! - `GET /api/v1/graph/{id}`: JSON graph, or Mermaid with `?format=mermaid`
//! - `GET /api/v1/graph/{id}/ca-bundle`: collected PEM bundle
//! - `GET /api/v1/node/{graphID}/{nodeID}`: node details with relations
//! - `POST /api/v1/node/{graphID}/{nodeID}/build`: kustomize build output
//! - `POST /api/v1/browse`: subdirectory listing (local mode only)
//! - `GET /api/v1/config`: feature flags for the client
//!
//! Node IDs arrive percent-encoded in URL path segments. Every error body
//! has the shape `{"status": "error", "message": "..."}`.

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::build::{self, Builder};
use crate::cacert::Collector;
use crate::error::Error;
use crate::export;
use crate::fetcher;
use crate::parser::Parser;
use crate::repository::{self, RepoKind};
use crate::storage::MemoryStore;
use crate::validation;

/// Request body caps (analyze carries a URL plus tokens; build and browse
/// carry less).
const MAX_ANALYZE_BODY: usize = 64 * 1024;
const MAX_BUILD_BODY: usize = 32 * 1024;

/// Shared state: constructed once at startup, passed explicitly.
pub struct AppState {
    pub store: MemoryStore,
    pub ca_collector: Collector,
    pub local_enabled: bool,
}

/// Builds the API router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/api/v1/analyze",
            post(handle_analyze).layer(DefaultBodyLimit::max(MAX_ANALYZE_BODY)),
        )
        .route("/api/v1/graph/{id}", get(handle_get_graph))
        .route("/api/v1/graph/{id}/ca-bundle", get(handle_get_ca_bundle))
        .route("/api/v1/node/{graph_id}/{node_id}", get(handle_get_node))
        .route(
            "/api/v1/node/{graph_id}/{node_id}/build",
            post(handle_build_node).layer(DefaultBodyLimit::max(MAX_BUILD_BODY)),
        )
        .route(
            "/api/v1/browse",
            post(handle_browse).layer(DefaultBodyLimit::max(MAX_BUILD_BODY)),
        )
        .route("/api/v1/config", get(handle_config))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub github_token: String,
    #[serde(default)]
    pub gitlab_token: String,
}

#[derive(Debug, Serialize)]
pub struct AnalyzeResponse {
    pub id: String,
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    status: &'static str,
    message: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            status: "error",
            message: message.into(),
        }),
    )
        .into_response()
}

impl Error {
    fn http_status(&self) -> StatusCode {
        match self {
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::Upstream(_) => StatusCode::BAD_GATEWAY,
            Error::Build(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Parse(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        error_response(self.http_status(), self.to_string())
    }
}

async fn handle_analyze(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AnalyzeRequest>,
) -> Response {
    let source = req.url.trim();

    // Local paths take a separate branch, gated behind the startup flag;
    // everything else must pass SSRF validation.
    let repo_info = if state.local_enabled && validation::is_local_path(source) {
        let resolved = match validation::validate_local_path(source) {
            Ok(resolved) => resolved,
            Err(err) => return err.into_response(),
        };
        match repository::detect_local_repository(&resolved) {
            Ok(info) => info,
            Err(err) => return err.into_response(),
        }
    } else {
        if let Err(err) = validation::validate_analyze_url(source) {
            return err.into_response();
        }
        info!(url = %truncate_for_log(source, 256), "analyzing repository");
        match repository::detect_repository(source, "").await {
            Ok(info) => info,
            Err(err) => return err.into_response(),
        }
    };
    info!(repo = %repo_info, "detected repository");

    let token = match repo_info.kind {
        RepoKind::GitHub => req.github_token.clone(),
        RepoKind::GitLab => req.gitlab_token.clone(),
        RepoKind::Local => String::new(),
    };

    let mut repo_info = repo_info;
    if !repo_info.ambiguous_suffix.is_empty() {
        let suffix = repo_info.ambiguous_suffix.clone();
        match repository::resolve_branch_and_path(&repo_info, &suffix, &token).await {
            Ok((branch, path)) => {
                info!(branch = %branch, path = %path, "resolved ambiguous suffix");
                repo_info.git_ref = branch;
                repo_info.path = path;
            }
            Err(err) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    format!("failed to resolve branch: {err}"),
                )
            }
        }
    }

    let search_path = repo_info.path.clone();

    let entry_fetcher = match fetcher::new_fetcher(&repo_info, &token) {
        Ok(f) => Arc::from(f),
        Err(err) => {
            error!(error = %err, "failed to create fetcher");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to create fetcher",
            );
        }
    };

    let mut parser = Parser::new(entry_fetcher, repo_info);
    parser.set_token(RepoKind::GitHub, &req.github_token);
    parser.set_token(RepoKind::GitLab, &req.gitlab_token);

    let mut graph = match parser.parse(&search_path).await {
        Ok(graph) => graph,
        // The entry rate limit surfaces with its reset time; everything
        // else collapses to a generic parse failure.
        Err(err @ Error::RateLimited { .. }) => {
            warn!(error = %err, "entry fetch rate limited");
            return err.into_response();
        }
        Err(err) => {
            error!(error = %err, "parse failed");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to analyze repository",
            );
        }
    };

    state.ca_collector.collect_and_attach(&mut graph).await;

    graph.id = uuid::Uuid::new_v4().to_string();
    graph.created = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    let graph_id = graph.id.clone();
    let element_count = graph.elements.len();

    if let Err(err) = state.store.save_graph(graph) {
        error!(error = %err, "failed to save graph");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to save graph");
    }
    info!(id = %graph_id, elements = element_count, "graph saved");

    Json(AnalyzeResponse {
        id: graph_id,
        status: "success",
    })
    .into_response()
}

#[derive(Debug, Deserialize)]
struct FormatQuery {
    #[serde(default)]
    format: String,
}

async fn handle_get_graph(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<FormatQuery>,
) -> Response {
    if let Err(err) = validation::validate_graph_id(&id) {
        return err.into_response();
    }
    let format = validation::validate_format(&query.format);

    let graph = match state.store.get_graph(&id) {
        Ok(graph) => graph,
        Err(_) => return error_response(StatusCode::NOT_FOUND, "Graph not found"),
    };

    match format {
        "mermaid" => {
            let mermaid = export::to_mermaid(&graph);
            (
                [
                    (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
                    (
                        header::CONTENT_DISPOSITION,
                        // The ID is a validated UUID, safe for the header.
                        format!("attachment; filename=graph-{id}.mmd"),
                    ),
                ],
                mermaid,
            )
                .into_response()
        }
        _ => Json(graph).into_response(),
    }
}

async fn handle_get_ca_bundle(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    if let Err(err) = validation::validate_graph_id(&id) {
        return err.into_response();
    }
    let graph = match state.store.get_graph(&id) {
        Ok(graph) => graph,
        Err(_) => return error_response(StatusCode::NOT_FOUND, "Graph not found"),
    };
    match graph.ca_bundle {
        Some(bundle) => (
            [(header::CONTENT_TYPE, "application/x-pem-file")],
            bundle,
        )
            .into_response(),
        None => error_response(StatusCode::NOT_FOUND, "No CA bundle for this graph"),
    }
}

async fn handle_get_node(
    State(state): State<Arc<AppState>>,
    Path((graph_id, node_id)): Path<(String, String)>,
) -> Response {
    if let Err(err) = validation::validate_graph_id(&graph_id) {
        return err.into_response();
    }
    if let Err(err) = validation::validate_node_id(&node_id) {
        return err.into_response();
    }

    match state.store.get_node(&graph_id, &node_id) {
        Ok(details) => Json(details).into_response(),
        Err(err) => error_response(StatusCode::NOT_FOUND, err.to_string()),
    }
}

#[derive(Debug, Default, Deserialize)]
struct BuildRequest {
    #[serde(default)]
    github_token: String,
    #[serde(default)]
    gitlab_token: String,
}

#[derive(Debug, Serialize)]
struct BuildResponse {
    yaml: String,
}

async fn handle_build_node(
    State(state): State<Arc<AppState>>,
    Path((graph_id, node_id)): Path<(String, String)>,
    Json(req): Json<BuildRequest>,
) -> Response {
    if let Err(err) = validation::validate_graph_id(&graph_id) {
        return err.into_response();
    }
    if let Err(err) = validation::validate_node_id(&node_id) {
        return err.into_response();
    }
    if build::parse_node_id(&node_id).is_err() {
        return error_response(StatusCode::BAD_REQUEST, "Invalid node ID format");
    }

    let details = match state.store.get_node(&graph_id, &node_id) {
        Ok(details) => details,
        Err(_) => return error_response(StatusCode::NOT_FOUND, "Node not found"),
    };
    match details.node_type {
        crate::types::NodeType::Component => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "Build is not available for component nodes; use an overlay or resource node",
            )
        }
        crate::types::NodeType::Error => {
            return error_response(StatusCode::BAD_REQUEST, "Build is not available for error nodes")
        }
        _ => {}
    }

    let graph = match state.store.get_graph(&graph_id) {
        Ok(graph) => graph,
        Err(_) => return error_response(StatusCode::NOT_FOUND, "Graph not found"),
    };
    let base_url = graph.base_urls.get(&node_id).cloned().unwrap_or_default();

    let builder = match Builder::new(&req.github_token, &req.gitlab_token) {
        Ok(builder) => builder,
        Err(err) => return err.into_response(),
    };

    let result = if node_id.starts_with("local:") {
        match graph.local_root_paths.get(&node_id) {
            Some(root) => {
                let path = build::parse_node_id(&node_id)
                    .map(|p| p.path)
                    .unwrap_or_default();
                builder.build_local(root, &path).await
            }
            None => Err(Error::Build(
                "no recorded repository root for this local node".into(),
            )),
        }
    } else {
        builder.build(&node_id, &base_url).await
    };

    match result {
        Ok(yaml) => Json(BuildResponse { yaml }).into_response(),
        Err(err) => {
            warn!(node = %node_id, error = %err, "build failed");
            error_response(StatusCode::UNPROCESSABLE_ENTITY, err.to_string())
        }
    }
}

#[derive(Debug, Deserialize)]
struct BrowseRequest {
    #[serde(default)]
    path: String,
}

async fn handle_browse(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BrowseRequest>,
) -> Response {
    if !state.local_enabled {
        return error_response(StatusCode::FORBIDDEN, "Local mode is disabled");
    }
    let resolved = match validation::validate_local_path(&req.path) {
        Ok(resolved) => resolved,
        Err(err) => return err.into_response(),
    };

    let mut dirs = Vec::new();
    match std::fs::read_dir(&resolved) {
        Ok(entries) => {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    dirs.push(path.to_string_lossy().into_owned());
                }
            }
        }
        Err(err) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("cannot list directory: {err}"),
            )
        }
    }
    dirs.sort();
    Json(dirs).into_response()
}

#[derive(Debug, Serialize)]
struct ConfigResponse {
    local_enabled: bool,
}

async fn handle_config(State(state): State<Arc<AppState>>) -> Response {
    Json(ConfigResponse {
        local_enabled: state.local_enabled,
    })
    .into_response()
}

/// Truncates a string for log lines (keeps huge URLs out of logs).
fn truncate_for_log(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len).collect();
        format!("{head}...")
    }
}
