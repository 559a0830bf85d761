//! # Overlay Builder
//!
//! Runs `kustomize build` for a graph node. For remote nodes the revision
//! archive is downloaded from the provider, extracted into a fresh temp
//! directory (removed on every exit path) and built at the node's sub-path.
//! Nodes from external local repositories build directly at their recorded
//! root.
//!
//! Extraction is defensive: entries with parent-traversal paths are
//! refused, the tar `pax_global_header` metadata entry is skipped, and
//! symlink entries are ignored. Only regular files and directories are
//! materialized.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use path_clean::PathClean;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::repository::{self, RepoKind};

/// Hard deadline for an archive download.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// How much of an error body is surfaced inline.
const MAX_ERROR_BODY: usize = 1024;

/// Tar metadata entry (PAX extended header); not a real path.
const PAX_GLOBAL_HEADER: &str = "pax_global_header";

/// The parts of a canonical node ID, as used on the wire:
/// `<kind>:<owner>/<repo>/<path>@<ref>` or `local:<path>@<ref>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdParts {
    pub kind: RepoKind,
    pub owner: String,
    pub repo: String,
    pub path: String,
    pub git_ref: String,
}

impl fmt::Display for NodeIdParts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.kind == RepoKind::Local {
            write!(f, "local:{}@{}", self.path, self.git_ref)
        } else {
            write!(
                f,
                "{}:{}/{}/{}@{}",
                self.kind, self.owner, self.repo, self.path, self.git_ref
            )
        }
    }
}

/// Parses a node ID back into its parts: split first on `:` for the kind,
/// last on `@` for the ref; the middle splits on the first two `/` into
/// owner and repo, the rest is the path. `error:` IDs are not buildable.
pub fn parse_node_id(node_id: &str) -> Result<NodeIdParts> {
    let (kind_str, rest) = node_id
        .split_once(':')
        .ok_or_else(|| Error::InvalidInput(format!("invalid node ID: {node_id}")))?;
    if kind_str == "error" {
        return Err(Error::InvalidInput("error nodes cannot be built".into()));
    }
    let kind = RepoKind::parse(kind_str)
        .ok_or_else(|| Error::InvalidInput(format!("unknown repository kind: {kind_str}")))?;

    let (middle, git_ref) = rest
        .rsplit_once('@')
        .ok_or_else(|| Error::InvalidInput(format!("node ID missing @ref: {node_id}")))?;
    if git_ref.is_empty() {
        return Err(Error::InvalidInput(format!("node ID missing ref: {node_id}")));
    }

    if kind == RepoKind::Local {
        return Ok(NodeIdParts {
            kind,
            owner: String::new(),
            repo: String::new(),
            path: middle.to_string(),
            git_ref: git_ref.to_string(),
        });
    }

    let mut segments = middle.splitn(3, '/');
    let owner = segments.next().unwrap_or_default();
    let repo = segments
        .next()
        .ok_or_else(|| Error::InvalidInput(format!("node ID missing repo: {node_id}")))?;
    if owner.is_empty() || repo.is_empty() {
        return Err(Error::InvalidInput(format!(
            "node ID missing owner/repo: {node_id}"
        )));
    }
    let path = segments.next().unwrap_or_default();

    Ok(NodeIdParts {
        kind,
        owner: owner.to_string(),
        repo: repo.to_string(),
        path: path.to_string(),
        git_ref: git_ref.to_string(),
    })
}

/// Builds overlays by fetching revision archives and running the kustomize
/// engine. Tokens are per-request, so builders are cheap and short-lived.
pub struct Builder {
    github_token: String,
    gitlab_token: String,
    client: reqwest::Client,
}

impl Builder {
    pub fn new(github_token: &str, gitlab_token: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .user_agent(concat!("kustomize-atlas/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Builder {
            github_token: github_token.to_string(),
            gitlab_token: gitlab_token.to_string(),
            client,
        })
    }

    /// Fetches the repo for `node_id`, runs `kustomize build` at the node
    /// path and returns the rendered YAML. `base_url` distinguishes
    /// github.com/gitlab.com from self-hosted instances.
    pub async fn build(&self, node_id: &str, base_url: &str) -> Result<String> {
        let parts = parse_node_id(node_id)?;
        if parts.kind == RepoKind::Local {
            return Err(Error::InvalidInput(
                "local nodes build from their recorded repository root".into(),
            ));
        }

        let dir = TempDir::with_prefix("kustomize-atlas-build-")
            .map_err(|e| Error::Internal(format!("create temp dir: {e}")))?;

        let archive_path = self.download_archive(dir.path(), &parts, base_url).await?;

        let dest = dir.path().to_path_buf();
        let top_dir = tokio::task::spawn_blocking(move || extract_tar_gz(&archive_path, &dest))
            .await
            .map_err(|e| Error::Internal(format!("extract task: {e}")))??;

        let mut build_path = dir.path().join(&top_dir);
        if !parts.path.is_empty() {
            build_path = build_path.join(&parts.path);
        }
        let build_path = build_path.clean();
        if !build_path.starts_with(dir.path()) {
            return Err(Error::InvalidInput("invalid build path".into()));
        }

        let yaml = run_kustomize(&build_path).await;
        // TempDir removal happens on drop, on success and error alike.
        yaml
    }

    /// Builds a node from an on-host repository root, without an archive.
    pub async fn build_local(&self, root: &str, node_path: &str) -> Result<String> {
        let root = Path::new(root)
            .canonicalize()
            .map_err(|e| Error::NotFound(format!("local repository root: {e}")))?;
        let build_path = root.join(node_path.trim_matches('/')).clean();
        if build_path != root && !build_path.starts_with(&root) {
            return Err(Error::InvalidInput("invalid build path".into()));
        }
        run_kustomize(&build_path).await
    }

    async fn download_archive(
        &self,
        dir: &Path,
        parts: &NodeIdParts,
        base_url: &str,
    ) -> Result<PathBuf> {
        let request = match parts.kind {
            RepoKind::GitHub => {
                let api_base = repository::github_api_base(base_url);
                let url = format!(
                    "{api_base}/repos/{}/{}/tarball/{}",
                    parts.owner,
                    parts.repo,
                    urlencoding::encode(&parts.git_ref)
                );
                let req = self
                    .client
                    .get(url)
                    .header("Accept", "application/vnd.github.v3+json");
                if self.github_token.is_empty() {
                    req
                } else {
                    req.header("Authorization", format!("Bearer {}", self.github_token))
                }
            }
            RepoKind::GitLab => {
                let api_base = if base_url.is_empty() {
                    "https://gitlab.com".to_string()
                } else {
                    base_url.trim_end_matches('/').to_string()
                };
                let project = repository::gitlab_project_id(&parts.owner, &parts.repo);
                let url = format!(
                    "{api_base}/api/v4/projects/{project}/repository/archive.tar.gz"
                );
                let req = self
                    .client
                    .get(url)
                    .query(&[("sha", parts.git_ref.as_str())]);
                if self.gitlab_token.is_empty() {
                    req
                } else {
                    req.header("PRIVATE-TOKEN", &self.gitlab_token)
                }
            }
            RepoKind::Local => {
                return Err(Error::Internal("no archive for local repositories".into()))
            }
        };

        info!(node = %parts, "downloading revision archive");
        let mut resp = request.send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.bytes().await.unwrap_or_default();
            let body = String::from_utf8_lossy(&body[..body.len().min(MAX_ERROR_BODY)]).to_string();
            return Err(Error::Upstream(format!(
                "download archive: {status}: {body}"
            )));
        }

        let archive_path = dir.join("repo.tar.gz");
        let mut file = tokio::fs::File::create(&archive_path)
            .await
            .map_err(|e| Error::Internal(format!("create archive file: {e}")))?;
        while let Some(chunk) = resp.chunk().await? {
            file.write_all(&chunk)
                .await
                .map_err(|e| Error::Internal(format!("write archive: {e}")))?;
        }
        file.flush()
            .await
            .map_err(|e| Error::Internal(format!("write archive: {e}")))?;
        Ok(archive_path)
    }
}

/// True when a tar entry path is safe to materialize: relative, no parent
/// traversal, no absolute components.
fn is_safe_entry_path(path: &Path) -> bool {
    use std::path::Component;
    !path.as_os_str().is_empty()
        && path.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Extracts a `.tar.gz` into `dir` and returns the single top-level
/// directory name (provider archives wrap everything in `owner-repo-sha/`).
pub fn extract_tar_gz(archive_path: &Path, dir: &Path) -> Result<String> {
    let file = std::fs::File::open(archive_path)
        .map_err(|e| Error::Internal(format!("open archive: {e}")))?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);

    let mut top_dir = String::new();

    let entries = archive
        .entries()
        .map_err(|e| Error::Upstream(format!("read archive: {e}")))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| Error::Upstream(format!("read archive entry: {e}")))?;
        let raw_path = entry
            .path()
            .map_err(|e| Error::Upstream(format!("archive entry path: {e}")))?
            .into_owned();

        if !is_safe_entry_path(&raw_path) {
            debug!(path = %raw_path.display(), "skipping unsafe archive entry");
            continue;
        }
        let name = raw_path.clean();
        if name == Path::new(PAX_GLOBAL_HEADER) || name.starts_with(PAX_GLOBAL_HEADER) {
            continue;
        }

        let entry_type = entry.header().entry_type();
        if top_dir.is_empty() {
            if let Some(first) = name.components().next() {
                let first = first.as_os_str().to_string_lossy().into_owned();
                if name.components().count() > 1 || entry_type.is_dir() {
                    top_dir = first;
                }
            }
        }

        let target = dir.join(&name);
        if entry_type.is_dir() {
            std::fs::create_dir_all(&target)
                .map_err(|e| Error::Internal(format!("extract dir: {e}")))?;
        } else if entry_type.is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::Internal(format!("extract dir: {e}")))?;
            }
            let mut out = std::fs::File::create(&target)
                .map_err(|e| Error::Internal(format!("extract file: {e}")))?;
            std::io::copy(&mut entry, &mut out)
                .map_err(|e| Error::Internal(format!("extract file: {e}")))?;
        }
        // Symlinks and other entry types are deliberately not materialized.
    }

    if top_dir.is_empty() {
        return Err(Error::Upstream("archive has no top-level directory".into()));
    }
    Ok(top_dir)
}

/// Invokes `kustomize build` at the path and returns its YAML output.
async fn run_kustomize(build_path: &Path) -> Result<String> {
    debug!(path = %build_path.display(), "running kustomize build");

    let output = Command::new("kustomize")
        .arg("build")
        .arg(build_path)
        .output()
        .await
        .map_err(|e| Error::Internal(format!("failed to execute kustomize: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!(path = %build_path.display(), "kustomize build failed: {stderr}");
        return Err(Error::Build(format!("kustomize build: {}", stderr.trim())));
    }

    String::from_utf8(output.stdout)
        .map_err(|e| Error::Build(format!("kustomize output is not UTF-8: {e}")))
}
