//! # Repository Detection
//!
//! Classifies a raw source string into a concrete repository description:
//! provider kind, owner, repo, revision, sub-path and base URL.
//!
//! ## Detection rules (first match wins)
//!
//! 1. Host contains `github.com` → GitHub; first two path segments are
//!    `owner/repo`, anything after `tree/` or `blob/` is stored verbatim as
//!    the ambiguous suffix (branch names can contain `/`).
//! 2. Host contains `gitlab` or the path contains the `/-/` marker → GitLab;
//!    the project path before `/-/` supports nested groups.
//! 3. Otherwise probe the host: `/api/v4/version` says GitLab,
//!    `/api/v3` says GitHub Enterprise.
//! 4. Nothing matches → rejected.
//!
//! Ambiguous `tree/...` suffixes are resolved once, at entry, by listing the
//! provider's branches and taking the longest branch name that prefixes the
//! suffix; see [`resolve_branch_and_path`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::validation;

/// Timeout for provider probe and branch-list calls.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Ref used for local paths that are not git repositories.
const DEFAULT_LOCAL_REF: &str = "main";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepoKind {
    GitHub,
    GitLab,
    Local,
}

impl RepoKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepoKind::GitHub => "github",
            RepoKind::GitLab => "gitlab",
            RepoKind::Local => "local",
        }
    }

    /// Inverse of [`RepoKind::as_str`], used when parsing node IDs.
    pub fn parse(s: &str) -> Option<RepoKind> {
        match s {
            "github" => Some(RepoKind::GitHub),
            "gitlab" => Some(RepoKind::GitLab),
            "local" => Some(RepoKind::Local),
            _ => None,
        }
    }
}

impl fmt::Display for RepoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything known about a repository after detection. Immutable once the
/// ambiguous suffix has been resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoInfo {
    pub kind: RepoKind,
    pub owner: String,
    pub repo: String,
    pub git_ref: String,
    /// Scheme + host of the repo (`https://github.com`,
    /// `https://gitlab.example.com`); empty for local repos.
    pub base_url: String,
    /// Sub-path inside the repository (empty = repo root).
    pub path: String,
    /// Raw `tree/...` tail mixing branch name and sub-path; resolved later.
    pub ambiguous_suffix: String,
    /// Absolute repository root; only set for local repos.
    pub root_path: Option<PathBuf>,
}

impl RepoInfo {
    fn remote(kind: RepoKind, owner: String, repo: String, base_url: String) -> Self {
        RepoInfo {
            kind,
            owner,
            repo,
            git_ref: DEFAULT_LOCAL_REF.to_string(),
            base_url,
            path: String::new(),
            ambiguous_suffix: String::new(),
            root_path: None,
        }
    }
}

impl fmt::Display for RepoInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.kind == RepoKind::Local {
            write!(f, "local:{}@{}", self.path, self.git_ref)
        } else {
            write!(
                f,
                "{}:{}/{}@{}",
                self.kind, self.owner, self.repo, self.git_ref
            )
        }
    }
}

/// Parses the URL and determines the repository type. Probes the host when
/// neither hostname nor URL structure give it away.
pub async fn detect_repository(repo_url: &str, token: &str) -> Result<RepoInfo> {
    let url = Url::parse(repo_url).map_err(|e| Error::InvalidInput(format!("invalid URL: {e}")))?;
    let host = url.host_str().unwrap_or_default().to_string();
    let path = url.path().trim_matches('/').to_string();
    let base_url = format!(
        "{}://{}",
        url.scheme(),
        url.port()
            .map(|p| format!("{host}:{p}"))
            .unwrap_or_else(|| host.clone())
    );

    if host.contains("github.com") {
        return parse_github_url(&path, &base_url);
    }

    if host.contains("gitlab") || path.contains("/-/") {
        debug!(host = %host, "detected GitLab from hostname or URL structure");
        return parse_gitlab_url(&path, &base_url);
    }

    // Ambiguous host: probe the provider APIs.
    if is_gitlab_instance(&base_url, token).await {
        return parse_gitlab_url(&path, &base_url);
    }
    if is_github_instance(&base_url, token).await {
        return parse_github_url(&path, &base_url);
    }

    Err(Error::InvalidInput(format!(
        "unable to detect repository type for: {host}"
    )))
}

fn probe_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .user_agent(concat!("kustomize-atlas/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| Error::Internal(format!("failed to build HTTP client: {e}")))
}

async fn is_gitlab_instance(base_url: &str, token: &str) -> bool {
    #[derive(Deserialize)]
    struct VersionResponse {
        #[serde(default)]
        version: String,
    }

    let client = match probe_client() {
        Ok(c) => c,
        Err(_) => return false,
    };
    let mut req = client.get(format!("{base_url}/api/v4/version"));
    if !token.is_empty() {
        req = req.header("PRIVATE-TOKEN", token);
    }
    match req.send().await {
        Ok(resp) if resp.status().is_success() => resp
            .json::<VersionResponse>()
            .await
            .map(|v| !v.version.is_empty())
            .unwrap_or(false),
        Ok(resp) => {
            debug!(status = %resp.status(), "GitLab probe returned non-200");
            false
        }
        Err(e) => {
            debug!(error = %e, "failed to probe GitLab API");
            false
        }
    }
}

async fn is_github_instance(base_url: &str, token: &str) -> bool {
    let client = match probe_client() {
        Ok(c) => c,
        Err(_) => return false,
    };
    let mut req = client.get(format!("{base_url}/api/v3"));
    if !token.is_empty() {
        req = req.header("Authorization", format!("Bearer {token}"));
    }
    matches!(req.send().await, Ok(resp) if resp.status().is_success())
}

/// Extracts owner/repo and the ambiguous `tree|blob` tail from a GitHub URL
/// path (host already stripped).
pub fn parse_github_url(path: &str, base_url: &str) -> Result<RepoInfo> {
    let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if parts.len() < 2 {
        return Err(Error::InvalidInput(format!(
            "invalid GitHub repository path: {path}"
        )));
    }

    let mut info = RepoInfo::remote(
        RepoKind::GitHub,
        parts[0].to_string(),
        parts[1].trim_end_matches(".git").to_string(),
        base_url.to_string(),
    );

    // /tree/branch/path or /blob/branch/path: everything after the marker is
    // ambiguous because the branch name may itself contain slashes.
    if parts.len() >= 4 && (parts[2] == "tree" || parts[2] == "blob") {
        info.ambiguous_suffix = parts[3..].join("/");
    }

    Ok(info)
}

/// Extracts namespace/repo and the ambiguous tail from a GitLab URL path.
/// Nested groups are supported: the last segment before `/-/` is the repo,
/// everything before it (joined) is the owner.
pub fn parse_gitlab_url(path: &str, base_url: &str) -> Result<RepoInfo> {
    let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let marker = parts.iter().position(|p| *p == "-");

    let (namespace_parts, ambiguous_suffix) = match marker {
        Some(idx) if idx > 0 => {
            let after = &parts[idx + 1..];
            let suffix = if after.len() >= 2 && (after[0] == "tree" || after[0] == "blob") {
                after[1..].join("/")
            } else {
                String::new()
            };
            (&parts[..idx], suffix)
        }
        _ => (&parts[..], String::new()),
    };

    if namespace_parts.len() < 2 {
        return Err(Error::InvalidInput(format!(
            "invalid GitLab repository path: {path}"
        )));
    }

    let repo = namespace_parts[namespace_parts.len() - 1]
        .trim_end_matches(".git")
        .to_string();
    let owner = namespace_parts[..namespace_parts.len() - 1].join("/");

    let mut info = RepoInfo::remote(RepoKind::GitLab, owner, repo, base_url.to_string());
    info.ambiguous_suffix = ambiguous_suffix;
    Ok(info)
}

/// Builds a [`RepoInfo`] for a local path. `resolved` must be absolute and
/// already validated (home-bounded). Discovers the git root by walking up
/// (never past `$HOME`), the current branch (7-char commit prefix for a
/// detached HEAD), and the path relative to the root.
pub fn detect_local_repository(resolved: &Path) -> Result<RepoInfo> {
    let meta = std::fs::metadata(resolved)
        .map_err(|e| Error::InvalidInput(format!("cannot access path: {e}")))?;
    if !meta.is_dir() {
        return Err(Error::InvalidInput(format!(
            "path is not a directory: {}",
            resolved.display()
        )));
    }
    // Work on the canonical path so the relative-path computation below
    // agrees with the canonicalized git root.
    let resolved = &resolved
        .canonicalize()
        .map_err(|e| Error::InvalidInput(format!("cannot access path: {e}")))?;

    let (root_path, git_ref) = match find_git_root(resolved) {
        Some(root) => {
            let git_ref =
                git_branch(resolved).unwrap_or_else(|| DEFAULT_LOCAL_REF.to_string());
            (root, git_ref)
        }
        None => (resolved.to_path_buf(), DEFAULT_LOCAL_REF.to_string()),
    };

    let rel = resolved
        .strip_prefix(&root_path)
        .map_err(|_| Error::Internal("path outside repository root".into()))?;
    let rel = rel.to_string_lossy().replace('\\', "/");

    Ok(RepoInfo {
        kind: RepoKind::Local,
        owner: String::new(),
        repo: String::new(),
        git_ref,
        base_url: String::new(),
        path: if rel == "." { String::new() } else { rel },
        ambiguous_suffix: String::new(),
        root_path: Some(root_path),
    })
}

/// Walks up from `dir` to find the directory containing `.git`, stopping at
/// `$HOME` so detection never escapes the validated scope.
fn find_git_root(dir: &Path) -> Option<PathBuf> {
    let home = validation::home_dir().ok()?;
    let home = home.canonicalize().unwrap_or(home);
    let mut current = dir.canonicalize().ok()?;

    loop {
        if current != home && !current.starts_with(&home) {
            return None;
        }
        if current.join(".git").is_dir() {
            return Some(current);
        }
        if !current.pop() {
            return None;
        }
    }
}

/// Current branch name via the git CLI; 7-char commit prefix for a detached
/// HEAD; `None` when git is unavailable or the path is not a repository.
fn git_branch(dir: &Path) -> Option<String> {
    let out = Command::new("git")
        .args(["rev-parse", "--abbrev-ref", "HEAD"])
        .current_dir(dir)
        .output()
        .ok()?;
    if !out.status.success() {
        return None;
    }
    let name = String::from_utf8_lossy(&out.stdout).trim().to_string();
    if name.is_empty() {
        return None;
    }
    if name != "HEAD" {
        return Some(name);
    }

    // Detached HEAD: short commit hash.
    let out = Command::new("git")
        .args(["rev-parse", "--short=7", "HEAD"])
        .current_dir(dir)
        .output()
        .ok()?;
    if !out.status.success() {
        return None;
    }
    let hash = String::from_utf8_lossy(&out.stdout).trim().to_string();
    (!hash.is_empty()).then_some(hash)
}

#[derive(Deserialize)]
struct BranchEntry {
    name: String,
}

#[derive(Deserialize)]
struct RepoMetadata {
    #[serde(default)]
    default_branch: String,
}

/// Resolves an ambiguous `tree/...` suffix into `(branch, sub_path)`.
///
/// Lists the provider's branches and picks the *longest* branch name that is
/// a prefix of the suffix. Without any match, falls back to the repository's
/// default branch and treats the whole suffix as the sub-path.
pub async fn resolve_branch_and_path(
    info: &RepoInfo,
    suffix: &str,
    token: &str,
) -> Result<(String, String)> {
    let branches = list_branches(info, token).await?;

    if let Some((branch, path)) = choose_branch(suffix, &branches) {
        return Ok((branch, path));
    }

    warn!(suffix, "no branch prefixes the suffix; falling back to default branch");
    let branch = fetch_default_branch(info, token)
        .await
        .unwrap_or_else(|| info.git_ref.clone());
    Ok((branch, suffix.to_string()))
}

/// Longest branch-name prefix match. Pure so it can be tested without a
/// provider.
pub fn choose_branch(suffix: &str, branches: &[String]) -> Option<(String, String)> {
    let mut best: Option<&String> = None;
    for branch in branches {
        let matches =
            suffix == branch.as_str() || suffix.starts_with(&format!("{branch}/"));
        if matches && best.map_or(true, |b| branch.len() > b.len()) {
            best = Some(branch);
        }
    }
    best.map(|branch| {
        let rest = suffix[branch.len()..].trim_start_matches('/').to_string();
        (branch.clone(), rest)
    })
}

async fn list_branches(info: &RepoInfo, token: &str) -> Result<Vec<String>> {
    let client = probe_client()?;
    let mut branches = Vec::new();
    let mut page = 1u32;

    loop {
        let page_param = page.to_string();
        let mut req = match info.kind {
            RepoKind::GitHub => {
                let api = github_api_base(&info.base_url);
                let req = client.get(format!(
                    "{api}/repos/{}/{}/branches",
                    info.owner, info.repo
                ));
                let req = req
                    .query(&[("per_page", "100"), ("page", page_param.as_str())])
                    .header("Accept", "application/vnd.github.v3+json");
                if token.is_empty() {
                    req
                } else {
                    req.header("Authorization", format!("Bearer {token}"))
                }
            }
            RepoKind::GitLab => {
                let project = gitlab_project_id(&info.owner, &info.repo);
                let req = client
                    .get(format!(
                        "{}/api/v4/projects/{project}/repository/branches",
                        info.base_url
                    ))
                    .query(&[("per_page", "100"), ("page", page_param.as_str())]);
                if token.is_empty() {
                    req
                } else {
                    req.header("PRIVATE-TOKEN", token)
                }
            }
            RepoKind::Local => {
                return Err(Error::Internal(
                    "branch resolution does not apply to local repositories".into(),
                ))
            }
        };
        req = req.timeout(PROBE_TIMEOUT);

        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(Error::Upstream(format!(
                "branch list failed with status {}",
                resp.status()
            )));
        }
        let entries: Vec<BranchEntry> = resp.json().await.map_err(|e| {
            Error::Upstream(format!("failed to decode branch list: {e}"))
        })?;
        let count = entries.len();
        branches.extend(entries.into_iter().map(|b| b.name));
        if count < 100 {
            break;
        }
        page += 1;
    }

    debug!(count = branches.len(), repo = %info, "listed branches");
    Ok(branches)
}

async fn fetch_default_branch(info: &RepoInfo, token: &str) -> Option<String> {
    let client = probe_client().ok()?;
    let req = match info.kind {
        RepoKind::GitHub => {
            let api = github_api_base(&info.base_url);
            let req = client
                .get(format!("{api}/repos/{}/{}", info.owner, info.repo))
                .header("Accept", "application/vnd.github.v3+json");
            if token.is_empty() {
                req
            } else {
                req.header("Authorization", format!("Bearer {token}"))
            }
        }
        RepoKind::GitLab => {
            let project = gitlab_project_id(&info.owner, &info.repo);
            let req = client.get(format!("{}/api/v4/projects/{project}", info.base_url));
            if token.is_empty() {
                req
            } else {
                req.header("PRIVATE-TOKEN", token)
            }
        }
        RepoKind::Local => return None,
    };

    let resp = req.send().await.ok()?;
    if !resp.status().is_success() {
        return None;
    }
    let meta: RepoMetadata = resp.json().await.ok()?;
    (!meta.default_branch.is_empty()).then_some(meta.default_branch)
}

/// REST base for a GitHub host: api.github.com for github.com, `/api/v3`
/// for Enterprise instances.
pub fn github_api_base(base_url: &str) -> String {
    if base_url.is_empty() || base_url == "https://github.com" {
        "https://api.github.com".to_string()
    } else {
        format!("{}/api/v3", base_url.trim_end_matches('/'))
    }
}

/// URL-encoded `owner/repo` project identifier for the GitLab API.
pub fn gitlab_project_id(owner: &str, repo: &str) -> String {
    urlencoding::encode(&format!("{owner}/{repo}")).into_owned()
}
