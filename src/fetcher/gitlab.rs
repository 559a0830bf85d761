//! GitLab REST fetcher.
//!
//! Raw file downloads via `repository/files/:path/raw`, listings via the
//! paginated `repository/tree` endpoint. Works against gitlab.com and
//! self-hosted instances (the base URL comes from detection). A 401 is
//! reported as an explicit token-required error.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{is_kustomization_filename, rest_client, Fetcher};
use crate::error::{Error, Result};
use crate::repository::{self, RepoInfo};

pub struct GitLabFetcher {
    client: reqwest::Client,
    base_url: String,
    project_id: String,
    git_ref: String,
    token: String,
}

#[derive(Deserialize)]
struct TreeNode {
    #[serde(default)]
    path: String,
    #[serde(default)]
    name: String,
    #[serde(rename = "type", default)]
    node_type: String,
}

impl GitLabFetcher {
    pub fn new(info: &RepoInfo, token: &str) -> Result<Self> {
        Ok(GitLabFetcher {
            client: rest_client()?,
            base_url: info.base_url.trim_end_matches('/').to_string(),
            project_id: repository::gitlab_project_id(&info.owner, &info.repo),
            git_ref: info.git_ref.clone(),
            token: token.to_string(),
        })
    }

    fn request(&self, url: String) -> reqwest::RequestBuilder {
        let req = self.client.get(url);
        if self.token.is_empty() {
            req
        } else {
            req.header("PRIVATE-TOKEN", &self.token)
        }
    }

    async fn check_status(resp: reqwest::Response, path: &str) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        match status.as_u16() {
            401 => Err(Error::Unauthorized(
                "GitLab token required for this repository".into(),
            )),
            403 => Err(Error::Unauthorized(format!(
                "GitLab denied access to {path}"
            ))),
            404 => Err(Error::NotFound(format!("file not found: {path}"))),
            s if s >= 500 => Err(Error::Upstream(format!("GitLab returned {status}"))),
            _ => Err(Error::Upstream(format!(
                "GitLab returned {status} for {path}"
            ))),
        }
    }

    /// One page of the repository tree. `path` limits the listing to a
    /// directory; `recursive` walks the whole subtree.
    async fn tree_page(&self, path: Option<&str>, recursive: bool, page: u32) -> Result<(Vec<TreeNode>, Option<u32>)> {
        let url = format!(
            "{}/api/v4/projects/{}/repository/tree",
            self.base_url, self.project_id
        );
        let page_param = page.to_string();
        let mut req = self.request(url).query(&[
            ("ref", self.git_ref.as_str()),
            ("recursive", if recursive { "true" } else { "false" }),
            ("per_page", "100"),
            ("page", page_param.as_str()),
        ]);
        if let Some(path) = path {
            req = req.query(&[("path", path)]);
        }

        let resp = req.send().await?;
        let resp = Self::check_status(resp, path.unwrap_or("")).await?;

        let next_page = resp
            .headers()
            .get("x-next-page")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|&p| p > 0);

        let nodes: Vec<TreeNode> = resp
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("failed to decode repository tree: {e}")))?;
        Ok((nodes, next_page))
    }
}

impl TreeNode {
    /// Entry file name; derived from the path when the API omits it.
    fn file_name(&self) -> &str {
        if !self.name.is_empty() {
            &self.name
        } else {
            self.path.rsplit('/').next().unwrap_or(&self.path)
        }
    }
}

#[async_trait]
impl Fetcher for GitLabFetcher {
    async fn fetch_file(&self, path: &str) -> Result<Vec<u8>> {
        debug!(project = %self.project_id, path, git_ref = %self.git_ref, "fetching file from GitLab");

        let url = format!(
            "{}/api/v4/projects/{}/repository/files/{}/raw",
            self.base_url,
            self.project_id,
            urlencoding::encode(path)
        );
        let resp = self
            .request(url)
            .query(&[("ref", self.git_ref.as_str())])
            .send()
            .await?;
        let resp = Self::check_status(resp, path).await?;

        Ok(resp.bytes().await?.to_vec())
    }

    async fn list_files(&self) -> Result<Vec<String>> {
        debug!(project = %self.project_id, git_ref = %self.git_ref, "listing GitLab tree");

        let mut files = Vec::new();
        let mut page = 1u32;
        loop {
            let (nodes, next) = self.tree_page(None, true, page).await?;
            files.extend(
                nodes
                    .into_iter()
                    .filter(|n| n.node_type == "blob")
                    .map(|n| n.path),
            );
            match next {
                Some(next) => page = next,
                None => break,
            }
        }

        debug!(count = files.len(), "listed repository files");
        Ok(files)
    }

    async fn find_kustomization(&self, path: &str) -> Result<String> {
        let path = path.trim_matches('/');

        if !path.is_empty() {
            if let Ok(content) = self.fetch_file(path).await {
                return String::from_utf8(content)
                    .map_err(|e| Error::Parse(format!("kustomization is not UTF-8: {e}")));
            }
        }

        // The path is likely a directory: list it and pick a kustomization
        // file by name, case-insensitively.
        let listing_path = if path.is_empty() { None } else { Some(path) };
        if let Ok((nodes, _)) = self.tree_page(listing_path, false, 1).await {
            for node in nodes {
                if node.node_type != "blob" || !is_kustomization_filename(node.file_name()) {
                    continue;
                }
                let file_path = if node.path.is_empty() {
                    if path.is_empty() {
                        node.file_name().to_string()
                    } else {
                        format!("{path}/{}", node.file_name())
                    }
                } else {
                    node.path.clone()
                };
                if let Ok(content) = self.fetch_file(&file_path).await {
                    debug!(path = %file_path, "found kustomization file");
                    return String::from_utf8(content)
                        .map_err(|e| Error::Parse(format!("kustomization is not UTF-8: {e}")));
                }
            }
        }

        Err(Error::NotFound(format!(
            "no kustomization file found in path: {path}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tree_node_file_name_fallback() {
        let with_name = TreeNode {
            path: "deploy/kustomization.yaml".into(),
            name: "kustomization.yaml".into(),
            node_type: "blob".into(),
        };
        assert_eq!(with_name.file_name(), "kustomization.yaml");

        let without_name = TreeNode {
            path: "deploy/Kustomization".into(),
            name: String::new(),
            node_type: "blob".into(),
        };
        assert_eq!(without_name.file_name(), "Kustomization");
    }
}
