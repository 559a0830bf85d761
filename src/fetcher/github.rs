//! GitHub REST fetcher.
//!
//! Uses the contents API for single files (base64 payloads) and the
//! recursive git tree for listings. A 403 carrying `X-RateLimit-Reset` is
//! surfaced as a recoverable rate-limit error with the reset timestamp.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{rest_client, Fetcher, KUSTOMIZATION_FILENAMES};
use crate::error::{Error, Result};
use crate::repository::{self, RepoInfo};

pub struct GitHubFetcher {
    client: reqwest::Client,
    api_base: String,
    owner: String,
    repo: String,
    git_ref: String,
    token: String,
}

#[derive(Deserialize)]
struct ContentsResponse {
    #[serde(default)]
    content: String,
    #[serde(default)]
    encoding: String,
}

#[derive(Deserialize)]
struct TreeResponse {
    #[serde(default)]
    tree: Vec<TreeEntry>,
}

#[derive(Deserialize)]
struct TreeEntry {
    #[serde(default)]
    path: String,
    #[serde(rename = "type", default)]
    entry_type: String,
}

impl GitHubFetcher {
    pub fn new(info: &RepoInfo, token: &str) -> Result<Self> {
        Ok(GitHubFetcher {
            client: rest_client()?,
            api_base: repository::github_api_base(&info.base_url),
            owner: info.owner.clone(),
            repo: info.repo.clone(),
            git_ref: info.git_ref.clone(),
            token: token.to_string(),
        })
    }

    fn request(&self, url: String) -> reqwest::RequestBuilder {
        let req = self
            .client
            .get(url)
            .header("Accept", "application/vnd.github.v3+json");
        if self.token.is_empty() {
            req
        } else {
            req.header("Authorization", format!("Bearer {}", self.token))
        }
    }

    /// Maps GitHub error statuses onto domain errors, consuming the response.
    async fn check_status(resp: reqwest::Response, path: &str) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        match status.as_u16() {
            401 => Err(Error::Unauthorized(
                "GitHub rejected the provided token".into(),
            )),
            403 => {
                let reset = resp
                    .headers()
                    .get("X-RateLimit-Reset")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                match reset {
                    Some(reset) => Err(Error::RateLimited { reset }),
                    None => Err(Error::Unauthorized(format!(
                        "GitHub denied access to {path}"
                    ))),
                }
            }
            404 => Err(Error::NotFound(format!("file not found: {path}"))),
            s if s >= 500 => Err(Error::Upstream(format!("GitHub returned {status}"))),
            _ => Err(Error::Upstream(format!(
                "GitHub returned {status} for {path}"
            ))),
        }
    }
}

/// Percent-encodes a repo path per segment, keeping the slashes.
fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|seg| urlencoding::encode(seg).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[async_trait]
impl Fetcher for GitHubFetcher {
    async fn fetch_file(&self, path: &str) -> Result<Vec<u8>> {
        debug!(
            owner = %self.owner,
            repo = %self.repo,
            path,
            git_ref = %self.git_ref,
            "fetching file from GitHub"
        );

        let url = format!(
            "{}/repos/{}/{}/contents/{}",
            self.api_base,
            self.owner,
            self.repo,
            encode_path(path)
        );
        let resp = self
            .request(url)
            .query(&[("ref", self.git_ref.as_str())])
            .send()
            .await?;
        let resp = Self::check_status(resp, path).await?;

        let contents: ContentsResponse = resp.json().await.map_err(|_| {
            // Directories come back as a JSON array, which fails to decode.
            Error::NotFound(format!("not a file: {path}"))
        })?;
        if contents.encoding != "base64" || contents.content.is_empty() {
            return Err(Error::NotFound(format!("not a file: {path}")));
        }

        let compact: String = contents
            .content
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        use base64::Engine;
        base64::engine::general_purpose::STANDARD
            .decode(compact)
            .map_err(|e| Error::Upstream(format!("failed to decode file content: {e}")))
    }

    async fn list_files(&self) -> Result<Vec<String>> {
        debug!(owner = %self.owner, repo = %self.repo, git_ref = %self.git_ref, "listing GitHub tree");

        let url = format!(
            "{}/repos/{}/{}/git/trees/{}",
            self.api_base,
            self.owner,
            self.repo,
            urlencoding::encode(&self.git_ref)
        );
        let resp = self
            .request(url)
            .query(&[("recursive", "1")])
            .send()
            .await?;
        let resp = Self::check_status(resp, "").await?;

        let tree: TreeResponse = resp
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("failed to decode repository tree: {e}")))?;

        let files: Vec<String> = tree
            .tree
            .into_iter()
            .filter(|e| e.entry_type == "blob")
            .map(|e| e.path)
            .collect();
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

        for filename in KUSTOMIZATION_FILENAMES {
            let full = if path.is_empty() {
                filename.to_string()
            } else {
                format!("{path}/{filename}")
            };
            match self.fetch_file(&full).await {
                Ok(content) => {
                    debug!(path = %full, "found kustomization file");
                    return String::from_utf8(content)
                        .map_err(|e| Error::Parse(format!("kustomization is not UTF-8: {e}")));
                }
                // A rate limit will also sink the remaining candidates;
                // surface it instead of masking it as not-found.
                Err(err @ Error::RateLimited { .. }) => return Err(err),
                Err(_) => continue,
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
    fn path_encoding_keeps_slashes() {
        assert_eq!(encode_path("a/b/c.yaml"), "a/b/c.yaml");
        assert_eq!(encode_path("dir with space/f.yaml"), "dir%20with%20space/f.yaml");
        assert_eq!(encode_path(""), "");
    }
}
