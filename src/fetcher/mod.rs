//! # Fetchers
//!
//! A uniform capability for reading repository content, implemented for
//! GitHub REST, GitLab REST and the local filesystem. Each implementation
//! carries its own auth state; construction goes through [`new_fetcher`] so
//! the walker can obtain a fetcher for any repository it hops into.
//!
//! `find_kustomization` tries, in order: the path as-is (it may already be a
//! file), then `kustomization.yaml`, `kustomization.yml` and
//! `Kustomization` inside the path.

mod github;
mod gitlab;
mod local;

pub use github::GitHubFetcher;
pub use gitlab::GitLabFetcher;
pub use local::LocalFetcher;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::repository::{RepoInfo, RepoKind};

/// Canonical kustomization file names, in lookup order.
pub const KUSTOMIZATION_FILENAMES: [&str; 3] =
    ["kustomization.yaml", "kustomization.yml", "Kustomization"];

/// Case-insensitive match against the known kustomization file names.
pub fn is_kustomization_filename(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower == "kustomization.yaml" || lower == "kustomization.yml" || lower == "kustomization"
}

/// Capability for retrieving files from a repository.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Retrieves a single file's content.
    async fn fetch_file(&self, path: &str) -> Result<Vec<u8>>;

    /// Lists all file paths in the repository, recursively.
    async fn list_files(&self) -> Result<Vec<String>>;

    /// Finds and returns the kustomization document at `path`.
    async fn find_kustomization(&self, path: &str) -> Result<String>;
}

/// Creates the appropriate fetcher for the repository kind.
pub fn new_fetcher(info: &RepoInfo, token: &str) -> Result<Box<dyn Fetcher>> {
    match info.kind {
        RepoKind::GitHub => Ok(Box::new(GitHubFetcher::new(info, token)?)),
        RepoKind::GitLab => Ok(Box::new(GitLabFetcher::new(info, token)?)),
        RepoKind::Local => Ok(Box::new(LocalFetcher::new(info)?)),
    }
}

/// Shared reqwest client construction for the REST fetchers.
fn rest_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .user_agent(concat!("kustomize-atlas/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| Error::Internal(format!("failed to build HTTP client: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kustomization_filename_matching() {
        assert!(is_kustomization_filename("kustomization.yaml"));
        assert!(is_kustomization_filename("Kustomization"));
        assert!(is_kustomization_filename("KUSTOMIZATION.YML"));
        assert!(!is_kustomization_filename("deployment.yaml"));
        assert!(!is_kustomization_filename("kustomization.json"));
    }

    #[test]
    fn factory_requires_local_root() {
        let info = RepoInfo {
            kind: RepoKind::Local,
            owner: String::new(),
            repo: String::new(),
            git_ref: "main".into(),
            base_url: String::new(),
            path: String::new(),
            ambiguous_suffix: String::new(),
            root_path: None,
        };
        assert!(new_fetcher(&info, "").is_err());
    }
}
