//! Local filesystem fetcher.
//!
//! Rooted at a validated repository root. Every operation re-joins the
//! requested path with the root and rejects any result that escapes it, so
//! walker-supplied relative paths cannot read outside the repository.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use path_clean::PathClean;
use tracing::debug;
use walkdir::WalkDir;

use super::{is_kustomization_filename, Fetcher, KUSTOMIZATION_FILENAMES};
use crate::error::{Error, Result};
use crate::repository::RepoInfo;

pub struct LocalFetcher {
    root: PathBuf,
}

impl LocalFetcher {
    pub fn new(info: &RepoInfo) -> Result<Self> {
        let root = info
            .root_path
            .as_ref()
            .ok_or_else(|| Error::Internal("local fetcher requires a repository root".into()))?;
        let root = root
            .canonicalize()
            .map_err(|e| Error::InvalidInput(format!("invalid root path: {e}")))?;
        Ok(LocalFetcher { root })
    }

    /// Joins `path` onto the root and ensures the cleaned result stays under
    /// it. The check is lexical; symlinked roots were canonicalized at
    /// construction.
    fn join_path(&self, path: &str) -> Result<PathBuf> {
        let trimmed = path.trim_matches('/');
        let full = self.root.join(trimmed).clean();
        if full != self.root && !full.starts_with(&self.root) {
            return Err(Error::InvalidInput(format!(
                "path escapes repository root: {path}"
            )));
        }
        Ok(full)
    }
}

#[async_trait]
impl Fetcher for LocalFetcher {
    async fn fetch_file(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.join_path(path)?;
        debug!(path = %full.display(), "fetching local file");
        Ok(tokio::fs::read(&full).await?)
    }

    async fn list_files(&self) -> Result<Vec<String>> {
        let root = self.root.clone();
        let mut files = Vec::new();
        for entry in WalkDir::new(&root)
            .into_iter()
            .filter_entry(|e| e.file_name() != ".git")
        {
            let entry = entry.map_err(|e| Error::Internal(format!("list files: {e}")))?;
            if entry.file_type().is_dir() {
                continue;
            }
            if let Ok(rel) = entry.path().strip_prefix(&root) {
                files.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
        debug!(count = files.len(), "listed local repository files");
        Ok(files)
    }

    async fn find_kustomization(&self, path: &str) -> Result<String> {
        let path = path.trim_matches('/');

        // The path itself may already be a kustomization file.
        let full = self.join_path(path)?;
        if full.is_file() {
            let content = tokio::fs::read(&full).await?;
            return String::from_utf8(content)
                .map_err(|e| Error::Parse(format!("kustomization is not UTF-8: {e}")));
        }

        for name in KUSTOMIZATION_FILENAMES {
            let candidate = if path.is_empty() {
                name.to_string()
            } else {
                format!("{path}/{name}")
            };
            let Ok(full) = self.join_path(&candidate) else {
                continue;
            };
            if let Ok(content) = tokio::fs::read(&full).await {
                debug!(path = %full.display(), "found kustomization file");
                return String::from_utf8(content)
                    .map_err(|e| Error::Parse(format!("kustomization is not UTF-8: {e}")));
            }
        }

        // Last resort: scan the directory for a case variant.
        if full.is_dir() {
            if let Ok(mut entries) = tokio::fs::read_dir(&full).await {
                while let Ok(Some(entry)) = entries.next_entry().await {
                    let name = entry.file_name();
                    let name = name.to_string_lossy();
                    if entry.path().is_file() && is_kustomization_filename(&name) {
                        let content = tokio::fs::read(entry.path()).await?;
                        return String::from_utf8(content).map_err(|e| {
                            Error::Parse(format!("kustomization is not UTF-8: {e}"))
                        });
                    }
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
    use crate::repository::RepoKind;

    fn fetcher_for(root: &Path) -> LocalFetcher {
        let info = RepoInfo {
            kind: RepoKind::Local,
            owner: String::new(),
            repo: String::new(),
            git_ref: "main".into(),
            base_url: String::new(),
            path: String::new(),
            ambiguous_suffix: String::new(),
            root_path: Some(root.to_path_buf()),
        };
        LocalFetcher::new(&info).unwrap()
    }

    #[test]
    fn join_rejects_escapes() {
        let tmp = tempfile::tempdir().unwrap();
        let f = fetcher_for(tmp.path());
        assert!(f.join_path("overlay/base").is_ok());
        assert!(f.join_path("").is_ok());
        assert!(f.join_path("../outside").is_err());
        assert!(f.join_path("a/../../outside").is_err());
    }

    #[tokio::test]
    async fn finds_kustomization_by_name_and_case() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("base")).unwrap();
        std::fs::write(
            tmp.path().join("base/kustomization.yaml"),
            "resources:\n- deploy.yaml\n",
        )
        .unwrap();
        std::fs::create_dir_all(tmp.path().join("odd")).unwrap();
        std::fs::write(tmp.path().join("odd/KUSTOMIZATION.YAML"), "resources: []\n").unwrap();

        let f = fetcher_for(tmp.path());
        let content = f.find_kustomization("base").await.unwrap();
        assert!(content.contains("deploy.yaml"));

        // Case variant found via the directory scan.
        assert!(f.find_kustomization("odd").await.is_ok());

        assert!(matches!(
            f.find_kustomization("missing").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn listing_skips_git_dir() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join(".git")).unwrap();
        std::fs::write(tmp.path().join(".git/config"), "x").unwrap();
        std::fs::create_dir_all(tmp.path().join("overlay")).unwrap();
        std::fs::write(tmp.path().join("overlay/kustomization.yaml"), "x").unwrap();

        let f = fetcher_for(tmp.path());
        let files = f.list_files().await.unwrap();
        assert_eq!(files, vec!["overlay/kustomization.yaml".to_string()]);
    }
}
