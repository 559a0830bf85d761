//! # Reference Parsing
//!
//! Classifies a single entry from a kustomization's `resources`, `bases` or
//! `components` list.
//!
//! Supported forms:
//! - `https://github.com/org/repo//path?ref=branch`: Kustomize `//`
//!   separator between repo URL and in-repo path
//! - `https://host/org/repo/path?ref=branch`: plain form, first two
//!   segments are owner/repo
//! - `git@host:org/repo.git//path?ref=branch`: SSH form, rewritten to https
//! - `./path`, `../path`: explicit relative
//! - `path`: implicit relative (treated as `./path`)

use url::Url;

use crate::error::{Error, Result};
use crate::repository::{self, RepoInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    Remote,
    Relative,
}

/// A classified kustomization entry.
#[derive(Debug, Clone)]
pub struct Reference {
    pub kind: ReferenceKind,
    pub original: String,

    /// Target repository, for remote references.
    pub repo_info: Option<RepoInfo>,
    /// In-repo path of the target, for remote references.
    pub path: String,

    /// Path relative to the current directory, for relative references.
    pub relative_path: String,
}

impl Reference {
    fn relative(original: &str) -> Reference {
        Reference {
            kind: ReferenceKind::Relative,
            original: original.to_string(),
            repo_info: None,
            path: String::new(),
            relative_path: original.to_string(),
        }
    }
}

/// Parses a reference string. Remote references re-enter the repository
/// detector to normalize provider classification, so this may probe unknown
/// hosts; the token is forwarded for that probe.
pub async fn parse_reference(reference: &str, token: &str) -> Result<Reference> {
    if reference.starts_with("https://") || reference.starts_with("http://") {
        return parse_http_reference(reference, token).await;
    }

    if let Some(rest) = reference.strip_prefix("git@") {
        // git@host:org/repo.git -> https://host/org/repo.git
        let rewritten = format!("https://{}", rest.replacen(':', "/", 1));
        let mut parsed = parse_http_reference(&rewritten, token).await?;
        parsed.original = reference.to_string();
        return Ok(parsed);
    }

    // Explicit (./, ../) and implicit relative paths resolve the same way:
    // joined against the current directory by the walker.
    Ok(Reference::relative(reference))
}

async fn parse_http_reference(reference: &str, token: &str) -> Result<Reference> {
    let (repo_url, path, ref_override) = split_remote_reference(reference)?;

    let mut repo_info = repository::detect_repository(&repo_url, token).await?;
    if let Some(ref_override) = ref_override {
        repo_info.git_ref = ref_override;
    }

    Ok(Reference {
        kind: ReferenceKind::Remote,
        original: reference.to_string(),
        repo_info: Some(repo_info),
        path: path.trim_matches('/').to_string(),
        relative_path: String::new(),
    })
}

/// Splits a remote reference into `(repo_url, in_repo_path, ref_override)`.
///
/// With more than one `//` the Kustomize separator form applies: split on
/// the second `//`. Otherwise the first two path segments are owner/repo
/// and the rest is the path. A `?ref=` query always wins over any
/// path-embedded revision.
fn split_remote_reference(reference: &str) -> Result<(String, String, Option<String>)> {
    let double_slashes = reference.matches("//").count();

    if double_slashes > 1 {
        // Kustomize form: https://host/org/repo//path?ref=branch
        let Some(scheme_idx) = reference.find("//") else {
            return Err(Error::Parse(format!("invalid reference: {reference}")));
        };
        let remaining = &reference[scheme_idx + 2..];
        if let Some(second) = remaining.find("//") {
            let repo_url = reference[..scheme_idx + 2 + second].to_string();
            let path_with_ref = &remaining[second + 2..];
            let (path, ref_override) = match path_with_ref.split_once("?ref=") {
                Some((p, r)) => (p.to_string(), Some(r.to_string())),
                None => (path_with_ref.to_string(), None),
            };
            return Ok((repo_url, path, ref_override));
        }
        return Ok((reference.to_string(), String::new(), None));
    }

    // Plain form: https://host/org/repo/path?ref=branch
    let url =
        Url::parse(reference).map_err(|e| Error::Parse(format!("invalid URL: {e}")))?;
    let ref_override = url
        .query_pairs()
        .find(|(k, _)| k == "ref")
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty());

    let segments: Vec<&str> = url
        .path()
        .trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();
    let host = url.host_str().unwrap_or_default();

    if segments.len() >= 2 {
        let repo_url = format!("{}://{}/{}/{}", url.scheme(), host, segments[0], segments[1]);
        let path = segments[2..].join("/");
        Ok((repo_url, path, ref_override))
    } else {
        Ok((
            format!("{}://{}{}", url.scheme(), host, url.path()),
            String::new(),
            ref_override,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::RepoKind;

    #[tokio::test]
    async fn relative_references() {
        for raw in ["./base", "../base", "base", "components/foo", "deployment-02"] {
            let parsed = parse_reference(raw, "").await.unwrap();
            assert_eq!(parsed.kind, ReferenceKind::Relative, "{raw}");
            assert_eq!(parsed.relative_path, raw);
            assert_eq!(parsed.original, raw);
        }
    }

    #[tokio::test]
    async fn remote_with_double_slash_separator() {
        let parsed = parse_reference("https://github.com/x/y//components/c?ref=v1", "")
            .await
            .unwrap();
        assert_eq!(parsed.kind, ReferenceKind::Remote);
        let repo = parsed.repo_info.unwrap();
        assert_eq!(repo.kind, RepoKind::GitHub);
        assert_eq!(repo.owner, "x");
        assert_eq!(repo.repo, "y");
        assert_eq!(repo.git_ref, "v1");
        assert_eq!(parsed.path, "components/c");
    }

    #[tokio::test]
    async fn remote_plain_form() {
        let parsed = parse_reference("https://github.com/x/y/deploy/base?ref=stable", "")
            .await
            .unwrap();
        let repo = parsed.repo_info.unwrap();
        assert_eq!(repo.owner, "x");
        assert_eq!(repo.repo, "y");
        assert_eq!(repo.git_ref, "stable");
        assert_eq!(parsed.path, "deploy/base");
    }

    #[tokio::test]
    async fn remote_without_ref_keeps_default() {
        let parsed = parse_reference("https://github.com/x/y//deploy", "")
            .await
            .unwrap();
        assert_eq!(parsed.repo_info.unwrap().git_ref, "main");
        assert_eq!(parsed.path, "deploy");
    }

    #[tokio::test]
    async fn git_ssh_is_rewritten_to_https() {
        let parsed = parse_reference("git@github.com:x/y.git//deploy?ref=v2", "")
            .await
            .unwrap();
        assert_eq!(parsed.kind, ReferenceKind::Remote);
        assert_eq!(parsed.original, "git@github.com:x/y.git//deploy?ref=v2");
        let repo = parsed.repo_info.unwrap();
        assert_eq!(repo.kind, RepoKind::GitHub);
        assert_eq!(repo.owner, "x");
        assert_eq!(repo.repo, "y");
        assert_eq!(repo.git_ref, "v2");
        assert_eq!(parsed.path, "deploy");
    }

    #[tokio::test]
    async fn remote_gitlab_nested_groups() {
        let parsed = parse_reference("https://gitlab.com/g/sg/p//deploy/base?ref=main", "")
            .await
            .unwrap();
        let repo = parsed.repo_info.unwrap();
        assert_eq!(repo.kind, RepoKind::GitLab);
        // The double-slash form keeps the whole nested namespace in the repo
        // URL; the last segment is the project.
        assert_eq!(repo.owner, "g/sg");
        assert_eq!(repo.repo, "p");
        assert_eq!(repo.git_ref, "main");
        assert_eq!(parsed.path, "deploy/base");
    }

    #[test]
    fn split_remote_reference_forms() {
        let (repo, path, r) =
            split_remote_reference("https://github.com/o/r//a/b?ref=v1").unwrap();
        assert_eq!(repo, "https://github.com/o/r");
        assert_eq!(path, "a/b");
        assert_eq!(r.as_deref(), Some("v1"));

        let (repo, path, r) = split_remote_reference("https://github.com/o/r/a/b").unwrap();
        assert_eq!(repo, "https://github.com/o/r");
        assert_eq!(path, "a/b");
        assert_eq!(r, None);

        let (repo, path, r) = split_remote_reference("https://github.com/o/r").unwrap();
        assert_eq!(repo, "https://github.com/o/r");
        assert_eq!(path, "");
        assert_eq!(r, None);
    }
}
