//! # Input Validation
//!
//! Accepts or rejects external strings before they reach network or
//! filesystem code. Covers SSRF prevention for analyze URLs and outbound TLS
//! probes, identifier hygiene for graph/node IDs, and home-bounded
//! resolution of local paths.
//!
//! All failures are [`Error::InvalidInput`] with a human-readable message;
//! nothing here panics.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use url::Url;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Maximum allowed length for the analyze request URL (and local paths).
pub const MAX_ANALYZE_URL_LENGTH: usize = 4096;

/// Maximum allowed length for a node ID (URL path segment).
pub const MAX_NODE_ID_LENGTH: usize = 2048;

/// Ensures the URL is safe for a server-side fetch (SSRF prevention).
///
/// Scheme must be `https`; the host must not be a private, loopback or
/// link-local address, nor an internal-looking hostname. Any public host is
/// accepted (including self-hosted GitLab/GitHub instances), so no allow
/// list is needed.
pub fn validate_analyze_url(raw_url: &str) -> Result<()> {
    if raw_url.is_empty() {
        return Err(Error::InvalidInput("URL is required".into()));
    }
    if raw_url.len() > MAX_ANALYZE_URL_LENGTH {
        return Err(Error::InvalidInput(format!(
            "URL exceeds maximum length of {MAX_ANALYZE_URL_LENGTH}"
        )));
    }

    let url = Url::parse(raw_url).map_err(|e| Error::InvalidInput(format!("invalid URL: {e}")))?;

    if url.scheme() != "https" {
        return Err(Error::InvalidInput("URL scheme must be https".into()));
    }

    let host = url
        .host_str()
        .map(|h| h.trim().to_ascii_lowercase())
        .unwrap_or_default();
    if host.is_empty() {
        return Err(Error::InvalidInput("invalid URL: missing host".into()));
    }

    reject_private_or_reserved_host(&host)
}

/// Ensures a hostname is safe for outbound connections (SSRF prevention).
/// Used before TLS dials to hosts derived from a graph.
pub fn validate_host(host: &str) -> Result<()> {
    let h = host.trim().to_ascii_lowercase();
    if h.is_empty() {
        return Err(Error::InvalidInput("host is required".into()));
    }
    reject_private_or_reserved_host(&h)
}

fn reject_private_or_reserved_host(host: &str) -> Result<()> {
    // Strip a trailing :port if present (IPv6 literals come in bracketed).
    let host = host
        .rsplit_once(':')
        .filter(|(h, p)| !h.contains(':') && p.chars().all(|c| c.is_ascii_digit()))
        .map(|(h, _)| h)
        .unwrap_or(host);
    let host = host.trim_start_matches('[').trim_end_matches(']');

    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_private_or_reserved_ip(&ip) {
            return Err(Error::InvalidInput(
                "URL host must not be a private or loopback address".into(),
            ));
        }
        return Ok(());
    }

    if host == "localhost"
        || host.ends_with(".localhost")
        || host.ends_with(".local")
        || host == "internal"
    {
        return Err(Error::InvalidInput(
            "URL host must not be a private or loopback hostname".into(),
        ));
    }
    Ok(())
}

fn is_private_or_reserved_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // Unique-local fc00::/7 and link-local fe80::/10.
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

/// Returns the export format if allowed, or `json` as the default.
/// Idempotent: `validate_format(validate_format(s)) == validate_format(s)`.
pub fn validate_format(format: &str) -> &'static str {
    match format.trim().to_ascii_lowercase().as_str() {
        "mermaid" => "mermaid",
        _ => "json",
    }
}

/// Returns an error if `id` is not a valid UUID. Prevents header injection
/// (the ID ends up in a `Content-Disposition` header) and keeps identifiers
/// uniform.
pub fn validate_graph_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::InvalidInput("graph ID is required".into()));
    }
    if id.len() > 64 {
        return Err(Error::InvalidInput("graph ID too long".into()));
    }
    Uuid::parse_str(id).map_err(|_| Error::InvalidInput("invalid graph ID format".into()))?;
    Ok(())
}

/// Ensures a node ID has a safe length and no control characters (prevents
/// log/header injection). No format requirement: both
/// `kind:owner/repo/path@ref` and `error:...` IDs must pass.
pub fn validate_node_id(node_id: &str) -> Result<()> {
    if node_id.is_empty() {
        return Err(Error::InvalidInput("node ID is required".into()));
    }
    if node_id.len() > MAX_NODE_ID_LENGTH {
        return Err(Error::InvalidInput("node ID too long".into()));
    }
    if node_id.chars().any(|c| c == '\r' || c == '\n' || c == '\0') {
        return Err(Error::InvalidInput(
            "invalid node ID: control characters not allowed".into(),
        ));
    }
    Ok(())
}

/// Returns true if `raw` looks like a local path (`file://`, `~`, `~/...`,
/// or absolute). Decides whether the analyze endpoint takes the local-path
/// branch instead of URL validation.
pub fn is_local_path(raw: &str) -> bool {
    let raw = raw.trim();
    if raw.is_empty() {
        return false;
    }
    raw.starts_with("file://")
        || raw.starts_with("~/")
        || raw == "~"
        || Path::new(raw).is_absolute()
}

/// Validates and resolves a local path: expands `~`, resolves symlinks, and
/// requires the result to be an existing directory strictly under the
/// canonical `$HOME`. Returns the canonical absolute path.
///
/// Only call when local mode is enabled.
pub fn validate_local_path(raw: &str) -> Result<PathBuf> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::InvalidInput("path is required".into()));
    }
    if raw.len() > MAX_ANALYZE_URL_LENGTH {
        return Err(Error::InvalidInput(format!(
            "path exceeds maximum length of {MAX_ANALYZE_URL_LENGTH}"
        )));
    }

    let home = home_dir()?;

    let path: PathBuf = if let Some(stripped) = raw.strip_prefix("file://") {
        PathBuf::from(format!("/{}", stripped.trim_start_matches('/')))
    } else if raw == "~" {
        home.clone()
    } else if let Some(rest) = raw.strip_prefix("~/") {
        home.join(rest)
    } else if Path::new(raw).is_absolute() {
        PathBuf::from(raw)
    } else {
        return Err(Error::InvalidInput(
            "path must be absolute or start with ~/".into(),
        ));
    };

    // Canonicalize both sides so symlinks in $HOME or the path cannot bypass
    // the boundary check.
    let resolved = path
        .canonicalize()
        .map_err(|_| Error::InvalidInput(format!("path does not exist: {}", path.display())))?;
    let home_resolved = home.canonicalize().unwrap_or(home);

    if resolved != home_resolved && !resolved.starts_with(&home_resolved) {
        return Err(Error::InvalidInput(format!(
            "path must be under $HOME ({})",
            home_resolved.display()
        )));
    }

    let meta = std::fs::metadata(&resolved)
        .map_err(|e| Error::InvalidInput(format!("cannot access path: {e}")))?;
    if !meta.is_dir() {
        return Err(Error::InvalidInput(format!(
            "path is not a directory: {}",
            resolved.display()
        )));
    }

    Ok(resolved)
}

/// The user's home directory; the hard boundary for all local analysis.
pub fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().ok_or_else(|| Error::Internal("cannot determine home directory".into()))
}
