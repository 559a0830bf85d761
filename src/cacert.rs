//! # CA Bundle Collector
//!
//! Collects CA certificates from the TLS hosts referenced by a graph and
//! bundles them as concatenated PEM, for downstream GitOps tooling that
//! needs a trust anchor for self-signed or corporate CAs.
//!
//! The handshake is *validating*: certificates are verified against the
//! native root store, never skipped, so only chains the system already
//! trusts end up in a bundle. Per-host results are cached with a TTL and
//! shared across analyses; the cache lock is released around the dial, so a
//! concurrent miss on the same host costs a duplicate handshake, nothing
//! more.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::types::Graph;
use crate::validation;

/// How long a collected bundle and per-host cache entries stay valid.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Handshake deadline per host.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

struct CacheEntry {
    pem: String,
    expires_at: Instant,
}

/// Collects CA certificates for the unique hosts of a graph, with a TTL
/// per-host cache. Safe for concurrent use; construct once at startup.
pub struct Collector {
    ttl: Duration,
    cache: RwLock<HashMap<String, CacheEntry>>,
}

impl Collector {
    /// Creates a collector with the given TTL for cache entries and bundle
    /// expiry. Non-positive TTLs fall back to [`DEFAULT_TTL`].
    pub fn new(ttl: Duration) -> Self {
        let ttl = if ttl.is_zero() { DEFAULT_TTL } else { ttl };
        Collector {
            ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Gathers certs from every unique host in the graph's base URLs,
    /// deduplicates them by fingerprint and attaches the PEM bundle plus its
    /// expiry to the graph. Host failures are logged and skipped.
    pub async fn collect_and_attach(&self, graph: &mut Graph) {
        let hosts = unique_hosts(graph);
        if hosts.is_empty() {
            debug!("CA bundle: no HTTPS hosts in graph");
            return;
        }

        // The same CA often signs several hosts; dedupe by DER fingerprint.
        let mut seen: HashSet<String> = HashSet::new();
        let mut bundle = String::new();
        let mut cert_count = 0usize;

        for host in &hosts {
            if let Err(err) = validation::validate_host(host) {
                warn!(host = %host, error = %err, "CA bundle: skipping host");
                continue;
            }

            let pem_block = match self.pem_for_host(host).await {
                Ok(pem) => pem,
                Err(err) => {
                    warn!(host = %host, error = %err, "CA bundle: failed to get certs");
                    continue;
                }
            };

            for block in pem::parse_many(pem_block.as_bytes()).unwrap_or_default() {
                if block.tag() != "CERTIFICATE" {
                    continue;
                }
                let fingerprint = fingerprint(block.contents());
                if !seen.insert(fingerprint) {
                    continue;
                }
                bundle.push_str(&pem::encode(&block));
                cert_count += 1;
            }
        }

        if bundle.is_empty() {
            warn!("CA bundle: no certs collected");
            return;
        }

        graph.ca_bundle = Some(bundle);
        graph.ca_bundle_expires = Some(
            (chrono::Utc::now()
                + chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::hours(24)))
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        );
        info!(
            certs = cert_count,
            hosts = hosts.len(),
            "CA bundle: collected unique certs"
        );
    }

    /// PEM chain for one host, from cache or via a fresh handshake.
    async fn pem_for_host(&self, host: &str) -> Result<String> {
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(host) {
                if Instant::now() < entry.expires_at {
                    return Ok(entry.pem.clone());
                }
            }
        }

        // Dial outside the lock; a concurrent miss just repeats the work.
        let pem = fetch_certs_via_tls(host).await?;

        let mut cache = self.cache.write().await;
        cache.insert(
            host.to_string(),
            CacheEntry {
                pem: pem.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(pem)
    }
}

/// Unique TLS hosts from the graph's base URLs, sorted for determinism.
/// `github.com` is rewritten to `api.github.com`, which is where the API
/// traffic actually goes.
pub fn unique_hosts(graph: &Graph) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    for base_url in graph.base_urls.values() {
        if base_url.is_empty() {
            continue;
        }
        match resolve_tls_host(base_url) {
            Ok(Some(host)) => {
                seen.insert(host);
            }
            Ok(None) => {}
            Err(err) => warn!(base_url = %base_url, error = %err, "CA bundle: invalid base URL"),
        }
    }
    let mut hosts: Vec<String> = seen.into_iter().collect();
    hosts.sort();
    hosts
}

/// Maps a repo base URL to the host the TLS connection goes to.
pub fn resolve_tls_host(base_url: &str) -> Result<Option<String>> {
    let url = Url::parse(base_url).map_err(|e| Error::InvalidInput(e.to_string()))?;
    let host = url
        .host_str()
        .map(|h| h.trim().to_ascii_lowercase())
        .unwrap_or_default();
    if host.is_empty() {
        return Ok(None);
    }
    if host == "github.com" {
        return Ok(Some("api.github.com".to_string()));
    }
    Ok(Some(host))
}

/// Performs a validating TLS handshake against the native root store and
/// returns the peer chain as PEM. Only succeeds for hosts the system
/// already trusts.
async fn fetch_certs_via_tls(host: &str) -> Result<String> {
    let mut roots = RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().certs {
        // Individual unparsable platform certs are skipped, not fatal.
        let _ = roots.add(cert);
    }
    if roots.is_empty() {
        return Err(Error::Internal("no native root certificates available".into()));
    }

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| Error::InvalidInput(format!("invalid TLS host {host}: {e}")))?;

    let dial = async {
        let tcp = TcpStream::connect((host, 443))
            .await
            .map_err(|e| Error::Upstream(format!("connect {host}:443: {e}")))?;
        connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| Error::Upstream(format!("TLS handshake with {host}: {e}")))
    };
    let stream = tokio::time::timeout(DIAL_TIMEOUT, dial)
        .await
        .map_err(|_| Error::Upstream(format!("TLS dial to {host} timed out")))??;

    let (_, session) = stream.get_ref();
    let chain = session
        .peer_certificates()
        .ok_or_else(|| Error::Upstream(format!("no peer certificates from {host}")))?;

    // Encode the full presented chain (leaf + intermediates). The leaf is
    // redundant for verification but harmless in a bundle.
    let mut out = String::new();
    for cert in chain {
        let block = pem::Pem::new("CERTIFICATE", cert.as_ref().to_vec());
        out.push_str(&pem::encode(&block));
    }
    Ok(out)
}

/// SHA-256 fingerprint over raw DER, hex-encoded.
fn fingerprint(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
