//! TTL'd DNS cache.
//!
//! At 10k+ RPS the system resolver becomes the dominant error source; a
//! short cache collapses resolution to one lookup per host per TTL. Reads
//! dominate, so entries live behind a single `RwLock`. Eviction is lazy,
//! on access.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use tracing::debug;

#[derive(Debug, Clone)]
struct CacheEntry {
    addrs: Vec<SocketAddr>,
    expires_at: Instant,
}

/// `(host, port)` → resolved address set, expiring after the configured TTL.
#[derive(Debug)]
pub struct DnsCache {
    ttl: Duration,
    entries: RwLock<HashMap<(String, u16), CacheEntry>>,
}

impl DnsCache {
    pub fn new(ttl_s: u64) -> Self {
        Self {
            ttl: Duration::from_secs(ttl_s),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Cached addresses for a host, or `None` when absent or expired.
    /// Expired entries are evicted on the way out.
    pub fn lookup(&self, host: &str, port: u16) -> Option<Vec<SocketAddr>> {
        let key = (host.to_string(), port);
        {
            let entries = self.entries.read().unwrap();
            match entries.get(&key) {
                Some(entry) if entry.expires_at > Instant::now() => {
                    return Some(entry.addrs.clone());
                }
                Some(_) => {}
                None => return None,
            }
        }
        // Expired: take the write lock just to drop it.
        self.entries.write().unwrap().remove(&key);
        None
    }

    pub fn insert(&self, host: &str, port: u16, addrs: Vec<SocketAddr>) {
        let entry = CacheEntry {
            addrs,
            expires_at: Instant::now() + self.ttl,
        };
        self.entries
            .write()
            .unwrap()
            .insert((host.to_string(), port), entry);
    }

    /// Resolve through the cache, falling back to the system resolver on a
    /// miss and caching the result.
    pub fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        if let Some(addrs) = self.lookup(host, port) {
            return Ok(addrs);
        }
        let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses for {host}:{port}"),
            ));
        }
        debug!(host, port, count = addrs.len(), "dns cache fill");
        self.insert(host, port, addrs.clone());
        Ok(addrs)
    }

    /// Drop every expired entry.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.entries
            .write()
            .unwrap()
            .retain(|_, entry| entry.expires_at > now);
    }

    /// Cached addresses in `host:port:addr,addr,…` form, for verbose
    /// tracing of the pre-resolution hand-off.
    pub fn cached_addrs_label(&self, host: &str, port: u16) -> Option<String> {
        let addrs = self.lookup(host, port)?;
        let joined = addrs
            .iter()
            .map(|a| a.ip().to_string())
            .collect::<Vec<_>>()
            .join(",");
        Some(format!("{host}:{port}:{joined}"))
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Host portion of a URL.
pub fn extract_host(url: &str) -> Option<String> {
    reqwest::Url::parse(url)
        .ok()?
        .host_str()
        .map(str::to_string)
}

/// Port of a URL, falling back to the scheme default (443 when unknown).
pub fn extract_port(url: &str) -> u16 {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.port_or_known_default())
        .unwrap_or(443)
}

/// Adapter plugging the cache into the HTTP client's resolver seam, so
/// worker clients bypass the system resolver once a host is cached.
///
/// The resolver callback only sees the hostname; cache entries written
/// through this path use port 0.
#[derive(Clone)]
pub struct CachingResolver {
    cache: Arc<DnsCache>,
}

impl CachingResolver {
    pub fn new(cache: Arc<DnsCache>) -> Self {
        Self { cache }
    }
}

impl Resolve for CachingResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let cache = self.cache.clone();
        let host = name.as_str().to_string();
        Box::pin(async move {
            if let Some(addrs) = cache.lookup(&host, 0) {
                let iter: Addrs = Box::new(addrs.into_iter());
                return Ok(iter);
            }

            let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), 0u16))
                .await
                .map_err(|e| -> Box<dyn std::error::Error + Send + Sync> { Box::new(e) })?
                .collect();
            cache.insert(&host, 0, addrs.clone());
            debug!(host = %host, count = addrs.len(), "resolved and cached");
            let iter: Addrs = Box::new(addrs.into_iter());
            Ok(iter)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_lookup_miss() {
        let cache = DnsCache::new(60);
        assert!(cache.lookup("example.com", 80).is_none());
    }

    #[test]
    fn test_insert_and_lookup() {
        let cache = DnsCache::new(60);
        cache.insert("example.com", 443, vec![addr("93.184.216.34:443")]);
        let addrs = cache.lookup("example.com", 443).unwrap();
        assert_eq!(addrs.len(), 1);
        // Different port is a different key.
        assert!(cache.lookup("example.com", 80).is_none());
    }

    #[test]
    fn test_expiry_evicts_lazily() {
        let cache = DnsCache::new(0); // everything expires immediately
        cache.insert("example.com", 80, vec![addr("10.0.0.1:80")]);
        assert!(cache.lookup("example.com", 80).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_purge_expired() {
        let cache = DnsCache::new(0);
        cache.insert("a.example", 80, vec![addr("10.0.0.1:80")]);
        cache.insert("b.example", 80, vec![addr("10.0.0.2:80")]);
        assert_eq!(cache.len(), 2);
        cache.purge_expired();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_resolve_localhost_fills_cache() {
        let cache = DnsCache::new(60);
        let addrs = cache.resolve("localhost", 8080).unwrap();
        assert!(!addrs.is_empty());
        assert!(cache.lookup("localhost", 8080).is_some());
    }

    #[test]
    fn test_cached_addrs_label() {
        let cache = DnsCache::new(60);
        cache.insert("api.example", 443, vec![addr("10.1.1.1:443"), addr("10.1.1.2:443")]);
        let label = cache.cached_addrs_label("api.example", 443).unwrap();
        assert_eq!(label, "api.example:443:10.1.1.1,10.1.1.2");
    }

    #[test]
    fn test_extract_host_and_port() {
        assert_eq!(extract_host("https://api.example.com/v1").unwrap(), "api.example.com");
        assert_eq!(extract_host("http://10.0.0.5:8080/x").unwrap(), "10.0.0.5");
        assert_eq!(extract_port("https://api.example.com/v1"), 443);
        assert_eq!(extract_port("http://api.example.com/v1"), 80);
        assert_eq!(extract_port("http://api.example.com:9876/"), 9876);
        assert!(extract_host("not a url").is_none());
    }
}
