//! Endpoint discovery for XMPP connections.
//!
//! Resolution follows RFC 6120 section 3.2:
//! 1. An IP literal is used as-is
//! 2. Query `_xmpp-client._tcp.{domain}` (or `_xmpp-server`) SRV records,
//!    sort by priority then weight, pick one of the lowest-priority records
//!    at random proportionally to weight, and resolve its target
//! 3. Fall back to an address lookup of the domain at the requested port
//!
//! Results are kept in an [`EndpointCache`] owned by the [`Resolver`]. For
//! SRV-backed names the cache holds the whole candidate list, so every cache
//! hit performs a fresh weighted selection.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::ProtoErrorKind;
use hickory_resolver::{ResolveErrorKind, Resolver as HickoryResolver};
use rand::Rng;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Default client port as per RFC 6120.
pub const DEFAULT_CLIENT_PORT: u16 = 5222;
/// Default server-to-server port.
pub const DEFAULT_SERVER_PORT: u16 = 5269;

/// DNS resolution errors.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// No records found for the domain.
    #[error("no DNS records found for domain: {0}")]
    NoRecords(String),

    /// Domain resolution failed.
    #[error("DNS resolution failed for {domain}: {message}")]
    ResolutionFailed { domain: String, message: String },
}

/// Which SRV service to query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServiceKind {
    #[default]
    Client,
    Server,
}

impl ServiceKind {
    pub fn srv_prefix(&self) -> &'static str {
        match self {
            ServiceKind::Client => "_xmpp-client._tcp",
            ServiceKind::Server => "_xmpp-server._tcp",
        }
    }
}

/// An unresolved SRV target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvCandidate {
    pub host: String,
    pub port: u16,
    /// Lower is preferred.
    pub priority: u16,
    /// Relative share of traffic within one priority.
    pub weight: u16,
}

impl SrvCandidate {
    pub fn new(host: impl Into<String>, port: u16, priority: u16, weight: u16) -> Self {
        Self {
            host: host.into(),
            port,
            priority,
            weight,
        }
    }
}

/// A concrete host and port to connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The socket address, when `host` is an IP address.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.host
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, self.port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(_)) => write!(f, "[{}]:{}", self.host, self.port),
            _ => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

/// The DNS queries the resolver needs.
#[async_trait]
pub trait DnsBackend: Send + Sync {
    /// SRV records for a fully formed service name (`_xmpp-client._tcp.example.com`).
    async fn srv_lookup(&self, name: &str) -> Result<Vec<SrvCandidate>, ResolveError>;

    /// Addresses for a host name.
    async fn ip_lookup(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError>;
}

/// Type alias for the Tokio-based resolver.
pub type TokioResolver = HickoryResolver<TokioConnectionProvider>;

/// [`DnsBackend`] backed by hickory.
#[derive(Clone)]
pub struct HickoryBackend {
    resolver: Arc<TokioResolver>,
}

impl HickoryBackend {
    pub fn new() -> Self {
        let resolver = HickoryResolver::builder_with_config(
            ResolverConfig::default(),
            TokioConnectionProvider::default(),
        )
        .build();
        Self {
            resolver: Arc::new(resolver),
        }
    }

    pub fn with_config(config: ResolverConfig, opts: ResolverOpts) -> Self {
        let resolver =
            HickoryResolver::builder_with_config(config, TokioConnectionProvider::default())
                .with_options(opts)
                .build();
        Self {
            resolver: Arc::new(resolver),
        }
    }
}

impl Default for HickoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DnsBackend for HickoryBackend {
    async fn srv_lookup(&self, name: &str) -> Result<Vec<SrvCandidate>, ResolveError> {
        let response = self
            .resolver
            .srv_lookup(name)
            .await
            .map_err(|e| lookup_error(name, e))?;

        let candidates: Vec<SrvCandidate> = response
            .iter()
            .filter_map(|srv| {
                let target = srv.target().to_utf8();
                // "." means the service is decidedly not available
                if target == "." || target.is_empty() {
                    return None;
                }
                Some(SrvCandidate::new(
                    target.trim_end_matches('.'),
                    srv.port(),
                    srv.priority(),
                    srv.weight(),
                ))
            })
            .collect();

        if candidates.is_empty() {
            return Err(ResolveError::NoRecords(name.to_string()));
        }
        Ok(candidates)
    }

    async fn ip_lookup(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        let response = self
            .resolver
            .lookup_ip(host)
            .await
            .map_err(|e| lookup_error(host, e))?;
        Ok(response.iter().collect())
    }
}

fn lookup_error(name: &str, error: hickory_resolver::ResolveError) -> ResolveError {
    if is_no_records_error(&error) {
        ResolveError::NoRecords(name.to_string())
    } else {
        ResolveError::ResolutionFailed {
            domain: name.to_string(),
            message: error.to_string(),
        }
    }
}

/// In hickory-resolver 0.25, NoRecordsFound lives in ProtoErrorKind.
fn is_no_records_error(error: &hickory_resolver::ResolveError) -> bool {
    if let ResolveErrorKind::Proto(proto_error) = error.kind() {
        matches!(proto_error.kind(), ProtoErrorKind::NoRecordsFound { .. })
    } else {
        false
    }
}

#[derive(Debug, Clone)]
enum CacheEntry {
    Resolved(Endpoint),
    Candidates(Vec<SrvCandidate>),
}

/// Resolution results keyed by the originally requested name.
///
/// Entries never expire. Cloning shares the underlying map, so one cache can
/// be constructed per process and handed to every resolver.
#[derive(Debug, Clone, Default)]
pub struct EndpointCache {
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
}

impl EndpointCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn get(&self, name: &str) -> Option<CacheEntry> {
        self.lock().get(name).cloned()
    }

    fn insert(&self, name: &str, entry: CacheEntry) {
        self.lock().insert(name.to_string(), entry);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        // Entries are plain values, so poisoning is ignored.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Resolves XMPP domains to connectable endpoints.
#[derive(Clone)]
pub struct Resolver {
    backend: Arc<dyn DnsBackend>,
    cache: EndpointCache,
    service: ServiceKind,
}

impl Resolver {
    /// A client resolver backed by hickory with its default upstreams.
    pub fn new(cache: EndpointCache) -> Self {
        Self::with_backend(Arc::new(HickoryBackend::new()), cache)
    }

    pub fn with_backend(backend: Arc<dyn DnsBackend>, cache: EndpointCache) -> Self {
        Self {
            backend,
            cache,
            service: ServiceKind::Client,
        }
    }

    pub fn service(mut self, service: ServiceKind) -> Self {
        self.service = service;
        self
    }

    pub fn cache(&self) -> &EndpointCache {
        &self.cache
    }

    /// Resolve `name` to an endpoint, `port` being used when no SRV record
    /// applies. With `use_cache` false the cache is not consulted, but fresh
    /// results are still stored.
    #[instrument(skip(self), name = "dns.resolve")]
    pub async fn resolve(
        &self,
        name: &str,
        port: u16,
        use_cache: bool,
    ) -> Result<Endpoint, ResolveError> {
        if name.parse::<IpAddr>().is_ok() {
            return Ok(Endpoint::new(name, port));
        }

        // Set once a candidate list for `name` is in the cache, so a fallback
        // endpoint does not replace it.
        let mut has_candidates = false;

        if use_cache {
            match self.cache.get(name) {
                Some(CacheEntry::Resolved(endpoint)) => {
                    debug!(%endpoint, "Endpoint cache hit");
                    return Ok(endpoint);
                }
                Some(CacheEntry::Candidates(candidates)) => {
                    has_candidates = true;
                    if let Some(choice) = choose_candidate(&candidates) {
                        debug!(host = %choice.host, port = choice.port, "Re-selected cached SRV target");
                        match self.resolve_target(&choice.host, choice.port).await {
                            Ok(endpoint) => return Ok(endpoint),
                            Err(e) => {
                                warn!(host = %choice.host, error = %e, "Cached SRV target unresolvable, falling back to A/AAAA")
                            }
                        }
                    }
                }
                None => {}
            }
        }

        if !has_candidates {
            match self.srv_candidates(name).await {
                Ok(candidates) => {
                    self.cache
                        .insert(name, CacheEntry::Candidates(candidates.clone()));
                    has_candidates = true;
                    if let Some(choice) = choose_candidate(&candidates) {
                        debug!(host = %choice.host, port = choice.port, "Selected SRV target");
                        match self.resolve_target(&choice.host, choice.port).await {
                            Ok(endpoint) => return Ok(endpoint),
                            Err(e) => {
                                warn!(host = %choice.host, error = %e, "SRV target unresolvable, falling back to A/AAAA")
                            }
                        }
                    }
                }
                Err(ResolveError::NoRecords(_)) => {
                    debug!("No SRV records exist, falling back to A/AAAA");
                }
                Err(e) => {
                    warn!(error = %e, "SRV lookup failed, falling back to A/AAAA");
                }
            }
        }

        let endpoint = self.resolve_target(name, port).await?;
        if !has_candidates {
            self.cache.insert(name, CacheEntry::Resolved(endpoint.clone()));
        }
        Ok(endpoint)
    }

    /// The SRV candidates for `domain`, sorted by priority then weight.
    /// Never cached; intended for diagnostics.
    pub async fn srv_candidates(&self, domain: &str) -> Result<Vec<SrvCandidate>, ResolveError> {
        let srv_name = format!("{}.{}", self.service.srv_prefix(), domain);
        debug!(srv_name = %srv_name, "Resolving SRV records");

        let mut candidates = self.backend.srv_lookup(&srv_name).await?;
        if candidates.is_empty() {
            return Err(ResolveError::NoRecords(srv_name));
        }
        candidates.sort_by_key(|c| (c.priority, c.weight));
        Ok(candidates)
    }

    /// Address lookup of a single host, without any SRV step.
    async fn resolve_target(&self, host: &str, port: u16) -> Result<Endpoint, ResolveError> {
        if host.parse::<IpAddr>().is_ok() {
            return Ok(Endpoint::new(host, port));
        }
        let addrs = self.backend.ip_lookup(host).await?;
        let ip = addrs
            .first()
            .ok_or_else(|| ResolveError::NoRecords(host.to_string()))?;
        debug!(host = %host, %ip, count = addrs.len(), "Resolved host");
        Ok(Endpoint::new(ip.to_string(), port))
    }
}

/// Weighted random choice among the lowest-priority candidates.
fn choose_candidate(candidates: &[SrvCandidate]) -> Option<&SrvCandidate> {
    let best = candidates.iter().map(|c| c.priority).min()?;
    let group: Vec<&SrvCandidate> = candidates.iter().filter(|c| c.priority == best).collect();

    let total: u32 = group.iter().map(|c| u32::from(c.weight)).sum();
    let mut rng = rand::rng();
    if total == 0 {
        return group.get(rng.random_range(0..group.len())).copied();
    }

    let mut pick = rng.random_range(0..total);
    for candidate in &group {
        let weight = u32::from(candidate.weight);
        if pick < weight {
            return Some(*candidate);
        }
        pick -= weight;
    }
    group.last().copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeDns {
        srv: HashMap<String, Vec<SrvCandidate>>,
        ips: HashMap<String, Vec<IpAddr>>,
        srv_fails: bool,
        srv_calls: AtomicUsize,
        ip_calls: AtomicUsize,
    }

    impl FakeDns {
        fn total_calls(&self) -> usize {
            self.srv_calls.load(Ordering::SeqCst) + self.ip_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DnsBackend for FakeDns {
        async fn srv_lookup(&self, name: &str) -> Result<Vec<SrvCandidate>, ResolveError> {
            self.srv_calls.fetch_add(1, Ordering::SeqCst);
            if self.srv_fails {
                return Err(ResolveError::ResolutionFailed {
                    domain: name.to_string(),
                    message: "SERVFAIL".to_string(),
                });
            }
            self.srv
                .get(name)
                .cloned()
                .ok_or_else(|| ResolveError::NoRecords(name.to_string()))
        }

        async fn ip_lookup(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
            self.ip_calls.fetch_add(1, Ordering::SeqCst);
            self.ips
                .get(host)
                .cloned()
                .ok_or_else(|| ResolveError::NoRecords(host.to_string()))
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn srv_fake() -> Arc<FakeDns> {
        let mut fake = FakeDns::default();
        fake.srv.insert(
            "_xmpp-client._tcp.example.com".to_string(),
            vec![
                SrvCandidate::new("c.example.com", 5224, 20, 100),
                SrvCandidate::new("a.example.com", 5222, 10, 5),
                SrvCandidate::new("b.example.com", 5223, 10, 1),
            ],
        );
        fake.ips.insert("a.example.com".to_string(), vec![ip("10.0.0.1")]);
        fake.ips.insert("b.example.com".to_string(), vec![ip("10.0.0.2")]);
        fake.ips.insert("c.example.com".to_string(), vec![ip("10.0.0.3")]);
        Arc::new(fake)
    }

    #[tokio::test]
    async fn test_ip_literal_is_returned_without_lookup() {
        let fake = Arc::new(FakeDns::default());
        let resolver = Resolver::with_backend(fake.clone(), EndpointCache::new());

        for literal in ["127.0.0.1", "::1", "192.168.10.20"] {
            let endpoint = resolver.resolve(literal, 5333, true).await.unwrap();
            assert_eq!(endpoint, Endpoint::new(literal, 5333));
        }
        assert_eq!(fake.total_calls(), 0);
        assert!(resolver.cache().is_empty());
    }

    #[tokio::test]
    async fn test_srv_never_selects_lower_priority() {
        let fake = srv_fake();
        let resolver = Resolver::with_backend(fake, EndpointCache::new());

        for _ in 0..50 {
            let endpoint = resolver.resolve("example.com", 5222, false).await.unwrap();
            assert_ne!(endpoint.host, "10.0.0.3");
            assert!(endpoint.port == 5222 || endpoint.port == 5223);
        }
    }

    #[tokio::test]
    async fn test_cached_candidates_are_reselected() {
        let mut fake = FakeDns::default();
        fake.srv.insert(
            "_xmpp-client._tcp.example.com".to_string(),
            vec![
                SrvCandidate::new("a.example.com", 5222, 10, 1),
                SrvCandidate::new("b.example.com", 5222, 10, 1),
            ],
        );
        fake.ips.insert("a.example.com".to_string(), vec![ip("10.0.0.1")]);
        fake.ips.insert("b.example.com".to_string(), vec![ip("10.0.0.2")]);
        let fake = Arc::new(fake);
        let resolver = Resolver::with_backend(fake.clone(), EndpointCache::new());

        let mut seen = HashSet::new();
        for _ in 0..64 {
            let endpoint = resolver.resolve("example.com", 5222, true).await.unwrap();
            seen.insert(endpoint.host);
        }

        assert_eq!(fake.srv_calls.load(Ordering::SeqCst), 1);
        let expected: HashSet<String> = ["10.0.0.1", "10.0.0.2"].iter().map(|s| s.to_string()).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn test_fallback_to_address_lookup_is_cached() {
        let mut fake = FakeDns::default();
        fake.ips
            .insert("plain.example".to_string(), vec![ip("10.1.1.1"), ip("10.1.1.2")]);
        let fake = Arc::new(fake);
        let cache = EndpointCache::new();
        let resolver = Resolver::with_backend(fake.clone(), cache.clone());

        let first = resolver.resolve("plain.example", 5222, true).await.unwrap();
        assert_eq!(first, Endpoint::new("10.1.1.1", 5222));
        assert!(cache.contains("plain.example"));

        let second = resolver.resolve("plain.example", 5222, true).await.unwrap();
        assert_eq!(second, first);
        assert_eq!(fake.srv_calls.load(Ordering::SeqCst), 1);
        assert_eq!(fake.ip_calls.load(Ordering::SeqCst), 1);

        // Bypassing the cache performs the lookups again.
        resolver.resolve("plain.example", 5222, false).await.unwrap();
        assert_eq!(fake.ip_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_srv_failure_is_swallowed() {
        let mut fake = FakeDns {
            srv_fails: true,
            ..Default::default()
        };
        fake.ips.insert("example.org".to_string(), vec![ip("10.2.2.2")]);
        let resolver = Resolver::with_backend(Arc::new(fake), EndpointCache::new());

        let endpoint = resolver.resolve("example.org", 5222, true).await.unwrap();
        assert_eq!(endpoint, Endpoint::new("10.2.2.2", 5222));
    }

    fn dead_target_fake() -> Arc<FakeDns> {
        let mut fake = FakeDns::default();
        fake.srv.insert(
            "_xmpp-client._tcp.example.com".to_string(),
            vec![SrvCandidate::new("dead.example.com", 5222, 0, 0)],
        );
        fake.ips.insert("example.com".to_string(), vec![ip("10.7.7.7")]);
        Arc::new(fake)
    }

    #[tokio::test]
    async fn test_unresolvable_srv_target_falls_back_to_name() {
        let cache = EndpointCache::new();
        let resolver = Resolver::with_backend(dead_target_fake(), cache.clone());

        let endpoint = resolver.resolve("example.com", 5222, true).await.unwrap();
        assert_eq!(endpoint, Endpoint::new("10.7.7.7", 5222));
        assert!(matches!(
            cache.get("example.com"),
            Some(CacheEntry::Candidates(_))
        ));
    }

    #[tokio::test]
    async fn test_cached_unresolvable_srv_target_falls_back_to_name() {
        let fake = dead_target_fake();
        let resolver = Resolver::with_backend(fake.clone(), EndpointCache::new());

        resolver.resolve("example.com", 5222, true).await.unwrap();
        let endpoint = resolver.resolve("example.com", 4000, true).await.unwrap();
        assert_eq!(endpoint, Endpoint::new("10.7.7.7", 4000));
        assert_eq!(fake.srv_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_address_failure_propagates() {
        let resolver = Resolver::with_backend(Arc::new(FakeDns::default()), EndpointCache::new());
        let result = resolver.resolve("missing.example", 5222, true).await;
        assert!(matches!(result, Err(ResolveError::NoRecords(_))));
        assert!(resolver.cache().is_empty());
    }

    #[tokio::test]
    async fn test_srv_candidates_sorted() {
        let resolver = Resolver::with_backend(srv_fake(), EndpointCache::new());
        let candidates = resolver.srv_candidates("example.com").await.unwrap();
        let order: Vec<(u16, u16)> = candidates.iter().map(|c| (c.priority, c.weight)).collect();
        assert_eq!(order, vec![(10, 1), (10, 5), (20, 100)]);
    }

    #[tokio::test]
    async fn test_server_service_prefix() {
        let mut fake = FakeDns::default();
        fake.srv.insert(
            "_xmpp-server._tcp.example.net".to_string(),
            vec![SrvCandidate::new("10.9.9.9", 5269, 0, 0)],
        );
        let resolver = Resolver::with_backend(Arc::new(fake), EndpointCache::new())
            .service(ServiceKind::Server);
        let endpoint = resolver.resolve("example.net", 5222, true).await.unwrap();
        assert_eq!(endpoint, Endpoint::new("10.9.9.9", 5269));
    }

    #[test]
    fn test_choose_candidate_zero_weights() {
        let candidates = vec![
            SrvCandidate::new("x", 1, 0, 0),
            SrvCandidate::new("y", 1, 0, 0),
        ];
        for _ in 0..20 {
            let choice = choose_candidate(&candidates).unwrap();
            assert!(choice.host == "x" || choice.host == "y");
        }
        assert!(choose_candidate(&[]).is_none());
    }

    #[test]
    fn test_endpoint_display() {
        assert_eq!(Endpoint::new("10.0.0.1", 5222).to_string(), "10.0.0.1:5222");
        assert_eq!(Endpoint::new("::1", 5222).to_string(), "[::1]:5222");
        assert_eq!(
            Endpoint::new("::1", 5222).socket_addr(),
            Some("[::1]:5222".parse().unwrap())
        );
    }
}
