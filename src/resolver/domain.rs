//! Hostname to canister resolution with caching and coalescing.
//!
//! Resolution order, first hit wins:
//!
//! 1. raw domains resolve to nothing,
//! 2. the static table,
//! 3. a canister id embedded in a label,
//! 4. the `_canister-id.<hostname>` TXT record.
//!
//! Both hits and misses are cached. Concurrent lookups for a hostname that
//! is not cached share a single resolution.

use super::canister::{CANISTER_DNS_PREFIX, canister_from_hostname, is_raw_domain};
use super::dns::TxtResolver;
use super::error::ResolverResult;
use crate::singleflight::SingleFlight;
use ic_principal::Principal;
use moka::future::Cache;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Resolver settings.
#[derive(Debug, Clone)]
pub struct ResolverOptions {
    /// Hostname to canister table consulted before any parsing or DNS.
    pub static_domains: HashMap<String, Principal>,
    /// Lifetime of a cached answer.
    pub cache_ttl: Duration,
    /// Maximum number of cached hostnames.
    pub cache_capacity: u64,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            static_domains: HashMap::new(),
            cache_ttl: Duration::from_secs(5 * 60),
            cache_capacity: 1000,
        }
    }
}

/// Decides whether a hostname is served by a canister.
pub struct DomainResolver {
    static_domains: HashMap<String, Principal>,
    txt: Arc<dyn TxtResolver>,
    cache: Cache<String, Option<Principal>>,
    in_flight: SingleFlight<String, ResolverResult<Option<Principal>>>,
}

impl DomainResolver {
    /// Create a resolver over a TXT source.
    pub fn new(txt: Arc<dyn TxtResolver>, options: ResolverOptions) -> Self {
        Self {
            static_domains: options
                .static_domains
                .into_iter()
                .map(|(host, canister)| (host.to_ascii_lowercase(), canister))
                .collect(),
            txt,
            cache: Cache::builder()
                .max_capacity(options.cache_capacity)
                .time_to_live(options.cache_ttl)
                .build(),
            in_flight: SingleFlight::new(),
        }
    }

    /// Canister serving `hostname`, or `None` when it is not an IC domain.
    pub async fn lookup_ic_domain(&self, hostname: &str) -> ResolverResult<Option<Principal>> {
        let hostname = hostname.trim_end_matches('.').to_ascii_lowercase();

        if let Some(cached) = self.cache.get(&hostname).await {
            return Ok(cached);
        }

        self.in_flight
            .run(hostname.clone(), || async {
                let result = self.resolve(&hostname).await;
                if let Ok(canister) = &result {
                    self.cache.insert(hostname.clone(), *canister).await;
                }
                result
            })
            .await
    }

    async fn resolve(&self, hostname: &str) -> ResolverResult<Option<Principal>> {
        if is_raw_domain(hostname) {
            debug!(host = %hostname, "Raw domain, not proxied");
            return Ok(None);
        }

        if let Some(canister) = self.static_domains.get(hostname) {
            return Ok(Some(*canister));
        }

        if let Some(canister) = canister_from_hostname(hostname) {
            return Ok(Some(canister));
        }

        self.canister_from_dns(hostname).await
    }

    async fn canister_from_dns(&self, hostname: &str) -> ResolverResult<Option<Principal>> {
        let name = format!("{}.{}", CANISTER_DNS_PREFIX, hostname);
        let canister = self
            .txt
            .first_txt(&name)
            .await?
            .and_then(|text| Principal::from_text(text.trim()).ok());

        debug!(host = %hostname, canister = ?canister.map(|c| c.to_text()), "Resolved canister from DNS");
        Ok(canister)
    }

    /// Number of hostnames with a resolution in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.in_flight()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::error::ResolverError;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeTxt {
        records: Mutex<HashMap<String, ResolverResult<Option<String>>>>,
        queries: AtomicUsize,
    }

    impl FakeTxt {
        fn with(name: &str, answer: ResolverResult<Option<String>>) -> Arc<Self> {
            let fake = Self::default();
            fake.records.lock().unwrap().insert(name.to_string(), answer);
            Arc::new(fake)
        }

        fn queries(&self) -> usize {
            self.queries.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TxtResolver for FakeTxt {
        async fn first_txt(&self, name: &str) -> ResolverResult<Option<String>> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.records
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .unwrap_or(Ok(None))
        }
    }

    fn resolver(txt: Arc<FakeTxt>) -> DomainResolver {
        let static_domains = HashMap::from([(
            "NNS.ic0.app".to_string(),
            Principal::from_text("qoctq-giaaa-aaaaa-aaaea-cai").unwrap(),
        )]);
        DomainResolver::new(
            txt,
            ResolverOptions {
                static_domains,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_raw_domain_skips_everything() {
        let txt = Arc::new(FakeTxt::default());
        let resolver = resolver(txt.clone());

        let result = resolver
            .lookup_ic_domain("rdmx6-jaaaa-aaaaa-aaadq-cai.raw.ic0.app")
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(txt.queries(), 0);
    }

    #[tokio::test]
    async fn test_static_table() {
        let txt = Arc::new(FakeTxt::default());
        let resolver = resolver(txt.clone());

        let result = resolver.lookup_ic_domain("nns.ic0.app").await.unwrap();
        assert_eq!(result.unwrap().to_text(), "qoctq-giaaa-aaaaa-aaaea-cai");
        assert_eq!(txt.queries(), 0);
    }

    #[tokio::test]
    async fn test_hostname_embedded_canister() {
        let txt = Arc::new(FakeTxt::default());
        let resolver = resolver(txt.clone());

        let result = resolver
            .lookup_ic_domain("rdmx6-jaaaa-aaaaa-aaadq-cai.example.com")
            .await
            .unwrap();
        assert_eq!(result.unwrap().to_text(), "rdmx6-jaaaa-aaaaa-aaadq-cai");
        assert_eq!(txt.queries(), 0);
    }

    #[tokio::test]
    async fn test_dns_txt_record() {
        let txt = FakeTxt::with(
            "_canister-id.custom.example",
            Ok(Some("rdmx6-jaaaa-aaaaa-aaadq-cai".to_string())),
        );
        let resolver = resolver(txt.clone());

        let result = resolver.lookup_ic_domain("custom.example").await.unwrap();
        assert_eq!(result.unwrap().to_text(), "rdmx6-jaaaa-aaaaa-aaadq-cai");
    }

    #[tokio::test]
    async fn test_invalid_txt_is_not_found() {
        let txt = FakeTxt::with("_canister-id.bad.example", Ok(Some("not a canister".to_string())));
        let resolver = resolver(txt);

        assert!(resolver.lookup_ic_domain("bad.example").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_negative_result_is_cached() {
        let txt = Arc::new(FakeTxt::default());
        let resolver = resolver(txt.clone());

        assert!(resolver.lookup_ic_domain("www.example.com").await.unwrap().is_none());
        assert!(resolver.lookup_ic_domain("WWW.example.com").await.unwrap().is_none());
        assert_eq!(txt.queries(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_lookups_share_one_query() {
        let txt = Arc::new(FakeTxt::default());
        let resolver = Arc::new(resolver(txt.clone()));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let resolver = resolver.clone();
            handles.push(tokio::spawn(async move {
                resolver.lookup_ic_domain("burst.example.com").await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok(None));
        }

        assert_eq!(txt.queries(), 1);
        assert_eq!(resolver.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_dns_failure_propagates_and_is_not_cached() {
        let failure = ResolverError::Dns {
            name: "_canister-id.flaky.example".to_string(),
            message: "timed out".to_string(),
        };
        let txt = FakeTxt::with("_canister-id.flaky.example", Err(failure.clone()));
        let resolver = resolver(txt.clone());

        assert_eq!(resolver.lookup_ic_domain("flaky.example").await, Err(failure));
        assert!(resolver.lookup_ic_domain("flaky.example").await.is_err());
        assert_eq!(txt.queries(), 2);
    }
}
