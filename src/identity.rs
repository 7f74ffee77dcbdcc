//! Identity verifier (C3): wraps the external on-chain identity registry.
//!
//! Shaped after the teacher's `Authenticator` trait in `authentication.rs`
//! (a `Send + Sync` async trait with a real implementation and a mock for
//! tests), but the contract here is much narrower: "is this address
//! registered", with positive-only caching (registrations are additive, so a
//! negative answer must never be cached, per spec §4.3).

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::{debug, warn};

/// Looks up whether an address is registered in the external identity
/// registry. Implementations must be safe to call concurrently and must be
/// idempotent.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn is_registered(&self, address: &str) -> bool;
}

/// Production implementation: an HTTP-backed registry oracle with a short
/// positive-answer cache.
pub struct HttpIdentityVerifier {
    client: reqwest::Client,
    registry_url: String,
    cache_ttl: Duration,
    cache: RwLock<HashMap<String, Instant>>,
}

impl HttpIdentityVerifier {
    #[must_use]
    pub fn new(registry_url: String, cache_ttl: Duration) -> Self {
        HttpIdentityVerifier {
            client: reqwest::Client::new(),
            registry_url,
            cache_ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn cached_hit(&self, address: &str) -> bool {
        let cache = self.cache.read().unwrap();
        cache
            .get(address)
            .is_some_and(|seen_at| seen_at.elapsed() < self.cache_ttl)
    }

    fn record_positive(&self, address: &str) {
        self.cache.write().unwrap().insert(address.to_string(), Instant::now());
    }

    async fn query_registry(&self, address: &str) -> bool {
        // Transport errors get a short bounded retry; an authoritative
        // "not registered" response is never retried (spec §7).
        const ATTEMPTS: u32 = 3;
        let url = format!("{}/addresses/{}", self.registry_url, address.to_lowercase());
        for attempt in 1..=ATTEMPTS {
            match self.client.get(&url).send().await {
                Ok(resp) => return resp.status().is_success(),
                Err(e) if attempt < ATTEMPTS => {
                    warn!(
                        "(HttpIdentityVerifier.query_registry) Transport error on attempt {}/{}: {:?}. Retrying.",
                        attempt, ATTEMPTS, e
                    );
                    tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                }
                Err(e) => {
                    warn!(
                        "(HttpIdentityVerifier.query_registry) Giving up after {} attempts: {:?}",
                        ATTEMPTS, e
                    );
                    return false;
                }
            }
        }
        false
    }
}

#[async_trait]
impl IdentityVerifier for HttpIdentityVerifier {
    async fn is_registered(&self, address: &str) -> bool {
        let address = address.to_lowercase();
        if self.cached_hit(&address) {
            debug!("(HttpIdentityVerifier.is_registered) Cache hit for {}.", address);
            return true;
        }
        let registered = self.query_registry(&address).await;
        if registered {
            self.record_positive(&address);
        }
        registered
    }
}

/// Test/fixture implementation backed by a fixed, in-memory set.
#[derive(Debug, Default, Clone)]
pub struct MockIdentityVerifier {
    registered: std::collections::HashSet<String>,
}

impl MockIdentityVerifier {
    #[must_use]
    pub fn new() -> Self {
        MockIdentityVerifier::default()
    }

    #[must_use]
    pub fn with_registered(addresses: impl IntoIterator<Item = String>) -> Self {
        MockIdentityVerifier {
            registered: addresses.into_iter().map(|a| a.to_lowercase()).collect(),
        }
    }

    pub fn register(&mut self, address: &str) {
        self.registered.insert(address.to_lowercase());
    }
}

#[async_trait]
impl IdentityVerifier for MockIdentityVerifier {
    async fn is_registered(&self, address: &str) -> bool {
        self.registered.contains(&address.to_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_verifier_is_case_insensitive() {
        let verifier = MockIdentityVerifier::with_registered(["0xABCDEF".to_string()]);
        assert!(verifier.is_registered("0xabcdef").await);
        assert!(verifier.is_registered("0xABCDEF").await);
        assert!(!verifier.is_registered("0x000000").await);
    }

    #[tokio::test]
    async fn unregistered_address_is_never_cached_as_positive() {
        let verifier = MockIdentityVerifier::new();
        assert!(!verifier.is_registered("0xnope").await);
        assert!(!verifier.is_registered("0xnope").await);
    }
}
