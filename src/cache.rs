//! Per-token cluster client cache
//!
//! Building an authenticated cluster client per request is expensive, so
//! user clients are cached keyed by the raw bearer token. Entries expire
//! after five minutes without access (configurable) and are invalidated
//! eagerly whenever a validation failure is surfaced for their token, so a
//! renewed token presentation rebuilds a fresh client.

use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use moka::notification::RemovalCause;
use tracing::debug;

use crate::client::{UserClient, UserClientFactory};
use crate::error::AuthError;

/// Concurrent cache of bearer-token-bound cluster clients
///
/// Concurrent lookups for the same token share a single factory invocation;
/// factory failures are not cached. Every eviction, whether by idle expiry
/// or explicit invalidation, runs the client's `close` hook exactly once.
pub struct UserClientCache {
    clients: Cache<String, Arc<dyn UserClient>>,
    factory: Arc<dyn UserClientFactory>,
}

impl UserClientCache {
    /// Create a cache loading through `factory`, expiring entries
    /// `idle_expiry` after their last access
    pub fn new(factory: Arc<dyn UserClientFactory>, idle_expiry: Duration) -> Self {
        let clients = Cache::builder()
            .time_to_idle(idle_expiry)
            .eviction_listener(
                |_token: Arc<String>, client: Arc<dyn UserClient>, cause: RemovalCause| {
                    debug!(?cause, "evicting cached user cluster client");
                    client.close();
                },
            )
            .build();
        Self { clients, factory }
    }

    /// Fetch the cached client for `token`, building one on first demand
    pub async fn get(&self, token: &str) -> Result<Arc<dyn UserClient>, AuthError> {
        self.clients
            .try_get_with(token.to_string(), self.factory.client_for_token(token))
            .await
            .map_err(|err: Arc<AuthError>| (*err).clone())
    }

    /// Drop the cached client for `token`, if any
    pub async fn invalidate(&self, token: &str) {
        self.clients.invalidate(token).await;
    }

    #[cfg(test)]
    pub(crate) async fn run_pending_tasks(&self) {
        self.clients.run_pending_tasks().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use k8s_openapi::api::authorization::v1::SelfSubjectAccessReview;

    use super::*;

    struct CountingClient {
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl UserClient for CountingClient {
        async fn create_access_review(
            &self,
            review: SelfSubjectAccessReview,
        ) -> Result<SelfSubjectAccessReview, AuthError> {
            Ok(review)
        }

        fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct CountingFactory {
        loads: AtomicUsize,
        closed: Arc<AtomicUsize>,
        fail: bool,
    }

    impl CountingFactory {
        fn new() -> Self {
            Self {
                loads: AtomicUsize::new(0),
                closed: Arc::new(AtomicUsize::new(0)),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new()
            }
        }
    }

    #[async_trait]
    impl UserClientFactory for CountingFactory {
        async fn client_for_token(&self, _token: &str) -> Result<Arc<dyn UserClient>, AuthError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(AuthError::cluster_client("factory failed"));
            }
            Ok(Arc::new(CountingClient {
                closed: Arc::clone(&self.closed),
            }))
        }
    }

    #[tokio::test]
    async fn repeated_gets_reuse_one_client() {
        let factory = Arc::new(CountingFactory::new());
        let cache = UserClientCache::new(Arc::clone(&factory) as _, Duration::from_secs(300));

        cache.get("tok").await.unwrap();
        cache.get("tok").await.unwrap();

        assert_eq!(factory.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_gets_share_one_factory_invocation() {
        let factory = Arc::new(CountingFactory::new());
        let cache = Arc::new(UserClientCache::new(
            Arc::clone(&factory) as _,
            Duration::from_secs(300),
        ));

        let (a, b) = tokio::join!(cache.get("tok"), cache.get("tok"));
        a.unwrap();
        b.unwrap();

        assert_eq!(factory.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_tokens_get_distinct_clients() {
        let factory = Arc::new(CountingFactory::new());
        let cache = UserClientCache::new(Arc::clone(&factory) as _, Duration::from_secs(300));

        cache.get("alice").await.unwrap();
        cache.get("bob").await.unwrap();

        assert_eq!(factory.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidation_closes_the_client_once_and_forces_a_reload() {
        let factory = Arc::new(CountingFactory::new());
        let cache = UserClientCache::new(Arc::clone(&factory) as _, Duration::from_secs(300));

        cache.get("tok").await.unwrap();
        cache.invalidate("tok").await;
        cache.run_pending_tasks().await;

        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);

        cache.get("tok").await.unwrap();
        assert_eq!(factory.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn idle_entries_expire_and_close() {
        let factory = Arc::new(CountingFactory::new());
        let cache = UserClientCache::new(Arc::clone(&factory) as _, Duration::from_millis(20));

        cache.get("tok").await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        cache.run_pending_tasks().await;

        assert_eq!(factory.closed.load(Ordering::SeqCst), 1);

        cache.get("tok").await.unwrap();
        assert_eq!(factory.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn factory_failures_are_not_cached() {
        let factory = Arc::new(CountingFactory::failing());
        let cache = UserClientCache::new(Arc::clone(&factory) as _, Duration::from_secs(300));

        assert!(cache.get("tok").await.is_err());
        assert!(cache.get("tok").await.is_err());

        assert_eq!(factory.loads.load(Ordering::SeqCst), 2);
    }
}
