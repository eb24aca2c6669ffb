use super::{Credentials, Registry, RegistryError};
use async_trait::async_trait;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter, clock};
use std::num::NonZeroU32;
use std::sync::Arc;

type Limiter = RateLimiter<NotKeyed, InMemoryState, clock::DefaultClock, NoOpMiddleware>;

/// Burst sizes shared with the sync pipeline's channel sizing.
pub const LIST_TAGS_BURST: u32 = 1;
pub const PULL_PUSH_BURST: u32 = 10;

const fn nonzero(n: u32) -> NonZeroU32 {
    match NonZeroU32::new(n) {
        Some(n) => n,
        None => panic!("quota must be non-zero"),
    }
}

/// Token-bucket quotas applied per operation. The defaults are the
/// contract: one repository listing per five seconds, one tag listing per
/// second, ten pulls and pushes per second with a matching burst.
#[derive(Debug, Clone, Copy)]
pub struct RateLimits {
    pub list_repositories: Quota,
    pub list_tags: Quota,
    pub pull: Quota,
    pub push: Quota,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            // 12 per minute refills one token every five seconds.
            list_repositories: Quota::per_minute(nonzero(12)).allow_burst(nonzero(1)),
            list_tags: Quota::per_second(nonzero(LIST_TAGS_BURST)),
            pull: Quota::per_second(nonzero(PULL_PUSH_BURST)),
            push: Quota::per_second(nonzero(PULL_PUSH_BURST)),
        }
    }
}

/// Decorator that paces `list_repositories`, `list_tags`, `pull` and `push`
/// on any [`Registry`]. `login`, `logout`, `remove_image` and `name` pass
/// through unrated. Waits are cancelled by dropping the call future.
#[derive(Debug)]
pub struct RateLimitedRegistry {
    inner: Arc<dyn Registry>,
    list_repositories: Limiter,
    list_tags: Limiter,
    pull: Limiter,
    push: Limiter,
}

impl RateLimitedRegistry {
    pub fn new(inner: Arc<dyn Registry>) -> Self {
        Self::with_limits(inner, RateLimits::default())
    }

    pub fn with_limits(inner: Arc<dyn Registry>, limits: RateLimits) -> Self {
        Self {
            inner,
            list_repositories: RateLimiter::direct(limits.list_repositories),
            list_tags: RateLimiter::direct(limits.list_tags),
            pull: RateLimiter::direct(limits.pull),
            push: RateLimiter::direct(limits.push),
        }
    }
}

#[async_trait]
impl Registry for RateLimitedRegistry {
    async fn login(&self, credentials: &Credentials) -> Result<(), RegistryError> {
        self.inner.login(credentials).await
    }

    async fn logout(&self) -> Result<(), RegistryError> {
        self.inner.logout().await
    }

    async fn list_repositories(&self) -> Result<Vec<String>, RegistryError> {
        self.list_repositories.until_ready().await;
        self.inner.list_repositories().await
    }

    async fn list_tags(&self, repository: &str) -> Result<Vec<String>, RegistryError> {
        self.list_tags.until_ready().await;
        self.inner.list_tags(repository).await
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn pull(&self, repository: &str, tag: &str) -> Result<(), RegistryError> {
        self.pull.until_ready().await;
        self.inner.pull(repository, tag).await
    }

    async fn push(&self, repository: &str, tag: &str) -> Result<(), RegistryError> {
        self.push.until_ready().await;
        self.inner.push(repository, tag).await
    }

    async fn remove_image(&self, repository: &str, tag: &str) -> Result<(), RegistryError> {
        self.inner.remove_image(repository, tag).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug)]
    struct StubRegistry {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Registry for StubRegistry {
        async fn login(&self, _credentials: &Credentials) -> Result<(), RegistryError> {
            self.calls.lock().unwrap().push("login".to_string());
            Ok(())
        }

        async fn logout(&self) -> Result<(), RegistryError> {
            self.calls.lock().unwrap().push("logout".to_string());
            Ok(())
        }

        async fn list_repositories(&self) -> Result<Vec<String>, RegistryError> {
            self.calls.lock().unwrap().push("list_repositories".to_string());
            Ok(vec!["acme/app".to_string()])
        }

        async fn list_tags(&self, repository: &str) -> Result<Vec<String>, RegistryError> {
            self.calls.lock().unwrap().push(format!("list_tags {repository}"));
            Ok(vec!["1.0".to_string()])
        }

        fn name(&self) -> &str {
            "stub.io"
        }

        async fn pull(&self, repository: &str, tag: &str) -> Result<(), RegistryError> {
            self.calls.lock().unwrap().push(format!("pull {repository}:{tag}"));
            Ok(())
        }

        async fn push(&self, repository: &str, tag: &str) -> Result<(), RegistryError> {
            self.calls.lock().unwrap().push(format!("push {repository}:{tag}"));
            Ok(())
        }

        async fn remove_image(&self, repository: &str, tag: &str) -> Result<(), RegistryError> {
            self.calls.lock().unwrap().push(format!("rmi {repository}:{tag}"));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_delegates_to_inner_registry() {
        let inner = Arc::new(StubRegistry {
            calls: Mutex::new(Vec::new()),
        });
        let limited = RateLimitedRegistry::new(inner.clone());

        assert_eq!(limited.name(), "stub.io");
        assert_eq!(limited.list_repositories().await.unwrap(), vec!["acme/app"]);
        assert_eq!(limited.list_tags("acme/app").await.unwrap(), vec!["1.0"]);
        limited.pull("acme/app", "1.0").await.unwrap();
        limited.remove_image("acme/app", "1.0").await.unwrap();

        assert_eq!(
            *inner.calls.lock().unwrap(),
            vec![
                "list_repositories",
                "list_tags acme/app",
                "pull acme/app:1.0",
                "rmi acme/app:1.0",
            ]
        );
    }

    #[test]
    fn test_default_pull_quota_allows_burst_of_ten() {
        let limiter = RateLimiter::direct(RateLimits::default().pull);
        for _ in 0..PULL_PUSH_BURST {
            assert!(limiter.check().is_ok());
        }
        assert!(limiter.check().is_err());
    }

    #[test]
    fn test_default_listing_quota_allows_single_token() {
        let limiter = RateLimiter::direct(RateLimits::default().list_repositories);
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_err());
    }
}
