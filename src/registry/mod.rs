pub mod azurecr;
pub mod dockerhub;
pub mod quay;
pub mod rate_limit;

use crate::image::{ImageError, ImageTool, image_ref};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Registry credentials; passed into `login`, never persisted.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("registry returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("not authorized, log in first")]
    NotAuthorized,
    #[error("{0} is not supported by this registry")]
    Unsupported(&'static str),
    #[error(transparent)]
    Image(#[from] ImageError),
}

/// Returns the response if it carries a success status, otherwise surfaces
/// the status and body as an API error.
pub(crate) async fn check_response(
    response: reqwest::Response,
) -> Result<reqwest::Response, RegistryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(RegistryError::Api { status, body })
}

/// Vendor-specific registry API: listing and authorization only. Image
/// transport lives in [`ImageTool`].
#[async_trait]
pub trait RegistryClient: Send + Sync + std::fmt::Debug {
    async fn authorize(&self, user: &str, password: &str) -> Result<(), RegistryError>;

    /// Lists repositories eligible for syncing, fully qualified as
    /// `namespace/name`.
    async fn list_repositories(&self) -> Result<Vec<String>, RegistryError>;

    async fn list_tags(&self, repository: &str) -> Result<Vec<String>, RegistryError>;
}

/// The unified registry surface the sync pipeline works against.
#[async_trait]
pub trait Registry: Send + Sync + std::fmt::Debug {
    async fn login(&self, credentials: &Credentials) -> Result<(), RegistryError>;

    async fn logout(&self) -> Result<(), RegistryError>;

    async fn list_repositories(&self) -> Result<Vec<String>, RegistryError>;

    async fn list_tags(&self, repository: &str) -> Result<Vec<String>, RegistryError>;

    /// Canonical registry name, e.g. `quay.io`; labels metrics and prefixes
    /// image references.
    fn name(&self) -> &str;

    async fn pull(&self, repository: &str, tag: &str) -> Result<(), RegistryError>;

    async fn push(&self, repository: &str, tag: &str) -> Result<(), RegistryError>;

    async fn remove_image(&self, repository: &str, tag: &str) -> Result<(), RegistryError>;
}

/// Binds a [`RegistryClient`] to an [`ImageTool`] under the [`Registry`]
/// surface.
#[derive(Debug)]
pub struct ImageRegistry {
    name: String,
    client: Box<dyn RegistryClient>,
    image_tool: Arc<dyn ImageTool>,
}

impl ImageRegistry {
    pub fn new(
        name: impl Into<String>,
        client: Box<dyn RegistryClient>,
        image_tool: Arc<dyn ImageTool>,
    ) -> Self {
        Self {
            name: name.into(),
            client,
            image_tool,
        }
    }

    fn reference(&self, repository: &str, tag: &str) -> String {
        image_ref(&self.name, repository, tag)
    }
}

#[async_trait]
impl Registry for ImageRegistry {
    async fn login(&self, credentials: &Credentials) -> Result<(), RegistryError> {
        debug!(registry = %self.name, "logging in");
        self.image_tool
            .login(&self.name, &credentials.user, &credentials.password)
            .await?;
        self.client
            .authorize(&credentials.user, &credentials.password)
            .await
    }

    async fn logout(&self) -> Result<(), RegistryError> {
        debug!(registry = %self.name, "logging out");
        self.image_tool.logout(&self.name).await?;
        Ok(())
    }

    async fn list_repositories(&self) -> Result<Vec<String>, RegistryError> {
        self.client.list_repositories().await
    }

    async fn list_tags(&self, repository: &str) -> Result<Vec<String>, RegistryError> {
        self.client.list_tags(repository).await
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn pull(&self, repository: &str, tag: &str) -> Result<(), RegistryError> {
        self.image_tool.pull(&self.reference(repository, tag)).await?;
        Ok(())
    }

    async fn push(&self, repository: &str, tag: &str) -> Result<(), RegistryError> {
        self.image_tool.push(&self.reference(repository, tag)).await?;
        Ok(())
    }

    async fn remove_image(&self, repository: &str, tag: &str) -> Result<(), RegistryError> {
        self.image_tool
            .remove_image(&self.reference(repository, tag))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Default, Debug)]
    struct RecordingClient {
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl RegistryClient for RecordingClient {
        async fn authorize(&self, user: &str, _password: &str) -> Result<(), RegistryError> {
            self.calls.lock().unwrap().push(format!("authorize {user}"));
            Ok(())
        }

        async fn list_repositories(&self) -> Result<Vec<String>, RegistryError> {
            Ok(vec![])
        }

        async fn list_tags(&self, _repository: &str) -> Result<Vec<String>, RegistryError> {
            Ok(vec![])
        }
    }

    #[derive(Default, Debug)]
    struct RecordingTool {
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ImageTool for RecordingTool {
        async fn login(&self, registry: &str, _user: &str, _password: &str) -> Result<(), ImageError> {
            self.calls.lock().unwrap().push(format!("login {registry}"));
            Ok(())
        }

        async fn logout(&self, registry: &str) -> Result<(), ImageError> {
            self.calls.lock().unwrap().push(format!("logout {registry}"));
            Ok(())
        }

        async fn pull(&self, image: &str) -> Result<(), ImageError> {
            self.calls.lock().unwrap().push(format!("pull {image}"));
            Ok(())
        }

        async fn push(&self, image: &str) -> Result<(), ImageError> {
            self.calls.lock().unwrap().push(format!("push {image}"));
            Ok(())
        }

        async fn tag(&self, src: &str, dst: &str) -> Result<(), ImageError> {
            self.calls.lock().unwrap().push(format!("tag {src} {dst}"));
            Ok(())
        }

        async fn remove_image(&self, image: &str) -> Result<(), ImageError> {
            self.calls.lock().unwrap().push(format!("rmi {image}"));
            Ok(())
        }

        async fn list_running_images(&self) -> Result<HashSet<String>, ImageError> {
            Ok(HashSet::new())
        }
    }

    fn registry_with_log() -> (ImageRegistry, Arc<Mutex<Vec<String>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let client = RecordingClient { calls: calls.clone() };
        let tool = RecordingTool { calls: calls.clone() };
        let registry = ImageRegistry::new("quay.io", Box::new(client), Arc::new(tool));
        (registry, calls)
    }

    #[tokio::test]
    async fn test_login_runs_image_tool_before_authorize() {
        let (registry, calls) = registry_with_log();
        let credentials = Credentials {
            user: "alice".to_string(),
            password: "secret".to_string(),
        };

        registry.login(&credentials).await.unwrap();

        assert_eq!(*calls.lock().unwrap(), vec!["login quay.io", "authorize alice"]);
    }

    #[tokio::test]
    async fn test_transport_uses_qualified_references() {
        let (registry, calls) = registry_with_log();

        registry.pull("acme/app", "1.0").await.unwrap();
        registry.push("acme/app", "1.0").await.unwrap();
        registry.remove_image("acme/app", "1.0").await.unwrap();

        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                "pull quay.io/acme/app:1.0",
                "push quay.io/acme/app:1.0",
                "rmi quay.io/acme/app:1.0",
            ]
        );
    }
}
