use super::{RegistryClient, RegistryError, check_response};
use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

const AUTH_ENDPOINT: &str = "https://hub.docker.com";
const REGISTRY_ENDPOINT: &str = "https://index.docker.io";

/// Destination registry client for Docker Hub.
#[derive(Debug)]
pub struct DockerHub {
    auth_endpoint: String,
    registry_endpoint: String,
    token: RwLock<Option<String>>,
    http: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Vec<String>,
}

impl DockerHub {
    pub fn new() -> Self {
        Self {
            auth_endpoint: AUTH_ENDPOINT.to_string(),
            registry_endpoint: REGISTRY_ENDPOINT.to_string(),
            token: RwLock::new(None),
            http: reqwest::Client::new(),
        }
    }
}

impl Default for DockerHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RegistryClient for DockerHub {
    async fn authorize(&self, user: &str, password: &str) -> Result<(), RegistryError> {
        let response = check_response(
            self.http
                .post(format!("{}/v2/users/login/", self.auth_endpoint))
                .json(&LoginRequest {
                    username: user,
                    password,
                })
                .send()
                .await?,
        )
        .await?;

        let login: LoginResponse = response.json().await?;
        *self.token.write().await = Some(login.token);
        debug!("authorized against docker hub");

        Ok(())
    }

    async fn list_repositories(&self) -> Result<Vec<String>, RegistryError> {
        Err(RegistryError::Unsupported("listing repositories"))
    }

    async fn list_tags(&self, repository: &str) -> Result<Vec<String>, RegistryError> {
        let token = self
            .token
            .read()
            .await
            .clone()
            .ok_or(RegistryError::NotAuthorized)?;

        let response = check_response(
            self.http
                .get(format!("{}/v2/{}/tags/list", self.registry_endpoint, repository))
                .header(AUTHORIZATION, format!("JWT {token}"))
                .send()
                .await?,
        )
        .await?;

        let list: TagList = response.json().await?;
        Ok(list.tags)
    }
}
