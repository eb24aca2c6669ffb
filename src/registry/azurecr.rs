use super::{RegistryClient, RegistryError, check_response};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::header::{AUTHORIZATION, LINK};
use serde::Deserialize;
use tokio::sync::RwLock;

/// Destination registry client for Azure Container Registry.
#[derive(Debug)]
pub struct AzureCr {
    endpoint: String,
    token: RwLock<Option<String>>,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Vec<String>,
}

/// Extracts the target path of a `Link: </v2/...>; rel="next"` header.
fn next_link(header: &str) -> Option<String> {
    let (target, params) = header.split_once(';')?;
    if !params.contains(r#"rel="next""#) {
        return None;
    }

    let target = target.trim().strip_prefix('<')?.strip_suffix('>')?;
    Some(target.to_string())
}

impl AzureCr {
    pub fn new(registry_name: &str) -> Self {
        Self {
            endpoint: format!("https://{registry_name}"),
            token: RwLock::new(None),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl RegistryClient for AzureCr {
    async fn authorize(&self, user: &str, password: &str) -> Result<(), RegistryError> {
        let credentials = STANDARD.encode(format!("{user}:{password}"));
        *self.token.write().await = Some(credentials);
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

        let mut tags = Vec::new();
        let mut url = format!("{}/v2/{}/tags/list", self.endpoint, repository);

        loop {
            let response = check_response(
                self.http
                    .get(&url)
                    .header(AUTHORIZATION, format!("basic {token}"))
                    .send()
                    .await?,
            )
            .await?;

            let next = response
                .headers()
                .get(LINK)
                .and_then(|value| value.to_str().ok())
                .and_then(next_link);

            let list: TagList = response.json().await?;
            tags.extend(list.tags);

            match next {
                Some(path) => url = format!("{}{}", self.endpoint, path),
                None => break,
            }
        }

        Ok(tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_link_extracts_target() {
        let header = r#"</v2/acme/app/tags/list?last=1.0&n=100>; rel="next""#;
        assert_eq!(
            next_link(header).as_deref(),
            Some("/v2/acme/app/tags/list?last=1.0&n=100")
        );
    }

    #[test]
    fn test_next_link_ignores_other_relations() {
        assert_eq!(next_link(r#"</v2/x/tags/list>; rel="prev""#), None);
    }

    #[test]
    fn test_next_link_requires_parameters() {
        assert_eq!(next_link("</v2/x/tags/list>"), None);
        assert_eq!(next_link(""), None);
    }
}
