use super::{RegistryClient, RegistryError, check_response};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

const DEFAULT_ENDPOINT: &str = "https://quay.io";

#[derive(Debug, Clone)]
pub struct QuayConfig {
    /// Namespace whose repositories are enumerated.
    pub namespace: String,
    /// Only repositories modified within this window are eligible.
    pub last_modified_window: Duration,
    pub include_private: bool,
    /// Static API token; required to see private repositories.
    pub api_token: Option<String>,
}

/// Source registry client for the Quay listing API.
#[derive(Debug)]
pub struct Quay {
    endpoint: String,
    namespace: String,
    last_modified_window: Duration,
    include_private: bool,
    api_token: Option<String>,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct RepositoryPage {
    #[serde(default)]
    repositories: Vec<RepositoryEntry>,
    next_page: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RepositoryEntry {
    name: String,
    #[serde(default)]
    last_modified: Option<i64>,
    #[serde(default)]
    is_public: bool,
}

#[derive(Debug, Deserialize)]
struct TagPage {
    #[serde(default)]
    tags: Vec<TagEntry>,
    #[serde(default)]
    has_additional: bool,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

/// A repository is a candidate iff it is visible under the private policy
/// and was modified at or after the cutoff. Repositories that never report
/// a modification time are skipped.
fn eligible(entry: &RepositoryEntry, cutoff: i64, include_private: bool) -> bool {
    if !entry.is_public && !include_private {
        return false;
    }

    entry.last_modified.is_some_and(|modified| modified >= cutoff)
}

impl Quay {
    pub fn new(config: QuayConfig) -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            namespace: config.namespace,
            last_modified_window: config.last_modified_window,
            include_private: config.include_private,
            api_token: config.api_token,
            http: reqwest::Client::new(),
        }
    }

    fn cutoff(&self) -> i64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs() as i64)
            .unwrap_or(0);
        now - self.last_modified_window.as_secs() as i64
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl RegistryClient for Quay {
    /// The listing API takes a static bearer token at construction, so
    /// there is nothing to exchange here.
    async fn authorize(&self, _user: &str, _password: &str) -> Result<(), RegistryError> {
        Ok(())
    }

    async fn list_repositories(&self) -> Result<Vec<String>, RegistryError> {
        let cutoff = self.cutoff();
        let mut repositories = Vec::new();
        let mut next_page: Option<String> = None;

        loop {
            let mut request = self
                .http
                .get(format!("{}/api/v1/repository", self.endpoint))
                .query(&[
                    ("namespace", self.namespace.as_str()),
                    ("last_modified", "true"),
                    ("starred", "false"),
                ]);
            if let Some(page) = &next_page {
                request = request.query(&[("next_page", page.as_str())]);
            }

            let response = check_response(self.authorized(request).send().await?).await?;
            let page: RepositoryPage = response.json().await?;

            for entry in &page.repositories {
                if eligible(entry, cutoff, self.include_private) {
                    repositories.push(format!("{}/{}", self.namespace, entry.name));
                }
            }

            match page.next_page {
                Some(token) if !token.is_empty() => next_page = Some(token),
                _ => break,
            }
        }

        debug!(namespace = %self.namespace, count = repositories.len(), "listed quay repositories");
        Ok(repositories)
    }

    async fn list_tags(&self, repository: &str) -> Result<Vec<String>, RegistryError> {
        let mut tags = Vec::new();
        let mut page = 1u32;

        loop {
            let request = self
                .http
                .get(format!("{}/api/v1/repository/{}/tag/", self.endpoint, repository))
                .query(&[("page", page.to_string().as_str()), ("onlyActiveTags", "true")]);

            let response = check_response(self.authorized(request).send().await?).await?;
            let body: TagPage = response.json().await?;

            tags.extend(body.tags.into_iter().map(|tag| tag.name));

            if !body.has_additional {
                break;
            }
            page += 1;
        }

        Ok(tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(last_modified: Option<i64>, is_public: bool) -> RepositoryEntry {
        RepositoryEntry {
            name: "app".to_string(),
            last_modified,
            is_public,
        }
    }

    #[test]
    fn test_eligible_respects_cutoff() {
        assert!(eligible(&entry(Some(100), true), 100, false));
        assert!(eligible(&entry(Some(101), true), 100, false));
        assert!(!eligible(&entry(Some(99), true), 100, false));
    }

    #[test]
    fn test_eligible_skips_unmodified_repositories() {
        assert!(!eligible(&entry(None, true), 0, false));
    }

    #[test]
    fn test_eligible_filters_private_repositories() {
        assert!(!eligible(&entry(Some(200), false), 100, false));
        assert!(eligible(&entry(Some(200), false), 100, true));
        assert!(eligible(&entry(Some(200), true), 100, false));
    }

    #[test]
    fn test_repository_page_parses_api_payload() {
        let payload = r#"{
            "repositories": [
                {"name": "app", "last_modified": 1719830000, "is_public": true},
                {"name": "stale", "last_modified": null, "is_public": false}
            ],
            "next_page": "abc123"
        }"#;

        let page: RepositoryPage = serde_json::from_str(payload).unwrap();

        assert_eq!(page.next_page.as_deref(), Some("abc123"));
        assert_eq!(page.repositories.len(), 2);
        assert_eq!(page.repositories[0].name, "app");
        assert_eq!(page.repositories[0].last_modified, Some(1719830000));
        assert!(page.repositories[0].is_public);
        assert_eq!(page.repositories[1].last_modified, None);
        assert!(!page.repositories[1].is_public);
    }

    #[test]
    fn test_tag_page_parses_api_payload() {
        let payload = r#"{"tags": [{"name": "1.0"}, {"name": "latest"}], "has_additional": true}"#;
        let page: TagPage = serde_json::from_str(payload).unwrap();

        assert_eq!(
            page.tags.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            vec!["1.0", "latest"]
        );
        assert!(page.has_additional);

        let last: TagPage = serde_json::from_str(r#"{"tags": []}"#).unwrap();
        assert!(last.tags.is_empty());
        assert!(!last.has_additional);
    }
}
