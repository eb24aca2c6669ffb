//! CLI definitions and registry construction.

use crate::image::ImageTool;
use crate::registry::azurecr::AzureCr;
use crate::registry::dockerhub::DockerHub;
use crate::registry::quay::{Quay, QuayConfig};
use crate::registry::rate_limit::RateLimitedRegistry;
use crate::registry::{Credentials, ImageRegistry, Registry, RegistryClient};
use clap::{Args, Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const QUAY_REGISTRY: &str = "quay.io";
pub const DOCKER_HUB_REGISTRY: &str = "docker.io";
const AZURE_CR_SUFFIX: &str = "azurecr.io";

#[derive(Debug, Parser)]
#[command(
    name = "crsync",
    version,
    about = "Mirror container images between registries"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Synchronize missing tags from the source registry to the destination
    Sync(SyncArgs),
}

#[derive(Debug, Args)]
pub struct SyncArgs {
    /// Destination container registry name, e.g. "docker.io"
    #[arg(long = "dst-name")]
    pub dst_name: String,

    /// Destination container registry user
    #[arg(long = "dst-user")]
    pub dst_user: String,

    /// Destination container registry password
    #[arg(long = "dst-password", env = "DST_REGISTRY_PASSWORD", hide_env_values = true)]
    pub dst_password: String,

    /// Source container registry name, e.g. "quay.io"
    #[arg(long = "src-name")]
    pub src_name: String,

    /// Source container registry user
    #[arg(long = "src-user")]
    pub src_user: String,

    /// Source container registry password
    #[arg(long = "src-password", env = "SRC_REGISTRY_PASSWORD", hide_env_values = true)]
    pub src_password: String,

    /// Namespace to enumerate on the source registry; defaults to the
    /// source user
    #[arg(long = "src-namespace")]
    pub src_namespace: Option<String>,

    /// Window in which a source repository must have been modified to be
    /// synced
    #[arg(long = "last-modified", value_parser = humantime::parse_duration, default_value = "1h")]
    pub last_modified: Duration,

    /// Run continuously instead of performing a single pass
    #[arg(long = "loop")]
    pub loop_mode: bool,

    /// Seconds to sleep between passes in loop mode
    #[arg(long = "sync-interval", default_value_t = 30)]
    pub sync_interval: u64,

    /// Also mirror private repositories
    #[arg(long = "include-private-repositories")]
    pub include_private_repositories: bool,

    /// Port for the Prometheus /metrics endpoint; 0 disables it
    #[arg(long = "metrics-port", default_value_t = 0)]
    pub metrics_port: u16,

    /// API token for the Quay listing API; required to see private
    /// repositories
    #[arg(long = "quay-api-token", env = "QUAY_API_TOKEN", hide_env_values = true)]
    pub quay_api_token: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown container registry {0:?}")]
    UnknownRegistry(String),
    #[error("--quay-api-token is required to sync private repositories from quay.io")]
    MissingQuayToken,
}

impl SyncArgs {
    pub fn namespace(&self) -> &str {
        self.src_namespace.as_deref().unwrap_or(&self.src_user)
    }

    pub fn src_credentials(&self) -> Credentials {
        Credentials {
            user: self.src_user.clone(),
            password: self.src_password.clone(),
        }
    }

    pub fn dst_credentials(&self) -> Credentials {
        Credentials {
            user: self.dst_user.clone(),
            password: self.dst_password.clone(),
        }
    }

    /// Builds the rate-limited source registry. Quay is the only supported
    /// source vendor.
    pub fn build_source(
        &self,
        image_tool: Arc<dyn ImageTool>,
    ) -> Result<Arc<dyn Registry>, ConfigError> {
        if self.src_name != QUAY_REGISTRY {
            return Err(ConfigError::UnknownRegistry(self.src_name.clone()));
        }
        if self.include_private_repositories && self.quay_api_token.is_none() {
            return Err(ConfigError::MissingQuayToken);
        }

        let client = Quay::new(QuayConfig {
            namespace: self.namespace().to_string(),
            last_modified_window: self.last_modified,
            include_private: self.include_private_repositories,
            api_token: self.quay_api_token.clone(),
        });

        Ok(rate_limited(&self.src_name, Box::new(client), image_tool))
    }

    /// Builds the rate-limited destination registry from the vendor name
    /// pattern.
    pub fn build_destination(
        &self,
        image_tool: Arc<dyn ImageTool>,
    ) -> Result<Arc<dyn Registry>, ConfigError> {
        let client: Box<dyn RegistryClient> = if self.dst_name == DOCKER_HUB_REGISTRY {
            Box::new(DockerHub::new())
        } else if self.dst_name.ends_with(AZURE_CR_SUFFIX) {
            Box::new(AzureCr::new(&self.dst_name))
        } else {
            return Err(ConfigError::UnknownRegistry(self.dst_name.clone()));
        };

        Ok(rate_limited(&self.dst_name, client, image_tool))
    }
}

fn rate_limited(
    name: &str,
    client: Box<dyn RegistryClient>,
    image_tool: Arc<dyn ImageTool>,
) -> Arc<dyn Registry> {
    let registry = ImageRegistry::new(name, client, image_tool);
    Arc::new(RateLimitedRegistry::new(Arc::new(registry)))
}
