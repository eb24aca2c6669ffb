use async_trait::async_trait;
use std::collections::HashSet;
use std::process::{ExitStatus, Output};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

const DOCKER_BINARY: &str = "docker";

/// Builds a fully qualified image reference, e.g. `quay.io/acme/app:1.2.3`.
pub fn image_ref(registry: &str, repository: &str, tag: &str) -> String {
    format!("{registry}/{repository}:{tag}")
}

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("failed to invoke `{command}`: {source}")]
    Invoke {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` failed ({status}): {output}")]
    CommandFailed {
        command: String,
        status: ExitStatus,
        output: String,
    },
}

/// Local image-transport helper used to move images between registries.
///
/// Implementations shell out to a container CLI; the pipeline only depends
/// on this trait so tests can substitute a recording fake.
#[async_trait]
pub trait ImageTool: Send + Sync + std::fmt::Debug {
    async fn login(&self, registry: &str, user: &str, password: &str) -> Result<(), ImageError>;

    /// Logs out of `registry`; an empty name logs out of the default
    /// registry.
    async fn logout(&self, registry: &str) -> Result<(), ImageError>;

    async fn pull(&self, image: &str) -> Result<(), ImageError>;

    async fn push(&self, image: &str) -> Result<(), ImageError>;

    async fn tag(&self, src: &str, dst: &str) -> Result<(), ImageError>;

    /// Removes a local image. Must be a no-op while the image is in use by
    /// a running container.
    async fn remove_image(&self, image: &str) -> Result<(), ImageError>;

    async fn list_running_images(&self) -> Result<HashSet<String>, ImageError>;
}

/// [`ImageTool`] backed by the `docker` binary.
#[derive(Debug, Default)]
pub struct DockerCli;

impl DockerCli {
    pub fn new() -> Self {
        Self
    }

    async fn run(&self, args: &[&str]) -> Result<Output, ImageError> {
        // Only the subcommand goes into error messages; login arguments
        // carry credentials.
        let command = format!("{DOCKER_BINARY} {}", args.first().copied().unwrap_or_default());
        debug!(%command, "running container cli");

        let output = Command::new(DOCKER_BINARY)
            .args(args)
            .output()
            .await
            .map_err(|source| ImageError::Invoke {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(ImageError::CommandFailed {
                command,
                status: output.status,
                output: combined.trim().to_string(),
            });
        }

        Ok(output)
    }
}

fn parse_running_images(output: &str) -> HashSet<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl ImageTool for DockerCli {
    async fn login(&self, registry: &str, user: &str, password: &str) -> Result<(), ImageError> {
        self.run(&["login", registry, "-u", user, "-p", password])
            .await?;
        Ok(())
    }

    async fn logout(&self, registry: &str) -> Result<(), ImageError> {
        if registry.is_empty() {
            self.run(&["logout"]).await?;
        } else {
            self.run(&["logout", registry]).await?;
        }
        Ok(())
    }

    async fn pull(&self, image: &str) -> Result<(), ImageError> {
        self.run(&["pull", image]).await?;
        Ok(())
    }

    async fn push(&self, image: &str) -> Result<(), ImageError> {
        self.run(&["push", image]).await?;
        Ok(())
    }

    async fn tag(&self, src: &str, dst: &str) -> Result<(), ImageError> {
        self.run(&["tag", src, dst]).await?;
        Ok(())
    }

    async fn remove_image(&self, image: &str) -> Result<(), ImageError> {
        let running = self.list_running_images().await?;
        if running.contains(image) {
            info!(%image, "image is in use by a running container, skipping removal");
            return Ok(());
        }

        self.run(&["rmi", image]).await?;
        Ok(())
    }

    async fn list_running_images(&self) -> Result<HashSet<String>, ImageError> {
        let output = self.run(&["ps", "--format", "{{.Image}}"]).await?;
        Ok(parse_running_images(&String::from_utf8_lossy(&output.stdout)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_ref() {
        assert_eq!(image_ref("quay.io", "acme/app", "1.2.3"), "quay.io/acme/app:1.2.3");
        assert_eq!(image_ref("example.azurecr.io", "acme/app", "latest"), "example.azurecr.io/acme/app:latest");
    }

    #[test]
    fn test_parse_running_images() {
        let output = "quay.io/acme/app:1.2.3\n\nquay.io/acme/crsync:0.1.0  \n";
        let images = parse_running_images(output);
        assert_eq!(images.len(), 2);
        assert!(images.contains("quay.io/acme/app:1.2.3"));
        assert!(images.contains("quay.io/acme/crsync:0.1.0"));
    }

    #[test]
    fn test_parse_running_images_empty() {
        assert!(parse_running_images("").is_empty());
    }
}
