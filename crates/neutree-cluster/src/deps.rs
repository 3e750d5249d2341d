//! Dependency checks run before anything is started or applied.

use anyhow::Context;

use neutree_common::{AcceleratorType, ClusterError, ImageRegistry};
use neutree_registry::{Credentials, RegistryClient};

pub const SERVE_IMAGE: &str = "neutree-serve";

/// `<registry_host>/<repo>/neutree-serve:<version>[accelerator suffix]`.
pub fn serve_image(registry: &ImageRegistry, version: &str, accelerator: AcceleratorType) -> String {
    format!(
        "{}/{SERVE_IMAGE}:{}",
        registry.image_prefix(),
        accelerator.image_tag(version)
    )
}

/// Fails unless the registry is connected and every image is present.
pub async fn validate_images(registry: &ImageRegistry, images: &[String]) -> anyhow::Result<()> {
    registry.ensure_usable()?;
    let client = RegistryClient::for_registry(registry)
        .with_context(|| format!("registry client for {}", registry.metadata.name))?;
    let creds = Credentials::from(&registry.spec.authconfig);

    for image in images {
        let exists = client
            .check_image_exists(image, &creds)
            .await
            .with_context(|| format!("check image {image}"))?;
        if !exists {
            return Err(ClusterError::DependencyUnavailable(format!("image {image} not found")).into());
        }
        tracing::debug!(%image, "image present");
    }
    Ok(())
}
