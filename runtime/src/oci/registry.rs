//! Registry-to-registry image mirroring.
//!
//! Uses the `oci-distribution` crate to pull an image from the source
//! registry and push its manifest, config and layers to the mirror.

use std::sync::Arc;

use async_trait::async_trait;
use ci_mirror_core::error::{MirrorError, Result};
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::{
    ImageIndexEntry, IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE, IMAGE_DOCKER_LAYER_TAR_MEDIA_TYPE,
    IMAGE_LAYER_GZIP_MEDIA_TYPE, IMAGE_LAYER_MEDIA_TYPE,
};
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference};

use super::credentials::DockerConfig;
use super::reference::PullSpec;

/// Layer media types copied by the mirror.
const LAYER_MEDIA_TYPES: &[&str] = &[
    IMAGE_LAYER_MEDIA_TYPE,
    IMAGE_LAYER_GZIP_MEDIA_TYPE,
    IMAGE_DOCKER_LAYER_TAR_MEDIA_TYPE,
    IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE,
];

/// Architecture selected from multi-arch sources.
const MIRROR_ARCHITECTURE: &str = "amd64";

/// Authentication credentials for a container registry.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    pub fn anonymous() -> Self {
        Self {
            username: None,
            password: None,
        }
    }

    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// `(username, password)`, or `None` when anonymous.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => Some((u.as_str(), p.as_str())),
            _ => None,
        }
    }

    fn to_oci_auth(&self) -> OciRegistryAuth {
        match self.credentials() {
            Some((u, p)) => OciRegistryAuth::Basic(u.to_string(), p.to_string()),
            None => OciRegistryAuth::Anonymous,
        }
    }
}

/// Copies one image from a source pull spec to a destination pull spec.
#[async_trait]
pub trait ImageMirrorer: Send + Sync {
    /// Mirror `source` to `destination` and return the digest of the pushed
    /// manifest.
    async fn mirror(&self, source: &str, destination: &str) -> Result<String>;
}

/// [`ImageMirrorer`] talking to real registries.
pub struct RegistryMirrorer {
    client: Client,
    credentials: Arc<DockerConfig>,
}

impl RegistryMirrorer {
    pub fn new(credentials: DockerConfig) -> Self {
        let config = ClientConfig {
            protocol: ClientProtocol::Https,
            platform_resolver: Some(Box::new(linux_platform_resolver)),
            ..Default::default()
        };
        Self {
            client: Client::new(config),
            credentials: Arc::new(credentials),
        }
    }
}

#[async_trait]
impl ImageMirrorer for RegistryMirrorer {
    async fn mirror(&self, source: &str, destination: &str) -> Result<String> {
        let source_spec = PullSpec::parse(source)?;
        let destination_spec = PullSpec::parse(destination)?;
        let source_ref = to_oci_reference(&source_spec)?;
        let destination_ref = to_oci_reference(&destination_spec)?;

        let source_auth = self.credentials.auth_for(source).to_oci_auth();
        let destination_auth = self.credentials.auth_for(destination).to_oci_auth();

        tracing::debug!(source = %source_spec, "Pulling image from source registry");
        let image = self
            .client
            .pull(&source_ref, &source_auth, LAYER_MEDIA_TYPES.to_vec())
            .await
            .map_err(|e| MirrorError::RegistryError {
                registry: source_spec.registry.clone(),
                message: format!("Failed to pull {}: {}", source_spec, e),
            })?;

        tracing::debug!(
            destination = %destination_spec,
            layers = image.layers.len(),
            "Pushing image to mirror"
        );
        let response = self
            .client
            .push(
                &destination_ref,
                &image.layers,
                image.config,
                &destination_auth,
                image.manifest,
            )
            .await
            .map_err(|e| MirrorError::RegistryError {
                registry: destination_spec.registry.clone(),
                message: format!("Failed to push {}: {}", destination_spec, e),
            })?;

        let (_manifest, digest) = self
            .client
            .pull_manifest(&destination_ref, &destination_auth)
            .await
            .map_err(|e| MirrorError::RegistryError {
                registry: destination_spec.registry.clone(),
                message: format!("Failed to read back manifest: {}", e),
            })?;

        tracing::info!(
            source = %source_spec,
            destination = %destination_spec,
            manifest_url = %response.manifest_url,
            digest = %digest,
            "Image mirrored"
        );

        Ok(digest)
    }
}

/// Convert a pull spec to an oci-distribution reference.
fn to_oci_reference(spec: &PullSpec) -> Result<Reference> {
    let ref_str = spec.full_reference();
    ref_str
        .parse::<Reference>()
        .map_err(|e| MirrorError::InvalidReference {
            reference: ref_str.clone(),
            message: e.to_string(),
        })
}

/// Selects the linux image for [`MIRROR_ARCHITECTURE`] from an image index.
fn linux_platform_resolver(manifests: &[ImageIndexEntry]) -> Option<String> {
    manifests
        .iter()
        .find(|entry| {
            entry.platform.as_ref().map_or(false, |p| {
                p.os == "linux" && p.architecture == MIRROR_ARCHITECTURE
            })
        })
        .map(|entry| entry.digest.clone())
}
