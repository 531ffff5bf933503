//! `ImageTagClient` over OpenShift image streams.
//!
//! Image streams are not part of the core Kubernetes API, so they are handled
//! as dynamic objects. Every tag in `status.tags` becomes one [`ImageTag`];
//! its mirror status lives in a per-tag annotation on the stream:
//!
//! ```text
//! mirror.ci.openshift.io/tag-<sha256(tag)[..16]>: <destination>@<digest>
//! ```

use async_trait::async_trait;
use kube::api::{
    Api, ApiResource, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams,
};
use kube::{Client, ResourceExt};
use sha2::{Digest, Sha256};

use ci_mirror_core::error::{MirrorError, Result};
use ci_mirror_core::reference::ImageReference;
use ci_mirror_runtime::{ImageTag, ImageTagClient, MirrorStatus};

/// Prefix of the per-tag mirror status annotations.
pub const MIRROR_ANNOTATION_PREFIX: &str = "mirror.ci.openshift.io/tag-";

const PAGE_SIZE: u32 = 500;

/// Image streams on one cluster.
pub struct KubeImageStreams {
    client: Client,
    resource: ApiResource,
}

impl KubeImageStreams {
    pub fn new(client: Client) -> Self {
        let gvk = GroupVersionKind::gvk("image.openshift.io", "v1", "ImageStream");
        Self {
            client,
            resource: ApiResource::from_gvk(&gvk),
        }
    }

    fn all(&self) -> Api<DynamicObject> {
        Api::all_with(self.client.clone(), &self.resource)
    }

    fn namespaced(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.resource)
    }
}

#[async_trait]
impl ImageTagClient for KubeImageStreams {
    async fn list(&self) -> Result<Vec<ImageTag>> {
        let api = self.all();
        let mut tags = Vec::new();
        let mut params = ListParams::default().limit(PAGE_SIZE);

        loop {
            let page = api
                .list(&params)
                .await
                .map_err(|e| cluster_error("list image streams", e))?;
            for stream in &page.items {
                tags.extend(image_tags(stream));
            }
            match page.metadata.continue_.filter(|token| !token.is_empty()) {
                Some(token) => params = params.continue_token(&token),
                None => break,
            }
        }

        tracing::debug!(tags = tags.len(), "Listed image stream tags");
        Ok(tags)
    }

    async fn get(&self, reference: &ImageReference) -> Result<Option<ImageTag>> {
        let stream = self
            .namespaced(&reference.namespace)
            .get_opt(&reference.name)
            .await
            .map_err(|e| cluster_error("get image stream", e))?;

        Ok(stream.and_then(|stream| {
            image_tags(&stream)
                .into_iter()
                .find(|tag| tag.reference.tag == reference.tag)
        }))
    }

    async fn set_mirror(&self, reference: &ImageReference, status: MirrorStatus) -> Result<()> {
        let patch = serde_json::json!({
            "metadata": {
                "annotations": {
                    (annotation_key(&reference.tag)): annotation_value(&status),
                }
            }
        });
        self.namespaced(&reference.namespace)
            .patch(&reference.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| cluster_error("annotate image stream", e))?;
        Ok(())
    }
}

fn cluster_error(what: &str, error: kube::Error) -> MirrorError {
    MirrorError::ClusterError(format!("{}: {}", what, error))
}

/// Annotation key holding the mirror status of `tag`. Tags may contain
/// characters annotation keys do not allow, so the key carries a hash.
pub fn annotation_key(tag: &str) -> String {
    let digest = hex::encode(Sha256::digest(tag.as_bytes()));
    format!("{}{}", MIRROR_ANNOTATION_PREFIX, &digest[..16])
}

fn annotation_value(status: &MirrorStatus) -> String {
    format!("{}@{}", status.destination, status.digest)
}

fn parse_annotation(value: &str) -> Option<MirrorStatus> {
    let (destination, digest) = value.rsplit_once('@')?;
    if destination.is_empty() || digest.is_empty() {
        return None;
    }
    Some(MirrorStatus {
        destination: destination.to_string(),
        digest: digest.to_string(),
    })
}

/// Every tag in the stream's status, newest image per tag.
pub fn image_tags(stream: &DynamicObject) -> Vec<ImageTag> {
    let namespace = stream.namespace().unwrap_or_default();
    let name = stream.name_any();
    let annotations = stream.annotations();

    let Some(tags) = stream
        .data
        .pointer("/status/tags")
        .and_then(|tags| tags.as_array())
    else {
        return Vec::new();
    };

    tags.iter()
        .filter_map(|entry| {
            let tag = entry.get("tag")?.as_str()?;
            let digest = entry
                .pointer("/items/0/image")
                .and_then(|image| image.as_str())
                .map(str::to_string);
            let mirror = annotations
                .get(&annotation_key(tag))
                .and_then(|value| parse_annotation(value));

            Some(ImageTag {
                reference: ImageReference::new(namespace.as_str(), name.as_str(), tag),
                digest,
                mirror,
            })
        })
        .collect()
}
