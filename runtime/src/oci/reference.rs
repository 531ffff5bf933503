//! Registry pull specs.
//!
//! Parses pull specs like `quay.io/openshift/ci:ocp_builder_golang` into their
//! components and builds the source and destination specs for a mirrored tag.

use sha2::{Digest, Sha256};

use ci_mirror_core::error::{MirrorError, Result};
use ci_mirror_core::reference::ImageReference;

/// Default registry when none is specified.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Default tag when none is specified.
const DEFAULT_TAG: &str = "latest";

/// Parsed registry pull spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullSpec {
    /// Registry hostname, with port if any (e.g. "quay.io", "localhost:5000")
    pub registry: String,
    /// Repository path (e.g. "openshift/ci")
    pub repository: String,
    pub tag: Option<String>,
    /// Digest (e.g. "sha256:abc123...")
    pub digest: Option<String>,
}

impl PullSpec {
    /// Parse a pull spec.
    ///
    /// - `registry.ci.openshift.org/ci/clonerefs:latest`
    /// - `quay.io/openshift/ci@sha256:abc...`
    /// - `localhost:5000/mirror` (tag defaults to `latest`)
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        let invalid = |message: &str| MirrorError::InvalidReference {
            reference: spec.to_string(),
            message: message.to_string(),
        };
        if spec.is_empty() {
            return Err(invalid("empty pull spec"));
        }

        let (name_tag, digest) = match spec.rsplit_once('@') {
            Some((_, digest)) if !digest.contains(':') => {
                return Err(invalid("expected algorithm:hex digest"));
            }
            Some((name_tag, digest)) => (name_tag, Some(digest.to_string())),
            None => (spec, None),
        };

        // A colon after the last slash separates the tag; before it, a port.
        let last_slash = name_tag.rfind('/').map_or(0, |i| i + 1);
        let (name, tag) = match name_tag[last_slash..].rfind(':') {
            Some(colon) => {
                let colon = last_slash + colon;
                (&name_tag[..colon], Some(name_tag[colon + 1..].to_string()))
            }
            None => (name_tag, None),
        };
        if tag.as_deref() == Some("") {
            return Err(invalid("empty tag"));
        }

        let (registry, repository) = split_registry_repository(name).ok_or_else(|| invalid("empty repository"))?;

        let tag = if tag.is_none() && digest.is_none() {
            Some(DEFAULT_TAG.to_string())
        } else {
            tag
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Where a tag is pulled from: `<registry>/<namespace>/<name>:<tag>`.
    pub fn source(registry: &str, reference: &ImageReference) -> Self {
        Self {
            registry: registry.trim_end_matches('/').to_string(),
            repository: format!("{}/{}", reference.namespace, reference.name),
            tag: Some(reference.tag.clone()),
            digest: None,
        }
    }

    /// Where a tag is mirrored to: `<repository>:<namespace>_<name>_<tag>`.
    ///
    /// When a component contains `_`, or the tag would exceed the registry's
    /// 128 character limit, the readable part is cut short and followed by
    /// `__` and a hash of the full reference. Plain names never contain `__`,
    /// so the two forms cannot meet.
    pub fn mirror_destination(repository: &str, reference: &ImageReference) -> Result<Self> {
        let mut destination = Self::parse(repository)?;
        destination.tag = Some(destination_tag(reference));
        destination.digest = None;
        Ok(destination)
    }

    /// `registry/repository`, without tag or digest.
    pub fn repository_path(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    pub fn full_reference(&self) -> String {
        let mut s = self.repository_path();
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }
}

/// Longest tag a registry accepts.
pub const MAX_TAG_LENGTH: usize = 128;

const HASH_LENGTH: usize = 16;

fn destination_tag(reference: &ImageReference) -> String {
    let components = [&reference.namespace, &reference.name, &reference.tag];
    let readable = format!(
        "{}_{}_{}",
        reference.namespace, reference.name, reference.tag
    );
    let ambiguous = components.iter().any(|c| c.contains('_'));
    if !ambiguous && readable.len() <= MAX_TAG_LENGTH {
        return readable;
    }

    let full = format!(
        "{}/{}:{}",
        reference.namespace, reference.name, reference.tag
    );
    let hash = hex::encode(Sha256::digest(full.as_bytes()));
    let mut end = readable.len().min(MAX_TAG_LENGTH - HASH_LENGTH - 2);
    while !readable.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}__{}", &readable[..end], &hash[..HASH_LENGTH])
}

/// Split a name into registry and repository. The first component is a
/// registry when it looks like a hostname.
fn split_registry_repository(name: &str) -> Option<(String, String)> {
    if let Some((first, rest)) = name.split_once('/') {
        if first.contains('.') || first.contains(':') || first == "localhost" {
            if rest.is_empty() {
                return None;
            }
            return Some((first.to_string(), rest.to_string()));
        }
    }
    if name.is_empty() {
        return None;
    }
    let repository = if name.contains('/') {
        name.to_string()
    } else {
        format!("library/{}", name)
    };
    Some((DEFAULT_REGISTRY.to_string(), repository))
}

impl std::fmt::Display for PullSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}
