//! Image references, reference sets and override sets.
//!
//! An image reference is a `namespace/name:tag` triple pointing at one tag of
//! an image stream. A reference with an empty tag stands for the whole stream.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{MirrorError, Result};

/// One mirrorable image tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageReference {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub tag: String,
}

impl ImageReference {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        tag: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            tag: tag.into(),
        }
    }

    /// Reference to a whole image stream (empty tag).
    pub fn stream(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(namespace, name, "")
    }

    /// Parse `namespace/name:tag`. The tag is mandatory.
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        let invalid = |message: &str| MirrorError::InvalidReference {
            reference: reference.to_string(),
            message: message.to_string(),
        };

        let (stream, tag) = reference
            .rsplit_once(':')
            .ok_or_else(|| invalid("expected namespace/name:tag"))?;
        if tag.is_empty() || tag.contains('/') {
            return Err(invalid("empty or malformed tag"));
        }
        let (namespace, name) = parse_stream(stream).map_err(|_| invalid("expected namespace/name:tag"))?;

        Ok(Self::new(namespace, name, tag))
    }

    /// Deduplication key: `namespace/name:tag`.
    pub fn key(&self) -> String {
        format!("{}/{}:{}", self.namespace, self.name, self.tag)
    }

    /// Stream key: `namespace/name`.
    pub fn stream_key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Whether this reference designates a whole stream rather than a tag.
    pub fn is_stream(&self) -> bool {
        self.tag.is_empty()
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Split `namespace/name` into its two non-empty parts.
fn parse_stream(stream: &str) -> Result<(&str, &str)> {
    match stream.split_once('/') {
        Some((namespace, name))
            if !namespace.is_empty() && !name.is_empty() && !name.contains('/') =>
        {
            Ok((namespace, name))
        }
        _ => Err(MirrorError::InvalidReference {
            reference: stream.to_string(),
            message: "expected namespace/name".to_string(),
        }),
    }
}

/// Deduplicated collection of image references keyed by `namespace/name:tag`.
///
/// Inserting a key that is already present keeps the existing entry: the first
/// path through which a tag is discovered is authoritative.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReferenceSet {
    references: BTreeMap<String, ImageReference>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a reference unless its key is already present.
    /// Returns `true` when the reference was added.
    pub fn insert(&mut self, reference: ImageReference) -> bool {
        let key = reference.key();
        if self.references.contains_key(&key) {
            return false;
        }
        self.references.insert(key, reference);
        true
    }

    /// Merge `other` into `self`, first-write-wins.
    pub fn merge(&mut self, other: &ReferenceSet) {
        for reference in other.references.values() {
            self.insert(reference.clone());
        }
    }

    /// Merge several sets in order; earlier sets win on shared keys.
    pub fn merged<'a>(sets: impl IntoIterator<Item = &'a ReferenceSet>) -> ReferenceSet {
        let mut merged = ReferenceSet::new();
        for set in sets {
            merged.merge(set);
        }
        merged
    }

    pub fn get(&self, key: &str) -> Option<&ImageReference> {
        self.references.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.references.contains_key(key)
    }

    /// Whether `reference` is wanted: either its exact tag or its whole
    /// stream is in the set.
    pub fn covers(&self, reference: &ImageReference) -> bool {
        self.references.contains_key(&reference.key())
            || self
                .references
                .contains_key(&ImageReference::stream(&reference.namespace, &reference.name).key())
    }

    pub fn len(&self) -> usize {
        self.references.len()
    }

    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.references.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ImageReference)> {
        self.references.iter()
    }
}

impl fmt::Display for ReferenceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<&str> = self.references.keys().map(String::as_str).collect();
        write!(f, "{}", keys.join(", "))
    }
}

impl FromIterator<ImageReference> for ReferenceSet {
    fn from_iter<I: IntoIterator<Item = ImageReference>>(iter: I) -> Self {
        let mut set = ReferenceSet::new();
        for reference in iter {
            set.insert(reference);
        }
        set
    }
}

/// Explicitly configured tags, streams and namespaces that are mirrored
/// whether or not any pipeline references them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideSets {
    /// `namespace/name:tag`
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// `namespace/name`
    #[serde(default)]
    pub streams: BTreeSet<String>,
    /// `namespace`
    #[serde(default)]
    pub namespaces: BTreeSet<String>,
}

impl OverrideSets {
    /// Build override sets from raw strings, rejecting malformed entries.
    /// All problems are reported together.
    pub fn from_raw<T, S, N>(tags: T, streams: S, namespaces: N) -> Result<Self>
    where
        T: IntoIterator,
        T::Item: Into<String>,
        S: IntoIterator,
        S::Item: Into<String>,
        N: IntoIterator,
        N::Item: Into<String>,
    {
        let mut errors = Vec::new();
        let mut sets = OverrideSets::default();

        for tag in tags {
            match ImageReference::parse(&tag.into()) {
                Ok(reference) => {
                    sets.tags.insert(reference.key());
                }
                Err(e) => errors.push(e),
            }
        }
        for stream in streams {
            let stream = stream.into();
            match parse_stream(stream.trim()) {
                Ok((namespace, name)) => {
                    sets.streams.insert(format!("{}/{}", namespace, name));
                }
                Err(e) => errors.push(e),
            }
        }
        for namespace in namespaces {
            let namespace = namespace.into();
            let namespace = namespace.trim();
            if namespace.is_empty() || namespace.contains('/') {
                errors.push(MirrorError::ConfigError(format!(
                    "invalid namespace override '{}'",
                    namespace
                )));
            } else {
                sets.namespaces.insert(namespace.to_string());
            }
        }

        match MirrorError::aggregate(errors) {
            Some(e) => Err(e),
            None => Ok(sets),
        }
    }

    /// The explicit tags as references.
    pub fn tag_references(&self) -> ReferenceSet {
        self.tags
            .iter()
            .filter_map(|tag| ImageReference::parse(tag).ok())
            .collect()
    }

    /// Whether the reference's stream or namespace is force-mirrored.
    pub fn covers(&self, reference: &ImageReference) -> bool {
        self.tags.contains(&reference.key())
            || self.streams.contains(&reference.stream_key())
            || self.namespaces.contains(&reference.namespace)
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty() && self.streams.is_empty() && self.namespaces.is_empty()
    }
}
