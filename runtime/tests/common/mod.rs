//! In-memory collaborators shared by the runtime integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use ci_mirror_core::config::MirrorConfig;
use ci_mirror_core::error::{MirrorError, Result};
use ci_mirror_core::reference::{ImageReference, OverrideSets, ReferenceSet};
use ci_mirror_runtime::{
    DesiredSet, DesiredState, ImageMirrorer, ImageTag, ImageTagClient, MirrorStatus, MirrorStore,
    ReconcileSettings, Reconciler,
};

/// Image-tag objects held in memory.
#[derive(Default)]
pub struct FakeCluster {
    tags: Mutex<BTreeMap<String, ImageTag>>,
    get_failures: AtomicU32,
    set_mirror_calls: AtomicU32,
}

impl FakeCluster {
    pub fn with_tags(tags: impl IntoIterator<Item = ImageTag>) -> Arc<Self> {
        let cluster = Self::default();
        for tag in tags {
            cluster.put(tag);
        }
        Arc::new(cluster)
    }

    pub fn put(&self, tag: ImageTag) {
        self.tags.lock().insert(tag.reference.key(), tag);
    }

    pub fn remove(&self, reference: &ImageReference) {
        self.tags.lock().remove(&reference.key());
    }

    pub fn tag(&self, reference: &ImageReference) -> Option<ImageTag> {
        self.tags.lock().get(&reference.key()).cloned()
    }

    /// Make the next `n` calls to `get` fail with a cluster error.
    pub fn fail_gets(&self, n: u32) {
        self.get_failures.store(n, Ordering::SeqCst);
    }

    pub fn set_mirror_calls(&self) -> u32 {
        self.set_mirror_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageTagClient for FakeCluster {
    async fn list(&self) -> Result<Vec<ImageTag>> {
        Ok(self.tags.lock().values().cloned().collect())
    }

    async fn get(&self, reference: &ImageReference) -> Result<Option<ImageTag>> {
        let failing = self
            .get_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(MirrorError::ClusterError("connection refused".to_string()));
        }
        Ok(self.tag(reference))
    }

    async fn set_mirror(&self, reference: &ImageReference, status: MirrorStatus) -> Result<()> {
        self.set_mirror_calls.fetch_add(1, Ordering::SeqCst);
        let mut tags = self.tags.lock();
        let tag = tags
            .get_mut(&reference.key())
            .ok_or_else(|| MirrorError::ClusterError(format!("{} not found", reference)))?;
        tag.mirror = Some(status);
        Ok(())
    }
}

/// Mirrorer that records calls and can be told to fail.
#[derive(Default)]
pub struct FakeMirrorer {
    calls: Mutex<Vec<(String, String)>>,
    failures: AtomicU32,
    permanent: Mutex<bool>,
}

impl FakeMirrorer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `n` pushes with a transient registry error.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Fail every push with a non-transient error.
    pub fn fail_permanently(&self) {
        *self.permanent.lock() = true;
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl ImageMirrorer for FakeMirrorer {
    async fn mirror(&self, source: &str, destination: &str) -> Result<String> {
        self.calls
            .lock()
            .push((source.to_string(), destination.to_string()));
        if *self.permanent.lock() {
            return Err(MirrorError::InvalidReference {
                reference: destination.to_string(),
                message: "rejected".to_string(),
            });
        }
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(MirrorError::RegistryError {
                registry: "quay.io".to_string(),
                message: "503 Service Unavailable".to_string(),
            });
        }
        Ok("sha256:pushed".to_string())
    }
}

pub fn image_tag(namespace: &str, name: &str, tag: &str, digest: &str) -> ImageTag {
    ImageTag::new(
        ImageReference::new(namespace, name, tag),
        Some(digest.to_string()),
    )
}

pub fn desired(references: &[ImageReference]) -> Arc<DesiredSet> {
    Arc::new(DesiredSet::with_state(DesiredState {
        references: references.iter().cloned().collect::<ReferenceSet>(),
        ..DesiredState::empty()
    }))
}

/// Config with tight timings for tests.
pub fn fast_config() -> MirrorConfig {
    MirrorConfig {
        workers: 2,
        max_attempts: 3,
        base_backoff_ms: 5,
        max_backoff_secs: 1,
        push_timeout_secs: 5,
        cluster_timeout_secs: 5,
        poll_interval_secs: 1,
        resync_interval_secs: 60,
        grace_period_secs: 1,
        ..Default::default()
    }
}

pub struct Harness {
    pub cluster: Arc<FakeCluster>,
    pub mirrorer: Arc<FakeMirrorer>,
    pub store: Arc<MirrorStore>,
    pub reconciler: Reconciler,
}

pub fn reconciler(
    cluster: Arc<FakeCluster>,
    desired: Arc<DesiredSet>,
    overrides: OverrideSets,
    dry_run: bool,
) -> Harness {
    let mirrorer = FakeMirrorer::new();
    let store = Arc::new(MirrorStore::new(100));
    let settings = ReconcileSettings {
        dry_run,
        ..ReconcileSettings::from(&fast_config())
    };
    let reconciler = Reconciler::new(
        cluster.clone(),
        mirrorer.clone(),
        Arc::clone(&store),
        desired,
        overrides,
        settings,
    );
    Harness {
        cluster,
        mirrorer,
        store,
        reconciler,
    }
}

/// Poll `condition` until it holds or `limit` passes.
pub async fn eventually(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
