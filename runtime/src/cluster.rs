//! Cluster-side collaborators: image-tag objects, change events and
//! leadership.
//!
//! The controller only sees these traits; the binary supplies Kubernetes
//! implementations and tests supply in-memory ones.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use ci_mirror_core::error::{MirrorError, Result};
use ci_mirror_core::event::ImageTagEvent;
use ci_mirror_core::reference::ImageReference;

/// Capacity of the event channel handed out by [`PollingWatcher`].
const EVENT_BUFFER: usize = 1024;

/// Last mirror recorded on an image-tag object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorStatus {
    pub destination: String,
    pub digest: String,
}

/// One tag of an image stream as seen on the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageTag {
    pub reference: ImageReference,
    /// Digest the tag currently points at, if imported.
    pub digest: Option<String>,
    pub mirror: Option<MirrorStatus>,
}

impl ImageTag {
    pub fn new(reference: ImageReference, digest: Option<String>) -> Self {
        Self {
            reference,
            digest,
            mirror: None,
        }
    }

    pub fn with_mirror(mut self, destination: impl Into<String>, digest: impl Into<String>) -> Self {
        self.mirror = Some(MirrorStatus {
            destination: destination.into(),
            digest: digest.into(),
        });
        self
    }

    /// Whether the recorded mirror matches `destination` and the current digest.
    pub fn is_mirrored_to(&self, destination: &str) -> bool {
        match (&self.mirror, &self.digest) {
            (Some(mirror), Some(digest)) => {
                mirror.destination == destination && &mirror.digest == digest
            }
            _ => false,
        }
    }
}

/// Access to image-tag objects on the cluster.
#[async_trait]
pub trait ImageTagClient: Send + Sync {
    async fn list(&self) -> Result<Vec<ImageTag>>;

    /// `None` when the object no longer exists.
    async fn get(&self, reference: &ImageReference) -> Result<Option<ImageTag>>;

    /// Record a completed mirror on the object.
    async fn set_mirror(&self, reference: &ImageReference, status: MirrorStatus) -> Result<()>;
}

/// Source of image-tag change notifications.
pub trait Watcher: Send + Sync {
    /// Start delivering events until `shutdown` is cancelled or the receiver
    /// is dropped.
    fn events(&self, shutdown: CancellationToken) -> mpsc::Receiver<ImageTagEvent>;
}

/// Leader election as seen by the controller.
pub trait Leadership: Send + Sync {
    fn is_leader(&self) -> bool;

    /// Receiver that observes every leadership change.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Leadership decided by the caller. Used for single-instance deployments
/// and in tests.
pub struct StaticLeadership {
    state: watch::Sender<bool>,
}

impl StaticLeadership {
    pub fn leader() -> Self {
        Self::new(true)
    }

    pub fn follower() -> Self {
        Self::new(false)
    }

    fn new(leader: bool) -> Self {
        let (state, _) = watch::channel(leader);
        Self { state }
    }

    pub fn set(&self, leader: bool) {
        self.state.send_replace(leader);
    }
}

impl Leadership for StaticLeadership {
    fn is_leader(&self) -> bool {
        *self.state.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}

/// Run a cluster or registry call with a deadline.
pub async fn with_timeout<T, F>(limit: Duration, what: &str, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(MirrorError::TimeoutError(format!(
            "{} did not finish within {:?}",
            what, limit
        ))),
    }
}

/// [`Watcher`] that lists all objects periodically and emits the difference
/// from the previous listing. The first successful listing is the baseline
/// and emits nothing; the controller enqueues every object when a term starts.
pub struct PollingWatcher {
    client: Arc<dyn ImageTagClient>,
    interval: Duration,
    timeout: Duration,
}

impl PollingWatcher {
    pub fn new(client: Arc<dyn ImageTagClient>, interval: Duration, timeout: Duration) -> Self {
        Self {
            client,
            interval,
            timeout,
        }
    }
}

impl Watcher for PollingWatcher {
    fn events(&self, shutdown: CancellationToken) -> mpsc::Receiver<ImageTagEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let client = Arc::clone(&self.client);
        let interval = self.interval;
        let timeout = self.timeout;

        tokio::spawn(async move {
            let mut known: Option<HashMap<String, ImageTag>> = None;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let listed = match with_timeout(timeout, "list image tags", client.list()).await {
                    Ok(listed) => listed,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to list image tags");
                        continue;
                    }
                };

                let current: HashMap<String, ImageTag> = listed
                    .into_iter()
                    .map(|tag| (tag.reference.key(), tag))
                    .collect();
                let events = match known.as_ref() {
                    Some(previous) => diff(previous, &current),
                    None => {
                        tracing::debug!(objects = current.len(), "Recorded initial image tag listing");
                        Vec::new()
                    }
                };
                known = Some(current);

                if !events.is_empty() {
                    tracing::debug!(events = events.len(), "Image tag changes observed");
                }
                for event in events {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        });

        rx
    }
}

/// Events turning `before` into `after`. An object is modified when its
/// digest or mirror status changed.
fn diff(before: &HashMap<String, ImageTag>, after: &HashMap<String, ImageTag>) -> Vec<ImageTagEvent> {
    let mut events = Vec::new();
    for (key, tag) in after {
        match before.get(key) {
            None => events.push(ImageTagEvent::added(tag.reference.clone())),
            Some(old) if old.digest != tag.digest || old.mirror != tag.mirror => {
                events.push(ImageTagEvent::modified(tag.reference.clone()))
            }
            Some(_) => {}
        }
    }
    for (key, tag) in before {
        if !after.contains_key(key) {
            events.push(ImageTagEvent::deleted(tag.reference.clone()));
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use ci_mirror_core::event::EventKind;
    use parking_lot::Mutex;

    struct ListOnly {
        tags: Mutex<Vec<ImageTag>>,
    }

    #[async_trait]
    impl ImageTagClient for ListOnly {
        async fn list(&self) -> Result<Vec<ImageTag>> {
            Ok(self.tags.lock().clone())
        }

        async fn get(&self, _reference: &ImageReference) -> Result<Option<ImageTag>> {
            Ok(None)
        }

        async fn set_mirror(&self, _reference: &ImageReference, _status: MirrorStatus) -> Result<()> {
            Ok(())
        }
    }

    fn tag(name: &str, digest: &str) -> ImageTag {
        ImageTag::new(
            ImageReference::new("ci", name, "latest"),
            Some(digest.to_string()),
        )
    }

    #[test]
    fn test_is_mirrored_to() {
        let t = tag("a", "sha256:1").with_mirror("quay.io/openshift/ci:ci_a_latest", "sha256:1");
        assert!(t.is_mirrored_to("quay.io/openshift/ci:ci_a_latest"));
        assert!(!t.is_mirrored_to("quay.io/other:ci_a_latest"));

        let stale = tag("a", "sha256:2").with_mirror("quay.io/openshift/ci:ci_a_latest", "sha256:1");
        assert!(!stale.is_mirrored_to("quay.io/openshift/ci:ci_a_latest"));

        assert!(!tag("a", "sha256:1").is_mirrored_to("quay.io/openshift/ci:ci_a_latest"));
    }

    #[test]
    fn test_diff() {
        let before: HashMap<_, _> = [tag("a", "1"), tag("b", "1"), tag("c", "1")]
            .into_iter()
            .map(|t| (t.reference.key(), t))
            .collect();
        let after: HashMap<_, _> = [tag("a", "1"), tag("b", "2"), tag("d", "1")]
            .into_iter()
            .map(|t| (t.reference.key(), t))
            .collect();

        let mut events: Vec<(EventKind, String)> = diff(&before, &after)
            .into_iter()
            .map(|e| (e.kind, e.reference.name))
            .collect();
        events.sort_by(|a, b| a.1.cmp(&b.1));
        assert_eq!(
            events,
            vec![
                (EventKind::Modified, "b".to_string()),
                (EventKind::Deleted, "c".to_string()),
                (EventKind::Added, "d".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_polling_watcher_emits_changes() {
        let client = Arc::new(ListOnly {
            tags: Mutex::new(vec![tag("a", "1")]),
        });
        let watcher = PollingWatcher::new(
            client.clone(),
            Duration::from_millis(10),
            Duration::from_secs(1),
        );
        let shutdown = CancellationToken::new();
        let mut events = watcher.events(shutdown.clone());

        // The initial listing only sets the baseline.
        let quiet = tokio::time::timeout(Duration::from_millis(60), events.recv()).await;
        assert!(quiet.is_err());

        *client.tags.lock() = vec![tag("a", "2")];
        let first = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.kind, EventKind::Modified);
        assert_eq!(first.reference.name, "a");

        client.tags.lock().push(tag("b", "1"));
        let second = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.kind, EventKind::Added);
        assert_eq!(second.reference.name, "b");

        shutdown.cancel();
        let closed = tokio::time::timeout(Duration::from_secs(1), async {
            while events.recv().await.is_some() {}
        })
        .await;
        assert!(closed.is_ok());
    }

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let result: Result<()> = with_timeout(Duration::from_millis(10), "slow call", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        let err = result.unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("slow call"));
    }

    #[test]
    fn test_static_leadership() {
        let leadership = StaticLeadership::follower();
        let rx = leadership.subscribe();
        assert!(!leadership.is_leader());
        leadership.set(true);
        assert!(leadership.is_leader());
        assert!(*rx.borrow());
    }
}
