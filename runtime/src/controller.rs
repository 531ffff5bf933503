//! The mirror control loop.
//!
//! While this instance holds leadership the controller runs one *term*:
//!
//! ```text
//!  Watcher ──events──┐
//!                    ├──► WorkQueue ──► N workers ──► Reconciler ──► MirrorStore
//!  Refresher ──list──┘        ▲                          │
//!     ▲                       └──── rate-limited retry ──┘
//!     └── config generation change / resync timer
//! ```
//!
//! Losing leadership or shutdown cancels the term: the queue is shut down and
//! in-flight reconciles get the grace period to finish.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use ci_mirror_core::config::MirrorConfig;
use ci_mirror_core::error::{MirrorError, Result};
use ci_mirror_core::reference::{ImageReference, OverrideSets};
use ci_mirror_queue::{QueueMonitor, WorkQueue};

use crate::cluster::{with_timeout, ImageTagClient, Leadership, Watcher};
use crate::desired::{compute_desired, DesiredSet, DesiredState};
use crate::oci::ImageMirrorer;
use crate::provider::ConfigProvider;
use crate::reconciler::{ReconcileSettings, Reconciler};
use crate::steps::StepRegistry;
use crate::store::MirrorStore;

type Queue = WorkQueue<ImageReference>;

/// Everything the controller talks to.
pub struct Collaborators {
    pub client: Arc<dyn ImageTagClient>,
    pub watcher: Arc<dyn Watcher>,
    pub mirrorer: Arc<dyn ImageMirrorer>,
    pub provider: Arc<dyn ConfigProvider>,
    pub registry: Arc<dyn StepRegistry>,
    pub leadership: Arc<dyn Leadership>,
}

/// Loop-level settings taken from [`MirrorConfig`].
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub workers: usize,
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub resync_interval: Duration,
    pub grace_period: Duration,
    pub cluster_timeout: Duration,
}

impl From<&MirrorConfig> for ControllerSettings {
    fn from(config: &MirrorConfig) -> Self {
        Self {
            workers: config.workers.max(1),
            max_attempts: config.max_attempts.max(1),
            base_backoff: config.base_backoff(),
            max_backoff: config.max_backoff(),
            resync_interval: config.resync_interval(),
            grace_period: config.grace_period(),
            cluster_timeout: config.cluster_timeout(),
        }
    }
}

pub struct Controller {
    reconciler: Arc<Reconciler>,
    client: Arc<dyn ImageTagClient>,
    watcher: Arc<dyn Watcher>,
    provider: Arc<dyn ConfigProvider>,
    registry: Arc<dyn StepRegistry>,
    leadership: Arc<dyn Leadership>,
    desired: Arc<DesiredSet>,
    overrides: OverrideSets,
    settings: ControllerSettings,
}

impl Controller {
    pub fn new(config: &MirrorConfig, collaborators: Collaborators, store: Arc<MirrorStore>) -> Self {
        let desired = Arc::new(DesiredSet::new());
        let reconciler = Reconciler::new(
            Arc::clone(&collaborators.client),
            collaborators.mirrorer,
            store,
            Arc::clone(&desired),
            config.overrides.clone(),
            ReconcileSettings::from(config),
        );

        Self {
            reconciler: Arc::new(reconciler),
            client: collaborators.client,
            watcher: collaborators.watcher,
            provider: collaborators.provider,
            registry: collaborators.registry,
            leadership: collaborators.leadership,
            desired,
            overrides: config.overrides.clone(),
            settings: ControllerSettings::from(config),
        }
    }

    /// The desired-reference set currently in effect.
    pub fn desired(&self) -> Arc<DesiredState> {
        self.desired.snapshot()
    }

    /// Run until `shutdown` is cancelled, leading whenever leadership is held.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut leadership = self.leadership.subscribe();

        loop {
            while !*leadership.borrow_and_update() {
                tracing::info!("Waiting for leadership");
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    changed = leadership.changed() => {
                        if changed.is_err() {
                            return Err(MirrorError::Other("leadership source closed".to_string()));
                        }
                    }
                }
            }

            tracing::info!(workers = self.settings.workers, "Became leader, starting control loop");
            let term = shutdown.child_token();
            let lead = tokio::spawn(Arc::clone(&self).lead(term.clone()));

            let mut closed = false;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = leadership.changed() => {
                        if changed.is_err() {
                            closed = true;
                            break;
                        }
                        if !*leadership.borrow_and_update() {
                            tracing::warn!("Lost leadership, stopping control loop");
                            break;
                        }
                    }
                }
            }

            term.cancel();
            if let Err(e) = lead.await {
                tracing::error!(error = %e, "Control loop task failed");
            }
            if shutdown.is_cancelled() {
                return Ok(());
            }
            if closed {
                return Err(MirrorError::Other("leadership source closed".to_string()));
            }
        }
    }

    /// One leadership term.
    async fn lead(self: Arc<Self>, term: CancellationToken) {
        let queue: Arc<Queue> = Arc::new(WorkQueue::new(
            self.settings.base_backoff,
            self.settings.max_backoff,
        ));

        let mut config_changes = self.provider.subscribe();
        let initial_generation = *config_changes.borrow_and_update();
        self.refresh(&queue, initial_generation).await;

        let monitor = QueueMonitor::new(Arc::clone(&queue)).start(term.clone());
        let events = self.spawn_event_pump(Arc::clone(&queue), term.clone());
        let refresher = {
            let controller = Arc::clone(&self);
            let queue = Arc::clone(&queue);
            let term = term.clone();
            tokio::spawn(async move {
                controller.refresh_loop(queue, config_changes, term).await;
            })
        };
        let workers: Vec<JoinHandle<()>> = (0..self.settings.workers)
            .map(|id| tokio::spawn(Arc::clone(&self).worker(id, Arc::clone(&queue))))
            .collect();

        term.cancelled().await;
        queue.shut_down();

        let aborts: Vec<_> = workers.iter().map(|w| w.abort_handle()).collect();
        let drain = async {
            for worker in workers {
                let _ = worker.await;
            }
        };
        if tokio::time::timeout(self.settings.grace_period, drain).await.is_err() {
            tracing::warn!(
                grace_period = ?self.settings.grace_period,
                "Grace period expired, abandoning in-flight reconciles"
            );
            for abort in aborts {
                abort.abort();
            }
        }

        for task in [events, refresher, monitor] {
            let _ = task.await;
        }
        tracing::info!("Control loop stopped");
    }

    fn spawn_event_pump(&self, queue: Arc<Queue>, term: CancellationToken) -> JoinHandle<()> {
        let mut events = self.watcher.events(term.clone());
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = term.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => {
                            tracing::trace!(kind = ?event.kind, reference = %event.reference, "Image tag event");
                            queue.add(event.reference);
                        }
                        None => {
                            tracing::warn!("Image tag event stream ended");
                            break;
                        }
                    }
                }
            }
        })
    }

    async fn refresh_loop(
        &self,
        queue: Arc<Queue>,
        mut config_changes: tokio::sync::watch::Receiver<u64>,
        term: CancellationToken,
    ) {
        let mut resync = tokio::time::interval(self.settings.resync_interval);
        resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately and the term already refreshed.
        resync.tick().await;
        let mut watching = true;

        loop {
            tokio::select! {
                _ = term.cancelled() => break,
                changed = config_changes.changed(), if watching => {
                    if changed.is_err() {
                        tracing::warn!("Configuration source closed, relying on periodic resync");
                        watching = false;
                        continue;
                    }
                    let generation = *config_changes.borrow_and_update();
                    tracing::info!(generation, "Configuration changed");
                    self.refresh(&queue, generation).await;
                }
                _ = resync.tick() => {
                    let generation = *config_changes.borrow();
                    tracing::debug!(generation, "Periodic resync");
                    self.refresh(&queue, generation).await;
                }
            }
        }
    }

    /// Recompute the desired set and enqueue every listed object.
    async fn refresh(&self, queue: &Arc<Queue>, generation: u64) {
        let provider = Arc::clone(&self.provider);
        let registry = Arc::clone(&self.registry);
        let overrides = self.overrides.clone();
        let computed = tokio::task::spawn_blocking(move || {
            compute_desired(provider.as_ref(), registry.as_ref(), &overrides, generation)
        })
        .await;

        match computed {
            Ok(Ok(state)) => {
                self.desired.replace(state);
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Failed to read configurations, keeping previous desired set");
            }
            Err(e) => {
                tracing::error!(error = %e, "Desired set computation panicked");
            }
        }

        match with_timeout(self.settings.cluster_timeout, "list image tags", self.client.list()).await {
            Ok(tags) => {
                tracing::debug!(objects = tags.len(), "Enqueueing all image tags");
                for tag in tags {
                    queue.add(tag.reference);
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to list image tags for resync"),
        }
    }

    async fn worker(self: Arc<Self>, id: usize, queue: Arc<Queue>) {
        while let Some(reference) = queue.get().await {
            match self.reconciler.reconcile(&reference).await {
                Ok(outcome) => {
                    tracing::debug!(worker = id, reference = %reference, outcome = ?outcome, "Reconciled");
                    queue.forget(&reference);
                }
                Err(e) if e.is_transient() && queue.num_requeues(&reference) + 1 < self.settings.max_attempts => {
                    let delay = queue.add_rate_limited(reference.clone());
                    tracing::warn!(
                        worker = id,
                        reference = %reference,
                        error = %e,
                        retry_in = ?delay,
                        "Reconcile failed, will retry"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        worker = id,
                        reference = %reference,
                        error = %e,
                        attempts = queue.num_requeues(&reference) + 1,
                        "Reconcile failed, giving up until next resync"
                    );
                    queue.forget(&reference);
                }
            }
            queue.done(&reference);
        }
    }
}
