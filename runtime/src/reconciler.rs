//! Single-object reconcile pass.
//!
//! Given one image-tag reference: look the object up, check it against the
//! desired set and the overrides, and mirror it when its recorded mirror is
//! missing or stale. Every push attempt, real or simulated, is written to the
//! [`MirrorStore`].

use std::sync::Arc;
use std::time::Duration;

use ci_mirror_core::config::MirrorConfig;
use ci_mirror_core::error::Result;
use ci_mirror_core::reference::{ImageReference, OverrideSets};

use crate::cluster::{with_timeout, ImageTagClient, MirrorStatus};
use crate::desired::DesiredSet;
use crate::oci::{ImageMirrorer, PullSpec};
use crate::store::{MirrorRecord, MirrorStore};

/// The parts of [`MirrorConfig`] a reconcile pass needs.
#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    pub dry_run: bool,
    pub source_registry: String,
    pub source_cluster: String,
    pub destination_repository: String,
    pub push_timeout: Duration,
    pub cluster_timeout: Duration,
}

impl From<&MirrorConfig> for ReconcileSettings {
    fn from(config: &MirrorConfig) -> Self {
        Self {
            dry_run: config.dry_run,
            source_registry: config.source_registry.clone(),
            source_cluster: config.source_cluster.clone(),
            destination_repository: config.destination_repository.clone(),
            push_timeout: config.push_timeout(),
            cluster_timeout: config.cluster_timeout(),
        }
    }
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self::from(&MirrorConfig::default())
    }
}

/// What a reconcile pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The object no longer exists.
    Gone,
    /// Neither desired nor overridden.
    NotDesired,
    /// No image has been imported for the tag yet.
    NotImported,
    /// Already mirrored at the current digest.
    UpToDate,
    /// Dry-run: the mirror that would have been pushed.
    DryRun { destination: String },
    Mirrored { destination: String, digest: String },
}

pub struct Reconciler {
    client: Arc<dyn ImageTagClient>,
    mirrorer: Arc<dyn ImageMirrorer>,
    store: Arc<MirrorStore>,
    desired: Arc<DesiredSet>,
    overrides: OverrideSets,
    settings: ReconcileSettings,
}

impl Reconciler {
    pub fn new(
        client: Arc<dyn ImageTagClient>,
        mirrorer: Arc<dyn ImageMirrorer>,
        store: Arc<MirrorStore>,
        desired: Arc<DesiredSet>,
        overrides: OverrideSets,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            client,
            mirrorer,
            store,
            desired,
            overrides,
            settings,
        }
    }

    pub fn settings(&self) -> &ReconcileSettings {
        &self.settings
    }

    /// Bring one object in line with the desired state.
    pub async fn reconcile(&self, reference: &ImageReference) -> Result<ReconcileOutcome> {
        let tag = with_timeout(
            self.settings.cluster_timeout,
            "get image tag",
            self.client.get(reference),
        )
        .await?;
        let Some(tag) = tag else {
            tracing::debug!(reference = %reference, "Image tag is gone");
            return Ok(ReconcileOutcome::Gone);
        };

        let desired = self.desired.snapshot();
        if !desired.wants(&tag.reference, &self.overrides) {
            tracing::trace!(reference = %reference, "Image tag is not desired");
            return Ok(ReconcileOutcome::NotDesired);
        }

        let Some(source_digest) = tag.digest.clone() else {
            tracing::debug!(reference = %reference, "Image tag has no imported image, skipping");
            return Ok(ReconcileOutcome::NotImported);
        };

        let destination =
            PullSpec::mirror_destination(&self.settings.destination_repository, &tag.reference)?
                .to_string();
        if tag.is_mirrored_to(&destination) {
            return Ok(ReconcileOutcome::UpToDate);
        }
        let source = PullSpec::source(&self.settings.source_registry, &tag.reference).to_string();

        if self.settings.dry_run {
            tracing::info!(
                namespace = %tag.reference.namespace,
                name = %tag.reference.name,
                tag = %tag.reference.tag,
                source = %source,
                destination = %destination,
                "Dry run: would mirror image"
            );
            self.store.record(MirrorRecord::succeeded(
                tag.reference.clone(),
                destination.as_str(),
                self.settings.source_cluster.as_str(),
            ));
            return Ok(ReconcileOutcome::DryRun { destination });
        }

        let pushed = with_timeout(
            self.settings.push_timeout,
            "mirror image",
            self.mirrorer.mirror(&source, &destination),
        )
        .await;
        let digest = match pushed {
            Ok(digest) => digest,
            Err(e) => {
                tracing::warn!(
                    namespace = %tag.reference.namespace,
                    name = %tag.reference.name,
                    tag = %tag.reference.tag,
                    destination = %destination,
                    error = %e,
                    "Failed to mirror image"
                );
                self.store.record(MirrorRecord::failed(
                    tag.reference.clone(),
                    destination.as_str(),
                    self.settings.source_cluster.as_str(),
                    &e,
                ));
                return Err(e);
            }
        };

        self.store.record(MirrorRecord::succeeded(
            tag.reference.clone(),
            destination.as_str(),
            self.settings.source_cluster.as_str(),
        ));

        // The status tracks the source digest so the next pass can compare it
        // with the object directly.
        let status = MirrorStatus {
            destination: destination.clone(),
            digest: source_digest,
        };
        with_timeout(
            self.settings.cluster_timeout,
            "set mirror status",
            self.client.set_mirror(&tag.reference, status),
        )
        .await?;

        tracing::info!(
            namespace = %tag.reference.namespace,
            name = %tag.reference.name,
            tag = %tag.reference.tag,
            destination = %destination,
            digest = %digest,
            "Mirrored image"
        );
        Ok(ReconcileOutcome::Mirrored { destination, digest })
    }
}
