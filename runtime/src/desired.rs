//! The desired-reference set shared between the refresher and the workers.
//!
//! Workers read an `Arc` snapshot; a refresh builds a new snapshot from the
//! current configurations and swaps it in, so a reconcile pass always sees
//! one consistent set.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use ci_mirror_core::error::Result;
use ci_mirror_core::reference::{ImageReference, OverrideSets, ReferenceSet};

use crate::provider::ConfigProvider;
use crate::resolver::desired_references;
use crate::steps::{resolve_config, StepRegistry};

/// One computed desired-reference set.
#[derive(Debug, Clone)]
pub struct DesiredState {
    pub references: ReferenceSet,
    /// Provider generation the set was computed from.
    pub generation: u64,
    pub resolved_at: DateTime<Utc>,
    /// Set when some configuration could not be fully resolved.
    pub incomplete: bool,
}

impl DesiredState {
    pub fn empty() -> Self {
        Self {
            references: ReferenceSet::new(),
            generation: 0,
            resolved_at: Utc::now(),
            incomplete: false,
        }
    }

    /// Whether `reference` must be mirrored: its tag or its whole stream is
    /// desired, or it is covered by an override.
    pub fn wants(&self, reference: &ImageReference, overrides: &OverrideSets) -> bool {
        self.references.covers(reference) || overrides.covers(reference)
    }
}

/// Holder of the current [`DesiredState`].
pub struct DesiredSet {
    current: RwLock<Arc<DesiredState>>,
}

impl DesiredSet {
    pub fn new() -> Self {
        Self::with_state(DesiredState::empty())
    }

    pub fn with_state(state: DesiredState) -> Self {
        Self {
            current: RwLock::new(Arc::new(state)),
        }
    }

    pub fn snapshot(&self) -> Arc<DesiredState> {
        Arc::clone(&self.current.read())
    }

    pub fn replace(&self, state: DesiredState) -> Arc<DesiredState> {
        let state = Arc::new(state);
        *self.current.write() = Arc::clone(&state);
        state
    }
}

impl Default for DesiredSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Compute a fresh desired state from the provider's configurations.
///
/// Step-registry and resolution problems are logged and leave the state
/// marked incomplete; only failing to read the configurations at all is an
/// error.
pub fn compute_desired(
    provider: &dyn ConfigProvider,
    registry: &dyn StepRegistry,
    overrides: &OverrideSets,
    generation: u64,
) -> Result<DesiredState> {
    let configs = provider.configs()?;
    let mut incomplete = false;

    let resolved: Vec<_> = configs
        .iter()
        .map(|config| {
            let (resolved, error) = resolve_config(config, registry);
            if let Some(e) = error {
                incomplete = true;
                tracing::warn!(config = %config.metadata, error = %e, "Failed to resolve test steps");
            }
            resolved
        })
        .collect();

    let resolution = desired_references(&resolved, overrides);
    if let Some(e) = &resolution.error {
        incomplete = true;
        tracing::warn!(error = %e, "Desired reference set is incomplete");
    }

    tracing::info!(
        configs = configs.len(),
        references = resolution.references.len(),
        generation,
        incomplete,
        "Computed desired reference set"
    );

    Ok(DesiredState {
        references: resolution.references,
        generation,
        resolved_at: Utc::now(),
        incomplete,
    })
}
