//! CI Images Mirror Runtime - resolution, state and the control loop.
//!
//! This crate turns pipeline configurations into the set of images that must
//! be mirrored, keeps the record of mirror actions, and runs the
//! leader-elected controller that pushes images to the mirror registry.

#![allow(clippy::result_large_err)]

pub mod cluster;
pub mod controller;
pub mod desired;
pub mod oci;
pub mod provider;
pub mod reconciler;
pub mod resolver;
pub mod steps;
pub mod store;

// Re-export common types
pub use cluster::{
    ImageTag, ImageTagClient, Leadership, MirrorStatus, PollingWatcher, StaticLeadership, Watcher,
};
pub use controller::{Collaborators, Controller, ControllerSettings};
pub use desired::{compute_desired, DesiredSet, DesiredState};
pub use oci::{DockerConfig, ImageMirrorer, PullSpec, RegistryAuth, RegistryMirrorer};
pub use provider::{ConfigProvider, StaticConfigProvider};
pub use reconciler::{ReconcileOutcome, ReconcileSettings, Reconciler};
pub use resolver::{desired_references, resolve_references, ImageSource, Resolution};
pub use steps::{resolve_config, resolve_multi_stage, RegistryIndex, StepRegistry};
pub use store::{MirrorRecord, MirrorStore, MirrorSummary, NamespaceCounts, DEFAULT_RETENTION};

/// CI Images Mirror Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
