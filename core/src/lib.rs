//! CI Images Mirror Core - Foundational Types
//!
//! This crate provides the types shared by the mirror controller, the
//! reference resolver and the query API: image references, pipeline
//! configuration, configuration and errors.

pub mod config;
pub mod error;
pub mod event;
pub mod pipeline;
pub mod reference;

// Re-export commonly used types
pub use config::{LogFormat, MirrorConfig};
pub use error::{MirrorError, Result};
pub use event::{EventKind, ImageTagEvent};
pub use pipeline::ReleaseBuildConfiguration;
pub use reference::{ImageReference, OverrideSets, ReferenceSet};

/// CI Images Mirror version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
