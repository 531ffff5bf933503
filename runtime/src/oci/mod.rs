//! Registry access for the mirror.
//!
//! - Pull-spec parsing and the source/destination naming of mirrored tags
//! - Docker `config.json` credentials
//! - Registry-to-registry copy behind the [`ImageMirrorer`] trait

pub mod credentials;
pub mod reference;
pub mod registry;

pub use credentials::DockerConfig;
pub use reference::PullSpec;
pub use registry::{ImageMirrorer, RegistryAuth, RegistryMirrorer};
