//! CI Images Mirror - binary support library.
//!
//! Command-line options, the query API and the concrete collaborators the
//! controller runs against: the release repository on disk, image streams
//! and a Lease on the cluster.

#![allow(clippy::result_large_err)]

pub mod agent;
pub mod api;
pub mod kube_client;
pub mod leader;
pub mod options;

pub use agent::FileConfigAgent;
pub use api::router;
pub use kube_client::KubeImageStreams;
pub use leader::LeaseLeadership;
pub use options::Options;
