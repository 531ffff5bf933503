//! Leader election over a `coordination.k8s.io/v1` Lease.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use ci_mirror_core::error::{MirrorError, Result};
use ci_mirror_runtime::cluster::with_timeout;
use ci_mirror_runtime::Leadership;

/// How long a lease stays valid without renewal.
pub const LEASE_DURATION: Duration = Duration::from_secs(15);
/// How long a leader keeps acting without a successful renewal.
pub const RENEW_DEADLINE: Duration = Duration::from_secs(10);
/// Interval between acquire or renew attempts.
pub const RETRY_PERIOD: Duration = Duration::from_secs(2);

/// Holder identity for this process: the pod name when running in a pod.
pub fn default_identity() -> String {
    std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("ci-images-mirror-{}", std::process::id()))
}

pub struct LeaseLeadership {
    api: Api<Lease>,
    name: String,
    identity: String,
    state: watch::Sender<bool>,
}

impl LeaseLeadership {
    pub fn new(
        client: Client,
        namespace: &str,
        name: impl Into<String>,
        identity: impl Into<String>,
    ) -> Self {
        let (state, _) = watch::channel(false);
        Self {
            api: Api::namespaced(client, namespace),
            name: name.into(),
            identity: identity.into(),
            state,
        }
    }

    /// Keep acquiring or renewing the lease until `shutdown`, then release it.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let election = Arc::clone(self);
        tokio::spawn(async move {
            tracing::info!(lease = %election.name, identity = %election.identity, "Starting leader election");
            let mut last_renewed: Option<Instant> = None;

            loop {
                let attempt = with_timeout(
                    RENEW_DEADLINE,
                    "renew lease",
                    election.try_acquire_or_renew(),
                )
                .await;
                match attempt {
                    Ok(true) => {
                        last_renewed = Some(Instant::now());
                        election.set_leader(true);
                    }
                    Ok(false) => {
                        last_renewed = None;
                        election.set_leader(false);
                    }
                    Err(e) => {
                        tracing::warn!(lease = %election.name, error = %e, "Failed to update lease");
                        if renew_deadline_passed(last_renewed, Instant::now()) {
                            election.set_leader(false);
                        }
                    }
                }

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(RETRY_PERIOD) => {}
                }
            }

            let was_leader = *election.state.borrow();
            election.set_leader(false);
            if was_leader {
                match with_timeout(RENEW_DEADLINE, "release lease", election.release()).await {
                    Ok(()) => tracing::info!(lease = %election.name, "Released lease"),
                    Err(e) => tracing::warn!(lease = %election.name, error = %e, "Failed to release lease"),
                }
            }
        })
    }

    fn set_leader(&self, leader: bool) {
        let changed = self.state.send_if_modified(|current| {
            if *current == leader {
                false
            } else {
                *current = leader;
                true
            }
        });
        if changed {
            if leader {
                tracing::info!(lease = %self.name, identity = %self.identity, "Acquired leadership");
            } else {
                tracing::warn!(lease = %self.name, identity = %self.identity, "Not the leader");
            }
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool> {
        let now = Utc::now();
        match self.api.get_opt(&self.name).await.map_err(lease_error)? {
            None => {
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(self.name.clone()),
                        ..Default::default()
                    },
                    spec: Some(LeaseSpec {
                        holder_identity: Some(self.identity.clone()),
                        lease_duration_seconds: Some(LEASE_DURATION.as_secs() as i32),
                        acquire_time: Some(MicroTime(now)),
                        renew_time: Some(MicroTime(now)),
                        lease_transitions: Some(0),
                        ..Default::default()
                    }),
                };
                match self.api.create(&PostParams::default(), &lease).await {
                    Ok(_) => Ok(true),
                    Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
                    Err(e) => Err(lease_error(e)),
                }
            }
            Some(mut lease) => {
                let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
                if !claim(spec, &self.identity, now) {
                    return Ok(false);
                }
                match self
                    .api
                    .replace(&self.name, &PostParams::default(), &lease)
                    .await
                {
                    Ok(_) => Ok(true),
                    Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
                    Err(e) => Err(lease_error(e)),
                }
            }
        }
    }

    async fn release(&self) -> Result<()> {
        let Some(mut lease) = self.api.get_opt(&self.name).await.map_err(lease_error)? else {
            return Ok(());
        };
        let Some(spec) = lease.spec.as_mut() else {
            return Ok(());
        };
        if spec.holder_identity.as_deref() != Some(self.identity.as_str()) {
            return Ok(());
        }
        spec.holder_identity = None;
        spec.lease_duration_seconds = Some(1);
        spec.renew_time = Some(MicroTime(Utc::now()));
        self.api
            .replace(&self.name, &PostParams::default(), &lease)
            .await
            .map_err(lease_error)?;
        Ok(())
    }
}

impl Leadership for LeaseLeadership {
    fn is_leader(&self) -> bool {
        *self.state.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}

fn lease_error(error: kube::Error) -> MirrorError {
    MirrorError::ClusterError(format!("lease: {}", error))
}

/// Update `spec` so `identity` holds it, if it may. Returns false when
/// another holder's lease is still valid.
fn claim(spec: &mut LeaseSpec, identity: &str, now: DateTime<Utc>) -> bool {
    let held_by_us = spec.holder_identity.as_deref() == Some(identity);
    if !held_by_us {
        let vacant = spec
            .holder_identity
            .as_deref()
            .map(str::is_empty)
            .unwrap_or(true);
        if !vacant && !expired(spec, now) {
            return false;
        }
        spec.holder_identity = Some(identity.to_string());
        spec.acquire_time = Some(MicroTime(now));
        spec.lease_transitions = Some(spec.lease_transitions.unwrap_or(0) + 1);
    }
    spec.lease_duration_seconds = Some(LEASE_DURATION.as_secs() as i32);
    spec.renew_time = Some(MicroTime(now));
    true
}

/// Whether a leader whose last successful renewal was at `last_renewed`
/// must stop acting.
fn renew_deadline_passed(last_renewed: Option<Instant>, now: Instant) -> bool {
    last_renewed
        .map(|at| now.saturating_duration_since(at) > RENEW_DEADLINE)
        .unwrap_or(true)
}

fn expired(spec: &LeaseSpec, now: DateTime<Utc>) -> bool {
    match (&spec.renew_time, spec.lease_duration_seconds) {
        (Some(MicroTime(renewed)), Some(seconds)) => {
            *renewed + chrono::Duration::seconds(i64::from(seconds)) < now
        }
        _ => true,
    }
}
