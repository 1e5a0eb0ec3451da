//! Lease-based leader election
//!
//! With several operator replicas, only the holder of a
//! `coordination.k8s.io/v1` Lease runs the Kubexpose controller. Standbys
//! wait in [`LeaderElector::acquire`] until the holder stops renewing.

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_LEASE_NAME: &str = "kubexpose-operator-leader";

const SERVICE_ACCOUNT_NAMESPACE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Timing and identity of the lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseConfig {
    pub name: String,
    /// How long a holder keeps the lease without renewing
    pub lease_duration: Duration,
    pub renew_interval: Duration,
    pub retry_interval: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_LEASE_NAME.to_string(),
            lease_duration: Duration::from_secs(15),
            renew_interval: Duration::from_secs(10),
            retry_interval: Duration::from_secs(5),
        }
    }
}

/// Namespace for the lease: explicit value, then the pod's service account
/// namespace, then `default`.
pub fn detect_namespace(explicit: &str) -> String {
    if !explicit.is_empty() {
        return explicit.to_string();
    }
    std::fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE)
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "default".to_string())
}

/// Whether a lease last renewed per `spec` may be taken over at `now`.
fn is_expired(spec: Option<&LeaseSpec>, default_duration: Duration, now: DateTime<Utc>) -> bool {
    let Some(MicroTime(renewed)) = spec.and_then(|s| s.renew_time.as_ref()) else {
        return true;
    };
    let duration_secs = spec
        .and_then(|s| s.lease_duration_seconds)
        .map(i64::from)
        .unwrap_or(default_duration.as_secs() as i64);
    now.signed_duration_since(*renewed).num_seconds() > duration_secs
}

/// Holder of the operator's Lease
pub struct LeaderElector {
    lease_api: Api<Lease>,
    identity: String,
    config: LeaseConfig,
}

impl LeaderElector {
    pub fn new(client: Client, namespace: &str, config: LeaseConfig) -> Self {
        let identity = std::env::var("POD_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| format!("kubexpose-{:08x}", rand::random::<u32>()));
        info!(identity = %identity, namespace = %namespace, lease = %config.name, "Initialized leader elector");
        Self {
            lease_api: Api::namespaced(client, namespace),
            identity,
            config,
        }
    }

    /// Block until this replica holds the lease.
    pub async fn acquire(&self) {
        info!(identity = %self.identity, "Waiting to acquire leader lease");
        loop {
            match self.try_acquire().await {
                Ok(true) => {
                    info!(identity = %self.identity, "Acquired leader lease");
                    return;
                }
                Ok(false) => debug!("Lease held by another replica"),
                Err(e) => warn!("Lease acquisition error: {}", e),
            }
            tokio::time::sleep(self.config.retry_interval).await;
        }
    }

    /// Renew the lease periodically; returns once leadership is lost.
    pub async fn hold(&self) {
        loop {
            tokio::time::sleep(self.config.renew_interval).await;
            match self.renew().await {
                Ok(true) => debug!("Renewed leader lease"),
                Ok(false) => {
                    warn!("Leader lease taken by another replica");
                    return;
                }
                Err(e) => {
                    warn!("Failed to renew leader lease: {}", e);
                    return;
                }
            }
        }
    }

    /// Clear the holder so a standby can take over without waiting for expiry.
    pub async fn release(&self) {
        let mut lease = match self.lease_api.get(&self.config.name).await {
            Ok(l) => l,
            Err(e) => {
                warn!("Failed to read lease for release: {}", e);
                return;
            }
        };
        if !self.holds(&lease) {
            debug!("Lease not held by us, skipping release");
            return;
        }
        if let Some(spec) = lease.spec.as_mut() {
            spec.holder_identity = None;
        }
        match self.replace(&lease).await {
            Ok(true) => info!("Released leader lease"),
            Ok(false) => debug!("Lease changed while releasing"),
            Err(e) => warn!("Failed to release leader lease: {}", e),
        }
    }

    fn holds(&self, lease: &Lease) -> bool {
        lease
            .spec
            .as_ref()
            .and_then(|s| s.holder_identity.as_deref())
            == Some(self.identity.as_str())
    }

    async fn renew(&self) -> Result<bool, kube::Error> {
        let mut lease = self.lease_api.get(&self.config.name).await?;
        if !self.holds(&lease) {
            return Ok(false);
        }
        if let Some(spec) = lease.spec.as_mut() {
            spec.renew_time = Some(MicroTime(Utc::now()));
        }
        self.replace(&lease).await
    }

    async fn try_acquire(&self) -> Result<bool, kube::Error> {
        let now = Utc::now();
        let Some(existing) = self.lease_api.get_opt(&self.config.name).await? else {
            return self.create(now).await;
        };

        let takeover = if self.holds(&existing) {
            false
        } else if is_expired(existing.spec.as_ref(), self.config.lease_duration, now) {
            true
        } else {
            return Ok(false);
        };

        let prev = existing.spec.clone().unwrap_or_default();
        let transitions = prev.lease_transitions.unwrap_or(0);
        let mut updated = existing;
        updated.spec = Some(LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(self.lease_duration_secs()),
            acquire_time: if takeover {
                Some(MicroTime(now))
            } else {
                prev.acquire_time
            },
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(if takeover { transitions + 1 } else { transitions }),
            ..prev
        });
        self.replace(&updated).await
    }

    async fn create(&self, now: DateTime<Utc>) -> Result<bool, kube::Error> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.config.name.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.lease_duration_secs()),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(0),
                ..Default::default()
            }),
        };
        match self.lease_api.create(&PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Optimistic write; a 409 means someone else wrote first.
    async fn replace(&self, lease: &Lease) -> Result<bool, kube::Error> {
        match self
            .lease_api
            .replace(&self.config.name, &PostParams::default(), lease)
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn lease_duration_secs(&self) -> i32 {
        i32::try_from(self.config.lease_duration.as_secs()).unwrap_or(i32::MAX)
    }
}
