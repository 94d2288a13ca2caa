//! Leader election on a `coordination.k8s.io/v1` Lease.
//!
//! Only the holder of the Lease mutates cluster state. Leadership that
//! cannot be renewed within the lease duration is reported as lost and the
//! caller is expected to exit.

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use kube::Client;
use kube::api::{Api, PostParams};
use kube::core::ObjectMeta;
use tracing::{debug, info, warn};

use crds::time::{from_utc, to_utc};

use crate::error::ClusterError;

/// Lease duration
pub const LEASE_DURATION: Duration = Duration::from_secs(15);

/// Renewal period
pub const RENEW_INTERVAL: Duration = Duration::from_secs(5);

/// Whether `identity` may take or keep the lease.
fn may_hold(
    holder: Option<&str>,
    identity: &str,
    renew_time: Option<DateTime<Utc>>,
    duration: Duration,
    now: DateTime<Utc>,
) -> bool {
    match holder {
        None | Some("") => true,
        Some(h) if h == identity => true,
        Some(_) => renew_time.is_none_or(|renewed| {
            let duration = chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX);
            renewed + duration < now
        }),
    }
}

/// `current` rewritten so that `identity` holds it as of `now`. A change of
/// holder resets the acquire time and counts a transition.
fn claimed(current: Option<LeaseSpec>, identity: &str, duration_secs: i32, now: DateTime<Utc>) -> LeaseSpec {
    let mut spec = current.unwrap_or_default();
    if spec.holder_identity.as_deref() != Some(identity) {
        spec.acquire_time = from_utc(now);
        spec.lease_transitions = Some(spec.lease_transitions.map_or(0, |n| n + 1));
    }
    spec.holder_identity = Some(identity.to_owned());
    spec.lease_duration_seconds = Some(duration_secs);
    spec.renew_time = from_utc(now);
    spec
}

/// Acquires and renews a named Lease.
pub struct LeaderElector {
    api: Api<Lease>,
    name: String,
    identity: String,
    lease_duration: Duration,
    renew_interval: Duration,
}

impl std::fmt::Debug for LeaderElector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderElector")
            .field("name", &self.name)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl LeaderElector {
    /// Elector for Lease `namespace/name` competing as `identity`.
    pub fn new(client: Client, namespace: &str, name: &str, identity: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.to_string(),
            identity: identity.to_string(),
            lease_duration: LEASE_DURATION,
            renew_interval: RENEW_INTERVAL,
        }
    }

    /// Blocks until the lease is held.
    pub async fn acquire(&self) -> Result<(), ClusterError> {
        info!(lease = %self.name, identity = %self.identity, "Waiting for leadership");
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(lease = %self.name, identity = %self.identity, "Acquired leadership");
                    return Ok(());
                }
                Ok(false) => debug!(lease = %self.name, "Lease held by another instance"),
                Err(e) => warn!(lease = %self.name, error = %e, "Failed to acquire lease"),
            }
            tokio::time::sleep(self.renew_interval).await;
        }
    }

    /// Renews the lease until it is lost, then returns why.
    pub async fn hold(&self) -> ClusterError {
        let mut last_renewed = Utc::now();
        loop {
            tokio::time::sleep(self.renew_interval).await;
            match self.try_acquire_or_renew().await {
                Ok(true) => last_renewed = Utc::now(),
                Ok(false) => {
                    return ClusterError::LeaderElection(format!(
                        "lease {} taken over by another instance",
                        self.name
                    ));
                }
                Err(e) => {
                    let since = (Utc::now() - last_renewed).to_std().unwrap_or_default();
                    if since >= self.lease_duration {
                        return ClusterError::LeaderElection(format!(
                            "failed to renew lease {} for {since:?}: {e}",
                            self.name
                        ));
                    }
                    warn!(lease = %self.name, error = %e, "Failed to renew lease, retrying");
                }
            }
        }
    }

    /// One acquire/renew attempt. `Ok(false)` means someone else holds it.
    pub async fn try_acquire_or_renew(&self) -> Result<bool, ClusterError> {
        let now = Utc::now();
        let duration_secs = i32::try_from(self.lease_duration.as_secs()).unwrap_or(i32::MAX);

        let Some(mut lease) = self.api.get_opt(&self.name).await? else {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(self.name.clone()),
                    ..Default::default()
                },
                spec: Some(claimed(None, &self.identity, duration_secs, now)),
            };
            return match self.api.create(&PostParams::default(), &lease).await {
                Ok(_) => Ok(true),
                Err(e) => match ClusterError::from_kube(e, format!("lease {}", self.name)) {
                    ClusterError::Conflict(_) => Ok(false),
                    other => Err(other),
                },
            };
        };

        let spec = lease.spec.take();
        let holder = spec.as_ref().and_then(|s| s.holder_identity.as_deref());
        let renew_time = spec.as_ref().and_then(|s| s.renew_time.as_ref()).and_then(to_utc);
        if !may_hold(holder, &self.identity, renew_time, self.lease_duration, now) {
            return Ok(false);
        }

        // The fetched resourceVersion rides along, so a concurrent writer wins.
        lease.spec = Some(claimed(spec, &self.identity, duration_secs, now));
        match self.api.replace(&self.name, &PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            Err(e) => match ClusterError::from_kube(e, format!("lease {}", self.name)) {
                ClusterError::Conflict(_) => Ok(false),
                other => Err(other),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_may_hold() {
        let now = Utc::now();
        let fresh = Some(now - chrono::Duration::seconds(3));
        let stale = Some(now - chrono::Duration::seconds(30));

        assert!(may_hold(None, "a", None, LEASE_DURATION, now));
        assert!(may_hold(Some(""), "a", fresh, LEASE_DURATION, now));
        assert!(may_hold(Some("a"), "a", fresh, LEASE_DURATION, now));
        assert!(!may_hold(Some("b"), "a", fresh, LEASE_DURATION, now));
        assert!(may_hold(Some("b"), "a", stale, LEASE_DURATION, now));
        assert!(may_hold(Some("b"), "a", None, LEASE_DURATION, now));
    }

    #[test]
    fn test_claimed_new_lease() {
        let now = Utc::now();
        let spec = claimed(None, "a", 15, now);

        assert_eq!(spec.holder_identity.as_deref(), Some("a"));
        assert_eq!(spec.lease_duration_seconds, Some(15));
        assert_eq!(spec.lease_transitions, Some(0));
        assert_eq!(spec.acquire_time.as_ref().and_then(to_utc).map(|t| t.timestamp()), Some(now.timestamp()));
        assert_eq!(spec.renew_time.as_ref().and_then(to_utc).map(|t| t.timestamp()), Some(now.timestamp()));
    }

    #[test]
    fn test_claimed_renewal_and_takeover() {
        let acquired = Utc::now() - chrono::Duration::seconds(60);
        let now = Utc::now();
        let held = claimed(None, "a", 15, acquired);

        let renewed = claimed(Some(held.clone()), "a", 15, now);
        assert_eq!(renewed.lease_transitions, Some(0));
        assert_eq!(renewed.acquire_time, held.acquire_time);
        assert_eq!(renewed.renew_time.as_ref().and_then(to_utc).map(|t| t.timestamp()), Some(now.timestamp()));

        let taken = claimed(Some(held), "b", 15, now);
        assert_eq!(taken.holder_identity.as_deref(), Some("b"));
        assert_eq!(taken.lease_transitions, Some(1));
        assert_eq!(taken.acquire_time.as_ref().and_then(to_utc).map(|t| t.timestamp()), Some(now.timestamp()));
    }
}
