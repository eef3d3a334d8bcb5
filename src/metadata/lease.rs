//! Lease records for cluster-wide exclusivity
//!
//! A lease is claimed with a compare-and-set inside one transaction. An
//! unexpired lease held by someone else refuses the claim; an expired one is
//! taken over and the takeover is reported so the caller can warn.

use super::entities::Lease;
use super::store::{abort, MetadataStore};
use crate::{Result, ShardVaultError};

/// Name of the garbage collection lease
pub const GC_LEASE: &str = "gc.delete-fragments";

/// Name of the registration lease (at most one server `Starting`)
pub const REGISTRATION_LEASE: &str = "cluster.registration";

/// Name of the maintenance job lease
pub const MAINTENANCE_LEASE: &str = "health.maintenance";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome {
    Acquired(Lease),

    /// The previous holder's lease had expired
    TookOverStale { lease: Lease, previous: Lease },
}

impl LeaseOutcome {
    pub fn lease(&self) -> &Lease {
        match self {
            LeaseOutcome::Acquired(lease) => lease,
            LeaseOutcome::TookOverStale { lease, .. } => lease,
        }
    }

    /// Warning describing a stale takeover, if one happened
    pub fn stale_warning(&self) -> Option<ShardVaultError> {
        match self {
            LeaseOutcome::Acquired(_) => None,
            LeaseOutcome::TookOverStale { previous, .. } => Some(ShardVaultError::StaleJob {
                job: previous.name.clone(),
                holder: previous.owner.clone(),
                since: previous.acquired_at,
            }),
        }
    }
}

impl MetadataStore {
    /// Claim `name` for `owner` until `now + ttl_secs`.
    ///
    /// Re-claiming a lease the caller already owns refreshes it. A live
    /// lease owned by someone else fails with `JobAlreadyRunning`.
    pub fn acquire_lease(&self, name: &str, owner: &str, ttl_secs: i64, now: i64) -> Result<LeaseOutcome> {
        let outcome = self.transaction(|txn| {
            let lease = Lease {
                name: name.to_string(),
                owner: owner.to_string(),
                acquired_at: now,
                expires_at: now + ttl_secs,
            };

            let existing: Option<Lease> = txn.get(&Lease::key_for(name))?;
            let outcome = match existing {
                Some(held) if held.owner != owner && !held.is_expired(now) => {
                    return abort(ShardVaultError::JobAlreadyRunning {
                        job: name.to_string(),
                        holder: held.owner,
                        since: held.acquired_at,
                    });
                }
                Some(held) if held.owner != owner => LeaseOutcome::TookOverStale {
                    lease: lease.clone(),
                    previous: held,
                },
                _ => LeaseOutcome::Acquired(lease.clone()),
            };

            txn.put(&lease)?;
            Ok(outcome)
        })?;

        if let LeaseOutcome::TookOverStale { previous, .. } = &outcome {
            tracing::warn!(
                "Lease {} held by {} since {} is stale; {} takes over",
                name,
                previous.owner,
                previous.acquired_at,
                owner
            );
        }

        Ok(outcome)
    }

    /// Release `name` if `owner` still holds it; returns whether it was released
    pub fn release_lease(&self, name: &str, owner: &str) -> Result<bool> {
        self.transaction(|txn| {
            let key = Lease::key_for(name);
            match txn.get::<Lease>(&key)? {
                Some(held) if held.owner == owner => txn.delete(&key),
                _ => Ok(false),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn test_lease_exclusivity() {
        let store = MetadataStore::temporary().unwrap();

        let first = store.acquire_lease(GC_LEASE, "s1", 60, 1_000).unwrap();
        assert!(matches!(first, LeaseOutcome::Acquired(_)));

        let err = store.acquire_lease(GC_LEASE, "s2", 60, 1_030).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::JobAlreadyRunning);

        // the holder may refresh its own lease
        let again = store.acquire_lease(GC_LEASE, "s1", 60, 1_030).unwrap();
        assert_eq!(again.lease().expires_at, 1_090);
    }

    #[test]
    fn test_stale_lease_is_taken_over() {
        let store = MetadataStore::temporary().unwrap();
        store.acquire_lease(GC_LEASE, "s1", 60, 1_000).unwrap();

        let outcome = store.acquire_lease(GC_LEASE, "s2", 60, 1_100).unwrap();
        match &outcome {
            LeaseOutcome::TookOverStale { previous, lease } => {
                assert_eq!(previous.owner, "s1");
                assert_eq!(lease.owner, "s2");
            }
            other => panic!("expected takeover, got {:?}", other),
        }
        assert_eq!(
            outcome.stale_warning().map(|e| e.kind()),
            Some(ErrorKind::StaleJobWarning)
        );
    }

    #[test]
    fn test_release_only_by_owner() {
        let store = MetadataStore::temporary().unwrap();
        store.acquire_lease(GC_LEASE, "s1", 60, 1_000).unwrap();

        assert!(!store.release_lease(GC_LEASE, "s2").unwrap());
        assert!(store.release_lease(GC_LEASE, "s1").unwrap());
        assert!(store.lease(GC_LEASE).unwrap().is_none());
        assert!(matches!(
            store.acquire_lease(GC_LEASE, "s2", 60, 1_001).unwrap(),
            LeaseOutcome::Acquired(_)
        ));
    }
}
