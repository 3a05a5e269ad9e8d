//! Named mutual-exclusion leases shared across processes.
//!
//! [`StorageLock`] coordinates through object storage:
//! - **CAS acquisition**: the lease object is created with `DoesNotExist`
//! - **TTL takeover**: an expired lease may be replaced under `MatchesVersion`
//! - **Bounded waits**: with a non-zero timeout, acquisition polls until the
//!   deadline; a zero timeout makes exactly one attempt
//!
//! Release writes an expired record under CAS instead of deleting, so a holder
//! whose lease already expired can never clobber its successor.
//!
//! ```rust,ignore
//! let lock = StorageLock::new(backend.clone());
//! if let Some(lease) = lock.acquire("catalog_lock_stable", Duration::ZERO).await? {
//!     // ... rebuild ...
//!     lock.release(lease).await?;
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::entity::encode_key;
use crate::error::{Error, Result};
use crate::storage::{StorageBackend, WritePrecondition, WriteResult};

/// Default lease TTL.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(60);

/// Interval between attempts while waiting on a contended lease.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A held lease. Hand it back to [`NamedLock::release`] on every exit path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    name: String,
    holder_id: String,
    version: String,
}

impl Lease {
    /// Creates a lease handle. Intended for [`NamedLock`] implementations.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        holder_id: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            holder_id: holder_id.into(),
            version: version.into(),
        }
    }

    /// The lease name, e.g. `catalog_lock_stable`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identity of the lock instance that acquired this lease.
    #[must_use]
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Storage version the lease was written at.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }
}

/// Named mutex provider.
#[async_trait]
pub trait NamedLock: Send + Sync {
    /// Attempts to acquire the lease `name`.
    ///
    /// A zero `timeout` never waits. Returns `Ok(None)` when the lease is held
    /// elsewhere for the whole wait.
    async fn acquire(&self, name: &str, timeout: Duration) -> Result<Option<Lease>>;

    /// Releases a lease obtained from [`acquire`](Self::acquire).
    async fn release(&self, lease: Lease) -> Result<()>;
}

/// Lease object contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseInfo {
    /// Lock instance holding the lease.
    pub holder_id: String,

    /// Lease name.
    pub name: String,

    /// When the lease expires.
    pub expires_at: DateTime<Utc>,

    /// When the lease was acquired.
    pub acquired_at: DateTime<Utc>,
}

impl LeaseInfo {
    fn new(holder_id: &str, name: &str, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            holder_id: holder_id.to_string(),
            name: name.to_string(),
            expires_at: now
                + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(60)),
            acquired_at: now,
        }
    }

    /// Returns whether this lease has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Lease lock backed by object storage.
#[derive(Clone)]
pub struct StorageLock {
    storage: Arc<dyn StorageBackend>,
    holder_id: String,
    ttl: Duration,
    poll_interval: Duration,
}

impl std::fmt::Debug for StorageLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageLock")
            .field("holder_id", &self.holder_id)
            .field("ttl", &self.ttl)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl StorageLock {
    /// Creates a lock provider with a fresh holder identity.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            holder_id: Ulid::new().to_string(),
            ttl: DEFAULT_LEASE_TTL,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Sets the lease TTL.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sets the polling interval used during bounded waits.
    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Returns this provider's holder identity.
    #[must_use]
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Storage path of the lease object for `name`.
    #[must_use]
    pub fn lease_path(name: &str) -> String {
        format!("locks/{}.lock.json", encode_key(name))
    }

    /// Reads the current lease record for `name`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read or parsed.
    pub async fn read_lease(&self, name: &str) -> Result<Option<LeaseInfo>> {
        match self.storage.get(&Self::lease_path(name)).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data).map_err(|e| {
                Error::Internal {
                    message: format!("parse lease: {e}"),
                }
            })?)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Returns whether `name` is currently held by anyone.
    ///
    /// # Errors
    ///
    /// Returns an error if the lease record cannot be read.
    pub async fn is_locked(&self, name: &str) -> Result<bool> {
        Ok(self
            .read_lease(name)
            .await?
            .is_some_and(|info| !info.is_expired()))
    }

    async fn try_acquire(&self, name: &str) -> std::result::Result<Lease, LockError> {
        let path = Self::lease_path(name);
        let info = LeaseInfo::new(&self.holder_id, name, self.ttl);
        let bytes = lease_bytes(&info).map_err(LockError::Storage)?;

        match self
            .storage
            .put(&path, bytes.clone(), WritePrecondition::DoesNotExist)
            .await
            .map_err(LockError::Storage)?
        {
            WriteResult::Success { version } => {
                return Ok(Lease::new(name, &self.holder_id, version));
            }
            WriteResult::PreconditionFailed { .. } => {}
        }

        // Version first, then contents, so the expiry decision is bound to the
        // version used for the takeover CAS.
        let Some(meta) = self.storage.head(&path).await.map_err(LockError::Storage)? else {
            return Err(LockError::AlreadyHeld);
        };

        match self.read_lease(name).await.map_err(LockError::Storage)? {
            Some(existing) if existing.is_expired() => match self
                .storage
                .put(&path, bytes, WritePrecondition::MatchesVersion(meta.version))
                .await
                .map_err(LockError::Storage)?
            {
                WriteResult::Success { version } => Ok(Lease::new(name, &self.holder_id, version)),
                WriteResult::PreconditionFailed { .. } => Err(LockError::AlreadyHeld),
            },
            _ => Err(LockError::AlreadyHeld),
        }
    }
}

#[async_trait]
impl NamedLock for StorageLock {
    async fn acquire(&self, name: &str, timeout: Duration) -> Result<Option<Lease>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.try_acquire(name).await {
                Ok(lease) => return Ok(Some(lease)),
                Err(LockError::Storage(e)) => return Err(e),
                Err(LockError::AlreadyHeld) => {
                    let now = tokio::time::Instant::now();
                    if now >= deadline {
                        tracing::debug!(lease = name, "lease held elsewhere");
                        return Ok(None);
                    }
                    tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
                }
            }
        }
    }

    async fn release(&self, lease: Lease) -> Result<()> {
        let Some(info) = self.read_lease(lease.name()).await? else {
            return Ok(());
        };
        if info.holder_id != lease.holder_id {
            tracing::warn!(lease = lease.name(), holder = %info.holder_id, "lease taken over before release");
            return Ok(());
        }

        let expired = LeaseInfo {
            expires_at: Utc::now() - chrono::Duration::seconds(1),
            ..info
        };
        match self
            .storage
            .put(
                &Self::lease_path(lease.name()),
                lease_bytes(&expired)?,
                WritePrecondition::MatchesVersion(lease.version.clone()),
            )
            .await?
        {
            WriteResult::Success { .. } => Ok(()),
            WriteResult::PreconditionFailed { .. } => {
                tracing::warn!(lease = lease.name(), "lease modified before release; leaving it");
                Ok(())
            }
        }
    }
}

fn lease_bytes(info: &LeaseInfo) -> Result<Bytes> {
    serde_json::to_vec(info)
        .map(Bytes::from)
        .map_err(|e| Error::Internal {
            message: format!("serialize lease: {e}"),
        })
}

enum LockError {
    AlreadyHeld,
    Storage(Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;

    fn backend() -> Arc<dyn StorageBackend> {
        Arc::new(MemoryBackend::new())
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let lock = StorageLock::new(backend());

        let lease = lock
            .acquire("catalog_lock_stable", Duration::ZERO)
            .await
            .expect("acquire")
            .expect("lease should be free");
        assert_eq!(lease.name(), "catalog_lock_stable");
        assert!(lock.is_locked("catalog_lock_stable").await.unwrap());

        lock.release(lease).await.expect("release");
        assert!(!lock.is_locked("catalog_lock_stable").await.unwrap());
    }

    #[tokio::test]
    async fn test_second_acquire_fails_without_waiting() {
        let storage = backend();
        let lock1 = StorageLock::new(storage.clone());
        let lock2 = StorageLock::new(storage);

        let _lease = lock1
            .acquire("manifest_lock_x", Duration::ZERO)
            .await
            .unwrap()
            .expect("first acquire");

        let second = lock2.acquire("manifest_lock_x", Duration::ZERO).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_same_provider_is_still_exclusive() {
        let lock = StorageLock::new(backend());
        let _lease = lock.acquire("a", Duration::ZERO).await.unwrap().unwrap();
        assert!(lock.acquire("a", Duration::ZERO).await.unwrap().is_none());
        assert!(lock.acquire("b", Duration::ZERO).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_bounded_wait_succeeds_after_release() {
        let storage = backend();
        let holder = StorageLock::new(storage.clone());
        let waiter = StorageLock::new(storage).with_poll_interval(Duration::from_millis(5));

        let lease = holder
            .acquire("pkgsinfo_foo.dmg", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();

        let releaser = tokio::spawn({
            let holder = holder.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                holder.release(lease).await.unwrap();
            }
        });

        let acquired = waiter
            .acquire("pkgsinfo_foo.dmg", Duration::from_secs(2))
            .await
            .unwrap();
        assert!(acquired.is_some());
        releaser.await.unwrap();
    }

    #[tokio::test]
    async fn test_bounded_wait_times_out() {
        let storage = backend();
        let holder = StorageLock::new(storage.clone());
        let waiter = StorageLock::new(storage).with_poll_interval(Duration::from_millis(5));

        let _lease = holder.acquire("x", Duration::ZERO).await.unwrap().unwrap();
        let waited = waiter.acquire("x", Duration::from_millis(30)).await.unwrap();
        assert!(waited.is_none());
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let storage = backend();
        let lock1 = StorageLock::new(storage.clone()).with_ttl(Duration::from_millis(1));
        let lock2 = StorageLock::new(storage);

        let stale = lock1.acquire("x", Duration::ZERO).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let fresh = lock2
            .acquire("x", Duration::ZERO)
            .await
            .unwrap()
            .expect("takeover");
        assert_ne!(stale.holder_id(), fresh.holder_id());

        // The stale holder must not release its successor's lease.
        lock1.release(stale).await.unwrap();
        assert!(lock2.is_locked("x").await.unwrap());
        lock2.release(fresh).await.unwrap();
    }

    #[tokio::test]
    async fn test_release_of_missing_lease_is_ok() {
        let lock = StorageLock::new(backend());
        lock.release(Lease::new("never", lock.holder_id(), "1"))
            .await
            .expect("no-op release");
    }

    #[test]
    fn test_lease_path_encodes_name() {
        assert_eq!(
            StorageLock::lease_path("pkgsinfo_a b.dmg"),
            "locks/pkgsinfo_a%20b.dmg.lock.json"
        );
    }
}
