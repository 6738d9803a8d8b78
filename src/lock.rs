//! Advisory mutual exclusion over a single blob-store key.
//!
//! The medium offers only get/put/delete — no compare-and-swap — so the
//! protocol is optimistic: write the lock record, then re-read to see who
//! actually won. Short validity windows bound the damage a crashed holder
//! can do. This is a best-effort lock, not a linearizable one; the race
//! window between write and re-read is real and the claim path is designed
//! to survive the rare double-grant (idempotent keys, blacklists).

use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::time::sleep;
use uuid::Uuid;

use crate::error::{RaisinError, Result};
use crate::model::{lock_key, LockRecord};
use crate::store::BlobStore;

const INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Default validity window for a held lock.
pub const DEFAULT_LOCK_VALIDITY: Duration = Duration::from_secs(60);

/// Proof of acquisition. Release deletes the record only while the store
/// still names this owner, so a lock reclaimed after expiry is never
/// clobbered by its previous holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockToken {
    owner_id: Uuid,
}

/// A named advisory lock inside one blob store.
#[derive(Debug, Clone)]
pub struct DistributedLock {
    name: String,
    validity: Duration,
}

impl DistributedLock {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            validity: DEFAULT_LOCK_VALIDITY,
        }
    }

    pub fn with_validity(mut self, validity: Duration) -> Self {
        self.validity = validity;
        self
    }

    fn key(&self) -> String {
        lock_key(&self.name)
    }

    /// Acquire the lock, spinning with exponential backoff and jitter until
    /// it is ours or `deadline` elapses (`None` waits indefinitely).
    pub async fn acquire(
        &self,
        store: &dyn BlobStore,
        deadline: Option<Duration>,
    ) -> Result<LockToken> {
        let owner_id = Uuid::new_v4();
        let key = self.key();
        let started = tokio::time::Instant::now();
        let mut backoff = INITIAL_BACKOFF;

        loop {
            match self.read(store).await? {
                None => {
                    // Unheld: write our claim, then loop to re-read. The
                    // re-read is what resolves races between simultaneous
                    // writers.
                    let record = LockRecord {
                        expires_at: Utc::now()
                            + chrono::Duration::from_std(self.validity)
                                .unwrap_or_else(|_| chrono::Duration::seconds(60)),
                        owner_id,
                    };
                    store.put(&key, &serde_json::to_vec(&record)?).await?;
                    continue;
                }
                Some(record) if record.owner_id == owner_id => {
                    return Ok(LockToken { owner_id });
                }
                Some(record) if Utc::now() > record.expires_at => {
                    // The holder went quiet past its validity window;
                    // reclaim and retry.
                    tracing::debug!(lock = %self.name, stale_owner = %record.owner_id, "Reclaiming expired lock");
                    store.delete(&key).await?;
                    continue;
                }
                Some(_) => {
                    if let Some(limit) = deadline {
                        if started.elapsed() >= limit {
                            return Err(RaisinError::DeadlineExceeded);
                        }
                    }
                    let jitter = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 2);
                    sleep(backoff + Duration::from_millis(jitter)).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    /// Release the lock if we still hold it. Releasing a lock someone else
    /// reclaimed after expiry is a no-op.
    pub async fn release(&self, store: &dyn BlobStore, token: LockToken) -> Result<()> {
        if let Some(record) = self.read(store).await? {
            if record.owner_id == token.owner_id {
                store.delete(&self.key()).await?;
            }
        }
        Ok(())
    }

    async fn read(&self, store: &dyn BlobStore) -> Result<Option<LockRecord>> {
        let Some(bytes) = store.get(&self.key()).await? else {
            return Ok(None);
        };
        // A garbled lock record is indistinguishable from a stale one:
        // drop it and let the acquire loop start clean.
        match serde_json::from_slice(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(_) => {
                store.delete(&self.key()).await?;
                Ok(None)
            }
        }
    }
}
