//! Slot selection
//!
//! Lists the directory, visits slots in a uniformly random order, and takes the
//! first one whose lock can be acquired. The status pre-check only avoids
//! pointless acquire calls; exclusion comes from the atomic acquire itself.

use crate::common::{validate_prefix, Result, SelectorConfig};
use crate::coordination::{lock_key, AcquireOutcome, DirectoryEntry, LockCoordinator, LockHandle};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;

/// A won slot: the directory entry plus the lock that guards it
#[derive(Debug)]
pub struct SlotClaim {
    pub entry: DirectoryEntry,
    pub lock: LockHandle,
}

impl SlotClaim {
    pub fn allocation_id(&self) -> &str {
        &self.entry.allocation_id
    }
}

pub struct SlotSelector<C, R = StdRng> {
    coordinator: Arc<C>,
    rng: R,
    empty_backoff: Duration,
    contended_backoff: Duration,
}

impl<C: LockCoordinator> SlotSelector<C, StdRng> {
    pub fn new(coordinator: Arc<C>, config: &SelectorConfig) -> Self {
        Self::with_rng(coordinator, config, StdRng::from_entropy())
    }

    /// Reproducible visiting order
    pub fn seeded(coordinator: Arc<C>, config: &SelectorConfig, seed: u64) -> Self {
        Self::with_rng(coordinator, config, StdRng::seed_from_u64(seed))
    }
}

impl<C: LockCoordinator, R: Rng + Send> SlotSelector<C, R> {
    pub fn with_rng(coordinator: Arc<C>, config: &SelectorConfig, rng: R) -> Self {
        Self {
            coordinator,
            rng,
            empty_backoff: config.empty_backoff,
            contended_backoff: config.contended_backoff,
        }
    }

    /// Random permutation of `entries` (Fisher-Yates)
    pub fn visiting_order<'e>(&mut self, entries: &'e [DirectoryEntry]) -> Vec<&'e DirectoryEntry> {
        let mut order: Vec<&DirectoryEntry> = entries.iter().collect();
        order.shuffle(&mut self.rng);
        order
    }

    /// Acquire one slot under `prefix`, retrying until one is won.
    ///
    /// Returns only on success or on a fatal coordination error.
    pub async fn acquire_slot(&mut self, prefix: &str) -> Result<SlotClaim> {
        validate_prefix(prefix)?;

        loop {
            let entries = self.coordinator.list_keys(prefix).await?;
            if entries.is_empty() {
                tracing::info!(
                    "No slots under {} yet, retrying in {:?}",
                    prefix,
                    self.empty_backoff
                );
                tokio::time::sleep(self.empty_backoff).await;
                continue;
            }

            if let Some(claim) = self.try_round(&entries).await? {
                return Ok(claim);
            }

            tracing::info!(
                "All {} slots under {} are taken, retrying in {:?}",
                entries.len(),
                prefix,
                self.contended_backoff
            );
            tokio::time::sleep(self.contended_backoff).await;
        }
    }

    /// One pass over `entries`; `None` when every slot was contended
    pub async fn try_round(&mut self, entries: &[DirectoryEntry]) -> Result<Option<SlotClaim>> {
        let order = self.visiting_order(entries);

        for entry in order {
            let key = lock_key(&entry.key);

            let status = self.coordinator.lock_status(&key).await?;
            if status.is_held() {
                tracing::debug!("Slot {} is locked, skipping", entry.key);
                continue;
            }

            match self.coordinator.acquire_lock(&key).await? {
                AcquireOutcome::Acquired(lock) => {
                    tracing::info!("Acquired lock on key {}", entry.key);
                    return Ok(Some(SlotClaim {
                        entry: entry.clone(),
                        lock,
                    }));
                }
                AcquireOutcome::Contended => {
                    tracing::debug!("Lost the race for slot {}", entry.key);
                }
            }
        }

        Ok(None)
    }
}
