//! Slot coordination over a shared lock service
//!
//! The Address Directory maps slot keys (`<prefix><name>`) to EIP allocation
//! IDs. Each slot has a lock entry at `lock/<slot key>`; holding that lock is
//! what entitles an instance to touch the slot's address.
//!
//! - `LockCoordinator`: the lock service seam (Consul in production)
//! - `SlotSelector`: randomized acquisition of one free slot
//! - `LockHandle`: the held lock, released explicitly or by session expiry

pub mod consul;
pub mod selector;
pub mod session;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub use consul::ConsulClient;
pub use selector::{SlotClaim, SlotSelector};

/// Namespace for lock-status entries
pub const LOCK_PREFIX: &str = "lock/";

/// Lock-status key for a slot key
pub fn lock_key(slot_key: &str) -> String {
    format!("{}{}", LOCK_PREFIX, slot_key)
}

/// One slot of the Address Directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub key: String,
    pub allocation_id: String,
}

impl DirectoryEntry {
    pub fn new(key: impl Into<String>, allocation_id: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            allocation_id: allocation_id.into(),
        }
    }
}

/// Observed state of a lock-status entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStatus {
    Free,
    Held { session: String },
}

impl LockStatus {
    pub fn is_held(&self) -> bool {
        matches!(self, LockStatus::Held { .. })
    }
}

/// Result of a single acquire attempt
#[derive(Debug)]
pub enum AcquireOutcome {
    Acquired(LockHandle),
    /// Another live session holds the key
    Contended,
}

/// Exclusive, session-bound ownership of one lock key.
///
/// Dropping the handle stops session renewal without releasing the key, so the
/// lock service expires the session on its own. Call
/// [`LockCoordinator::release`] for an orderly handover.
#[derive(Debug)]
pub struct LockHandle {
    key: String,
    session: String,
    lost: watch::Receiver<bool>,
    signal: Option<watch::Sender<bool>>,
    renewer: Option<JoinHandle<()>>,
}

impl LockHandle {
    /// Handle whose session is kept alive by the lock service itself
    pub fn new(key: impl Into<String>, session: impl Into<String>) -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            key: key.into(),
            session: session.into(),
            lost: rx,
            signal: Some(tx),
            renewer: None,
        }
    }

    /// Handle plus the sender used to report session loss
    pub fn with_loss_signal(
        key: impl Into<String>,
        session: impl Into<String>,
    ) -> (Self, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let handle = Self {
            key: key.into(),
            session: session.into(),
            lost: rx,
            signal: None,
            renewer: None,
        };
        (handle, tx)
    }

    pub(crate) fn with_renewer(mut self, renewer: JoinHandle<()>) -> Self {
        self.renewer = Some(renewer);
        self
    }

    /// Lock-status key this handle owns
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn is_lost(&self) -> bool {
        *self.lost.borrow()
    }

    /// Resolves once the session is gone (invalidated, expired, or nobody left to renew it)
    pub async fn lost(&mut self) {
        let _ = self.lost.wait_for(|lost| *lost).await;
    }

    pub(crate) fn stop_renewal(&mut self) {
        if let Some(renewer) = self.renewer.take() {
            renewer.abort();
        }
        self.signal.take();
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.stop_renewal();
    }
}

/// Lock service primitives used by slot selection
#[async_trait]
pub trait LockCoordinator: Send + Sync {
    /// Slots under `prefix`, ordered by key
    async fn list_keys(&self, prefix: &str) -> crate::Result<Vec<DirectoryEntry>>;

    async fn lock_status(&self, key: &str) -> crate::Result<LockStatus>;

    /// Single non-blocking acquire attempt on `key`
    async fn acquire_lock(&self, key: &str) -> crate::Result<AcquireOutcome>;

    async fn release(&self, handle: LockHandle) -> crate::Result<()>;
}
