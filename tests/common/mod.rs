//! In-memory stand-ins for Consul and EC2 shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use eip_manager::binder::{AddressProvider, AddressRecord};
use eip_manager::coordination::{
    AcquireOutcome, DirectoryEntry, LockCoordinator, LockHandle, LockStatus, LOCK_PREFIX,
};
use eip_manager::identity::InstanceIdentity;
use eip_manager::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

pub fn identity(instance_id: &str) -> InstanceIdentity {
    InstanceIdentity {
        private_ip: "10.0.0.10".into(),
        availability_zone: "us-east-1a".into(),
        instance_id: instance_id.into(),
        region: "us-east-1".into(),
    }
}

struct HeldLock {
    session: String,
    owner: String,
}

#[derive(Default)]
struct LockState {
    kv: BTreeMap<String, String>,
    locks: HashMap<String, HeldLock>,
    sessions: HashMap<String, watch::Sender<bool>>,
    next_session: u64,
    /// (lock key, thief): after the next status read of the key, `thief` grabs it
    steal_after_status: Option<(String, String)>,
    acquire_attempts: Vec<(String, String)>,
}

impl LockState {
    fn new_session(&mut self) -> String {
        self.next_session += 1;
        format!("session-{}", self.next_session)
    }
}

/// Lock service with Consul's semantics; clones share state, each with its own owner
#[derive(Clone, Default)]
pub struct MemoryLockService {
    state: Arc<Mutex<LockState>>,
    owner: String,
}

impl MemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Client view for another instance
    pub fn for_owner(&self, owner: &str) -> Self {
        Self {
            state: self.state.clone(),
            owner: owner.to_string(),
        }
    }

    pub fn put(&self, key: &str, value: &str) {
        self.state
            .lock()
            .unwrap()
            .kv
            .insert(key.to_string(), value.to_string());
    }

    /// Owner currently holding `lock_key`
    pub fn holder(&self, lock_key: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .locks
            .get(lock_key)
            .map(|l| l.owner.clone())
    }

    pub fn held_count(&self) -> usize {
        self.state.lock().unwrap().locks.len()
    }

    pub fn live_sessions(&self) -> usize {
        self.state.lock().unwrap().sessions.len()
    }

    /// Lock `lock_key` on behalf of `owner` outside of any handle
    pub fn hold_externally(&self, lock_key: &str, owner: &str) {
        let mut state = self.state.lock().unwrap();
        let session = state.new_session();
        state.locks.insert(
            lock_key.to_string(),
            HeldLock {
                session,
                owner: owner.to_string(),
            },
        );
    }

    /// Invalidate every session of `owner`, as Consul does when its TTL lapses
    pub fn expire_owner(&self, owner: &str) {
        let mut state = self.state.lock().unwrap();
        let expired: Vec<(String, String)> = state
            .locks
            .iter()
            .filter(|(_, l)| l.owner == owner)
            .map(|(k, l)| (k.clone(), l.session.clone()))
            .collect();
        for (key, session) in expired {
            state.locks.remove(&key);
            if let Some(signal) = state.sessions.remove(&session) {
                let _ = signal.send(true);
            }
        }
    }

    /// Let `thief` take `lock_key` right after the next status read reports it free
    pub fn steal_after_status(&self, lock_key: &str, thief: &str) {
        self.state.lock().unwrap().steal_after_status =
            Some((lock_key.to_string(), thief.to_string()));
    }

    /// (owner, lock key) of every acquire call
    pub fn acquire_attempts(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().acquire_attempts.clone()
    }
}

#[async_trait]
impl LockCoordinator for MemoryLockService {
    async fn list_keys(&self, prefix: &str) -> Result<Vec<DirectoryEntry>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .kv
            .iter()
            .filter(|(k, _)| k.starts_with(prefix) && !k.starts_with(LOCK_PREFIX))
            .map(|(k, v)| DirectoryEntry::new(k.clone(), v.clone()))
            .collect())
    }

    async fn lock_status(&self, key: &str) -> Result<LockStatus> {
        let status = {
            let mut state = self.state.lock().unwrap();
            let status = match state.locks.get(key) {
                Some(lock) => LockStatus::Held {
                    session: lock.session.clone(),
                },
                None => LockStatus::Free,
            };

            let steal = matches!(&state.steal_after_status, Some((k, _)) if k == key);
            if steal && !status.is_held() {
                if let Some((_, thief)) = state.steal_after_status.take() {
                    let session = state.new_session();
                    state.locks.insert(
                        key.to_string(),
                        HeldLock {
                            session,
                            owner: thief,
                        },
                    );
                }
            }
            status
        };

        // Let other instances run between this read and the acquire that follows.
        tokio::task::yield_now().await;
        Ok(status)
    }

    async fn acquire_lock(&self, key: &str) -> Result<AcquireOutcome> {
        let mut state = self.state.lock().unwrap();
        state
            .acquire_attempts
            .push((self.owner.clone(), key.to_string()));
        if state.locks.contains_key(key) {
            return Ok(AcquireOutcome::Contended);
        }

        let session = state.new_session();
        state.locks.insert(
            key.to_string(),
            HeldLock {
                session: session.clone(),
                owner: self.owner.clone(),
            },
        );
        let (handle, signal) = LockHandle::with_loss_signal(key, session.clone());
        state.sessions.insert(session, signal);
        Ok(AcquireOutcome::Acquired(handle))
    }

    async fn release(&self, handle: LockHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let owned = matches!(state.locks.get(handle.key()), Some(l) if l.session == handle.session());
        if owned {
            state.locks.remove(handle.key());
        }
        state.sessions.remove(handle.session());
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Address {
    public_ip: String,
    instance_id: Option<String>,
    association_id: Option<String>,
}

#[derive(Default)]
struct CloudState {
    addresses: HashMap<String, Address>,
    next_association: u64,
    fail_disassociate: bool,
    calls: Vec<String>,
}

/// EC2 address bookkeeping with AllowReassociation semantics
#[derive(Clone, Default)]
pub struct MemoryCloud {
    state: Arc<Mutex<CloudState>>,
}

impl MemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_address(&self, allocation_id: &str, public_ip: &str) {
        self.state.lock().unwrap().addresses.insert(
            allocation_id.to_string(),
            Address {
                public_ip: public_ip.to_string(),
                instance_id: None,
                association_id: None,
            },
        );
    }

    /// Bind directly, bypassing the API call log
    pub fn bind(&self, allocation_id: &str, instance_id: &str) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_association += 1;
        let association_id = format!("eipassoc-{}", state.next_association);
        if let Some(address) = state.addresses.get_mut(allocation_id) {
            address.instance_id = Some(instance_id.to_string());
            address.association_id = Some(association_id.clone());
        }
        association_id
    }

    pub fn bound_instance(&self, allocation_id: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .addresses
            .get(allocation_id)
            .and_then(|a| a.instance_id.clone())
    }

    /// Instances bound to any address, one entry per address
    pub fn bound_instances(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut bound: Vec<String> = state
            .addresses
            .values()
            .filter_map(|a| a.instance_id.clone())
            .collect();
        bound.sort();
        bound
    }

    pub fn fail_disassociate(&self) {
        self.state.lock().unwrap().fail_disassociate = true;
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }
}

#[async_trait]
impl AddressProvider for MemoryCloud {
    async fn describe_address(&self, allocation_id: &str) -> Result<AddressRecord> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("describe {}", allocation_id));
        let address = state
            .addresses
            .get(allocation_id)
            .ok_or_else(|| Error::AddressNotFound(allocation_id.to_string()))?;
        Ok(AddressRecord {
            allocation_id: allocation_id.to_string(),
            public_ip: Some(address.public_ip.clone()),
            instance_id: address.instance_id.clone(),
            association_id: address.association_id.clone(),
        })
    }

    async fn associate_address(&self, allocation_id: &str, instance_id: &str) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state
            .calls
            .push(format!("associate {} {}", allocation_id, instance_id));
        state.next_association += 1;
        let association_id = format!("eipassoc-{}", state.next_association);
        let address = state
            .addresses
            .get_mut(allocation_id)
            .ok_or_else(|| Error::AddressNotFound(allocation_id.to_string()))?;
        address.instance_id = Some(instance_id.to_string());
        address.association_id = Some(association_id.clone());
        Ok(association_id)
    }

    async fn disassociate_address(&self, association_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("disassociate {}", association_id));
        if state.fail_disassociate {
            return Err(Error::Ec2 {
                action: "DisassociateAddress".into(),
                code: "RequestLimitExceeded".into(),
                message: "Request limit exceeded.".into(),
            });
        }
        let address = state
            .addresses
            .values_mut()
            .find(|a| a.association_id.as_deref() == Some(association_id))
            .ok_or_else(|| Error::Ec2 {
                action: "DisassociateAddress".into(),
                code: "InvalidAssociationID.NotFound".into(),
                message: format!("The association ID '{}' does not exist", association_id),
            })?;
        address.instance_id = None;
        address.association_id = None;
        Ok(())
    }
}
