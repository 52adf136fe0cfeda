//! Orchestration: identity, slot acquisition, address reconciliation
//!
//! One pass claims a slot and binds its address to this instance. The claimed
//! lock is returned to the caller, who either exits (the session then expires)
//! or holds it until shutdown.

use crate::binder::{AddressBinder, AddressProvider, Ec2Client, Reconciliation};
use crate::common::{Config, Error, Result, SelectorConfig};
use crate::coordination::{ConsulClient, DirectoryEntry, LockCoordinator, LockHandle, SlotSelector};
use crate::identity::{resolve_credentials, IdentityProvider, ImdsClient, InstanceIdentity};
use std::future::Future;
use std::sync::Arc;

/// A slot won and bound to this instance
#[derive(Debug)]
pub struct Claim {
    pub identity: InstanceIdentity,
    pub slot: DirectoryEntry,
    pub reconciliation: Reconciliation,
    pub lock: LockHandle,
}

pub struct EipManager<I, C, P> {
    identity: I,
    coordinator: Arc<C>,
    binder: AddressBinder<P>,
    selector: SelectorConfig,
    seed: Option<u64>,
}

impl<I, C, P> EipManager<I, C, P>
where
    I: IdentityProvider,
    C: LockCoordinator,
    P: AddressProvider,
{
    pub fn new(identity: I, coordinator: Arc<C>, provider: P, selector: &SelectorConfig) -> Self {
        Self {
            identity,
            coordinator,
            binder: AddressBinder::new(provider),
            selector: selector.clone(),
            seed: None,
        }
    }

    /// Fix the slot visiting order
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn binder(&self) -> &AddressBinder<P> {
        &self.binder
    }

    /// Acquire a slot under `prefix` and bind its address to this instance
    pub async fn claim(&self, prefix: &str) -> Result<Claim> {
        let identity = self.identity.identity().await?;
        tracing::info!(
            "Instance {} ({}, {}) competing for {}",
            identity.instance_id,
            identity.private_ip,
            identity.availability_zone,
            prefix
        );

        let mut selector = match self.seed {
            Some(seed) => SlotSelector::seeded(self.coordinator.clone(), &self.selector, seed),
            None => SlotSelector::new(self.coordinator.clone(), &self.selector),
        };
        let slot = selector.acquire_slot(prefix).await?;

        // The lock drops with the error on a fatal binding failure; the
        // session then expires and another instance can take the slot.
        let reconciliation = self
            .binder
            .reconcile(slot.allocation_id(), &identity.instance_id)
            .await?;

        Ok(Claim {
            identity,
            slot: slot.entry,
            reconciliation,
            lock: slot.lock,
        })
    }

    /// Hand the slot back to the fleet
    pub async fn release(&self, claim: Claim) -> Result<()> {
        self.coordinator.release(claim.lock).await
    }

    /// Keep the claim until `shutdown` resolves (then release) or the session is lost (error)
    pub async fn hold<F>(&self, mut claim: Claim, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tracing::info!(
            "Holding {} ({}) until shutdown",
            claim.slot.key,
            claim.slot.allocation_id
        );

        let lost = tokio::select! {
            _ = claim.lock.lost() => true,
            _ = shutdown => false,
        };

        if lost {
            return Err(Error::SessionLost(claim.lock.key().to_string()));
        }

        tracing::info!("Shutting down, releasing {}", claim.slot.key);
        self.release(claim).await
    }
}

/// Production wiring: instance metadata, Consul and EC2
pub async fn run(config: &Config, prefix: &str) -> Result<()> {
    let imds = ImdsClient::new(&config.metadata)?;
    let identity = imds.identity().await?;
    let credentials = resolve_credentials(&imds).await?;

    let consul = ConsulClient::new(&config.consul)?.with_owner(identity.instance_id.clone());
    let ec2 = Ec2Client::new(
        &config.ec2.endpoint_for(&identity.region),
        &identity.region,
        credentials,
    )?;

    let manager = EipManager::new(identity, Arc::new(consul), ec2, &config.selector);
    let claim = manager.claim(prefix).await?;
    tracing::info!(
        "{} bound to {} via {}",
        claim.slot.allocation_id,
        claim.identity.instance_id,
        claim.reconciliation.association_id
    );

    if config.hold_lock {
        manager.hold(claim, shutdown_signal()).await?;
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
