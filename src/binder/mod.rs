//! Address binding reconciliation
//!
//! The cloud provider is the only authority on who an address is bound to, so
//! every pass re-queries it. Takeover policy: if the address is associated to
//! anyone, try to disassociate it (best effort), then associate it to this
//! instance with reassociation allowed. Re-running the pass is harmless.

pub mod ec2;
pub mod sigv4;

use crate::common::{Error, Result};
use async_trait::async_trait;

pub use ec2::Ec2Client;

/// Provider view of one reservable address
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressRecord {
    pub allocation_id: String,
    pub public_ip: Option<String>,
    pub instance_id: Option<String>,
    pub association_id: Option<String>,
}

impl AddressRecord {
    /// Present only when the provider reports a non-empty association ID
    pub fn association(&self) -> Option<&str> {
        self.association_id.as_deref().filter(|id| !id.is_empty())
    }
}

/// Cloud address-binding API
#[async_trait]
pub trait AddressProvider: Send + Sync {
    /// Fails with [`Error::AddressNotFound`] when the allocation does not exist
    async fn describe_address(&self, allocation_id: &str) -> Result<AddressRecord>;

    /// Bind with reassociation allowed; returns the new association ID
    async fn associate_address(&self, allocation_id: &str, instance_id: &str) -> Result<String>;

    async fn disassociate_address(&self, association_id: &str) -> Result<()>;
}

/// Binding state observed by a query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingState {
    Unbound,
    BoundToSelf { association_id: String },
    BoundElsewhere {
        association_id: String,
        instance_id: Option<String>,
    },
}

impl BindingState {
    pub fn classify(record: &AddressRecord, instance_id: &str) -> Self {
        match record.association() {
            None => BindingState::Unbound,
            Some(association_id) if record.instance_id.as_deref() == Some(instance_id) => {
                BindingState::BoundToSelf {
                    association_id: association_id.to_string(),
                }
            }
            Some(association_id) => BindingState::BoundElsewhere {
                association_id: association_id.to_string(),
                instance_id: record.instance_id.clone(),
            },
        }
    }

    pub fn association_id(&self) -> Option<&str> {
        match self {
            BindingState::BoundToSelf { association_id }
            | BindingState::BoundElsewhere { association_id, .. } => Some(association_id),
            BindingState::Unbound => None,
        }
    }

    pub fn is_associated(&self) -> bool {
        self.association_id().is_some()
    }
}

impl std::fmt::Display for BindingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BindingState::Unbound => write!(f, "unbound"),
            BindingState::BoundToSelf { .. } => write!(f, "bound to self"),
            BindingState::BoundElsewhere {
                instance_id: Some(id),
                ..
            } => write!(f, "bound to {}", id),
            BindingState::BoundElsewhere { .. } => write!(f, "bound elsewhere"),
        }
    }
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// State observed before any corrective call
    pub observed: BindingState,
    pub disassociated: bool,
    pub association_id: String,
}

pub struct AddressBinder<P> {
    provider: P,
}

impl<P: AddressProvider> AddressBinder<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    /// Query the provider and classify the binding relative to `instance_id`
    pub async fn query(&self, allocation_id: &str, instance_id: &str) -> Result<BindingState> {
        let record = self.provider.describe_address(allocation_id).await?;
        Ok(BindingState::classify(&record, instance_id))
    }

    /// Whether the address has any live association
    pub async fn is_associated(&self, allocation_id: &str) -> Result<bool> {
        let record = self.provider.describe_address(allocation_id).await?;
        Ok(record.association().is_some())
    }

    /// Remove the association recorded in `state`. Errors are recoverable.
    pub async fn disassociate(&self, state: &BindingState) -> Result<bool> {
        let Some(association_id) = state.association_id() else {
            return Ok(false);
        };

        self.provider
            .disassociate_address(association_id)
            .await
            .map_err(|e| Error::Disassociate {
                association_id: association_id.to_string(),
                reason: e.to_string(),
            })?;
        tracing::info!("Disassociated {}", association_id);
        Ok(true)
    }

    pub async fn associate(&self, allocation_id: &str, instance_id: &str) -> Result<String> {
        let association_id = self
            .provider
            .associate_address(allocation_id, instance_id)
            .await?;
        tracing::info!(
            "Associated {} with {} ({})",
            allocation_id,
            instance_id,
            association_id
        );
        Ok(association_id)
    }

    /// Query, best-effort disassociate, then associate to `instance_id`
    pub async fn reconcile(&self, allocation_id: &str, instance_id: &str) -> Result<Reconciliation> {
        let observed = self.query(allocation_id, instance_id).await?;
        tracing::info!("{} is {}", allocation_id, observed);

        let disassociated = match self.disassociate(&observed).await {
            Ok(done) => done,
            Err(e) if !e.is_fatal() => {
                tracing::warn!("{}; associating with reassociation anyway", e);
                false
            }
            Err(e) => return Err(e),
        };

        let association_id = self.associate(allocation_id, instance_id).await?;
        Ok(Reconciliation {
            observed,
            disassociated,
            association_id,
        })
    }
}
