//! Instance identity
//!
//! The identity is read once at startup and never changes afterwards.

pub mod imds;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use imds::{resolve_credentials, Credentials, ImdsClient};

/// Snapshot of the instance identity document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceIdentity {
    pub private_ip: String,
    pub availability_zone: String,
    pub instance_id: String,
    pub region: String,
}

/// Source of this instance's identity
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn identity(&self) -> crate::Result<InstanceIdentity>;
}

#[async_trait]
impl IdentityProvider for InstanceIdentity {
    async fn identity(&self) -> crate::Result<InstanceIdentity> {
        Ok(self.clone())
    }
}
