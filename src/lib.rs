//! # eip-manager
//!
//! Floating Elastic IP failover for a pool of interchangeable instances:
//! - Each address slot lives in Consul KV as `<prefix><name> → eipalloc-...`
//! - An instance claims a slot by taking the session lock at `lock/<slot key>`
//! - The lock holder moves the address onto itself (disassociate, then
//!   associate with reassociation allowed)
//! - A crashed holder's session expires and the slot becomes claimable again
//!
//! ## Architecture
//!
//! ```text
//!  ┌──────────────┐   identity    ┌──────────────────────────┐
//!  │ IMDS         │──────────────▶│ EipManager               │
//!  └──────────────┘               │  1. identity             │
//!  ┌──────────────┐ list / lock   │  2. SlotSelector         │
//!  │ Consul KV +  │◀─────────────▶│  3. AddressBinder        │
//!  │ sessions     │               │  4. hold or exit         │
//!  └──────────────┘               └───────────┬──────────────┘
//!                                             │ describe / associate
//!                                       ┌─────▼──────┐
//!                                       │ EC2 API    │
//!                                       └────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Directory population (once, by an operator)
//! consul kv put nginx/eip/a eipalloc-0123456789abcdef0
//! consul kv put nginx/eip/b eipalloc-0fedcba9876543210
//!
//! # On every instance
//! eip-manager --prefix nginx/eip/
//! ```

pub mod binder;
pub mod common;
pub mod coordination;
pub mod identity;
pub mod manager;

// Re-export commonly used types
pub use common::{Config, Error, ErrorKind, Result};
pub use manager::{Claim, EipManager};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
