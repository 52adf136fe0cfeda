//! Common utilities and types shared across eip-manager

pub mod config;
pub mod error;
pub mod utils;

pub use config::{Config, ConsulConfig, Ec2Config, MetadataConfig, SelectorConfig};
pub use error::{Error, ErrorKind, Result};
pub use utils::{consul_duration, encode_key_path, parse_duration, validate_prefix};
