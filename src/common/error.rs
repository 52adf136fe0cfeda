//! Error types for eip-manager

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// How the orchestrator must react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Abort the pass and exit non-zero.
    Fatal,
    /// Log and keep going.
    Recoverable,
}

#[derive(Error, Debug)]
pub enum Error {
    // === Identity Errors ===
    #[error("Instance metadata error: {0}")]
    Metadata(String),

    #[error("No AWS credentials available: {0}")]
    Credentials(String),

    // === Coordination Errors ===
    #[error("Consul error: {0}")]
    Consul(String),

    #[error("Lock session lost for {0}")]
    SessionLost(String),

    // === Binding Errors ===
    #[error("Could not find EIP with AllocationID {0}")]
    AddressNotFound(String),

    #[error("EC2 {action} failed ({code}): {message}")]
    Ec2 {
        action: String,
        code: String,
        message: String,
    },

    #[error("Disassociate {association_id} failed: {reason}")]
    Disassociate {
        association_id: String,
        reason: String,
    },

    // === Network Errors ===
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Malformed response: {0}")]
    Decode(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Disassociate { .. } => ErrorKind::Recoverable,
            _ => ErrorKind::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

impl From<quick_xml::de::DeError> for Error {
    fn from(e: quick_xml::de::DeError) -> Self {
        Error::Decode(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_disassociate_is_recoverable() {
        let err = Error::Disassociate {
            association_id: "eipassoc-1".into(),
            reason: "gone".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Recoverable);
        assert!(!err.is_fatal());

        assert!(Error::AddressNotFound("eipalloc-1".into()).is_fatal());
        assert!(Error::Consul("500".into()).is_fatal());
        assert!(Error::SessionLost("lock/a".into()).is_fatal());
    }

    #[test]
    fn test_config_error_maps_to_invalid_config() {
        let err: Error = config::ConfigError::Message("bad key".into()).into();
        assert!(matches!(err, Error::InvalidConfig(ref m) if m.contains("bad key")));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_address_not_found_message() {
        let err = Error::AddressNotFound("eipalloc-42".into());
        assert_eq!(err.to_string(), "Could not find EIP with AllocationID eipalloc-42");
    }
}
