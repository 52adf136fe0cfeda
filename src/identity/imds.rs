//! EC2 instance metadata service client
//!
//! Tries IMDSv2 (session token) first and falls back to IMDSv1 when the
//! token endpoint is unavailable.

use crate::common::{Error, MetadataConfig, Result};
use crate::identity::{IdentityProvider, InstanceIdentity};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::OnceCell;

const TOKEN_PATH: &str = "/latest/api/token";
const IDENTITY_DOCUMENT_PATH: &str = "/latest/dynamic/instance-identity/document";
const ROLE_CREDENTIALS_PATH: &str = "/latest/meta-data/iam/security-credentials/";

const TOKEN_TTL_HEADER: &str = "X-aws-ec2-metadata-token-ttl-seconds";
const TOKEN_HEADER: &str = "X-aws-ec2-metadata-token";
const TOKEN_TTL_SECONDS: &str = "21600";

/// AWS API credentials
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Credentials {
    /// Build credentials from the standard `AWS_*` variable values
    pub fn from_vars(
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        session_token: Option<String>,
    ) -> Option<Self> {
        let access_key_id = access_key_id.filter(|v| !v.is_empty())?;
        let secret_access_key = secret_access_key.filter(|v| !v.is_empty())?;
        Some(Self {
            access_key_id,
            secret_access_key,
            session_token: session_token.filter(|v| !v.is_empty()),
        })
    }

    pub fn from_env() -> Option<Self> {
        Self::from_vars(
            std::env::var("AWS_ACCESS_KEY_ID").ok(),
            std::env::var("AWS_SECRET_ACCESS_KEY").ok(),
            std::env::var("AWS_SESSION_TOKEN").ok(),
        )
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RoleCredentials {
    #[serde(default)]
    code: Option<String>,
    access_key_id: String,
    secret_access_key: String,
    token: Option<String>,
}

/// Client for the link-local metadata endpoint
#[derive(Debug, Clone)]
pub struct ImdsClient {
    client: reqwest::Client,
    endpoint: String,
    /// IMDSv2 token, requested once; `None` means IMDSv1
    token: OnceCell<Option<String>>,
}

impl ImdsClient {
    pub fn new(config: &MetadataConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .no_proxy()
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            token: OnceCell::new(),
        })
    }

    /// Request an IMDSv2 session token, `None` when only IMDSv1 is available
    async fn session_token(&self) -> Option<String> {
        let response = self
            .client
            .put(format!("{}{}", self.endpoint, TOKEN_PATH))
            .header(TOKEN_TTL_HEADER, TOKEN_TTL_SECONDS)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => resp.text().await.ok(),
            Ok(resp) => {
                tracing::debug!("IMDSv2 token request returned {}, using IMDSv1", resp.status());
                None
            }
            Err(e) => {
                tracing::debug!("IMDSv2 token request failed: {}, using IMDSv1", e);
                None
            }
        }
    }

    async fn get_text(&self, path: &str) -> Result<String> {
        let mut request = self.client.get(format!("{}{}", self.endpoint, path));
        let token = self.token.get_or_init(|| self.session_token()).await;
        if let Some(token) = token {
            request = request.header(TOKEN_HEADER, token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Metadata(format!("GET {}: {}", path, e)))?;

        match response.status() {
            StatusCode::OK => Ok(response.text().await?),
            status => Err(Error::Metadata(format!("GET {} returned {}", path, status))),
        }
    }

    /// Fetch and parse the instance identity document
    pub async fn identity_document(&self) -> Result<InstanceIdentity> {
        let body = self.get_text(IDENTITY_DOCUMENT_PATH).await?;
        serde_json::from_str(&body)
            .map_err(|e| Error::Metadata(format!("invalid identity document: {}", e)))
    }

    /// Credentials of the instance profile role
    pub async fn role_credentials(&self) -> Result<Credentials> {
        let roles = self.get_text(ROLE_CREDENTIALS_PATH).await?;
        let role = roles
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .ok_or_else(|| Error::Credentials("no instance profile role attached".into()))?;

        let body = self
            .get_text(&format!("{}{}", ROLE_CREDENTIALS_PATH, role))
            .await?;
        let creds: RoleCredentials = serde_json::from_str(&body)
            .map_err(|e| Error::Credentials(format!("invalid role credentials: {}", e)))?;

        if let Some(code) = creds.code.as_deref().filter(|c| *c != "Success") {
            return Err(Error::Credentials(format!(
                "role {} credentials unavailable: {}",
                role, code
            )));
        }

        tracing::debug!("Using instance profile credentials for role {}", role);
        Ok(Credentials {
            access_key_id: creds.access_key_id,
            secret_access_key: creds.secret_access_key,
            session_token: creds.token,
        })
    }
}

#[async_trait]
impl IdentityProvider for ImdsClient {
    async fn identity(&self) -> Result<InstanceIdentity> {
        self.identity_document().await
    }
}

/// Environment credentials first, then the instance profile
pub async fn resolve_credentials(imds: &ImdsClient) -> Result<Credentials> {
    if let Some(creds) = Credentials::from_env() {
        tracing::debug!("Using credentials from environment");
        return Ok(creds);
    }
    imds.role_credentials().await
}
