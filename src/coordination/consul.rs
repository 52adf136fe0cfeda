//! Consul KV and session API adapter

use crate::common::{consul_duration, encode_key_path, ConsulConfig, Error, Result};
use crate::coordination::session::renew_loop;
use crate::coordination::{
    AcquireOutcome, DirectoryEntry, LockCoordinator, LockHandle, LockStatus, LOCK_PREFIX,
};
use async_trait::async_trait;
use base64::Engine;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Flag value Consul's own lock helpers put on lock keys
pub const LOCK_FLAG_VALUE: u64 = 0x2ddccbc058a50c18;

const TOKEN_HEADER: &str = "X-Consul-Token";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KvPair {
    key: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    session: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct SessionRequest {
    name: String,
    #[serde(rename = "TTL")]
    ttl: String,
    lock_delay: String,
    behavior: &'static str,
}

#[derive(Debug, Deserialize)]
struct SessionCreated {
    #[serde(rename = "ID")]
    id: String,
}

/// HTTP client for a Consul agent
#[derive(Debug, Clone)]
pub struct ConsulClient {
    client: reqwest::Client,
    address: String,
    token: Option<String>,
    session_ttl: Duration,
    lock_delay: Duration,
    owner: String,
}

impl ConsulClient {
    pub fn new(config: &ConsulConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            address: config.address.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            session_ttl: config.session_ttl,
            lock_delay: config.lock_delay,
            owner: String::new(),
        })
    }

    /// Value written into acquired lock entries (and the session name)
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn session_ttl(&self) -> Duration {
        self.session_ttl
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut request = self
            .client
            .request(method, format!("{}{}", self.address, path));
        if let Some(token) = &self.token {
            request = request.header(TOKEN_HEADER, token);
        }
        request
    }

    async fn kv_get(&self, key: &str, recurse: bool) -> Result<Vec<KvPair>> {
        let path = format!("/v1/kv/{}", encode_key_path(key));
        let mut request = self.request(Method::GET, &path);
        if recurse {
            request = request.query(&[("recurse", "true")]);
        }

        let response = request.send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(Vec::new()),
            StatusCode::OK => Ok(response.json().await?),
            _ => Err(unexpected(&path, response).await),
        }
    }

    async fn create_session(&self) -> Result<String> {
        let name = if self.owner.is_empty() {
            "eip-manager lock".to_string()
        } else {
            format!("eip-manager lock ({})", self.owner)
        };
        let body = SessionRequest {
            name,
            ttl: consul_duration(self.session_ttl),
            lock_delay: consul_duration(self.lock_delay),
            behavior: "release",
        };

        let response = self
            .request(Method::PUT, "/v1/session/create")
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(unexpected("/v1/session/create", response).await);
        }
        let created: SessionCreated = response.json().await?;
        Ok(created.id)
    }

    async fn destroy_session(&self, session: &str) -> Result<()> {
        let path = format!("/v1/session/destroy/{}", session);
        let response = self.request(Method::PUT, &path).send().await?;
        if !response.status().is_success() {
            return Err(unexpected(&path, response).await);
        }
        Ok(())
    }

    /// Renew `session`; `Ok(false)` when Consul no longer knows it
    pub(crate) async fn renew_session(&self, session: &str) -> Result<bool> {
        let path = format!("/v1/session/renew/{}", session);
        let response = self.request(Method::PUT, &path).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            _ => Err(unexpected(&path, response).await),
        }
    }

    async fn kv_lock_op(&self, key: &str, op: &str, session: &str) -> Result<bool> {
        let path = format!("/v1/kv/{}", encode_key_path(key));
        let flags = LOCK_FLAG_VALUE.to_string();
        let response = self
            .request(Method::PUT, &path)
            .query(&[(op, session), ("flags", flags.as_str())])
            .body(self.owner.clone())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(unexpected(&path, response).await);
        }
        Ok(response.json::<bool>().await?)
    }
}

async fn unexpected(path: &str, response: Response) -> Error {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Error::Consul(format!("{} returned {}: {}", path, status, body.trim()))
}

fn decode_value(pair: &KvPair) -> Option<String> {
    let raw = pair.value.as_deref()?;
    let bytes = match base64::engine::general_purpose::STANDARD.decode(raw) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!("Skipping {}: value is not base64 ({})", pair.key, e);
            return None;
        }
    };
    match String::from_utf8(bytes) {
        Ok(value) => Some(value.trim().to_string()).filter(|v| !v.is_empty()),
        Err(_) => {
            tracing::warn!("Skipping {}: value is not UTF-8", pair.key);
            None
        }
    }
}

#[async_trait]
impl LockCoordinator for ConsulClient {
    async fn list_keys(&self, prefix: &str) -> Result<Vec<DirectoryEntry>> {
        let mut pairs = self.kv_get(prefix, true).await?;
        pairs.sort_by(|a, b| a.key.cmp(&b.key));

        let entries = pairs
            .iter()
            .filter(|pair| !pair.key.ends_with('/') && !pair.key.starts_with(LOCK_PREFIX))
            .filter_map(|pair| match decode_value(pair) {
                Some(allocation_id) => Some(DirectoryEntry::new(pair.key.clone(), allocation_id)),
                None => {
                    tracing::debug!("Skipping {}: no allocation ID", pair.key);
                    None
                }
            })
            .collect();
        Ok(entries)
    }

    async fn lock_status(&self, key: &str) -> Result<LockStatus> {
        let pairs = self.kv_get(key, false).await?;
        let session = pairs
            .into_iter()
            .find(|pair| pair.key == key)
            .and_then(|pair| pair.session)
            .filter(|s| !s.is_empty());
        Ok(match session {
            Some(session) => LockStatus::Held { session },
            None => LockStatus::Free,
        })
    }

    async fn acquire_lock(&self, key: &str) -> Result<AcquireOutcome> {
        let session = self.create_session().await?;

        let acquired = match self.kv_lock_op(key, "acquire", &session).await {
            Ok(acquired) => acquired,
            Err(e) => {
                if let Err(cleanup) = self.destroy_session(&session).await {
                    tracing::warn!("Failed to destroy session {}: {}", session, cleanup);
                }
                return Err(e);
            }
        };

        if !acquired {
            tracing::debug!("Lock {} is held by another session", key);
            self.destroy_session(&session).await?;
            return Ok(AcquireOutcome::Contended);
        }

        let (handle, lost) = LockHandle::with_loss_signal(key, session.clone());
        let renewer = tokio::spawn(renew_loop(self.clone(), session, lost));
        Ok(AcquireOutcome::Acquired(handle.with_renewer(renewer)))
    }

    async fn release(&self, mut handle: LockHandle) -> Result<()> {
        handle.stop_renewal();

        let released = self
            .kv_lock_op(handle.key(), "release", handle.session())
            .await?;
        if !released {
            tracing::warn!(
                "Lock {} was no longer held by session {}",
                handle.key(),
                handle.session()
            );
        }
        self.destroy_session(handle.session()).await?;
        tracing::info!("Released lock {}", handle.key());
        Ok(())
    }
}
