//! Agent identity and API keys.
//!
//! Keys are `cm_` + 256 random bits, base64url. Only the first 12 characters
//! (the lookup prefix) and a SHA-256 hash of the whole key are stored; the
//! plaintext is returned exactly once, at registration or rotation. Failed
//! verifications count toward a lockout, and every lifecycle event lands in
//! the audit log.

use std::collections::HashMap;
use std::sync::LazyLock;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use claude_mem_schema::{epoch_millis_now, AgentRecord};
use claude_mem_store::{NewAgent, NewAuditEntry, Store, StoreError};
use rand::RngCore;
use regex::Regex;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::warn;

pub const KEY_PREFIX_LEN: usize = 12;
const KEY_BYTES: usize = 32;

static AGENT_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]+@[A-Za-z0-9._-]+$").unwrap());

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid agent id format: {0}")]
    InvalidIdFormat(String),
    #[error("agent locked until {until_epoch}")]
    Locked { until_epoch: i64 },
    #[error("invalid api key")]
    InvalidKey,
    #[error("api key expired")]
    Expired,
    #[error("agent revoked")]
    Revoked,
    #[error("unknown agent: {0}")]
    Unknown(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug)]
pub struct RegisterOutcome {
    pub agent: AgentRecord,
    /// Plaintext key; present only when this call created the agent.
    pub api_key: Option<String>,
    pub created: bool,
}

pub struct AgentRegistry {
    store: Store,
    max_failed_attempts: i64,
    lockout_millis: i64,
    key_expiry_millis: Option<i64>,
    /// prefix -> record; invalidated on rotate and revoke.
    cache: RwLock<HashMap<String, AgentRecord>>,
}

struct MintedKey {
    plaintext: String,
    prefix: String,
    hash: String,
}

fn mint_key() -> MintedKey {
    let mut bytes = [0_u8; KEY_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    let plaintext = format!("cm_{}", URL_SAFE_NO_PAD.encode(bytes));
    let prefix = plaintext[..KEY_PREFIX_LEN].to_string();
    let hash = hex::encode(Sha256::digest(plaintext.as_bytes()));
    MintedKey {
        plaintext,
        prefix,
        hash,
    }
}

fn hashes_match(stored_hash: &str, presented_key: &str) -> bool {
    let presented = hex::encode(Sha256::digest(presented_key.as_bytes()));
    stored_hash.as_bytes().ct_eq(presented.as_bytes()).into()
}

impl AgentRegistry {
    pub fn new(
        store: Store,
        max_failed_attempts: i64,
        lockout_seconds: i64,
        key_expiry_days: i64,
    ) -> Self {
        Self {
            store,
            max_failed_attempts: max_failed_attempts.max(1),
            lockout_millis: lockout_seconds.max(0) * 1_000,
            key_expiry_millis: (key_expiry_days > 0)
                .then(|| key_expiry_days * 24 * 60 * 60 * 1_000),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// True until the first agent registers; the HTTP layer allows
    /// unauthenticated loopback access in that window.
    pub async fn bootstrap_mode(&self) -> Result<bool, AgentError> {
        Ok(self.store.agent_count().await? == 0)
    }

    pub async fn register(
        &self,
        id: &str,
        department: &str,
        permissions: &str,
        spawned_by: Option<&str>,
        role: Option<&str>,
        ip: Option<&str>,
    ) -> Result<RegisterOutcome, AgentError> {
        if !AGENT_ID.is_match(id) {
            return Err(AgentError::InvalidIdFormat(id.to_string()));
        }
        let now = epoch_millis_now();
        let minted = mint_key();
        let (agent, created) = self
            .store
            .register_or_get_agent(
                NewAgent {
                    id: id.to_string(),
                    department: department.to_string(),
                    permissions: permissions.to_string(),
                    api_key_prefix: minted.prefix.clone(),
                    api_key_hash: minted.hash.clone(),
                    expires_at_epoch: self.key_expiry_millis.map(|ms| now + ms),
                    spawned_by: spawned_by.map(str::to_string),
                    bead_id: None,
                    role: role.map(str::to_string),
                },
                now,
            )
            .await?;
        self.audit(id, "agent.register", ip, created.then_some("created"))
            .await;
        Ok(RegisterOutcome {
            agent,
            api_key: created.then_some(minted.plaintext),
            created,
        })
    }

    /// Verify `(id, key)`. Lock checks come first: a locked agent is refused
    /// even with the right key, and the refusal carries the unlock time.
    pub async fn verify(&self, id: &str, key: &str, ip: Option<&str>) -> Result<AgentRecord, AgentError> {
        let agent = self
            .store
            .agent(id)
            .await?
            .ok_or_else(|| AgentError::Unknown(id.to_string()))?;
        self.check_key(agent, key, ip).await
    }

    /// Bearer-token authentication: resolve the agent by key prefix, then
    /// run the same checks as `verify`.
    pub async fn authenticate(&self, key: &str, ip: Option<&str>) -> Result<AgentRecord, AgentError> {
        if key.len() < KEY_PREFIX_LEN {
            return Err(AgentError::InvalidKey);
        }
        let prefix = &key[..KEY_PREFIX_LEN];
        let cached = self.cache.read().await.get(prefix).cloned();
        let agent = match cached {
            Some(agent) => agent,
            None => {
                let agent = self
                    .store
                    .agent_by_key_prefix(prefix)
                    .await?
                    .ok_or(AgentError::InvalidKey)?;
                self.cache
                    .write()
                    .await
                    .insert(prefix.to_string(), agent.clone());
                agent
            }
        };
        self.check_key(agent, key, ip).await
    }

    async fn check_key(
        &self,
        agent: AgentRecord,
        key: &str,
        ip: Option<&str>,
    ) -> Result<AgentRecord, AgentError> {
        let now = epoch_millis_now();
        if agent.revoked {
            self.audit(&agent.id, "agent.verify.revoked", ip, None).await;
            return Err(AgentError::Revoked);
        }
        if agent.is_locked(now) {
            self.audit(&agent.id, "agent.verify.locked", ip, None).await;
            return Err(AgentError::Locked {
                until_epoch: agent.locked_until_epoch.unwrap_or(now),
            });
        }
        if agent.is_expired(now) {
            self.audit(&agent.id, "agent.verify.expired", ip, None).await;
            return Err(AgentError::Expired);
        }
        if !hashes_match(&agent.api_key_hash, key) {
            let updated = self
                .store
                .record_verify_failure(&agent.id, self.max_failed_attempts, self.lockout_millis, now)
                .await?;
            self.audit(&agent.id, "agent.verify.failure", ip, None).await;
            if updated.is_locked(now) {
                self.audit(&agent.id, "agent.lockout", ip, None).await;
                warn!(agent = %agent.id, until = ?updated.locked_until_epoch, "agent locked out");
            }
            self.invalidate(&agent.api_key_prefix).await;
            return Err(AgentError::InvalidKey);
        }

        self.store.record_verify_success(&agent.id, now).await?;
        self.audit(&agent.id, "agent.verify.success", ip, None).await;
        let refreshed = self
            .store
            .agent(&agent.id)
            .await?
            .ok_or_else(|| AgentError::Unknown(agent.id.clone()))?;
        self.cache
            .write()
            .await
            .insert(refreshed.api_key_prefix.clone(), refreshed.clone());
        Ok(refreshed)
    }

    /// Issue a fresh key, invalidating the old one atomically.
    pub async fn rotate(&self, id: &str, ip: Option<&str>) -> Result<(AgentRecord, String), AgentError> {
        let existing = self
            .store
            .agent(id)
            .await?
            .ok_or_else(|| AgentError::Unknown(id.to_string()))?;
        let now = epoch_millis_now();
        let minted = mint_key();
        self.store
            .rotate_agent_key(
                id,
                &minted.prefix,
                &minted.hash,
                self.key_expiry_millis.map(|ms| now + ms),
                now,
            )
            .await?;
        self.invalidate(&existing.api_key_prefix).await;
        self.audit(id, "agent.rotate", ip, None).await;
        let refreshed = self
            .store
            .agent(id)
            .await?
            .ok_or_else(|| AgentError::Unknown(id.to_string()))?;
        Ok((refreshed, minted.plaintext))
    }

    pub async fn revoke(&self, id: &str, ip: Option<&str>) -> Result<(), AgentError> {
        let existing = self
            .store
            .agent(id)
            .await?
            .ok_or_else(|| AgentError::Unknown(id.to_string()))?;
        self.store.revoke_agent(id).await?;
        self.invalidate(&existing.api_key_prefix).await;
        self.audit(id, "agent.revoke", ip, None).await;
        Ok(())
    }

    async fn invalidate(&self, prefix: &str) {
        self.cache.write().await.remove(prefix);
    }

    async fn audit(&self, agent_id: &str, action: &str, ip: Option<&str>, details: Option<&str>) {
        let entry = NewAuditEntry {
            agent_id: agent_id.to_string(),
            action: action.to_string(),
            resource_type: Some("agent".to_string()),
            resource_id: Some(agent_id.to_string()),
            details: details.map(str::to_string),
            ip_address: ip.map(str::to_string),
        };
        if let Err(e) = self.store.append_audit(entry, epoch_millis_now()).await {
            warn!(action, error = %e, "audit append failed");
        }
    }
}
