//! Caller secret → session token cache.
//!
//! Lookups of a live entry only take the map's read lock and never wait on a
//! token being issued. Misses serialize on a single creation lock and look
//! again once inside it, so concurrent callers presenting the same new secret
//! cause exactly one issuance call. Entries are immutable; expired ones are
//! ignored by lookups and removed by a periodic sweep that runs independently
//! of creation.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, SystemTime};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::backend::{Backend, BackendError};

/// Session token issued for one caller secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub secret: String,
    pub token: String,
    pub expires_at: SystemTime,
}

impl Credential {
    pub fn is_live_at(&self, now: SystemTime) -> bool {
        self.expires_at > now
    }
}

/// Last four characters of a secret for log lines (`****` for short ones).
pub fn secret_suffix(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() > 4 {
        chars[chars.len() - 4..].iter().collect()
    } else {
        "****".to_string()
    }
}

pub struct CredentialCache {
    backend: Arc<dyn Backend>,
    entries: RwLock<HashMap<String, Arc<Credential>>>,
    creation: Mutex<()>,
    default_ttl: Duration,
}

impl CredentialCache {
    /// `default_ttl` applies when the backend does not report an expiry.
    pub fn new(backend: Arc<dyn Backend>, default_ttl: Duration) -> Self {
        Self {
            backend,
            entries: RwLock::new(HashMap::new()),
            creation: Mutex::new(()),
            default_ttl,
        }
    }

    /// Return a live credential for `secret`, issuing one if needed.
    pub async fn resolve(&self, secret: &str) -> Result<Arc<Credential>, BackendError> {
        if let Some(existing) = self.lookup(secret) {
            return Ok(existing);
        }

        let _creating = self.creation.lock().await;
        if let Some(existing) = self.lookup(secret) {
            return Ok(existing);
        }

        info!(
            secret = %format!("...{}", secret_suffix(secret)),
            "issuing session token"
        );
        let issued = self.backend.issue_token(secret).await?;
        let expires_at = issued
            .expires_at
            .unwrap_or_else(|| SystemTime::now() + self.default_ttl);
        let credential = Arc::new(Credential {
            secret: secret.to_string(),
            token: issued.token,
            expires_at,
        });

        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(secret.to_string(), credential.clone());
        info!(
            expires_in_secs = expires_at
                .duration_since(SystemTime::now())
                .map(|d| d.as_secs())
                .unwrap_or(0),
            "session token issued"
        );
        Ok(credential)
    }

    fn lookup(&self, secret: &str) -> Option<Arc<Credential>> {
        let now = SystemTime::now();
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(secret)
            .filter(|c| c.is_live_at(now))
            .cloned()
    }

    /// Drop every entry whose expiry has passed. Returns how many went.
    pub fn remove_expired(&self) -> usize {
        let now = SystemTime::now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|secret, credential| {
            let keep = credential.is_live_at(now);
            if !keep {
                info!(
                    secret = %format!("...{}", secret_suffix(secret)),
                    "evicted expired credential"
                );
            }
            keep
        });
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run [`remove_expired`](Self::remove_expired) every `interval` until
    /// `cancel` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "credential sweeper started");
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let cache = Arc::clone(&cache);
                        match tokio::task::spawn_blocking(move || cache.remove_expired()).await {
                            Ok(removed) => debug!(removed, "credential sweep finished"),
                            Err(e) => error!("credential sweep failed: {e}"),
                        }
                    }
                }
            }
            info!("credential sweeper stopped");
        })
    }
}
