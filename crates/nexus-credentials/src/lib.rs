//! Resolves `(domain) -> credential` and keeps OAuth access tokens fresh
//! (spec §4.2, component C2).

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use nexus_core::error::{ProxyError, Result};
use nexus_core::types::Domain;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

/// On-disk shape of `<domain>.credentials.json` (spec §4.2/§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credential {
    ApiKey {
        key: String,
    },
    OAuth {
        access_token: String,
        refresh_token: String,
        expires_at: DateTime<Utc>,
        #[serde(skip_serializing_if = "Option::is_none")]
        token_url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },
}

impl Credential {
    /// The value to place in the outbound auth header; C5 decides which
    /// header name to use based on the variant.
    pub fn auth_value(&self) -> &str {
        match self {
            Credential::ApiKey { key } => key,
            Credential::OAuth { access_token, .. } => access_token,
        }
    }

    pub fn is_oauth(&self) -> bool {
        matches!(self, Credential::OAuth { .. })
    }
}

pub struct CredentialStore {
    dir: PathBuf,
    refresh_skew_secs: i64,
    http: reqwest::Client,
    cache: DashMap<Domain, Arc<RwLock<Credential>>>,
    refresh_locks: DashMap<Domain, Arc<Mutex<()>>>,
}

impl CredentialStore {
    pub fn new(dir: impl Into<PathBuf>, refresh_skew_secs: i64) -> Self {
        Self {
            dir: dir.into(),
            refresh_skew_secs,
            http: reqwest::Client::new(),
            cache: DashMap::new(),
            refresh_locks: DashMap::new(),
        }
    }

    fn path_for(&self, domain: &Domain) -> PathBuf {
        self.dir.join(format!("{}.credentials.json", domain.as_str()))
    }

    async fn load_from_disk(&self, domain: &Domain) -> Result<Credential> {
        let path = self.path_for(domain);
        let bytes = tokio::fs::read(&path).await.map_err(|_| ProxyError::UnknownDomain {
            domain: domain.to_string(),
        })?;
        serde_json::from_slice(&bytes).map_err(ProxyError::from)
    }

    async fn entry(&self, domain: &Domain) -> Result<Arc<RwLock<Credential>>> {
        if let Some(existing) = self.cache.get(domain) {
            return Ok(existing.clone());
        }
        let credential = self.load_from_disk(domain).await?;
        let slot = Arc::new(RwLock::new(credential));
        self.cache.insert(domain.clone(), slot.clone());
        Ok(slot)
    }

    fn refresh_lock(&self, domain: &Domain) -> Arc<Mutex<()>> {
        self.refresh_locks
            .entry(domain.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Resolves the current credential for `domain`, refreshing an OAuth
    /// token first if it is within the skew window of expiry.
    pub async fn resolve(&self, domain: &Domain) -> Result<Credential> {
        let slot = self.entry(domain).await?;

        // Fast path: most calls see a token that is still fresh.
        {
            let guard = slot.read().await;
            if !self.needs_refresh(&guard) {
                return Ok(guard.clone());
            }
        }

        self.refresh(domain, &slot).await
    }

    /// Forces a refresh regardless of expiry, used after the upstream
    /// reports `AuthExpired` (spec §4.5).
    pub async fn force_refresh(&self, domain: &Domain) -> Result<Credential> {
        let slot = self.entry(domain).await?;
        self.refresh(domain, &slot).await
    }

    fn needs_refresh(&self, credential: &Credential) -> bool {
        match credential {
            Credential::ApiKey { .. } => false,
            Credential::OAuth { expires_at, .. } => {
                *expires_at - Utc::now() < chrono::Duration::seconds(self.refresh_skew_secs)
            }
        }
    }

    async fn refresh(&self, domain: &Domain, slot: &Arc<RwLock<Credential>>) -> Result<Credential> {
        let lock = self.refresh_lock(domain);
        let _permit = lock.lock().await;

        // Re-check: another task may have refreshed while we waited for the lock.
        {
            let guard = slot.read().await;
            if !self.needs_refresh(&guard) {
                return Ok(guard.clone());
            }
        }

        let mut guard = slot.write().await;
        let (refresh_token, token_url, client_id) = match &*guard {
            Credential::OAuth {
                refresh_token,
                token_url,
                client_id,
                ..
            } => (refresh_token.clone(), token_url.clone(), client_id.clone()),
            Credential::ApiKey { .. } => return Ok(guard.clone()),
        };

        match self
            .exchange_refresh_token(&refresh_token, token_url.as_deref(), client_id.as_deref())
            .await
        {
            Ok((access_token, new_refresh_token, expires_in_secs)) => {
                *guard = Credential::OAuth {
                    access_token,
                    refresh_token: new_refresh_token,
                    expires_at: Utc::now() + chrono::Duration::seconds(expires_in_secs),
                    token_url,
                    client_id,
                };
                self.persist(domain, &guard).await?;
                info!(domain = %domain, "refreshed oauth credential");
                Ok(guard.clone())
            }
            Err(e) => {
                warn!(domain = %domain, error = %e, "oauth refresh failed");
                Err(ProxyError::ExpiredToken {
                    domain: domain.to_string(),
                })
            }
        }
    }

    async fn exchange_refresh_token(
        &self,
        refresh_token: &str,
        token_url: Option<&str>,
        client_id: Option<&str>,
    ) -> Result<(String, String, i64)> {
        let url = token_url.ok_or_else(|| {
            ProxyError::Internal("oauth credential is missing a token_url".to_string())
        })?;

        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
            #[serde(default)]
            refresh_token: Option<String>,
            #[serde(default = "default_expires_in")]
            expires_in: i64,
        }
        fn default_expires_in() -> i64 {
            3600
        }

        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];
        if let Some(id) = client_id {
            form.push(("client_id", id));
        }

        let resp = self
            .http
            .post(url)
            .form(&form)
            .send()
            .await
            .map_err(|e| ProxyError::Network(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ProxyError::Upstream { status, body });
        }

        let parsed: TokenResponse = resp
            .json()
            .await
            .map_err(|e| ProxyError::Network(e.to_string()))?;

        Ok((
            parsed.access_token,
            parsed.refresh_token.unwrap_or_else(|| refresh_token.to_string()),
            parsed.expires_in,
        ))
    }

    /// Atomically overwrites the credential file: write to a sibling temp
    /// file then rename, so a concurrent reader never observes a partial
    /// write.
    async fn persist(&self, domain: &Domain, credential: &Credential) -> Result<()> {
        let path = self.path_for(domain);
        let tmp_path = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(credential)?;
        tokio::fs::write(&tmp_path, &bytes).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        set_owner_only_permissions(&path).await;
        Ok(())
    }
}

#[cfg(unix)]
async fn set_owner_only_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(metadata) = tokio::fs::metadata(path).await {
        let mut perms = metadata.permissions();
        perms.set_mode(0o600);
        let _ = tokio::fs::set_permissions(path, perms).await;
    }
}

#[cfg(not(unix))]
async fn set_owner_only_permissions(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write_credential(dir: &Path, domain: &str, credential: &Credential) {
        let path = dir.join(format!("{domain}.credentials.json"));
        tokio::fs::write(&path, serde_json::to_vec(credential).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn resolves_api_key_without_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let domain = Domain::from("acme.example.com");
        write_credential(
            dir.path(),
            domain.as_str(),
            &Credential::ApiKey {
                key: "sk-test".to_string(),
            },
        )
        .await;

        let store = CredentialStore::new(dir.path(), 60);
        let resolved = store.resolve(&domain).await.unwrap();
        assert_eq!(resolved.auth_value(), "sk-test");
        assert!(!resolved.is_oauth());
    }

    #[tokio::test]
    async fn unknown_domain_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path(), 60);
        let err = store.resolve(&Domain::from("nope.example.com")).await.unwrap_err();
        assert_eq!(err.code(), "authentication_error");
    }

    #[tokio::test]
    async fn fresh_oauth_token_is_not_refreshed() {
        let dir = tempfile::tempdir().unwrap();
        let domain = Domain::from("oauth.example.com");
        write_credential(
            dir.path(),
            domain.as_str(),
            &Credential::OAuth {
                access_token: "fresh-token".to_string(),
                refresh_token: "refresh-me".to_string(),
                expires_at: Utc::now() + chrono::Duration::hours(1),
                token_url: None,
                client_id: None,
            },
        )
        .await;

        let store = CredentialStore::new(dir.path(), 60);
        let resolved = store.resolve(&domain).await.unwrap();
        assert_eq!(resolved.auth_value(), "fresh-token");
    }
}
