use std::future::Future;
use std::sync::{PoisonError, RwLock};

use anyhow::Result;
use keyring::Entry;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::client::ApiError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tokens {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

/// Persist/load boundary for a session's tokens.
pub trait TokenStore: Send + Sync {
    fn load(&self) -> Result<Tokens>;
    fn save(&self, tokens: &Tokens) -> Result<()>;
}

/// Stores the token pair as a JSON secret in the OS keyring.
pub struct KeyringStore {
    entry: Entry,
}

impl KeyringStore {
    pub fn new(service: &str, user: &str) -> Result<Self> {
        Ok(Self {
            entry: Entry::new(service, user)?,
        })
    }
}

/// No usable secret store, as on headless hosts without a secret service.
pub fn is_keyring_unavailable(error: &keyring::Error) -> bool {
    matches!(
        error,
        keyring::Error::PlatformFailure(_) | keyring::Error::NoStorageAccess(_)
    )
}

impl TokenStore for KeyringStore {
    fn load(&self) -> Result<Tokens> {
        match self.entry.get_secret() {
            Ok(secret) => Ok(serde_json::from_slice(&secret)?),
            Err(keyring::Error::NoEntry) => Ok(Tokens::default()),
            Err(e) if is_keyring_unavailable(&e) => {
                tracing::warn!("OS keyring unavailable, starting without a stored session: {}", e);
                Ok(Tokens::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, tokens: &Tokens) -> Result<()> {
        self.entry.set_secret(&serde_json::to_vec(tokens)?)?;
        Ok(())
    }
}

#[cfg(test)]
#[derive(Default)]
pub struct MemoryStore {
    tokens: std::sync::Mutex<Tokens>,
}

#[cfg(test)]
impl TokenStore for MemoryStore {
    fn load(&self) -> Result<Tokens> {
        Ok(self
            .tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn save(&self, tokens: &Tokens) -> Result<()> {
        *self.tokens.lock().unwrap_or_else(PoisonError::into_inner) = tokens.clone();
        Ok(())
    }
}

/// Token state shared by every request issued through one client.
///
/// Each client owns its own `Session`, so independent clients never observe
/// each other's tokens. Refresh exchanges are serialized: a request that
/// failed with a token someone else already replaced picks up the new token
/// instead of starting a second exchange.
pub struct Session {
    tokens: RwLock<Tokens>,
    refresh_guard: Mutex<()>,
    store: Box<dyn TokenStore>,
}

impl Session {
    /// A store that cannot be read leaves the session empty; the next
    /// request then logs in or asks for new tokens.
    pub fn load(store: impl TokenStore + 'static) -> Self {
        let tokens = store.load().unwrap_or_else(|e| {
            tracing::warn!("Stored session could not be loaded: {:#}", e);
            Tokens::default()
        });
        Self {
            tokens: RwLock::new(tokens),
            refresh_guard: Mutex::new(()),
            store: Box::new(store),
        }
    }

    #[cfg(test)]
    pub fn in_memory(tokens: Tokens) -> Self {
        Self {
            tokens: RwLock::new(tokens),
            refresh_guard: Mutex::new(()),
            store: Box::new(MemoryStore::default()),
        }
    }

    pub fn tokens(&self) -> Tokens {
        self.tokens
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.tokens
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .access_token
            .clone()
    }

    pub fn set_tokens(&self, tokens: Tokens) -> Result<()> {
        *self.tokens.write().unwrap_or_else(PoisonError::into_inner) = tokens.clone();
        self.store.save(&tokens)
    }

    pub fn clear(&self) -> Result<()> {
        self.set_tokens(Tokens::default())
    }

    /// Replace the access token rejected as `stale` using `exchange`.
    pub async fn refresh<F, Fut>(&self, stale: Option<&str>, exchange: F) -> Result<String, ApiError>
    where
        F: FnOnce(Tokens) -> Fut,
        Fut: Future<Output = Result<String, ApiError>>,
    {
        let _guard = self.refresh_guard.lock().await;

        let current = self.tokens();
        if let Some(access) = &current.access_token
            && stale != Some(access.as_str())
        {
            tracing::debug!("Session was refreshed by a concurrent request, reusing token");
            return Ok(access.clone());
        }

        let fresh = match exchange(current.clone()).await {
            Ok(token) => token,
            Err(err @ ApiError::ReauthRequired(_)) => return Err(err),
            Err(err) => {
                tracing::warn!("Token refresh failed: {}", err);
                return Err(ApiError::ReauthRequired(err.to_string()));
            }
        };

        let updated = Tokens {
            access_token: Some(fresh.clone()),
            ..current
        };
        if let Err(e) = self.set_tokens(updated) {
            tracing::warn!("Refreshed token could not be persisted: {:#}", e);
        }
        tracing::debug!("Session token refreshed");

        Ok(fresh)
    }
}
