//! In-memory API key issuance, validation and revocation.
//!
//! Keys are random alphanumeric strings. A revoked key keeps its record so
//! lookups can tell "revoked" apart from "never issued".

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant, SystemTime};

use rand::distr::Alphanumeric;
use rand::Rng;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::constants::ERR_API_KEY_LOCK;
use crate::error::{ProtocolError, Result};

/// Default generated key length
pub const DEFAULT_KEY_SIZE: usize = 32;

/// One issued key and its owner metadata
#[derive(Debug, Clone, PartialEq)]
pub struct ApiKey {
    pub key: String,
    pub owner: Value,
    pub issued_at: SystemTime,
    pub ttl: Option<Duration>,
    expires_at: Option<Instant>,
    pub revoked: bool,
}

impl ApiKey {
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Instant::now())
    }

    pub fn is_valid(&self) -> bool {
        !self.revoked && !self.is_expired()
    }

    fn check(&self) -> Result<()> {
        if self.revoked {
            Err(ProtocolError::ApiKeyRevoked)
        } else if self.is_expired() {
            Err(ProtocolError::ApiKeyExpired)
        } else {
            Ok(())
        }
    }
}

/// Thread-safe key store shared between the server and API-key filters
#[derive(Debug)]
pub struct ApiKeyStore {
    keys: RwLock<HashMap<String, ApiKey>>,
    key_size: usize,
}

impl Default for ApiKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ApiKeyStore {
    pub fn new() -> Self {
        Self::with_key_size(DEFAULT_KEY_SIZE)
    }

    pub fn with_key_size(key_size: usize) -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
            key_size: key_size.max(1),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, ApiKey>>> {
        self.keys
            .read()
            .map_err(|_| ProtocolError::LockPoisoned(ERR_API_KEY_LOCK))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, ApiKey>>> {
        self.keys
            .write()
            .map_err(|_| ProtocolError::LockPoisoned(ERR_API_KEY_LOCK))
    }

    fn generate(&self) -> String {
        rand::rng()
            .sample_iter(&Alphanumeric)
            .take(self.key_size)
            .map(char::from)
            .collect()
    }

    fn insert(keys: &mut HashMap<String, ApiKey>, key: String, owner: Value, ttl: Option<Duration>) {
        let record = ApiKey {
            key: key.clone(),
            owner,
            issued_at: SystemTime::now(),
            ttl,
            // An unrepresentable expiry never arrives.
            expires_at: ttl.and_then(|ttl| Instant::now().checked_add(ttl)),
            revoked: false,
        };
        keys.insert(key, record);
    }

    /// Issue a new key for `owner`, optionally expiring after `ttl`.
    pub fn issue(&self, owner: Value, ttl: Option<Duration>) -> Result<String> {
        let mut keys = self.write()?;
        let mut key = self.generate();
        while keys.contains_key(&key) {
            key = self.generate();
        }
        Self::insert(&mut keys, key.clone(), owner, ttl);
        debug!(ttl = ?ttl, "API key issued");
        Ok(key)
    }

    /// Owner metadata of a valid key.
    ///
    /// # Errors
    /// `ApiKeyNotFound`, `ApiKeyRevoked` or `ApiKeyExpired`.
    pub fn get(&self, key: &str) -> Result<Value> {
        let keys = self.read()?;
        let record = keys.get(key).ok_or(ProtocolError::ApiKeyNotFound)?;
        record.check()?;
        Ok(record.owner.clone())
    }

    /// Read-only validity check used by filters
    pub fn is_valid(&self, key: &str) -> bool {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .is_some_and(ApiKey::is_valid)
    }

    /// Invalidate a key. Its record stays available through [`record`](Self::record).
    pub fn revoke(&self, key: &str) -> Result<()> {
        let mut keys = self.write()?;
        let record = keys.get_mut(key).ok_or(ProtocolError::ApiKeyNotFound)?;
        record.revoked = true;
        info!("API key revoked");
        Ok(())
    }

    /// Revoke `key` and issue a replacement with the same owner and TTL.
    pub fn reissue(&self, key: &str) -> Result<String> {
        let mut keys = self.write()?;
        let old = keys.get_mut(key).ok_or(ProtocolError::ApiKeyNotFound)?;
        old.check()?;
        old.revoked = true;
        let (owner, ttl) = (old.owner.clone(), old.ttl);

        let mut new_key = self.generate();
        while keys.contains_key(&new_key) {
            new_key = self.generate();
        }
        Self::insert(&mut keys, new_key.clone(), owner, ttl);
        info!("API key reissued");
        Ok(new_key)
    }

    /// Replace the owner metadata of a valid key.
    pub fn update(&self, key: &str, owner: Value) -> Result<()> {
        let mut keys = self.write()?;
        let record = keys.get_mut(key).ok_or(ProtocolError::ApiKeyNotFound)?;
        record.check()?;
        record.owner = owner;
        Ok(())
    }

    /// Full record for a key, including revoked and expired ones
    pub fn record(&self, key: &str) -> Option<ApiKey> {
        self.read().ok()?.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.read().map(|k| k.contains_key(key)).unwrap_or(false)
    }

    /// Number of records, revoked ones included
    pub fn len(&self) -> usize {
        self.read().map(|k| k.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every key. Returns how many records were dropped.
    pub fn clear(&self) -> usize {
        let mut keys = self.keys.write().unwrap_or_else(PoisonError::into_inner);
        let dropped = keys.len();
        keys.clear();
        dropped
    }
}
