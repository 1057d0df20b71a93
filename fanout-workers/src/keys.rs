//! Per-identity key material.
//!
//! Keys come from `WALLET_KEY_<NAME>` / `ENCRYPTION_KEY_<NAME>` when both are
//! set, otherwise they are generated once and reused for the lifetime of the
//! cache. Installations of one base name share a wallet key (and therefore
//! an inbox).

use rand::RngCore;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

/// Wallet and database keys for one identity, hex encoded.
#[derive(Clone, PartialEq, Eq)]
pub struct WorkerKeys {
    /// Wallet key (`0x`-prefixed hex)
    pub wallet_key: String,
    /// Database encryption key (hex)
    pub db_encryption_key: String,
}

impl WorkerKeys {
    /// Fresh random keys.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut wallet = [0u8; 32];
        let mut db = [0u8; 32];
        rng.fill_bytes(&mut wallet);
        rng.fill_bytes(&mut db);
        Self {
            wallet_key: format!("0x{}", hex::encode(wallet)),
            db_encryption_key: hex::encode(db),
        }
    }
}

impl fmt::Debug for WorkerKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerKeys")
            .field("wallet_key", &"[REDACTED]")
            .field("db_encryption_key", &"[REDACTED]")
            .finish()
    }
}

type EnvLookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Keys per base name. Construct once per process and share by reference.
pub struct KeyCache {
    keys: Mutex<HashMap<String, WorkerKeys>>,
    lookup: EnvLookup,
}

impl KeyCache {
    /// Cache that reads keys from the process environment.
    pub fn from_env() -> Self {
        Self::with_lookup(|key| std::env::var(key).ok())
    }

    /// Cache that always generates keys.
    pub fn generated() -> Self {
        Self::with_lookup(|_| None)
    }

    /// Cache backed by an arbitrary variable lookup.
    pub fn with_lookup(lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
            lookup: Box::new(lookup),
        }
    }

    /// Keys for `base_name`, loading or generating them on first use.
    pub fn get(&self, base_name: &str) -> WorkerKeys {
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        keys.entry(base_name.to_string())
            .or_insert_with(|| self.load(base_name).unwrap_or_else(WorkerKeys::generate))
            .clone()
    }

    /// Pin the keys for `base_name`.
    pub fn insert(&self, base_name: &str, worker_keys: WorkerKeys) {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(base_name.to_string(), worker_keys);
    }

    fn load(&self, base_name: &str) -> Option<WorkerKeys> {
        let suffix = base_name.to_ascii_uppercase();
        let wallet_key = (self.lookup)(&format!("WALLET_KEY_{}", suffix))?;
        let db_encryption_key = (self.lookup)(&format!("ENCRYPTION_KEY_{}", suffix))?;
        tracing::debug!(worker = base_name, "using keys from environment");
        Some(WorkerKeys {
            wallet_key,
            db_encryption_key,
        })
    }
}

impl fmt::Debug for KeyCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self
            .keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("KeyCache").field("identities", &count).finish()
    }
}

impl Default for KeyCache {
    fn default() -> Self {
        Self::from_env()
    }
}
