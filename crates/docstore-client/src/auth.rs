//! API key handling.
//!
//! The key is shared between a client and its dispatch workers and may be
//! replaced at any time. Workers read it per task, so a key set after the
//! client was built applies to every task dequeued afterwards.

use std::sync::{Arc, PoisonError, RwLock};

/// Environment variable holding the API key.
pub const API_KEY_ENV: &str = "DOCSTORE_API_KEY";

/// Shared, mutable API key.
///
/// Cloning yields another handle to the same key.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    key: Arc<RwLock<Option<String>>>,
}

impl Credentials {
    /// Credentials holding `key`. An empty key counts as no key.
    pub fn new(key: Option<String>) -> Self {
        Self {
            key: Arc::new(RwLock::new(key.filter(|k| !k.is_empty()))),
        }
    }

    /// Credentials with a fixed key.
    pub fn api_key(key: impl Into<String>) -> Self {
        Self::new(Some(key.into()))
    }

    /// Read the key from `DOCSTORE_API_KEY`, falling back to none.
    pub fn from_env() -> Self {
        Self::new(std::env::var(API_KEY_ENV).ok())
    }

    /// Current key, if any.
    pub fn get(&self) -> Option<String> {
        self.key
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the key. `None` or an empty string clears it.
    pub fn set(&self, key: Option<String>) {
        *self.key.write().unwrap_or_else(PoisonError::into_inner) = key.filter(|k| !k.is_empty());
    }

    /// Check if a key is configured.
    pub fn is_authenticated(&self) -> bool {
        self.key
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}
