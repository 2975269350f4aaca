//! Key/value storage engine seam.
//!
//! Keys and values are opaque bytes and are not interpreted in any way by
//! [`StorageEngine`] implementations. The batched operations exist because
//! the manager reads, writes and deletes keys in `(source, dest)` batches
//! while rebalancing.
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{Error, Result};

#[async_trait]
pub trait StorageEngine: Debug + Send + Sync {
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>>;
    async fn put(&self, key: Bytes, value: Bytes) -> Result<()>;
    /// Batched read; the result order matches the requested key order.
    async fn multi_get(&self, keys: &[Bytes]) -> Result<Vec<Option<Bytes>>>;
    async fn delete(&self, key: &[u8]) -> Result<()>;
    async fn delete_many(&self, keys: &[Bytes]) -> Result<()>;
    async fn keys(&self) -> Result<Vec<Bytes>>;
}

const LOCK_ERR: &str = "Unable to acquire storage engine lock. This should never happen";

/// The only engine currently implemented: a mutex-guarded hash map.
#[derive(Clone, Debug, Default)]
pub struct InMemory {
    inner: Arc<Mutex<HashMap<Bytes, Bytes>>>,
}

#[async_trait]
impl StorageEngine for InMemory {
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        if let Ok(guard) = self.inner.lock() {
            Ok(guard.get(key).map(Clone::clone))
        } else {
            Err(Error::Logic {
                reason: LOCK_ERR.to_string(),
            })
        }
    }

    async fn put(&self, key: Bytes, value: Bytes) -> Result<()> {
        if let Ok(mut guard) = self.inner.lock() {
            guard
                .entry(key)
                .and_modify(|e| *e = value.clone())
                .or_insert(value);
            Ok(())
        } else {
            Err(Error::Logic {
                reason: LOCK_ERR.to_string(),
            })
        }
    }

    async fn multi_get(&self, keys: &[Bytes]) -> Result<Vec<Option<Bytes>>> {
        if let Ok(guard) = self.inner.lock() {
            Ok(keys
                .iter()
                .map(|key| guard.get(key.as_ref()).map(Clone::clone))
                .collect())
        } else {
            Err(Error::Logic {
                reason: LOCK_ERR.to_string(),
            })
        }
    }

    async fn delete(&self, key: &[u8]) -> Result<()> {
        if let Ok(mut guard) = self.inner.lock() {
            guard.remove(key);
            Ok(())
        } else {
            Err(Error::Logic {
                reason: LOCK_ERR.to_string(),
            })
        }
    }

    async fn delete_many(&self, keys: &[Bytes]) -> Result<()> {
        if let Ok(mut guard) = self.inner.lock() {
            for key in keys {
                guard.remove(key.as_ref());
            }
            Ok(())
        } else {
            Err(Error::Logic {
                reason: LOCK_ERR.to_string(),
            })
        }
    }

    async fn keys(&self) -> Result<Vec<Bytes>> {
        if let Ok(guard) = self.inner.lock() {
            Ok(guard.keys().map(Clone::clone).collect())
        } else {
            Err(Error::Logic {
                reason: LOCK_ERR.to_string(),
            })
        }
    }
}
