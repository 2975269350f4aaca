//! Per-key write locks taken by the primary for the duration of a client PUT.
//!
//! A lock is held by exactly one writer at a time and only across the window
//! between acquiring the batch and replying to the client. The manager
//! observes quiescence through [`LockTable::is_idle`] before it moves keys.
use std::collections::HashMap;
use std::sync::Mutex;

use bytes::Bytes;

use crate::error::{Error, Result};

const LOCK_ERR: &str = "Unable to acquire lock table mutex. This should never happen";

#[derive(Debug, Default)]
pub struct LockTable {
    inner: Mutex<HashMap<Bytes, String>>,
}

impl LockTable {
    /// Succeeds iff no holder is registered for the key.
    pub fn try_acquire(&self, key: Bytes, holder: &str) -> Result<bool> {
        let mut guard = self.inner.lock().map_err(|_| Error::Logic {
            reason: LOCK_ERR.to_string(),
        })?;

        if guard.contains_key(&key) {
            return Ok(false);
        }

        guard.insert(key, holder.to_string());
        Ok(true)
    }

    pub fn release(&self, key: &[u8]) -> Result<()> {
        let mut guard = self.inner.lock().map_err(|_| Error::Logic {
            reason: LOCK_ERR.to_string(),
        })?;
        guard.remove(key);
        Ok(())
    }

    pub fn release_many(&self, keys: &[Bytes]) -> Result<()> {
        let mut guard = self.inner.lock().map_err(|_| Error::Logic {
            reason: LOCK_ERR.to_string(),
        })?;
        for key in keys {
            guard.remove(key.as_ref());
        }
        Ok(())
    }

    /// True iff no writer currently holds any lock - the availability signal
    /// reported to the manager.
    pub fn is_idle(&self) -> Result<bool> {
        let guard = self.inner.lock().map_err(|_| Error::Logic {
            reason: LOCK_ERR.to_string(),
        })?;
        Ok(guard.is_empty())
    }
}
