//! Per-key async mutual exclusion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Hands out one async mutex per key. Holders of different keys never
/// contend; holders of the same key are serialized in FIFO order.
#[derive(Default)]
pub struct KeyedLocks {
    slots: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
            // Drop slots nobody holds or waits on.
            if slots.len() > 1024 {
                slots.retain(|_, m| Arc::strong_count(m) > 1);
            }
            Arc::clone(slots.entry(key.to_string()).or_default())
        };
        slot.lock_owned().await
    }
}
