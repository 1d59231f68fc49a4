use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};

use crate::error::{Result, StoreError};

// ============================================================================
// Single-Flight Initialization
// ============================================================================
//
// Concurrent map of lazily initialized values. For each key at most one
// initializer runs at a time; concurrent callers wait for it. A failed or
// timed-out initializer leaves the slot empty so the next caller retries.
// Values are never invalidated.
//
// ============================================================================

pub struct SingleFlight<V> {
    slots: Mutex<HashMap<String, Arc<OnceCell<V>>>>,
    timeout: Duration,
}

impl<V: Clone> SingleFlight<V> {
    pub fn new(timeout: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    pub async fn get_or_try_init<F, Fut>(&self, key: &str, init: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let slot = {
            let mut slots = self.slots.lock().await;
            slots.entry(key.to_string()).or_default().clone()
        };

        if let Some(value) = slot.get() {
            return Ok(value.clone());
        }

        match tokio::time::timeout(self.timeout, slot.get_or_try_init(init)).await {
            Ok(result) => result.cloned(),
            Err(_) => {
                tracing::error!(
                    key = %key,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Timed out waiting for initialization"
                );
                Err(StoreError::GateTimeout {
                    key: key.to_string(),
                    timeout_ms: self.timeout.as_millis(),
                })
            }
        }
    }

    /// Number of keys with an initialized value.
    pub async fn initialized(&self) -> usize {
        let slots = self.slots.lock().await;
        slots.values().filter(|slot| slot.initialized()).count()
    }
}
