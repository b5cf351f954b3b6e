//! Download slots: a cap on concurrent large transfers.
//!
//! A device must hold a slot before it starts pulling a bundle. Slots carry a
//! TTL; expired slots are reaped lazily on the next acquire, so a device that
//! disappears mid-download cannot pin a slot forever. Devices that finish
//! early release their token explicitly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use crate::error::DomainError;

const DEFAULT_CAPACITY: usize = 10;
const DEFAULT_TTL_SECS: u64 = 3600;

#[derive(Debug)]
struct Slot {
    device_id: String,
    expires_at: Instant,
}

#[derive(Clone, Debug, Serialize)]
pub struct SlotGrant {
    pub token: String,
    pub ttl_secs: u64,
}

#[derive(Debug)]
pub struct DownloadSlots {
    capacity: usize,
    ttl: Duration,
    counter: AtomicU64,
    inner: Mutex<HashMap<String, Slot>>,
}

impl DownloadSlots {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl,
            counter: AtomicU64::new(0),
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_env() -> Self {
        let capacity = std::env::var("FAB_DOWNLOAD_SLOTS")
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(DEFAULT_CAPACITY);
        let ttl_secs = std::env::var("FAB_DOWNLOAD_SLOT_TTL_SECS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(DEFAULT_TTL_SECS);
        Self::new(capacity, Duration::from_secs(ttl_secs.max(1)))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.inner.lock().expect("slot table lock").len()
    }

    pub fn acquire(&self, device_id: &str) -> Result<SlotGrant, DomainError> {
        let now = Instant::now();
        let mut table = self.inner.lock().expect("slot table lock");
        table.retain(|token, slot| {
            let live = slot.expires_at > now;
            if !live {
                debug!(target: "fab::slots", token, device = %slot.device_id, "slot expired");
            }
            live
        });
        if table.len() >= self.capacity {
            return Err(DomainError::SlotsExhausted);
        }
        let token = format!("slot-{:08x}", self.counter.fetch_add(1, Ordering::Relaxed));
        table.insert(
            token.clone(),
            Slot {
                device_id: device_id.to_string(),
                expires_at: now + self.ttl,
            },
        );
        debug!(target: "fab::slots", token, device = device_id, in_use = table.len(), "slot granted");
        Ok(SlotGrant {
            token,
            ttl_secs: self.ttl.as_secs(),
        })
    }

    pub fn release(&self, token: &str) -> Result<(), DomainError> {
        let mut table = self.inner.lock().expect("slot table lock");
        table
            .remove(token)
            .map(|_| ())
            .ok_or_else(|| DomainError::UnknownSlot(token.to_string()))
    }
}
