//! Keyed persistence for race records.
//!
//! The store is deliberately dumb: it keeps encoded records with a TTL and
//! a version, and offers a compare-and-swap primitive. Serializing
//! read-modify-write per pin is the session manager's job.

use crate::error::StoreError;
use crate::race::Race;
use async_trait::async_trait;
use log::debug;
use shared::Pin;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// A record together with the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Swap {
    Committed(u64),
    Conflict,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, pin: &Pin) -> Result<Option<Versioned<Race>>, StoreError>;

    /// Unconditional write. Returns the new version.
    async fn put(&self, pin: &Pin, race: &Race, ttl: Duration) -> Result<u64, StoreError>;

    /// Returns whether a record was removed.
    async fn delete(&self, pin: &Pin) -> Result<bool, StoreError>;

    async fn exists(&self, pin: &Pin) -> Result<bool, StoreError>;

    /// Writes `next` (or deletes when `None`) only if the stored version
    /// still equals `expected`. `expected == None` requires the pin to be
    /// absent.
    async fn compare_and_swap(
        &self,
        pin: &Pin,
        expected: Option<u64>,
        next: Option<&Race>,
        ttl: Duration,
    ) -> Result<Swap, StoreError>;
}

#[derive(Debug)]
struct Entry {
    bytes: Vec<u8>,
    version: u64,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug)]
struct Inner {
    entries: HashMap<Pin, Entry>,
    next_version: u64,
    last_sweep: Instant,
}

impl Inner {
    fn live(&self, pin: &Pin, now: Instant) -> Option<&Entry> {
        self.entries.get(pin).filter(|e| e.is_live(now))
    }

    fn write(
        &mut self,
        pin: &Pin,
        race: &Race,
        ttl: Duration,
        now: Instant,
    ) -> Result<u64, StoreError> {
        let bytes = bincode::serialize(race)?;
        self.next_version += 1;
        let version = self.next_version;
        self.entries.insert(
            pin.clone(),
            Entry {
                bytes,
                version,
                expires_at: now + ttl,
            },
        );
        self.maybe_sweep(now);
        Ok(version)
    }

    fn maybe_sweep(&mut self, now: Instant) {
        if now.duration_since(self.last_sweep) < SWEEP_INTERVAL {
            return;
        }
        self.last_sweep = now;
        let before = self.entries.len();
        self.entries.retain(|_, e| e.is_live(now));
        let swept = before - self.entries.len();
        if swept > 0 {
            debug!("Swept {} expired race records", swept);
        }
    }
}

/// In-process store. Records are held encoded, the way an external cache
/// would hold them, so no caller ever shares a live reference to a race.
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                next_version: 0,
                last_sweep: Instant::now(),
            }),
        }
    }

    /// Number of live records.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let inner = self.inner.lock().await;
        inner.entries.values().filter(|e| e.is_live(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn get(&self, pin: &Pin) -> Result<Option<Versioned<Race>>, StoreError> {
        let now = Instant::now();
        let inner = self.inner.lock().await;
        match inner.live(pin, now) {
            Some(entry) => Ok(Some(Versioned {
                version: entry.version,
                value: bincode::deserialize(&entry.bytes)?,
            })),
            None => Ok(None),
        }
    }

    async fn put(&self, pin: &Pin, race: &Race, ttl: Duration) -> Result<u64, StoreError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        inner.write(pin, race, ttl, now)
    }

    async fn delete(&self, pin: &Pin) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        Ok(inner
            .entries
            .remove(pin)
            .map(|e| e.is_live(now))
            .unwrap_or(false))
    }

    async fn exists(&self, pin: &Pin) -> Result<bool, StoreError> {
        let now = Instant::now();
        let inner = self.inner.lock().await;
        Ok(inner.live(pin, now).is_some())
    }

    async fn compare_and_swap(
        &self,
        pin: &Pin,
        expected: Option<u64>,
        next: Option<&Race>,
        ttl: Duration,
    ) -> Result<Swap, StoreError> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;

        let current = inner.live(pin, now).map(|e| e.version);
        if current != expected {
            return Ok(Swap::Conflict);
        }

        match next {
            Some(race) => Ok(Swap::Committed(inner.write(pin, race, ttl, now)?)),
            None => {
                inner.entries.remove(pin);
                Ok(Swap::Committed(0))
            }
        }
    }
}
