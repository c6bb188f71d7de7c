//! In-memory token store.
//!
//! Tokens map to an immutable [`TokenRecord`] until they expire. Expiry is
//! checked on every lookup; the periodic sweep only reclaims memory. Expired
//! tokens leave a tombstone behind so they keep answering "expired" instead of
//! "not found" for a while after eviction.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};

/// Hex characters kept from the digest: 128 bits.
const TOKEN_HEX_LEN: usize = 32;

/// Random component mixed into every token.
pub trait EntropySource: Send + Sync {
    fn random_bytes(&self) -> [u8; 16];
}

/// OS randomness via UUID v4.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidEntropy;

impl EntropySource for UuidEntropy {
    fn random_bytes(&self) -> [u8; 16] {
        *Uuid::new_v4().as_bytes()
    }
}

/// Everything a token is bound to at mint time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTarget {
    pub resolved_url: String,
    pub title: String,
    pub default_container: String,
    /// Encoding id to container extension, for every encoding resolved.
    pub containers: HashMap<String, String>,
    /// Preset selector (`best`, `bestaudio`, `bestvideo`) to the encoding id
    /// it was pinned to at resolution time.
    pub presets: HashMap<String, String>,
}

impl DownloadTarget {
    pub fn new(
        resolved_url: impl Into<String>,
        title: impl Into<String>,
        default_container: impl Into<String>,
    ) -> Self {
        Self {
            resolved_url: resolved_url.into(),
            title: title.into(),
            default_container: default_container.into(),
            containers: HashMap::new(),
            presets: HashMap::new(),
        }
    }
}

#[derive(Debug)]
pub struct TokenRecord {
    pub target: DownloadTarget,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TokenRecord {
    pub fn has_encoding(&self, id: &str) -> bool {
        self.target.containers.contains_key(id)
    }

    pub fn pinned_encoding(&self, preset: &str) -> Option<&str> {
        self.target.presets.get(preset).map(String::as_str)
    }

    /// Container for `selector`, falling back to the default one.
    pub fn container_for(&self, selector: &str) -> &str {
        self.target
            .containers
            .get(selector)
            .map(String::as_str)
            .unwrap_or(&self.target.default_container)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MintedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum Lookup {
    Live(Arc<TokenRecord>),
    Expired,
    NotFound,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub tombstones_dropped: usize,
}

#[derive(Default)]
struct Entries {
    live: HashMap<String, Arc<TokenRecord>>,
    /// token -> instant it expired
    tombstones: HashMap<String, DateTime<Utc>>,
}

pub struct TokenStore {
    entries: Mutex<Entries>,
    ttl: TimeDelta,
    tombstone_retention: TimeDelta,
    sequence: AtomicU64,
    clock: Arc<dyn Clock>,
    entropy: Arc<dyn EntropySource>,
}

impl TokenStore {
    pub fn new(ttl: Duration, tombstone_retention: Duration) -> Self {
        Self::with_parts(
            ttl,
            tombstone_retention,
            Arc::new(SystemClock),
            Arc::new(UuidEntropy),
        )
    }

    pub fn with_parts(
        ttl: Duration,
        tombstone_retention: Duration,
        clock: Arc<dyn Clock>,
        entropy: Arc<dyn EntropySource>,
    ) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            ttl: to_delta(ttl),
            tombstone_retention: to_delta(tombstone_retention),
            sequence: AtomicU64::new(0),
            clock,
            entropy,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn mint(&self, target: DownloadTarget) -> MintedToken {
        let now = self.clock.now();
        let expires_at = now
            .checked_add_signed(self.ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let record = Arc::new(TokenRecord {
            target,
            created_at: now,
            expires_at,
        });

        loop {
            let token = self.generate_token(now);
            let mut entries = self.entries.lock();
            if entries.live.contains_key(&token) || entries.tombstones.contains_key(&token) {
                drop(entries);
                warn!(token = %token_label(&token), "token collision, regenerating");
                continue;
            }
            entries.live.insert(token.clone(), Arc::clone(&record));
            drop(entries);

            debug!(token = %token_label(&token), %expires_at, "minted token");
            return MintedToken { token, expires_at };
        }
    }

    pub fn lookup(&self, token: &str) -> Lookup {
        let now = self.clock.now();
        let mut guard = self.entries.lock();
        let entries = &mut *guard;

        if let Some(record) = entries.live.get(token) {
            if now < record.expires_at {
                return Lookup::Live(Arc::clone(record));
            }
            let expired_at = record.expires_at;
            entries.live.remove(token);
            entries.tombstones.insert(token.to_string(), expired_at);
            return Lookup::Expired;
        }

        if entries.tombstones.contains_key(token) {
            Lookup::Expired
        } else {
            Lookup::NotFound
        }
    }

    /// Evicts every record with `expires_at <= now` and forgets tombstones
    /// older than the retention window.
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut guard = self.entries.lock();
        let entries = &mut *guard;
        let tombstones = &mut entries.tombstones;

        let mut expired = 0;
        entries.live.retain(|token, record| {
            if record.expires_at <= now {
                tombstones.insert(token.clone(), record.expires_at);
                expired += 1;
                false
            } else {
                true
            }
        });

        let before = tombstones.len();
        let retention = self.tombstone_retention;
        tombstones.retain(|_, expired_at| {
            expired_at
                .checked_add_signed(retention)
                .is_none_or(|forget_at| forget_at > now)
        });

        SweepReport {
            expired,
            tombstones_dropped: before - tombstones.len(),
        }
    }

    pub fn sweep_expired(&self) -> SweepReport {
        self.sweep(self.clock.now())
    }

    /// Records still physically held, expired or not.
    pub fn live_len(&self) -> usize {
        self.entries.lock().live.len()
    }

    pub fn tombstone_len(&self) -> usize {
        self.entries.lock().tombstones.len()
    }

    fn generate_token(&self, now: DateTime<Utc>) -> String {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let mut hasher = Sha256::new();
        hasher.update(self.entropy.random_bytes());
        hasher.update(now.timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
        hasher.update(sequence.to_le_bytes());
        let digest = hasher.finalize();

        let mut token = format!("{digest:x}");
        token.truncate(TOKEN_HEX_LEN);
        token
    }
}

/// Short prefix that is safe to put in logs.
pub fn token_label(token: &str) -> &str {
    token.get(..8).unwrap_or(token)
}

fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}
