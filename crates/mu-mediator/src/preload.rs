//! Bounded look-ahead cache of enhancement results.
//!
//! Bounded three ways: entry age (TTL), entry count and total bytes.  Every
//! read and write runs an eviction sweep first, so an expired entry is never
//! returned and both capacity bounds hold after every call.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use mu_proto::config::CacheConfig;
use mu_proto::params::TransformParams;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::debug;

/// Deterministic key over (resolved locator, scale, quality tier, format).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(locator: &str, params: &TransformParams) -> Self {
        let params = params.normalized();
        let mut hasher = Sha256::new();
        hasher.update(locator.as_bytes());
        hasher.update(b"\0");
        hasher.update(
            format!(
                "x{}|{}|{}",
                params.scale,
                params.quality.as_str(),
                params.format.as_str()
            )
            .as_bytes(),
        );
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0[..12])
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub bytes: Bytes,
    pub content_type: String,
    pub model: String,
    pub byte_length: usize,
    pub created_at: Instant,
    pub last_used_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

pub struct PreloadCache {
    max_entries: usize,
    max_bytes: usize,
    ttl: Duration,
    entries: HashMap<CacheKey, CacheEntry>,
    total_bytes: usize,
    stats: CacheStats,
}

impl PreloadCache {
    pub fn new(max_entries: usize, max_bytes: usize, ttl: Duration) -> Self {
        Self {
            max_entries,
            max_bytes,
            ttl,
            entries: HashMap::new(),
            total_bytes: 0,
            stats: CacheStats::default(),
        }
    }

    pub fn from_config(cfg: &CacheConfig) -> Self {
        Self::new(cfg.max_entries, cfg.max_bytes, cfg.ttl())
    }

    pub fn get(&mut self, key: &CacheKey) -> Option<&CacheEntry> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&mut self, key: &CacheKey, now: Instant) -> Option<&CacheEntry> {
        self.evict_at(now);
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.last_used_at = now;
                self.stats.hits += 1;
                Some(&*entry)
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Presence check without touching recency or stats.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.contains_at(key, Instant::now())
    }

    pub fn contains_at(&self, key: &CacheKey, now: Instant) -> bool {
        self.entries
            .get(key)
            .map_or(false, |e| now.duration_since(e.created_at) < self.ttl)
    }

    pub fn put(&mut self, key: CacheKey, bytes: Bytes, content_type: &str, model: &str) {
        self.put_at(key, bytes, content_type, model, Instant::now())
    }

    pub fn put_at(
        &mut self,
        key: CacheKey,
        bytes: Bytes,
        content_type: &str,
        model: &str,
        now: Instant,
    ) {
        if let Some(old) = self.entries.remove(&key) {
            self.total_bytes -= old.byte_length;
        }
        let byte_length = bytes.len();
        self.entries.insert(
            key.clone(),
            CacheEntry {
                bytes,
                content_type: content_type.to_string(),
                model: model.to_string(),
                byte_length,
                created_at: now,
                last_used_at: now,
            },
        );
        self.total_bytes += byte_length;
        debug!("preload cache: put {} ({} bytes)", key, byte_length);
        self.evict_at(now);
    }

    pub fn evict(&mut self) {
        self.evict_at(Instant::now())
    }

    /// Drop expired entries, then least-recently-used ones (oldest
    /// `created_at` on ties) until both capacity bounds hold.
    pub fn evict_at(&mut self, now: Instant) {
        let ttl = self.ttl;
        let expired: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.created_at) >= ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            self.remove(&key);
        }

        while self.entries.len() > self.max_entries || self.total_bytes > self.max_bytes {
            let victim = self
                .entries
                .iter()
                .min_by_key(|(_, e)| (e.last_used_at, e.created_at))
                .map(|(k, _)| k.clone());
            match victim {
                Some(key) => {
                    debug!("preload cache: evict {}", key);
                    self.remove(&key);
                }
                None => break,
            }
        }
    }

    fn remove(&mut self, key: &CacheKey) {
        if let Some(entry) = self.entries.remove(key) {
            self.total_bytes -= entry.byte_length;
            self.stats.evictions += 1;
        }
    }

    /// Drop one entry, e.g. a result the display side could not decode.
    pub fn invalidate(&mut self, key: &CacheKey) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.total_bytes -= entry.byte_length;
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.total_bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            total_bytes: self.total_bytes,
            ..self.stats
        }
    }
}
