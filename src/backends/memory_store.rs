//! Memory Store - In-Process `DashMap` Backend
//!
//! A `DashMap`-backed [`KeyValueStore`] with per-key expiry and Redis-compatible
//! semantics for every primitive the caching layer uses. It backs local
//! development, tests and benches, and can be switched unavailable to rehearse
//! a store outage.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use tracing::{debug, info};

use crate::error::{CacheError, CacheResult};
use crate::traits::{KeyTtl, KeyValueStore};

#[derive(Debug, Clone)]
enum StoredValue {
    Bytes(Vec<u8>),
    Set(HashSet<String>),
    Hash(HashMap<String, i64>),
    List(VecDeque<String>),
}

impl StoredValue {
    fn approx_size(&self) -> usize {
        match self {
            Self::Bytes(bytes) => bytes.len(),
            Self::Set(set) => set.iter().map(String::len).sum(),
            Self::Hash(hash) => hash.keys().map(|k| k.len() + 8).sum(),
            Self::List(list) => list.iter().map(String::len).sum(),
        }
    }
}

/// Store entry with expiration tracking
#[derive(Debug, Clone)]
struct StoreEntry {
    value: StoredValue,
    expires_at: Option<Instant>,
}

impl StoreEntry {
    fn persistent(value: StoredValue) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn with_ttl(value: StoredValue, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Some(Instant::now() + ttl),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|expires_at| Instant::now() >= expires_at)
    }
}

fn wrong_type() -> CacheError {
    CacheError::Rejected(
        "WRONGTYPE Operation against a key holding the wrong kind of value".to_string(),
    )
}

fn invalid_expire() -> CacheError {
    CacheError::Rejected("ERR invalid expire time".to_string())
}

/// In-process store using `DashMap`
///
/// **Use Case**: tests, benches and single-process development
///
/// **Features**:
/// - Atomic set-if-absent through the `DashMap` entry API
/// - Lazy expiry on access plus [`cleanup_expired`](Self::cleanup_expired)
/// - Outage simulation via [`set_available`](Self::set_available)
/// - Operation counting, to verify that an open circuit never reaches the store
///
/// **Limitations**:
/// - Process-local: locks and counters are not shared between instances
/// - No size limits
///
/// **Example**:
/// ```rust
/// use resilient_cache::backends::MemoryStore;
/// use resilient_cache::traits::KeyValueStore;
/// use std::time::Duration;
///
/// # async fn example() -> anyhow::Result<()> {
/// let store = MemoryStore::new();
/// store.set_ex("user:1:v1", b"{}", Duration::from_secs(60)).await?;
/// assert_eq!(store.get("user:1:v1").await?, Some(b"{}".to_vec()));
/// # Ok(())
/// # }
/// ```
pub struct MemoryStore {
    map: Arc<DashMap<String, StoreEntry>>,
    available: AtomicBool,
    operations: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    peak_memory: AtomicU64,
    started_at: Instant,
}

impl MemoryStore {
    /// Create an empty, available store
    #[must_use]
    pub fn new() -> Self {
        info!("Initializing Memory Store (DashMap)");

        Self {
            map: Arc::new(DashMap::new()),
            available: AtomicBool::new(true),
            operations: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            peak_memory: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`)
    ///
    /// While unavailable every operation fails with [`CacheError::Connection`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        info!(available, "[Memory] Availability changed");
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Number of operations that reached this store, including failed ones
    #[must_use]
    pub fn operations(&self) -> u64 {
        self.operations.load(Ordering::SeqCst)
    }

    /// Remove expired entries, returning how many were dropped
    pub fn cleanup_expired(&self) -> usize {
        let mut removed = 0;
        self.map.retain(|_, entry| {
            if entry.is_expired() {
                removed += 1;
                false
            } else {
                true
            }
        });
        if removed > 0 {
            debug!(count = removed, "[Memory] Cleaned up expired entries");
        }
        removed
    }

    /// Number of stored entries (expired entries not yet cleaned included)
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn check(&self) -> CacheResult<()> {
        self.operations.fetch_add(1, Ordering::SeqCst);
        if self.is_available() {
            Ok(())
        } else {
            Err(CacheError::Connection(
                "memory store is marked unavailable".to_string(),
            ))
        }
    }

    /// Run `f` against a live entry, lazily evicting it if expired
    fn read<R>(&self, key: &str, f: impl FnOnce(&StoreEntry) -> R) -> Option<R> {
        let expired = match self.map.get(key) {
            Some(entry) if !entry.is_expired() => return Some(f(entry.value())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.map.remove_if(key, |_, entry| entry.is_expired());
        }
        None
    }

    /// Mutate the entry under `key`, creating it with `create` when absent or expired
    fn mutate<R>(
        &self,
        key: &str,
        create: impl FnOnce() -> StoredValue,
        f: impl FnOnce(&mut StoreEntry) -> CacheResult<R>,
    ) -> CacheResult<R> {
        match self.map.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(StoreEntry::persistent(create()));
                }
                f(occupied.get_mut())
            }
            MapEntry::Vacant(vacant) => {
                let mut entry = vacant.insert(StoreEntry::persistent(create()));
                f(entry.value_mut())
            }
        }
    }

    fn memory_used(&self) -> u64 {
        let used: usize = self
            .map
            .iter()
            .map(|entry| entry.key().len() + entry.value().value.approx_size())
            .sum();
        let used = u64::try_from(used).unwrap_or(u64::MAX);
        self.peak_memory.fetch_max(used, Ordering::Relaxed);
        used
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Inclusive index range for Redis-style `start`/`stop` over `len` items
fn list_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = isize::try_from(len).unwrap_or(isize::MAX);
    let start = if start < 0 { len + start } else { start }.max(0);
    let stop = if stop < 0 { len + stop } else { stop }.min(len - 1);
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start.unsigned_abs(), stop.unsigned_abs()))
}

/// Glob match with Redis semantics: `*`, `?`, `[abc]`, `[a-z]`, `[^a]`, `\x`
#[allow(clippy::indexing_slicing)]
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern = pattern.as_bytes();
    let text = text.as_bytes();
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() {
            match pattern[p] {
                b'*' => {
                    backtrack = Some((p, t));
                    p += 1;
                    continue;
                }
                b'?' => {
                    p += 1;
                    t += 1;
                    continue;
                }
                b'[' => match match_class(pattern, p, text[t]) {
                    Some((true, next)) => {
                        p = next;
                        t += 1;
                        continue;
                    }
                    Some((false, _)) => {}
                    None => {
                        if text[t] == b'[' {
                            p += 1;
                            t += 1;
                            continue;
                        }
                    }
                },
                b'\\' if p + 1 < pattern.len() => {
                    if pattern[p + 1] == text[t] {
                        p += 2;
                        t += 1;
                        continue;
                    }
                }
                literal => {
                    if literal == text[t] {
                        p += 1;
                        t += 1;
                        continue;
                    }
                }
            }
        }
        match backtrack {
            Some((star_p, star_t)) => {
                p = star_p + 1;
                t = star_t + 1;
                backtrack = Some((star_p, star_t + 1));
            }
            None => return false,
        }
    }

    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }
    p == pattern.len()
}

/// Match `c` against the class opening at `pattern[open]`; `None` if unterminated
fn match_class(pattern: &[u8], open: usize, c: u8) -> Option<(bool, usize)> {
    let mut i = open + 1;
    let negate = pattern.get(i) == Some(&b'^');
    if negate {
        i += 1;
    }
    let mut matched = false;
    loop {
        match pattern.get(i) {
            None => return None,
            Some(b']') => break,
            Some(b'\\') => {
                let literal = *pattern.get(i + 1)?;
                matched |= literal == c;
                i += 2;
            }
            Some(&low) => {
                let is_range = pattern.get(i + 1) == Some(&b'-')
                    && pattern.get(i + 2).is_some_and(|high| *high != b']');
                if is_range {
                    let high = *pattern.get(i + 2)?;
                    matched |= (low..=high).contains(&c);
                    i += 3;
                } else {
                    matched |= low == c;
                    i += 1;
                }
            }
        }
    }
    Some((matched != negate, i + 1))
}

/// INCR on a string entry holding a decimal integer
fn increment(entry: &mut StoreEntry) -> CacheResult<i64> {
    let StoredValue::Bytes(bytes) = &mut entry.value else {
        return Err(wrong_type());
    };
    let current: i64 = std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            CacheError::Rejected("ERR value is not an integer or out of range".to_string())
        })?;
    let next = current
        .checked_add(1)
        .ok_or_else(|| CacheError::Rejected("ERR increment would overflow".to_string()))?;
    *bytes = next.to_string().into_bytes();
    Ok(next)
}

#[allow(clippy::cast_precision_loss)]
fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "K", "M", "G"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    let suffix = UNITS.get(unit).copied().unwrap_or("G");
    if unit == 0 {
        format!("{bytes}{suffix}")
    } else {
        format!("{value:.2}{suffix}")
    }
}

// ===== Trait Implementations =====

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        self.check()?;
        let value = self.read(key, |entry| match &entry.value {
            StoredValue::Bytes(bytes) => Ok(bytes.clone()),
            _ => Err(wrong_type()),
        });
        match value {
            Some(result) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                result.map(Some)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        self.check()?;
        if ttl.is_zero() {
            return Err(invalid_expire());
        }
        self.map.insert(
            key.to_string(),
            StoreEntry::with_ttl(StoredValue::Bytes(value.to_vec()), ttl),
        );
        debug!(key = %key, ttl_ms = %ttl.as_millis(), "[Memory] Stored key with TTL");
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<bool> {
        self.check()?;
        if ttl.is_zero() {
            return Err(invalid_expire());
        }
        let entry = StoreEntry::with_ttl(StoredValue::Bytes(value.to_vec()), ttl);
        match self.map.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(entry);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(entry);
                Ok(true)
            }
        }
    }

    async fn del(&self, keys: &[String]) -> CacheResult<u64> {
        self.check()?;
        let removed = keys
            .iter()
            .filter_map(|key| self.map.remove(key))
            .filter(|(_, entry)| !entry.is_expired())
            .count();
        Ok(u64::try_from(removed).unwrap_or(u64::MAX))
    }

    async fn incr(&self, key: &str) -> CacheResult<i64> {
        self.check()?;
        self.mutate(key, || StoredValue::Bytes(b"0".to_vec()), increment)
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> CacheResult<i64> {
        self.check()?;
        if ttl.is_zero() {
            return Err(invalid_expire());
        }
        self.mutate(
            key,
            || StoredValue::Bytes(b"0".to_vec()),
            |entry| {
                let next = increment(entry)?;
                if entry.expires_at.is_none() {
                    entry.expires_at = Some(Instant::now() + ttl);
                }
                Ok(next)
            },
        )
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool> {
        self.check()?;
        match self.map.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.remove();
                    Ok(false)
                } else if ttl.is_zero() {
                    occupied.remove();
                    Ok(true)
                } else {
                    occupied.get_mut().expires_at = Some(Instant::now() + ttl);
                    Ok(true)
                }
            }
            MapEntry::Vacant(_) => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> CacheResult<KeyTtl> {
        self.check()?;
        let ttl = self.read(key, |entry| match entry.expires_at {
            Some(expires_at) => {
                KeyTtl::Expires(expires_at.saturating_duration_since(Instant::now()))
            }
            None => KeyTtl::Persistent,
        });
        Ok(ttl.unwrap_or(KeyTtl::Missing))
    }

    async fn scan(&self, pattern: &str) -> CacheResult<Vec<String>> {
        self.check()?;
        let keys: Vec<String> = self
            .map
            .iter()
            .filter(|entry| !entry.value().is_expired() && glob_match(pattern, entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        debug!(pattern = %pattern, count = keys.len(), "[Memory] Scanned keys matching pattern");
        Ok(keys)
    }

    async fn sadd(&self, key: &str, members: &[String]) -> CacheResult<u64> {
        self.check()?;
        self.mutate(
            key,
            || StoredValue::Set(HashSet::new()),
            |entry| match &mut entry.value {
                StoredValue::Set(set) => {
                    let added = members
                        .iter()
                        .filter(|member| set.insert((*member).clone()))
                        .count();
                    Ok(u64::try_from(added).unwrap_or(u64::MAX))
                }
                _ => Err(wrong_type()),
            },
        )
    }

    async fn srem(&self, key: &str, member: &str) -> CacheResult<u64> {
        self.check()?;
        match self.map.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.remove();
                    return Ok(0);
                }
                let (removed, now_empty) = match &mut occupied.get_mut().value {
                    StoredValue::Set(set) => (set.remove(member), set.is_empty()),
                    _ => return Err(wrong_type()),
                };
                if now_empty {
                    occupied.remove();
                }
                Ok(u64::from(removed))
            }
            MapEntry::Vacant(_) => Ok(0),
        }
    }

    async fn smembers(&self, key: &str) -> CacheResult<Vec<String>> {
        self.check()?;
        self.read(key, |entry| match &entry.value {
            StoredValue::Set(set) => Ok(set.iter().cloned().collect()),
            _ => Err(wrong_type()),
        })
        .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn scard(&self, key: &str) -> CacheResult<u64> {
        self.check()?;
        self.read(key, |entry| match &entry.value {
            StoredValue::Set(set) => Ok(u64::try_from(set.len()).unwrap_or(u64::MAX)),
            _ => Err(wrong_type()),
        })
        .unwrap_or(Ok(0))
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> CacheResult<i64> {
        self.check()?;
        self.mutate(
            key,
            || StoredValue::Hash(HashMap::new()),
            |entry| match &mut entry.value {
                StoredValue::Hash(hash) => {
                    let counter = hash.entry(field.to_string()).or_insert(0);
                    *counter = counter.saturating_add(delta);
                    Ok(*counter)
                }
                _ => Err(wrong_type()),
            },
        )
    }

    async fn hget_all(&self, key: &str) -> CacheResult<HashMap<String, i64>> {
        self.check()?;
        self.read(key, |entry| match &entry.value {
            StoredValue::Hash(hash) => Ok(hash.clone()),
            _ => Err(wrong_type()),
        })
        .unwrap_or_else(|| Ok(HashMap::new()))
    }

    async fn lpush_trim(&self, key: &str, value: &str, max_len: usize) -> CacheResult<()> {
        self.check()?;
        self.mutate(
            key,
            || StoredValue::List(VecDeque::new()),
            |entry| match &mut entry.value {
                StoredValue::List(list) => {
                    list.push_front(value.to_string());
                    list.truncate(max_len);
                    Ok(())
                }
                _ => Err(wrong_type()),
            },
        )
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> CacheResult<Vec<String>> {
        self.check()?;
        self.read(key, |entry| match &entry.value {
            StoredValue::List(list) => Ok(match list_range(list.len(), start, stop) {
                Some((from, to)) => list
                    .iter()
                    .skip(from)
                    .take(to - from + 1)
                    .cloned()
                    .collect(),
                None => Vec::new(),
            }),
            _ => Err(wrong_type()),
        })
        .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn ping(&self) -> CacheResult<()> {
        self.check()
    }

    async fn info(&self) -> CacheResult<String> {
        self.check()?;
        let used = self.memory_used();
        let peak = self.peak_memory.load(Ordering::Relaxed).max(used);
        let (keys, expires) = self.map.iter().fold((0u64, 0u64), |(keys, expires), entry| {
            if entry.value().is_expired() {
                (keys, expires)
            } else {
                (keys + 1, expires + u64::from(entry.value().expires_at.is_some()))
            }
        });

        let mut info = String::new();
        let _ = write!(
            info,
            "# Server\r\nredis_version:memory-store\r\nuptime_in_seconds:{}\r\n\r\n\
             # Clients\r\nconnected_clients:1\r\n\r\n\
             # Memory\r\nused_memory:{used}\r\nused_memory_human:{}\r\n\
             used_memory_peak:{peak}\r\nused_memory_peak_human:{}\r\n\
             mem_fragmentation_ratio:1.00\r\n\r\n\
             # Stats\r\ntotal_commands_processed:{}\r\ninstantaneous_ops_per_sec:0\r\n\
             keyspace_hits:{}\r\nkeyspace_misses:{}\r\n\r\n\
             # Keyspace\r\n",
            self.started_at.elapsed().as_secs(),
            human_bytes(used),
            human_bytes(peak),
            self.operations(),
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        );
        if keys > 0 {
            let _ = write!(info, "db0:keys={keys},expires={expires},avg_ttl=0\r\n");
        }
        Ok(info)
    }

    fn name(&self) -> &'static str {
        "Memory"
    }
}
