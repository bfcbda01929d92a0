//! Token storage.
//!
//! A token is an opaque bearer string that stands in for a full
//! [`ConnectionDescriptor`]. Each record carries its own expiry, and every
//! read checks it, so a token stops resolving the moment it expires even if
//! the background reaper has not reclaimed it yet.
//!
//! ```text
//!  ABSENT ──put──> VALID ──time──> EXPIRED ──reaper / delete──> ABSENT
//!                    │  ▲
//!                    └──┘ extend (same token string)
//! ```
//!
//! There is no way back from EXPIRED or ABSENT to VALID for the same token
//! string; callers mint a new token instead.

use crate::session::descriptor::{ConnectionDescriptor, Digest};
use crate::session::error::SessionError;
use crate::session::reaper::{ReaperConfig, TokenReaper};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// TTL applied when a caller passes a zero TTL.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(3600);

/// Longest lifetime a token may be given (30 days).
pub const MAX_TOKEN_TTL: Duration = Duration::from_secs(30 * 24 * 3600);

/// Random bytes appended to each token (hex encoded: 32 characters).
const TOKEN_RANDOM_BYTES: usize = 16;

/// One stored token.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenRecord {
    pub token: String,
    pub descriptor: ConnectionDescriptor,
    pub created_at: SystemTime,
    pub expires_at: SystemTime,
}

impl TokenRecord {
    /// Valid iff `now < expires_at`.
    pub fn is_valid_at(&self, now: SystemTime) -> bool {
        now < self.expires_at
    }

    pub fn expires_at_unix(&self) -> u64 {
        unix_seconds(self.expires_at)
    }
}

/// Management view of one record. The token is cut down to its identity
/// prefix and the credential is left out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenSummary {
    pub token: String,
    pub address: String,
    pub namespace: i64,
    pub created_at: u64,
    pub expires_at: u64,
    pub valid: bool,
}

impl TokenSummary {
    fn of(record: &TokenRecord, now: SystemTime) -> Self {
        let prefix = record.token.split('_').next().unwrap_or_default();
        Self {
            token: format!("{prefix}_..."),
            address: record.descriptor.address(),
            namespace: record.descriptor.namespace(),
            created_at: unix_seconds(record.created_at),
            expires_at: record.expires_at_unix(),
            valid: record.is_valid_at(now),
        }
    }
}

/// Counts over all stored records at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenStats {
    pub total: usize,
    pub valid: usize,
    pub expired: usize,
}

/// Maps bearer tokens to descriptors with expiry.
///
/// The in-memory store is the reference implementation. A durable store
/// (an external cache, say) must keep the same TTL semantics: `put`
/// overwrites, a zero TTL means [`DEFAULT_TOKEN_TTL`], a TTL above
/// [`MAX_TOKEN_TTL`] is rejected with [`SessionError::InvalidTtl`], reads
/// treat `now >= expires_at` as expired, and deletes are idempotent.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Descriptor for a valid token.
    async fn get(&self, token: &str) -> Result<ConnectionDescriptor, SessionError>;

    /// Stores `descriptor` under `token`, replacing any existing record.
    async fn put(
        &self,
        token: &str,
        descriptor: ConnectionDescriptor,
        ttl: Duration,
    ) -> Result<TokenRecord, SessionError>;

    /// Sets `expires_at = now + ttl` on a token that is still valid.
    async fn extend(&self, token: &str, ttl: Duration) -> Result<SystemTime, SessionError>;

    /// Removes a token. Absent tokens are not an error.
    async fn delete(&self, token: &str) -> Result<(), SessionError>;

    async fn is_valid(&self, token: &str) -> bool;

    /// Full record including timestamps, whether or not it has expired.
    async fn record(&self, token: &str) -> Result<TokenRecord, SessionError>;

    /// Redacted view of every stored record, soonest expiry first.
    async fn list(&self) -> Vec<TokenSummary>;

    async fn stats(&self) -> TokenStats;

    /// Stops background work. Further calls are no-ops.
    async fn close(&self);
}

/// Shared map behind [`MemoryTokenStore`], also swept by the reaper.
#[derive(Debug, Default)]
pub(crate) struct TokenTable {
    records: RwLock<HashMap<String, TokenRecord>>,
    reaped: AtomicU64,
}

impl TokenTable {
    /// Deletes every record with `now >= expires_at`. Returns how many.
    pub(crate) fn purge_expired(&self) -> usize {
        let now = SystemTime::now();
        let removed = {
            let mut records = self.records.write();
            let before = records.len();
            records.retain(|_, record| record.is_valid_at(now));
            before - records.len()
        };
        self.reaped.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    pub(crate) fn len(&self) -> usize {
        self.records.read().len()
    }
}

/// In-memory [`TokenStore`] with a periodic reaper.
///
/// # Example
///
/// ```
/// use kvgate::session::{ConnectionDescriptor, MemoryTokenStore, TokenStore};
/// use std::time::Duration;
///
/// # tokio_test::block_on(async {
/// let store = MemoryTokenStore::without_reaper();
/// let descriptor = ConnectionDescriptor::new("localhost", 6379);
/// store.put("t1", descriptor.clone(), Duration::from_secs(60)).await.unwrap();
/// assert_eq!(store.get("t1").await.unwrap(), descriptor);
/// # });
/// ```
#[derive(Debug)]
pub struct MemoryTokenStore {
    table: Arc<TokenTable>,
    default_ttl: Duration,
    reaper: Mutex<Option<TokenReaper>>,
}

impl MemoryTokenStore {
    /// Creates the store and starts its reaper on the current Tokio runtime.
    pub fn new(config: ReaperConfig) -> Self {
        let table = Arc::new(TokenTable::default());
        let reaper = TokenReaper::start(Arc::clone(&table), config);
        Self {
            table,
            default_ttl: DEFAULT_TOKEN_TTL,
            reaper: Mutex::new(Some(reaper)),
        }
    }

    /// Creates a store that only expires lazily. Memory is never reclaimed
    /// for tokens that are not deleted, so this is meant for tests and tools.
    pub fn without_reaper() -> Self {
        Self {
            table: Arc::new(TokenTable::default()),
            default_ttl: DEFAULT_TOKEN_TTL,
            reaper: Mutex::new(None),
        }
    }

    /// Overrides the TTL substituted for zero TTLs, capped at
    /// [`MAX_TOKEN_TTL`].
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        if !ttl.is_zero() {
            self.default_ttl = ttl.min(MAX_TOKEN_TTL);
        }
        self
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Number of stored records, valid or not.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records removed by the reaper so far.
    pub fn reaped(&self) -> u64 {
        self.table.reaped.load(Ordering::Relaxed)
    }

    pub fn reaper_running(&self) -> bool {
        self.reaper
            .lock()
            .as_ref()
            .map(TokenReaper::is_running)
            .unwrap_or(false)
    }

    /// Runs one sweep immediately.
    pub fn purge_expired(&self) -> usize {
        self.table.purge_expired()
    }

    fn expiry_after(&self, now: SystemTime, ttl: Duration) -> Result<SystemTime, SessionError> {
        let ttl = if ttl.is_zero() { self.default_ttl } else { ttl };
        let invalid = || SessionError::InvalidTtl {
            ttl,
            max: MAX_TOKEN_TTL,
        };
        if ttl > MAX_TOKEN_TTL {
            return Err(invalid());
        }
        now.checked_add(ttl).ok_or_else(invalid)
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn get(&self, token: &str) -> Result<ConnectionDescriptor, SessionError> {
        let records = self.table.records.read();
        match records.get(token) {
            None => Err(SessionError::TokenNotFound),
            Some(record) if !record.is_valid_at(SystemTime::now()) => {
                Err(SessionError::TokenExpired)
            }
            Some(record) => Ok(record.descriptor.clone()),
        }
    }

    async fn put(
        &self,
        token: &str,
        descriptor: ConnectionDescriptor,
        ttl: Duration,
    ) -> Result<TokenRecord, SessionError> {
        let now = SystemTime::now();
        let record = TokenRecord {
            token: token.to_string(),
            descriptor,
            created_at: now,
            expires_at: self.expiry_after(now, ttl)?,
        };

        let replaced = self
            .table
            .records
            .write()
            .insert(token.to_string(), record.clone())
            .is_some();
        debug!(replaced, expires_at = record.expires_at_unix(), "Token stored");
        Ok(record)
    }

    async fn extend(&self, token: &str, ttl: Duration) -> Result<SystemTime, SessionError> {
        let mut records = self.table.records.write();
        let record = records.get_mut(token).ok_or(SessionError::TokenNotFound)?;

        let now = SystemTime::now();
        if !record.is_valid_at(now) {
            return Err(SessionError::TokenExpired);
        }
        record.expires_at = self.expiry_after(now, ttl)?;
        Ok(record.expires_at)
    }

    async fn delete(&self, token: &str) -> Result<(), SessionError> {
        self.table.records.write().remove(token);
        Ok(())
    }

    async fn is_valid(&self, token: &str) -> bool {
        self.table
            .records
            .read()
            .get(token)
            .map(|record| record.is_valid_at(SystemTime::now()))
            .unwrap_or(false)
    }

    async fn record(&self, token: &str) -> Result<TokenRecord, SessionError> {
        self.table
            .records
            .read()
            .get(token)
            .cloned()
            .ok_or(SessionError::TokenNotFound)
    }

    async fn list(&self) -> Vec<TokenSummary> {
        let now = SystemTime::now();
        let mut summaries: Vec<TokenSummary> = self
            .table
            .records
            .read()
            .values()
            .map(|record| TokenSummary::of(record, now))
            .collect();
        summaries.sort_by_key(|summary| summary.expires_at);
        summaries
    }

    async fn stats(&self) -> TokenStats {
        let now = SystemTime::now();
        let records = self.table.records.read();
        let valid = records.values().filter(|r| r.is_valid_at(now)).count();
        TokenStats {
            total: records.len(),
            valid,
            expired: records.len() - valid,
        }
    }

    async fn close(&self) {
        let reaper = self.reaper.lock().take();
        if let Some(reaper) = reaper {
            reaper.shutdown().await;
            info!("Token store closed");
        }
    }
}

/// Source of unpredictable bytes for token suffixes.
pub trait RandomSource: Send + Sync {
    fn fill_bytes(&self, dest: &mut [u8]);
}

/// Operating system CSPRNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn fill_bytes(&self, dest: &mut [u8]) {
        rand::rngs::OsRng.fill_bytes(dest);
    }
}

/// `<8 hex chars of identity>_<32 random hex chars>`.
pub fn generate_token(identity: &Digest, random: &dyn RandomSource) -> String {
    let mut suffix = [0u8; TOKEN_RANDOM_BYTES];
    random.fill_bytes(&mut suffix);
    format!("{}_{}", identity.short(), hex::encode(suffix))
}

pub(crate) fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn descriptor(db: i64) -> ConnectionDescriptor {
        ConnectionDescriptor::new("localhost", 6379).with_namespace(db)
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let store = MemoryTokenStore::without_reaper();
        assert_ok!(store.put("t", descriptor(0), Duration::from_secs(60)).await);

        let found = assert_ok!(store.get("t").await);
        assert_eq!(found.namespace(), 0);
        assert!(store.is_valid("t").await);
    }

    #[tokio::test]
    async fn test_token_expires_on_read_without_reaper() {
        let store = MemoryTokenStore::without_reaper();
        store
            .put("short", descriptor(0), Duration::from_millis(50))
            .await
            .unwrap();
        assert!(store.is_valid("short").await);

        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(!store.is_valid("short").await);
        assert_eq!(store.get("short").await, Err(SessionError::TokenExpired));
        // Still physically present until a sweep.
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_invalidates_before_expiry() {
        let store = MemoryTokenStore::without_reaper();
        store
            .put("t", descriptor(0), Duration::from_secs(3600))
            .await
            .unwrap();

        assert_ok!(store.delete("t").await);
        assert!(!store.is_valid("t").await);
        assert_eq!(store.get("t").await, Err(SessionError::TokenNotFound));
    }

    #[tokio::test]
    async fn test_delete_absent_token_is_a_no_op() {
        let store = MemoryTokenStore::without_reaper();
        assert_ok!(store.delete("never-issued").await);
        assert_ok!(store.delete("never-issued").await);
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let store = MemoryTokenStore::without_reaper();
        store
            .put("t", descriptor(0), Duration::from_secs(60))
            .await
            .unwrap();
        store
            .put("t", descriptor(5), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(store.get("t").await.unwrap().namespace(), 5);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_zero_ttl_uses_default() {
        let store = MemoryTokenStore::without_reaper();
        let record = store.put("t", descriptor(0), Duration::ZERO).await.unwrap();
        let ttl = record.expires_at.duration_since(record.created_at).unwrap();
        assert_eq!(ttl, DEFAULT_TOKEN_TTL);

        let store = MemoryTokenStore::without_reaper().with_default_ttl(Duration::from_secs(10));
        let record = store.put("t", descriptor(0), Duration::ZERO).await.unwrap();
        let ttl = record.expires_at.duration_since(record.created_at).unwrap();
        assert_eq!(ttl, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_extend_keeps_token_and_moves_expiry() {
        let store = MemoryTokenStore::without_reaper();
        let record = store
            .put("t", descriptor(0), Duration::from_millis(100))
            .await
            .unwrap();

        let new_expiry = assert_ok!(store.extend("t", Duration::from_secs(7200)).await);
        assert!(new_expiry > record.expires_at);
        let remaining = new_expiry.duration_since(SystemTime::now()).unwrap();
        assert!(remaining > Duration::from_secs(7190));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(store.is_valid("t").await);
    }

    #[tokio::test]
    async fn test_extend_never_resurrects() {
        let store = MemoryTokenStore::without_reaper();
        store
            .put("t", descriptor(0), Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            store.extend("t", Duration::from_secs(60)).await,
            Err(SessionError::TokenExpired)
        );
        assert_eq!(store.get("t").await, Err(SessionError::TokenExpired));
        assert_eq!(
            store.extend("missing", Duration::from_secs(60)).await,
            Err(SessionError::TokenNotFound)
        );
    }

    #[tokio::test]
    async fn test_stats_and_manual_purge() {
        let store = MemoryTokenStore::without_reaper();
        store
            .put("live", descriptor(0), Duration::from_secs(60))
            .await
            .unwrap();
        store
            .put("dead", descriptor(1), Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(
            store.stats().await,
            TokenStats {
                total: 2,
                valid: 1,
                expired: 1
            }
        );

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.stats().await.total, 1);
        assert_eq!(store.reaped(), 1);
    }

    #[tokio::test]
    async fn test_record_exposes_timestamps() {
        let store = MemoryTokenStore::without_reaper();
        store
            .put("t", descriptor(0), Duration::from_secs(60))
            .await
            .unwrap();
        let record = assert_ok!(store.record("t").await);
        assert_eq!(record.token, "t");
        assert!(record.expires_at > record.created_at);
        assert_err!(store.record("nope").await);
    }

    #[tokio::test]
    async fn test_ttl_above_maximum_is_rejected() {
        let store = MemoryTokenStore::without_reaper();

        let err = assert_err!(store.put("t", descriptor(0), Duration::MAX).await);
        assert_eq!(err.code(), "INVALIDTTL");
        let err = assert_err!(
            store
                .put("t", descriptor(0), MAX_TOKEN_TTL + Duration::from_secs(1))
                .await
        );
        assert_eq!(err.code(), "INVALIDTTL");
        assert!(store.is_empty());

        let record = assert_ok!(store.put("t", descriptor(0), MAX_TOKEN_TTL).await);
        let ttl = record.expires_at.duration_since(record.created_at).unwrap();
        assert_eq!(ttl, MAX_TOKEN_TTL);
    }

    #[tokio::test]
    async fn test_extend_above_maximum_keeps_old_expiry() {
        let store = MemoryTokenStore::without_reaper();
        let record = store
            .put("t", descriptor(0), Duration::from_secs(60))
            .await
            .unwrap();

        let err = assert_err!(store.extend("t", Duration::from_secs(i64::MAX as u64)).await);
        assert!(matches!(err, SessionError::InvalidTtl { .. }));
        assert_eq!(store.record("t").await.unwrap().expires_at, record.expires_at);
        assert!(store.is_valid("t").await);
    }

    #[tokio::test]
    async fn test_default_ttl_is_capped() {
        let store = MemoryTokenStore::without_reaper().with_default_ttl(Duration::MAX);
        assert_eq!(store.default_ttl(), MAX_TOKEN_TTL);

        let record = assert_ok!(store.put("t", descriptor(0), Duration::ZERO).await);
        let ttl = record.expires_at.duration_since(record.created_at).unwrap();
        assert_eq!(ttl, MAX_TOKEN_TTL);
    }

    #[tokio::test]
    async fn test_list_is_redacted_and_ordered() {
        let store = MemoryTokenStore::without_reaper();
        let secret = descriptor(2).with_credential("hunter2");
        store
            .put("abcd1234_late", secret, Duration::from_secs(600))
            .await
            .unwrap();
        store
            .put("ffff0000_soon", descriptor(0), Duration::from_secs(60))
            .await
            .unwrap();

        let listed = store.list().await;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].token, "ffff0000_...");
        assert_eq!(listed[1].token, "abcd1234_...");
        assert_eq!(listed[1].namespace, 2);
        assert_eq!(listed[1].address, "localhost:6379");
        assert!(listed.iter().all(|summary| summary.valid));

        let json = serde_json::to_string(&listed).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(!json.contains("late"));
    }

    struct FixedRandom(u8);

    impl RandomSource for FixedRandom {
        fn fill_bytes(&self, dest: &mut [u8]) {
            dest.fill(self.0);
        }
    }

    #[test]
    fn test_token_format() {
        let identity = descriptor(0).identity();
        let token = generate_token(&identity, &FixedRandom(0xab));
        let (prefix, suffix) = token.split_once('_').unwrap();
        assert_eq!(prefix, identity.short());
        assert_eq!(suffix, "ab".repeat(16));
    }

    #[test]
    fn test_os_random_tokens_differ() {
        let identity = descriptor(0).identity();
        let a = generate_token(&identity, &OsRandom);
        let b = generate_token(&identity, &OsRandom);
        assert_ne!(a, b);
        assert_eq!(a.len(), 8 + 1 + 32);
        assert!(a[..8] == b[..8]);
    }
}
