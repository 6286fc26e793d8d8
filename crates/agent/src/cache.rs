//! Result cache shared by every conversation on this runtime. Entries keep
//! their own expiry so per-tool TTLs apply; moka bounds the size.

use std::time::Duration;

use chrono::{DateTime, Utc};
use clerk_core::domain::conversation::CachedResult;
use clerk_core::domain::tool::{Fingerprint, ToolResult};
use moka::future::Cache;

#[derive(Clone)]
pub struct ResultCache {
    entries: Cache<Fingerprint, CachedResult>,
}

impl ResultCache {
    /// `max_ttl` is the longest TTL any tool declares.
    pub fn new(max_entries: u64, max_ttl: Duration) -> Self {
        let entries = Cache::builder().max_capacity(max_entries).time_to_live(max_ttl).build();
        Self { entries }
    }

    pub async fn get(&self, fingerprint: &Fingerprint, now: DateTime<Utc>) -> Option<ToolResult> {
        let entry = self.entries.get(fingerprint).await?;
        if entry.is_live(now) {
            return Some(entry.result);
        }
        self.entries.invalidate(fingerprint).await;
        None
    }

    /// Stores fresh successes only.
    pub async fn put(
        &self,
        fingerprint: Fingerprint,
        result: &ToolResult,
        ttl: chrono::Duration,
        now: DateTime<Utc>,
    ) {
        if !result.is_ok() || result.from_cache || ttl <= chrono::Duration::zero() {
            return;
        }
        let entry = CachedResult { result: result.clone(), expires_at: now + ttl };
        self.entries.insert(fingerprint, entry).await;
    }
}
