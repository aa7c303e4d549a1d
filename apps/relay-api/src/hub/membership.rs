//! Channel membership cache used to scope channel broadcasts.
//!
//! Entries are loaded lazily from a [`MembershipSource`] and never expire.
//! Once loaded, a channel's member set is only changed through
//! [`MembershipCache::add`], [`MembershipCache::remove`] and
//! [`MembershipCache::replace`], which the owning domain code calls whenever
//! someone joins, leaves or is banned from a channel.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use diesel::prelude::*;
use parking_lot::Mutex;

use crate::db::pool::DbPool;
use crate::db::schema::channel_memberships;
use crate::error::HubError;

pub type MemberSet = Arc<HashSet<String>>;

/// Durable source of channel membership, consulted on a cache miss.
#[async_trait]
pub trait MembershipSource: Send + Sync {
    async fn channel_members(&self, channel_id: &str) -> Result<HashSet<String>, HubError>;
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// In-memory membership snapshots keyed by channel ID.
///
/// Not synchronized on its own; the hub keeps it behind the same
/// reader/writer lock as the connection registry.
#[derive(Debug, Default)]
pub struct MembershipCache {
    channels: HashMap<String, MemberSet>,
    /// Bumped on every explicit mutation. A lazy load started at one epoch
    /// is only cached if the epoch is unchanged when it completes.
    epoch: u64,
}

impl MembershipCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, channel_id: &str) -> Option<MemberSet> {
        self.channels.get(channel_id).cloned()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Cache a lazily loaded set unless the cache was mutated while the load
    /// was in flight. Returns the set the caller should use.
    pub fn insert_loaded(&mut self, channel_id: &str, loaded: HashSet<String>, seen_epoch: u64) -> MemberSet {
        if let Some(existing) = self.channels.get(channel_id) {
            return existing.clone();
        }
        let loaded = Arc::new(loaded);
        if self.epoch == seen_epoch {
            self.channels.insert(channel_id.to_string(), loaded.clone());
        }
        loaded
    }

    pub fn add(&mut self, channel_id: &str, user_id: &str) {
        self.epoch += 1;
        let members = self.channels.entry(channel_id.to_string()).or_default();
        Arc::make_mut(members).insert(user_id.to_string());
    }

    pub fn remove(&mut self, channel_id: &str, user_id: &str) {
        self.epoch += 1;
        if let Some(members) = self.channels.get_mut(channel_id) {
            Arc::make_mut(members).remove(user_id);
        }
    }

    pub fn replace(&mut self, channel_id: &str, user_ids: HashSet<String>) {
        self.epoch += 1;
        self.channels.insert(channel_id.to_string(), Arc::new(user_ids));
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Postgres source
// ---------------------------------------------------------------------------

/// Reads membership from the `channel_memberships` table.
pub struct PgMembershipSource {
    pool: DbPool,
}

impl PgMembershipSource {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MembershipSource for PgMembershipSource {
    async fn channel_members(&self, channel_id: &str) -> Result<HashSet<String>, HubError> {
        let mut conn = self.pool.get().await?;
        let user_ids: Vec<String> = diesel_async::RunQueryDsl::load(
            channel_memberships::table
                .filter(channel_memberships::channel_id.eq(channel_id))
                .select(channel_memberships::user_id),
            &mut conn,
        )
        .await?;
        Ok(user_ids.into_iter().collect())
    }
}

// ---------------------------------------------------------------------------
// In-memory source (for database-less runs / tests)
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryMembershipSource {
    channels: Mutex<HashMap<String, HashSet<String>>>,
    failing: Mutex<HashSet<String>>,
    loads: Mutex<usize>,
}

impl MemoryMembershipSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_members<I, S>(&self, channel_id: &str, user_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channels
            .lock()
            .insert(channel_id.to_string(), user_ids.into_iter().map(Into::into).collect());
    }

    /// Make loads for `channel_id` fail, simulating an unavailable database.
    pub fn fail_channel(&self, channel_id: &str) {
        self.failing.lock().insert(channel_id.to_string());
    }

    /// Number of loads served so far.
    pub fn load_count(&self) -> usize {
        *self.loads.lock()
    }
}

#[async_trait]
impl MembershipSource for MemoryMembershipSource {
    async fn channel_members(&self, channel_id: &str) -> Result<HashSet<String>, HubError> {
        *self.loads.lock() += 1;
        if self.failing.lock().contains(channel_id) {
            return Err(HubError::Unavailable(format!(
                "membership for {channel_id} unavailable"
            )));
        }
        Ok(self
            .channels
            .lock()
            .get(channel_id)
            .cloned()
            .unwrap_or_default())
    }
}
