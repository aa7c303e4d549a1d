//! Replay log: persisted copies of broadcast events for reconnect catch-up.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::db::pool::DbPool;
use crate::db::schema::workspace_events;
use crate::error::HubError;
use crate::metrics::EVENTS_PERSIST_DROPPED_TOTAL;
use crate::models::workspace_event::{NewWorkspaceEvent, WorkspaceEvent};

use super::events::Event;

/// Storage for the replay log.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert one event, keyed by workspace and sortable ID. A repeated key
    /// keeps the first copy.
    async fn persist(&self, workspace_id: &str, event: &Event) -> Result<(), HubError>;

    /// Events for the workspace with ID strictly greater than `since_id`,
    /// ascending, at most `limit` of them.
    async fn events_since(
        &self,
        workspace_id: &str,
        since_id: &str,
        limit: usize,
    ) -> Result<Vec<Event>, HubError>;

    /// Delete every event created before `cutoff`. Returns the number deleted.
    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<usize, HubError>;
}

// ---------------------------------------------------------------------------
// Postgres implementation
// ---------------------------------------------------------------------------

pub struct PgEventStore {
    pool: DbPool,
}

impl PgEventStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn persist(&self, workspace_id: &str, event: &Event) -> Result<(), HubError> {
        let mut conn = self.pool.get().await?;
        let row = NewWorkspaceEvent {
            id: &event.id,
            workspace_id,
            event_type: event.kind.as_str(),
            payload: &event.data,
            created_at: Utc::now(),
        };
        let inserted = diesel_async::RunQueryDsl::execute(
            diesel::insert_into(workspace_events::table)
                .values(&row)
                .on_conflict_do_nothing(),
            &mut conn,
        )
        .await?;
        if inserted == 0 {
            tracing::warn!(
                workspace_id,
                event_id = %event.id,
                "event ID already in the workspace's replay log, copy ignored"
            );
        }
        Ok(())
    }

    async fn events_since(
        &self,
        workspace_id: &str,
        since_id: &str,
        limit: usize,
    ) -> Result<Vec<Event>, HubError> {
        let mut conn = self.pool.get().await?;
        let rows: Vec<WorkspaceEvent> = diesel_async::RunQueryDsl::load(
            workspace_events::table
                .filter(workspace_events::workspace_id.eq(workspace_id))
                .filter(workspace_events::id.gt(since_id))
                .order(workspace_events::id.asc())
                .limit(i64::try_from(limit).unwrap_or(i64::MAX))
                .select(WorkspaceEvent::as_select()),
            &mut conn,
        )
        .await?;

        Ok(rows.into_iter().filter_map(WorkspaceEvent::into_event).collect())
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<usize, HubError> {
        let mut conn = self.pool.get().await?;
        let deleted = diesel_async::RunQueryDsl::execute(
            diesel::delete(workspace_events::table.filter(workspace_events::created_at.lt(cutoff))),
            &mut conn,
        )
        .await?;
        Ok(deleted)
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation (for database-less runs / tests)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StoredEvent {
    event: Event,
    created_at: DateTime<Utc>,
}

/// Ordered in-memory replay log keyed by `(workspace_id, event_id)`.
#[derive(Default)]
pub struct MemoryEventStore {
    events: Mutex<BTreeMap<(String, String), StoredEvent>>,
    fail_reads: Mutex<bool>,
    fail_persists: Mutex<bool>,
    persist_failures: AtomicUsize,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert with an explicit creation time, e.g. to backdate an event.
    pub fn insert_at(&self, workspace_id: &str, event: Event, created_at: DateTime<Utc>) {
        self.events.lock().insert(
            (workspace_id.to_string(), event.id.clone()),
            StoredEvent { event, created_at },
        );
    }

    /// Make `events_since` fail, simulating an unavailable database.
    pub fn fail_reads(&self, fail: bool) {
        *self.fail_reads.lock() = fail;
    }

    /// Make `persist` fail, simulating a write error.
    pub fn fail_persists(&self, fail: bool) {
        *self.fail_persists.lock() = fail;
    }

    /// Number of `persist` calls rejected by [`fail_persists`](Self::fail_persists).
    pub fn persist_failures(&self) -> usize {
        self.persist_failures.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn contains(&self, workspace_id: &str, event_id: &str) -> bool {
        self.events
            .lock()
            .contains_key(&(workspace_id.to_string(), event_id.to_string()))
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn persist(&self, workspace_id: &str, event: &Event) -> Result<(), HubError> {
        if *self.fail_persists.lock() {
            self.persist_failures.fetch_add(1, Ordering::SeqCst);
            return Err(HubError::Unavailable("replay log write failed".to_string()));
        }
        self.events
            .lock()
            .entry((workspace_id.to_string(), event.id.clone()))
            .or_insert_with(|| StoredEvent {
                event: event.clone(),
                created_at: Utc::now(),
            });
        Ok(())
    }

    async fn events_since(
        &self,
        workspace_id: &str,
        since_id: &str,
        limit: usize,
    ) -> Result<Vec<Event>, HubError> {
        if *self.fail_reads.lock() {
            return Err(HubError::Unavailable("replay log unavailable".to_string()));
        }
        let events = self.events.lock();
        Ok(events
            .range((workspace_id.to_string(), since_id.to_string())..)
            .take_while(|((ws, _), _)| ws == workspace_id)
            .filter(|((_, id), _)| id.as_str() > since_id)
            .take(limit)
            .map(|(_, stored)| stored.event.clone())
            .collect())
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<usize, HubError> {
        let mut events = self.events.lock();
        let before = events.len();
        events.retain(|_, stored| stored.created_at >= cutoff);
        Ok(before - events.len())
    }
}

// ---------------------------------------------------------------------------
// Asynchronous writer
// ---------------------------------------------------------------------------

type PendingEvent = (String, Event);

/// Front of the replay log used on the broadcast path.
///
/// `persist` only enqueues; a separate [`EventWriter`] task performs the
/// store I/O, so broadcasts never wait on the database.
#[derive(Clone)]
pub struct EventLog {
    store: Arc<dyn EventStore>,
    pending: mpsc::Sender<PendingEvent>,
}

impl EventLog {
    pub fn new(store: Arc<dyn EventStore>, capacity: usize) -> (Self, EventWriter) {
        let (pending, rx) = mpsc::channel(capacity.max(1));
        let writer = EventWriter {
            store: store.clone(),
            rx,
        };
        (Self { store, pending }, writer)
    }

    /// Queue a persisted copy. Best effort: a full backlog drops the copy.
    pub fn persist(&self, workspace_id: &str, event: &Event) {
        match self.pending.try_send((workspace_id.to_string(), event.clone())) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                counter!(EVENTS_PERSIST_DROPPED_TOTAL).increment(1);
                tracing::warn!(
                    workspace_id,
                    event_id = %event.id,
                    "replay log backlog full, persisted copy dropped"
                );
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(
                    workspace_id,
                    event_id = %event.id,
                    "replay log writer stopped, persisted copy dropped"
                );
            }
        }
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }
}

/// Task draining the persistence queue into the store.
pub struct EventWriter {
    store: Arc<dyn EventStore>,
    rx: mpsc::Receiver<PendingEvent>,
}

impl EventWriter {
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = self.rx.recv() => {
                    let Some((workspace_id, event)) = next else { break };
                    if let Err(err) = self.store.persist(&workspace_id, &event).await {
                        tracing::error!(
                            %err,
                            workspace_id = %workspace_id,
                            event_id = %event.id,
                            "failed to persist event for replay"
                        );
                    }
                }
            }
        }
        tracing::debug!("replay log writer stopped");
    }
}
