//! Broadcast router and the producer/transport-facing hub API.
//!
//! Broadcasts may be called concurrently from any task. They take the shared
//! read lock, enqueue onto each matching connection without waiting, and
//! hand the persisted copy to the replay log writer.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use parking_lot::RwLock;
use relay_common::SortableIdGenerator;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::HubConfig;
use crate::error::HubError;
use crate::metrics::EVENTS_BROADCAST_TOTAL;

use super::connection::{Client, ClientHandle};
use super::control::{ControlLoop, Registration};
use super::events::Event;
use super::membership::{MemberSet, MembershipCache, MembershipSource};
use super::registry::{ConnectionRegistry, DeliveryStats};
use super::store::{EventLog, EventStore, EventWriter};

/// Breadth of a broadcast, used as the metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Workspace,
    Channel,
    User,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Workspace => "workspace",
            Scope::Channel => "channel",
            Scope::User => "user",
        }
    }
}

/// State guarded by the hub's single reader/writer lock.
#[derive(Default)]
pub(super) struct HubState {
    pub(super) connections: ConnectionRegistry,
    pub(super) channels: MembershipCache,
}

/// The in-process event distribution hub.
pub struct Hub {
    pub(super) state: RwLock<HubState>,
    log: EventLog,
    members: Arc<dyn MembershipSource>,
    ids: SortableIdGenerator,
    register_tx: mpsc::Sender<Registration>,
    unregister_tx: mpsc::Sender<ClientHandle>,
    pub(super) config: HubConfig,
}

impl Hub {
    /// Build the hub plus the two tasks that must run for it to work: the
    /// control loop (connect/disconnect + retention) and the replay log writer.
    pub fn new(
        config: HubConfig,
        store: Arc<dyn EventStore>,
        members: Arc<dyn MembershipSource>,
    ) -> (Arc<Self>, ControlLoop, EventWriter) {
        let (register_tx, register_rx) = mpsc::channel(config.intake_capacity.max(1));
        let (unregister_tx, unregister_rx) = mpsc::channel(config.intake_capacity.max(1));
        let (log, writer) = EventLog::new(store, config.persist_queue_capacity);

        let hub = Arc::new(Self {
            state: RwLock::new(HubState::default()),
            log,
            members,
            ids: SortableIdGenerator::new(),
            register_tx,
            unregister_tx,
            config,
        });
        let control = ControlLoop::new(hub.clone(), register_rx, unregister_rx);
        (hub, control, writer)
    }

    /// Build the hub and spawn its tasks. Both stop when `cancel` fires.
    pub fn start(
        config: HubConfig,
        store: Arc<dyn EventStore>,
        members: Arc<dyn MembershipSource>,
        cancel: &CancellationToken,
    ) -> Arc<Self> {
        let (hub, control, writer) = Self::new(config, store, members);
        tokio::spawn(writer.run(cancel.clone()));
        tokio::spawn(control.run(cancel.clone()));
        hub
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Broadcasts
    // -----------------------------------------------------------------------

    /// Persist and deliver to every connection in the workspace.
    /// Returns the event's ID.
    pub fn broadcast_to_workspace(&self, workspace_id: &str, event: Event) -> String {
        let event = self.stamp(event, Scope::Workspace);
        self.log.persist(workspace_id, &event);

        let stats = self.state.read().connections.deliver_to_workspace(workspace_id, &event);
        trace_delivery(Scope::Workspace, workspace_id, &event, stats);
        event.id
    }

    /// Persist and deliver to the workspace connections of the channel's members.
    /// Returns the event's ID.
    pub async fn broadcast_to_channel(&self, workspace_id: &str, channel_id: &str, event: Event) -> String {
        let event = self.stamp(event, Scope::Channel);
        self.log.persist(workspace_id, &event);

        let members = self.channel_members(channel_id).await;
        let stats = self.state.read().connections.deliver_where(
            workspace_id,
            |user_id| members.contains(user_id),
            &event,
        );
        trace_delivery(Scope::Channel, workspace_id, &event, stats);
        event.id
    }

    /// Deliver to one user's connections. Not persisted: personal events are
    /// never replayed workspace-wide. Returns the event's ID.
    pub fn broadcast_to_user(&self, workspace_id: &str, user_id: &str, event: Event) -> String {
        let event = self.stamp(event, Scope::User);

        let stats = self
            .state
            .read()
            .connections
            .deliver_to_user(workspace_id, user_id, &event);
        trace_delivery(Scope::User, workspace_id, &event, stats);
        event.id
    }

    fn stamp(&self, mut event: Event, scope: Scope) -> Event {
        if !event.has_id() {
            event.id = self.ids.generate();
        }
        counter!(EVENTS_BROADCAST_TOTAL, "scope" => scope.as_str()).increment(1);
        event
    }

    // -----------------------------------------------------------------------
    // Channel membership
    // -----------------------------------------------------------------------

    /// Members allowed to receive the channel's events.
    ///
    /// Loaded from the membership source on first use. A failed load yields
    /// an empty set for this call and is not cached.
    pub async fn channel_members(&self, channel_id: &str) -> MemberSet {
        let epoch = {
            let state = self.state.read();
            if let Some(members) = state.channels.get(channel_id) {
                return members;
            }
            state.channels.epoch()
        };

        match self.members.channel_members(channel_id).await {
            Ok(loaded) => self
                .state
                .write()
                .channels
                .insert_loaded(channel_id, loaded, epoch),
            Err(err) => {
                tracing::warn!(%err, channel_id, "failed to load channel members");
                MemberSet::default()
            }
        }
    }

    pub fn add_channel_member(&self, channel_id: &str, user_id: &str) {
        self.state.write().channels.add(channel_id, user_id);
    }

    pub fn remove_channel_member(&self, channel_id: &str, user_id: &str) {
        self.state.write().channels.remove(channel_id, user_id);
    }

    pub fn replace_channel_members<I, S>(&self, channel_id: &str, user_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let members: HashSet<String> = user_ids.into_iter().map(Into::into).collect();
        self.state.write().channels.replace(channel_id, members);
    }

    // -----------------------------------------------------------------------
    // Presence and connections
    // -----------------------------------------------------------------------

    /// A user is online iff they hold at least one live connection.
    pub fn is_user_online(&self, workspace_id: &str, user_id: &str) -> bool {
        self.state
            .read()
            .connections
            .user_connection_count(workspace_id, user_id)
            > 0
    }

    pub fn connected_user_ids(&self, workspace_id: &str) -> Vec<String> {
        self.state.read().connections.connected_user_ids(workspace_id)
    }

    pub fn connection_count(&self) -> usize {
        self.state.read().connections.connection_count()
    }

    /// Force every connection of the user in the workspace to terminate.
    ///
    /// Only signals the transports; each one then unregisters normally, which
    /// is where the offline transition is detected.
    pub fn disconnect_user_clients(&self, workspace_id: &str, user_id: &str) {
        let tokens = self
            .state
            .read()
            .connections
            .user_disconnect_tokens(workspace_id, user_id);

        tracing::info!(
            workspace_id,
            user_id,
            connections = tokens.len(),
            "forcing user clients to disconnect"
        );
        for token in tokens {
            token.cancel();
        }
    }

    // -----------------------------------------------------------------------
    // Transport-facing
    // -----------------------------------------------------------------------

    /// Hand a new connection to the control loop and wait until it is in
    /// the registry. Every broadcast after this returns reaches the client.
    pub async fn register(&self, client: Client) -> Result<(), HubError> {
        let (added, ready) = oneshot::channel();
        self.register_tx
            .send(Registration { client, added })
            .await
            .map_err(|_| HubError::Stopped)?;
        ready.await.map_err(|_| HubError::Stopped)
    }

    /// Queue a connection's removal for the control loop.
    pub async fn unregister(&self, handle: ClientHandle) -> Result<(), HubError> {
        self.unregister_tx
            .send(handle)
            .await
            .map_err(|_| HubError::Stopped)
    }

    /// Persisted events after `last_event_id`, ascending, capped at the
    /// replay page size.
    pub async fn get_events_since(&self, workspace_id: &str, last_event_id: &str) -> Result<Vec<Event>, HubError> {
        self.log
            .store()
            .events_since(workspace_id, last_event_id, self.config.replay_page_size)
            .await
            .inspect_err(|err| {
                tracing::error!(%err, workspace_id, last_event_id, "replay read failed");
            })
    }

    /// Delete replay log entries older than the retention window.
    /// Returns the number of events deleted.
    pub async fn prune_expired(&self) -> usize {
        if self.config.event_retention.is_zero() {
            return 0;
        }
        let Some(cutoff) = chrono::Duration::from_std(self.config.event_retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        else {
            tracing::warn!(retention = ?self.config.event_retention, "retention window out of range");
            return 0;
        };

        match self.log.store().delete_before(cutoff).await {
            Ok(deleted) => {
                if deleted > 0 {
                    tracing::debug!(deleted, "event cleanup complete");
                }
                deleted
            }
            Err(err) => {
                tracing::error!(%err, "event cleanup failed");
                0
            }
        }
    }
}

fn trace_delivery(scope: Scope, workspace_id: &str, event: &Event, stats: DeliveryStats) {
    tracing::trace!(
        scope = scope.as_str(),
        workspace_id,
        event_id = %event.id,
        kind = %event.kind,
        queued = stats.queued,
        dropped = stats.dropped,
        "event broadcast"
    );
}
