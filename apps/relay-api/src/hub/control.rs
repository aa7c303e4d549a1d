//! Serialized connect/disconnect handling and retention cleanup.
//!
//! Registrations and unregistrations are processed one at a time, so the
//! first/last connection transitions that drive presence are observed in a
//! single order. Each loop iteration handles exactly one of: cancellation,
//! a registration, an unregistration, or a cleanup tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::connection::{Client, ClientHandle};
use super::events::{presence_changed, PresenceStatus};
use super::fanout::Hub;

/// A queued connection plus the signal fired once it is in the registry.
pub(super) struct Registration {
    pub(super) client: Client,
    pub(super) added: oneshot::Sender<()>,
}

pub struct ControlLoop {
    hub: Arc<Hub>,
    register_rx: mpsc::Receiver<Registration>,
    unregister_rx: mpsc::Receiver<ClientHandle>,
}

impl ControlLoop {
    pub(super) fn new(
        hub: Arc<Hub>,
        register_rx: mpsc::Receiver<Registration>,
        unregister_rx: mpsc::Receiver<ClientHandle>,
    ) -> Self {
        Self {
            hub,
            register_rx,
            unregister_rx,
        }
    }

    /// Run until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        let cleanup_enabled = self.hub.config.cleanup_enabled();
        // A zero period panics in `interval_at`; the branch is disabled then anyway.
        let period = self.hub.config.cleanup_interval.max(Duration::from_millis(1));
        let mut cleanup = time::interval_at(Instant::now() + period, period);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);

        if cleanup_enabled {
            self.hub.prune_expired().await;
        }

        tracing::info!(cleanup_enabled, "hub control loop started");
        loop {
            // Registrations drain before unregistrations, so a connection's
            // removal is never processed ahead of its own addition. A sustained
            // burst of registrations holds back unregistrations and cleanup
            // until the register intake is empty.
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(registration) = self.register_rx.recv() => self.on_register(registration),
                Some(handle) = self.unregister_rx.recv() => self.on_unregister(handle),
                _ = cleanup.tick(), if cleanup_enabled => {
                    self.hub.prune_expired().await;
                }
            }
        }
        tracing::info!("hub control loop stopped");
    }

    fn on_register(&self, Registration { client, added }: Registration) {
        let workspace_id = client.workspace_id.clone();
        let user_id = client.user_id.clone();
        let client_id = client.id.clone();

        let first = self.hub.state.write().connections.add(client);
        tracing::info!(%workspace_id, %user_id, %client_id, "client connected");
        // The registering transport may already be gone.
        let _ = added.send(());

        if first {
            tracing::debug!(%workspace_id, %user_id, "user online");
            self.hub.broadcast_to_workspace(
                &workspace_id,
                presence_changed(&user_id, PresenceStatus::Online),
            );
        }
    }

    fn on_unregister(&self, handle: ClientHandle) {
        let removal = self
            .hub
            .state
            .write()
            .connections
            .remove(&handle.workspace_id, &handle.user_id, &handle.id);

        if !removal.found {
            tracing::debug!(client_id = %handle.id, "unregister for unknown client ignored");
            return;
        }
        tracing::info!(
            workspace_id = %handle.workspace_id,
            user_id = %handle.user_id,
            client_id = %handle.id,
            "client disconnected"
        );

        if removal.last_for_user {
            tracing::debug!(
                workspace_id = %handle.workspace_id,
                user_id = %handle.user_id,
                "user offline"
            );
            self.hub.broadcast_to_workspace(
                &handle.workspace_id,
                presence_changed(&handle.user_id, PresenceStatus::Offline),
            );
        }
    }
}
