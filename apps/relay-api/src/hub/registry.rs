//! Live connection registry, indexed workspace → user → connections.

use std::collections::HashMap;

use metrics::{counter, gauge};
use tokio_util::sync::CancellationToken;

use crate::metrics::{CONNECTIONS_ACTIVE, EVENTS_DROPPED_TOTAL};

use super::connection::{Client, Delivery};
use super::events::Event;

/// Result of removing a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Removal {
    /// The connection was registered and is now gone.
    pub found: bool,
    /// The user has no connections left in the workspace.
    pub last_for_user: bool,
}

/// Per-broadcast delivery tally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeliveryStats {
    pub queued: usize,
    pub dropped: usize,
}

impl DeliveryStats {
    fn record(&mut self, outcome: Delivery) {
        match outcome {
            Delivery::Queued => self.queued += 1,
            Delivery::Dropped => self.dropped += 1,
            Delivery::Closed => {}
        }
    }
}

/// Two-level map of live connections.
///
/// Not synchronized on its own; the hub keeps it behind the same
/// reader/writer lock as the membership cache.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    workspaces: HashMap<String, HashMap<String, Vec<Client>>>,
    active: usize,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a connection. Returns `true` if it is the user's first in the
    /// workspace.
    pub fn add(&mut self, client: Client) -> bool {
        let clients = self
            .workspaces
            .entry(client.workspace_id.clone())
            .or_default()
            .entry(client.user_id.clone())
            .or_default();
        let is_first = clients.is_empty();
        clients.push(client);

        self.active += 1;
        gauge!(CONNECTIONS_ACTIVE).increment(1.0);
        is_first
    }

    /// Remove the connection with `client_id` from its user's list.
    ///
    /// The removed `Client` is dropped here, which closes its outbound queue.
    /// Empty user lists and empty workspaces are pruned.
    pub fn remove(&mut self, workspace_id: &str, user_id: &str, client_id: &str) -> Removal {
        let Some(workspace) = self.workspaces.get_mut(workspace_id) else {
            return Removal::default();
        };

        let mut removal = Removal::default();
        if let Some(clients) = workspace.get_mut(user_id) {
            if let Some(pos) = clients.iter().position(|c| c.id == client_id) {
                drop(clients.remove(pos));
                removal.found = true;
            }
            if clients.is_empty() {
                workspace.remove(user_id);
                removal.last_for_user = removal.found;
            }
        }
        if workspace.is_empty() {
            self.workspaces.remove(workspace_id);
        }

        if removal.found {
            self.active -= 1;
            gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
        }
        removal
    }

    /// Deliver to every connection in the workspace.
    pub fn deliver_to_workspace(&self, workspace_id: &str, event: &Event) -> DeliveryStats {
        self.deliver_where(workspace_id, |_| true, event)
    }

    /// Deliver to every connection in the workspace whose user passes `include`.
    pub fn deliver_where(
        &self,
        workspace_id: &str,
        include: impl Fn(&str) -> bool,
        event: &Event,
    ) -> DeliveryStats {
        let mut stats = DeliveryStats::default();
        if let Some(workspace) = self.workspaces.get(workspace_id) {
            for (user_id, clients) in workspace {
                if !include(user_id) {
                    continue;
                }
                for client in clients {
                    stats.record(deliver(client, event));
                }
            }
        }
        stats
    }

    /// Deliver to all of one user's connections in the workspace.
    pub fn deliver_to_user(&self, workspace_id: &str, user_id: &str, event: &Event) -> DeliveryStats {
        let mut stats = DeliveryStats::default();
        if let Some(clients) = self
            .workspaces
            .get(workspace_id)
            .and_then(|w| w.get(user_id))
        {
            for client in clients {
                stats.record(deliver(client, event));
            }
        }
        stats
    }

    pub fn user_connection_count(&self, workspace_id: &str, user_id: &str) -> usize {
        self.workspaces
            .get(workspace_id)
            .and_then(|w| w.get(user_id))
            .map_or(0, Vec::len)
    }

    /// Users with at least one live connection in the workspace.
    pub fn connected_user_ids(&self, workspace_id: &str) -> Vec<String> {
        self.workspaces
            .get(workspace_id)
            .map(|w| w.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Cancellation tokens of a user's connections, for forced disconnect.
    pub fn user_disconnect_tokens(&self, workspace_id: &str, user_id: &str) -> Vec<CancellationToken> {
        self.workspaces
            .get(workspace_id)
            .and_then(|w| w.get(user_id))
            .map(|clients| clients.iter().map(Client::done_token).collect())
            .unwrap_or_default()
    }

    pub fn connection_count(&self) -> usize {
        self.active
    }

    pub fn workspace_count(&self) -> usize {
        self.workspaces.len()
    }
}

fn deliver(client: &Client, event: &Event) -> Delivery {
    let outcome = client.try_deliver(event);
    if outcome == Delivery::Dropped {
        counter!(EVENTS_DROPPED_TOTAL).increment(1);
        tracing::debug!(
            client_id = %client.id,
            user_id = %client.user_id,
            event_id = %event.id,
            "client buffer full, event dropped"
        );
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::events::EventKind;
    use tokio::sync::mpsc;

    fn client(workspace: &str, user: &str) -> (Client, mpsc::Receiver<Event>) {
        Client::new(workspace, user, 8)
    }

    fn event() -> Event {
        Event::with_id("01H000", EventKind::MessageNew, serde_json::json!({}))
    }

    #[test]
    fn add_reports_first_connection_only() {
        let mut reg = ConnectionRegistry::new();
        let (a, _ra) = client("w1", "u1");
        let (b, _rb) = client("w1", "u1");

        assert!(reg.add(a));
        assert!(!reg.add(b));
        assert_eq!(reg.user_connection_count("w1", "u1"), 2);
        assert_eq!(reg.connection_count(), 2);
    }

    #[test]
    fn first_connection_is_per_workspace() {
        let mut reg = ConnectionRegistry::new();
        let (a, _ra) = client("w1", "u1");
        let (b, _rb) = client("w2", "u1");

        assert!(reg.add(a));
        assert!(reg.add(b));
    }

    #[test]
    fn remove_reports_last_connection_only() {
        let mut reg = ConnectionRegistry::new();
        let (a, _ra) = client("w1", "u1");
        let (b, _rb) = client("w1", "u1");
        let (a_id, b_id) = (a.id.clone(), b.id.clone());
        reg.add(a);
        reg.add(b);

        let first = reg.remove("w1", "u1", &a_id);
        assert_eq!(first, Removal { found: true, last_for_user: false });

        let second = reg.remove("w1", "u1", &b_id);
        assert_eq!(second, Removal { found: true, last_for_user: true });
        assert_eq!(reg.user_connection_count("w1", "u1"), 0);
    }

    #[test]
    fn remove_prunes_empty_workspaces() {
        let mut reg = ConnectionRegistry::new();
        let (a, _ra) = client("w1", "u1");
        let a_id = a.id.clone();
        reg.add(a);
        assert_eq!(reg.workspace_count(), 1);

        reg.remove("w1", "u1", &a_id);
        assert_eq!(reg.workspace_count(), 0);
        assert!(reg.connected_user_ids("w1").is_empty());
    }

    #[test]
    fn remove_unknown_connection_is_a_no_op() {
        let mut reg = ConnectionRegistry::new();
        let (a, _ra) = client("w1", "u1");
        reg.add(a);

        assert_eq!(reg.remove("w1", "u1", "conn_bogus"), Removal::default());
        assert_eq!(reg.remove("w9", "u1", "conn_bogus"), Removal::default());
        assert_eq!(reg.connection_count(), 1);
    }

    #[test]
    fn double_remove_reports_last_once() {
        let mut reg = ConnectionRegistry::new();
        let (a, _ra) = client("w1", "u1");
        let a_id = a.id.clone();
        reg.add(a);

        assert!(reg.remove("w1", "u1", &a_id).last_for_user);
        assert!(!reg.remove("w1", "u1", &a_id).last_for_user);
        assert_eq!(reg.connection_count(), 0);
    }

    #[test]
    fn remove_closes_the_outbound_queue() {
        let mut reg = ConnectionRegistry::new();
        let (a, mut ra) = client("w1", "u1");
        let a_id = a.id.clone();
        reg.add(a);
        reg.remove("w1", "u1", &a_id);

        assert_eq!(
            ra.try_recv().unwrap_err(),
            mpsc::error::TryRecvError::Disconnected
        );
    }

    #[test]
    fn workspace_delivery_reaches_every_connection_in_workspace_only() {
        let mut reg = ConnectionRegistry::new();
        let (a, mut ra) = client("w1", "u1");
        let (b, mut rb) = client("w1", "u2");
        let (c, mut rc) = client("w2", "u3");
        reg.add(a);
        reg.add(b);
        reg.add(c);

        let stats = reg.deliver_to_workspace("w1", &event());
        assert_eq!(stats, DeliveryStats { queued: 2, dropped: 0 });
        assert!(ra.try_recv().is_ok());
        assert!(rb.try_recv().is_ok());
        assert!(rc.try_recv().is_err());
    }

    #[test]
    fn filtered_delivery_skips_excluded_users() {
        let mut reg = ConnectionRegistry::new();
        let (a, mut ra) = client("w1", "u1");
        let (b, mut rb) = client("w1", "u2");
        reg.add(a);
        reg.add(b);

        reg.deliver_where("w1", |user| user == "u2", &event());
        assert!(ra.try_recv().is_err());
        assert!(rb.try_recv().is_ok());
    }

    #[test]
    fn user_delivery_reaches_all_of_a_users_connections() {
        let mut reg = ConnectionRegistry::new();
        let (a, mut ra) = client("w1", "u1");
        let (b, mut rb) = client("w1", "u1");
        let (c, mut rc) = client("w1", "u2");
        reg.add(a);
        reg.add(b);
        reg.add(c);

        let stats = reg.deliver_to_user("w1", "u1", &event());
        assert_eq!(stats.queued, 2);
        assert!(ra.try_recv().is_ok());
        assert!(rb.try_recv().is_ok());
        assert!(rc.try_recv().is_err());
    }

    #[test]
    fn full_queue_counts_as_dropped() {
        let mut reg = ConnectionRegistry::new();
        let (a, _ra) = Client::new("w1", "u1", 1);
        reg.add(a);

        assert_eq!(reg.deliver_to_user("w1", "u1", &event()).queued, 1);
        assert_eq!(reg.deliver_to_user("w1", "u1", &event()).dropped, 1);
    }

    #[test]
    fn disconnect_tokens_cover_all_user_connections() {
        let mut reg = ConnectionRegistry::new();
        let (a, _ra) = client("w1", "u1");
        let (b, _rb) = client("w1", "u1");
        let (ha, hb) = (a.handle(), b.handle());
        reg.add(a);
        reg.add(b);

        let tokens = reg.user_disconnect_tokens("w1", "u1");
        assert_eq!(tokens.len(), 2);
        tokens.iter().for_each(CancellationToken::cancel);
        assert!(ha.is_disconnected());
        assert!(hb.is_disconnected());
    }
}
