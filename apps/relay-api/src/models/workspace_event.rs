use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde_json::Value;

use crate::db::schema::workspace_events;
use crate::hub::events::{Event, EventKind};

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = workspace_events)]
pub struct WorkspaceEvent {
    pub id: String,
    pub workspace_id: String,
    pub event_type: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl WorkspaceEvent {
    /// Convert a stored row back into a hub event.
    ///
    /// Rows with an unknown `event_type` are skipped rather than failing the
    /// whole replay page.
    pub fn into_event(self) -> Option<Event> {
        match self.event_type.parse::<EventKind>() {
            Ok(kind) => Some(Event::with_id(self.id, kind, self.payload)),
            Err(err) => {
                tracing::warn!(
                    %err,
                    event_id = %self.id,
                    workspace_id = %self.workspace_id,
                    "skipping unreadable replay log entry"
                );
                None
            }
        }
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = workspace_events)]
pub struct NewWorkspaceEvent<'a> {
    pub id: &'a str,
    pub workspace_id: &'a str,
    pub event_type: &'a str,
    pub payload: &'a Value,
    pub created_at: DateTime<Utc>,
}
