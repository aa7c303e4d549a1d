//! Event kinds and the wire-format event record.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Event kinds
// ---------------------------------------------------------------------------

/// Closed set of event kinds fanned out by the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "connected")]
    Connected,
    #[serde(rename = "heartbeat")]
    Heartbeat,
    #[serde(rename = "message.new")]
    MessageNew,
    #[serde(rename = "message.updated")]
    MessageUpdated,
    #[serde(rename = "message.deleted")]
    MessageDeleted,
    #[serde(rename = "reaction.added")]
    ReactionAdded,
    #[serde(rename = "reaction.removed")]
    ReactionRemoved,
    #[serde(rename = "channel.created")]
    ChannelCreated,
    #[serde(rename = "channel.updated")]
    ChannelUpdated,
    #[serde(rename = "channel.archived")]
    ChannelArchived,
    #[serde(rename = "channel.member_added")]
    MemberAdded,
    #[serde(rename = "channel.member_removed")]
    MemberRemoved,
    #[serde(rename = "channel.read")]
    ChannelRead,
    #[serde(rename = "typing.start")]
    TypingStart,
    #[serde(rename = "typing.stop")]
    TypingStop,
    #[serde(rename = "presence.changed")]
    PresenceChanged,
    #[serde(rename = "presence.initial")]
    PresenceInitial,
    #[serde(rename = "notification")]
    Notification,
    #[serde(rename = "emoji.created")]
    EmojiCreated,
    #[serde(rename = "emoji.deleted")]
    EmojiDeleted,
    #[serde(rename = "scheduled_message.created")]
    ScheduledMessageCreated,
    #[serde(rename = "scheduled_message.updated")]
    ScheduledMessageUpdated,
    #[serde(rename = "scheduled_message.deleted")]
    ScheduledMessageDeleted,
    #[serde(rename = "scheduled_message.sent")]
    ScheduledMessageSent,
    #[serde(rename = "scheduled_message.failed")]
    ScheduledMessageFailed,
}

impl EventKind {
    pub const ALL: [EventKind; 25] = [
        EventKind::Connected,
        EventKind::Heartbeat,
        EventKind::MessageNew,
        EventKind::MessageUpdated,
        EventKind::MessageDeleted,
        EventKind::ReactionAdded,
        EventKind::ReactionRemoved,
        EventKind::ChannelCreated,
        EventKind::ChannelUpdated,
        EventKind::ChannelArchived,
        EventKind::MemberAdded,
        EventKind::MemberRemoved,
        EventKind::ChannelRead,
        EventKind::TypingStart,
        EventKind::TypingStop,
        EventKind::PresenceChanged,
        EventKind::PresenceInitial,
        EventKind::Notification,
        EventKind::EmojiCreated,
        EventKind::EmojiDeleted,
        EventKind::ScheduledMessageCreated,
        EventKind::ScheduledMessageUpdated,
        EventKind::ScheduledMessageDeleted,
        EventKind::ScheduledMessageSent,
        EventKind::ScheduledMessageFailed,
    ];

    /// The `type` string used on the wire and in the replay log.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Connected => "connected",
            EventKind::Heartbeat => "heartbeat",
            EventKind::MessageNew => "message.new",
            EventKind::MessageUpdated => "message.updated",
            EventKind::MessageDeleted => "message.deleted",
            EventKind::ReactionAdded => "reaction.added",
            EventKind::ReactionRemoved => "reaction.removed",
            EventKind::ChannelCreated => "channel.created",
            EventKind::ChannelUpdated => "channel.updated",
            EventKind::ChannelArchived => "channel.archived",
            EventKind::MemberAdded => "channel.member_added",
            EventKind::MemberRemoved => "channel.member_removed",
            EventKind::ChannelRead => "channel.read",
            EventKind::TypingStart => "typing.start",
            EventKind::TypingStop => "typing.stop",
            EventKind::PresenceChanged => "presence.changed",
            EventKind::PresenceInitial => "presence.initial",
            EventKind::Notification => "notification",
            EventKind::EmojiCreated => "emoji.created",
            EventKind::EmojiDeleted => "emoji.deleted",
            EventKind::ScheduledMessageCreated => "scheduled_message.created",
            EventKind::ScheduledMessageUpdated => "scheduled_message.updated",
            EventKind::ScheduledMessageDeleted => "scheduled_message.deleted",
            EventKind::ScheduledMessageSent => "scheduled_message.sent",
            EventKind::ScheduledMessageFailed => "scheduled_message.failed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a stored `event_type` is not a known kind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event kind `{0}`")]
pub struct UnknownEventKind(pub String);

impl FromStr for EventKind {
    type Err = UnknownEventKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownEventKind(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Event record
// ---------------------------------------------------------------------------

/// An immutable hub event.
///
/// Producers leave `id` empty; the hub assigns a sortable ID before the event
/// is persisted or delivered, so every copy of an event carries the same ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl Event {
    /// Build an event without an ID.
    pub fn new(kind: EventKind, data: Value) -> Self {
        Self {
            id: String::new(),
            kind,
            data,
        }
    }

    /// Build an event carrying an existing ID (used when reading the replay log).
    pub fn with_id(id: impl Into<String>, kind: EventKind, data: Value) -> Self {
        Self {
            id: id.into(),
            kind,
            data,
        }
    }

    pub fn has_id(&self) -> bool {
        !self.id.is_empty()
    }
}

/// Payload of a `presence.changed` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// Build the `presence.changed` event for a user's connection-count transition.
pub fn presence_changed(user_id: &str, status: PresenceStatus) -> Event {
    Event::new(
        EventKind::PresenceChanged,
        serde_json::json!({
            "user_id": user_id,
            "status": status,
        }),
    )
}
