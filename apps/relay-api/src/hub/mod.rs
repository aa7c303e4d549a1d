//! In-process real-time event distribution.
//!
//! Domain code hands events to the [`Hub`], which fans them out to the live
//! client streams of a workspace, a channel's members, or a single user, and
//! records workspace/channel events in a replay log so reconnecting clients
//! can catch up from their last seen event ID.

pub mod connection;
pub mod control;
pub mod events;
pub mod fanout;
pub mod membership;
pub mod registry;
pub mod store;

pub use connection::{Client, ClientHandle};
pub use control::ControlLoop;
pub use events::{presence_changed, Event, EventKind, PresenceStatus};
pub use fanout::Hub;
pub use membership::{MembershipSource, MemoryMembershipSource, PgMembershipSource};
pub use store::{EventStore, EventWriter, MemoryEventStore, PgEventStore};
