//! Chat application layer for `PetChat`.
//!
//! - [`room::ChatRoom`] drives one conversation: optimistic sends,
//!   broker pushes, history snapshots and adoption decisions
//! - [`store::MessageStore`] is the ordered, deduplicated message log
//! - [`adoption::AdoptionTracker`] holds the adoption state machine and
//!   its durable cache
//! - [`conversations::ConversationList`] backs the contact picker

pub mod adoption;
pub mod conversations;
pub mod room;
pub mod store;

pub use adoption::{AdoptionError, AdoptionState, AdoptionTracker};
pub use conversations::ConversationList;
pub use room::{ChatRoom, MessageView, RoomConfig, RoomError, RoomEvent};
pub use store::{MessageStatus, MessageStore};
