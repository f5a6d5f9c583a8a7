//! Wire-facing data model for the public streaming feed.
//!
//! Contains the [`StreamEvent`] discriminated union and every payload type it
//! carries. Transport and persistence are out of scope: this crate assumes
//! events arrive already decoded from JSON and in order.

mod event;
mod models;

pub use event::EventPayload;
pub use event::EventScope;
pub use event::StreamEvent;
pub use models::Attachment;
pub use models::ChunkEncoding;
pub use models::ChunkEntity;
pub use models::ChunkTarget;
pub use models::Citation;
pub use models::FinalResponse;
pub use models::MemoryCheckpoint;
pub use models::OutputItem;
pub use models::OutputItemKind;
pub use models::ToolFamily;
pub use models::ToolStatusUpdate;
pub use models::TurnStatus;
