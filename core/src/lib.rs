//! Root of the `weft-core` library.
//!
//! Reconstructs a conversation timeline from the public streaming feed. The
//! turn state machine dispatches one ordered event stream into the leaf
//! accumulators and resolves a terminal summary; the ledger replay path runs
//! the same accumulation logic once, synchronously, over the persisted event
//! history, and the two views merge by id. Transport, rendering and
//! persistence are collaborators, not residents.

// Prevent accidental direct writes to stdout/stderr in library code. All
// user-visible output must go through the tracing stack.
#![deny(clippy::print_stdout, clippy::print_stderr)]

mod chunks;
mod citations;
pub mod config;
pub mod error;
mod merge;
mod message;
mod reasoning;
mod replay;
mod text;
pub mod timeline;
mod tools;
mod turn;

pub use chunks::AssembledChunk;
pub use chunks::ChunkStore;
pub use citations::CitationAccumulator;
pub use config::EngineConfig;
pub use error::Result;
pub use error::StreamError;
pub use merge::merge_messages;
pub use message::ChatMessage;
pub use message::MessageKind;
pub use message::is_optimistic_id;
pub use message::optimistic_id_millis;
pub use reasoning::ReasoningAccumulator;
pub use reasoning::ReasoningPart;
pub use replay::LedgerReplay;
pub use replay::ToolAnchors;
pub use replay::ToolTimeline;
pub use replay::live_timeline;
pub use replay::merge_anchors;
pub use replay::reanchor_promoted;
pub use replay::replay_ledger;
pub use text::TextPartsStore;
pub use timeline::MessagePatch;
pub use timeline::OpQueue;
pub use timeline::TimelineOp;
pub use tools::ToolCallState;
pub use tools::ToolStatus;
pub use tools::ToolTracker;
pub use turn::CancelFlag;
pub use turn::TextChannel;
pub use turn::Turn;
pub use turn::TurnObserver;
pub use turn::TurnSummary;
pub use turn::run_turn;
