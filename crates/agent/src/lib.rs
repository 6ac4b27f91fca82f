//! Conversational half of the invoice pipeline.
//!
//! A [`conversation::ChatSession`] owns the message history and working
//! draft for one chat. Each turn streams a reply from a
//! [`llm::ChatBackend`], accumulates it into text, pulls the tagged invoice
//! block out of the finished reply and merges it into the draft through
//! `invoicey_core::drafting`.
//!
//! The model only ever proposes field values. Slot aggregation, client
//! matching and totals are deterministic and live in the core crate.

pub mod conversation;
pub mod extract;
pub mod llm;
pub mod logging;
pub mod prompt;
pub mod stream;

pub use conversation::{ChatSession, DraftUpdate, Message, Role, SessionSettings, TurnOutcome};
pub use extract::{BlockExtractor, Extraction};
pub use llm::{ChatBackend, ChatRequest, HttpChatBackend, TextChunkStream, TransportError};
