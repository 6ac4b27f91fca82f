//! Turning one extraction into draft changes: client resolution, slot
//! aggregation and field-level merging. Everything here is pure; the roster is
//! passed in explicitly.

pub mod aggregate;
pub mod merge;
pub mod resolver;

pub use aggregate::{aggregate_line_items, OVERFLOW_SEPARATOR};
pub use merge::{merge_extraction, ClientMatch, DraftField, MergeOutcome, MergeReport};
pub use resolver::resolve_client;
