//! Core domain for invoicey: clients, invoice drafts, the structured data an
//! assistant turn can carry, and the pure steps that merge that data into a
//! draft.

pub mod config;
pub mod domain;
pub mod drafting;
pub mod errors;

pub use domain::client::{Client, ClientId, ClientRoster};
pub use domain::extraction::{ExtractedInvoiceData, RawLineItem};
pub use domain::invoice::{
    InvoiceDefaults, InvoiceDraft, InvoiceId, InvoiceNumber, InvoiceTotals, LineItemSlot,
    StoredLineItemPair,
};
pub use drafting::{
    aggregate_line_items, merge_extraction, resolve_client, ClientMatch, DraftField,
    MergeOutcome, MergeReport,
};
pub use errors::{ApplicationError, DomainError};
