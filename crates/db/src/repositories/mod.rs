use std::str::FromStr;

use async_trait::async_trait;
use chrono::NaiveDate;
use invoicey_core::domain::client::{Client, ClientId, ClientRoster};
use invoicey_core::domain::invoice::{InvoiceDraft, InvoiceId, InvoiceNumber};
use invoicey_core::errors::{ApplicationError, DomainError};
use rust_decimal::Decimal;
use sqlx::Row;
use thiserror::Error;
use uuid::Uuid;

pub mod client;
pub mod invoice;
pub mod memory;

pub use client::SqlClientRepository;
pub use invoice::SqlInvoiceRepository;
pub use memory::{InMemoryClientRepository, InMemoryInvoiceRepository};

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("invoice number {0} is already used by another invoice")]
    DuplicateInvoiceNumber(String),
}

impl From<RepositoryError> for ApplicationError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::Domain(error) => Self::Domain(error),
            other => Self::Persistence(other.to_string()),
        }
    }
}

/// Client records backing the roster that the resolver matches against.
#[async_trait]
pub trait ClientRepository: Send + Sync {
    /// All clients ordered by name, case-insensitively. This order is the
    /// resolver's match order.
    async fn list_roster(&self) -> Result<ClientRoster, RepositoryError>;
    async fn find_by_id(&self, id: &ClientId) -> Result<Option<Client>, RepositoryError>;
    async fn save(&self, client: Client) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait InvoiceRepository: Send + Sync {
    async fn find_by_id(&self, id: &InvoiceId) -> Result<Option<InvoiceDraft>, RepositoryError>;
    async fn find_by_number(
        &self,
        number: InvoiceNumber,
    ) -> Result<Option<InvoiceDraft>, RepositoryError>;
    /// Upserts the draft and advances the running counter past its number.
    async fn save(&self, draft: InvoiceDraft) -> Result<(), RepositoryError>;
    async fn next_invoice_number(&self) -> Result<InvoiceNumber, RepositoryError>;
}

fn column<'r, T>(row: &'r sqlx::sqlite::SqliteRow, name: &str) -> Result<T, RepositoryError>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(name).map_err(|e| RepositoryError::Decode(e.to_string()))
}

fn parse_uuid(raw: &str, name: &str) -> Result<Uuid, RepositoryError> {
    Uuid::parse_str(raw).map_err(|e| RepositoryError::Decode(format!("{name}: {e}")))
}

fn parse_decimal(raw: &str, name: &str) -> Result<Decimal, RepositoryError> {
    Decimal::from_str(raw).map_err(|e| RepositoryError::Decode(format!("{name}: {e}")))
}

fn parse_date(raw: &str, name: &str) -> Result<NaiveDate, RepositoryError> {
    NaiveDate::parse_from_str(raw, DATE_FORMAT)
        .map_err(|e| RepositoryError::Decode(format!("{name}: {e}")))
}

fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}
