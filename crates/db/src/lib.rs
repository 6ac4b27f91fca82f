//! SQLite persistence for clients and saved invoices.

pub mod connection;
pub mod migrations;
pub mod repositories;

pub use connection::{connect, connect_with_settings, connect_with_config, DbPool};
pub use repositories::{
    ClientRepository, InMemoryClientRepository, InMemoryInvoiceRepository, InvoiceRepository,
    RepositoryError, SqlClientRepository, SqlInvoiceRepository,
};
