use std::collections::HashMap;

use tokio::sync::RwLock;
use uuid::Uuid;

use invoicey_core::domain::client::{Client, ClientId, ClientRoster};
use invoicey_core::domain::invoice::{InvoiceDraft, InvoiceId, InvoiceNumber};

use super::{ClientRepository, InvoiceRepository, RepositoryError};

#[derive(Default)]
pub struct InMemoryClientRepository {
    clients: RwLock<HashMap<Uuid, Client>>,
}

#[async_trait::async_trait]
impl ClientRepository for InMemoryClientRepository {
    async fn list_roster(&self) -> Result<ClientRoster, RepositoryError> {
        let clients = self.clients.read().await;
        let mut ordered = clients.values().cloned().collect::<Vec<_>>();
        ordered.sort_by(|a, b| {
            a.name
                .to_ascii_lowercase()
                .cmp(&b.name.to_ascii_lowercase())
                .then_with(|| a.id.0.cmp(&b.id.0))
        });
        Ok(ClientRoster::new(ordered))
    }

    async fn find_by_id(&self, id: &ClientId) -> Result<Option<Client>, RepositoryError> {
        let clients = self.clients.read().await;
        Ok(clients.get(&id.0).cloned())
    }

    async fn save(&self, client: Client) -> Result<(), RepositoryError> {
        let mut clients = self.clients.write().await;
        clients.insert(client.id.0, client);
        Ok(())
    }
}

pub struct InMemoryInvoiceRepository {
    invoices: RwLock<HashMap<Uuid, InvoiceDraft>>,
    next_number: RwLock<InvoiceNumber>,
}

impl Default for InMemoryInvoiceRepository {
    fn default() -> Self {
        Self { invoices: RwLock::default(), next_number: RwLock::new(InvoiceNumber(1)) }
    }
}

#[async_trait::async_trait]
impl InvoiceRepository for InMemoryInvoiceRepository {
    async fn find_by_id(&self, id: &InvoiceId) -> Result<Option<InvoiceDraft>, RepositoryError> {
        let invoices = self.invoices.read().await;
        Ok(invoices.get(&id.0).cloned())
    }

    async fn find_by_number(
        &self,
        number: InvoiceNumber,
    ) -> Result<Option<InvoiceDraft>, RepositoryError> {
        let invoices = self.invoices.read().await;
        Ok(invoices.values().find(|draft| draft.invoice_number == number).cloned())
    }

    async fn save(&self, draft: InvoiceDraft) -> Result<(), RepositoryError> {
        let mut invoices = self.invoices.write().await;
        let duplicate = invoices
            .values()
            .any(|other| other.id != draft.id && other.invoice_number == draft.invoice_number);
        if duplicate {
            return Err(RepositoryError::DuplicateInvoiceNumber(draft.invoice_number.to_string()));
        }

        let mut next_number = self.next_number.write().await;
        *next_number = (*next_number).max(draft.invoice_number.next());
        invoices.insert(draft.id.0, draft);
        Ok(())
    }

    async fn next_invoice_number(&self) -> Result<InvoiceNumber, RepositoryError> {
        Ok(*self.next_number.read().await)
    }
}
