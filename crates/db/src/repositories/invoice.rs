use chrono::Utc;
use sqlx::Row;

use invoicey_core::domain::client::ClientId;
use invoicey_core::domain::invoice::{
    InvoiceDraft, InvoiceId, InvoiceNumber, LineItemSlot, StoredLineItemPair,
};

use super::{
    column, format_date, parse_date, parse_decimal, parse_uuid, InvoiceRepository, RepositoryError,
};
use crate::DbPool;

const INVOICE_COLUMNS: &str = "id, invoice_number, client_id, invoice_date, due_date, tax_rate,
    notes, labor1_description, labor1_amount, labor2_description, labor2_amount,
    material1_description, material1_amount, material2_description, material2_amount";

pub struct SqlInvoiceRepository {
    pool: DbPool,
}

impl SqlInvoiceRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn find_where(
        &self,
        predicate: &str,
        value: String,
    ) -> Result<Option<InvoiceDraft>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {INVOICE_COLUMNS} FROM invoice WHERE {predicate}"))
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(ref r) => Ok(Some(row_to_invoice(r)?)),
            None => Ok(None),
        }
    }
}

fn slot(
    row: &sqlx::sqlite::SqliteRow,
    description: &str,
    amount: &str,
) -> Result<LineItemSlot, RepositoryError> {
    let raw_amount: String = column(row, amount)?;
    Ok(LineItemSlot::new(column::<String>(row, description)?, parse_decimal(&raw_amount, amount)?))
}

fn row_to_invoice(row: &sqlx::sqlite::SqliteRow) -> Result<InvoiceDraft, RepositoryError> {
    let id: String = column(row, "id")?;
    let invoice_number: String = column(row, "invoice_number")?;
    let client_id: Option<String> = column(row, "client_id")?;
    let invoice_date: String = column(row, "invoice_date")?;
    let due_date: String = column(row, "due_date")?;
    let tax_rate: String = column(row, "tax_rate")?;

    let client_id = match client_id {
        Some(raw) => Some(ClientId(parse_uuid(&raw, "invoice.client_id")?)),
        None => None,
    };

    Ok(InvoiceDraft {
        id: InvoiceId(parse_uuid(&id, "invoice.id")?),
        client_id,
        invoice_number: InvoiceNumber::parse(&invoice_number)?,
        invoice_date: parse_date(&invoice_date, "invoice_date")?,
        due_date: parse_date(&due_date, "due_date")?,
        tax_rate: parse_decimal(&tax_rate, "tax_rate")?,
        notes: column(row, "notes")?,
        labor: StoredLineItemPair {
            line1: slot(row, "labor1_description", "labor1_amount")?,
            line2: slot(row, "labor2_description", "labor2_amount")?,
        },
        materials: StoredLineItemPair {
            line1: slot(row, "material1_description", "material1_amount")?,
            line2: slot(row, "material2_description", "material2_amount")?,
        },
    })
}

fn map_unique_violation(error: sqlx::Error, number: InvoiceNumber) -> RepositoryError {
    match &error {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            RepositoryError::DuplicateInvoiceNumber(number.to_string())
        }
        _ => RepositoryError::Database(error),
    }
}

#[async_trait::async_trait]
impl InvoiceRepository for SqlInvoiceRepository {
    async fn find_by_id(&self, id: &InvoiceId) -> Result<Option<InvoiceDraft>, RepositoryError> {
        self.find_where("id = ?", id.0.to_string()).await
    }

    async fn find_by_number(
        &self,
        number: InvoiceNumber,
    ) -> Result<Option<InvoiceDraft>, RepositoryError> {
        self.find_where("invoice_number = ?", number.to_string()).await
    }

    async fn save(&self, draft: InvoiceDraft) -> Result<(), RepositoryError> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO invoice (id, invoice_number, client_id, invoice_date, due_date, tax_rate,
                                  notes, labor1_description, labor1_amount, labor2_description,
                                  labor2_amount, material1_description, material1_amount,
                                  material2_description, material2_amount, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 invoice_number = excluded.invoice_number,
                 client_id = excluded.client_id,
                 invoice_date = excluded.invoice_date,
                 due_date = excluded.due_date,
                 tax_rate = excluded.tax_rate,
                 notes = excluded.notes,
                 labor1_description = excluded.labor1_description,
                 labor1_amount = excluded.labor1_amount,
                 labor2_description = excluded.labor2_description,
                 labor2_amount = excluded.labor2_amount,
                 material1_description = excluded.material1_description,
                 material1_amount = excluded.material1_amount,
                 material2_description = excluded.material2_description,
                 material2_amount = excluded.material2_amount,
                 updated_at = excluded.updated_at",
        )
        .bind(draft.id.0.to_string())
        .bind(draft.invoice_number.to_string())
        .bind(draft.client_id.map(|id| id.0.to_string()))
        .bind(format_date(draft.invoice_date))
        .bind(format_date(draft.due_date))
        .bind(draft.tax_rate.to_string())
        .bind(&draft.notes)
        .bind(&draft.labor.line1.description)
        .bind(draft.labor.line1.amount.to_string())
        .bind(&draft.labor.line2.description)
        .bind(draft.labor.line2.amount.to_string())
        .bind(&draft.materials.line1.description)
        .bind(draft.materials.line1.amount.to_string())
        .bind(&draft.materials.line2.description)
        .bind(draft.materials.line2.amount.to_string())
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(|error| map_unique_violation(error, draft.invoice_number))?;

        sqlx::query("UPDATE invoice_counter SET next_number = MAX(next_number, ?) WHERE id = 1")
            .bind(i64::from(draft.invoice_number.next().0))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::debug!(
            event_name = "db.invoice.saved",
            invoice_number = %draft.invoice_number,
            "invoice saved"
        );
        Ok(())
    }

    async fn next_invoice_number(&self) -> Result<InvoiceNumber, RepositoryError> {
        let row = sqlx::query("SELECT next_number FROM invoice_counter WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(InvoiceNumber(1));
        };
        let next: i64 = row.try_get("next_number")?;
        u32::try_from(next)
            .map(InvoiceNumber)
            .map_err(|e| RepositoryError::Decode(format!("invoice_counter.next_number: {e}")))
    }
}
