use chrono::{Days, NaiveDate};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::client::ClientId;
use crate::errors::DomainError;

const INVOICE_NUMBER_PREFIX: &str = "INV-";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvoiceId(pub Uuid);

impl InvoiceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for InvoiceId {
    fn default() -> Self {
        Self::new()
    }
}

/// Sequential, human-facing invoice number rendered as `INV-0001`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InvoiceNumber(pub u32);

impl InvoiceNumber {
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        raw.trim()
            .strip_prefix(INVOICE_NUMBER_PREFIX)
            .and_then(|digits| digits.parse::<u32>().ok())
            .map(Self)
            .ok_or_else(|| DomainError::InvalidInvoiceNumber(raw.to_string()))
    }
}

impl std::fmt::Display for InvoiceNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{INVOICE_NUMBER_PREFIX}{:04}", self.0)
    }
}

/// One fixed storage position. An unused slot is `{"", 0}`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItemSlot {
    pub description: String,
    pub amount: Decimal,
}

impl LineItemSlot {
    pub fn new(description: impl Into<String>, amount: Decimal) -> Self {
        Self { description: description.into(), amount }
    }

    pub fn is_empty(&self) -> bool {
        self.description.is_empty() && self.amount.is_zero()
    }
}

/// The two-slot storage shape each line-item category is persisted in.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredLineItemPair {
    pub line1: LineItemSlot,
    pub line2: LineItemSlot,
}

impl StoredLineItemPair {
    /// `None` when the two amounts do not fit in a `Decimal`.
    pub fn total(&self) -> Option<Decimal> {
        self.line1.amount.checked_add(self.line2.amount)
    }

    pub fn is_empty(&self) -> bool {
        self.line1.is_empty() && self.line2.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceDefaults {
    pub due_days: u32,
    pub tax_rate: Decimal,
}

impl Default for InvoiceDefaults {
    fn default() -> Self {
        Self { due_days: 30, tax_rate: Decimal::ZERO }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceTotals {
    pub labor: Decimal,
    pub materials: Decimal,
    pub subtotal: Decimal,
    pub tax: Decimal,
    pub total: Decimal,
}

/// Working invoice built up over a chat session and by direct form edits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceDraft {
    pub id: InvoiceId,
    pub client_id: Option<ClientId>,
    pub invoice_number: InvoiceNumber,
    pub invoice_date: NaiveDate,
    pub due_date: NaiveDate,
    /// Percentage, e.g. `8.25` for 8.25%.
    pub tax_rate: Decimal,
    pub notes: String,
    pub labor: StoredLineItemPair,
    pub materials: StoredLineItemPair,
}

impl InvoiceDraft {
    pub fn new(
        invoice_number: InvoiceNumber,
        issued_on: NaiveDate,
        defaults: &InvoiceDefaults,
    ) -> Self {
        let due_date = issued_on
            .checked_add_days(Days::new(u64::from(defaults.due_days)))
            .unwrap_or(issued_on);

        Self {
            id: InvoiceId::new(),
            client_id: None,
            invoice_number,
            invoice_date: issued_on,
            due_date,
            tax_rate: defaults.tax_rate,
            notes: String::new(),
            labor: StoredLineItemPair::default(),
            materials: StoredLineItemPair::default(),
        }
    }

    pub fn totals(&self) -> Result<InvoiceTotals, DomainError> {
        let overflow =
            |what: &str| DomainError::AmountOverflow(format!("{what} of {}", self.invoice_number));

        let labor = self.labor.total().ok_or_else(|| overflow("labor total"))?;
        let materials = self.materials.total().ok_or_else(|| overflow("materials total"))?;
        let subtotal = labor.checked_add(materials).ok_or_else(|| overflow("subtotal"))?;
        let tax = subtotal
            .checked_mul(self.tax_rate)
            .and_then(|taxed| taxed.checked_div(Decimal::ONE_HUNDRED))
            .ok_or_else(|| overflow("tax"))?
            .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
        let total = subtotal.checked_add(tax).ok_or_else(|| overflow("total"))?;

        Ok(InvoiceTotals { labor, materials, subtotal, tax, total })
    }
}
