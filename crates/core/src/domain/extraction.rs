use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One line item as mentioned by the assistant, before slot aggregation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLineItem {
    pub description: String,
    pub amount: Decimal,
}

impl RawLineItem {
    pub fn new(description: impl Into<String>, amount: Decimal) -> Self {
        Self { description: description.into(), amount }
    }
}

/// Invoice fields carried by one structured block.
///
/// Every field is optional and `Some` means the key was present in the block
/// with a usable value. `Some(String::new())` and `Some(Decimal::ZERO)` are
/// present values and override whatever the draft held.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedInvoiceData {
    pub client_name: Option<String>,
    pub invoice_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    pub labor_items: Option<Vec<RawLineItem>>,
    pub material_items: Option<Vec<RawLineItem>>,
    pub tax_rate: Option<Decimal>,
    pub notes: Option<String>,
}

impl ExtractedInvoiceData {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}
