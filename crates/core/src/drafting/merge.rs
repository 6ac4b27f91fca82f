use serde::{Deserialize, Serialize};

use crate::domain::client::{ClientId, ClientRoster};
use crate::domain::extraction::{ExtractedInvoiceData, RawLineItem};
use crate::domain::invoice::{InvoiceDraft, StoredLineItemPair};
use crate::drafting::aggregate::aggregate_line_items;
use crate::drafting::resolver::resolve_client;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftField {
    Client,
    InvoiceDate,
    DueDate,
    TaxRate,
    Notes,
    Labor,
    Materials,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMatch {
    /// The extraction carried no usable client name.
    NotRequested,
    Matched(ClientId),
    /// A name was given but no roster entry contains it. The draft keeps its
    /// previous client.
    Unmatched(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    pub changed_fields: Vec<DraftField>,
    /// Present fields left unapplied because their amounts do not fit in a
    /// `Decimal`, alone or in the draft totals.
    pub rejected_fields: Vec<DraftField>,
    pub client: ClientMatch,
}

impl MergeReport {
    pub fn changed(&self, field: DraftField) -> bool {
        self.changed_fields.contains(&field)
    }

    pub fn rejected(&self, field: DraftField) -> bool {
        self.rejected_fields.contains(&field)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeOutcome {
    pub draft: InvoiceDraft,
    pub report: MergeReport,
}

/// Applies one extraction to a draft with override-if-present semantics.
///
/// Absent fields leave the draft untouched; present fields replace it, zero
/// and empty values included. Line-item lists replace their category
/// wholesale when non-empty, so re-applying the same extraction is stable.
///
/// Numeric fields are applied labor, materials, then tax rate. One that
/// would leave the totals unrepresentable is rejected and the draft keeps its
/// previous value for it.
pub fn merge_extraction(
    draft: &InvoiceDraft,
    data: &ExtractedInvoiceData,
    roster: &ClientRoster,
) -> MergeOutcome {
    let mut merged = draft.clone();
    let mut changed_fields = Vec::new();

    let client = match data.client_name.as_deref() {
        Some(name) if !name.trim().is_empty() => match resolve_client(Some(name), roster) {
            Some(client) => {
                if merged.client_id != Some(client.id) {
                    changed_fields.push(DraftField::Client);
                }
                merged.client_id = Some(client.id);
                ClientMatch::Matched(client.id)
            }
            None => ClientMatch::Unmatched(name.to_string()),
        },
        _ => ClientMatch::NotRequested,
    };

    if let Some(invoice_date) = data.invoice_date {
        override_field(
            &mut merged.invoice_date,
            invoice_date,
            DraftField::InvoiceDate,
            &mut changed_fields,
        );
    }
    if let Some(due_date) = data.due_date {
        override_field(&mut merged.due_date, due_date, DraftField::DueDate, &mut changed_fields);
    }
    if let Some(notes) = &data.notes {
        override_field(&mut merged.notes, notes.clone(), DraftField::Notes, &mut changed_fields);
    }

    let mut rejected_fields = Vec::new();
    if let Some(labor) =
        aggregate_present(data.labor_items.as_deref(), DraftField::Labor, &mut rejected_fields)
    {
        let candidate = InvoiceDraft { labor, ..merged.clone() };
        apply_if_totals_fit(
            &mut merged,
            candidate,
            DraftField::Labor,
            &mut changed_fields,
            &mut rejected_fields,
        );
    }
    if let Some(materials) = aggregate_present(
        data.material_items.as_deref(),
        DraftField::Materials,
        &mut rejected_fields,
    ) {
        let candidate = InvoiceDraft { materials, ..merged.clone() };
        apply_if_totals_fit(
            &mut merged,
            candidate,
            DraftField::Materials,
            &mut changed_fields,
            &mut rejected_fields,
        );
    }

    if let Some(tax_rate) = data.tax_rate {
        let candidate = InvoiceDraft { tax_rate, ..merged.clone() };
        apply_if_totals_fit(
            &mut merged,
            candidate,
            DraftField::TaxRate,
            &mut changed_fields,
            &mut rejected_fields,
        );
    }

    MergeOutcome { draft: merged, report: MergeReport { changed_fields, rejected_fields, client } }
}

/// Empty lists are treated as absent.
fn aggregate_present(
    items: Option<&[RawLineItem]>,
    field: DraftField,
    rejected_fields: &mut Vec<DraftField>,
) -> Option<StoredLineItemPair> {
    let items = items.filter(|items| !items.is_empty())?;
    let pair = aggregate_line_items(items);
    if pair.is_none() {
        rejected_fields.push(field);
    }
    pair
}

/// Totals that were already unrepresentable before this field do not block
/// it; only the field that breaks them is rejected.
fn apply_if_totals_fit(
    merged: &mut InvoiceDraft,
    candidate: InvoiceDraft,
    field: DraftField,
    changed_fields: &mut Vec<DraftField>,
    rejected_fields: &mut Vec<DraftField>,
) {
    if candidate.totals().is_err() && merged.totals().is_ok() {
        rejected_fields.push(field);
        return;
    }
    if *merged != candidate {
        changed_fields.push(field);
        *merged = candidate;
    }
}

fn override_field<T: PartialEq>(
    slot: &mut T,
    value: T,
    field: DraftField,
    changed_fields: &mut Vec<DraftField>,
) {
    if *slot != value {
        changed_fields.push(field);
        *slot = value;
    }
}
