//! Finding and decoding the structured invoice block inside assistant text.
//!
//! The assistant answers in free text and, once it has enough detail, appends
//! a fenced block whose opening fence carries the configured tag:
//!
//! ````text
//! ```invoice-data
//! {"labor_items": [{"description": "Demo", "amount": 500}]}
//! ```
//! ````
//!
//! Decoding is tolerant below the top level: unknown keys are ignored and a
//! key with the wrong type is dropped on its own. The payload itself must be
//! a syntactically valid JSON object, otherwise the block counts as malformed
//! and the turn carries no extraction.

use std::ops::Range;
use std::str::FromStr;

use chrono::NaiveDate;
use invoicey_core::config::DEFAULT_BLOCK_TAG;
use invoicey_core::domain::extraction::{ExtractedInvoiceData, RawLineItem};
use rust_decimal::Decimal;
use serde_json::{Map, Number, Value};

const FENCE: &str = "```";
const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Extraction {
    /// No tagged block; the conversation simply continues.
    None,
    Parsed(ExtractedInvoiceData),
    /// A tagged block was present but its payload is not a JSON object.
    Malformed { reason: String },
}

impl Extraction {
    pub fn data(&self) -> Option<&ExtractedInvoiceData> {
        match self {
            Self::Parsed(data) => Some(data),
            Self::None | Self::Malformed { .. } => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct FencedBlock {
    /// Whole region, fences included.
    span: Range<usize>,
    body: Range<usize>,
    tagged: bool,
    closed: bool,
}

#[derive(Clone, Debug)]
pub struct BlockExtractor {
    tag: String,
}

impl Default for BlockExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_TAG)
    }
}

impl BlockExtractor {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Extracts invoice data from one finished assistant message. Pure in
    /// `text`; the first tagged block wins.
    pub fn extract(&self, text: &str) -> Extraction {
        let Some(block) = self.blocks(text).into_iter().find(|block| block.tagged) else {
            return Extraction::None;
        };

        match decode_payload(&text[block.body.clone()]) {
            Ok(data) => Extraction::Parsed(data),
            Err(reason) => {
                tracing::warn!(
                    event_name = "agent.extract.malformed_block",
                    tag = %self.tag,
                    closed = block.closed,
                    reason = %reason,
                    "structured invoice block could not be parsed; treating turn as conversation"
                );
                Extraction::Malformed { reason }
            }
        }
    }

    /// Finished message with every tagged block and its fences removed.
    pub fn clean_text(&self, text: &str) -> String {
        let mut clean = String::with_capacity(text.len());
        let mut cursor = 0;

        for block in self.blocks(text).into_iter().filter(|block| block.tagged) {
            clean.push_str(&text[cursor..block.span.start]);
            cursor = block.span.end;
        }
        clean.push_str(&text[cursor..]);

        collapse_blank_runs(clean.trim())
    }

    /// Text safe to show while a reply is still streaming. Identical to
    /// `clean_text`, and additionally hides a trailing partial opening fence
    /// that could still turn into a tagged block.
    pub fn visible_text(&self, partial: &str) -> String {
        let clean = self.clean_text(partial);
        let line_start = clean.rfind('\n').map_or(0, |index| index + 1);

        let last_line = clean[line_start..].trim_start();
        let could_open_block = last_line.starts_with('`')
            && (FENCE.starts_with(last_line) || self.is_tag_prefix(last_line));
        if could_open_block {
            return clean[..line_start].trim_end().to_string();
        }
        clean
    }

    fn is_tag_prefix(&self, line: &str) -> bool {
        let Some(info) = line.strip_prefix(FENCE) else {
            return false;
        };
        let info = info.trim_start_matches('`').trim();
        self.tag.len() >= info.len()
            && self.tag.as_bytes()[..info.len()].eq_ignore_ascii_case(info.as_bytes())
    }

    fn blocks(&self, text: &str) -> Vec<FencedBlock> {
        let mut blocks = Vec::new();
        let mut open: Option<(usize, usize, usize, bool)> = None;
        let mut offset = 0;

        for line in text.split_inclusive('\n') {
            let line_start = offset;
            offset += line.len();
            let trimmed = line.trim();

            match open {
                None => {
                    let Some(rest) = trimmed.strip_prefix(FENCE) else {
                        continue;
                    };
                    let fence_len = FENCE.len() + rest.len() - rest.trim_start_matches('`').len();
                    let info = rest.trim_start_matches('`').trim();
                    let tagged = info.eq_ignore_ascii_case(&self.tag);
                    open = Some((line_start, offset, fence_len, tagged));
                }
                Some((start, body_start, fence_len, tagged)) => {
                    let closes = trimmed.len() >= fence_len && trimmed.bytes().all(|b| b == b'`');
                    if closes {
                        blocks.push(FencedBlock {
                            span: start..offset,
                            body: body_start..line_start,
                            tagged,
                            closed: true,
                        });
                        open = None;
                    }
                }
            }
        }

        if let Some((start, body_start, _, tagged)) = open {
            blocks.push(FencedBlock {
                span: start..text.len(),
                body: body_start..text.len(),
                tagged,
                closed: false,
            });
        }

        blocks
    }
}

fn collapse_blank_runs(text: &str) -> String {
    let mut collapsed = String::with_capacity(text.len());
    let mut blank_run = 0;

    for line in text.lines() {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        if !collapsed.is_empty() {
            collapsed.push('\n');
        }
        collapsed.push_str(line);
    }

    collapsed
}

fn decode_payload(payload: &str) -> Result<ExtractedInvoiceData, String> {
    let value: Value = serde_json::from_str(payload.trim()).map_err(|error| error.to_string())?;
    let object = match value {
        Value::Object(object) => object,
        other => return Err(format!("expected a JSON object, found {}", kind_of(&other))),
    };

    Ok(ExtractedInvoiceData {
        client_name: field(&object, "client_name", decode_string),
        invoice_date: field(&object, "invoice_date", decode_date),
        due_date: field(&object, "due_date", decode_date),
        labor_items: field(&object, "labor_items", decode_items),
        material_items: field(&object, "material_items", decode_items),
        tax_rate: field(&object, "tax_rate", decode_decimal),
        notes: field(&object, "notes", decode_string),
    })
}

fn field<T>(
    object: &Map<String, Value>,
    key: &'static str,
    decode: impl Fn(&Value) -> Option<T>,
) -> Option<T> {
    let value = object.get(key)?;
    let decoded = decode(value);
    if decoded.is_none() {
        tracing::debug!(
            event_name = "agent.extract.field_dropped",
            field = key,
            found = kind_of(value),
            "dropping invoice field that could not be decoded"
        );
    }
    decoded
}

fn decode_string(value: &Value) -> Option<String> {
    value.as_str().map(str::to_string)
}

fn decode_date(value: &Value) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.as_str()?.trim(), DATE_FORMAT).ok()
}

fn decode_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(number) => number_to_decimal(number),
        _ => None,
    }
}

/// Items that are not objects are skipped. A mistyped `description` or
/// `amount` falls back to `""` or `0` for that item only, but a numeric amount
/// outside the `Decimal` range drops the whole list, since no stored total
/// could match it.
fn decode_items(value: &Value) -> Option<Vec<RawLineItem>> {
    value.as_array()?.iter().filter_map(Value::as_object).map(decode_item).collect()
}

fn decode_item(object: &Map<String, Value>) -> Option<RawLineItem> {
    let amount = match object.get("amount") {
        Some(Value::Number(number)) => number_to_decimal(number)?,
        _ => field(object, "amount", decode_decimal).unwrap_or_default(),
    };

    Some(RawLineItem {
        description: field(object, "description", decode_string).unwrap_or_default(),
        amount,
    })
}

fn number_to_decimal(number: &Number) -> Option<Decimal> {
    let text = number.to_string();
    let decimal = Decimal::from_str(&text).ok().or_else(|| Decimal::from_scientific(&text).ok());
    if decimal.is_none() {
        tracing::warn!(
            event_name = "agent.extract.number_out_of_range",
            number = %text,
            "number does not fit in a decimal amount"
        );
    }
    decimal
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
