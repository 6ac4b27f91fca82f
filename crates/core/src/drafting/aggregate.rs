//! Folding an unbounded line-item list into the two-slot storage shape.
//!
//! Invoices persist exactly two lines per category. The first mentioned item
//! keeps its own slot; every later item is folded into slot two, which carries
//! the joined descriptions and the summed amount. Item-level amounts beyond
//! the first are lost by this compression. Only the category total survives,
//! and it always equals the sum of the input amounts.
//!
//! Amounts are `Decimal`, so summation is exact. A list whose total does not
//! fit in a `Decimal` has no storage shape and aggregates to `None`.

use rust_decimal::Decimal;

use crate::domain::extraction::RawLineItem;
use crate::domain::invoice::{LineItemSlot, StoredLineItemPair};

pub const OVERFLOW_SEPARATOR: &str = "; ";

pub fn aggregate_line_items(items: &[RawLineItem]) -> Option<StoredLineItemPair> {
    let Some((first, overflow)) = items.split_first() else {
        return Some(StoredLineItemPair::default());
    };

    let pair = StoredLineItemPair {
        line1: LineItemSlot::new(first.description.clone(), first.amount),
        line2: fold_overflow(overflow)?,
    };
    pair.total()?;
    Some(pair)
}

fn fold_overflow(overflow: &[RawLineItem]) -> Option<LineItemSlot> {
    let description = overflow
        .iter()
        .map(|item| item.description.as_str())
        .filter(|description| !description.is_empty())
        .collect::<Vec<_>>()
        .join(OVERFLOW_SEPARATOR);
    let amount = overflow
        .iter()
        .try_fold(Decimal::ZERO, |sum, item| sum.checked_add(item.amount))?;

    Some(LineItemSlot { description, amount })
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::aggregate_line_items;
    use crate::domain::extraction::RawLineItem;
    use crate::domain::invoice::{LineItemSlot, StoredLineItemPair};

    fn item(description: &str, amount: i64) -> RawLineItem {
        RawLineItem::new(description, Decimal::from(amount))
    }

    fn aggregate(items: &[RawLineItem]) -> StoredLineItemPair {
        aggregate_line_items(items).expect("amounts fit")
    }

    #[test]
    fn empty_list_leaves_both_slots_unused() {
        let pair = aggregate(&[]);
        assert_eq!(pair.line1, LineItemSlot::default());
        assert_eq!(pair.line2, LineItemSlot::default());
    }

    #[test]
    fn single_item_fills_slot_one_only() {
        let pair = aggregate(&[item("Demo", 500)]);
        assert_eq!(pair.line1, LineItemSlot::new("Demo", Decimal::from(500)));
        assert_eq!(pair.line2, LineItemSlot::new("", Decimal::ZERO));
    }

    #[test]
    fn two_items_map_one_to_one() {
        let pair = aggregate(&[item("Demo", 500), item("Haul away", 150)]);
        assert_eq!(pair.line1, LineItemSlot::new("Demo", Decimal::from(500)));
        assert_eq!(pair.line2, LineItemSlot::new("Haul away", Decimal::from(150)));
    }

    // Overflow concatenation is intended behaviour: storage has two slots per
    // category and downstream consumers read slot two as "everything else".
    #[test]
    fn overflow_items_are_concatenated_and_summed_into_slot_two() {
        let pair = aggregate(&[item("A", 100), item("B", 200), item("C", 300)]);
        assert_eq!(pair.line1, LineItemSlot::new("A", Decimal::from(100)));
        assert_eq!(pair.line2, LineItemSlot::new("B; C", Decimal::from(500)));
    }

    #[test]
    fn empty_overflow_descriptions_are_skipped_but_amounts_still_count() {
        let pair = aggregate(&[
            item("Tile", 40),
            item("", 10),
            item("Grout", 5),
            item("", 1),
        ]);
        assert_eq!(pair.line2, LineItemSlot::new("Grout", Decimal::from(16)));
    }

    #[test]
    fn empty_first_description_is_copied_verbatim() {
        let pair = aggregate(&[item("", 75), item("Paint", 25)]);
        assert_eq!(pair.line1, LineItemSlot::new("", Decimal::from(75)));
        assert_eq!(pair.line2, LineItemSlot::new("Paint", Decimal::from(25)));
    }

    #[test]
    fn slot_total_equals_input_total_for_fractional_amounts() {
        let amounts = ["0.1", "0.2", "0.3", "1999.99", "-15.25", "1234567.89", "0.01"];
        let items = amounts
            .iter()
            .enumerate()
            .map(|(index, raw)| {
                RawLineItem::new(format!("item {index}"), raw.parse::<Decimal>().expect("decimal"))
            })
            .collect::<Vec<_>>();

        for len in 0..=items.len() {
            let slice = &items[..len];
            let expected = slice.iter().map(|item| item.amount).sum::<Decimal>();
            assert_eq!(aggregate(slice).total(), Some(expected), "prefix of length {len}");
        }
    }

    #[test]
    fn overflowing_slot_two_sum_has_no_storage_shape() {
        let half = Decimal::from_scientific("5e28").expect("in range");
        let items = [item("Demo", 1), RawLineItem::new("B", half), RawLineItem::new("C", half)];

        assert_eq!(aggregate_line_items(&items), None);
    }

    #[test]
    fn overflowing_category_total_has_no_storage_shape() {
        let items = [RawLineItem::new("Demo", Decimal::MAX), item("Haul away", 1)];
        assert_eq!(aggregate_line_items(&items), None);
    }

    #[test]
    fn amounts_near_the_limit_still_aggregate_when_they_fit() {
        let items = [
            RawLineItem::new("Demo", Decimal::MAX - Decimal::from(10)),
            item("Haul away", 4),
            item("Cleanup", 6),
        ];

        let pair = aggregate(&items);
        assert_eq!(pair.line2, LineItemSlot::new("Haul away; Cleanup", Decimal::from(10)));
        assert_eq!(pair.total(), Some(Decimal::MAX));
    }
}
