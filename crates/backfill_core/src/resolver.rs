//! Previous-revision lookup for `rev_parent_id`.
//!
//! Timestamps give the logical edit order; ids only break ties between
//! revisions saved within the same second. Among equal timestamps the highest
//! smaller id wins, otherwise the highest id at the latest earlier timestamp.
//! Every parent is therefore strictly smaller in `(timestamp, id)` order, so
//! parent chains cannot loop.

use crate::model::{ParentId, Row};

/// Resolve the parent of `row` from the revisions of the same page.
///
/// Rows from other groups and `row` itself are ignored, so callers may pass a
/// wider candidate set than strictly necessary.
pub fn resolve_parent<'a, I>(row: &Row, same_group_rows: I) -> ParentId
where
    I: IntoIterator<Item = &'a Row>,
{
    let mut same_second: Option<&Row> = None;
    let mut earlier: Option<&Row> = None;

    for candidate in same_group_rows {
        if candidate.group_key != row.group_key || candidate.id == row.id {
            continue;
        }
        if candidate.timestamp == row.timestamp {
            if candidate.id < row.id && same_second.is_none_or(|best| candidate.id > best.id) {
                same_second = Some(candidate);
            }
        } else if candidate.timestamp < row.timestamp {
            let better = match earlier {
                None => true,
                Some(best) => {
                    (candidate.timestamp.as_str(), candidate.id) > (best.timestamp.as_str(), best.id)
                }
            };
            if better {
                earlier = Some(candidate);
            }
        }
    }

    match same_second.or(earlier) {
        Some(parent) => ParentId::Revision(parent.id),
        None => ParentId::None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use proptest::prelude::*;

    use super::*;
    use crate::model::{RowId, row_id};

    fn rev(id: i64, page: i64, ts: &str) -> Row {
        Row::new(row_id(id), page, ts)
    }

    fn parent_of(rows: &[Row], id: i64) -> ParentId {
        let row = rows
            .iter()
            .find(|row| row.id.get() == id)
            .expect("row present");
        resolve_parent(row, rows)
    }

    #[test]
    fn equal_timestamps_chain_by_highest_smaller_id() {
        let rows = vec![rev(1, 1, "T"), rev(2, 1, "T"), rev(3, 1, "T")];
        assert_eq!(parent_of(&rows, 3), ParentId::Revision(row_id(2)));
        assert_eq!(parent_of(&rows, 2), ParentId::Revision(row_id(1)));
        assert_eq!(parent_of(&rows, 1), ParentId::None);
    }

    #[test]
    fn out_of_order_timestamps_follow_edit_order() {
        // id 9 was inserted after id 5 but carries the older timestamp.
        let rows = vec![rev(1, 1, "A"), rev(5, 1, "B"), rev(9, 1, "A")];
        assert_eq!(parent_of(&rows, 9), ParentId::Revision(row_id(1)));
        assert_eq!(parent_of(&rows, 5), ParentId::Revision(row_id(9)));
        assert_eq!(parent_of(&rows, 1), ParentId::None);
    }

    #[test]
    fn same_timestamp_match_beats_earlier_timestamp() {
        let rows = vec![
            rev(4, 1, "20200101000000"),
            rev(2, 1, "20200102000000"),
            rev(8, 1, "20200102000000"),
        ];
        assert_eq!(parent_of(&rows, 8), ParentId::Revision(row_id(2)));
        assert_eq!(parent_of(&rows, 2), ParentId::Revision(row_id(4)));
    }

    #[test]
    fn earlier_timestamp_ties_pick_highest_id() {
        let rows = vec![
            rev(3, 1, "20200101000000"),
            rev(7, 1, "20200101000000"),
            rev(5, 1, "20190101000000"),
            rev(10, 1, "20200301000000"),
        ];
        assert_eq!(parent_of(&rows, 10), ParentId::Revision(row_id(7)));
    }

    #[test]
    fn same_timestamp_with_only_larger_ids_falls_back() {
        let rows = vec![rev(2, 1, "B"), rev(6, 1, "B"), rev(1, 1, "A")];
        assert_eq!(parent_of(&rows, 2), ParentId::Revision(row_id(1)));
    }

    #[test]
    fn other_pages_are_ignored() {
        let rows = vec![rev(1, 1, "A"), rev(2, 2, "A"), rev(3, 2, "B"), rev(4, 1, "C")];
        assert_eq!(parent_of(&rows, 4), ParentId::Revision(row_id(1)));
        assert_eq!(parent_of(&rows, 2), ParentId::None);
    }

    #[test]
    fn lone_revision_has_no_parent() {
        let rows = vec![rev(42, 9, "20240101000000")];
        assert_eq!(parent_of(&rows, 42), ParentId::None);
    }

    fn arb_page() -> impl Strategy<Value = Vec<Row>> {
        prop::collection::vec(0_u8..6, 1..40).prop_map(|stamps| {
            stamps
                .into_iter()
                .enumerate()
                .map(|(index, stamp)| rev(index as i64 + 1, 1, &format!("2020010100000{stamp}")))
                .collect()
        })
    }

    proptest! {
        #[test]
        fn prop_parent_chains_terminate(rows in arb_page()) {
            let parents: HashMap<RowId, ParentId> = rows
                .iter()
                .map(|row| (row.id, resolve_parent(row, &rows)))
                .collect();
            let by_id: HashMap<RowId, &Row> = rows.iter().map(|row| (row.id, row)).collect();

            for row in &rows {
                let mut current: &Row = row;
                let mut steps = 0;
                while let ParentId::Revision(parent_id) = parents[&current.id] {
                    let parent = by_id[&parent_id];
                    prop_assert!(
                        (parent.timestamp.as_str(), parent.id) < (current.timestamp.as_str(), current.id)
                    );
                    current = parent;
                    steps += 1;
                    prop_assert!(steps <= rows.len());
                }
            }
        }

        #[test]
        fn prop_every_row_but_the_first_has_a_parent(rows in arb_page()) {
            let first = rows
                .iter()
                .min_by(|a, b| (a.timestamp.as_str(), a.id).cmp(&(b.timestamp.as_str(), b.id)))
                .expect("non-empty page");
            for row in &rows {
                let parent = resolve_parent(row, &rows);
                prop_assert_eq!(parent == ParentId::None, row.id == first.id);
            }
        }
    }
}
