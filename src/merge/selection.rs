//! Choosing which parts to merge.
//!
//! Every merge rewrites all rows of its inputs, so the selection looks for a
//! run of similarly sized parts whose merge grows the largest input the most.
//! The multiplier `m = rows(output) / rows(largest input)` bounds write
//! amplification: a row is rewritten once per level and every level grows
//! part sizes by at least `m`.

/// Default upper bound on the number of parts in one merge.
pub const DEFAULT_PARTS_TO_MERGE: usize = 15;

/// Lowest part count tried by a final merge.
pub const FINAL_PARTS_TO_MERGE: usize = 3;

/// Minimum multiplier a merge must reach.
const MIN_MERGE_MULTIPLIER: f64 = 1.7;

/// What the selection needs to know about a part.
pub trait MergeCandidate {
    fn rows_count(&self) -> u64;
    fn min_timestamp(&self) -> i64;
}

/// Append to `dst` the parts of `src` that give the best merge of at most
/// `max_parts_to_merge` parts with at most `max_out_rows` output rows.
/// Nothing is appended when no merge is worth its cost.
pub fn append_parts_to_merge<T: MergeCandidate + Clone>(
    dst: &mut Vec<T>,
    src: &[T],
    max_parts_to_merge: usize,
    max_out_rows: u64,
) {
    if src.len() < 2 || max_parts_to_merge < 2 {
        return;
    }
    let max_in_part_rows = max_out_rows / 2;
    let mut src: Vec<&T> = src.iter().filter(|p| p.rows_count() <= max_in_part_rows).collect();
    // Among equal sizes prefer newer parts: they tend to overlap in time.
    src.sort_by(|a, b| {
        a.rows_count()
            .cmp(&b.rows_count())
            .then(b.min_timestamp().cmp(&a.min_timestamp()))
    });

    let max_src_parts = max_parts_to_merge.min(src.len());
    let mut best: &[&T] = &[];
    let mut max_m = 0f64;
    for n in 2..=max_src_parts {
        for window in src.windows(n) {
            let smallest = window[0].rows_count();
            let largest = window[n - 1].rows_count();
            if smallest.saturating_mul(n as u64) < largest {
                // Too unbalanced.
                continue;
            }
            let out_rows: u64 = window.iter().map(|p| p.rows_count()).sum();
            if out_rows > max_out_rows {
                // Later windows are only bigger.
                break;
            }
            let m = out_rows as f64 / largest.max(1) as f64;
            if m < max_m {
                continue;
            }
            max_m = m;
            best = window;
        }
    }

    let min_m = (max_parts_to_merge as f64 / 2.0).max(MIN_MERGE_MULTIPLIER);
    if max_m < min_m {
        return;
    }
    dst.extend(best.iter().map(|&p| p.clone()));
}

/// Parts for the next merge. A final merge accepts ever smaller merges down
/// to [`FINAL_PARTS_TO_MERGE`] parts.
pub fn parts_to_merge<T: MergeCandidate + Clone>(src: &[T], max_out_rows: u64, is_final: bool) -> Vec<T> {
    let mut dst = Vec::new();
    if !is_final {
        append_parts_to_merge(&mut dst, src, DEFAULT_PARTS_TO_MERGE, max_out_rows);
        return dst;
    }
    for max_parts in (FINAL_PARTS_TO_MERGE..=DEFAULT_PARTS_TO_MERGE).rev() {
        append_parts_to_merge(&mut dst, src, max_parts, max_out_rows);
        if !dst.is_empty() {
            break;
        }
    }
    dst
}
