//! Merge candidate selection
//!
//! Pure functions over part sizes and timestamps. The scheduler calls them
//! under the parts lock, so they never touch the filesystem.

/// Preferred number of source parts per merge
pub const DEFAULT_PARTS_TO_MERGE: usize = 15;

/// Smallest output/largest-input ratio worth the write amplification
pub const MIN_MERGE_MULTIPLIER: f64 = 1.7;

/// What selection needs to know about a part
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartCandidate {
    pub id: u64,
    pub compressed_size_bytes: u64,
    pub min_timestamp: i64,
}

/// Pick the contiguous window of size-sorted parts with the best merge
/// multiplier whose output fits in `max_out_bytes`
///
/// Returns the ids of the chosen parts, or nothing when no window reaches
/// `max(DEFAULT_PARTS_TO_MERGE / 2, MIN_MERGE_MULTIPLIER)`.
pub fn append_parts_to_merge(dst: &mut Vec<u64>, src: &[PartCandidate], max_out_bytes: u64) {
    if src.len() < 2 {
        return;
    }

    // A part bigger than this cannot take part in a useful merge
    let max_in_part_bytes = (max_out_bytes as f64 / MIN_MERGE_MULTIPLIER) as u64;
    let mut parts: Vec<PartCandidate> = src
        .iter()
        .filter(|p| p.compressed_size_bytes <= max_in_part_bytes)
        .copied()
        .collect();
    sort_parts_for_optimal_merge(&mut parts);

    let max_src_parts = DEFAULT_PARTS_TO_MERGE.min(parts.len());
    let min_src_parts = ((max_src_parts + 1) / 2).max(2);

    let mut best: &[PartCandidate] = &[];
    let mut best_m = 0.0f64;
    for n in min_src_parts..=max_src_parts {
        for start in 0..=(parts.len() - n) {
            let window = &parts[start..start + n];
            let first = window[0].compressed_size_bytes;
            let last = window[n - 1].compressed_size_bytes;
            if first.saturating_mul(n as u64) < last {
                // Too unbalanced
                continue;
            }
            let out_size: u64 = window.iter().map(|p| p.compressed_size_bytes).sum();
            if out_size > max_out_bytes {
                // Later windows only hold bigger parts
                break;
            }
            let m = out_size as f64 / last.max(1) as f64;
            if m < best_m {
                continue;
            }
            best_m = m;
            best = window;
        }
    }

    let min_m = (DEFAULT_PARTS_TO_MERGE as f64 / 2.0).max(MIN_MERGE_MULTIPLIER);
    if best_m < min_m {
        return;
    }
    dst.extend(best.iter().map(|p| p.id));
}

/// Split `parts` into the best merge window and the rest
///
/// When no window qualifies, all parts are merged together. Used for final
/// merges where every part must be handled in one pass.
pub fn get_parts_for_optimal_merge(parts: &[PartCandidate]) -> (Vec<u64>, Vec<PartCandidate>) {
    let mut chosen = Vec::new();
    append_parts_to_merge(&mut chosen, parts, u64::MAX);
    if chosen.is_empty() {
        return (parts.iter().map(|p| p.id).collect(), Vec::new());
    }
    let rest = parts
        .iter()
        .filter(|p| !chosen.contains(&p.id))
        .copied()
        .collect();
    (chosen, rest)
}

/// Smallest first; among equal sizes the newest data first
fn sort_parts_for_optimal_merge(parts: &mut [PartCandidate]) {
    parts.sort_by(|a, b| {
        a.compressed_size_bytes
            .cmp(&b.compressed_size_bytes)
            .then(b.min_timestamp.cmp(&a.min_timestamp))
            .then(a.id.cmp(&b.id))
    });
}
