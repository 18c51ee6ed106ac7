//! Token-set similarity and near-duplicate removal.

use std::cmp::Ordering;
use std::collections::BTreeSet;

/// Default Jaccard threshold above which two titles are near-duplicates.
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.75;

/// Lowercased alphanumeric tokens of a title.
pub fn title_tokens(title: &str) -> BTreeSet<String> {
    title
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

/// Jaccard similarity of two token sets. Two empty sets are identical.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    intersection as f64 / union as f64
}

pub fn title_similarity(a: &str, b: &str) -> f64 {
    jaccard(&title_tokens(a), &title_tokens(b))
}

/// Remove near-duplicate items.
///
/// Items are visited by score (descending), then insertion order; an item is
/// kept unless its title similarity with an item already kept is strictly
/// above `threshold`. Survivors are returned in their original insertion order
/// together with the number of items removed.
pub fn dedupe_by_title<T, FT, FS>(
    items: Vec<T>,
    threshold: f64,
    title: FT,
    score: FS,
) -> (Vec<T>, usize)
where
    FT: Fn(&T) -> &str,
    FS: Fn(&T) -> f64,
{
    let tokens: Vec<BTreeSet<String>> = items.iter().map(|item| title_tokens(title(item))).collect();

    let mut order: Vec<usize> = (0..items.len()).collect();
    order.sort_by(|&a, &b| {
        score(&items[b])
            .partial_cmp(&score(&items[a]))
            .unwrap_or(Ordering::Equal)
            .then(a.cmp(&b))
    });

    let mut kept_idx: Vec<usize> = Vec::with_capacity(items.len());
    for idx in order {
        let duplicate = kept_idx
            .iter()
            .any(|&k| jaccard(&tokens[idx], &tokens[k]) > threshold);
        if !duplicate {
            kept_idx.push(idx);
        }
    }
    kept_idx.sort_unstable();

    let removed = items.len() - kept_idx.len();
    let mut keep = vec![false; items.len()];
    for idx in kept_idx {
        keep[idx] = true;
    }
    let kept = items
        .into_iter()
        .zip(keep)
        .filter_map(|(item, keep)| keep.then_some(item))
        .collect();
    (kept, removed)
}
