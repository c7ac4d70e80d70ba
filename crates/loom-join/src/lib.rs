//! Set reconciliation — the join primitive behind every control loop.
//!
//! Each reconciler in the system compares a desired collection against an
//! observed one: database machines vs. cloud inventory, scheduled containers
//! vs. runtime inventory, target veths vs. the links on the host. [`join`]
//! pairs up the elements that correspond and returns the leftovers on both
//! sides, so a reconciler is always "pairs are fine or need patching, left
//! unmatched gets created, right unmatched gets destroyed".
//!
//! [`hash_join`] is the fast path for the common case where correspondence
//! is plain key equality.

/// A matched element from each side of a join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pair<L, R> {
    pub l: L,
    pub r: R,
}

/// Pair elements of `lefts` and `rights` by a score function.
///
/// `score` returns `-1` to forbid a pairing, `0` for a perfect match, and a
/// positive value for an acceptable but imperfect one. Perfect matches are
/// taken greedily in a first pass; the remainder are resolved by choosing,
/// for each remaining left in order, the lowest-scoring remaining right
/// (first such right wins ties, so results are stable).
///
/// Every element of the input appears exactly once in the output: either in
/// a pair or in the corresponding unmatched list. No returned pair has a
/// negative score.
pub fn join<L, R, F>(lefts: Vec<L>, rights: Vec<R>, score: F) -> (Vec<Pair<L, R>>, Vec<L>, Vec<R>)
where
    F: Fn(&L, &R) -> i32,
{
    let mut rights: Vec<Option<R>> = rights.into_iter().map(Some).collect();
    let mut pairs = Vec::new();
    let mut left_unmatched = Vec::new();

    // First pass: greedy perfect matches.
    let mut deferred = Vec::new();
    'outer: for l in lefts {
        for slot in rights.iter_mut() {
            if let Some(r) = slot {
                if score(&l, r) == 0 {
                    let r = slot.take().unwrap();
                    pairs.push(Pair { l, r });
                    continue 'outer;
                }
            }
        }
        deferred.push(l);
    }

    // Second pass: cheapest acceptable match for whatever remains.
    for l in deferred {
        let mut best: Option<(usize, i32)> = None;
        for (i, slot) in rights.iter().enumerate() {
            if let Some(r) = slot {
                let s = score(&l, r);
                if s < 0 {
                    continue;
                }
                if best.map_or(true, |(_, bs)| s < bs) {
                    best = Some((i, s));
                }
            }
        }

        match best {
            Some((i, _)) => {
                let r = rights[i].take().unwrap();
                pairs.push(Pair { l, r });
            }
            None => left_unmatched.push(l),
        }
    }

    let right_unmatched = rights.into_iter().flatten().collect();
    (pairs, left_unmatched, right_unmatched)
}

/// Pair elements whose keys are equal, in O(|lefts| + |rights|).
///
/// Equivalent to [`join`] with a score function returning `0` on key
/// equality and `-1` otherwise. Duplicate keys pair up in input order.
pub fn hash_join<L, R, K, FL, FR>(
    lefts: Vec<L>,
    rights: Vec<R>,
    key_l: FL,
    key_r: FR,
) -> (Vec<Pair<L, R>>, Vec<L>, Vec<R>)
where
    K: std::hash::Hash + Eq,
    FL: Fn(&L) -> K,
    FR: Fn(&R) -> K,
{
    use std::collections::HashMap;

    let mut by_key: HashMap<K, Vec<usize>> = HashMap::new();
    for (i, r) in rights.iter().enumerate() {
        by_key.entry(key_r(r)).or_default().push(i);
    }
    // Pop from the front so duplicates match in input order.
    for idxs in by_key.values_mut() {
        idxs.reverse();
    }

    let mut rights: Vec<Option<R>> = rights.into_iter().map(Some).collect();
    let mut pairs = Vec::new();
    let mut left_unmatched = Vec::new();

    for l in lefts {
        match by_key.get_mut(&key_l(&l)).and_then(|idxs| idxs.pop()) {
            Some(i) => {
                let r = rights[i].take().unwrap();
                pairs.push(Pair { l, r });
            }
            None => left_unmatched.push(l),
        }
    }

    let right_unmatched = rights.into_iter().flatten().collect();
    (pairs, left_unmatched, right_unmatched)
}
