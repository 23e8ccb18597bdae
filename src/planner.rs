//! Plan selection — which index serves which predicate leaf.
//!
//! An index is usable for a column constrained by `=`, `IN`, a range
//! operator, or a `LIKE` whose pattern opens with a literal prefix.  A
//! composite index is usable when every column in its list is
//! equality-constrained, forming the full concatenated key.  Candidates are
//! scored `selectivity · prefixMatch / √blockCount`; ties break by columns
//! covered, then by lowest distinct count.  `!=` and `IS NULL` never use an
//! index.

use crate::predicate::{like_prefix, CmpOp, Predicate};
use crate::record::COMPOSITE_SEP;

/// Catalog entry for one loaded index.
#[derive(Debug, Clone)]
pub struct IndexInfo {
    pub columns:        Vec<String>,
    pub block_count:    usize,
    pub distinct_count: u64,
}

/// How a chosen index is driven.
#[derive(Debug, Clone, PartialEq)]
pub enum AccessBound {
    /// Exact key match (single column, or a joined composite key).
    Eq(Vec<u8>),
    /// One exact match per set member.
    In(Vec<Vec<u8>>),
    /// Keys on one side of `value`, compared like the executor compares.
    Range { op: CmpOp, value: Vec<u8> },
    /// Keys beginning with the literal prefix of a `LIKE` pattern; the full
    /// pattern is re-checked against the row.
    LikePrefix { prefix: Vec<u8>, pattern: Vec<u8> },
}

/// A scored way to answer one or more predicate leaves from one index.
#[derive(Debug, Clone)]
pub struct Access {
    pub index:   usize,
    pub bound:   AccessBound,
    /// Indices of the AND children this access fully answers.
    pub covered: Vec<usize>,
    pub score:   f64,
}

// ── Leaf classification ──────────────────────────────────────────────────────

/// The ways one leaf can drive a single-column index, if any.
fn leaf_bound(leaf: &Predicate) -> Option<(&str, AccessBound)> {
    match leaf {
        Predicate::Cmp { op: CmpOp::Eq, column, value } => {
            Some((column, AccessBound::Eq(value.as_bytes().to_vec())))
        }
        Predicate::Cmp { op: CmpOp::Ne, .. } => None,
        Predicate::Cmp { op, column, value } => Some((
            column,
            AccessBound::Range { op: *op, value: value.as_bytes().to_vec() },
        )),
        Predicate::In { column, values } => Some((
            column,
            AccessBound::In(values.iter().map(|v| v.as_bytes().to_vec()).collect()),
        )),
        Predicate::Like { column, pattern } => {
            let prefix = like_prefix(pattern.as_bytes());
            if prefix.is_empty() {
                return None;
            }
            Some((
                column,
                AccessBound::LikePrefix {
                    prefix: prefix.to_vec(),
                    pattern: pattern.as_bytes().to_vec(),
                },
            ))
        }
        _ => None,
    }
}

fn selectivity(bound: &AccessBound) -> f64 {
    match bound {
        AccessBound::Eq(_) | AccessBound::In(_) => 1.0,
        AccessBound::LikePrefix { .. } => 0.75,
        AccessBound::Range { .. } => 0.5,
    }
}

fn score(bound: &AccessBound, info: &IndexInfo) -> f64 {
    // Every usable access covers the index's full column list, so the
    // prefix-match factor is 1; it is kept explicit for readability.
    let prefix_match = 1.0;
    selectivity(bound) * prefix_match / (info.block_count.max(1) as f64).sqrt()
}

fn better(a: &Access, b: &Access, catalog: &[IndexInfo]) -> bool {
    if a.score != b.score {
        return a.score > b.score;
    }
    let (ca, cb) = (catalog[a.index].columns.len(), catalog[b.index].columns.len());
    if ca != cb {
        return ca > cb;
    }
    catalog[a.index].distinct_count < catalog[b.index].distinct_count
}

// ── Planning ─────────────────────────────────────────────────────────────────

/// Best access for a lone leaf, outside any `AND` context.
pub fn plan_leaf(leaf: &Predicate, catalog: &[IndexInfo]) -> Option<Access> {
    let (column, bound) = leaf_bound(leaf)?;
    let mut best: Option<Access> = None;
    for (i, info) in catalog.iter().enumerate() {
        if info.columns.len() != 1 || info.columns[0] != column {
            continue;
        }
        let candidate = Access {
            index:   i,
            bound:   bound.clone(),
            covered: vec![0],
            score:   score(&bound, info),
        };
        if best.as_ref().map_or(true, |b| better(&candidate, b, catalog)) {
            best = Some(candidate);
        }
    }
    best
}

/// Best access for the children of an `AND`: either the strongest
/// single-leaf access, or a composite index whose every column is
/// equality-constrained by some child.
pub fn plan_and(children: &[Predicate], catalog: &[IndexInfo]) -> Option<Access> {
    let mut best: Option<Access> = None;

    // Single-leaf candidates.
    for (child_idx, child) in children.iter().enumerate() {
        if let Some(mut access) = plan_leaf(child, catalog) {
            access.covered = vec![child_idx];
            if best.as_ref().map_or(true, |b| better(&access, b, catalog)) {
                best = Some(access);
            }
        }
    }

    // Composite candidates: every index column must have an equality child.
    for (i, info) in catalog.iter().enumerate() {
        if info.columns.len() < 2 {
            continue;
        }
        let mut covered = Vec::with_capacity(info.columns.len());
        let mut key = Vec::new();
        let mut usable = true;
        for (pos, col) in info.columns.iter().enumerate() {
            let found = children.iter().enumerate().find_map(|(ci, c)| match c {
                Predicate::Cmp { op: CmpOp::Eq, column, value } if column == col => {
                    Some((ci, value.as_bytes()))
                }
                _ => None,
            });
            match found {
                Some((ci, value)) => {
                    if pos > 0 {
                        key.push(COMPOSITE_SEP);
                    }
                    key.extend_from_slice(value);
                    covered.push(ci);
                }
                None => {
                    usable = false;
                    break;
                }
            }
        }
        if !usable {
            continue;
        }
        let bound = AccessBound::Eq(key);
        let candidate = Access {
            index: i,
            score: score(&bound, info),
            bound,
            covered,
        };
        if best.as_ref().map_or(true, |b| better(&candidate, b, catalog)) {
            best = Some(candidate);
        }
    }

    best
}
