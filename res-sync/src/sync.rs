//! Reconciliation of a stale replica against a fresh snapshot.
//!
//! Both diffs produce changes in the same shape live server events have, so
//! the cache can replay them through its regular event path and observers
//! cannot tell a resync from a live update.

use crate::value::{Fields, ResValue};

/// Fields that differ between `old` and `new`, mapped to their new value.
/// Fields missing from `new` map to [`ResValue::Delete`].
pub fn diff_model(old: &Fields, new: &Fields) -> Fields {
    let mut changes = Fields::new();
    for (key, value) in new {
        if old.get(key) != Some(value) {
            changes.insert(key.clone(), value.clone());
        }
    }
    for key in old.keys() {
        if !new.contains_key(key) {
            changes.insert(key.clone(), ResValue::Delete);
        }
    }
    changes
}

/// One step of a collection edit script.
#[derive(Debug, Clone, PartialEq)]
pub enum EditOp {
    Add { index: usize, value: ResValue },
    Remove { index: usize },
}

/// Minimal add/remove script turning `old` into `new`.
///
/// Elements on a longest common subsequence are left in place. Each index
/// refers to the list as it is after all preceding operations, so the script
/// can be replayed in order. Removals are emitted before additions when both
/// are equally short.
pub fn diff_collection(old: &[ResValue], new: &[ResValue]) -> Vec<EditOp> {
    let prefix = old
        .iter()
        .zip(new.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let suffix = old[prefix..]
        .iter()
        .rev()
        .zip(new[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();

    let a = &old[prefix..old.len() - suffix];
    let b = &new[prefix..new.len() - suffix];
    let (n, m) = (a.len(), b.len());

    // lcs[i][j] is the LCS length of a[i..] and b[j..].
    let mut lcs = vec![vec![0usize; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i][j] = if a[i] == b[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let mut ops = Vec::new();
    let (mut i, mut j, mut pos) = (0, 0, prefix);
    while i < n || j < m {
        if i < n && j < m && a[i] == b[j] {
            i += 1;
            j += 1;
            pos += 1;
        } else if i < n && (j == m || lcs[i + 1][j] >= lcs[i][j + 1]) {
            ops.push(EditOp::Remove { index: pos });
            i += 1;
        } else {
            ops.push(EditOp::Add {
                index: pos,
                value: b[j].clone(),
            });
            j += 1;
            pos += 1;
        }
    }
    ops
}
