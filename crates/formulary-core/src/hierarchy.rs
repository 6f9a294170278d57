//! Discipline hierarchy checks.
//!
//! The hierarchy is a forest. Acyclicity is enforced at write time by
//! walking the proposed parent's ancestor chain, not left to storage.

use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::models::SurrogateKey;

/// Verify that making `parent` the parent of `discipline` keeps the forest acyclic.
///
/// `parent_of` returns the current parent of a discipline. A chain that
/// revisits a node (pre-existing corruption) is also reported as a cycle.
pub fn check_parent_assignment<F>(
    discipline: SurrogateKey,
    parent: SurrogateKey,
    mut parent_of: F,
) -> Result<()>
where
    F: FnMut(SurrogateKey) -> Option<SurrogateKey>,
{
    let cycle = || Error::CycleDetected { discipline, parent };

    if discipline == parent {
        return Err(cycle());
    }

    let mut seen = HashSet::new();
    let mut cursor = Some(parent);
    while let Some(node) = cursor {
        if node == discipline || !seen.insert(node) {
            return Err(cycle());
        }
        cursor = parent_of(node);
    }
    Ok(())
}

/// Ancestor chain of `start`, nearest first, `start` included.
///
/// Stops at the first repeated node so corrupted data cannot loop forever.
pub fn ancestor_chain<F>(start: SurrogateKey, mut parent_of: F) -> Vec<SurrogateKey>
where
    F: FnMut(SurrogateKey) -> Option<SurrogateKey>,
{
    let mut chain = Vec::new();
    let mut seen = HashSet::new();
    let mut cursor = Some(start);
    while let Some(node) = cursor {
        if !seen.insert(node) {
            break;
        }
        chain.push(node);
        cursor = parent_of(node);
    }
    chain
}

/// Topic resolution chain from the stored handles of a primary discipline
/// and its ancestors, nearest first.
///
/// Empty when the primary itself has no handle: an ancestor must never be
/// read as the primary. Ancestors without a handle carry no rule and are
/// passed over.
pub fn topic_chain<I>(handles: I) -> Vec<Handle>
where
    I: IntoIterator<Item = Option<Handle>>,
{
    let mut handles = handles.into_iter();
    match handles.next() {
        Some(Some(primary)) => std::iter::once(primary).chain(handles.flatten()).collect(),
        _ => Vec::new(),
    }
}
