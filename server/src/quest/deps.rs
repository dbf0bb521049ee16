//! Prerequisite graph checks. Edges point from a quest to its prerequisites.

use std::collections::{BTreeSet, HashSet};

/// True if `goal` is reachable from `start` by following prerequisite edges.
pub fn reaches<'a, F>(start: u32, goal: u32, prerequisites_of: F) -> bool
where
    F: Fn(u32) -> Option<&'a BTreeSet<u32>>,
{
    let mut stack = vec![start];
    let mut seen = HashSet::new();
    while let Some(node) = stack.pop() {
        if node == goal {
            return true;
        }
        if !seen.insert(node) {
            continue;
        }
        if let Some(next) = prerequisites_of(node) {
            stack.extend(next.iter().copied());
        }
    }
    false
}

/// Whether making `quest` depend on `prerequisite` would close a cycle.
pub fn would_cycle<'a, F>(quest: u32, prerequisite: u32, prerequisites_of: F) -> bool
where
    F: Fn(u32) -> Option<&'a BTreeSet<u32>>,
{
    quest == prerequisite || reaches(prerequisite, quest, prerequisites_of)
}
