//! Start-up ordering for registered subsystems.

use super::subsystem::{SystemPriority, SystemType};
use crate::error::{CoreError, CoreResult};
use std::collections::{BTreeSet, HashMap};

pub struct Node {
    pub system: SystemType,
    pub priority: SystemPriority,
    /// Registration sequence, the last tie-breaker
    pub seq: usize,
    /// Registered systems this one needs started first
    pub after: Vec<SystemType>,
}

/// Topological order (dependencies first). Among systems whose
/// dependencies are all placed, higher priority goes first, then earlier
/// registration. Any cycle fails the whole sort.
pub fn initialization_order(nodes: &[Node]) -> CoreResult<Vec<SystemType>> {
    let index: HashMap<&SystemType, usize> = nodes.iter().enumerate().map(|(i, n)| (&n.system, i)).collect();

    let mut pending = vec![0usize; nodes.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (i, node) in nodes.iter().enumerate() {
        for dep in &node.after {
            if let Some(&d) = index.get(dep) {
                pending[i] += 1;
                dependents[d].push(i);
            }
        }
    }

    let key = |i: usize| (nodes[i].priority, nodes[i].seq, i);
    let mut ready: BTreeSet<(SystemPriority, usize, usize)> =
        (0..nodes.len()).filter(|i| pending[*i] == 0).map(key).collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(next) = ready.iter().next().copied() {
        ready.remove(&next);
        let (_, _, i) = next;
        order.push(nodes[i].system.clone());
        for &d in &dependents[i] {
            pending[d] -= 1;
            if pending[d] == 0 {
                ready.insert(key(d));
            }
        }
    }

    if order.len() != nodes.len() {
        let stuck: Vec<String> = nodes
            .iter()
            .enumerate()
            .filter(|(i, _)| pending[*i] > 0)
            .map(|(_, n)| n.system.to_string())
            .collect();
        return Err(CoreError::DependencyCycle(format!(
            "circular dependency between {}",
            stuck.join(", ")
        )));
    }
    Ok(order)
}
