//! Wait-for graph

use std::collections::{HashMap, HashSet};

use super::LockerId;

/// Edges point from a waiting locker to the lockers blocking it
#[derive(Debug, Default)]
pub(super) struct WaitForGraph {
    edges: HashMap<LockerId, Vec<LockerId>>,
}

impl WaitForGraph {
    pub fn add_edge(&mut self, waiter: LockerId, blocker: LockerId) {
        let targets = self.edges.entry(waiter).or_default();
        if !targets.contains(&blocker) {
            targets.push(blocker);
        }
    }

    /// Lockers on a cycle that passes through `start`, starting with it
    pub fn cycle_through(&self, start: LockerId) -> Option<Vec<LockerId>> {
        let mut path = vec![start];
        let mut visited = HashSet::from([start]);
        if self.search(start, start, &mut visited, &mut path) {
            Some(path)
        } else {
            None
        }
    }

    fn search(
        &self,
        node: LockerId,
        start: LockerId,
        visited: &mut HashSet<LockerId>,
        path: &mut Vec<LockerId>,
    ) -> bool {
        let Some(targets) = self.edges.get(&node) else {
            return false;
        };
        for &next in targets {
            if next == start {
                return true;
            }
            if visited.insert(next) {
                path.push(next);
                if self.search(next, start, visited, path) {
                    return true;
                }
                path.pop();
            }
        }
        false
    }
}
