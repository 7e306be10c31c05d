//! Grim reaper — FIFO-by-age death queue (spec §4.5).
//!
//! Reaping oldest-first is the classical Tierra selection pressure: fast
//! reproducers accumulate more descendants before their ancestor is culled.
//! The queue is allowed to go stale (an organism can die by the error path
//! before its turn comes up); cleanup on pop is lazy rather than eager.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashSet},
};

use serde::{Deserialize, Serialize};

use crate::{mem::MemoryManager, organism::OrganismTable};

/// Safety cap on kills per `reap_until_free` call, so a pathological
/// configuration (e.g. `required_size` larger than the whole soup) cannot
/// spin forever.
pub const MAX_REAP_PER_CALL: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reaper {
    queue: BinaryHeap<Reverse<(u64, u64)>>,
    removed: HashSet<u64>,
}

impl Default for Reaper {
    fn default() -> Self { Self::new() }
}

impl Reaper {
    pub fn new() -> Self { Reaper { queue: BinaryHeap::new(), removed: HashSet::new() } }

    /// Enqueue an organism by `(birth_cycle, id)` — oldest `birth_cycle`
    /// pops first, ties broken by id (both are monotone, so this is a
    /// total, reproducible order).
    pub fn register(&mut self, id: u64, birth_cycle: u64) { self.queue.push(Reverse((birth_cycle, id))); }

    /// Mark an id as no longer reapable (e.g. it died via the error path).
    /// The stale heap entry is dropped lazily the next time it's popped.
    pub fn unregister(&mut self, id: u64) { self.removed.insert(id); }

    /// Pop entries until an alive organism is found, kill it, free its
    /// span and any pending allocation, and return its id. `None` if the
    /// queue drains first.
    pub fn reap(&mut self, table: &mut OrganismTable, mem: &mut MemoryManager) -> Option<u64> {
        while let Some(Reverse((_birth_cycle, id))) = self.queue.pop() {
            if self.removed.remove(&id) {
                continue;
            }
            if let Some(org) = table.get_mut(id) {
                if org.alive {
                    org.alive = false;
                    mem.free(org.start_addr, org.size);
                    if let Some(p) = org.state.pending_alloc.take() {
                        mem.free_by_id(p.addr, p.size, p.alloc_id);
                    }
                    return Some(id);
                }
            }
        }
        None
    }

    /// Keep reaping while neither the largest free run nor total free
    /// space can satisfy `required` — i.e. defragmentation alone would not
    /// suffice — bounded by [`MAX_REAP_PER_CALL`] and an empty queue.
    /// Returns the ids of every organism killed, oldest first.
    pub fn reap_until_free(&mut self, required: usize, table: &mut OrganismTable, mem: &mut MemoryManager) -> Vec<u64> {
        let mut killed = Vec::new();
        while killed.len() < MAX_REAP_PER_CALL {
            let stats = mem.stats();
            if stats.largest_free_run >= required || stats.free_cells >= required {
                break;
            }
            match self.reap(table, mem) {
                Some(id) => killed.push(id),
                None => break,
            }
        }
        killed
    }

    pub fn is_empty(&self) -> bool { self.queue.iter().all(|Reverse((_, id))| self.removed.contains(id)) }
}
