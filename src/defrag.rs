//! Defragmenter — compacts living organisms to the low end of the soup
//! (spec §4.6).
//!
//! Genomes are slid down in `start_addr` order with no gaps between them.
//! Because every organism's `ip` is relative to its own `start_addr`
//! (spec §4.2, §9), sliding a genome is just "change `start_addr` and
//! `state.start_addr`, copy the words, done" — no organism's own notion
//! of its instruction pointer has to change. A pending, uncommitted
//! ALLOCATE is dropped rather than relocated; the owning organism simply
//! sees its next SPAWN fail and must ALLOCATE again.

use crate::{mem::MemoryManager, organism::OrganismTable, soup::Soup};

/// Whether compaction alone is worth attempting: fragmented *and* the
/// total free space could satisfy `required` if it weren't scattered.
/// Pairing with [`crate::reaper::Reaper::reap_until_free`] is the
/// scheduler's job — this only answers "would defragmenting help".
pub fn should_defragment(stats: crate::mem::MemStats, threshold: f64, required: usize) -> bool {
    stats.free_cells >= required && stats.fragmentation_ratio() > threshold
}

/// Slide every alive organism down to a contiguous run starting at 0, in
/// ascending `start_addr` order, then rebuild the ownership map to match.
/// Returns the number of organisms that were actually moved.
pub fn defragment(table: &mut OrganismTable, mem: &mut MemoryManager, soup: &mut Soup) -> usize {
    let mut alive: Vec<u64> = table.iter_alive().map(|o| o.id).collect();
    alive.sort_by_key(|&id| table.get(id).unwrap().start_addr);

    let mut moved = 0;
    let mut cursor = 0usize;
    let mut placements = Vec::with_capacity(alive.len());

    for id in alive {
        let (old_addr, size) = {
            let org = table.get(id).unwrap();
            (org.start_addr, org.size)
        };
        if cursor != old_addr {
            let genome: Vec<i32> = soup.as_slice()[old_addr..old_addr + size].to_vec();
            soup.load_words(cursor, &genome);
            let org = table.get_mut(id).unwrap();
            org.start_addr = cursor;
            org.state.start_addr = cursor;
            moved += 1;
        }
        let org = table.get_mut(id).unwrap();
        org.state.pending_alloc = None;
        placements.push((cursor, size, id));
        cursor += size;
    }

    mem.rebuild();
    for (addr, size, id) in placements {
        let alloc_id = mem.mark_used(addr, size);
        table.get_mut(id).unwrap().alloc_id = alloc_id;
    }

    moved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CpuState;
    use crate::organism::Organism;

    fn place(table: &mut OrganismTable, mem: &mut MemoryManager, soup: &mut Soup, addr: usize, size: usize, tag: i32) -> u64 {
        let id = table.reserve_id();
        let alloc_id = mem.mark_used(addr, size);
        let mut state = CpuState::new(addr);
        state.ip = 1; // nonzero, to prove it's untouched by the move
        table.insert(Organism {
            id,
            parent_id: None,
            birth_cycle: 0,
            start_addr: addr,
            size,
            alloc_id,
            alive: true,
            state,
            name: None,
        });
        for i in 0..size {
            soup.write(addr + i, tag);
        }
        id
    }

    #[test]
    fn compacts_two_organisms_with_a_gap_between_them_to_be_adjacent() {
        let mut table = OrganismTable::new();
        let mut mem = MemoryManager::new(32);
        let mut soup = Soup::new(32);

        let a = place(&mut table, &mut mem, &mut soup, 0, 4, 1);
        let b = place(&mut table, &mut mem, &mut soup, 10, 4, 2);

        let moved = defragment(&mut table, &mut mem, &mut soup);
        assert_eq!(moved, 1, "a is already at 0 and doesn't move");

        assert_eq!(table.get(a).unwrap().start_addr, 0);
        assert_eq!(table.get(b).unwrap().start_addr, 4);
        assert_eq!(table.get(a).unwrap().state.ip, 1, "ip is untouched by the move");
        assert_eq!(table.get(b).unwrap().state.ip, 1);

        for i in 0..4 {
            assert_eq!(soup.read(i), Some(1));
        }
        for i in 4..8 {
            assert_eq!(soup.read(i), Some(2));
        }
        assert!(mem.owned_by(0, 4, table.get(a).unwrap().alloc_id));
        assert!(mem.owned_by(4, 4, table.get(b).unwrap().alloc_id));

        let stats = mem.stats();
        assert_eq!(stats.free_cells, 24);
        assert_eq!(stats.largest_free_run, 24, "compaction leaves one contiguous free run");
    }

    #[test]
    fn dead_organisms_are_not_compacted_over() {
        let mut table = OrganismTable::new();
        let mut mem = MemoryManager::new(16);
        let mut soup = Soup::new(16);

        let a = place(&mut table, &mut mem, &mut soup, 0, 4, 1);
        let b = place(&mut table, &mut mem, &mut soup, 8, 4, 2);
        table.get_mut(a).unwrap().alive = false;
        mem.free(0, 4);

        defragment(&mut table, &mut mem, &mut soup);
        assert_eq!(table.get(b).unwrap().start_addr, 0);
    }
}
