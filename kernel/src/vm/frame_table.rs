//! Global frame table: tracks which physical frame backs which user page,
//! and picks eviction victims with a second-chance (clock) algorithm when
//! the physical allocator runs dry.
//!
//! Every operation here runs under a single `frame_lock`-equivalent
//! (the table's own `Mutex`) so the clock hand, the bookkeeping map and
//! the physical allocator it drives never see a torn update. Callers pass
//! in the [`super::PhysFrameAllocator`] and [`super::Mmu`] implementations
//! to use, so the exact same code path runs against real hardware and
//! against the fakes in `vm::fakes`.

use super::{Mmu, PhysFrameAllocator, PAGE_SIZE};
use crate::process::Pid;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use spin::Mutex;

/// A frame is identified by its physical address.
pub type FrameId = u64;

#[derive(Clone, Copy)]
pub struct FrameTableEntry {
    pub owner: Pid,
    pub uvpage: u64,
    pub pinned: bool,
}

struct FrameTableState {
    entries: BTreeMap<FrameId, FrameTableEntry>,
    /// Clock ring: the allocation order frames are visited in when looking
    /// for an eviction victim.
    clock: Vec<FrameId>,
    hand: usize,
}

static TABLE: Mutex<FrameTableState> = Mutex::new(FrameTableState {
    entries: BTreeMap::new(),
    clock: Vec::new(),
    hand: 0,
});

pub fn init() {
    let mut t = TABLE.lock();
    t.entries.clear();
    t.clock.clear();
    t.hand = 0;
}

/// Allocate a zeroed frame for `owner`'s page at `uvpage`. Evicts a victim
/// and retries once if the physical allocator is out of frames; if the
/// retry still fails there is nothing left to reclaim and this panics —
/// an allocation request that can't be satisfied even after a successful
/// eviction means the frame table's own bookkeeping disagrees with the
/// physical allocator's free count, which is a contract violation.
pub fn alloc(falloc: &dyn PhysFrameAllocator, mmu: &dyn Mmu, owner: Pid, uvpage: u64) -> FrameId {
    if let Some(kframe) = falloc.alloc_zeroed() {
        insert(kframe, owner, uvpage);
        return kframe;
    }
    evict_one(falloc, mmu);
    match falloc.alloc_zeroed() {
        Some(kframe) => {
            insert(kframe, owner, uvpage);
            kframe
        }
        None => panic!("vm::frame_table: alloc failed even after eviction"),
    }
}

fn insert(kframe: FrameId, owner: Pid, uvpage: u64) {
    let mut t = TABLE.lock();
    t.entries.insert(kframe, FrameTableEntry { owner, uvpage, pinned: true });
    t.clock.push(kframe);
}

/// Detach `kframe`'s bookkeeping and return the physical page to `falloc`.
pub fn free(falloc: &dyn PhysFrameAllocator, kframe: FrameId) {
    remove_entry(kframe);
    falloc.free(kframe);
}

/// Detach `kframe`'s bookkeeping only — used when eviction has already
/// handed the physical page back to the allocator itself.
pub fn remove_entry(kframe: FrameId) {
    let mut t = TABLE.lock();
    t.entries.remove(&kframe);
    if let Some(idx) = t.clock.iter().position(|&f| f == kframe) {
        t.clock.remove(idx);
        if t.hand > idx {
            t.hand -= 1;
        }
    }
}

/// Mark `kframe` as pinned (ineligible for eviction) while the kernel is
/// copying data into or out of it. Panics if `kframe` has no entry —
/// pinning an unknown frame means a caller raced a free.
pub fn pin(kframe: FrameId) {
    let mut t = TABLE.lock();
    let e = t.entries.get_mut(&kframe).expect("vm::frame_table: pin on unknown frame");
    e.pinned = true;
}

/// Clear `kframe`'s pin, making it eligible for eviction again. Panics if
/// `kframe` has no entry, for the same reason as [`pin`].
pub fn unpin(kframe: FrameId) {
    let mut t = TABLE.lock();
    let e = t.entries.get_mut(&kframe).expect("vm::frame_table: unpin on unknown frame");
    e.pinned = false;
}

/// Evict one unpinned, not-recently-accessed frame: write it to swap,
/// update its owner's supplemental page table entry, and return the
/// physical page to `falloc`. Scans at most twice around the clock ring
/// before giving up — by then every unpinned frame has had its accessed
/// bit cleared once, so a second full pass with nothing evictable means
/// every frame really is pinned, which is a kernel bug (not something a
/// user process can trigger), so this panics rather than returning an
/// error the caller has no sane way to handle.
fn evict_one(falloc: &dyn PhysFrameAllocator, mmu: &dyn Mmu) {
    let limit = {
        let t = TABLE.lock();
        if t.clock.is_empty() {
            panic!("vm::frame_table: no frames to evict (frame table empty)");
        }
        2 * t.clock.len()
    };

    for _ in 0..limit {
        let (kframe, owner, uvpage, pinned) = {
            let mut t = TABLE.lock();
            if t.hand >= t.clock.len() {
                t.hand = 0;
            }
            let kframe = t.clock[t.hand];
            let e = *t.entries.get(&kframe).expect("vm::frame_table: clock entry with no bookkeeping");
            (kframe, e.owner, e.uvpage, e.pinned)
        };

        if pinned {
            TABLE.lock().hand += 1;
            continue;
        }

        if mmu.is_accessed(owner, uvpage) {
            mmu.set_accessed(owner, uvpage, false);
            TABLE.lock().hand += 1;
            continue;
        }

        // Victim found: evict it. The page may have been written through
        // either alias — the user mapping or the kernel's own HHDM window
        // onto the same frame — so both dirty bits have to be consulted;
        // trusting the user alias alone misses writes the kernel made
        // directly into the frame.
        mmu.unmap(owner, uvpage);
        let dirty = mmu.is_dirty(owner, uvpage) || mmu.is_frame_dirty(kframe);

        let mut page = [0u8; PAGE_SIZE];
        falloc.read_frame(kframe, &mut page);
        let slot = super::swap::out(&page);

        remove_entry(kframe);
        falloc.free(kframe);

        super::spt::set_swap(owner, uvpage, slot);
        if dirty {
            super::spt::set_dirty(owner, uvpage, true);
        }
        return;
    }

    panic!("vm::frame_table: evict_one visited every frame twice without finding a victim");
}

/// Number of frames currently tracked (for diagnostics/tests).
pub fn len() -> usize {
    TABLE.lock().entries.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::fakes::{FakeFrameAllocator, FakeMmu};

    fn reset() {
        init();
    }

    #[test]
    fn alloc_tracks_owner_and_page() {
        reset();
        let falloc = FakeFrameAllocator::with_frames(4);
        let mmu = FakeMmu::new();
        let kframe = alloc(&falloc, &mmu, 7, 0x4000_0000);
        mmu.map(7, 0x4000_0000, kframe, true).unwrap();
        assert_eq!(len(), 1);
    }

    #[test]
    fn pin_blocks_eviction_until_unpinned() {
        reset();
        let falloc = FakeFrameAllocator::with_frames(1);
        let mmu = FakeMmu::new();
        let kframe = alloc(&falloc, &mmu, 1, 0x1000);
        mmu.map(1, 0x1000, kframe, true).unwrap();
        // the only frame is still pinned from allocation; unpin it so a
        // second allocation can evict it instead of panicking.
        unpin(kframe);
        let _second = alloc(&falloc, &mmu, 2, 0x2000);
        assert_eq!(len(), 1);
    }

    #[test]
    #[should_panic(expected = "unknown frame")]
    fn unpin_unknown_frame_panics() {
        reset();
        unpin(0xdead_0000);
    }
}
