//! Swap slot allocator.
//!
//! A swap slot is a page-sized `SlotId` on the `BlockDevice` wired up by
//! [`init`]. There is no notion of ownership here — slot accounting is a
//! plain bitmap, exactly like pintos' `vm/swap.c`. The caller (the frame
//! table's eviction path, and the supplemental page table's `load_page`)
//! is responsible for knowing which slot belongs to which page; handing
//! this allocator a slot it doesn't recognize as allocated is a
//! programming error and panics rather than returning an error, since
//! there is no way to recover from double-freeing or double-loading a
//! swap slot without risking silent data corruption.

use super::{BlockDevice, NvmeBlockDevice, PAGE_SIZE};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use spin::Mutex;

pub type SlotId = u32;

/// Used only when no disk was probed at boot (or in tests): keeps swapped
/// pages in heap memory instead of losing them.
static FALLBACK_PAGES: Mutex<BTreeMap<SlotId, [u8; PAGE_SIZE]>> = Mutex::new(BTreeMap::new());

pub(super) fn fallback_read(slot: SlotId, buf: &mut [u8; PAGE_SIZE]) {
    if let Some(page) = FALLBACK_PAGES.lock().get(&slot) {
        buf.copy_from_slice(page);
    }
}

pub(super) fn fallback_write(slot: SlotId, buf: &[u8; PAGE_SIZE]) {
    FALLBACK_PAGES.lock().insert(slot, *buf);
}

/// Slot count used when the backing device reports zero capacity (no disk
/// probed). 4096 slots is 16 MiB of swappable pages, plenty for a teaching
/// workload running under an emulator without a second disk attached.
const DEFAULT_FALLBACK_SLOTS: usize = 4096;

struct SwapState {
    bitmap: Vec<bool>,
    backend: Option<Box<dyn BlockDevice>>,
}

static SWAP: Mutex<SwapState> = Mutex::new(SwapState { bitmap: Vec::new(), backend: None });

pub fn init() {
    init_with_backend(Box::new(NvmeBlockDevice));
}

/// Like [`init`], but with an explicit backend — used by tests to install
/// a [`super::fakes::FakeBlockDevice`] with a known capacity.
pub fn init_with_backend(backend: Box<dyn BlockDevice>) {
    let slots = backend.capacity_pages().max(DEFAULT_FALLBACK_SLOTS);
    let mut state = SWAP.lock();
    state.bitmap = alloc::vec![false; slots];
    state.backend = Some(backend);
    crate::log!("[VM:SWAP] allocator ready: {} slots ({} KB)", slots, slots * PAGE_SIZE / 1024);
}

/// Write `page` to a freshly allocated slot and return its id. Panics if
/// every slot is taken — Pintos treats swap exhaustion as fatal, since
/// there's no lower tier of storage to fall back to.
pub fn out(page: &[u8; PAGE_SIZE]) -> SlotId {
    let (slot, backend_missing) = {
        let mut state = SWAP.lock();
        let idx = state
            .bitmap
            .iter()
            .position(|&used| !used)
            .unwrap_or_else(|| panic!("vm::swap: out of swap slots"));
        state.bitmap[idx] = true;
        (idx as SlotId, state.backend.is_none())
    };
    if backend_missing {
        fallback_write(slot, page);
    } else {
        write_slot(slot, page);
    }
    slot
}

/// Read back and free `slot`. Panics if `slot` was not allocated — callers
/// only ever pass back a slot id they previously got from [`out`].
pub fn in_(slot: SlotId, page: &mut [u8; PAGE_SIZE]) {
    let backend_missing = {
        let mut state = SWAP.lock();
        let idx = slot as usize;
        if idx >= state.bitmap.len() || !state.bitmap[idx] {
            panic!("vm::swap: in_ on unallocated slot {}", slot);
        }
        state.bitmap[idx] = false;
        state.backend.is_none()
    };
    if backend_missing {
        fallback_read(slot, page);
    } else {
        read_slot(slot, page);
    }
}

/// Release `slot` without reading it back (the page it held is being
/// discarded, e.g. a zero-fill page that never needed its contents again).
/// Panics if `slot` was not allocated.
pub fn free(slot: SlotId) {
    let mut state = SWAP.lock();
    let idx = slot as usize;
    if idx >= state.bitmap.len() || !state.bitmap[idx] {
        panic!("vm::swap: double free of slot {}", slot);
    }
    state.bitmap[idx] = false;
}

fn write_slot(slot: SlotId, page: &[u8; PAGE_SIZE]) {
    let state = SWAP.lock();
    if let Some(backend) = state.backend.as_ref() {
        backend.write_page(slot, page);
    }
}

fn read_slot(slot: SlotId, page: &mut [u8; PAGE_SIZE]) {
    let state = SWAP.lock();
    if let Some(backend) = state.backend.as_ref() {
        backend.read_page(slot, page);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::fakes::FakeBlockDevice;

    fn reset(capacity: usize) {
        init_with_backend(Box::new(FakeBlockDevice::with_capacity(capacity)));
    }

    #[test]
    fn roundtrips_a_page() {
        reset(4);
        let page = [0x42u8; PAGE_SIZE];
        let slot = out(&page);
        let mut back = [0u8; PAGE_SIZE];
        in_(slot, &mut back);
        assert_eq!(page, back);
    }

    #[test]
    fn reuses_freed_slots() {
        reset(1);
        let a = out(&[1u8; PAGE_SIZE]);
        let mut buf = [0u8; PAGE_SIZE];
        in_(a, &mut buf);
        // slot a is free again, so a second allocation must succeed
        let b = out(&[2u8; PAGE_SIZE]);
        assert_eq!(a, b);
    }

    #[test]
    #[should_panic(expected = "out of swap slots")]
    fn out_panics_when_full() {
        reset(1);
        let _a = out(&[0u8; PAGE_SIZE]);
        let _b = out(&[0u8; PAGE_SIZE]);
    }

    #[test]
    #[should_panic(expected = "unallocated slot")]
    fn in_panics_on_unallocated_slot() {
        reset(2);
        let mut buf = [0u8; PAGE_SIZE];
        in_(0, &mut buf);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn free_panics_on_double_free() {
        reset(2);
        let slot = out(&[0u8; PAGE_SIZE]);
        free(slot);
        free(slot);
    }
}
