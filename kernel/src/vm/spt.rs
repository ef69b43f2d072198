//! Supplemental page table: per-process record of where every mapped page
//! currently lives. The hardware page table only ever describes pages
//! that are resident in a physical frame right now; this table is the
//! authority on everything else — a page that's never been touched
//! (zero-fill), one the frame table evicted to swap, or one that's backed
//! by a file and hasn't been faulted in yet.

use super::frame_table::FrameId;
use super::swap::SlotId;
use super::{FileBackend, Mmu, PhysFrameAllocator, PAGE_SIZE};
use crate::process::Pid;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use spin::Mutex;

/// Where a page's data currently lives.
#[derive(Clone)]
pub enum PageStatus {
    /// Never faulted in; reads as zero, first access allocates a frame.
    AllZeros,
    /// Resident in physical memory at `kframe`.
    OnFrame { kframe: FrameId },
    /// Evicted to swap.
    OnSwap { slot: SlotId },
    /// Not yet loaded, backed by `file` starting at `offset`. Only the
    /// first `read_bytes` come from the file; the rest of the page is
    /// zero-filled (the tail of the last page of a file whose length
    /// isn't page-aligned).
    FromFilesys {
        file: Arc<dyn FileBackend>,
        offset: u64,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    },
}

#[derive(Clone)]
pub struct SptEntry {
    pub status: PageStatus,
    /// Software-tracked dirty bit. The hardware bit is lost once a page is
    /// unmapped (evicted or munmapped), so the frame table ORs it in here
    /// before tearing down a mapping.
    pub dirty: bool,
}

static TABLE: Mutex<BTreeMap<Pid, BTreeMap<u64, SptEntry>>> = Mutex::new(BTreeMap::new());

/// Create an (empty) supplemental page table for `pid`. Idempotent.
pub fn create(pid: Pid) {
    TABLE.lock().entry(pid).or_insert_with(BTreeMap::new);
}

/// Tear down `pid`'s supplemental page table, releasing every frame and
/// swap slot it still owns. Called once, from process exit/reap.
pub fn destroy(pid: Pid) {
    let Some(entries) = TABLE.lock().remove(&pid) else { return };
    for (_uvpage, entry) in entries {
        match entry.status {
            PageStatus::OnFrame { kframe } => super::frame_table::free(&super::KernelFrameAllocator, kframe),
            PageStatus::OnSwap { slot } => super::swap::free(slot),
            PageStatus::AllZeros | PageStatus::FromFilesys { .. } => {}
        }
    }
}

fn insert(pid: Pid, uvpage: u64, entry: SptEntry) {
    let mut table = TABLE.lock();
    let per_proc = table.entry(pid).or_insert_with(BTreeMap::new);
    if per_proc.insert(uvpage, entry).is_some() {
        panic!("vm::spt: install on page {:#x} that already has an entry (pid {})", uvpage, pid);
    }
}

pub fn install_zeropage(pid: Pid, uvpage: u64) {
    insert(pid, uvpage, SptEntry { status: PageStatus::AllZeros, dirty: false });
}

pub fn install_frame(pid: Pid, uvpage: u64, kframe: FrameId) {
    insert(pid, uvpage, SptEntry { status: PageStatus::OnFrame { kframe }, dirty: false });
}

pub fn install_filesys(
    pid: Pid,
    uvpage: u64,
    file: Arc<dyn FileBackend>,
    offset: u64,
    read_bytes: usize,
    zero_bytes: usize,
    writable: bool,
) {
    insert(
        pid,
        uvpage,
        SptEntry { status: PageStatus::FromFilesys { file, offset, read_bytes, zero_bytes, writable }, dirty: false },
    );
}

/// Record that `uvpage` was evicted to `slot`. Panics if there is no
/// tracked entry — the frame table only ever evicts pages it knows about.
pub fn set_swap(pid: Pid, uvpage: u64, slot: SlotId) {
    let mut table = TABLE.lock();
    let entry = table
        .get_mut(&pid)
        .and_then(|m| m.get_mut(&uvpage))
        .unwrap_or_else(|| panic!("vm::spt: set_swap on untracked page {:#x} (pid {})", uvpage, pid));
    entry.status = PageStatus::OnSwap { slot };
}

/// OR `value` into the software dirty bit. Panics if there is no tracked
/// entry, for the same reason as [`set_swap`].
pub fn set_dirty(pid: Pid, uvpage: u64, value: bool) {
    let mut table = TABLE.lock();
    let entry = table
        .get_mut(&pid)
        .and_then(|m| m.get_mut(&uvpage))
        .unwrap_or_else(|| panic!("vm::spt: set_dirty on untracked page {:#x} (pid {})", uvpage, pid));
    entry.dirty = entry.dirty || value;
}

pub fn has_entry(pid: Pid, uvpage: u64) -> bool {
    TABLE.lock().get(&pid).map(|m| m.contains_key(&uvpage)).unwrap_or(false)
}

/// Snapshot of the entry at `(pid, uvpage)`, if any.
pub fn find(pid: Pid, uvpage: u64) -> Option<SptEntry> {
    TABLE.lock().get(&pid).and_then(|m| m.get(&uvpage)).cloned()
}

fn set_status(pid: Pid, uvpage: u64, status: PageStatus) {
    let mut table = TABLE.lock();
    let entry = table
        .get_mut(&pid)
        .and_then(|m| m.get_mut(&uvpage))
        .unwrap_or_else(|| panic!("vm::spt: set_status on untracked page {:#x} (pid {})", uvpage, pid));
    entry.status = status;
}

/// Fault a page in: bring it into a physical frame and map it, regardless
/// of which of the three non-resident states it was in. No-op if the page
/// is already resident. Returns `Err` only for conditions the caller (the
/// page fault handler) should treat as the faulting process's fault —
/// there is no tracked entry at all, which means the access was outside
/// any mapped region.
pub fn load_page(falloc: &dyn PhysFrameAllocator, mmu: &dyn Mmu, pid: Pid, uvpage: u64) -> Result<(), &'static str> {
    let status = find(pid, uvpage).ok_or("vm::spt: load_page on unmapped address")?.status;

    match status {
        PageStatus::OnFrame { .. } => Ok(()),

        PageStatus::AllZeros => {
            let kframe = super::frame_table::alloc(falloc, mmu, pid, uvpage);
            mmu.map(pid, uvpage, kframe, true)?;
            set_status(pid, uvpage, PageStatus::OnFrame { kframe });
            super::frame_table::unpin(kframe);
            Ok(())
        }

        PageStatus::OnSwap { slot } => {
            let kframe = super::frame_table::alloc(falloc, mmu, pid, uvpage);
            let mut page = [0u8; PAGE_SIZE];
            super::swap::in_(slot, &mut page);
            falloc.write_frame(kframe, &page);
            mmu.map(pid, uvpage, kframe, true)?;
            set_status(pid, uvpage, PageStatus::OnFrame { kframe });
            super::frame_table::unpin(kframe);
            Ok(())
        }

        PageStatus::FromFilesys { file, offset, read_bytes, zero_bytes: _, writable } => {
            let kframe = super::frame_table::alloc(falloc, mmu, pid, uvpage);
            let mut page = [0u8; PAGE_SIZE];
            if read_bytes > 0 {
                match file.read_at(offset, &mut page[..read_bytes]) {
                    Ok(n) if n == read_bytes => {}
                    Ok(_) => {
                        super::frame_table::free(falloc, kframe);
                        return Err("vm::spt: load_page: short file read");
                    }
                    Err(e) => {
                        super::frame_table::free(falloc, kframe);
                        return Err(e);
                    }
                }
            }
            falloc.write_frame(kframe, &page);
            mmu.map(pid, uvpage, kframe, writable)?;
            set_status(pid, uvpage, PageStatus::OnFrame { kframe });
            super::frame_table::unpin(kframe);
            Ok(())
        }
    }
}

/// Unmap and release the page at `uvpage`, writing its contents back to
/// `file` at `offset` first if it's both writable and dirty. Used by
/// `munmap` to tear down one page of a memory-mapped file. Reads the
/// frame's contents through its kernel (HHDM) alias rather than the
/// user's own mapping, so this still works after `mmu.unmap` has already
/// invalidated the user's PTE.
pub fn munmap_page(
    falloc: &dyn PhysFrameAllocator,
    mmu: &dyn Mmu,
    pid: Pid,
    uvpage: u64,
    file: &dyn FileBackend,
    offset: u64,
    writable: bool,
) {
    let Some(entry) = find(pid, uvpage) else { return };

    match entry.status {
        PageStatus::OnFrame { kframe } => {
            let dirty = entry.dirty || mmu.is_dirty(pid, uvpage) || mmu.is_frame_dirty(kframe);
            if writable && dirty {
                let mut page = [0u8; PAGE_SIZE];
                falloc.read_frame(kframe, &mut page);
                let _ = file.write_at(offset, &page);
            }
            mmu.unmap(pid, uvpage);
            super::frame_table::free(falloc, kframe);
        }
        PageStatus::OnSwap { slot } => {
            if writable && entry.dirty {
                let mut page = [0u8; PAGE_SIZE];
                super::swap::in_(slot, &mut page);
                let _ = file.write_at(offset, &page);
            } else {
                super::swap::free(slot);
            }
        }
        PageStatus::AllZeros | PageStatus::FromFilesys { .. } => {}
    }

    let mut table = TABLE.lock();
    if let Some(per_proc) = table.get_mut(&pid) {
        per_proc.remove(&uvpage);
    }
}

/// Ensure `uvpage` is resident and mark its frame ineligible for eviction.
/// Used by the syscall boundary to pin a user buffer for the duration of
/// an I/O operation.
pub fn pin_page(falloc: &dyn PhysFrameAllocator, mmu: &dyn Mmu, pid: Pid, uvpage: u64) -> Result<(), &'static str> {
    load_page(falloc, mmu, pid, uvpage)?;
    match find(pid, uvpage) {
        Some(SptEntry { status: PageStatus::OnFrame { kframe }, .. }) => {
            super::frame_table::pin(kframe);
            Ok(())
        }
        _ => Err("vm::spt: pin_page: page not resident after load"),
    }
}

/// Clear the eviction-pin set by [`pin_page`]. Panics if the page has no
/// tracked entry or isn't resident — the caller always pairs this with a
/// prior successful `pin_page` on the same page.
pub fn unpin_page(pid: Pid, uvpage: u64) {
    match find(pid, uvpage) {
        Some(SptEntry { status: PageStatus::OnFrame { kframe }, .. }) => super::frame_table::unpin(kframe),
        _ => panic!("vm::spt: unpin_page on non-resident page {:#x} (pid {})", uvpage, pid),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::fakes::{FakeFrameAllocator, FakeMmu};

    fn reset(pid: Pid) {
        TABLE.lock().remove(&pid);
        super::super::frame_table::init();
        super::super::swap::init_with_backend(alloc::boxed::Box::new(crate::vm::fakes::FakeBlockDevice::with_capacity(16)));
    }

    #[test]
    fn zero_page_faults_in_on_load() {
        let pid = 100;
        reset(pid);
        create(pid);
        install_zeropage(pid, 0x1000);
        let falloc = FakeFrameAllocator::with_frames(4);
        let mmu = FakeMmu::new();
        load_page(&falloc, &mmu, pid, 0x1000).unwrap();
        assert!(matches!(find(pid, 0x1000).unwrap().status, PageStatus::OnFrame { .. }));
    }

    #[test]
    fn load_page_on_unmapped_address_is_an_error() {
        let pid = 101;
        reset(pid);
        create(pid);
        let falloc = FakeFrameAllocator::with_frames(4);
        let mmu = FakeMmu::new();
        assert!(load_page(&falloc, &mmu, pid, 0x9000).is_err());
    }

    #[test]
    fn swap_round_trip_preserves_contents() {
        let pid = 102;
        reset(pid);
        create(pid);
        install_zeropage(pid, 0x2000);
        let falloc = FakeFrameAllocator::with_frames(4);
        let mmu = FakeMmu::new();
        load_page(&falloc, &mmu, pid, 0x2000).unwrap();
        let kframe = match find(pid, 0x2000).unwrap().status {
            PageStatus::OnFrame { kframe } => kframe,
            _ => unreachable!(),
        };
        falloc.write_frame(kframe, &[0x55u8; PAGE_SIZE]);

        let slot = crate::vm::swap::out(&[0x55u8; PAGE_SIZE]);
        set_swap(pid, 0x2000, slot);
        assert!(matches!(find(pid, 0x2000).unwrap().status, PageStatus::OnSwap { .. }));

        load_page(&falloc, &mmu, pid, 0x2000).unwrap();
        let kframe2 = match find(pid, 0x2000).unwrap().status {
            PageStatus::OnFrame { kframe } => kframe,
            _ => unreachable!(),
        };
        let mut back = [0u8; PAGE_SIZE];
        falloc.read_frame(kframe2, &mut back);
        assert_eq!(back, [0x55u8; PAGE_SIZE]);
    }

    #[test]
    #[should_panic(expected = "untracked page")]
    fn set_dirty_on_untracked_page_panics() {
        let pid = 103;
        reset(pid);
        create(pid);
        set_dirty(pid, 0x3000, true);
    }
}
