//! Virtual memory subsystem: frame table, supplemental page table, swap,
//! memory-mapped files and the alarm queue that backs thread sleeping.
//!
//! The pieces here replace the old demand-paging stack in `memory::swap`
//! and `memory::cow`: instead of an autonomous LRU daemon and COW-based
//! fork, every process owns a supplemental page table describing where
//! each of its pages currently lives (zero-fill, on a frame, on disk, or
//! backed by a file), and a single global frame table decides who gets
//! evicted when physical memory runs out.
//!
//! Production code always goes through the `Kernel*` adapters below. Unit
//! tests swap in the `Fake*` doubles so the eviction clock, the swap
//! allocator's fatal paths and the SPT state machine can run without
//! real page tables, a real disk or a real scheduler.

pub mod alarm;
pub mod frame_table;
pub mod mmap;
pub mod spt;
pub mod swap;
pub mod syscall_helpers;

use crate::process::Pid;

/// Bytes in one page. Every trait below moves data a page at a time.
pub const PAGE_SIZE: usize = 4096;

/// Source of physical frames. Mirrors `memory::frame`'s bitmap allocator;
/// kept as a trait so the frame table's eviction logic can be driven by a
/// fake allocator with a handful of frames in tests.
pub trait PhysFrameAllocator {
    fn alloc(&self) -> Option<u64>;
    fn alloc_zeroed(&self) -> Option<u64>;
    fn free(&self, phys: u64);
    /// Copy a frame's contents out via its HHDM alias. Split out from
    /// `Mmu` because it addresses physical memory directly, not a
    /// particular process's page table.
    fn read_frame(&self, phys: u64, buf: &mut [u8; PAGE_SIZE]);
    fn write_frame(&self, phys: u64, buf: &[u8; PAGE_SIZE]);
}

/// Per-process page table operations the frame table and SPT need: install
/// or remove a mapping, and read/clear the hardware accessed/dirty bits.
/// Every method is keyed by `(owner, uvpage)` rather than "the current
/// address space" because eviction routinely touches a process other than
/// the one currently running.
pub trait Mmu {
    fn map(&self, owner: Pid, uvpage: u64, kframe: u64, writable: bool) -> Result<(), &'static str>;
    fn unmap(&self, owner: Pid, uvpage: u64);
    fn is_accessed(&self, owner: Pid, uvpage: u64) -> bool;
    fn set_accessed(&self, owner: Pid, uvpage: u64, value: bool);
    fn is_dirty(&self, owner: Pid, uvpage: u64) -> bool;
    fn set_dirty(&self, owner: Pid, uvpage: u64, value: bool);
    /// Dirty bit as seen through the frame's *kernel* alias (the HHDM
    /// mapping), rather than the user mapping `is_dirty` reads. A frame
    /// written to via the kernel's direct-mapped window (e.g. a driver
    /// DMA target, or kernel code poking the page) sets this bit without
    /// ever touching the user PTE, so a correct dirty check has to OR
    /// both aliases together rather than trusting the user one alone.
    fn is_frame_dirty(&self, kframe: u64) -> bool;
}

/// Raw page-granular block storage backing the swap allocator.
pub trait BlockDevice: Send + Sync {
    fn read_page(&self, slot: u32, buf: &mut [u8; PAGE_SIZE]);
    fn write_page(&self, slot: u32, buf: &[u8; PAGE_SIZE]);
    /// Capacity in whole pages, or 0 if the device isn't ready (the swap
    /// allocator falls back to an in-memory store in that case).
    fn capacity_pages(&self) -> usize;
}

/// A file handle with its own cursor, used by the supplemental page table
/// to load and write back file-backed (mmap'd) pages.
pub trait FileBackend: Send + Sync {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, &'static str>;
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize, &'static str>;
}

/// The handful of scheduler primitives the alarm queue needs to put a
/// thread to sleep and wake it again.
pub trait ThreadScheduler {
    fn current(&self) -> u64;
    fn block_current_and_schedule(&self);
    fn wake(&self, tid: u64);
}

/// Adapts `memory::frame`'s bitmap allocator to [`PhysFrameAllocator`].
pub struct KernelFrameAllocator;

impl PhysFrameAllocator for KernelFrameAllocator {
    fn alloc(&self) -> Option<u64> {
        crate::memory::frame::alloc_frame()
    }
    fn alloc_zeroed(&self) -> Option<u64> {
        crate::memory::frame::alloc_frame_zeroed()
    }
    fn free(&self, phys: u64) {
        crate::memory::frame::free_frame(phys)
    }
    fn read_frame(&self, phys: u64, buf: &mut [u8; PAGE_SIZE]) {
        let hhdm = crate::memory::hhdm_offset();
        let src = unsafe { &*((phys + hhdm) as *const [u8; PAGE_SIZE]) };
        buf.copy_from_slice(src);
    }
    fn write_frame(&self, phys: u64, buf: &[u8; PAGE_SIZE]) {
        let hhdm = crate::memory::hhdm_offset();
        let dst = unsafe { &mut *((phys + hhdm) as *mut [u8; PAGE_SIZE]) };
        dst.copy_from_slice(buf);
    }
}

/// Adapts per-process page tables (`process::get`/`AddressSpace`) and the
/// raw accessed/dirty bit helpers in `memory::paging` to [`Mmu`].
pub struct KernelMmu;

impl KernelMmu {
    fn cr3_of(&self, owner: Pid) -> Option<u64> {
        crate::process::get(owner).map(|p| p.cr3)
    }
}

impl Mmu for KernelMmu {
    fn map(&self, owner: Pid, uvpage: u64, kframe: u64, writable: bool) -> Result<(), &'static str> {
        let proc = crate::process::get(owner).ok_or("vm::KernelMmu: no such process")?;
        let space = proc
            .address_space
            .as_ref()
            .ok_or("vm::KernelMmu: process has no address space")?;
        let flags = if writable {
            crate::memory::paging::PageFlags::USER_DATA
        } else {
            crate::memory::paging::PageFlags::USER_RODATA
        };
        space
            .lock()
            .map_page(uvpage, kframe, flags)
            .ok_or("vm::KernelMmu: map_page failed")
    }

    fn unmap(&self, owner: Pid, uvpage: u64) {
        if let Some(proc) = crate::process::get(owner) {
            if let Some(space) = proc.address_space.as_ref() {
                space.lock().unmap_page(uvpage);
            }
        }
    }

    fn is_accessed(&self, owner: Pid, uvpage: u64) -> bool {
        self.cr3_of(owner)
            .map(|cr3| crate::memory::paging::pte_is_accessed(cr3, uvpage))
            .unwrap_or(false)
    }

    fn set_accessed(&self, owner: Pid, uvpage: u64, value: bool) {
        if let Some(cr3) = self.cr3_of(owner) {
            crate::memory::paging::pte_set_accessed(cr3, uvpage, value);
        }
    }

    fn is_dirty(&self, owner: Pid, uvpage: u64) -> bool {
        self.cr3_of(owner)
            .map(|cr3| crate::memory::paging::pte_is_dirty(cr3, uvpage))
            .unwrap_or(false)
    }

    fn set_dirty(&self, owner: Pid, uvpage: u64, value: bool) {
        if let Some(cr3) = self.cr3_of(owner) {
            crate::memory::paging::pte_set_dirty(cr3, uvpage, value);
        }
    }

    fn is_frame_dirty(&self, kframe: u64) -> bool {
        let hhdm = crate::memory::hhdm_offset();
        crate::memory::paging::pte_is_dirty(crate::memory::paging::kernel_cr3(), kframe + hhdm)
    }
}

/// Adapts the NVMe driver to [`BlockDevice`], falling back to an in-memory
/// store (see `vm::swap`) when no drive was probed at boot — the same
/// fallback the old swap code used, so swap keeps working under QEMU
/// configurations without a disk attached and in tests.
pub struct NvmeBlockDevice;

const SECTOR_SIZE: u64 = 512;
const SECTORS_PER_PAGE: u64 = PAGE_SIZE as u64 / SECTOR_SIZE;
/// Reserve the last slice of the drive for swap, leaving the front for the
/// filesystem. A real installation would read this from a partition table;
/// Pintos itself just dedicates a whole second disk to swap.
const SWAP_BASE_LBA: u64 = 1 << 20; // 512 MiB in

impl BlockDevice for NvmeBlockDevice {
    fn read_page(&self, slot: u32, buf: &mut [u8; PAGE_SIZE]) {
        if crate::nvme::is_initialized() {
            let lba = SWAP_BASE_LBA + slot as u64 * SECTORS_PER_PAGE;
            if crate::nvme::read_sectors(lba, SECTORS_PER_PAGE as usize, buf).is_ok() {
                return;
            }
        }
        swap::fallback_read(slot, buf);
    }

    fn write_page(&self, slot: u32, buf: &[u8; PAGE_SIZE]) {
        if crate::nvme::is_initialized() {
            let lba = SWAP_BASE_LBA + slot as u64 * SECTORS_PER_PAGE;
            if crate::nvme::write_sectors(lba, SECTORS_PER_PAGE as usize, buf).is_ok() {
                return;
            }
        }
        swap::fallback_write(slot, buf);
    }

    fn capacity_pages(&self) -> usize {
        if crate::nvme::is_initialized() {
            let cap = crate::nvme::capacity();
            (cap / SECTORS_PER_PAGE) as usize
        } else {
            0
        }
    }
}

/// Adapts a reopened VFS file handle to [`FileBackend`].
pub struct VfsFileBackend {
    file: alloc::sync::Arc<dyn crate::vfs::FileOps>,
}

impl VfsFileBackend {
    pub fn from_fd(fd: crate::vfs::Fd) -> Result<Self, &'static str> {
        crate::vfs::reopen(fd)
            .map(|file| VfsFileBackend { file })
            .map_err(|_| "vm::VfsFileBackend: bad fd")
    }
}

impl FileBackend for VfsFileBackend {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, &'static str> {
        self.file.read(offset, buf).map_err(|_| "vm::VfsFileBackend: read failed")
    }
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize, &'static str> {
        self.file.write(offset, buf).map_err(|_| "vm::VfsFileBackend: write failed")
    }
}

/// Adapts `thread`'s blocking primitives to [`ThreadScheduler`].
pub struct KernelScheduler;

impl ThreadScheduler for KernelScheduler {
    fn current(&self) -> u64 {
        crate::thread::current_tid()
    }
    fn block_current_and_schedule(&self) {
        crate::thread::block_current_and_schedule();
    }
    fn wake(&self, tid: u64) {
        crate::thread::wake(tid);
    }
}

/// Bring up the virtual memory subsystem. Must run after `memory::frame`
/// and before the first user process is created.
pub fn init() {
    alarm::init();
    swap::init();
    frame_table::init();
    crate::log!("[VM] subsystem ready");
}

/// Release all per-process VM state. Called from `process::exit`/reap.
pub fn on_process_exit(pid: Pid) {
    spt::destroy(pid);
    mmap::destroy_all(pid);
}

#[cfg(test)]
pub mod fakes {
    use super::*;
    use alloc::collections::BTreeMap;
    use alloc::vec::Vec;
    use spin::Mutex;

    /// A frame "allocator" backed by a fixed pool of fake physical
    /// addresses, so the eviction clock can be exercised without real RAM.
    pub struct FakeFrameAllocator {
        free: Mutex<Vec<u64>>,
        contents: Mutex<BTreeMap<u64, [u8; PAGE_SIZE]>>,
    }

    impl FakeFrameAllocator {
        pub fn with_frames(n: usize) -> Self {
            let free = (0..n as u64).map(|i| i * PAGE_SIZE as u64).rev().collect();
            FakeFrameAllocator { free: Mutex::new(free), contents: Mutex::new(BTreeMap::new()) }
        }
    }

    impl PhysFrameAllocator for FakeFrameAllocator {
        fn alloc(&self) -> Option<u64> {
            self.free.lock().pop()
        }
        fn alloc_zeroed(&self) -> Option<u64> {
            let phys = self.free.lock().pop()?;
            self.contents.lock().insert(phys, [0u8; PAGE_SIZE]);
            Some(phys)
        }
        fn free(&self, phys: u64) {
            self.contents.lock().remove(&phys);
            self.free.lock().push(phys);
        }
        fn read_frame(&self, phys: u64, buf: &mut [u8; PAGE_SIZE]) {
            if let Some(page) = self.contents.lock().get(&phys) {
                buf.copy_from_slice(page);
            }
        }
        fn write_frame(&self, phys: u64, buf: &[u8; PAGE_SIZE]) {
            self.contents.lock().insert(phys, *buf);
        }
    }

    #[derive(Default, Clone, Copy)]
    struct FakePte {
        kframe: u64,
        mapped: bool,
        accessed: bool,
        dirty: bool,
    }

    /// An in-memory stand-in for hardware page tables: tracks accessed and
    /// dirty bits per `(owner, uvpage)` so tests can flip them directly.
    pub struct FakeMmu {
        ptes: Mutex<BTreeMap<(Pid, u64), FakePte>>,
        /// Dirty bit for the kernel (HHDM) alias of a frame, kept separate
        /// from the per-`(owner, uvpage)` bit above since the two aliases
        /// are independent in hardware too.
        kframe_dirty: Mutex<BTreeMap<u64, bool>>,
    }

    impl FakeMmu {
        pub fn new() -> Self {
            FakeMmu { ptes: Mutex::new(BTreeMap::new()), kframe_dirty: Mutex::new(BTreeMap::new()) }
        }
        pub fn touch(&self, owner: Pid, uvpage: u64) {
            if let Some(pte) = self.ptes.lock().get_mut(&(owner, uvpage)) {
                pte.accessed = true;
            }
        }
        pub fn mark_dirty(&self, owner: Pid, uvpage: u64) {
            if let Some(pte) = self.ptes.lock().get_mut(&(owner, uvpage)) {
                pte.dirty = true;
            }
        }
        /// Mark `kframe` dirty as seen through its kernel alias, independent
        /// of whatever the user mapping's dirty bit says.
        pub fn mark_frame_dirty(&self, kframe: u64) {
            self.kframe_dirty.lock().insert(kframe, true);
        }
    }

    impl Mmu for FakeMmu {
        fn map(&self, owner: Pid, uvpage: u64, kframe: u64, _writable: bool) -> Result<(), &'static str> {
            self.ptes.lock().insert((owner, uvpage), FakePte { kframe, mapped: true, accessed: false, dirty: false });
            Ok(())
        }
        fn unmap(&self, owner: Pid, uvpage: u64) {
            if let Some(pte) = self.ptes.lock().get_mut(&(owner, uvpage)) {
                pte.mapped = false;
            }
        }
        fn is_accessed(&self, owner: Pid, uvpage: u64) -> bool {
            self.ptes.lock().get(&(owner, uvpage)).map(|p| p.accessed).unwrap_or(false)
        }
        fn set_accessed(&self, owner: Pid, uvpage: u64, value: bool) {
            if let Some(pte) = self.ptes.lock().get_mut(&(owner, uvpage)) {
                pte.accessed = value;
            }
        }
        fn is_dirty(&self, owner: Pid, uvpage: u64) -> bool {
            self.ptes.lock().get(&(owner, uvpage)).map(|p| p.dirty).unwrap_or(false)
        }
        fn set_dirty(&self, owner: Pid, uvpage: u64, value: bool) {
            if let Some(pte) = self.ptes.lock().get_mut(&(owner, uvpage)) {
                pte.dirty = value;
            }
        }
        fn is_frame_dirty(&self, kframe: u64) -> bool {
            self.kframe_dirty.lock().get(&kframe).copied().unwrap_or(false)
        }
    }

    /// Page-granular in-memory block device for exercising the swap
    /// allocator's fatal paths deterministically.
    pub struct FakeBlockDevice {
        pages: Mutex<BTreeMap<u32, [u8; PAGE_SIZE]>>,
        capacity: usize,
    }

    impl FakeBlockDevice {
        pub fn with_capacity(capacity: usize) -> Self {
            FakeBlockDevice { pages: Mutex::new(BTreeMap::new()), capacity }
        }
    }

    impl BlockDevice for FakeBlockDevice {
        fn read_page(&self, slot: u32, buf: &mut [u8; PAGE_SIZE]) {
            if let Some(page) = self.pages.lock().get(&slot) {
                buf.copy_from_slice(page);
            }
        }
        fn write_page(&self, slot: u32, buf: &[u8; PAGE_SIZE]) {
            self.pages.lock().insert(slot, *buf);
        }
        fn capacity_pages(&self) -> usize {
            self.capacity
        }
    }
}
