//! Memory-mapped file descriptor table: tracks the page ranges a process
//! has mapped with `mmap`, so `munmap` (and process exit) know what to
//! tear down and write back.

use super::{FileBackend, Mmu, PhysFrameAllocator, PAGE_SIZE};
use crate::process::Pid;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI32, Ordering};
use spin::Mutex;

pub type MmapId = i32;

struct MmapDescriptor {
    addr: u64,
    length: usize,
    file: Arc<dyn FileBackend>,
    writable: bool,
}

static TABLE: Mutex<BTreeMap<Pid, BTreeMap<MmapId, MmapDescriptor>>> = Mutex::new(BTreeMap::new());
/// Ids start at 1 so 0 can double as an "invalid mapping" sentinel at the
/// syscall boundary, matching the `-1`-on-error convention used elsewhere.
static NEXT_ID: AtomicI32 = AtomicI32::new(1);

fn page_count(length: usize) -> usize {
    (length + PAGE_SIZE - 1) / PAGE_SIZE
}

/// Map `length` bytes of `file` (from its current offset) into `pid`'s
/// address space starting at `addr`. `addr` must be page-aligned and
/// `length` non-zero; every page of the range must currently be unmapped.
/// All of that is caller error (a bad syscall argument), not a kernel
/// contract violation, so this returns `Err` instead of panicking.
pub fn mmap(
    pid: Pid,
    addr: u64,
    length: usize,
    file: Arc<dyn FileBackend>,
    writable: bool,
) -> Result<MmapId, &'static str> {
    if length == 0 {
        return Err("mmap: zero length");
    }
    if addr % PAGE_SIZE as u64 != 0 || addr == 0 {
        return Err("mmap: address not page-aligned");
    }

    let pages = page_count(length);
    for i in 0..pages {
        let uvpage = addr + (i * PAGE_SIZE) as u64;
        if super::spt::has_entry(pid, uvpage) {
            return Err("mmap: range overlaps an existing mapping");
        }
    }

    for i in 0..pages {
        let uvpage = addr + (i * PAGE_SIZE) as u64;
        let offset = (i * PAGE_SIZE) as u64;
        let remaining = length - i * PAGE_SIZE;
        let read_bytes = remaining.min(PAGE_SIZE);
        let zero_bytes = PAGE_SIZE - read_bytes;
        super::spt::install_filesys(pid, uvpage, file.clone(), offset, read_bytes, zero_bytes, writable);
    }

    let id = NEXT_ID.fetch_add(1, Ordering::SeqCst);
    let mut table = TABLE.lock();
    table.entry(pid).or_insert_with(BTreeMap::new).insert(id, MmapDescriptor { addr, length, file, writable });
    Ok(id)
}

/// Unmap `id`, writing back any dirty pages through `falloc`/`mmu`.
pub fn munmap(falloc: &dyn PhysFrameAllocator, mmu: &dyn Mmu, pid: Pid, id: MmapId) -> Result<(), &'static str> {
    let descriptor = {
        let mut table = TABLE.lock();
        table.get_mut(&pid).and_then(|m| m.remove(&id)).ok_or("munmap: no such mapping")?
    };
    unmap_descriptor(falloc, mmu, pid, &descriptor);
    Ok(())
}

fn unmap_descriptor(falloc: &dyn PhysFrameAllocator, mmu: &dyn Mmu, pid: Pid, descriptor: &MmapDescriptor) {
    let pages = page_count(descriptor.length);
    for i in 0..pages {
        let uvpage = descriptor.addr + (i * PAGE_SIZE) as u64;
        let offset = (i * PAGE_SIZE) as u64;
        super::spt::munmap_page(falloc, mmu, pid, uvpage, descriptor.file.as_ref(), offset, descriptor.writable);
    }
}

/// Tear down every mapping `pid` still has open. Called from process
/// exit; unlike [`munmap`] this can't fail — there's nothing the caller
/// could do about a write-back error on a process that's already exiting.
pub fn destroy_all(pid: Pid) {
    let descriptors: Vec<MmapDescriptor> = {
        let mut table = TABLE.lock();
        table.remove(&pid).map(|m| m.into_values().collect()).unwrap_or_default()
    };
    for descriptor in &descriptors {
        unmap_descriptor(&super::KernelFrameAllocator, &super::KernelMmu, pid, descriptor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::fakes::{FakeBlockDevice, FakeFrameAllocator, FakeMmu};
    use alloc::boxed::Box;

    struct FakeFile {
        data: Mutex<alloc::vec::Vec<u8>>,
    }

    impl FileBackend for FakeFile {
        fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, &'static str> {
            let data = self.data.lock();
            let start = offset as usize;
            if start >= data.len() {
                return Ok(0);
            }
            let n = buf.len().min(data.len() - start);
            buf[..n].copy_from_slice(&data[start..start + n]);
            Ok(n)
        }
        fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize, &'static str> {
            let mut data = self.data.lock();
            let end = offset as usize + buf.len();
            if data.len() < end {
                data.resize(end, 0);
            }
            data[offset as usize..end].copy_from_slice(buf);
            Ok(buf.len())
        }
    }

    fn reset(pid: Pid) {
        TABLE.lock().remove(&pid);
        super::super::frame_table::init();
        super::super::swap::init_with_backend(Box::new(FakeBlockDevice::with_capacity(16)));
    }

    #[test]
    fn mmap_rejects_misaligned_address() {
        let pid = 200;
        reset(pid);
        let file: Arc<dyn FileBackend> = Arc::new(FakeFile { data: Mutex::new(alloc::vec![1u8; 4096]) });
        assert!(mmap(pid, 0x1001, 4096, file, false).is_err());
    }

    #[test]
    fn mmap_then_munmap_writes_back_dirty_page() {
        let pid = 201;
        reset(pid);
        let file: Arc<dyn FileBackend> = Arc::new(FakeFile { data: Mutex::new(alloc::vec![0u8; 4096]) });
        let falloc = FakeFrameAllocator::with_frames(4);
        let mmu = FakeMmu::new();

        let id = mmap(pid, 0x4000_0000, 4096, file.clone(), true).unwrap();
        super::super::spt::load_page(&falloc, &mmu, pid, 0x4000_0000).unwrap();
        let kframe = match super::super::spt::find(pid, 0x4000_0000).unwrap().status {
            super::super::spt::PageStatus::OnFrame { kframe } => kframe,
            _ => unreachable!(),
        };
        falloc.write_frame(kframe, &[0xABu8; 4096]);
        mmu.mark_dirty(pid, 0x4000_0000);

        munmap(&falloc, &mmu, pid, id).unwrap();

        let mut back = [0u8; 4096];
        file.read_at(0, &mut back).unwrap();
        assert_eq!(back, [0xABu8; 4096]);
        assert!(!super::super::spt::has_entry(pid, 0x4000_0000));
    }

    #[test]
    fn mmap_rejects_overlapping_range() {
        let pid = 202;
        reset(pid);
        let file: Arc<dyn FileBackend> = Arc::new(FakeFile { data: Mutex::new(alloc::vec![0u8; 8192]) });
        mmap(pid, 0x5000_0000, 8192, file.clone(), false).unwrap();
        assert!(mmap(pid, 0x5000_1000, 4096, file, false).is_err());
    }
}
