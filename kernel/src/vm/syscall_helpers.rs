//! Syscall-boundary glue between the raw user pointers syscalls receive
//! and the virtual memory subsystem: pinning a user buffer for the
//! duration of an I/O syscall so the frame table's clock can't evict it
//! out from under an in-flight `read`/`write`, plus the lock ordering
//! that keeps pinning and filesystem access deadlock-free.
//!
//! Builds on [`crate::usercopy`]'s `UserSlice`/validation rather than
//! replacing it — this module only adds the "don't let this move" step
//! that a demand-paged VM needs and a non-paged one doesn't.

use super::{KernelFrameAllocator, KernelMmu, PAGE_SIZE};
use crate::process::Pid;
use crate::sync::SpinLock;
use crate::usercopy::UserSlice;

/// Guards every syscall that touches the VFS. Frame-table internals take
/// their own lock (see `vm::frame_table`); the fixed order is: acquire
/// `FILESYS_LOCK` first if a syscall needs both, then let individual VM
/// calls take their own internal locks. Taking them in the opposite order
/// anywhere would deadlock against eviction writing a dirty page out
/// through the filesystem while holding the frame table lock.
pub static FILESYS_LOCK: SpinLock<()> = SpinLock::new(());

/// Page-align `ptr` down and return the list of user pages `[ptr, ptr+len)`
/// spans.
fn pages_spanned(ptr: u64, len: usize) -> impl Iterator<Item = u64> {
    let start = ptr & !(PAGE_SIZE as u64 - 1);
    let end = (ptr + len as u64 + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1);
    let count = ((end - start) / PAGE_SIZE as u64) as usize;
    (0..count).map(move |i| start + i as u64 * PAGE_SIZE as u64)
}

/// Fault in and pin every page behind `slice`. Called before a syscall
/// copies to/from a user buffer via DMA or a multi-step VFS call, so the
/// pages can't be evicted mid-copy. Must be paired with
/// [`unpin_user_buffer`] using the same `(pid, slice)` once the I/O is
/// done — on any early-return error path too, or the pages stay pinned
/// forever.
///
/// A page the supplemental page table has never heard of (the process's
/// initial image: ELF segments and the first stack page, mapped straight
/// into frames the frame table doesn't own) isn't an error here — it was
/// never an eviction candidate to begin with, so there's nothing to pin.
/// Only pages the SPT is actually tracking need the frame table told to
/// leave them alone.
pub fn pin_user_buffer(pid: Pid, slice: &UserSlice) -> Result<(), &'static str> {
    let mut pinned = alloc::vec::Vec::new();
    for uvpage in pages_spanned(slice.ptr(), slice.len()) {
        if !super::spt::has_entry(pid, uvpage) {
            continue;
        }
        match super::spt::pin_page(&KernelFrameAllocator, &KernelMmu, pid, uvpage) {
            Ok(()) => pinned.push(uvpage),
            Err(e) => {
                // Roll back anything we already pinned before bailing.
                for done in pinned {
                    super::spt::unpin_page(pid, done);
                }
                return Err(e);
            }
        }
    }
    Ok(())
}

/// Undo [`pin_user_buffer`]. Pages not currently resident (already
/// unmapped some other way) are silently skipped rather than treated as
/// an error, since a caller unwinding an error path may call this after
/// only partially pinning.
pub fn unpin_user_buffer(pid: Pid, slice: &UserSlice) {
    for uvpage in pages_spanned(slice.ptr(), slice.len()) {
        if super::spt::has_entry(pid, uvpage) {
            super::spt::unpin_page(pid, uvpage);
        }
    }
}

/// Run `body` with `slice`'s pages pinned against eviction, regardless of
/// whether `body` returns `Ok` or `Err`. This is the shape `sys_read` and
/// `sys_write` wrap their VFS calls in.
pub fn with_pinned_buffer<R>(
    pid: Pid,
    slice: &UserSlice,
    body: impl FnOnce() -> R,
) -> Result<R, &'static str> {
    pin_user_buffer(pid, slice)?;
    let result = body();
    unpin_user_buffer(pid, slice);
    Ok(result)
}
