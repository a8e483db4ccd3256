/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::alloc::{alloc, dealloc, Layout};
use std::collections::VecDeque;
use std::ptr::{null_mut, NonNull};

use bitflags::bitflags;

use crate::contig::ContigBuf;
use crate::error::BufferError;
use crate::iovec::{IoVec, IOV_MAX};
use crate::unlikely_branch;

bitflags! {
    /// State bits carried by a region handle.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RegionFlags: u32 {
        /// `buf` points at a standalone heap block, not into the pool's backing buffer.
        const ALLOCATED = 1 << 0;
        /// The region has an outstanding pin; its bytes must not move.
        const PINNED = 1 << 1;
        /// The handle struct is caller-owned storage; the pool frees only the bytes.
        const STRUCT_USER = 1 << 2;
        /// The region has been fully drained by the consumer.
        const FLUSHED = 1 << 3;
    }
}

/// Handle to one write region.
///
/// A region is a caller-addressable slice of the pool's backing buffer (or,
/// when handed out while something is pinned, of a standalone allocation).
/// The `buf` address is rewritten in place by the pool whenever the backing
/// buffer compacts or reallocates, so a handle keeps addressing the same
/// logical bytes for its whole life even though the physical address moves.
pub struct Region {
    flags: RegionFlags,
    length: usize,
    buf: *mut u8,
}

impl Region {
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.length
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    #[inline(always)]
    pub fn flags(&self) -> RegionFlags {
        self.flags
    }

    #[inline(always)]
    pub fn as_ptr(&self) -> *const u8 {
        self.buf
    }

    #[inline(always)]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.buf
    }

    /// View the region's bytes.
    ///
    /// # Safety
    /// Valid only between pool calls: any pool operation that can relocate
    /// the backing buffer rewrites `buf`, so the slice must not be held
    /// across one. The caller must also be the only writer while it holds
    /// the mutable form.
    #[inline(always)]
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.buf, self.length)
    }

    /// Mutable view of the region's bytes.
    ///
    /// # Safety
    /// Same rules as [`Region::as_slice`].
    #[inline(always)]
    pub unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.buf, self.length)
    }
}

impl Default for Region {
    #[inline(always)]
    fn default() -> Self {
        Self {
            flags: RegionFlags::empty(),
            length: 0,
            buf: null_mut(),
        }
    }
}

/// Pool of coalesced write regions over one contiguous backing buffer.
///
/// Producers request regions with [`get_region`](Self::get_region), write
/// into them, and eventually release them with
/// [`free_region`](Self::free_region). A consumer drains the pending bytes
/// through [`iov_get`](Self::iov_get) / [`iov_done`](Self::iov_done),
/// which present the live regions as scatter/gather segments in the order
/// they were requested and keep partial-send bookkeeping across calls.
///
/// Regions normally live inside the backing buffer so a whole burst of
/// small writes goes to the network in one vectored syscall. When the
/// buffer must grow or compact to fit a new region, every outstanding
/// handle is rewritten to follow its bytes. While any region is pinned
/// (explicitly, or implicitly by an outstanding `iov_get`) the backing
/// buffer must not move, so new regions that do not fit fall back to
/// standalone allocations.
///
/// Single-threaded by design; the raw handle pointers keep the type out of
/// `Send`/`Sync`.
pub struct RegionPool {
    buf: ContigBuf,
    live: VecDeque<NonNull<Region>>,
    flushed: VecDeque<NonNull<Region>>,
    pinned: usize,
    flush_offset: usize,
    iov_outstanding: bool,
}

impl RegionPool {
    pub fn new() -> Result<Self, BufferError> {
        Ok(Self {
            buf: ContigBuf::new()?,
            live: VecDeque::new(),
            flushed: VecDeque::new(),
            pinned: 0,
            flush_offset: 0,
            iov_outstanding: false,
        })
    }

    /// Hand out a new region of `size` writable bytes, appended to the tail
    /// of the live list. The handle struct is pool-owned and is released by
    /// [`free_region`](Self::free_region).
    pub fn get_region(&mut self, size: usize) -> Result<NonNull<Region>, BufferError> {
        assert!(size > 0);
        let handle = unsafe {
            NonNull::new_unchecked(Box::into_raw(Box::new(Region {
                flags: RegionFlags::empty(),
                length: size,
                buf: null_mut(),
            })))
        };
        if let Err(e) = self.place(handle, size) {
            drop(unsafe { Box::from_raw(handle.as_ptr()) });
            return Err(e);
        }
        Ok(handle)
    }

    /// Hand out a new region using caller-supplied handle storage; the
    /// handle comes back with `STRUCT_USER` set and the pool will never
    /// free the struct itself.
    ///
    /// # Safety
    /// `storage` must be valid for writes and must remain valid and at the
    /// same address until [`free_region`](Self::free_region) unlinks it.
    /// The caller must not touch the struct's fields while the pool holds
    /// it (reading through the returned handle's accessors is fine).
    pub unsafe fn get_region_in(&mut self, size: usize, storage: NonNull<Region>) -> Result<NonNull<Region>, BufferError> {
        assert!(size > 0);
        storage.as_ptr().write(Region {
            flags: RegionFlags::STRUCT_USER,
            length: size,
            buf: null_mut(),
        });
        self.place(storage, size)?;
        Ok(storage)
    }

    fn place(&mut self, handle: NonNull<Region>, size: usize) -> Result<(), BufferError> {
        let region = unsafe { &mut *handle.as_ptr() };

        if self.buf.space() >= size {
            // Fits at the tail as-is; nothing moves.
            region.buf = self.buf.reserve_tail(size)?;
        } else if self.pinned == 0 {
            // The backing buffer may compact or reallocate underneath the
            // outstanding handles; snapshot where it was so they can be
            // pointed back at their own bytes afterwards.
            let old_base = self.buf.base_ptr();
            let old_offset = self.buf.start_offset();
            region.buf = self.buf.reserve_tail(size)?;
            self.fixup_regions(old_base, old_offset);
        } else {
            // A pin is a promise that in-buffer bytes stay put, so the only
            // way to satisfy the request is out-of-line.
            let layout = Layout::array::<u8>(size).map_err(|_| BufferError::CapacityOverflow)?;
            let mem = unsafe { alloc(layout) };
            if mem.is_null() {
                unlikely_branch();
                return Err(BufferError::AllocFailed);
            }
            region.flags.insert(RegionFlags::ALLOCATED);
            region.buf = mem;
        }

        self.live.push_back(handle);
        Ok(())
    }

    /// Rewrite every in-buffer handle after the backing buffer moved.
    ///
    /// A handle's logical position is its offset from the old live window
    /// head; its new address is that same offset from the new head. This
    /// holds across a pure realloc (base moves, window offset unchanged), a
    /// compaction (offset drops to zero), and both at once.
    fn fixup_regions(&mut self, old_base: *mut u8, old_offset: usize) {
        let new_base = self.buf.base_ptr();
        let new_offset = self.buf.start_offset();

        for handle in self.live.iter().chain(self.flushed.iter()) {
            let region = unsafe { &mut *handle.as_ptr() };
            if region.flags.contains(RegionFlags::ALLOCATED) {
                continue;
            }
            let old_begin = region.buf as usize - old_base as usize;
            debug_assert!(old_begin >= old_offset);
            let logical = old_begin - old_offset;
            region.buf = unsafe { new_base.add(new_offset + logical) };
        }
    }

    /// Release a region.
    ///
    /// Must not be pinned. If the region sits at the head of the live
    /// window its bytes are chopped off cheaply (the common FIFO drain
    /// pattern); a region freed out of order leaves a hole that a later
    /// compaction reclaims. A partially-flushed leading region must stay
    /// until its `iov_done` retires it.
    pub fn free_region(&mut self, handle: NonNull<Region>) {
        let region = unsafe { &mut *handle.as_ptr() };
        assert!(!region.flags.contains(RegionFlags::PINNED));

        if region.flags.contains(RegionFlags::ALLOCATED) {
            unsafe { dealloc(region.buf, Layout::from_size_align_unchecked(region.length, 1)) };
        } else if region.buf == self.buf.head_ptr() {
            self.buf.chop_nocompact(region.length);
        }

        self.unlink(handle);

        if !region.flags.contains(RegionFlags::STRUCT_USER) {
            drop(unsafe { Box::from_raw(handle.as_ptr()) });
        }
    }

    fn unlink(&mut self, handle: NonNull<Region>) {
        if let Some(pos) = self.live.iter().position(|h| *h == handle) {
            self.live.remove(pos);
        } else if let Some(pos) = self.flushed.iter().position(|h| *h == handle) {
            self.flushed.remove(pos);
        } else {
            debug_assert!(false, "region does not belong to this pool");
        }
    }

    /// Promise a third party that the region's bytes will not move until
    /// [`unpin`](Self::unpin). A standalone (`ALLOCATED`) region never
    /// moves, so pinning one is a no-op, as is pinning twice.
    pub fn pin(&mut self, handle: NonNull<Region>) {
        let region = unsafe { &mut *handle.as_ptr() };
        if region.flags.intersects(RegionFlags::ALLOCATED | RegionFlags::PINNED) {
            return;
        }
        region.flags.insert(RegionFlags::PINNED);
        self.pinned += 1;
    }

    pub fn unpin(&mut self, handle: NonNull<Region>) {
        let region = unsafe { &mut *handle.as_ptr() };
        if region.flags.contains(RegionFlags::ALLOCATED) {
            return;
        }
        assert!(region.flags.contains(RegionFlags::PINNED));
        region.flags.remove(RegionFlags::PINNED);
        self.pinned -= 1;
    }

    /// Describe the pending bytes as scatter/gather segments, in the order
    /// the regions were requested, coalescing address-adjacent regions into
    /// one entry.
    ///
    /// At most `iov.len()` entries are written (1..=[`IOV_MAX`]); when the
    /// live bytes span more holes than that, the description is truncated
    /// and a later round picks up the rest. Returns the number of entries
    /// written; entries past that are untouched. When nothing is pending,
    /// `iov[0]` gets the null sentinel and the return is 0.
    ///
    /// The pool is pinned until the matching [`iov_done`](Self::iov_done):
    /// the caller is about to read these raw addresses, so the backing
    /// buffer must not move. Calling again before `iov_done` is a contract
    /// violation.
    pub fn iov_get(&mut self, iov: &mut [IoVec]) -> usize {
        assert!(!self.iov_outstanding);
        assert!(!iov.is_empty() && iov.len() <= IOV_MAX);

        self.pinned += 1;
        self.iov_outstanding = true;

        let mut flush_offset = self.flush_offset;
        let mut count = 0usize;
        let mut expected: *mut u8 = null_mut();

        for handle in self.live.iter() {
            let region = unsafe { &*handle.as_ptr() };

            if !expected.is_null() && region.buf == expected {
                // Physically adjacent to the previous region; same segment.
                iov[count - 1].widen(region.length);
            } else {
                if count == iov.len() {
                    break;
                }
                let mut entry = IoVec::new(region.buf, region.length);
                if flush_offset != 0 {
                    // Bytes already sent from the leading region in a prior
                    // partial round.
                    assert!(flush_offset < region.length);
                    entry.advance(flush_offset);
                    flush_offset = 0;
                }
                iov[count] = entry;
                count += 1;
            }

            expected = unsafe { region.buf.add(region.length) };
        }

        if count == 0 {
            iov[0] = IoVec::null();
        }
        count
    }

    /// Acknowledge that `nused` bytes from the last
    /// [`iov_get`](Self::iov_get) went out. Fully-drained regions are
    /// marked `FLUSHED` and migrate to the flushed list (their handles stay
    /// valid until [`free_region`](Self::free_region)); a partially-drained
    /// leading region stays live with the sent prefix recorded for the next
    /// round.
    pub fn iov_done(&mut self, nused: usize) {
        assert!(self.iov_outstanding);
        debug_assert!(nused <= self.pending_bytes());
        self.iov_outstanding = false;
        self.pinned -= 1;

        let mut remaining = nused + self.flush_offset;
        self.flush_offset = 0;

        while remaining > 0 {
            let handle = match self.live.pop_front() {
                Some(h) => h,
                None => break,
            };
            let region = unsafe { &mut *handle.as_ptr() };
            if remaining >= region.length {
                region.flags.insert(RegionFlags::FLUSHED);
                remaining -= region.length;
                self.flushed.push_back(handle);
            } else {
                self.flush_offset = region.length - remaining;
                self.live.push_front(handle);
                break;
            }
        }
    }

    /// Bytes currently pending send: the live regions' lengths minus what a
    /// prior partial round already drained from the leading one.
    pub fn pending_bytes(&self) -> usize {
        let total: usize = self.live.iter().map(|h| unsafe { h.as_ref().length }).sum();
        total - self.flush_offset
    }

    #[inline(always)]
    pub fn pinned_count(&self) -> usize {
        self.pinned
    }

    #[inline(always)]
    pub fn flush_offset(&self) -> usize {
        self.flush_offset
    }

    #[inline(always)]
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    #[inline(always)]
    pub fn flushed_count(&self) -> usize {
        self.flushed.len()
    }

    /// Iterate the live regions in the order they were requested.
    ///
    /// The views are valid until the next pool call, like any other region
    /// access.
    pub fn live_regions(&self) -> impl Iterator<Item = &Region> {
        self.live.iter().map(|h| unsafe { h.as_ref() })
    }

    /// Iterate the flushed-but-not-yet-freed regions in flush order.
    pub fn flushed_regions(&self) -> impl Iterator<Item = &Region> {
        self.flushed.iter().map(|h| unsafe { h.as_ref() })
    }

    /// True when no handles remain on either list.
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.live.is_empty() && self.flushed.is_empty()
    }

    /// Read view of the backing buffer.
    #[inline(always)]
    pub fn backing(&self) -> &ContigBuf {
        &self.buf
    }
}

impl Drop for RegionPool {
    fn drop(&mut self) {
        debug_assert_eq!(self.pinned, 0);
        loop {
            let handle = match self.live.pop_front().or_else(|| self.flushed.pop_front()) {
                Some(h) => h,
                None => break,
            };
            let region = unsafe { &mut *handle.as_ptr() };
            if region.flags.contains(RegionFlags::ALLOCATED) {
                unsafe { dealloc(region.buf, Layout::from_size_align_unchecked(region.length, 1)) };
            }
            if !region.flags.contains(RegionFlags::STRUCT_USER) {
                drop(unsafe { Box::from_raw(handle.as_ptr()) });
            }
        }
    }
}
