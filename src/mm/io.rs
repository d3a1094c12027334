//! Faults and direct access to application memory.

use core::ops::Range;

use super::{exceeds, MappingState, MemoryManager, GUARD_GAP, READAHEAD};
use crate::addr::{AddrRange, Access, VirtualAddress, PAGE_SIZE};
use crate::error::{Completion, Error, Result, Stop};
use crate::memory::PageFrame;
use crate::platform::FaultResponse;
use crate::sync::CleanLockToken;

impl MemoryManager {
    /// Resolve a fault by an access of type `at` at `addr`, installing the
    /// result if the address space is active.
    ///
    /// A backing object that goes away during resolution gets one more try
    /// against the current areas.
    pub fn handle_user_fault(
        &self,
        addr: VirtualAddress,
        at: Access,
        token: &mut CleanLockToken,
    ) -> Result<Completion<()>> {
        let mut retried = false;
        loop {
            match Stop::into_result(self.fault_once(addr, at, token)) {
                Err(Error::ObjectGone) if !retried => {
                    log::warn!("mm {}: backing object gone during fault at {:?}, retrying", self.id, addr);
                    retried = true;
                }
                result => {
                    self.check_invariants(token);
                    return result;
                }
            }
        }
    }

    /// The platform's fault callback.
    pub fn deliver_fault(&self, addr: VirtualAddress, at: Access, token: &mut CleanLockToken) -> FaultResponse {
        match self.handle_user_fault(addr, at, token) {
            Ok(Completion::Done(())) => FaultResponse::Resolved,
            Ok(Completion::Cancelled) => FaultResponse::Cancelled,
            Err(err) => {
                log::debug!("mm {}: {:?} fault at {:?}: {}", self.id, at, addr, err);
                FaultResponse::Signal(err.signal())
            }
        }
    }

    fn fault_once(&self, addr: VirtualAddress, at: Access, token: &mut CleanLockToken) -> Result<(), Stop> {
        {
            let mapping = self.mapping.read(token.token());
            if mapping.vmas.contains(addr).is_none() {
                // Only a grows-down area right above can make this address valid.
                if !mapping.vmas.next_after(addr).is_some_and(|(_, vma)| vma.grows_down) {
                    return Err(Error::NotFound.into());
                }
                drop(mapping);
                let mut mapping = self.mapping.write(token.token());
                if mapping.vmas.contains(addr).is_none() {
                    self.grow_stack(&mut mapping, addr)?;
                }
            }
        }

        let mut mapping = self.mapping.read(token.token());
        let (ms, mut token) = mapping.token_split();
        // Unmapped again since the stack grew.
        let (vma_range, vma) = ms.vmas.contains(addr).ok_or(Error::NotFound)?;

        let page = AddrRange::page_containing(addr);
        let window = if vma.record_fault(addr) {
            AddrRange::with_len(page.start(), READAHEAD)
        } else {
            page.end().checked_sub(READAHEAD).map(|start| AddrRange::new(start, page.end()))
        };
        let readahead = window.map_or(page, |window| window.intersect(vma_range));
        log::trace!("mm {}: {:?} fault at {:?}, window {:?}", self.id, at, addr, readahead);

        let mut act = self.active.write(token.token());
        act.flush();
        let resolved = self.get_pmas(ms, &mut act, page, Some(readahead), at, false);
        act.flush();
        resolved?;
        act.install_range(ms, readahead, false)?;
        Ok(())
    }

    /// Extend the grows-down area right above `addr` down to its page.
    fn grow_stack(&self, ms: &mut MappingState, addr: VirtualAddress) -> Result<()> {
        let page = addr.page();
        let (above, vma) = ms.vmas.next_after(addr).ok_or(Error::NotFound)?;
        if !vma.grows_down || page < self.layout.min_addr {
            return Err(Error::NotFound);
        }
        if exceeds(above.end().offset_from(page), ms.limits.stack) {
            log::debug!("mm {}: stack at {:?} would exceed its limit", self.id, page);
            return Err(Error::NotFound);
        }
        if let Some((below, _)) = ms.vmas.prev_before(page) {
            if page.offset_from(below.end()) < GUARD_GAP {
                return Err(Error::NotFound);
            }
        }

        let grown = AddrRange::new(page, above.start());
        if exceeds(ms.usage_as + grown.len(), ms.limits.address_space) {
            return Err(Error::OutOfMemory);
        }
        let vma = vma.clone();
        log::debug!("mm {}: stack grows down to {:?}", self.id, page);
        ms.insert_vma(grown, vma);
        Ok(())
    }

    /// Copy application memory at `addr` into `dst`.
    pub fn copy_in(
        &self,
        addr: VirtualAddress,
        dst: &mut [u8],
        ignore_permissions: bool,
        token: &mut CleanLockToken,
    ) -> Result<Completion<usize>> {
        self.with_frames(addr, dst.len(), Access::READ, ignore_permissions, token, |frame, offset, buf| {
            frame.read(offset, &mut dst[buf])
        })
    }

    /// Copy `src` into application memory at `addr`.
    pub fn copy_out(
        &self,
        addr: VirtualAddress,
        src: &[u8],
        ignore_permissions: bool,
        token: &mut CleanLockToken,
    ) -> Result<Completion<usize>> {
        self.with_frames(addr, src.len(), Access::WRITE, ignore_permissions, token, |frame, offset, buf| {
            frame.write(offset, &src[buf])
        })
    }

    /// Zero `len` bytes of application memory at `addr`.
    pub fn zero_out(
        &self,
        addr: VirtualAddress,
        len: usize,
        ignore_permissions: bool,
        token: &mut CleanLockToken,
    ) -> Result<Completion<usize>> {
        self.with_frames(addr, len, Access::WRITE, ignore_permissions, token, |frame, offset, buf| {
            frame.fill(offset, buf.len(), 0)
        })
    }

    /// Resolve `[addr, addr + len)` for `at` and call `f` for each page with
    /// the page's frame, the offset in the page and the matching part of the
    /// caller's buffer.
    fn with_frames(
        &self,
        addr: VirtualAddress,
        len: usize,
        at: Access,
        ignore_permissions: bool,
        token: &mut CleanLockToken,
        mut f: impl FnMut(&PageFrame, usize, Range<usize>),
    ) -> Result<Completion<usize>> {
        if len == 0 {
            return Ok(Completion::Done(0));
        }
        let end = addr.checked_add(len).ok_or(Error::NotFound)?;
        let ar = AddrRange::new(addr.page(), end.round_up().ok_or(Error::NotFound)?);

        let mut mapping = self.mapping.read(token.token());
        let (ms, mut token) = mapping.token_split();
        let mut act = self.active.write(token.token());
        act.flush();
        let resolved = self.get_pmas(ms, &mut act, ar, None, at, ignore_permissions);
        act.flush();
        if let Err(stop) = resolved {
            return Stop::into_result(Err(stop));
        }
        let frames = act.internal_blocks(ar)?;

        // Invalidations wait for the copy, other readers need not.
        let _act = act.downgrade();
        for (i, frame) in frames.iter().enumerate() {
            let page = ar.start().add(i * PAGE_SIZE);
            let lo = addr.max(page);
            let hi = end.min(page.add(PAGE_SIZE));
            let done = lo.offset_from(addr);
            f(frame, lo.offset_from(page), done..done + hi.offset_from(lo));
        }
        Ok(Completion::Done(len))
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use test_log::test;

    use super::*;
    use crate::memmap::MMapOpts;
    use crate::memory::MemoryFile;
    use crate::mm::Layout;
    use crate::platform::ShadowPlatform;
    use crate::error::{SegvCode, Signal};

    fn setup() -> (Arc<MemoryManager>, CleanLockToken) {
        let mm = MemoryManager::new(ShadowPlatform::new(), Arc::new(MemoryFile::new(1 << 24)), Layout::default());
        (mm, unsafe { CleanLockToken::new() })
    }

    #[test]
    fn fault_outside_any_area_only_reads_the_map() {
        // Given
        let (mm, mut token) = setup();
        let ar = mm.mmap(MMapOpts::anonymous(0x1000).at(VirtualAddress::new(0x10_0000)), &mut token).unwrap();
        let reader = mm.mapping.read(token.token());

        // When
        let (tx, rx) = std::sync::mpsc::channel();
        let faulter = {
            let mm = Arc::clone(&mm);
            std::thread::spawn(move || {
                let mut token = unsafe { CleanLockToken::new() };
                tx.send(mm.handle_user_fault(ar.end().add(0x10), Access::READ, &mut token)).unwrap();
            })
        };

        // Then
        let fault = rx.recv_timeout(std::time::Duration::from_secs(5));
        drop(reader);
        faulter.join().unwrap();
        assert_eq!(fault, Ok(Err(Error::NotFound)));
    }

    #[test]
    fn copy_out_then_in_across_pages() {
        // Given
        let (mm, mut token) = setup();
        let ar = mm.mmap(MMapOpts::anonymous(0x3000), &mut token).unwrap();
        let addr = ar.start().add(0xff0);
        let data: alloc::vec::Vec<u8> = (0..0x1010u32).map(|i| i as u8).collect();

        // When
        let written = mm.copy_out(addr, &data, false, &mut token).unwrap().unwrap_done();
        let mut back = alloc::vec![0u8; data.len()];
        let read = mm.copy_in(addr, &mut back, false, &mut token).unwrap().unwrap_done();

        // Then
        assert_eq!(written, data.len());
        assert_eq!(read, data.len());
        assert_eq!(back, data);
        assert_eq!(mm.resident_set_size(&mut token), 0x2000);
    }

    #[test]
    fn ignore_permissions_writes_read_only_memory() {
        let (mm, mut token) = setup();
        let mut opts = MMapOpts::anonymous(0x1000);
        opts.perms = Access::READ;
        let ar = mm.mmap(opts, &mut token).unwrap();

        assert_eq!(mm.copy_out(ar.start(), b"hi", false, &mut token), Err(Error::AccessDenied));
        mm.copy_out(ar.start(), b"hi", true, &mut token).unwrap().unwrap_done();

        let mut back = [0u8; 2];
        mm.copy_in(ar.start(), &mut back, false, &mut token).unwrap().unwrap_done();
        assert_eq!(&back, b"hi");
    }

    #[test]
    fn copy_over_a_hole_is_not_found() {
        let (mm, mut token) = setup();
        let ar = mm.mmap(MMapOpts::anonymous(0x1000), &mut token).unwrap();

        let mut buf = [0u8; 0x20];
        let result = mm.copy_in(ar.end().sub(0x10), &mut buf, false, &mut token);

        assert_eq!(result, Err(Error::NotFound));
    }

    #[test]
    fn stack_grows_down_to_the_fault() {
        // Given
        let (mm, mut token) = setup();
        let mut opts = MMapOpts::anonymous(0x2000).at(VirtualAddress::new(0x7000_0000));
        opts.grows_down = true;
        mm.mmap(opts, &mut token).unwrap();

        // When
        let below = VirtualAddress::new(0x7000_0000 - 0x3008);
        mm.handle_user_fault(below, Access::WRITE, &mut token).unwrap().unwrap_done();

        // Then
        assert_eq!(mm.vma_count(&mut token), 1);
        assert_eq!(mm.usage_as(&mut token), 0x2000 + 0x4000);
    }

    #[test]
    fn stack_growth_respects_the_limit() {
        let (mm, mut token) = setup();
        let mut opts = MMapOpts::anonymous(0x2000).at(VirtualAddress::new(0x7000_0000));
        opts.grows_down = true;
        mm.mmap(opts, &mut token).unwrap();
        let mut limits = mm.limits(&mut token);
        limits.stack = 0x4000;
        mm.set_limits(limits, &mut token);

        let far = VirtualAddress::new(0x7000_0000 - 0x3000);
        let response = mm.deliver_fault(far, Access::READ, &mut token);

        assert_eq!(response, FaultResponse::Signal(Signal::Segv(SegvCode::MapErr)));
        assert_eq!(mm.usage_as(&mut token), 0x2000);
    }
}
