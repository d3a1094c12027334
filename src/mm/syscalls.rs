//! The memory syscalls, with Linux argument validation.

use alloc::vec::Vec;

use super::{exceeds, MappingState, MemoryManager};
use crate::addr::{round_up_pages, AddrRange, Access, VirtualAddress, PAGE_SIZE};
use crate::error::{Completion, Error, Result, Stop};
use crate::memmap::{MLockMode, MMapOpts, NumaPolicy, SharedObject};
use crate::sync::{CleanLockToken, LockToken, MappingLevel};

/// Whether `mremap` may place the result elsewhere.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MremapMove {
    /// Resize in place or fail.
    #[default]
    No,
    /// `MREMAP_MAYMOVE`
    May,
    /// `MREMAP_MAYMOVE | MREMAP_FIXED`, to `MremapOpts::new_addr`.
    Must,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MremapOpts {
    pub move_: MremapMove,
    /// Destination with [`MremapMove::Must`].
    pub new_addr: VirtualAddress,
}

bitflags::bitflags! {
    /// `mlockall` flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MlockAllFlags: u32 {
        const CURRENT = 1;
        const FUTURE = 2;
        const ONFAULT = 4;
    }
}

/// `madvise` advice.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Advice {
    Normal,
    Random,
    Sequential,
    WillNeed,
    DontNeed,
    Free,
    DontFork,
    DoFork,
    Mergeable,
    Unmergeable,
    HugePage,
    NoHugePage,
    DontDump,
    DoDump,
}

impl Advice {
    /// Parse a Linux `MADV_*` value.
    pub fn from_raw(advice: i32) -> Option<Self> {
        Some(match advice {
            0 => Advice::Normal,
            1 => Advice::Random,
            2 => Advice::Sequential,
            3 => Advice::WillNeed,
            4 => Advice::DontNeed,
            8 => Advice::Free,
            10 => Advice::DontFork,
            11 => Advice::DoFork,
            12 => Advice::Mergeable,
            13 => Advice::Unmergeable,
            14 => Advice::HugePage,
            15 => Advice::NoHugePage,
            16 => Advice::DontDump,
            17 => Advice::DoDump,
            _ => return None,
        })
    }
}

/// The range `[page of addr, end of the page holding addr + len)`, as `mlock`
/// and friends round it.
fn enclosing_pages(addr: VirtualAddress, len: usize) -> Result<AddrRange> {
    let start = addr.page();
    let len = len
        .checked_add(addr.offset_from(start))
        .and_then(round_up_pages)
        .ok_or(Error::InvalidArgument)?;
    AddrRange::with_len(start, len).ok_or(Error::InvalidArgument)
}

/// A page-aligned `addr` with `len` rounded up, possibly empty.
fn aligned_range(addr: VirtualAddress, len: usize) -> Result<AddrRange> {
    if !addr.is_page_aligned() {
        return Err(Error::InvalidArgument);
    }
    let len = round_up_pages(len).ok_or(Error::InvalidArgument)?;
    AddrRange::with_len(addr, len).ok_or(Error::InvalidArgument)
}

impl MemoryManager {
    /// Map memory as described by `opts`, returning where.
    pub fn mmap(&self, mut opts: MMapOpts, token: &mut CleanLockToken) -> Result<AddrRange> {
        if opts.length == 0 {
            return Err(Error::InvalidArgument);
        }
        opts.length = round_up_pages(opts.length).ok_or(Error::OutOfMemory)?;
        if opts.offset % PAGE_SIZE as u64 != 0 || opts.offset.checked_add(opts.length as u64).is_none() {
            return Err(Error::InvalidArgument);
        }
        if opts.fixed && !opts.addr.is_page_aligned() {
            return Err(Error::InvalidArgument);
        }
        if opts.grows_down && opts.mappable.is_some() {
            return Err(Error::InvalidArgument);
        }
        if !opts.max_perms.contains(opts.perms) {
            return Err(Error::AccessDenied);
        }
        if !opts.private && opts.mappable.is_none() {
            SharedObject::anonymous(opts.length as u64).configure_mmap(&mut opts);
        }

        let result = {
            let mut mapping = self.mapping.write(token.token());
            let (ms, mut token) = mapping.token_split();
            let ar = self.create_vma(ms, &mut token, &opts)?;
            let eager = ms
                .vmas
                .contains(ar.start())
                .map_or(false, |(_, vma)| vma.mlock_mode == MLockMode::Eager);

            if opts.precommit || eager {
                // Faults may proceed while this populates.
                let mut mapping = mapping.downgrade();
                let (ms, mut token) = mapping.token_split();
                self.populate_new_mapping(ms, &mut token, ar);
            }
            Ok(ar)
        };
        self.check_invariants(token);
        result
    }

    /// Unmap `[addr, addr + len)`. Holes are fine.
    pub fn munmap(&self, addr: VirtualAddress, len: usize, token: &mut CleanLockToken) -> Result<()> {
        let ar = AddrRange::validate_nonempty(addr, len).ok_or(Error::InvalidArgument)?;
        {
            let mut mapping = self.mapping.write(token.token());
            let (ms, mut token) = mapping.token_split();
            self.unmap_locked(ms, &mut token, ar);
        }
        self.check_invariants(token);
        Ok(())
    }

    /// Change the permissions of `[addr, addr + len)`, which must be mapped
    /// throughout.
    pub fn mprotect(
        &self,
        addr: VirtualAddress,
        len: usize,
        perms: Access,
        token: &mut CleanLockToken,
    ) -> Result<()> {
        let ar = aligned_range(addr, len)?;
        if ar.is_empty() {
            return Ok(());
        }
        let result = {
            let mut mapping = self.mapping.write(token.token());
            let (ms, mut token) = mapping.token_split();
            self.mprotect_locked(ms, &mut token, ar, perms)
        };
        self.check_invariants(token);
        result
    }

    fn mprotect_locked(
        &self,
        ms: &mut MappingState,
        token: &mut LockToken<'_, MappingLevel>,
        ar: AddrRange,
        perms: Access,
    ) -> Result<()> {
        if !ms.vmas.is_covered(ar) {
            return Err(Error::NotFound);
        }
        if ms.vmas.conflicts(ar).any(|(_, vma)| !vma.max_perms.contains(perms)) {
            return Err(Error::AccessDenied);
        }

        ms.vmas.isolate(ar);
        ms.update_vmas(ar, |vma| vma.set_perms(perms));
        log::debug!("mm {}: protected {:?} {:?}", self.id, ar, perms);

        // Resolved ranges keep their storage. Narrowed ones must leave the
        // address space now; widened ones are installed at the next fault.
        let mut act = self.active.write(token.token());
        act.pmas.isolate(ar);
        let mut narrowed = Vec::new();
        for (vma_range, vma) in ms.vmas.conflicts(ar) {
            for (range, pma) in act.pmas.conflicts_mut(vma_range) {
                let new_perms = pma.perms_under(vma.effective_perms);
                if !pma.effective_perms.difference(new_perms).is_empty() {
                    narrowed.push(range);
                }
                pma.effective_perms = new_perms;
            }
        }
        for range in narrowed {
            act.invalidate_as(range);
        }
        act.pmas.merge_range(ar);
        act.flush();
        drop(act);

        ms.vmas.merge_range(ar);
        Ok(())
    }

    /// Resize the mapping at `old_addr` and possibly move it. Returns the new
    /// address.
    pub fn mremap(
        &self,
        old_addr: VirtualAddress,
        old_size: usize,
        new_size: usize,
        opts: MremapOpts,
        token: &mut CleanLockToken,
    ) -> Result<VirtualAddress> {
        if !old_addr.is_page_aligned() {
            return Err(Error::InvalidArgument);
        }
        let old_size = round_up_pages(old_size).ok_or(Error::InvalidArgument)?;
        let new_size = round_up_pages(new_size).ok_or(Error::InvalidArgument)?;
        if new_size == 0 {
            return Err(Error::InvalidArgument);
        }
        let old_ar = AddrRange::with_len(old_addr, old_size).ok_or(Error::InvalidArgument)?;

        let result = {
            let mut mapping = self.mapping.write(token.token());
            let (ms, mut token) = mapping.token_split();
            self.mremap_locked(ms, &mut token, old_ar, new_size, opts)
        };
        self.check_invariants(token);
        result
    }

    fn mremap_locked(
        &self,
        ms: &mut MappingState,
        token: &mut LockToken<'_, MappingLevel>,
        mut old_ar: AddrRange,
        new_size: usize,
        opts: MremapOpts,
    ) -> Result<VirtualAddress> {
        let (vma_range, vma) = ms
            .vmas
            .contains(old_ar.start())
            .map(|(range, vma)| (range, vma.clone()))
            .ok_or(Error::NotFound)?;
        // Only shared mappings can be duplicated.
        if old_ar.is_empty() && vma.private {
            return Err(Error::InvalidArgument);
        }
        if new_size > old_ar.len()
            && vma.is_locked()
            && exceeds(ms.locked_as + new_size - old_ar.len(), ms.limits.memlock)
        {
            return Err(Error::LimitExceeded);
        }

        if opts.move_ != MremapMove::Must {
            if new_size <= old_ar.len() {
                if new_size < old_ar.len() {
                    let tail = AddrRange::new(old_ar.start().add(new_size), old_ar.end());
                    self.unmap_locked(ms, token, tail);
                }
                return Ok(old_ar.start());
            }
            if vma_range.end() < old_ar.end() {
                return Err(Error::NotFound);
            }

            let grow = MMapOpts {
                length: new_size - old_ar.len(),
                mappable: vma.mappable.clone(),
                mapping_identity: vma.id.clone(),
                offset: match vma.mappable {
                    Some(_) => vma.file_range(vma_range, AddrRange::new(vma_range.start(), old_ar.end())).end,
                    None => 0,
                },
                addr: old_ar.end(),
                fixed: true,
                unmap: false,
                private: vma.private,
                grows_down: vma.grows_down,
                precommit: false,
                perms: vma.real_perms,
                max_perms: vma.max_perms,
                mlock_mode: vma.mlock_mode,
                hint: vma.hint.clone(),
            };
            match self.create_vma(ms, token, &grow) {
                Ok(grown) => {
                    ms.vmas.isolate(grown);
                    ms.update_vmas(grown, |new| {
                        new.numa_policy = vma.numa_policy;
                        new.numa_nodemask = vma.numa_nodemask;
                    });
                    ms.vmas.merge_range(AddrRange::new(old_ar.start(), grown.end()));
                    if vma.mlock_mode == MLockMode::Eager {
                        self.populate_new_mapping(ms, token, grown);
                    }
                    return Ok(old_ar.start());
                }
                Err(err) if opts.move_ == MremapMove::No => {
                    return Err(match err {
                        Error::Exists => Error::OutOfMemory,
                        err => err,
                    });
                }
                Err(err) => log::trace!("mm {}: cannot grow {:?} in place: {}", self.id, old_ar, err),
            }
        }

        let new_ar = if opts.move_ == MremapMove::Must {
            if !opts.new_addr.is_page_aligned() {
                return Err(Error::InvalidArgument);
            }
            let new_ar = AddrRange::with_len(opts.new_addr, new_size).ok_or(Error::InvalidArgument)?;
            if old_ar.overlaps(new_ar) {
                return Err(Error::InvalidArgument);
            }
            if !self.layout.user_range().is_superset_of(new_ar) {
                return Err(Error::OutOfMemory);
            }
            self.unmap_locked(ms, token, new_ar);
            if new_size < old_ar.len() {
                let tail = AddrRange::new(old_ar.start().add(new_size), old_ar.end());
                self.unmap_locked(ms, token, tail);
                old_ar = AddrRange::new(old_ar.start(), tail.start());
            }
            new_ar
        } else {
            ms.find_available(&self.layout, new_size, VirtualAddress::new(0))?
        };

        // The unmaps above may have split the source.
        let (vma_range, vma) = ms
            .vmas
            .contains(old_ar.start())
            .map(|(range, vma)| (range, vma.clone()))
            .ok_or(Error::NotFound)?;
        if vma_range.end() < old_ar.end() {
            return Err(Error::NotFound);
        }
        if exceeds(ms.usage_as - old_ar.len() + new_ar.len(), ms.limits.address_space) {
            return Err(Error::OutOfMemory);
        }
        let offset = vma.file_range(vma_range, old_ar).start;
        if let Some(mappable) = &vma.mappable {
            offset.checked_add(new_ar.len() as u64).ok_or(Error::InvalidArgument)?;
            mappable.copy_mapping(&self.space, old_ar, new_ar, offset, vma.can_write_mappable(), token.token())?;
        }

        if old_ar.is_empty() {
            let mut dup = vma.clone();
            dup.offset = offset;
            log::debug!("mm {}: duplicated {:?} at {:?}", self.id, old_ar.start(), new_ar);
            ms.insert_vma(new_ar, dup);
            if vma.mlock_mode == MLockMode::Eager {
                self.populate_new_mapping(ms, token, new_ar);
            }
            return Ok(new_ar.start());
        }

        // The object keeps the old mapping until the resolved ranges have
        // moved, so no invalidation of them is missed.
        ms.vmas.isolate(old_ar);
        let moved = ms.take_vma(old_ar).ok_or(Error::NotFound)?;
        let writable = moved.can_write_mappable();
        ms.insert_vma(new_ar, moved);
        {
            let mut act = self.active.write(token.token());
            act.move_pmas(old_ar, new_ar);
            act.flush();
        }
        if let Some(mappable) = &vma.mappable {
            mappable.remove_mapping(&self.space, old_ar, offset, writable, token.token());
        }
        log::debug!("mm {}: moved {:?} to {:?}", self.id, old_ar, new_ar);

        if vma.mlock_mode == MLockMode::Eager {
            self.populate_new_mapping(ms, token, new_ar);
        }
        Ok(new_ar.start())
    }

    /// Start the heap at `addr`, dropping any previous one.
    pub fn brk_setup(&self, addr: VirtualAddress, token: &mut CleanLockToken) {
        {
            let mut mapping = self.mapping.write(token.token());
            let (ms, mut token) = mapping.token_split();
            if let Some(end) = ms.brk.end().round_up() {
                let old = AddrRange::new(ms.brk.start().page(), end);
                if !old.is_empty() {
                    self.unmap_locked(ms, &mut token, old);
                }
            }
            ms.brk = AddrRange::new(addr, addr);
        }
        self.check_invariants(token);
    }

    /// Move the end of the heap to `addr`. Returns the new end, or the
    /// unchanged one if that is not possible.
    pub fn brk(&self, addr: VirtualAddress, token: &mut CleanLockToken) -> VirtualAddress {
        let end = {
            let mut mapping = self.mapping.write(token.token());
            let (ms, mut token) = mapping.token_split();
            match self.brk_locked(ms, &mut token, addr) {
                Ok(()) => addr,
                Err(err) => {
                    log::debug!("mm {}: brk to {:?} failed: {}", self.id, addr, err);
                    ms.brk.end()
                }
            }
        };
        self.check_invariants(token);
        end
    }

    fn brk_locked(
        &self,
        ms: &mut MappingState,
        token: &mut LockToken<'_, MappingLevel>,
        addr: VirtualAddress,
    ) -> Result<()> {
        if addr < ms.brk.start() {
            return Err(Error::InvalidArgument);
        }
        if exceeds(addr.offset_from(ms.brk.start()), ms.limits.data) {
            return Err(Error::OutOfMemory);
        }
        let old_end = ms.brk.end().round_up().ok_or(Error::OutOfMemory)?;
        let new_end = addr.round_up().ok_or(Error::OutOfMemory)?;

        if old_end < new_end {
            let mut opts = MMapOpts::anonymous(new_end.offset_from(old_end)).at(old_end);
            opts.unmap = false;
            self.create_vma(ms, token, &opts)?;
        } else if new_end < old_end {
            self.unmap_locked(ms, token, AddrRange::new(new_end, old_end));
        }
        ms.brk = AddrRange::new(ms.brk.start(), addr);
        Ok(())
    }

    /// Set the lock mode of the mapped parts of the pages holding
    /// `[addr, addr + len)`. Fails with [`Error::NotFound`] after doing so if
    /// part of the range was not mapped.
    ///
    /// [`MLockMode::Eager`] populates the range, which is cancelled if the
    /// calling thread is interrupted while a backing object blocks. The lock
    /// mode stays set in that case.
    pub fn mlock(
        &self,
        addr: VirtualAddress,
        len: usize,
        mode: MLockMode,
        token: &mut CleanLockToken,
    ) -> Result<Completion<()>> {
        let ar = enclosing_pages(addr, len)?;
        let result = {
            let mut mapping = self.mapping.write(token.token());
            let (ms, mut token) = mapping.token_split();
            self.mlock_locked(ms, &mut token, ar, mode)
        };
        self.check_invariants(token);
        Stop::into_result(result)
    }

    pub fn munlock(&self, addr: VirtualAddress, len: usize, token: &mut CleanLockToken) -> Result<()> {
        // Unlocking populates nothing, so there is nothing to cancel.
        self.mlock(addr, len, MLockMode::None, token).map(|_| ())
    }

    fn mlock_locked(
        &self,
        ms: &mut MappingState,
        token: &mut LockToken<'_, MappingLevel>,
        ar: AddrRange,
        mode: MLockMode,
    ) -> Result<(), Stop> {
        if mode != MLockMode::None {
            if ms.limits.memlock == 0 {
                return Err(Error::LimitExceeded.into());
            }
            // Holes in `ar` lock nothing.
            let newly_locked = ms.mapped_bytes(ar) - ms.locked_bytes(ar);
            if exceeds(ms.locked_as + newly_locked, ms.limits.memlock) {
                return Err(Error::LimitExceeded.into());
            }
        }
        if ar.is_empty() {
            return Ok(());
        }

        let covered = ms.vmas.is_covered(ar);
        ms.vmas.isolate(ar);
        ms.update_vmas(ar, |vma| vma.mlock_mode = mode);
        ms.vmas.merge_range(ar);
        if !covered {
            return Err(Error::NotFound.into());
        }
        if mode == MLockMode::Eager {
            self.populate_vmas(ms, token, ar)?;
        }
        Ok(())
    }

    /// Lock every current and/or future mapping. Populating current mappings
    /// can be cancelled as for [`MemoryManager::mlock`].
    pub fn mlockall(&self, flags: MlockAllFlags, token: &mut CleanLockToken) -> Result<Completion<()>> {
        if !flags.intersects(MlockAllFlags::CURRENT | MlockAllFlags::FUTURE) {
            return Err(Error::InvalidArgument);
        }
        let mode = if flags.contains(MlockAllFlags::ONFAULT) {
            MLockMode::Lazy
        } else {
            MLockMode::Eager
        };

        let result = {
            let mut mapping = self.mapping.write(token.token());
            let (ms, mut token) = mapping.token_split();
            self.set_all_mlock(ms, &mut token, flags, mode)
        };
        self.check_invariants(token);
        Stop::into_result(result)
    }

    pub fn munlockall(&self, token: &mut CleanLockToken) {
        {
            let mut mapping = self.mapping.write(token.token());
            let (ms, mut token) = mapping.token_split();
            // Cannot fail: unlocking checks no limit and populates nothing.
            let _ = self.set_all_mlock(
                ms,
                &mut token,
                MlockAllFlags::CURRENT | MlockAllFlags::FUTURE,
                MLockMode::None,
            );
        }
        self.check_invariants(token);
    }

    fn set_all_mlock(
        &self,
        ms: &mut MappingState,
        token: &mut LockToken<'_, MappingLevel>,
        flags: MlockAllFlags,
        mode: MLockMode,
    ) -> Result<(), Stop> {
        let all = self.layout.user_range();
        if flags.contains(MlockAllFlags::CURRENT) {
            if mode != MLockMode::None && exceeds(ms.usage_as, ms.limits.memlock) {
                return Err(Error::LimitExceeded.into());
            }
            ms.update_vmas(all, |vma| vma.mlock_mode = mode);
            ms.vmas.merge_range(all);
        }
        if flags.contains(MlockAllFlags::FUTURE) {
            ms.def_mlock_mode = mode;
        }
        if flags.contains(MlockAllFlags::CURRENT) && mode == MLockMode::Eager {
            self.populate_best_effort(ms, token, all)?;
        }
        Ok(())
    }

    /// Apply `advice` to `[addr, addr + len)`, which must be mapped throughout.
    ///
    /// [`Advice::WillNeed`] populates the range and reports cancellation if
    /// the calling thread is interrupted meanwhile.
    pub fn madvise(
        &self,
        addr: VirtualAddress,
        len: usize,
        advice: Advice,
        token: &mut CleanLockToken,
    ) -> Result<Completion<()>> {
        let ar = aligned_range(addr, len)?;
        if ar.is_empty() {
            return Ok(Completion::Done(()));
        }
        let result = {
            let mut mapping = self.mapping.write(token.token());
            let (ms, mut token) = mapping.token_split();
            self.madvise_locked(ms, &mut token, ar, advice)
        };
        self.check_invariants(token);
        Stop::into_result(result)
    }

    fn madvise_locked(
        &self,
        ms: &mut MappingState,
        token: &mut LockToken<'_, MappingLevel>,
        ar: AddrRange,
        advice: Advice,
    ) -> Result<(), Stop> {
        if !ms.vmas.is_covered(ar) {
            return Err(Error::NotFound.into());
        }
        match advice {
            Advice::DontNeed | Advice::Free => {
                for (_, vma) in ms.vmas.conflicts(ar) {
                    if advice == Advice::DontNeed && vma.is_locked() {
                        return Err(Error::InvalidArgument.into());
                    }
                    if advice == Advice::Free && !(vma.private && vma.mappable.is_none()) {
                        return Err(Error::InvalidArgument.into());
                    }
                }
                let mut act = self.active.write(token.token());
                act.unmap_pmas(ar);
                act.invalidate_as(ar);
                act.flush();
                log::debug!("mm {}: dropped {:?}", self.id, ar);
            }
            Advice::DontFork | Advice::DoFork => {
                ms.vmas.isolate(ar);
                ms.update_vmas(ar, |vma| vma.dont_fork = advice == Advice::DontFork);
                ms.vmas.merge_range(ar);
            }
            Advice::WillNeed => self.populate_best_effort(ms, token, ar)?,
            Advice::Normal
            | Advice::Random
            | Advice::Sequential
            | Advice::Mergeable
            | Advice::Unmergeable
            | Advice::HugePage
            | Advice::NoHugePage
            | Advice::DontDump
            | Advice::DoDump => {}
        }
        Ok(())
    }

    /// Record a NUMA policy for `[addr, addr + len)`, which must be mapped
    /// throughout.
    pub fn mbind(
        &self,
        addr: VirtualAddress,
        len: usize,
        policy: NumaPolicy,
        nodemask: u64,
        token: &mut CleanLockToken,
    ) -> Result<()> {
        let ar = aligned_range(addr, len)?;
        if ar.is_empty() {
            return Ok(());
        }
        {
            let mut mapping = self.mapping.write(token.token());
            if !mapping.vmas.is_covered(ar) {
                return Err(Error::NotFound);
            }
            mapping.vmas.isolate(ar);
            mapping.update_vmas(ar, |vma| {
                vma.numa_policy = policy;
                vma.numa_nodemask = nodemask;
            });
            mapping.vmas.merge_range(ar);
        }
        self.check_invariants(token);
        Ok(())
    }

    /// The NUMA policy and node mask of the mapping at `addr`.
    pub fn numa_policy(&self, addr: VirtualAddress, token: &mut CleanLockToken) -> Result<(NumaPolicy, u64)> {
        let mapping = self.mapping.read(token.token());
        let (_, vma) = mapping.vmas.contains(addr).ok_or(Error::NotFound)?;
        Ok((vma.numa_policy, vma.numa_nodemask))
    }

    /// Resolve and install every accessible area in `ar` without breaking
    /// copy-on-write.
    fn populate_vmas(
        &self,
        ms: &MappingState,
        token: &mut LockToken<'_, MappingLevel>,
        ar: AddrRange,
    ) -> Result<(), Stop> {
        let ranges: Vec<AddrRange> = ms
            .vmas
            .conflicts(ar)
            .filter(|(_, vma)| !vma.effective_perms.is_empty())
            .map(|(range, _)| range.intersect(ar))
            .collect();

        let mut act = self.active.write(token.token());
        act.flush();
        let mut result = Ok(());
        for range in ranges {
            result = self.get_pmas(ms, &mut act, range, None, Access::NONE, false);
            if result.is_ok() {
                result = act.install_range(ms, range, true).map_err(Stop::from);
            }
            if result.is_err() {
                break;
            }
        }
        act.flush();
        result
    }

    /// Populate `ar` ignoring failures, which leave the rest to faults.
    /// Cancellation is still reported.
    fn populate_best_effort(
        &self,
        ms: &MappingState,
        token: &mut LockToken<'_, MappingLevel>,
        ar: AddrRange,
    ) -> Result<(), Stop> {
        match self.populate_vmas(ms, token, ar) {
            Err(Stop::Failed(err)) => {
                log::warn!("mm {}: populating {:?} failed: {}", self.id, ar, err);
                Ok(())
            }
            Err(Stop::Cancelled) => {
                log::debug!("mm {}: populating {:?} interrupted", self.id, ar);
                Err(Stop::Cancelled)
            }
            Ok(()) => Ok(()),
        }
    }

    /// Populate a mapping that has just been created or moved. The mapping
    /// stands even if population is cancelled: the caller gets its address,
    /// and the interrupt stays pending on the thread for its next blocking
    /// step.
    fn populate_new_mapping(&self, ms: &MappingState, token: &mut LockToken<'_, MappingLevel>, ar: AddrRange) {
        let _ = self.populate_best_effort(ms, token, ar);
    }
}
