use alloc::{string::String, sync::Arc};
use core::sync::atomic::{AtomicUsize, Ordering};

use super::set::Segment;
use super::{exceeds, MappingState, MemoryManager, GUARD_GAP};
use crate::addr::{AddrRange, Access, VirtualAddress};
use crate::error::{Error, Result};
use crate::memmap::{
    same_mappable, MLockMode, MMapOpts, Mappable, MappingIdentity, NumaPolicy,
};
use crate::memory::FileRange;
use crate::sync::{LockToken, MappingLevel};

/// A virtual memory area: part of the address space mapped with uniform
/// attributes.
pub(crate) struct Vma {
    /// `None` for anonymous memory.
    pub mappable: Option<Arc<dyn Mappable>>,
    /// Offset of the start of the area in `mappable`.
    pub offset: u64,
    /// Permissions as requested by the application.
    pub real_perms: Access,
    /// `real_perms` with implied accesses, capped by `max_perms`.
    pub effective_perms: Access,
    pub max_perms: Access,
    pub private: bool,
    pub grows_down: bool,
    pub dont_fork: bool,
    pub mlock_mode: MLockMode,
    pub numa_policy: NumaPolicy,
    pub numa_nodemask: u64,
    pub id: Option<Arc<dyn MappingIdentity>>,
    pub hint: Option<String>,
    /// Address of the last fault, to guess the direction of sequential access.
    pub last_fault: AtomicUsize,
}

fn same_identity(a: &Option<Arc<dyn MappingIdentity>>, b: &Option<Arc<dyn MappingIdentity>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const (),
        _ => false,
    }
}

impl Vma {
    pub fn new(opts: &MMapOpts, mlock_mode: MLockMode) -> Self {
        Self {
            mappable: opts.mappable.clone(),
            offset: opts.offset,
            real_perms: opts.perms,
            effective_perms: opts.perms.effective() & opts.max_perms,
            max_perms: opts.max_perms,
            private: opts.private,
            grows_down: opts.grows_down,
            dont_fork: false,
            mlock_mode,
            numa_policy: NumaPolicy::Default,
            numa_nodemask: 0,
            id: opts.mapping_identity.clone(),
            hint: opts.hint.clone(),
            last_fault: AtomicUsize::new(0),
        }
    }

    pub fn set_perms(&mut self, perms: Access) {
        self.real_perms = perms;
        self.effective_perms = perms.effective() & self.max_perms;
    }

    /// Shared mappings that may write back to their object.
    pub fn can_write_mappable(&self) -> bool {
        !self.private && self.max_perms.contains(Access::WRITE)
    }

    /// Counted against `RLIMIT_DATA`.
    pub fn is_private_data(&self) -> bool {
        self.private && self.real_perms.contains(Access::WRITE) && !self.grows_down
    }

    pub fn is_locked(&self) -> bool {
        self.mlock_mode != MLockMode::None
    }

    /// The object range behind `ar`, a part of `range`, the area's own range.
    pub fn file_range(&self, range: AddrRange, ar: AddrRange) -> FileRange {
        let start = self.offset + ar.start().offset_from(range.start()) as u64;
        FileRange::new(start, start + ar.len() as u64)
    }

    /// The addresses at which `fr` appears within `range`.
    pub fn addr_range(&self, range: AddrRange, fr: FileRange) -> AddrRange {
        let start = range.start().add((fr.start - self.offset) as usize);
        AddrRange::new(start, start.add(fr.len() as usize))
    }

    /// Remember `addr` as the latest fault, returning whether it continues
    /// upwards from the previous one.
    pub fn record_fault(&self, addr: VirtualAddress) -> bool {
        let prev = self.last_fault.swap(addr.data(), Ordering::Relaxed);
        addr.data() >= prev
    }
}

impl Clone for Vma {
    fn clone(&self) -> Self {
        Self {
            mappable: self.mappable.clone(),
            offset: self.offset,
            real_perms: self.real_perms,
            effective_perms: self.effective_perms,
            max_perms: self.max_perms,
            private: self.private,
            grows_down: self.grows_down,
            dont_fork: self.dont_fork,
            mlock_mode: self.mlock_mode,
            numa_policy: self.numa_policy,
            numa_nodemask: self.numa_nodemask,
            id: self.id.clone(),
            hint: self.hint.clone(),
            last_fault: AtomicUsize::new(self.last_fault.load(Ordering::Relaxed)),
        }
    }
}

impl Segment for Vma {
    fn split_at(&mut self, range: AddrRange, at: VirtualAddress) -> Self {
        let mut next = self.clone();
        if self.mappable.is_some() {
            next.offset += at.offset_from(range.start()) as u64;
        }
        next
    }

    fn try_merge(&mut self, range: AddrRange, next: &Self, _next_range: AddrRange) -> bool {
        let same_object = match (&self.mappable, &next.mappable) {
            (None, None) => true,
            (Some(a), Some(b)) => {
                same_mappable(a, b) && self.offset + range.len() as u64 == next.offset
            }
            _ => false,
        };
        same_object
            && self.real_perms == next.real_perms
            && self.max_perms == next.max_perms
            && self.private == next.private
            && self.grows_down == next.grows_down
            && self.dont_fork == next.dont_fork
            && self.mlock_mode == next.mlock_mode
            && self.numa_policy == next.numa_policy
            && self.numa_nodemask == next.numa_nodemask
            && same_identity(&self.id, &next.id)
            && self.hint == next.hint
    }
}

impl MappingState {
    fn add_accounting(&mut self, len: usize, vma: &Vma) {
        self.usage_as += len;
        if vma.is_locked() {
            self.locked_as += len;
        }
        if vma.is_private_data() {
            self.data_as += len;
        }
    }

    fn remove_accounting(&mut self, len: usize, vma: &Vma) {
        self.usage_as -= len;
        if vma.is_locked() {
            self.locked_as -= len;
        }
        if vma.is_private_data() {
            self.data_as -= len;
        }
    }

    /// Insert an area, keeping the accounting in step.
    pub(super) fn insert_vma(&mut self, range: AddrRange, vma: Vma) -> AddrRange {
        self.add_accounting(range.len(), &vma);
        self.vmas.insert(range, vma)
    }

    /// Take the area covering exactly `ar` out of the map without telling its
    /// object, keeping the accounting in step.
    pub(super) fn take_vma(&mut self, ar: AddrRange) -> Option<Vma> {
        let (range, vma) = self.vmas.remove(ar).pop()?;
        self.remove_accounting(range.len(), &vma);
        Some(vma)
    }

    /// Apply `f` to every area in `ar`, adjusting the locked and data sizes by
    /// the length of each area whose class changed. Areas must have been
    /// isolated to `ar`.
    pub(super) fn update_vmas(&mut self, ar: AddrRange, mut f: impl FnMut(&mut Vma)) {
        let mut locked = 0isize;
        let mut data = 0isize;
        for (range, vma) in self.vmas.conflicts_mut(ar) {
            let len = range.len() as isize;
            let before = (vma.is_locked(), vma.is_private_data());
            f(vma);
            locked += len * (vma.is_locked() as isize - before.0 as isize);
            data += len * (vma.is_private_data() as isize - before.1 as isize);
        }
        self.locked_as = self.locked_as.wrapping_add_signed(locked);
        self.data_as = self.data_as.wrapping_add_signed(data);
    }

    /// Bytes of `ar` covered by areas.
    pub(super) fn mapped_bytes(&self, ar: AddrRange) -> usize {
        self.vmas.conflicts(ar).map(|(range, _)| range.intersect(ar).len()).sum()
    }

    /// Bytes of `ar` covered by areas with an mlock mode.
    pub(super) fn locked_bytes(&self, ar: AddrRange) -> usize {
        self.vmas
            .conflicts(ar)
            .filter(|(_, vma)| vma.is_locked())
            .map(|(range, _)| range.intersect(ar).len())
            .sum()
    }

    /// Whether `ar` is free, including the guard gap below any grows-down
    /// area right above it.
    fn is_free(&self, ar: AddrRange) -> bool {
        if self.vmas.conflicts(ar).next().is_some() {
            return false;
        }
        match self.vmas.next_after(ar.end()) {
            Some((above, vma)) if vma.grows_down => {
                above.start().data() - ar.end().data() >= GUARD_GAP
            }
            _ => true,
        }
    }

    /// Find room for `length` bytes. Tries `hint` when set, then the highest
    /// fit below the top-down base, then the lowest fit above the bottom-up
    /// base.
    pub(super) fn find_available(
        &self,
        layout: &super::Layout,
        length: usize,
        hint: VirtualAddress,
    ) -> Result<AddrRange> {
        let user = layout.user_range();
        if hint.data() != 0 {
            if let Some(ar) = AddrRange::with_len(hint.page(), length) {
                if user.is_superset_of(ar) && self.is_free(ar) {
                    return Ok(ar);
                }
            }
        }

        let top_down = AddrRange::new(layout.min_addr, layout.top_down_base.min(layout.max_addr));
        for gap in self.vmas.gaps(top_down).into_iter().rev() {
            let mut end = gap.end();
            if let Some((above, vma)) = self.vmas.next_after(gap.end()) {
                if vma.grows_down && above.start() == gap.end() {
                    end = match end.checked_sub(GUARD_GAP) {
                        Some(end) => end,
                        None => continue,
                    };
                }
            }
            if let Some(start) = end.checked_sub(length) {
                if start >= gap.start() {
                    return Ok(AddrRange::new(start, end));
                }
            }
        }

        let bottom_up = AddrRange::new(layout.bottom_up_base.max(layout.min_addr), layout.max_addr);
        for gap in self.vmas.gaps(bottom_up) {
            if let Some(ar) = AddrRange::with_len(gap.start(), length) {
                if gap.is_superset_of(ar) && self.is_free(ar) {
                    return Ok(ar);
                }
            }
        }
        Err(Error::OutOfMemory)
    }
}

impl MemoryManager {
    /// Create an area as described by `opts`, with the length already
    /// validated and rounded. Returns its range; it may have been merged with
    /// neighbours in the map, but the accounting covers only the new part.
    pub(super) fn create_vma(
        &self,
        ms: &mut MappingState,
        token: &mut LockToken<'_, MappingLevel>,
        opts: &MMapOpts,
    ) -> Result<AddrRange> {
        let ar = if opts.fixed {
            let ar = AddrRange::with_len(opts.addr, opts.length).ok_or(Error::OutOfMemory)?;
            if !self.layout.user_range().is_superset_of(ar) {
                return Err(Error::OutOfMemory);
            }
            if !opts.unmap && ms.vmas.conflicts(ar).next().is_some() {
                return Err(Error::Exists);
            }
            ar
        } else {
            ms.find_available(&self.layout, opts.length, opts.addr)?
        };

        let mlock_mode = match opts.mlock_mode {
            MLockMode::None => ms.def_mlock_mode,
            mode => mode,
        };
        let vma = Vma::new(opts, mlock_mode);

        // Limits count what the address space holds after replacing whatever
        // `ar` covers now.
        let replaced = if opts.unmap { ms.mapped_bytes(ar) } else { 0 };
        if exceeds(ms.usage_as - replaced + ar.len(), ms.limits.address_space) {
            return Err(Error::OutOfMemory);
        }
        if vma.is_locked() {
            let replaced = if opts.unmap { ms.locked_bytes(ar) } else { 0 };
            if exceeds(ms.locked_as - replaced + ar.len(), ms.limits.memlock) {
                return Err(Error::LimitExceeded);
            }
        }
        if vma.is_private_data() && exceeds(ms.data_as + ar.len(), ms.limits.data) {
            return Err(Error::OutOfMemory);
        }

        if opts.unmap {
            self.unmap_locked(ms, token, ar);
        }
        if let Some(mappable) = &vma.mappable {
            mappable.add_mapping(&self.space, ar, vma.offset, vma.can_write_mappable(), token.token())?;
        }
        log::debug!("mm {}: mapped {:?} {:?}", self.id, ar, vma.real_perms);
        ms.insert_vma(ar, vma);
        Ok(ar)
    }

    /// Remove the areas in `ar` along with their resolved ranges. Holes are
    /// fine.
    pub(super) fn unmap_locked(
        &self,
        ms: &mut MappingState,
        token: &mut LockToken<'_, MappingLevel>,
        ar: AddrRange,
    ) {
        {
            let mut act = self.active.write(token.token());
            act.unmap_pmas(ar);
            act.invalidate_as(ar);
            act.flush();
        }
        self.remove_vmas(ms, token, ar);
    }

    /// Remove the areas in `ar`, whose resolved ranges must already be gone.
    pub(super) fn remove_vmas(
        &self,
        ms: &mut MappingState,
        token: &mut LockToken<'_, MappingLevel>,
        ar: AddrRange,
    ) {
        for (range, vma) in ms.vmas.remove(ar) {
            if let Some(mappable) = &vma.mappable {
                mappable.remove_mapping(
                    &self.space,
                    range,
                    vma.offset,
                    vma.can_write_mappable(),
                    token.token(),
                );
            }
            log::debug!("mm {}: unmapped {:?}", self.id, range);
            ms.remove_accounting(range.len(), &vma);
        }
    }
}
