use alloc::{sync::Arc, vec::Vec};

use super::set::Segment;
use super::vma::Vma;
use super::{ActiveState, MappingState, MemoryManager};
use crate::addr::{AddrRange, Access, VirtualAddress, PAGE_SIZE};
use crate::error::{stop_on_cancel, Error, Stop};
use crate::memmap::InvalidateOpts;
use crate::memory::{same_file, BlockSeq, File, FileRange};

/// A platform mapping area: part of a VMA whose storage has been resolved.
#[derive(Clone)]
pub(crate) struct Pma {
    pub file: Arc<dyn File>,
    /// Offset in `file` of the start of the area.
    pub offset: u64,
    /// Permissions the storage was translated with.
    pub translate_perms: Access,
    /// What accesses through this area may do right now.
    pub effective_perms: Access,
    pub max_perms: Access,
    /// Writes must copy first.
    pub needs_cow: bool,
    /// `file` is the private memory file and the storage belongs to this
    /// address space alone, possibly shared with forks until written.
    pub private: bool,
    /// Frames of the area, cached for I/O.
    pub internal_blocks: Option<BlockSeq>,
}

/// Accesses allowed through storage translated with `translate_perms` in an
/// area allowing `vma_perms`.
pub(super) fn pma_perms(vma_perms: Access, translate_perms: Access, needs_cow: bool) -> Access {
    let mut perms = vma_perms & translate_perms;
    if needs_cow {
        perms.remove(Access::WRITE);
    }
    perms
}

impl Pma {
    pub fn file_range(&self, range: AddrRange) -> FileRange {
        FileRange::new(self.offset, self.offset + range.len() as u64)
    }

    /// The permissions to enforce for this area under `vma_perms`, as of now.
    pub fn perms_under(&self, vma_perms: Access) -> Access {
        pma_perms(vma_perms, self.translate_perms, self.needs_cow)
    }

    /// A duplicate holding its own references on the storage.
    pub fn duplicate(&self, range: AddrRange) -> Self {
        self.file.inc_ref(self.file_range(range));
        Self {
            internal_blocks: None,
            ..self.clone()
        }
    }
}

impl Segment for Pma {
    fn split_at(&mut self, range: AddrRange, at: VirtualAddress) -> Self {
        let delta = at.offset_from(range.start());
        let mut next = Self {
            offset: self.offset + delta as u64,
            internal_blocks: None,
            ..self.clone()
        };
        if let Some(blocks) = &mut self.internal_blocks {
            next.internal_blocks = Some(blocks.split_off(delta / PAGE_SIZE));
        }
        next
    }

    fn try_merge(&mut self, range: AddrRange, next: &Self, _next_range: AddrRange) -> bool {
        let mergeable = same_file(&self.file, &next.file)
            && self.offset + range.len() as u64 == next.offset
            && self.translate_perms == next.translate_perms
            && self.effective_perms == next.effective_perms
            && self.max_perms == next.max_perms
            && self.needs_cow == next.needs_cow
            && self.private == next.private;
        if !mergeable {
            return false;
        }
        match (&mut self.internal_blocks, &next.internal_blocks) {
            (Some(blocks), Some(next_blocks)) => blocks.extend(next_blocks.iter().cloned()),
            _ => self.internal_blocks = None,
        }
        true
    }
}

impl ActiveState {
    /// Drop every resolved range in `ar` and the storage references they hold.
    pub(super) fn unmap_pmas(&mut self, ar: AddrRange) {
        for (range, pma) in self.pmas.remove(ar) {
            pma.file.dec_ref(pma.file_range(range));
            self.sub_rss(range.len());
        }
    }

    /// Handle an invalidation from a backing object: drop the cached
    /// translations in `ar`, and private copies too if asked.
    pub(super) fn invalidate_locked(&mut self, ar: AddrRange, opts: InvalidateOpts) {
        self.pmas.isolate(ar);
        let doomed: Vec<AddrRange> = self
            .pmas
            .conflicts(ar)
            .filter(|(_, pma)| opts.invalidate_private || !pma.private)
            .map(|(range, _)| range)
            .collect();
        for range in doomed {
            log::trace!("invalidating {:?}", range);
            self.unmap_pmas(range);
            self.invalidate_as(range);
        }
        self.pmas.merge_range(ar);
    }

    /// Move the resolved ranges of `old_ar` to the same place in `new_ar`,
    /// storage and all.
    pub(super) fn move_pmas(&mut self, old_ar: AddrRange, new_ar: AddrRange) {
        let moved = self.pmas.remove(old_ar);
        self.invalidate_as(old_ar);
        for (range, pma) in moved {
            let start = new_ar.start().add(range.start().offset_from(old_ar.start()));
            self.pmas.insert(AddrRange::new(start, start.add(range.len())), pma);
        }
    }

    /// The frames behind `ar`, which must be resolved, in order.
    pub(super) fn internal_blocks(&mut self, ar: AddrRange) -> Result<BlockSeq, Error> {
        self.pmas.isolate(ar);
        let mut blocks = Vec::with_capacity(ar.page_count());
        for (range, pma) in self.pmas.conflicts_mut(ar) {
            if pma.internal_blocks.is_none() {
                pma.internal_blocks = Some(pma.file.map_internal(pma.file_range(range), Access::READ)?);
            }
            if let Some(cached) = &pma.internal_blocks {
                blocks.extend(cached.iter().cloned());
            }
        }
        self.pmas.merge_range(ar);
        Ok(blocks)
    }
}

impl MemoryManager {
    fn private_file(&self) -> Arc<dyn File> {
        Arc::clone(&self.mf) as Arc<dyn File>
    }

    /// Make sure every page of `ar` is backed by storage permitting `at`,
    /// translating, allocating and copying as needed. `readahead` bounds how
    /// far beyond `ar` backing objects may be translated.
    ///
    /// On failure the ranges resolved so far are kept.
    pub(super) fn get_pmas(
        &self,
        ms: &MappingState,
        act: &mut ActiveState,
        ar: AddrRange,
        readahead: Option<AddrRange>,
        at: Access,
        ignore_permissions: bool,
    ) -> Result<(), Stop> {
        let mut cursor = ar.start();
        for (vma_range, vma) in ms.vmas.conflicts(ar) {
            if vma_range.start() > cursor {
                return Err(Error::NotFound.into());
            }
            let sub = vma_range.intersect(ar);
            let vma_perms = if ignore_permissions {
                vma.max_perms.effective()
            } else {
                vma.effective_perms
            };
            if !vma_perms.contains(at) {
                return Err(Error::AccessDenied.into());
            }

            self.populate(act, vma_range, vma, sub, readahead, at)?;
            if at.contains(Access::WRITE) && vma.private {
                self.break_cow(act, vma, sub)?;
            }

            // Permissions are settled here, with both locks held, rather than
            // when translating: a backing object may grant less than asked.
            for (range, pma) in act.pmas.conflicts(sub) {
                if !pma.perms_under(vma_perms).contains(at) {
                    log::trace!("{:?} denies {:?}", range, at);
                    return Err(Error::AccessDenied.into());
                }
            }
            cursor = sub.end();
        }
        if cursor < ar.end() {
            return Err(Error::NotFound.into());
        }
        Ok(())
    }

    fn populate(
        &self,
        act: &mut ActiveState,
        vma_range: AddrRange,
        vma: &Vma,
        sub: AddrRange,
        readahead: Option<AddrRange>,
        at: Access,
    ) -> Result<(), Stop> {
        for gap in act.pmas.gaps(sub) {
            let Some(mappable) = &vma.mappable else {
                let fr = self.mf.allocate(gap.len() as u64).map_err(Error::from)?;
                log::trace!("mm {}: anonymous {:?} at {:?}", self.id, gap, fr);
                act.pmas.insert(
                    gap,
                    Pma {
                        file: self.private_file(),
                        offset: fr.start,
                        translate_perms: Access::ANY,
                        effective_perms: vma.effective_perms,
                        max_perms: vma.max_perms,
                        needs_cow: false,
                        private: true,
                        internal_blocks: None,
                    },
                );
                act.add_rss(gap.len());
                continue;
            };

            let optional_ar = match readahead {
                Some(window) => {
                    let room = act.pmas.gap_around(gap, vma_range).intersect(window);
                    AddrRange::new(room.start().min(gap.start()), room.end().max(gap.end()))
                }
                None => gap,
            };
            let required = vma.file_range(vma_range, gap);
            let optional = vma.file_range(vma_range, optional_ar);
            // Private mappings never write to the object; writes copy first.
            let translate_at = if vma.private { at.difference(Access::WRITE) } else { at };
            let translations = stop_on_cancel(mappable.translate(required, optional, translate_at))?;

            let mut covered = required.start;
            for t in translations {
                let source = t.source.intersect(optional);
                if source.is_empty() {
                    continue;
                }
                let offset = t.offset + (source.start - t.source.start);
                let range = vma.addr_range(vma_range, source);
                let fr = FileRange::new(offset, offset + source.len());
                t.file.inc_ref(fr);
                log::trace!("mm {}: translated {:?} to {:?} {:?}", self.id, range, fr, t.perms);
                act.pmas.insert(
                    range,
                    Pma {
                        file: t.file,
                        offset,
                        translate_perms: t.perms,
                        effective_perms: pma_perms(vma.effective_perms, t.perms, vma.private),
                        max_perms: vma.max_perms & t.perms,
                        needs_cow: vma.private,
                        private: false,
                        internal_blocks: None,
                    },
                );
                act.add_rss(range.len());
                if source.start <= covered {
                    covered = covered.max(source.end);
                }
            }
            if covered < required.end {
                return Err(Error::BusError.into());
            }
        }
        Ok(())
    }

    /// Give every copy-on-write range in `sub` its own private storage.
    /// Exactly `sub` is copied; the rest of a larger area keeps sharing.
    fn break_cow(&self, act: &mut ActiveState, vma: &Vma, sub: AddrRange) -> Result<(), Stop> {
        act.pmas.isolate(sub);
        let cow: Vec<AddrRange> = act
            .pmas
            .conflicts(sub)
            .filter(|(_, pma)| pma.needs_cow)
            .map(|(range, _)| range)
            .collect();

        for range in cow {
            let Some((_, pma)) = act.pmas.contains_mut(range.start()) else {
                continue;
            };
            let fr = pma.file_range(range);

            if pma.private && same_file(&pma.file, &self.private_file()) && self.mf.has_unique_ref(fr) {
                // Nobody else shares it any more.
                pma.needs_cow = false;
                pma.effective_perms = pma.perms_under(vma.effective_perms);
                log::trace!("mm {}: {:?} no longer shared", self.id, range);
                continue;
            }

            let src = pma.file.map_internal(fr, Access::READ)?;
            let copy = self.mf.allocate(range.len() as u64).map_err(Error::from)?;
            let dst = match self.mf.map_internal(copy, Access::WRITE) {
                Ok(dst) => dst,
                Err(err) => {
                    self.mf.dec_ref(copy);
                    return Err(err.into());
                }
            };
            for (to, from) in dst.iter().zip(&src) {
                to.copy_from(from);
            }
            pma.file.dec_ref(fr);
            log::trace!("mm {}: copied {:?} to {:?}", self.id, range, copy);
            *pma = Pma {
                file: self.private_file(),
                offset: copy.start,
                translate_perms: Access::ANY,
                effective_perms: vma.effective_perms,
                max_perms: vma.max_perms,
                needs_cow: false,
                private: true,
                internal_blocks: Some(dst),
            };
            act.invalidate_as(range);
        }
        act.pmas.merge_range(sub);
        Ok(())
    }
}
