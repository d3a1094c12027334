//! Fork and teardown.

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::Ordering;

use super::{ActiveState, AsCache, MemoryManager};
use crate::addr::{Access, AddrRange};
use crate::error::Result;
use crate::memmap::{InvalidateOpts, MLockMode};
use crate::sync::{CleanLockToken, RwLock};

/// Apply invalidations recorded while forking.
fn replay(act: &mut ActiveState, captured: &[(AddrRange, InvalidateOpts)]) {
    for &(ar, opts) in captured {
        act.invalidate_locked(ar, opts);
    }
}

impl MemoryManager {
    /// A copy of this address space for a new process.
    ///
    /// Areas marked `MADV_DONTFORK` are left out and locks are not inherited.
    /// Private memory is shared copy-on-write between both address spaces.
    pub fn fork(&self, token: &mut CleanLockToken) -> Result<Arc<MemoryManager>> {
        let child = MemoryManager::new(Arc::clone(&self.platform), Arc::clone(&self.mf), self.layout);
        {
            let (mut parent_mapping, mut child_mapping) =
                RwLock::write_pair(&self.mapping, &child.mapping, token.token());
            let (pms, mut ptoken) = parent_mapping.token_split();
            let (cms, mut ctoken) = child_mapping.token_split();

            // From here until both maps are consistent, backing objects must not
            // change either side's resolved ranges behind our back.
            self.active.write(ptoken.token()).capture_invalidations = true;
            child.active.write(ctoken.token()).capture_invalidations = true;

            cms.brk = pms.brk;
            cms.limits = pms.limits;
            let mut copied = Vec::new();
            let mut result = Ok(());
            for (range, vma) in pms.vmas.iter().filter(|(_, vma)| !vma.dont_fork) {
                let mut copy = vma.clone();
                copy.mlock_mode = MLockMode::None;
                if let Some(mappable) = &copy.mappable {
                    result = mappable.copy_mapping(
                        &child.space,
                        range,
                        range,
                        copy.offset,
                        copy.can_write_mappable(),
                        ctoken.token(),
                    );
                    if result.is_err() {
                        break;
                    }
                }
                cms.insert_vma(range, copy);
                copied.push(range);
            }

            if let Err(err) = result {
                log::debug!("mm {}: fork failed: {}", self.id, err);
                for range in copied {
                    child.remove_vmas(cms, &mut ctoken, range);
                }
                let mut act = self.active.write(ptoken.token());
                act.capture_invalidations = false;
                let captured = core::mem::take(&mut act.captured);
                replay(&mut act, &captured);
                act.flush();
                return Err(err);
            }

            let (mut pact, mut cact) = RwLock::write_pair(&self.active, &child.active, ptoken.token());
            for (vma_range, vma) in pms.vmas.iter().filter(|(_, vma)| !vma.dont_fork) {
                pact.pmas.isolate(vma_range);
                let mut write_protected = Vec::new();
                for (range, pma) in pact.pmas.conflicts_mut(vma_range) {
                    if vma.private {
                        pma.needs_cow = true;
                        if pma.effective_perms.contains(Access::WRITE) {
                            pma.effective_perms.remove(Access::WRITE);
                            write_protected.push(range);
                        }
                    }
                    cact.pmas.insert(range, pma.duplicate(range));
                    cact.add_rss(range.len());
                }
                for range in write_protected {
                    pact.invalidate_as(range);
                }
                pact.pmas.merge_range(vma_range);
            }

            pact.capture_invalidations = false;
            cact.capture_invalidations = false;
            let parent_captured = core::mem::take(&mut pact.captured);
            let child_captured = core::mem::take(&mut cact.captured);
            replay(&mut pact, &parent_captured);
            replay(&mut cact, &parent_captured);
            replay(&mut cact, &child_captured);
            pact.flush();
            cact.flush();
            log::debug!("mm {}: forked into mm {}", self.id, child.id);
        }
        self.check_invariants(token);
        child.check_invariants(token);
        Ok(child)
    }

    /// Take another user reference, unless the last one is already gone.
    pub fn inc_users(&self) -> bool {
        self.users
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |users| {
                (users != 0).then_some(users + 1)
            })
            .is_ok()
    }

    /// Drop a user reference. The last one unmaps everything and gives the
    /// address space back to the platform, which must not be active.
    pub fn dec_users(&self, token: &mut CleanLockToken) {
        let prev = self.users.fetch_sub(1, Ordering::AcqRel);
        assert_ne!(prev, 0, "mm {}: user count underflow", self.id);
        if prev != 1 {
            return;
        }

        log::debug!("mm {}: last user gone", self.id);
        let mut mapping = self.mapping.write(token.token());
        let (ms, mut token) = mapping.token_split();
        {
            let mut act = self.active.write(token.token());
            act.release_cache(self.id);
            for (range, pma) in act.pmas.take_all() {
                pma.file.dec_ref(pma.file_range(range));
                act.sub_rss(range.len());
            }
        }
        if let Some(all) = ms.vmas.span() {
            self.remove_vmas(ms, &mut token, all);
        }
        ms.brk = AddrRange::new(ms.brk.start(), ms.brk.start());
    }

    pub fn users(&self) -> usize {
        self.users.load(Ordering::Acquire)
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        let id = self.id;
        let users = self.users();
        let act = self.active.get_mut();
        if act.pmas.len() == 0 && matches!(act.cache, AsCache::Unbound) {
            return;
        }

        // Dropped without its last dec_users: private memory still has to go
        // back to the memory file.
        log::debug!("mm {}: dropped with {} users, releasing resolved ranges", id, users);
        for (range, pma) in act.pmas.take_all() {
            pma.file.dec_ref(pma.file_range(range));
            act.sub_rss(range.len());
        }
        if let AsCache::Active { refs, .. } = &act.cache {
            log::warn!("mm {}: dropped with {} activations", id, refs);
        } else {
            act.release_cache(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::addr::VirtualAddress;
    use crate::memmap::MMapOpts;
    use crate::memory::MemoryFile;
    use crate::mm::Layout;
    use crate::platform::ShadowPlatform;

    fn setup() -> (Arc<MemoryManager>, Arc<MemoryFile>, CleanLockToken) {
        let mf = Arc::new(MemoryFile::new(1 << 24));
        let mm = MemoryManager::new(ShadowPlatform::new(), mf.clone(), Layout::default());
        (mm, mf, unsafe { CleanLockToken::new() })
    }

    #[test]
    fn fork_shares_private_pages_until_written() {
        // Given
        let (mm, mf, mut token) = setup();
        let ar = mm.mmap(MMapOpts::anonymous(0x2000), &mut token).unwrap();
        mm.copy_out(ar.start(), b"parent", false, &mut token).unwrap().unwrap_done();

        // When
        let child = mm.fork(&mut token).unwrap();

        // Then
        assert_eq!(mf.usage(), 0x1000);
        assert_eq!(child.resident_set_size(&mut token), 0x1000);
        child.copy_out(ar.start(), b"child", false, &mut token).unwrap().unwrap_done();
        assert_eq!(mf.usage(), 0x2000);
        let mut buf = [0u8; 6];
        mm.copy_in(ar.start(), &mut buf, false, &mut token).unwrap().unwrap_done();
        assert_eq!(&buf, b"parent");
    }

    #[test]
    fn dontfork_areas_and_locks_are_not_inherited() {
        let (mm, _mf, mut token) = setup();
        let kept = mm.mmap(MMapOpts::anonymous(0x1000), &mut token).unwrap();
        let skipped = mm.mmap(MMapOpts::anonymous(0x1000), &mut token).unwrap();
        mm.madvise(skipped.start(), 0x1000, crate::mm::Advice::DontFork, &mut token).unwrap().unwrap_done();
        mm.mlock(kept.start(), 0x1000, MLockMode::Lazy, &mut token).unwrap().unwrap_done();

        let child = mm.fork(&mut token).unwrap();

        assert_eq!(child.vma_count(&mut token), 1);
        assert_eq!(child.usage_as(&mut token), 0x1000);
        assert_eq!(child.locked_as(&mut token), 0);
        assert_eq!(mm.locked_as(&mut token), 0x1000);
    }

    #[test]
    fn dropped_child_returns_its_private_pages() {
        // Given
        let (mm, mf, mut token) = setup();
        let ar = mm.mmap(MMapOpts::anonymous(0x2000), &mut token).unwrap();
        mm.zero_out(ar.start(), ar.len(), false, &mut token).unwrap().unwrap_done();
        let child = mm.fork(&mut token).unwrap();
        child.copy_out(ar.start(), b"child", false, &mut token).unwrap().unwrap_done();
        assert_eq!(mf.usage(), 0x3000);

        // When
        drop(child);

        // Then
        assert_eq!(mf.usage(), 0x2000);
        mm.copy_out(ar.start().add(0x1000), b"parent", false, &mut token).unwrap().unwrap_done();
        assert_eq!(mf.usage(), 0x2000);
    }

    #[test]
    fn last_user_tears_down() {
        // Given
        let (mm, mf, mut token) = setup();
        let ar = mm.mmap(MMapOpts::anonymous(0x3000).at(VirtualAddress::new(0x10_0000)), &mut token).unwrap();
        mm.zero_out(ar.start(), ar.len(), false, &mut token).unwrap().unwrap_done();
        mm.activate(&mut token).unwrap();
        mm.deactivate(&mut token);
        assert!(mm.inc_users());

        // When
        mm.dec_users(&mut token);
        assert_eq!(mm.vma_count(&mut token), 1);
        mm.dec_users(&mut token);

        // Then
        assert_eq!(mm.users(), 0);
        assert!(!mm.inc_users());
        assert_eq!(mm.vma_count(&mut token), 0);
        assert_eq!(mm.usage_as(&mut token), 0);
        assert_eq!(mm.resident_set_size(&mut token), 0);
        assert_eq!(mf.usage(), 0);
        assert_eq!(mm.address_space_state(&mut token), crate::mm::AsState::Unbound);
    }
}
