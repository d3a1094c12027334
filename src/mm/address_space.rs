//! The platform address space behind a memory manager, and when its contents
//! go stale.

use alloc::sync::Arc;

use super::{ActiveState, MappingState, MemoryManager};
use crate::addr::AddrRange;
use crate::error::Result;
use crate::platform::AddressSpace;
use crate::sync::CleanLockToken;

pub(crate) enum AsCache {
    /// No address space acquired.
    Unbound,
    /// In use by `refs` execution contexts; installed mappings are current
    /// apart from `ActiveState::pending`.
    Active { space: Arc<dyn AddressSpace>, refs: usize },
    /// Unused, but still current.
    Cached { space: Arc<dyn AddressSpace> },
    /// Unused, and something it maps changed since it was last active.
    Invalidated { space: Arc<dyn AddressSpace> },
}

/// Observable state of the address space cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AsState {
    Unbound,
    Active(usize),
    Cached,
    Invalidated,
}

impl AsCache {
    fn state(&self) -> AsState {
        match self {
            AsCache::Unbound => AsState::Unbound,
            AsCache::Active { refs, .. } => AsState::Active(*refs),
            AsCache::Cached { .. } => AsState::Cached,
            AsCache::Invalidated { .. } => AsState::Invalidated,
        }
    }
}

impl ActiveState {
    /// Note that whatever the address space maps in `ar` may be stale.
    pub(super) fn invalidate_as(&mut self, ar: AddrRange) {
        if ar.is_empty() {
            return;
        }
        match core::mem::replace(&mut self.cache, AsCache::Unbound) {
            AsCache::Cached { space } => self.cache = AsCache::Invalidated { space },
            other => {
                if matches!(other, AsCache::Active { .. }) {
                    self.pending.push(ar);
                }
                self.cache = other;
            }
        }
    }

    /// Remove the ranges noted by [`ActiveState::invalidate_as`] from the
    /// active address space. Must run before the inner lock is released.
    pub(super) fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        match &self.cache {
            AsCache::Active { space, .. } => {
                for ar in self.pending.drain(..) {
                    space.unmap_range(ar);
                }
            }
            _ => self.pending.clear(),
        }
    }

    /// Install what is resolved in `ar` if an address space is active.
    pub(super) fn install_range(&self, ms: &MappingState, ar: AddrRange, precommit: bool) -> Result<()> {
        match &self.cache {
            AsCache::Active { space, .. } => install_pmas(space, ms, self, ar, precommit),
            _ => Ok(()),
        }
    }
}

/// Install every resolved range in `ar` into `space` with the permissions its
/// area allows now.
fn install_pmas(
    space: &Arc<dyn AddressSpace>,
    ms: &MappingState,
    act: &ActiveState,
    ar: AddrRange,
    precommit: bool,
) -> Result<()> {
    for (vma_range, vma) in ms.vmas.conflicts(ar) {
        let sub = vma_range.intersect(ar);
        for (pma_range, pma) in act.pmas.conflicts(sub) {
            let perms = pma.perms_under(vma.effective_perms);
            if perms.is_empty() {
                continue;
            }
            let range = pma_range.intersect(sub);
            let offset = pma.offset + range.start().offset_from(pma_range.start()) as u64;
            space.install(range, &pma.file, offset, perms, precommit)?;
        }
    }
    Ok(())
}

impl MemoryManager {
    /// Make this address space current for the calling execution context,
    /// acquiring or refreshing the platform address space as needed.
    pub fn activate(&self, token: &mut CleanLockToken) -> Result<()> {
        let mut mapping = self.mapping.read(token.token());
        let (ms, mut token) = mapping.token_split();
        let mut act = self.active.write(token.token());

        let space = match core::mem::replace(&mut act.cache, AsCache::Unbound) {
            AsCache::Active { space, refs } => {
                space.switch_to();
                act.cache = AsCache::Active { space, refs: refs + 1 };
                return Ok(());
            }
            AsCache::Cached { space } => space,
            AsCache::Invalidated { space } => {
                log::trace!("mm {}: reinstalling stale address space", self.id);
                space.unmap_range(self.layout.user_range());
                if let Err(err) = install_pmas(&space, ms, &act, self.layout.user_range(), false) {
                    act.cache = AsCache::Invalidated { space };
                    return Err(err);
                }
                space
            }
            AsCache::Unbound => {
                let space = self.platform.new_address_space()?;
                log::debug!("mm {}: acquired address space", self.id);
                if let Err(err) = install_pmas(&space, ms, &act, self.layout.user_range(), false) {
                    space.release();
                    return Err(err);
                }
                space
            }
        };
        space.switch_to();
        act.cache = AsCache::Active { space, refs: 1 };
        act.pending.clear();
        Ok(())
    }

    /// Drop one activation. The last one keeps the address space cached.
    pub fn deactivate(&self, token: &mut CleanLockToken) {
        let mut mapping = self.mapping.read(token.token());
        let (_, mut token) = mapping.token_split();
        let mut act = self.active.write(token.token());
        act.flush();

        act.cache = match core::mem::replace(&mut act.cache, AsCache::Unbound) {
            AsCache::Active { space, refs: 1 } => AsCache::Cached { space },
            AsCache::Active { space, refs } => AsCache::Active { space, refs: refs - 1 },
            other => panic!("mm {}: deactivate in state {:?}", self.id, other.state()),
        };
    }

    /// Give an inactive address space back to the platform.
    ///
    /// # Panics
    ///
    /// Panics if the address space is active.
    pub fn release_address_space(&self, token: &mut CleanLockToken) {
        let mut mapping = self.mapping.read(token.token());
        let (_, mut token) = mapping.token_split();
        let mut act = self.active.write(token.token());
        act.release_cache(self.id);
    }

    /// Apply pending invalidations to the active address space now.
    pub fn sync(&self, token: &mut CleanLockToken) {
        let mut mapping = self.mapping.read(token.token());
        let (_, mut token) = mapping.token_split();
        self.active.write(token.token()).flush();
    }

    pub fn address_space_state(&self, token: &mut CleanLockToken) -> AsState {
        let mut mapping = self.mapping.read(token.token());
        let (_, mut token) = mapping.token_split();
        let state = self.active.read(token.token()).cache.state();
        state
    }
}

impl ActiveState {
    pub(super) fn release_cache(&mut self, id: u64) {
        match core::mem::replace(&mut self.cache, AsCache::Unbound) {
            AsCache::Unbound => {}
            AsCache::Cached { space } | AsCache::Invalidated { space } => {
                log::debug!("mm {}: released address space", id);
                space.release();
            }
            AsCache::Active { refs, .. } => {
                panic!("mm {}: releasing address space with {} activations", id, refs)
            }
        }
        self.pending.clear();
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
    use crate::Access;

    fn setup() -> (Arc<ShadowPlatform>, Arc<MemoryManager>, CleanLockToken) {
        let platform = ShadowPlatform::new();
        let mm = MemoryManager::new(platform.clone(), Arc::new(MemoryFile::new(1 << 24)), Layout::default());
        (platform, mm, unsafe { CleanLockToken::new() })
    }

    #[test]
    fn deactivate_caches_and_reactivate_reuses() {
        // Given
        let (platform, mm, mut token) = setup();
        mm.activate(&mut token).unwrap();
        mm.activate(&mut token).unwrap();

        // When
        mm.deactivate(&mut token);
        assert_eq!(mm.address_space_state(&mut token), AsState::Active(1));
        mm.deactivate(&mut token);

        // Then
        assert_eq!(mm.address_space_state(&mut token), AsState::Cached);
        mm.activate(&mut token).unwrap();
        assert_eq!(platform.spaces().len(), 1);
        assert_eq!(platform.spaces()[0].switch_count(), 3);
    }

    #[test]
    fn changes_while_cached_invalidate_then_reinstall() {
        // Given
        let (platform, mm, mut token) = setup();
        let ar = mm.mmap(MMapOpts::anonymous(0x2000), &mut token).unwrap();
        mm.activate(&mut token).unwrap();
        mm.handle_user_fault(ar.start(), Access::WRITE, &mut token).unwrap().unwrap_done();
        let space = platform.spaces()[0].clone();
        assert_eq!(space.installed_pages(), 1);
        mm.deactivate(&mut token);

        // When
        mm.munmap(ar.start(), 0x1000, &mut token).unwrap();

        // Then
        assert_eq!(mm.address_space_state(&mut token), AsState::Invalidated);
        assert_eq!(space.installed_pages(), 1);
        mm.activate(&mut token).unwrap();
        assert_eq!(space.installed_pages(), 0);
        assert!(space.lookup(ar.start()).is_none());
    }

    #[test]
    fn activation_installs_resolved_ranges() {
        let (platform, mm, mut token) = setup();
        let ar = mm.mmap(MMapOpts::anonymous(0x3000), &mut token).unwrap();
        mm.zero_out(ar.start(), ar.len(), false, &mut token).unwrap().unwrap_done();

        mm.activate(&mut token).unwrap();

        let space = platform.spaces()[0].clone();
        assert_eq!(space.installed_pages(), 3);
        let entry = space.lookup(ar.start().add(0x1000)).unwrap();
        assert_eq!(entry.perms, Access::READ_WRITE);
    }

    #[test]
    fn release_returns_to_unbound() {
        let (platform, mm, mut token) = setup();
        mm.activate(&mut token).unwrap();
        mm.deactivate(&mut token);

        mm.release_address_space(&mut token);

        assert_eq!(mm.address_space_state(&mut token), AsState::Unbound);
        assert!(platform.spaces()[0].is_released());
    }

    #[test]
    #[should_panic]
    fn releasing_an_active_space_is_fatal() {
        let (_platform, mm, mut token) = setup();
        mm.activate(&mut token).unwrap();
        mm.release_address_space(&mut token);
    }

    #[test]
    fn unmap_while_active_reaches_the_platform() {
        let (platform, mm, mut token) = setup();
        let ar = mm.mmap(MMapOpts::anonymous(0x1000).at(VirtualAddress::new(0x40_0000)), &mut token).unwrap();
        mm.activate(&mut token).unwrap();
        mm.handle_user_fault(ar.start(), Access::READ, &mut token).unwrap().unwrap_done();
        assert_eq!(platform.spaces()[0].installed_pages(), 1);

        mm.munmap(ar.start(), ar.len(), &mut token).unwrap();
        mm.sync(&mut token);

        assert_eq!(platform.spaces()[0].installed_pages(), 0);
        assert_eq!(mm.address_space_state(&mut token), AsState::Active(1));
    }
}
