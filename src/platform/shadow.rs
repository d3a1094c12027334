use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use spin::Mutex;

use super::{AddressSpace, Platform};
use crate::addr::{AddrRange, Access, VirtualAddress, PAGE_SIZE};
use crate::error::Result;
use crate::memory::{File, FileRange};

/// A platform that keeps a software page table per address space. Nothing
/// executes on it; it records what a hardware platform would have been told.
#[derive(Default)]
pub struct ShadowPlatform {
    spaces: Mutex<Vec<Arc<ShadowAddressSpace>>>,
}

impl ShadowPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every address space created so far, oldest first.
    pub fn spaces(&self) -> Vec<Arc<ShadowAddressSpace>> {
        self.spaces.lock().clone()
    }
}

impl Platform for ShadowPlatform {
    fn new_address_space(&self) -> Result<Arc<dyn AddressSpace>> {
        let space = Arc::new(ShadowAddressSpace::default());
        self.spaces.lock().push(Arc::clone(&space));
        Ok(space)
    }
}

#[derive(Clone)]
pub struct ShadowEntry {
    pub file: Arc<dyn File>,
    pub offset: u64,
    pub perms: Access,
}

#[derive(Default)]
pub struct ShadowAddressSpace {
    /// Page table, by page address.
    table: Mutex<BTreeMap<usize, ShadowEntry>>,
    switches: AtomicUsize,
    released: AtomicBool,
}

impl ShadowAddressSpace {
    pub fn lookup(&self, addr: VirtualAddress) -> Option<ShadowEntry> {
        self.table.lock().get(&addr.page().data()).cloned()
    }

    /// Load a byte the way the guest would: through the page table, without
    /// faulting. `None` if the page is not mapped readable.
    pub fn load(&self, addr: VirtualAddress) -> Option<u8> {
        let entry = self.lookup(addr)?;
        if !entry.perms.contains(Access::READ) {
            return None;
        }
        let fr = FileRange::new(entry.offset, entry.offset + PAGE_SIZE as u64);
        let blocks = entry.file.map_internal(fr, Access::READ).ok()?;
        let mut byte = [0];
        blocks[0].read(addr.data() % PAGE_SIZE, &mut byte);
        Some(byte[0])
    }

    pub fn installed_pages(&self) -> usize {
        self.table.lock().len()
    }

    pub fn switch_count(&self) -> usize {
        self.switches.load(Ordering::Relaxed)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Relaxed)
    }
}

impl AddressSpace for ShadowAddressSpace {
    fn install(
        &self,
        ar: AddrRange,
        file: &Arc<dyn File>,
        offset: u64,
        perms: Access,
        _precommit: bool,
    ) -> Result<()> {
        assert!(!self.is_released(), "install into released address space");
        let mut table = self.table.lock();
        for page in ar.pages() {
            table.insert(
                page.data(),
                ShadowEntry {
                    file: Arc::clone(file),
                    offset: offset + page.offset_from(ar.start()) as u64,
                    perms,
                },
            );
        }
        Ok(())
    }

    fn unmap_range(&self, ar: AddrRange) {
        let mut table = self.table.lock();
        let pages: Vec<usize> = table
            .range(ar.start().data()..ar.end().data())
            .map(|(page, _)| *page)
            .collect();
        for page in pages {
            table.remove(&page);
        }
    }

    fn switch_to(&self) {
        self.switches.fetch_add(1, Ordering::Relaxed);
    }

    fn release(&self) {
        self.table.lock().clear();
        self.released.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::memory::MemoryFile;

    #[test]
    fn install_then_unmap() {
        // Given
        let mf: Arc<dyn File> = Arc::new(MemoryFile::new(1 << 20));
        let space = ShadowAddressSpace::default();

        // When
        space
            .install(AddrRange::from_raw(0x10000, 0x13000), &mf, 0x5000, Access::READ, false)
            .unwrap();
        space.unmap_range(AddrRange::from_raw(0x11000, 0x12000));

        // Then
        assert_eq!(space.installed_pages(), 2);
        assert_eq!(space.lookup(VirtualAddress::new(0x12345)).map(|e| e.offset), Some(0x7000));
        assert!(space.lookup(VirtualAddress::new(0x11000)).is_none());
    }

    #[test]
    fn load_reads_through_the_table() {
        let mf = Arc::new(MemoryFile::new(1 << 20));
        let fr = mf.allocate(PAGE_SIZE as u64).unwrap();
        mf.map_internal(fr, Access::WRITE).unwrap()[0].write(0x10, &[42]);
        let file: Arc<dyn File> = mf;
        let space = ShadowAddressSpace::default();

        space
            .install(AddrRange::from_raw(0x20000, 0x21000), &file, fr.start, Access::READ, false)
            .unwrap();

        assert_eq!(space.load(VirtualAddress::new(0x20010)), Some(42));
        assert_eq!(space.load(VirtualAddress::new(0x21010)), None);
    }
}
