//! # Memory manager
//!
//! A [`MemoryManager`] is one guest address space. It keeps two interval
//! maps:
//!
//! - virtual memory areas ([`vma`]), what the application mapped, guarded by
//!   the outer `mapping` lock at [`MappingLevel`];
//! - platform mapping areas ([`pma`]), what has been translated to storage and
//!   may be installed in the platform address space, guarded by the inner
//!   `active` lock at [`ActiveLevel`] together with the address space cache
//!   and the resident set accounting.
//!
//! Every PMA lies inside a VMA at the same addresses. Operations that change
//! the VMA map hold `mapping` for writing and take `active` inside it; faults
//! and I/O hold `mapping` for reading, so an unmap that has returned can never
//! be raced by a fault still seeing the old area.

use alloc::{
    sync::{Arc, Weak},
    vec::Vec,
};
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::addr::{AddrRange, VirtualAddress, PAGE_SIZE};
use crate::memmap::{InvalidateOpts, MLockMode, MappingSpace};
use crate::memory::MemoryFile;
use crate::platform::Platform;
use crate::sync::{ActiveLevel, CleanLockToken, LockToken, MappableLevel, MappingLevel, RwLock};

use self::address_space::AsCache;
use self::pma::Pma;
use self::set::RangeSet;
use self::vma::Vma;

mod address_space;
mod io;
mod lifecycle;
mod pma;
mod procfs;
mod set;
mod syscalls;
mod vma;

#[cfg(test)]
mod tests;

pub use self::address_space::AsState;
pub use self::procfs::MapsEntry;
pub use self::syscalls::{Advice, MlockAllFlags, MremapMove, MremapOpts};

/// Pages kept free below a grows-down area.
pub const GUARD_GAP: usize = 256 * PAGE_SIZE;

/// How far a fault on a backing object translates ahead of the faulting page.
pub const READAHEAD: usize = 16 * PAGE_SIZE;

/// The `RLIMIT_*` value that means no limit.
pub const UNLIMITED: u64 = u64::MAX;

/// Where mappings may go.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Layout {
    /// Lowest mappable address.
    pub min_addr: VirtualAddress,
    /// End of the mappable range.
    pub max_addr: VirtualAddress,
    /// Top-down placement searches below this address first.
    pub top_down_base: VirtualAddress,
    /// Then bottom-up from this address.
    pub bottom_up_base: VirtualAddress,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            min_addr: VirtualAddress::new(PAGE_SIZE),
            max_addr: VirtualAddress::new(0x7fff_ffff_f000),
            top_down_base: VirtualAddress::new(0x7f00_0000_0000),
            bottom_up_base: VirtualAddress::new(0x1000_0000_0000),
        }
    }
}

impl Layout {
    pub fn user_range(&self) -> AddrRange {
        AddrRange::new(self.min_addr, self.max_addr)
    }
}

/// Resource limits in bytes, [`UNLIMITED`] if unset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limits {
    /// `RLIMIT_AS`
    pub address_space: u64,
    /// `RLIMIT_MEMLOCK`
    pub memlock: u64,
    /// `RLIMIT_DATA`
    pub data: u64,
    /// `RLIMIT_STACK`
    pub stack: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            address_space: UNLIMITED,
            memlock: 8 << 20,
            data: UNLIMITED,
            stack: 8 << 20,
        }
    }
}

pub(crate) fn exceeds(bytes: usize, limit: u64) -> bool {
    bytes as u64 > limit
}

/// Everything guarded by the outer lock.
pub(crate) struct MappingState {
    vmas: RangeSet<Vma>,
    /// The heap, `[start of heap, current break)`. The end need not be page
    /// aligned.
    brk: AddrRange,
    /// Bytes mapped.
    usage_as: usize,
    /// Bytes in areas with an mlock mode.
    locked_as: usize,
    /// Bytes in private writable areas that do not grow down.
    data_as: usize,
    /// Lock mode for new areas, set by `mlockall(MCL_FUTURE)`.
    def_mlock_mode: MLockMode,
    limits: Limits,
}

/// Everything guarded by the inner lock.
pub(crate) struct ActiveState {
    pmas: RangeSet<Pma>,
    cur_rss: usize,
    max_rss: usize,
    cache: AsCache,
    /// Ranges to remove from the active address space at the next flush.
    pending: Vec<AddrRange>,
    /// Set while forking: invalidations from backing objects are recorded
    /// instead of applied.
    capture_invalidations: bool,
    captured: Vec<(AddrRange, InvalidateOpts)>,
}

impl ActiveState {
    fn add_rss(&mut self, len: usize) {
        self.cur_rss += len;
        self.max_rss = self.max_rss.max(self.cur_rss);
    }

    fn sub_rss(&mut self, len: usize) {
        self.cur_rss = self
            .cur_rss
            .checked_sub(len)
            .unwrap_or_else(|| panic!("resident set underflow by {len:#x}"));
    }
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// One guest address space.
pub struct MemoryManager {
    id: u64,
    /// Handed to backing objects so they can invalidate us.
    space: Weak<dyn MappingSpace>,
    platform: Arc<dyn Platform>,
    mf: Arc<MemoryFile>,
    layout: Layout,
    users: AtomicUsize,
    mapping: RwLock<MappingLevel, MappingState>,
    active: RwLock<ActiveLevel, ActiveState>,
}

impl MemoryManager {
    /// An empty address space with one user, allocating private memory from
    /// `mf`.
    pub fn new(platform: Arc<dyn Platform>, mf: Arc<MemoryFile>, layout: Layout) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<MemoryManager>| {
            let space: Weak<dyn MappingSpace> = this.clone();
            Self {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                space,
                platform,
                mf,
                layout,
                users: AtomicUsize::new(1),
                mapping: RwLock::new(MappingState {
                    vmas: RangeSet::new(),
                    brk: AddrRange::new(layout.min_addr, layout.min_addr),
                    usage_as: 0,
                    locked_as: 0,
                    data_as: 0,
                    def_mlock_mode: MLockMode::None,
                    limits: Limits::default(),
                }),
                active: RwLock::new(ActiveState {
                    pmas: RangeSet::new(),
                    cur_rss: 0,
                    max_rss: 0,
                    cache: AsCache::Unbound,
                    pending: Vec::new(),
                    capture_invalidations: false,
                    captured: Vec::new(),
                }),
            }
        })
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn limits(&self, token: &mut CleanLockToken) -> Limits {
        self.mapping.read(token.token()).limits
    }

    /// Replace the resource limits. Existing mappings are not re-checked.
    pub fn set_limits(&self, limits: Limits, token: &mut CleanLockToken) {
        self.mapping.write(token.token()).limits = limits;
    }

    /// Bytes of address space mapped.
    pub fn usage_as(&self, token: &mut CleanLockToken) -> usize {
        self.mapping.read(token.token()).usage_as
    }

    /// Bytes of address space locked by `mlock`.
    pub fn locked_as(&self, token: &mut CleanLockToken) -> usize {
        self.mapping.read(token.token()).locked_as
    }

    /// Bytes of private writable memory, as limited by `RLIMIT_DATA`.
    pub fn data_as(&self, token: &mut CleanLockToken) -> usize {
        self.mapping.read(token.token()).data_as
    }

    /// Bytes of memory currently backed by storage.
    pub fn resident_set_size(&self, token: &mut CleanLockToken) -> usize {
        let mut mapping = self.mapping.read(token.token());
        let (_, token) = mapping.token_split();
        let x = self.active.read(token).cur_rss;
        x
    }

    /// The largest value [`MemoryManager::resident_set_size`] ever had.
    pub fn max_resident_set_size(&self, token: &mut CleanLockToken) -> usize {
        let mut mapping = self.mapping.read(token.token());
        let (_, token) = mapping.token_split();
        let x = self.active.read(token).max_rss;
        x
    }

    pub fn vma_count(&self, token: &mut CleanLockToken) -> usize {
        self.mapping.read(token.token()).vmas.len()
    }

    /// Number of platform mapping areas, i.e. distinct resolved ranges.
    pub fn pma_count(&self, token: &mut CleanLockToken) -> usize {
        let mut mapping = self.mapping.read(token.token());
        let (_, token) = mapping.token_split();
        let x = self.active.read(token).pmas.len();
        x
    }

    /// The resolved ranges, in order.
    pub fn resolved_ranges(&self, token: &mut CleanLockToken) -> Vec<AddrRange> {
        let mut mapping = self.mapping.read(token.token());
        let (_, token) = mapping.token_split();
        let x = self.active.read(token).pmas.iter().map(|(range, _)| range).collect();
        x
    }

    /// Panic if the VMA or PMA map is corrupt. Does nothing unless built for
    /// tests or with the `invariant_checks` feature.
    pub(crate) fn check_invariants(&self, token: &mut CleanLockToken) {
        if !cfg!(any(test, feature = "invariant_checks")) {
            return;
        }
        let mut mapping = self.mapping.read(token.token());
        let (ms, token) = mapping.token_split();
        let act = self.active.read(token);

        ms.vmas.check_invariants();
        act.pmas.check_invariants();
        let mut usage = 0;
        for (range, _) in ms.vmas.iter() {
            usage += range.len();
        }
        assert_eq!(usage, ms.usage_as, "mapped size out of sync");
        let mut rss = 0;
        for (range, _) in act.pmas.iter() {
            assert!(ms.vmas.is_covered(range), "PMA {range:?} outlives its VMA");
            rss += range.len();
        }
        assert_eq!(rss, act.cur_rss, "resident set out of sync");
    }
}

impl MappingSpace for MemoryManager {
    fn id(&self) -> u64 {
        self.id
    }

    fn invalidate(&self, ar: AddrRange, opts: InvalidateOpts, token: LockToken<'_, MappableLevel>) {
        let mut act = self.active.write(token);
        if act.capture_invalidations {
            log::trace!("mm {}: capturing invalidation of {:?}", self.id, ar);
            act.captured.push((ar, opts));
            return;
        }
        act.invalidate_locked(ar, opts);
        act.flush();
    }
}

impl core::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("MemoryManager").field("id", &self.id).finish_non_exhaustive()
    }
}
