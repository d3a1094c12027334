//! # Backing objects
//!
//! A [`Mappable`] supplies the content of a mapping. The memory manager
//! registers every virtual memory area backed by it as a mapping, asks it to
//! translate file ranges to storage on demand, and is told through
//! [`MappingSpace::invalidate`] whenever translations it cached go stale.

use alloc::{string::String, sync::Arc, sync::Weak, vec::Vec};

use arrayvec::ArrayVec;
use hashbrown::HashMap;

use crate::addr::{AddrRange, Access, VirtualAddress};
use crate::error::{Completion, Result};
use crate::memory::{File, FileRange};
use crate::sync::{LockToken, MappableLevel, MappingLevel};

pub mod shared;

pub use self::shared::SharedObject;

/// Storage for part of a backing object, as returned by [`Mappable::translate`].
#[derive(Clone)]
pub struct Translation {
    /// The part of the object this translation covers.
    pub source: FileRange,
    pub file: Arc<dyn File>,
    /// Offset of `source.start` in `file`.
    pub offset: u64,
    /// Accesses permitted to the storage. May exceed what was asked for.
    pub perms: Access,
}

impl core::fmt::Debug for Translation {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Translation")
            .field("source", &self.source)
            .field("offset", &format_args!("{:#x}", self.offset))
            .field("perms", &self.perms)
            .finish()
    }
}

/// An object whose content can be mapped into memory managers.
pub trait Mappable: Send + Sync {
    /// Notify that `ar` of `space` now maps the object starting at `offset`.
    /// `writable` is set for shared mappings that may write the object.
    fn add_mapping(
        &self,
        space: &Weak<dyn MappingSpace>,
        ar: AddrRange,
        offset: u64,
        writable: bool,
        token: LockToken<'_, MappingLevel>,
    ) -> Result<()>;

    /// Undo [`Mappable::add_mapping`] for `ar`, which may be a sub-range of a
    /// previously added mapping.
    fn remove_mapping(
        &self,
        space: &Weak<dyn MappingSpace>,
        ar: AddrRange,
        offset: u64,
        writable: bool,
        token: LockToken<'_, MappingLevel>,
    );

    /// Like [`Mappable::add_mapping`], for a mapping duplicated from `src_ar`
    /// by fork or mremap.
    fn copy_mapping(
        &self,
        space: &Weak<dyn MappingSpace>,
        _src_ar: AddrRange,
        dst_ar: AddrRange,
        offset: u64,
        writable: bool,
        token: LockToken<'_, MappingLevel>,
    ) -> Result<()> {
        self.add_mapping(space, dst_ar, offset, writable, token)
    }

    /// Translate `required` (and as much of `optional`, a superset of it, as
    /// is cheap) to storage that permits `at`. The translations are ordered
    /// and contiguous from `required.start`. Coverage ending before
    /// `required.end` means the rest is beyond the end of the object.
    ///
    /// This may block, e.g. waiting for content to be read in. An interrupt of
    /// the calling thread ends the wait with [`Completion::Cancelled`].
    ///
    /// Called with the memory manager's active state locked. Implementations
    /// must not call back into any memory manager.
    fn translate(
        &self,
        required: FileRange,
        optional: FileRange,
        at: Access,
    ) -> Result<Completion<Vec<Translation>>>;
}

/// Compare the identity of two backing objects, ignoring vtables.
pub fn same_mappable(a: &Arc<dyn Mappable>, b: &Arc<dyn Mappable>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InvalidateOpts {
    /// Also drop private copies of the object's content, e.g. beyond a new end
    /// of file.
    pub invalidate_private: bool,
}

/// Receives invalidations from the backing objects mapped into it.
pub trait MappingSpace: Send + Sync {
    /// Unique for the lifetime of the process.
    fn id(&self) -> u64;

    /// Drop all cached translations of `ar`. Called with the backing object's
    /// mapping set locked and no memory manager lock held.
    fn invalidate(&self, ar: AddrRange, opts: InvalidateOpts, token: LockToken<'_, MappableLevel>);
}

/// What `/proc/[pid]/maps` shows about the object behind a mapping. Holding one
/// keeps the object alive.
pub trait MappingIdentity: Send + Sync {
    fn mapped_name(&self) -> String;
    /// Major and minor device number.
    fn device(&self) -> (u32, u32);
    fn inode(&self) -> u64;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct MappedRange {
    ar: AddrRange,
    offset: u64,
    writable: bool,
}

impl MappedRange {
    fn file_range(&self) -> FileRange {
        FileRange::new(self.offset, self.offset + self.ar.len() as u64)
    }

    /// Whether `ar` at `offset` lines up with this mapping.
    fn matches(&self, ar: AddrRange, offset: u64) -> bool {
        self.ar.overlaps(ar)
            && offset.wrapping_sub(self.offset)
                == (ar.start().data().wrapping_sub(self.ar.start().data())) as u64
    }

    /// The pieces of `self` left after removing `ar`.
    fn subtract(&self, ar: AddrRange) -> ArrayVec<MappedRange, 2> {
        let mut rest = ArrayVec::new();
        if let Some(before) = self.ar.before(ar) {
            rest.push(MappedRange { ar: before, ..*self });
        }
        if let Some(after) = self.ar.after(ar) {
            rest.push(MappedRange {
                ar: after,
                offset: self.offset + after.start().offset_from(self.ar.start()) as u64,
                writable: self.writable,
            });
        }
        rest
    }
}

struct SpaceMappings {
    space: Weak<dyn MappingSpace>,
    ranges: Vec<MappedRange>,
}

/// The mappings of one backing object, grouped by the space they belong to.
#[derive(Default)]
pub struct MappingSet {
    spaces: HashMap<u64, SpaceMappings>,
}

impl MappingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.spaces.is_empty()
    }

    /// Record a mapping. Does nothing if `space` is already gone.
    pub fn add(&mut self, space: &Weak<dyn MappingSpace>, ar: AddrRange, offset: u64, writable: bool) {
        let Some(id) = space.upgrade().map(|space| space.id()) else {
            return;
        };
        self.spaces
            .entry(id)
            .or_insert_with(|| SpaceMappings {
                space: Weak::clone(space),
                ranges: Vec::new(),
            })
            .ranges
            .push(MappedRange { ar, offset, writable });
    }

    /// Forget `ar` of `space`, splitting recorded mappings as needed.
    pub fn remove(&mut self, space: &Weak<dyn MappingSpace>, ar: AddrRange, offset: u64) {
        let Some(id) = space.upgrade().map(|space| space.id()) else {
            // The space is being torn down; forget whatever it left behind.
            self.spaces.retain(|_, mappings| mappings.space.strong_count() > 0);
            return;
        };
        let Some(mappings) = self.spaces.get_mut(&id) else {
            log::warn!("remove_mapping of unknown space {}", id);
            return;
        };
        let mut kept = Vec::with_capacity(mappings.ranges.len());
        for range in mappings.ranges.drain(..) {
            if range.matches(ar, offset) {
                kept.extend(range.subtract(ar));
            } else {
                kept.push(range);
            }
        }
        mappings.ranges = kept;
        if mappings.ranges.is_empty() {
            self.spaces.remove(&id);
        }
    }

    /// Whether any shared mapping may write the object.
    pub fn has_writable(&self) -> bool {
        self.spaces
            .values()
            .any(|mappings| mappings.ranges.iter().any(|range| range.writable))
    }

    /// The address ranges mapping `fr`, per live space.
    pub fn invalidations(&self, fr: FileRange) -> Vec<(Arc<dyn MappingSpace>, AddrRange)> {
        let mut out = Vec::new();
        for mappings in self.spaces.values() {
            let Some(space) = mappings.space.upgrade() else {
                continue;
            };
            for range in &mappings.ranges {
                let overlap = range.file_range().intersect(fr);
                if overlap.is_empty() {
                    continue;
                }
                let start = range.ar.start().add((overlap.start - range.offset) as usize);
                let ar = AddrRange::new(start, start.add(overlap.len() as usize));
                out.push((Arc::clone(&space), ar));
            }
        }
        out
    }
}

/// Whether `mlock` keeps pages of an area resident.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MLockMode {
    #[default]
    None,
    /// Locked once faulted in (`MCL_ONFAULT`, `MLOCK_ONFAULT`).
    Lazy,
    /// Populated when locked.
    Eager,
}

/// Recorded NUMA policy of an area. Placement ignores it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NumaPolicy {
    #[default]
    Default,
    Preferred,
    Bind,
    Interleave,
    Local,
}

impl NumaPolicy {
    /// Parse a Linux `MPOL_*` mode.
    pub fn from_raw(mode: i32) -> Option<Self> {
        Some(match mode {
            0 => NumaPolicy::Default,
            1 => NumaPolicy::Preferred,
            2 => NumaPolicy::Bind,
            3 => NumaPolicy::Interleave,
            4 => NumaPolicy::Local,
            _ => return None,
        })
    }
}

/// Arguments of a mapping request.
#[derive(Clone)]
pub struct MMapOpts {
    /// Bytes to map, rounded up to whole pages.
    pub length: usize,
    /// `None` for anonymous memory.
    pub mappable: Option<Arc<dyn Mappable>>,
    pub mapping_identity: Option<Arc<dyn MappingIdentity>>,
    /// Offset into the object, page aligned.
    pub offset: u64,
    /// Placement hint, or the exact address with `fixed`.
    pub addr: VirtualAddress,
    pub fixed: bool,
    /// With `fixed`, replace existing mappings (`MAP_FIXED`). Without it the
    /// request fails on a collision (`MAP_FIXED_NOREPLACE`).
    pub unmap: bool,
    pub private: bool,
    pub grows_down: bool,
    /// Populate the mapping right away (`MAP_POPULATE`).
    pub precommit: bool,
    pub perms: Access,
    pub max_perms: Access,
    pub mlock_mode: MLockMode,
    /// Name shown in `/proc/[pid]/maps` when there is no identity.
    pub hint: Option<String>,
}

impl MMapOpts {
    /// Private anonymous read/write memory anywhere.
    pub fn anonymous(length: usize) -> Self {
        Self {
            length,
            mappable: None,
            mapping_identity: None,
            offset: 0,
            addr: VirtualAddress::new(0),
            fixed: false,
            unmap: false,
            private: true,
            grows_down: false,
            precommit: false,
            perms: Access::READ_WRITE,
            max_perms: Access::ANY,
            mlock_mode: MLockMode::None,
            hint: None,
        }
    }

    /// Place exactly at `addr`, replacing what is there.
    pub fn at(mut self, addr: VirtualAddress) -> Self {
        self.addr = addr;
        self.fixed = true;
        self.unmap = true;
        self
    }
}
