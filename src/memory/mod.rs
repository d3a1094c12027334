//! # Backing storage
//!
//! Memory handed to a guest lives in page frames owned by a [`File`]: either
//! the private [`MemoryFile`], from which anonymous and copy-on-write memory
//! is allocated, or a backing object's page cache. Platform mapping areas
//! refer to storage as a file plus an offset, never to frames directly.

use alloc::{boxed::Box, collections::BTreeMap, sync::Arc, vec::Vec};
use core::{cmp, fmt, num::NonZeroUsize};

use hashbrown::HashMap;
use spin::{Mutex, RwLock};

use crate::addr::{Access, PAGE_SIZE};
use crate::error::{Error, Result};

const PAGE: u64 = PAGE_SIZE as u64;

/// A half-open range `[start, end)` of offsets into a [`File`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileRange {
    pub start: u64,
    pub end: u64,
}

impl FileRange {
    #[track_caller]
    pub fn new(start: u64, end: u64) -> Self {
        assert!(start <= end, "inverted file range {start:#x}..{end:#x}");
        Self { start, end }
    }
    pub fn with_len(start: u64, len: u64) -> Option<Self> {
        Some(Self {
            start,
            end: start.checked_add(len)?,
        })
    }
    pub fn len(&self) -> u64 {
        self.end - self.start
    }
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
    pub fn is_page_aligned(&self) -> bool {
        self.start % PAGE == 0 && self.end % PAGE == 0
    }
    pub fn overlaps(&self, other: Self) -> bool {
        self.start < other.end && other.start < self.end
    }
    pub fn is_superset_of(&self, other: Self) -> bool {
        self.start <= other.start && other.end <= self.end
    }
    pub fn intersect(&self, other: Self) -> Self {
        let start = cmp::max(self.start, other.start);
        let end = cmp::max(start, cmp::min(self.end, other.end));
        Self { start, end }
    }
    /// Page offsets covered by this range.
    pub fn pages(&self) -> impl Iterator<Item = u64> {
        (self.start - self.start % PAGE..self.end).step_by(PAGE_SIZE)
    }
}

impl fmt::Debug for FileRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}..{:#x}", self.start, self.end)
    }
}

/// One page of memory.
pub struct PageFrame {
    data: RwLock<Box<[u8; PAGE_SIZE]>>,
}

impl PageFrame {
    pub fn zeroed() -> Self {
        Self {
            data: RwLock::new(Box::new([0; PAGE_SIZE])),
        }
    }

    /// Copy bytes starting at `offset` within the page into `buf`.
    pub fn read(&self, offset: usize, buf: &mut [u8]) {
        let data = self.data.read();
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
    }

    pub fn write(&self, offset: usize, buf: &[u8]) {
        let mut data = self.data.write();
        data[offset..offset + buf.len()].copy_from_slice(buf);
    }

    pub fn fill(&self, offset: usize, len: usize, byte: u8) {
        self.data.write()[offset..offset + len].fill(byte);
    }

    /// Replace the whole content of this page with that of `other`.
    pub fn copy_from(&self, other: &PageFrame) {
        if core::ptr::eq(self, other) {
            return;
        }
        let src = other.data.read();
        self.data.write().copy_from_slice(&src[..]);
    }
}

impl fmt::Debug for PageFrame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PageFrame").finish_non_exhaustive()
    }
}

/// The page frames backing a page-aligned file range, in order.
pub type BlockSeq = Vec<Arc<PageFrame>>;

/// Storage that platform mapping areas point into.
pub trait File: Send + Sync {
    /// Take a reference on every page of `fr`, held by one mapping area.
    fn inc_ref(&self, fr: FileRange);

    /// Drop a reference taken by [`File::inc_ref`].
    fn dec_ref(&self, fr: FileRange);

    /// Direct access to the frames backing the page-aligned range `fr`.
    fn map_internal(&self, fr: FileRange, at: Access) -> Result<BlockSeq>;
}

/// Compare the identity of two storage handles, ignoring vtables.
pub fn same_file(a: &Arc<dyn File>, b: &Arc<dyn File>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

#[derive(Debug)]
pub struct Enomem;

impl From<Enomem> for Error {
    fn from(_: Enomem) -> Self {
        Error::OutOfMemory
    }
}

/// How many mapping areas refer to an allocated page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefCount {
    One,
    Shared(NonZeroUsize),
}

impl RefCount {
    fn add(self) -> Self {
        let count = match self {
            RefCount::One => NonZeroUsize::MIN,
            RefCount::Shared(n) => n,
        };
        match count.checked_add(1) {
            Some(count) => RefCount::Shared(count),
            None => panic!("page refcount overflow"),
        }
    }

    /// Drop one reference, `None` once the last one is gone.
    fn remove(self) -> Option<Self> {
        match self {
            RefCount::One => None,
            RefCount::Shared(n) if n.get() == 2 => Some(RefCount::One),
            RefCount::Shared(n) => NonZeroUsize::new(n.get() - 1).map(RefCount::Shared),
        }
    }
}

#[derive(Debug)]
struct PageInfo {
    frame: Arc<PageFrame>,
    refcount: RefCount,
}

#[derive(Debug)]
struct Pages {
    used: HashMap<u64, PageInfo>,
    /// Free extents below `next`, start to end, never adjacent.
    free: BTreeMap<u64, u64>,
    next: u64,
}

/// The private memory of the sandbox: anonymous memory, copy-on-write copies
/// and brk/stack pages are all carved out of this one file. Pages are reference
/// counted by the mapping areas that use them and freed with the last one.
#[derive(Debug)]
pub struct MemoryFile {
    capacity: u64,
    pages: Mutex<Pages>,
}

impl MemoryFile {
    /// A file that can hold at most `capacity` bytes of allocated pages.
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity: capacity - capacity % PAGE,
            pages: Mutex::new(Pages {
                used: HashMap::new(),
                free: BTreeMap::new(),
                next: 0,
            }),
        }
    }

    /// Allocate `len` bytes of zeroed, page-aligned storage. The caller owns
    /// the single reference to each page.
    pub fn allocate(&self, len: u64) -> Result<FileRange, Enomem> {
        assert!(len > 0 && len % PAGE == 0, "bad allocation length {len:#x}");
        let mut pages = self.pages.lock();
        if (pages.used.len() as u64 + len / PAGE) * PAGE > self.capacity {
            return Err(Enomem);
        }

        let fit = pages
            .free
            .iter()
            .find(|(start, end)| *end - *start >= len)
            .map(|(start, end)| (*start, *end));
        let fr = match fit {
            Some((start, end)) => {
                pages.free.remove(&start);
                if end - start > len {
                    pages.free.insert(start + len, end);
                }
                FileRange::new(start, start + len)
            }
            None => {
                let start = pages.next;
                pages.next += len;
                FileRange::new(start, start + len)
            }
        };

        for page in fr.pages() {
            pages.used.insert(
                page,
                PageInfo {
                    frame: Arc::new(PageFrame::zeroed()),
                    refcount: RefCount::One,
                },
            );
        }
        log::trace!("allocated {:?}", fr);
        Ok(fr)
    }

    /// Whether every page of `fr` is referenced exactly once, so that the single
    /// owner may write to it without copying.
    pub fn has_unique_ref(&self, fr: FileRange) -> bool {
        let pages = self.pages.lock();
        fr.pages().all(|page| {
            pages
                .used
                .get(&page)
                .is_some_and(|info| info.refcount == RefCount::One)
        })
    }

    /// Bytes currently allocated.
    pub fn usage(&self) -> u64 {
        self.pages.lock().used.len() as u64 * PAGE
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}

impl Pages {
    fn release(&mut self, page: u64) {
        let mut start = page;
        let mut end = page + PAGE;
        if let Some((&prev_start, &prev_end)) = self.free.range(..start).next_back() {
            if prev_end == start {
                self.free.remove(&prev_start);
                start = prev_start;
            }
        }
        if let Some(next_end) = self.free.remove(&end) {
            end = next_end;
        }
        if end == self.next {
            self.next = start;
        } else {
            self.free.insert(start, end);
        }
        // Shrinking `next` may expose a trailing free extent.
        while let Some((&prev_start, &prev_end)) = self.free.iter().next_back() {
            if prev_end != self.next {
                break;
            }
            self.free.remove(&prev_start);
            self.next = prev_start;
        }
    }
}

impl File for MemoryFile {
    fn inc_ref(&self, fr: FileRange) {
        let mut pages = self.pages.lock();
        for page in fr.pages() {
            let info = pages
                .used
                .get_mut(&page)
                .unwrap_or_else(|| panic!("inc_ref of free page {page:#x}"));
            info.refcount = info.refcount.add();
        }
    }

    fn dec_ref(&self, fr: FileRange) {
        let mut pages = self.pages.lock();
        for page in fr.pages() {
            let info = pages
                .used
                .get_mut(&page)
                .unwrap_or_else(|| panic!("refcount was already zero for page {page:#x}"));
            match info.refcount.remove() {
                Some(refcount) => info.refcount = refcount,
                None => {
                    pages.used.remove(&page);
                    pages.release(page);
                }
            }
        }
    }

    fn map_internal(&self, fr: FileRange, _at: Access) -> Result<BlockSeq> {
        let pages = self.pages.lock();
        fr.pages()
            .map(|page| {
                pages
                    .used
                    .get(&page)
                    .map(|info| Arc::clone(&info.frame))
                    .ok_or(Error::ObjectGone)
            })
            .collect()
    }
}
