use core::cmp;
use core::fmt::{self, Debug};

/// Size of a page in the guest address space.
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Round down to the nearest multiple of page size
pub const fn round_down_pages(number: usize) -> usize {
    number - number % PAGE_SIZE
}
/// Round up to the nearest multiple of page size, or `None` on overflow
pub const fn round_up_pages(number: usize) -> Option<usize> {
    match number.checked_add(PAGE_MASK) {
        Some(n) => Some(round_down_pages(n)),
        None => None,
    }
}

bitflags::bitflags! {
    /// Types of access to a range of memory. The bit values match Linux's
    /// `PROT_READ`, `PROT_WRITE` and `PROT_EXEC`.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Access: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

impl Access {
    pub const NONE: Self = Self::empty();
    pub const ANY: Self = Self::all();
    pub const READ_WRITE: Self = Self::READ.union(Self::WRITE);

    /// Parse a `PROT_*` mask. Unknown bits make the mask invalid.
    pub fn from_prot(prot: usize) -> Option<Self> {
        u8::try_from(prot).ok().and_then(Self::from_bits)
    }

    /// Returns the set of accesses actually permitted by `self`: write and
    /// execute access imply read access on every platform we run on.
    pub fn effective(self) -> Self {
        if self.intersects(Self::WRITE | Self::EXECUTE) {
            self | Self::READ
        } else {
            self
        }
    }

    pub fn is_superset_of(self, other: Self) -> bool {
        self.contains(other)
    }

    /// The `rwx` column of `/proc/[pid]/maps`.
    pub fn rwx(self) -> [u8; 3] {
        [
            if self.contains(Self::READ) { b'r' } else { b'-' },
            if self.contains(Self::WRITE) { b'w' } else { b'-' },
            if self.contains(Self::EXECUTE) { b'x' } else { b'-' },
        ]
    }
}

/// An address in the guest's virtual address space.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtualAddress(usize);

impl VirtualAddress {
    pub const fn new(address: usize) -> Self {
        Self(address)
    }
    pub const fn data(self) -> usize {
        self.0
    }
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }
    /// The start of the page containing this address.
    pub const fn page(self) -> Self {
        Self(round_down_pages(self.0))
    }
    pub fn round_up(self) -> Option<Self> {
        round_up_pages(self.0).map(Self)
    }
    pub fn checked_add(self, bytes: usize) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
    pub fn checked_sub(self, bytes: usize) -> Option<Self> {
        self.0.checked_sub(bytes).map(Self)
    }
    /// Add `bytes`, panicking on overflow. Only use this for addresses already
    /// known to lie inside a valid range.
    #[track_caller]
    pub fn add(self, bytes: usize) -> Self {
        self.checked_add(bytes).expect("virtual address overflow")
    }
    #[track_caller]
    pub fn sub(self, bytes: usize) -> Self {
        self.checked_sub(bytes).expect("virtual address underflow")
    }
    /// Number of bytes from `base` up to `self`.
    #[track_caller]
    pub fn offset_from(self, base: Self) -> usize {
        self.0.checked_sub(base.0).expect("address below base")
    }
}

impl Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A half-open range `[start, end)` of virtual addresses.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddrRange {
    start: VirtualAddress,
    end: VirtualAddress,
}

impl AddrRange {
    /// # Panics
    ///
    /// Panics if `end` is below `start`.
    #[track_caller]
    pub fn new(start: VirtualAddress, end: VirtualAddress) -> Self {
        assert!(start <= end, "inverted range {start:?}..{end:?}");
        Self { start, end }
    }

    /// Range from raw addresses, mostly useful in tests.
    #[track_caller]
    pub fn from_raw(start: usize, end: usize) -> Self {
        Self::new(VirtualAddress::new(start), VirtualAddress::new(end))
    }

    /// Create a range starting at `start` spanning `length` bytes, or `None`
    /// if it would wrap around the address space.
    pub fn with_len(start: VirtualAddress, length: usize) -> Option<Self> {
        Some(Self {
            start,
            end: start.checked_add(length)?,
        })
    }

    /// The page-aligned, non-empty range that a memory syscall operates on:
    /// `address` must be page aligned and `length`, rounded up to a whole
    /// number of pages, must be non-zero and must not wrap.
    pub fn validate_nonempty(address: VirtualAddress, length: usize) -> Option<Self> {
        if !address.is_page_aligned() || length == 0 {
            return None;
        }
        Self::with_len(address, round_up_pages(length)?)
    }

    /// The page that contains `address`.
    pub fn page_containing(address: VirtualAddress) -> Self {
        let start = address.page();
        Self {
            start,
            end: VirtualAddress::new(start.data().saturating_add(PAGE_SIZE)),
        }
    }

    pub fn start(&self) -> VirtualAddress {
        self.start
    }
    pub fn end(&self) -> VirtualAddress {
        self.end
    }
    pub fn len(&self) -> usize {
        self.end.data() - self.start.data()
    }
    /// Return true if the size of this range is zero. Map segments with such
    /// a range should never exist.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
    pub fn page_count(&self) -> usize {
        self.len() / PAGE_SIZE
    }
    pub fn is_page_aligned(&self) -> bool {
        self.start.is_page_aligned() && self.end.is_page_aligned()
    }

    pub fn contains(&self, address: VirtualAddress) -> bool {
        self.start <= address && address < self.end
    }
    pub fn overlaps(&self, other: Self) -> bool {
        self.start < other.end && other.start < self.end
    }
    pub fn is_superset_of(&self, other: Self) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Return the part of the specified range that intersects with self. If
    /// the two do not overlap, the result is empty.
    pub fn intersect(&self, other: Self) -> Self {
        let start = cmp::max(self.start, other.start);
        let end = cmp::max(start, cmp::min(self.end, other.end));
        Self { start, end }
    }

    /// Returns the range from the start of self until the start of `other`,
    /// if that is non-empty.
    pub fn before(self, other: Self) -> Option<Self> {
        Some(Self::new(self.start, cmp::max(self.start, cmp::min(self.end, other.start))))
            .filter(|range| !range.is_empty())
    }

    /// Returns the range from the end of `other` until the end of self, if
    /// that is non-empty.
    pub fn after(self, other: Self) -> Option<Self> {
        Some(Self::new(cmp::min(self.end, cmp::max(self.start, other.end)), self.end))
            .filter(|range| !range.is_empty())
    }

    /// The start addresses of all pages in the range.
    pub fn pages(&self) -> impl Iterator<Item = VirtualAddress> {
        (self.start.page().data()..self.end.data())
            .step_by(PAGE_SIZE)
            .map(VirtualAddress::new)
    }
}

impl Debug for AddrRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}..{:#x} ({:#x} long)", self.start.data(), self.end.data(), self.len())
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    #[test]
    fn intersect_disjoint_is_empty() {
        let a = AddrRange::from_raw(0x1000, 0x3000);
        let b = AddrRange::from_raw(0x5000, 0x6000);

        assert!(a.intersect(b).is_empty());
        assert!(!a.overlaps(b));
        assert_eq!(a.intersect(AddrRange::from_raw(0x2000, 0x9000)), AddrRange::from_raw(0x2000, 0x3000));
    }

    #[test]
    fn before_and_after() {
        let outer = AddrRange::from_raw(0x1000, 0x5000);
        let inner = AddrRange::from_raw(0x2000, 0x3000);

        assert_eq!(outer.before(inner), Some(AddrRange::from_raw(0x1000, 0x2000)));
        assert_eq!(outer.after(inner), Some(AddrRange::from_raw(0x3000, 0x5000)));
        assert_eq!(inner.before(outer), None);
        assert_eq!(inner.after(outer), None);
    }

    #[test]
    fn validate_nonempty_rounds_length() {
        let range = AddrRange::validate_nonempty(VirtualAddress::new(0x1000), 1).unwrap();
        assert_eq!(range, AddrRange::from_raw(0x1000, 0x2000));

        assert_eq!(AddrRange::validate_nonempty(VirtualAddress::new(0x1001), 1), None);
        assert_eq!(AddrRange::validate_nonempty(VirtualAddress::new(0x1000), 0), None);
        assert_eq!(AddrRange::validate_nonempty(VirtualAddress::new(usize::MAX & !PAGE_MASK), PAGE_SIZE), None);
    }

    #[test]
    fn effective_access_implies_read() {
        assert_eq!(Access::WRITE.effective(), Access::READ_WRITE);
        assert_eq!(Access::EXECUTE.effective(), Access::READ | Access::EXECUTE);
        assert_eq!(Access::NONE.effective(), Access::NONE);
        assert_eq!(Access::from_prot(0x8), None);
        assert_eq!(&Access::READ_WRITE.rwx(), b"rw-");
    }
}
