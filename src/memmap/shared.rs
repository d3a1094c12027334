use alloc::{
    string::String,
    sync::{Arc, Weak},
    vec::Vec,
};
use core::ops::Range;
use core::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use spin::Mutex as SpinMutex;

use super::{
    InvalidateOpts, MMapOpts, Mappable, MappingIdentity, MappingSet, MappingSpace, Translation,
};
use crate::addr::{AddrRange, Access, PAGE_SIZE};
use crate::error::{Completion, Error, Result};
use crate::memory::{BlockSeq, File, FileRange, PageFrame};
use crate::sync::{CleanLockToken, LockToken, MappableLevel, MappingLevel, Mutex, WaitCondition};

const PAGE: u64 = PAGE_SIZE as u64;

static NEXT_INODE: AtomicU64 = AtomicU64::new(1);

fn page_round_up(offset: u64) -> u64 {
    offset.div_ceil(PAGE) * PAGE
}

struct Content {
    size: u64,
    /// Page cache, by page offset. Pages appear on first use.
    pages: HashMap<u64, Arc<PageFrame>>,
    gone: bool,
    /// Ranges whose content is still being read in.
    filling: Vec<FileRange>,
}

/// A file-like backing object: the page cache of a regular file, or the
/// object behind a shared anonymous mapping. Every mapping of it shares the
/// same pages, so writes are visible through all of them.
pub struct SharedObject {
    this: Weak<SharedObject>,
    name: String,
    device: (u32, u32),
    inode: u64,
    content: SpinMutex<Content>,
    filled: WaitCondition,
    mappings: Mutex<MappableLevel, MappingSet>,
}

impl SharedObject {
    /// A file called `name` of `size` zero bytes.
    pub fn new(name: impl Into<String>, size: u64) -> Arc<Self> {
        Self::with_identity(name.into(), (0, 0x2a), size)
    }

    /// The object behind a `MAP_SHARED | MAP_ANONYMOUS` mapping of `size` bytes.
    pub fn anonymous(size: u64) -> Arc<Self> {
        Self::with_identity(String::from("/dev/zero (deleted)"), (0, 5), size)
    }

    fn with_identity(name: String, device: (u32, u32), size: u64) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: Weak::clone(this),
            name,
            device,
            inode: NEXT_INODE.fetch_add(1, Ordering::Relaxed),
            content: SpinMutex::new(Content {
                size,
                pages: HashMap::new(),
                gone: false,
                filling: Vec::new(),
            }),
            filled: WaitCondition::new(),
            mappings: Mutex::new(MappingSet::new()),
        })
    }

    /// Make `opts` map this object.
    pub fn configure_mmap(self: &Arc<Self>, opts: &mut MMapOpts) {
        opts.mappable = Some(Arc::clone(self) as Arc<dyn Mappable>);
        opts.mapping_identity = Some(Arc::clone(self) as Arc<dyn MappingIdentity>);
    }

    pub fn size(&self) -> u64 {
        self.content.lock().size
    }

    /// Read from the object, stopping at its end. Returns the bytes read.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let content = self.content.lock();
        if content.gone {
            return Err(Error::ObjectGone);
        }
        let end = content.size.min(offset.saturating_add(buf.len() as u64));
        if end <= offset {
            return Ok(0);
        }
        let len = (end - offset) as usize;
        for (page, in_page, range) in page_chunks(offset, len) {
            match content.pages.get(&page) {
                Some(frame) => frame.read(in_page, &mut buf[range]),
                None => buf[range].fill(0),
            }
        }
        Ok(len)
    }

    /// Write in place, extending the object if needed. Mappings observe the
    /// new content immediately, except private copies made before.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut content = self.content.lock();
        if content.gone {
            return Err(Error::ObjectGone);
        }
        let end = offset.checked_add(data.len() as u64).ok_or(Error::InvalidArgument)?;
        content.size = content.size.max(end);
        content.store(offset, data);
        Ok(())
    }

    /// Change the size of the object. Shrinking drops every cached translation
    /// of the removed pages from all mappings, private copies included, before
    /// the pages go away.
    pub fn truncate(&self, size: u64, token: &mut CleanLockToken) {
        let old_size = {
            let mut content = self.content.lock();
            core::mem::replace(&mut content.size, size)
        };
        if size >= old_size {
            return;
        }
        log::debug!("truncating {} from {:#x} to {:#x}", self.name, old_size, size);

        let removed = FileRange::new(page_round_up(size), page_round_up(old_size));
        if !removed.is_empty() {
            self.invalidate_mappings(removed, InvalidateOpts { invalidate_private: true }, token);
        }

        let mut content = self.content.lock();
        content.pages.retain(|page, _| *page < removed.start);
        if size % PAGE != 0 {
            let tail = size - size % PAGE;
            if let Some(frame) = content.pages.get(&tail) {
                let in_page = (size % PAGE) as usize;
                frame.fill(in_page, PAGE_SIZE - in_page, 0);
            }
        }
    }

    /// Tear the object down. Mappings lose their cached translations and any
    /// later translation fails with [`Error::ObjectGone`].
    pub fn destroy(&self, token: &mut CleanLockToken) {
        let size = {
            let mut content = self.content.lock();
            content.gone = true;
            content.pages.clear();
            content.filling.clear();
            content.size
        };
        self.filled.notify();
        log::debug!("destroyed {}", self.name);
        self.invalidate_mappings(
            FileRange::new(0, page_round_up(size).max(PAGE)),
            InvalidateOpts::default(),
            token,
        );
    }

    /// Mark `fr` as being read in. Translations touching it block until
    /// [`SharedObject::complete_fill`].
    pub fn begin_fill(&self, fr: FileRange) {
        self.content.lock().filling.push(fr);
    }

    /// Store `data` at the start of `fr` and wake everyone waiting for it.
    pub fn complete_fill(&self, fr: FileRange, data: &[u8]) {
        {
            let mut content = self.content.lock();
            content.store(fr.start, data);
            content.filling.retain(|filling| *filling != fr);
        }
        self.filled.notify();
    }

    fn invalidate_mappings(&self, fr: FileRange, opts: InvalidateOpts, token: &mut CleanLockToken) {
        let mut mappings = self.mappings.lock(token.token());
        let (set, mut token) = mappings.token_split();
        for (space, ar) in set.invalidations(fr) {
            space.invalidate(ar, opts, token.token());
        }
    }

    fn file(&self) -> Result<Arc<dyn File>> {
        self.this
            .upgrade()
            .map(|this| this as Arc<dyn File>)
            .ok_or(Error::ObjectGone)
    }
}

impl Content {
    fn page(&mut self, page: u64) -> Arc<PageFrame> {
        Arc::clone(
            self.pages
                .entry(page)
                .or_insert_with(|| Arc::new(PageFrame::zeroed())),
        )
    }

    fn store(&mut self, offset: u64, data: &[u8]) {
        for (page, in_page, range) in page_chunks(offset, data.len()) {
            self.page(page).write(in_page, &data[range]);
        }
    }
}

/// Split `len` bytes at object offset `offset` into per-page pieces of
/// (page offset, offset within the page, range of the buffer).
fn page_chunks(offset: u64, len: usize) -> impl Iterator<Item = (u64, usize, Range<usize>)> {
    let mut done = 0;
    core::iter::from_fn(move || {
        if done >= len {
            return None;
        }
        let at = offset + done as u64;
        let in_page = (at % PAGE) as usize;
        let chunk = (PAGE_SIZE - in_page).min(len - done);
        let range = done..done + chunk;
        done += chunk;
        Some((at - in_page as u64, in_page, range))
    })
}

impl Mappable for SharedObject {
    fn add_mapping(
        &self,
        space: &Weak<dyn MappingSpace>,
        ar: AddrRange,
        offset: u64,
        writable: bool,
        token: LockToken<'_, MappingLevel>,
    ) -> Result<()> {
        if self.content.lock().gone {
            return Err(Error::ObjectGone);
        }
        self.mappings.lock(token).add(space, ar, offset, writable);
        Ok(())
    }

    fn remove_mapping(
        &self,
        space: &Weak<dyn MappingSpace>,
        ar: AddrRange,
        offset: u64,
        _writable: bool,
        token: LockToken<'_, MappingLevel>,
    ) {
        self.mappings.lock(token).remove(space, ar, offset);
    }

    fn translate(
        &self,
        required: FileRange,
        optional: FileRange,
        _at: Access,
    ) -> Result<Completion<Vec<Translation>>> {
        let mut content = self.content.lock();
        loop {
            if content.gone {
                return Err(Error::ObjectGone);
            }
            if required.start >= page_round_up(content.size) {
                return Err(Error::BusError);
            }
            if !content.filling.iter().any(|filling| filling.overlaps(required)) {
                break;
            }
            if !self.filled.wait(content, "SharedObject::translate") {
                return Ok(Completion::Cancelled);
            }
            content = self.content.lock();
        }

        let eof = page_round_up(content.size);
        let mut source = optional.intersect(FileRange::new(0, eof));
        if content.filling.iter().any(|filling| filling.overlaps(source)) {
            source = required.intersect(FileRange::new(0, eof));
        }
        Ok(Completion::Done(alloc::vec![Translation {
            source,
            file: self.file()?,
            offset: source.start,
            perms: Access::ANY,
        }]))
    }
}

impl File for SharedObject {
    // Cached pages stay until truncation or teardown, regardless of mappings.
    fn inc_ref(&self, _fr: FileRange) {}

    fn dec_ref(&self, _fr: FileRange) {}

    fn map_internal(&self, fr: FileRange, _at: Access) -> Result<BlockSeq> {
        let mut content = self.content.lock();
        if content.gone {
            return Err(Error::ObjectGone);
        }
        Ok(fr.pages().map(|page| content.page(page)).collect())
    }
}

impl MappingIdentity for SharedObject {
    fn mapped_name(&self) -> String {
        self.name.clone()
    }

    fn device(&self) -> (u32, u32) {
        self.device
    }

    fn inode(&self) -> u64 {
        self.inode
    }
}

impl core::fmt::Debug for SharedObject {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "SharedObject({}:{})", self.name, self.inode)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use test_log::test;

    use super::*;
    use crate::sync::Interrupt;

    #[test]
    fn translate_beyond_end_is_a_bus_error() {
        let object = SharedObject::new("file", 3 * PAGE);
        let result = object.translate(
            FileRange::new(3 * PAGE, 4 * PAGE),
            FileRange::new(3 * PAGE, 4 * PAGE),
            Access::READ,
        );
        assert_eq!(result.err(), Some(Error::BusError));
    }

    #[test]
    fn translate_clamps_optional_to_end_of_file() {
        // Given
        let object = SharedObject::new("file", PAGE + 1);

        // When
        let ts = object
            .translate(FileRange::new(0, PAGE), FileRange::new(0, 16 * PAGE), Access::READ)
            .unwrap()
            .unwrap_done();

        // Then
        assert_eq!(ts.len(), 1);
        assert_eq!(ts[0].source, FileRange::new(0, 2 * PAGE));
    }

    #[test]
    fn write_then_read_back() {
        let object = SharedObject::new("file", 0);
        object.write_at(PAGE - 2, b"abcd").unwrap();

        let mut buf = [0; 6];
        assert_eq!(object.read_at(PAGE - 3, &mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"\0abcd");
        assert_eq!(object.size(), PAGE + 2);
    }

    #[test]
    fn truncate_zeroes_the_tail() {
        let object = SharedObject::new("file", 0);
        let mut token = unsafe { CleanLockToken::new() };
        object.write_at(0, &[1; 16]).unwrap();

        object.truncate(8, &mut token);
        object.truncate(16, &mut token);

        let mut buf = [9; 16];
        object.read_at(0, &mut buf).unwrap();
        assert_eq!(buf, [1, 1, 1, 1, 1, 1, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn destroyed_object_is_gone() {
        let object = SharedObject::new("file", PAGE);
        let mut token = unsafe { CleanLockToken::new() };

        object.destroy(&mut token);

        let fr = FileRange::new(0, PAGE);
        assert_eq!(object.translate(fr, fr, Access::READ).err(), Some(Error::ObjectGone));
        assert_eq!(object.map_internal(fr, Access::READ).err(), Some(Error::ObjectGone));
    }

    #[test]
    fn interrupted_translate_is_cancelled() {
        // Given
        let object = SharedObject::new("file", 2 * PAGE);
        object.begin_fill(FileRange::new(0, PAGE));
        let (tx, rx) = std::sync::mpsc::channel();
        let waiter = {
            let object = Arc::clone(&object);
            thread::spawn(move || {
                tx.send(Interrupt::current()).unwrap();
                let fr = FileRange::new(0, PAGE);
                let result = object.translate(fr, fr, Access::READ);
                Interrupt::current().take();
                result
            })
        };

        // When
        let interrupt = rx.recv().unwrap();
        thread::sleep(Duration::from_millis(10));
        interrupt.interrupt();

        // Then
        assert!(waiter.join().unwrap().unwrap().is_cancelled());
    }

    #[test]
    fn completed_fill_unblocks_translate() {
        // Given
        let object = SharedObject::new("file", PAGE);
        let fr = FileRange::new(0, PAGE);
        object.begin_fill(fr);
        let waiter = {
            let object = Arc::clone(&object);
            thread::spawn(move || object.translate(fr, fr, Access::READ))
        };

        // When
        thread::sleep(Duration::from_millis(10));
        object.complete_fill(fr, b"filled");

        // Then
        let ts = waiter.join().unwrap().unwrap().unwrap_done();
        let mut buf = [0; 6];
        ts[0].file.map_internal(fr, Access::READ).unwrap()[0].read(0, &mut buf);
        assert_eq!(&buf, b"filled");
    }
}
