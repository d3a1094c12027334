//! Scenarios spanning several operations and threads.

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Barrier};
use std::thread;
use std::time::Duration;

use test_log::test;

use super::*;
use crate::addr::Access;
use crate::error::{Completion, Error, Result};
use crate::memmap::{MMapOpts, Mappable, SharedObject, Translation};
use crate::platform::ShadowPlatform;
use crate::sync::Interrupt;

const PAGE: u64 = PAGE_SIZE as u64;

fn setup() -> (Arc<MemoryManager>, Arc<MemoryFile>, CleanLockToken) {
    let mf = Arc::new(MemoryFile::new(1 << 24));
    let mm = MemoryManager::new(ShadowPlatform::new(), mf.clone(), Layout::default());
    (mm, mf, unsafe { CleanLockToken::new() })
}

fn map_object(mm: &MemoryManager, object: &Arc<SharedObject>, len: usize, private: bool, token: &mut CleanLockToken) -> AddrRange {
    let mut opts = MMapOpts::anonymous(len);
    object.configure_mmap(&mut opts);
    opts.private = private;
    mm.mmap(opts, token).unwrap()
}

/// Fails its first translation as if the object had been replaced.
struct Flaky {
    inner: Arc<SharedObject>,
    failed: AtomicBool,
}

impl Mappable for Flaky {
    fn add_mapping(
        &self,
        space: &Weak<dyn MappingSpace>,
        ar: AddrRange,
        offset: u64,
        writable: bool,
        token: LockToken<'_, MappingLevel>,
    ) -> Result<()> {
        self.inner.add_mapping(space, ar, offset, writable, token)
    }

    fn remove_mapping(
        &self,
        space: &Weak<dyn MappingSpace>,
        ar: AddrRange,
        offset: u64,
        writable: bool,
        token: LockToken<'_, MappingLevel>,
    ) {
        self.inner.remove_mapping(space, ar, offset, writable, token)
    }

    fn translate(
        &self,
        required: crate::memory::FileRange,
        optional: crate::memory::FileRange,
        at: Access,
    ) -> Result<Completion<Vec<Translation>>> {
        if !self.failed.swap(true, Ordering::SeqCst) {
            return Err(Error::ObjectGone);
        }
        self.inner.translate(required, optional, at)
    }
}

#[test]
fn rss_counts_touched_pages_only() {
    // Given
    let (mm, mf, mut token) = setup();
    let ar = mm.mmap(MMapOpts::anonymous(10 * PAGE_SIZE), &mut token).unwrap();

    // When
    for page in [0, 3, 4, 9] {
        mm.handle_user_fault(ar.start().add(page * PAGE_SIZE + 8), Access::WRITE, &mut token)
            .unwrap()
            .unwrap_done();
    }

    // Then
    assert_eq!(mm.resident_set_size(&mut token), 4 * PAGE_SIZE);
    assert_eq!(mf.usage(), 4 * PAGE);
    mm.munmap(ar.start(), ar.len(), &mut token).unwrap();
    assert_eq!(mm.resident_set_size(&mut token), 0);
    assert_eq!(mm.max_resident_set_size(&mut token), 4 * PAGE_SIZE);
    assert_eq!(mf.usage(), 0);
}

#[test]
fn write_after_mprotect_read_only_is_denied() {
    // Given
    let (mm, _mf, mut token) = setup();
    let ar = mm.mmap(MMapOpts::anonymous(0x3000).at(VirtualAddress::new(0x1000)), &mut token).unwrap();
    assert_eq!(ar, AddrRange::new(VirtualAddress::new(0x1000), VirtualAddress::new(0x4000)));
    mm.handle_user_fault(VirtualAddress::new(0x1500), Access::WRITE, &mut token).unwrap().unwrap_done();

    // When
    mm.mprotect(ar.start(), ar.len(), Access::READ, &mut token).unwrap();

    // Then
    let fault = mm.handle_user_fault(VirtualAddress::new(0x1500), Access::WRITE, &mut token);
    assert_eq!(fault, Err(Error::AccessDenied));
    let page = AddrRange::new(VirtualAddress::new(0x1000), VirtualAddress::new(0x2000));
    assert_eq!(mm.resolved_ranges(&mut token), [page]);
    mm.handle_user_fault(VirtualAddress::new(0x1500), Access::READ, &mut token).unwrap().unwrap_done();
}

#[test]
fn racing_faults_allocate_once() {
    // Given
    let (mm, mf, mut token) = setup();
    let ar = mm.mmap(MMapOpts::anonymous(PAGE_SIZE), &mut token).unwrap();
    let barrier = Arc::new(Barrier::new(2));

    // When
    let threads: Vec<_> = (0..2)
        .map(|_| {
            let mm = Arc::clone(&mm);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut token = unsafe { CleanLockToken::new() };
                barrier.wait();
                mm.handle_user_fault(ar.start(), Access::WRITE, &mut token)
            })
        })
        .collect();

    // Then
    for thread in threads {
        assert_eq!(thread.join().unwrap(), Ok(Completion::Done(())));
    }
    assert_eq!(mf.usage(), PAGE);
    assert_eq!(mm.resident_set_size(&mut token), PAGE_SIZE);
    assert_eq!(mm.pma_count(&mut token), 1);
}

#[test]
fn private_file_mapping_copies_on_first_write() {
    // Given
    let (mm, mf, mut token) = setup();
    let object = SharedObject::new("/data", 2 * PAGE);
    object.write_at(0, b"original").unwrap();
    let ar = map_object(&mm, &object, 2 * PAGE_SIZE, true, &mut token);
    let mut buf = [0u8; 8];
    mm.copy_in(ar.start(), &mut buf, false, &mut token).unwrap().unwrap_done();
    assert_eq!(&buf, b"original");
    assert_eq!(mf.usage(), 0);

    // When
    mm.copy_out(ar.start(), b"private!", false, &mut token).unwrap().unwrap_done();
    object.write_at(0, b"changed!").unwrap();
    object.write_at(PAGE, b"later").unwrap();

    // Then
    assert_eq!(mf.usage(), PAGE);
    mm.copy_in(ar.start(), &mut buf, false, &mut token).unwrap().unwrap_done();
    assert_eq!(&buf, b"private!");
    object.read_at(0, &mut buf).unwrap();
    assert_eq!(&buf, b"changed!");
    let mut tail = [0u8; 5];
    mm.copy_in(ar.start().add(PAGE_SIZE), &mut tail, false, &mut token).unwrap().unwrap_done();
    assert_eq!(&tail, b"later");
}

#[test]
fn fork_then_unmap_and_write_on_both_sides() {
    // Given
    let (mm, mf, mut token) = setup();
    let ar = mm.mmap(MMapOpts::anonymous(3 * PAGE_SIZE), &mut token).unwrap();
    for (i, tag) in [b"page0", b"page1", b"page2"].iter().enumerate() {
        mm.copy_out(ar.start().add(i * PAGE_SIZE), *tag, false, &mut token).unwrap().unwrap_done();
    }
    let child = mm.fork(&mut token).unwrap();
    assert_eq!(mf.usage(), 3 * PAGE);

    // When
    mm.munmap(ar.start().add(PAGE_SIZE), PAGE_SIZE, &mut token).unwrap();
    mm.copy_out(ar.start(), b"PARENT", false, &mut token).unwrap().unwrap_done();
    child.copy_out(ar.start().add(2 * PAGE_SIZE), b"CHILD", false, &mut token).unwrap().unwrap_done();
    child.copy_out(ar.start().add(PAGE_SIZE), b"ALONE", false, &mut token).unwrap().unwrap_done();

    // Then
    // Page 1 is the child's alone after the unmap and is written in place.
    assert_eq!(mf.usage(), 5 * PAGE);
    let mut buf = [0u8; 5];
    child.copy_in(ar.start(), &mut buf, false, &mut token).unwrap().unwrap_done();
    assert_eq!(&buf, b"page0");
    child.copy_in(ar.start().add(PAGE_SIZE), &mut buf, false, &mut token).unwrap().unwrap_done();
    assert_eq!(&buf, b"ALONE");
    mm.copy_in(ar.start().add(2 * PAGE_SIZE), &mut buf, false, &mut token).unwrap().unwrap_done();
    assert_eq!(&buf, b"page2");
    assert_eq!(
        mm.copy_in(ar.start().add(PAGE_SIZE), &mut buf, false, &mut token),
        Err(Error::NotFound)
    );
    assert_eq!(child.usage_as(&mut token), 3 * PAGE_SIZE);
    assert_eq!(mm.usage_as(&mut token), 2 * PAGE_SIZE);
}

#[test]
fn fault_after_unmap_finds_nothing() {
    // Given
    let (mm, mf, mut token) = setup();
    let ar = mm.mmap(MMapOpts::anonymous(4 * PAGE_SIZE), &mut token).unwrap();
    let faulter = {
        let mm = Arc::clone(&mm);
        thread::spawn(move || {
            let mut token = unsafe { CleanLockToken::new() };
            let mut faults = 0usize;
            loop {
                match mm.handle_user_fault(ar.start().add((faults % 4) * PAGE_SIZE), Access::WRITE, &mut token) {
                    Ok(_) => faults += 1,
                    Err(err) => return err,
                }
            }
        })
    };

    // When
    thread::sleep(Duration::from_millis(5));
    mm.munmap(ar.start(), ar.len(), &mut token).unwrap();

    // Then
    assert_eq!(faulter.join().unwrap(), Error::NotFound);
    assert_eq!(mm.handle_user_fault(ar.start(), Access::READ, &mut token), Err(Error::NotFound));
    assert_eq!(mm.resident_set_size(&mut token), 0);
    assert_eq!(mf.usage(), 0);
}

#[test]
fn interrupted_fault_is_cancelled() {
    // Given
    let (mm, _mf, mut token) = setup();
    let object = SharedObject::new("/slow", PAGE);
    let ar = map_object(&mm, &object, PAGE_SIZE, false, &mut token);
    let fill = crate::memory::FileRange::new(0, PAGE);
    object.begin_fill(fill);
    let (tx, rx) = mpsc::channel();
    let faulter = {
        let mm = Arc::clone(&mm);
        thread::spawn(move || {
            let mut token = unsafe { CleanLockToken::new() };
            tx.send(Interrupt::current()).unwrap();
            let result = mm.handle_user_fault(ar.start(), Access::READ, &mut token);
            Interrupt::current().take();
            result
        })
    };

    // When
    let interrupt = rx.recv().unwrap();
    thread::sleep(Duration::from_millis(10));
    interrupt.interrupt();

    // Then
    assert_eq!(faulter.join().unwrap(), Ok(Completion::Cancelled));
    assert_eq!(mm.resident_set_size(&mut token), 0);
    object.complete_fill(fill, b"ready");
    let mut buf = [0u8; 5];
    mm.copy_in(ar.start(), &mut buf, false, &mut token).unwrap().unwrap_done();
    assert_eq!(&buf, b"ready");
}

#[test]
fn interrupted_population_is_cancelled() {
    // Given
    let (mm, _mf, mut token) = setup();
    let object = SharedObject::new("/slow", 2 * PAGE);
    let ar = map_object(&mm, &object, 2 * PAGE_SIZE, false, &mut token);
    let fill = crate::memory::FileRange::new(0, 2 * PAGE);
    object.begin_fill(fill);
    let interrupt = Interrupt::current();
    interrupt.interrupt();

    // When
    let locked = mm.mlock(ar.start(), ar.len(), MLockMode::Eager, &mut token);
    let advised = mm.madvise(ar.start(), ar.len(), Advice::WillNeed, &mut token);
    let locked_all = mm.mlockall(MlockAllFlags::CURRENT, &mut token);
    let mut opts = MMapOpts::anonymous(PAGE_SIZE);
    object.configure_mmap(&mut opts);
    opts.private = false;
    opts.precommit = true;
    let populated = mm.mmap(opts, &mut token);

    // Then
    assert_eq!(locked, Ok(Completion::Cancelled));
    assert_eq!(advised, Ok(Completion::Cancelled));
    assert_eq!(locked_all, Ok(Completion::Cancelled));
    // The new mapping stands and the interrupt is left for the caller.
    let extra = populated.unwrap();
    assert!(interrupt.take());
    assert_eq!(mm.resident_set_size(&mut token), 0);
    assert_eq!(mm.locked_as(&mut token), 2 * PAGE_SIZE);

    object.complete_fill(fill, b"ready");
    mm.mlock(ar.start(), ar.len(), MLockMode::Eager, &mut token).unwrap().unwrap_done();
    assert_eq!(mm.resident_set_size(&mut token), 2 * PAGE_SIZE);
    let mut buf = [0u8; 5];
    mm.copy_in(extra.start(), &mut buf, false, &mut token).unwrap().unwrap_done();
    assert_eq!(&buf, b"ready");
}

#[test]
fn vanished_object_is_retried_once() {
    // Given
    let (mm, _mf, mut token) = setup();
    let inner = SharedObject::new("/flaky", PAGE);
    inner.write_at(0, b"second try").unwrap();
    let mut opts = MMapOpts::anonymous(PAGE_SIZE);
    opts.mappable = Some(Arc::new(Flaky { inner, failed: AtomicBool::new(false) }));
    opts.private = false;
    let ar = mm.mmap(opts, &mut token).unwrap();

    // When
    let fault = mm.handle_user_fault(ar.start(), Access::READ, &mut token);

    // Then
    assert_eq!(fault, Ok(Completion::Done(())));
    let mut buf = [0u8; 10];
    mm.copy_in(ar.start(), &mut buf, false, &mut token).unwrap().unwrap_done();
    assert_eq!(&buf, b"second try");
}

#[test]
fn destroyed_object_faults_with_bus_error() {
    let (mm, _mf, mut token) = setup();
    let object = SharedObject::new("/gone", PAGE);
    let ar = map_object(&mm, &object, PAGE_SIZE, false, &mut token);

    object.destroy(&mut token);

    let response = mm.deliver_fault(ar.start(), Access::READ, &mut token);
    assert_eq!(response, crate::platform::FaultResponse::Signal(crate::error::Signal::Bus));
}

#[test]
fn truncate_drops_private_copies_beyond_the_end() {
    // Given
    let (mm, mf, mut token) = setup();
    let object = SharedObject::new("/shrinking", 2 * PAGE);
    let ar = map_object(&mm, &object, 2 * PAGE_SIZE, true, &mut token);
    mm.copy_out(ar.start(), b"head", false, &mut token).unwrap().unwrap_done();
    mm.copy_out(ar.start().add(PAGE_SIZE), b"tail", false, &mut token).unwrap().unwrap_done();
    assert_eq!(mf.usage(), 2 * PAGE);

    // When
    object.truncate(PAGE, &mut token);

    // Then
    assert_eq!(mm.resolved_ranges(&mut token), [AddrRange::with_len(ar.start(), PAGE_SIZE).unwrap()]);
    assert_eq!(mf.usage(), PAGE);
    let mut buf = [0u8; 4];
    assert_eq!(
        mm.copy_in(ar.start().add(PAGE_SIZE), &mut buf, false, &mut token),
        Err(Error::BusError)
    );
    mm.copy_in(ar.start(), &mut buf, false, &mut token).unwrap().unwrap_done();
    assert_eq!(&buf, b"head");
}

#[test]
fn invalidations_during_fork_reach_parent_and_children() {
    // Given
    let (mm, _mf, mut token) = setup();
    let object = SharedObject::new("/busy", 2 * PAGE);
    let ar = map_object(&mm, &object, 2 * PAGE_SIZE, false, &mut token);
    mm.zero_out(ar.start(), ar.len(), false, &mut token).unwrap().unwrap_done();
    let truncater = {
        let object = Arc::clone(&object);
        thread::spawn(move || {
            let mut token = unsafe { CleanLockToken::new() };
            for _ in 0..20 {
                object.truncate(PAGE, &mut token);
                object.truncate(2 * PAGE, &mut token);
            }
        })
    };

    // When
    let mut children = Vec::new();
    for _ in 0..20 {
        let child = mm.fork(&mut token).unwrap();
        child.handle_user_fault(ar.start(), Access::READ, &mut token).unwrap().unwrap_done();
        children.push(child);
    }
    truncater.join().unwrap();
    mm.handle_user_fault(ar.start(), Access::READ, &mut token).unwrap().unwrap_done();
    object.truncate(0, &mut token);

    // Then
    assert!(mm.resolved_ranges(&mut token).is_empty());
    for child in &children {
        assert!(child.resolved_ranges(&mut token).is_empty());
        child.check_invariants(&mut token);
    }
}

#[test]
fn second_write_after_fork_copies_nothing() {
    // Given
    let (mm, mf, mut token) = setup();
    let ar = mm.mmap(MMapOpts::anonymous(PAGE_SIZE), &mut token).unwrap();
    mm.copy_out(ar.start(), b"shared", false, &mut token).unwrap().unwrap_done();
    let child = mm.fork(&mut token).unwrap();
    child.copy_out(ar.start(), b"first", false, &mut token).unwrap().unwrap_done();
    assert_eq!(mf.usage(), 2 * PAGE);

    // When
    child.copy_out(ar.start(), b"again", false, &mut token).unwrap().unwrap_done();
    mm.copy_out(ar.start(), b"parent", false, &mut token).unwrap().unwrap_done();
    mm.copy_out(ar.start(), b"PARENT", false, &mut token).unwrap().unwrap_done();

    // Then
    assert_eq!(mf.usage(), 2 * PAGE);
    let mut buf = [0u8; 5];
    child.copy_in(ar.start(), &mut buf, false, &mut token).unwrap().unwrap_done();
    assert_eq!(&buf, b"again");
    let mut buf = [0u8; 6];
    mm.copy_in(ar.start(), &mut buf, false, &mut token).unwrap().unwrap_done();
    assert_eq!(&buf, b"PARENT");
}

#[test]
fn mixed_operations_keep_the_maps_consistent() {
    let (mm, mf, mut token) = setup();
    let base = VirtualAddress::new(0x40_0000);
    let page = |n: usize| base.add(n * PAGE_SIZE);

    mm.mmap(MMapOpts::anonymous(8 * PAGE_SIZE).at(base), &mut token).unwrap();
    mm.check_invariants(&mut token);
    mm.zero_out(base, 8 * PAGE_SIZE, false, &mut token).unwrap().unwrap_done();
    mm.check_invariants(&mut token);
    mm.mprotect(page(2), 2 * PAGE_SIZE, Access::READ, &mut token).unwrap();
    mm.check_invariants(&mut token);

    let child = mm.fork(&mut token).unwrap();
    mm.check_invariants(&mut token);
    child.check_invariants(&mut token);

    let grown = mm.mremap(page(4), 4 * PAGE_SIZE, 6 * PAGE_SIZE, MremapOpts::default(), &mut token);
    assert_eq!(grown, Ok(page(4)));
    mm.check_invariants(&mut token);
    mm.munmap(page(1), 2 * PAGE_SIZE, &mut token).unwrap();
    mm.check_invariants(&mut token);
    child.copy_out(page(5), b"child", false, &mut token).unwrap().unwrap_done();
    child.check_invariants(&mut token);
    mm.copy_out(page(6), b"parent", false, &mut token).unwrap().unwrap_done();
    mm.check_invariants(&mut token);
    mm.madvise(page(4), 2 * PAGE_SIZE, Advice::DontNeed, &mut token).unwrap().unwrap_done();
    mm.check_invariants(&mut token);
    mm.mprotect(page(3), 7 * PAGE_SIZE, Access::READ_WRITE, &mut token).unwrap();
    mm.check_invariants(&mut token);
    mm.copy_out(page(9), b"grown", false, &mut token).unwrap().unwrap_done();
    mm.check_invariants(&mut token);

    mm.munmap(base, 10 * PAGE_SIZE, &mut token).unwrap();
    mm.check_invariants(&mut token);
    assert!(mm.resolved_ranges(&mut token).is_empty());
    assert_eq!(mm.resident_set_size(&mut token), 0);
    assert_eq!(child.usage_as(&mut token), 8 * PAGE_SIZE);
    let mut buf = [0u8; 5];
    child.copy_in(page(5), &mut buf, false, &mut token).unwrap().unwrap_done();
    assert_eq!(&buf, b"child");

    drop(child);
    assert_eq!(mf.usage(), 0);
}
