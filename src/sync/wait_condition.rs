use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, Thread};

use slab::Slab;
use spin::Mutex;

/// A pending interruption of one thread, the equivalent of a signal arriving
/// while that thread sleeps inside the memory manager. Blocking waits observe
/// it and give up, so the interrupted operation reports cancellation.
#[derive(Debug)]
pub struct Interrupt {
    pending: AtomicBool,
    thread: Thread,
}

std::thread_local! {
    static CURRENT: Arc<Interrupt> = Arc::new(Interrupt {
        pending: AtomicBool::new(false),
        thread: thread::current(),
    });
}

impl Interrupt {
    /// The interrupt of the calling thread. Hand a clone to whoever should be
    /// able to interrupt this thread.
    pub fn current() -> Arc<Interrupt> {
        CURRENT.with(Arc::clone)
    }

    /// Mark the interrupt pending and wake the owning thread if it sleeps.
    pub fn interrupt(&self) {
        self.pending.store(true, Ordering::SeqCst);
        self.thread.unpark();
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    /// Consume a pending interrupt, returns true if there was one.
    pub fn take(&self) -> bool {
        self.pending.swap(false, Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct WaitCondition {
    generation: AtomicU64,
    waiters: Mutex<Slab<Thread>>,
}

impl WaitCondition {
    pub const fn new() -> WaitCondition {
        WaitCondition {
            generation: AtomicU64::new(0),
            waiters: Mutex::new(Slab::new()),
        }
    }

    // Notify all waiters
    pub fn notify(&self) -> usize {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let waiters = self.waiters.lock();
        for (_, thread) in waiters.iter() {
            thread.unpark();
        }
        waiters.len()
    }

    // Wait until notified. Unlocks guard when blocking is ready. Returns false if
    // resumed by an interrupt of the calling thread.
    pub fn wait<G>(&self, guard: G, reason: &'static str) -> bool {
        let interrupt = Interrupt::current();
        let generation = self.generation.load(Ordering::SeqCst);
        let key = self.waiters.lock().insert(thread::current());
        drop(guard);

        log::trace!("waiting: {}", reason);
        let waited = loop {
            if self.generation.load(Ordering::SeqCst) != generation {
                break true;
            }
            if interrupt.is_pending() {
                break false;
            }
            thread::park();
        };

        self.waiters.lock().remove(key);
        waited
    }
}

impl Default for WaitCondition {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use test_log::test;

    use super::*;

    #[test]
    fn notify_wakes_waiter() {
        // Given
        let state = Arc::new((Mutex::new(false), WaitCondition::new()));
        let waiter = {
            let state = Arc::clone(&state);
            thread::spawn(move || loop {
                let ready = state.0.lock();
                if *ready {
                    return true;
                }
                if !state.1.wait(ready, "test") {
                    return false;
                }
            })
        };

        // When
        thread::sleep(Duration::from_millis(10));
        *state.0.lock() = true;
        state.1.notify();

        // Then
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn interrupt_ends_wait() {
        // Given
        let condition = Arc::new(WaitCondition::new());
        let (tx, rx) = std::sync::mpsc::channel();
        let waiter = {
            let condition = Arc::clone(&condition);
            thread::spawn(move || {
                tx.send(Interrupt::current()).unwrap();
                let waited = condition.wait((), "test");
                (waited, Interrupt::current().take())
            })
        };

        // When
        rx.recv().unwrap().interrupt();

        // Then
        assert_eq!(waiter.join().unwrap(), (false, true));
    }
}
