// This code was adapted from MIT licensed https://github.com/antialize/ordered-locks
// We cannot use that library directly as it is wrapping std::sync types

//! Compile-time ordering of locks into levels [`L1`], [`L2`] and [`L3`].
//! In order to acquire a lock at level `i` only locks at level `i-1` or below may be held.
//!
//! The memory manager uses three levels, see [`MappingLevel`](super::MappingLevel),
//! [`MappableLevel`](super::MappableLevel) and [`ActiveLevel`](super::ActiveLevel).
//! Backing object translation and platform calls happen below the lowest level and
//! take no token, so they cannot re-enter any of these locks.
//!
//! ```
//! use guest_mm::sync::{CleanLockToken, RwLock, L1, L3};
//! let outer = RwLock::<L1, _>::new(42);
//! let inner = RwLock::<L3, _>::new(43);
//! // Construct a token indicating that this thread does not hold any locks
//! let mut token = unsafe { CleanLockToken::new() };
//!
//! {
//!     let mut g1 = outer.write(token.token());
//!     let (v1, token) = g1.token_split();
//!     let mut g2 = inner.write(token);
//!     *g2 = 11;
//!     *v1 = 12;
//! }
//! *inner.write(token.token()) = 13;
//! ```
//!
//! Acquiring the outer lock while holding the inner one fails to compile:
//! ```compile_fail
//! use guest_mm::sync::{CleanLockToken, RwLock, L1, L3};
//! let outer = RwLock::<L1, _>::new(42);
//! let inner = RwLock::<L3, _>::new(43);
//! let mut clean_token = unsafe { CleanLockToken::new() };
//!
//! let mut g2 = inner.write(clean_token.token());
//! let (_, token) = g2.token_split();
//! let g1 = outer.write(token); // shouldn't compile!
//! ```
use core::marker::PhantomData;

/// Lock level of a mutex
///
/// While a lock of L1 is held on a thread, only locks of L2 or higher may be acquired.
/// For a deadlock to occur we need some thread TA to hold a resource RA, and request a
/// resource RB, while another thread TB holds RB, and requests RA. This is not possible
/// with a lock hierarchy, as either RA or RB must be on a lower level than the other.
pub trait Level {}

/// Indicate that the implementor is lower that the level O
pub trait Lower<O: Level>: Level {}

/// Lowest locking level, no locks can be on this level
#[derive(Debug)]
pub struct L0 {}

#[derive(Debug)]
pub struct L1 {}

#[derive(Debug)]
pub struct L2 {}

#[derive(Debug)]
pub struct L3 {}

impl Level for L0 {}
impl Level for L1 {}
impl Level for L2 {}
impl Level for L3 {}

impl Lower<L1> for L0 {}
impl Lower<L2> for L0 {}
impl Lower<L3> for L0 {}

impl Lower<L2> for L1 {}
impl Lower<L3> for L1 {}

impl Lower<L3> for L2 {}

/// While this exists only locks with a level higher than L, may be locked.
/// These tokens are carried around the call stack to indicate the current locking level.
/// They have no size and should disappear at runtime.
pub struct LockToken<'a, L: Level>(PhantomData<&'a mut L>);

impl<'a, L: Level> LockToken<'a, L> {
    /// Create a borrowed copy of self
    pub fn token(&mut self) -> LockToken<'_, L> {
        LockToken(PhantomData)
    }

    fn downgraded<LP: Lower<L>>(_: LockToken<'a, LP>) -> Self {
        LockToken(PhantomData)
    }
}

/// Token indicating that there are no acquired locks while not borrowed.
pub struct CleanLockToken(());

impl CleanLockToken {
    /// Create a borrowed copy of self
    pub fn token(&mut self) -> LockToken<'_, L0> {
        LockToken(PhantomData)
    }

    /// Create a new instance
    ///
    /// # Safety
    ///
    /// This is safe to call as long as there are no currently acquired locks
    /// in the calling thread, and as long as there is no other CleanLockToken
    /// in use by the calling thread.
    pub unsafe fn new() -> Self {
        CleanLockToken(())
    }
}

/// A mutual exclusion primitive at lock level `L`.
#[derive(Debug)]
pub struct Mutex<L: Level, T> {
    inner: spin::Mutex<T>,
    _phantom: PhantomData<L>,
}

impl<L: Level, T: Default> Default for Mutex<L, T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<L: Level, T> Mutex<L, T> {
    pub const fn new(val: T) -> Self {
        Self {
            inner: spin::Mutex::new(val),
            _phantom: PhantomData,
        }
    }

    /// Acquires the mutex, spinning until it is available. `lock_token` proves
    /// that only locks of a lower level are held.
    pub fn lock<'a, LP: Lower<L> + 'a>(
        &'a self,
        lock_token: LockToken<'a, LP>,
    ) -> MutexGuard<'a, L, T> {
        MutexGuard {
            inner: self.inner.lock(),
            lock_token: LockToken::downgraded(lock_token),
        }
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

/// An RAII implementation of a "scoped lock" of a mutex. When this structure is
/// dropped (falls out of scope), the lock will be unlocked.
pub struct MutexGuard<'a, L: Level, T: ?Sized + 'a> {
    inner: spin::MutexGuard<'a, T>,
    lock_token: LockToken<'a, L>,
}

impl<'a, L: Level, T: ?Sized + 'a> MutexGuard<'a, L, T> {
    /// Split the guard into two parts, the first a mutable reference to the held content
    /// the second a [`LockToken`] that can be used for further locking
    pub fn token_split(&mut self) -> (&mut T, LockToken<'_, L>) {
        (&mut self.inner, self.lock_token.token())
    }
}

impl<'a, L: Level, T: ?Sized + 'a> core::ops::Deref for MutexGuard<'a, L, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
impl<'a, L: Level, T: ?Sized + 'a> core::ops::DerefMut for MutexGuard<'a, L, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

/// A reader-writer lock at lock level `L`.
pub struct RwLock<L: Level, T> {
    inner: spin::RwLock<T>,
    _phantom: PhantomData<L>,
}

impl<L: Level, T: Default> Default for RwLock<L, T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<L: Level, T> RwLock<L, T> {
    pub const fn new(val: T) -> Self {
        Self {
            inner: spin::RwLock::new(val),
            _phantom: PhantomData,
        }
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }

    /// The protected value, through an exclusive borrow that already rules
    /// out other lock holders.
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    /// Locks with exclusive write access, spinning until no readers or writers remain.
    pub fn write<'a, LP: Lower<L> + 'a>(
        &'a self,
        lock_token: LockToken<'a, LP>,
    ) -> RwLockWriteGuard<'a, L, T> {
        RwLockWriteGuard {
            inner: self.inner.write(),
            lock_token: LockToken::downgraded(lock_token),
        }
    }

    /// Locks with shared read access, spinning until no writer holds the lock.
    ///
    /// Attempts to recursively acquire a read lock on the same RwLock may deadlock.
    pub fn read<'a, LP: Lower<L> + 'a>(
        &'a self,
        lock_token: LockToken<'a, LP>,
    ) -> RwLockReadGuard<'a, L, T> {
        RwLockReadGuard {
            inner: self.inner.read(),
            lock_token: LockToken::downgraded(lock_token),
        }
    }

    /// Write-lock two distinct locks of the same level.
    ///
    /// This is the only way to hold two locks of one level at once. The locks are
    /// always acquired in order of their address, which stays fixed while they are
    /// borrowed, so two threads locking the same pair from opposite ends cannot
    /// deadlock. The guards are returned in argument order.
    ///
    /// # Panics
    ///
    /// Panics if both arguments are the same lock.
    pub fn write_pair<'a, LP: Lower<L> + 'a>(
        first: &'a Self,
        second: &'a Self,
        _lock_token: LockToken<'a, LP>,
    ) -> (RwLockWriteGuard<'a, L, T>, RwLockWriteGuard<'a, L, T>) {
        let first_addr = first as *const Self as usize;
        let second_addr = second as *const Self as usize;
        assert_ne!(first_addr, second_addr, "write_pair called on a single lock");

        let (first_inner, second_inner) = if first_addr < second_addr {
            let a = first.inner.write();
            (a, second.inner.write())
        } else {
            let b = second.inner.write();
            (first.inner.write(), b)
        };
        (
            RwLockWriteGuard {
                inner: first_inner,
                lock_token: LockToken(PhantomData),
            },
            RwLockWriteGuard {
                inner: second_inner,
                lock_token: LockToken(PhantomData),
            },
        )
    }
}

/// RAII structure used to release the exclusive write access of a lock when dropped
pub struct RwLockWriteGuard<'a, L: Level, T> {
    inner: spin::RwLockWriteGuard<'a, T>,
    lock_token: LockToken<'a, L>,
}

impl<'a, L: Level, T> RwLockWriteGuard<'a, L, T> {
    /// Split the guard into two parts, the first a mutable reference to the held content
    /// the second a [`LockToken`] that can be used for further locking
    pub fn token_split(&mut self) -> (&mut T, LockToken<'_, L>) {
        (&mut self.inner, self.lock_token.token())
    }

    /// Atomically turn exclusive access into shared access, without letting
    /// another writer in between.
    pub fn downgrade(self) -> RwLockReadGuard<'a, L, T> {
        RwLockReadGuard {
            inner: spin::RwLockWriteGuard::downgrade(self.inner),
            lock_token: self.lock_token,
        }
    }
}

impl<L: Level, T> core::ops::Deref for RwLockWriteGuard<'_, L, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<L: Level, T> core::ops::DerefMut for RwLockWriteGuard<'_, L, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

/// RAII structure used to release the shared read access of a lock when dropped.
pub struct RwLockReadGuard<'a, L: Level, T> {
    inner: spin::RwLockReadGuard<'a, T>,
    lock_token: LockToken<'a, L>,
}

impl<L: Level, T> RwLockReadGuard<'_, L, T> {
    /// Split the guard into two parts, the first a reference to the held content
    /// the second a [`LockToken`] that can be used for further locking
    pub fn token_split(&mut self) -> (&T, LockToken<'_, L>) {
        (&self.inner, self.lock_token.token())
    }
}

impl<L: Level, T> core::ops::Deref for RwLockReadGuard<'_, L, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
