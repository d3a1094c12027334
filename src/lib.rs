//! # guest-mm
//!
//! The virtual memory subsystem of a user-space kernel. It emulates a Linux
//! compatible process address space for a sandboxed guest: `mmap`, `munmap`,
//! `mprotect`, `mremap`, `brk`, `mlock`, `madvise`, fork-time duplication and
//! fault-driven population, all on top of two narrow capabilities, a backing
//! object ([`memmap::Mappable`]) and a platform address space
//! ([`platform::AddressSpace`]).
//!
//! Two interval maps are kept per address space. The VMA map records what the
//! application asked for; the PMA map records what has actually been
//! translated, allocated and possibly installed. Both are protected by
//! ordered locks, see [`sync`] for the levels.

// Used to make it nicer to return errors, for example, .ok_or(Error::NotFound)
#![allow(clippy::or_fun_call)]
// Mapping options are naturally wide
#![allow(clippy::too_many_arguments)]
// This is usually a serious issue - a missing import of a define where it is interpreted
// as a catch-all variable in a match, for example
#![deny(unreachable_patterns)]
// Ensure that all must_use results are used
#![deny(unused_must_use)]

extern crate alloc;

/// Addresses, ranges and access types
pub mod addr;

/// Error kinds and outcomes
pub mod error;

/// Backing storage
pub mod memory;

/// Backing objects and the mappings they serve
pub mod memmap;

/// Memory manager
pub mod mm;

/// Platform address spaces
pub mod platform;

/// Synchronization primitives
pub mod sync;

pub use crate::addr::{AddrRange, Access, VirtualAddress, PAGE_SIZE};
pub use crate::error::{Completion, Error, Result};
pub use crate::mm::MemoryManager;
