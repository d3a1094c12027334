//! # Platform address spaces
//!
//! The platform owns whatever actually translates guest addresses: host page
//! tables, a second-level MMU, or the software tables of [`ShadowPlatform`].
//! The memory manager only installs and removes ranges through
//! [`AddressSpace`], and is handed faults through
//! [`MemoryManager::deliver_fault`](crate::mm::MemoryManager::deliver_fault).

use alloc::sync::Arc;

use crate::addr::{AddrRange, Access};
use crate::error::{Result, Signal};
use crate::memory::File;

pub mod shadow;

pub use self::shadow::{ShadowAddressSpace, ShadowPlatform};

/// Creates address spaces.
pub trait Platform: Send + Sync {
    fn new_address_space(&self) -> Result<Arc<dyn AddressSpace>>;
}

/// A hardware-level mapping handle for one memory manager.
///
/// Implementations must not call back into the memory manager; they are used
/// with its active state locked.
pub trait AddressSpace: Send + Sync {
    /// Map `ar` to `file` starting at `offset` with `perms`, replacing what is
    /// there. `precommit` asks for the mapping to be established eagerly.
    fn install(
        &self,
        ar: AddrRange,
        file: &Arc<dyn File>,
        offset: u64,
        perms: Access,
        precommit: bool,
    ) -> Result<()>;

    /// Remove all mappings in `ar`.
    fn unmap_range(&self, ar: AddrRange);

    /// Make this the address space of the calling execution context.
    fn switch_to(&self);

    /// Give the address space back to the platform. It is unused afterwards.
    fn release(&self);
}

/// The memory manager's answer to a fault delivered by the platform.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultResponse {
    /// Retry the faulting access.
    Resolved,
    /// The faulting context was interrupted; handle the interrupt, then retry.
    Cancelled,
    /// Deliver this signal to the faulting context.
    Signal(Signal),
}
