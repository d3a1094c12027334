pub use self::{
    ordered::{
        CleanLockToken, Level, LockToken, Lower, Mutex, MutexGuard, RwLock, RwLockReadGuard,
        RwLockWriteGuard, L0, L1, L2, L3,
    },
    wait_condition::{Interrupt, WaitCondition},
};

pub mod ordered;
pub mod wait_condition;

/// Level of a memory manager's VMA state. Taken first by every operation.
pub type MappingLevel = L1;
/// Level of a backing object's set of mappings.
pub type MappableLevel = L2;
/// Level of a memory manager's PMA and address space state.
pub type ActiveLevel = L3;
