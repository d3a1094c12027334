use core::fmt;

use syscall::error::{Error as Errno, EACCES, EAGAIN, EEXIST, EFAULT, EINVAL, ENOMEM};

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Failure kinds of memory-management operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// Misaligned, empty or overflowing range, or conflicting flags.
    InvalidArgument,
    /// Address space or private memory exhausted.
    OutOfMemory,
    /// A resource limit such as `RLIMIT_MEMLOCK` would be exceeded.
    LimitExceeded,
    /// The requested access exceeds the permissions of the mapping.
    AccessDenied,
    /// No mapping covers (part of) the address range.
    NotFound,
    /// The backing object was invalidated or torn down concurrently.
    ObjectGone,
    /// A fixed, non-replacing mapping collides with an existing one.
    Exists,
    /// The access lies beyond the end of the backing object.
    BusError,
}

impl Error {
    /// Linux errno equivalent, as returned by the corresponding syscall.
    pub fn errno(self) -> i32 {
        match self {
            Error::InvalidArgument => EINVAL,
            Error::OutOfMemory | Error::NotFound => ENOMEM,
            Error::LimitExceeded => EAGAIN,
            Error::AccessDenied => EACCES,
            Error::ObjectGone | Error::BusError => EFAULT,
            Error::Exists => EEXIST,
        }
    }

    /// The signal delivered to a context whose fault failed with `self`.
    pub fn signal(self) -> Signal {
        match self {
            Error::AccessDenied => Signal::Segv(SegvCode::AccErr),
            Error::NotFound | Error::InvalidArgument | Error::LimitExceeded | Error::Exists => {
                Signal::Segv(SegvCode::MapErr)
            }
            Error::ObjectGone | Error::BusError | Error::OutOfMemory => Signal::Bus,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Error::InvalidArgument => "invalid argument",
            Error::OutOfMemory => "out of memory",
            Error::LimitExceeded => "resource limit exceeded",
            Error::AccessDenied => "access denied",
            Error::NotFound => "no mapping at address",
            Error::ObjectGone => "backing object gone",
            Error::Exists => "mapping exists",
            Error::BusError => "access beyond end of object",
        };
        f.write_str(text)
    }
}

impl From<Error> for Errno {
    fn from(err: Error) -> Self {
        Errno::new(err.errno())
    }
}

/// `si_code` of a `SIGSEGV`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegvCode {
    /// Address not mapped.
    MapErr,
    /// Mapped, but the access is not permitted.
    AccErr,
}

/// Signal to deliver to a faulting context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    Segv(SegvCode),
    Bus,
}

/// Outcome of an operation that may block on a backing object. A cancelled
/// operation did not fail; it was interrupted before it could complete and
/// may be restarted.
#[must_use]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion<T> {
    Done(T),
    Cancelled,
}

impl<T> Completion<T> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Completion::Cancelled)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Completion<U> {
        match self {
            Completion::Done(value) => Completion::Done(f(value)),
            Completion::Cancelled => Completion::Cancelled,
        }
    }

    /// The completed value.
    ///
    /// # Panics
    ///
    /// Panics if the operation was cancelled.
    #[track_caller]
    pub fn unwrap_done(self) -> T {
        match self {
            Completion::Done(value) => value,
            Completion::Cancelled => panic!("operation was cancelled"),
        }
    }
}

/// Internal short-circuit for blocking paths: either a real failure or a
/// cancellation, so both propagate with `?`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Stop {
    Failed(Error),
    Cancelled,
}

impl From<Error> for Stop {
    fn from(err: Error) -> Self {
        Stop::Failed(err)
    }
}

impl Stop {
    pub(crate) fn into_result<T>(result: Result<T, Stop>) -> Result<Completion<T>> {
        match result {
            Ok(value) => Ok(Completion::Done(value)),
            Err(Stop::Cancelled) => Ok(Completion::Cancelled),
            Err(Stop::Failed(err)) => Err(err),
        }
    }
}

/// Lift a backing object's `Result<Completion<T>>` into the internal form.
pub(crate) fn stop_on_cancel<T>(result: Result<Completion<T>>) -> Result<T, Stop> {
    match result? {
        Completion::Done(value) => Ok(value),
        Completion::Cancelled => Err(Stop::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(Errno::from(Error::InvalidArgument).errno, EINVAL);
        assert_eq!(Errno::from(Error::LimitExceeded).errno, EAGAIN);
        assert_eq!(Errno::from(Error::Exists).errno, EEXIST);
        assert_eq!(Error::NotFound.errno(), ENOMEM);
    }

    #[test]
    fn cancellation_is_not_an_error() {
        let result: Result<(), Stop> = Err(Stop::Cancelled);
        assert_eq!(Stop::into_result(result), Ok(Completion::Cancelled));

        let result: Result<(), Stop> = Err(Stop::Failed(Error::AccessDenied));
        assert_eq!(Stop::into_result(result), Err(Error::AccessDenied));
    }

    #[test]
    fn fault_signals() {
        assert_eq!(Error::AccessDenied.signal(), Signal::Segv(SegvCode::AccErr));
        assert_eq!(Error::NotFound.signal(), Signal::Segv(SegvCode::MapErr));
        assert_eq!(Error::BusError.signal(), Signal::Bus);
    }
}
