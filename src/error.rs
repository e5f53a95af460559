//! Error types for pbdfs.
//!
//! Infrastructure failures are typed enums; the public API speaks POSIX
//! through the [`Errno`] newtype. Internal signals (`EAGAIN` retry,
//! `ESTALE` refresh) never cross the public boundary: the facade loops
//! on the former and the request layer consumes the latter.

use std::fmt;

/// A POSIX errno value as returned by the public SDK surface.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(pub i32);

macro_rules! errno_consts {
    ($($name:ident),* $(,)?) => {
        impl Errno {
            $(pub const $name: Errno = Errno(libc::$name);)*
        }

        impl fmt::Debug for Errno {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $(libc::$name => write!(f, stringify!($name)),)*
                    other => write!(f, "Errno({})", other),
                }
            }
        }
    };
}

errno_consts!(
    EPERM, ENOENT, EIO, EBADF, EAGAIN, ENOMEM, EACCES, EFAULT, EBUSY,
    EEXIST, EXDEV, ENODEV, ENOTDIR, EISDIR, EINVAL, EMFILE, EFBIG,
    ENOSPC, EROFS, ENAMETOOLONG, ENOTEMPTY, EOVERFLOW, ERANGE, ESTALE,
    ETIMEDOUT, ENOSYS, ENOTSUP,
);

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl std::error::Error for Errno {}

impl Errno {
    /// Raw errno value.
    pub fn raw(self) -> i32 {
        self.0
    }
}

/// Errnos the SDK is allowed to surface to applications. Anything an
/// internal path produces outside this list is reported as `EIO`.
const PUBLIC_ERRNOS: &[Errno] = &[
    Errno::EACCES,
    Errno::EAGAIN,
    Errno::EBADF,
    Errno::EEXIST,
    Errno::EFBIG,
    Errno::EINVAL,
    Errno::EISDIR,
    Errno::EMFILE,
    Errno::ENAMETOOLONG,
    Errno::ENODEV,
    Errno::ENOENT,
    Errno::ENOTEMPTY,
    Errno::ENOMEM,
    Errno::ENOSPC,
    Errno::ENOTDIR,
    Errno::EXDEV,
    Errno::EOVERFLOW,
    Errno::EROFS,
    Errno::EBUSY,
    Errno::ERANGE,
    Errno::ENOSYS,
    Errno::ENOTSUP,
    Errno::ETIMEDOUT,
];

/// Map an internal errno into the public namespace.
///
/// `EAGAIN` must have been consumed by the caller's retry loop before
/// reaching this point, but it is on the allow-list so a leak is at
/// least visible rather than disguised as `EIO`.
pub fn to_public(err: Errno) -> Errno {
    if PUBLIC_ERRNOS.contains(&err) {
        err
    } else {
        Errno::EIO
    }
}

/// Result alias used throughout the SDK internals.
pub type Result<T> = std::result::Result<T, Errno>;

/// Shared-memory region failures.
#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    #[error("failed to create shm file: {0}")]
    CreateFailed(std::io::Error),
    #[error("failed to open shm file: {0}")]
    OpenFailed(std::io::Error),
    #[error("failed to size shm file: {0}")]
    TruncateFailed(std::io::Error),
    #[error("failed to map shm file: {0}")]
    MmapFailed(std::io::Error),
    #[error("invalid shm magic number")]
    InvalidMagic,
    #[error("shm version mismatch")]
    VersionMismatch,
    #[error("no free client slots")]
    NoFreeSlots,
    #[error("invalid slot id")]
    InvalidSlot,
    #[error("invalid shm configuration: {0}")]
    InvalidConfig(String),
}

/// Channel client failures.
#[derive(Debug, thiserror::Error)]
pub enum ChnlError {
    #[error(transparent)]
    Shm(#[from] ShmError),
    #[error("daemon for {0} is not running")]
    DaemonNotRunning(String),
    #[error("timed out waiting for daemon {0}")]
    ConnectTimeout(String),
    #[error("connection {0} is not open")]
    BadConn(i32),
    #[error("daemon went away")]
    DaemonGone,
    #[error("request buffers exceed slot capacity ({requested} > {capacity})")]
    BufferTooLarge { requested: usize, capacity: usize },
}

impl ChnlError {
    /// Collapse a transport failure into the errno the SDK reports.
    pub fn errno(&self) -> Errno {
        match self {
            ChnlError::BufferTooLarge { .. } => Errno::ENOMEM,
            ChnlError::ConnectTimeout(_) => Errno::ETIMEDOUT,
            ChnlError::DaemonNotRunning(_) => Errno::ENODEV,
            _ => Errno::EIO,
        }
    }
}

/// Embedded daemon lifecycle failures.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error(transparent)]
    Shm(#[from] ShmError),
    #[error("daemon already started")]
    AlreadyStarted,
    #[error("daemon not started")]
    NotStarted,
    #[error("invalid option: {0}")]
    BadOption(String),
    #[error("pid file busy: {0}")]
    PidFileBusy(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowlist_passthrough() {
        assert_eq!(to_public(Errno::ENOENT), Errno::ENOENT);
        assert_eq!(to_public(Errno::EROFS), Errno::EROFS);
        assert_eq!(to_public(Errno::EOVERFLOW), Errno::EOVERFLOW);
    }

    #[test]
    fn test_internal_errnos_become_eio() {
        assert_eq!(to_public(Errno::ESTALE), Errno::EIO);
        assert_eq!(to_public(Errno(libc::EDEADLK)), Errno::EIO);
        assert_eq!(to_public(Errno(999)), Errno::EIO);
    }

    #[test]
    fn test_errno_display() {
        assert_eq!(Errno::ENOENT.to_string(), "ENOENT");
        assert_eq!(Errno(9999).to_string(), "Errno(9999)");
    }

    #[test]
    fn test_chnl_error_errno() {
        let e = ChnlError::BufferTooLarge {
            requested: 8 << 20,
            capacity: 4 << 20,
        };
        assert_eq!(e.errno(), Errno::ENOMEM);
        assert_eq!(ChnlError::DaemonGone.errno(), Errno::EIO);
    }
}
