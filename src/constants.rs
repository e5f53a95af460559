//! Global constants for pbdfs.
//!
//! This module centralizes the limits shared between the SDK and the
//! daemon so both sides agree on wire geometry and argument bounds.

/// Maximum bytes moved by a single channel request (4MB).
///
/// Larger reads and writes are split by the SDK into successive
/// requests of at most this size.
pub const IOSIZE_MAX: usize = 4 * 1024 * 1024;

/// Maximum absolute path length, including the PBD prefix.
pub const PATHLEN_MAX: usize = 4096;

/// Maximum length of a single path component.
pub const NAMELEN_MAX: usize = 256;

/// Maximum PBD name length, terminator included.
pub const PBDLEN_MAX: usize = 64;

/// Number of slots in the process fd table.
pub const FD_TABLE_SIZE: usize = 102_400;

/// High bit set on every fd handed to applications, so SDK fds are
/// unambiguously distinguishable from kernel fds.
pub const FD_TAG: i32 = 1 << 30;

/// Byte-range length fenced per hostid in the node-local fence file.
pub const FLK_LEN: i64 = 1024;

/// Highest regular hostid. The mount meta lock fences at
/// `MAX_HOSTS + 1`, a tool mount with hostid 0 at `MAX_HOSTS + 2`.
pub const MAX_HOSTS: i32 = 255;

/// How long `mount` keeps retrying the hostid lock before `ETIMEDOUT`.
pub const MOUNT_PREPARE_TIMEOUT_MS: u64 = 30 * 1000;

/// Sleep between hostid lock attempts.
pub const MOUNT_PREPARE_RETRY_MS: u64 = 10;

/// Default channel connect timeout.
pub const CONNECT_TIMEOUT_MS: u64 = 20 * 1000;

/// Connect timeout used by `remount` (the daemon may be re-electing).
pub const REMOUNT_TIMEOUT_MS: u64 = 2000 * 1000;

/// Size of the dirent page fetched per READDIR request.
pub const DIRENT_BUF_SIZE: usize = 4096;

/// Default directory for node-local fence files.
pub const DEFAULT_LOCK_DIR: &str = "/var/run/pfs";

/// Default directory for daemon shared-memory regions and pid files.
pub const DEFAULT_SHM_DIR: &str = "/dev/shm/pfsd";

/// Upper bound on daemon worker threads.
pub const WORKER_MAX: i32 = 256;

/// Seconds between janitor sweeps over client slots.
pub const JANITOR_INTERVAL_SECS: u64 = 5;
