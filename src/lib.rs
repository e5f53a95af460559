//! pbdfs - a POSIX-like userspace filesystem SDK over a shared-memory
//! daemon channel.
//!
//! Applications link the SDK, mount one or more PBDs (shared block
//! devices) and operate on `/pbd/...` paths. The SDK performs no block
//! I/O itself: every operation is forwarded through a shared-memory
//! request channel to a co-resident daemon that owns the on-device
//! metadata and data paths. Multiple PBDs may be mounted concurrently;
//! node-local byte-range locks enforce one writer per host id per PBD.
//!
//! # Architecture
//!
//! - **Path handling** ([`path`]): absolute-path construction from the
//!   working directory, normalization, PBD-name extraction
//! - **Fencing** ([`fence`]): advisory byte-range locks on the per-PBD
//!   fence file
//! - **Mount registry** ([`mount`]): mount lifecycle, reference
//!   counting, teardown-safe lookup
//! - **Fd table** ([`fdtable`]): process-wide fd map with per-file
//!   locking and bulk invalidation on unmount
//! - **Channel** ([`chnl`]): the shared-memory transport (wire
//!   protocol, region layout, SPSC rings, client connection table)
//! - **SDK facade** ([`sdk`]): the public POSIX-like surface
//! - **Daemon** ([`daemon`]): the embedded daemon serving the channel
//!   against a filesystem engine
//!
//! # Example
//!
//! ```rust,no_run
//! use pbdfs::mount::mntflags;
//!
//! fn main() -> Result<(), pbdfs::Errno> {
//!     pbdfs::sdk::mount("cluster", "1-1", 1, mntflags::RD | mntflags::WR)?;
//!     let fd = pbdfs::sdk::open("/1-1/hello", libc::O_CREAT | libc::O_WRONLY, 0o644)?;
//!     pbdfs::sdk::pwrite(fd, b"hello", 0)?;
//!     pbdfs::sdk::close(fd)?;
//!     pbdfs::sdk::umount("1-1")?;
//!     Ok(())
//! }
//! ```

pub mod chnl;
pub mod constants;
pub mod daemon;
pub mod error;
pub mod fdtable;
pub mod fence;
pub mod logging;
pub mod mount;
pub mod path;
pub mod sdk;

pub use chnl::protocol::FileStat;
pub use error::Errno;
pub use sdk::{Dir, Dirent, DirentPlus, Mode};
