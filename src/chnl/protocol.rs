//! Wire protocol between the SDK and the daemon.
//!
//! Requests and responses are fixed-size ring entries; bulk data (path
//! names, IO payloads, dirent pages, stat records) travels through the
//! slot's data buffer and is referenced by length fields in the entry.

use std::sync::atomic::{AtomicU32, AtomicU64};

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::constants::{DIRENT_BUF_SIZE, IOSIZE_MAX};

/// Magic number for shared memory validation ("PBDFSD01")
pub const SHM_MAGIC: u64 = 0x5042444653443031;

/// Protocol version
pub const SHM_VERSION: u32 = 1;

/// Default number of client slots per region
pub const DEFAULT_NUM_SLOTS: u32 = 64;

/// Maximum number of slots (1024 = 16 words * 64 bits)
pub const MAX_SLOTS: u32 = 1024;

/// Number of u64 words in the slot allocation bitmap
pub const SLOT_BITMAP_WORDS: usize = 16;

/// Default request/response ring size (entries, power of 2)
pub const DEFAULT_RING_SIZE: u32 = 16;

/// Data buffer bytes per slot. Sized for the largest single request:
/// a 4MB IO, or two full path names for RENAME.
pub const DATA_BUFFER_SIZE: usize = IOSIZE_MAX;

/// Page size for control block alignment
pub const PAGE_SIZE: usize = 4096;

/// WRITE offset meaning "current file position" (resolved client-side,
/// never crosses the wire).
pub const OFF_CURRENT: i64 = -1;

/// WRITE offset meaning "append at end of file" (resolved atomically by
/// the daemon, which returns the post-write file size).
pub const OFF_FILE_SIZE: i64 = -2;

/// READDIR result sentinel for end-of-directory. Not an error.
pub const DIR_END: i64 = 1;

/// Request types
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    /// No operation (invalid)
    Nop = 0,
    Open = 1,
    Read = 2,
    Write = 3,
    Lseek = 4,
    Stat = 5,
    Fstat = 6,
    Truncate = 7,
    Ftruncate = 8,
    Fallocate = 9,
    Unlink = 10,
    Rename = 11,
    Mkdir = 12,
    Rmdir = 13,
    Opendir = 14,
    Readdir = 15,
    Access = 16,
    Growfs = 17,
    IncreaseEpoch = 18,
    Chdir = 19,
    /// Client slot teardown (channel close)
    Disconnect = 255,
}

impl From<u32> for OpType {
    fn from(v: u32) -> Self {
        match v {
            1 => OpType::Open,
            2 => OpType::Read,
            3 => OpType::Write,
            4 => OpType::Lseek,
            5 => OpType::Stat,
            6 => OpType::Fstat,
            7 => OpType::Truncate,
            8 => OpType::Ftruncate,
            9 => OpType::Fallocate,
            10 => OpType::Unlink,
            11 => OpType::Rename,
            12 => OpType::Mkdir,
            13 => OpType::Rmdir,
            14 => OpType::Opendir,
            15 => OpType::Readdir,
            16 => OpType::Access,
            17 => OpType::Growfs,
            18 => OpType::IncreaseEpoch,
            19 => OpType::Chdir,
            255 => OpType::Disconnect,
            _ => OpType::Nop,
        }
    }
}

/// Request ring entry (128 bytes, cache-line aligned).
///
/// Field use by op: `ino`/`offset`/`length` carry the IO triple;
/// `aux` carries the READDIR cursor ino, the directory ino for
/// OPENDIR-relative ops, or nothing; `flags` carries open flags, the
/// lseek whence, the access amode, the fallocate mode or the rename2
/// flags; `mode` is the open/creat mode.
#[derive(Clone, Copy)]
#[repr(C, align(64))]
pub struct RequestEntry {
    /// Unique request ID within the connection
    pub request_id: u64,
    /// Operation type
    pub op_type: u32,
    /// Per-op flag word
    pub flags: u32,
    /// Mount metadata epoch the client believes current; echoed back
    pub mount_id: u32,
    /// Open mode bits
    pub mode: u32,
    /// Opaque per-open payload echoed on every request
    pub common_pl: u64,
    /// Target inode (-1 when the op is name-based)
    pub ino: i64,
    /// IO offset, seek offset, or readdir continuation offset
    pub offset: i64,
    /// IO length, truncate length, or fallocate length
    pub length: u64,
    /// Per-op auxiliary word (readdir cursor ino)
    pub aux: u64,
    /// Request payload bytes present in the data buffer
    pub req_len: u64,
    /// Response payload bytes the client is prepared to accept
    pub rsp_len: u64,
    _reserved: [u8; 48],
}

impl RequestEntry {
    pub fn new(op: OpType) -> Self {
        Self {
            request_id: 0,
            op_type: op as u32,
            flags: 0,
            mount_id: 0,
            mode: 0,
            common_pl: 0,
            ino: -1,
            offset: 0,
            length: 0,
            aux: 0,
            req_len: 0,
            rsp_len: 0,
            _reserved: [0; 48],
        }
    }

    pub fn op(&self) -> OpType {
        OpType::from(self.op_type)
    }
}

impl Default for RequestEntry {
    fn default() -> Self {
        Self::new(OpType::Nop)
    }
}

/// Response ring entry (64 bytes, cache-line aligned).
#[derive(Clone, Copy)]
#[repr(C, align(64))]
pub struct ResponseEntry {
    /// Request ID this response corresponds to
    pub request_id: u64,
    /// Operation type echoed from the request
    pub op_type: u32,
    /// POSIX errno, or 0
    pub error: i32,
    /// Daemon's current mount metadata epoch
    pub mount_id: u32,
    _pad: u32,
    /// Primary result: bytes moved, inode, new offset, or op rc
    pub res: i64,
    /// Secondary result: append file size, open initial offset,
    /// readdir continuation ino
    pub aux: i64,
    /// Tertiary result: readdir continuation offset
    pub aux2: i64,
    /// Response payload bytes written to the data buffer
    pub data_len: u64,
    /// Opaque per-open payload assigned on OPEN, echoed elsewhere
    pub common_pl: u64,
}

impl ResponseEntry {
    pub fn new() -> Self {
        Self {
            request_id: 0,
            op_type: 0,
            error: 0,
            mount_id: 0,
            _pad: 0,
            res: 0,
            aux: 0,
            aux2: 0,
            data_len: 0,
            common_pl: 0,
        }
    }

    pub fn reply(req: &RequestEntry) -> Self {
        let mut rsp = Self::new();
        rsp.request_id = req.request_id;
        rsp.op_type = req.op_type;
        rsp
    }

    pub fn error(req: &RequestEntry, errno: i32) -> Self {
        let mut rsp = Self::reply(req);
        rsp.error = errno;
        rsp.res = -1;
        rsp
    }

    pub fn is_ok(&self) -> bool {
        self.error == 0
    }
}

impl Default for ResponseEntry {
    fn default() -> Self {
        Self::new()
    }
}

/// Stat record crossing the data buffer for STAT/FSTAT (64 bytes).
#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct FileStat {
    pub ino: u64,
    /// File type and permission bits (S_IFREG/S_IFDIR | 0o644 style)
    pub mode: u32,
    pub nlink: u32,
    pub size: i64,
    pub blocks: i64,
    pub blksize: u32,
    _pad: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

impl FileStat {
    pub fn file(ino: u64, size: i64, mtime: i64) -> Self {
        Self {
            ino,
            mode: libc::S_IFREG | 0o644,
            nlink: 1,
            size,
            blocks: (size + 511) / 512,
            blksize: 4096,
            _pad: 0,
            atime: mtime,
            mtime,
            ctime: mtime,
        }
    }

    pub fn dir(ino: u64, nentries: u32, mtime: i64) -> Self {
        Self {
            ino,
            mode: libc::S_IFDIR | 0o755,
            nlink: 2 + nentries,
            size: 0,
            blocks: 0,
            blksize: 4096,
            _pad: 0,
            atime: mtime,
            mtime,
            ctime: mtime,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    pub fn is_file(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFREG
    }
}

/// Packed directory entry inside a READDIR page (272 bytes).
#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C)]
pub struct WireDirent {
    pub ino: u64,
    /// DT_REG / DT_DIR
    pub etype: u32,
    pub namelen: u32,
    pub name: [u8; 256],
}

/// Entries per READDIR page.
pub const DIRENTS_PER_PAGE: usize = DIRENT_BUF_SIZE / std::mem::size_of::<WireDirent>();

impl WireDirent {
    pub fn new(ino: u64, etype: u32, name: &str) -> Self {
        let mut ent = Self {
            ino,
            etype,
            namelen: 0,
            name: [0; 256],
        };
        let bytes = name.as_bytes();
        let n = bytes.len().min(255);
        ent.name[..n].copy_from_slice(&bytes[..n]);
        ent.namelen = n as u32;
        ent
    }

    pub fn name(&self) -> &str {
        let n = (self.namelen as usize).min(self.name.len());
        std::str::from_utf8(&self.name[..n]).unwrap_or("")
    }
}

impl std::fmt::Debug for WireDirent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireDirent")
            .field("ino", &self.ino)
            .field("etype", &self.etype)
            .field("name", &self.name())
            .finish()
    }
}

/// Global control block at offset 0 of the region, page-aligned.
#[repr(C, align(4096))]
pub struct GlobalControlBlock {
    pub magic: u64,
    pub version: u32,
    /// Daemon process ID (0 if not started)
    pub daemon_pid: AtomicU32,
    /// 0 = not ready, 1 = ready
    pub ready_flag: AtomicU32,
    /// 0 = running, 1 = shutdown requested
    pub shutdown_flag: AtomicU32,
    /// Current mount metadata epoch; requests quoting an older value
    /// are answered with ESTALE
    pub meta_epoch: AtomicU32,
    pub num_slots: u32,
    pub slot_size: u64,
    pub data_buffer_size: u64,
    pub ring_size: u32,
    _pad: u32,
    /// Slot allocation bitmap (1 = allocated)
    pub slot_bitmap: [AtomicU64; SLOT_BITMAP_WORDS],
    _reserved: [u8; 3912],
}

impl GlobalControlBlock {
    pub fn init(num_slots: u32, slot_size: u64, data_buffer_size: u64, ring_size: u32) -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self {
            magic: SHM_MAGIC,
            version: SHM_VERSION,
            daemon_pid: AtomicU32::new(0),
            ready_flag: AtomicU32::new(0),
            shutdown_flag: AtomicU32::new(0),
            meta_epoch: AtomicU32::new(1),
            num_slots,
            slot_size,
            data_buffer_size,
            ring_size,
            _pad: 0,
            slot_bitmap: [ZERO; SLOT_BITMAP_WORDS],
            _reserved: [0; 3912],
        }
    }

    pub fn validate(&self) -> bool {
        self.magic == SHM_MAGIC && self.version == SHM_VERSION
    }
}

/// Per-slot control block (64 bytes, cache-line aligned).
#[repr(C, align(64))]
pub struct SlotControlBlock {
    /// Client process ID (0 if slot is free)
    pub client_pid: AtomicU32,
    /// Nonzero: drop queued requests submitted by this pid
    pub abort_pid: AtomicU32,
    /// Request ring head (client) / tail (daemon)
    pub request_head: AtomicU32,
    pub request_tail: AtomicU32,
    /// Response ring head (daemon) / tail (client)
    pub response_head: AtomicU32,
    pub response_tail: AtomicU32,
    _padding: [u8; 40],
}

impl SlotControlBlock {
    pub fn init() -> Self {
        Self {
            client_pid: AtomicU32::new(0),
            abort_pid: AtomicU32::new(0),
            request_head: AtomicU32::new(0),
            request_tail: AtomicU32::new(0),
            response_head: AtomicU32::new(0),
            response_tail: AtomicU32::new(0),
            _padding: [0; 40],
        }
    }

    pub fn reset(&self) {
        use std::sync::atomic::Ordering;
        self.client_pid.store(0, Ordering::Release);
        self.abort_pid.store(0, Ordering::Release);
        self.request_head.store(0, Ordering::Release);
        self.request_tail.store(0, Ordering::Release);
        self.response_head.store(0, Ordering::Release);
        self.response_tail.store(0, Ordering::Release);
    }
}

// Compile-time layout checks shared with the daemon side.
const _: () = assert!(std::mem::size_of::<GlobalControlBlock>() == PAGE_SIZE);
const _: () = assert!(std::mem::size_of::<SlotControlBlock>() == 64);
const _: () = assert!(std::mem::size_of::<RequestEntry>() == 128);
const _: () = assert!(std::mem::size_of::<ResponseEntry>() == 64);
const _: () = assert!(std::mem::size_of::<FileStat>() == 64);
const _: () = assert!(std::mem::size_of::<WireDirent>() == 272);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_sizes() {
        assert_eq!(std::mem::size_of::<RequestEntry>(), 128);
        assert_eq!(std::mem::size_of::<ResponseEntry>(), 64);
        assert_eq!(std::mem::size_of::<GlobalControlBlock>(), PAGE_SIZE);
        assert_eq!(std::mem::size_of::<SlotControlBlock>(), 64);
    }

    #[test]
    fn test_op_type_conversion() {
        assert_eq!(OpType::from(1), OpType::Open);
        assert_eq!(OpType::from(15), OpType::Readdir);
        assert_eq!(OpType::from(19), OpType::Chdir);
        assert_eq!(OpType::from(255), OpType::Disconnect);
        assert_eq!(OpType::from(77), OpType::Nop);
    }

    #[test]
    fn test_dirent_name_roundtrip() {
        let ent = WireDirent::new(42, libc::DT_REG as u32, "journal.log");
        assert_eq!(ent.name(), "journal.log");
        assert_eq!(ent.ino, 42);
    }

    #[test]
    fn test_dirents_per_page() {
        assert_eq!(DIRENTS_PER_PAGE, 15);
    }

    #[test]
    fn test_filestat_kinds() {
        let f = FileStat::file(7, 4096, 0);
        assert!(f.is_file() && !f.is_dir());
        let d = FileStat::dir(8, 3, 0);
        assert!(d.is_dir() && !d.is_file());
        assert_eq!(d.nlink, 5);
    }

    #[test]
    fn test_error_reply_echoes_request() {
        let mut req = RequestEntry::new(OpType::Unlink);
        req.request_id = 9;
        let rsp = ResponseEntry::error(&req, libc::ENOENT);
        assert_eq!(rsp.request_id, 9);
        assert_eq!(rsp.op_type, OpType::Unlink as u32);
        assert!(!rsp.is_ok());
    }
}
