//! Process-wide file-descriptor table and per-file state.
//!
//! 102_400 slots with an embedded LIFO free list. A slot is either a
//! live handle plus its borrow count or a link to the next free slot.
//! `close` refuses with `EAGAIN` while other borrowers exist; callers
//! loop. When a mount is torn down every file that points at it is
//! invalidated in place and later operations observe `ENODEV`.

use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicPtr, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::error;

use crate::constants::{FD_TABLE_SIZE, FD_TAG};
use crate::error::{Errno, Result};
use crate::mount::MountRecord;

/// Mutable half of a file handle, guarded by the handle rwlock.
pub struct FileState {
    /// Inode assigned by the daemon; -1 once closed or invalidated.
    pub inode: i64,
    /// Copy of the owning mount's connection at open time; -1 once the
    /// mount is torn down.
    pub conn_id: i32,
    /// Opaque per-open payload echoed on every request.
    pub common_pl: u64,
    /// Owning mount; cleared by `invalidate_by_mount`.
    pub mp: Option<Arc<MountRecord>>,
}

/// One open file.
pub struct FileHandle {
    fd: AtomicI32,
    /// Open flags, fixed for the life of the handle.
    pub flags: i32,
    /// File position. Serialized by `lseek_lock`; atomic for
    /// visibility across position readers.
    pub offset: AtomicI64,
    lseek_lock: Mutex<()>,
    state: RwLock<FileState>,
}

impl FileHandle {
    pub fn new(flags: i32) -> Arc<Self> {
        Arc::new(Self {
            fd: AtomicI32::new(-1),
            flags,
            offset: AtomicI64::new(0),
            lseek_lock: Mutex::new(()),
            state: RwLock::new(FileState {
                inode: -1,
                conn_id: -1,
                common_pl: 0,
                mp: None,
            }),
        })
    }

    pub fn fd(&self) -> i32 {
        self.fd.load(Ordering::Acquire)
    }

    pub fn read(&self) -> RwLockReadGuard<'_, FileState> {
        self.state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, FileState> {
        self.state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Serializes position-bearing reads/writes and lseek against each
    /// other.
    pub fn lseek_guard(&self) -> MutexGuard<'_, ()> {
        self.lseek_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

enum FdSlot {
    Free { next: i32 },
    Used { file: Arc<FileHandle>, refcnt: u32 },
}

struct FdTableInner {
    slots: Vec<FdSlot>,
    free_head: i32,
    open_count: usize,
}

/// Process-wide fd table.
pub struct FdTable {
    inner: Mutex<FdTableInner>,
}

static FD_TABLE: AtomicPtr<FdTable> = AtomicPtr::new(ptr::null_mut());

/// The process fd table singleton.
pub fn table() -> &'static FdTable {
    let p = FD_TABLE.load(Ordering::Acquire);
    if !p.is_null() {
        return unsafe { &*p };
    }
    let new = Box::into_raw(Box::new(FdTable::new()));
    match FD_TABLE.compare_exchange(ptr::null_mut(), new, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => unsafe { &*new },
        Err(cur) => {
            drop(unsafe { Box::from_raw(new) });
            unsafe { &*cur }
        }
    }
}

/// Reset the fd table in a forked child. Parent handles are abandoned.
pub(crate) fn atfork_child_reset() {
    FD_TABLE.store(Box::into_raw(Box::new(FdTable::new())), Ordering::Release);
}

/// Tag a raw table index for the application.
pub fn fd_make(fd: i32) -> i32 {
    fd | FD_TAG
}

/// True when the application fd carries the SDK tag.
pub fn fd_is_valid(fd: i32) -> bool {
    fd >= 0 && fd & FD_TAG != 0
}

/// Strip the SDK tag.
pub fn fd_raw(fd: i32) -> i32 {
    fd & !FD_TAG
}

impl FdTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(FdTableInner {
                slots: Vec::new(),
                free_head: -1,
                open_count: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FdTableInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Number of live entries.
    pub fn open_count(&self) -> usize {
        self.lock().open_count
    }

    /// Allocate a slot for `file`, storing the fd into the handle.
    pub fn alloc(&self, file: &Arc<FileHandle>) -> Result<i32> {
        let mut inner = self.lock();

        let fd = if inner.free_head >= 0 {
            let fd = inner.free_head;
            match inner.slots[fd as usize] {
                FdSlot::Free { next } => inner.free_head = next,
                FdSlot::Used { .. } => {
                    error!("fd free list corrupt at {}", fd);
                    return Err(Errno::EMFILE);
                }
            }
            fd
        } else if inner.slots.len() < FD_TABLE_SIZE {
            inner.slots.push(FdSlot::Free { next: -1 });
            inner.slots.len() as i32 - 1
        } else {
            error!("fd table exhausted ({} slots)", FD_TABLE_SIZE);
            return Err(Errno::EMFILE);
        };

        inner.slots[fd as usize] = FdSlot::Used {
            file: file.clone(),
            refcnt: 0,
        };
        inner.open_count += 1;
        file.fd.store(fd, Ordering::Release);
        Ok(fd)
    }

    /// Borrow the handle at `fd`, bumping its borrow count. The caller
    /// locks the handle (after its mount, per the lock ranking) and
    /// pairs this with [`Self::put`].
    pub fn get(&self, fd: i32) -> Result<Arc<FileHandle>> {
        if fd < 0 || fd as usize >= FD_TABLE_SIZE {
            return Err(Errno::EBADF);
        }
        let mut inner = self.lock();
        match inner.slots.get_mut(fd as usize) {
            Some(FdSlot::Used { file, refcnt }) => {
                *refcnt += 1;
                Ok(file.clone())
            }
            _ => Err(Errno::EBADF),
        }
    }

    /// Return a borrow taken with [`Self::get`]. All of the caller's
    /// handle and mount guards must already be dropped.
    pub fn put(&self, file: &Arc<FileHandle>) {
        let fd = file.fd();
        let mut inner = self.lock();
        if let Some(FdSlot::Used { refcnt, .. }) = inner.slots.get_mut(fd as usize) {
            *refcnt = refcnt.saturating_sub(1);
        }
    }

    /// Release the slot if the caller is the only borrower, else
    /// `EAGAIN` (the caller puts its borrow back and retries).
    pub fn close(&self, file: &Arc<FileHandle>) -> Result<()> {
        let fd = file.fd();
        if fd < 0 || fd as usize >= FD_TABLE_SIZE {
            return Err(Errno::EBADF);
        }

        let mut inner = self.lock();
        match inner.slots.get_mut(fd as usize) {
            Some(FdSlot::Used { refcnt, .. }) => {
                if *refcnt > 1 {
                    return Err(Errno::EAGAIN);
                }
            }
            _ => return Err(Errno::EBADF),
        }

        let next = inner.free_head;
        inner.slots[fd as usize] = FdSlot::Free { next };
        inner.free_head = fd;
        inner.open_count -= 1;
        Ok(())
    }

    /// Detach every file belonging to `mp`. Subsequent operations on
    /// those fds observe `mp == None` and fail with `ENODEV`; `close`
    /// still succeeds.
    ///
    /// Candidates are collected first and their locks taken after the
    /// table mutex is released: `close` holds a file write lock while
    /// taking the table mutex, so touching file locks under the mutex
    /// would invert that order.
    pub fn invalidate_by_mount(&self, mp: &Arc<MountRecord>) {
        let candidates: Vec<Arc<FileHandle>> = {
            let inner = self.lock();
            inner
                .slots
                .iter()
                .filter_map(|slot| match slot {
                    FdSlot::Used { file, .. } => Some(file.clone()),
                    _ => None,
                })
                .collect()
        };

        for file in candidates {
            let mut st = file.write();
            if let Some(m) = &st.mp {
                if Arc::ptr_eq(m, mp) {
                    st.conn_id = -1;
                    st.mp = None;
                }
            }
        }
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}
