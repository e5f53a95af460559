//! The POSIX-like SDK facade.
//!
//! Applications mount PBDs and operate on `/pbd/...` paths and tagged
//! file descriptors. Every entry point follows the same skeleton:
//! validate arguments, resolve the mount, perform the request through
//! the channel, loop on internal `EAGAIN`, and translate the result
//! into the public errno namespace.

pub mod dir;
pub(crate) mod request;

use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tracing::{debug, error, info, warn};
use zerocopy::FromBytes;

use crate::chnl::channel;
use crate::chnl::protocol::{FileStat, OpType, RequestEntry, OFF_CURRENT};
use crate::constants::{
    CONNECT_TIMEOUT_MS, DEFAULT_LOCK_DIR, DEFAULT_SHM_DIR, IOSIZE_MAX, PATHLEN_MAX,
    REMOUNT_TIMEOUT_MS,
};
use crate::error::{to_public, Errno, Result};
use crate::fdtable::{fd_is_valid, fd_make, fd_raw, table, FileHandle};
use crate::mount::{mntflags, registry, validate_flags, writable, MountRecord, MountState};
use crate::path;

pub use dir::{Dir, Dirent, DirentPlus};
use request::{local_lseek, remote_lseek_end, submit, file_pread, file_pwrite, FileCtx, Payload};

/// Threading model of the embedding application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Multiple threads in one process share the SDK state.
    Threads,
    /// The application forks; children reinitialize via atfork.
    Process,
}

#[derive(Clone)]
struct Settings {
    mode: Mode,
    svr_addr: PathBuf,
    connect_timeout: Duration,
    lock_dir: PathBuf,
}

static SETTINGS: OnceLock<Mutex<Settings>> = OnceLock::new();

fn settings() -> &'static Mutex<Settings> {
    SETTINGS.get_or_init(|| {
        Mutex::new(Settings {
            mode: Mode::Process,
            svr_addr: PathBuf::from(DEFAULT_SHM_DIR),
            connect_timeout: Duration::from_millis(CONNECT_TIMEOUT_MS),
            lock_dir: PathBuf::from(DEFAULT_LOCK_DIR),
        })
    })
}

fn settings_snapshot() -> Settings {
    settings()
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .clone()
}

/// Select the process/thread model. Affects whether fork handlers are
/// installed at the first mount.
pub fn set_mode(mode: Mode) {
    settings()
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .mode = mode;
}

/// Directory where daemon regions live (one `<pbd>.shm` per PBD).
pub fn set_svr_addr<P: AsRef<Path>>(addr: P) {
    let addr = addr.as_ref();
    if addr.as_os_str().len() >= PATHLEN_MAX {
        error!("svr addr too long: {}", addr.display());
        return;
    }
    settings()
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .svr_addr = addr.to_path_buf();
}

/// Channel connect timeout in milliseconds. Out-of-range values are
/// ignored.
pub fn set_connect_timeout(timeout_ms: i32) {
    if timeout_ms <= 0 || timeout_ms > 24 * 3600 * 1000 {
        return;
    }
    settings()
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .connect_timeout = Duration::from_millis(timeout_ms as u64);
}

/// Directory for node-local fence files.
pub fn set_lock_dir<P: AsRef<Path>>(dir: P) {
    settings()
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .lock_dir = dir.as_ref().to_path_buf();
}

// Process-wide serializers. Rebuilt (not unlocked) in a forked child.
static INIT_MTX: AtomicPtr<Mutex<()>> = AtomicPtr::new(ptr::null_mut());
static UNLINK_MTX: AtomicPtr<Mutex<()>> = AtomicPtr::new(ptr::null_mut());
static RENAME_MTX: AtomicPtr<Mutex<()>> = AtomicPtr::new(ptr::null_mut());

fn op_mutex(cell: &AtomicPtr<Mutex<()>>) -> &'static Mutex<()> {
    let p = cell.load(Ordering::Acquire);
    if !p.is_null() {
        return unsafe { &*p };
    }
    let new = Box::into_raw(Box::new(Mutex::new(())));
    match cell.compare_exchange(ptr::null_mut(), new, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => unsafe { &*new },
        Err(cur) => {
            drop(unsafe { Box::from_raw(new) });
            unsafe { &*cur }
        }
    }
}

fn reset_op_mutexes() {
    for cell in [&INIT_MTX, &UNLINK_MTX, &RENAME_MTX] {
        cell.store(Box::into_raw(Box::new(Mutex::new(()))), Ordering::Release);
    }
}

extern "C" fn atfork_child_trampoline() {
    atfork_child_post();
}

/// Reinitialize all process-wide SDK state in a forked child. Locks and
/// slot claims held by the parent are not released; the child must
/// mount again to regain access.
pub fn atfork_child_post() {
    path::atfork_child_reset();
    crate::fdtable::atfork_child_reset();
    crate::chnl::client::atfork_child_reset();
    crate::mount::atfork_child_reset();
    reset_op_mutexes();
}

static ATFORK_ONCE: OnceLock<()> = OnceLock::new();

fn sdk_init_once(mode: Mode) {
    if mode == Mode::Process {
        ATFORK_ONCE.get_or_init(|| {
            unsafe {
                libc::pthread_atfork(None, None, Some(atfork_child_trampoline));
            }
        });
    }
}

/// Retry the operation while it reports the internal `EAGAIN` signal.
fn retry_eagain<T>(mut f: impl FnMut() -> Result<T>) -> Result<T> {
    loop {
        match f() {
            Err(Errno::EAGAIN) => continue,
            r => return r,
        }
    }
}

/// Map an internal result into the public errno namespace, logging
/// failures. `ENOENT` is routine for probe-style calls and is logged at
/// debug only.
fn publish<T>(op: &str, detail: &str, r: Result<T>) -> Result<T> {
    match r {
        Ok(v) => Ok(v),
        Err(e) => {
            let e = to_public(e);
            if e == Errno::ENOENT {
                debug!("{} {}: {}", op, detail, e);
            } else {
                error!("{} {} failed: {}", op, detail, e);
            }
            Err(e)
        }
    }
}

/// Resolve a user path and hand the read-locked owning mount to `f`.
fn with_named_mount<R>(
    pbdpath: &str,
    f: impl FnOnce(&Arc<MountRecord>, &MountState, &str) -> Result<R>,
) -> Result<R> {
    let abs = path::resolve(pbdpath)?;
    let pbd = path::pbd_name_of(&abs)?.to_string();
    registry().with_mount_read(&pbd, |rec, st| f(rec, st, &abs))?
}

/// Borrow the file behind a tagged fd, lock its mount (read) and the
/// handle, and run `f` with a snapshot of the file identity.
fn with_file<R>(ufd: i32, f: impl FnOnce(&FileHandle, &FileCtx) -> Result<R>) -> Result<R> {
    if !fd_is_valid(ufd) {
        return Err(Errno::EBADF);
    }
    let fd = fd_raw(ufd);
    let file = table().get(fd)?;

    let mp = { file.read().mp.clone() };
    let mp = match mp {
        Some(mp) => mp,
        None => {
            table().put(&file);
            return Err(Errno::ENODEV);
        }
    };

    let mst = mp.read();
    let fst = file.read();
    if fst.mp.is_none() {
        drop(fst);
        drop(mst);
        table().put(&file);
        return Err(Errno::ENODEV);
    }
    let ctx = FileCtx {
        conn_id: fst.conn_id,
        ino: fst.inode,
        common_pl: fst.common_pl,
        flags: file.flags,
        writable: writable(mst.flags),
    };

    let r = f(&file, &ctx);

    drop(fst);
    drop(mst);
    table().put(&file);
    r
}

// ---------------------------------------------------------------------
// Mount family
// ---------------------------------------------------------------------

/// Mount a PBD. `flags` is a [`mntflags`] mask; `WR` implies `RD` and a
/// writer fences its hostid on the node before connecting.
pub fn mount(cluster: &str, pbd: &str, hostid: i32, flags: u32) -> Result<()> {
    let _ = cluster;
    publish("mount", pbd, do_mount(pbd, hostid, flags))
}

fn do_mount(pbd: &str, hostid: i32, flags: u32) -> Result<()> {
    let flags = validate_flags(flags)?;
    if pbd.is_empty() {
        return Err(Errno::EINVAL);
    }

    let cfg = settings_snapshot();
    sdk_init_once(cfg.mode);
    info!(
        "mount PBD({}) hostid({}) flags({:#x})",
        pbd, hostid, flags
    );
    if flags & mntflags::LOG != 0 {
        info!("mount log flavor requested for {}", pbd);
    }

    let prep = {
        let _g = op_mutex(&INIT_MTX)
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if registry().exists(pbd) || registry().in_progress(pbd) {
            error!("pbd {} is already mounted", pbd);
            return Err(Errno::EBUSY);
        }
        let prep = registry().prepare(&cfg.lock_dir, pbd, hostid, flags)?;
        registry().add_in_progress(pbd);
        prep
    };

    // The connect can take seconds; other mounts proceed meanwhile.
    let conn = channel().connect(&cfg.svr_addr, pbd, cfg.connect_timeout);

    let _g = op_mutex(&INIT_MTX)
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    registry().remove_in_progress(pbd);
    match conn {
        Ok(conn_id) => {
            prep.post(registry(), Some(conn_id));
            drop(_g);
            if flags & mntflags::AUTO_INCREASE_EPOCH != 0 && writable(flags) {
                if let Err(e) = do_pbd_ctl(pbd, OpType::IncreaseEpoch) {
                    warn!("auto increase epoch for {} failed: {}", pbd, e);
                }
            }
            info!("mount success for {}", pbd);
            Ok(())
        }
        Err(e) => {
            error!("channel connect failed for {}: {}", pbd, e);
            prep.post(registry(), None);
            Err(e.errno())
        }
    }
}

/// Unmount a PBD, invalidating every fd opened through it.
pub fn umount(pbd: &str) -> Result<()> {
    publish("umount", pbd, do_umount(pbd, false))
}

/// Unmount even when the daemon no longer answers.
pub fn umount_force(pbd: &str) -> Result<()> {
    publish("umount_force", pbd, do_umount(pbd, true))
}

fn do_umount(pbd: &str, force: bool) -> Result<()> {
    info!("umount {} force {}", pbd, force);
    loop {
        let rec = registry().find(pbd).ok_or(Errno::ENODEV)?;
        let mut st = rec.write();
        if !st.on_list {
            drop(st);
            continue;
        }

        channel().close(st.conn_id, force).map_err(|e| e.errno())?;
        table().invalidate_by_mount(&rec);
        st.hostid_lock.take();
        st.conn_id = -1;
        st.on_list = false;
        drop(st);
        registry().unregister(&rec);
        info!("umount success for {}", pbd);
        return Ok(());
    }
}

/// Upgrade a read-only mount to read/write. Must quote the original
/// hostid; the connection is kept.
pub fn remount(cluster: &str, pbd: &str, hostid: i32, flags: u32) -> Result<()> {
    let _ = cluster;
    publish("remount", pbd, do_remount(pbd, hostid, flags))
}

fn do_remount(pbd: &str, hostid: i32, flags: u32) -> Result<()> {
    let flags = validate_flags(flags)?;
    if flags & mntflags::TOOL != 0 || flags & mntflags::WR == 0 {
        error!("invalid remount flags {:#x}", flags);
        return Err(Errno::EINVAL);
    }
    let cfg = settings_snapshot();

    loop {
        let rec = registry().find(pbd).ok_or(Errno::ENODEV)?;
        let mut st = rec.write();
        if !st.on_list {
            drop(st);
            continue;
        }

        if hostid != rec.host_id {
            error!("remount with hostid {}, expect {}", hostid, rec.host_id);
            return Err(Errno::EINVAL);
        }
        if writable(st.flags) {
            error!("remount not needed, already rw: {:#x}", st.flags);
            return Err(Errno::EINVAL);
        }

        let lock = crate::fence::acquire(&cfg.lock_dir, pbd, hostid)?;
        channel()
            .reconnect(st.conn_id, pbd, Duration::from_millis(REMOUNT_TIMEOUT_MS))
            .map_err(|e| e.errno())?;
        st.hostid_lock = Some(lock);
        st.flags = flags;
        info!("remount success for {}", pbd);
        return Ok(());
    }
}

fn do_pbd_ctl(pbd: &str, op: OpType) -> Result<()> {
    registry().with_mount_read(pbd, |_rec, st| {
        let req = RequestEntry::new(op);
        let (rsp, _) = submit(st.conn_id, req, Payload::None, 0, true)?;
        if !rsp.is_ok() {
            return Err(Errno(rsp.error));
        }
        Ok(())
    })?
}

/// Grow the filesystem to use an enlarged device.
pub fn mount_growfs(pbd: &str) -> Result<()> {
    info!("growfs for {}", pbd);
    publish("growfs", pbd, do_pbd_ctl(pbd, OpType::Growfs))
}

/// Bump the write epoch, fencing off stale writers.
pub fn increase_epoch(pbd: &str) -> Result<()> {
    info!("increase epoch for {}", pbd);
    publish("increase_epoch", pbd, do_pbd_ctl(pbd, OpType::IncreaseEpoch))
}

/// Cancel outstanding requests submitted by `pid` on every mount.
pub fn abort_request(pid: u32) -> Result<()> {
    let rc = registry().for_each(|rec| {
        let st = rec.read();
        match channel().abort(st.conn_id, pid) {
            Ok(()) => 0,
            Err(_) => 1,
        }
    });
    if rc != 0 {
        return Err(Errno::EIO);
    }
    Ok(())
}

// ---------------------------------------------------------------------
// File family
// ---------------------------------------------------------------------

/// Open (and possibly create) a file, returning a tagged fd.
pub fn open(pbdpath: &str, flags: i32, mode: u32) -> Result<i32> {
    publish(
        "open",
        pbdpath,
        retry_eagain(|| do_open(pbdpath, flags, mode)),
    )
}

fn do_open(pbdpath: &str, flags: i32, mode: u32) -> Result<i32> {
    with_named_mount(pbdpath, |rec, mst, abs| {
        if flags & (libc::O_CREAT | libc::O_TRUNC) != 0 && !writable(mst.flags) {
            return Err(Errno::EROFS);
        }

        let file = FileHandle::new(flags);
        let fd = table().alloc(&file)?;

        let mut req = RequestEntry::new(OpType::Open);
        req.flags = flags as u32;
        req.mode = mode;

        let outcome = submit(mst.conn_id, req, Payload::Path(abs), 0, true)
            .and_then(|(rsp, _)| if rsp.res < 0 { Err(Errno(rsp.error)) } else { Ok(rsp) });

        match outcome {
            Ok(rsp) => {
                {
                    let mut fst = file.write();
                    fst.inode = rsp.res;
                    fst.conn_id = mst.conn_id;
                    fst.common_pl = rsp.common_pl;
                    fst.mp = Some(rec.clone());
                }
                file.offset.store(rsp.aux, Ordering::Release);
                if flags & libc::O_CREAT != 0 {
                    info!("open {} with ino {}, fd {}", abs, rsp.res, fd);
                }
                Ok(fd_make(fd))
            }
            Err(e) => {
                let _ = table().close(&file);
                Err(e)
            }
        }
    })
}

/// `open(path, O_CREAT | O_TRUNC | O_WRONLY, mode)`.
pub fn creat(pbdpath: &str, mode: u32) -> Result<i32> {
    open(pbdpath, libc::O_CREAT | libc::O_TRUNC | libc::O_WRONLY, mode)
}

/// Close a tagged fd. Succeeds even after the owning mount is gone.
pub fn close(ufd: i32) -> Result<()> {
    publish("close", "", retry_eagain(|| do_close(ufd)))
}

fn do_close(ufd: i32) -> Result<()> {
    if !fd_is_valid(ufd) {
        return Err(Errno::EBADF);
    }
    let fd = fd_raw(ufd);

    let file = table().get(fd)?;
    let guard = file.write();
    match table().close(&file) {
        Ok(()) => {
            drop(guard);
            Ok(())
        }
        Err(e) => {
            drop(guard);
            table().put(&file);
            // EAGAIN feeds the facade retry loop.
            Err(e)
        }
    }
}

/// Position-bearing read; advances the file offset.
pub fn read(ufd: i32, buf: &mut [u8]) -> Result<usize> {
    publish("read", "", retry_eagain(|| do_read(ufd, buf)))
}

fn do_read(ufd: i32, buf: &mut [u8]) -> Result<usize> {
    with_file(ufd, |file, ctx| {
        let _lg = file.lseek_guard();
        let mut total = 0usize;
        while total < buf.len() {
            let chunk = (buf.len() - total).min(IOSIZE_MAX);
            let off = file.offset.load(Ordering::Acquire);
            match file_pread(ctx, &mut buf[total..total + chunk], off) {
                Ok(0) => break,
                Ok(n) => {
                    file.offset.fetch_add(n as i64, Ordering::AcqRel);
                    total += n;
                }
                Err(e) => {
                    if total > 0 {
                        break;
                    }
                    return Err(e);
                }
            }
        }
        Ok(total)
    })
}

/// Positional read; the file offset is untouched.
pub fn pread(ufd: i32, buf: &mut [u8], off: i64) -> Result<usize> {
    publish("pread", "", retry_eagain(|| do_pread(ufd, buf, off)))
}

fn do_pread(ufd: i32, buf: &mut [u8], off: i64) -> Result<usize> {
    with_file(ufd, |_file, ctx| {
        let mut total = 0usize;
        while total < buf.len() {
            let chunk = (buf.len() - total).min(IOSIZE_MAX);
            match file_pread(ctx, &mut buf[total..total + chunk], off + total as i64) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) => {
                    if total > 0 {
                        break;
                    }
                    return Err(e);
                }
            }
        }
        Ok(total)
    })
}

/// Position-bearing write; advances the file offset. `O_APPEND`
/// handles append atomically at end-of-file.
pub fn write(ufd: i32, buf: &[u8]) -> Result<usize> {
    publish("write", "", retry_eagain(|| do_write(ufd, buf)))
}

fn do_write(ufd: i32, buf: &[u8]) -> Result<usize> {
    with_file(ufd, |file, ctx| {
        let _lg = file.lseek_guard();
        write_chunks(file, ctx, buf, OFF_CURRENT)
    })
}

/// Positional write. On an `O_APPEND` fd the offset argument is
/// ignored and the write appends, with the position serialized.
pub fn pwrite(ufd: i32, buf: &[u8], off: i64) -> Result<usize> {
    publish("pwrite", "", retry_eagain(|| do_pwrite(ufd, buf, off)))
}

fn do_pwrite(ufd: i32, buf: &[u8], off: i64) -> Result<usize> {
    if off < 0 {
        return Err(Errno::EINVAL);
    }
    with_file(ufd, |file, ctx| {
        let _lg = if ctx.flags & libc::O_APPEND != 0 {
            Some(file.lseek_guard())
        } else {
            None
        };
        let mut total = 0usize;
        while total < buf.len() {
            let chunk = (buf.len() - total).min(IOSIZE_MAX);
            match file_pwrite(ctx, file, &buf[total..total + chunk], off + total as i64) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) => {
                    if total > 0 {
                        break;
                    }
                    return Err(e);
                }
            }
        }
        Ok(total)
    })
}

fn write_chunks(file: &FileHandle, ctx: &FileCtx, buf: &[u8], base: i64) -> Result<usize> {
    let mut total = 0usize;
    while total < buf.len() {
        let chunk = (buf.len() - total).min(IOSIZE_MAX);
        let off = if base == OFF_CURRENT {
            OFF_CURRENT
        } else {
            base + total as i64
        };
        match file_pwrite(ctx, file, &buf[total..total + chunk], off) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) => {
                if total > 0 {
                    break;
                }
                return Err(e);
            }
        }
    }
    Ok(total)
}

/// Gathering position-bearing read.
pub fn readv(ufd: i32, bufs: &mut [std::io::IoSliceMut<'_>]) -> Result<usize> {
    publish("readv", "", retry_eagain(|| do_readv(ufd, bufs)))
}

fn do_readv(ufd: i32, bufs: &mut [std::io::IoSliceMut<'_>]) -> Result<usize> {
    with_file(ufd, |file, ctx| {
        let _lg = file.lseek_guard();
        let mut total = 0usize;
        for buf in bufs.iter_mut() {
            let mut done = 0usize;
            while done < buf.len() {
                let chunk = (buf.len() - done).min(IOSIZE_MAX);
                let off = file.offset.load(Ordering::Acquire);
                match file_pread(ctx, &mut buf[done..done + chunk], off) {
                    Ok(0) => return Ok(total + done),
                    Ok(n) => {
                        file.offset.fetch_add(n as i64, Ordering::AcqRel);
                        done += n;
                    }
                    Err(e) => {
                        if total + done > 0 {
                            return Ok(total + done);
                        }
                        return Err(e);
                    }
                }
            }
            total += done;
        }
        Ok(total)
    })
}

/// Scattering position-bearing write.
pub fn writev(ufd: i32, bufs: &[std::io::IoSlice<'_>]) -> Result<usize> {
    publish("writev", "", retry_eagain(|| do_writev(ufd, bufs)))
}

fn do_writev(ufd: i32, bufs: &[std::io::IoSlice<'_>]) -> Result<usize> {
    with_file(ufd, |file, ctx| {
        let _lg = file.lseek_guard();
        let mut total = 0usize;
        for buf in bufs {
            match write_chunks(file, ctx, buf, OFF_CURRENT) {
                Ok(n) => {
                    total += n;
                    if n < buf.len() {
                        break;
                    }
                }
                Err(e) => {
                    if total > 0 {
                        break;
                    }
                    return Err(e);
                }
            }
        }
        Ok(total)
    })
}

/// Gathering positional read.
pub fn preadv(ufd: i32, bufs: &mut [std::io::IoSliceMut<'_>], off: i64) -> Result<usize> {
    publish("preadv", "", retry_eagain(|| do_preadv(ufd, bufs, off)))
}

fn do_preadv(ufd: i32, bufs: &mut [std::io::IoSliceMut<'_>], off: i64) -> Result<usize> {
    if off < 0 {
        return Err(Errno::EINVAL);
    }
    with_file(ufd, |_file, ctx| {
        let mut total = 0usize;
        for buf in bufs.iter_mut() {
            let mut done = 0usize;
            while done < buf.len() {
                let chunk = (buf.len() - done).min(IOSIZE_MAX);
                match file_pread(
                    ctx,
                    &mut buf[done..done + chunk],
                    off + (total + done) as i64,
                ) {
                    Ok(0) => return Ok(total + done),
                    Ok(n) => done += n,
                    Err(e) => {
                        if total + done > 0 {
                            return Ok(total + done);
                        }
                        return Err(e);
                    }
                }
            }
            total += done;
        }
        Ok(total)
    })
}

/// Scattering positional write.
pub fn pwritev(ufd: i32, bufs: &[std::io::IoSlice<'_>], off: i64) -> Result<usize> {
    publish("pwritev", "", retry_eagain(|| do_pwritev(ufd, bufs, off)))
}

fn do_pwritev(ufd: i32, bufs: &[std::io::IoSlice<'_>], off: i64) -> Result<usize> {
    if off < 0 {
        return Err(Errno::EINVAL);
    }
    with_file(ufd, |file, ctx| {
        let _lg = if ctx.flags & libc::O_APPEND != 0 {
            Some(file.lseek_guard())
        } else {
            None
        };
        let mut total = 0usize;
        for buf in bufs {
            match write_chunks(file, ctx, buf, off + total as i64) {
                Ok(n) => {
                    total += n;
                    if n < buf.len() {
                        break;
                    }
                }
                Err(e) => {
                    if total > 0 {
                        break;
                    }
                    return Err(e);
                }
            }
        }
        Ok(total)
    })
}

/// Write `len` zero bytes at the current position.
pub fn write_zero(ufd: i32, len: usize) -> Result<usize> {
    publish("write_zero", "", retry_eagain(|| do_write_zero(ufd, len)))
}

fn do_write_zero(ufd: i32, len: usize) -> Result<usize> {
    if len == 0 {
        return Ok(0);
    }
    with_file(ufd, |file, ctx| {
        let _lg = file.lseek_guard();
        let zeros = vec![0u8; len.min(IOSIZE_MAX)];
        let mut total = 0usize;
        while total < len {
            let chunk = (len - total).min(zeros.len());
            match file_pwrite(ctx, file, &zeros[..chunk], OFF_CURRENT) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) => {
                    if total > 0 {
                        break;
                    }
                    return Err(e);
                }
            }
        }
        Ok(total)
    })
}

/// Reposition the file offset. `SEEK_SET`/`SEEK_CUR` resolve locally;
/// `SEEK_END` asks the daemon for the authoritative size.
pub fn lseek(ufd: i32, offset: i64, whence: i32) -> Result<i64> {
    publish("lseek", "", retry_eagain(|| do_lseek(ufd, offset, whence)))
}

fn do_lseek(ufd: i32, offset: i64, whence: i32) -> Result<i64> {
    with_file(ufd, |file, ctx| {
        let _lg = file.lseek_guard();
        match local_lseek(file, offset, whence)? {
            Some(new_offset) => Ok(new_offset),
            None => remote_lseek_end(ctx, file, offset),
        }
    })
}

/// Truncate by path.
pub fn truncate(pbdpath: &str, len: i64) -> Result<()> {
    publish("truncate", pbdpath, retry_eagain(|| do_truncate(pbdpath, len)))
}

fn do_truncate(pbdpath: &str, len: i64) -> Result<()> {
    if len < 0 {
        return Err(Errno::EINVAL);
    }
    with_named_mount(pbdpath, |_rec, mst, abs| {
        if !writable(mst.flags) {
            return Err(Errno::EROFS);
        }
        debug!("truncate {} len {}", abs, len);
        let mut req = RequestEntry::new(OpType::Truncate);
        req.length = len as u64;
        let (rsp, _) = submit(mst.conn_id, req, Payload::Path(abs), 0, true)?;
        if !rsp.is_ok() {
            return Err(Errno(rsp.error));
        }
        Ok(())
    })
}

/// Truncate by fd.
pub fn ftruncate(ufd: i32, len: i64) -> Result<()> {
    publish("ftruncate", "", retry_eagain(|| do_ftruncate(ufd, len)))
}

fn do_ftruncate(ufd: i32, len: i64) -> Result<()> {
    if len < 0 {
        return Err(Errno::EINVAL);
    }
    with_file(ufd, |_file, ctx| {
        if !ctx.writable {
            return Err(Errno::EROFS);
        }
        let mut req = RequestEntry::new(OpType::Ftruncate);
        req.ino = ctx.ino;
        req.length = len as u64;
        req.common_pl = ctx.common_pl;
        let (rsp, _) = submit(ctx.conn_id, req, Payload::None, 0, true)?;
        if !rsp.is_ok() {
            return Err(Errno(rsp.error));
        }
        Ok(())
    })
}

/// Preallocate space.
pub fn fallocate(ufd: i32, mode: i32, off: i64, len: i64) -> Result<()> {
    publish(
        "fallocate",
        "",
        retry_eagain(|| do_fallocate(ufd, mode, off, len)),
    )
}

fn do_fallocate(ufd: i32, mode: i32, off: i64, len: i64) -> Result<()> {
    if off < 0 || len <= 0 {
        return Err(Errno::EINVAL);
    }
    with_file(ufd, |_file, ctx| {
        if !ctx.writable {
            return Err(Errno::EROFS);
        }
        debug!("fallocate ino {} off {} len {}", ctx.ino, off, len);
        let mut req = RequestEntry::new(OpType::Fallocate);
        req.ino = ctx.ino;
        req.flags = mode as u32;
        req.offset = off;
        req.length = len as u64;
        req.common_pl = ctx.common_pl;
        let (rsp, _) = submit(ctx.conn_id, req, Payload::None, 0, true)?;
        if !rsp.is_ok() {
            return Err(Errno(rsp.error));
        }
        Ok(())
    })
}

/// `fallocate` with mode 0.
pub fn posix_fallocate(ufd: i32, off: i64, len: i64) -> Result<()> {
    fallocate(ufd, 0, off, len)
}

/// Stat by path.
pub fn stat(pbdpath: &str) -> Result<FileStat> {
    publish("stat", pbdpath, retry_eagain(|| do_stat(pbdpath)))
}

fn do_stat(pbdpath: &str) -> Result<FileStat> {
    with_named_mount(pbdpath, |_rec, mst, abs| {
        let req = RequestEntry::new(OpType::Stat);
        let (rsp, data) = submit(
            mst.conn_id,
            req,
            Payload::Path(abs),
            std::mem::size_of::<FileStat>(),
            true,
        )?;
        if !rsp.is_ok() {
            return Err(Errno(rsp.error));
        }
        FileStat::read_from_bytes(&data).map_err(|_| Errno::EIO)
    })
}

/// Stat by fd.
pub fn fstat(ufd: i32) -> Result<FileStat> {
    publish("fstat", "", retry_eagain(|| do_fstat(ufd)))
}

fn do_fstat(ufd: i32) -> Result<FileStat> {
    with_file(ufd, |_file, ctx| {
        let mut req = RequestEntry::new(OpType::Fstat);
        req.ino = ctx.ino;
        req.common_pl = ctx.common_pl;
        let (rsp, data) = submit(
            ctx.conn_id,
            req,
            Payload::None,
            std::mem::size_of::<FileStat>(),
            true,
        )?;
        if !rsp.is_ok() {
            return Err(Errno(rsp.error));
        }
        FileStat::read_from_bytes(&data).map_err(|_| Errno::EIO)
    })
}

/// No-op: writes are synchronous through the daemon.
pub fn fsync(ufd: i32) -> Result<()> {
    if !fd_is_valid(ufd) {
        return Err(Errno::EBADF);
    }
    Ok(())
}

/// Remove a file.
pub fn unlink(pbdpath: &str) -> Result<()> {
    publish("unlink", pbdpath, retry_eagain(|| do_unlink(pbdpath)))
}

fn do_unlink(pbdpath: &str) -> Result<()> {
    with_named_mount(pbdpath, |_rec, mst, abs| {
        if !writable(mst.flags) {
            return Err(Errno::EROFS);
        }
        let _g = op_mutex(&UNLINK_MTX)
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        debug!("unlink {}", abs);
        let req = RequestEntry::new(OpType::Unlink);
        let (rsp, _) = submit(mst.conn_id, req, Payload::Path(abs), 0, true)?;
        if !rsp.is_ok() {
            return Err(Errno(rsp.error));
        }
        Ok(())
    })
}

/// Rename within one PBD.
pub fn rename(oldpath: &str, newpath: &str) -> Result<()> {
    rename2(oldpath, newpath, 0)
}

/// Rename with flags; only `RENAME_NOREPLACE` is recognized.
pub fn rename2(oldpath: &str, newpath: &str, flags: u32) -> Result<()> {
    publish(
        "rename",
        oldpath,
        retry_eagain(|| do_rename(oldpath, newpath, flags)),
    )
}

fn do_rename(oldpath: &str, newpath: &str, flags: u32) -> Result<()> {
    if flags & !libc::RENAME_NOREPLACE != 0 {
        return Err(Errno::EINVAL);
    }

    let old_abs = path::resolve(oldpath)?;
    let new_abs = path::resolve(newpath)?;
    let old_pbd = path::pbd_name_of(&old_abs)?.to_string();
    let new_pbd = path::pbd_name_of(&new_abs)?.to_string();
    if old_pbd != new_pbd {
        error!("rename must stay in one pbd: {} != {}", old_pbd, new_pbd);
        return Err(Errno::EXDEV);
    }

    registry().with_mount_read(&new_pbd, |_rec, mst| {
        if !writable(mst.flags) {
            return Err(Errno::EROFS);
        }
        let _g = op_mutex(&RENAME_MTX)
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut req = RequestEntry::new(OpType::Rename);
        req.flags = flags;
        let (rsp, _) = submit(
            mst.conn_id,
            req,
            Payload::TwoPaths(&old_abs, &new_abs),
            0,
            true,
        )?;
        if !rsp.is_ok() {
            return Err(Errno(rsp.error));
        }
        Ok(())
    })?
}

/// Check accessibility of a path.
pub fn access(pbdpath: &str, amode: i32) -> Result<()> {
    publish("access", pbdpath, retry_eagain(|| do_access(pbdpath, amode)))
}

fn do_access(pbdpath: &str, amode: i32) -> Result<()> {
    if amode != libc::F_OK && amode & (libc::R_OK | libc::W_OK | libc::X_OK) == 0 {
        return Err(Errno::EINVAL);
    }
    with_named_mount(pbdpath, |_rec, mst, abs| {
        if amode & libc::W_OK != 0 && !writable(mst.flags) {
            return Err(Errno::EROFS);
        }
        let mut req = RequestEntry::new(OpType::Access);
        req.flags = amode as u32;
        let (rsp, _) = submit(mst.conn_id, req, Payload::Path(abs), 0, true)?;
        if !rsp.is_ok() {
            return Err(Errno(rsp.error));
        }
        Ok(())
    })
}

/// Accepted and ignored; permissions are not enforced.
pub fn chmod(_pbdpath: &str, _mode: u32) -> Result<()> {
    Ok(())
}

/// Accepted and ignored; permissions are not enforced.
pub fn fchmod(_ufd: i32, _mode: u32) -> Result<()> {
    Ok(())
}

/// Accepted and ignored; ownership is not enforced.
pub fn chown(_pbdpath: &str, _owner: u32, _group: u32) -> Result<()> {
    Ok(())
}

/// Symbolic links are not supported.
pub fn readlink(_pbdpath: &str) -> Result<String> {
    Err(Errno::EINVAL)
}

/// Accepted and ignored. Non-zero flags are refused.
pub fn setxattr(_pbdpath: &str, _name: &str, _value: &[u8], flags: i32) -> Result<()> {
    if flags != 0 {
        return Err(Errno::ENOTSUP);
    }
    Ok(())
}

/// Block mapping is only available to the in-process engine.
pub fn fmap(_ufd: i32) -> Result<()> {
    Err(Errno::ENOSYS)
}

/// Filesystem statistics are only available to the in-process engine.
pub fn statfs(_pbdpath: &str) -> Result<()> {
    Err(Errno::ENOSYS)
}

/// Filesystem statistics are only available to the in-process engine.
pub fn fstatfs(_ufd: i32) -> Result<()> {
    Err(Errno::ENOSYS)
}

// ---------------------------------------------------------------------
// Directory family
// ---------------------------------------------------------------------

/// Create a directory.
pub fn mkdir(pbdpath: &str, mode: u32) -> Result<()> {
    publish("mkdir", pbdpath, retry_eagain(|| do_mkdir(pbdpath, mode)))
}

fn do_mkdir(pbdpath: &str, mode: u32) -> Result<()> {
    with_named_mount(pbdpath, |_rec, mst, abs| {
        if !writable(mst.flags) {
            return Err(Errno::EROFS);
        }
        debug!("mkdir {}", abs);
        let mut req = RequestEntry::new(OpType::Mkdir);
        req.mode = mode;
        let (rsp, _) = submit(mst.conn_id, req, Payload::Path(abs), 0, true)?;
        if !rsp.is_ok() {
            return Err(Errno(rsp.error));
        }
        Ok(())
    })
}

/// Remove an empty directory.
pub fn rmdir(pbdpath: &str) -> Result<()> {
    publish("rmdir", pbdpath, retry_eagain(|| do_rmdir(pbdpath)))
}

fn do_rmdir(pbdpath: &str) -> Result<()> {
    with_named_mount(pbdpath, |_rec, mst, abs| {
        if !writable(mst.flags) {
            return Err(Errno::EROFS);
        }
        debug!("rmdir {}", abs);
        let req = RequestEntry::new(OpType::Rmdir);
        let (rsp, _) = submit(mst.conn_id, req, Payload::Path(abs), 0, true)?;
        if !rsp.is_ok() {
            return Err(Errno(rsp.error));
        }
        Ok(())
    })
}

/// Change the process working directory to a PBD path.
pub fn chdir(pbdpath: &str) -> Result<()> {
    publish("chdir", pbdpath, retry_eagain(|| do_chdir(pbdpath)))
}

fn do_chdir(pbdpath: &str) -> Result<()> {
    with_named_mount(pbdpath, |_rec, mst, abs| {
        let _cg = path::chdir_guard();
        let req = RequestEntry::new(OpType::Chdir);
        let (rsp, _) = submit(mst.conn_id, req, Payload::Path(abs), 0, true)?;
        if !rsp.is_ok() {
            return Err(Errno(rsp.error));
        }
        path::setwd(abs)
    })
}

/// Current working directory.
pub fn getcwd() -> Result<String> {
    publish("getcwd", "", retry_eagain(path::getwd))
}

/// Alias of [`getcwd`].
pub fn getwd() -> Result<String> {
    getcwd()
}

/// Open a directory for iteration.
pub fn opendir(pbdpath: &str) -> Result<Box<Dir>> {
    publish("opendir", pbdpath, retry_eagain(|| do_opendir(pbdpath)))
}

fn do_opendir(pbdpath: &str) -> Result<Box<Dir>> {
    with_named_mount(pbdpath, |_rec, mst, abs| {
        let req = RequestEntry::new(OpType::Opendir);
        let (rsp, _) = submit(mst.conn_id, req, Payload::Path(abs), 0, true)?;
        if !rsp.is_ok() {
            return Err(Errno(rsp.error));
        }
        Ok(Dir::new(mst.conn_id as i64, rsp.res, rsp.aux as u64))
    })
}

/// Next directory entry; `None` at end of directory.
pub fn readdir(dirp: &mut Dir) -> Result<Option<Dirent>> {
    publish("readdir", "", retry_eagain(|| dirp.next_entry()))
}

/// Re-entrant flavor: fills `entry`, returns whether one was read.
pub fn readdir_r(dirp: &mut Dir, entry: &mut Dirent) -> Result<bool> {
    match readdir(dirp)? {
        Some(ent) => {
            *entry = ent;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Next entry with its stat record.
pub fn readdirplus(dirp: &mut Dir) -> Result<Option<DirentPlus>> {
    publish("readdirplus", "", retry_eagain(|| do_readdirplus(dirp)))
}

fn do_readdirplus(dirp: &mut Dir) -> Result<Option<DirentPlus>> {
    let ent = match dirp.next_entry()? {
        Some(ent) => ent,
        None => return Ok(None),
    };
    let mut req = RequestEntry::new(OpType::Fstat);
    req.ino = ent.d_ino as i64;
    let (rsp, data) = submit(
        dirp.conn_id(),
        req,
        Payload::None,
        std::mem::size_of::<FileStat>(),
        true,
    )?;
    if !rsp.is_ok() {
        return Err(Errno(rsp.error));
    }
    let stat = FileStat::read_from_bytes(&data).map_err(|_| Errno::EIO)?;
    Ok(Some(DirentPlus { dirent: ent, stat }))
}

/// Release a directory iterator.
pub fn closedir(dirp: Box<Dir>) -> Result<()> {
    drop(dirp);
    Ok(())
}

/// Disk usage of a file or directory tree, in bytes. `printer` receives
/// `(path, bytes)` for every file when `all` is set and for directories
/// down to `depth` levels.
pub fn du(
    pbdpath: &str,
    all: bool,
    depth: i32,
    printer: &mut dyn FnMut(&str, i64),
) -> Result<i64> {
    publish("du", pbdpath, retry_eagain(|| do_du(pbdpath, all, depth, printer)))
}

fn do_du(
    pbdpath: &str,
    all: bool,
    depth: i32,
    printer: &mut dyn FnMut(&str, i64),
) -> Result<i64> {
    let abs = path::resolve(pbdpath)?;
    let st = do_stat(&abs)?;
    if st.is_file() {
        printer(&abs, st.size);
        return Ok(st.size);
    }
    let total = du_walk(&abs, all, depth, 1, printer)?;
    printer(&abs, total);
    Ok(total)
}

fn du_walk(
    abs: &str,
    all: bool,
    depth: i32,
    level: i32,
    printer: &mut dyn FnMut(&str, i64),
) -> Result<i64> {
    let mut dirp = do_opendir(abs)?;
    let mut total = 0i64;
    while let Some(dp) = do_readdirplus(&mut dirp)? {
        let child = format!("{}/{}", abs.trim_end_matches('/'), dp.dirent.d_name);
        if dp.stat.is_dir() {
            let sub = du_walk(&child, all, depth, level + 1, printer)?;
            if level < depth {
                printer(&child, sub);
            }
            total += sub;
        } else {
            if all {
                printer(&child, dp.stat.size);
            }
            total += dp.stat.size;
        }
    }
    Ok(total)
}
