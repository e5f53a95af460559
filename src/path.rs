//! Path handling for the SDK.
//!
//! Every name-based operation starts here: relative paths are joined
//! with the process working directory, the result is normalized into
//! the canonical `/pbd/...` form, and the PBD name is extracted to
//! locate the owning mount.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock};

use crate::constants::{NAMELEN_MAX, PATHLEN_MAX};
use crate::error::{Errno, Result};

/// Process working directory. Empty until the first successful chdir.
static CWD: AtomicPtr<RwLock<String>> = AtomicPtr::new(ptr::null_mut());

/// Serializes chdir against itself; path resolution inside a chdir must
/// not observe a half-updated working directory.
static CHDIR_MTX: AtomicPtr<Mutex<()>> = AtomicPtr::new(ptr::null_mut());

fn global<T>(cell: &AtomicPtr<T>, fresh: impl FnOnce() -> T) -> &'static T {
    let p = cell.load(Ordering::Acquire);
    if !p.is_null() {
        return unsafe { &*p };
    }
    let new = Box::into_raw(Box::new(fresh()));
    match cell.compare_exchange(ptr::null_mut(), new, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => unsafe { &*new },
        Err(cur) => {
            drop(unsafe { Box::from_raw(new) });
            unsafe { &*cur }
        }
    }
}

fn cwd() -> &'static RwLock<String> {
    global(&CWD, || RwLock::new(String::new()))
}

fn chdir_mtx() -> &'static Mutex<()> {
    global(&CHDIR_MTX, || Mutex::new(()))
}

/// Reinitialize path state in a forked child. Locks held by parent
/// threads cannot be released here; the old state is abandoned.
pub(crate) fn atfork_child_reset() {
    CWD.store(
        Box::into_raw(Box::new(RwLock::new(String::new()))),
        Ordering::Release,
    );
    CHDIR_MTX.store(Box::into_raw(Box::new(Mutex::new(()))), Ordering::Release);
}

/// Hold this guard across the full chdir sequence (daemon request,
/// normalization, working-directory store).
pub(crate) fn chdir_guard() -> MutexGuard<'static, ()> {
    chdir_mtx()
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Current working directory, or `ENOENT` when none has been set.
pub fn getwd() -> Result<String> {
    let wd = cwd()
        .read()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    if wd.is_empty() {
        return Err(Errno::ENOENT);
    }
    Ok(wd.clone())
}

/// Replace the working directory with an already-normalized path.
pub(crate) fn setwd(path: &str) -> Result<()> {
    if path.len() >= PATHLEN_MAX {
        return Err(Errno::ENAMETOOLONG);
    }
    let mut wd = cwd()
        .write()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    wd.clear();
    wd.push_str(path);
    Ok(())
}

/// Build a full path: absolute input is taken as-is, relative input is
/// prefixed with the working directory.
pub fn make_absolute(path: &str) -> Result<String> {
    if path.is_empty() {
        return Err(Errno::EINVAL);
    }

    let abs = if path.starts_with('/') {
        path.to_string()
    } else {
        let wd = getwd()?;
        format!("{}/{}", wd, path)
    };

    if abs.len() >= PATHLEN_MAX {
        return Err(Errno::ENAMETOOLONG);
    }
    Ok(abs)
}

/// Canonicalize an absolute path: drop `.`, resolve `..` (never above
/// the PBD segment), collapse slashes. A bare `/pbd` becomes `/pbd/`.
pub fn normalize(path: &str) -> Result<String> {
    let mut parts: Vec<&str> = Vec::new();

    for name in path.split('/') {
        if name.is_empty() || name == "." {
            continue;
        }
        if name.len() >= NAMELEN_MAX {
            return Err(Errno::ENAMETOOLONG);
        }
        if name == ".." {
            if parts.len() > 1 {
                parts.pop();
            }
            continue;
        }
        parts.push(name);
    }

    if parts.is_empty() {
        return Err(Errno::EINVAL);
    }

    let mut out = String::with_capacity(path.len() + 1);
    for name in &parts {
        out.push('/');
        out.push_str(name);
    }
    if parts.len() == 1 {
        out.push('/');
    }
    Ok(out)
}

/// Absolute + normalized in one step; what every name-based SDK entry
/// point feeds the wire.
pub fn resolve(path: &str) -> Result<String> {
    normalize(&make_absolute(path)?)
}

/// First segment of an absolute path, i.e. the PBD name.
pub fn pbd_name_of(path: &str) -> Result<&str> {
    path.split('/')
        .find(|s| !s.is_empty())
        .ok_or(Errno::EINVAL)
}
