//! Node-local fencing locks.
//!
//! A writer with hostid N holds an advisory write lock on the byte
//! range `[N*1024, (N+1)*1024)` of `<lockdir>/<pbd>-paxos-hostid`;
//! hostid 0 (mkfs/growfs) locks the whole file. The lock lives for the
//! whole mount and is what makes "one writer per hostid per PBD" hold
//! across processes on the node.

use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};

use tracing::{debug, error};

use crate::constants::FLK_LEN;
use crate::error::{Errno, Result};

/// A held fence lock. Dropping it closes the fd, which releases the
/// locked region under POSIX advisory-lock semantics.
#[derive(Debug)]
pub struct FenceLock {
    fd: OwnedFd,
    pbd: String,
    hostid: i32,
}

fn fence_file(lock_dir: &Path, pbd: &str) -> PathBuf {
    lock_dir.join(format!("{}-paxos-hostid", pbd))
}

/// Take the hostid fence lock for `pbd`.
///
/// Any open or lock failure is reported as `EACCES`; the mount prepare
/// path turns persistent `EACCES` into `ETIMEDOUT` after its retry
/// window.
pub fn acquire(lock_dir: &Path, pbd: &str, hostid: i32) -> Result<FenceLock> {
    if std::fs::create_dir_all(lock_dir).is_err() {
        error!("cant create lock dir {}", lock_dir.display());
        return Err(Errno::EACCES);
    }

    let path = fence_file(lock_dir, pbd);
    let file = match OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .mode(0o666)
        .custom_flags(libc::O_CLOEXEC)
        .open(&path)
    {
        Ok(f) => f,
        Err(e) => {
            error!("cant open fence file {}: {}", path.display(), e);
            return Err(Errno::EACCES);
        }
    };

    // hostid 0 locks the whole file (l_len == 0 per fcntl(2)).
    let flk = libc::flock {
        l_type: libc::F_WRLCK as libc::c_short,
        l_whence: libc::SEEK_SET as libc::c_short,
        l_start: (hostid as i64) * FLK_LEN,
        l_len: if hostid > 0 { FLK_LEN } else { 0 },
        l_pid: 0,
    };

    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &flk) };
    if rc < 0 {
        let os = io::Error::last_os_error();
        debug!(
            "cant lock fence {} [{}, {}): {}",
            path.display(),
            flk.l_start,
            flk.l_start + if hostid > 0 { FLK_LEN } else { 0 },
            os
        );
        return Err(Errno::EACCES);
    }

    debug!("fence lock held: pbd {} hostid {}", pbd, hostid);
    Ok(FenceLock {
        fd: file.into(),
        pbd: pbd.to_string(),
        hostid,
    })
}

impl Drop for FenceLock {
    fn drop(&mut self) {
        debug!("fence lock released: pbd {} hostid {}", self.pbd, self.hostid);
        // OwnedFd close releases the region.
        let _ = &self.fd;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn test_dir(name: &str) -> PathBuf {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!(
            "pbdfs_fence_{}_{}_{}",
            std::process::id(),
            name,
            id
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_acquire_creates_fence_file() {
        let dir = test_dir("create");
        let lock = acquire(&dir, "1-1", 3).unwrap();
        assert!(dir.join("1-1-paxos-hostid").exists());
        drop(lock);
    }

    #[test]
    fn test_hostids_do_not_conflict() {
        // Distinct hostids fence distinct ranges of the same file.
        let dir = test_dir("ranges");
        let a = acquire(&dir, "1-1", 1).unwrap();
        let b = acquire(&dir, "1-1", 2).unwrap();
        drop(a);
        drop(b);
    }

    #[test]
    fn test_reacquire_after_release() {
        let dir = test_dir("release");
        let lock = acquire(&dir, "1-1", 7).unwrap();
        drop(lock);
        let lock = acquire(&dir, "1-1", 7).unwrap();
        drop(lock);
    }

    #[test]
    fn test_unwritable_dir_is_eacces() {
        let dir = PathBuf::from("/proc/pbdfs-no-such-dir");
        assert_eq!(acquire(&dir, "1-1", 1).err(), Some(Errno::EACCES));
    }
}
