//! Mount registry.
//!
//! A mount binds a PBD name to a daemon connection plus the node-local
//! fencing locks. The registry is process-wide: at most one record per
//! PBD name is registered at any instant, an in-progress set guards the
//! prepare/connect/register window, and records are reference-counted
//! through `Arc` with an `on_list` flag that lets lookups detect
//! teardown races.

use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use crate::constants::{
    MAX_HOSTS, MOUNT_PREPARE_RETRY_MS, MOUNT_PREPARE_TIMEOUT_MS, PBDLEN_MAX,
};
use crate::error::{Errno, Result};
use crate::fence::{self, FenceLock};

/// Mount capability bits.
pub mod mntflags {
    /// Mount is readable.
    pub const RD: u32 = 0x0001;
    /// Mount is writable (implies RD).
    pub const WR: u32 = 0x0002;
    /// Redirect SDK logging to a per-PBD file.
    pub const LOG: u32 = 0x0010;
    /// Administrative mount: bypass the meta lock so the utility can
    /// run alongside a live writer.
    pub const TOOL: u32 = 0x0100;
    /// Skip hostid fencing (force takeover).
    pub const PAXOS_BYFORCE: u32 = 0x0200;
    /// Ask the daemon to bump the write epoch on mount.
    pub const AUTO_INCREASE_EPOCH: u32 = 0x0400;

    pub const ALL: u32 = RD | WR | LOG | TOOL | PAXOS_BYFORCE | AUTO_INCREASE_EPOCH;
}

/// Whether the capability mask permits mutation.
pub fn writable(flags: u32) -> bool {
    flags & mntflags::WR != 0
}

/// Check a user-supplied flag mask; WR implies RD.
pub fn validate_flags(flags: u32) -> Result<u32> {
    if flags & !mntflags::ALL != 0 {
        return Err(Errno::EINVAL);
    }
    let mut flags = flags;
    if flags & mntflags::WR != 0 {
        flags |= mntflags::RD;
    }
    if flags & mntflags::RD == 0 {
        return Err(Errno::EINVAL);
    }
    Ok(flags)
}

/// Mutable half of a mount record, guarded by the record rwlock.
pub struct MountState {
    pub flags: u32,
    pub conn_id: i32,
    pub hostid_lock: Option<FenceLock>,
    pub on_list: bool,
}

/// One mounted PBD.
pub struct MountRecord {
    pub pbd_name: String,
    pub host_id: i32,
    state: RwLock<MountState>,
}

impl MountRecord {
    pub fn read(&self) -> RwLockReadGuard<'_, MountState> {
        self.state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, MountState> {
        self.state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Result of a successful `prepare`: the record plus the meta lock that
/// only lives until the mount handshake finishes.
pub struct PreparedMount {
    pub record: Arc<MountRecord>,
    meta_lock: Option<FenceLock>,
}

impl PreparedMount {
    /// Finish the handshake. On success the record is registered; on
    /// failure every lock is dropped and the record discarded.
    pub fn post(mut self, reg: &Registry, conn_id: Option<i32>) -> Option<Arc<MountRecord>> {
        self.meta_lock.take();
        match conn_id {
            Some(conn_id) => {
                {
                    let mut st = self.record.write();
                    st.conn_id = conn_id;
                }
                reg.register(self.record.clone());
                info!("mount post ok for {}", self.record.pbd_name);
                Some(self.record)
            }
            None => {
                let mut st = self.record.write();
                st.hostid_lock.take();
                info!("mount post failed for {}", self.record.pbd_name);
                None
            }
        }
    }
}

struct RegistryInner {
    mounts: Vec<Arc<MountRecord>>,
    in_progress: Vec<String>,
}

/// Process-wide mount registry.
pub struct Registry {
    inner: Mutex<RegistryInner>,
}

static REGISTRY: AtomicPtr<Registry> = AtomicPtr::new(ptr::null_mut());

/// The process registry singleton.
pub fn registry() -> &'static Registry {
    let p = REGISTRY.load(Ordering::Acquire);
    if !p.is_null() {
        return unsafe { &*p };
    }
    let new = Box::into_raw(Box::new(Registry {
        inner: Mutex::new(RegistryInner {
            mounts: Vec::new(),
            in_progress: Vec::new(),
        }),
    }));
    match REGISTRY.compare_exchange(ptr::null_mut(), new, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => unsafe { &*new },
        Err(cur) => {
            drop(unsafe { Box::from_raw(new) });
            unsafe { &*cur }
        }
    }
}

/// Reset the registry in a forked child. Fence locks held by the parent
/// stay with the parent; the child re-mounts explicitly if it needs
/// access.
pub(crate) fn atfork_child_reset() {
    let fresh = Box::into_raw(Box::new(Registry {
        inner: Mutex::new(RegistryInner {
            mounts: Vec::new(),
            in_progress: Vec::new(),
        }),
    }));
    REGISTRY.store(fresh, Ordering::Release);
}

impl Registry {
    /// A registry detached from the process singleton, for tests.
    #[cfg(test)]
    pub(crate) fn new_detached() -> Self {
        Registry {
            inner: Mutex::new(RegistryInner {
                mounts: Vec::new(),
                in_progress: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Build a record and take the node-local locks for a mount.
    ///
    /// Read-only mounts take no locks. Writers first serialize with
    /// growfs through the meta lock (unless TOOL), then fence their
    /// hostid (unless PAXOS_BYFORCE).
    pub fn prepare(
        &self,
        lock_dir: &Path,
        pbd: &str,
        host_id: i32,
        flags: u32,
    ) -> Result<PreparedMount> {
        if pbd.is_empty() || pbd.len() >= PBDLEN_MAX {
            error!("bad pbd name {:?}", pbd);
            return Err(Errno::EINVAL);
        }
        if host_id < 0 {
            return Err(Errno::EINVAL);
        }
        info!(
            "begin prepare mount PBD({}) hostid({}) flags({:#x})",
            pbd, host_id, flags
        );

        let record = Arc::new(MountRecord {
            pbd_name: pbd.to_string(),
            host_id,
            state: RwLock::new(MountState {
                flags,
                conn_id: -1,
                hostid_lock: None,
                on_list: false,
            }),
        });

        if !writable(flags) {
            return Ok(PreparedMount {
                record,
                meta_lock: None,
            });
        }

        let mut meta_lock = None;
        if flags & mntflags::TOOL == 0 {
            // growfs locks the region past the normal paxos ranges; a
            // mounting writer must wait for it to finish.
            let deadline =
                Instant::now() + Duration::from_millis(MOUNT_PREPARE_TIMEOUT_MS);
            loop {
                match fence::acquire(lock_dir, pbd, MAX_HOSTS + 1) {
                    Ok(l) => {
                        meta_lock = Some(l);
                        break;
                    }
                    Err(Errno::EACCES) if Instant::now() < deadline => {
                        std::thread::sleep(Duration::from_millis(MOUNT_PREPARE_RETRY_MS));
                    }
                    Err(Errno::EACCES) => {
                        error!("meta lock timeout for PBD({})", pbd);
                        return Err(Errno::ETIMEDOUT);
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        if flags & mntflags::PAXOS_BYFORCE == 0 {
            let fence_host = if flags & mntflags::TOOL != 0 && host_id == 0 {
                MAX_HOSTS + 2
            } else {
                host_id
            };
            match fence::acquire(lock_dir, pbd, fence_host) {
                Ok(l) => {
                    record.write().hostid_lock = Some(l);
                }
                Err(e) => {
                    error!(
                        "cant fence PBD({}) hostid({}): {}",
                        pbd, host_id, e
                    );
                    return Err(e);
                }
            }
        }

        info!("prepare mount ok for {} hostid {}", pbd, host_id);
        Ok(PreparedMount { record, meta_lock })
    }

    /// Insert a prepared record; at most one record per name is ever on
    /// the list.
    pub fn register(&self, record: Arc<MountRecord>) {
        let mut inner = self.lock();
        let mut st = record.write();
        if !st.on_list {
            st.on_list = true;
            drop(st);
            inner.mounts.insert(0, record);
        }
    }

    /// Remove a record. The caller must hold the record's write lock
    /// through its own teardown sequence; here only the list membership
    /// changes.
    pub fn unregister(&self, record: &Arc<MountRecord>) {
        let mut inner = self.lock();
        inner
            .mounts
            .retain(|m| !Arc::ptr_eq(m, record));
    }

    /// Find a registered mount by exact PBD name.
    pub fn find(&self, pbd: &str) -> Option<Arc<MountRecord>> {
        let inner = self.lock();
        inner
            .mounts
            .iter()
            .find(|m| m.pbd_name == pbd)
            .cloned()
    }

    /// Registered-name probe.
    pub fn exists(&self, pbd: &str) -> bool {
        self.lock().mounts.iter().any(|m| m.pbd_name == pbd)
    }

    /// Mounts inside the prepare -> connect -> register window.
    pub fn in_progress(&self, pbd: &str) -> bool {
        self.lock().in_progress.iter().any(|p| p == pbd)
    }

    pub fn add_in_progress(&self, pbd: &str) {
        self.lock().in_progress.push(pbd.to_string());
    }

    pub fn remove_in_progress(&self, pbd: &str) {
        let mut inner = self.lock();
        if let Some(idx) = inner.in_progress.iter().position(|p| p == pbd) {
            inner.in_progress.remove(idx);
        }
    }

    /// Iterate registered mounts under the registry mutex. The callback
    /// must not register or unregister.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<MountRecord>) -> i32) -> i32 {
        let inner = self.lock();
        let mut rc = 0;
        for m in &inner.mounts {
            rc |= f(m);
        }
        rc
    }

    /// Find and read-lock a mount, handing the locked state to `f`.
    /// A record observed mid-teardown (`on_list == false`) is dropped
    /// and the search restarted.
    pub fn with_mount_read<R>(
        &self,
        pbd: &str,
        f: impl FnOnce(&Arc<MountRecord>, &MountState) -> R,
    ) -> Result<R> {
        loop {
            let rec = match self.find(pbd) {
                Some(r) => r,
                None => {
                    debug!("no such device {} mounted", pbd);
                    return Err(Errno::ENODEV);
                }
            };
            let st = rec.read();
            if !st.on_list {
                drop(st);
                continue;
            }
            return Ok(f(&rec, &st));
        }
    }

    /// Write-lock flavor of [`Self::with_mount_read`].
    pub fn with_mount_write<R>(
        &self,
        pbd: &str,
        f: impl FnOnce(&Arc<MountRecord>, &mut MountState) -> R,
    ) -> Result<R> {
        loop {
            let rec = match self.find(pbd) {
                Some(r) => r,
                None => {
                    debug!("no such device {} mounted", pbd);
                    return Err(Errno::ENODEV);
                }
            };
            let mut st = rec.write();
            if !st.on_list {
                drop(st);
                continue;
            }
            return Ok(f(&rec, &mut st));
        }
    }
}
