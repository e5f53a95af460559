//! Channel client.
//!
//! The SDK side of the shared-memory transport: a process-wide
//! connection table keyed by `conn_id`, slot claiming, request/response
//! exchange, and the atfork teardown. One request is in flight per
//! connection; the ticket guard serializes the slot and frees the
//! buffers on every path.

use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{ChnlError, ShmError};

use super::protocol::{OpType, RequestEntry, ResponseEntry};
use super::ring::{RequestRing, ResponseRing};
use super::shm::{region_path, SharedMemoryRegion};

/// A live connection to one PBD's daemon.
pub struct Connection {
    shm: SharedMemoryRegion,
    slot_id: u32,
    pbd: String,
    next_request_id: AtomicU64,
    /// Mount metadata epoch this client believes current.
    mount_id: AtomicU32,
    /// Serializes the slot: one request in flight per connection.
    ticket_lock: Mutex<()>,
}

impl Connection {
    pub fn pbd(&self) -> &str {
        &self.pbd
    }

    pub fn mount_id(&self) -> u32 {
        self.mount_id.load(Ordering::Acquire)
    }

    /// Re-read the daemon's current metadata epoch. Called by the
    /// request layer when a response reports ESTALE.
    pub fn refresh_meta(&self) {
        let epoch = self.shm.meta_epoch();
        debug!("refresh meta for {}: epoch {}", self.pbd, epoch);
        self.mount_id.store(epoch, Ordering::Release);
    }

    fn daemon_alive(&self) -> bool {
        let pid = self.shm.daemon_pid();
        if pid == 0 {
            return false;
        }
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }

    /// Claim the slot and reserve request/response payload space.
    pub fn ticket(&self, req_len: usize, rsp_len: usize) -> Result<ChannelTicket<'_>, ChnlError> {
        let capacity = self.shm.config().data_buffer_size;
        if req_len + rsp_len > capacity {
            return Err(ChnlError::BufferTooLarge {
                requested: req_len + rsp_len,
                capacity,
            });
        }
        let guard = self
            .ticket_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(ChannelTicket {
            conn: self,
            _guard: guard,
            req: RequestEntry::default(),
        })
    }
}

/// RAII scope for one request: slot ownership, the request entry under
/// construction, and access to the payload area. Dropping the ticket
/// frees the buffers regardless of the path taken.
pub struct ChannelTicket<'a> {
    conn: &'a Connection,
    _guard: MutexGuard<'a, ()>,
    req: RequestEntry,
}

impl ChannelTicket<'_> {
    pub fn request_mut(&mut self) -> &mut RequestEntry {
        &mut self.req
    }

    /// Request payload area (first `len` bytes of the slot buffer).
    pub fn io_buf_mut(&mut self, len: usize) -> &mut [u8] {
        let buf = self
            .conn
            .shm
            .data_buffer_mut(self.conn.slot_id)
            .expect("slot vanished under ticket");
        &mut buf[..len]
    }

    /// Response payload area, valid after `send_recv` returns.
    pub fn io_buf(&self, len: usize) -> &[u8] {
        let buf = self
            .conn
            .shm
            .data_buffer(self.conn.slot_id)
            .expect("slot vanished under ticket");
        &buf[..len]
    }

    /// Push the request and block until its response arrives or the
    /// daemon goes away.
    pub fn send_recv(&mut self) -> Result<ResponseEntry, ChnlError> {
        let conn = self.conn;
        let request_id = conn.next_request_id.fetch_add(1, Ordering::Relaxed);
        self.req.request_id = request_id;
        self.req.mount_id = conn.mount_id();

        let req_ring = RequestRing::new(&conn.shm, conn.slot_id)?;
        let rsp_ring = ResponseRing::new(&conn.shm, conn.slot_id)?;

        while !req_ring.push(&self.req) {
            if !conn.daemon_alive() {
                return Err(ChnlError::DaemonGone);
            }
            std::hint::spin_loop();
        }

        let mut spins: u32 = 0;
        loop {
            if let Some(rsp) = rsp_ring.try_pop_by_id(request_id) {
                return Ok(rsp);
            }
            spins = spins.wrapping_add(1);
            if spins % 1024 == 0 {
                if conn.shm.is_shutdown_requested() && rsp_ring.is_empty() {
                    return Err(ChnlError::DaemonGone);
                }
                if !conn.daemon_alive() {
                    return Err(ChnlError::DaemonGone);
                }
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
    }
}

/// Process-wide channel client.
pub struct Channel {
    conns: Mutex<Vec<Option<Arc<Connection>>>>,
}

static CHANNEL: AtomicPtr<Channel> = AtomicPtr::new(ptr::null_mut());

/// The process channel singleton.
pub fn channel() -> &'static Channel {
    let p = CHANNEL.load(Ordering::Acquire);
    if !p.is_null() {
        return unsafe { &*p };
    }
    let new = Box::into_raw(Box::new(Channel {
        conns: Mutex::new(Vec::new()),
    }));
    match CHANNEL.compare_exchange(ptr::null_mut(), new, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => unsafe { &*new },
        Err(cur) => {
            drop(unsafe { Box::from_raw(new) });
            unsafe { &*cur }
        }
    }
}

/// Rebuild channel state in a forked child. Parent connections (and
/// their slot claims) belong to the parent and are abandoned.
pub(crate) fn atfork_child_reset() {
    let fresh = Box::into_raw(Box::new(Channel {
        conns: Mutex::new(Vec::new()),
    }));
    CHANNEL.store(fresh, Ordering::Release);
}

impl Channel {
    /// Attach to the daemon region for `pbd` under `svr_dir` and claim
    /// a slot. Returns a positive `conn_id`.
    pub fn connect(
        &self,
        svr_dir: &Path,
        pbd: &str,
        timeout: Duration,
    ) -> Result<i32, ChnlError> {
        let path = region_path(svr_dir, pbd);
        let deadline = Instant::now() + timeout;

        let shm = loop {
            match SharedMemoryRegion::attach(&path) {
                Ok(shm) if shm.is_daemon_ready() => break shm,
                Ok(_) => {}
                Err(ShmError::OpenFailed(_)) | Err(ShmError::InvalidMagic) => {}
                Err(e) => return Err(e.into()),
            }
            if Instant::now() >= deadline {
                warn!("connect timeout for {}", pbd);
                return Err(ChnlError::ConnectTimeout(pbd.to_string()));
            }
            std::thread::sleep(Duration::from_millis(1));
        };

        let slot_id = shm.allocate_slot()?;
        shm.slot_control(slot_id)?
            .client_pid
            .store(std::process::id(), Ordering::Release);

        let epoch = shm.meta_epoch();
        let conn = Arc::new(Connection {
            shm,
            slot_id,
            pbd: pbd.to_string(),
            next_request_id: AtomicU64::new(1),
            mount_id: AtomicU32::new(epoch),
            ticket_lock: Mutex::new(()),
        });

        let mut conns = self
            .conns
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let conn_id = match conns.iter().position(|c| c.is_none()) {
            Some(idx) => {
                conns[idx] = Some(conn);
                idx as i32 + 1
            }
            None => {
                conns.push(Some(conn));
                conns.len() as i32
            }
        };
        debug!("connected to {} as conn {} slot {}", pbd, conn_id, slot_id);
        Ok(conn_id)
    }

    /// Look up a live connection.
    pub fn conn(&self, conn_id: i32) -> Result<Arc<Connection>, ChnlError> {
        if conn_id <= 0 {
            return Err(ChnlError::BadConn(conn_id));
        }
        let conns = self
            .conns
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        conns
            .get(conn_id as usize - 1)
            .and_then(|c| c.clone())
            .ok_or(ChnlError::BadConn(conn_id))
    }

    /// Revalidate an existing connection for a remount. The `conn_id`
    /// is kept; the cached metadata epoch is refreshed.
    pub fn reconnect(&self, conn_id: i32, pbd: &str, timeout: Duration) -> Result<(), ChnlError> {
        let conn = self.conn(conn_id)?;
        if conn.pbd != pbd {
            return Err(ChnlError::BadConn(conn_id));
        }
        let deadline = Instant::now() + timeout;
        while !conn.shm.is_daemon_ready() || !conn.daemon_alive() {
            if Instant::now() >= deadline {
                return Err(ChnlError::ConnectTimeout(pbd.to_string()));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        conn.refresh_meta();
        Ok(())
    }

    /// Tear down a connection. A non-forced close tells the daemon the
    /// slot is going away; a forced close just drops it.
    pub fn close(&self, conn_id: i32, force: bool) -> Result<(), ChnlError> {
        let conn = {
            let mut conns = self
                .conns
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if conn_id <= 0 || conn_id as usize > conns.len() {
                return Err(ChnlError::BadConn(conn_id));
            }
            conns[conn_id as usize - 1]
                .take()
                .ok_or(ChnlError::BadConn(conn_id))?
        };

        if !force && conn.daemon_alive() {
            if let Ok(mut ticket) = conn.ticket(0, 0) {
                *ticket.request_mut() = RequestEntry::new(OpType::Disconnect);
                let _ = ticket.send_recv();
            }
        }

        let _ = conn.shm.release_slot(conn.slot_id);
        debug!("closed conn {} ({})", conn_id, conn.pbd);
        Ok(())
    }

    /// Cancel queued requests submitted by `pid` on this connection.
    pub fn abort(&self, conn_id: i32, pid: u32) -> Result<(), ChnlError> {
        let conn = self.conn(conn_id)?;
        conn.shm
            .slot_control(conn.slot_id)?
            .abort_pid
            .store(pid, Ordering::Release);
        Ok(())
    }

    /// Refresh the cached metadata epoch after an ESTALE response.
    pub fn update_meta(&self, conn_id: i32, _mount_id: u32) -> Result<(), ChnlError> {
        let conn = self.conn(conn_id)?;
        conn.refresh_meta();
        Ok(())
    }
}
