//! Embedded daemon.
//!
//! Owns the shared-memory region for one PBD, a pool of worker threads
//! that pop client requests and dispatch them into an [`FsEngine`], and
//! a janitor that recycles the slots of clients that died. The
//! standalone `pbdfsd` binary is a thin CLI over [`Daemon`].

use std::fs::File;
use std::io::Write as _;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use crate::chnl::protocol::{
    OpType, RequestEntry, ResponseEntry, DIR_END, OFF_FILE_SIZE,
};
use crate::chnl::ring::{RequestRing, ResponseRing};
use crate::chnl::shm::{region_path, SharedMemoryRegion, ShmConfig};
use crate::constants::{JANITOR_INTERVAL_SECS, PATHLEN_MAX};
use crate::error::DaemonError;

use super::engine::FsEngine;
use super::options::DaemonOptions;

struct StopSignal {
    flag: AtomicBool,
    mtx: Mutex<bool>,
    cv: Condvar,
}

impl StopSignal {
    fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            mtx: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn raise(&self) {
        self.flag.store(true, Ordering::Release);
        let mut stopped = self
            .mtx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *stopped = true;
        self.cv.notify_all();
    }

    fn raised(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Sleep up to `dur`; wakes early when the signal is raised.
    fn wait(&self, dur: Duration) -> bool {
        let stopped = self
            .mtx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let (stopped, _) = self
            .cv
            .wait_timeout_while(stopped, dur, |s| !*s)
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *stopped
    }
}

/// One embedded daemon instance serving a single PBD.
pub struct Daemon {
    options: DaemonOptions,
    engine: Arc<dyn FsEngine>,
    shm: Option<Arc<SharedMemoryRegion>>,
    pidfile: Option<File>,
    workers: Vec<JoinHandle<()>>,
    janitor: Option<JoinHandle<()>>,
    stop: Arc<StopSignal>,
    started: bool,
}

impl Daemon {
    pub fn new(options: DaemonOptions, engine: Arc<dyn FsEngine>) -> Result<Self, DaemonError> {
        options
            .validate()
            .map_err(|e| DaemonError::BadOption(e.to_string()))?;
        Ok(Self {
            options,
            engine,
            shm: None,
            pidfile: None,
            workers: Vec::new(),
            janitor: None,
            stop: Arc::new(StopSignal::new()),
            started: false,
        })
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn options(&self) -> &DaemonOptions {
        &self.options
    }

    /// Bring the daemon up: pid file, region, workers, janitor. On any
    /// failure the process is left without partial state.
    pub fn start(&mut self) -> Result<(), DaemonError> {
        if self.started {
            error!("daemon already started");
            return Err(DaemonError::AlreadyStarted);
        }

        let pbd = self.options.pbdname.clone();
        std::fs::create_dir_all(&self.options.shm_dir)?;

        let pidfile = self.acquire_pidfile()?;

        if self.options.daemon {
            // Detach; stdio stays attached for the log stream.
            unsafe { libc::daemon(1, 1) };
        }
        write_pid(&pidfile)?;

        info!("starting pbdfsd[{}] {}", std::process::id(), pbd);

        let shm = Arc::new(SharedMemoryRegion::create(
            &region_path(&self.options.shm_dir, &pbd),
            ShmConfig::default(),
        )?);

        if self.options.auto_increase_epoch {
            let _ = self.engine.increase_epoch();
        }

        self.stop = Arc::new(StopSignal::new());
        let nworkers = self.options.workers as u32;
        let usleep = self.options.usleep as u64;

        for worker_id in 0..nworkers {
            let shm = shm.clone();
            let engine = self.engine.clone();
            let stop = self.stop.clone();
            self.workers.push(std::thread::spawn(move || {
                worker_loop(shm, engine, worker_id, nworkers, usleep, stop);
            }));
        }

        let janitor_shm = shm.clone();
        let janitor_stop = self.stop.clone();
        self.janitor = Some(std::thread::spawn(move || {
            janitor_loop(janitor_shm, janitor_stop);
        }));

        shm.set_daemon_ready(std::process::id());
        self.shm = Some(shm);
        self.pidfile = Some(pidfile);
        self.started = true;

        info!("pbdfsd started [{}]", pbd);
        Ok(())
    }

    /// Ask the background threads to drain and exit. Non-blocking.
    pub fn stop(&self) {
        if let Some(shm) = &self.shm {
            shm.request_shutdown();
        }
        self.stop.raise();
    }

    /// Join the background threads and release the pid file.
    pub fn wait_stop(&mut self) -> Result<(), DaemonError> {
        if !self.started {
            return Err(DaemonError::NotStarted);
        }
        for w in self.workers.drain(..) {
            let _ = w.join();
        }
        if let Some(j) = self.janitor.take() {
            let _ = j.join();
        }
        self.pidfile = None;
        self.shm = None;
        self.started = false;
        info!("pbdfsd stopped [{}]", self.options.pbdname);
        Ok(())
    }

    fn acquire_pidfile(&self) -> Result<File, DaemonError> {
        let path = self
            .options
            .shm_dir
            .join(format!("{}.pid", self.options.pbdname));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            error!("pid file busy: {}", path.display());
            return Err(DaemonError::PidFileBusy(path.display().to_string()));
        }
        Ok(file)
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        if self.started {
            self.stop();
            let _ = self.wait_stop();
        }
    }
}

fn write_pid(mut file: &File) -> Result<(), DaemonError> {
    file.set_len(0)?;
    file.write_all(format!("{}\n", std::process::id()).as_bytes())?;
    Ok(())
}

fn worker_loop(
    shm: Arc<SharedMemoryRegion>,
    engine: Arc<dyn FsEngine>,
    worker_id: u32,
    nworkers: u32,
    usleep_us: u64,
    stop: Arc<StopSignal>,
) {
    let num_slots = shm.config().num_slots;
    debug!("worker {} up", worker_id);

    while !stop.raised() {
        let mut busy = false;

        for slot_id in (0..num_slots).filter(|s| s % nworkers == worker_id) {
            if !shm.slot_allocated(slot_id) {
                continue;
            }
            let slot = match shm.slot_control(slot_id) {
                Ok(s) => s,
                Err(_) => continue,
            };
            let client_pid = slot.client_pid.load(Ordering::Acquire);
            if client_pid == 0 {
                continue;
            }

            let abort_pid = slot.abort_pid.load(Ordering::Acquire);
            let aborting = abort_pid != 0 && abort_pid == client_pid;

            let req_ring = match RequestRing::new(&shm, slot_id) {
                Ok(r) => r,
                Err(_) => continue,
            };
            let rsp_ring = match ResponseRing::new(&shm, slot_id) {
                Ok(r) => r,
                Err(_) => continue,
            };

            while let Some(req) = req_ring.try_pop() {
                busy = true;
                let rsp = if aborting {
                    ResponseEntry::error(&req, libc::EIO)
                } else {
                    dispatch(&shm, engine.as_ref(), slot_id, &req)
                };
                while !rsp_ring.push(&rsp) {
                    if stop.raised() {
                        break;
                    }
                    std::hint::spin_loop();
                }
            }

            if abort_pid != 0 {
                slot.abort_pid.store(0, Ordering::Release);
            }
        }

        if !busy {
            if usleep_us > 0 {
                std::thread::sleep(Duration::from_micros(usleep_us));
            } else {
                std::thread::yield_now();
            }
        }
    }
    debug!("worker {} down", worker_id);
}

/// Recycle the slots of clients that disappeared without disconnecting.
fn janitor_loop(shm: Arc<SharedMemoryRegion>, stop: Arc<StopSignal>) {
    loop {
        if stop.wait(Duration::from_secs(JANITOR_INTERVAL_SECS)) {
            break;
        }
        let num_slots = shm.config().num_slots;
        for slot_id in 0..num_slots {
            if !shm.slot_allocated(slot_id) {
                continue;
            }
            let slot = match shm.slot_control(slot_id) {
                Ok(s) => s,
                Err(_) => continue,
            };
            let pid = slot.client_pid.load(Ordering::Acquire);
            if pid == 0 {
                continue;
            }
            let alive = unsafe { libc::kill(pid as libc::pid_t, 0) == 0 };
            if !alive {
                warn!("recycling slot {} of dead client {}", slot_id, pid);
                let _ = shm.release_slot(slot_id);
            }
        }
    }
    debug!("janitor down");
}

fn path_from(buf: &[u8], offset: usize) -> Result<&str, i32> {
    let end = (offset + PATHLEN_MAX).min(buf.len());
    if offset >= end {
        return Err(libc::EINVAL);
    }
    let raw = &buf[offset..end];
    let len = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    std::str::from_utf8(&raw[..len]).map_err(|_| libc::EINVAL)
}

/// Handle one request against the engine. The response's `mount_id`
/// always carries the daemon's current metadata epoch.
fn dispatch(
    shm: &SharedMemoryRegion,
    engine: &dyn FsEngine,
    slot_id: u32,
    req: &RequestEntry,
) -> ResponseEntry {
    let op = req.op();
    trace!("dispatch slot {} op {:?} id {}", slot_id, op, req.request_id);

    // Append writes carry a daemon-resolved offset and bypass the
    // staleness gate; everything else must quote the current epoch.
    let epoch = shm.meta_epoch();
    let append_write = op == OpType::Write && req.offset == OFF_FILE_SIZE;
    if req.mount_id != epoch && !append_write && op != OpType::Disconnect {
        let mut rsp = ResponseEntry::error(req, libc::ESTALE);
        rsp.mount_id = epoch;
        return rsp;
    }

    let mut rsp = ResponseEntry::reply(req);
    let result: Result<(), crate::error::Errno> = (|| {
        match op {
            OpType::Open => {
                let buf = shm.data_buffer(slot_id).map_err(|_| crate::error::Errno::EIO)?;
                let path = path_from(buf, 0).map_err(crate::error::Errno)?;
                let r = engine.open(path, req.flags as i32, req.mode)?;
                rsp.res = r.ino;
                rsp.aux = r.offset;
                rsp.common_pl = r.common_pl;
            }
            OpType::Read => {
                let data = engine.read(req.ino, req.offset, req.length as usize)?;
                let buf = shm
                    .data_buffer_mut(slot_id)
                    .map_err(|_| crate::error::Errno::EIO)?;
                buf[..data.len()].copy_from_slice(&data);
                rsp.res = data.len() as i64;
                rsp.data_len = data.len() as u64;
            }
            OpType::Write => {
                let data = {
                    let buf = shm.data_buffer(slot_id).map_err(|_| crate::error::Errno::EIO)?;
                    &buf[..req.req_len as usize]
                };
                let w = engine.write(req.ino, req.offset, data)?;
                rsp.res = w.written as i64;
                rsp.aux = w.file_size;
            }
            OpType::Lseek => {
                rsp.res = engine.lseek_end(req.ino, req.offset)?;
            }
            OpType::Stat | OpType::Fstat => {
                let st = if op == OpType::Stat {
                    let buf = shm.data_buffer(slot_id).map_err(|_| crate::error::Errno::EIO)?;
                    let path = path_from(buf, 0).map_err(crate::error::Errno)?;
                    engine.stat(path)?
                } else {
                    engine.fstat(req.ino)?
                };
                let buf = shm
                    .data_buffer_mut(slot_id)
                    .map_err(|_| crate::error::Errno::EIO)?;
                let bytes = zerocopy::IntoBytes::as_bytes(&st);
                buf[..bytes.len()].copy_from_slice(bytes);
                rsp.data_len = bytes.len() as u64;
            }
            OpType::Truncate => {
                let buf = shm.data_buffer(slot_id).map_err(|_| crate::error::Errno::EIO)?;
                let path = path_from(buf, 0).map_err(crate::error::Errno)?;
                engine.truncate(path, req.length as i64)?;
            }
            OpType::Ftruncate => {
                engine.ftruncate(req.ino, req.length as i64)?;
            }
            OpType::Fallocate => {
                engine.fallocate(req.ino, req.flags, req.offset, req.length as i64)?;
            }
            OpType::Unlink => {
                let buf = shm.data_buffer(slot_id).map_err(|_| crate::error::Errno::EIO)?;
                let path = path_from(buf, 0).map_err(crate::error::Errno)?;
                engine.unlink(path)?;
            }
            OpType::Rename => {
                let buf = shm.data_buffer(slot_id).map_err(|_| crate::error::Errno::EIO)?;
                let old = path_from(buf, 0).map_err(crate::error::Errno)?;
                let new = path_from(buf, PATHLEN_MAX).map_err(crate::error::Errno)?;
                let noreplace = req.flags & libc::RENAME_NOREPLACE != 0;
                engine.rename(old, new, noreplace)?;
            }
            OpType::Mkdir => {
                let buf = shm.data_buffer(slot_id).map_err(|_| crate::error::Errno::EIO)?;
                let path = path_from(buf, 0).map_err(crate::error::Errno)?;
                engine.mkdir(path, req.mode)?;
            }
            OpType::Rmdir => {
                let buf = shm.data_buffer(slot_id).map_err(|_| crate::error::Errno::EIO)?;
                let path = path_from(buf, 0).map_err(crate::error::Errno)?;
                engine.rmdir(path)?;
            }
            OpType::Opendir => {
                let buf = shm.data_buffer(slot_id).map_err(|_| crate::error::Errno::EIO)?;
                let path = path_from(buf, 0).map_err(crate::error::Errno)?;
                let (dino, first) = engine.opendir(path)?;
                rsp.res = dino;
                rsp.aux = first as i64;
            }
            OpType::Readdir => {
                match engine.readdir(req.ino, req.aux, req.offset)? {
                    Some(page) => {
                        let buf = shm
                            .data_buffer_mut(slot_id)
                            .map_err(|_| crate::error::Errno::EIO)?;
                        buf[..page.data.len()].copy_from_slice(&page.data);
                        rsp.data_len = page.data.len() as u64;
                        rsp.aux = page.next_ino as i64;
                        rsp.aux2 = page.next_offset;
                    }
                    None => rsp.res = DIR_END,
                }
            }
            OpType::Access => {
                let buf = shm.data_buffer(slot_id).map_err(|_| crate::error::Errno::EIO)?;
                let path = path_from(buf, 0).map_err(crate::error::Errno)?;
                engine.access(path, req.flags as i32)?;
            }
            OpType::Chdir => {
                let buf = shm.data_buffer(slot_id).map_err(|_| crate::error::Errno::EIO)?;
                let path = path_from(buf, 0).map_err(crate::error::Errno)?;
                engine.chdir(path)?;
            }
            OpType::Growfs => {
                engine.growfs()?;
                shm.bump_meta_epoch();
            }
            OpType::IncreaseEpoch => {
                engine.increase_epoch()?;
                shm.bump_meta_epoch();
            }
            OpType::Disconnect => {}
            OpType::Nop => return Err(crate::error::Errno::EINVAL),
        }
        Ok(())
    })();

    if let Err(e) = result {
        rsp = ResponseEntry::error(req, e.raw());
    }
    rsp.mount_id = shm.meta_epoch();
    rsp
}

static DEFAULT_DAEMON: Mutex<Option<Daemon>> = Mutex::new(None);

/// Start the process-default embedded daemon with the reference engine.
pub fn start(options: DaemonOptions) -> Result<(), DaemonError> {
    let engine = Arc::new(super::engine::MemFs::new(&options.pbdname));
    start_with_engine(options, engine)
}

/// Start the process-default embedded daemon with a caller engine.
pub fn start_with_engine(
    options: DaemonOptions,
    engine: Arc<dyn FsEngine>,
) -> Result<(), DaemonError> {
    let mut slot = DEFAULT_DAEMON
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    if slot.as_ref().map(|d| d.is_started()).unwrap_or(false) {
        return Err(DaemonError::AlreadyStarted);
    }
    let mut daemon = Daemon::new(options, engine)?;
    daemon.start()?;
    *slot = Some(daemon);
    Ok(())
}

/// Signal the process-default daemon to stop. Non-blocking.
pub fn stop() -> Result<(), DaemonError> {
    let slot = DEFAULT_DAEMON
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    match slot.as_ref() {
        Some(d) if d.is_started() => {
            d.stop();
            Ok(())
        }
        _ => Err(DaemonError::NotStarted),
    }
}

/// Join the process-default daemon and release its resources.
pub fn wait_stop() -> Result<(), DaemonError> {
    let mut slot = DEFAULT_DAEMON
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    match slot.as_mut() {
        Some(d) if d.is_started() => {
            d.wait_stop()?;
            *slot = None;
            Ok(())
        }
        _ => Err(DaemonError::NotStarted),
    }
}

/// Whether the process-default daemon is running.
pub fn is_started() -> bool {
    DEFAULT_DAEMON
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .as_ref()
        .map(|d| d.is_started())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::engine::MemFs;
    use std::sync::atomic::AtomicU64;

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn test_options(name: &str) -> DaemonOptions {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        DaemonOptions {
            pbdname: format!("{}-{}", name, id),
            shm_dir: std::env::temp_dir().join(format!(
                "pbdfs_srv_{}_{}_{}",
                std::process::id(),
                name,
                id
            )),
            workers: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_daemon_lifecycle() {
        let options = test_options("life");
        let engine = Arc::new(MemFs::new(&options.pbdname));
        let mut daemon = Daemon::new(options.clone(), engine).unwrap();

        assert!(!daemon.is_started());
        daemon.start().unwrap();
        assert!(daemon.is_started());
        assert!(region_path(&options.shm_dir, &options.pbdname).exists());
        assert!(options
            .shm_dir
            .join(format!("{}.pid", options.pbdname))
            .exists());

        daemon.stop();
        daemon.wait_stop().unwrap();
        assert!(!daemon.is_started());
        assert!(!region_path(&options.shm_dir, &options.pbdname).exists());
    }

    #[test]
    fn test_double_start_rejected() {
        let options = test_options("dbl");
        let engine = Arc::new(MemFs::new(&options.pbdname));
        let mut daemon = Daemon::new(options, engine).unwrap();
        daemon.start().unwrap();
        assert!(matches!(daemon.start(), Err(DaemonError::AlreadyStarted)));
        daemon.stop();
        daemon.wait_stop().unwrap();
    }

    #[test]
    fn test_invalid_options_rejected() {
        let mut options = test_options("bad");
        options.workers = 0;
        let engine = Arc::new(MemFs::new("x"));
        assert!(matches!(
            Daemon::new(options, engine),
            Err(DaemonError::BadOption(_))
        ));
    }

    #[test]
    fn test_dispatch_estale_on_old_epoch() {
        let options = test_options("stale");
        let engine = MemFs::new(&options.pbdname);
        let shm = SharedMemoryRegion::create(
            &region_path(&options.shm_dir, &options.pbdname),
            ShmConfig {
                num_slots: 1,
                data_buffer_size: 1 << 20,
                ring_size: 4,
            },
        )
        .unwrap();

        let mut req = RequestEntry::new(OpType::Fstat);
        req.ino = 1;
        req.mount_id = shm.meta_epoch();
        let rsp = dispatch(&shm, &engine, 0, &req);
        assert!(rsp.is_ok());

        shm.bump_meta_epoch();
        let rsp = dispatch(&shm, &engine, 0, &req);
        assert_eq!(rsp.error, libc::ESTALE);

        // Append writes bypass the gate.
        let open = engine.open(&format!("/{}/f", engine.pbd()), libc::O_CREAT | libc::O_WRONLY, 0).unwrap();
        let mut wreq = RequestEntry::new(OpType::Write);
        wreq.ino = open.ino;
        wreq.offset = OFF_FILE_SIZE;
        wreq.req_len = 0;
        wreq.mount_id = 0;
        let rsp = dispatch(&shm, &engine, 0, &wreq);
        assert!(rsp.is_ok());
    }
}
