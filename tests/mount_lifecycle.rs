//! Mount lifecycle scenarios: registration, teardown, fd invalidation,
//! remount upgrades, multi-PBD operation.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use pbdfs::daemon::{Daemon, DaemonOptions, MemFs};
use pbdfs::mount::mntflags;
use pbdfs::{sdk, Errno};

static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

struct TestEnv {
    _guard: MutexGuard<'static, ()>,
    daemons: Vec<Daemon>,
    pbds: Vec<String>,
    dir: PathBuf,
}

impl TestEnv {
    fn new(name: &str, npbds: usize) -> Self {
        pbdfs::logging::init("warn");
        let guard = ENV_LOCK
            .get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!(
            "pbdfs_ml_{}_{}_{}",
            std::process::id(),
            name,
            id
        ));
        let shm_dir = dir.join("shm");
        std::fs::create_dir_all(&shm_dir).unwrap();

        let mut daemons = Vec::new();
        let mut pbds = Vec::new();
        for i in 0..npbds {
            let pbd = format!("{}{}-{}", name, id, i);
            let options = DaemonOptions {
                pbdname: pbd.clone(),
                shm_dir: shm_dir.clone(),
                workers: 2,
                usleep: 1,
                ..Default::default()
            };
            let engine = Arc::new(MemFs::new(&pbd));
            let mut daemon = Daemon::new(options, engine).unwrap();
            daemon.start().unwrap();
            daemons.push(daemon);
            pbds.push(pbd);
        }

        sdk::set_svr_addr(&shm_dir);
        sdk::set_lock_dir(dir.join("locks"));
        sdk::set_connect_timeout(5000);

        TestEnv {
            _guard: guard,
            daemons,
            pbds,
            dir,
        }
    }
}

impl Drop for TestEnv {
    fn drop(&mut self) {
        for pbd in &self.pbds {
            let _ = sdk::umount(pbd);
        }
        for daemon in &mut self.daemons {
            daemon.stop();
            let _ = daemon.wait_stop();
        }
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

#[test]
fn test_mount_umount_cycle() {
    let env = TestEnv::new("cycle", 1);
    let pbd = env.pbds[0].clone();

    sdk::mount("c", &pbd, 1, mntflags::RD | mntflags::WR).unwrap();
    // Fence file appears once a writer holds its hostid lock.
    assert!(env
        .dir
        .join("locks")
        .join(format!("{}-paxos-hostid", pbd))
        .exists());

    sdk::umount(&pbd).unwrap();
    assert_eq!(sdk::umount(&pbd), Err(Errno::ENODEV));

    // A second mount/umount cycle works on the same PBD.
    sdk::mount("c", &pbd, 1, mntflags::RD | mntflags::WR).unwrap();
    sdk::umount(&pbd).unwrap();
}

#[test]
fn test_double_mount_is_rejected() {
    let env = TestEnv::new("dbl", 1);
    let pbd = env.pbds[0].clone();

    sdk::mount("c", &pbd, 1, mntflags::RD | mntflags::WR).unwrap();
    assert_eq!(
        sdk::mount("c", &pbd, 1, mntflags::RD | mntflags::WR),
        Err(Errno::EBUSY)
    );
    sdk::umount(&pbd).unwrap();
}

#[test]
fn test_mount_argument_validation() {
    let env = TestEnv::new("args", 1);
    let _ = &env;

    assert_eq!(sdk::mount("c", "", 1, mntflags::RD), Err(Errno::EINVAL));
    assert_eq!(sdk::mount("c", "p", 1, 0), Err(Errno::EINVAL));
    assert_eq!(
        sdk::mount("c", "p", 1, 0x8000_0000),
        Err(Errno::EINVAL)
    );
    assert_eq!(sdk::mount("c", "p", -1, mntflags::RD), Err(Errno::EINVAL));
}

#[test]
fn test_mount_without_daemon_times_out() {
    let env = TestEnv::new("nodmn", 1);
    let _ = &env;

    sdk::set_connect_timeout(200);
    let r = sdk::mount("c", "no-such-pbd", 1, mntflags::RD | mntflags::WR);
    assert_eq!(r, Err(Errno::ETIMEDOUT));
    sdk::set_connect_timeout(5000);

    // The failed mount left nothing registered.
    assert_eq!(sdk::umount("no-such-pbd"), Err(Errno::ENODEV));
}

#[test]
fn test_umount_invalidates_fds() {
    let env = TestEnv::new("inval", 2);
    let (a, b) = (env.pbds[0].clone(), env.pbds[1].clone());

    sdk::set_mode(pbdfs::Mode::Threads);
    sdk::mount("c", &a, 1, mntflags::RD | mntflags::WR).unwrap();
    sdk::mount("c", &b, 1, mntflags::RD | mntflags::WR).unwrap();

    let fd_a = sdk::creat(&format!("/{}/x", a), 0o644).unwrap();
    let fd_b = sdk::creat(&format!("/{}/y", b), 0o644).unwrap();
    sdk::pwrite(fd_a, b"1", 0).unwrap();
    sdk::pwrite(fd_b, b"2", 0).unwrap();

    sdk::umount(&a).unwrap();
    sdk::umount(&b).unwrap();

    // Operations on the dead fds report the missing device...
    assert_eq!(sdk::pwrite(fd_a, b"1", 0), Err(Errno::ENODEV));
    assert_eq!(sdk::pwrite(fd_b, b"2", 0), Err(Errno::ENODEV));
    let mut buf = [0u8; 1];
    assert_eq!(sdk::pread(fd_a, &mut buf, 0), Err(Errno::ENODEV));
    assert_eq!(sdk::fstat(fd_a), Err(Errno::ENODEV));

    // ...but close still succeeds.
    sdk::close(fd_a).unwrap();
    sdk::close(fd_b).unwrap();
}

#[test]
fn test_umount_force() {
    let env = TestEnv::new("force", 1);
    let pbd = env.pbds[0].clone();

    sdk::mount("c", &pbd, 1, mntflags::RD | mntflags::WR).unwrap();
    let fd = sdk::creat(&format!("/{}/f", pbd), 0o644).unwrap();

    sdk::umount_force(&pbd).unwrap();
    assert_eq!(sdk::pwrite(fd, b"x", 0), Err(Errno::ENODEV));
    sdk::close(fd).unwrap();
}

#[test]
fn test_remount_upgrades_to_writer() {
    let env = TestEnv::new("remnt", 1);
    let pbd = env.pbds[0].clone();

    sdk::mount("c", &pbd, 3, mntflags::RD).unwrap();
    assert_eq!(
        sdk::creat(&format!("/{}/w", pbd), 0o644),
        Err(Errno::EROFS)
    );

    // Wrong hostid and no-op upgrades are refused.
    assert_eq!(
        sdk::remount("c", &pbd, 4, mntflags::RD | mntflags::WR),
        Err(Errno::EINVAL)
    );
    assert_eq!(
        sdk::remount("c", &pbd, 3, mntflags::RD),
        Err(Errno::EINVAL)
    );

    sdk::remount("c", &pbd, 3, mntflags::RD | mntflags::WR).unwrap();
    let fd = sdk::creat(&format!("/{}/w", pbd), 0o644).unwrap();
    sdk::close(fd).unwrap();

    // Upgrading twice is refused.
    assert_eq!(
        sdk::remount("c", &pbd, 3, mntflags::RD | mntflags::WR),
        Err(Errno::EINVAL)
    );
    sdk::umount(&pbd).unwrap();
}

#[test]
fn test_two_pbds_are_independent() {
    let env = TestEnv::new("two", 2);
    let (a, b) = (env.pbds[0].clone(), env.pbds[1].clone());

    sdk::mount("c", &a, 1, mntflags::RD | mntflags::WR).unwrap();
    sdk::mount("c", &b, 1, mntflags::RD | mntflags::WR).unwrap();

    let fd_a = sdk::creat(&format!("/{}/only-a", a), 0o644).unwrap();
    sdk::pwrite(fd_a, b"aaaa", 0).unwrap();
    sdk::close(fd_a).unwrap();

    // The file exists on one PBD only.
    sdk::access(&format!("/{}/only-a", a), libc::F_OK).unwrap();
    assert_eq!(
        sdk::access(&format!("/{}/only-a", b), libc::F_OK),
        Err(Errno::ENOENT)
    );

    // Unmounting one PBD leaves the other usable.
    sdk::umount(&a).unwrap();
    let fd_b = sdk::creat(&format!("/{}/still-ok", b), 0o644).unwrap();
    sdk::close(fd_b).unwrap();
    sdk::umount(&b).unwrap();
}

#[test]
fn test_tool_mount_coexists_with_writer() {
    // A TOOL mount skips the meta lock and fences a reserved range, so
    // it can run alongside a live writer on another hostid.
    let env = TestEnv::new("tool", 1);
    let pbd = env.pbds[0].clone();

    sdk::mount("c", &pbd, 1, mntflags::RD | mntflags::WR).unwrap();
    sdk::umount(&pbd).unwrap();

    sdk::mount(
        "c",
        &pbd,
        0,
        mntflags::RD | mntflags::WR | mntflags::TOOL,
    )
    .unwrap();
    let fd = sdk::creat(&format!("/{}/fsck", pbd), 0o644).unwrap();
    sdk::close(fd).unwrap();
    sdk::umount(&pbd).unwrap();
}

#[test]
fn test_embedded_daemon_default_controls() {
    let env = TestEnv::new("ctl", 0);

    assert!(!pbdfs::daemon::is_started());
    assert!(pbdfs::daemon::stop().is_err());

    let options = DaemonOptions {
        pbdname: "ctl-pbd".to_string(),
        shm_dir: env.dir.join("shm"),
        workers: 1,
        ..Default::default()
    };
    pbdfs::daemon::start(options).unwrap();
    assert!(pbdfs::daemon::is_started());

    pbdfs::daemon::stop().unwrap();
    pbdfs::daemon::wait_stop().unwrap();
    assert!(!pbdfs::daemon::is_started());
}
