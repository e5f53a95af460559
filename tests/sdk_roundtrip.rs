//! End-to-end SDK scenarios against an in-process daemon.
//!
//! Each test brings up an embedded daemon on a private temp directory,
//! points the SDK at it, and drives the public surface. SDK settings
//! are process-wide, so tests serialize on one lock.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use pbdfs::constants::IOSIZE_MAX;
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
    /// Bring up one daemon per PBD under a fresh directory and point
    /// the SDK at it.
    fn new(name: &str, npbds: usize) -> Self {
        pbdfs::logging::init("warn");
        let guard = ENV_LOCK
            .get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!(
            "pbdfs_it_{}_{}_{}",
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

    fn pbd(&self) -> &str {
        &self.pbds[0]
    }

    fn mount_rw(&self) {
        sdk::mount("c", self.pbd(), 1, mntflags::RD | mntflags::WR).unwrap();
    }

    fn p(&self, rel: &str) -> String {
        format!("/{}/{}", self.pbd(), rel)
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
fn test_open_write_read_roundtrip() {
    let env = TestEnv::new("rt", 1);
    env.mount_rw();

    let fd = sdk::open(&env.p("a"), libc::O_CREAT | libc::O_RDWR, 0o644).unwrap();
    assert!(fd >= 0);

    let data = b"abcdefghijklmnopqrstuvwxyz";
    assert_eq!(sdk::pwrite(fd, data, 0).unwrap(), 26);

    let mut buf = [0u8; 26];
    assert_eq!(sdk::pread(fd, &mut buf, 0).unwrap(), 26);
    assert_eq!(&buf, data);

    sdk::close(fd).unwrap();
    sdk::umount(env.pbd()).unwrap();
}

#[test]
fn test_position_bearing_vs_positional() {
    let env = TestEnv::new("pos", 1);
    env.mount_rw();

    let fd = sdk::open(&env.p("a"), libc::O_CREAT | libc::O_RDWR, 0o644).unwrap();
    sdk::write(fd, b"0123456789").unwrap();
    assert_eq!(sdk::lseek(fd, 0, libc::SEEK_CUR).unwrap(), 10);

    // pread does not move the offset.
    let mut buf = [0u8; 4];
    sdk::pread(fd, &mut buf, 2).unwrap();
    assert_eq!(&buf, b"2345");
    assert_eq!(sdk::lseek(fd, 0, libc::SEEK_CUR).unwrap(), 10);

    // read continues from the position.
    sdk::lseek(fd, 4, libc::SEEK_SET).unwrap();
    sdk::read(fd, &mut buf).unwrap();
    assert_eq!(&buf, b"4567");
    assert_eq!(sdk::lseek(fd, 0, libc::SEEK_CUR).unwrap(), 8);

    sdk::close(fd).unwrap();
}

#[test]
fn test_lseek_end_and_overflow() {
    let env = TestEnv::new("lseek", 1);
    env.mount_rw();

    let fd = sdk::open(&env.p("a"), libc::O_CREAT | libc::O_RDWR, 0o644).unwrap();
    sdk::write(fd, b"0123456789").unwrap();

    // SEEK_END is delegated to the daemon.
    assert_eq!(sdk::lseek(fd, -3, libc::SEEK_END).unwrap(), 7);

    assert_eq!(sdk::lseek(fd, -1, libc::SEEK_SET), Err(Errno::EINVAL));
    assert_eq!(
        sdk::lseek(fd, i64::MAX, libc::SEEK_CUR),
        Err(Errno::EOVERFLOW)
    );
    // Position unchanged by the failed seeks.
    assert_eq!(sdk::lseek(fd, 0, libc::SEEK_CUR).unwrap(), 7);

    sdk::close(fd).unwrap();
}

#[test]
fn test_append_concurrent_writers() {
    let env = TestEnv::new("app", 1);
    env.mount_rw();

    let fd = sdk::open(
        &env.p("log"),
        libc::O_CREAT | libc::O_WRONLY | libc::O_APPEND,
        0o644,
    )
    .unwrap();

    const WRITERS: usize = 3;
    const ROUNDS: usize = 1000;
    let mut handles = Vec::new();
    for w in 0..WRITERS {
        handles.push(std::thread::spawn(move || {
            let chunk = [b'a' + w as u8; 3];
            for _ in 0..ROUNDS {
                assert_eq!(sdk::write(fd, &chunk).unwrap(), 3);
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    let st = sdk::fstat(fd).unwrap();
    assert_eq!(st.size, (WRITERS * ROUNDS * 3) as i64);

    // No chunk is torn: every 3-byte cell is one writer's byte repeated.
    let rfd = sdk::open(&env.p("log"), libc::O_RDONLY, 0).unwrap();
    let mut buf = vec![0u8; st.size as usize];
    assert_eq!(sdk::pread(rfd, &mut buf, 0).unwrap(), buf.len());
    let mut counts = [0usize; WRITERS];
    for cell in buf.chunks(3) {
        assert_eq!(cell[0], cell[1]);
        assert_eq!(cell[1], cell[2]);
        counts[(cell[0] - b'a') as usize] += 1;
    }
    assert_eq!(counts, [ROUNDS; WRITERS]);

    sdk::close(rfd).unwrap();
    sdk::close(fd).unwrap();
}

#[test]
fn test_large_io_is_chunked() {
    let env = TestEnv::new("big", 1);
    env.mount_rw();

    let fd = sdk::open(&env.p("big"), libc::O_CREAT | libc::O_RDWR, 0o644).unwrap();

    // One byte past the single-request ceiling forces a second request.
    let len = IOSIZE_MAX + 1;
    let mut data = vec![0u8; len];
    for (i, b) in data.iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }
    assert_eq!(sdk::pwrite(fd, &data, 0).unwrap(), len);
    assert_eq!(sdk::fstat(fd).unwrap().size, len as i64);

    let mut back = vec![0u8; len];
    assert_eq!(sdk::pread(fd, &mut back, 0).unwrap(), len);
    assert_eq!(back, data);

    sdk::close(fd).unwrap();
}

#[test]
fn test_zero_length_io() {
    let env = TestEnv::new("zero", 1);
    env.mount_rw();

    let fd = sdk::open(&env.p("a"), libc::O_CREAT | libc::O_RDWR, 0o644).unwrap();
    assert_eq!(sdk::write(fd, b"").unwrap(), 0);
    let mut empty: [u8; 0] = [];
    assert_eq!(sdk::read(fd, &mut empty).unwrap(), 0);
    sdk::close(fd).unwrap();
}

#[test]
fn test_vectored_io() {
    let env = TestEnv::new("vec", 1);
    env.mount_rw();

    let fd = sdk::open(&env.p("v"), libc::O_CREAT | libc::O_RDWR, 0o644).unwrap();
    let parts = [
        std::io::IoSlice::new(b"hello "),
        std::io::IoSlice::new(b"vectored "),
        std::io::IoSlice::new(b"world"),
    ];
    assert_eq!(sdk::writev(fd, &parts).unwrap(), 20);

    let mut a = [0u8; 6];
    let mut b = [0u8; 14];
    let mut bufs = [
        std::io::IoSliceMut::new(&mut a),
        std::io::IoSliceMut::new(&mut b),
    ];
    assert_eq!(sdk::preadv(fd, &mut bufs, 0).unwrap(), 20);
    assert_eq!(&a, b"hello ");
    assert_eq!(&b, b"vectored world");

    sdk::close(fd).unwrap();
}

#[test]
fn test_write_zero_extends_file() {
    let env = TestEnv::new("wz", 1);
    env.mount_rw();

    let fd = sdk::open(&env.p("z"), libc::O_CREAT | libc::O_RDWR, 0o644).unwrap();
    sdk::write(fd, b"xy").unwrap();
    assert_eq!(sdk::write_zero(fd, 10).unwrap(), 10);
    assert_eq!(sdk::fstat(fd).unwrap().size, 12);

    let mut buf = [0u8; 12];
    sdk::pread(fd, &mut buf, 0).unwrap();
    assert_eq!(&buf[..2], b"xy");
    assert!(buf[2..].iter().all(|b| *b == 0));
    sdk::close(fd).unwrap();
}

#[test]
fn test_truncate_fallocate_stat() {
    let env = TestEnv::new("trunc", 1);
    env.mount_rw();

    let path = env.p("t");
    let fd = sdk::open(&path, libc::O_CREAT | libc::O_RDWR, 0o644).unwrap();
    sdk::write(fd, b"hello world").unwrap();

    sdk::truncate(&path, 5).unwrap();
    assert_eq!(sdk::stat(&path).unwrap().size, 5);

    sdk::ftruncate(fd, 8).unwrap();
    assert_eq!(sdk::fstat(fd).unwrap().size, 8);
    assert_eq!(sdk::ftruncate(fd, -1), Err(Errno::EINVAL));

    sdk::posix_fallocate(fd, 0, 100).unwrap();
    assert_eq!(sdk::fstat(fd).unwrap().size, 100);

    sdk::close(fd).unwrap();
}

#[test]
fn test_unlink_rename_access() {
    let env = TestEnv::new("nm", 1);
    env.mount_rw();

    let a = env.p("a");
    let b = env.p("b");
    let c = env.p("c");

    let fd = sdk::creat(&a, 0o644).unwrap();
    sdk::close(fd).unwrap();

    sdk::access(&a, libc::F_OK).unwrap();
    assert_eq!(sdk::access(&b, libc::F_OK), Err(Errno::ENOENT));

    sdk::rename(&a, &b).unwrap();
    assert_eq!(sdk::access(&a, libc::F_OK), Err(Errno::ENOENT));

    // rename onto itself succeeds and changes nothing.
    sdk::rename(&b, &b).unwrap();
    sdk::access(&b, libc::F_OK).unwrap();

    let fd = sdk::creat(&c, 0o644).unwrap();
    sdk::close(fd).unwrap();
    assert_eq!(
        sdk::rename2(&b, &c, libc::RENAME_NOREPLACE),
        Err(Errno::EEXIST)
    );
    assert_eq!(sdk::rename2(&b, &c, 0xdead_0000), Err(Errno::EINVAL));
    sdk::rename2(&b, &c, 0).unwrap();

    sdk::unlink(&c).unwrap();
    assert_eq!(sdk::unlink(&c), Err(Errno::ENOENT));
}

#[test]
fn test_rename_across_pbds_is_exdev() {
    let env = TestEnv::new("xdev", 2);
    sdk::mount("c", &env.pbds[0], 1, mntflags::RD | mntflags::WR).unwrap();
    sdk::mount("c", &env.pbds[1], 1, mntflags::RD | mntflags::WR).unwrap();

    let a = format!("/{}/a", env.pbds[0]);
    let b = format!("/{}/b", env.pbds[1]);
    let fd = sdk::creat(&a, 0o644).unwrap();
    sdk::close(fd).unwrap();

    assert_eq!(sdk::rename(&a, &b), Err(Errno::EXDEV));
}

#[test]
fn test_mkdir_readdir_rmdir() {
    let env = TestEnv::new("dir", 1);
    env.mount_rw();

    let d = env.p("sub");
    sdk::mkdir(&d, 0o755).unwrap();
    assert_eq!(sdk::mkdir(&d, 0o755), Err(Errno::EEXIST));

    for name in ["x", "y", "z"] {
        let fd = sdk::creat(&format!("{}/{}", d, name), 0o644).unwrap();
        sdk::close(fd).unwrap();
    }

    let mut dirp = sdk::opendir(&d).unwrap();
    let mut names = Vec::new();
    while let Some(ent) = sdk::readdir(&mut dirp).unwrap() {
        names.push(ent.d_name);
    }
    sdk::closedir(dirp).unwrap();
    names.sort();
    assert_eq!(names, ["x", "y", "z"]);

    assert_eq!(sdk::rmdir(&d), Err(Errno::ENOTEMPTY));
    for name in ["x", "y", "z"] {
        sdk::unlink(&format!("{}/{}", d, name)).unwrap();
    }
    sdk::rmdir(&d).unwrap();
    assert_eq!(sdk::opendir(&d).err(), Some(Errno::ENOENT));
}

#[test]
fn test_readdir_sees_unlink_on_next_pass() {
    let env = TestEnv::new("vis", 1);
    env.mount_rw();

    let p = env.p("seen");
    let fd = sdk::creat(&p, 0o644).unwrap();
    sdk::close(fd).unwrap();

    let root = format!("/{}/", env.pbd());
    let mut dirp = sdk::opendir(&root).unwrap();
    let mut found = false;
    while let Some(ent) = sdk::readdir(&mut dirp).unwrap() {
        if ent.d_name == "seen" {
            found = true;
        }
    }
    sdk::closedir(dirp).unwrap();
    assert!(found);

    sdk::unlink(&p).unwrap();
    let mut dirp = sdk::opendir(&root).unwrap();
    while let Some(ent) = sdk::readdir(&mut dirp).unwrap() {
        assert_ne!(ent.d_name, "seen");
    }
    sdk::closedir(dirp).unwrap();
}

#[test]
fn test_readdir_many_entries_paginates() {
    let env = TestEnv::new("page", 1);
    env.mount_rw();

    // More entries than fit one 4KiB page.
    for i in 0..50 {
        let fd = sdk::creat(&env.p(&format!("f{:03}", i)), 0o644).unwrap();
        sdk::close(fd).unwrap();
    }

    let mut dirp = sdk::opendir(&format!("/{}/", env.pbd())).unwrap();
    let mut seen = std::collections::HashSet::new();
    while let Some(ent) = sdk::readdir(&mut dirp).unwrap() {
        // Every entry exactly once.
        assert!(seen.insert(ent.d_name.clone()));
    }
    sdk::closedir(dirp).unwrap();
    assert_eq!(seen.len(), 50);
}

#[test]
fn test_readdirplus_carries_sizes() {
    let env = TestEnv::new("plus", 1);
    env.mount_rw();

    let fd = sdk::open(&env.p("sized"), libc::O_CREAT | libc::O_WRONLY, 0o644).unwrap();
    sdk::write(fd, &[7u8; 123]).unwrap();
    sdk::close(fd).unwrap();
    sdk::mkdir(&env.p("d"), 0o755).unwrap();

    let mut dirp = sdk::opendir(&format!("/{}/", env.pbd())).unwrap();
    let mut saw_file = false;
    let mut saw_dir = false;
    while let Some(dp) = sdk::readdirplus(&mut dirp).unwrap() {
        match dp.dirent.d_name.as_str() {
            "sized" => {
                assert!(dp.stat.is_file());
                assert_eq!(dp.stat.size, 123);
                saw_file = true;
            }
            "d" => {
                assert!(dp.stat.is_dir());
                saw_dir = true;
            }
            _ => {}
        }
    }
    sdk::closedir(dirp).unwrap();
    assert!(saw_file && saw_dir);
}

#[test]
fn test_chdir_getcwd_relative_paths() {
    let env = TestEnv::new("cwd", 1);
    env.mount_rw();

    let d = env.p("wd");
    sdk::mkdir(&d, 0o755).unwrap();
    sdk::chdir(&d).unwrap();
    assert_eq!(sdk::getcwd().unwrap(), d);
    assert_eq!(sdk::getwd().unwrap(), d);

    // Relative paths resolve under the working directory.
    let fd = sdk::creat("rel", 0o644).unwrap();
    sdk::close(fd).unwrap();
    sdk::access(&env.p("wd/rel"), libc::F_OK).unwrap();

    assert_eq!(sdk::chdir(&env.p("missing")), Err(Errno::ENOENT));
    assert_eq!(sdk::getcwd().unwrap(), d);
}

#[test]
fn test_du_sums_tree() {
    let env = TestEnv::new("du", 1);
    env.mount_rw();

    sdk::mkdir(&env.p("t"), 0o755).unwrap();
    sdk::mkdir(&env.p("t/sub"), 0o755).unwrap();
    for (path, len) in [("t/a", 10usize), ("t/b", 20), ("t/sub/c", 30)] {
        let fd = sdk::open(&env.p(path), libc::O_CREAT | libc::O_WRONLY, 0o644).unwrap();
        sdk::write(fd, &vec![1u8; len]).unwrap();
        sdk::close(fd).unwrap();
    }

    let mut entries = Vec::new();
    let total = sdk::du(&env.p("t"), true, 1, &mut |path, size| {
        entries.push((path.to_string(), size));
    })
    .unwrap();
    assert_eq!(total, 60);
    assert!(entries.iter().any(|(p, s)| p.ends_with("/t/a") && *s == 10));
    assert!(entries.iter().any(|(p, s)| p.ends_with("/sub/c") && *s == 30));
}

#[test]
fn test_stubs_and_unsupported() {
    let env = TestEnv::new("stub", 1);
    env.mount_rw();

    let p = env.p("s");
    let fd = sdk::creat(&p, 0o644).unwrap();

    sdk::chmod(&p, 0o600).unwrap();
    sdk::fchmod(fd, 0o600).unwrap();
    sdk::chown(&p, 0, 0).unwrap();
    sdk::fsync(fd).unwrap();
    sdk::setxattr(&p, "user.tag", b"v", 0).unwrap();
    assert_eq!(sdk::setxattr(&p, "user.tag", b"v", 1), Err(Errno::ENOTSUP));
    assert_eq!(sdk::readlink(&p), Err(Errno::EINVAL));
    assert_eq!(sdk::fmap(fd), Err(Errno::ENOSYS));
    assert_eq!(sdk::statfs(&p), Err(Errno::ENOSYS));
    assert_eq!(sdk::fstatfs(fd), Err(Errno::ENOSYS));

    sdk::close(fd).unwrap();
}

#[test]
fn test_readonly_mount_rejects_mutation() {
    let env = TestEnv::new("ro", 1);

    // Seed a file through a writer mount first.
    env.mount_rw();
    let fd = sdk::creat(&env.p("r"), 0o644).unwrap();
    sdk::close(fd).unwrap();
    sdk::umount(env.pbd()).unwrap();

    sdk::mount("c", env.pbd(), 1, mntflags::RD).unwrap();
    let fd = sdk::open(&env.p("r"), libc::O_RDONLY, 0).unwrap();
    assert_eq!(sdk::pwrite(fd, b"x", 0), Err(Errno::EROFS));
    sdk::close(fd).unwrap();

    assert_eq!(sdk::creat(&env.p("new"), 0o644), Err(Errno::EROFS));
    assert_eq!(sdk::unlink(&env.p("r")), Err(Errno::EROFS));
    assert_eq!(sdk::mkdir(&env.p("d"), 0o755), Err(Errno::EROFS));
    assert_eq!(sdk::truncate(&env.p("r"), 0), Err(Errno::EROFS));
    assert_eq!(sdk::access(&env.p("r"), libc::W_OK), Err(Errno::EROFS));
}

#[test]
fn test_growfs_staleness_is_transparent() {
    let env = TestEnv::new("grow", 1);
    env.mount_rw();

    let fd = sdk::open(&env.p("g"), libc::O_CREAT | libc::O_RDWR, 0o644).unwrap();
    sdk::write(fd, b"before").unwrap();

    // Bumps the daemon's metadata epoch; later requests from this
    // mount would be stale without the transparent retry.
    sdk::mount_growfs(env.pbd()).unwrap();

    let mut buf = [0u8; 6];
    assert_eq!(sdk::pread(fd, &mut buf, 0).unwrap(), 6);
    assert_eq!(&buf, b"before");

    sdk::increase_epoch(env.pbd()).unwrap();
    assert_eq!(sdk::pwrite(fd, b"after!", 0).unwrap(), 6);

    sdk::close(fd).unwrap();
}

#[test]
fn test_fd_reuse_is_lifo() {
    let env = TestEnv::new("fds", 1);
    env.mount_rw();

    let a = sdk::creat(&env.p("fa"), 0o644).unwrap();
    let b = sdk::creat(&env.p("fb"), 0o644).unwrap();
    assert_ne!(a, b);

    sdk::close(a).unwrap();
    let c = sdk::creat(&env.p("fc"), 0o644).unwrap();
    // The freed slot is handed back first.
    assert_eq!(c, a);

    sdk::close(b).unwrap();
    sdk::close(c).unwrap();
}

#[test]
fn test_bad_fds_are_rejected() {
    let env = TestEnv::new("badfd", 1);
    env.mount_rw();

    let mut buf = [0u8; 4];
    // Untagged fds are not ours.
    assert_eq!(sdk::read(3, &mut buf), Err(Errno::EBADF));
    assert_eq!(sdk::close(3), Err(Errno::EBADF));
    // Tagged but never allocated.
    let ghost = (1 << 30) | 77;
    assert_eq!(sdk::read(ghost, &mut buf), Err(Errno::EBADF));
    assert_eq!(sdk::close(ghost), Err(Errno::EBADF));
}

#[test]
fn test_abort_request_reaches_all_mounts() {
    let env = TestEnv::new("abort", 1);
    env.mount_rw();
    sdk::abort_request(std::process::id()).unwrap();

    // The aborted pid's next request is shed with an error, then the
    // connection recovers.
    let r = sdk::creat(&env.p("x"), 0o644);
    let _ = r;
    let fd = sdk::creat(&env.p("y"), 0o644).unwrap();
    sdk::close(fd).unwrap();
}
