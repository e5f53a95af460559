//! Standalone pbdfs daemon.
//!
//! Serves one PBD over the shared-memory channel until interrupted.
//!
//! ```bash
//! pbdfsd -p 1-1 -a /dev/shm/pfsd -w 20 -f
//! ```

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use pbdfs::daemon::{Daemon, DaemonOptions, MemFs};

/// pbdfs daemon
#[derive(Parser, Debug)]
#[command(name = "pbdfsd")]
#[command(about = "pbdfs daemon serving one PBD over shared memory")]
struct Args {
    /// Stay in the foreground
    #[arg(short = 'f', long = "foreground", default_value_t = false)]
    foreground: bool,

    /// Detach into the background
    #[arg(short = 'd', long = "daemon", default_value_t = false)]
    daemon: bool,

    /// Worker threads
    #[arg(short = 'w', long = "workers")]
    workers: Option<i32>,

    /// Worker idle sleep interval in microseconds
    #[arg(short = 's', long = "usleep")]
    usleep: Option<i32>,

    /// Server instance id
    #[arg(short = 'e', long = "server-id")]
    server_id: Option<i32>,

    /// Options file (TOML)
    #[arg(short = 'c', long = "config")]
    config: Option<String>,

    /// PBD name, like 1-1
    #[arg(short = 'p', long = "pbdname")]
    pbdname: Option<String>,

    /// Directory for the shared-memory region and pid file
    #[arg(short = 'a', long = "shm-dir")]
    shm_dir: Option<std::path::PathBuf>,

    /// Channel pollers
    #[arg(short = 'r', long = "pollers")]
    pollers: Option<i32>,

    /// Bump the write epoch when a writer mounts
    #[arg(short = 'q', long = "auto-increase-epoch", default_value_t = false)]
    auto_increase_epoch: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long = "log-level", default_value = "info")]
    log_level: String,
}

fn build_options(args: &Args) -> Result<DaemonOptions, String> {
    let mut options = match &args.config {
        Some(path) => DaemonOptions::from_file(path).map_err(|e| e.to_string())?,
        None => DaemonOptions::default(),
    };

    if let Some(pbd) = &args.pbdname {
        options.pbdname = pbd.clone();
    }
    if let Some(workers) = args.workers {
        options.workers = workers;
    }
    if let Some(usleep) = args.usleep {
        options.usleep = usleep;
    }
    if let Some(pollers) = args.pollers {
        options.pollers = pollers;
    }
    if let Some(server_id) = args.server_id {
        options.server_id = server_id;
    }
    if let Some(shm_dir) = &args.shm_dir {
        options.shm_dir = shm_dir.clone();
    }
    if args.daemon && !args.foreground {
        options.daemon = true;
    }
    if args.auto_increase_epoch {
        options.auto_increase_epoch = true;
    }

    options.validate().map_err(|e| e.to_string())?;
    Ok(options)
}

fn main() -> ExitCode {
    let args = Args::parse();
    pbdfs::logging::init(&args.log_level);

    let options = match build_options(&args) {
        Ok(o) => o,
        Err(e) => {
            error!("bad options: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let engine = Arc::new(MemFs::new(&options.pbdname));
    let mut daemon = match Daemon::new(options, engine) {
        Ok(d) => d,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = daemon.start() {
        error!("start failed: {}", e);
        return ExitCode::FAILURE;
    }

    for sig in [libc::SIGINT, libc::SIGTERM] {
        unsafe {
            libc::signal(sig, on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t);
        }
    }

    info!("pbdfsd running, pid {}", std::process::id());
    while !SIGNALLED.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(100));
    }

    info!("shutting down");
    daemon.stop();
    match daemon.wait_stop() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("shutdown failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

static SIGNALLED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_sig: libc::c_int) {
    SIGNALLED.store(true, Ordering::Release);
}
