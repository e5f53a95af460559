//! Embedded daemon for pbdfs.
//!
//! The daemon owns the shared-memory region of one PBD and serves the
//! wire operations against an [`engine::FsEngine`]. It can run inside
//! the application process (`start`/`stop`/`wait_stop`) or standalone
//! through the `pbdfsd` binary.

pub mod engine;
pub mod options;
pub mod server;

pub use engine::{FsEngine, MemFs};
pub use options::{ConfigError, DaemonOptions};
pub use server::{is_started, start, start_with_engine, stop, wait_stop, Daemon};
