//! Shared-memory channel between the SDK and the daemon.
//!
//! `protocol` defines the wire layout, `shm` the mapped region, `ring`
//! the SPSC queues, and `client` the SDK-side connection table. The
//! daemon side of the same region lives in [`crate::daemon`].

pub mod client;
pub mod protocol;
pub mod ring;
pub mod shm;

pub use client::{channel, Channel, ChannelTicket, Connection};
pub use protocol::{FileStat, OpType, RequestEntry, ResponseEntry, WireDirent};
pub use shm::{region_path, SharedMemoryRegion, ShmConfig};
