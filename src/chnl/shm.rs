//! Shared-memory region management.
//!
//! The daemon creates one region file per PBD under its shm directory
//! (`<dir>/<pbd>.shm`); clients map the same file. Layout: a page-sized
//! global control block, then `num_slots` slots, each holding a slot
//! control block, a request ring, a response ring and a data buffer.

use std::fs::OpenOptions;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::Ordering;

use crate::error::ShmError;

use super::protocol::{
    GlobalControlBlock, RequestEntry, ResponseEntry, SlotControlBlock, DATA_BUFFER_SIZE,
    DEFAULT_NUM_SLOTS, DEFAULT_RING_SIZE, MAX_SLOTS, SLOT_BITMAP_WORDS,
};

/// Region file for a PBD under a shm directory.
pub fn region_path(shm_dir: &Path, pbd: &str) -> PathBuf {
    shm_dir.join(format!("{}.shm", pbd))
}

/// Geometry of a shared-memory region.
#[derive(Debug, Clone)]
pub struct ShmConfig {
    /// Number of client slots
    pub num_slots: u32,
    /// Data buffer size per slot
    pub data_buffer_size: usize,
    /// Ring size in entries (both rings, power of 2)
    pub ring_size: u32,
}

impl Default for ShmConfig {
    fn default() -> Self {
        Self {
            num_slots: DEFAULT_NUM_SLOTS,
            data_buffer_size: DATA_BUFFER_SIZE,
            ring_size: DEFAULT_RING_SIZE,
        }
    }
}

impl ShmConfig {
    pub fn validate(&self) -> Result<(), ShmError> {
        if self.num_slots == 0 || self.num_slots > MAX_SLOTS {
            return Err(ShmError::InvalidConfig(format!(
                "num_slots must be between 1 and {}",
                MAX_SLOTS
            )));
        }
        if self.data_buffer_size == 0 {
            return Err(ShmError::InvalidConfig(
                "data_buffer_size must be > 0".to_string(),
            ));
        }
        if self.ring_size == 0 || !self.ring_size.is_power_of_two() {
            return Err(ShmError::InvalidConfig(
                "ring_size must be a power of 2".to_string(),
            ));
        }
        Ok(())
    }

    pub fn slot_size(&self) -> usize {
        std::mem::size_of::<SlotControlBlock>()
            + std::mem::size_of::<RequestEntry>() * self.ring_size as usize
            + std::mem::size_of::<ResponseEntry>() * self.ring_size as usize
            + self.data_buffer_size
    }

    pub fn total_size(&self) -> usize {
        std::mem::size_of::<GlobalControlBlock>() + self.slot_size() * self.num_slots as usize
    }
}

/// A mapped region, usable from both the daemon (creator) and clients
/// (attachers).
pub struct SharedMemoryRegion {
    path: PathBuf,
    base_ptr: NonNull<u8>,
    total_size: usize,
    is_owner: bool,
    config: ShmConfig,
}

// SAFETY: the mapping is process-shared and every mutable field inside
// it is an atomic or is serialized by the ring index protocol.
unsafe impl Send for SharedMemoryRegion {}
unsafe impl Sync for SharedMemoryRegion {}

impl SharedMemoryRegion {
    /// Create and initialize a region file (daemon side).
    pub fn create(path: &Path, config: ShmConfig) -> Result<Self, ShmError> {
        config.validate()?;

        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(ShmError::CreateFailed)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(ShmError::CreateFailed)?;

        let total_size = config.total_size();
        file.set_len(total_size as u64)
            .map_err(ShmError::TruncateFailed)?;

        let base_ptr = map(&file, total_size)?;

        // Initialize the control block, then every slot header.
        let control = base_ptr.as_ptr() as *mut GlobalControlBlock;
        unsafe {
            std::ptr::write(
                control,
                GlobalControlBlock::init(
                    config.num_slots,
                    config.slot_size() as u64,
                    config.data_buffer_size as u64,
                    config.ring_size,
                ),
            );
        }
        for i in 0..config.num_slots {
            let off = std::mem::size_of::<GlobalControlBlock>() + config.slot_size() * i as usize;
            let slot = unsafe { base_ptr.as_ptr().add(off) } as *mut SlotControlBlock;
            unsafe { std::ptr::write(slot, SlotControlBlock::init()) };
        }

        Ok(Self {
            path: path.to_path_buf(),
            base_ptr,
            total_size,
            is_owner: true,
            config,
        })
    }

    /// Attach to an existing region file (client side).
    pub fn attach(path: &Path) -> Result<Self, ShmError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(ShmError::OpenFailed)?;

        // Map just the control block first to learn the geometry.
        let control_size = std::mem::size_of::<GlobalControlBlock>();
        let probe = map(&file, control_size)?;
        let control = probe.as_ptr() as *const GlobalControlBlock;

        let (num_slots, data_buffer_size, ring_size, slot_size) = unsafe {
            if !(*control).validate() {
                unmap(probe, control_size);
                return Err(ShmError::InvalidMagic);
            }
            (
                (*control).num_slots,
                (*control).data_buffer_size as usize,
                (*control).ring_size,
                (*control).slot_size as usize,
            )
        };
        unmap(probe, control_size);

        let config = ShmConfig {
            num_slots,
            data_buffer_size,
            ring_size,
        };
        let total_size = control_size + slot_size * num_slots as usize;
        let base_ptr = map(&file, total_size)?;

        Ok(Self {
            path: path.to_path_buf(),
            base_ptr,
            total_size,
            is_owner: false,
            config,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &ShmConfig {
        &self.config
    }

    pub fn control(&self) -> &GlobalControlBlock {
        unsafe { &*(self.base_ptr.as_ptr() as *const GlobalControlBlock) }
    }

    pub fn is_daemon_ready(&self) -> bool {
        self.control().ready_flag.load(Ordering::Acquire) == 1
    }

    pub fn set_daemon_ready(&self, pid: u32) {
        self.control().daemon_pid.store(pid, Ordering::Release);
        self.control().ready_flag.store(1, Ordering::Release);
    }

    pub fn request_shutdown(&self) {
        self.control().shutdown_flag.store(1, Ordering::Release);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.control().shutdown_flag.load(Ordering::Acquire) == 1
    }

    pub fn daemon_pid(&self) -> u32 {
        self.control().daemon_pid.load(Ordering::Acquire)
    }

    pub fn meta_epoch(&self) -> u32 {
        self.control().meta_epoch.load(Ordering::Acquire)
    }

    pub fn bump_meta_epoch(&self) -> u32 {
        self.control().meta_epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Allocate a client slot (lock-free bitmap scan).
    pub fn allocate_slot(&self) -> Result<u32, ShmError> {
        let control = self.control();

        for word_idx in 0..SLOT_BITMAP_WORDS {
            let bitmap = &control.slot_bitmap[word_idx];
            loop {
                let current = bitmap.load(Ordering::Acquire);
                if current == u64::MAX {
                    break;
                }
                let free_bit = (!current).trailing_zeros();
                let slot_id = word_idx as u32 * 64 + free_bit;
                if slot_id >= self.config.num_slots {
                    break;
                }
                let new_value = current | (1u64 << free_bit);
                if bitmap
                    .compare_exchange(current, new_value, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Ok(slot_id);
                }
            }
        }
        Err(ShmError::NoFreeSlots)
    }

    /// Release a slot and clear its control block.
    pub fn release_slot(&self, slot_id: u32) -> Result<(), ShmError> {
        if slot_id >= self.config.num_slots {
            return Err(ShmError::InvalidSlot);
        }

        self.slot_control(slot_id)?.reset();

        let word_idx = (slot_id / 64) as usize;
        let bit_idx = slot_id % 64;
        let bitmap = &self.control().slot_bitmap[word_idx];
        loop {
            let current = bitmap.load(Ordering::Acquire);
            let new_value = current & !(1u64 << bit_idx);
            if bitmap
                .compare_exchange(current, new_value, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    pub fn slot_allocated(&self, slot_id: u32) -> bool {
        let word_idx = (slot_id / 64) as usize;
        let bit_idx = slot_id % 64;
        self.control().slot_bitmap[word_idx].load(Ordering::Acquire) & (1u64 << bit_idx) != 0
    }

    fn slot_base(&self, slot_id: u32) -> Result<*mut u8, ShmError> {
        if slot_id >= self.config.num_slots {
            return Err(ShmError::InvalidSlot);
        }
        let off =
            std::mem::size_of::<GlobalControlBlock>() + self.config.slot_size() * slot_id as usize;
        Ok(unsafe { self.base_ptr.as_ptr().add(off) })
    }

    pub fn slot_control(&self, slot_id: u32) -> Result<&SlotControlBlock, ShmError> {
        let ptr = self.slot_base(slot_id)? as *const SlotControlBlock;
        Ok(unsafe { &*ptr })
    }

    pub fn request_ring_ptr(&self, slot_id: u32) -> Result<*mut RequestEntry, ShmError> {
        let base = self.slot_base(slot_id)?;
        let off = std::mem::size_of::<SlotControlBlock>();
        Ok(unsafe { base.add(off) as *mut RequestEntry })
    }

    pub fn response_ring_ptr(&self, slot_id: u32) -> Result<*mut ResponseEntry, ShmError> {
        let base = self.slot_base(slot_id)?;
        let off = std::mem::size_of::<SlotControlBlock>()
            + std::mem::size_of::<RequestEntry>() * self.config.ring_size as usize;
        Ok(unsafe { base.add(off) as *mut ResponseEntry })
    }

    pub fn data_buffer_ptr(&self, slot_id: u32) -> Result<*mut u8, ShmError> {
        let base = self.slot_base(slot_id)?;
        let off = std::mem::size_of::<SlotControlBlock>()
            + std::mem::size_of::<RequestEntry>() * self.config.ring_size as usize
            + std::mem::size_of::<ResponseEntry>() * self.config.ring_size as usize;
        Ok(unsafe { base.add(off) })
    }

    /// Slot data buffer as a slice. Callers coordinate exclusive use
    /// through slot ownership; one request is in flight per slot.
    pub fn data_buffer(&self, slot_id: u32) -> Result<&[u8], ShmError> {
        let ptr = self.data_buffer_ptr(slot_id)?;
        Ok(unsafe { std::slice::from_raw_parts(ptr, self.config.data_buffer_size) })
    }

    #[allow(clippy::mut_from_ref)]
    pub fn data_buffer_mut(&self, slot_id: u32) -> Result<&mut [u8], ShmError> {
        let ptr = self.data_buffer_ptr(slot_id)?;
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr, self.config.data_buffer_size) })
    }
}

fn map(file: &std::fs::File, len: usize) -> Result<NonNull<u8>, ShmError> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(ShmError::MmapFailed(io::Error::last_os_error()));
    }
    NonNull::new(ptr as *mut u8).ok_or_else(|| {
        ShmError::MmapFailed(io::Error::new(io::ErrorKind::Other, "mmap returned null"))
    })
}

fn unmap(ptr: NonNull<u8>, len: usize) {
    unsafe {
        libc::munmap(ptr.as_ptr() as *mut libc::c_void, len);
    }
}

impl Drop for SharedMemoryRegion {
    fn drop(&mut self) {
        unmap(self.base_ptr, self.total_size);
        if self.is_owner {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    pub(crate) fn test_region(name: &str, config: ShmConfig) -> SharedMemoryRegion {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!(
            "pbdfs_shm_{}_{}_{}",
            std::process::id(),
            name,
            id
        ));
        SharedMemoryRegion::create(&region_path(&dir, "t"), config).unwrap()
    }

    fn small_config() -> ShmConfig {
        ShmConfig {
            num_slots: 2,
            data_buffer_size: 4096,
            ring_size: 4,
        }
    }

    #[test]
    fn test_config_validation() {
        let mut config = ShmConfig::default();
        assert!(config.validate().is_ok());

        config.num_slots = 0;
        assert!(config.validate().is_err());

        config = ShmConfig::default();
        config.ring_size = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_slot_size_calculation() {
        let config = small_config();
        let expected = 64 + 128 * 4 + 64 * 4 + 4096;
        assert_eq!(config.slot_size(), expected);
        assert_eq!(config.total_size(), 4096 + 2 * expected);
    }

    #[test]
    fn test_create_then_attach() {
        let region = test_region("attach", small_config());
        let attached = SharedMemoryRegion::attach(region.path()).unwrap();
        assert_eq!(attached.config().num_slots, 2);
        assert_eq!(attached.config().data_buffer_size, 4096);
        assert!(!attached.is_daemon_ready());

        region.set_daemon_ready(1234);
        assert!(attached.is_daemon_ready());
        assert_eq!(attached.daemon_pid(), 1234);
    }

    #[test]
    fn test_slot_allocation_exhaustion() {
        let region = test_region("slots", small_config());
        let a = region.allocate_slot().unwrap();
        let b = region.allocate_slot().unwrap();
        assert_ne!(a, b);
        assert!(matches!(
            region.allocate_slot(),
            Err(ShmError::NoFreeSlots)
        ));
        region.release_slot(a).unwrap();
        assert_eq!(region.allocate_slot().unwrap(), a);
    }

    #[test]
    fn test_meta_epoch_visibility() {
        let region = test_region("epoch", small_config());
        let attached = SharedMemoryRegion::attach(region.path()).unwrap();
        assert_eq!(attached.meta_epoch(), 1);
        region.bump_meta_epoch();
        assert_eq!(attached.meta_epoch(), 2);
    }
}
