//! Directory iteration.
//!
//! A [`Dir`] buffers one page of packed dirents and refills it from the
//! daemon only when drained. The cursor `(d_next_ino, d_next_offset)`
//! continues iteration across pages; `d_next_ino == 0` is the canonical
//! end-of-directory. Once the owning mount is released the next refill
//! observes a dead connection and fails with `ENODEV`.

use zerocopy::FromBytes;

use crate::chnl::protocol::{
    FileStat, OpType, RequestEntry, WireDirent, DIR_END,
};
use crate::constants::DIRENT_BUF_SIZE;
use crate::error::{Errno, Result};

use super::request::{submit, Payload};

const DIRENT_SIZE: usize = std::mem::size_of::<WireDirent>();

/// One directory entry as seen by applications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dirent {
    pub d_ino: u64,
    /// DT_REG / DT_DIR
    pub d_type: u32,
    pub d_name: String,
}

/// A dirent paired with the entry's stat record.
#[derive(Debug, Clone)]
pub struct DirentPlus {
    pub dirent: Dirent,
    pub stat: FileStat,
}

/// An open directory iterator.
pub struct Dir {
    d_ino: i64,
    d_next_ino: u64,
    d_next_offset: i64,
    d_data: [u8; DIRENT_BUF_SIZE],
    d_data_offset: usize,
    d_data_size: usize,
    d_conn_id: i32,
}

impl Dir {
    pub(crate) fn new(conn_id: i64, dino: i64, first_ino: u64) -> Box<Dir> {
        Box::new(Dir {
            d_ino: dino,
            d_next_ino: first_ino,
            d_next_offset: 0,
            d_data: [0; DIRENT_BUF_SIZE],
            d_data_offset: 0,
            d_data_size: 0,
            d_conn_id: conn_id as i32,
        })
    }

    pub(crate) fn conn_id(&self) -> i32 {
        self.d_conn_id
    }

    fn pop_buffered(&mut self) -> Option<Dirent> {
        if self.d_data_offset >= self.d_data_size {
            return None;
        }
        let raw = &self.d_data[self.d_data_offset..self.d_data_offset + DIRENT_SIZE];
        let ent = WireDirent::read_from_bytes(raw).ok()?;
        self.d_data_offset += DIRENT_SIZE;
        debug_assert!(self.d_data_offset <= self.d_data_size);
        Some(Dirent {
            d_ino: ent.ino,
            d_type: ent.etype,
            d_name: ent.name().to_string(),
        })
    }

    /// Next entry, fetching a fresh page when the buffer is drained.
    /// `Ok(None)` is end-of-directory.
    pub(crate) fn next_entry(&mut self) -> Result<Option<Dirent>> {
        if let Some(ent) = self.pop_buffered() {
            return Ok(Some(ent));
        }
        self.d_data_offset = 0;
        self.d_data_size = 0;

        if self.d_next_ino == 0 {
            return Ok(None);
        }

        let mut req = RequestEntry::new(OpType::Readdir);
        req.ino = self.d_ino;
        req.aux = self.d_next_ino;
        req.offset = self.d_next_offset;

        let (rsp, data) = submit(self.d_conn_id, req, Payload::None, DIRENT_BUF_SIZE, true)?;

        if rsp.res != 0 {
            // Dir EOF is not an error.
            if rsp.res == DIR_END {
                self.d_next_ino = 0;
                return Ok(None);
            }
            return Err(Errno(rsp.error));
        }

        let n = data.len().min(DIRENT_BUF_SIZE);
        self.d_data[..n].copy_from_slice(&data[..n]);
        self.d_data_size = n - n % DIRENT_SIZE;
        self.d_next_ino = rsp.aux as u64;
        self.d_next_offset = rsp.aux2;

        Ok(self.pop_buffered())
    }
}
