//! Request submission for the SDK.
//!
//! Everything that talks to the daemon funnels through [`submit`]: it
//! allocates channel buffers, fills the envelope, sends, and consumes
//! `ESTALE` by refreshing the mount metadata and retrying from the
//! allocation step. Staleness never reaches the facade. Append writes
//! skip the retry: the daemon resolves their offset authoritatively and
//! a replay could double-append.

use tracing::debug;

use crate::chnl::channel;
use crate::chnl::protocol::{OpType, RequestEntry, ResponseEntry, OFF_CURRENT, OFF_FILE_SIZE};
use crate::constants::{IOSIZE_MAX, PATHLEN_MAX};
use crate::error::{Errno, Result};
use crate::fdtable::FileHandle;

/// Per-operation snapshot of the file identity, taken under the file
/// lock by the facade.
#[derive(Clone, Copy)]
pub(crate) struct FileCtx {
    pub conn_id: i32,
    pub ino: i64,
    pub common_pl: u64,
    pub flags: i32,
    pub writable: bool,
}

/// Request payload variants.
pub(crate) enum Payload<'a> {
    None,
    Path(&'a str),
    TwoPaths(&'a str, &'a str),
    Bytes(&'a [u8]),
}

impl Payload<'_> {
    fn len(&self) -> usize {
        match self {
            Payload::None => 0,
            Payload::Path(_) => PATHLEN_MAX,
            Payload::TwoPaths(..) => 2 * PATHLEN_MAX,
            Payload::Bytes(b) => b.len(),
        }
    }
}

fn fill_path(buf: &mut [u8], path: &str) {
    buf.fill(0);
    let bytes = path.as_bytes();
    let n = bytes.len().min(buf.len() - 1);
    buf[..n].copy_from_slice(&bytes[..n]);
}

/// Send one request, retrying on staleness, and return the response
/// plus up to `want_rsp` payload bytes.
pub(crate) fn submit(
    conn_id: i32,
    req: RequestEntry,
    payload: Payload<'_>,
    want_rsp: usize,
    stale_retry: bool,
) -> Result<(ResponseEntry, Vec<u8>)> {
    let conn = channel().conn(conn_id).map_err(|e| e.errno())?;
    let req_len = payload.len();

    loop {
        let mut ticket = conn.ticket(req_len, want_rsp).map_err(|e| e.errno())?;

        match &payload {
            Payload::None => {}
            Payload::Path(p) => fill_path(ticket.io_buf_mut(PATHLEN_MAX), p),
            Payload::TwoPaths(a, b) => {
                let buf = ticket.io_buf_mut(2 * PATHLEN_MAX);
                fill_path(&mut buf[..PATHLEN_MAX], a);
                fill_path(&mut buf[PATHLEN_MAX..], b);
            }
            Payload::Bytes(b) => ticket.io_buf_mut(b.len()).copy_from_slice(b),
        }

        {
            let r = ticket.request_mut();
            *r = req;
            r.req_len = req_len as u64;
            r.rsp_len = want_rsp as u64;
        }

        let rsp = ticket.send_recv().map_err(|e| e.errno())?;

        if rsp.error == libc::ESTALE {
            if !stale_retry {
                return Err(Errno::ESTALE);
            }
            debug!("stale request, type {}, refreshing meta", rsp.op_type);
            drop(ticket);
            channel()
                .update_meta(conn_id, rsp.mount_id)
                .map_err(|e| e.errno())?;
            continue;
        }

        let n = (rsp.data_len as usize).min(want_rsp);
        let data = ticket.io_buf(n).to_vec();
        return Ok((rsp, data));
    }
}

/// Single-request read of at most `IOSIZE_MAX` bytes at `off`.
pub(crate) fn file_pread(ctx: &FileCtx, buf: &mut [u8], off: i64) -> Result<usize> {
    if off < 0 {
        return Err(Errno::EINVAL);
    }
    let len = buf.len().min(IOSIZE_MAX);

    let mut req = RequestEntry::new(OpType::Read);
    req.ino = ctx.ino;
    req.offset = off;
    req.length = len as u64;
    req.common_pl = ctx.common_pl;

    let (rsp, data) = submit(ctx.conn_id, req, Payload::None, len, true)?;
    if rsp.res < 0 {
        return Err(Errno(rsp.error));
    }
    buf[..data.len()].copy_from_slice(&data);
    Ok(data.len())
}

/// Single-request write of at most `IOSIZE_MAX` bytes.
///
/// `off` may be `OFF_CURRENT` (use and advance the file position) or a
/// non-negative offset; an `O_APPEND` handle always writes at
/// end-of-file and stores the returned file size back into the
/// position. The caller serializes via `lseek_lock` where required.
pub(crate) fn file_pwrite(
    ctx: &FileCtx,
    file: &FileHandle,
    buf: &[u8],
    off: i64,
) -> Result<usize> {
    use std::sync::atomic::Ordering;

    if !ctx.writable {
        return Err(Errno::EROFS);
    }
    if buf.is_empty() {
        return Ok(0);
    }
    if buf.len() > IOSIZE_MAX {
        debug!("pwrite len {} too big for one request", buf.len());
        return Err(Errno::EFBIG);
    }

    let append = ctx.flags & libc::O_APPEND != 0;
    let wire_off = if append {
        OFF_FILE_SIZE
    } else if off == OFF_CURRENT {
        file.offset.load(Ordering::Acquire)
    } else {
        off
    };
    if wire_off < 0 && wire_off != OFF_FILE_SIZE {
        return Err(Errno::EINVAL);
    }

    let mut req = RequestEntry::new(OpType::Write);
    req.ino = ctx.ino;
    req.offset = wire_off;
    req.length = buf.len() as u64;
    req.flags = ctx.flags as u32;
    req.common_pl = ctx.common_pl;

    let stale_retry = !append;
    let (rsp, _) = submit(ctx.conn_id, req, Payload::Bytes(buf), 0, stale_retry)?;
    if rsp.res < 0 {
        return Err(Errno(rsp.error));
    }

    let written = rsp.res;
    if off == OFF_CURRENT {
        file.offset.fetch_add(written, Ordering::AcqRel);
        if append {
            // The daemon's post-write size is the authoritative position.
            file.offset.store(rsp.aux, Ordering::Release);
        }
    }
    Ok(written as usize)
}

/// Locally-resolvable lseek. `Ok(None)` means SEEK_END, which needs the
/// daemon's authoritative file size.
pub(crate) fn local_lseek(file: &FileHandle, offset: i64, whence: i32) -> Result<Option<i64>> {
    use std::sync::atomic::Ordering;

    let new_offset = match whence {
        libc::SEEK_SET => offset,
        libc::SEEK_CUR => {
            let old = file.offset.load(Ordering::Acquire);
            old.checked_add(offset).ok_or(Errno::EOVERFLOW)?
        }
        libc::SEEK_END => return Ok(None),
        _ => return Err(Errno::EINVAL),
    };

    if new_offset < 0 {
        return Err(Errno::EINVAL);
    }
    file.offset.store(new_offset, Ordering::Release);
    Ok(Some(new_offset))
}

/// SEEK_END delegation.
pub(crate) fn remote_lseek_end(ctx: &FileCtx, file: &FileHandle, offset: i64) -> Result<i64> {
    use std::sync::atomic::Ordering;

    let mut req = RequestEntry::new(OpType::Lseek);
    req.ino = ctx.ino;
    req.offset = offset;
    req.flags = libc::SEEK_END as u32;
    req.common_pl = ctx.common_pl;

    let (rsp, _) = submit(ctx.conn_id, req, Payload::None, 0, true)?;
    if rsp.res < 0 {
        return Err(Errno(rsp.error));
    }
    file.offset.store(rsp.res, Ordering::Release);
    Ok(rsp.res)
}
