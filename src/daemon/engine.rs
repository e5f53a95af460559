//! The filesystem service behind the channel.
//!
//! [`FsEngine`] is the interface the daemon dispatches wire requests
//! into — the on-device engine in production deployments. [`MemFs`] is
//! the in-memory reference engine: it implements the full operation
//! set with POSIX semantics and backs the embedded daemon and the test
//! suite.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use tracing::debug;

use crate::chnl::protocol::{FileStat, WireDirent, DIRENTS_PER_PAGE, OFF_FILE_SIZE};
use crate::error::{Errno, Result};

/// Result of an OPEN.
#[derive(Debug, Clone, Copy)]
pub struct OpenResult {
    pub ino: i64,
    pub offset: i64,
    pub common_pl: u64,
}

/// Result of a WRITE; `file_size` feeds the append offset writeback.
#[derive(Debug, Clone, Copy)]
pub struct WriteResult {
    pub written: usize,
    pub file_size: i64,
}

/// One READDIR page plus the continuation cursor.
#[derive(Debug, Clone)]
pub struct ReaddirPage {
    pub data: Vec<u8>,
    pub next_ino: u64,
    pub next_offset: i64,
}

/// The service the channel peer implements.
pub trait FsEngine: Send + Sync {
    fn open(&self, path: &str, flags: i32, mode: u32) -> Result<OpenResult>;
    fn read(&self, ino: i64, off: i64, len: usize) -> Result<Vec<u8>>;
    /// `off == OFF_FILE_SIZE` appends at end-of-file atomically.
    fn write(&self, ino: i64, off: i64, data: &[u8]) -> Result<WriteResult>;
    fn lseek_end(&self, ino: i64, off: i64) -> Result<i64>;
    fn stat(&self, path: &str) -> Result<FileStat>;
    fn fstat(&self, ino: i64) -> Result<FileStat>;
    fn truncate(&self, path: &str, len: i64) -> Result<()>;
    fn ftruncate(&self, ino: i64, len: i64) -> Result<()>;
    fn fallocate(&self, ino: i64, mode: u32, off: i64, len: i64) -> Result<()>;
    fn unlink(&self, path: &str) -> Result<()>;
    fn rename(&self, oldpath: &str, newpath: &str, noreplace: bool) -> Result<()>;
    fn mkdir(&self, path: &str, mode: u32) -> Result<()>;
    fn rmdir(&self, path: &str) -> Result<()>;
    /// Returns the directory inode and the first entry inode (0 when
    /// the directory is empty).
    fn opendir(&self, path: &str) -> Result<(i64, u64)>;
    /// `None` is end-of-directory.
    fn readdir(&self, dino: i64, next_ino: u64, next_offset: i64) -> Result<Option<ReaddirPage>>;
    fn access(&self, path: &str, amode: i32) -> Result<()>;
    fn chdir(&self, path: &str) -> Result<()>;
    fn growfs(&self) -> Result<()>;
    fn increase_epoch(&self) -> Result<()>;
}

const ROOT_INO: u64 = 1;

/// Capacity granted at creation and added per growfs.
const CAPACITY_STEP: i64 = 1 << 30;

enum NodeKind {
    File(Vec<u8>),
    Dir(BTreeMap<String, u64>),
}

struct Node {
    kind: NodeKind,
    mtime: i64,
}

impl Node {
    fn dir() -> Self {
        Node {
            kind: NodeKind::Dir(BTreeMap::new()),
            mtime: now(),
        }
    }

    fn file() -> Self {
        Node {
            kind: NodeKind::File(Vec::new()),
            mtime: now(),
        }
    }

    fn entries(&self) -> Option<&BTreeMap<String, u64>> {
        match &self.kind {
            NodeKind::Dir(m) => Some(m),
            _ => None,
        }
    }

    fn data(&self) -> Option<&Vec<u8>> {
        match &self.kind {
            NodeKind::File(d) => Some(d),
            _ => None,
        }
    }
}

fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

struct MemFsInner {
    nodes: HashMap<u64, Node>,
    next_ino: u64,
    next_pl: u64,
    capacity: i64,
    used: i64,
    write_epoch: u64,
}

/// In-memory reference engine for one PBD.
pub struct MemFs {
    pbd: String,
    inner: Mutex<MemFsInner>,
}

impl MemFs {
    pub fn new(pbd: &str) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_INO, Node::dir());
        Self {
            pbd: pbd.to_string(),
            inner: Mutex::new(MemFsInner {
                nodes,
                next_ino: ROOT_INO + 1,
                next_pl: 1,
                capacity: CAPACITY_STEP,
                used: 0,
                write_epoch: 1,
            }),
        }
    }

    pub fn pbd(&self) -> &str {
        &self.pbd
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemFsInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Split `/pbd/a/b` into `["a", "b"]`, checking the PBD segment.
    fn components<'a>(&self, path: &'a str) -> Result<Vec<&'a str>> {
        let mut it = path.split('/').filter(|s| !s.is_empty());
        match it.next() {
            Some(first) if first == self.pbd => Ok(it.collect()),
            Some(_) => Err(Errno::ENODEV),
            None => Err(Errno::EINVAL),
        }
    }
}

impl MemFsInner {
    fn node(&self, ino: u64) -> Result<&Node> {
        self.nodes.get(&ino).ok_or(Errno::EBADF)
    }

    fn node_mut(&mut self, ino: u64) -> Result<&mut Node> {
        self.nodes.get_mut(&ino).ok_or(Errno::EBADF)
    }

    fn walk(&self, comps: &[&str]) -> Result<u64> {
        let mut ino = ROOT_INO;
        for name in comps {
            let node = self.node(ino)?;
            let entries = node.entries().ok_or(Errno::ENOTDIR)?;
            ino = *entries.get(*name).ok_or(Errno::ENOENT)?;
        }
        Ok(ino)
    }

    /// Parent directory inode plus the final component.
    fn walk_parent<'a>(&self, comps: &[&'a str]) -> Result<(u64, &'a str)> {
        let (last, rest) = comps.split_last().ok_or(Errno::EINVAL)?;
        let dino = self.walk(rest)?;
        if self.node(dino)?.entries().is_none() {
            return Err(Errno::ENOTDIR);
        }
        Ok((dino, last))
    }

    fn stat_of(&self, ino: u64) -> Result<FileStat> {
        let node = self.node(ino)?;
        Ok(match &node.kind {
            NodeKind::File(data) => FileStat::file(ino, data.len() as i64, node.mtime),
            NodeKind::Dir(entries) => FileStat::dir(ino, entries.len() as u32, node.mtime),
        })
    }

    fn resize_file(&mut self, ino: u64, len: i64) -> Result<()> {
        if len < 0 {
            return Err(Errno::EINVAL);
        }
        let used = self.used;
        let capacity = self.capacity;
        let node = self.node_mut(ino)?;
        let data = match &mut node.kind {
            NodeKind::File(d) => d,
            NodeKind::Dir(_) => return Err(Errno::EISDIR),
        };
        let delta = len - data.len() as i64;
        if delta > 0 && used + delta > capacity {
            return Err(Errno::ENOSPC);
        }
        data.resize(len as usize, 0);
        node.mtime = now();
        self.used += delta;
        Ok(())
    }

    /// Sorted-entry view of a directory with stable positions.
    fn dir_list(&self, dino: u64) -> Result<Vec<(String, u64)>> {
        let entries = self
            .node(dino)?
            .entries()
            .ok_or(Errno::ENOTDIR)?;
        Ok(entries
            .iter()
            .map(|(name, ino)| (name.clone(), *ino))
            .collect())
    }
}

impl FsEngine for MemFs {
    fn open(&self, path: &str, flags: i32, _mode: u32) -> Result<OpenResult> {
        let comps = self.components(path)?;
        let mut inner = self.lock();

        let accmode = flags & libc::O_ACCMODE;
        let wants_write = accmode == libc::O_WRONLY || accmode == libc::O_RDWR;

        let ino = match inner.walk(&comps) {
            Ok(ino) => {
                if flags & libc::O_CREAT != 0 && flags & libc::O_EXCL != 0 {
                    return Err(Errno::EEXIST);
                }
                if inner.node(ino)?.entries().is_some() && (wants_write || flags & libc::O_TRUNC != 0)
                {
                    return Err(Errno::EISDIR);
                }
                if flags & libc::O_TRUNC != 0 {
                    inner.resize_file(ino, 0)?;
                }
                ino
            }
            Err(Errno::ENOENT) if flags & libc::O_CREAT != 0 => {
                let (dino, name) = inner.walk_parent(&comps)?;
                let ino = inner.next_ino;
                inner.next_ino += 1;
                inner.nodes.insert(ino, Node::file());
                match &mut inner.node_mut(dino)?.kind {
                    NodeKind::Dir(entries) => {
                        entries.insert(name.to_string(), ino);
                    }
                    NodeKind::File(_) => return Err(Errno::ENOTDIR),
                }
                ino
            }
            Err(e) => return Err(e),
        };

        let common_pl = inner.next_pl;
        inner.next_pl += 1;
        debug!("open {} -> ino {} pl {}", path, ino, common_pl);
        Ok(OpenResult {
            ino: ino as i64,
            offset: 0,
            common_pl,
        })
    }

    fn read(&self, ino: i64, off: i64, len: usize) -> Result<Vec<u8>> {
        if off < 0 {
            return Err(Errno::EINVAL);
        }
        let inner = self.lock();
        let data = inner.node(ino as u64)?.data().ok_or(Errno::EISDIR)?;
        let off = off as usize;
        if off >= data.len() {
            return Ok(Vec::new());
        }
        let end = (off + len).min(data.len());
        Ok(data[off..end].to_vec())
    }

    fn write(&self, ino: i64, off: i64, data: &[u8]) -> Result<WriteResult> {
        let mut inner = self.lock();
        let used = inner.used;
        let capacity = inner.capacity;
        let node = inner.node_mut(ino as u64)?;
        let file = match &mut node.kind {
            NodeKind::File(d) => d,
            NodeKind::Dir(_) => return Err(Errno::EISDIR),
        };

        let off = if off == OFF_FILE_SIZE {
            file.len() as i64
        } else if off < 0 {
            return Err(Errno::EINVAL);
        } else {
            off
        } as usize;

        let new_len = (off + data.len()).max(file.len());
        let delta = new_len as i64 - file.len() as i64;
        if delta > 0 && used + delta > capacity {
            return Err(Errno::ENOSPC);
        }
        if new_len > file.len() {
            file.resize(new_len, 0);
        }
        file[off..off + data.len()].copy_from_slice(data);
        let file_size = file.len() as i64;
        node.mtime = now();
        inner.used += delta;

        Ok(WriteResult {
            written: data.len(),
            file_size,
        })
    }

    fn lseek_end(&self, ino: i64, off: i64) -> Result<i64> {
        let inner = self.lock();
        let data = inner.node(ino as u64)?.data().ok_or(Errno::EISDIR)?;
        let pos = data.len() as i64 + off;
        if pos < 0 {
            return Err(Errno::EINVAL);
        }
        Ok(pos)
    }

    fn stat(&self, path: &str) -> Result<FileStat> {
        let comps = self.components(path)?;
        let inner = self.lock();
        let ino = inner.walk(&comps)?;
        inner.stat_of(ino)
    }

    fn fstat(&self, ino: i64) -> Result<FileStat> {
        let inner = self.lock();
        inner.stat_of(ino as u64)
    }

    fn truncate(&self, path: &str, len: i64) -> Result<()> {
        let comps = self.components(path)?;
        let mut inner = self.lock();
        let ino = inner.walk(&comps)?;
        inner.resize_file(ino, len)
    }

    fn ftruncate(&self, ino: i64, len: i64) -> Result<()> {
        let mut inner = self.lock();
        inner.resize_file(ino as u64, len)
    }

    fn fallocate(&self, ino: i64, mode: u32, off: i64, len: i64) -> Result<()> {
        if mode != 0 {
            return Err(Errno::EINVAL);
        }
        if off < 0 || len <= 0 {
            return Err(Errno::EINVAL);
        }
        let mut inner = self.lock();
        let cur = inner
            .node(ino as u64)?
            .data()
            .ok_or(Errno::EISDIR)?
            .len() as i64;
        if off + len > cur {
            inner.resize_file(ino as u64, off + len)?;
        }
        Ok(())
    }

    fn unlink(&self, path: &str) -> Result<()> {
        let comps = self.components(path)?;
        let mut inner = self.lock();
        let (dino, name) = inner.walk_parent(&comps)?;
        let ino = inner.walk(&comps)?;
        if inner.node(ino)?.entries().is_some() {
            return Err(Errno::EISDIR);
        }
        let size = inner.node(ino)?.data().map(|d| d.len() as i64).unwrap_or(0);
        if let NodeKind::Dir(entries) = &mut inner.node_mut(dino)?.kind {
            entries.remove(name);
        }
        inner.nodes.remove(&ino);
        inner.used -= size;
        Ok(())
    }

    fn rename(&self, oldpath: &str, newpath: &str, noreplace: bool) -> Result<()> {
        let old = self.components(oldpath)?;
        let new = self.components(newpath)?;
        let mut inner = self.lock();

        let ino = inner.walk(&old)?;
        if old == new {
            return Ok(());
        }

        let (new_dino, new_name) = inner.walk_parent(&new)?;
        match inner.walk(&new) {
            Ok(target) => {
                if noreplace {
                    return Err(Errno::EEXIST);
                }
                let src_is_dir = inner.node(ino)?.entries().is_some();
                let dst = inner.node(target)?;
                match dst.entries() {
                    Some(entries) => {
                        if !src_is_dir {
                            return Err(Errno::EISDIR);
                        }
                        if !entries.is_empty() {
                            return Err(Errno::ENOTEMPTY);
                        }
                    }
                    None => {
                        if src_is_dir {
                            return Err(Errno::ENOTDIR);
                        }
                    }
                }
                let size = dst.data().map(|d| d.len() as i64).unwrap_or(0);
                inner.nodes.remove(&target);
                inner.used -= size;
            }
            Err(Errno::ENOENT) => {}
            Err(e) => return Err(e),
        }

        let (old_dino, old_name) = inner.walk_parent(&old)?;
        if let NodeKind::Dir(entries) = &mut inner.node_mut(old_dino)?.kind {
            entries.remove(old_name);
        }
        if let NodeKind::Dir(entries) = &mut inner.node_mut(new_dino)?.kind {
            entries.insert(new_name.to_string(), ino);
        }
        Ok(())
    }

    fn mkdir(&self, path: &str, _mode: u32) -> Result<()> {
        let comps = self.components(path)?;
        let mut inner = self.lock();
        let (dino, name) = inner.walk_parent(&comps)?;
        if inner.walk(&comps).is_ok() {
            return Err(Errno::EEXIST);
        }
        let ino = inner.next_ino;
        inner.next_ino += 1;
        inner.nodes.insert(ino, Node::dir());
        if let NodeKind::Dir(entries) = &mut inner.node_mut(dino)?.kind {
            entries.insert(name.to_string(), ino);
        }
        Ok(())
    }

    fn rmdir(&self, path: &str) -> Result<()> {
        let comps = self.components(path)?;
        if comps.is_empty() {
            // The PBD root cannot be removed.
            return Err(Errno::EBUSY);
        }
        let mut inner = self.lock();
        let ino = inner.walk(&comps)?;
        let entries = inner.node(ino)?.entries().ok_or(Errno::ENOTDIR)?;
        if !entries.is_empty() {
            return Err(Errno::ENOTEMPTY);
        }
        let (dino, name) = inner.walk_parent(&comps)?;
        if let NodeKind::Dir(entries) = &mut inner.node_mut(dino)?.kind {
            entries.remove(name);
        }
        inner.nodes.remove(&ino);
        Ok(())
    }

    fn opendir(&self, path: &str) -> Result<(i64, u64)> {
        let comps = self.components(path)?;
        let inner = self.lock();
        let dino = inner.walk(&comps)?;
        let list = inner.dir_list(dino)?;
        let first = list.first().map(|(_, ino)| *ino).unwrap_or(0);
        Ok((dino as i64, first))
    }

    fn readdir(&self, dino: i64, _next_ino: u64, next_offset: i64) -> Result<Option<ReaddirPage>> {
        let inner = self.lock();
        let list = inner.dir_list(dino as u64)?;

        let start = next_offset.max(0) as usize;
        if start >= list.len() {
            return Ok(None);
        }

        let end = (start + DIRENTS_PER_PAGE).min(list.len());
        let mut data = Vec::with_capacity((end - start) * std::mem::size_of::<WireDirent>());
        for (name, ino) in &list[start..end] {
            let etype = if inner.node(*ino)?.entries().is_some() {
                libc::DT_DIR as u32
            } else {
                libc::DT_REG as u32
            };
            let ent = WireDirent::new(*ino, etype, name);
            data.extend_from_slice(zerocopy::IntoBytes::as_bytes(&ent));
        }

        let next_ino = list.get(end).map(|(_, ino)| *ino).unwrap_or(0);
        Ok(Some(ReaddirPage {
            data,
            next_ino,
            next_offset: end as i64,
        }))
    }

    fn access(&self, path: &str, amode: i32) -> Result<()> {
        if amode != libc::F_OK && amode & (libc::R_OK | libc::W_OK | libc::X_OK) == 0 {
            return Err(Errno::EINVAL);
        }
        let comps = self.components(path)?;
        let inner = self.lock();
        inner.walk(&comps).map(|_| ())
    }

    fn chdir(&self, path: &str) -> Result<()> {
        let comps = self.components(path)?;
        let inner = self.lock();
        let ino = inner.walk(&comps)?;
        if inner.node(ino)?.entries().is_none() {
            return Err(Errno::ENOTDIR);
        }
        Ok(())
    }

    fn growfs(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.capacity += CAPACITY_STEP;
        debug!("growfs {}: capacity {}", self.pbd, inner.capacity);
        Ok(())
    }

    fn increase_epoch(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.write_epoch += 1;
        debug!("epoch {} -> {}", self.pbd, inner.write_epoch);
        Ok(())
    }
}
