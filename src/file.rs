//! [`PreloadFile`]: an in-memory buffered open file handle (§3, §4.E).
//!
//! `PreloadFile` holds the whole file in memory and tracks dirtiness; the
//! actual persistence strategy (write the buffer back to a key-value store,
//! write through to an overlay's upper backend, mirror to an async backend,
//! or do nothing for a pure in-memory backend) is supplied by whoever opened
//! the file, through the [`FilePersist`] trait. This keeps the file handle
//! itself free of a back-reference to its owning filesystem (§9 "Cyclic
//! graphs / back-references": pass the filesystem in explicitly rather than
//! storing it inside the file).

use crate::cred::Credentials;
use crate::error::{Error, Result};
use crate::flags::FileFlag;
use crate::stats::Stats;

/// Supplies the persistence strategy for a [`PreloadFile`]. Implemented
/// once per backend (in-memory store, overlay upper, async mirror).
pub trait FilePersist: std::fmt::Debug + Send + Sync {
    /// Write `buffer` and `stats` back to the backend. Called by
    /// `sync`/`close`.
    fn persist(&self, path: &str, buffer: &[u8], stats: &Stats) -> Result<()>;
}

/// A backend that performs no persistence at all (the in-memory backend's
/// files: writes only ever mutate the buffer already held by the store).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPersist;

impl FilePersist for NoopPersist {
    fn persist(&self, _path: &str, _buffer: &[u8], _stats: &Stats) -> Result<()> {
        Ok(())
    }
}

/// An open, fully-buffered file handle.
#[derive(Debug)]
pub struct PreloadFile {
    path: String,
    flag: FileFlag,
    stats: Stats,
    buffer: Vec<u8>,
    pos: u64,
    dirty: bool,
    persist: Box<dyn FilePersist>,
}

impl PreloadFile {
    /// Construct a new handle. If `flag` is readable, `stats.size` must
    /// equal `buffer.len()` (the invariant from §3); writable-only modes
    /// may diverge, since `open` with `CREATE_FILE`/`TRUNCATE_FILE` may
    /// start from an empty buffer regardless of a stale `stats.size`.
    pub fn new(
        path: impl Into<String>,
        flag: FileFlag,
        mut stats: Stats,
        buffer: Vec<u8>,
        persist: Box<dyn FilePersist>,
    ) -> Self {
        if flag.is_readable() {
            stats.size = buffer.len() as u32;
        }
        PreloadFile {
            path: path.into(),
            flag,
            stats,
            buffer,
            pos: 0,
            dirty: false,
            persist,
        }
    }

    /// The path this handle was opened against.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The flag this handle was opened with.
    pub fn flag(&self) -> FileFlag {
        self.flag
    }

    /// A snapshot of the current metadata.
    pub fn stat(&self) -> Stats {
        self.stats
    }

    /// The effective read/write position: `stat.size` when appendable
    /// (POSIX-on-Linux append semantics — position is ignored), else the
    /// internally tracked position.
    pub fn get_pos(&self) -> u64 {
        if self.flag.is_appendable() {
            u64::from(self.stats.size)
        } else {
            self.pos
        }
    }

    /// Seek to an absolute position (ignored while appendable; the next
    /// write still targets end-of-file).
    pub fn seek(&mut self, pos: u64) {
        self.pos = pos;
    }

    /// Read up to `len` bytes at the current position into `out`, clamped
    /// so `pos + len <= size`. Advances the position and updates `atime`.
    /// Requires the readable flag.
    pub fn read(&mut self, out: &mut [u8]) -> Result<usize> {
        if !self.flag.is_readable() {
            return Err(Error::perm(format!("file not opened for reading: {}", self.path)));
        }
        let pos = self.get_pos();
        let size = u64::from(self.stats.size);
        if pos >= size {
            return Ok(0);
        }
        let avail = (size - pos) as usize;
        let len = out.len().min(avail);
        let start = pos as usize;
        out[..len].copy_from_slice(&self.buffer[start..start + len]);
        self.pos = pos + len as u64;
        self.stats.atime_ms = crate::time::now_ms();
        Ok(len)
    }

    /// Write `data` at the current position. Grows the buffer if the write
    /// extends past the current size. Requires the writable flag. Always
    /// returns the number of bytes written this call, POSIX semantics
    /// (§9 Open Questions flags a source discrepancy where the
    /// synchronous-flag branch returned the buffer's post-write total
    /// length instead; this crate doesn't reproduce it).
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        if !self.flag.is_writable() {
            return Err(Error::perm(format!("file not opened for writing: {}", self.path)));
        }
        self.dirty = true;
        let pos = self.get_pos();
        let end = pos + data.len() as u64;
        if end > u64::from(self.stats.size) {
            self.buffer.resize(end as usize, 0);
            self.stats.size = end as u32;
        }
        let start = pos as usize;
        self.buffer[start..start + data.len()].copy_from_slice(data);
        self.stats.mtime_ms = crate::time::now_ms();
        self.pos = end;

        if self.flag.is_synchronous() {
            self.sync_now()?;
        }
        Ok(data.len())
    }

    /// Truncate (or extend with zero bytes) to `len`. Requires the writable
    /// flag.
    pub fn truncate(&mut self, len: u64) -> Result<()> {
        if !self.flag.is_writable() {
            return Err(Error::perm(format!("file not opened for writing: {}", self.path)));
        }
        let current = u64::from(self.stats.size);
        if len > current {
            let zeros = vec![0u8; (len - current) as usize];
            let saved_pos = self.pos;
            self.pos = current;
            self.write(&zeros)?;
            self.pos = saved_pos;
        } else {
            self.buffer.truncate(len as usize);
            self.stats.size = len as u32;
            self.dirty = true;
        }
        self.stats.mtime_ms = crate::time::now_ms();
        Ok(())
    }

    /// The buffer's current contents.
    pub fn data(&self) -> &[u8] {
        &self.buffer
    }

    /// `chmod`: mutate metadata and sync.
    pub fn chmod(&mut self, perm: u16) -> Result<()> {
        self.stats.chmod(perm);
        self.dirty = true;
        self.sync_now()
    }

    /// `chown`: mutate metadata and sync.
    pub fn chown(&mut self, uid: Option<f64>, gid: Option<f64>) -> Result<()> {
        self.stats.chown(uid, gid);
        self.dirty = true;
        self.sync_now()
    }

    /// Set access/modification times and sync.
    pub fn utimes(&mut self, atime_ms: f64, mtime_ms: f64) -> Result<()> {
        self.stats.atime_ms = atime_ms;
        self.stats.mtime_ms = mtime_ms;
        self.dirty = true;
        self.sync_now()
    }

    /// Push the buffer (and, if anything changed, the metadata) back to
    /// the backend via the supplied [`FilePersist`].
    pub fn sync_now(&mut self) -> Result<()> {
        self.persist.persist(&self.path, &self.buffer, &self.stats)?;
        self.dirty = false;
        Ok(())
    }

    /// Whether this handle has unsynced writes.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// `close` implies `sync`.
    pub fn close(mut self) -> Result<()> {
        self.sync_now()
    }

    /// Check whether `cred` may open this file under `flag`, against
    /// `stats`'s owner/group/other bits.
    pub fn check_open_permission(stats: &Stats, flag: &FileFlag, cred: &Credentials) -> Result<()> {
        if stats.check_access(cred, flag.access_mode_bits()) {
            Ok(())
        } else {
            Err(Error::access("permission denied"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::FileType;

    fn flag(s: &str) -> FileFlag {
        FileFlag::from_str(s).unwrap()
    }

    fn stats(size: u32) -> Stats {
        Stats::new(FileType::File, 0o644, 0, 0, 0.0, size)
    }

    #[test]
    fn write_then_read_returns_same_bytes() {
        let mut f = PreloadFile::new("/a", flag("w+"), stats(0), vec![], Box::new(NoopPersist));
        f.write(b"hello").unwrap();
        f.seek(0);
        let mut out = [0u8; 5];
        let n = f.read(&mut out).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn append_ignores_seek_position() {
        let mut f = PreloadFile::new("/a", flag("a"), stats(0), b"abc".to_vec(), Box::new(NoopPersist));
        f.seek(0);
        f.write(b"def").unwrap();
        assert_eq!(f.data(), b"abcdef");
    }

    #[test]
    fn read_requires_readable_flag() {
        let mut f = PreloadFile::new("/a", flag("a"), stats(0), vec![], Box::new(NoopPersist));
        let mut out = [0u8; 1];
        assert!(f.read(&mut out).is_err());
    }

    #[test]
    fn write_requires_writable_flag() {
        let mut f = PreloadFile::new("/a", flag("r"), stats(0), vec![], Box::new(NoopPersist));
        assert!(f.write(b"x").is_err());
    }

    #[test]
    fn synchronous_write_still_returns_bytes_written_this_call() {
        let mut f = PreloadFile::new("/a", flag("rs+"), stats(0), vec![], Box::new(NoopPersist));
        assert_eq!(f.write(b"hello").unwrap(), 5);
        assert_eq!(f.write(b"!!").unwrap(), 2);
        assert_eq!(f.data(), b"hello!!");
    }

    #[test]
    fn truncate_shrinks_and_grows() {
        let mut f = PreloadFile::new("/a", flag("r+"), stats(3), b"abc".to_vec(), Box::new(NoopPersist));
        f.truncate(1).unwrap();
        assert_eq!(f.data(), b"a");
        f.truncate(3).unwrap();
        assert_eq!(f.data(), b"a\0\0");
    }

    #[test]
    fn truncate_to_current_size_is_a_noop_on_bytes() {
        let mut f = PreloadFile::new("/a", flag("r+"), stats(3), b"abc".to_vec(), Box::new(NoopPersist));
        f.truncate(3).unwrap();
        assert_eq!(f.data(), b"abc");
    }
}
