//! The process-wide mount table and dispatcher (§4.M).
//!
//! [`Vfs`] holds a table of `prefix -> backend` mounts (longest normalized
//! prefix wins) and dispatches every path-based operation to whichever
//! backend covers it, rewriting paths in both directions: the user-visible
//! absolute path is stripped down to the backend-relative path going in, and
//! any error's path is rewritten back to the user-visible path coming out
//! (the same trick [`crate::folder_adapter::FolderAdapter`] uses one layer
//! down). A root in-memory filesystem is mounted at `/` by default so the
//! table is never empty. Open file handles live in a process-wide
//! descriptor table keyed by integers starting at 100, independent of which
//! backend they came from.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::cred::Credentials;
use crate::error::{Error, Result};
use crate::file::PreloadFile;
use crate::flags::FileFlag;
use crate::fs::FileSystem;
use crate::kv::engine::KeyValueFileSystem;
use crate::kv::memory::InMemoryStore;
use crate::pathutil;
use crate::stats::{FileType, Stats};

struct MountEntry {
    prefix: String,
    backend: Arc<dyn FileSystem>,
}

/// The mount table and file descriptor table.
pub struct Vfs {
    mounts: RwLock<Vec<MountEntry>>,
    next_fd: AtomicU32,
    open_files: Mutex<HashMap<u32, PreloadFile>>,
}

impl std::fmt::Debug for Vfs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mounts = self.mounts.read();
        f.debug_struct("Vfs")
            .field("mounts", &mounts.iter().map(|m| m.prefix.clone()).collect::<Vec<_>>())
            .finish()
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs {
    /// A fresh table with an empty in-memory filesystem mounted at `/`.
    pub fn new() -> Self {
        let vfs = Vfs {
            mounts: RwLock::new(Vec::new()),
            next_fd: AtomicU32::new(100),
            open_files: Mutex::new(HashMap::new()),
        };
        let root: Arc<dyn FileSystem> =
            Arc::new(KeyValueFileSystem::new(InMemoryStore::new()).expect("in-memory root never fails to initialize"));
        vfs.mounts.write().push(MountEntry { prefix: "/".to_string(), backend: root });
        vfs
    }

    /// Replace the whole mount table: unmounts `/` if present, then mounts
    /// every entry in `mounts`, in key order.
    pub fn initialize(&self, mounts: BTreeMap<String, Arc<dyn FileSystem>>) -> Result<()> {
        self.unmount("/");
        for (prefix, backend) in mounts {
            self.mount(&prefix, backend)?;
        }
        Ok(())
    }

    /// Mount `backend` at `prefix`, replacing any existing mount there.
    /// Fails with `EINVAL` if `backend`'s availability check (`stat("/")`)
    /// fails.
    pub fn mount(&self, prefix: &str, backend: Arc<dyn FileSystem>) -> Result<()> {
        let normalized = pathutil::normalize(prefix);
        if backend.stat("/", &Credentials::root()).is_err() {
            return Err(Error::invalid(format!("backend for mount {normalized} failed its availability check")));
        }
        let mut mounts = self.mounts.write();
        mounts.retain(|e| e.prefix != normalized);
        mounts.push(MountEntry { prefix: normalized, backend });
        Ok(())
    }

    /// Unmount `prefix`, if mounted. A no-op otherwise.
    pub fn unmount(&self, prefix: &str) {
        let normalized = pathutil::normalize(prefix);
        self.mounts.write().retain(|e| e.prefix != normalized);
    }

    fn strip_mount(prefix: &str, path: &str) -> String {
        if prefix == "/" {
            path.to_string()
        } else if path == prefix {
            "/".to_string()
        } else {
            path[prefix.len()..].to_string()
        }
    }

    fn resolve(&self, path: &str) -> Result<(Arc<dyn FileSystem>, String, String)> {
        let mounts = self.mounts.read();
        let mut best: Option<&MountEntry> = None;
        for entry in mounts.iter() {
            let covers = entry.prefix == "/" || path == entry.prefix || path.starts_with(&format!("{}/", entry.prefix));
            if covers && best.map_or(true, |b| entry.prefix.len() > b.prefix.len()) {
                best = Some(entry);
            }
        }
        let entry = best.ok_or_else(|| Error::not_found(format!("no filesystem mounted covering {path}")))?;
        let rel = Self::strip_mount(&entry.prefix, path);
        Ok((entry.backend.clone(), entry.prefix.clone(), rel))
    }

    fn dispatch<T>(&self, path: &str, op: impl FnOnce(&dyn FileSystem, &str) -> Result<T>) -> Result<T> {
        let normalized = pathutil::normalize(path);
        let (backend, _prefix, rel) = self.resolve(&normalized)?;
        op(backend.as_ref(), &rel).map_err(|mut e| {
            e.rewrite_path(&rel, &normalized);
            e
        })
    }

    // -- path operations --------------------------------------------------

    /// `stat`.
    pub fn stat(&self, path: &str, cred: &Credentials) -> Result<Stats> {
        self.dispatch(path, |backend, rel| backend.stat(rel, cred))
    }

    /// `exists`.
    pub fn exists(&self, path: &str, cred: &Credentials) -> bool {
        self.dispatch(path, |backend, rel| Ok(backend.exists(rel, cred))).unwrap_or(false)
    }

    /// `unlink`.
    pub fn unlink(&self, path: &str, cred: &Credentials) -> Result<()> {
        self.dispatch(path, |backend, rel| backend.unlink(rel, cred))
    }

    /// `mkdir`.
    pub fn mkdir(&self, path: &str, mode: u16, cred: &Credentials) -> Result<()> {
        self.dispatch(path, |backend, rel| backend.mkdir(rel, mode, cred))
    }

    /// `rmdir`.
    pub fn rmdir(&self, path: &str, cred: &Credentials) -> Result<()> {
        self.dispatch(path, |backend, rel| backend.rmdir(rel, cred))
    }

    /// `chmod`.
    pub fn chmod(&self, path: &str, perm: u16, cred: &Credentials) -> Result<()> {
        self.dispatch(path, |backend, rel| backend.chmod(rel, perm, cred))
    }

    /// `chown`.
    pub fn chown(&self, path: &str, uid: Option<f64>, gid: Option<f64>, cred: &Credentials) -> Result<()> {
        self.dispatch(path, |backend, rel| backend.chown(rel, uid, gid, cred))
    }

    /// `utimes`.
    pub fn utimes(&self, path: &str, atime_ms: f64, mtime_ms: f64, cred: &Credentials) -> Result<()> {
        self.dispatch(path, |backend, rel| backend.utimes(rel, atime_ms, mtime_ms, cred))
    }

    /// `symlink`: `target` is stored as literal text, not resolved through
    /// the mount table; only `new_path` picks the backend.
    pub fn symlink(&self, target: &str, new_path: &str, cred: &Credentials) -> Result<()> {
        self.dispatch(new_path, |backend, rel_new| backend.symlink(target, rel_new, cred))
    }

    /// `readlink`.
    pub fn readlink(&self, path: &str, cred: &Credentials) -> Result<String> {
        self.dispatch(path, |backend, rel| backend.readlink(rel, cred))
    }

    /// `link`. Hard links cannot cross mount points.
    pub fn link(&self, target: &str, new_path: &str, cred: &Credentials) -> Result<()> {
        let norm_target = pathutil::normalize(target);
        let norm_new = pathutil::normalize(new_path);
        let (backend_t, prefix_t, rel_t) = self.resolve(&norm_target)?;
        let (_backend_new, prefix_new, rel_new) = self.resolve(&norm_new)?;
        if prefix_t != prefix_new {
            return Err(Error::perm("hard links cannot cross mount points"));
        }
        backend_t.link(&rel_t, &rel_new, cred).map_err(|mut e| {
            e.rewrite_path(&rel_t, &norm_target);
            e.rewrite_path(&rel_new, &norm_new);
            e
        })
    }

    /// `rename`. Same-backend renames delegate directly; cross-mount
    /// renames fall back to read + write + unlink, since there's no atomic
    /// rename across two independent backends.
    pub fn rename(&self, old: &str, new: &str, cred: &Credentials) -> Result<()> {
        let norm_old = pathutil::normalize(old);
        let norm_new = pathutil::normalize(new);
        let (backend_old, prefix_old, rel_old) = self.resolve(&norm_old)?;
        let (backend_new, prefix_new, rel_new) = self.resolve(&norm_new)?;

        if prefix_old == prefix_new {
            return backend_old.rename(&rel_old, &rel_new, cred).map_err(|mut e| {
                e.rewrite_path(&rel_old, &norm_old);
                e.rewrite_path(&rel_new, &norm_new);
                e
            });
        }

        let data = backend_old
            .read_file(&rel_old, cred)
            .map_err(|mut e| { e.rewrite_path(&rel_old, &norm_old); e })?;
        let stats = backend_old
            .stat(&rel_old, cred)
            .map_err(|mut e| { e.rewrite_path(&rel_old, &norm_old); e })?;
        backend_new
            .write_file(&rel_new, &data, stats.perm(), cred)
            .map_err(|mut e| { e.rewrite_path(&rel_new, &norm_new); e })?;
        backend_old.unlink(&rel_old, cred).map_err(|mut e| { e.rewrite_path(&rel_old, &norm_old); e })
    }

    /// `readdir`, augmented with the names of any mount points directly
    /// nested under `path`.
    pub fn readdir(&self, path: &str, cred: &Credentials) -> Result<Vec<String>> {
        let normalized = pathutil::normalize(path);
        let (backend, _prefix, rel) = self.resolve(&normalized)?;
        let mut names = backend.readdir(&rel, cred).map_err(|mut e| {
            e.rewrite_path(&rel, &normalized);
            e
        })?;
        for entry in self.mounts.read().iter() {
            if entry.prefix == "/" {
                continue;
            }
            if pathutil::dirname(&entry.prefix) == normalized {
                let name = pathutil::basename(&entry.prefix);
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        Ok(names)
    }

    /// Resolve symlinks along `path` across mount boundaries: normalize,
    /// stat via the resolved backend; if not a symlink, the normalized path
    /// is the answer; otherwise read the link target, anchor it at the
    /// mount point (or the containing directory, if relative), and recurse.
    pub fn realpath(&self, path: &str, cred: &Credentials) -> Result<String> {
        let normalized = pathutil::normalize(path);
        let (backend, prefix, rel) = self.resolve(&normalized)?;
        let stats = backend.stat(&rel, cred).map_err(|mut e| {
            e.rewrite_path(&rel, &normalized);
            e
        })?;
        if !matches!(stats.file_type()?, FileType::Symlink) {
            return Ok(normalized);
        }
        let target = backend.readlink(&rel, cred).map_err(|mut e| {
            e.rewrite_path(&rel, &normalized);
            e
        })?;
        let absolute_target = if target.starts_with('/') {
            pathutil::join(&prefix, &target)
        } else {
            pathutil::join(&pathutil::dirname(&normalized), &target)
        };
        self.realpath(&absolute_target, cred)
    }

    /// `read_file`.
    pub fn read_file(&self, path: &str, cred: &Credentials) -> Result<Vec<u8>> {
        self.dispatch(path, |backend, rel| backend.read_file(rel, cred))
    }

    /// `write_file`.
    pub fn write_file(&self, path: &str, data: &[u8], mode: u16, cred: &Credentials) -> Result<()> {
        self.dispatch(path, |backend, rel| backend.write_file(rel, data, mode, cred))
    }

    /// `append_file`.
    pub fn append_file(&self, path: &str, data: &[u8], mode: u16, cred: &Credentials) -> Result<()> {
        self.dispatch(path, |backend, rel| backend.append_file(rel, data, mode, cred))
    }

    /// `truncate`.
    pub fn truncate(&self, path: &str, len: u64, cred: &Credentials) -> Result<()> {
        self.dispatch(path, |backend, rel| backend.truncate(rel, len, cred))
    }

    // -- file descriptor table ---------------------------------------------

    fn install_fd(&self, file: PreloadFile) -> u32 {
        let fd = self.next_fd.fetch_add(1, Ordering::SeqCst);
        self.open_files.lock().insert(fd, file);
        fd
    }

    fn with_fd<T>(&self, fd: u32, op: impl FnOnce(&PreloadFile) -> Result<T>) -> Result<T> {
        let files = self.open_files.lock();
        let file = files.get(&fd).ok_or_else(|| Error::bad_fd(format!("no such open file descriptor: {fd}")))?;
        op(file)
    }

    fn with_fd_mut<T>(&self, fd: u32, op: impl FnOnce(&mut PreloadFile) -> Result<T>) -> Result<T> {
        let mut files = self.open_files.lock();
        let file = files.get_mut(&fd).ok_or_else(|| Error::bad_fd(format!("no such open file descriptor: {fd}")))?;
        op(file)
    }

    /// `open`: resolves `path` through the mount table, opens it on the
    /// owning backend, and installs the resulting handle in the descriptor
    /// table. Returns the new file descriptor.
    pub fn open(&self, path: &str, flag: FileFlag, mode: u16, cred: &Credentials) -> Result<u32> {
        let file = self.dispatch(path, |backend, rel| backend.open(rel, flag, mode, cred))?;
        Ok(self.install_fd(file))
    }

    /// `close`: drops and persists the file descriptor's handle.
    pub fn close(&self, fd: u32) -> Result<()> {
        let file = self
            .open_files
            .lock()
            .remove(&fd)
            .ok_or_else(|| Error::bad_fd(format!("no such open file descriptor: {fd}")))?;
        file.close()
    }

    /// `fstat`.
    pub fn fstat(&self, fd: u32) -> Result<Stats> {
        self.with_fd(fd, |file| Ok(file.stat()))
    }

    /// `read`.
    pub fn read(&self, fd: u32, buf: &mut [u8]) -> Result<usize> {
        self.with_fd_mut(fd, |file| file.read(buf))
    }

    /// `write`.
    pub fn write(&self, fd: u32, data: &[u8]) -> Result<usize> {
        self.with_fd_mut(fd, |file| file.write(data))
    }

    /// `ftruncate`.
    pub fn ftruncate(&self, fd: u32, len: u64) -> Result<()> {
        self.with_fd_mut(fd, |file| file.truncate(len))
    }

    /// `fchmod`.
    pub fn fchmod(&self, fd: u32, perm: u16) -> Result<()> {
        self.with_fd_mut(fd, |file| file.chmod(perm))
    }

    /// `fchown`.
    pub fn fchown(&self, fd: u32, uid: Option<f64>, gid: Option<f64>) -> Result<()> {
        self.with_fd_mut(fd, |file| file.chown(uid, gid))
    }

    /// `futimes`.
    pub fn futimes(&self, fd: u32, atime_ms: f64, mtime_ms: f64) -> Result<()> {
        self.with_fd_mut(fd, |file| file.utimes(atime_ms, mtime_ms))
    }

    /// `fsync`. This crate's handles have no separate metadata-only sync, so
    /// this is the same as `fdatasync`.
    pub fn fsync(&self, fd: u32) -> Result<()> {
        self.with_fd_mut(fd, |file| file.sync_now())
    }

    /// `fdatasync`. See [`Vfs::fsync`].
    pub fn fdatasync(&self, fd: u32) -> Result<()> {
        self.with_fd_mut(fd, |file| file.sync_now())
    }

    // -- unconditionally unsupported ---------------------------------------

    /// Unsupported.
    pub fn watch(&self, _path: &str) -> Result<()> {
        Err(Error::not_supported("watch is not supported"))
    }

    /// Unsupported.
    pub fn watch_file(&self, _path: &str) -> Result<()> {
        Err(Error::not_supported("watchFile is not supported"))
    }

    /// Unsupported.
    pub fn unwatch_file(&self, _path: &str) -> Result<()> {
        Err(Error::not_supported("unwatchFile is not supported"))
    }

    /// Unsupported.
    pub fn rm(&self, _path: &str) -> Result<()> {
        Err(Error::not_supported("rm is not supported"))
    }

    /// Unsupported.
    pub fn mkdtemp(&self, _prefix: &str) -> Result<String> {
        Err(Error::not_supported("mkdtemp is not supported"))
    }

    /// Unsupported.
    pub fn copy_file(&self, _src: &str, _dst: &str) -> Result<()> {
        Err(Error::not_supported("copyFile is not supported"))
    }

    /// Unsupported.
    pub fn readv(&self, _fd: u32) -> Result<usize> {
        Err(Error::not_supported("readv is not supported"))
    }

    /// Unsupported.
    pub fn writev(&self, _fd: u32) -> Result<usize> {
        Err(Error::not_supported("writev is not supported"))
    }

    /// Unsupported.
    pub fn opendir(&self, _path: &str) -> Result<()> {
        Err(Error::not_supported("opendir is not supported"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Errno;

    fn cred() -> Credentials {
        Credentials::root()
    }

    #[test]
    fn default_root_mount_accepts_operations() {
        let vfs = Vfs::new();
        vfs.mkdir("/a", 0o755, &cred()).unwrap();
        assert!(vfs.exists("/a", &cred()));
    }

    #[test]
    fn longest_prefix_wins() {
        let vfs = Vfs::new();
        let sub: Arc<dyn FileSystem> = Arc::new(KeyValueFileSystem::new(InMemoryStore::new()).unwrap());
        vfs.mount("/mnt/a", sub).unwrap();
        vfs.write_file("/mnt/a/f.txt", b"hi", 0o644, &cred()).unwrap();
        assert_eq!(vfs.read_file("/mnt/a/f.txt", &cred()).unwrap(), b"hi");
    }

    #[test]
    fn readdir_lists_nested_mount_points() {
        let vfs = Vfs::new();
        vfs.mkdir("/mnt", 0o755, &cred()).unwrap();
        let sub: Arc<dyn FileSystem> = Arc::new(KeyValueFileSystem::new(InMemoryStore::new()).unwrap());
        vfs.mount("/mnt/a", sub).unwrap();
        let names = vfs.readdir("/mnt", &cred()).unwrap();
        assert!(names.contains(&"a".to_string()));
    }

    #[test]
    fn cross_mount_rename_copies_then_unlinks() {
        let vfs = Vfs::new();
        let sub: Arc<dyn FileSystem> = Arc::new(KeyValueFileSystem::new(InMemoryStore::new()).unwrap());
        vfs.mount("/mnt", sub).unwrap();
        vfs.write_file("/a.txt", b"payload", 0o644, &cred()).unwrap();
        vfs.rename("/a.txt", "/mnt/a.txt", &cred()).unwrap();
        assert!(!vfs.exists("/a.txt", &cred()));
        assert_eq!(vfs.read_file("/mnt/a.txt", &cred()).unwrap(), b"payload");
    }

    #[test]
    fn fd_table_round_trips_writes_and_reads() {
        let vfs = Vfs::new();
        let fd = vfs.open("/a.txt", FileFlag::from_str("w+").unwrap(), 0o644, &cred()).unwrap();
        assert!(fd >= 100);
        vfs.write(fd, b"hello").unwrap();
        vfs.fsync(fd).unwrap();
        let mut buf = [0u8; 5];
        // writable handles advance position on write; rewind isn't exposed
        // here, so re-open for the read side instead.
        vfs.close(fd).unwrap();
        let fd2 = vfs.open("/a.txt", FileFlag::from_str("r").unwrap(), 0o644, &cred()).unwrap();
        let n = vfs.read(fd2, &mut buf).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
        vfs.close(fd2).unwrap();
    }

    #[test]
    fn unknown_fd_is_ebadf() {
        let vfs = Vfs::new();
        assert_eq!(vfs.fstat(999).unwrap_err().errno(), Errno::EBADF);
    }

    #[test]
    fn errors_are_rewritten_to_the_mount_relative_absolute_path() {
        let vfs = Vfs::new();
        let sub: Arc<dyn FileSystem> = Arc::new(KeyValueFileSystem::new(InMemoryStore::new()).unwrap());
        vfs.mount("/mnt", sub).unwrap();
        let err = vfs.stat("/mnt/missing", &cred()).unwrap_err();
        assert_eq!(err.path(), Some("/mnt/missing"));
    }

    #[test]
    fn unsupported_ops_return_not_supported() {
        let vfs = Vfs::new();
        assert_eq!(vfs.watch("/a").unwrap_err().errno(), Errno::ENOTSUP);
        assert_eq!(vfs.rm("/a").unwrap_err().errno(), Errno::ENOTSUP);
        assert_eq!(vfs.copy_file("/a", "/b").unwrap_err().errno(), Errno::ENOTSUP);
    }
}
