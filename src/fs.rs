//! The `FileSystem` backend contract (§4.F).
//!
//! Every backend (key-value store, overlay, async mirror, folder adapter)
//! implements [`FileSystem`]; `async`-capable backends additionally (or
//! instead) implement [`AsyncFileSystem`]. [`Metadata`] is the static
//! capability record every backend publishes. The default method bodies
//! here (`open`, `read_file`, `write_file`, `append_file`, `truncate`,
//! `exists`, `realpath`) are built atop the handful of primitive operations
//! every backend must supply, the same way the teacher's `Filesystem` trait
//! supplies default (not-implemented) bodies for every FUSE callback and
//! lets concrete filesystems override only what they need.

use std::sync::Arc;

use crate::cred::Credentials;
use crate::error::{Errno, Error, Result};
use crate::file::PreloadFile;
use crate::flags::{FileFlag, PathExistsAction, PathNotExistsAction};
use crate::stats::Stats;

/// Static capability record published by a backend.
#[derive(Debug, Clone)]
pub struct Metadata {
    /// A human-readable backend name, e.g. `"InMemoryFileSystem"`.
    pub name: String,
    /// Whether the backend rejects all mutating operations.
    pub readonly: bool,
    /// Whether the backend can be driven through its sync methods.
    pub synchronous: bool,
    /// Whether `chmod`/`chown`/`utimes` are meaningfully persisted.
    pub supports_properties: bool,
    /// Whether `link`/`symlink`/`readlink` are meaningfully supported.
    pub supports_links: bool,
    /// Total capacity, in bytes, or `u64::MAX` if unbounded.
    pub total_space: u64,
    /// Free capacity, in bytes, or `u64::MAX` if unbounded.
    pub free_space: u64,
}

impl Metadata {
    /// A reasonable default for an unbounded, fully-capable in-memory
    /// backend.
    pub fn unbounded(name: impl Into<String>) -> Self {
        Metadata {
            name: name.into(),
            readonly: false,
            synchronous: true,
            supports_properties: true,
            supports_links: false,
            total_space: u64::MAX,
            free_space: u64::MAX,
        }
    }
}

/// The synchronous backend contract.
#[allow(clippy::too_many_arguments)]
pub trait FileSystem: std::fmt::Debug + Send + Sync {
    /// Static capability record.
    fn metadata(&self) -> Metadata;

    /// Open an existing file. Fails with `ENOENT` if absent.
    fn open_file(&self, path: &str, flag: FileFlag, cred: &Credentials) -> Result<PreloadFile>;

    /// Create and open a new file, which must not already exist.
    fn create_file(
        &self,
        path: &str,
        flag: FileFlag,
        mode: u16,
        cred: &Credentials,
    ) -> Result<PreloadFile>;

    /// Get metadata for `path`, following no symlinks beyond what the
    /// backend natively resolves.
    fn stat(&self, path: &str, cred: &Credentials) -> Result<Stats>;

    /// Remove a file.
    fn unlink(&self, path: &str, cred: &Credentials) -> Result<()>;

    /// Create a directory. `mkdir` on an existing path is always `EEXIST`.
    fn mkdir(&self, path: &str, mode: u16, cred: &Credentials) -> Result<()>;

    /// Remove an empty directory.
    fn rmdir(&self, path: &str, cred: &Credentials) -> Result<()>;

    /// Rename `old` to `new`.
    fn rename(&self, old: &str, new: &str, cred: &Credentials) -> Result<()>;

    /// List the names of a directory's entries.
    fn readdir(&self, path: &str, cred: &Credentials) -> Result<Vec<String>>;

    /// Change permission bits.
    fn chmod(&self, path: &str, perm: u16, cred: &Credentials) -> Result<()>;

    /// Change owner/group.
    fn chown(&self, path: &str, uid: Option<f64>, gid: Option<f64>, cred: &Credentials) -> Result<()>;

    /// Change access/modification times.
    fn utimes(&self, path: &str, atime_ms: f64, mtime_ms: f64, cred: &Credentials) -> Result<()>;

    /// Create a hard link. Backends that don't support links fail with
    /// `EPERM` (the default).
    fn link(&self, _target: &str, _new_path: &str, _cred: &Credentials) -> Result<()> {
        Err(Error::perm("hard links are not supported by this backend"))
    }

    /// Create a symbolic link. Unsupported by default (the keyed engines
    /// declare "no symlinks" per spec Non-goals).
    fn symlink(&self, _target: &str, _new_path: &str, _cred: &Credentials) -> Result<()> {
        Err(Error::perm("symlinks are not supported by this backend"))
    }

    /// Read a symlink's target. Unsupported by default.
    fn readlink(&self, _path: &str, _cred: &Credentials) -> Result<String> {
        Err(Error::not_supported("readlink is not supported by this backend"))
    }

    /// Default `open`: built on `stat` plus `open_file`/`create_file` per
    /// the exists/not-exists action table (§4.D).
    fn open(&self, path: &str, flag: FileFlag, mode: u16, cred: &Credentials) -> Result<PreloadFile> {
        if self.metadata().readonly && flag.is_writable() {
            return Err(Error::read_only(format!("{path} is on a read-only backend")));
        }
        match self.stat(path, cred) {
            Ok(_) => match flag.path_exists_action() {
                PathExistsAction::ThrowException => {
                    Err(Error::with_path(Errno::EEXIST, "file already exists", path))
                }
                PathExistsAction::Nop => self.open_file(path, flag, cred),
                PathExistsAction::TruncateFile => {
                    let mut file = self.open_file(path, flag, cred)?;
                    file.truncate(0)?;
                    Ok(file)
                }
            },
            Err(e) if e.errno() == Errno::ENOENT => match flag.path_not_exists_action() {
                PathNotExistsAction::CreateFile => self.create_file(path, flag, mode, cred),
                PathNotExistsAction::ThrowException => {
                    Err(Error::with_path(Errno::ENOENT, "no such file or directory", path))
                }
            },
            Err(e) => Err(e),
        }
    }

    /// Read an entire file's contents. Opens, reads to EOF, and closes on
    /// every exit path (the scoped-acquisition pattern of §4.F/§5).
    fn read_file(&self, path: &str, cred: &Credentials) -> Result<Vec<u8>> {
        let flag = FileFlag::from_str("r")?;
        let mut file = self.open(path, flag, 0o644, cred)?;
        let result = (|| {
            let mut buf = vec![0u8; file.stat().size as usize];
            let mut total = 0;
            while total < buf.len() {
                let n = file.read(&mut buf[total..])?;
                if n == 0 {
                    break;
                }
                total += n;
            }
            buf.truncate(total);
            Ok(buf)
        })();
        let close_result = file.close();
        match (result, close_result) {
            (Ok(v), Ok(())) => Ok(v),
            (Err(e), _) => Err(e),
            (Ok(_), Err(e)) => Err(e),
        }
    }

    /// Write `data` as the entire contents of `path`, creating or
    /// truncating it.
    fn write_file(&self, path: &str, data: &[u8], mode: u16, cred: &Credentials) -> Result<()> {
        let flag = FileFlag::from_str("w")?;
        let mut file = self.open(path, flag, mode, cred)?;
        let result = file.write(data).map(|_| ());
        let close_result = file.close();
        result.and(close_result)
    }

    /// Append `data` to `path`, creating it if absent.
    fn append_file(&self, path: &str, data: &[u8], mode: u16, cred: &Credentials) -> Result<()> {
        let flag = FileFlag::from_str("a")?;
        let mut file = self.open(path, flag, mode, cred)?;
        let result = file.write(data).map(|_| ());
        let close_result = file.close();
        result.and(close_result)
    }

    /// Truncate (or extend) `path` to `len` bytes.
    fn truncate(&self, path: &str, len: u64, cred: &Credentials) -> Result<()> {
        let flag = FileFlag::from_str("r+")?;
        let mut file = self.open(path, flag, 0o644, cred)?;
        let result = file.truncate(len);
        let close_result = file.close();
        result.and(close_result)
    }

    /// `exists`: `stat` with errors swallowed to `false`.
    fn exists(&self, path: &str, cred: &Credentials) -> bool {
        self.stat(path, cred).is_ok()
    }

    /// Resolve symlinks along `path`. The identity if this backend
    /// declares no symlink support; otherwise resolves segment-by-segment.
    fn realpath(&self, path: &str, cred: &Credentials) -> Result<String> {
        if !self.metadata().supports_links {
            return Ok(path.to_string());
        }
        let mut resolved = String::from("/");
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            if resolved != "/" {
                resolved.push('/');
            }
            resolved.push_str(segment);
            if let Ok(stats) = self.stat(&resolved, cred) {
                if matches!(stats.file_type(), Ok(crate::stats::FileType::Symlink)) {
                    let target = self.readlink(&resolved, cred)?;
                    resolved = if target.starts_with('/') {
                        target
                    } else {
                        format!("{resolved}/../{target}")
                    };
                }
            }
        }
        Ok(crate::pathutil::normalize(&resolved))
    }
}

/// The async backend contract — the canonical async form described in §9
/// ("Callback/promise/sync trilogy": one canonical async form, with thin
/// sync/callback wrappers generated or hand-written elsewhere).
#[cfg(feature = "async")]
#[async_trait::async_trait]
pub trait AsyncFileSystem: std::fmt::Debug + Send + Sync {
    /// Static capability record.
    fn metadata(&self) -> Metadata;
    /// See [`FileSystem::open_file`].
    async fn open_file(&self, path: &str, flag: FileFlag, cred: &Credentials) -> Result<PreloadFile>;
    /// See [`FileSystem::create_file`].
    async fn create_file(
        &self,
        path: &str,
        flag: FileFlag,
        mode: u16,
        cred: &Credentials,
    ) -> Result<PreloadFile>;
    /// See [`FileSystem::stat`].
    async fn stat(&self, path: &str, cred: &Credentials) -> Result<Stats>;
    /// See [`FileSystem::unlink`].
    async fn unlink(&self, path: &str, cred: &Credentials) -> Result<()>;
    /// See [`FileSystem::mkdir`].
    async fn mkdir(&self, path: &str, mode: u16, cred: &Credentials) -> Result<()>;
    /// See [`FileSystem::rmdir`].
    async fn rmdir(&self, path: &str, cred: &Credentials) -> Result<()>;
    /// See [`FileSystem::rename`].
    async fn rename(&self, old: &str, new: &str, cred: &Credentials) -> Result<()>;
    /// See [`FileSystem::readdir`].
    async fn readdir(&self, path: &str, cred: &Credentials) -> Result<Vec<String>>;
    /// See [`FileSystem::chmod`].
    async fn chmod(&self, path: &str, perm: u16, cred: &Credentials) -> Result<()>;
    /// See [`FileSystem::chown`].
    async fn chown(&self, path: &str, uid: Option<f64>, gid: Option<f64>, cred: &Credentials) -> Result<()>;
    /// See [`FileSystem::utimes`].
    async fn utimes(&self, path: &str, atime_ms: f64, mtime_ms: f64, cred: &Credentials) -> Result<()>;

    /// Default `open`: same action table as the sync contract.
    async fn open(&self, path: &str, flag: FileFlag, mode: u16, cred: &Credentials) -> Result<PreloadFile> {
        if self.metadata().readonly && flag.is_writable() {
            return Err(Error::read_only(format!("{path} is on a read-only backend")));
        }
        match self.stat(path, cred).await {
            Ok(_) => match flag.path_exists_action() {
                PathExistsAction::ThrowException => {
                    Err(Error::with_path(Errno::EEXIST, "file already exists", path))
                }
                PathExistsAction::Nop => self.open_file(path, flag, cred).await,
                PathExistsAction::TruncateFile => {
                    let mut file = self.open_file(path, flag, cred).await?;
                    file.truncate(0)?;
                    Ok(file)
                }
            },
            Err(e) if e.errno() == Errno::ENOENT => match flag.path_not_exists_action() {
                PathNotExistsAction::CreateFile => self.create_file(path, flag, mode, cred).await,
                PathNotExistsAction::ThrowException => {
                    Err(Error::with_path(Errno::ENOENT, "no such file or directory", path))
                }
            },
            Err(e) => Err(e),
        }
    }

    /// See [`FileSystem::read_file`].
    async fn read_file(&self, path: &str, cred: &Credentials) -> Result<Vec<u8>> {
        let flag = FileFlag::from_str("r")?;
        let mut file = self.open(path, flag, 0o644, cred).await?;
        let mut buf = vec![0u8; file.stat().size as usize];
        let mut total = 0;
        let result: Result<()> = (|| {
            while total < buf.len() {
                let n = file.read(&mut buf[total..])?;
                if n == 0 {
                    break;
                }
                total += n;
            }
            Ok(())
        })();
        let close_result = file.close();
        result.and(close_result)?;
        buf.truncate(total);
        Ok(buf)
    }

    /// See [`FileSystem::exists`].
    async fn exists(&self, path: &str, cred: &Credentials) -> bool {
        self.stat(path, cred).await.is_ok()
    }
}

/// Lets a boxed-up backend stand in for a concrete one anywhere a generic
/// `F: FileSystem` is expected (e.g. `OverlayFileSystem<L, U>`,
/// `FolderAdapter<F>`), so [`crate::config`] can compose backends chosen at
/// runtime without a closed set of generic instantiations.
impl FileSystem for Arc<dyn FileSystem> {
    fn metadata(&self) -> Metadata {
        self.as_ref().metadata()
    }
    fn open_file(&self, path: &str, flag: FileFlag, cred: &Credentials) -> Result<PreloadFile> {
        self.as_ref().open_file(path, flag, cred)
    }
    fn create_file(&self, path: &str, flag: FileFlag, mode: u16, cred: &Credentials) -> Result<PreloadFile> {
        self.as_ref().create_file(path, flag, mode, cred)
    }
    fn stat(&self, path: &str, cred: &Credentials) -> Result<Stats> {
        self.as_ref().stat(path, cred)
    }
    fn unlink(&self, path: &str, cred: &Credentials) -> Result<()> {
        self.as_ref().unlink(path, cred)
    }
    fn mkdir(&self, path: &str, mode: u16, cred: &Credentials) -> Result<()> {
        self.as_ref().mkdir(path, mode, cred)
    }
    fn rmdir(&self, path: &str, cred: &Credentials) -> Result<()> {
        self.as_ref().rmdir(path, cred)
    }
    fn rename(&self, old: &str, new: &str, cred: &Credentials) -> Result<()> {
        self.as_ref().rename(old, new, cred)
    }
    fn readdir(&self, path: &str, cred: &Credentials) -> Result<Vec<String>> {
        self.as_ref().readdir(path, cred)
    }
    fn chmod(&self, path: &str, perm: u16, cred: &Credentials) -> Result<()> {
        self.as_ref().chmod(path, perm, cred)
    }
    fn chown(&self, path: &str, uid: Option<f64>, gid: Option<f64>, cred: &Credentials) -> Result<()> {
        self.as_ref().chown(path, uid, gid, cred)
    }
    fn utimes(&self, path: &str, atime_ms: f64, mtime_ms: f64, cred: &Credentials) -> Result<()> {
        self.as_ref().utimes(path, atime_ms, mtime_ms, cred)
    }
    fn link(&self, target: &str, new_path: &str, cred: &Credentials) -> Result<()> {
        self.as_ref().link(target, new_path, cred)
    }
    fn symlink(&self, target: &str, new_path: &str, cred: &Credentials) -> Result<()> {
        self.as_ref().symlink(target, new_path, cred)
    }
    fn readlink(&self, path: &str, cred: &Credentials) -> Result<String> {
        self.as_ref().readlink(path, cred)
    }
}

/// Adapter: any [`FileSystem`] automatically satisfies [`AsyncFileSystem`]
/// by delegating each method to its synchronous twin (§4.F
/// `SynchronousFileSystem`). A real async backend implements
/// `AsyncFileSystem` directly instead of going through this blanket impl.
#[cfg(feature = "async")]
#[derive(Debug)]
pub struct SynchronousAsAsync<F: FileSystem>(pub F);

#[cfg(feature = "async")]
#[async_trait::async_trait]
impl<F: FileSystem> AsyncFileSystem for SynchronousAsAsync<F> {
    fn metadata(&self) -> Metadata {
        self.0.metadata()
    }
    async fn open_file(&self, path: &str, flag: FileFlag, cred: &Credentials) -> Result<PreloadFile> {
        self.0.open_file(path, flag, cred)
    }
    async fn create_file(
        &self,
        path: &str,
        flag: FileFlag,
        mode: u16,
        cred: &Credentials,
    ) -> Result<PreloadFile> {
        self.0.create_file(path, flag, mode, cred)
    }
    async fn stat(&self, path: &str, cred: &Credentials) -> Result<Stats> {
        self.0.stat(path, cred)
    }
    async fn unlink(&self, path: &str, cred: &Credentials) -> Result<()> {
        self.0.unlink(path, cred)
    }
    async fn mkdir(&self, path: &str, mode: u16, cred: &Credentials) -> Result<()> {
        self.0.mkdir(path, mode, cred)
    }
    async fn rmdir(&self, path: &str, cred: &Credentials) -> Result<()> {
        self.0.rmdir(path, cred)
    }
    async fn rename(&self, old: &str, new: &str, cred: &Credentials) -> Result<()> {
        self.0.rename(old, new, cred)
    }
    async fn readdir(&self, path: &str, cred: &Credentials) -> Result<Vec<String>> {
        self.0.readdir(path, cred)
    }
    async fn chmod(&self, path: &str, perm: u16, cred: &Credentials) -> Result<()> {
        self.0.chmod(path, perm, cred)
    }
    async fn chown(&self, path: &str, uid: Option<f64>, gid: Option<f64>, cred: &Credentials) -> Result<()> {
        self.0.chown(path, uid, gid, cred)
    }
    async fn utimes(&self, path: &str, atime_ms: f64, mtime_ms: f64, cred: &Credentials) -> Result<()> {
        self.0.utimes(path, atime_ms, mtime_ms, cred)
    }
}
