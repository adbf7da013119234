//! `LockedFs` (§4.I): wraps a synchronous [`FileSystem`] with a per-path
//! mutex, giving it an async-safe face while keeping its sync face usable
//! for anyone who can prove (by the lock being free) that it's safe.

use crate::cred::Credentials;
use crate::error::{Error, Result};
use crate::file::PreloadFile;
use crate::flags::FileFlag;
use crate::fs::{AsyncFileSystem, FileSystem, Metadata};
use crate::mutex::PathMutex;
use crate::stats::Stats;

/// Wraps a [`FileSystem`], serializing multi-step async operations through
/// a per-path mutex. Two-path operations (`rename`) lock on the *source*
/// path.
#[derive(Debug)]
pub struct LockedFs<F: FileSystem> {
    inner: F,
    mutex: PathMutex,
}

impl<F: FileSystem> LockedFs<F> {
    /// Wrap `inner`.
    pub fn new(inner: F) -> Self {
        LockedFs { inner, mutex: PathMutex::new() }
    }

    fn check_unlocked(&self, path: &str) -> Result<()> {
        if self.mutex.is_locked(path) {
            Err(Error::busy(format!("invalid sync call: {path} is locked")))
        } else {
            Ok(())
        }
    }
}

impl<F: FileSystem> FileSystem for LockedFs<F> {
    fn metadata(&self) -> Metadata {
        self.inner.metadata()
    }

    fn open_file(&self, path: &str, flag: FileFlag, cred: &Credentials) -> Result<PreloadFile> {
        self.check_unlocked(path)?;
        self.inner.open_file(path, flag, cred)
    }

    fn create_file(&self, path: &str, flag: FileFlag, mode: u16, cred: &Credentials) -> Result<PreloadFile> {
        self.check_unlocked(path)?;
        self.inner.create_file(path, flag, mode, cred)
    }

    fn stat(&self, path: &str, cred: &Credentials) -> Result<Stats> {
        self.check_unlocked(path)?;
        self.inner.stat(path, cred)
    }

    fn unlink(&self, path: &str, cred: &Credentials) -> Result<()> {
        self.check_unlocked(path)?;
        self.inner.unlink(path, cred)
    }

    fn mkdir(&self, path: &str, mode: u16, cred: &Credentials) -> Result<()> {
        self.check_unlocked(path)?;
        self.inner.mkdir(path, mode, cred)
    }

    fn rmdir(&self, path: &str, cred: &Credentials) -> Result<()> {
        self.check_unlocked(path)?;
        self.inner.rmdir(path, cred)
    }

    fn rename(&self, old: &str, new: &str, cred: &Credentials) -> Result<()> {
        self.check_unlocked(old)?;
        self.inner.rename(old, new, cred)
    }

    fn readdir(&self, path: &str, cred: &Credentials) -> Result<Vec<String>> {
        self.check_unlocked(path)?;
        self.inner.readdir(path, cred)
    }

    fn chmod(&self, path: &str, perm: u16, cred: &Credentials) -> Result<()> {
        self.check_unlocked(path)?;
        self.inner.chmod(path, perm, cred)
    }

    fn chown(&self, path: &str, uid: Option<f64>, gid: Option<f64>, cred: &Credentials) -> Result<()> {
        self.check_unlocked(path)?;
        self.inner.chown(path, uid, gid, cred)
    }

    fn utimes(&self, path: &str, atime_ms: f64, mtime_ms: f64, cred: &Credentials) -> Result<()> {
        self.check_unlocked(path)?;
        self.inner.utimes(path, atime_ms, mtime_ms, cred)
    }

    fn link(&self, target: &str, new_path: &str, cred: &Credentials) -> Result<()> {
        self.check_unlocked(target)?;
        self.inner.link(target, new_path, cred)
    }

    fn symlink(&self, target: &str, new_path: &str, cred: &Credentials) -> Result<()> {
        self.check_unlocked(target)?;
        self.inner.symlink(target, new_path, cred)
    }

    fn readlink(&self, path: &str, cred: &Credentials) -> Result<String> {
        self.check_unlocked(path)?;
        self.inner.readlink(path, cred)
    }
}

#[async_trait::async_trait]
impl<F: FileSystem> AsyncFileSystem for LockedFs<F> {
    fn metadata(&self) -> Metadata {
        self.inner.metadata()
    }

    async fn open_file(&self, path: &str, flag: FileFlag, cred: &Credentials) -> Result<PreloadFile> {
        let _guard = self.mutex.lock(path).await;
        self.inner.open_file(path, flag, cred)
    }

    async fn create_file(&self, path: &str, flag: FileFlag, mode: u16, cred: &Credentials) -> Result<PreloadFile> {
        let _guard = self.mutex.lock(path).await;
        self.inner.create_file(path, flag, mode, cred)
    }

    async fn stat(&self, path: &str, cred: &Credentials) -> Result<Stats> {
        let _guard = self.mutex.lock(path).await;
        self.inner.stat(path, cred)
    }

    async fn unlink(&self, path: &str, cred: &Credentials) -> Result<()> {
        let _guard = self.mutex.lock(path).await;
        self.inner.unlink(path, cred)
    }

    async fn mkdir(&self, path: &str, mode: u16, cred: &Credentials) -> Result<()> {
        let _guard = self.mutex.lock(path).await;
        self.inner.mkdir(path, mode, cred)
    }

    async fn rmdir(&self, path: &str, cred: &Credentials) -> Result<()> {
        let _guard = self.mutex.lock(path).await;
        self.inner.rmdir(path, cred)
    }

    async fn rename(&self, old: &str, new: &str, cred: &Credentials) -> Result<()> {
        let _guard = self.mutex.lock(old).await;
        self.inner.rename(old, new, cred)
    }

    async fn readdir(&self, path: &str, cred: &Credentials) -> Result<Vec<String>> {
        let _guard = self.mutex.lock(path).await;
        self.inner.readdir(path, cred)
    }

    async fn chmod(&self, path: &str, perm: u16, cred: &Credentials) -> Result<()> {
        let _guard = self.mutex.lock(path).await;
        self.inner.chmod(path, perm, cred)
    }

    async fn chown(&self, path: &str, uid: Option<f64>, gid: Option<f64>, cred: &Credentials) -> Result<()> {
        let _guard = self.mutex.lock(path).await;
        self.inner.chown(path, uid, gid, cred)
    }

    async fn utimes(&self, path: &str, atime_ms: f64, mtime_ms: f64, cred: &Credentials) -> Result<()> {
        let _guard = self.mutex.lock(path).await;
        self.inner.utimes(path, atime_ms, mtime_ms, cred)
    }
}
