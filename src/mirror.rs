//! The async-mirror filesystem (§4.K): a synchronous `sync` backend backed
//! one-for-one by an `async` backend that every mutation is replayed onto
//! in the background.
//!
//! Every mutating call returns as soon as `sync` has applied the change;
//! the matching call against `async` is queued and drained by a single
//! background writer, so mirrored writes stay strictly ordered even though
//! callers never wait for them. If a mirrored call ever fails, the writer
//! stops and every later mutating call on this filesystem fails with a
//! "desynchronized" error instead of silently drifting out of sync.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::cred::Credentials;
use crate::error::{Errno, Error, Result};
use crate::file::{FilePersist, PreloadFile};
use crate::flags::FileFlag;
use crate::fs::{AsyncFileSystem, FileSystem, Metadata};
use crate::pathutil;
use crate::stats::{FileType, Stats};

#[derive(Debug, Clone)]
enum MirrorOp {
    WriteFile(String, Vec<u8>, u16),
    Mkdir(String, u16),
    Unlink(String),
    Rmdir(String),
    Rename(String, String),
    Chmod(String, u16),
    Chown(String, Option<f64>, Option<f64>),
    Utimes(String, f64, f64),
}

async fn write_file_async<As: AsyncFileSystem>(fs: &As, path: &str, data: &[u8], mode: u16, cred: &Credentials) -> Result<()> {
    let flag = FileFlag::from_str("w")?;
    let mut file = fs.open(path, flag, mode, cred).await?;
    file.write(data)?;
    file.close()
}

async fn apply_op<As: AsyncFileSystem>(fs: &As, op: MirrorOp, cred: &Credentials) -> Result<()> {
    match op {
        MirrorOp::WriteFile(path, data, mode) => write_file_async(fs, &path, &data, mode, cred).await,
        MirrorOp::Mkdir(path, mode) => fs.mkdir(&path, mode, cred).await,
        MirrorOp::Unlink(path) => fs.unlink(&path, cred).await,
        MirrorOp::Rmdir(path) => fs.rmdir(&path, cred).await,
        MirrorOp::Rename(old, new) => fs.rename(&old, &new, cred).await,
        MirrorOp::Chmod(path, perm) => fs.chmod(&path, perm, cred).await,
        MirrorOp::Chown(path, uid, gid) => fs.chown(&path, uid, gid, cred).await,
        MirrorOp::Utimes(path, atime_ms, mtime_ms) => fs.utimes(&path, atime_ms, mtime_ms, cred).await,
    }
}

#[derive(Debug, Default)]
struct DesyncState {
    failed: AtomicBool,
    error: Mutex<Option<Error>>,
}

impl DesyncState {
    fn fail(&self, e: Error) {
        *self.error.lock() = Some(e);
        self.failed.store(true, Ordering::Release);
    }

    fn check(&self) -> Result<()> {
        if self.failed.load(Ordering::Acquire) {
            let detail = self.error.lock().as_ref().map(|e| e.to_string()).unwrap_or_default();
            return Err(Error::io(format!("filesystem desynchronized: {detail}")));
        }
        Ok(())
    }
}

/// Writes a [`PreloadFile`]'s buffer through to `sync` and enqueues the
/// same write as a mirror op (the "MirrorFile" of §4.K).
#[derive(Debug)]
struct MirrorPersist<Sy: FileSystem> {
    sync: Arc<Sy>,
    queue: mpsc::UnboundedSender<(MirrorOp, Credentials)>,
    cred: Credentials,
}

impl<Sy: FileSystem> FilePersist for MirrorPersist<Sy> {
    fn persist(&self, path: &str, buffer: &[u8], stats: &Stats) -> Result<()> {
        self.sync.write_file(path, buffer, stats.perm(), &self.cred)?;
        let _ = self.queue.send((MirrorOp::WriteFile(path.to_string(), buffer.to_vec(), stats.perm()), self.cred));
        Ok(())
    }
}

/// Recursively seed `sync` from `async_fs`'s current tree, at init time
/// (§4.K). Boxed for recursion — this only ever runs once, at startup, so
/// the extra indirection doesn't matter.
fn copy_async_tree_into_sync<'a, Sy: FileSystem, As: AsyncFileSystem>(
    async_fs: &'a As,
    sync: &'a Sy,
    path: &'a str,
    cred: &'a Credentials,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        let stats = async_fs.stat(path, cred).await?;
        match stats.file_type()? {
            FileType::Directory => {
                if path != "/" {
                    match sync.mkdir(path, stats.perm(), cred) {
                        Ok(()) => {}
                        Err(e) if e.errno() == Errno::EEXIST => {}
                        Err(e) => return Err(e),
                    }
                }
                for name in async_fs.readdir(path, cred).await? {
                    let child = pathutil::join(path, &name);
                    copy_async_tree_into_sync(async_fs, sync, &child, cred).await?;
                }
            }
            _ => {
                let data = async_fs.read_file(path, cred).await?;
                sync.write_file(path, &data, stats.perm(), cred)?;
            }
        }
        Ok(())
    })
}

fn spawn_writer_loop<As: AsyncFileSystem + 'static>(
    async_fs: Arc<As>,
    mut rx: mpsc::UnboundedReceiver<(MirrorOp, Credentials)>,
    desynced: Arc<DesyncState>,
) {
    tokio::spawn(async move {
        while let Some((op, cred)) = rx.recv().await {
            if let Err(e) = apply_op(&*async_fs, op, &cred).await {
                desynced.fail(e);
                break;
            }
        }
    });
}

/// Wraps a synchronous `sync` backend and an [`AsyncFileSystem`] `async_fs`
/// that mirrors it in the background.
#[derive(Debug)]
pub struct AsyncMirrorFileSystem<Sy: FileSystem, As: AsyncFileSystem + 'static> {
    sync: Arc<Sy>,
    async_fs: Arc<As>,
    queue: mpsc::UnboundedSender<(MirrorOp, Credentials)>,
    desynced: Arc<DesyncState>,
}

impl<Sy: FileSystem, As: AsyncFileSystem + 'static> AsyncMirrorFileSystem<Sy, As> {
    /// Wrap `sync`/`async_fs`, copying `async_fs`'s current tree into
    /// `sync` before returning, and spawning the background mirror writer.
    pub async fn new(sync: Sy, async_fs: As) -> Result<Self> {
        let sync = Arc::new(sync);
        let async_fs = Arc::new(async_fs);
        copy_async_tree_into_sync(&*async_fs, &*sync, "/", &Credentials::root()).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let desynced = Arc::new(DesyncState::default());
        spawn_writer_loop(async_fs.clone(), rx, desynced.clone());

        Ok(AsyncMirrorFileSystem { sync, async_fs, queue: tx, desynced })
    }

    fn mirror_persist(&self, cred: Credentials) -> Box<dyn FilePersist> {
        Box::new(MirrorPersist { sync: self.sync.clone(), queue: self.queue.clone(), cred })
    }

    fn enqueue(&self, op: MirrorOp, cred: Credentials) {
        let _ = self.queue.send((op, cred));
    }

    /// Whether the background writer has given up after a failed mirror
    /// call. Exposed for callers (e.g. the mount layer) that want to
    /// surface desync as a distinct condition rather than a generic error.
    pub fn is_desynchronized(&self) -> bool {
        self.desynced.failed.load(Ordering::Acquire)
    }
}

impl<Sy: FileSystem, As: AsyncFileSystem + 'static> FileSystem for AsyncMirrorFileSystem<Sy, As> {
    fn metadata(&self) -> Metadata {
        let sm = self.sync.metadata();
        Metadata {
            name: format!("AsyncMirrorFileSystem({})", sm.name),
            readonly: false,
            synchronous: true,
            supports_properties: sm.supports_properties,
            supports_links: sm.supports_links,
            total_space: sm.total_space,
            free_space: sm.free_space,
        }
    }

    fn open_file(&self, path: &str, flag: FileFlag, cred: &Credentials) -> Result<PreloadFile> {
        let data = self.sync.read_file(path, cred)?;
        let stats = self.sync.stat(path, cred)?;
        PreloadFile::check_open_permission(&stats, &flag, cred)?;
        Ok(PreloadFile::new(path, flag, stats, data, self.mirror_persist(*cred)))
    }

    fn create_file(&self, path: &str, flag: FileFlag, mode: u16, cred: &Credentials) -> Result<PreloadFile> {
        self.desynced.check()?;
        let file = self.sync.create_file(path, flag, mode, cred)?;
        let stats = file.stat();
        file.close()?;
        self.enqueue(MirrorOp::WriteFile(path.to_string(), Vec::new(), mode), *cred);
        Ok(PreloadFile::new(path, flag, stats, Vec::new(), self.mirror_persist(*cred)))
    }

    fn stat(&self, path: &str, cred: &Credentials) -> Result<Stats> {
        self.sync.stat(path, cred)
    }

    fn unlink(&self, path: &str, cred: &Credentials) -> Result<()> {
        self.desynced.check()?;
        self.sync.unlink(path, cred)?;
        self.enqueue(MirrorOp::Unlink(path.to_string()), *cred);
        Ok(())
    }

    fn mkdir(&self, path: &str, mode: u16, cred: &Credentials) -> Result<()> {
        self.desynced.check()?;
        self.sync.mkdir(path, mode, cred)?;
        self.enqueue(MirrorOp::Mkdir(path.to_string(), mode), *cred);
        Ok(())
    }

    fn rmdir(&self, path: &str, cred: &Credentials) -> Result<()> {
        self.desynced.check()?;
        self.sync.rmdir(path, cred)?;
        self.enqueue(MirrorOp::Rmdir(path.to_string()), *cred);
        Ok(())
    }

    fn rename(&self, old: &str, new: &str, cred: &Credentials) -> Result<()> {
        self.desynced.check()?;
        self.sync.rename(old, new, cred)?;
        self.enqueue(MirrorOp::Rename(old.to_string(), new.to_string()), *cred);
        Ok(())
    }

    fn readdir(&self, path: &str, cred: &Credentials) -> Result<Vec<String>> {
        self.sync.readdir(path, cred)
    }

    fn chmod(&self, path: &str, perm: u16, cred: &Credentials) -> Result<()> {
        self.desynced.check()?;
        self.sync.chmod(path, perm, cred)?;
        self.enqueue(MirrorOp::Chmod(path.to_string(), perm), *cred);
        Ok(())
    }

    fn chown(&self, path: &str, uid: Option<f64>, gid: Option<f64>, cred: &Credentials) -> Result<()> {
        self.desynced.check()?;
        self.sync.chown(path, uid, gid, cred)?;
        self.enqueue(MirrorOp::Chown(path.to_string(), uid, gid), *cred);
        Ok(())
    }

    fn utimes(&self, path: &str, atime_ms: f64, mtime_ms: f64, cred: &Credentials) -> Result<()> {
        self.desynced.check()?;
        self.sync.utimes(path, atime_ms, mtime_ms, cred)?;
        self.enqueue(MirrorOp::Utimes(path.to_string(), atime_ms, mtime_ms), *cred);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::async_store::InMemoryAsyncStore;
    use crate::kv::engine::KeyValueFileSystem;
    use crate::kv::memory::InMemoryStore;
    use crate::kv::async_engine::AsyncKeyValueFileSystem;

    async fn wait_until<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn init_copies_the_async_tree_into_sync() {
        let async_fs = AsyncKeyValueFileSystem::new(InMemoryAsyncStore::new()).await.unwrap();
        let cred = Credentials::root();
        async_fs.mkdir("/a", 0o755, &cred).await.unwrap();
        async_fs.create_file("/a/f.txt", FileFlag::from_str("w").unwrap(), 0o644, &cred).await.unwrap().close().unwrap();

        let sync = KeyValueFileSystem::new(InMemoryStore::new()).unwrap();
        let mirror = AsyncMirrorFileSystem::new(sync, async_fs).await.unwrap();
        assert_eq!(mirror.readdir("/", &cred).unwrap(), vec!["a".to_string()]);
        assert!(mirror.stat("/a/f.txt", &cred).is_ok());
    }

    #[tokio::test]
    async fn mkdir_mirrors_to_the_async_backend_eventually() {
        let async_fs = Arc::new(AsyncKeyValueFileSystem::new(InMemoryAsyncStore::new()).await.unwrap());
        let sync = KeyValueFileSystem::new(InMemoryStore::new()).unwrap();
        let cred = Credentials::root();

        // Build the mirror with the Arc we kept a handle to, so the test can
        // observe the async side after the background writer drains it.
        let (tx, rx) = mpsc::unbounded_channel();
        let desynced = Arc::new(DesyncState::default());
        spawn_writer_loop(async_fs.clone(), rx, desynced.clone());
        let mirror = AsyncMirrorFileSystem {
            sync: Arc::new(sync),
            async_fs: async_fs.clone(),
            queue: tx,
            desynced,
        };

        mirror.mkdir("/a", 0o755, &cred).unwrap();
        wait_until(|| async { async_fs.stat("/a", &Credentials::root()).await.is_ok() }).await;
    }

    #[derive(Debug)]
    struct ReadOnlyAsync<As: AsyncFileSystem>(Arc<As>);

    #[async_trait::async_trait]
    impl<As: AsyncFileSystem> AsyncFileSystem for ReadOnlyAsync<As> {
        fn metadata(&self) -> Metadata {
            let mut m = self.0.metadata();
            m.readonly = true;
            m
        }
        async fn open_file(&self, path: &str, flag: FileFlag, cred: &Credentials) -> Result<PreloadFile> {
            self.0.open_file(path, flag, cred).await
        }
        async fn create_file(&self, path: &str, flag: FileFlag, mode: u16, cred: &Credentials) -> Result<PreloadFile> {
            self.0.create_file(path, flag, mode, cred).await
        }
        async fn stat(&self, path: &str, cred: &Credentials) -> Result<Stats> {
            self.0.stat(path, cred).await
        }
        async fn unlink(&self, path: &str, cred: &Credentials) -> Result<()> {
            self.0.unlink(path, cred).await
        }
        async fn mkdir(&self, path: &str, mode: u16, cred: &Credentials) -> Result<()> {
            self.0.mkdir(path, mode, cred).await
        }
        async fn rmdir(&self, path: &str, cred: &Credentials) -> Result<()> {
            self.0.rmdir(path, cred).await
        }
        async fn rename(&self, old: &str, new: &str, cred: &Credentials) -> Result<()> {
            self.0.rename(old, new, cred).await
        }
        async fn readdir(&self, path: &str, cred: &Credentials) -> Result<Vec<String>> {
            self.0.readdir(path, cred).await
        }
        async fn chmod(&self, path: &str, perm: u16, cred: &Credentials) -> Result<()> {
            self.0.chmod(path, perm, cred).await
        }
        async fn chown(&self, path: &str, uid: Option<f64>, gid: Option<f64>, cred: &Credentials) -> Result<()> {
            self.0.chown(path, uid, gid, cred).await
        }
        async fn utimes(&self, path: &str, atime_ms: f64, mtime_ms: f64, cred: &Credentials) -> Result<()> {
            self.0.utimes(path, atime_ms, mtime_ms, cred).await
        }
    }

    #[tokio::test]
    async fn failed_mirror_write_desynchronizes_the_filesystem() {
        let inner = AsyncKeyValueFileSystem::new(InMemoryAsyncStore::new()).await.unwrap();
        let async_fs = ReadOnlyAsync(Arc::new(inner));
        let sync = KeyValueFileSystem::new(InMemoryStore::new()).unwrap();
        let cred = Credentials::root();

        let mirror = AsyncMirrorFileSystem::new(sync, async_fs).await.unwrap();
        let flag = FileFlag::from_str("w").unwrap();
        mirror.create_file("/a.txt", flag, 0o644, &cred).unwrap().close().unwrap();
        wait_until(|| async { mirror.is_desynchronized() }).await;

        let err = mirror.mkdir("/b", 0o755, &cred).unwrap_err();
        assert_eq!(err.errno(), Errno::EIO);
        assert!(err.to_string().contains("desynchronized"));
    }
}
