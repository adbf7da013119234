//! The async key-value engine (§4.G): same inode/listing model as
//! [`crate::kv::engine`], driven through [`AsyncKeyValueStore`] instead of
//! [`crate::kv::KeyValueStore`], with an LRU `fullPath -> inode key` cache
//! that the sync engine has no equivalent of.
//!
//! Path resolution here walks forward from the root through `path`'s
//! components rather than recursing parent-first the way
//! [`crate::kv::engine`]'s `_findINode` does — cheaper to express without
//! boxing every step's future, and equivalent in effect: a directory
//! listing that cycles back to an ancestor is caught the same way, via a
//! visited-keys guard, just accumulated forward instead of unwound
//! backward.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;

use crate::cred::Credentials;
use crate::error::{Errno, Error, Result};
use crate::file::{FilePersist, PreloadFile};
use crate::flags::FileFlag;
use crate::fs::{AsyncFileSystem, Metadata};
use crate::kv::async_store::{AsyncKeyValueStore, AsyncTransaction};
use crate::kv::TxMode;
use crate::pathutil;
use crate::stats::{FileType, Inode, Stats, ROOT_ID};

type Listing = HashMap<String, String>;

const CACHE_CAPACITY: usize = 1024;

async fn load_inode_async(tx: &mut dyn AsyncTransaction, key: &str) -> Result<Inode> {
    let bytes = tx
        .get(key)
        .await?
        .ok_or_else(|| Error::io(format!("dangling inode reference: {key}")))?;
    Inode::deserialize(&bytes)
}

async fn load_listing_async(tx: &mut dyn AsyncTransaction, dir: &Inode) -> Result<Listing> {
    let bytes = tx
        .get(&dir.id)
        .await?
        .ok_or_else(|| Error::io(format!("dangling listing reference: {}", dir.id)))?;
    serde_json::from_slice(&bytes).map_err(|e| Error::io(format!("corrupt directory listing: {e}")))
}

async fn write_listing_async(tx: &mut dyn AsyncTransaction, dir: &Inode, listing: &Listing) -> Result<()> {
    let bytes = serde_json::to_vec(listing).map_err(|e| Error::io(e.to_string()))?;
    tx.put(&dir.id, bytes, true).await?;
    Ok(())
}

/// Walk `path` component-by-component from the root, returning the
/// storage key of its inode record.
async fn resolve_path_async(tx: &mut dyn AsyncTransaction, path: &str) -> Result<String> {
    if path == "/" {
        return Ok(ROOT_ID.to_string());
    }
    let mut current_key = ROOT_ID.to_string();
    let mut visited = std::collections::HashSet::new();
    visited.insert(current_key.clone());
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        let inode = load_inode_async(tx, &current_key).await?;
        let listing = load_listing_async(tx, &inode).await?;
        current_key = listing.get(segment).cloned().ok_or_else(|| {
            Error::with_path(Errno::ENOENT, "no such file or directory", path)
        })?;
        if !visited.insert(current_key.clone()) {
            return Err(Error::io("Infinite loop detected while finding inode"));
        }
    }
    Ok(current_key)
}

async fn add_new_node_async(tx: &mut dyn AsyncTransaction, data: Vec<u8>) -> Result<String> {
    for _ in 0..5 {
        let id = uuid::Uuid::new_v4().to_string();
        if tx.put(&id, data.clone(), false).await? {
            return Ok(id);
        }
    }
    Err(Error::io("failed to allocate a node id after 5 attempts"))
}

fn require_write(dir: &Inode, cred: &Credentials) -> Result<()> {
    if dir.to_stats().check_access(cred, 0o2) {
        Ok(())
    } else {
        Err(Error::access("permission denied"))
    }
}

/// A path-resolution cache that can be disabled around a rename (the
/// window in which `fullPath -> inode key` mappings below the renamed
/// subtree all become stale at once).
#[derive(Debug)]
struct PathCache {
    cache: Mutex<LruCache<String, String>>,
    enabled: AtomicBool,
}

impl PathCache {
    fn new() -> Self {
        PathCache {
            cache: Mutex::new(LruCache::new(std::num::NonZeroUsize::new(CACHE_CAPACITY).unwrap())),
            enabled: AtomicBool::new(true),
        }
    }

    fn get(&self, path: &str) -> Option<String> {
        if !self.enabled.load(Ordering::Acquire) {
            return None;
        }
        self.cache.lock().get(path).cloned()
    }

    fn put(&self, path: &str, key: String) {
        if self.enabled.load(Ordering::Acquire) {
            self.cache.lock().put(path.to_string(), key);
        }
    }

    fn disable_and_clear(&self) {
        self.enabled.store(false, Ordering::Release);
        self.cache.lock().clear();
    }

    fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }
}

async fn resolve_cached(tx: &mut dyn AsyncTransaction, cache: &PathCache, path: &str) -> Result<String> {
    if let Some(key) = cache.get(path) {
        return Ok(key);
    }
    let key = resolve_path_async(tx, path).await?;
    cache.put(path, key.clone());
    Ok(key)
}

/// Persistence strategy for files opened against an
/// [`AsyncKeyValueFileSystem`].
#[derive(Debug)]
struct AsyncKvPersist<S: AsyncKeyValueStore + Clone + 'static> {
    store: S,
}

impl<S: AsyncKeyValueStore + Clone + 'static> FilePersist for AsyncKvPersist<S> {
    fn persist(&self, path: &str, buffer: &[u8], stats: &Stats) -> Result<()> {
        // `PreloadFile::sync_now`/`close` are synchronous entry points;
        // route through the blocking bridge the same way `LockedFs`'s
        // sync facade does for its own backend (§4.I). `block_in_place`
        // panics on a current-thread runtime (it has no other thread to
        // move the rest of the task to), so callers opening files against
        // this backend need a multi-threaded `tokio::runtime::Runtime` —
        // check for that and fail cleanly instead of letting it panic.
        let handle = tokio::runtime::Handle::current();
        if handle.runtime_flavor() == tokio::runtime::RuntimeFlavor::CurrentThread {
            return Err(Error::io(
                "AsyncKeyValueFileSystem's file persist path requires a multi-threaded tokio runtime; \
                 block_in_place is unavailable on a current-thread runtime",
            ));
        }
        let store = self.store.clone();
        let path = path.to_string();
        let buffer = buffer.to_vec();
        let stats = *stats;
        tokio::task::block_in_place(|| handle.block_on(sync_to_store(&store, &path, &buffer, &stats)))
    }
}

async fn sync_to_store<S: AsyncKeyValueStore>(store: &S, path: &str, data: &[u8], stats: &Stats) -> Result<()> {
    let mut tx = store.begin_transaction(TxMode::ReadWrite).await;
    let result: Result<()> = async {
        let inode_key = resolve_path_async(&mut *tx, path).await?;
        let mut inode = load_inode_async(&mut *tx, &inode_key).await?;
        tx.put(&inode.id, data.to_vec(), true).await?;
        if inode.update(stats) {
            tx.put(&inode_key, inode.serialize(), true).await?;
        }
        Ok(())
    }
    .await;
    match result {
        Ok(()) => tx.commit().await,
        Err(e) => {
            let _ = tx.abort().await;
            Err(e)
        }
    }
}

/// The async analogue of [`crate::kv::engine::KeyValueFileSystem`].
#[derive(Debug)]
pub struct AsyncKeyValueFileSystem<S: AsyncKeyValueStore + Clone + 'static> {
    store: S,
    cache: Arc<PathCache>,
}

impl<S: AsyncKeyValueStore + Clone + 'static> AsyncKeyValueFileSystem<S> {
    /// Wrap `store`, bootstrapping the root directory if absent.
    pub async fn new(store: S) -> Result<Self> {
        make_root(&store).await?;
        Ok(AsyncKeyValueFileSystem {
            store,
            cache: Arc::new(PathCache::new()),
        })
    }

    fn persist(&self) -> Box<dyn FilePersist> {
        Box::new(AsyncKvPersist { store: self.store.clone() })
    }
}

async fn make_root<S: AsyncKeyValueStore>(store: &S) -> Result<()> {
    let mut tx = store.begin_transaction(TxMode::ReadWrite).await;
    let result: Result<()> = async {
        if tx.get(ROOT_ID).await?.is_some() {
            return Ok(());
        }
        let now = crate::time::now_ms();
        let listing: Listing = HashMap::new();
        let listing_bytes = serde_json::to_vec(&listing).map_err(|e| Error::io(e.to_string()))?;
        let data_id = uuid::Uuid::new_v4().to_string();
        tx.put(&data_id, listing_bytes, false).await?;
        let inode = Inode::new(data_id, 2, FileType::Directory, 0o777, now, 0, 0);
        tx.put(ROOT_ID, inode.serialize(), false).await?;
        Ok(())
    }
    .await;
    match result {
        Ok(()) => tx.commit().await,
        Err(e) => {
            let _ = tx.abort().await;
            Err(e)
        }
    }
}

async fn commit_new_file<S: AsyncKeyValueStore>(
    store: &S,
    cache: &PathCache,
    path: &str,
    file_type: FileType,
    mode: u16,
    cred: &Credentials,
    data: Vec<u8>,
) -> Result<Inode> {
    let mut tx = store.begin_transaction(TxMode::ReadWrite).await;
    let result: Result<Inode> = async {
        if path == "/" {
            return Err(Error::with_path(Errno::EEXIST, "cannot create the root", path));
        }
        let parent_path = pathutil::dirname(path);
        let name = pathutil::basename(path);

        let parent_key = resolve_cached(&mut *tx, cache, &parent_path).await?;
        let parent_inode = load_inode_async(&mut *tx, &parent_key).await?;
        if !parent_inode.is_directory() {
            return Err(Error::with_path(Errno::ENOTDIR, "parent is not a directory", parent_path));
        }
        require_write(&parent_inode, cred)?;

        let mut listing = load_listing_async(&mut *tx, &parent_inode).await?;
        if listing.contains_key(&name) {
            return Err(Error::with_path(Errno::EEXIST, "file already exists", path));
        }

        let now = crate::time::now_ms();
        let size = data.len() as u32;
        let data_id = add_new_node_async(&mut *tx, data).await?;
        let inode = Inode::new(data_id, size, file_type, mode, now, cred.uid, cred.gid);
        let inode_key = add_new_node_async(&mut *tx, inode.serialize()).await?;

        listing.insert(name, inode_key.clone());
        write_listing_async(&mut *tx, &parent_inode, &listing).await?;
        cache.put(path, inode_key);
        Ok(inode)
    }
    .await;
    match result {
        Ok(inode) => {
            tx.commit().await?;
            Ok(inode)
        }
        Err(e) => {
            let _ = tx.abort().await;
            Err(e)
        }
    }
}

async fn remove_entry<S: AsyncKeyValueStore>(
    store: &S,
    cache: &PathCache,
    path: &str,
    is_dir: bool,
    cred: &Credentials,
) -> Result<()> {
    let mut tx = store.begin_transaction(TxMode::ReadWrite).await;
    let result: Result<()> = async {
        let parent_path = pathutil::dirname(path);
        let name = pathutil::basename(path);

        let parent_key = resolve_cached(&mut *tx, cache, &parent_path).await?;
        let parent_inode = load_inode_async(&mut *tx, &parent_key).await?;
        require_write(&parent_inode, cred)?;

        let mut listing = load_listing_async(&mut *tx, &parent_inode).await?;
        let child_key = listing
            .get(&name)
            .cloned()
            .ok_or_else(|| Error::with_path(Errno::ENOENT, "no such file or directory", path))?;
        let child_inode = load_inode_async(&mut *tx, &child_key).await?;

        if is_dir && !child_inode.is_directory() {
            return Err(Error::with_path(Errno::ENOTDIR, "not a directory", path));
        }
        if !is_dir && child_inode.is_directory() {
            return Err(Error::with_path(Errno::EISDIR, "is a directory", path));
        }

        tx.del(&child_inode.id).await?;
        tx.del(&child_key).await?;
        listing.remove(&name);
        write_listing_async(&mut *tx, &parent_inode, &listing).await?;
        Ok(())
    }
    .await;
    match result {
        Ok(()) => tx.commit().await,
        Err(e) => {
            let _ = tx.abort().await;
            Err(e)
        }
    }
}

async fn rename_entry<S: AsyncKeyValueStore>(
    store: &S,
    cache: &PathCache,
    old_path: &str,
    new_path: &str,
    cred: &Credentials,
) -> Result<()> {
    cache.disable_and_clear();
    let result = rename_entry_inner(store, old_path, new_path, cred).await;
    cache.enable();
    result
}

async fn rename_entry_inner<S: AsyncKeyValueStore>(
    store: &S,
    old_path: &str,
    new_path: &str,
    cred: &Credentials,
) -> Result<()> {
    let mut tx = store.begin_transaction(TxMode::ReadWrite).await;
    let result: Result<()> = async {
        let old_parent_path = pathutil::dirname(old_path);
        let old_name = pathutil::basename(old_path);
        let new_parent_path = pathutil::dirname(new_path);
        let new_name = pathutil::basename(new_path);

        let old_parent_key = resolve_path_async(&mut *tx, &old_parent_path).await?;
        let old_parent_inode = load_inode_async(&mut *tx, &old_parent_key).await?;
        require_write(&old_parent_inode, cred)?;

        let mut old_listing = load_listing_async(&mut *tx, &old_parent_inode).await?;
        let node_key = old_listing
            .get(&old_name)
            .cloned()
            .ok_or_else(|| Error::with_path(Errno::ENOENT, "no such file or directory", old_path))?;

        let old_prefix = format!("{}/", pathutil::normalize(old_path));
        let new_parent_prefix = format!("{}/", pathutil::normalize(&new_parent_path));
        if new_parent_prefix.starts_with(&old_prefix) {
            return Err(Error::with_path(
                Errno::EBUSY,
                "cannot move a directory into itself or a descendant",
                old_path,
            ));
        }

        let same_parent = new_parent_path == old_parent_path;
        old_listing.remove(&old_name);

        let (new_parent_inode, mut new_listing) = if same_parent {
            (old_parent_inode.clone(), old_listing.clone())
        } else {
            let npk = resolve_path_async(&mut *tx, &new_parent_path).await?;
            let npi = load_inode_async(&mut *tx, &npk).await?;
            require_write(&npi, cred)?;
            let listing = load_listing_async(&mut *tx, &npi).await?;
            (npi, listing)
        };

        if let Some(existing_key) = new_listing.get(&new_name).cloned() {
            let existing_inode = load_inode_async(&mut *tx, &existing_key).await?;
            if existing_inode.is_directory() {
                return Err(Error::with_path(Errno::EPERM, "cannot rename over a directory", new_path));
            }
            tx.del(&existing_inode.id).await?;
            tx.del(&existing_key).await?;
        }

        new_listing.insert(new_name, node_key);
        if same_parent {
            write_listing_async(&mut *tx, &old_parent_inode, &new_listing).await?;
        } else {
            write_listing_async(&mut *tx, &old_parent_inode, &old_listing).await?;
            write_listing_async(&mut *tx, &new_parent_inode, &new_listing).await?;
        }
        Ok(())
    }
    .await;
    match result {
        Ok(()) => tx.commit().await,
        Err(e) => {
            let _ = tx.abort().await;
            Err(e)
        }
    }
}

async fn mutate_stats<S: AsyncKeyValueStore>(
    store: &S,
    cache: &PathCache,
    path: &str,
    f: impl FnOnce(&mut Stats) + Send,
) -> Result<()> {
    let mut tx = store.begin_transaction(TxMode::ReadWrite).await;
    let result: Result<()> = async {
        let inode_key = resolve_cached(&mut *tx, cache, path).await?;
        let mut inode = load_inode_async(&mut *tx, &inode_key).await?;
        let mut stats = inode.to_stats();
        f(&mut stats);
        if inode.update(&stats) {
            tx.put(&inode_key, inode.serialize(), true).await?;
        }
        Ok(())
    }
    .await;
    match result {
        Ok(()) => tx.commit().await,
        Err(e) => {
            let _ = tx.abort().await;
            Err(e)
        }
    }
}

#[async_trait]
impl<S: AsyncKeyValueStore + Clone + 'static> AsyncFileSystem for AsyncKeyValueFileSystem<S> {
    fn metadata(&self) -> Metadata {
        Metadata::unbounded(format!("AsyncKeyValueFileSystem({})", self.store.name()))
    }

    async fn open_file(&self, path: &str, flag: FileFlag, cred: &Credentials) -> Result<PreloadFile> {
        let mut tx = self.store.begin_transaction(TxMode::ReadOnly).await;
        let result: Result<(Inode, Vec<u8>)> = async {
            let inode_key = resolve_cached(&mut *tx, &self.cache, path).await?;
            let inode = load_inode_async(&mut *tx, &inode_key).await?;
            if inode.is_directory() {
                return Err(Error::with_path(Errno::EISDIR, "is a directory", path));
            }
            PreloadFile::check_open_permission(&inode.to_stats(), &flag, cred)?;
            let data = tx
                .get(&inode.id)
                .await?
                .ok_or_else(|| Error::io(format!("dangling data reference: {}", inode.id)))?;
            Ok((inode, data))
        }
        .await;
        let _ = tx.commit().await;
        let (inode, data) = result?;
        Ok(PreloadFile::new(path, flag, inode.to_stats(), data, self.persist()))
    }

    async fn create_file(&self, path: &str, flag: FileFlag, mode: u16, cred: &Credentials) -> Result<PreloadFile> {
        let inode = commit_new_file(&self.store, &self.cache, path, FileType::File, mode, cred, Vec::new()).await?;
        Ok(PreloadFile::new(path, flag, inode.to_stats(), Vec::new(), self.persist()))
    }

    async fn stat(&self, path: &str, _cred: &Credentials) -> Result<Stats> {
        let mut tx = self.store.begin_transaction(TxMode::ReadOnly).await;
        let result: Result<Stats> = async {
            let inode_key = resolve_cached(&mut *tx, &self.cache, path).await?;
            Ok(load_inode_async(&mut *tx, &inode_key).await?.to_stats())
        }
        .await;
        let _ = tx.commit().await;
        result
    }

    async fn unlink(&self, path: &str, cred: &Credentials) -> Result<()> {
        remove_entry(&self.store, &self.cache, path, false, cred).await
    }

    async fn mkdir(&self, path: &str, mode: u16, cred: &Credentials) -> Result<()> {
        commit_new_file(&self.store, &self.cache, path, FileType::Directory, mode, cred, b"{}".to_vec()).await?;
        Ok(())
    }

    async fn rmdir(&self, path: &str, cred: &Credentials) -> Result<()> {
        if !self.readdir(path, cred).await?.is_empty() {
            return Err(Error::with_path(Errno::ENOTEMPTY, "directory not empty", path));
        }
        remove_entry(&self.store, &self.cache, path, true, cred).await
    }

    async fn rename(&self, old: &str, new: &str, cred: &Credentials) -> Result<()> {
        rename_entry(&self.store, &self.cache, old, new, cred).await
    }

    async fn readdir(&self, path: &str, _cred: &Credentials) -> Result<Vec<String>> {
        let mut tx = self.store.begin_transaction(TxMode::ReadOnly).await;
        let result: Result<Vec<String>> = async {
            let inode_key = resolve_cached(&mut *tx, &self.cache, path).await?;
            let inode = load_inode_async(&mut *tx, &inode_key).await?;
            if !inode.is_directory() {
                return Err(Error::with_path(Errno::ENOTDIR, "not a directory", path));
            }
            let listing = load_listing_async(&mut *tx, &inode).await?;
            let mut names: Vec<String> = listing.into_keys().collect();
            names.sort();
            Ok(names)
        }
        .await;
        let _ = tx.commit().await;
        result
    }

    async fn chmod(&self, path: &str, perm: u16, _cred: &Credentials) -> Result<()> {
        mutate_stats(&self.store, &self.cache, path, |stats| stats.chmod(perm)).await
    }

    async fn chown(&self, path: &str, uid: Option<f64>, gid: Option<f64>, _cred: &Credentials) -> Result<()> {
        mutate_stats(&self.store, &self.cache, path, |stats| stats.chown(uid, gid)).await
    }

    async fn utimes(&self, path: &str, atime_ms: f64, mtime_ms: f64, _cred: &Credentials) -> Result<()> {
        mutate_stats(&self.store, &self.cache, path, |stats| {
            stats.atime_ms = atime_ms;
            stats.mtime_ms = mtime_ms;
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::async_store::InMemoryAsyncStore;

    async fn fs() -> AsyncKeyValueFileSystem<InMemoryAsyncStore> {
        AsyncKeyValueFileSystem::new(InMemoryAsyncStore::new()).await.unwrap()
    }

    #[tokio::test]
    async fn root_exists_and_is_empty() {
        let fs = fs().await;
        let cred = Credentials::root();
        assert!(fs.readdir("/", &cred).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn mkdir_then_readdir() {
        let fs = fs().await;
        let cred = Credentials::root();
        fs.mkdir("/a", 0o755, &cred).await.unwrap();
        assert_eq!(fs.readdir("/", &cred).await.unwrap(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn cache_survives_reads_but_is_cleared_on_rename() {
        let fs = fs().await;
        let cred = Credentials::root();
        fs.mkdir("/a", 0o755, &cred).await.unwrap();
        fs.mkdir("/a/b", 0o755, &cred).await.unwrap();
        // warm the cache
        let _ = fs.stat("/a/b", &cred).await.unwrap();
        assert!(fs.cache.get("/a/b").is_some());
        fs.rename("/a/b", "/a/c", &cred).await.unwrap();
        assert!(fs.cache.get("/a/b").is_none());
        assert!(fs.stat("/a/c", &cred).await.is_ok());
    }

    #[tokio::test]
    async fn rename_directory_into_descendant_is_ebusy() {
        let fs = fs().await;
        let cred = Credentials::root();
        fs.mkdir("/d", 0o755, &cred).await.unwrap();
        fs.mkdir("/d/sub", 0o755, &cred).await.unwrap();
        let err = fs.rename("/d", "/d/sub/moved", &cred).await.unwrap_err();
        assert_eq!(err.errno(), Errno::EBUSY);
    }

    // `AsyncKvPersist::persist` bridges back into the async store via
    // `tokio::task::block_in_place`, which requires a multi-threaded
    // runtime — the default `#[tokio::test]` flavor above never exercises
    // it, since none of those tests open/write/close a file.
    async fn write_whole_file(
        fs: &AsyncKeyValueFileSystem<InMemoryAsyncStore>,
        path: &str,
        data: &[u8],
        cred: &Credentials,
    ) -> Result<()> {
        let flag = FileFlag::from_str("w").unwrap();
        let mut file = fs.open(path, flag, 0o644, cred).await?;
        file.write(data)?;
        file.close()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn closing_a_written_file_persists_through_block_in_place() {
        let fs = fs().await;
        let cred = Credentials::root();
        write_whole_file(&fs, "/f", b"hello", &cred).await.unwrap();
        assert_eq!(fs.read_file("/f", &cred).await.unwrap(), b"hello");
        assert_eq!(fs.stat("/f", &cred).await.unwrap().size, 5);
    }

    #[tokio::test]
    async fn closing_a_written_file_on_a_current_thread_runtime_fails_cleanly() {
        let fs = fs().await;
        let cred = Credentials::root();
        let err = write_whole_file(&fs, "/f", b"hello", &cred).await.unwrap_err();
        assert_eq!(err.errno(), Errno::EIO);
    }
}
