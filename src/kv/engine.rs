//! The inode-and-directory storage engine (§4.G): turns a flat
//! [`KeyValueStore`] into a full [`FileSystem`].
//!
//! Two key spaces share the one flat store: inode records (fixed-layout,
//! see [`crate::stats::Inode`]) and data blobs (a file's raw bytes, or a
//! directory's JSON-encoded `name -> inode key` listing). A directory entry
//! never points at a data blob directly — it always points at an inode
//! record, whose own `id` field is the data blob's key. That extra
//! indirection is what lets `rename` repoint a listing entry at the same
//! inode record without touching the underlying data, and what `_sync`
//! re-resolves through on every write-back, since a rename may have swapped
//! out which inode a path's directory entry names.

use std::collections::{HashMap, HashSet};

use crate::cred::Credentials;
use crate::error::{Errno, Error, Result};
use crate::file::{FilePersist, PreloadFile};
use crate::flags::FileFlag;
use crate::fs::{FileSystem, Metadata};
use crate::kv::{KeyValueStore, Transaction, TxMode};
use crate::pathutil;
use crate::stats::{FileType, Inode, Stats, ROOT_ID};

type Listing = HashMap<String, String>;

fn load_inode(tx: &mut dyn Transaction, key: &str) -> Result<Inode> {
    let bytes = tx
        .get(key)?
        .ok_or_else(|| Error::io(format!("dangling inode reference: {key}")))?;
    Inode::deserialize(&bytes)
}

fn load_listing(tx: &mut dyn Transaction, dir: &Inode) -> Result<Listing> {
    let bytes = tx
        .get(&dir.id)?
        .ok_or_else(|| Error::io(format!("dangling listing reference: {}", dir.id)))?;
    serde_json::from_slice(&bytes).map_err(|e| Error::io(format!("corrupt directory listing: {e}")))
}

fn write_listing(tx: &mut dyn Transaction, dir: &Inode, listing: &Listing) -> Result<()> {
    let bytes = serde_json::to_vec(listing).map_err(|e| Error::io(e.to_string()))?;
    tx.put(&dir.id, bytes, true)?;
    Ok(())
}

/// Resolve the storage key of the inode record for `parent`/`filename`,
/// guarding against cyclic directory listings with `visited`.
fn find_inode(
    tx: &mut dyn Transaction,
    parent: &str,
    filename: &str,
    visited: &mut HashSet<String>,
) -> Result<String> {
    let marker = format!("{parent}:{filename}");
    if !visited.insert(marker) {
        return Err(Error::io("Infinite loop detected while finding inode"));
    }
    if parent == "/" && filename.is_empty() {
        return Ok(ROOT_ID.to_string());
    }
    let parent_key = find_inode(tx, &pathutil::dirname(parent), &pathutil::basename(parent), visited)?;
    let parent_inode = load_inode(tx, &parent_key)?;
    let listing = load_listing(tx, &parent_inode)?;
    listing.get(filename).cloned().ok_or_else(|| {
        Error::with_path(
            Errno::ENOENT,
            "no such file or directory",
            pathutil::join(parent, filename),
        )
    })
}

/// Resolve `path` to the storage key of its inode record.
fn resolve_inode_key(tx: &mut dyn Transaction, path: &str) -> Result<String> {
    let mut visited = HashSet::new();
    if path == "/" {
        find_inode(tx, "/", "", &mut visited)
    } else {
        find_inode(tx, &pathutil::dirname(path), &pathutil::basename(path), &mut visited)
    }
}

/// Allocate a fresh storage key for `data`, retrying on a v4-UUID
/// collision. The source's sync engine reset `retries` without
/// incrementing it on each loop — effectively one attempt despite the
/// claimed five; this follows the async engine's corrected form instead
/// (spec.md §9 Open Questions: "an implementer should pick the async
/// form").
fn add_new_node(tx: &mut dyn Transaction, data: Vec<u8>) -> Result<String> {
    for _ in 0..5 {
        let id = uuid::Uuid::new_v4().to_string();
        if tx.put(&id, data.clone(), false)? {
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

/// `commitNewFile` (§4.G): allocate a data blob and inode record for a new
/// file or directory under `path`, and link it into the parent's listing.
fn commit_new_file<S: KeyValueStore>(
    store: &S,
    path: &str,
    file_type: FileType,
    mode: u16,
    cred: &Credentials,
    data: Vec<u8>,
) -> Result<Inode> {
    let mut tx = store.begin_transaction(TxMode::ReadWrite);
    let result = (|| -> Result<Inode> {
        if path == "/" {
            return Err(Error::with_path(Errno::EEXIST, "cannot create the root", path));
        }
        let parent_path = pathutil::dirname(path);
        let name = pathutil::basename(path);

        let parent_key = resolve_inode_key(&mut *tx, &parent_path)?;
        let parent_inode = load_inode(&mut *tx, &parent_key)?;
        if !parent_inode.is_directory() {
            return Err(Error::with_path(Errno::ENOTDIR, "parent is not a directory", parent_path));
        }
        require_write(&parent_inode, cred)?;

        let mut listing = load_listing(&mut *tx, &parent_inode)?;
        if listing.contains_key(&name) {
            return Err(Error::with_path(Errno::EEXIST, "file already exists", path));
        }

        let now = crate::time::now_ms();
        let size = data.len() as u32;
        let data_id = add_new_node(&mut *tx, data)?;
        let inode = Inode::new(data_id, size, file_type, mode, now, cred.uid, cred.gid);
        let inode_key = add_new_node(&mut *tx, inode.serialize())?;

        listing.insert(name, inode_key);
        write_listing(&mut *tx, &parent_inode, &listing)?;
        Ok(inode)
    })();
    match result {
        Ok(inode) => {
            tx.commit()?;
            Ok(inode)
        }
        Err(e) => {
            let _ = tx.abort();
            Err(e)
        }
    }
}

/// `removeEntry` (§4.G): unlink `path` from its parent's listing and
/// delete its data blob and inode record. Emptiness of a directory being
/// removed is the caller's responsibility (readdir length check).
fn remove_entry<S: KeyValueStore>(store: &S, path: &str, is_dir: bool, cred: &Credentials) -> Result<()> {
    let mut tx = store.begin_transaction(TxMode::ReadWrite);
    let result = (|| -> Result<()> {
        let parent_path = pathutil::dirname(path);
        let name = pathutil::basename(path);

        let parent_key = resolve_inode_key(&mut *tx, &parent_path)?;
        let parent_inode = load_inode(&mut *tx, &parent_key)?;
        require_write(&parent_inode, cred)?;

        let mut listing = load_listing(&mut *tx, &parent_inode)?;
        let child_key = listing
            .get(&name)
            .cloned()
            .ok_or_else(|| Error::with_path(Errno::ENOENT, "no such file or directory", path))?;
        let child_inode = load_inode(&mut *tx, &child_key)?;

        if is_dir && !child_inode.is_directory() {
            return Err(Error::with_path(Errno::ENOTDIR, "not a directory", path));
        }
        if !is_dir && child_inode.is_directory() {
            return Err(Error::with_path(Errno::EISDIR, "is a directory", path));
        }

        tx.del(&child_inode.id)?;
        tx.del(&child_key)?;
        listing.remove(&name);
        write_listing(&mut *tx, &parent_inode, &listing)?;
        Ok(())
    })();
    match result {
        Ok(()) => tx.commit(),
        Err(e) => {
            let _ = tx.abort();
            Err(e)
        }
    }
}

/// `rename` (§4.G): move a single directory entry within one transaction.
fn rename_entry<S: KeyValueStore>(store: &S, old_path: &str, new_path: &str, cred: &Credentials) -> Result<()> {
    let mut tx = store.begin_transaction(TxMode::ReadWrite);
    let result = (|| -> Result<()> {
        let old_parent_path = pathutil::dirname(old_path);
        let old_name = pathutil::basename(old_path);
        let new_parent_path = pathutil::dirname(new_path);
        let new_name = pathutil::basename(new_path);

        let old_parent_key = resolve_inode_key(&mut *tx, &old_parent_path)?;
        let old_parent_inode = load_inode(&mut *tx, &old_parent_key)?;
        require_write(&old_parent_inode, cred)?;

        let mut old_listing = load_listing(&mut *tx, &old_parent_inode)?;
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
            let npk = resolve_inode_key(&mut *tx, &new_parent_path)?;
            let npi = load_inode(&mut *tx, &npk)?;
            require_write(&npi, cred)?;
            let listing = load_listing(&mut *tx, &npi)?;
            (npi, listing)
        };

        if let Some(existing_key) = new_listing.get(&new_name).cloned() {
            let existing_inode = load_inode(&mut *tx, &existing_key)?;
            if existing_inode.is_directory() {
                return Err(Error::with_path(Errno::EPERM, "cannot rename over a directory", new_path));
            }
            tx.del(&existing_inode.id)?;
            tx.del(&existing_key)?;
        }

        new_listing.insert(new_name, node_key);
        if same_parent {
            write_listing(&mut *tx, &old_parent_inode, &new_listing)?;
        } else {
            write_listing(&mut *tx, &old_parent_inode, &old_listing)?;
            write_listing(&mut *tx, &new_parent_inode, &new_listing)?;
        }
        Ok(())
    })();
    match result {
        Ok(()) => tx.commit(),
        Err(e) => {
            let _ = tx.abort();
            Err(e)
        }
    }
}

/// `_sync` (§4.G): write a [`PreloadFile`]'s buffer and stats back through
/// to the store, re-resolving the inode by path since a rename may have
/// repointed the parent's listing entry since the file was opened.
fn sync_to_store<S: KeyValueStore>(store: &S, path: &str, data: &[u8], stats: &Stats) -> Result<()> {
    let mut tx = store.begin_transaction(TxMode::ReadWrite);
    let result = (|| -> Result<()> {
        let inode_key = resolve_inode_key(&mut *tx, path)?;
        let mut inode = load_inode(&mut *tx, &inode_key)?;
        tx.put(&inode.id, data.to_vec(), true)?;
        if inode.update(stats) {
            tx.put(&inode_key, inode.serialize(), true)?;
        }
        Ok(())
    })();
    match result {
        Ok(()) => tx.commit(),
        Err(e) => {
            let _ = tx.abort();
            Err(e)
        }
    }
}

/// Mutate an inode's metadata in place via a `Stats`-level closure (backs
/// `chmod`/`chown`/`utimes`).
fn mutate_stats<S: KeyValueStore>(store: &S, path: &str, f: impl FnOnce(&mut Stats)) -> Result<()> {
    let mut tx = store.begin_transaction(TxMode::ReadWrite);
    let result = (|| -> Result<()> {
        let inode_key = resolve_inode_key(&mut *tx, path)?;
        let mut inode = load_inode(&mut *tx, &inode_key)?;
        let mut stats = inode.to_stats();
        f(&mut stats);
        if inode.update(&stats) {
            tx.put(&inode_key, inode.serialize(), true)?;
        }
        Ok(())
    })();
    match result {
        Ok(()) => tx.commit(),
        Err(e) => {
            let _ = tx.abort();
            Err(e)
        }
    }
}

/// Persistence strategy handed to every [`PreloadFile`] opened against a
/// [`KeyValueFileSystem`]: writes through to the owning store by path.
#[derive(Debug, Clone)]
struct KvPersist<S: KeyValueStore + Clone + 'static> {
    store: S,
}

impl<S: KeyValueStore + Clone + 'static> FilePersist for KvPersist<S> {
    fn persist(&self, path: &str, buffer: &[u8], stats: &Stats) -> Result<()> {
        sync_to_store(&self.store, path, buffer, stats)
    }
}

/// A [`FileSystem`] backed by a flat [`KeyValueStore`], per §4.G.
#[derive(Debug, Clone)]
pub struct KeyValueFileSystem<S: KeyValueStore + Clone + 'static> {
    store: S,
}

impl<S: KeyValueStore + Clone + 'static> KeyValueFileSystem<S> {
    /// Wrap `store`, bootstrapping the root directory if it doesn't
    /// already exist (`makeRoot`, §4.G).
    pub fn new(store: S) -> Result<Self> {
        make_root(&store)?;
        Ok(KeyValueFileSystem { store })
    }

    fn persist(&self) -> Box<dyn FilePersist> {
        Box::new(KvPersist { store: self.store.clone() })
    }
}

/// `makeRoot` (§4.G): create the root directory inode (mode
/// `0o777 | DIRECTORY`, owned by `uid=gid=0`) if absent.
fn make_root<S: KeyValueStore>(store: &S) -> Result<()> {
    let mut tx = store.begin_transaction(TxMode::ReadWrite);
    let result = (|| -> Result<()> {
        if tx.get(ROOT_ID)?.is_some() {
            return Ok(());
        }
        let now = crate::time::now_ms();
        let listing: Listing = HashMap::new();
        let listing_bytes = serde_json::to_vec(&listing).map_err(|e| Error::io(e.to_string()))?;
        let data_id = uuid::Uuid::new_v4().to_string();
        tx.put(&data_id, listing_bytes, false)?;
        let inode = Inode::new(data_id, 2, FileType::Directory, 0o777, now, 0, 0);
        tx.put(ROOT_ID, inode.serialize(), false)?;
        Ok(())
    })();
    match result {
        Ok(()) => tx.commit(),
        Err(e) => {
            let _ = tx.abort();
            Err(e)
        }
    }
}

impl<S: KeyValueStore + Clone + 'static> FileSystem for KeyValueFileSystem<S> {
    fn metadata(&self) -> Metadata {
        Metadata::unbounded(format!("KeyValueFileSystem({})", self.store.name()))
    }

    fn open_file(&self, path: &str, flag: FileFlag, cred: &Credentials) -> Result<PreloadFile> {
        let mut tx = self.store.begin_transaction(TxMode::ReadOnly);
        let result = (|| -> Result<(Inode, Vec<u8>)> {
            let inode_key = resolve_inode_key(&mut *tx, path)?;
            let inode = load_inode(&mut *tx, &inode_key)?;
            if inode.is_directory() {
                return Err(Error::with_path(Errno::EISDIR, "is a directory", path));
            }
            PreloadFile::check_open_permission(&inode.to_stats(), &flag, cred)?;
            let data = tx
                .get(&inode.id)?
                .ok_or_else(|| Error::io(format!("dangling data reference: {}", inode.id)))?;
            Ok((inode, data))
        })();
        let _ = tx.commit();
        let (inode, data) = result?;
        Ok(PreloadFile::new(path, flag, inode.to_stats(), data, self.persist()))
    }

    fn create_file(&self, path: &str, flag: FileFlag, mode: u16, cred: &Credentials) -> Result<PreloadFile> {
        let inode = commit_new_file(&self.store, path, FileType::File, mode, cred, Vec::new())?;
        Ok(PreloadFile::new(path, flag, inode.to_stats(), Vec::new(), self.persist()))
    }

    fn stat(&self, path: &str, _cred: &Credentials) -> Result<Stats> {
        let mut tx = self.store.begin_transaction(TxMode::ReadOnly);
        let result = (|| -> Result<Stats> {
            let inode_key = resolve_inode_key(&mut *tx, path)?;
            Ok(load_inode(&mut *tx, &inode_key)?.to_stats())
        })();
        let _ = tx.commit();
        result
    }

    fn unlink(&self, path: &str, cred: &Credentials) -> Result<()> {
        remove_entry(&self.store, path, false, cred)
    }

    fn mkdir(&self, path: &str, mode: u16, cred: &Credentials) -> Result<()> {
        commit_new_file(&self.store, path, FileType::Directory, mode, cred, b"{}".to_vec())?;
        Ok(())
    }

    fn rmdir(&self, path: &str, cred: &Credentials) -> Result<()> {
        if !self.readdir(path, cred)?.is_empty() {
            return Err(Error::with_path(Errno::ENOTEMPTY, "directory not empty", path));
        }
        remove_entry(&self.store, path, true, cred)
    }

    fn rename(&self, old: &str, new: &str, cred: &Credentials) -> Result<()> {
        rename_entry(&self.store, old, new, cred)
    }

    fn readdir(&self, path: &str, _cred: &Credentials) -> Result<Vec<String>> {
        let mut tx = self.store.begin_transaction(TxMode::ReadOnly);
        let result = (|| -> Result<Vec<String>> {
            let inode_key = resolve_inode_key(&mut *tx, path)?;
            let inode = load_inode(&mut *tx, &inode_key)?;
            if !inode.is_directory() {
                return Err(Error::with_path(Errno::ENOTDIR, "not a directory", path));
            }
            let listing = load_listing(&mut *tx, &inode)?;
            let mut names: Vec<String> = listing.into_keys().collect();
            names.sort();
            Ok(names)
        })();
        let _ = tx.commit();
        result
    }

    fn chmod(&self, path: &str, perm: u16, _cred: &Credentials) -> Result<()> {
        mutate_stats(&self.store, path, |stats| stats.chmod(perm))
    }

    fn chown(&self, path: &str, uid: Option<f64>, gid: Option<f64>, _cred: &Credentials) -> Result<()> {
        mutate_stats(&self.store, path, |stats| stats.chown(uid, gid))
    }

    fn utimes(&self, path: &str, atime_ms: f64, mtime_ms: f64, _cred: &Credentials) -> Result<()> {
        mutate_stats(&self.store, path, |stats| {
            stats.atime_ms = atime_ms;
            stats.mtime_ms = mtime_ms;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::memory::InMemoryStore;

    fn fs() -> KeyValueFileSystem<InMemoryStore> {
        KeyValueFileSystem::new(InMemoryStore::new()).unwrap()
    }

    #[test]
    fn root_exists_and_is_empty() {
        let fs = fs();
        let cred = Credentials::root();
        let stats = fs.stat("/", &cred).unwrap();
        assert_eq!(stats.file_type().unwrap(), FileType::Directory);
        assert!(fs.readdir("/", &cred).unwrap().is_empty());
    }

    #[test]
    fn mkdir_then_readdir_and_duplicate_is_eexist() {
        let fs = fs();
        let cred = Credentials::root();
        fs.mkdir("/a", 0o755, &cred).unwrap();
        assert_eq!(fs.readdir("/", &cred).unwrap(), vec!["a".to_string()]);
        assert_eq!(fs.mkdir("/a", 0o755, &cred).unwrap_err().errno(), Errno::EEXIST);
    }

    #[test]
    fn write_read_file_round_trip() {
        let fs = fs();
        let cred = Credentials::root();
        fs.write_file("/x.txt", b"hello", 0o644, &cred).unwrap();
        assert_eq!(fs.read_file("/x.txt", &cred).unwrap(), b"hello");
        let stats = fs.stat("/x.txt", &cred).unwrap();
        assert_eq!(stats.size, 5);
    }

    #[test]
    fn rmdir_nonempty_is_enotempty() {
        let fs = fs();
        let cred = Credentials::root();
        fs.mkdir("/d", 0o755, &cred).unwrap();
        fs.write_file("/d/f", b"x", 0o644, &cred).unwrap();
        assert_eq!(fs.rmdir("/d", &cred).unwrap_err().errno(), Errno::ENOTEMPTY);
        fs.unlink("/d/f", &cred).unwrap();
        fs.rmdir("/d", &cred).unwrap();
    }

    #[test]
    fn rename_moves_entry_between_directories() {
        let fs = fs();
        let cred = Credentials::root();
        fs.mkdir("/d1", 0o755, &cred).unwrap();
        fs.mkdir("/d2", 0o755, &cred).unwrap();
        fs.write_file("/d1/f", b"1", 0o644, &cred).unwrap();
        fs.rename("/d1/f", "/d2/f", &cred).unwrap();
        assert!(fs.readdir("/d1", &cred).unwrap().is_empty());
        assert_eq!(fs.read_file("/d2/f", &cred).unwrap(), b"1");
    }

    #[test]
    fn rename_directory_into_own_descendant_is_ebusy() {
        let fs = fs();
        let cred = Credentials::root();
        fs.mkdir("/d", 0o755, &cred).unwrap();
        fs.mkdir("/d/sub", 0o755, &cred).unwrap();
        let err = fs.rename("/d", "/d/sub/moved", &cred).unwrap_err();
        assert_eq!(err.errno(), Errno::EBUSY);
    }

    #[test]
    fn rename_over_existing_file_replaces_it() {
        let fs = fs();
        let cred = Credentials::root();
        fs.write_file("/a", b"aaa", 0o644, &cred).unwrap();
        fs.write_file("/b", b"bb", 0o644, &cred).unwrap();
        fs.rename("/a", "/b", &cred).unwrap();
        assert_eq!(fs.read_file("/b", &cred).unwrap(), b"aaa");
    }

    #[test]
    fn rename_over_existing_directory_is_eperm() {
        let fs = fs();
        let cred = Credentials::root();
        fs.write_file("/a", b"aaa", 0o644, &cred).unwrap();
        fs.mkdir("/b", 0o755, &cred).unwrap();
        assert_eq!(fs.rename("/a", "/b", &cred).unwrap_err().errno(), Errno::EPERM);
    }

    #[test]
    fn unlink_missing_file_is_enoent() {
        let fs = fs();
        let cred = Credentials::root();
        assert_eq!(fs.unlink("/missing", &cred).unwrap_err().errno(), Errno::ENOENT);
    }

    #[test]
    fn chmod_is_visible_on_next_stat() {
        let fs = fs();
        let cred = Credentials::root();
        fs.write_file("/f", b"x", 0o644, &cred).unwrap();
        fs.chmod("/f", 0o600, &cred).unwrap();
        assert_eq!(fs.stat("/f", &cred).unwrap().perm(), 0o600);
    }

    #[test]
    fn unwritable_parent_directory_refuses_new_files() {
        let fs = fs();
        let owner = Credentials::new(1, 1);
        let other = Credentials::new(2, 2);
        fs.mkdir("/locked", 0o700, &owner).unwrap();
        let err = fs.write_file("/locked/f", b"x", 0o644, &other).unwrap_err();
        assert_eq!(err.errno(), Errno::EACCES);
    }
}
