//! The overlay filesystem (§4.J): a read-only `lower` layered under a
//! writable `upper`, with deletions recorded in a log on `upper` rather
//! than mutating `lower`.
//!
//! Every write touches `upper` only. A file that exists solely on `lower`
//! is copied up the first time it would be mutated (`chmod`/`chown`/
//! `utimes`/an open that isn't read-only) — never eagerly, never for a
//! plain read.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cred::Credentials;
use crate::error::{Errno, Error, Result};
use crate::file::{FilePersist, PreloadFile};
use crate::flags::{FileFlag, PathExistsAction, PathNotExistsAction};
use crate::fs::{FileSystem, Metadata};
use crate::pathutil;
use crate::stats::{FileType, Stats};

const DELETION_LOG_PATH: &str = "/.deletedFiles.log";

fn ensure_upper_dirs<L: FileSystem, U: FileSystem>(lower: &L, upper: &U, dir: &str, cred: &Credentials) -> Result<()> {
    if dir == "/" || upper.exists(dir, cred) {
        return Ok(());
    }
    ensure_upper_dirs(lower, upper, &pathutil::dirname(dir), cred)?;
    let mode = lower.stat(dir, cred).map(|s| s.perm()).unwrap_or(0o777);
    match upper.mkdir(dir, mode, cred) {
        Ok(()) => Ok(()),
        Err(e) if e.errno() == Errno::EEXIST => Ok(()),
        Err(e) => Err(e),
    }
}

fn copy_to_writable<L: FileSystem, U: FileSystem>(lower: &L, upper: &U, path: &str, cred: &Credentials) -> Result<()> {
    if upper.exists(path, cred) {
        return Ok(());
    }
    let lower_stats = lower.stat(path, cred)?;
    ensure_upper_dirs(lower, upper, &pathutil::dirname(path), cred)?;
    match lower_stats.file_type()? {
        FileType::Directory => upper.mkdir(path, lower_stats.perm(), cred),
        _ => {
            let data = lower.read_file(path, cred)?;
            upper.write_file(path, &data, lower_stats.perm(), cred)
        }
    }
}

/// Backs the "overlay file" described in §4.J: a [`PreloadFile`] opened
/// against `lower` whose close/sync copies it up to `upper` first.
#[derive(Debug)]
struct OverlayPersist<L: FileSystem, U: FileSystem> {
    lower: Arc<L>,
    upper: Arc<U>,
}

impl<L: FileSystem, U: FileSystem> FilePersist for OverlayPersist<L, U> {
    fn persist(&self, path: &str, buffer: &[u8], stats: &Stats) -> Result<()> {
        let cred = Credentials::root();
        ensure_upper_dirs(&*self.lower, &*self.upper, &pathutil::dirname(path), &cred)?;
        self.upper.write_file(path, buffer, stats.perm(), &cred)
    }
}

/// A union of a read-only `lower` and a writable `upper`, per §4.J.
#[derive(Debug)]
pub struct OverlayFileSystem<L: FileSystem, U: FileSystem> {
    lower: Arc<L>,
    upper: Arc<U>,
    deleted_files: Mutex<std::collections::HashMap<String, bool>>,
}

impl<L: FileSystem, U: FileSystem> OverlayFileSystem<L, U> {
    /// Wrap `lower` under `upper`, loading the deletion log from `upper`
    /// (an absent log is not an error; any other failure is).
    pub fn new(lower: L, upper: U) -> Result<Self> {
        Self::from_arc(Arc::new(lower), Arc::new(upper))
    }

    /// As [`Self::new`], but taking already-shared backends — used when a
    /// second overlay needs to be rebuilt over the same `lower`/`upper`
    /// pair (e.g. to reload the deletion log after a simulated restart).
    pub fn from_arc(lower: Arc<L>, upper: Arc<U>) -> Result<Self> {
        if upper.metadata().readonly {
            return Err(Error::invalid("overlay's upper backend must be writable"));
        }
        let fs = OverlayFileSystem {
            lower,
            upper,
            deleted_files: Mutex::new(std::collections::HashMap::new()),
        };
        fs.load_deletion_log()?;
        Ok(fs)
    }

    fn load_deletion_log(&self) -> Result<()> {
        let cred = Credentials::root();
        match self.upper.read_file(DELETION_LOG_PATH, &cred) {
            Ok(bytes) => {
                let text = String::from_utf8_lossy(&bytes);
                let mut map = self.deleted_files.lock();
                for line in text.lines() {
                    if line.is_empty() {
                        continue;
                    }
                    let deleted = line.as_bytes()[0] == b'd';
                    map.insert(line[1..].to_string(), deleted);
                }
                Ok(())
            }
            Err(e) if e.errno() == Errno::ENOENT => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn append_deletion_log(&self, path: &str, deleted: bool) -> Result<()> {
        let cred = Credentials::root();
        let marker = if deleted { 'd' } else { 'u' };
        let line = format!("{marker}{path}\n");
        self.upper.append_file(DELETION_LOG_PATH, line.as_bytes(), 0o644, &cred)?;
        self.deleted_files.lock().insert(path.to_string(), deleted);
        Ok(())
    }

    fn is_deleted(&self, path: &str) -> bool {
        self.deleted_files.lock().get(path).copied().unwrap_or(false)
    }

    fn overlay_persist(&self) -> Box<dyn FilePersist> {
        Box::new(OverlayPersist { lower: self.lower.clone(), upper: self.upper.clone() })
    }

    fn remove(&self, path: &str, is_dir: bool, cred: &Credentials) -> Result<()> {
        let stats = self.stat(path, cred)?;
        let actual_dir = matches!(stats.file_type()?, FileType::Directory);
        if is_dir && !actual_dir {
            return Err(Error::with_path(Errno::ENOTDIR, "not a directory", path));
        }
        if !is_dir && actual_dir {
            return Err(Error::with_path(Errno::EISDIR, "is a directory", path));
        }
        if self.upper.exists(path, cred) {
            if actual_dir {
                self.upper.rmdir(path, cred)?;
            } else {
                self.upper.unlink(path, cred)?;
            }
        }
        if self.lower.exists(path, cred) {
            self.append_deletion_log(path, true)?;
        }
        Ok(())
    }

    /// Final cleanup step of a recursive rename: whatever is left of
    /// `path` (an emptied-out directory, or nothing at all) is marked
    /// removed without re-checking emptiness — the recursion has already
    /// relocated every child.
    fn mark_removed_after_move(&self, path: &str, cred: &Credentials) -> Result<()> {
        if self.upper.exists(path, cred) {
            let _ = self.upper.unlink(path, cred).or_else(|_| self.upper.rmdir(path, cred));
        }
        if self.lower.exists(path, cred) {
            self.append_deletion_log(path, true)?;
        }
        Ok(())
    }
}

impl<L: FileSystem, U: FileSystem> FileSystem for OverlayFileSystem<L, U> {
    fn metadata(&self) -> Metadata {
        let lm = self.lower.metadata();
        let um = self.upper.metadata();
        Metadata {
            name: "OverlayFileSystem".to_string(),
            readonly: false,
            synchronous: lm.synchronous && um.synchronous,
            supports_properties: lm.supports_properties && um.supports_properties,
            supports_links: lm.supports_links && um.supports_links,
            total_space: um.total_space,
            free_space: um.free_space,
        }
    }

    fn open_file(&self, path: &str, flag: FileFlag, cred: &Credentials) -> Result<PreloadFile> {
        if self.upper.exists(path, cred) {
            return self.upper.open_file(path, flag, cred);
        }
        if self.lower.exists(path, cred) && !self.is_deleted(path) {
            let data = self.lower.read_file(path, cred)?;
            let mut stats = self.lower.stat(path, cred)?;
            PreloadFile::check_open_permission(&stats, &flag, cred)?;
            stats.mode |= 0o222;
            return Ok(PreloadFile::new(path, flag, stats, data, self.overlay_persist()));
        }
        Err(Error::with_path(Errno::ENOENT, "no such file or directory", path))
    }

    fn create_file(&self, path: &str, flag: FileFlag, mode: u16, cred: &Credentials) -> Result<PreloadFile> {
        ensure_upper_dirs(&*self.lower, &*self.upper, &pathutil::dirname(path), cred)?;
        self.upper.create_file(path, flag, mode, cred)
    }

    fn open(&self, path: &str, flag: FileFlag, mode: u16, cred: &Credentials) -> Result<PreloadFile> {
        if path == DELETION_LOG_PATH {
            return Err(Error::perm("the deletion log is not a regular file"));
        }
        if self.exists(path, cred) {
            match flag.path_exists_action() {
                PathExistsAction::TruncateFile => {
                    ensure_upper_dirs(&*self.lower, &*self.upper, &pathutil::dirname(path), cred)?;
                    self.upper.open(path, flag, mode, cred)
                }
                PathExistsAction::Nop => {
                    if self.upper.exists(path, cred) {
                        self.upper.open(path, flag, mode, cred)
                    } else {
                        let data = self.lower.read_file(path, cred)?;
                        let mut stats = self.lower.stat(path, cred)?;
                        PreloadFile::check_open_permission(&stats, &flag, cred)?;
                        stats.chmod(mode);
                        Ok(PreloadFile::new(path, flag, stats, data, self.overlay_persist()))
                    }
                }
                PathExistsAction::ThrowException => Err(Error::with_path(Errno::EEXIST, "file already exists", path)),
            }
        } else {
            match flag.path_not_exists_action() {
                PathNotExistsAction::CreateFile => {
                    ensure_upper_dirs(&*self.lower, &*self.upper, &pathutil::dirname(path), cred)?;
                    self.upper.open(path, flag, mode, cred)
                }
                PathNotExistsAction::ThrowException => {
                    Err(Error::with_path(Errno::ENOENT, "no such file or directory", path))
                }
            }
        }
    }

    fn stat(&self, path: &str, cred: &Credentials) -> Result<Stats> {
        match self.upper.stat(path, cred) {
            Ok(stats) => return Ok(stats),
            Err(e) if e.errno() == Errno::ENOENT => {}
            Err(e) => return Err(e),
        }
        if self.is_deleted(path) {
            return Err(Error::with_path(Errno::ENOENT, "no such file or directory", path));
        }
        let mut stats = self.lower.stat(path, cred)?;
        stats.mode |= 0o222;
        Ok(stats)
    }

    fn exists(&self, path: &str, cred: &Credentials) -> bool {
        self.upper.exists(path, cred) || (self.lower.exists(path, cred) && !self.is_deleted(path))
    }

    fn unlink(&self, path: &str, cred: &Credentials) -> Result<()> {
        self.remove(path, false, cred)
    }

    fn mkdir(&self, path: &str, mode: u16, cred: &Credentials) -> Result<()> {
        if self.exists(path, cred) {
            return Err(Error::with_path(Errno::EEXIST, "file already exists", path));
        }
        ensure_upper_dirs(&*self.lower, &*self.upper, &pathutil::dirname(path), cred)?;
        self.upper.mkdir(path, mode, cred)
    }

    fn rmdir(&self, path: &str, cred: &Credentials) -> Result<()> {
        if !self.readdir(path, cred)?.is_empty() {
            return Err(Error::with_path(Errno::ENOTEMPTY, "directory not empty", path));
        }
        self.remove(path, true, cred)
    }

    fn rename(&self, old: &str, new: &str, cred: &Credentials) -> Result<()> {
        let stats = self.stat(old, cred)?;
        if matches!(stats.file_type()?, FileType::Directory) {
            if self.exists(new, cred) {
                let dest = self.stat(new, cred)?;
                if !matches!(dest.file_type()?, FileType::Directory) {
                    return Err(Error::with_path(Errno::ENOTDIR, "destination is not a directory", new));
                }
                if !self.readdir(new, cred)?.is_empty() {
                    return Err(Error::with_path(Errno::ENOTEMPTY, "destination directory not empty", new));
                }
            } else {
                self.mkdir(new, 0o777, cred)?;
            }
            if self.upper.exists(old, cred) && !self.upper.exists(new, cred) {
                self.upper.rename(old, new, cred)?;
            } else if !self.upper.exists(new, cred) {
                ensure_upper_dirs(&*self.lower, &*self.upper, &pathutil::dirname(new), cred)?;
                let _ = self.upper.mkdir(new, stats.perm(), cred);
            }
            for child in self.readdir(old, cred)? {
                let child_old = pathutil::join(old, &child);
                let child_new = pathutil::join(new, &child);
                self.rename(&child_old, &child_new, cred)?;
            }
        } else {
            if self.exists(new, cred) {
                let dest = self.stat(new, cred)?;
                if matches!(dest.file_type()?, FileType::Directory) {
                    return Err(Error::with_path(Errno::EISDIR, "destination is a directory", new));
                }
            }
            let data = self.read_file(old, cred)?;
            self.write_file(new, &data, stats.perm(), cred)?;
            self.unlink(old, cred)?;
        }
        if self.exists(old, cred) {
            self.mark_removed_after_move(old, cred)?;
        }
        Ok(())
    }

    fn readdir(&self, path: &str, cred: &Credentials) -> Result<Vec<String>> {
        if !self.exists(path, cred) {
            return Err(Error::with_path(Errno::ENOENT, "no such file or directory", path));
        }
        let mut seen = HashSet::new();
        let mut names = Vec::new();
        if self.upper.exists(path, cred) {
            for name in self.upper.readdir(path, cred)? {
                if seen.insert(name.clone()) {
                    names.push(name);
                }
            }
        }
        if self.lower.exists(path, cred) && !self.is_deleted(path) {
            for name in self.lower.readdir(path, cred)? {
                let full = pathutil::join(path, &name);
                if self.is_deleted(&full) {
                    continue;
                }
                if seen.insert(name.clone()) {
                    names.push(name);
                }
            }
        }
        Ok(names)
    }

    fn chmod(&self, path: &str, perm: u16, cred: &Credentials) -> Result<()> {
        copy_to_writable(&*self.lower, &*self.upper, path, cred)?;
        self.upper.chmod(path, perm, cred)
    }

    fn chown(&self, path: &str, uid: Option<f64>, gid: Option<f64>, cred: &Credentials) -> Result<()> {
        copy_to_writable(&*self.lower, &*self.upper, path, cred)?;
        self.upper.chown(path, uid, gid, cred)
    }

    fn utimes(&self, path: &str, atime_ms: f64, mtime_ms: f64, cred: &Credentials) -> Result<()> {
        copy_to_writable(&*self.lower, &*self.upper, path, cred)?;
        self.upper.utimes(path, atime_ms, mtime_ms, cred)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::engine::KeyValueFileSystem;
    use crate::kv::memory::InMemoryStore;

    type Overlay = OverlayFileSystem<KeyValueFileSystem<InMemoryStore>, KeyValueFileSystem<InMemoryStore>>;

    fn overlay() -> Overlay {
        let lower = KeyValueFileSystem::new(InMemoryStore::new()).unwrap();
        let upper = KeyValueFileSystem::new(InMemoryStore::new()).unwrap();
        OverlayFileSystem::new(lower, upper).unwrap()
    }

    #[test]
    fn readdir_unions_both_layers() {
        let fs = overlay();
        let cred = Credentials::root();
        fs.lower.write_file("/a.txt", b"a", 0o644, &cred).unwrap();
        fs.upper.write_file("/b.txt", b"b", 0o644, &cred).unwrap();
        let mut names = fs.readdir("/", &cred).unwrap();
        names.sort();
        assert_eq!(names, vec!["a.txt".to_string(), "b.txt".to_string()]);
    }

    #[test]
    fn unlink_of_lower_only_file_marks_deleted_and_hides_it() {
        let fs = overlay();
        let cred = Credentials::root();
        fs.lower.write_file("/a.txt", b"a", 0o644, &cred).unwrap();
        assert!(fs.exists("/a.txt", &cred));
        fs.unlink("/a.txt", &cred).unwrap();
        assert!(!fs.exists("/a.txt", &cred));
        assert!(fs.readdir("/", &cred).unwrap().is_empty());
    }

    #[test]
    fn chmod_copies_lower_only_file_up() {
        let fs = overlay();
        let cred = Credentials::root();
        fs.lower.write_file("/r.txt", b"x", 0o444, &cred).unwrap();
        fs.chmod("/r.txt", 0o644, &cred).unwrap();
        assert!(fs.upper.exists("/r.txt", &cred));
        assert_eq!(fs.stat("/r.txt", &cred).unwrap().perm(), 0o644);
    }

    #[test]
    fn stat_promotes_lower_only_entries_to_writable() {
        let fs = overlay();
        let cred = Credentials::root();
        fs.lower.write_file("/r.txt", b"x", 0o444, &cred).unwrap();
        let stats = fs.stat("/r.txt", &cred).unwrap();
        assert_eq!(stats.perm() & 0o222, 0o222);
    }

    #[test]
    fn deletion_log_persists_across_a_fresh_overlay_instance() {
        let lower = Arc::new(KeyValueFileSystem::new(InMemoryStore::new()).unwrap());
        let upper = Arc::new(KeyValueFileSystem::new(InMemoryStore::new()).unwrap());
        let cred = Credentials::root();
        lower.write_file("/a.txt", b"a", 0o644, &cred).unwrap();
        lower.write_file("/b.txt", b"b", 0o644, &cred).unwrap();

        let fs1 = OverlayFileSystem::from_arc(lower.clone(), upper.clone()).unwrap();
        fs1.unlink("/a.txt", &cred).unwrap();
        assert_eq!(fs1.readdir("/", &cred).unwrap(), vec!["b.txt".to_string()]);
        drop(fs1);

        // "restart": rebuild the overlay over the same backing stores and
        // confirm the deletion survives via the on-disk log.
        let fs2 = OverlayFileSystem::from_arc(lower, upper).unwrap();
        assert!(!fs2.exists("/a.txt", &cred));
        assert_eq!(fs2.readdir("/", &cred).unwrap(), vec!["b.txt".to_string()]);
    }
}
