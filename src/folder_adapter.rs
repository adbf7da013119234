//! `FolderAdapter` (§4.L): scopes a wrapped [`FileSystem`] under a fixed
//! folder, so callers see a filesystem rooted at `/` while every operation
//! actually lands under `folder` on the inner backend.
//!
//! Every path argument gets `folder` joined onto the front before reaching
//! `inner`; every error coming back has its path (and any mention of that
//! path in the message) rewritten from the inner, folder-prefixed path back
//! to the caller's unscoped view, via [`Error::rewrite_path`]. Higher-level
//! default methods (`open`, `read_file`, `realpath`, ...) need no override
//! here: they're built atop the primitives this module does override, and
//! call back into `self`, so the scoping applies transitively.

use crate::cred::Credentials;
use crate::error::{Errno, Error, Result};
use crate::file::PreloadFile;
use crate::flags::FileFlag;
use crate::fs::{FileSystem, Metadata};
use crate::pathutil;
use crate::stats::Stats;

/// Wraps `inner`, rooting every path under `folder`.
#[derive(Debug)]
pub struct FolderAdapter<F: FileSystem> {
    inner: F,
    folder: String,
}

impl<F: FileSystem> FolderAdapter<F> {
    /// Wrap `inner`, scoped under `folder`. If `inner` is read-only, `folder`
    /// must already exist; otherwise it's created (`mkdir` `0o777`,
    /// tolerating `EEXIST`).
    pub fn new(inner: F, folder: &str) -> Result<Self> {
        let folder = pathutil::normalize(folder);
        let cred = Credentials::root();
        if inner.metadata().readonly {
            if !inner.exists(&folder, &cred) {
                return Err(Error::not_found(format!(
                    "folder adapter root {folder} does not exist on a read-only backend"
                )));
            }
        } else {
            match inner.mkdir(&folder, 0o777, &cred) {
                Ok(()) => {}
                Err(e) if e.errno() == Errno::EEXIST => {}
                Err(e) => return Err(e),
            }
        }
        Ok(FolderAdapter { inner, folder })
    }

    fn scope(&self, path: &str) -> String {
        pathutil::join(&self.folder, path)
    }

    fn rewrite(&self, mut e: Error, scoped: &str, original: &str) -> Error {
        e.rewrite_path(scoped, original);
        e
    }
}

impl<F: FileSystem> FileSystem for FolderAdapter<F> {
    fn metadata(&self) -> Metadata {
        let mut m = self.inner.metadata();
        m.name = format!("FolderAdapter({})", m.name);
        m
    }

    fn open_file(&self, path: &str, flag: FileFlag, cred: &Credentials) -> Result<PreloadFile> {
        let scoped = self.scope(path);
        self.inner.open_file(&scoped, flag, cred).map_err(|e| self.rewrite(e, &scoped, path))
    }

    fn create_file(&self, path: &str, flag: FileFlag, mode: u16, cred: &Credentials) -> Result<PreloadFile> {
        let scoped = self.scope(path);
        self.inner.create_file(&scoped, flag, mode, cred).map_err(|e| self.rewrite(e, &scoped, path))
    }

    fn stat(&self, path: &str, cred: &Credentials) -> Result<Stats> {
        let scoped = self.scope(path);
        self.inner.stat(&scoped, cred).map_err(|e| self.rewrite(e, &scoped, path))
    }

    fn unlink(&self, path: &str, cred: &Credentials) -> Result<()> {
        let scoped = self.scope(path);
        self.inner.unlink(&scoped, cred).map_err(|e| self.rewrite(e, &scoped, path))
    }

    fn mkdir(&self, path: &str, mode: u16, cred: &Credentials) -> Result<()> {
        let scoped = self.scope(path);
        self.inner.mkdir(&scoped, mode, cred).map_err(|e| self.rewrite(e, &scoped, path))
    }

    fn rmdir(&self, path: &str, cred: &Credentials) -> Result<()> {
        let scoped = self.scope(path);
        self.inner.rmdir(&scoped, cred).map_err(|e| self.rewrite(e, &scoped, path))
    }

    fn rename(&self, old: &str, new: &str, cred: &Credentials) -> Result<()> {
        let s_old = self.scope(old);
        let s_new = self.scope(new);
        self.inner.rename(&s_old, &s_new, cred).map_err(|mut e| {
            e.rewrite_path(&s_old, old);
            e.rewrite_path(&s_new, new);
            e
        })
    }

    fn readdir(&self, path: &str, cred: &Credentials) -> Result<Vec<String>> {
        let scoped = self.scope(path);
        self.inner.readdir(&scoped, cred).map_err(|e| self.rewrite(e, &scoped, path))
    }

    fn chmod(&self, path: &str, perm: u16, cred: &Credentials) -> Result<()> {
        let scoped = self.scope(path);
        self.inner.chmod(&scoped, perm, cred).map_err(|e| self.rewrite(e, &scoped, path))
    }

    fn chown(&self, path: &str, uid: Option<f64>, gid: Option<f64>, cred: &Credentials) -> Result<()> {
        let scoped = self.scope(path);
        self.inner.chown(&scoped, uid, gid, cred).map_err(|e| self.rewrite(e, &scoped, path))
    }

    fn utimes(&self, path: &str, atime_ms: f64, mtime_ms: f64, cred: &Credentials) -> Result<()> {
        let scoped = self.scope(path);
        self.inner.utimes(&scoped, atime_ms, mtime_ms, cred).map_err(|e| self.rewrite(e, &scoped, path))
    }

    fn link(&self, target: &str, new_path: &str, cred: &Credentials) -> Result<()> {
        let s_target = self.scope(target);
        let s_new = self.scope(new_path);
        self.inner.link(&s_target, &s_new, cred).map_err(|mut e| {
            e.rewrite_path(&s_target, target);
            e.rewrite_path(&s_new, new_path);
            e
        })
    }

    fn symlink(&self, target: &str, new_path: &str, cred: &Credentials) -> Result<()> {
        let s_target = self.scope(target);
        let s_new = self.scope(new_path);
        self.inner.symlink(&s_target, &s_new, cred).map_err(|mut e| {
            e.rewrite_path(&s_target, target);
            e.rewrite_path(&s_new, new_path);
            e
        })
    }

    fn readlink(&self, path: &str, cred: &Credentials) -> Result<String> {
        let scoped = self.scope(path);
        let target = self.inner.readlink(&scoped, cred).map_err(|e| self.rewrite(e, &scoped, path))?;
        Ok(match target.strip_prefix(&self.folder) {
            Some(stripped) if stripped.is_empty() || stripped.starts_with('/') => {
                if stripped.is_empty() { "/".to_string() } else { stripped.to_string() }
            }
            _ => target,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::engine::KeyValueFileSystem;
    use crate::kv::memory::InMemoryStore;

    fn adapter(folder: &str) -> FolderAdapter<KeyValueFileSystem<InMemoryStore>> {
        let inner = KeyValueFileSystem::new(InMemoryStore::new()).unwrap();
        FolderAdapter::new(inner, folder).unwrap()
    }

    #[test]
    fn new_creates_the_folder_on_a_writable_backend() {
        let fs = adapter("/scoped");
        assert!(fs.inner.exists("/scoped", &Credentials::root()));
    }

    #[test]
    fn operations_land_under_the_folder_on_the_inner_backend() {
        let fs = adapter("/scoped");
        let cred = Credentials::root();
        fs.mkdir("/x", 0o755, &cred).unwrap();
        assert!(fs.inner.exists("/scoped/x", &cred));
        assert!(!fs.inner.exists("/x", &cred));
        assert_eq!(fs.readdir("/", &cred).unwrap(), vec!["x".to_string()]);
    }

    #[test]
    fn write_then_read_round_trips_through_the_default_methods() {
        let fs = adapter("/scoped");
        let cred = Credentials::root();
        fs.write_file("/a.txt", b"hello", 0o644, &cred).unwrap();
        assert_eq!(fs.read_file("/a.txt", &cred).unwrap(), b"hello");
        assert!(fs.inner.exists("/scoped/a.txt", &cred));
    }

    #[test]
    fn errors_are_rewritten_back_to_the_unscoped_path() {
        let fs = adapter("/scoped");
        let cred = Credentials::root();
        let err = fs.stat("/missing", &cred).unwrap_err();
        assert_eq!(err.path(), Some("/missing"));
        assert!(!err.to_string().contains("/scoped"));
    }

    #[derive(Debug)]
    struct ReadOnlyWrap<F: FileSystem>(F);

    impl<F: FileSystem> FileSystem for ReadOnlyWrap<F> {
        fn metadata(&self) -> Metadata {
            let mut m = self.0.metadata();
            m.readonly = true;
            m
        }
        fn open_file(&self, path: &str, flag: FileFlag, cred: &Credentials) -> Result<PreloadFile> {
            self.0.open_file(path, flag, cred)
        }
        fn create_file(&self, path: &str, flag: FileFlag, mode: u16, cred: &Credentials) -> Result<PreloadFile> {
            self.0.create_file(path, flag, mode, cred)
        }
        fn stat(&self, path: &str, cred: &Credentials) -> Result<Stats> {
            self.0.stat(path, cred)
        }
        fn unlink(&self, path: &str, cred: &Credentials) -> Result<()> {
            self.0.unlink(path, cred)
        }
        fn mkdir(&self, path: &str, mode: u16, cred: &Credentials) -> Result<()> {
            self.0.mkdir(path, mode, cred)
        }
        fn rmdir(&self, path: &str, cred: &Credentials) -> Result<()> {
            self.0.rmdir(path, cred)
        }
        fn rename(&self, old: &str, new: &str, cred: &Credentials) -> Result<()> {
            self.0.rename(old, new, cred)
        }
        fn readdir(&self, path: &str, cred: &Credentials) -> Result<Vec<String>> {
            self.0.readdir(path, cred)
        }
        fn chmod(&self, path: &str, perm: u16, cred: &Credentials) -> Result<()> {
            self.0.chmod(path, perm, cred)
        }
        fn chown(&self, path: &str, uid: Option<f64>, gid: Option<f64>, cred: &Credentials) -> Result<()> {
            self.0.chown(path, uid, gid, cred)
        }
        fn utimes(&self, path: &str, atime_ms: f64, mtime_ms: f64, cred: &Credentials) -> Result<()> {
            self.0.utimes(path, atime_ms, mtime_ms, cred)
        }
    }

    #[test]
    fn read_only_backend_requires_the_folder_to_preexist() {
        let inner = KeyValueFileSystem::new(InMemoryStore::new()).unwrap();
        let wrapped = ReadOnlyWrap(inner);
        assert!(FolderAdapter::new(wrapped, "/scoped").is_err());

        let inner2 = KeyValueFileSystem::new(InMemoryStore::new()).unwrap();
        inner2.mkdir("/scoped", 0o755, &Credentials::root()).unwrap();
        let wrapped2 = ReadOnlyWrap(inner2);
        assert!(FolderAdapter::new(wrapped2, "/scoped").is_ok());
    }
}
