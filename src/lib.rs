//! A POSIX-style virtual filesystem kernel over pluggable storage backends.
//!
//! The core contract is [`fs::FileSystem`] (and its async twin,
//! [`fs::AsyncFileSystem`], behind the `async` feature): a handful of
//! primitive operations (`stat`, `open_file`/`create_file`, `unlink`,
//! `mkdir`, `rmdir`, `rename`, `readdir`, `chmod`/`chown`/`utimes`) that
//! every backend implements, with higher-level operations (`open`,
//! `read_file`/`write_file`, `exists`, `realpath`, ...) built once as
//! default trait methods.
//!
//! Backends in this crate:
//! - [`kv::engine::KeyValueFileSystem`] / [`kv::async_engine::AsyncKeyValueFileSystem`]:
//!   a full inode-and-directory filesystem over any [`kv::KeyValueStore`] /
//!   [`kv::async_store::AsyncKeyValueStore`], with [`kv::memory::InMemoryStore`]
//!   / [`kv::async_store::InMemoryAsyncStore`] as the in-memory instances.
//! - [`overlay::OverlayFileSystem`]: a writable backend layered over a
//!   read-only one, copy-up-on-write, with a persisted deletion log.
//! - [`mirror::AsyncMirrorFileSystem`] (`async` feature): a synchronous
//!   backend kept in lockstep with an async one via a background writer.
//! - [`folder_adapter::FolderAdapter`]: scopes any backend under a fixed
//!   folder.
//! - [`locked_fs::LockedFs`] (`async` feature): serializes a synchronous
//!   backend's operations through [`mutex::PathMutex`] for async callers.
//! - [`vfs::Vfs`]: the process-wide mount table, dispatching by longest
//!   matching prefix, plus the open file descriptor table.
//! - [`config::BackendConfig`]: parses a mount map's backend configs
//!   (§6), with Levenshtein-suggested corrections for unknown kinds/options.

#![warn(missing_docs)]

pub mod config;
pub mod cred;
pub mod encoding;
pub mod error;
pub mod file;
pub mod flags;
pub mod folder_adapter;
pub mod fs;
pub mod kv;
pub mod overlay;
pub mod pathutil;
pub mod stats;
pub mod time;
pub mod vfs;

#[cfg(feature = "async")]
pub mod locked_fs;
#[cfg(feature = "async")]
pub mod mirror;
#[cfg(feature = "async")]
pub mod mutex;

pub use cred::Credentials;
pub use error::{Errno, Error, Result};
pub use flags::FileFlag;
pub use fs::{FileSystem, Metadata};
pub use stats::Stats;
pub use vfs::Vfs;

#[cfg(feature = "async")]
pub use fs::AsyncFileSystem;
