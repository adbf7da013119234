//! File metadata ([`Stats`]) and the on-disk inode record ([`Inode`]).
//!
//! Both types have a fixed little-endian wire format (§3, §6). The fields
//! mix `u16`/`u32`/`f64` at non-uniform offsets, so the encode/decode here is
//! done by hand with `to_le_bytes`/`from_le_bytes` over a cursor, the same
//! way the teacher crate's `ll/argument.rs` walks raw FUSE argument bytes
//! rather than reading them through a single cast.

use crate::error::{Errno, Error, Result};

#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// Type bits packed into the top 4 bits of `mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum FileType {
    /// A regular file.
    File,
    /// A directory.
    Directory,
    /// A symbolic link (only ever produced by the overlay engine; the
    /// key-value engines never create one, per spec Non-goals).
    Symlink,
}

impl FileType {
    const FILE_BITS: u16 = 0o10 << 12;
    const DIR_BITS: u16 = 0o04 << 12;
    const SYMLINK_BITS: u16 = 0o12 << 12;
    const TYPE_MASK: u16 = 0o17 << 12;

    /// Extract the type from the top 4 bits of a mode word.
    pub fn from_mode(mode: u16) -> Result<Self> {
        match mode & Self::TYPE_MASK {
            Self::FILE_BITS => Ok(FileType::File),
            Self::DIR_BITS => Ok(FileType::Directory),
            Self::SYMLINK_BITS => Ok(FileType::Symlink),
            other => Err(Error::invalid(format!("unrecognized mode type bits {other:#o}"))),
        }
    }

    /// The type bits for this `FileType`, to be OR'd with permission bits.
    pub fn mode_bits(self) -> u16 {
        match self {
            FileType::File => Self::FILE_BITS,
            FileType::Directory => Self::DIR_BITS,
            FileType::Symlink => Self::SYMLINK_BITS,
        }
    }
}

/// The length in bytes of a serialized [`Stats`].
pub const STATS_SERIALIZED_LEN: usize = 40;

/// File metadata record returned by `stat`/`fstat`/`lstat`.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct Stats {
    /// Size in bytes.
    pub size: u32,
    /// Mode: top 4 bits are the type, lower 12 are permission bits.
    pub mode: u16,
    /// Last access time, in milliseconds since the Unix epoch.
    pub atime_ms: f64,
    /// Last modification time, in milliseconds since the Unix epoch.
    pub mtime_ms: f64,
    /// Last metadata change time, in milliseconds since the Unix epoch.
    pub ctime_ms: f64,
    /// Creation time, in milliseconds since the Unix epoch.
    pub birthtime_ms: f64,
    /// Owning user id.
    pub uid: u32,
    /// Owning group id.
    pub gid: u32,
}

impl Stats {
    /// Build a fresh `Stats` for a just-created entity of the given type,
    /// owned by `uid`/`gid`, all four timestamps set to `now_ms`.
    pub fn new(file_type: FileType, perm: u16, uid: u32, gid: u32, now_ms: f64, size: u32) -> Self {
        Stats {
            size,
            mode: file_type.mode_bits() | (perm & 0o7777),
            atime_ms: now_ms,
            mtime_ms: now_ms,
            ctime_ms: now_ms,
            birthtime_ms: now_ms,
            uid,
            gid,
        }
    }

    /// Number of hard links. Always 1: the key-value engines don't support
    /// `link` across more than one directory entry pointing at distinct
    /// inode records (only the overlay upper's own backend might, but this
    /// crate reports the POSIX-conventional minimum).
    pub fn nlink(&self) -> u32 {
        1
    }

    /// Preferred I/O block size.
    pub fn blksize(&self) -> u32 {
        4096
    }

    /// Number of 512-byte blocks, rounded up.
    pub fn blocks(&self) -> u64 {
        (u64::from(self.size) + 511) / 512
    }

    /// Device, inode and rdev numbers are always reported as 0: this is a
    /// virtual filesystem with no backing device.
    pub fn dev(&self) -> u64 {
        0
    }

    /// The type bits of `mode`.
    pub fn file_type(&self) -> Result<FileType> {
        FileType::from_mode(self.mode)
    }

    /// Permission bits of `mode` (lower 12 bits).
    pub fn perm(&self) -> u16 {
        self.mode & 0o7777
    }

    /// `chmod`: replace the permission bits, preserving the type bits.
    pub fn chmod(&mut self, perm: u16) {
        let file_type_bits = self.mode & FileType::TYPE_MASK;
        self.mode = file_type_bits | (perm & 0o7777);
        self.ctime_ms = self.mtime_ms;
    }

    /// `chown`: set uid/gid, ignoring non-finite or out-of-`u32`-range
    /// values (the invariant noted in §3).
    pub fn chown(&mut self, uid: Option<f64>, gid: Option<f64>) {
        if let Some(uid) = uid {
            if uid.is_finite() && uid >= 0.0 && uid <= f64::from(u32::MAX) {
                self.uid = uid as u32;
            }
        }
        if let Some(gid) = gid {
            if gid.is_finite() && gid >= 0.0 && gid <= f64::from(u32::MAX) {
                self.gid = gid as u32;
            }
        }
    }

    /// Check whether `cred` is allowed `want` access (a POSIX `rwx`-style
    /// mask in the low 3 bits) against this entity's owner/group/other
    /// permission bits.
    pub fn check_access(&self, cred: &crate::cred::Credentials, want: u8) -> bool {
        if cred.is_root() {
            return true;
        }
        let perm = self.perm();
        let bits = if cred.euid == self.uid {
            (perm >> 6) & 0o7
        } else if cred.egid == self.gid {
            (perm >> 3) & 0o7
        } else {
            perm & 0o7
        };
        (bits as u8) & want == want
    }

    /// Serialize to the fixed little-endian layout described in §3/§6.
    pub fn serialize(&self) -> [u8; STATS_SERIALIZED_LEN] {
        let mut buf = [0u8; STATS_SERIALIZED_LEN];
        buf[0..4].copy_from_slice(&self.size.to_le_bytes());
        buf[4..6].copy_from_slice(&self.mode.to_le_bytes());
        // Two bytes of padding (6..8) keep the f64 fields 8-byte aligned in
        // the conceptual layout; they carry no meaning and are always zero.
        buf[8..16].copy_from_slice(&self.atime_ms.to_le_bytes());
        buf[16..24].copy_from_slice(&self.mtime_ms.to_le_bytes());
        buf[24..32].copy_from_slice(&self.ctime_ms.to_le_bytes());
        buf[32..36].copy_from_slice(&self.uid.to_le_bytes());
        buf[36..40].copy_from_slice(&self.gid.to_le_bytes());
        buf
    }

    /// Deserialize from the fixed layout produced by [`Stats::serialize`].
    /// `birthtime_ms` is not part of the wire format and is set equal to
    /// `ctime_ms` on decode.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < STATS_SERIALIZED_LEN {
            return Err(Error::io("truncated Stats record"));
        }
        let size = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let mode = u16::from_le_bytes(bytes[4..6].try_into().unwrap());
        let atime_ms = f64::from_le_bytes(bytes[8..16].try_into().unwrap());
        let mtime_ms = f64::from_le_bytes(bytes[16..24].try_into().unwrap());
        let ctime_ms = f64::from_le_bytes(bytes[24..32].try_into().unwrap());
        let uid = u32::from_le_bytes(bytes[32..36].try_into().unwrap());
        let gid = u32::from_le_bytes(bytes[36..40].try_into().unwrap());
        Ok(Stats {
            size,
            mode,
            atime_ms,
            mtime_ms,
            ctime_ms,
            birthtime_ms: ctime_ms,
            uid,
            gid,
        })
    }
}

/// The root inode's fixed id.
pub const ROOT_ID: &str = "/";

/// The on-disk inode record: metadata plus the id of its data blob.
///
/// `id` doubles as the key under which the entity's data (file contents, or
/// the JSON-encoded directory listing) is stored.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct Inode {
    /// The id of this inode's data blob.
    pub id: String,
    /// Size of the data blob, in bytes.
    pub size: u32,
    /// Mode: type bits plus permission bits.
    pub mode: u16,
    /// Last access time, ms since epoch.
    pub atime_ms: f64,
    /// Last modification time, ms since epoch.
    pub mtime_ms: f64,
    /// Last metadata-change time, ms since epoch.
    pub ctime_ms: f64,
    /// Owning user id.
    pub uid: u32,
    /// Owning group id.
    pub gid: u32,
}

impl Inode {
    /// Build a new inode for freshly-allocated data blob `id`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        size: u32,
        file_type: FileType,
        perm: u16,
        now_ms: f64,
        uid: u32,
        gid: u32,
    ) -> Self {
        Inode {
            id: id.into(),
            size,
            mode: file_type.mode_bits() | (perm & 0o7777),
            atime_ms: now_ms,
            mtime_ms: now_ms,
            ctime_ms: now_ms,
            uid,
            gid,
        }
    }

    /// Extract a [`Stats`] view of this inode.
    pub fn to_stats(&self) -> Stats {
        Stats {
            size: self.size,
            mode: self.mode,
            atime_ms: self.atime_ms,
            mtime_ms: self.mtime_ms,
            ctime_ms: self.ctime_ms,
            birthtime_ms: self.ctime_ms,
            uid: self.uid,
            gid: self.gid,
        }
    }

    /// Sync size, mode and the three timestamps from `stats`. Returns
    /// whether anything actually changed, so callers (§4.G `_sync`) can
    /// skip a metadata write when nothing did.
    pub fn update(&mut self, stats: &Stats) -> bool {
        let mut changed = false;
        if self.size != stats.size {
            self.size = stats.size;
            changed = true;
        }
        if self.mode != stats.mode {
            self.mode = stats.mode;
            changed = true;
        }
        if self.atime_ms != stats.atime_ms {
            self.atime_ms = stats.atime_ms;
            changed = true;
        }
        if self.mtime_ms != stats.mtime_ms {
            self.mtime_ms = stats.mtime_ms;
            changed = true;
        }
        if self.ctime_ms != stats.ctime_ms {
            self.ctime_ms = stats.ctime_ms;
            changed = true;
        }
        if self.uid != stats.uid {
            self.uid = stats.uid;
            changed = true;
        }
        if self.gid != stats.gid {
            self.gid = stats.gid;
            changed = true;
        }
        changed
    }

    /// Whether this inode describes a regular file.
    pub fn is_file(&self) -> bool {
        matches!(FileType::from_mode(self.mode), Ok(FileType::File))
    }

    /// Whether this inode describes a directory.
    pub fn is_directory(&self) -> bool {
        matches!(FileType::from_mode(self.mode), Ok(FileType::Directory))
    }

    /// Serialize: 38 fixed bytes, then the utf-8 `id`.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(38 + self.id.len());
        buf.extend_from_slice(&self.size.to_le_bytes());
        buf.extend_from_slice(&self.mode.to_le_bytes());
        buf.extend_from_slice(&self.atime_ms.to_le_bytes());
        buf.extend_from_slice(&self.mtime_ms.to_le_bytes());
        buf.extend_from_slice(&self.ctime_ms.to_le_bytes());
        buf.extend_from_slice(&self.uid.to_le_bytes());
        buf.extend_from_slice(&self.gid.to_le_bytes());
        buf.extend_from_slice(self.id.as_bytes());
        buf
    }

    /// Deserialize from the layout produced by [`Inode::serialize`].
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 38 {
            return Err(Error::io("truncated Inode record"));
        }
        let size = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let mode = u16::from_le_bytes(bytes[4..6].try_into().unwrap());
        let atime_ms = f64::from_le_bytes(bytes[6..14].try_into().unwrap());
        let mtime_ms = f64::from_le_bytes(bytes[14..22].try_into().unwrap());
        let ctime_ms = f64::from_le_bytes(bytes[22..30].try_into().unwrap());
        let uid = u32::from_le_bytes(bytes[30..34].try_into().unwrap());
        let gid = u32::from_le_bytes(bytes[34..38].try_into().unwrap());
        let id = std::str::from_utf8(&bytes[38..])
            .map_err(|_| Error::io("inode id is not valid utf-8"))?
            .to_string();
        Ok(Inode {
            id,
            size,
            mode,
            atime_ms,
            mtime_ms,
            ctime_ms,
            uid,
            gid,
        })
    }
}
