//! POSIX errno-keyed error taxonomy.
//!
//! Every fallible operation in this crate returns [`Error`], which carries a
//! libc-style [`Errno`] code plus a human message and (when known) the path
//! the error occurred on. Mount dispatch and the scoping wrappers
//! ([`crate::folder_adapter::FolderAdapter`]) rewrite `path`/`message`
//! substrings as an error crosses a backend boundary (see §4.L/§4.M).

use std::fmt;

#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// A libc-style error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
#[allow(missing_docs)]
pub enum Errno {
    EPERM = 1,
    ENOENT = 2,
    EIO = 5,
    EBADF = 9,
    EACCES = 13,
    EBUSY = 16,
    EEXIST = 17,
    ENOTDIR = 20,
    EISDIR = 21,
    EINVAL = 22,
    EFBIG = 27,
    ENOSPC = 28,
    EROFS = 30,
    ENOTEMPTY = 39,
    ENOTSUP = 95,
}

impl Errno {
    /// The libc numeric code.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// The stringified name, e.g. `"ENOENT"`.
    pub fn name(self) -> &'static str {
        match self {
            Errno::EPERM => "EPERM",
            Errno::ENOENT => "ENOENT",
            Errno::EIO => "EIO",
            Errno::EBADF => "EBADF",
            Errno::EACCES => "EACCES",
            Errno::EBUSY => "EBUSY",
            Errno::EEXIST => "EEXIST",
            Errno::ENOTDIR => "ENOTDIR",
            Errno::EISDIR => "EISDIR",
            Errno::EINVAL => "EINVAL",
            Errno::EFBIG => "EFBIG",
            Errno::ENOSPC => "ENOSPC",
            Errno::EROFS => "EROFS",
            Errno::ENOTEMPTY => "ENOTEMPTY",
            Errno::ENOTSUP => "ENOTSUP",
        }
    }

    /// The inverse of [`Errno::name`]; `None` for an unrecognized name.
    pub fn from_name(name: &str) -> Option<Errno> {
        Some(match name {
            "EPERM" => Errno::EPERM,
            "ENOENT" => Errno::ENOENT,
            "EIO" => Errno::EIO,
            "EBADF" => Errno::EBADF,
            "EACCES" => Errno::EACCES,
            "EBUSY" => Errno::EBUSY,
            "EEXIST" => Errno::EEXIST,
            "ENOTDIR" => Errno::ENOTDIR,
            "EISDIR" => Errno::EISDIR,
            "EINVAL" => Errno::EINVAL,
            "EFBIG" => Errno::EFBIG,
            "ENOSPC" => Errno::ENOSPC,
            "EROFS" => Errno::EROFS,
            "ENOTEMPTY" => Errno::ENOTEMPTY,
            "ENOTSUP" => Errno::ENOTSUP,
            _ => return None,
        })
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A POSIX-flavored error: a code, a message, and (optionally) the path it
/// occurred on.
#[derive(Debug, Clone, thiserror::Error)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct Error {
    errno: Errno,
    message: String,
    path: Option<String>,
}

impl Error {
    /// Build a new error with no path attached.
    pub fn new(errno: Errno, message: impl Into<String>) -> Self {
        Error {
            errno,
            message: message.into(),
            path: None,
        }
    }

    /// Build a new error attached to `path`.
    pub fn with_path(errno: Errno, message: impl Into<String>, path: impl Into<String>) -> Self {
        Error {
            errno,
            message: message.into(),
            path: Some(path.into()),
        }
    }

    /// The errno code.
    pub fn errno(&self) -> Errno {
        self.errno
    }

    /// The numeric errno, for POSIX-shaped callers.
    pub fn raw_errno(&self) -> i32 {
        self.errno.code()
    }

    /// The path the error is attached to, if any.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Attach or replace the path carried by this error.
    pub fn set_path(&mut self, path: impl Into<String>) {
        self.path = Some(path.into());
    }

    /// Rewrite an intra-backend path (and any mention of it in the message)
    /// back to the path visible at the wrapper boundary. Used by
    /// [`crate::folder_adapter::FolderAdapter`] and [`crate::vfs::Vfs`]
    /// dispatch to keep errors meaningful to callers who never see the
    /// backend-local path.
    pub fn rewrite_path(&mut self, from: &str, to: &str) {
        if let Some(path) = &self.path {
            if path == from {
                self.message = self.message.replace(from, to);
                self.path = Some(to.to_string());
            }
        }
    }

    /// Encode this error as the wire format used at process/RPC boundaries
    /// (§4.A, §8.6): a little-endian `u32` byte-length prefix followed by
    /// UTF-8 JSON. This is the crate's own boundary codec, built on
    /// `serde_json` directly rather than on the optional `serializable`
    /// feature's `Serialize` derive, so it's available unconditionally.
    pub fn to_wire(&self) -> Vec<u8> {
        let body = serde_json::json!({
            "errno": self.errno.name(),
            "message": self.message,
            "path": self.path,
        })
        .to_string();
        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(body.as_bytes());
        out
    }

    /// Decode the format written by [`Error::to_wire`].
    pub fn from_wire(bytes: &[u8]) -> Result<Error> {
        if bytes.len() < 4 {
            return Err(Error::invalid("truncated error wire format: missing length prefix"));
        }
        let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let body = bytes
            .get(4..4 + len)
            .ok_or_else(|| Error::invalid("truncated error wire format: length prefix exceeds buffer"))?;
        let text = std::str::from_utf8(body)
            .map_err(|e| Error::invalid(format!("error wire format is not valid utf-8: {e}")))?;
        let json: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| Error::invalid(format!("error wire format is not valid json: {e}")))?;
        let errno_name = json
            .get("errno")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::invalid("error wire format missing 'errno' field"))?;
        let errno = Errno::from_name(errno_name)
            .ok_or_else(|| Error::invalid(format!("unknown errno name '{errno_name}'")))?;
        let message = json
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let path = json.get("path").and_then(|v| v.as_str()).map(|s| s.to_string());
        Ok(Error { errno, message, path })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "Error: {}: {}, '{}'", self.errno, self.message, path),
            None => write!(f, "Error: {}: {}", self.errno, self.message),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Shorthand constructors for the common cases, mirroring the way the
/// teacher crate builds one-off `reply.error(Errno::...)` calls inline.
macro_rules! errno_ctor {
    ($name:ident, $variant:ident) => {
        /// Construct an
        #[doc = concat!("`", stringify!($variant), "`")]
        /// error.
        pub fn $name(message: impl Into<String>) -> Error {
            Error::new(Errno::$variant, message)
        }
    };
}

impl Error {
    errno_ctor!(perm, EPERM);
    errno_ctor!(not_found, ENOENT);
    errno_ctor!(io, EIO);
    errno_ctor!(bad_fd, EBADF);
    errno_ctor!(access, EACCES);
    errno_ctor!(busy, EBUSY);
    errno_ctor!(exists, EEXIST);
    errno_ctor!(not_dir, ENOTDIR);
    errno_ctor!(is_dir, EISDIR);
    errno_ctor!(invalid, EINVAL);
    errno_ctor!(too_big, EFBIG);
    errno_ctor!(no_space, ENOSPC);
    errno_ctor!(read_only, EROFS);
    errno_ctor!(not_empty, ENOTEMPTY);
    errno_ctor!(not_supported, ENOTSUP);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_posix_values() {
        assert_eq!(Errno::EPERM.code(), 1);
        assert_eq!(Errno::ENOENT.code(), 2);
        assert_eq!(Errno::EIO.code(), 5);
        assert_eq!(Errno::EBADF.code(), 9);
        assert_eq!(Errno::EACCES.code(), 13);
        assert_eq!(Errno::EBUSY.code(), 16);
        assert_eq!(Errno::EEXIST.code(), 17);
        assert_eq!(Errno::ENOTDIR.code(), 20);
        assert_eq!(Errno::EISDIR.code(), 21);
        assert_eq!(Errno::EINVAL.code(), 22);
        assert_eq!(Errno::EFBIG.code(), 27);
        assert_eq!(Errno::ENOSPC.code(), 28);
        assert_eq!(Errno::EROFS.code(), 30);
        assert_eq!(Errno::ENOTEMPTY.code(), 39);
        assert_eq!(Errno::ENOTSUP.code(), 95);
    }

    #[test]
    fn display_matches_expected_shape() {
        let err = Error::with_path(Errno::ENOENT, "no such file or directory", "/a/b");
        assert_eq!(
            err.to_string(),
            "Error: ENOENT: no such file or directory, '/a/b'"
        );
    }

    #[test]
    fn rewrite_path_updates_message_and_path() {
        let mut err = Error::with_path(Errno::ENOENT, "missing: /inner/f", "/inner/f");
        err.rewrite_path("/inner/f", "/mnt/f");
        assert_eq!(err.path(), Some("/mnt/f"));
        assert_eq!(err.to_string(), "Error: ENOENT: missing: /mnt/f, '/mnt/f'");
    }

    #[test]
    fn wire_format_round_trips_with_path() {
        let err = Error::with_path(Errno::EEXIST, "already exists", "/a/b");
        let bytes = err.to_wire();
        let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        assert_eq!(len, bytes.len() - 4);
        let decoded = Error::from_wire(&bytes).unwrap();
        assert_eq!(decoded.errno(), Errno::EEXIST);
        assert_eq!(decoded.path(), Some("/a/b"));
        assert_eq!(decoded.to_string(), err.to_string());
    }

    #[test]
    fn wire_format_round_trips_without_path() {
        let err = Error::no_space("disk full");
        let decoded = Error::from_wire(&err.to_wire()).unwrap();
        assert_eq!(decoded.errno(), Errno::ENOSPC);
        assert_eq!(decoded.path(), None);
        assert_eq!(decoded.to_string(), err.to_string());
    }

    #[test]
    fn from_wire_rejects_truncated_length_prefix() {
        assert!(Error::from_wire(&[0, 1]).is_err());
    }

    #[test]
    fn from_wire_rejects_unknown_errno_name() {
        let body = br#"{"errno":"ENOTANERRNO","message":"x","path":null}"#;
        let mut bytes = (body.len() as u32).to_le_bytes().to_vec();
        bytes.extend_from_slice(body);
        assert!(Error::from_wire(&bytes).is_err());
    }
}
