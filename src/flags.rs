//! Open-flag parsing and the exists/not-exists action table (§4.D).

use crate::error::{Error, Result};

/// What to do when the target path already exists at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathExistsAction {
    /// Do nothing; open the existing file.
    Nop,
    /// Truncate the existing file to zero length.
    TruncateFile,
    /// Fail with `EEXIST`.
    ThrowException,
}

/// What to do when the target path does not exist at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathNotExistsAction {
    /// Create a new, empty file.
    CreateFile,
    /// Fail with `ENOENT`.
    ThrowException,
}

/// A parsed open-mode flag, derived from one of the twelve valid flag
/// strings or a numeric `O_*` combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileFlag {
    flag_string: &'static str,
    readable: bool,
    writable: bool,
    append: bool,
    synchronous: bool,
    exclusive: bool,
    truncating: bool,
    exists_action: PathExistsAction,
    not_exists_action: PathNotExistsAction,
}

macro_rules! flag {
    ($s:literal, $r:expr, $w:expr, $append:expr, $sync:expr, $excl:expr, $trunc:expr, $exists:expr, $not_exists:expr) => {
        FileFlag {
            flag_string: $s,
            readable: $r,
            writable: $w,
            append: $append,
            synchronous: $sync,
            exclusive: $excl,
            truncating: $trunc,
            exists_action: $exists,
            not_exists_action: $not_exists,
        }
    };
}

impl FileFlag {
    /// Parse one of the twelve valid flag strings. Any other string is
    /// `EINVAL`.
    pub fn from_str(s: &str) -> Result<Self> {
        use PathExistsAction::{Nop, ThrowException as ExistsThrow, TruncateFile};
        use PathNotExistsAction::{CreateFile, ThrowException as NotExistsThrow};
        Ok(match s {
            "r" => flag!("r", true, false, false, false, false, false, Nop, NotExistsThrow),
            "r+" => flag!("r+", true, true, false, false, false, false, Nop, NotExistsThrow),
            "rs" => flag!("rs", true, false, false, true, false, false, Nop, NotExistsThrow),
            "rs+" => flag!("rs+", true, true, false, true, false, false, Nop, NotExistsThrow),
            "w" => flag!("w", false, true, false, false, false, true, TruncateFile, CreateFile),
            "wx" => flag!("wx", false, true, false, false, true, true, ExistsThrow, CreateFile),
            "w+" => flag!("w+", true, true, false, false, false, true, TruncateFile, CreateFile),
            "wx+" => flag!("wx+", true, true, false, false, true, true, ExistsThrow, CreateFile),
            "a" => flag!("a", false, true, true, false, false, false, Nop, CreateFile),
            "ax" => flag!("ax", false, true, true, false, true, false, ExistsThrow, CreateFile),
            "a+" => flag!("a+", true, true, true, false, false, false, Nop, CreateFile),
            "ax+" => flag!("ax+", true, true, true, false, true, false, ExistsThrow, CreateFile),
            other => return Err(Error::invalid(format!("invalid open flag {other:?}"))),
        })
    }

    /// Derive a `FileFlag` from a numeric `O_*` bit combination.
    pub fn from_numeric(flags: i32) -> Result<Self> {
        use PathExistsAction::{Nop, ThrowException as ExistsThrow, TruncateFile};
        use PathNotExistsAction::{CreateFile, ThrowException as NotExistsThrow};

        let acc = flags & libc::O_ACCMODE;
        let readable = acc == libc::O_RDONLY || acc == libc::O_RDWR;
        let writable = acc == libc::O_WRONLY || acc == libc::O_RDWR;
        let append = flags & libc::O_APPEND != 0;
        let synchronous = flags & libc::O_SYNC != 0;
        let exclusive = flags & libc::O_EXCL != 0;
        let creat = flags & libc::O_CREAT != 0;
        let truncating = flags & libc::O_TRUNC != 0;

        if !creat && exclusive {
            return Err(Error::invalid("O_EXCL without O_CREAT"));
        }

        let exists_action = if exclusive {
            ExistsThrow
        } else if truncating {
            TruncateFile
        } else {
            Nop
        };
        let not_exists_action = if creat {
            CreateFile
        } else {
            NotExistsThrow
        };

        let flag_string: &'static str = match (readable, writable, append, exclusive, truncating, creat) {
            (true, false, false, _, _, false) => "r",
            (true, true, false, _, _, false) => "r+",
            (false, true, false, false, true, true) => "w",
            (false, true, false, true, _, true) => "wx",
            (true, true, false, false, true, true) => "w+",
            (true, true, false, true, _, true) => "wx+",
            (false, true, true, false, _, true) => "a",
            (false, true, true, true, _, true) => "ax",
            (true, true, true, false, _, true) => "a+",
            (true, true, true, true, _, true) => "ax+",
            _ => "r",
        };

        Ok(FileFlag {
            flag_string,
            readable,
            writable,
            append,
            synchronous,
            exclusive,
            truncating,
            exists_action,
            not_exists_action,
        })
    }

    /// The canonical flag string this was parsed from.
    pub fn flag_string(&self) -> &'static str {
        self.flag_string
    }

    /// Whether reads are permitted.
    pub fn is_readable(&self) -> bool {
        self.readable
    }

    /// Whether writes are permitted.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Whether this flag forces the effective write position to the
    /// current end of file (POSIX append semantics).
    pub fn is_appendable(&self) -> bool {
        self.append
    }

    /// Whether writes must synchronously flush to the backend.
    pub fn is_synchronous(&self) -> bool {
        self.synchronous
    }

    /// Whether this flag requires the path not already exist.
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    /// Whether this flag truncates an existing file on open.
    pub fn is_truncating(&self) -> bool {
        self.truncating
    }

    /// What to do if the path exists.
    pub fn path_exists_action(&self) -> PathExistsAction {
        self.exists_action
    }

    /// What to do if the path does not exist.
    pub fn path_not_exists_action(&self) -> PathNotExistsAction {
        self.not_exists_action
    }

    /// Derived mode bits for a permission check at open time: bit 1
    /// (value 4) set if readable, bit 2 (value 2) set if writable. Execute
    /// is never requested.
    pub fn access_mode_bits(&self) -> u8 {
        let mut bits = 0u8;
        if self.readable {
            bits |= 0o4;
        }
        if self.writable {
            bits |= 0o2;
        }
        bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_FLAGS: &[&str] = &[
        "r", "r+", "rs", "rs+", "w", "wx", "w+", "wx+", "a", "ax", "a+", "ax+",
    ];

    #[test]
    fn every_valid_flag_round_trips_its_string() {
        for &s in ALL_FLAGS {
            let flag = FileFlag::from_str(s).unwrap();
            assert_eq!(flag.flag_string(), s);
        }
    }

    #[test]
    fn action_table_matches_spec() {
        let r = FileFlag::from_str("r").unwrap();
        assert_eq!(r.path_exists_action(), PathExistsAction::Nop);
        assert_eq!(r.path_not_exists_action(), PathNotExistsAction::ThrowException);

        let w = FileFlag::from_str("w").unwrap();
        assert_eq!(w.path_exists_action(), PathExistsAction::TruncateFile);
        assert_eq!(w.path_not_exists_action(), PathNotExistsAction::CreateFile);

        let a = FileFlag::from_str("a").unwrap();
        assert_eq!(a.path_exists_action(), PathExistsAction::Nop);
        assert_eq!(a.path_not_exists_action(), PathNotExistsAction::CreateFile);

        let wx = FileFlag::from_str("wx").unwrap();
        assert_eq!(wx.path_exists_action(), PathExistsAction::ThrowException);
        assert_eq!(wx.path_not_exists_action(), PathNotExistsAction::CreateFile);

        let rplus = FileFlag::from_str("r+").unwrap();
        assert_eq!(rplus.path_exists_action(), PathExistsAction::Nop);
        assert_eq!(rplus.path_not_exists_action(), PathNotExistsAction::ThrowException);
    }

    #[test]
    fn invalid_string_is_einval() {
        assert!(FileFlag::from_str("bogus").is_err());
    }

    #[test]
    fn numeric_rdwr_creat_trunc_matches_w_plus() {
        let flag =
            FileFlag::from_numeric(libc::O_RDWR | libc::O_CREAT | libc::O_TRUNC).unwrap();
        assert_eq!(flag.flag_string(), "w+");
        assert!(flag.is_readable());
        assert!(flag.is_writable());
    }

    #[test]
    fn access_mode_bits_never_request_execute() {
        let flag = FileFlag::from_str("r+").unwrap();
        assert_eq!(flag.access_mode_bits(), 0o6);
    }
}
