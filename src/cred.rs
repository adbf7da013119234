//! Credentials carried on every request.

#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// The six-field UID/GID record POSIX processes carry: real, saved and
/// effective identities for both the user and group. Permission checks
/// (§4.C) only ever look at the effective pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct Credentials {
    /// Real user id.
    pub uid: u32,
    /// Real group id.
    pub gid: u32,
    /// Saved user id.
    pub suid: u32,
    /// Saved group id.
    pub sgid: u32,
    /// Effective user id, used for access checks.
    pub euid: u32,
    /// Effective group id, used for access checks.
    pub egid: u32,
}

impl Credentials {
    /// Build credentials where the real, saved and effective ids all match.
    pub fn new(uid: u32, gid: u32) -> Self {
        Credentials {
            uid,
            gid,
            suid: uid,
            sgid: gid,
            euid: uid,
            egid: gid,
        }
    }

    /// The root constant: uid 0, gid 0, in all six fields.
    pub const fn root() -> Self {
        Credentials {
            uid: 0,
            gid: 0,
            suid: 0,
            sgid: 0,
            euid: 0,
            egid: 0,
        }
    }

    /// Whether this credential's effective uid is root.
    pub fn is_root(&self) -> bool {
        self.euid == 0
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Credentials::root()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_all_zero() {
        let root = Credentials::root();
        assert_eq!(root.uid, 0);
        assert_eq!(root.egid, 0);
        assert!(root.is_root());
    }

    #[test]
    fn new_copies_into_saved_and_effective() {
        let c = Credentials::new(500, 600);
        assert_eq!(c.suid, 500);
        assert_eq!(c.euid, 500);
        assert_eq!(c.sgid, 600);
        assert_eq!(c.egid, 600);
        assert!(!c.is_root());
    }
}
