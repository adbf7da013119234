//! Wall-clock helper shared by every module that stamps `atime`/`mtime`/
//! `ctime`/`birthtime` (all expressed as milliseconds since the Unix epoch,
//! per §3).

/// The current time, in milliseconds since the Unix epoch.
pub fn now_ms() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
        * 1000.0
}
