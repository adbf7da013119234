//! Mount configuration (§6): parses a mount map `{point: config}` into
//! [`BackendConfig`] values ready for [`BackendConfig::build`]. A config
//! value is either a bare backend-name string (shorthand for `{fs: name}`)
//! or a full options object. Each backend kind declares its own options
//! schema; an unknown key gets a Levenshtein-suggested correction, a
//! type mismatch is a plain `EINVAL`.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::fs::FileSystem;
use crate::kv::engine::KeyValueFileSystem;
use crate::kv::memory::InMemoryStore;
use crate::overlay::OverlayFileSystem;
use crate::folder_adapter::FolderAdapter;

const KNOWN_KINDS: &[&str] = &["memory", "overlay", "mirror", "folder"];

/// The JSON type an option value must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OptionType {
    String,
    /// A nested backend config: another bare name or options object.
    Backend,
}

impl OptionType {
    fn matches(self, value: &Value) -> bool {
        match self {
            OptionType::String => value.is_string(),
            OptionType::Backend => value.is_string() || value.is_object(),
        }
    }

    fn description(self) -> &'static str {
        match self {
            OptionType::String => "string",
            OptionType::Backend => "backend config (a name or an options object)",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct OptionSchema {
    name: &'static str,
    kind: OptionType,
}

fn schema_for(kind: &str) -> Result<&'static [OptionSchema]> {
    const OVERLAY: &[OptionSchema] = &[
        OptionSchema { name: "lower", kind: OptionType::Backend },
        OptionSchema { name: "upper", kind: OptionType::Backend },
    ];
    const MIRROR: &[OptionSchema] = &[
        OptionSchema { name: "sync", kind: OptionType::Backend },
        OptionSchema { name: "async", kind: OptionType::Backend },
    ];
    const FOLDER: &[OptionSchema] = &[
        OptionSchema { name: "inner", kind: OptionType::Backend },
        OptionSchema { name: "folder", kind: OptionType::String },
    ];
    match kind {
        "memory" => Ok(&[]),
        "overlay" => Ok(OVERLAY),
        "mirror" => Ok(MIRROR),
        "folder" => Ok(FOLDER),
        other => Err(unknown_error("backend kind", other, KNOWN_KINDS)),
    }
}

/// A parsed mount-point configuration (§6), recursively for the composite
/// kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendConfig {
    /// A fresh in-memory key-value backend.
    Memory,
    /// A writable layer over a read-only one.
    Overlay { lower: Box<BackendConfig>, upper: Box<BackendConfig> },
    /// A synchronous backend mirrored to an async one.
    Mirror { sync: Box<BackendConfig>, r#async: Box<BackendConfig> },
    /// `inner`, scoped under `folder`.
    Folder { inner: Box<BackendConfig>, folder: String },
}

/// Parse one config value: a bare backend-name string, or `{fs: name, ...}`.
pub fn parse_backend_config(value: &Value) -> Result<BackendConfig> {
    match value {
        Value::String(name) => {
            let mut shorthand = Map::new();
            shorthand.insert("fs".to_string(), Value::String(name.clone()));
            parse_backend_config(&Value::Object(shorthand))
        }
        Value::Object(obj) => {
            let kind = obj
                .get("fs")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::invalid("backend config object is missing its 'fs' key"))?;
            let schema = schema_for(kind)?;
            validate_options(kind, obj, schema)?;
            build_config(kind, obj)
        }
        _ => Err(Error::invalid("backend config must be a string or an object")),
    }
}

/// Parse a full mount map: `{point: config}`.
pub fn parse_mount_map(map: &Map<String, Value>) -> Result<BTreeMap<String, BackendConfig>> {
    map.iter().map(|(point, value)| Ok((point.clone(), parse_backend_config(value)?))).collect()
}

fn validate_options(kind: &str, obj: &Map<String, Value>, schema: &[OptionSchema]) -> Result<()> {
    let known_names: Vec<&'static str> = schema.iter().map(|s| s.name).collect();
    for key in obj.keys() {
        if key == "fs" {
            continue;
        }
        if !known_names.contains(&key.as_str()) {
            return Err(unknown_error(&format!("option for '{kind}' backend"), key, &known_names));
        }
    }
    for opt in schema {
        match obj.get(opt.name) {
            Some(v) if !opt.kind.matches(v) => {
                return Err(Error::invalid(format!(
                    "option '{}' for '{kind}' backend must be a {}",
                    opt.name,
                    opt.kind.description()
                )));
            }
            Some(_) => {}
            None => {
                return Err(Error::invalid(format!(
                    "missing required option '{}' for '{kind}' backend",
                    opt.name
                )));
            }
        }
    }
    Ok(())
}

fn build_config(kind: &str, obj: &Map<String, Value>) -> Result<BackendConfig> {
    let field = |name: &str| -> Result<&Value> {
        obj.get(name).ok_or_else(|| Error::invalid(format!("missing '{name}' for '{kind}' backend")))
    };
    match kind {
        "memory" => Ok(BackendConfig::Memory),
        "overlay" => Ok(BackendConfig::Overlay {
            lower: Box::new(parse_backend_config(field("lower")?)?),
            upper: Box::new(parse_backend_config(field("upper")?)?),
        }),
        "mirror" => Ok(BackendConfig::Mirror {
            sync: Box::new(parse_backend_config(field("sync")?)?),
            r#async: Box::new(parse_backend_config(field("async")?)?),
        }),
        "folder" => Ok(BackendConfig::Folder {
            inner: Box::new(parse_backend_config(field("inner")?)?),
            folder: field("folder")?.as_str().unwrap_or_default().to_string(),
        }),
        other => Err(unknown_error("backend kind", other, KNOWN_KINDS)),
    }
}

/// Levenshtein edit distance, used only to suggest corrections for
/// near-miss kind/option names.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];
    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=b.len() {
            let cost = if a[i - 1] == b[j - 1] { 0 } else { 1 };
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

fn suggest(name: &str, candidates: &[&'static str]) -> Option<&'static str> {
    candidates
        .iter()
        .copied()
        .map(|c| (c, levenshtein(name, c)))
        .filter(|(_, d)| *d <= 2)
        .min_by_key(|(_, d)| *d)
        .map(|(c, _)| c)
}

fn unknown_error(what: &str, name: &str, candidates: &[&'static str]) -> Error {
    match suggest(name, candidates) {
        Some(s) => Error::invalid(format!("unknown {what} '{name}', did you mean '{s}'?")),
        None => Error::invalid(format!("unknown {what} '{name}'")),
    }
}

impl BackendConfig {
    /// Build the backend this config describes. `mirror` configs need an
    /// async runtime to copy their initial tree and can't be built here;
    /// use [`Self::build_mirror`] (behind the `async` feature) for those.
    pub fn build(&self) -> Result<Arc<dyn FileSystem>> {
        match self {
            BackendConfig::Memory => {
                let fs = KeyValueFileSystem::new(InMemoryStore::new())?;
                Ok(Arc::new(fs) as Arc<dyn FileSystem>)
            }
            BackendConfig::Overlay { lower, upper } => {
                // `Arc<dyn FileSystem>` itself implements `FileSystem` (see
                // the blanket impl in `fs.rs`), so it can stand in for
                // `OverlayFileSystem`'s `L`/`U` type parameters directly.
                let fs = OverlayFileSystem::new(lower.build()?, upper.build()?)?;
                Ok(Arc::new(fs) as Arc<dyn FileSystem>)
            }
            BackendConfig::Folder { inner, folder } => {
                let fs = FolderAdapter::new(inner.build()?, folder)?;
                Ok(Arc::new(fs) as Arc<dyn FileSystem>)
            }
            BackendConfig::Mirror { .. } => {
                Err(Error::invalid("mirror backends require `BackendConfig::build_mirror` (async)"))
            }
        }
    }
}

#[cfg(feature = "async")]
impl BackendConfig {
    /// Build a `mirror` config. The `async` side is itself built
    /// synchronously and presented through [`crate::fs::SynchronousAsAsync`]
    /// — wiring in a real async backend instead is a matter of calling
    /// [`crate::mirror::AsyncMirrorFileSystem::new`] directly.
    pub async fn build_mirror(&self) -> Result<Arc<dyn FileSystem>> {
        match self {
            BackendConfig::Mirror { sync, r#async } => {
                let sync_fs = sync.build()?;
                let async_side = crate::fs::SynchronousAsAsync(r#async.build()?);
                let mirrored = crate::mirror::AsyncMirrorFileSystem::new(sync_fs, async_side).await?;
                Ok(Arc::new(mirrored) as Arc<dyn FileSystem>)
            }
            other => other.build(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bare_name_is_shorthand_for_fs_key() {
        let cfg = parse_backend_config(&json!("memory")).unwrap();
        assert_eq!(cfg, BackendConfig::Memory);
    }

    #[test]
    fn nested_overlay_and_folder_parse_recursively() {
        let cfg = parse_backend_config(&json!({
            "fs": "folder",
            "folder": "/scoped",
            "inner": {
                "fs": "overlay",
                "lower": "memory",
                "upper": "memory",
            },
        }))
        .unwrap();
        match cfg {
            BackendConfig::Folder { inner, folder } => {
                assert_eq!(folder, "/scoped");
                assert!(matches!(*inner, BackendConfig::Overlay { .. }));
            }
            other => panic!("expected Folder, got {other:?}"),
        }
    }

    #[test]
    fn unknown_kind_suggests_closest_known_one() {
        let err = parse_backend_config(&json!("memry")).unwrap_err();
        assert!(err.to_string().contains("did you mean 'memory'"));
    }

    #[test]
    fn unknown_option_key_suggests_closest_schema_name() {
        let err = parse_backend_config(&json!({"fs": "folder", "foldr": "/x", "inner": "memory"})).unwrap_err();
        assert!(err.to_string().contains("did you mean 'folder'"));
    }

    #[test]
    fn type_mismatch_on_an_option_is_invalid() {
        let err = parse_backend_config(&json!({"fs": "folder", "folder": 5, "inner": "memory"})).unwrap_err();
        assert_eq!(err.errno(), crate::error::Errno::EINVAL);
    }

    #[test]
    fn missing_required_option_is_invalid() {
        let err = parse_backend_config(&json!({"fs": "overlay", "lower": "memory"})).unwrap_err();
        assert_eq!(err.errno(), crate::error::Errno::EINVAL);
    }

    #[test]
    fn mount_map_builds_a_backend_per_point() {
        let mut map = Map::new();
        map.insert("/".to_string(), json!("memory"));
        map.insert("/scratch".to_string(), json!({"fs": "folder", "folder": "/x", "inner": "memory"}));
        let parsed = parse_mount_map(&map).unwrap();
        assert_eq!(parsed.len(), 2);
        assert!(parsed.get("/").unwrap().build().is_ok());
        assert!(parsed.get("/scratch").unwrap().build().is_ok());
    }
}
