//! `.nodb` document encoding, legacy tag redirects, and the shared
//! document cache.
//!
//! A document is a JSON object `{"kind": <tag>, "state": {...}}`. The
//! kind tag is redundant with the file name but is what older documents
//! are validated against; tags written by earlier releases (full module
//! paths) are remapped through a static redirect table before decoding.
//!
//! Hydration consults a shared KV cache keyed by the absolute document
//! path; entries are invalidated by mtime so external rewrites are
//! always picked up.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::{Controller, NodbError};
use crate::kv::KvStore;

/// Legacy kind tags from earlier serializer layouts, including the
/// pre-rewrite platform's module paths found in migrated run trees.
static LEGACY_REDIRECTS: &[(&str, &str)] = &[
    ("wepppy.nodb.ron.Ron", "ron"),
    ("wepppy.nodb.watershed.Watershed", "watershed"),
    ("wepppy.nodb.landuse.Landuse", "landuse"),
    ("wepppy.nodb.soils.Soils", "soils"),
    ("wepppy.nodb.climate.Climate", "climate"),
    ("wepppy.nodb.wepp.Wepp", "wepp"),
    ("wepppy.nodb.wepppost.WeppPost", "wepppost"),
    ("wepppy.nodb.mods.disturbed.Disturbed", "disturbed"),
    ("wepppy.nodb.mods.baer.Baer", "disturbed"),
    ("wepppy.nodb.mods.rap.RAP", "rap"),
    ("wepppy.nodb.mods.ash.Ash", "ash"),
    ("wepppy.nodb.mods.omni.Omni", "omni"),
    ("controllers.ron.Ron", "ron"),
    ("controllers.watershed.Watershed", "watershed"),
];

/// Maps a stored kind tag to its canonical form.
pub fn canonical_kind_tag(tag: &str) -> &str {
    for (legacy, canonical) in LEGACY_REDIRECTS {
        if *legacy == tag {
            return canonical;
        }
    }
    tag
}

#[derive(Serialize)]
struct DocumentRef<'a, C> {
    kind: &'a str,
    state: &'a C,
}

#[derive(Deserialize)]
struct DocumentHeader {
    kind: String,
    state: serde_json::Value,
}

/// Serializes controller state into document form.
pub fn encode_document<C: Controller>(state: &C) -> Result<String, NodbError> {
    serde_json::to_string_pretty(&DocumentRef {
        kind: C::KIND.tag(),
        state,
    })
    .map_err(|e| NodbError::Serde {
        path: C::KIND.filename().into(),
        reason: e.to_string(),
    })
}

/// Decodes a document, remapping legacy tags and validating the kind.
pub fn decode_document<C: Controller>(raw: &str, path: &Path) -> Result<C, NodbError> {
    let header: DocumentHeader = serde_json::from_str(raw).map_err(|e| NodbError::Serde {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let canonical = canonical_kind_tag(&header.kind);
    if canonical != C::KIND.tag() {
        return Err(NodbError::KindMismatch {
            path: path.to_path_buf(),
            expected: C::KIND.tag(),
            found: header.kind,
        });
    }
    serde_json::from_value(header.state).map_err(|e| NodbError::Serde {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn cache_key(path: &Path) -> String {
    format!("nodbcache:{}", path.display())
}

fn mtime_tag(mtime: SystemTime) -> u128 {
    mtime
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

#[derive(Serialize, Deserialize)]
struct CachedDocument {
    mtime_ns: u128,
    doc: String,
}

/// Loads a document, consulting the shared cache first.
///
/// Returns the decoded state and the on-disk mtime the load observed.
pub fn load_document<C: Controller>(
    path: &Path,
    kv: &dyn KvStore,
) -> Result<(C, SystemTime), NodbError> {
    let meta = std::fs::metadata(path).map_err(|e| NodbError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mtime = meta.modified().map_err(|e| NodbError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let key = cache_key(path);
    if let Some(cached) = kv
        .get(&key)
        .and_then(|raw| serde_json::from_str::<CachedDocument>(&raw).ok())
    {
        if cached.mtime_ns == mtime_tag(mtime) {
            if let Ok(state) = decode_document::<C>(&cached.doc, path) {
                return Ok((state, mtime));
            }
        }
    }
    let raw = std::fs::read_to_string(path).map_err(|e| NodbError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let state = decode_document::<C>(&raw, path)?;
    refresh_cache(kv, path, mtime, &raw);
    Ok((state, mtime))
}

/// Writes a document atomically and refreshes the shared cache.
pub fn write_document<C: Controller>(
    path: &Path,
    state: &C,
    kv: &dyn KvStore,
) -> Result<SystemTime, NodbError> {
    let raw = encode_document(state)?;
    let tmp = path.with_extension("nodb.tmp");
    std::fs::write(&tmp, &raw).map_err(|e| NodbError::Io {
        path: tmp.clone(),
        source: e,
    })?;
    std::fs::rename(&tmp, path).map_err(|e| NodbError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let meta = std::fs::metadata(path).map_err(|e| NodbError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mtime = meta.modified().map_err(|e| NodbError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    refresh_cache(kv, path, mtime, &raw);
    Ok(mtime)
}

fn refresh_cache(kv: &dyn KvStore, path: &Path, mtime: SystemTime, raw: &str) {
    let cached = CachedDocument {
        mtime_ns: mtime_tag(mtime),
        doc: raw.to_string(),
    };
    if let Ok(payload) = serde_json::to_string(&cached) {
        let key = cache_key(path);
        kv.delete(&key);
        kv.set_nx(&key, &payload, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use crate::nodb::{NodbBase, NodbKind};
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        base: NodbBase,
        value: String,
    }

    impl Controller for Sample {
        const KIND: NodbKind = NodbKind::Ron;
    }

    fn sample(value: &str) -> Sample {
        Sample {
            base: NodbBase::new("/runs/r1", "r1", "default"),
            value: value.to_string(),
        }
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let state = sample("initial");
        let raw = encode_document(&state).unwrap();
        let decoded: Sample = decode_document(&raw, Path::new("ron.nodb")).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn test_legacy_tag_redirect() {
        let raw = encode_document(&sample("x"))
            .unwrap()
            .replace("\"kind\": \"ron\"", "\"kind\": \"wepppy.nodb.ron.Ron\"");
        let decoded: Sample = decode_document(&raw, Path::new("ron.nodb")).unwrap();
        assert_eq!(decoded.value, "x");
    }

    #[test]
    fn test_kind_mismatch_is_rejected() {
        let raw = encode_document(&sample("x"))
            .unwrap()
            .replace("\"kind\": \"ron\"", "\"kind\": \"soils\"");
        let err = decode_document::<Sample>(&raw, Path::new("ron.nodb")).unwrap_err();
        assert!(matches!(err, NodbError::KindMismatch { .. }));
    }

    #[test]
    fn test_write_then_load_uses_cache() {
        let wd = tempdir().unwrap();
        let kv = MemoryKv::new();
        let path = wd.path().join("ron.nodb");
        write_document(&path, &sample("cached"), &kv).unwrap();
        // Corrupt the file on disk; the cache entry still matches the
        // mtime only if the file is untouched, so rewrite via a distinct
        // path check: loading should come from the cache when mtime is
        // unchanged.
        let (state, _) = load_document::<Sample>(&path, &kv).unwrap();
        assert_eq!(state.value, "cached");
    }

    #[test]
    fn test_external_rewrite_invalidates_cache() {
        let wd = tempdir().unwrap();
        let kv = MemoryKv::new();
        let path = wd.path().join("ron.nodb");
        write_document(&path, &sample("initial"), &kv).unwrap();
        load_document::<Sample>(&path, &kv).unwrap();

        // External rewrite with an advanced mtime.
        std::thread::sleep(std::time::Duration::from_millis(20));
        let raw = encode_document(&sample("updated")).unwrap();
        std::fs::write(&path, raw).unwrap();

        let (state, _) = load_document::<Sample>(&path, &kv).unwrap();
        assert_eq!(state.value, "updated");
    }

    #[test]
    fn test_canonical_tag_passthrough() {
        assert_eq!(canonical_kind_tag("climate"), "climate");
        assert_eq!(canonical_kind_tag("wepppy.nodb.mods.baer.Baer"), "disturbed");
    }
}
