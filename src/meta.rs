//! Index meta sidecar (`<csv>_meta.json`) and sidecar path derivation.
//!
//! The meta file records what the indexer saw at capture time.  The executor
//! compares it against the live source to flag staleness; a mismatch is a
//! warning on the query path and fatal (without `--force`) on the index path.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::source::Source;

// ── Sidecar paths ────────────────────────────────────────────────────────────

/// Canonical name of an index over one or more columns, used in file names
/// and as the meta `columns` key.
pub fn column_key(columns: &[String]) -> String {
    columns.join("+")
}

fn sibling(source: &Path, suffix: &str) -> PathBuf {
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    source.with_file_name(format!("{name}{suffix}"))
}

pub fn index_path(source: &Path, columns: &[String]) -> PathBuf {
    sibling(source, &format!("_{}.cidx", column_key(columns)))
}

pub fn bloom_path(source: &Path, columns: &[String]) -> PathBuf {
    sibling(source, &format!("_{}.bloom", column_key(columns)))
}

pub fn meta_path(source: &Path) -> PathBuf {
    sibling(source, "_meta.json")
}

pub fn schema_path(source: &Path) -> PathBuf {
    sibling(source, "_schema.json")
}

// ── Meta file ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ColumnStats {
    pub distinct_count: u64,
    pub file_size:      u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexMeta {
    pub captured_at:    String,
    pub total_rows:     u64,
    pub malformed_rows: u64,
    pub source_size:    u64,
    pub source_mtime:   i64,
    pub fingerprint:    String,
    /// Keyed by [`column_key`].
    pub columns:        BTreeMap<String, ColumnStats>,
}

impl IndexMeta {
    /// Snapshot the source's identity; column stats are filled in by the
    /// indexer as each index completes.
    pub fn capture(source: &Source) -> Result<Self> {
        Ok(Self {
            captured_at:    chrono::Utc::now().to_rfc3339(),
            total_rows:     0,
            malformed_rows: 0,
            source_size:    source.len(),
            source_mtime:   source.mtime_secs()?,
            fingerprint:    source.fingerprint(),
            columns:        BTreeMap::new(),
        })
    }

    pub fn load(source_path: &Path) -> Result<Option<Self>> {
        let path = meta_path(source_path);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path)?;
        let meta = serde_json::from_slice(&bytes)
            .map_err(|e| Error::CorruptIndex(format!("meta parse: {e}")))?;
        Ok(Some(meta))
    }

    /// Atomic write: temp file, fsync, rename.
    pub fn save(&self, source_path: &Path) -> Result<()> {
        let path = meta_path(source_path);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| Error::Internal(format!("meta encode: {e}")))?;
        let mut f = File::create(&tmp)?;
        f.write_all(&bytes)?;
        f.sync_all()?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Why the live source no longer matches this capture, if it doesn't.
    pub fn staleness(&self, source: &Source) -> Option<String> {
        if source.len() != self.source_size {
            return Some(format!(
                "size changed from {} to {}",
                self.source_size,
                source.len()
            ));
        }
        if let Ok(mtime) = source.mtime_secs() {
            if mtime != self.source_mtime {
                return Some(format!(
                    "mtime changed from {} to {mtime}",
                    self.source_mtime
                ));
            }
        }
        let fp = source.fingerprint();
        if fp != self.fingerprint {
            return Some(format!(
                "fingerprint changed from {} to {fp}",
                self.fingerprint
            ));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::NamedTempFile;

    #[test]
    fn sidecar_names() {
        let src = Path::new("/data/users.csv");
        let cols = vec!["DEPT".to_string(), "LEVEL".to_string()];
        assert_eq!(index_path(src, &cols), Path::new("/data/users.csv_DEPT+LEVEL.cidx"));
        assert_eq!(
            bloom_path(src, &["STATUS".to_string()]),
            Path::new("/data/users.csv_STATUS.bloom")
        );
        assert_eq!(meta_path(src), Path::new("/data/users.csv_meta.json"));
        assert_eq!(schema_path(src), Path::new("/data/users.csv_schema.json"));
    }

    #[test]
    fn save_load_and_staleness() {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(b"ID,STATUS\n1,active\n").unwrap();
        tmp.flush().unwrap();
        let source = Source::open(tmp.path()).unwrap();

        let mut meta = IndexMeta::capture(&source).unwrap();
        meta.total_rows = 1;
        meta.columns.insert(
            "STATUS".into(),
            ColumnStats { distinct_count: 1, file_size: 123 },
        );
        meta.save(tmp.path()).unwrap();

        let loaded = IndexMeta::load(tmp.path()).unwrap().unwrap();
        assert_eq!(loaded.total_rows, 1);
        assert_eq!(loaded.columns["STATUS"].distinct_count, 1);
        assert!(loaded.staleness(&source).is_none());

        // Truncating the source by one byte must flag staleness.
        let f = std::fs::OpenOptions::new().write(true).open(tmp.path()).unwrap();
        f.set_len(source.len() - 1).unwrap();
        let reopened = Source::open(tmp.path()).unwrap();
        assert!(loaded.staleness(&reopened).is_some());

        std::fs::remove_file(meta_path(tmp.path())).unwrap();
    }

    #[test]
    fn absent_meta_is_none() {
        assert!(IndexMeta::load(Path::new("/nonexistent.csv")).unwrap().is_none());
    }
}
