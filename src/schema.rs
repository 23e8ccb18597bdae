//! Schema sidecar (`<csv>_schema.json`).
//!
//! A flat mapping from virtual-column name to default value.  Virtual
//! columns are materialized by the client during hydration; the indexer and
//! executor never see them.  The engine only parses the file so clients have
//! one place to read it from.

use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{Error, Result};
use crate::meta::schema_path;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    pub virtual_columns: BTreeMap<String, Value>,
}

impl Schema {
    pub fn load(source_path: &Path) -> Result<Option<Self>> {
        let path = schema_path(source_path);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path)?;
        let virtual_columns = serde_json::from_slice(&bytes)
            .map_err(|e| Error::CorruptIndex(format!("schema parse: {e}")))?;
        Ok(Some(Self { virtual_columns }))
    }

    pub fn default_for(&self, column: &str) -> Option<&Value> {
        self.virtual_columns.get(column)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn loads_the_sidecar_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let csv = dir.path().join("data.csv");
        std::fs::write(&csv, "A\n1\n").unwrap();
        assert!(Schema::load(&csv).unwrap().is_none());

        let mut f = std::fs::File::create(schema_path(&csv)).unwrap();
        f.write_all(br#"{"REGION": "emea", "RETRIES": 0}"#).unwrap();
        drop(f);

        let schema = Schema::load(&csv).unwrap().unwrap();
        assert_eq!(schema.default_for("REGION"), Some(&Value::from("emea")));
        assert_eq!(schema.default_for("RETRIES"), Some(&Value::from(0)));
        assert_eq!(schema.default_for("MISSING"), None);
    }
}
