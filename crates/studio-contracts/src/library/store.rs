use std::path::{Path, PathBuf};

use anyhow::Context;
use serde_json::{Map, Value};

/// Key/value store persisted as one JSON object on disk.
///
/// Reads refresh from disk so two stores on the same file observe each
/// other's writes; writes touch only the key being changed.
#[derive(Debug, Clone)]
pub struct LocalStore {
    path: PathBuf,
    payload: Map<String, Value>,
}

impl LocalStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            payload: Map::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&mut self, key: &str) -> Option<Value> {
        self.refresh();
        self.payload.get(key).cloned()
    }

    pub fn contains(&mut self, key: &str) -> bool {
        self.refresh();
        self.payload.contains_key(key)
    }

    pub fn set(&mut self, key: &str, value: Value) -> anyhow::Result<()> {
        self.write_key(key, Some(value))
    }

    pub fn remove(&mut self, key: &str) -> anyhow::Result<bool> {
        let existed = self.contains(key);
        if existed {
            self.write_key(key, None)?;
        }
        Ok(existed)
    }

    /// Writes `value` only when `key` has never been stored.
    pub fn init(&mut self, key: &str, value: Value) -> anyhow::Result<bool> {
        if self.contains(key) {
            return Ok(false);
        }
        self.write_key(key, Some(value))?;
        Ok(true)
    }

    fn refresh(&mut self) {
        self.payload = read_json_object(&self.path).unwrap_or_default();
    }

    fn write_key(&mut self, key: &str, value: Option<Value>) -> anyhow::Result<()> {
        let mut on_disk = read_json_object(&self.path).unwrap_or_default();
        match value {
            Some(value) => {
                on_disk.insert(key.to_string(), value);
            }
            None => {
                on_disk.remove(key);
            }
        }
        write_json_object(&self.path, &on_disk)
            .with_context(|| format!("failed to write store {}", self.path.display()))?;
        self.payload = on_disk;
        Ok(())
    }
}

fn read_json_object(path: &Path) -> Option<Map<String, Value>> {
    let raw = std::fs::read_to_string(path).ok()?;
    let parsed: Value = serde_json::from_str(&raw).ok()?;
    match parsed {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

fn write_json_object(path: &Path, payload: &Map<String, Value>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(payload)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::LocalStore;

    #[test]
    fn set_get_remove_round_trip() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut store = LocalStore::new(temp.path().join("store.json"));
        assert_eq!(store.get("GOOGLE_API_KEY"), None);

        store.set("GOOGLE_API_KEY", json!("k-1"))?;
        assert_eq!(store.get("GOOGLE_API_KEY"), Some(json!("k-1")));

        assert!(store.remove("GOOGLE_API_KEY")?);
        assert!(!store.remove("GOOGLE_API_KEY")?);
        assert_eq!(store.get("GOOGLE_API_KEY"), None);
        Ok(())
    }

    #[test]
    fn writers_on_the_same_file_merge() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("store.json");
        let mut first = LocalStore::new(&path);
        let mut second = LocalStore::new(&path);

        first.set("a", json!(1))?;
        second.set("b", json!(2))?;
        first.remove("a")?;

        let mut reloaded = LocalStore::new(path);
        assert_eq!(reloaded.get("a"), None);
        assert_eq!(reloaded.get("b"), Some(json!(2)));
        Ok(())
    }

    #[test]
    fn init_never_overwrites() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut store = LocalStore::new(temp.path().join("store.json"));
        assert!(store.init("TEMPLATES", json!([]))?);
        store.set("TEMPLATES", json!([{"id": "t"}]))?;
        assert!(!store.init("TEMPLATES", json!([]))?);
        assert_eq!(store.get("TEMPLATES"), Some(json!([{"id": "t"}])));
        Ok(())
    }

    #[test]
    fn corrupt_file_reads_as_empty() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("store.json");
        std::fs::write(&path, "not json")?;
        let mut store = LocalStore::new(&path);
        assert_eq!(store.get("anything"), None);
        store.set("k", json!(true))?;
        assert_eq!(store.get("k"), Some(json!(true)));
        Ok(())
    }
}
