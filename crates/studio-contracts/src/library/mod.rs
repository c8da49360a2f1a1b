//! Persistent template, sample and reference lists plus the API credential.

mod items;
mod store;

use std::marker::PhantomData;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use serde_json::{json, Value};

pub use items::{ImageItem, LibraryItem, RefItem, SampleItem, TemplateItem};
pub use store::LocalStore;

pub const CREDENTIAL_KEY: &str = "GOOGLE_API_KEY";

/// A typed handle on one of the stored lists.
#[derive(Debug)]
pub struct Collection<T> {
    key: &'static str,
    label: &'static str,
    _item: PhantomData<fn() -> T>,
}

impl<T> Collection<T> {
    const fn new(key: &'static str, label: &'static str) -> Self {
        Self {
            key,
            label,
            _item: PhantomData,
        }
    }

    pub fn key(&self) -> &'static str {
        self.key
    }

    pub fn label(&self) -> &'static str {
        self.label
    }
}

impl<T> Clone for Collection<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Collection<T> {}

pub const TEMPLATES: Collection<TemplateItem> = Collection::new("TEMPLATES", "templates");
pub const SAMPLES: Collection<SampleItem> = Collection::new("SAMPLE_TEMPLATES", "samples");
pub const REFERENCES: Collection<RefItem> = Collection::new("ARTREF_TEMPLATES", "references");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub per_page: usize,
    pub total: usize,
    pub total_pages: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImportReport {
    pub imported: usize,
    pub skipped: usize,
    pub total: usize,
}

pub struct Library {
    store: LocalStore,
}

impl Library {
    /// Opens the store and seeds any well-known key that was never written.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let mut store = LocalStore::new(path);
        store.init(CREDENTIAL_KEY, Value::String(String::new()))?;
        store.init(TEMPLATES.key, default_templates())?;
        store.init(SAMPLES.key, Value::Array(Vec::new()))?;
        store.init(REFERENCES.key, Value::Array(Vec::new()))?;
        Ok(Self { store })
    }

    pub fn store_mut(&mut self) -> &mut LocalStore {
        &mut self.store
    }

    pub fn credential(&mut self) -> Option<String> {
        let value = self.store.get(CREDENTIAL_KEY)?;
        let key = match value {
            Value::String(text) => text,
            _ => return None,
        };
        let key = key.trim();
        (!key.is_empty()).then(|| key.to_string())
    }

    pub fn set_credential(&mut self, key: &str) -> Result<()> {
        self.store
            .set(CREDENTIAL_KEY, Value::String(key.trim().to_string()))
    }

    /// Stored entries that pass validation; malformed rows are dropped.
    pub fn list<T: LibraryItem>(&mut self, collection: Collection<T>) -> Vec<T> {
        let rows = match self.store.get(collection.key) {
            Some(Value::Array(rows)) => rows,
            _ => return Vec::new(),
        };
        rows.into_iter()
            .filter_map(|row| serde_json::from_value::<T>(row).ok())
            .filter(|item| item.is_valid())
            .collect()
    }

    pub fn get<T: LibraryItem>(&mut self, collection: Collection<T>, id: &str) -> Option<T> {
        self.list(collection)
            .into_iter()
            .find(|item| item.id() == id)
    }

    /// Replaces an entry with the same id in place, otherwise prepends it.
    pub fn upsert<T: LibraryItem>(&mut self, collection: Collection<T>, mut item: T) -> Result<T> {
        if !item.is_valid() {
            bail!("refusing to store malformed {} entry", collection.label);
        }
        item.touch(now_ms());
        let mut items = self.list(collection);
        match items.iter().position(|existing| existing.id() == item.id()) {
            Some(index) => items[index] = item.clone(),
            None => items.insert(0, item.clone()),
        }
        self.write_list(collection, &items)?;
        Ok(item)
    }

    pub fn remove<T: LibraryItem>(&mut self, collection: Collection<T>, id: &str) -> Result<bool> {
        let mut items = self.list(collection);
        let before = items.len();
        items.retain(|item| item.id() != id);
        if items.len() == before {
            return Ok(false);
        }
        self.write_list(collection, &items)?;
        Ok(true)
    }

    pub fn export<T: LibraryItem>(&mut self, collection: Collection<T>) -> Result<String> {
        let items = self.list(collection);
        serde_json::to_string_pretty(&items)
            .with_context(|| format!("failed to serialize {}", collection.label))
    }

    /// Merges a JSON array into the list. Rows sharing an identity with an
    /// existing entry replace it; the result is ordered newest first.
    pub fn import<T: LibraryItem>(
        &mut self,
        collection: Collection<T>,
        raw: &str,
    ) -> Result<ImportReport> {
        let parsed: Value = serde_json::from_str(raw)
            .with_context(|| format!("invalid {} import JSON", collection.label))?;
        let Value::Array(rows) = parsed else {
            bail!("{} import must be a JSON array", collection.label);
        };

        let mut merged: IndexMap<String, T> = IndexMap::new();
        for item in self.list(collection) {
            merged.insert(item.id().to_string(), item);
        }

        let now = now_ms();
        let mut report = ImportReport::default();
        for row in &rows {
            match T::from_loose(row, now) {
                Some((item, identity)) => {
                    merged.insert(identity, item);
                    report.imported += 1;
                }
                None => report.skipped += 1,
            }
        }

        let mut items: Vec<T> = merged.into_values().collect();
        items.sort_by(|left, right| right.created_at().cmp(&left.created_at()));
        report.total = items.len();
        self.write_list(collection, &items)?;
        Ok(report)
    }

    /// 1-based paging; out-of-range pages clamp to the nearest valid page.
    pub fn page<T: LibraryItem>(
        &mut self,
        collection: Collection<T>,
        page: usize,
        per_page: usize,
    ) -> Page<T> {
        let items = self.list(collection);
        let per_page = per_page.max(1);
        let total = items.len();
        let total_pages = total.div_ceil(per_page).max(1);
        let page = page.clamp(1, total_pages);
        let items = items
            .into_iter()
            .skip((page - 1) * per_page)
            .take(per_page)
            .collect();
        Page {
            items,
            page,
            per_page,
            total,
            total_pages,
        }
    }

    fn write_list<T: LibraryItem>(&mut self, collection: Collection<T>, items: &[T]) -> Result<()> {
        let value = serde_json::to_value(items)
            .with_context(|| format!("failed to serialize {}", collection.label))?;
        self.store.set(collection.key, value)
    }
}

fn default_templates() -> Value {
    json!([
        {
            "id": "tpl-tee-front",
            "name": "T-shirt front on wooden desk",
            "prompt": "Front view t-shirt mockup on rustic wooden desk, natural soft shadows, top-down angle, keep product shape, apply artwork, no border, photoreal, 1:1",
            "createdAt": 1_728_000_000_000i64
        },
        {
            "id": "tpl-tote",
            "name": "Tote bag lifestyle",
            "prompt": "Canvas tote bag in a minimal studio scene, soft daylight, subtle backdrop shadow, keep product shape, apply artwork, photoreal, 1:1",
            "createdAt": 1_728_100_000_000i64
        }
    ])
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const PIXEL: &str = "data:image/png;base64,iVBORw0KGgo=";

    fn open_temp() -> Result<(tempfile::TempDir, Library)> {
        let temp = tempfile::tempdir()?;
        let library = Library::open(temp.path().join("store.json"))?;
        Ok((temp, library))
    }

    #[test]
    fn open_seeds_defaults_once() -> Result<()> {
        let (temp, mut library) = open_temp()?;
        let templates = library.list(TEMPLATES);
        assert_eq!(templates.len(), 2);
        assert_eq!(templates[0].id, "tpl-tee-front");
        assert_eq!(library.credential(), None);
        assert!(library.list(SAMPLES).is_empty());

        library.remove(TEMPLATES, "tpl-tote")?;
        let mut reopened = Library::open(temp.path().join("store.json"))?;
        assert_eq!(reopened.list(TEMPLATES).len(), 1);
        Ok(())
    }

    #[test]
    fn credential_is_trimmed_and_blank_means_missing() -> Result<()> {
        let (_temp, mut library) = open_temp()?;
        library.set_credential("  abc  ")?;
        assert_eq!(library.credential().as_deref(), Some("abc"));
        library.set_credential(" ")?;
        assert_eq!(library.credential(), None);
        Ok(())
    }

    #[test]
    fn upsert_prepends_new_and_replaces_existing() -> Result<()> {
        let (_temp, mut library) = open_temp()?;
        let first = library.upsert(SAMPLES, ImageItem::new("towel", PIXEL, 1))?;
        let second = library.upsert(SAMPLES, ImageItem::new("mug", PIXEL, 2))?;
        let names: Vec<String> = library.list(SAMPLES).into_iter().map(|i| i.name).collect();
        assert_eq!(names, vec!["mug", "towel"]);

        let mut renamed = first.clone();
        renamed.name = "kitchen towel".to_string();
        library.upsert(SAMPLES, renamed)?;
        let items = library.list(SAMPLES);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, second.id);
        assert_eq!(items[1].name, "kitchen towel");
        Ok(())
    }

    #[test]
    fn upsert_rejects_malformed_image() -> Result<()> {
        let (_temp, mut library) = open_temp()?;
        let err = library
            .upsert(REFERENCES, ImageItem::new("bad", "not-a-data-url", 1))
            .err()
            .map(|err| err.to_string())
            .unwrap_or_default();
        assert_eq!(err, "refusing to store malformed references entry");
        assert!(library.list(REFERENCES).is_empty());
        Ok(())
    }

    #[test]
    fn list_drops_rows_without_valid_payload() -> Result<()> {
        let (_temp, mut library) = open_temp()?;
        library.store_mut().set(
            SAMPLES.key(),
            json!([
                {"id": "ok", "name": "a", "dataUrl": PIXEL, "createdAt": 1},
                {"id": "bad", "name": "b", "dataUrl": "", "createdAt": 1},
                {"name": "no id"}
            ]),
        )?;
        let ids: Vec<String> = library.list(SAMPLES).into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["ok"]);
        Ok(())
    }

    #[test]
    fn import_merges_by_identity_and_sorts_newest_first() -> Result<()> {
        let (_temp, mut library) = open_temp()?;
        let raw = json!([
            {"id": "tpl-tote", "name": "Tote v2", "prompt": "tote", "createdAt": 1_800_000_000_000i64},
            {"name": "Mug", "prompt": "mug on desk", "createdAt": 1_700_000_000_000i64},
            {"name": "Mug", "prompt": "mug on desk", "createdAt": 1_750_000_000_000i64},
            42
        ])
        .to_string();
        let report = library.import(TEMPLATES, &raw)?;
        assert_eq!(report.imported, 3);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.total, 3);

        let templates = library.list(TEMPLATES);
        let names: Vec<&str> = templates.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["Tote v2", "Mug", "T-shirt front on wooden desk"]);
        assert_eq!(templates[1].created_at, 1_750_000_000_000);
        Ok(())
    }

    #[test]
    fn import_rejects_non_array() -> Result<()> {
        let (_temp, mut library) = open_temp()?;
        assert!(library.import(TEMPLATES, "{\"id\": 1}").is_err());
        assert!(library.import(TEMPLATES, "nope").is_err());
        assert_eq!(library.list(TEMPLATES).len(), 2);
        Ok(())
    }

    #[test]
    fn export_then_import_into_fresh_store_keeps_entries() -> Result<()> {
        let (_temp, mut library) = open_temp()?;
        library.upsert(REFERENCES, ImageItem::new("floral", PIXEL, 1))?;
        let exported = library.export(REFERENCES)?;

        let (_other_temp, mut other) = open_temp()?;
        let report = other.import(REFERENCES, &exported)?;
        assert_eq!(report.total, 1);
        assert_eq!(other.list(REFERENCES)[0].name, "floral");
        Ok(())
    }

    #[test]
    fn paging_clamps_to_range() -> Result<()> {
        let (_temp, mut library) = open_temp()?;
        for idx in 0..5 {
            library.upsert(TEMPLATES, TemplateItem::new(&format!("t{idx}"), "p", 0))?;
        }
        let page = library.page(TEMPLATES, 3, 3);
        assert_eq!(page.total, 7);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.items.len(), 1);

        let clamped = library.page(TEMPLATES, 99, 3);
        assert_eq!(clamped.page, 3);
        let first = library.page(TEMPLATES, 0, 0);
        assert_eq!(first.page, 1);
        assert_eq!(first.per_page, 1);
        assert_eq!(first.items.len(), 1);

        let empty = library.page(SAMPLES, 1, 4);
        assert_eq!(empty.total_pages, 1);
        assert!(empty.items.is_empty());
        Ok(())
    }
}
