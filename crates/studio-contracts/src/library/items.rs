use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::generation::is_image_data_url;

/// Common behaviour of the stored lists.
pub trait LibraryItem: Clone + Serialize + for<'de> Deserialize<'de> {
    fn id(&self) -> &str;
    fn created_at(&self) -> i64;
    fn touch(&mut self, created_at: i64);
    fn is_valid(&self) -> bool;

    /// Builds an item from a loosely shaped import row, filling defaults.
    /// Returns the item and the identity used to merge it.
    fn from_loose(row: &Value, now_ms: i64) -> Option<(Self, String)>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateItem {
    pub id: String,
    pub name: String,
    pub prompt: String,
    pub created_at: i64,
}

impl TemplateItem {
    pub fn new(name: &str, prompt: &str, created_at: i64) -> Self {
        Self {
            id: new_id(),
            name: non_empty_or(name, "Untitled"),
            prompt: prompt.trim().to_string(),
            created_at,
        }
    }
}

impl LibraryItem for TemplateItem {
    fn id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> i64 {
        self.created_at
    }

    fn touch(&mut self, created_at: i64) {
        self.created_at = created_at;
    }

    fn is_valid(&self) -> bool {
        !self.id.trim().is_empty()
    }

    fn from_loose(row: &Value, now_ms: i64) -> Option<(Self, String)> {
        let obj = row.as_object()?;
        let explicit_id = string_field(row, "id");
        let name = non_empty_or(&string_field(row, "name").unwrap_or_default(), "Untitled");
        let prompt = obj
            .get("prompt")
            .map(|value| match value {
                Value::String(text) => text.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            })
            .unwrap_or_default();
        let identity = explicit_id
            .clone()
            .unwrap_or_else(|| format!("{name}|{prompt}"));
        let item = Self {
            id: explicit_id.unwrap_or_else(new_id),
            name,
            prompt,
            created_at: created_at_field(row).unwrap_or(now_ms),
        };
        Some((item, identity))
    }
}

/// A stored image: product sample or artwork reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageItem {
    pub id: String,
    pub name: String,
    pub data_url: String,
    pub created_at: i64,
}

pub type SampleItem = ImageItem;
pub type RefItem = ImageItem;

impl ImageItem {
    pub fn new(name: &str, data_url: &str, created_at: i64) -> Self {
        Self {
            id: new_id(),
            name: non_empty_or(name, "Untitled"),
            data_url: data_url.trim().to_string(),
            created_at,
        }
    }
}

impl LibraryItem for ImageItem {
    fn id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> i64 {
        self.created_at
    }

    fn touch(&mut self, created_at: i64) {
        self.created_at = created_at;
    }

    fn is_valid(&self) -> bool {
        !self.id.trim().is_empty() && is_image_data_url(&self.data_url)
    }

    fn from_loose(row: &Value, now_ms: i64) -> Option<(Self, String)> {
        row.as_object()?;
        let data_url = string_field(row, "dataUrl")?;
        if !is_image_data_url(&data_url) {
            return None;
        }
        let explicit_id = string_field(row, "id");
        let name = non_empty_or(&string_field(row, "name").unwrap_or_default(), "Untitled");
        let identity = explicit_id
            .clone()
            .unwrap_or_else(|| format!("{name}|{data_url}"));
        let item = Self {
            id: explicit_id.unwrap_or_else(new_id),
            name,
            data_url,
            created_at: created_at_field(row).unwrap_or(now_ms),
        };
        Some((item, identity))
    }
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

fn string_field(row: &Value, key: &str) -> Option<String> {
    row.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn created_at_field(row: &Value) -> Option<i64> {
    let value = row.get("createdAt")?;
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|raw| raw as i64))
        .filter(|value| *value > 0)
}
