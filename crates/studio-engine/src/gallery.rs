use std::fs;
use std::path::{Component, Path, PathBuf};

use serde_json::json;
use studio_contracts::events::{self, EventWriter};
use studio_contracts::generation::{EncodedImage, GenerationOutcome};

use crate::error::{StudioError, StudioResult};
use crate::normalize;

const DEFAULT_SKU: &str = "SKU";

/// Download collaborator. Filenames may carry a `dir/` prefix.
pub trait SaveSink {
    fn save(&self, bytes: &[u8], filename: &str) -> StudioResult<()>;
}

/// Writes under a root directory; refuses paths that escape it.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    root: PathBuf,
}

impl DirectorySink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl SaveSink for DirectorySink {
    fn save(&self, bytes: &[u8], filename: &str) -> StudioResult<()> {
        let relative = Path::new(filename);
        let escapes = relative
            .components()
            .any(|part| !matches!(part, Component::Normal(_)));
        if filename.trim().is_empty() || escapes {
            return Err(StudioError::Save(format!("Refusing to write '{filename}'.")));
        }
        let target = self.root.join(relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                StudioError::Save(format!("Could not create {}: {err}", parent.display()))
            })?;
        }
        fs::write(&target, bytes)
            .map_err(|err| StudioError::Save(format!("Could not write {}: {err}", target.display())))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GalleryEntry {
    pub index: usize,
    pub image: EncodedImage,
}

#[derive(Debug, Default)]
pub struct SaveReport {
    pub saved: Vec<String>,
    pub failed: Vec<(String, StudioError)>,
}

impl SaveReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Successful mockup outputs, each tagged with the request index that made it.
#[derive(Debug, Default)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
    events: Option<EventWriter>,
}

impl Gallery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Failures leave no entry.
    pub fn record(&mut self, index: usize, outcome: &GenerationOutcome) -> bool {
        let Some(image) = outcome.image() else {
            return false;
        };
        self.entries.push(GalleryEntry {
            index,
            image: image.clone(),
        });
        true
    }

    pub fn open_viewer(&self, index: usize) -> Option<&EncodedImage> {
        self.entry(index).map(|entry| &entry.image)
    }

    /// Saves the entry produced at request `index` as `{sku}-{index}.png`.
    pub fn save(
        &self,
        index: usize,
        upscale: bool,
        sku: Option<&str>,
        sink: &dyn SaveSink,
    ) -> StudioResult<String> {
        let entry = self
            .entry(index)
            .ok_or_else(|| StudioError::Validation(format!("No image at index {index}.")))?;
        let prefix = sanitize_path(sku.unwrap_or_default());
        let filename = format!("{prefix}-{index}.png");
        self.write(&entry.image, upscale, &filename, sink)?;
        Ok(filename)
    }

    /// Writes `{sku}/{sku}.png` for the artwork, then `{sku}/{sku}-{n}.png`
    /// per entry in gallery order. Stops nothing on a failed item and rolls
    /// nothing back.
    pub fn save_all(
        &self,
        sku: &str,
        artwork: Option<&EncodedImage>,
        upscale: bool,
        sink: &dyn SaveSink,
    ) -> StudioResult<SaveReport> {
        if sku.trim().is_empty() {
            return Err(StudioError::Validation("Enter SKU first.".to_string()));
        }
        if artwork.is_none() && self.entries.is_empty() {
            return Err(StudioError::Validation("Nothing to save.".to_string()));
        }
        let dir = sanitize_path(sku);
        let mut report = SaveReport::default();

        if let Some(artwork) = artwork {
            let filename = format!("{dir}/{dir}.png");
            match self.write(artwork, false, &filename, sink) {
                Ok(()) => report.saved.push(filename),
                Err(err) => report.failed.push((filename, err)),
            }
        }
        for (n, entry) in self.entries.iter().enumerate() {
            let filename = format!("{dir}/{dir}-{}.png", n + 1);
            match self.write(&entry.image, upscale, &filename, sink) {
                Ok(()) => report.saved.push(filename),
                Err(err) => report.failed.push((filename, err)),
            }
        }
        Ok(report)
    }

    fn entry(&self, index: usize) -> Option<&GalleryEntry> {
        self.entries.iter().find(|entry| entry.index == index)
    }

    fn write(
        &self,
        image: &EncodedImage,
        upscale: bool,
        filename: &str,
        sink: &dyn SaveSink,
    ) -> StudioResult<()> {
        let output = if upscale {
            normalize::upscale_2x(image)?
        } else {
            image.clone()
        };
        sink.save(output.bytes(), filename)?;
        if let Some(events) = &self.events {
            events.emit_lossy(
                events::IMAGE_SAVED,
                events::payload(json!({
                    "filename": filename,
                    "bytes": output.len(),
                    "upscaled": upscale,
                })),
            );
        }
        Ok(())
    }
}

/// Replaces runs of `\ : ? * " < > |` with `-`; blank becomes `SKU`.
pub fn sanitize_path(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_run = false;
    for ch in raw.trim().chars() {
        if matches!(ch, '\\' | ':' | '?' | '*' | '"' | '<' | '>' | '|') {
            if !in_run {
                out.push('-');
            }
            in_run = true;
        } else {
            out.push(ch);
            in_run = false;
        }
    }
    let trimmed = out.trim();
    if trimmed.is_empty() {
        DEFAULT_SKU.to_string()
    } else {
        trimmed.to_string()
    }
}
