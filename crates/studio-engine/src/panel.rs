use std::collections::VecDeque;
use std::fmt;

use serde_json::json;
use studio_contracts::events::{self, EventWriter};
use studio_contracts::generation::{
    AspectRatio, EncodedImage, GenerationOutcome, GenerationRequest, JobKind,
};

use crate::batch::{BatchJob, CancelHandle, JobState};
use crate::error::{StudioError, StudioResult};
use crate::gallery::{Gallery, SaveReport, SaveSink};
use crate::normalize::{self, MAX_INPUT_EDGE};

pub const ARTWORK_COUNTS: [usize; 4] = [1, 2, 4, 8];
pub const TRAY_CAPACITY: usize = 2;

/// Small most-recent-wins image list (references, samples).
#[derive(Debug, Clone)]
pub struct ImageTray {
    images: VecDeque<EncodedImage>,
    capacity: usize,
}

impl ImageTray {
    pub fn new(capacity: usize) -> Self {
        Self {
            images: VecDeque::with_capacity(capacity + 1),
            capacity: capacity.max(1),
        }
    }

    /// Returns the evicted oldest image, if any.
    pub fn push(&mut self, image: EncodedImage) -> Option<EncodedImage> {
        self.images.push_back(image);
        if self.images.len() > self.capacity {
            return self.images.pop_front();
        }
        None
    }

    pub fn images(&self) -> Vec<EncodedImage> {
        self.images.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn clear(&mut self) {
        self.images.clear();
    }
}

#[derive(Debug, Clone)]
pub struct ArtworkSettings {
    pub prompt: String,
    pub count: usize,
    pub aspect_ratio: AspectRatio,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct MockupSettings {
    /// One prompt per non-blank line.
    pub prompts_text: String,
    pub repeat: usize,
    pub model: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Ok,
    Err,
    Info,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessage {
    pub kind: StatusKind,
    pub text: String,
}

impl StatusMessage {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            kind: StatusKind::Ok,
            text: text.into(),
        }
    }

    pub fn err(text: impl Into<String>) -> Self {
        Self {
            kind: StatusKind::Err,
            text: text.into(),
        }
    }

    pub fn info(text: impl Into<String>) -> Self {
        Self {
            kind: StatusKind::Info,
            text: text.into(),
        }
    }
}

impl fmt::Display for StatusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

#[derive(Debug, Clone)]
struct JobSlot {
    job_id: String,
    cancel: CancelHandle,
    /// Outcomes already folded into the view.
    recorded: usize,
}

/// Owns everything the user sees: two job slots, the artwork previews, the
/// applied artwork, the reference/sample trays and the mockup gallery.
///
/// Jobs are prepared here and run elsewhere. Each outcome is folded back in
/// with [`Panel::record_item`] as it lands, and [`Panel::complete_job`]
/// closes the job out.
#[derive(Debug)]
pub struct Panel {
    artwork_slot: Option<JobSlot>,
    mockup_slot: Option<JobSlot>,
    references: ImageTray,
    samples: ImageTray,
    previews: Vec<EncodedImage>,
    preview_cursor: usize,
    applied_artwork: Option<EncodedImage>,
    gallery: Gallery,
    events: EventWriter,
}

impl Default for Panel {
    fn default() -> Self {
        Self::new(EventWriter::disabled())
    }
}

impl Panel {
    pub fn new(events: EventWriter) -> Self {
        Self {
            artwork_slot: None,
            mockup_slot: None,
            references: ImageTray::new(TRAY_CAPACITY),
            samples: ImageTray::new(TRAY_CAPACITY),
            previews: Vec::new(),
            preview_cursor: 0,
            applied_artwork: None,
            gallery: Gallery::new().with_events(events.clone()),
            events,
        }
    }

    pub fn events(&self) -> &EventWriter {
        &self.events
    }

    pub fn references(&self) -> &ImageTray {
        &self.references
    }

    pub fn samples(&self) -> &ImageTray {
        &self.samples
    }

    pub fn previews(&self) -> &[EncodedImage] {
        &self.previews
    }

    pub fn preview_cursor(&self) -> usize {
        self.preview_cursor
    }

    pub fn current_preview(&self) -> Option<&EncodedImage> {
        self.previews.get(self.preview_cursor)
    }

    pub fn applied_artwork(&self) -> Option<&EncodedImage> {
        self.applied_artwork.as_ref()
    }

    pub fn gallery(&self) -> &Gallery {
        &self.gallery
    }

    pub fn is_running(&self, kind: JobKind) -> bool {
        self.slot(kind).is_some()
    }

    /// Square-pads to the input cap; a decode failure is reported right away.
    pub fn add_reference(&mut self, image: &EncodedImage) -> StudioResult<()> {
        let padded = normalize::pad_to_square(image, MAX_INPUT_EDGE, None)?;
        let evicted = self.references.push(padded).is_some();
        self.emit_tray(events::REFERENCE_ADDED, self.references.len(), evicted);
        Ok(())
    }

    pub fn add_sample(&mut self, image: &EncodedImage) -> StudioResult<()> {
        let padded = normalize::pad_to_square(image, MAX_INPUT_EDGE, None)?;
        let evicted = self.samples.push(padded).is_some();
        self.emit_tray(events::SAMPLE_ADDED, self.samples.len(), evicted);
        Ok(())
    }

    pub fn clear_references(&mut self) {
        self.references.clear();
    }

    pub fn clear_samples(&mut self) {
        self.samples.clear();
    }

    pub fn next_preview(&mut self) -> Option<usize> {
        self.slide(1)
    }

    pub fn prev_preview(&mut self) -> Option<usize> {
        self.slide(-1)
    }

    /// Applies the preview under the cursor, else keeps the current artwork.
    /// Returns `false` when there is nothing to apply.
    pub fn apply_artwork(&mut self) -> bool {
        let Some(candidate) = self
            .current_preview()
            .or(self.applied_artwork.as_ref())
            .cloned()
        else {
            return false;
        };
        self.set_artwork(candidate, "preview");
        true
    }

    /// Uses an externally supplied image as the applied artwork.
    pub fn use_artwork(&mut self, image: EncodedImage) {
        self.set_artwork(image, "file");
    }

    pub fn prepare_artwork(&mut self, settings: &ArtworkSettings) -> StudioResult<BatchJob> {
        let prompt = settings.prompt.trim();
        if prompt.is_empty() {
            return Err(StudioError::Validation(
                "Enter artwork prompt first.".to_string(),
            ));
        }
        if !ARTWORK_COUNTS.contains(&settings.count) {
            return Err(StudioError::Validation(format!(
                "Artwork count must be one of 1, 2, 4 or 8 (got {}).",
                settings.count
            )));
        }
        self.ensure_free(JobKind::Artwork)?;
        self.previews.clear();
        self.preview_cursor = 0;

        let references = self.references.images();
        let requests = (0..settings.count)
            .map(|_| {
                GenerationRequest::new(
                    prompt,
                    references.clone(),
                    settings.aspect_ratio,
                    settings.model.as_str(),
                )
            })
            .collect();
        Ok(self.occupy(BatchJob::new(JobKind::Artwork, requests)))
    }

    /// Samples and artwork are downscaled once and shared by every request.
    pub fn prepare_mockup(&mut self, settings: &MockupSettings) -> StudioResult<BatchJob> {
        let prompts: Vec<&str> = settings
            .prompts_text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();
        if prompts.is_empty() {
            return Err(StudioError::Validation("Enter a mockup prompt.".to_string()));
        }
        let Some(artwork) = self.applied_artwork.as_ref() else {
            return Err(StudioError::Validation(
                "No artwork selected/applied.".to_string(),
            ));
        };
        self.ensure_free(JobKind::Mockup)?;

        let mut images = Vec::with_capacity(self.samples.len() + 1);
        for sample in self.samples.images() {
            images.push(normalize::downscale(&sample, MAX_INPUT_EDGE)?);
        }
        images.push(normalize::downscale(artwork, MAX_INPUT_EDGE)?);

        let repeat = settings.repeat.max(1);
        let mut requests = Vec::with_capacity(prompts.len() * repeat);
        for prompt in prompts {
            for _ in 0..repeat {
                requests.push(GenerationRequest::new(
                    prompt,
                    images.clone(),
                    AspectRatio::Square,
                    settings.model.as_str(),
                ));
            }
        }
        self.gallery.clear();
        Ok(self.occupy(BatchJob::new(JobKind::Mockup, requests)))
    }

    /// Folds one outcome of a running job into the previews or the gallery.
    /// Returns `false` for a job that no longer owns its slot or an index
    /// that is not the next one expected.
    pub fn record_item(
        &mut self,
        kind: JobKind,
        job_id: &str,
        index: usize,
        outcome: &GenerationOutcome,
    ) -> bool {
        let Some(slot) = self.slot_mut(kind).as_mut() else {
            return false;
        };
        if slot.job_id != job_id || slot.recorded != index {
            return false;
        }
        slot.recorded += 1;
        self.fold_outcome(kind, index, outcome);
        true
    }

    /// Folds in any outcomes not yet recorded, frees the slot and reports.
    pub fn complete_job(&mut self, job: &BatchJob) -> StatusMessage {
        let kind = job.kind();
        let recorded = match self.slot_mut(kind).take() {
            Some(slot) if slot.job_id == job.id() => Some(slot.recorded),
            other => {
                *self.slot_mut(kind) = other;
                None
            }
        };
        if let Some(recorded) = recorded {
            for (index, outcome) in job.results().iter().enumerate().skip(recorded) {
                self.fold_outcome(kind, index, outcome);
            }
        }

        let (done, total) = job.progress();
        let failures = job.failures();
        let cancelled = job.state() == JobState::Cancelled;

        let mut message = match kind {
            JobKind::Artwork => {
                if cancelled {
                    StatusMessage::err(format!("Canceled at {done}/{total}."))
                } else {
                    StatusMessage::ok(format!("Generated {} preview(s).", self.previews.len()))
                }
            }
            JobKind::Mockup => {
                if cancelled {
                    StatusMessage::err(format!("Canceled at {done}/{total}."))
                } else {
                    StatusMessage::ok(format!("Done! {total} request(s) finished."))
                }
            }
        };
        if failures > 0 {
            message.text.push_str(&format!(" {failures} failed."));
            if message.kind == StatusKind::Ok && failures == done {
                message.kind = StatusKind::Err;
            }
        }
        message
    }

    /// Frees a slot whose job was lost before it could be completed.
    pub fn release(&mut self, kind: JobKind) {
        *self.slot_mut(kind) = None;
    }

    /// Returns `false` when no job of that kind is active.
    pub fn cancel(&self, kind: JobKind) -> bool {
        match self.slot(kind) {
            Some(slot) => {
                slot.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn view(&self, index: usize) -> Option<&EncodedImage> {
        self.gallery.open_viewer(index)
    }

    pub fn save(
        &self,
        index: usize,
        upscale: bool,
        sku: Option<&str>,
        sink: &dyn SaveSink,
    ) -> StudioResult<String> {
        self.gallery.save(index, upscale, sku, sink)
    }

    pub fn save_all(&self, sku: &str, upscale: bool, sink: &dyn SaveSink) -> StudioResult<SaveReport> {
        self.gallery
            .save_all(sku, self.applied_artwork.as_ref(), upscale, sink)
    }

    fn fold_outcome(&mut self, kind: JobKind, index: usize, outcome: &GenerationOutcome) {
        match kind {
            JobKind::Artwork => {
                if let Some(image) = outcome.image() {
                    self.previews.push(image.clone());
                }
            }
            JobKind::Mockup => {
                self.gallery.record(index, outcome);
            }
        }
    }

    fn slide(&mut self, step: isize) -> Option<usize> {
        let n = self.previews.len();
        if n < 2 {
            return None;
        }
        let next = (self.preview_cursor as isize + step).rem_euclid(n as isize);
        self.preview_cursor = next as usize;
        Some(self.preview_cursor)
    }

    fn set_artwork(&mut self, image: EncodedImage, source: &str) {
        self.events.emit_lossy(
            events::ARTWORK_APPLIED,
            events::payload(json!({
                "source": source,
                "bytes": image.len(),
                "digest": image.digest(),
            })),
        );
        self.applied_artwork = Some(image);
    }

    fn emit_tray(&self, event_type: &str, count: usize, evicted: bool) {
        self.events.emit_lossy(
            event_type,
            events::payload(json!({ "count": count, "evicted": evicted })),
        );
    }

    fn ensure_free(&self, kind: JobKind) -> StudioResult<()> {
        match self.slot(kind) {
            Some(slot) => Err(StudioError::Validation(format!(
                "An {kind} job is already running ({}).",
                slot.job_id
            ))),
            None => Ok(()),
        }
    }

    fn occupy(&mut self, job: BatchJob) -> BatchJob {
        let job = job.with_events(self.events.clone());
        *self.slot_mut(job.kind()) = Some(JobSlot {
            job_id: job.id().to_string(),
            cancel: job.cancel_handle(),
            recorded: 0,
        });
        job
    }

    fn slot(&self, kind: JobKind) -> Option<&JobSlot> {
        match kind {
            JobKind::Artwork => self.artwork_slot.as_ref(),
            JobKind::Mockup => self.mockup_slot.as_ref(),
        }
    }

    fn slot_mut(&mut self, kind: JobKind) -> &mut Option<JobSlot> {
        match kind {
            JobKind::Artwork => &mut self.artwork_slot,
            JobKind::Mockup => &mut self.mockup_slot,
        }
    }
}
