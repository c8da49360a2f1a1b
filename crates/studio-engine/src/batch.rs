use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use sha2::{Digest, Sha256};
use studio_contracts::events::{self, EventWriter};
use studio_contracts::generation::{GenerationOutcome, GenerationRequest, JobKind};

use crate::client::ImageGenerator;
use crate::error::{StudioError, StudioResult};

/// Shared cancellation flag. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Running,
    Completed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

/// Hooks invoked between items, before the next dispatch.
pub trait BatchObserver {
    fn on_item(&mut self, _index: usize, _outcome: &GenerationOutcome) {}
    fn on_progress(&mut self, _completed: usize, _total: usize) {}
    fn on_finished(&mut self, _state: JobState) {}
}

impl BatchObserver for () {}

/// One ordered run of requests sharing a cancel flag and a progress counter.
///
/// Requests go out one at a time in order. `results.len() == cursor` holds
/// after every step. The cancel flag is only consulted before a dispatch, so
/// an in-flight request always gets its outcome recorded.
#[derive(Debug)]
pub struct BatchJob {
    id: String,
    kind: JobKind,
    requests: Vec<GenerationRequest>,
    results: Vec<GenerationOutcome>,
    cursor: usize,
    cancel: CancelHandle,
    state: JobState,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
    events: EventWriter,
}

impl BatchJob {
    pub fn new(kind: JobKind, requests: Vec<GenerationRequest>) -> Self {
        Self {
            id: job_id(kind),
            kind,
            requests,
            results: Vec::new(),
            cursor: 0,
            cancel: CancelHandle::new(),
            state: JobState::Idle,
            started_at: None,
            finished_at: None,
            events: EventWriter::disabled(),
        }
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = events;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn requests(&self) -> &[GenerationRequest] {
        &self.requests
    }

    pub fn results(&self) -> &[GenerationOutcome] {
        &self.results
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn total(&self) -> usize {
        self.requests.len()
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn progress(&self) -> (usize, usize) {
        (self.results.len(), self.requests.len())
    }

    pub fn failures(&self) -> usize {
        self.results
            .iter()
            .filter(|outcome| !outcome.is_success())
            .count()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Idempotent. A finished job keeps its terminal state.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Display only; frozen once the job is terminal.
    pub fn elapsed(&self) -> Duration {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => end.duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }

    pub fn start(&mut self) -> StudioResult<()> {
        if self.state != JobState::Idle {
            return Err(StudioError::Validation(format!(
                "{} job {} already {}.",
                self.kind,
                self.id,
                self.state.as_str()
            )));
        }
        self.state = JobState::Running;
        self.started_at = Some(Instant::now());
        self.events.emit_lossy(
            events::JOB_STARTED,
            events::payload(json!({
                "kind": self.kind.as_str(),
                "job_id": self.id,
                "total": self.requests.len(),
            })),
        );
        Ok(())
    }

    /// Dispatches at most one request. Returns the recorded index, or `None`
    /// once the job is terminal.
    pub fn step(
        &mut self,
        generator: &dyn ImageGenerator,
        observer: &mut dyn BatchObserver,
    ) -> Option<usize> {
        match self.state {
            JobState::Completed | JobState::Cancelled => return None,
            JobState::Idle => {
                self.start().ok()?;
            }
            JobState::Running => {}
        }

        if self.cursor >= self.requests.len() {
            self.finish(JobState::Completed, observer);
            return None;
        }
        if self.cancel.is_cancelled() {
            self.finish(JobState::Cancelled, observer);
            return None;
        }

        let index = self.cursor;
        let outcome = generator.generate(&self.requests[index]);
        self.record(index, &outcome);
        self.results.push(outcome);
        self.cursor += 1;

        observer.on_item(index, &self.results[index]);
        observer.on_progress(self.cursor, self.requests.len());

        // Cancelling during the last dispatch preempts nothing.
        if self.cursor == self.requests.len() {
            self.finish(JobState::Completed, observer);
        }
        Some(index)
    }

    pub fn run(
        &mut self,
        generator: &dyn ImageGenerator,
        observer: &mut dyn BatchObserver,
    ) -> JobState {
        // Empty batches and pre-cancelled jobs finish inside the first step.
        while self.step(generator, observer).is_some() {}
        self.state
    }

    fn record(&self, index: usize, outcome: &GenerationOutcome) {
        let detail = match outcome {
            GenerationOutcome::Success { image } => json!({
                "ok": true,
                "bytes": image.len(),
                "mime_type": image.mime_type(),
                "digest": image.digest(),
            }),
            GenerationOutcome::Failure { message } => json!({
                "ok": false,
                "message": message,
            }),
        };
        let mut payload = events::payload(json!({
            "kind": self.kind.as_str(),
            "job_id": self.id,
            "index": index,
        }));
        payload.extend(events::payload(detail));
        self.events.emit_lossy(events::ITEM_RECORDED, payload);
    }

    fn finish(&mut self, state: JobState, observer: &mut dyn BatchObserver) {
        self.state = state;
        self.finished_at = Some(Instant::now());
        self.events.emit_lossy(
            events::JOB_FINISHED,
            events::payload(json!({
                "kind": self.kind.as_str(),
                "job_id": self.id,
                "state": state.as_str(),
                "completed": self.results.len(),
                "failures": self.failures(),
                "total": self.requests.len(),
                "elapsed_ms": self.elapsed().as_millis() as u64,
            })),
        );
        observer.on_finished(state);
    }
}

fn job_id(kind: JobKind) -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(seq.to_be_bytes());
    hasher.update(
        chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default()
            .to_be_bytes(),
    );
    format!("{}-{}", kind.as_str(), hex::encode(&hasher.finalize()[..4]))
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    use serde_json::Value;
    use studio_contracts::generation::{AspectRatio, EncodedImage};

    use super::*;

    /// Succeeds with the prompt bytes unless the prompt is listed as failing.
    /// Optionally trips a cancel handle while serving a given call.
    #[derive(Default)]
    pub(crate) struct ScriptedGenerator {
        pub failing: BTreeSet<String>,
        pub cancel_on_call: Option<(usize, CancelHandle)>,
        pub calls: Mutex<Vec<GenerationRequest>>,
    }

    impl ScriptedGenerator {
        pub fn dispatched(&self) -> Vec<String> {
            self.calls
                .lock()
                .map(|calls| calls.iter().map(|req| req.prompt().to_string()).collect())
                .unwrap_or_default()
        }
    }

    impl ImageGenerator for ScriptedGenerator {
        fn name(&self) -> &str {
            "scripted"
        }

        fn generate(&self, request: &GenerationRequest) -> GenerationOutcome {
            let call_index = match self.calls.lock() {
                Ok(mut calls) => {
                    calls.push(request.clone());
                    calls.len() - 1
                }
                Err(_) => return GenerationOutcome::failure("poisoned"),
            };
            if let Some((at, handle)) = &self.cancel_on_call {
                if *at == call_index {
                    handle.cancel();
                }
            }
            if self.failing.contains(request.prompt()) {
                return GenerationOutcome::failure(format!("boom {}", request.prompt()));
            }
            GenerationOutcome::Success {
                image: EncodedImage::png(request.prompt().as_bytes().to_vec()),
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        items: Vec<usize>,
        progress: Vec<(usize, usize)>,
        finished: Vec<JobState>,
    }

    impl BatchObserver for Recorder {
        fn on_item(&mut self, index: usize, _outcome: &GenerationOutcome) {
            self.items.push(index);
        }

        fn on_progress(&mut self, completed: usize, total: usize) {
            self.progress.push((completed, total));
        }

        fn on_finished(&mut self, state: JobState) {
            self.finished.push(state);
        }
    }

    fn prompts(n: usize) -> Vec<GenerationRequest> {
        (0..n)
            .map(|i| GenerationRequest::new(format!("p{i}"), Vec::new(), AspectRatio::Square, "m"))
            .collect()
    }

    #[test]
    fn completed_job_has_one_outcome_per_request_in_order() {
        for n in 0..6 {
            let generator = ScriptedGenerator::default();
            let mut job = BatchJob::new(JobKind::Artwork, prompts(n));
            assert_eq!(job.run(&generator, &mut ()), JobState::Completed);
            assert_eq!(job.results().len(), n);
            assert_eq!(job.cursor(), n);
            let expected: Vec<String> = (0..n).map(|i| format!("p{i}")).collect();
            assert_eq!(generator.dispatched(), expected);
            for (i, outcome) in job.results().iter().enumerate() {
                let bytes = outcome.image().map(|image| image.bytes().to_vec());
                assert_eq!(bytes, Some(format!("p{i}").into_bytes()));
            }
        }
    }

    #[test]
    fn failures_are_recorded_without_halting() {
        let generator = ScriptedGenerator {
            failing: ["p1".to_string()].into_iter().collect(),
            ..ScriptedGenerator::default()
        };
        let mut job = BatchJob::new(JobKind::Mockup, prompts(3));
        assert_eq!(job.run(&generator, &mut ()), JobState::Completed);
        assert_eq!(job.results().len(), 3);
        assert_eq!(job.results()[1].failure_message(), Some("boom p1"));
        assert!(job.results()[2].is_success());
        assert_eq!(job.failures(), 1);
    }

    #[test]
    fn cancel_before_start_dispatches_nothing() {
        let generator = ScriptedGenerator::default();
        let mut job = BatchJob::new(JobKind::Artwork, prompts(3));
        job.cancel();
        job.cancel();
        assert_eq!(job.run(&generator, &mut ()), JobState::Cancelled);
        assert!(job.results().is_empty());
        assert!(generator.dispatched().is_empty());
    }

    #[test]
    fn cancel_while_in_flight_keeps_that_outcome_and_stops() {
        for k in 0..3 {
            let mut job = BatchJob::new(JobKind::Artwork, prompts(4));
            let generator = ScriptedGenerator {
                cancel_on_call: Some((k, job.cancel_handle())),
                ..ScriptedGenerator::default()
            };
            assert_eq!(job.run(&generator, &mut ()), JobState::Cancelled);
            assert_eq!(job.results().len(), k + 1);
            assert_eq!(generator.dispatched().len(), k + 1);
            assert!(job.results().iter().all(GenerationOutcome::is_success));
        }
    }

    #[test]
    fn cancel_during_last_dispatch_still_completes() {
        let mut job = BatchJob::new(JobKind::Mockup, prompts(2));
        let generator = ScriptedGenerator {
            cancel_on_call: Some((1, job.cancel_handle())),
            ..ScriptedGenerator::default()
        };
        assert_eq!(job.run(&generator, &mut ()), JobState::Completed);
        assert_eq!(job.results().len(), 2);

        job.cancel();
        assert_eq!(job.state(), JobState::Completed);
        assert_eq!(job.step(&generator, &mut ()), None);
    }

    #[test]
    fn red_circle_scenario_dispatches_two_square_requests() {
        let requests = (0..2)
            .map(|_| GenerationRequest::new("red circle", Vec::new(), AspectRatio::Square, "m"))
            .collect();
        let generator = ScriptedGenerator::default();
        let mut recorder = Recorder::default();
        let mut job = BatchJob::new(JobKind::Artwork, requests);
        job.run(&generator, &mut recorder);

        let calls = generator.calls.lock().map(|c| c.clone()).unwrap_or_default();
        assert_eq!(calls.len(), 2);
        assert!(calls
            .iter()
            .all(|req| req.aspect_ratio() == AspectRatio::Square && req.reference_images().is_empty()));
        assert_eq!(recorder.items, vec![0, 1]);
        assert_eq!(recorder.progress, vec![(1, 2), (2, 2)]);
        assert_eq!(recorder.finished, vec![JobState::Completed]);
    }

    #[test]
    fn start_is_rejected_once_running_and_elapsed_freezes() {
        let generator = ScriptedGenerator::default();
        let mut job = BatchJob::new(JobKind::Artwork, prompts(1));
        assert_eq!(job.elapsed(), Duration::ZERO);
        job.start().unwrap_or_else(|err| panic!("first start: {err}"));
        assert!(matches!(job.start(), Err(StudioError::Validation(_))));
        job.run(&generator, &mut ());
        let frozen = job.elapsed();
        assert_eq!(job.elapsed(), frozen);
    }

    #[test]
    fn job_lifecycle_is_logged() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let generator = ScriptedGenerator {
            failing: ["p0".to_string()].into_iter().collect(),
            ..ScriptedGenerator::default()
        };
        let mut job = BatchJob::new(JobKind::Mockup, prompts(2))
            .with_events(EventWriter::new(&path, "s-1"));
        job.run(&generator, &mut ());

        let lines: Vec<Value> = std::fs::read_to_string(&path)?
            .lines()
            .map(serde_json::from_str::<Value>)
            .collect::<Result<_, _>>()?;
        let types: Vec<&str> = lines
            .iter()
            .filter_map(|line| line["type"].as_str())
            .collect();
        assert_eq!(
            types,
            vec!["job_started", "item_recorded", "item_recorded", "job_finished"]
        );
        assert_eq!(lines[1]["ok"], json!(false));
        assert_eq!(lines[1]["message"], json!("boom p0"));
        assert_eq!(lines[2]["bytes"], json!(2));
        assert_eq!(lines[3]["state"], json!("completed"));
        assert_eq!(lines[3]["failures"], json!(1));
        assert_eq!(lines[0]["job_id"], json!(job.id()));
        Ok(())
    }
}
