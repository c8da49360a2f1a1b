use std::io::{self, ErrorKind, Write};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use studio_contracts::commands::{parse_command, PanelCommand, PANEL_HELP_COMMANDS};
use studio_contracts::generation::{AspectRatio, GenerationOutcome, JobKind};
use studio_contracts::library::{REFERENCES, SAMPLES, TEMPLATES};
use studio_contracts::models::ModelSelector;
use studio_engine::{
    normalize, ArtworkSettings, BatchJob, BatchObserver, GeneratorRegistry, MockupSettings, Panel,
    StatusMessage,
};

use crate::{find_template, load_image, print_status, ProgressPrinter, Session};

const WAIT_POLL: Duration = Duration::from_millis(100);

enum WorkerEvent {
    Item {
        kind: JobKind,
        job_id: String,
        index: usize,
        outcome: GenerationOutcome,
    },
    Finished(BatchJob),
}

/// Prints progress and forwards each outcome to the shell thread.
struct ForwardingObserver {
    printer: ProgressPrinter,
    kind: JobKind,
    job_id: String,
    tx: mpsc::Sender<WorkerEvent>,
}

impl BatchObserver for ForwardingObserver {
    fn on_item(&mut self, index: usize, outcome: &GenerationOutcome) {
        self.printer.on_item(index, outcome);
        let _ = self.tx.send(WorkerEvent::Item {
            kind: self.kind,
            job_id: self.job_id.clone(),
            index,
            outcome: outcome.clone(),
        });
    }

    fn on_progress(&mut self, completed: usize, total: usize) {
        self.printer.on_progress(completed, total);
    }
}

struct Worker {
    kind: JobKind,
    job_id: String,
    handle: JoinHandle<()>,
}

/// Runs each batch on its own thread and folds its events back into the panel.
struct BatchWorkers {
    generators: Arc<GeneratorRegistry>,
    tx: mpsc::Sender<WorkerEvent>,
    rx: mpsc::Receiver<WorkerEvent>,
    in_flight: Vec<Worker>,
}

impl BatchWorkers {
    fn new(generators: GeneratorRegistry) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            generators: Arc::new(generators),
            tx,
            rx,
            in_flight: Vec::new(),
        }
    }

    fn running(&self) -> usize {
        self.in_flight.len()
    }

    fn spawn(&mut self, mut job: BatchJob) -> Result<()> {
        let tx = self.tx.clone();
        let generators = Arc::clone(&self.generators);
        let kind = job.kind();
        let job_id = job.id().to_string();
        let mut observer = ForwardingObserver {
            printer: ProgressPrinter::new(kind),
            kind,
            job_id: job_id.clone(),
            tx: tx.clone(),
        };
        let handle = thread::Builder::new()
            .name(format!("{kind}-batch"))
            .spawn(move || {
                job.run(generators.as_ref(), &mut observer);
                let _ = tx.send(WorkerEvent::Finished(job));
            })
            .with_context(|| format!("{kind} batch thread spawn failed"))?;
        self.in_flight.push(Worker {
            kind,
            job_id,
            handle,
        });
        Ok(())
    }

    /// Folds in whatever has arrived without blocking.
    fn drain(&mut self, panel: &mut Panel) {
        // Snapshot first: a worker sends everything before its thread ends.
        let ended: Vec<String> = self
            .in_flight
            .iter()
            .filter(|worker| worker.handle.is_finished())
            .map(|worker| worker.job_id.clone())
            .collect();
        while let Ok(event) = self.rx.try_recv() {
            self.fold(panel, event);
        }
        for job_id in ended {
            let Some(pos) = self.in_flight.iter().position(|w| w.job_id == job_id) else {
                continue;
            };
            let worker = self.in_flight.swap_remove(pos);
            let reason = match worker.handle.join() {
                Ok(()) => "ended without reporting back".to_string(),
                Err(_) => "panicked".to_string(),
            };
            panel.release(worker.kind);
            print_status(&StatusMessage::err(format!(
                "{} batch {} {reason}; slot freed.",
                worker.kind, worker.job_id
            )));
        }
    }

    fn wait_all(&mut self, panel: &mut Panel) {
        while !self.in_flight.is_empty() {
            match self.rx.recv_timeout(WAIT_POLL) {
                Ok(event) => self.fold(panel, event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.drain(panel);
        }
    }

    fn fold(&mut self, panel: &mut Panel, event: WorkerEvent) {
        match event {
            WorkerEvent::Item {
                kind,
                job_id,
                index,
                outcome,
            } => {
                panel.record_item(kind, &job_id, index, &outcome);
            }
            WorkerEvent::Finished(job) => {
                if let Some(pos) = self.in_flight.iter().position(|w| w.job_id == job.id()) {
                    let worker = self.in_flight.swap_remove(pos);
                    let _ = worker.handle.join();
                }
                print_status(&panel.complete_job(&job));
            }
        }
    }
}

/// Settings the panel widgets would hold.
struct ShellState {
    artwork_prompt: String,
    count: usize,
    ratio: AspectRatio,
    model: String,
    mockup_prompts: Vec<String>,
    repeat: usize,
    sku: Option<String>,
    upscale: bool,
}

pub(crate) fn run_panel(session: Session) -> Result<()> {
    let mut library = session.library()?;
    let sink = session.sink();
    let mut panel = Panel::new(session.events.clone());
    let mut state = ShellState {
        artwork_prompt: String::new(),
        count: 1,
        ratio: AspectRatio::Square,
        model: session.model.clone(),
        mockup_prompts: Vec::new(),
        repeat: 1,
        sku: None,
        upscale: false,
    };
    let selector = ModelSelector::default();
    let mut workers = BatchWorkers::new(session.generators);

    let stdin = io::stdin();
    let mut line = String::new();
    println!("Mockup studio panel started. Type /help for commands.");

    loop {
        workers.drain(&mut panel);
        print!("> ");
        io::stdout().flush()?;
        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }
        workers.drain(&mut panel);

        let command = parse_command(line.trim_end_matches(['\n', '\r']));
        match command.action.as_str() {
            "noop" => {}
            "help" => println!("Commands: {}", PANEL_HELP_COMMANDS.join(" ")),
            "quit" => break,
            "status" => print_overview(&panel, &state, workers.running()),
            "wait" => workers.wait_all(&mut panel),
            "set_artwork_prompt" => {
                state.artwork_prompt = command.arg("prompt").unwrap_or_default().to_string();
                println!("Artwork prompt set.");
            }
            "generate_artwork" => {
                if let Some(prompt) = command.arg("prompt") {
                    state.artwork_prompt = prompt.to_string();
                }
                let settings = ArtworkSettings {
                    prompt: state.artwork_prompt.clone(),
                    count: state.count,
                    aspect_ratio: state.ratio,
                    model: state.model.clone(),
                };
                match panel.prepare_artwork(&settings) {
                    Ok(job) => start_job(&mut workers, &mut panel, job),
                    Err(err) => eprintln!("{err}"),
                }
            }
            "set_count" => match command.arg("count").map(str::parse::<usize>) {
                Some(Ok(count)) if studio_engine::panel::ARTWORK_COUNTS.contains(&count) => {
                    state.count = count;
                    println!("Count set to {count}");
                }
                _ => eprintln!("/count takes 1, 2, 4 or 8"),
            },
            "set_ratio" => match command.arg("ratio").map(str::parse::<AspectRatio>) {
                Some(Ok(ratio)) => {
                    state.ratio = ratio;
                    println!("Aspect ratio set to {ratio}");
                }
                Some(Err(err)) => eprintln!("{err}"),
                None => eprintln!("/ratio requires a value (1:1, 16:9, 1200x800...)"),
            },
            "set_model" => match selector.select(command.arg("model"), "image") {
                Ok(selection) => {
                    if let Some(reason) = selection.fallback_reason {
                        eprintln!("{reason}");
                    }
                    state.model = selection.model.name;
                    println!("Model set to {}", state.model);
                }
                Err(err) => eprintln!("{err}"),
            },
            "add_reference" | "add_sample" | "use_artwork_file" => {
                handle_image_command(&command, &mut panel, &mut library);
            }
            "apply_artwork" => {
                if panel.apply_artwork() {
                    println!("Applied to Artwork.");
                } else {
                    eprintln!("No artwork preview to apply.");
                }
            }
            "next_preview" | "prev_preview" => {
                let moved = if command.action == "next_preview" {
                    panel.next_preview()
                } else {
                    panel.prev_preview()
                };
                match moved {
                    Some(cursor) => println!("Preview {}/{}", cursor + 1, panel.previews().len()),
                    None => println!("Fewer than two previews."),
                }
            }
            "add_mockup_prompt" => match command.arg("prompt") {
                Some(prompt) => {
                    state.mockup_prompts.push(prompt.to_string());
                    println!("{} mockup prompt(s).", state.mockup_prompts.len());
                }
                None => eprintln!("/mockup_prompt requires text"),
            },
            "clear_mockup_prompts" => {
                state.mockup_prompts.clear();
                println!("Mockup prompts cleared.");
            }
            "use_template" => {
                let key = command.arg("template").unwrap_or_default();
                match find_template(&mut library, key) {
                    Some(template) => {
                        state.mockup_prompts.push(template.prompt);
                        println!("Added template {}.", template.name);
                    }
                    None => eprintln!("Unknown template '{key}'."),
                }
            }
            "list_templates" => {
                for template in library.list(TEMPLATES) {
                    println!("{}  {}", template.id, template.name);
                }
            }
            "set_repeat" => match command.arg("repeat").map(str::parse::<usize>) {
                Some(Ok(repeat)) if repeat >= 1 => {
                    state.repeat = repeat;
                    println!("Repeat set to {repeat}");
                }
                _ => eprintln!("/repeat takes a number >= 1"),
            },
            "generate_mockup" => {
                let settings = MockupSettings {
                    prompts_text: state.mockup_prompts.join("\n"),
                    repeat: state.repeat,
                    model: state.model.clone(),
                };
                match panel.prepare_mockup(&settings) {
                    Ok(job) => start_job(&mut workers, &mut panel, job),
                    Err(err) => eprintln!("{err}"),
                }
            }
            "cancel" => match command.arg("kind").map(str::parse::<JobKind>) {
                Some(Ok(kind)) => {
                    if panel.cancel(kind) {
                        println!("Cancelling {kind} after the current request.");
                    } else {
                        println!("No {kind} job running.");
                    }
                }
                Some(Err(err)) => eprintln!("{err}"),
                None => {
                    let artwork = panel.cancel(JobKind::Artwork);
                    let mockup = panel.cancel(JobKind::Mockup);
                    if !(artwork || mockup) {
                        println!("Nothing to cancel.");
                    }
                }
            },
            "open_viewer" => match parse_index(&command) {
                Some(index) => match panel.view(index) {
                    Some(image) => match normalize::dimensions(image) {
                        Ok((w, h)) => println!(
                            "#{index}: {w}x{h} {} {} bytes digest {}",
                            image.mime_type(),
                            image.len(),
                            image.digest()
                        ),
                        Err(err) => eprintln!("{err}"),
                    },
                    None => eprintln!("No image at index {index}."),
                },
                None => eprintln!("/view requires an index"),
            },
            "save_image" => match parse_index(&command) {
                Some(index) => {
                    match panel.save(index, state.upscale, state.sku.as_deref(), &sink) {
                        Ok(filename) => println!("Saved {filename}"),
                        Err(err) => eprintln!("Save failed: {err}"),
                    }
                }
                None => eprintln!("/save requires an index"),
            },
            "set_sku" => {
                state.sku = command.arg("sku").map(str::to_string);
                println!("SKU set to {}", state.sku.as_deref().unwrap_or("(none)"));
            }
            "save_all" => {
                if let Some(sku) = command.arg("sku") {
                    state.sku = Some(sku.to_string());
                }
                let sku = state.sku.clone().unwrap_or_default();
                match panel.save_all(&sku, state.upscale, &sink) {
                    Ok(report) => {
                        for (filename, err) in &report.failed {
                            eprintln!("Save failed for {filename}: {err}");
                        }
                        print_status(&StatusMessage::ok(format!(
                            "Saved {} file(s) under \"{}/\".",
                            report.saved.len(),
                            studio_engine::gallery::sanitize_path(&sku)
                        )));
                    }
                    Err(err) => eprintln!("{err}"),
                }
            }
            "set_upscale" => match command.arg("value") {
                Some("on") | Some("true") | Some("1") => {
                    state.upscale = true;
                    println!("Upscale x2 on");
                }
                Some("off") | Some("false") | Some("0") => {
                    state.upscale = false;
                    println!("Upscale x2 off");
                }
                _ => eprintln!("/upscale takes on or off"),
            },
            "unknown" => {
                let name = command.arg("command").unwrap_or_default();
                eprintln!("Unknown command /{name}. Type /help.");
            }
            other => eprintln!("Unhandled action {other}"),
        }
    }

    if panel.cancel(JobKind::Artwork) | panel.cancel(JobKind::Mockup) {
        println!("Waiting for in-flight requests...");
    }
    workers.wait_all(&mut panel);
    Ok(())
}

fn start_job(workers: &mut BatchWorkers, panel: &mut Panel, job: BatchJob) {
    let kind = job.kind();
    let total = job.total();
    match workers.spawn(job) {
        Ok(()) => println!("Started {kind} batch: {total} request(s)."),
        Err(err) => {
            panel.release(kind);
            eprintln!("{err:#}");
        }
    }
}

fn handle_image_command(command: &PanelCommand, panel: &mut Panel, library: &mut studio_contracts::library::Library) {
    let Some(path) = command.arg("path") else {
        eprintln!("{} requires a path", command.raw.trim());
        return;
    };
    let result = match command.action.as_str() {
        "add_reference" => load_image(path, Some((library, REFERENCES)))
            .and_then(|image| Ok(panel.add_reference(&image)?))
            .map(|()| format!("{} reference(s).", panel.references().len())),
        "add_sample" => load_image(path, Some((library, SAMPLES)))
            .and_then(|image| Ok(panel.add_sample(&image)?))
            .map(|()| format!("{} sample(s).", panel.samples().len())),
        _ => load_image(path, None).map(|image| {
            panel.use_artwork(image);
            "Applied to Artwork.".to_string()
        }),
    };
    match result {
        Ok(message) => println!("{message}"),
        Err(err) => eprintln!("{err:#}"),
    }
}

fn parse_index(command: &PanelCommand) -> Option<usize> {
    command.arg("index").and_then(|raw| raw.parse().ok())
}

fn print_overview(panel: &Panel, state: &ShellState, running: usize) {
    let busy = |kind| if panel.is_running(kind) { "running" } else { "idle" };
    println!(
        "artwork: {} | mockup: {} | batches in flight: {running}",
        busy(JobKind::Artwork),
        busy(JobKind::Mockup)
    );
    println!(
        "model {} | count {} | ratio {} | repeat {} | upscale {}",
        state.model,
        state.count,
        state.ratio,
        state.repeat,
        if state.upscale { "on" } else { "off" }
    );
    println!(
        "previews {} (cursor {}) | applied artwork: {} | refs {} | samples {} | gallery {}",
        panel.previews().len(),
        panel.preview_cursor() + 1,
        if panel.applied_artwork().is_some() { "yes" } else { "no" },
        panel.references().len(),
        panel.samples().len(),
        panel.gallery().len()
    );
    if !state.artwork_prompt.is_empty() {
        println!("artwork prompt: {}", state.artwork_prompt);
    }
    for (n, prompt) in state.mockup_prompts.iter().enumerate() {
        println!("mockup prompt {}: {prompt}", n + 1);
    }
    if let Some(sku) = &state.sku {
        println!("sku: {sku}");
    }
}

#[cfg(test)]
mod tests {
    use studio_contracts::generation::GenerationRequest;
    use studio_contracts::models::{ModelRegistry, DRYRUN_IMAGE_MODEL};
    use studio_engine::{DryrunGenerator, ImageGenerator};

    use super::*;

    struct CrashingGenerator;

    impl ImageGenerator for CrashingGenerator {
        fn name(&self) -> &str {
            "dryrun"
        }

        fn generate(&self, _request: &GenerationRequest) -> GenerationOutcome {
            panic!("generator crashed");
        }
    }

    fn dryrun_outcome(prompt: &str) -> GenerationOutcome {
        DryrunGenerator::new().generate(&GenerationRequest::new(
            prompt,
            Vec::new(),
            AspectRatio::Square,
            DRYRUN_IMAGE_MODEL,
        ))
    }

    #[test]
    fn forwarded_items_are_viewable_before_the_job_finishes() -> anyhow::Result<()> {
        let mut panel = Panel::default();
        let artwork = dryrun_outcome("art")
            .image()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("dryrun should succeed"))?;
        panel.use_artwork(artwork);
        let job = panel.prepare_mockup(&MockupSettings {
            prompts_text: "front\nback".to_string(),
            repeat: 1,
            model: DRYRUN_IMAGE_MODEL.to_string(),
        })?;

        let mut workers = BatchWorkers::new(GeneratorRegistry::new(ModelRegistry::default()));
        workers.tx.send(WorkerEvent::Item {
            kind: JobKind::Mockup,
            job_id: job.id().to_string(),
            index: 0,
            outcome: dryrun_outcome("front"),
        })
        .map_err(|_| anyhow::anyhow!("worker channel closed"))?;
        workers.drain(&mut panel);

        assert!(panel.view(0).is_some());
        assert!(panel.view(1).is_none());
        assert!(panel.is_running(JobKind::Mockup));
        Ok(())
    }

    #[test]
    fn crashed_worker_frees_its_slot_instead_of_hanging() -> anyhow::Result<()> {
        let mut generators = GeneratorRegistry::new(ModelRegistry::default());
        generators.register(CrashingGenerator);
        let mut workers = BatchWorkers::new(generators);
        let mut panel = Panel::default();

        let job = panel.prepare_artwork(&ArtworkSettings {
            prompt: "stars".to_string(),
            count: 2,
            aspect_ratio: AspectRatio::Square,
            model: DRYRUN_IMAGE_MODEL.to_string(),
        })?;
        workers.spawn(job)?;
        workers.wait_all(&mut panel);

        assert_eq!(workers.running(), 0);
        assert!(!panel.is_running(JobKind::Artwork));
        Ok(())
    }
}
