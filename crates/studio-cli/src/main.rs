mod shell;

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use studio_contracts::events::{self, EventWriter};
use studio_contracts::generation::{AspectRatio, EncodedImage, GenerationOutcome, JobKind};
use studio_contracts::library::{
    Collection, ImageItem, Library, LibraryItem, TemplateItem, REFERENCES, SAMPLES, TEMPLATES,
};
use studio_contracts::models::ModelSelector;
use studio_engine::gallery::sanitize_path;
use studio_engine::{
    default_generators, normalize, ArtworkSettings, BatchObserver, CredentialChain,
    DirectorySink, EnvCredentials, FileImageSource, GeneratorRegistry, ImageSource, JobState,
    MockupSettings, Panel, SaveSink, StatusKind, StatusMessage, StoreCredentials,
};

#[derive(Debug, Parser)]
#[command(
    name = "mockup-studio",
    version,
    about = "Generate artwork and product mockups with an image model"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate artwork previews from a prompt.
    Artwork(ArtworkArgs),
    /// Composite an artwork onto product samples and save the results.
    Mockup(MockupArgs),
    /// Manage saved templates, samples and references.
    Library(LibraryArgs),
    /// Store or show the API key.
    Key(KeyArgs),
    /// Interactive panel.
    Panel(PanelArgs),
}

#[derive(Debug, Args)]
struct SessionArgs {
    #[arg(long)]
    store: Option<PathBuf>,
    #[arg(long, default_value = "mockup-out")]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    model: Option<String>,
}

#[derive(Debug, Parser)]
struct ArtworkArgs {
    #[command(flatten)]
    session: SessionArgs,
    #[arg(long)]
    prompt: String,
    #[arg(long, default_value_t = 1)]
    count: usize,
    #[arg(long, default_value = "1:1")]
    ratio: String,
    #[arg(long = "ref")]
    refs: Vec<PathBuf>,
    #[arg(long)]
    sku: Option<String>,
    #[arg(long)]
    upscale: bool,
}

#[derive(Debug, Parser)]
struct MockupArgs {
    #[command(flatten)]
    session: SessionArgs,
    #[arg(long)]
    artwork: PathBuf,
    #[arg(long)]
    prompt: Vec<String>,
    #[arg(long)]
    prompt_file: Option<PathBuf>,
    /// Template id or name from the library.
    #[arg(long)]
    template: Vec<String>,
    #[arg(long, default_value_t = 1)]
    repeat: usize,
    #[arg(long)]
    sample: Vec<PathBuf>,
    #[arg(long)]
    sku: String,
    #[arg(long)]
    upscale: bool,
}

#[derive(Debug, Parser)]
struct LibraryArgs {
    #[arg(long)]
    store: Option<PathBuf>,
    #[command(subcommand)]
    list: LibraryList,
}

#[derive(Debug, Subcommand)]
enum LibraryList {
    Templates {
        #[command(subcommand)]
        action: LibraryAction,
    },
    Samples {
        #[command(subcommand)]
        action: LibraryAction,
    },
    Refs {
        #[command(subcommand)]
        action: LibraryAction,
    },
}

#[derive(Debug, Subcommand)]
enum LibraryAction {
    List {
        #[arg(long, default_value_t = 1)]
        page: usize,
        #[arg(long, default_value_t = 10)]
        per_page: usize,
    },
    Add {
        #[arg(long)]
        name: Option<String>,
        /// Template prompt.
        #[arg(long)]
        prompt: Option<String>,
        /// Sample or reference image.
        #[arg(long)]
        image: Option<PathBuf>,
    },
    Remove {
        id: String,
    },
    Import {
        file: PathBuf,
    },
    Export {
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Debug, Parser)]
struct KeyArgs {
    #[arg(long)]
    store: Option<PathBuf>,
    #[command(subcommand)]
    action: KeyAction,
}

#[derive(Debug, Subcommand)]
enum KeyAction {
    Set { value: String },
    Show,
}

#[derive(Debug, Parser)]
struct PanelArgs {
    #[command(flatten)]
    session: SessionArgs,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("mockup-studio error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Artwork(args) => run_artwork(args),
        Command::Mockup(args) => run_mockup(args),
        Command::Library(args) => run_library(args),
        Command::Key(args) => run_key(args),
        Command::Panel(args) => {
            let session = Session::open(&args.session, "panel")?;
            shell::run_panel(session)?;
            Ok(0)
        }
    }
}

/// Everything a generating command needs: store, output dir, event log, model.
pub(crate) struct Session {
    pub store: PathBuf,
    pub out: PathBuf,
    pub events: EventWriter,
    pub model: String,
    pub generators: GeneratorRegistry,
}

impl Session {
    fn open(args: &SessionArgs, command: &str) -> Result<Self> {
        let store = resolve_store_path(args.store.as_deref());
        Library::open(&store)
            .with_context(|| format!("failed to open store {}", store.display()))?;
        fs::create_dir_all(&args.out)
            .with_context(|| format!("failed to create {}", args.out.display()))?;

        let events_path = args
            .events
            .clone()
            .unwrap_or_else(|| args.out.join("events.jsonl"));
        let events = EventWriter::new(events_path, uuid::Uuid::new_v4().to_string());

        let selection = ModelSelector::default()
            .select(args.model.as_deref(), "image")
            .map_err(anyhow::Error::msg)?;
        if let (Some(_), Some(reason)) = (&selection.requested, &selection.fallback_reason) {
            eprintln!("{reason} Using {}.", selection.model.name);
        }

        let credentials = CredentialChain::new()
            .with(StoreCredentials::new(&store))
            .with(EnvCredentials);
        events.emit(
            events::SESSION_STARTED,
            events::payload(json!({
                "command": command,
                "model": selection.model.name,
                "out": args.out.to_string_lossy(),
            })),
        )?;

        Ok(Self {
            store,
            out: args.out.clone(),
            events,
            model: selection.model.name,
            generators: default_generators(credentials),
        })
    }

    pub fn sink(&self) -> DirectorySink {
        DirectorySink::new(&self.out)
    }

    pub fn library(&self) -> Result<Library> {
        Library::open(&self.store)
    }
}

fn resolve_store_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Some(value) = non_empty_env("MOCKUP_STUDIO_STORE") {
        return PathBuf::from(value);
    }
    match non_empty_env("HOME") {
        Some(home) => PathBuf::from(home).join(".mockup-studio").join("store.json"),
        None => PathBuf::from("mockup-studio-store.json"),
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Prints one line per recorded item.
pub(crate) struct ProgressPrinter {
    kind: JobKind,
}

impl ProgressPrinter {
    pub fn new(kind: JobKind) -> Self {
        Self { kind }
    }
}

impl BatchObserver for ProgressPrinter {
    fn on_item(&mut self, index: usize, outcome: &GenerationOutcome) {
        match outcome {
            GenerationOutcome::Success { image } => {
                println!("[{}] #{index} ok ({} bytes)", self.kind, image.len())
            }
            GenerationOutcome::Failure { message } => {
                println!("[{}] #{index} failed: {message}", self.kind)
            }
        }
    }

    fn on_progress(&mut self, completed: usize, total: usize) {
        println!("[{}] {completed}/{total}", self.kind);
    }
}

pub(crate) fn print_status(status: &StatusMessage) {
    match status.kind {
        StatusKind::Err => eprintln!("{status}"),
        StatusKind::Ok | StatusKind::Info => println!("{status}"),
    }
}

/// A file path, else a saved sample/reference matched by id or name.
pub(crate) fn load_image(
    raw: &str,
    library: Option<(&mut Library, Collection<ImageItem>)>,
) -> Result<EncodedImage> {
    if let Some(image) = FileImageSource::new(raw).acquire_image()? {
        return Ok(image);
    }
    if let Some((library, collection)) = library {
        if let Some(item) = find_by_id_or_name(library.list(collection), raw, |item| &item.name) {
            return EncodedImage::from_data_url(&item.data_url);
        }
    }
    bail!("No image at {raw}.")
}

pub(crate) fn find_template(library: &mut Library, key: &str) -> Option<TemplateItem> {
    find_by_id_or_name(library.list(TEMPLATES), key, |item| &item.name)
}

fn find_by_id_or_name<T: LibraryItem>(
    items: Vec<T>,
    key: &str,
    name: impl Fn(&T) -> &String,
) -> Option<T> {
    let key = key.trim();
    items
        .into_iter()
        .find(|item| item.id() == key || name(item).eq_ignore_ascii_case(key))
}

fn run_artwork(args: ArtworkArgs) -> Result<i32> {
    let session = Session::open(&args.session, "artwork")?;
    let aspect_ratio: AspectRatio = args.ratio.parse().map_err(anyhow::Error::msg)?;
    let mut panel = Panel::new(session.events.clone());
    let mut library = session.library()?;
    for path in &args.refs {
        let image = load_image(&path.to_string_lossy(), Some((&mut library, REFERENCES)))?;
        panel.add_reference(&image)?;
    }

    let mut job = panel.prepare_artwork(&ArtworkSettings {
        prompt: args.prompt.clone(),
        count: args.count,
        aspect_ratio,
        model: session.model.clone(),
    })?;
    job.run(&session.generators, &mut ProgressPrinter::new(JobKind::Artwork));
    let status = panel.complete_job(&job);
    print_status(&status);

    let sink = session.sink();
    let dir = sanitize_path(args.sku.as_deref().unwrap_or("artwork"));
    for (n, image) in panel.previews().iter().enumerate() {
        let output = if args.upscale {
            normalize::upscale_2x(image)?
        } else {
            image.clone()
        };
        let filename = format!("{dir}/{dir}-artwork-{}.png", n + 1);
        sink.save(output.bytes(), &filename)?;
        session.events.emit_lossy(
            events::IMAGE_SAVED,
            events::payload(json!({
                "filename": filename,
                "bytes": output.len(),
                "upscaled": args.upscale,
            })),
        );
        println!("Saved {}", session.out.join(&filename).display());
    }
    Ok(if panel.previews().is_empty() { 1 } else { 0 })
}

fn run_mockup(args: MockupArgs) -> Result<i32> {
    let session = Session::open(&args.session, "mockup")?;
    let mut library = session.library()?;

    let mut prompts = args.prompt.clone();
    if let Some(path) = &args.prompt_file {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed reading {}", path.display()))?;
        prompts.push(raw);
    }
    for key in &args.template {
        let template =
            find_template(&mut library, key).ok_or_else(|| anyhow!("Unknown template '{key}'."))?;
        prompts.push(template.prompt);
    }

    let mut panel = Panel::new(session.events.clone());
    panel.use_artwork(load_image(&args.artwork.to_string_lossy(), None)?);
    for path in &args.sample {
        let image = load_image(&path.to_string_lossy(), Some((&mut library, SAMPLES)))?;
        panel.add_sample(&image)?;
    }

    let mut job = panel.prepare_mockup(&MockupSettings {
        prompts_text: prompts.join("\n"),
        repeat: args.repeat,
        model: session.model.clone(),
    })?;
    let state = job.run(&session.generators, &mut ProgressPrinter::new(JobKind::Mockup));
    let status = panel.complete_job(&job);
    print_status(&status);

    let report = panel.save_all(&args.sku, args.upscale, &session.sink())?;
    for filename in &report.saved {
        println!("Saved {}", session.out.join(filename).display());
    }
    for (filename, err) in &report.failed {
        eprintln!("Save failed for {filename}: {err}");
    }
    let all_ok = state == JobState::Completed && job.failures() == 0 && report.is_clean();
    Ok(if all_ok { 0 } else { 1 })
}

trait Describe {
    fn describe(&self) -> String;
}

impl Describe for TemplateItem {
    fn describe(&self) -> String {
        format!("{}  {}  {}", self.id, self.name, truncate(&self.prompt, 60))
    }
}

impl Describe for ImageItem {
    fn describe(&self) -> String {
        format!("{}  {}  ({} chars)", self.id, self.name, self.data_url.len())
    }
}

fn run_library(args: LibraryArgs) -> Result<i32> {
    let store = resolve_store_path(args.store.as_deref());
    let mut library = Library::open(&store)
        .with_context(|| format!("failed to open store {}", store.display()))?;
    let now = chrono::Utc::now().timestamp_millis();
    match args.list {
        LibraryList::Templates { action } => {
            manage(&mut library, TEMPLATES, action, |name, prompt, _| {
                let prompt = prompt
                    .filter(|value| !value.trim().is_empty())
                    .ok_or_else(|| anyhow!("--prompt is required for templates"))?;
                Ok(TemplateItem::new(name.unwrap_or_default().as_str(), &prompt, now))
            })
        }
        LibraryList::Samples { action } => {
            manage(&mut library, SAMPLES, action, |name, _, image| {
                image_item(name, image, now)
            })
        }
        LibraryList::Refs { action } => {
            manage(&mut library, REFERENCES, action, |name, _, image| {
                image_item(name, image, now)
            })
        }
    }
}

fn image_item(name: Option<String>, image: Option<PathBuf>, now: i64) -> Result<ImageItem> {
    let path = image.ok_or_else(|| anyhow!("--image is required"))?;
    let encoded = load_image(&path.to_string_lossy(), None)?;
    let name = name.unwrap_or_else(|| {
        path.file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_default()
    });
    Ok(ImageItem::new(&name, &encoded.to_data_url(), now))
}

fn manage<T: LibraryItem + Describe>(
    library: &mut Library,
    collection: Collection<T>,
    action: LibraryAction,
    build: impl FnOnce(Option<String>, Option<String>, Option<PathBuf>) -> Result<T>,
) -> Result<i32> {
    match action {
        LibraryAction::List { page, per_page } => {
            let page = library.page(collection, page, per_page);
            for item in &page.items {
                println!("{}", item.describe());
            }
            println!(
                "page {}/{} ({} {})",
                page.page,
                page.total_pages,
                page.total,
                collection.label()
            );
        }
        LibraryAction::Add {
            name,
            prompt,
            image,
        } => {
            let item = library.upsert(collection, build(name, prompt, image)?)?;
            println!("Added {}", item.describe());
        }
        LibraryAction::Remove { id } => {
            if !library.remove(collection, &id)? {
                eprintln!("No {} entry with id {id}.", collection.label());
                return Ok(1);
            }
            println!("Removed {id}");
        }
        LibraryAction::Import { file } => {
            let raw = fs::read_to_string(&file)
                .with_context(|| format!("failed reading {}", file.display()))?;
            let report = library.import(collection, &raw)?;
            println!(
                "Imported {} {} ({} skipped, {} total).",
                report.imported,
                collection.label(),
                report.skipped,
                report.total
            );
        }
        LibraryAction::Export { out } => {
            let exported = library.export(collection)?;
            match out {
                Some(path) => {
                    fs::write(&path, exported)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    println!("Exported {} to {}", collection.label(), path.display());
                }
                None => println!("{exported}"),
            }
        }
    }
    Ok(0)
}

fn run_key(args: KeyArgs) -> Result<i32> {
    let store = resolve_store_path(args.store.as_deref());
    let mut library = Library::open(&store)
        .with_context(|| format!("failed to open store {}", store.display()))?;
    match args.action {
        KeyAction::Set { value } => {
            if value.trim().is_empty() {
                bail!("API key must not be empty");
            }
            library.set_credential(&value)?;
            println!("API key saved to {}", store.display());
        }
        KeyAction::Show => match library.credential() {
            Some(key) => println!("{}", mask_key(&key)),
            None => {
                println!("No API key saved.");
                return Ok(1);
            }
        },
    }
    Ok(0)
}

fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}…{tail}")
}

fn truncate(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;
    use serde_json::Value;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_library_and_mockup_commands() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "mockup-studio",
            "library",
            "templates",
            "list",
            "--page",
            "2",
        ])?;
        assert!(matches!(
            cli.command,
            Command::Library(LibraryArgs {
                list: LibraryList::Templates {
                    action: LibraryAction::List { page: 2, .. }
                },
                ..
            })
        ));

        let cli = Cli::try_parse_from([
            "mockup-studio",
            "mockup",
            "--artwork",
            "art.png",
            "--prompt",
            "tee",
            "--prompt",
            "mug",
            "--sample",
            "a.png",
            "--sku",
            "TEE-1",
            "--upscale",
        ])?;
        let Command::Mockup(args) = cli.command else {
            anyhow::bail!("expected mockup command");
        };
        assert_eq!(args.prompt, vec!["tee", "mug"]);
        assert_eq!(args.repeat, 1);
        assert!(args.upscale);
        assert_eq!(args.session.out, PathBuf::from("mockup-out"));
        Ok(())
    }

    #[test]
    fn key_is_masked() {
        assert_eq!(mask_key("abcd"), "****");
        assert_eq!(mask_key("AIzaSyExample1234"), "AIza…1234");
    }

    #[test]
    fn dryrun_artwork_run_saves_previews_and_logs() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let out = temp.path().join("out");
        let cli = Cli::try_parse_from([
            "mockup-studio".to_string(),
            "artwork".to_string(),
            "--store".to_string(),
            temp.path().join("store.json").to_string_lossy().to_string(),
            "--out".to_string(),
            out.to_string_lossy().to_string(),
            "--model".to_string(),
            "dryrun-image-1".to_string(),
            "--prompt".to_string(),
            "red circle".to_string(),
            "--count".to_string(),
            "2".to_string(),
            "--sku".to_string(),
            "RC".to_string(),
        ])?;
        let Command::Artwork(args) = cli.command else {
            anyhow::bail!("expected artwork command");
        };
        assert_eq!(run_artwork(args)?, 0);
        assert!(out.join("RC").join("RC-artwork-1.png").is_file());
        assert!(out.join("RC").join("RC-artwork-2.png").is_file());

        let types: Vec<String> = fs::read_to_string(out.join("events.jsonl"))?
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|event| event["type"].as_str().map(str::to_string))
            .collect();
        assert_eq!(types.first().map(String::as_str), Some("session_started"));
        assert_eq!(types.iter().filter(|t| *t == "item_recorded").count(), 2);
        assert_eq!(types.iter().filter(|t| *t == "image_saved").count(), 2);
        Ok(())
    }

    #[test]
    fn library_add_and_find_template() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut library = Library::open(temp.path().join("store.json"))?;
        let code = manage(
            &mut library,
            TEMPLATES,
            LibraryAction::Add {
                name: Some("Mug".to_string()),
                prompt: Some("ceramic mug on a desk".to_string()),
                image: None,
            },
            |name, prompt, _| {
                Ok(TemplateItem::new(
                    name.unwrap_or_default().as_str(),
                    prompt.unwrap_or_default().as_str(),
                    1,
                ))
            },
        )?;
        assert_eq!(code, 0);
        let found = find_template(&mut library, "mug").map(|item| item.prompt);
        assert_eq!(found.as_deref(), Some("ceramic mug on a desk"));
        assert!(find_template(&mut library, "tpl-tote").is_some());
        Ok(())
    }
}
