use std::collections::BTreeMap;
use std::env;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use studio_contracts::generation::{EncodedImage, GenerationOutcome, GenerationRequest};
use studio_contracts::library::{LocalStore, CREDENTIAL_KEY};
use studio_contracts::models::ModelRegistry;

use crate::error::{StudioError, StudioResult};

const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const ERROR_BODY_CHARS: usize = 300;

/// Anything that turns one request into exactly one outcome.
///
/// Implementations never panic or return early errors: every problem is a
/// `GenerationOutcome::Failure`.
pub trait ImageGenerator: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, request: &GenerationRequest) -> GenerationOutcome;
}

pub fn failure_outcome(err: StudioError) -> GenerationOutcome {
    GenerationOutcome::failure(err.to_string())
}

/// Read at call time, so a key saved mid-session is picked up by the next request.
pub trait CredentialSource: Send + Sync {
    fn api_key(&self) -> Option<String>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EnvCredentials;

impl CredentialSource for EnvCredentials {
    fn api_key(&self) -> Option<String> {
        non_empty_env("GEMINI_API_KEY").or_else(|| non_empty_env("GOOGLE_API_KEY"))
    }
}

/// The key saved in the library store.
#[derive(Debug, Clone)]
pub struct StoreCredentials {
    path: PathBuf,
}

impl StoreCredentials {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CredentialSource for StoreCredentials {
    fn api_key(&self) -> Option<String> {
        LocalStore::new(&self.path)
            .get(CREDENTIAL_KEY)
            .and_then(|value| value.as_str().map(str::trim).map(str::to_string))
            .filter(|value| !value.is_empty())
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticCredentials(pub Option<String>);

impl CredentialSource for StaticCredentials {
    fn api_key(&self) -> Option<String> {
        self.0
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    }
}

/// First source with a key wins.
#[derive(Default)]
pub struct CredentialChain {
    sources: Vec<Box<dyn CredentialSource>>,
}

impl CredentialChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<S: CredentialSource + 'static>(mut self, source: S) -> Self {
        self.sources.push(Box::new(source));
        self
    }
}

impl CredentialSource for CredentialChain {
    fn api_key(&self) -> Option<String> {
        self.sources.iter().find_map(|source| source.api_key())
    }
}

pub struct GeminiClient {
    api_base: String,
    http: HttpClient,
    credentials: Box<dyn CredentialSource>,
}

impl GeminiClient {
    pub fn new<C: CredentialSource + 'static>(credentials: C) -> Self {
        Self {
            api_base: env::var("GEMINI_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            http: HttpClient::new(),
            credentials: Box::new(credentials),
        }
    }

    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim().trim_end_matches('/').to_string();
        self
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    pub fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    fn call(&self, request: &GenerationRequest) -> StudioResult<EncodedImage> {
        let api_key = self
            .credentials
            .api_key()
            .ok_or_else(StudioError::missing_credential)?;
        let endpoint = self.endpoint_for_model(request.target_model());
        let payload = build_payload(request);

        // Single attempt; timeouts are whatever the transport defaults to.
        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", api_key.as_str())])
            .json(&payload)
            .send()
            .map_err(|err| StudioError::Transport(format!("Request failed: {err}")))?;

        let status = response.status();
        let body = response
            .text()
            .map_err(|err| StudioError::Transport(format!("Response read failed: {err}")))?;
        if !status.is_success() {
            return Err(StudioError::Transport(format!(
                "HTTP {}: {}",
                status.as_u16(),
                truncate_text(body.trim(), ERROR_BODY_CHARS)
            )));
        }
        let parsed: Value = serde_json::from_str(&body).map_err(|err| {
            StudioError::ResponseShape(format!("Response is not valid JSON: {err}"))
        })?;
        first_inline_image(&parsed)
    }
}

impl ImageGenerator for GeminiClient {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate(&self, request: &GenerationRequest) -> GenerationOutcome {
        match self.call(request) {
            Ok(image) => GenerationOutcome::Success { image },
            Err(err) => failure_outcome(err),
        }
    }
}

/// Request body: prompt text, the ratio hint when not square, then one
/// inline part per reference image in order.
pub fn build_payload(request: &GenerationRequest) -> Value {
    let mut parts = Vec::new();
    let prompt = request.prompt().trim();
    if !prompt.is_empty() {
        parts.push(json!({ "text": prompt }));
    }
    if let Some(hint) = request.aspect_ratio().prompt_hint() {
        parts.push(json!({ "text": hint }));
    }
    for image in request.reference_images() {
        parts.push(json!({
            "inlineData": {
                "mimeType": image.mime_type(),
                "data": image.to_base64(),
            }
        }));
    }
    json!({
        "contents": [{
            "role": "user",
            "parts": parts,
        }]
    })
}

/// The first inline image anywhere in the candidates, in document order.
pub fn first_inline_image(response: &Value) -> StudioResult<EncodedImage> {
    let candidates = response
        .get("candidates")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for candidate in candidates {
        let parts = candidate
            .get("content")
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for part in parts {
            let Some(inline) = part.get("inlineData").or_else(|| part.get("inline_data")) else {
                continue;
            };
            let data = inline
                .get("data")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if data.is_empty() {
                continue;
            }
            let mime_type = inline
                .get("mimeType")
                .or_else(|| inline.get("mime_type"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            return EncodedImage::from_base64(data, mime_type).map_err(|err| {
                StudioError::Decode(format!("Image payload could not be decoded: {err}"))
            });
        }
    }
    Err(StudioError::no_image_in_response())
}

/// Offline generator: a solid PNG whose colour depends on the prompt.
#[derive(Debug, Default)]
pub struct DryrunGenerator {
    sequence: AtomicU64,
}

impl DryrunGenerator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ImageGenerator for DryrunGenerator {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate(&self, request: &GenerationRequest) -> GenerationOutcome {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let (width, height) = request.aspect_ratio().pixel_size();
        let (r, g, b) = color_from_prompt(request.prompt(), seq);
        let image = RgbImage::from_pixel((width / 16).max(1), (height / 16).max(1), Rgb([r, g, b]));
        let mut bytes = Vec::new();
        match DynamicImage::ImageRgb8(image).write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        {
            Ok(()) => GenerationOutcome::Success {
                image: EncodedImage::png(bytes),
            },
            Err(err) => failure_outcome(StudioError::Decode(format!(
                "dryrun encode failed: {err}"
            ))),
        }
    }
}

/// Routes each request to the generator registered for its model's provider.
pub struct GeneratorRegistry {
    models: ModelRegistry,
    providers: BTreeMap<String, Box<dyn ImageGenerator>>,
}

impl GeneratorRegistry {
    pub fn new(models: ModelRegistry) -> Self {
        Self {
            models,
            providers: BTreeMap::new(),
        }
    }

    pub fn register<G: ImageGenerator + 'static>(&mut self, generator: G) {
        self.providers
            .insert(generator.name().to_string(), Box::new(generator));
    }

    pub fn get(&self, provider: &str) -> Option<&dyn ImageGenerator> {
        self.providers.get(provider).map(|generator| generator.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    pub fn models(&self) -> &ModelRegistry {
        &self.models
    }
}

impl ImageGenerator for GeneratorRegistry {
    fn name(&self) -> &str {
        "registry"
    }

    fn generate(&self, request: &GenerationRequest) -> GenerationOutcome {
        let model = request.target_model();
        let Some(provider) = self.models.provider_for(model) else {
            return failure_outcome(StudioError::Validation(format!("Unknown model '{model}'.")));
        };
        match self.get(provider) {
            Some(generator) => generator.generate(request),
            None => failure_outcome(StudioError::Validation(format!(
                "No generator registered for provider '{provider}'."
            ))),
        }
    }
}

/// Gemini (credentials from `credentials`) plus the dry-run provider.
pub fn default_generators<C: CredentialSource + 'static>(credentials: C) -> GeneratorRegistry {
    let mut registry = GeneratorRegistry::new(ModelRegistry::default());
    registry.register(GeminiClient::new(credentials));
    registry.register(DryrunGenerator::new());
    registry
}

fn color_from_prompt(prompt: &str, seed: u64) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(seed.to_be_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
