use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha2::{Digest, Sha256};

pub const DEFAULT_MIME_TYPE: &str = "image/png";

/// An encoded bitmap (PNG, JPEG, WebP...) plus its declared MIME type.
///
/// Bytes are shared, so cloning an image into every request of a batch does
/// not copy the payload. Transforms always produce a new value.
#[derive(Clone, PartialEq, Eq)]
pub struct EncodedImage {
    bytes: Arc<[u8]>,
    mime_type: String,
}

impl EncodedImage {
    pub fn new(bytes: impl Into<Vec<u8>>, mime_type: impl Into<String>) -> Self {
        let mime_type = mime_type.into();
        let mime_type = if mime_type.trim().is_empty() {
            DEFAULT_MIME_TYPE.to_string()
        } else {
            mime_type.trim().to_ascii_lowercase()
        };
        Self {
            bytes: Arc::from(bytes.into()),
            mime_type,
        }
    }

    pub fn png(bytes: impl Into<Vec<u8>>) -> Self {
        Self::new(bytes, DEFAULT_MIME_TYPE)
    }

    pub fn from_base64(data: &str, mime_type: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(data.trim().as_bytes())
            .context("image base64 decode failed")?;
        Ok(Self::new(bytes, mime_type))
    }

    pub fn from_data_url(raw: &str) -> Result<Self> {
        let Some((mime_type, data)) = split_data_url(raw) else {
            bail!("not an image data URL");
        };
        Self::from_base64(data, mime_type)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.bytes)
    }

    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.to_base64())
    }

    /// First 8 bytes of the SHA-256, hex encoded. Used in log lines.
    pub fn digest(&self) -> String {
        let digest = Sha256::digest(&self.bytes);
        hex::encode(&digest[..8])
    }
}

impl fmt::Debug for EncodedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncodedImage")
            .field("mime_type", &self.mime_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Splits `data:image/<type>;base64,<payload>` into MIME type and payload.
pub fn split_data_url(raw: &str) -> Option<(&str, &str)> {
    let rest = raw.trim().strip_prefix("data:")?;
    let (mime_type, data) = rest.split_once(";base64,")?;
    let subtype = mime_type.strip_prefix("image/")?;
    let valid_subtype = !subtype.is_empty()
        && subtype
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '+' | '-'));
    if !valid_subtype || data.is_empty() {
        return None;
    }
    Some((mime_type, data))
}

pub fn is_image_data_url(raw: &str) -> bool {
    split_data_url(raw).is_some()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AspectRatio {
    #[default]
    Square,
    Portrait2x3,
    Landscape3x2,
    Portrait3x4,
    Landscape4x3,
    Portrait4x5,
    Landscape5x4,
    Portrait9x16,
    Landscape16x9,
    Ultrawide21x9,
    Custom { width: u32, height: u32 },
}

pub const CUSTOM_EDGE_MIN: u32 = 64;
pub const CUSTOM_EDGE_MAX: u32 = 2048;

const FIXED_RATIOS: &[(AspectRatio, &str, (u32, u32))] = &[
    (AspectRatio::Square, "1:1", (1024, 1024)),
    (AspectRatio::Portrait2x3, "2:3", (832, 1248)),
    (AspectRatio::Landscape3x2, "3:2", (1248, 832)),
    (AspectRatio::Portrait3x4, "3:4", (864, 1184)),
    (AspectRatio::Landscape4x3, "4:3", (1184, 864)),
    (AspectRatio::Portrait4x5, "4:5", (896, 1152)),
    (AspectRatio::Landscape5x4, "5:4", (1152, 896)),
    (AspectRatio::Portrait9x16, "9:16", (768, 1344)),
    (AspectRatio::Landscape16x9, "16:9", (1344, 768)),
    (AspectRatio::Ultrawide21x9, "21:9", (1536, 672)),
];

impl AspectRatio {
    pub fn custom(width: u32, height: u32) -> Result<Self, String> {
        let range = CUSTOM_EDGE_MIN..=CUSTOM_EDGE_MAX;
        if !range.contains(&width) || !range.contains(&height) {
            return Err(format!(
                "Custom size {width}x{height} out of range ({CUSTOM_EDGE_MIN}-{CUSTOM_EDGE_MAX} per edge)."
            ));
        }
        Ok(Self::Custom { width, height })
    }

    pub fn fixed() -> impl Iterator<Item = AspectRatio> {
        FIXED_RATIOS.iter().map(|(ratio, _, _)| *ratio)
    }

    pub fn is_square(&self) -> bool {
        match self {
            Self::Square => true,
            Self::Custom { width, height } => width == height,
            _ => false,
        }
    }

    /// Nominal output size the service renders for this ratio.
    pub fn pixel_size(&self) -> (u32, u32) {
        match self {
            Self::Custom { width, height } => (*width, *height),
            fixed => FIXED_RATIOS
                .iter()
                .find(|(ratio, _, _)| ratio == fixed)
                .map(|(_, _, size)| *size)
                .unwrap_or((1024, 1024)),
        }
    }

    /// Text appended to the prompt; `None` for any 1:1 shape, which is the service default.
    pub fn prompt_hint(&self) -> Option<String> {
        if self.is_square() {
            return None;
        }
        Some(format!("(target aspect ratio: {self})"))
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Custom { width, height } => write!(f, "{width}x{height}"),
            fixed => {
                let label = FIXED_RATIOS
                    .iter()
                    .find(|(ratio, _, _)| ratio == fixed)
                    .map(|(_, label, _)| *label)
                    .unwrap_or("1:1");
                f.write_str(label)
            }
        }
    }
}

impl FromStr for AspectRatio {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        if let Some((ratio, _, _)) = FIXED_RATIOS
            .iter()
            .find(|(_, label, _)| *label == normalized)
        {
            return Ok(*ratio);
        }
        if let Some((left, right)) = normalized.split_once(['x', '×']) {
            let width = left.trim().parse::<u32>().map_err(|_| bad_ratio(raw))?;
            let height = right.trim().parse::<u32>().map_err(|_| bad_ratio(raw))?;
            return Self::custom(width, height);
        }
        Err(bad_ratio(raw))
    }
}

fn bad_ratio(raw: &str) -> String {
    format!("Unsupported aspect ratio '{raw}' (use 1:1, 2:3, ... 21:9 or WxH).")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Artwork,
    Mockup,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Artwork => "artwork",
            Self::Mockup => "mockup",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "artwork" | "art" => Ok(Self::Artwork),
            "mockup" | "mock" => Ok(Self::Mockup),
            other => Err(format!("Unknown job kind '{other}'.")),
        }
    }
}

/// One call to the image service. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    prompt: String,
    reference_images: Vec<EncodedImage>,
    aspect_ratio: AspectRatio,
    target_model: String,
}

impl GenerationRequest {
    pub fn new(
        prompt: impl Into<String>,
        reference_images: Vec<EncodedImage>,
        aspect_ratio: AspectRatio,
        target_model: impl Into<String>,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            reference_images,
            aspect_ratio,
            target_model: target_model.into(),
        }
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn reference_images(&self) -> &[EncodedImage] {
        &self.reference_images
    }

    pub fn aspect_ratio(&self) -> AspectRatio {
        self.aspect_ratio
    }

    pub fn target_model(&self) -> &str {
        &self.target_model
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutcome {
    Success { image: EncodedImage },
    Failure { message: String },
}

impl GenerationOutcome {
    pub fn failure(message: impl Into<String>) -> Self {
        Self::Failure {
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn image(&self) -> Option<&EncodedImage> {
        match self {
            Self::Success { image } => Some(image),
            Self::Failure { .. } => None,
        }
    }

    pub fn failure_message(&self) -> Option<&str> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { message } => Some(message),
        }
    }
}
