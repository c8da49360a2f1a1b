use std::fs;
use std::path::{Path, PathBuf};

use studio_contracts::generation::EncodedImage;

use crate::error::{StudioError, StudioResult};
use crate::normalize;

/// Where user-supplied images come from (file picker, clipboard...).
///
/// `Ok(None)` means nothing was offered; that is not an error.
pub trait ImageSource {
    fn acquire_image(&self) -> StudioResult<Option<EncodedImage>>;
}

#[derive(Debug, Clone)]
pub struct FileImageSource {
    path: PathBuf,
}

impl FileImageSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ImageSource for FileImageSource {
    fn acquire_image(&self) -> StudioResult<Option<EncodedImage>> {
        if !self.path.is_file() {
            return Ok(None);
        }
        let bytes = fs::read(&self.path).map_err(|err| {
            StudioError::Decode(format!("failed reading {}: {err}", self.path.display()))
        })?;
        let image = EncodedImage::new(bytes, mime_for_path(&self.path).unwrap_or("image/png"));
        normalize::dimensions(&image)?;
        Ok(Some(image))
    }
}

pub fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use image::Rgba;

    use super::*;
    use crate::normalize::solid_png;

    #[test]
    fn missing_file_is_an_empty_result() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let source = FileImageSource::new(temp.path().join("nope.png"));
        assert!(source.acquire_image()?.is_none());
        Ok(())
    }

    #[test]
    fn reads_and_validates_images() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let good = temp.path().join("art.PNG");
        fs::write(&good, solid_png(4, 4, Rgba([1, 2, 3, 255])).bytes())?;
        let image = FileImageSource::new(&good)
            .acquire_image()?
            .ok_or_else(|| anyhow::anyhow!("expected an image"))?;
        assert_eq!(image.mime_type(), "image/png");

        let bad = temp.path().join("notes.jpg");
        fs::write(&bad, "hello")?;
        assert!(matches!(
            FileImageSource::new(bad).acquire_image(),
            Err(StudioError::Decode(_))
        ));
        Ok(())
    }
}
