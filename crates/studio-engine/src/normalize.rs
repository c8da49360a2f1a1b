use std::io::Cursor;

use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, ImageFormat, Rgba, RgbaImage};
use studio_contracts::generation::EncodedImage;

use crate::error::{StudioError, StudioResult};

/// Edge cap applied to every image the panel sends to the service.
pub const MAX_INPUT_EDGE: u32 = 1536;

const RESAMPLE: FilterType = FilterType::Lanczos3;

pub fn dimensions(image: &EncodedImage) -> StudioResult<(u32, u32)> {
    Ok(decode(image)?.dimensions())
}

/// Fits the image inside `max_edge` and centres it on a square canvas.
/// Margins are transparent unless `background` is given.
pub fn pad_to_square(
    image: &EncodedImage,
    max_edge: u32,
    background: Option<Rgba<u8>>,
) -> StudioResult<EncodedImage> {
    let decoded = decode(image)?;
    let (width, height) = decoded.dimensions();
    let (scaled_w, scaled_h) = if width.max(height) > max_edge {
        fit_within(width, height, max_edge)
    } else {
        (width, height)
    };
    let scaled = if (scaled_w, scaled_h) == (width, height) {
        decoded.to_rgba8()
    } else {
        decoded.resize_exact(scaled_w, scaled_h, RESAMPLE).to_rgba8()
    };

    let side = scaled_w.max(scaled_h);
    let fill = background.unwrap_or(Rgba([0, 0, 0, 0]));
    let mut canvas = RgbaImage::from_pixel(side, side, fill);
    let offset_x = (side - scaled_w) / 2;
    let offset_y = (side - scaled_h) / 2;
    imageops::overlay(&mut canvas, &scaled, i64::from(offset_x), i64::from(offset_y));
    encode_png(&DynamicImage::ImageRgba8(canvas))
}

/// Shrinks so the longer edge is `max_edge`; smaller images come back as-is.
pub fn downscale(image: &EncodedImage, max_edge: u32) -> StudioResult<EncodedImage> {
    let decoded = decode(image)?;
    let (width, height) = decoded.dimensions();
    if width.max(height) <= max_edge {
        return Ok(image.clone());
    }
    let (target_w, target_h) = fit_within(width, height, max_edge);
    encode_png(&decoded.resize_exact(target_w, target_h, RESAMPLE))
}

pub fn upscale_2x(image: &EncodedImage) -> StudioResult<EncodedImage> {
    let decoded = decode(image)?;
    let (width, height) = decoded.dimensions();
    let doubled = decoded.resize_exact(
        width.saturating_mul(2),
        height.saturating_mul(2),
        RESAMPLE,
    );
    encode_png(&doubled)
}

fn fit_within(width: u32, height: u32, max_edge: u32) -> (u32, u32) {
    let scale_edge = |edge: u32, long: u32| -> u32 {
        let scaled = (f64::from(edge) * f64::from(max_edge) / f64::from(long)).round();
        (scaled as u32).max(1)
    };
    if width >= height {
        (max_edge.max(1), scale_edge(height, width))
    } else {
        (scale_edge(width, height), max_edge.max(1))
    }
}

fn decode(image: &EncodedImage) -> StudioResult<DynamicImage> {
    image::load_from_memory(image.bytes())
        .map_err(|err| StudioError::Decode(format!("Could not decode image: {err}")))
}

fn encode_png(image: &DynamicImage) -> StudioResult<EncodedImage> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .map_err(|err| StudioError::Decode(format!("Could not encode image: {err}")))?;
    Ok(EncodedImage::png(bytes))
}

#[cfg(test)]
pub(crate) fn solid_png(width: u32, height: u32, pixel: Rgba<u8>) -> EncodedImage {
    let mut bytes = Vec::new();
    DynamicImage::ImageRgba8(RgbaImage::from_pixel(width, height, pixel))
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap_or_else(|err| panic!("png encode: {err}"));
    EncodedImage::png(bytes)
}
