// imgenie/crates/imgenie/src/imaging.rs
//! Reference-image handling: decoding, canonical resize and PNG encoding.

use base64::{prelude::BASE64_STANDARD, Engine};
use image::{imageops::FilterType, DynamicImage, GenericImageView};
use std::io::Cursor;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use crate::error::{ImgenieError, Result};

/// Backends only accept tensor shapes that are multiples of this.
pub const DIMENSION_MULTIPLE: u32 = 16;

/// Scales `(width, height)` so the long edge equals `long_edge`, truncating the
/// short edge, then rounds both down to a multiple of 16.
pub fn fit_to_canonical(width: u32, height: u32, long_edge: u32) -> Result<(u32, u32)> {
    if width == 0 || height == 0 {
        return Err(ImgenieError::InvalidRequest(format!(
            "reference image has an empty dimension ({}x{})",
            width, height
        )));
    }

    let long = width.max(height) as u64;
    let scaled_w = (width as u64 * long_edge as u64 / long) as u32;
    let scaled_h = (height as u64 * long_edge as u64 / long) as u32;

    let fitted_w = scaled_w - scaled_w % DIMENSION_MULTIPLE;
    let fitted_h = scaled_h - scaled_h % DIMENSION_MULTIPLE;
    if fitted_w < DIMENSION_MULTIPLE || fitted_h < DIMENSION_MULTIPLE {
        return Err(ImgenieError::InvalidRequest(format!(
            "reference image {}x{} collapses to {}x{} at a {}px long edge",
            width, height, fitted_w, fitted_h, long_edge
        )));
    }
    Ok((fitted_w, fitted_h))
}

pub fn decode(bytes: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory(bytes)
        .map_err(|e| ImgenieError::InvalidRequest(format!("cannot decode image: {}", e)))
}

pub fn encode_png(image: &DynamicImage) -> anyhow::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .map_err(|e| anyhow::anyhow!("Failed to encode PNG: {}", e))?;
    Ok(bytes)
}

/// A reference image ready to hand to a backend.
#[derive(Debug, Clone)]
pub struct PreparedImage {
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Decodes, converts to RGB and resizes a reference image to its canonical size.
pub fn prepare_reference(bytes: &[u8], long_edge: u32) -> Result<PreparedImage> {
    let source = decode(bytes)?;
    let (src_w, src_h) = source.dimensions();
    let (width, height) = fit_to_canonical(src_w, src_h, long_edge)?;
    debug!("Resizing reference image from {}x{} to {}x{}", src_w, src_h, width, height);

    let resized = DynamicImage::ImageRgb8(source.to_rgb8()).resize_exact(width, height, FilterType::Lanczos3);
    let png = encode_png(&resized).map_err(|e| ImgenieError::Internal(format!("{:#}", e)))?;
    Ok(PreparedImage { png, width, height })
}

/// Re-encodes an input image as RGB PNG without resizing.
pub fn normalize(bytes: &[u8]) -> Result<PreparedImage> {
    let source = decode(bytes)?;
    let (width, height) = source.dimensions();
    let rgb = DynamicImage::ImageRgb8(source.to_rgb8());
    let png = encode_png(&rgb).map_err(|e| ImgenieError::Internal(format!("{:#}", e)))?;
    Ok(PreparedImage { png, width, height })
}

/// Accepts plain base64 or a `data:image/...;base64,` URL.
pub fn decode_base64_image(payload: &str) -> Result<Vec<u8>> {
    let data = match payload.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => payload,
    };
    BASE64_STANDARD
        .decode(data.trim())
        .map_err(|e| ImgenieError::InvalidRequest(format!("image is not valid base64: {}", e)))
}

pub fn png_data_url(png: &[u8]) -> String {
    format!("data:image/png;base64,{}", BASE64_STANDARD.encode(png))
}

/// Joins `relative` onto `input_dir`, refusing anything that could leave it.
pub fn resolve_input_path(input_dir: &Path, relative: &Path) -> Result<PathBuf> {
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes || relative.as_os_str().is_empty() {
        return Err(ImgenieError::InvalidRequest(format!(
            "reference path {} must be relative to the input directory",
            relative.display()
        )));
    }
    Ok(input_dir.join(relative))
}

/// Extensions picked up when captioning a folder.
pub const CAPTION_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "bmp", "gif", "webp"];

/// Extensions accepted for uploaded files.
pub const UPLOAD_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "gif", "webp"];

pub fn has_extension(path: &Path, allowed: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| allowed.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Image files directly inside `folder`, sorted by name. Sub-directories are
/// not descended into.
pub fn list_images(folder: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(folder).map_err(|e| {
        ImgenieError::InvalidRequest(format!("cannot read folder {}: {}", folder.display(), e))
    })?;
    let mut images = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && has_extension(&path, &CAPTION_EXTENSIONS) {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}
