//! Image normalization and generation backends for the exterior flooring
//! redesign tool.
//!
//! The normalizer bounds a user-supplied photo to [`MAX_IMAGE_DIMENSION`]
//! and re-encodes it as JPEG for transmission; generators take the
//! normalized payload plus an instruction and return one edited image.

use std::env;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};
use reqwest::blocking::Client as HttpClient;
use resurface_contracts::session::{GeneratedImage, SourceImage};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Largest edge allowed after normalization, in pixels.
pub const MAX_IMAGE_DIMENSION: u32 = 1024;
/// JPEG quality factor used when re-encoding the normalized photo.
pub const JPEG_QUALITY: u8 = 90;
/// Model used for the image edit.
pub const GENERATION_MODEL: &str = "gemini-2.5-flash-image";

const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const UPSTREAM_BODY_MAX_CHARS: usize = 512;

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("input is not an image")]
    InvalidInputKind,
    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("no raster surface for a {width}x{height} image")]
    Environment { width: u32, height: u32 },
}

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("GEMINI_API_KEY or GOOGLE_API_KEY not set")]
    Configuration,
    #[error("no content generated")]
    EmptyResponse,
    #[error("no image data found in response")]
    NoImageData,
    #[error("{0}")]
    Upstream(String),
}

/// Computes output dimensions for the bounded resize.
///
/// The larger dimension is clamped to [`MAX_IMAGE_DIMENSION`], the smaller
/// one is scaled by the same ratio and rounded to the nearest pixel. Images
/// already within bounds keep their dimensions.
pub fn scaled_dimensions(width: u32, height: u32) -> (u32, u32) {
    let max = MAX_IMAGE_DIMENSION;
    if width > height {
        if width > max {
            let scaled = (f64::from(height) * f64::from(max) / f64::from(width)).round() as u32;
            return (max, scaled.max(1));
        }
    } else if height > max {
        let scaled = (f64::from(width) * f64::from(max) / f64::from(height)).round() as u32;
        return (scaled.max(1), max);
    }
    (width, height)
}

/// Decodes an arbitrary image, bounds it to [`MAX_IMAGE_DIMENSION`], and
/// re-encodes as JPEG at [`JPEG_QUALITY`], yielding both the base64 payload
/// for the API and a displayable preview URL of the same bytes.
///
/// Non-image input is rejected by format sniffing before any pixel work.
/// The input buffer is never mutated. Output dimensions are deterministic;
/// the encoded bytes are not guaranteed bit-stable across encoder versions.
pub fn normalize_bytes(bytes: &[u8]) -> Result<SourceImage, NormalizeError> {
    image::guess_format(bytes).map_err(|_| NormalizeError::InvalidInputKind)?;
    let decoded = image::load_from_memory(bytes)?;
    let (width, height) = (decoded.width(), decoded.height());
    if width == 0 || height == 0 {
        return Err(NormalizeError::Environment { width, height });
    }
    let (out_width, out_height) = scaled_dimensions(width, height);

    // JPEG carries no alpha channel; composite transparent pixels over white
    // before encoding so they do not collapse to black.
    let rgba = decoded.to_rgba8();
    let mut flattened = RgbaImage::new(width, height);
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = u16::from(pixel[3]);
        let blend = |channel: u8| -> u8 {
            (((u16::from(channel) * alpha) + (255 * (255 - alpha))) / 255) as u8
        };
        flattened.put_pixel(
            x,
            y,
            Rgba([blend(pixel[0]), blend(pixel[1]), blend(pixel[2]), 255]),
        );
    }

    let surface = DynamicImage::ImageRgba8(flattened);
    let rendered = if (out_width, out_height) == (width, height) {
        surface.to_rgb8()
    } else {
        surface
            .resize_exact(out_width, out_height, FilterType::Triangle)
            .to_rgb8()
    };

    let mut jpeg = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY);
    encoder.encode_image(&DynamicImage::ImageRgb8(rendered))?;

    let base64_data = BASE64.encode(&jpeg);
    let preview_url = format!("data:image/jpeg;base64,{base64_data}");
    Ok(SourceImage {
        mime_type: "image/jpeg".to_string(),
        base64_data,
        preview_url,
        width: out_width,
        height: out_height,
    })
}

/// One generation request: the normalized photo plus the user's material
/// description. Built at submit time, never retained.
#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    pub image: &'a SourceImage,
    pub instruction: &'a str,
}

/// Wraps the user's material description in the fixed edit directive: only
/// the ground surface in the entrance area changes, everything else stays.
pub fn compose_instruction(user_prompt: &str) -> String {
    format!(
        "Change the flooring or paving in the entrance area of this image to: {}. \
         Keep the building facade, walls, and other architectural details exactly \
         as they are. Make it look photorealistic and naturally lit matching the \
         original scene.",
        user_prompt.trim()
    )
}

pub trait ImageGenerator: Send + Sync {
    fn name(&self) -> &str;
    /// Produces one edited image or fails. Exactly one attempt; no retry,
    /// no backoff, no local timeout.
    fn generate(&self, request: &GenerationRequest) -> Result<GeneratedImage, GenerateError>;
}

/// Generator backed by the Gemini `generateContent` endpoint.
pub struct GeminiGenerator {
    api_base: String,
    http: HttpClient,
}

impl GeminiGenerator {
    pub fn new() -> Self {
        Self {
            api_base: env::var("RESURFACE_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            http: HttpClient::new(),
        }
    }

    fn api_key() -> Option<String> {
        non_empty_env("GEMINI_API_KEY").or_else(|| non_empty_env("GOOGLE_API_KEY"))
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.api_base, GENERATION_MODEL
        )
    }

    fn build_payload(request: &GenerationRequest) -> Value {
        json!({
            "contents": [{
                "role": "user",
                "parts": [
                    {
                        "inlineData": {
                            "mimeType": request.image.mime_type,
                            "data": request.image.base64_data,
                        }
                    },
                    { "text": compose_instruction(request.instruction) },
                ],
            }],
            "generationConfig": {
                "responseModalities": ["IMAGE"],
            },
        })
    }

    /// Pulls the first image part out of the first candidate. The result is
    /// reported as PNG regardless of the input format, matching what the
    /// endpoint returns for image-modality responses.
    fn extract_first_image(response_payload: &Value) -> Result<GeneratedImage, GenerateError> {
        let parts = response_payload
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .and_then(|candidate| candidate.get("content"))
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
            .ok_or(GenerateError::EmptyResponse)?;

        for part in parts {
            let data = part
                .get("inlineData")
                .or_else(|| part.get("inline_data"))
                .and_then(|inline| inline.get("data"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            if data.is_empty() {
                continue;
            }
            BASE64.decode(data.as_bytes()).map_err(|_| {
                GenerateError::Upstream("generated image base64 decode failed".to_string())
            })?;
            return Ok(GeneratedImage {
                png_base64: data.to_string(),
            });
        }

        Err(GenerateError::NoImageData)
    }
}

impl Default for GeminiGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageGenerator for GeminiGenerator {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate(&self, request: &GenerationRequest) -> Result<GeneratedImage, GenerateError> {
        let api_key = Self::api_key().ok_or(GenerateError::Configuration)?;
        let payload = Self::build_payload(request);

        let response = self
            .http
            .post(self.endpoint())
            .query(&[("key", api_key.as_str())])
            .json(&payload)
            .send()
            .map_err(|err| GenerateError::Upstream(err.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .map_err(|err| GenerateError::Upstream(err.to_string()))?;
        if !status.is_success() {
            return Err(GenerateError::Upstream(format!(
                "generation request failed ({}): {}",
                status.as_u16(),
                truncate_text(&body, UPSTREAM_BODY_MAX_CHARS)
            )));
        }

        let parsed: Value = serde_json::from_str(&body).map_err(|_| {
            GenerateError::Upstream("generation endpoint returned invalid JSON".to_string())
        })?;
        Self::extract_first_image(&parsed)
    }
}

/// Offline generator: renders a flat-color PNG at the source dimensions,
/// with the color derived from the prompt. Keeps the full pipeline
/// exercisable without credentials or network.
pub struct DryrunGenerator;

impl ImageGenerator for DryrunGenerator {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate(&self, request: &GenerationRequest) -> Result<GeneratedImage, GenerateError> {
        let (r, g, b) = color_from_prompt(request.instruction);
        let mut rendered = RgbImage::new(request.image.width.max(1), request.image.height.max(1));
        for pixel in rendered.pixels_mut() {
            *pixel = Rgb([r, g, b]);
        }
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(rendered)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .map_err(|err| GenerateError::Upstream(err.to_string()))?;
        Ok(GeneratedImage {
            png_base64: BASE64.encode(&bytes),
        })
    }
}

/// Writes the generated PNG under `out_dir` with a timestamp-based name and
/// returns the path.
pub fn export_png(image: &GeneratedImage, out_dir: &Path) -> anyhow::Result<PathBuf> {
    let bytes = BASE64
        .decode(image.png_base64.as_bytes())
        .context("generated image base64 decode failed")?;
    fs::create_dir_all(out_dir).with_context(|| format!("failed to create {}", out_dir.display()))?;
    let path = out_dir.join(format!("exterior-redesign-{}.png", timestamp_millis()));
    fs::write(&path, bytes).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

fn color_from_prompt(prompt: &str) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.trim().as_bytes());
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

fn timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0)
}
