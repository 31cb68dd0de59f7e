//! Image codec seam. The pipeline only talks to [`ImageCodec`]; the WebP
//! implementation sits on `image` for decoding and `webp` for encoding, with
//! `img-parts` carrying ICC and EXIF chunks over into the output.

use crate::{EngineError, Result};
use image::imageops::FilterType;
use image::metadata::Orientation;
use image::{DynamicImage, GenericImageView, ImageDecoder, ImageReader};
use img_parts::webp::WebP;
use img_parts::{Bytes, ImageEXIF, ImageICC};
use std::ops::Deref;
use std::path::{Path, PathBuf};

pub trait ImageCodec: Send + Sync {
    type Image: Clone;

    fn decode(&self, path: &Path) -> Result<Self::Image>;
    /// Applies the recorded orientation so pixels are upright.
    fn auto_orient(&self, img: Self::Image) -> Self::Image;
    fn is_rgb(&self, img: &Self::Image) -> bool;
    fn to_rgb(&self, img: Self::Image) -> Self::Image;
    fn dimensions(&self, img: &Self::Image) -> (u32, u32);
    fn resize(&self, img: &Self::Image, width: u32, height: u32, filter: FilterType)
        -> Self::Image;
    fn crop(&self, img: Self::Image, width: u32, height: u32, x: u32, y: u32) -> Self::Image;
    fn strip_metadata(&self, img: Self::Image) -> Self::Image;
    /// Encodes into the target format in memory; the caller decides whether
    /// the bytes ever reach storage.
    fn encode(&self, img: &Self::Image, quality: u8) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub source: PathBuf,
    pub pixels: DynamicImage,
    pub orientation: Orientation,
    pub icc_profile: Option<Vec<u8>>,
    pub exif: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WebpCodec;

impl ImageCodec for WebpCodec {
    type Image = DecodedImage;

    fn decode(&self, path: &Path) -> Result<DecodedImage> {
        let decode_err = |reason: String| EngineError::Decode {
            path: path.to_path_buf(),
            reason,
        };
        let mut decoder = ImageReader::open(path)?
            .with_guessed_format()?
            .into_decoder()
            .map_err(|e| decode_err(e.to_string()))?;
        let orientation = decoder.orientation().unwrap_or(Orientation::NoTransforms);
        let icc_profile = decoder.icc_profile().ok().flatten();
        let exif = decoder.exif_metadata().ok().flatten();
        let pixels = DynamicImage::from_decoder(decoder).map_err(|e| decode_err(e.to_string()))?;
        Ok(DecodedImage {
            source: path.to_path_buf(),
            pixels,
            orientation,
            icc_profile,
            exif,
        })
    }

    fn auto_orient(&self, mut img: DecodedImage) -> DecodedImage {
        // The EXIF block still carries the old orientation tag; keeping it
        // would make viewers rotate a second time.
        if img.orientation != Orientation::NoTransforms {
            img.exif = None;
        }
        img.pixels.apply_orientation(img.orientation);
        img.orientation = Orientation::NoTransforms;
        img
    }

    fn is_rgb(&self, img: &DecodedImage) -> bool {
        matches!(
            img.pixels,
            DynamicImage::ImageRgb8(_) | DynamicImage::ImageRgba8(_)
        )
    }

    fn to_rgb(&self, mut img: DecodedImage) -> DecodedImage {
        if self.is_rgb(&img) {
            return img;
        }
        img.pixels = if img.pixels.color().has_alpha() {
            DynamicImage::ImageRgba8(img.pixels.to_rgba8())
        } else {
            DynamicImage::ImageRgb8(img.pixels.to_rgb8())
        };
        img
    }

    fn dimensions(&self, img: &DecodedImage) -> (u32, u32) {
        img.pixels.dimensions()
    }

    fn resize(&self, img: &DecodedImage, width: u32, height: u32, filter: FilterType) -> DecodedImage {
        let mut out = img.clone();
        out.pixels = img.pixels.resize_exact(width.max(1), height.max(1), filter);
        out
    }

    fn crop(&self, mut img: DecodedImage, width: u32, height: u32, x: u32, y: u32) -> DecodedImage {
        img.pixels = img.pixels.crop_imm(x, y, width, height);
        img
    }

    fn strip_metadata(&self, mut img: DecodedImage) -> DecodedImage {
        img.icc_profile = None;
        img.exif = None;
        img
    }

    fn encode(&self, img: &DecodedImage, quality: u8) -> Result<Vec<u8>> {
        let rgb;
        let pixels = if self.is_rgb(img) {
            &img.pixels
        } else {
            rgb = self.to_rgb(img.clone());
            &rgb.pixels
        };
        let encoder = webp::Encoder::from_image(pixels).map_err(|reason| EngineError::Encode {
            path: img.source.clone(),
            reason: reason.to_string(),
        })?;
        let memory = encoder.encode(f32::from(quality.min(100)));
        let bytes = memory.deref().to_vec();
        if img.icc_profile.is_none() && img.exif.is_none() {
            return Ok(bytes);
        }
        embed_metadata(img, bytes)
    }
}

/// Re-wraps encoded WebP bytes with the ICC profile and EXIF block that
/// survived decoding.
fn embed_metadata(img: &DecodedImage, bytes: Vec<u8>) -> Result<Vec<u8>> {
    let encode_err = |reason: String| EngineError::Encode {
        path: img.source.clone(),
        reason,
    };
    let mut webp = WebP::from_bytes(Bytes::from(bytes)).map_err(|e| encode_err(e.to_string()))?;
    webp.set_icc_profile(img.icc_profile.clone().map(Bytes::from));
    webp.set_exif(img.exif.clone().map(Bytes::from));

    let mut out = Vec::new();
    webp.encoder()
        .write_to(&mut out)
        .map_err(|e| encode_err(e.to_string()))?;
    Ok(out)
}
