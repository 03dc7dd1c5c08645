// src/engine/raster.rs
//
// Raster surface: decode compressed bytes into an RGBA bitmap, redraw it at
// a target size, run the requested pixel filters, and re-encode.
//
// Decoder routing mirrors the format-specific fast paths: JPEG through
// mozjpeg (libjpeg-turbo), PNG through zune-png, WebP through libwebp, and
// everything else through the image crate.

use std::borrow::Cow;

use fast_image_resize::{self as fir, ImageBufferError, MulDiv, PixelType, ResizeOptions};
use image::{imageops::FilterType, DynamicImage, ImageFormat, RgbImage, RgbaImage};
use mozjpeg::{ColorSpace as JpegColorSpace, Compress, Decompress, ScanMode};
use zune_core::colorspace::ColorSpace;
use zune_core::options::DecoderOptions;
use zune_png::PngDecoder;

use crate::engine::filters;
use crate::error::{Result, WorkerError};
use crate::protocol::{OutputFormat, ProcessingOptions};

/// Smoothing quality selected for a resize draw.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Smoothing {
    /// Nearest neighbor. Heavy upscales where interpolation buys nothing.
    Low,
    /// Bilinear. The general case.
    Medium,
    /// Lanczos3. Aggressive downscales and thumbnails.
    High,
}

impl Smoothing {
    /// Pick a quality from the scale ratio `min(dst_w/src_w, dst_h/src_h)`:
    /// high when scaling down aggressively (<0.5), low when upscaling
    /// aggressively (>2), medium otherwise.
    pub fn for_scale_ratio(ratio: f32) -> Self {
        if ratio < 0.5 {
            Smoothing::High
        } else if ratio > 2.0 {
            Smoothing::Low
        } else {
            Smoothing::Medium
        }
    }

    fn resize_alg(self) -> fir::ResizeAlg {
        match self {
            Smoothing::Low => fir::ResizeAlg::Nearest,
            Smoothing::Medium => fir::ResizeAlg::Convolution(fir::FilterType::Bilinear),
            Smoothing::High => fir::ResizeAlg::Convolution(fir::FilterType::Lanczos3),
        }
    }

    fn fallback_filter(self) -> FilterType {
        match self {
            Smoothing::Low => FilterType::Nearest,
            Smoothing::Medium => FilterType::Triangle,
            Smoothing::High => FilterType::Lanczos3,
        }
    }
}

/// `min(dst_w/src_w, dst_h/src_h)`. Below 1 is a downscale.
pub fn scale_ratio(src_width: u32, src_height: u32, dst_width: u32, dst_height: u32) -> f32 {
    if src_width == 0 || src_height == 0 {
        return 1.0;
    }
    let wr = dst_width as f32 / src_width as f32;
    let hr = dst_height as f32 / src_height as f32;
    wr.min(hr)
}

/// Normalize a 0-100 quality into the [0.01, 1.0] encoder range.
///
/// WebP gets a special-case cap: quality above 0.95 is pulled down to 0.92,
/// that format's practical sweet spot.
pub fn clamp_quality(quality: u8, format: OutputFormat) -> f32 {
    let q = (quality as f32 / 100.0).clamp(0.01, 1.0);
    if format == OutputFormat::WebP && q > 0.95 {
        0.92
    } else {
        q
    }
}

/// Aspect-preserving thumbnail dimensions: long edge capped at `max_size`
/// (sources already smaller are never upscaled), short edge floored at 50 so
/// extreme aspect ratios stay legible.
pub fn thumbnail_dimensions(src_width: u32, src_height: u32, max_size: u32) -> (u32, u32) {
    const SHORT_EDGE_FLOOR: u32 = 50;
    if src_width == 0 || src_height == 0 {
        return (1, 1);
    }
    let long_edge = src_width.max(src_height);
    if long_edge <= max_size {
        return (src_width, src_height);
    }
    let scale = max_size as f64 / long_edge as f64;
    let floor = SHORT_EDGE_FLOOR.min(max_size);
    if src_width >= src_height {
        let h = ((src_height as f64 * scale).round() as u32).max(1);
        (max_size, h.max(floor))
    } else {
        let w = ((src_width as f64 * scale).round() as u32).max(1);
        (w.max(floor), max_size)
    }
}

// ---------------------------------------------------------------------------
// Decode

/// Decode JPEG using mozjpeg (backed by libjpeg-turbo). Significantly faster
/// than the image crate's pure Rust decoder.
fn decode_jpeg_mozjpeg(data: &[u8]) -> Result<DynamicImage> {
    if !data.windows(2).any(|pair| pair == [0xFF, 0xD9]) {
        return Err(WorkerError::decode_failed("mozjpeg: missing JPEG EOI marker"));
    }

    let decompress = Decompress::new_mem(data).map_err(|e| {
        WorkerError::decode_failed(format!("mozjpeg decompress init failed: {e:?}"))
    })?;

    let mut decompress = decompress.rgb().map_err(|e| {
        WorkerError::decode_failed(format!("mozjpeg rgb conversion failed: {e:?}"))
    })?;

    let width = decompress.width() as u32;
    let height = decompress.height() as u32;

    let pixels: Vec<[u8; 3]> = decompress.read_scanlines().map_err(|e| {
        WorkerError::decode_failed(format!("mozjpeg: failed to read scanlines: {e:?}"))
    })?;
    let flat_pixels: Vec<u8> = pixels.into_iter().flatten().collect();

    let rgb_image = RgbImage::from_raw(width, height, flat_pixels).ok_or_else(|| {
        WorkerError::decode_failed("mozjpeg: failed to create image from raw data")
    })?;

    Ok(DynamicImage::ImageRgb8(rgb_image))
}

/// Decode PNG using zune-png. 16-bit input is stripped to 8-bit.
fn decode_png_zune(data: &[u8]) -> Result<DynamicImage> {
    let options = DecoderOptions::default().png_set_strip_to_8bit(true);
    let mut decoder = PngDecoder::new_with_options(data, options);
    let pixels = decoder
        .decode()
        .map_err(|e| WorkerError::decode_failed(format!("png: decode failed: {e}")))?;

    let info = decoder
        .get_info()
        .ok_or_else(|| WorkerError::decode_failed("png: missing header info"))?;
    let width = info.width as u32;
    let height = info.height as u32;

    let buf = match pixels {
        zune_core::result::DecodingResult::U8(v) => v,
        _ => return Err(WorkerError::decode_failed("png: unexpected non-U8 pixel buffer")),
    };

    let colorspace = decoder
        .get_colorspace()
        .ok_or_else(|| WorkerError::decode_failed("png: missing colorspace"))?;

    let img = match colorspace {
        ColorSpace::RGB => RgbImage::from_raw(width, height, buf)
            .map(DynamicImage::ImageRgb8)
            .ok_or_else(|| WorkerError::decode_failed("png: failed to build RGB image"))?,
        ColorSpace::RGBA => RgbaImage::from_raw(width, height, buf)
            .map(DynamicImage::ImageRgba8)
            .ok_or_else(|| WorkerError::decode_failed("png: failed to build RGBA image"))?,
        ColorSpace::Luma => image::GrayImage::from_raw(width, height, buf)
            .map(DynamicImage::ImageLuma8)
            .ok_or_else(|| WorkerError::decode_failed("png: failed to build Luma image"))?,
        ColorSpace::LumaA => image::GrayAlphaImage::from_raw(width, height, buf)
            .map(DynamicImage::ImageLumaA8)
            .ok_or_else(|| WorkerError::decode_failed("png: failed to build LumaA image"))?,
        other => {
            return Err(WorkerError::decode_failed(format!(
                "png: unsupported colorspace {other:?}"
            )))
        }
    };

    Ok(img)
}

/// Decode WebP using libwebp. Animated WebP falls back to the image crate.
fn decode_webp_libwebp(data: &[u8]) -> Result<DynamicImage> {
    let features = webp::BitstreamFeatures::new(data)
        .ok_or_else(|| WorkerError::decode_failed("webp: failed to read bitstream features"))?;

    if features.has_animation() {
        return image::load_from_memory(data).map_err(|e| {
            WorkerError::decode_failed(format!("webp (animated) decode failed: {e}"))
        });
    }

    let decoded = webp::Decoder::new(data)
        .decode()
        .ok_or_else(|| WorkerError::decode_failed("webp: decode failed"))?;
    Ok(decoded.to_image())
}

fn decode_with_image_crate(data: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory(data).map_err(|e| WorkerError::decode_failed(format!("{e}")))
}

/// Detect the input format from magic bytes. None if unknown.
pub fn detect_format(bytes: &[u8]) -> Option<ImageFormat> {
    image::guess_format(bytes).ok()
}

/// Unified decode entrypoint: detect the format once, route JPEG to mozjpeg,
/// PNG to zune, WebP to libwebp, and everything else to the image crate.
/// Always returns RGBA pixels; failures surface as "Failed to create image
/// bitmap" errors, never a raw codec panic.
pub fn decode_rgba(bytes: &[u8]) -> Result<RgbaImage> {
    let img = match detect_format(bytes) {
        Some(ImageFormat::Jpeg) => decode_jpeg_mozjpeg(bytes)?,
        Some(ImageFormat::Png) => decode_png_zune(bytes)?,
        Some(ImageFormat::WebP) => decode_webp_libwebp(bytes)?,
        _ => decode_with_image_crate(bytes)?,
    };
    Ok(img.into_rgba8())
}

// ---------------------------------------------------------------------------
// Surface

/// The single drawing surface. One per processor; the worker serializes all
/// rasterization through it.
pub struct Surface {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl Surface {
    pub fn new() -> Self {
        Surface {
            width: 1,
            height: 1,
            pixels: vec![0; 4],
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Shrink to 1x1 and release the pixel allocation. Used by memory
    /// recovery and cleanup.
    pub fn reset(&mut self) {
        self.width = 1;
        self.height = 1;
        self.pixels = vec![0; 4];
    }

    /// Resize-draw `src` into this surface at the target dimensions,
    /// replacing any previous contents.
    pub fn draw_resized(
        &mut self,
        src: &RgbaImage,
        dst_width: u32,
        dst_height: u32,
        smoothing: Smoothing,
    ) -> Result<()> {
        let (src_width, src_height) = src.dimensions();
        if src_width == 0 || src_height == 0 {
            return Err(WorkerError::invalid_source_dimensions());
        }

        if src_width == dst_width && src_height == dst_height {
            self.width = dst_width;
            self.height = dst_height;
            self.pixels = src.as_raw().clone();
            return Ok(());
        }

        let resized = fast_resize_rgba(src, dst_width, dst_height, smoothing)?;
        self.width = dst_width;
        self.height = dst_height;
        self.pixels = resized;
        Ok(())
    }

    /// Full draw pipeline: resize, then the optional pre-filter, adaptive
    /// sharpening, and brightness/contrast adjustments.
    ///
    /// The contrast/brightness pre-filter runs only when sharpening is
    /// requested and this is a downscale; it is transient state of the draw
    /// and never leaks into subsequent draws.
    pub fn render(
        &mut self,
        src: &RgbaImage,
        dst_width: u32,
        dst_height: u32,
        options: &ProcessingOptions,
    ) -> Result<()> {
        let (src_width, src_height) = src.dimensions();
        let ratio = scale_ratio(src_width, src_height, dst_width, dst_height);
        let smoothing = Smoothing::for_scale_ratio(ratio);
        self.draw_resized(src, dst_width, dst_height, smoothing)?;

        if options.sharpen {
            if ratio < 1.0 {
                filters::draw_prefilter(&mut self.pixels, dst_width, dst_height);
            }
            filters::sharpen_adaptive(&mut self.pixels, dst_width, dst_height, ratio);
        }
        if (options.brightness - 1.0).abs() > f32::EPSILON {
            filters::adjust_brightness(&mut self.pixels, dst_width, dst_height, options.brightness);
        }
        if (options.contrast - 1.0).abs() > f32::EPSILON {
            filters::adjust_contrast(&mut self.pixels, dst_width, dst_height, options.contrast);
        }
        Ok(())
    }

    /// Encode the current surface contents. AVIF has no native encoder here
    /// and falls back to JPEG.
    pub fn encode(&self, format: OutputFormat, quality: u8) -> Result<Vec<u8>> {
        let q = clamp_quality(quality, format);
        match format {
            OutputFormat::Jpeg | OutputFormat::Avif => self.encode_jpeg(q),
            OutputFormat::Png => self.encode_png(),
            OutputFormat::WebP => self.encode_webp(q),
            OutputFormat::Bmp => self.encode_bmp(),
        }
    }

    /// Encode to JPEG using mozjpeg with web-optimized settings.
    fn encode_jpeg(&self, quality: f32) -> Result<Vec<u8>> {
        let w = self.width as usize;
        let h = self.height as usize;

        // JPEG has no alpha; flatten RGBA to RGB.
        let mut rgb = Vec::with_capacity(w * h * 3);
        for px in self.pixels.chunks_exact(4) {
            rgb.extend_from_slice(&px[..3]);
        }

        let mut comp = Compress::new(JpegColorSpace::JCS_RGB);
        comp.set_size(w, h);
        comp.set_color_space(JpegColorSpace::JCS_YCbCr);
        comp.set_quality(quality * 100.0);
        comp.set_progressive_mode();
        comp.set_optimize_coding(true);
        comp.set_optimize_scans(true);
        comp.set_scan_optimization_mode(ScanMode::AllComponentsTogether);

        let estimated_size = (w * h * 3 / 10).max(4096);
        let mut output = Vec::with_capacity(estimated_size);

        let mut writer = comp.start_compress(&mut output).map_err(|e| {
            WorkerError::encode_failed("jpeg", format!("mozjpeg: failed to start compress: {e:?}"))
        })?;
        let stride = w * 3;
        for row in rgb.chunks(stride) {
            writer.write_scanlines(row).map_err(|e| {
                WorkerError::encode_failed(
                    "jpeg",
                    format!("mozjpeg: failed to write scanlines: {e:?}"),
                )
            })?;
        }
        writer.finish().map_err(|e| {
            WorkerError::encode_failed("jpeg", format!("mozjpeg: failed to finish: {e:?}"))
        })?;

        Ok(output)
    }

    fn encode_png(&self) -> Result<Vec<u8>> {
        let img = self.to_rgba_image()?;
        let mut buf = Vec::new();
        DynamicImage::ImageRgba8(img)
            .write_to(&mut std::io::Cursor::new(&mut buf), ImageFormat::Png)
            .map_err(|e| WorkerError::encode_failed("png", format!("PNG encode failed: {e}")))?;
        Ok(buf)
    }

    fn encode_webp(&self, quality: f32) -> Result<Vec<u8>> {
        let encoder = webp::Encoder::from_rgba(&self.pixels, self.width, self.height);
        let mut config = webp::WebPConfig::new()
            .map_err(|_| WorkerError::internal_panic("failed to create WebPConfig"))?;
        config.quality = quality * 100.0;
        config.method = 4;
        config.autofilter = 1;
        let mem = encoder.encode_advanced(&config).map_err(|e| {
            WorkerError::encode_failed("webp", format!("WebP encode failed: {e:?}"))
        })?;
        Ok(mem.to_vec())
    }

    fn encode_bmp(&self) -> Result<Vec<u8>> {
        let img = self.to_rgba_image()?;
        let mut buf = Vec::new();
        // BMP writer rejects RGBA in some configurations; flatten to RGB.
        DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(img).to_rgb8())
            .write_to(&mut std::io::Cursor::new(&mut buf), ImageFormat::Bmp)
            .map_err(|e| WorkerError::encode_failed("bmp", format!("BMP encode failed: {e}")))?;
        Ok(buf)
    }

    fn to_rgba_image(&self) -> Result<RgbaImage> {
        RgbaImage::from_raw(self.width, self.height, self.pixels.clone()).ok_or_else(|| {
            WorkerError::internal_panic(Cow::Borrowed("surface buffer does not match dimensions"))
        })
    }
}

impl Default for Surface {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// SIMD resize

/// Resize RGBA pixels with fast_image_resize, premultiplying alpha around
/// the convolution so edge pixels do not bleed background color. Falls back
/// to the image crate when fir rejects the buffer.
fn fast_resize_rgba(
    src: &RgbaImage,
    dst_width: u32,
    dst_height: u32,
    smoothing: Smoothing,
) -> Result<Vec<u8>> {
    let (src_width, src_height) = src.dimensions();
    let mut src_pixels = src.as_raw().clone();
    // Alpha is premultiplied manually below, skip fir's internal handling.
    let options = ResizeOptions::new()
        .resize_alg(smoothing.resize_alg())
        .use_alpha(false);

    let primary = match fir::images::Image::from_slice_u8(
        src_width,
        src_height,
        src_pixels.as_mut_slice(),
        PixelType::U8x4,
    ) {
        Ok(src_image) => resize_with_source_image(src_image, dst_width, dst_height, &options),
        Err(ImageBufferError::InvalidBufferAlignment) => {
            let mut aligned = fir::images::Image::new(src_width, src_height, PixelType::U8x4);
            aligned.buffer_mut().copy_from_slice(&src_pixels);
            resize_with_source_image(aligned, dst_width, dst_height, &options)
        }
        Err(other) => Err(format!("fir source image error: {other:?}")),
    };

    match primary {
        Ok(pixels) => Ok(pixels),
        Err(err) => {
            let resized =
                image::imageops::resize(src, dst_width, dst_height, smoothing.fallback_filter());
            tracing::debug!(error = %err, "fir resize failed, used image crate fallback");
            Ok(resized.into_raw())
        }
    }
}

fn resize_with_source_image(
    mut src_image: fir::images::Image<'_>,
    dst_width: u32,
    dst_height: u32,
    options: &ResizeOptions,
) -> std::result::Result<Vec<u8>, String> {
    let mut dst_image = fir::images::Image::new(dst_width, dst_height, PixelType::U8x4);

    let fully_opaque = src_image.buffer().iter().skip(3).step_by(4).all(|&a| a == 255);
    let needs_premultiply =
        !fully_opaque && matches!(options.algorithm, fir::ResizeAlg::Convolution(_));

    let mul_div = MulDiv::default();
    if needs_premultiply {
        mul_div
            .multiply_alpha_inplace(&mut src_image)
            .map_err(|e| format!("failed to premultiply alpha: {e}"))?;
    }

    let mut resizer = fir::Resizer::new();
    resizer
        .resize(&src_image, &mut dst_image, options)
        .map_err(|e| format!("fir resize error: {e:?}"))?;

    if needs_premultiply {
        mul_div
            .divide_alpha_inplace(&mut dst_image)
            .map_err(|e| format!("failed to unpremultiply alpha: {e}"))?;
    }

    Ok(dst_image.into_vec())
}
