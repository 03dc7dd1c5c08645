// src/engine/filters.rs
//
// In-place pixel filter kernels for RGBA8 buffers: unsharp-mask sharpening
// (standard and chunked adaptive variants), gamma-corrected brightness, and
// tanh S-curve contrast.
//
// Shared contract: every filter skips the outermost 1-pixel border (no
// wraparound) and only touches the R,G,B channels - alpha passes through
// unmodified.

/// Images below this pixel count are never sharpened (no visible benefit).
pub const SHARPEN_MIN_PIXELS: u64 = 10_000;

/// Upscales beyond this ratio are never sharpened (sharpening upscale blur
/// only amplifies interpolation artifacts).
pub const SHARPEN_MAX_SCALE_RATIO: f32 = 1.5;

/// Target sample count for the sharpness estimate grid.
const SAMPLE_TARGET_PIXELS: u64 = 10_000;

/// Chunk granularity for the cooperative sharpening loop.
const CHUNK_PIXELS: usize = 10_000;

/// Yield to the scheduler after this many chunks.
const YIELD_EVERY_CHUNKS: usize = 10;

/// Images above this pixel count use the chunked sharpening path.
const CHUNKING_THRESHOLD_PIXELS: u64 = 1_000_000;

#[inline]
fn luminance(r: u8, g: u8, b: u8) -> f32 {
    0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32
}

/// Estimate how sharp an image already is, in [0, 1].
///
/// Samples a roughly constant ~10,000-pixel grid and measures local
/// luminance gradients (Rec.601 weights). 0 means flat, 1 means very busy.
pub fn estimate_sharpness(pixels: &[u8], width: u32, height: u32) -> f32 {
    let total = width as u64 * height as u64;
    if width < 2 || height < 2 || total == 0 {
        return 0.0;
    }

    // Grid step so roughly SAMPLE_TARGET_PIXELS land in the image.
    let step = ((total as f64 / SAMPLE_TARGET_PIXELS as f64).sqrt() as u32).max(1);

    let w = width as usize;
    let mut gradient_sum = 0.0f64;
    let mut samples = 0u64;

    let mut y = 0u32;
    while y + 1 < height {
        let mut x = 0u32;
        while x + 1 < width {
            let idx = (y as usize * w + x as usize) * 4;
            let right = idx + 4;
            let down = idx + w * 4;

            let lum = luminance(pixels[idx], pixels[idx + 1], pixels[idx + 2]);
            let lum_right = luminance(pixels[right], pixels[right + 1], pixels[right + 2]);
            let lum_down = luminance(pixels[down], pixels[down + 1], pixels[down + 2]);

            gradient_sum += ((lum - lum_right).abs() + (lum - lum_down).abs()) as f64;
            samples += 1;
            x += step;
        }
        y += step;
    }

    if samples == 0 {
        return 0.0;
    }
    // Mean gradient of 64 (out of 255) is already a very detailed image.
    ((gradient_sum / samples as f64) / 64.0).clamp(0.0, 1.0) as f32
}

/// Kernel strength for the adaptive variant: already-sharp images and heavy
/// upscales receive less aggressive sharpening.
pub fn adaptive_strength(sharpness: f32, scale_ratio: f32) -> f32 {
    let base = 0.8 * (1.0 - sharpness);
    let scale_term = (SHARPEN_MAX_SCALE_RATIO - scale_ratio).clamp(0.2, 1.2);
    (base * scale_term).clamp(0.1, 1.0)
}

/// 3x3 unsharp-mask convolution, in place.
///
/// `strength` scales the Laplacian contribution: 0 is a no-op, 1 is the full
/// [0,-1,0; -1,5,-1; 0,-1,0] kernel.
pub fn sharpen(pixels: &mut [u8], width: u32, height: u32, strength: f32) {
    if width < 3 || height < 3 || strength <= 0.0 {
        return;
    }
    let source = pixels.to_vec();
    sharpen_rows(pixels, &source, width, 1, height - 1, strength);
}

/// Chunked adaptive sharpening for the resize-draw path.
///
/// Skips entirely when the image is too small or the draw was a heavy
/// upscale. Large images (>1MP) process in ~10,000-pixel row bands with a
/// cooperative yield every 10 chunks so the dispatch thread never disappears
/// into one long convolution.
pub fn sharpen_adaptive(pixels: &mut [u8], width: u32, height: u32, scale_ratio: f32) {
    let total = width as u64 * height as u64;
    if total < SHARPEN_MIN_PIXELS || scale_ratio > SHARPEN_MAX_SCALE_RATIO {
        return;
    }
    if width < 3 || height < 3 {
        return;
    }

    let sharpness = estimate_sharpness(pixels, width, height);
    let strength = adaptive_strength(sharpness, scale_ratio);

    if total <= CHUNKING_THRESHOLD_PIXELS {
        sharpen(pixels, width, height, strength);
        return;
    }

    let source = pixels.to_vec();
    let rows_per_chunk = (CHUNK_PIXELS / width as usize).max(1) as u32;

    let mut row = 1u32;
    let mut chunk = 0usize;
    while row < height - 1 {
        let end = (row + rows_per_chunk).min(height - 1);
        sharpen_rows(pixels, &source, width, row, end, strength);
        row = end;
        chunk += 1;
        if chunk % YIELD_EVERY_CHUNKS == 0 {
            std::thread::yield_now();
        }
    }
}

/// Convolve rows [row_start, row_end) reading from the unmodified source.
fn sharpen_rows(
    pixels: &mut [u8],
    source: &[u8],
    width: u32,
    row_start: u32,
    row_end: u32,
    strength: f32,
) {
    let w = width as usize;
    let center_weight = 1.0 + 4.0 * strength;

    for y in row_start..row_end {
        for x in 1..width - 1 {
            let idx = (y as usize * w + x as usize) * 4;
            let up = idx - w * 4;
            let down = idx + w * 4;

            for c in 0..3 {
                let sum = center_weight * source[idx + c] as f32
                    - strength
                        * (source[up + c] as f32
                            + source[down + c] as f32
                            + source[idx - 4 + c] as f32
                            + source[idx + 4 + c] as f32);
                pixels[idx + c] = sum.clamp(0.0, 255.0) as u8;
            }
            // alpha untouched
        }
    }
}

/// Gamma-corrected brightness scaling, in place.
///
/// Normalizes each channel to [0,1], raises to 1/gamma (gamma = 1/1.2 when
/// brightening, 1.2 when darkening), multiplies by the factor, clamps.
/// Avoids the harsh highlight clipping of naive linear multiplication.
pub fn adjust_brightness(pixels: &mut [u8], width: u32, height: u32, factor: f32) {
    if width < 3 || height < 3 {
        return;
    }
    let gamma = if factor > 1.0 { 1.0 / 1.2 } else { 1.2 };
    let exponent = 1.0 / gamma;

    let lut = build_lut(|v| {
        let normalized = v as f32 / 255.0;
        (normalized.powf(exponent) * factor * 255.0).clamp(0.0, 255.0) as u8
    });
    apply_lut(pixels, width, height, &lut);
}

/// S-curve contrast via tanh, in place.
///
/// `tanh(normalized * factor) * 127 + 128` with `normalized =
/// (value-128)/127` - smooth highlight/shadow rolloff instead of hard
/// clipping. 128 is a fixed point for every factor.
pub fn adjust_contrast(pixels: &mut [u8], width: u32, height: u32, factor: f32) {
    if width < 3 || height < 3 {
        return;
    }
    let lut = build_lut(|v| {
        let normalized = (v as f32 - 128.0) / 127.0;
        ((normalized * factor).tanh() * 127.0 + 128.0).clamp(0.0, 255.0) as u8
    });
    apply_lut(pixels, width, height, &lut);
}

/// Mild contrast(1.05) x brightness(1.02) pass applied before sharpening on
/// downscale draws. Transient: runs once per draw, no state survives it.
pub fn draw_prefilter(pixels: &mut [u8], width: u32, height: u32) {
    if width < 3 || height < 3 {
        return;
    }
    let lut = build_lut(|v| {
        let contrasted = ((v as f32 - 128.0) / 127.0 * 1.05).tanh() * 127.0 + 128.0;
        (contrasted * 1.02).clamp(0.0, 255.0) as u8
    });
    apply_lut(pixels, width, height, &lut);
}

fn build_lut(f: impl Fn(u8) -> u8) -> [u8; 256] {
    let mut lut = [0u8; 256];
    for (v, slot) in lut.iter_mut().enumerate() {
        *slot = f(v as u8);
    }
    lut
}

/// Apply a per-channel LUT to R,G,B of every interior pixel.
fn apply_lut(pixels: &mut [u8], width: u32, height: u32, lut: &[u8; 256]) {
    let w = width as usize;
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let idx = (y as usize * w + x as usize) * 4;
            pixels[idx] = lut[pixels[idx] as usize];
            pixels[idx + 1] = lut[pixels[idx + 1] as usize];
            pixels[idx + 2] = lut[pixels[idx + 2] as usize];
        }
    }
}
