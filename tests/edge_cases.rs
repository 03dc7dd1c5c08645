// tests/edge_cases.rs
//
// Boundary and failure-path coverage: validation order, size caps,
// degenerate dimensions, and format keyword handling.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use raster_worker::engine::{ImageProcessor, NoopProbe};
use raster_worker::{GovernorConfig, OutputFormat, ProcessingRequest, ThumbnailRequest};

fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbaImage::from_fn(width, height, |x, y| {
        Rgba([(x % 256) as u8, (y % 256) as u8, 128, 255])
    });
    let mut buf = Vec::new();
    DynamicImage::ImageRgba8(img)
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}

fn test_processor() -> ImageProcessor {
    ImageProcessor::new(
        GovernorConfig {
            recovery_wait: Duration::from_millis(0),
            ..Default::default()
        },
        Arc::new(NoopProbe),
    )
}

#[test]
fn empty_input_is_rejected_before_anything_else() {
    let mut processor = test_processor();
    let request = ProcessingRequest::new(Vec::new(), 100, 100);
    let result = processor.process(&request, 0);
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("Invalid or empty image data"));
}

#[test]
fn oversized_input_names_both_sizes_without_decoding() {
    let mut processor = test_processor();
    // Garbage payload over the per-request cap. The size check must fire
    // first, so the error names both megabyte figures rather than a
    // bitmap failure.
    let mut request = ProcessingRequest::new(vec![0u8; 2 * 1024 * 1024], 100, 100);
    request.options.max_file_size = Some(1024 * 1024);
    let result = processor.process(&request, 0);
    assert!(!result.success);
    let message = result.error.unwrap();
    assert_eq!(message, "Image too large: 2.0MB exceeds 1.0MB limit");
}

#[test]
fn undecodable_bytes_report_bitmap_failure() {
    let mut processor = test_processor();
    let request = ProcessingRequest::new(vec![0x00, 0x01, 0x02, 0x03, 0x04], 50, 50);
    let result = processor.process(&request, 0);
    assert!(!result.success);
    assert!(result
        .error
        .as_deref()
        .unwrap()
        .starts_with("Failed to create image bitmap"));
}

#[test]
fn zero_target_dimension_is_out_of_range() {
    let mut processor = test_processor();
    for (w, h) in [(0u32, 50u32), (50, 0), (0, 0)] {
        let request = ProcessingRequest::new(png_bytes(20, 20), w, h);
        let result = processor.process(&request, 0);
        assert!(!result.success, "{w}x{h} should fail");
        assert!(result.error.as_deref().unwrap().contains("must be within"));
    }
}

#[test]
fn target_above_dimension_cap_is_rejected() {
    let mut processor = test_processor();
    let request = ProcessingRequest::new(png_bytes(20, 20), 8193, 10);
    let result = processor.process(&request, 0);
    assert!(!result.success);
    assert!(result.error.as_deref().unwrap().contains("8192"));
}

#[test]
fn dimension_cap_boundary_is_inclusive() {
    let mut processor = test_processor();
    // 8192x1 is within range and small enough for the memory budget.
    let request = ProcessingRequest::new(png_bytes(20, 20), 8192, 1);
    let result = processor.process(&request, 0);
    assert!(result.success, "error: {:?}", result.error);
    assert_eq!((result.width, result.height), (8192, 1));
}

#[test]
fn one_by_one_source_and_target_work() {
    let mut processor = test_processor();
    let request = ProcessingRequest::new(png_bytes(1, 1), 1, 1);
    let result = processor.process(&request, 0);
    assert!(result.success, "error: {:?}", result.error);
    assert_eq!((result.width, result.height), (1, 1));
}

#[test]
fn upscale_is_allowed_in_process_mode() {
    let mut processor = test_processor();
    let request = ProcessingRequest::new(png_bytes(10, 10), 100, 100);
    let result = processor.process(&request, 0);
    assert!(result.success, "error: {:?}", result.error);
    assert_eq!((result.width, result.height), (100, 100));
}

#[test]
fn thumbnail_never_upscales() {
    let mut processor = test_processor();
    let request = ThumbnailRequest::new(png_bytes(120, 80));
    let result = processor.thumbnail(&request);
    assert!(result.success, "error: {:?}", result.error);
    assert_eq!((result.width, result.height), (120, 80));
}

#[test]
fn thumbnail_keeps_short_edge_visible_for_extreme_aspect() {
    let mut processor = test_processor();
    // 4000x40 would scale to 200x2; the short edge is floored instead.
    let request = ThumbnailRequest::new(png_bytes(4000, 40));
    let result = processor.thumbnail(&request);
    assert!(result.success, "error: {:?}", result.error);
    assert_eq!((result.width, result.height), (200, 50));
}

#[test]
fn quality_extremes_still_encode() {
    let mut processor = test_processor();
    for quality in [0u8, 1, 100] {
        let request = ProcessingRequest::new(png_bytes(50, 50), 25, 25).with_quality(quality);
        let result = processor.process(&request, 0);
        assert!(result.success, "quality {quality}: {:?}", result.error);
        assert!(result.size > 0);
    }
}

#[test]
fn webp_quality_above_cap_still_encodes_lossy() {
    let mut processor = test_processor();
    let request = ProcessingRequest::new(png_bytes(50, 50), 25, 25)
        .with_format(OutputFormat::WebP)
        .with_quality(100);
    let result = processor.process(&request, 0);
    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(&result.data.unwrap()[..4], b"RIFF");
}

#[test]
fn format_keywords_parse_case_insensitively() {
    assert_eq!(OutputFormat::parse("WEBP"), OutputFormat::WebP);
    assert_eq!(OutputFormat::parse("WebP"), OutputFormat::WebP);
    assert_eq!(OutputFormat::parse("JPG"), OutputFormat::Jpeg);
    assert_eq!(OutputFormat::parse("Png"), OutputFormat::Png);
    assert_eq!(OutputFormat::parse("avif"), OutputFormat::Avif);
}

#[test]
fn unknown_format_keyword_defaults_to_jpeg() {
    assert_eq!(OutputFormat::parse("heic"), OutputFormat::Jpeg);
    assert_eq!(OutputFormat::parse(""), OutputFormat::Jpeg);
    assert_eq!(OutputFormat::parse("tiff"), OutputFormat::Jpeg);
}

#[test]
fn jpeg_input_decodes_and_reencodes() {
    let mut processor = test_processor();
    let img = RgbaImage::from_pixel(80, 60, Rgba([200, 100, 50, 255]));
    let mut jpeg = Vec::new();
    DynamicImage::ImageRgba8(img)
        .to_rgb8()
        .write_to(&mut Cursor::new(&mut jpeg), ImageFormat::Jpeg)
        .unwrap();

    let request = ProcessingRequest::new(jpeg, 40, 30).with_format(OutputFormat::Png);
    let result = processor.process(&request, 0);
    assert!(result.success, "error: {:?}", result.error);
    assert_eq!((result.original_width, result.original_height), (80, 60));
    assert_eq!((result.width, result.height), (40, 30));
}

#[test]
fn alpha_survives_png_round_trip() {
    let mut processor = test_processor();
    let img = RgbaImage::from_pixel(40, 40, Rgba([255, 0, 0, 128]));
    let mut png = Vec::new();
    DynamicImage::ImageRgba8(img)
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .unwrap();

    let request = ProcessingRequest::new(png, 40, 40).with_format(OutputFormat::Png);
    let result = processor.process(&request, 0);
    assert!(result.success, "error: {:?}", result.error);
    let decoded = image::load_from_memory(&result.data.unwrap())
        .unwrap()
        .to_rgba8();
    assert_eq!(decoded.get_pixel(20, 20)[3], 128);
}

#[test]
fn compression_ratio_is_input_over_output() {
    let mut processor = test_processor();
    let bytes = png_bytes(100, 100);
    let input_len = bytes.len() as f64;
    let request = ProcessingRequest::new(bytes, 50, 50);
    let result = processor.process(&request, 0);
    assert!(result.success);
    let expected = input_len / result.size as f64;
    assert!((result.compression_ratio - expected).abs() < 1e-9);
}
