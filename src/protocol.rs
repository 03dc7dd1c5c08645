// src/protocol.rs
//
// The worker's message surface: typed requests, responses, and stats.
// These are cheap to create and store - the expensive work happens in the
// dispatch thread.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Output format for encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    Jpeg,
    Png,
    WebP,
    Avif,
    Bmp,
}

impl OutputFormat {
    /// Parse a format keyword, case-insensitively.
    ///
    /// Unknown keywords default to JPEG rather than erroring - the worker
    /// always produces *something* encodable for any request.
    pub fn parse(format: &str) -> Self {
        match format.to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Self::Jpeg,
            "png" => Self::Png,
            "webp" => Self::WebP,
            "avif" => Self::Avif,
            "bmp" => Self::Bmp,
            _ => Self::Jpeg,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
            Self::WebP => "webp",
            Self::Avif => "avif",
            Self::Bmp => "bmp",
        }
    }

    /// Encoding MIME type for this format.
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::WebP => "image/webp",
            Self::Avif => "image/avif",
            Self::Bmp => "image/bmp",
        }
    }
}

/// Scheduling priority for a request.
///
/// `High` requests are queued ahead of normal ones (behind earlier high
/// ones, so each class stays FIFO), but they still take the surface mutex
/// like everyone else - two draws can never interleave on the shared
/// surface.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Priority {
    #[default]
    Normal,
    High,
    Batch,
}

/// Per-request filter options.
#[derive(Clone, Debug)]
pub struct ProcessingOptions {
    /// Apply adaptive unsharp-mask sharpening after the resize draw
    pub sharpen: bool,
    /// Brightness factor (1.0 = unchanged); gamma-corrected scaling
    pub brightness: f32,
    /// Contrast factor (1.0 = unchanged); tanh S-curve
    pub contrast: f32,
    /// Input size cap override in bytes (default 100MB)
    pub max_file_size: Option<u64>,
}

impl Default for ProcessingOptions {
    fn default() -> Self {
        Self {
            sharpen: false,
            brightness: 1.0,
            contrast: 1.0,
            max_file_size: None,
        }
    }
}

/// A single image processing request. Immutable once submitted.
#[derive(Clone, Debug)]
pub struct ProcessingRequest {
    /// Compressed input bytes (shared so batch fan-out never copies them)
    pub bytes: Arc<Vec<u8>>,
    pub target_width: u32,
    pub target_height: u32,
    /// Encode quality 0-100; normalized and clamped at the encode boundary
    pub quality: u8,
    pub format: OutputFormat,
    pub options: ProcessingOptions,
    pub priority: Priority,
    /// Caller-supplied name, echoed back in batch results
    pub original_name: Option<String>,
}

impl ProcessingRequest {
    pub fn new(bytes: Vec<u8>, target_width: u32, target_height: u32) -> Self {
        Self {
            bytes: Arc::new(bytes),
            target_width,
            target_height,
            quality: 80,
            format: OutputFormat::Jpeg,
            options: ProcessingOptions::default(),
            priority: Priority::Normal,
            original_name: None,
        }
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_options(mut self, options: ProcessingOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.original_name = Some(name.into());
        self
    }
}

/// Thumbnail request: aspect-preserving downscale, always JPEG.
#[derive(Clone, Debug)]
pub struct ThumbnailRequest {
    pub bytes: Arc<Vec<u8>>,
    /// Long-edge bound, clamped to [50, 500]; defaults to 200
    pub max_size: Option<u32>,
    /// Encode quality 0-100; defaults to 80
    pub quality: Option<u8>,
}

impl ThumbnailRequest {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(bytes),
            max_size: None,
            quality: None,
        }
    }
}

/// Outcome of one request. Produced exactly once; never thrown.
#[derive(Clone, Debug)]
pub struct ProcessingResult {
    pub success: bool,
    /// Encoded output bytes; present only on success
    pub data: Option<Vec<u8>>,
    /// Output size in bytes
    pub size: u64,
    pub format: OutputFormat,
    pub width: u32,
    pub height: u32,
    /// Original dimensions (thumbnail mode reports both)
    pub original_width: u32,
    pub original_height: u32,
    pub processing_time_ms: f64,
    /// Current RSS at completion, if the memory probe supports it
    pub memory_usage_mb: Option<f64>,
    /// bytes_out / bytes_in
    pub compression_ratio: f64,
    /// Position within a batch (0 for single requests)
    pub index: usize,
    pub original_name: Option<String>,
    pub error: Option<String>,
}

impl ProcessingResult {
    pub fn failure(error: impl Into<String>, format: OutputFormat) -> Self {
        Self {
            success: false,
            data: None,
            size: 0,
            format,
            width: 0,
            height: 0,
            original_width: 0,
            original_height: 0,
            processing_time_ms: 0.0,
            memory_usage_mb: None,
            compression_ratio: 0.0,
            index: 0,
            original_name: None,
            error: Some(error.into()),
        }
    }
}

/// One entry in the bounded error log ring.
#[derive(Clone, Debug)]
pub struct ErrorLogEntry {
    /// Unix milliseconds at failure time
    pub timestamp_ms: u64,
    /// Operation name ("process", "batch", "thumbnail", ...)
    pub operation: &'static str,
    pub message: String,
}

/// Monotonically accumulated worker counters plus a live snapshot of the
/// cache and queue. Reset only by `cleanup`.
#[derive(Clone, Debug, Default)]
pub struct ProcessorStats {
    pub processed_count: u64,
    pub total_processing_time_ms: f64,
    pub cache_hits: u64,
    pub gc_request_count: u64,
    pub cache_size: usize,
    pub queue_length: usize,
    pub error_log: Vec<ErrorLogEntry>,
}

/// What the worker can do, reported by the `Test` command.
#[derive(Clone, Debug)]
pub struct Capabilities {
    pub formats: Vec<OutputFormat>,
    pub chunked_sharpening: bool,
    pub memory_probe: bool,
    pub max_dimension: u32,
}

/// Tagged request union, validated at the dispatcher boundary.
#[derive(Clone, Debug)]
pub enum Command {
    Process(ProcessingRequest),
    Batch(Vec<ProcessingRequest>),
    Thumbnail(ThumbnailRequest),
    Stats,
    Cleanup,
    Ping,
    Test,
    /// Forward-compat escape hatch: anything the worker does not understand.
    Unknown(String),
}

impl Command {
    /// The wire-level operation name for this command.
    pub fn kind(&self) -> &str {
        match self {
            Self::Process(_) => "process",
            Self::Batch(_) => "batch",
            Self::Thumbnail(_) => "thumbnail",
            Self::Stats => "stats",
            Self::Cleanup => "cleanup",
            Self::Ping => "ping",
            Self::Test => "test",
            Self::Unknown(kind) => kind,
        }
    }
}

/// A command plus its correlation id.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub id: u64,
    pub command: Command,
}

impl Envelope {
    pub fn new(id: u64, command: Command) -> Self {
        Self { id, command }
    }
}

/// Everything the worker posts back to its host.
#[derive(Clone, Debug)]
pub enum Response {
    Result {
        id: u64,
        result: ProcessingResult,
    },
    BatchResult {
        id: u64,
        results: Vec<ProcessingResult>,
    },
    Progress {
        id: u64,
        progress: f64,
        completed: usize,
        total: usize,
    },
    Stats {
        id: u64,
        stats: ProcessorStats,
    },
    Cleanup {
        id: u64,
        message: String,
    },
    Pong {
        timestamp_ms: u64,
        stats: ProcessorStats,
    },
    Capabilities {
        timestamp_ms: u64,
        capabilities: Capabilities,
    },
    Error {
        id: u64,
        error: String,
        details: ErrorDetails,
    },
}

/// Machine-usable context attached to a handler-level failure.
#[derive(Clone, Debug)]
pub struct ErrorDetails {
    pub operation: String,
    pub timestamp_ms: u64,
    pub stats: ProcessorStats,
}

/// Unix milliseconds, for response timestamps.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
