// lib.rs
//
// raster-worker: an image processing worker for host applications that need
// resize, filter, format-conversion and thumbnail operations behind a typed
// message boundary.
//
// Design goals:
// - One processor object, one drawing surface, strictly ordered requests
// - Structured failure results, never exceptions across the boundary
// - Memory-pressure aware: adaptive caps, GC-style recovery, bitmap cache

// jemalloc is not supported on Windows/MSVC, exclude it there
#[cfg(all(feature = "jemalloc", not(target_env = "msvc")))]
#[global_allocator]
static ALLOC: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

pub mod engine;
pub mod error;
pub mod protocol;

pub use engine::{
    spawn, GovernorConfig, ImageProcessor, MemoryProbe, NoopProbe, SystemMemoryProbe, WorkerHandle,
};
pub use error::{ErrorCategory, WorkerError};
pub use protocol::{
    Capabilities, Command, Envelope, OutputFormat, Priority, ProcessingOptions, ProcessingRequest,
    ProcessingResult, ProcessorStats, Response, ThumbnailRequest,
};

/// Library version.
pub fn version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// Output formats the worker can encode.
pub fn supported_output_formats() -> Vec<String> {
    vec![
        "jpeg".to_string(),
        "jpg".to_string(),
        "png".to_string(),
        "webp".to_string(),
        "bmp".to_string(),
    ]
}
