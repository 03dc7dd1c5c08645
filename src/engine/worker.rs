// src/engine/worker.rs
//
// The worker actor: a single ImageProcessor owning the surface, governor and
// stats, fed by an ordered mailbox and driven by one dispatch thread.
//
// Concurrency model: requests land in a FIFO mailbox guarded by a
// parking_lot Mutex + Condvar; high-priority requests go to the front of the
// queue instead of bypassing the lock. Rasterization is serialized through
// the processor mutex. Ping and Test are answered synchronously on the
// handle without touching the queue.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::Instant;

use image::{Rgba, RgbaImage};
use parking_lot::{Condvar, Mutex};

use crate::engine::batch;
use crate::engine::governor::{cache_key, effective_format, Governor, GovernorConfig, MemoryProbe};
use crate::engine::raster::{self, Smoothing, Surface};
use crate::error::{Result, WorkerError};
use crate::protocol::{
    now_ms, Capabilities, Command, Envelope, ErrorDetails, ErrorLogEntry, OutputFormat, Priority,
    ProcessingRequest, ProcessingResult, ProcessorStats, Response, ThumbnailRequest,
};

const THUMBNAIL_DEFAULT_MAX_SIZE: u32 = 200;
const THUMBNAIL_MIN_MAX_SIZE: u32 = 50;
const THUMBNAIL_MAX_MAX_SIZE: u32 = 500;
const THUMBNAIL_DEFAULT_QUALITY: u8 = 80;

/// The single processing engine: one surface, one governor, one stats block.
/// All rasterization flows through an exclusive borrow of this struct.
pub struct ImageProcessor {
    surface: Surface,
    governor: Governor,
    processed_count: u64,
    total_processing_time_ms: f64,
    cache_hits: u64,
    error_log: VecDeque<ErrorLogEntry>,
}

impl ImageProcessor {
    pub fn new(config: GovernorConfig, probe: Arc<dyn MemoryProbe>) -> Self {
        ImageProcessor {
            surface: Surface::new(),
            governor: Governor::new(config, probe),
            processed_count: 0,
            total_processing_time_ms: 0.0,
            cache_hits: 0,
            error_log: VecDeque::new(),
        }
    }

    /// Process one request into a result. Failures come back as failed
    /// results carrying the error message; nothing propagates as Err.
    pub fn process(&mut self, request: &ProcessingRequest, index: usize) -> ProcessingResult {
        let started = Instant::now();
        match self.process_inner(request) {
            Ok(mut result) => {
                let elapsed = started.elapsed().as_secs_f64() * 1000.0;
                result.processing_time_ms = elapsed;
                result.index = index;
                result.original_name = request.original_name.clone();
                self.processed_count += 1;
                self.total_processing_time_ms += elapsed;
                self.governor
                    .maintain(&mut self.surface, self.processed_count);
                result
            }
            Err(err) => {
                self.record_error("process", &err);
                let mut result = ProcessingResult::failure(err.to_string(), request.format);
                result.index = index;
                result.original_name = request.original_name.clone();
                result
            }
        }
    }

    fn process_inner(&mut self, request: &ProcessingRequest) -> Result<ProcessingResult> {
        self.governor
            .validate_input(&request.bytes, request.options.max_file_size)?;

        // Recovery runs here when pressure is already high; a still-critical
        // reading aborts before any allocation.
        let pressure = self.governor.ensure_headroom(&mut self.surface)?;

        let key = cache_key(request);
        let bitmap = match self.governor.lookup_bitmap(&key) {
            Some(bitmap) => {
                self.cache_hits += 1;
                bitmap
            }
            None => {
                let decoded = raster::decode_rgba(&request.bytes)?;
                let (w, h) = decoded.dimensions();
                if w == 0 || h == 0 {
                    return Err(WorkerError::invalid_source_dimensions());
                }
                let decoded = Arc::new(decoded);
                self.governor
                    .store_bitmap(key, Arc::clone(&decoded), pressure.is_high);
                decoded
            }
        };
        let (original_width, original_height) = bitmap.dimensions();

        self.governor.validate_target(
            request.target_width,
            request.target_height,
            pressure.is_high,
        )?;

        self.surface.render(
            &bitmap,
            request.target_width,
            request.target_height,
            &request.options,
        )?;

        let format = effective_format(request.format);
        let data = self.surface.encode(format, request.quality)?;

        Ok(self.success_result(
            data,
            format,
            request.target_width,
            request.target_height,
            original_width,
            original_height,
            request.bytes.len(),
        ))
    }

    /// Reduced pipeline: aspect-preserving dimensions, always JPEG, always
    /// high smoothing, no filters.
    pub fn thumbnail(&mut self, request: &ThumbnailRequest) -> ProcessingResult {
        let started = Instant::now();
        match self.thumbnail_inner(request) {
            Ok(mut result) => {
                let elapsed = started.elapsed().as_secs_f64() * 1000.0;
                result.processing_time_ms = elapsed;
                self.processed_count += 1;
                self.total_processing_time_ms += elapsed;
                self.governor
                    .maintain(&mut self.surface, self.processed_count);
                result
            }
            Err(err) => {
                self.record_error("thumbnail", &err);
                ProcessingResult::failure(err.to_string(), OutputFormat::Jpeg)
            }
        }
    }

    fn thumbnail_inner(&mut self, request: &ThumbnailRequest) -> Result<ProcessingResult> {
        self.governor.validate_input(&request.bytes, None)?;
        let pressure = self.governor.ensure_headroom(&mut self.surface)?;

        let bitmap = raster::decode_rgba(&request.bytes)?;
        let (original_width, original_height) = bitmap.dimensions();
        if original_width == 0 || original_height == 0 {
            return Err(WorkerError::invalid_source_dimensions());
        }

        let max_size = request
            .max_size
            .unwrap_or(THUMBNAIL_DEFAULT_MAX_SIZE)
            .clamp(THUMBNAIL_MIN_MAX_SIZE, THUMBNAIL_MAX_MAX_SIZE);
        let (width, height) =
            raster::thumbnail_dimensions(original_width, original_height, max_size);

        self.governor
            .validate_target(width, height, pressure.is_high)?;
        self.surface
            .draw_resized(&bitmap, width, height, Smoothing::High)?;

        let quality = request.quality.unwrap_or(THUMBNAIL_DEFAULT_QUALITY);
        let data = self.surface.encode(OutputFormat::Jpeg, quality)?;

        Ok(self.success_result(
            data,
            OutputFormat::Jpeg,
            width,
            height,
            original_width,
            original_height,
            request.bytes.len(),
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn success_result(
        &self,
        data: Vec<u8>,
        format: OutputFormat,
        width: u32,
        height: u32,
        original_width: u32,
        original_height: u32,
        input_len: usize,
    ) -> ProcessingResult {
        let size = data.len() as u64;
        let compression_ratio = if size > 0 {
            input_len as f64 / size as f64
        } else {
            0.0
        };
        let reading = self.governor.check_pressure();
        let memory_usage_mb = if reading.limit > 0 {
            Some(reading.usage as f64 / (1024.0 * 1024.0))
        } else {
            None
        };
        ProcessingResult {
            success: true,
            data: Some(data),
            size,
            format,
            width,
            height,
            original_width,
            original_height,
            processing_time_ms: 0.0,
            memory_usage_mb,
            compression_ratio,
            index: 0,
            original_name: None,
            error: None,
        }
    }

    pub fn check_pressure_high(&self) -> bool {
        self.governor.check_pressure().is_high
    }

    /// Recovery on the batch path, settling for `batch_recovery_wait`
    /// instead of the per-request wait.
    pub fn recover_between_chunks(&mut self) {
        let wait = self.governor.config().batch_recovery_wait;
        self.governor.recover_settling(&mut self.surface, wait);
    }

    pub fn config(&self) -> &GovernorConfig {
        self.governor.config()
    }

    pub fn record_error(&mut self, operation: &'static str, err: &WorkerError) {
        tracing::warn!(operation, error = %err, category = err.category().as_str(), "operation failed");
        self.push_error_entry(operation, err.to_string());
    }

    pub fn record_error_message(&mut self, operation: &'static str, message: String) {
        tracing::warn!(operation, error = %message, "operation failed");
        self.push_error_entry(operation, message);
    }

    fn push_error_entry(&mut self, operation: &'static str, message: String) {
        let capacity = self.governor.config().error_log_capacity;
        if self.error_log.len() >= capacity {
            self.error_log.pop_front();
        }
        self.error_log.push_back(ErrorLogEntry {
            timestamp_ms: now_ms(),
            operation,
            message,
        });
    }

    pub fn stats(&self, queue_length: usize) -> ProcessorStats {
        ProcessorStats {
            processed_count: self.processed_count,
            total_processing_time_ms: self.total_processing_time_ms,
            cache_hits: self.cache_hits,
            gc_request_count: self.governor.gc_request_count(),
            cache_size: self.governor.cache_len(),
            queue_length,
            error_log: self.error_log.iter().cloned().collect(),
        }
    }

    /// Release everything the processor holds: cache, surface, counters and
    /// the error log. In-flight work is unaffected.
    pub fn cleanup(&mut self) {
        self.governor.clear_cache();
        self.governor.reset_counters();
        self.surface.reset();
        self.processed_count = 0;
        self.total_processing_time_ms = 0.0;
        self.cache_hits = 0;
        self.error_log.clear();
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            formats: vec![
                OutputFormat::Jpeg,
                OutputFormat::Png,
                OutputFormat::WebP,
                OutputFormat::Bmp,
            ],
            chunked_sharpening: true,
            memory_probe: self.governor.has_probe(),
            max_dimension: self.governor.config().max_dimension,
        }
    }

    #[cfg(test)]
    pub(crate) fn surface_dimensions(&self) -> (u32, u32) {
        self.surface.dimensions()
    }
}

/// Confirm the raster surface and bitmap-decode path actually work before
/// the first real operation.
fn capability_self_test() -> Result<()> {
    let src = RgbaImage::from_pixel(2, 2, Rgba([30, 60, 90, 255]));
    let mut surface = Surface::new();
    surface
        .draw_resized(&src, 1, 1, Smoothing::Medium)
        .map_err(|e| WorkerError::initialization_failed(format!("surface draw: {e}")))?;
    let encoded = surface
        .encode(OutputFormat::Jpeg, 80)
        .map_err(|e| WorkerError::initialization_failed(format!("encode: {e}")))?;
    raster::decode_rgba(&encoded)
        .map_err(|e| WorkerError::initialization_failed(format!("decode: {e}")))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Mailbox

struct QueueItem {
    envelope: Envelope,
    reply: Sender<Response>,
    high: bool,
}

/// Ordered request queue. High-priority items enter ahead of normal ones
/// but behind earlier high-priority ones, so ordering within each priority
/// class stays FIFO. One Condvar wakes the dispatch thread.
struct Mailbox {
    queue: Mutex<VecDeque<QueueItem>>,
    available: Condvar,
    shutdown: AtomicBool,
}

impl Mailbox {
    fn new() -> Self {
        Mailbox {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    fn push(&self, item: QueueItem) {
        let mut queue = self.queue.lock();
        if item.high {
            let pos = queue.iter().take_while(|queued| queued.high).count();
            queue.insert(pos, item);
        } else {
            queue.push_back(item);
        }
        drop(queue);
        self.available.notify_one();
    }

    fn pop(&self) -> Option<QueueItem> {
        let mut queue = self.queue.lock();
        loop {
            if let Some(item) = queue.pop_front() {
                return Some(item);
            }
            if self.shutdown.load(Ordering::SeqCst) {
                return None;
            }
            self.available.wait(&mut queue);
        }
    }

    fn len(&self) -> usize {
        self.queue.lock().len()
    }

    fn clear(&self) {
        self.queue.lock().clear();
    }

    fn close(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.available.notify_all();
    }
}

// ---------------------------------------------------------------------------
// Worker

struct Shared {
    processor: Mutex<ImageProcessor>,
    mailbox: Mailbox,
    init: OnceLock<std::result::Result<(), WorkerError>>,
}

impl Shared {
    /// Lazy one-time capability self-test. A failure is sticky and fatal for
    /// every subsequent real operation, surfaced as a normal error result.
    fn ensure_initialized(&self) -> Result<()> {
        self.init
            .get_or_init(|| {
                tracing::debug!("running capability self-test");
                capability_self_test()
            })
            .clone()
    }
}

/// Host-side handle: submit envelopes, receive responses, answer liveness
/// probes synchronously.
pub struct WorkerHandle {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

/// Spawn a worker with its dispatch thread.
pub fn spawn(config: GovernorConfig, probe: Arc<dyn MemoryProbe>) -> WorkerHandle {
    let shared = Arc::new(Shared {
        processor: Mutex::new(ImageProcessor::new(config, probe)),
        mailbox: Mailbox::new(),
        init: OnceLock::new(),
    });

    let dispatch_shared = Arc::clone(&shared);
    let thread = std::thread::Builder::new()
        .name("raster-worker".into())
        .spawn(move || dispatch_loop(&dispatch_shared))
        .expect("failed to spawn worker thread");

    WorkerHandle {
        shared,
        thread: Some(thread),
    }
}

impl WorkerHandle {
    /// Submit an envelope. The returned receiver yields every response for
    /// this id: progress messages first for batches, then the final result.
    /// Ping, Test and Unknown are answered before this returns.
    pub fn submit(&self, envelope: Envelope) -> Receiver<Response> {
        let (reply, receiver) = channel();

        match &envelope.command {
            Command::Ping => {
                let _ = reply.send(self.pong());
                return receiver;
            }
            Command::Test => {
                let _ = reply.send(self.capabilities_response());
                return receiver;
            }
            Command::Unknown(kind) => {
                let error = WorkerError::unknown_operation(kind.clone());
                let mut processor = self.shared.processor.lock();
                processor.record_error("unknown", &error);
                let result = ProcessingResult::failure(error.to_string(), OutputFormat::Jpeg);
                let _ = reply.send(Response::Result {
                    id: envelope.id,
                    result,
                });
                return receiver;
            }
            _ => {}
        }

        let high = match &envelope.command {
            Command::Process(request) => request.priority == Priority::High,
            _ => false,
        };
        self.shared.mailbox.push(QueueItem {
            envelope,
            reply,
            high,
        });
        receiver
    }

    /// Liveness probe, answered synchronously from shared state.
    pub fn ping(&self) -> Response {
        self.pong()
    }

    fn pong(&self) -> Response {
        let stats = self.stats_snapshot();
        Response::Pong {
            timestamp_ms: now_ms(),
            stats,
        }
    }

    fn capabilities_response(&self) -> Response {
        let capabilities = self.shared.processor.lock().capabilities();
        Response::Capabilities {
            timestamp_ms: now_ms(),
            capabilities,
        }
    }

    pub fn stats_snapshot(&self) -> ProcessorStats {
        let queue_length = self.shared.mailbox.len();
        self.shared.processor.lock().stats(queue_length)
    }

    pub fn queue_length(&self) -> usize {
        self.shared.mailbox.len()
    }

    /// Stop accepting work and join the dispatch thread. Queued items are
    /// dropped; their receivers disconnect.
    pub fn shutdown(mut self) {
        self.close_and_join();
    }

    fn close_and_join(&mut self) {
        self.shared.mailbox.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.close_and_join();
    }
}

fn dispatch_loop(shared: &Shared) {
    while let Some(item) = shared.mailbox.pop() {
        let id = item.envelope.id;
        let kind = item.envelope.command.kind().to_string();
        let reply = item.reply.clone();

        let outcome = catch_unwind(AssertUnwindSafe(|| handle(shared, item)));
        if let Err(panic) = outcome {
            let message = panic_message(panic);
            tracing::error!(operation = %kind, message = %message, "handler panicked");
            let mut processor = shared.processor.lock();
            processor.record_error_message("dispatch", message.clone());
            let stats = processor.stats(shared.mailbox.len());
            drop(processor);
            let _ = reply.send(Response::Error {
                id,
                error: message,
                details: ErrorDetails {
                    operation: kind,
                    timestamp_ms: now_ms(),
                    stats,
                },
            });
        }
    }
}

fn handle(shared: &Shared, item: QueueItem) {
    let QueueItem { envelope, reply, .. } = item;
    let Envelope { id, command } = envelope;

    match command {
        Command::Process(request) => {
            let result = match shared.ensure_initialized() {
                Ok(()) => shared.processor.lock().process(&request, 0),
                Err(err) => init_failure(shared, "process", err, request.format),
            };
            let _ = reply.send(Response::Result { id, result });
        }
        Command::Thumbnail(request) => {
            let result = match shared.ensure_initialized() {
                Ok(()) => shared.processor.lock().thumbnail(&request),
                Err(err) => init_failure(shared, "thumbnail", err, OutputFormat::Jpeg),
            };
            let _ = reply.send(Response::Result { id, result });
        }
        Command::Batch(requests) => {
            let results = match shared.ensure_initialized() {
                Ok(()) => {
                    let progress_reply = reply.clone();
                    batch::run(&shared.processor, &requests, |progress, completed, total| {
                        let _ = progress_reply.send(Response::Progress {
                            id,
                            progress,
                            completed,
                            total,
                        });
                    })
                }
                Err(err) => {
                    let formats: Vec<OutputFormat> = requests.iter().map(|r| r.format).collect();
                    formats
                        .into_iter()
                        .map(|format| init_failure(shared, "batch", err.clone(), format))
                        .collect()
                }
            };
            let _ = reply.send(Response::BatchResult { id, results });
        }
        Command::Stats => {
            let stats = shared.processor.lock().stats(shared.mailbox.len());
            let _ = reply.send(Response::Stats { id, stats });
        }
        Command::Cleanup => {
            shared.mailbox.clear();
            shared.processor.lock().cleanup();
            let _ = reply.send(Response::Cleanup {
                id,
                message: "Cleanup completed".into(),
            });
        }
        // Answered synchronously in submit; unreachable through the queue.
        Command::Ping | Command::Test | Command::Unknown(_) => {}
    }
}

fn init_failure(
    shared: &Shared,
    operation: &'static str,
    err: WorkerError,
    format: OutputFormat,
) -> ProcessingResult {
    let mut processor = shared.processor.lock();
    processor.record_error(operation, &err);
    ProcessingResult::failure(err.to_string(), format)
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::governor::NoopProbe;
    use image::{DynamicImage, ImageFormat};
    use std::io::Cursor;
    use std::time::Duration;

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

    fn test_config() -> GovernorConfig {
        GovernorConfig {
            recovery_wait: Duration::from_millis(0),
            batch_recovery_wait: Duration::from_millis(0),
            inter_chunk_sleep: Duration::from_millis(0),
            ..Default::default()
        }
    }

    fn test_processor() -> ImageProcessor {
        ImageProcessor::new(test_config(), Arc::new(NoopProbe))
    }

    #[test]
    fn process_resizes_and_reports_dimensions() {
        let mut processor = test_processor();
        let request = ProcessingRequest::new(png_bytes(100, 80), 50, 40);
        let result = processor.process(&request, 0);
        assert!(result.success, "error: {:?}", result.error);
        assert_eq!((result.width, result.height), (50, 40));
        assert_eq!((result.original_width, result.original_height), (100, 80));
        assert!(result.size > 0);
        assert!(result.processing_time_ms >= 0.0);
    }

    #[test]
    fn process_empty_input_fails_without_decode() {
        let mut processor = test_processor();
        let request = ProcessingRequest::new(Vec::new(), 50, 50);
        let result = processor.process(&request, 0);
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Invalid or empty image data"));
    }

    #[test]
    fn process_garbage_reports_bitmap_error() {
        let mut processor = test_processor();
        let request = ProcessingRequest::new(vec![1, 2, 3, 4], 50, 50);
        let result = processor.process(&request, 0);
        assert!(!result.success);
        assert!(result
            .error
            .as_deref()
            .unwrap()
            .starts_with("Failed to create image bitmap"));
    }

    #[test]
    fn process_oversized_target_fails() {
        let mut processor = test_processor();
        let request = ProcessingRequest::new(png_bytes(10, 10), 9000, 10);
        let result = processor.process(&request, 0);
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("8192"));
    }

    #[test]
    fn repeat_request_hits_cache() {
        let mut processor = test_processor();
        let bytes = png_bytes(60, 60);
        let request = ProcessingRequest::new(bytes, 30, 30);
        let first = processor.process(&request, 0);
        let second = processor.process(&request, 0);
        assert!(first.success && second.success);
        assert_eq!(processor.stats(0).cache_hits, 1);
        assert_eq!(first.data, second.data);
    }

    #[test]
    fn thumbnail_respects_aspect_and_format() {
        let mut processor = test_processor();
        let request = ThumbnailRequest::new(png_bytes(1000, 500));
        let result = processor.thumbnail(&request);
        assert!(result.success, "error: {:?}", result.error);
        assert_eq!((result.width, result.height), (200, 100));
        assert_eq!(result.format, OutputFormat::Jpeg);
        let data = result.data.unwrap();
        assert_eq!(&data[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn thumbnail_max_size_is_clamped() {
        let mut processor = test_processor();
        let mut request = ThumbnailRequest::new(png_bytes(2000, 2000));
        request.max_size = Some(10_000);
        let result = processor.thumbnail(&request);
        assert!(result.success);
        assert_eq!((result.width, result.height), (500, 500));
    }

    #[test]
    fn error_log_is_bounded_ring() {
        let mut processor = test_processor();
        let capacity = processor.config().error_log_capacity;
        for _ in 0..capacity + 5 {
            let request = ProcessingRequest::new(Vec::new(), 10, 10);
            processor.process(&request, 0);
        }
        let stats = processor.stats(0);
        assert_eq!(stats.error_log.len(), capacity);
    }

    #[test]
    fn cleanup_resets_everything() {
        let mut processor = test_processor();
        let request = ProcessingRequest::new(png_bytes(40, 40), 20, 20);
        processor.process(&request, 0);
        assert!(processor.stats(0).processed_count > 0);

        processor.cleanup();
        let stats = processor.stats(0);
        assert_eq!(stats.processed_count, 0);
        assert_eq!(stats.cache_hits, 0);
        assert_eq!(stats.cache_size, 0);
        assert!(stats.error_log.is_empty());
        assert_eq!(processor.surface_dimensions(), (1, 1));
    }

    #[test]
    fn self_test_passes() {
        assert!(capability_self_test().is_ok());
    }

    #[test]
    fn worker_round_trip() {
        let worker = spawn(test_config(), Arc::new(NoopProbe));
        let request = ProcessingRequest::new(png_bytes(64, 64), 32, 32);
        let receiver = worker.submit(Envelope::new(1, Command::Process(request)));
        match receiver.recv().unwrap() {
            Response::Result { id, result } => {
                assert_eq!(id, 1);
                assert!(result.success, "error: {:?}", result.error);
            }
            other => panic!("unexpected response: {other:?}"),
        }
        worker.shutdown();
    }

    #[test]
    fn unknown_operation_message_is_exact() {
        let worker = spawn(test_config(), Arc::new(NoopProbe));
        let receiver = worker.submit(Envelope::new(7, Command::Unknown("transmogrify".into())));
        match receiver.recv().unwrap() {
            Response::Result { id, result } => {
                assert_eq!(id, 7);
                assert!(!result.success);
                assert_eq!(
                    result.error.as_deref(),
                    Some("Unknown operation type: transmogrify")
                );
            }
            other => panic!("unexpected response: {other:?}"),
        }
        worker.shutdown();
    }

    #[test]
    fn ping_is_synchronous() {
        let worker = spawn(test_config(), Arc::new(NoopProbe));
        let receiver = worker.submit(Envelope::new(2, Command::Ping));
        match receiver.try_recv().unwrap() {
            Response::Pong { stats, .. } => {
                assert_eq!(stats.processed_count, 0);
            }
            other => panic!("unexpected response: {other:?}"),
        }
        worker.shutdown();
    }

    #[test]
    fn test_reports_capabilities() {
        let worker = spawn(test_config(), Arc::new(NoopProbe));
        let receiver = worker.submit(Envelope::new(3, Command::Test));
        match receiver.try_recv().unwrap() {
            Response::Capabilities { capabilities, .. } => {
                assert!(capabilities.formats.contains(&OutputFormat::Jpeg));
                assert!(capabilities.chunked_sharpening);
                assert!(!capabilities.memory_probe);
                assert_eq!(capabilities.max_dimension, 8192);
            }
            other => panic!("unexpected response: {other:?}"),
        }
        worker.shutdown();
    }

    #[test]
    fn cleanup_command_clears_queue_and_stats() {
        let worker = spawn(test_config(), Arc::new(NoopProbe));
        let request = ProcessingRequest::new(png_bytes(64, 64), 32, 32);
        let r1 = worker.submit(Envelope::new(1, Command::Process(request)));
        let _ = r1.recv().unwrap();

        let r2 = worker.submit(Envelope::new(2, Command::Cleanup));
        match r2.recv().unwrap() {
            Response::Cleanup { id, message } => {
                assert_eq!(id, 2);
                assert_eq!(message, "Cleanup completed");
            }
            other => panic!("unexpected response: {other:?}"),
        }

        let stats = worker.stats_snapshot();
        assert_eq!(stats.processed_count, 0);
        assert_eq!(stats.cache_size, 0);
        assert_eq!(stats.queue_length, 0);
        worker.shutdown();
    }
}
