// src/engine/batch.rs
//
// Batch orchestrator: drives the processor over a list of requests in
// adaptive-size chunks with backpressure. Items inside a chunk fan out on
// rayon; the processor mutex still serializes rasterization, so the overlap
// is in per-item setup and result assembly, not in pixel work.

use parking_lot::Mutex;
use rayon::prelude::*;

use crate::engine::worker::ImageProcessor;
use crate::protocol::{ProcessingRequest, ProcessingResult};

/// Run a whole batch. One progress callback per completed chunk; item
/// failures become per-index failed results and never abort the run.
pub fn run(
    processor: &Mutex<ImageProcessor>,
    requests: &[ProcessingRequest],
    mut on_progress: impl FnMut(f64, usize, usize),
) -> Vec<ProcessingResult> {
    let total = requests.len();
    if total == 0 {
        return Vec::new();
    }

    let (mut chunk_size, inter_chunk_sleep) = {
        let locked = processor.lock();
        let config = locked.config();
        let size = if locked.check_pressure_high() {
            config.pressure_batch_chunk_size
        } else {
            config.batch_chunk_size
        };
        (size.max(1), config.inter_chunk_sleep)
    };

    let mut results: Vec<ProcessingResult> = Vec::with_capacity(total);
    let mut completed = 0usize;
    let mut offset = 0usize;

    while offset < total {
        let end = (offset + chunk_size).min(total);
        let chunk: Vec<ProcessingResult> = requests[offset..end]
            .par_iter()
            .enumerate()
            .map(|(i, request)| processor.lock().process(request, offset + i))
            .collect();
        results.extend(chunk);

        completed = end;
        let progress = completed as f64 / total as f64 * 100.0;
        tracing::debug!(completed, total, chunk_size, "batch chunk complete");
        on_progress(progress, completed, total);

        // Backpressure: shrink the chunk size monotonically when pressure
        // stays high after a recovery pass. Recovery settles for the batch
        // wait, not the per-request one.
        let pressure_high = processor.lock().check_pressure_high();
        if pressure_high {
            processor.lock().recover_between_chunks();
            chunk_size = (chunk_size / 2).max(1);
        }

        offset = end;
        if offset < total {
            std::thread::sleep(inter_chunk_sleep);
        }
    }

    debug_assert_eq!(completed, total);
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::governor::{
        GovernorConfig, MemoryProbe, MemorySnapshot, NoopProbe,
    };
    use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, Rgba([90, 45, 200, 255]));
        let mut buf = Vec::new();
        DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    fn test_processor() -> Mutex<ImageProcessor> {
        let config = GovernorConfig {
            recovery_wait: Duration::from_millis(0),
            batch_recovery_wait: Duration::from_millis(0),
            inter_chunk_sleep: Duration::from_millis(0),
            ..Default::default()
        };
        Mutex::new(ImageProcessor::new(config, Arc::new(NoopProbe)))
    }

    #[test]
    fn batch_returns_result_per_item_in_order() {
        let processor = test_processor();
        let requests: Vec<ProcessingRequest> = (0..7)
            .map(|i| {
                ProcessingRequest::new(png_bytes(32 + i, 32), 16, 16)
                    .with_name(format!("img-{i}.png"))
            })
            .collect();

        let results = run(&processor, &requests, |_, _, _| {});

        assert_eq!(results.len(), 7);
        for (i, result) in results.iter().enumerate() {
            assert!(result.success, "item {i} failed: {:?}", result.error);
            assert_eq!(result.index, i);
            assert_eq!(result.original_name.as_deref(), Some(&*format!("img-{i}.png")));
        }
    }

    #[test]
    fn corrupt_item_does_not_abort_batch() {
        let processor = test_processor();
        let mut requests: Vec<ProcessingRequest> = (0..5)
            .map(|_| ProcessingRequest::new(png_bytes(32, 32), 16, 16))
            .collect();
        requests[2] = ProcessingRequest::new(vec![0xBA, 0xD0], 16, 16);

        let results = run(&processor, &requests, |_, _, _| {});

        assert_eq!(results.len(), 5);
        assert!(!results[2].success);
        assert_eq!(results[2].index, 2);
        for i in [0, 1, 3, 4] {
            assert!(results[i].success, "item {i} failed: {:?}", results[i].error);
        }
    }

    #[test]
    fn progress_fires_once_per_chunk_and_ends_at_full() {
        let processor = test_processor();
        let requests: Vec<ProcessingRequest> = (0..12)
            .map(|_| ProcessingRequest::new(png_bytes(16, 16), 8, 8))
            .collect();

        let mut events: Vec<(f64, usize, usize)> = Vec::new();
        let results = run(&processor, &requests, |p, c, t| events.push((p, c, t)));

        assert_eq!(results.len(), 12);
        // Default chunk size 5: chunks of 5, 5, 2
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], (5.0 / 12.0 * 100.0, 5, 12));
        assert_eq!(events[2].1, 12);
        assert!((events[2].0 - 100.0).abs() < 1e-9);
        // Monotonic completion counts
        assert!(events.windows(2).all(|w| w[0].1 < w[1].1));
    }

    /// Probe whose collection hook actually releases memory.
    struct ReleasingProbe {
        used: AtomicU64,
        limit: u64,
    }

    impl MemoryProbe for ReleasingProbe {
        fn snapshot(&self) -> Option<MemorySnapshot> {
            Some(MemorySnapshot {
                used: self.used.load(Ordering::SeqCst),
                limit: self.limit,
            })
        }

        fn request_collection(&self) {
            self.used.store(100, Ordering::SeqCst);
        }
    }

    #[test]
    fn pressure_recovery_settles_for_batch_wait_only() {
        let probe = Arc::new(ReleasingProbe {
            used: AtomicU64::new(100),
            limit: 1000,
        });
        // A long per-request wait would dominate the runtime if the batch
        // path stacked it on top of its own (zero) wait.
        let config = GovernorConfig {
            recovery_wait: Duration::from_millis(500),
            batch_recovery_wait: Duration::from_millis(0),
            inter_chunk_sleep: Duration::from_millis(0),
            ..Default::default()
        };
        let processor = Mutex::new(ImageProcessor::new(
            config,
            Arc::clone(&probe) as Arc<dyn MemoryProbe>,
        ));
        let requests: Vec<ProcessingRequest> = (0..6)
            .map(|_| ProcessingRequest::new(png_bytes(16, 16), 8, 8))
            .collect();

        let started = Instant::now();
        let results = run(&processor, &requests, |_, completed, _| {
            // Pressure spikes after the first chunk; collection releases it.
            if completed == 5 {
                probe.used.store(900, Ordering::SeqCst);
            }
        });

        assert_eq!(results.len(), 6);
        assert!(results.iter().all(|r| r.success));
        assert_eq!(processor.lock().stats(0).gc_request_count, 1);
        assert!(
            started.elapsed() < Duration::from_millis(400),
            "batch stalled for {:?}",
            started.elapsed()
        );
    }

    #[test]
    fn empty_batch_is_empty_result() {
        let processor = test_processor();
        let results = run(&processor, &[], |_, _, _| {});
        assert!(results.is_empty());
    }
}
