// src/engine/governor.rs
//
// Resource/memory governor: gates every processing request against file-size
// and dimension caps, probes live memory pressure, runs GC-style recovery,
// and maintains the decoded-bitmap cache.
//
// Memory limit detection reads cgroup v2/v1 limits with a /proc/meminfo
// fallback; current usage comes from getrusage RSS. Platforms without any of
// that degrade to "never under pressure" rather than failing.

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::RgbaImage;

use crate::engine::raster::Surface;
use crate::error::{Result, WorkerError};
use crate::protocol::{OutputFormat, ProcessingRequest};

const MB: u64 = 1024 * 1024;

/// All governor tunables in one place, with the shipped defaults.
#[derive(Clone, Debug)]
pub struct GovernorConfig {
    /// Input byte-length cap. Checked before any decode attempt.
    pub max_file_size: u64,
    /// Target dimension cap under normal conditions.
    pub max_dimension: u32,
    /// Target dimension cap while memory pressure is high.
    pub pressure_max_dimension: u32,
    /// Output pixel-buffer budget (w*h*4) under normal conditions.
    pub memory_budget: u64,
    /// Output pixel-buffer budget while memory pressure is high.
    pub pressure_memory_budget: u64,
    /// Usage/limit ratio above which pressure counts as high.
    pub high_pressure: f64,
    /// Ratio above which a request is aborted even after recovery.
    pub critical_pressure: f64,
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
    /// Settle time after a recovery action before re-probing.
    pub recovery_wait: Duration,
    /// Settle time after recovery between batch chunks.
    pub batch_recovery_wait: Duration,
    pub batch_chunk_size: usize,
    pub pressure_batch_chunk_size: usize,
    /// Responsiveness pause between batch chunks.
    pub inter_chunk_sleep: Duration,
    /// Preventive recovery runs every this many successful requests.
    pub maintenance_interval: u64,
    pub error_log_capacity: usize,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        GovernorConfig {
            max_file_size: 100 * MB,
            max_dimension: 8192,
            pressure_max_dimension: 4096,
            memory_budget: 200 * MB,
            pressure_memory_budget: 100 * MB,
            high_pressure: 0.80,
            critical_pressure: 0.90,
            cache_capacity: 10,
            cache_ttl: Duration::from_secs(5 * 60),
            recovery_wait: Duration::from_millis(100),
            batch_recovery_wait: Duration::from_millis(200),
            batch_chunk_size: 5,
            pressure_batch_chunk_size: 3,
            inter_chunk_sleep: Duration::from_millis(10),
            maintenance_interval: 10,
            error_log_capacity: 10,
        }
    }
}

/// One memory-pressure probe result.
#[derive(Clone, Copy, Debug)]
pub struct PressureReading {
    pub is_high: bool,
    pub usage: u64,
    pub limit: u64,
    pub percentage: f64,
}

impl PressureReading {
    fn relaxed() -> Self {
        PressureReading {
            is_high: false,
            usage: 0,
            limit: 0,
            percentage: 0.0,
        }
    }
}

/// Point-in-time memory usage as seen by a probe.
#[derive(Clone, Copy, Debug)]
pub struct MemorySnapshot {
    pub used: u64,
    pub limit: u64,
}

/// Capability seam for memory introspection.
///
/// Hosts without usable introspection return `None` from `snapshot` and the
/// governor treats pressure as never high. `request_collection` is the
/// manual allocator-release hook; the default is a no-op.
pub trait MemoryProbe: Send + Sync {
    fn snapshot(&self) -> Option<MemorySnapshot>;

    fn request_collection(&self) {}
}

/// Probe that always reports no capability. Used on unsupported platforms
/// and in tests that must not depend on host memory state.
pub struct NoopProbe;

impl MemoryProbe for NoopProbe {
    fn snapshot(&self) -> Option<MemorySnapshot> {
        None
    }
}

/// Real probe: RSS from getrusage against a limit detected once at
/// construction from cgroup v2/v1 or total system memory.
pub struct SystemMemoryProbe {
    limit: Option<u64>,
}

impl SystemMemoryProbe {
    pub fn new() -> Self {
        SystemMemoryProbe {
            limit: detect_memory_limit(),
        }
    }
}

impl Default for SystemMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn snapshot(&self) -> Option<MemorySnapshot> {
        let limit = self.limit?;
        let used = current_rss()?;
        Some(MemorySnapshot { used, limit })
    }
}

/// Current resident set size in bytes, or None if getrusage fails.
#[cfg(any(target_os = "linux", target_os = "macos", target_os = "freebsd"))]
fn current_rss() -> Option<u64> {
    use libc::{getrusage, rusage, RUSAGE_SELF};
    use std::mem;

    unsafe {
        let mut usage: rusage = mem::zeroed();
        if getrusage(RUSAGE_SELF, &mut usage) == 0 {
            // On Linux ru_maxrss is in KB; on macOS/FreeBSD it is bytes.
            #[cfg(target_os = "linux")]
            let rss = usage.ru_maxrss as u64 * 1024;
            #[cfg(any(target_os = "macos", target_os = "freebsd"))]
            let rss = usage.ru_maxrss as u64;
            Some(rss)
        } else {
            None
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "freebsd")))]
fn current_rss() -> Option<u64> {
    None
}

/// Detect the process memory limit: cgroup v2 first, then cgroup v1, then
/// total system memory.
fn detect_memory_limit() -> Option<u64> {
    if let Some(limit) = detect_cgroup_v2_limit() {
        return Some(limit);
    }
    if let Some(limit) = detect_cgroup_v1_limit() {
        return Some(limit);
    }
    detect_system_memory()
}

fn detect_cgroup_v2_limit() -> Option<u64> {
    let content = fs::read_to_string("/sys/fs/cgroup/memory.max").ok()?;
    let trimmed = content.trim();
    if trimmed == "max" {
        return None;
    }
    trimmed.parse::<u64>().ok()
}

fn detect_cgroup_v1_limit() -> Option<u64> {
    let content = fs::read_to_string("/sys/fs/cgroup/memory/memory.limit_in_bytes").ok()?;
    let limit = content.trim().parse::<u64>().ok()?;
    // Values near 2^63 mean "no limit"
    if limit > 1_000_000_000_000_000 {
        return None;
    }
    Some(limit)
}

fn detect_system_memory() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        if let Ok(content) = fs::read_to_string("/proc/meminfo") {
            for line in content.lines() {
                if line.starts_with("MemTotal:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        if let Ok(kb) = kb_str.parse::<u64>() {
                            return Some(kb * 1024);
                        }
                    }
                }
            }
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Bitmap cache

/// Cache key derived from the request signature.
pub fn cache_key(request: &ProcessingRequest) -> String {
    format!(
        "{}x{}:q{}:{}:{}",
        request.target_width,
        request.target_height,
        request.quality,
        request.format.as_str(),
        request.bytes.len()
    )
}

struct CachedBitmap {
    bitmap: Arc<RgbaImage>,
    stamp: Instant,
}

/// Bounded decoded-bitmap cache with a fixed TTL.
///
/// Expired entries are treated as misses on lookup and removed then, not by
/// a sweeper. When full, the oldest entry is evicted to make room.
struct BitmapCache {
    entries: HashMap<String, CachedBitmap>,
    capacity: usize,
    ttl: Duration,
}

impl BitmapCache {
    fn new(capacity: usize, ttl: Duration) -> Self {
        BitmapCache {
            entries: HashMap::new(),
            capacity,
            ttl,
        }
    }

    fn get(&mut self, key: &str) -> Option<Arc<RgbaImage>> {
        let expired = match self.entries.get(key) {
            Some(entry) => entry.stamp.elapsed() > self.ttl,
            None => return None,
        };
        if expired {
            self.entries.remove(key);
            return None;
        }
        self.entries.get(key).map(|e| Arc::clone(&e.bitmap))
    }

    fn insert(&mut self, key: String, bitmap: Arc<RgbaImage>) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            if let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.stamp)
                .map(|(k, _)| k.clone())
            {
                tracing::debug!(key = %oldest, "evicting oldest cached bitmap");
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(
            key,
            CachedBitmap {
                bitmap,
                stamp: Instant::now(),
            },
        );
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

// ---------------------------------------------------------------------------
// Governor

/// Gates and adapts every processing request based on memory pressure.
pub struct Governor {
    config: GovernorConfig,
    probe: Arc<dyn MemoryProbe>,
    cache: BitmapCache,
    gc_request_count: u64,
}

impl Governor {
    pub fn new(config: GovernorConfig, probe: Arc<dyn MemoryProbe>) -> Self {
        let cache = BitmapCache::new(config.cache_capacity, config.cache_ttl);
        Governor {
            config,
            probe,
            cache,
            gc_request_count: 0,
        }
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    pub fn has_probe(&self) -> bool {
        self.probe.snapshot().is_some()
    }

    /// Probe current memory pressure. A probe without the capability is not
    /// an error; it degrades to "never high".
    pub fn check_pressure(&self) -> PressureReading {
        match self.probe.snapshot() {
            Some(MemorySnapshot { used, limit }) if limit > 0 => {
                let percentage = used as f64 / limit as f64;
                PressureReading {
                    is_high: percentage > self.config.high_pressure,
                    usage: used,
                    limit,
                    percentage,
                }
            }
            _ => PressureReading::relaxed(),
        }
    }

    /// Pre-decode validation: empty input, then byte length against the
    /// file-size cap (request override or default). No decode happens before
    /// these pass.
    pub fn validate_input(&self, bytes: &[u8], max_file_size: Option<u64>) -> Result<()> {
        if bytes.is_empty() {
            return Err(WorkerError::empty_input());
        }
        let limit = max_file_size.unwrap_or(self.config.max_file_size);
        if bytes.len() as u64 > limit {
            return Err(WorkerError::input_too_large(bytes.len() as u64, limit));
        }
        Ok(())
    }

    /// Post-decode validation: target dimensions against the (possibly
    /// pressure-reduced) cap, then the estimated output buffer against the
    /// memory budget.
    pub fn validate_target(&self, width: u32, height: u32, pressure_high: bool) -> Result<()> {
        let max_dim = if pressure_high {
            self.config.pressure_max_dimension
        } else {
            self.config.max_dimension
        };
        if width == 0 || height == 0 || width > max_dim || height > max_dim {
            return Err(WorkerError::dimension_out_of_range(width, height, max_dim));
        }

        let estimated = width as u64 * height as u64 * 4;
        let budget = if pressure_high {
            self.config.pressure_memory_budget
        } else {
            self.config.memory_budget
        };
        if estimated > budget {
            return Err(WorkerError::output_too_large(estimated, budget));
        }
        Ok(())
    }

    /// GC-style recovery: clear the bitmap cache, shrink the surface to 1x1,
    /// ask the allocator to release memory, wait briefly, re-probe.
    pub fn recover(&mut self, surface: &mut Surface) -> PressureReading {
        let wait = self.config.recovery_wait;
        self.recover_settling(surface, wait)
    }

    /// Same recovery actions with a caller-chosen settle time. The batch
    /// orchestrator passes its own wait so the two never stack.
    pub fn recover_settling(&mut self, surface: &mut Surface, wait: Duration) -> PressureReading {
        tracing::debug!("memory recovery: clearing cache and resetting surface");
        self.cache.clear();
        surface.reset();
        self.probe.request_collection();
        self.gc_request_count += 1;
        std::thread::sleep(wait);
        self.check_pressure()
    }

    /// Recovery gate used mid-request: when pressure is high, run recovery
    /// and abort if usage is still at the critical threshold afterwards.
    pub fn ensure_headroom(&mut self, surface: &mut Surface) -> Result<PressureReading> {
        let reading = self.check_pressure();
        if !reading.is_high {
            return Ok(reading);
        }
        tracing::warn!(
            percentage = reading.percentage * 100.0,
            "high memory pressure detected mid-request"
        );
        let after = self.recover(surface);
        if after.percentage >= self.config.critical_pressure {
            return Err(WorkerError::memory_critical(after.percentage * 100.0));
        }
        Ok(after)
    }

    /// Preventive maintenance: every Nth successful request re-checks
    /// pressure and runs recovery opportunistically.
    pub fn maintain(&mut self, surface: &mut Surface, processed_count: u64) {
        if processed_count == 0 || processed_count % self.config.maintenance_interval != 0 {
            return;
        }
        if self.check_pressure().is_high {
            tracing::debug!(processed_count, "preventive maintenance recovery");
            self.recover(surface);
        }
    }

    /// Cache lookup. Expired entries count as misses.
    pub fn lookup_bitmap(&mut self, key: &str) -> Option<Arc<RgbaImage>> {
        self.cache.get(key)
    }

    /// Cache a decoded bitmap, but only while there is capacity headroom or
    /// an existing slot can be evicted, and never while pressure is high.
    pub fn store_bitmap(&mut self, key: String, bitmap: Arc<RgbaImage>, pressure_high: bool) {
        if pressure_high {
            return;
        }
        self.cache.insert(key, bitmap);
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    pub fn gc_request_count(&self) -> u64 {
        self.gc_request_count
    }

    /// Reset the counters cleanup owns. The cache is cleared separately.
    pub fn reset_counters(&mut self) {
        self.gc_request_count = 0;
    }
}

/// Resolve the output format for a request, applying the JPEG default for
/// formats without an encoder.
pub fn effective_format(format: OutputFormat) -> OutputFormat {
    match format {
        OutputFormat::Avif => OutputFormat::Jpeg,
        other => other,
    }
}
