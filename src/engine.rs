// src/engine.rs
//
// The processing engine behind the worker boundary, decomposed by concern:
// raster surface and codecs, pixel filter kernels, the memory governor, the
// batch orchestrator, and the worker actor that ties them together.

pub mod batch;
pub mod filters;
pub mod governor;
pub mod raster;
pub mod worker;

pub use governor::{
    Governor, GovernorConfig, MemoryProbe, MemorySnapshot, NoopProbe, PressureReading,
    SystemMemoryProbe,
};
pub use raster::{Smoothing, Surface};
pub use worker::{spawn, ImageProcessor, WorkerHandle};
