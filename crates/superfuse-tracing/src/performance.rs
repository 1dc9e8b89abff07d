//! Stage timing for the generator pipeline
//!
//! A fused-kernel generation runs a fixed sequence of stages (option parsing, graph build,
//! scheduling, emission). [`StageSpan`] times one stage and logs it on drop when stage timing is
//! enabled and the duration clears the configured threshold.
//!
//! ## Example
//!
//! ```rust
//! use superfuse_tracing::performance::{record_emission, StageSpan};
//!
//! {
//!     let _stage = StageSpan::new("schedule");
//!     // ... build the schedule ...
//! }
//!
//! record_emission("fused_kernel", 3, 4096, 120);
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

static STAGE_TIMING: AtomicBool = AtomicBool::new(cfg!(debug_assertions));
static STAGE_THRESHOLD_US: AtomicU64 = AtomicU64::new(0);

/// Enable or disable stage timing process-wide.
///
/// `threshold_us` of `None` logs every stage.
pub fn set_stage_timing(enabled: bool, threshold_us: Option<u64>) {
    STAGE_TIMING.store(enabled, Ordering::Relaxed);
    STAGE_THRESHOLD_US.store(threshold_us.unwrap_or(0), Ordering::Relaxed);
}

/// Whether stage spans currently log anything
pub fn stage_timing_enabled() -> bool {
    STAGE_TIMING.load(Ordering::Relaxed)
}

/// RAII guard timing one generator stage.
pub struct StageSpan {
    stage: &'static str,
    start_time: Instant,
    span: tracing::Span,
    enabled: bool,
}

impl StageSpan {
    /// Start timing `stage`.
    pub fn new(stage: &'static str) -> Self {
        let enabled = stage_timing_enabled();
        let span = if enabled {
            tracing::debug_span!("stage", name = stage)
        } else {
            tracing::Span::none()
        };
        Self {
            stage,
            start_time: Instant::now(),
            span,
            enabled,
        }
    }

    /// Elapsed time since the stage started.
    pub fn elapsed_us(&self) -> u64 {
        self.start_time.elapsed().as_micros() as u64
    }

    /// Name of the timed stage
    pub fn stage(&self) -> &'static str {
        self.stage
    }

    /// Enter this span's context.
    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }
}

impl Drop for StageSpan {
    fn drop(&mut self) {
        if !self.enabled {
            return;
        }
        let elapsed_us = self.elapsed_us();
        if elapsed_us >= STAGE_THRESHOLD_US.load(Ordering::Relaxed) {
            let _entered = self.span.enter();
            tracing::debug!(
                stage = self.stage,
                duration_us = elapsed_us,
                duration_ms = elapsed_us as f64 / 1000.0,
                "stage_complete"
            );
        }
    }
}

/// Record the outcome of one fused-kernel emission.
///
/// # Arguments
///
/// * `kernel_name` - fused kernel name
/// * `operator_count` - number of sub-operator invocations emitted
/// * `source_bytes` - size of the generated source
/// * `duration_us` - total generation time
pub fn record_emission(kernel_name: &str, operator_count: usize, source_bytes: usize, duration_us: u64) {
    tracing::debug!(
        event = "emission",
        kernel = kernel_name,
        operator_count = operator_count,
        source_bytes = source_bytes,
        source_kb = source_bytes as f64 / 1024.0,
        duration_us = duration_us,
        "fused_kernel_emitted"
    );
}

/// Record the synchronization primitives chosen for one fused kernel.
pub fn record_sync_summary(kernel_name: &str, full_barriers: usize, domain_barriers: usize, signal_pairs: usize) {
    tracing::debug!(
        event = "sync_summary",
        kernel = kernel_name,
        full_barriers = full_barriers,
        domain_barriers = domain_barriers,
        signal_pairs = signal_pairs,
        "sync_plan_complete"
    );
}
