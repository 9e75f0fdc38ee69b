//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations so camera workers never contend.
//! Reporting swaps the periodic counters to get a snapshot.
//!
//! NOTE: All atomics use Relaxed ordering. These are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Exponential bucket boundaries for frame processing latency (microseconds)
/// Buckets: ≤1ms, ≤2ms, ≤4ms, ... ≤512ms, >512ms
pub const METRICS_BUCKET_BOUNDS: [u64; 10] =
    [1_000, 2_000, 4_000, 8_000, 16_000, 32_000, 64_000, 128_000, 256_000, 512_000];
pub const METRICS_NUM_BUCKETS: usize = 11;

#[inline]
fn bucket_index(latency_us: u64) -> usize {
    METRICS_BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

#[inline]
fn swap_buckets(buckets: &[AtomicU64; METRICS_NUM_BUCKETS]) -> [u64; METRICS_NUM_BUCKETS] {
    let mut result = [0u64; METRICS_NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; METRICS_NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = ((total as f64 * percentile).ceil() as u64).max(1);
    let mut cumulative = 0u64;

    // Last bucket uses 2x the previous bound
    const BUCKET_UPPER_BOUNDS: [u64; METRICS_NUM_BUCKETS] =
        [1_000, 2_000, 4_000, 8_000, 16_000, 32_000, 64_000, 128_000, 256_000, 512_000, 1_024_000];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[METRICS_NUM_BUCKETS - 1]
}

/// Why the allocator turned down a match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectKind {
    DuplicateElsewhere,
    Contention,
    SlotMissing,
}

/// Lock-free metrics collector
pub struct Metrics {
    frames_total: AtomicU64,
    frames_since_report: AtomicU64,
    frame_latency_sum_us: AtomicU64,
    frame_latency_max_us: AtomicU64,
    frame_latency_buckets: [AtomicU64; METRICS_NUM_BUCKETS],
    detections_total: AtomicU64,
    plates_read_total: AtomicU64,
    registry_hits_total: AtomicU64,
    registry_failures_total: AtomicU64,
    vision_failures_total: AtomicU64,
    matches_enqueued_total: AtomicU64,
    frames_dropped_total: AtomicU64,
    slots_assigned_total: AtomicU64,
    repeats_total: AtomicU64,
    rejected_duplicate_total: AtomicU64,
    rejected_contention_total: AtomicU64,
    rejected_missing_total: AtomicU64,
    releases_total: AtomicU64,
    store_failures_total: AtomicU64,
    gate_commands_sent: AtomicU64,
    gate_command_failures: AtomicU64,
    /// Point-in-time count of occupied slots (set by allocator)
    occupied_slots: AtomicU64,
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            frames_total: AtomicU64::new(0),
            frames_since_report: AtomicU64::new(0),
            frame_latency_sum_us: AtomicU64::new(0),
            frame_latency_max_us: AtomicU64::new(0),
            frame_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            detections_total: AtomicU64::new(0),
            plates_read_total: AtomicU64::new(0),
            registry_hits_total: AtomicU64::new(0),
            registry_failures_total: AtomicU64::new(0),
            vision_failures_total: AtomicU64::new(0),
            matches_enqueued_total: AtomicU64::new(0),
            frames_dropped_total: AtomicU64::new(0),
            slots_assigned_total: AtomicU64::new(0),
            repeats_total: AtomicU64::new(0),
            rejected_duplicate_total: AtomicU64::new(0),
            rejected_contention_total: AtomicU64::new(0),
            rejected_missing_total: AtomicU64::new(0),
            releases_total: AtomicU64::new(0),
            store_failures_total: AtomicU64::new(0),
            gate_commands_sent: AtomicU64::new(0),
            gate_command_failures: AtomicU64::new(0),
            occupied_slots: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record a frame was fully processed by a camera worker
    #[inline]
    pub fn record_frame_processed(&self, latency_us: u64) {
        self.frames_total.fetch_add(1, Ordering::Relaxed);
        self.frames_since_report.fetch_add(1, Ordering::Relaxed);
        self.frame_latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.frame_latency_buckets[bucket_index(latency_us)].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.frame_latency_max_us, latency_us);
    }

    #[inline]
    pub fn record_detections(&self, count: usize) {
        self.detections_total.fetch_add(count as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_plate_read(&self) {
        self.plates_read_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_registry_hit(&self) {
        self.registry_hits_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_registry_failure(&self) {
        self.registry_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_vision_failure(&self) {
        self.vision_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_match_enqueued(&self) {
        self.matches_enqueued_total.fetch_add(1, Ordering::Relaxed);
    }

    /// A frame sink overwrote an unconsumed frame
    #[inline]
    pub fn record_frame_dropped(&self) {
        self.frames_dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_slot_assigned(&self) {
        self.slots_assigned_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_repeat_sighting(&self) {
        self.repeats_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_rejection(&self, kind: RejectKind) {
        let counter = match kind {
            RejectKind::DuplicateElsewhere => &self.rejected_duplicate_total,
            RejectKind::Contention => &self.rejected_contention_total,
            RejectKind::SlotMissing => &self.rejected_missing_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_release(&self) {
        self.releases_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_store_failure(&self) {
        self.store_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_gate_command(&self) {
        self.gate_commands_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_gate_failure(&self) {
        self.gate_command_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_occupied_slots(&self, count: u64) {
        self.occupied_slots.store(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn gate_commands_sent(&self) -> u64 {
        self.gate_commands_sent.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped_total.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    pub fn report(&self) -> MetricsSummary {
        let frames_count = self.frames_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.frame_latency_sum_us.swap(0, Ordering::Relaxed);
        let max_latency = self.frame_latency_max_us.swap(0, Ordering::Relaxed);
        let lat_buckets = swap_buckets(&self.frame_latency_buckets);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let frames_per_sec = if elapsed.as_secs_f64() > 0.0 {
            frames_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let avg_latency = if frames_count > 0 { latency_sum / frames_count } else { 0 };

        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        MetricsSummary {
            frames_total: load(&self.frames_total),
            frames_per_sec,
            avg_frame_latency_us: avg_latency,
            max_frame_latency_us: max_latency,
            lat_p50_us: percentile_from_buckets(&lat_buckets, 0.50),
            lat_p95_us: percentile_from_buckets(&lat_buckets, 0.95),
            lat_p99_us: percentile_from_buckets(&lat_buckets, 0.99),
            lat_buckets,
            detections_total: load(&self.detections_total),
            plates_read_total: load(&self.plates_read_total),
            registry_hits_total: load(&self.registry_hits_total),
            registry_failures_total: load(&self.registry_failures_total),
            vision_failures_total: load(&self.vision_failures_total),
            matches_enqueued_total: load(&self.matches_enqueued_total),
            frames_dropped_total: load(&self.frames_dropped_total),
            slots_assigned_total: load(&self.slots_assigned_total),
            repeats_total: load(&self.repeats_total),
            rejected_duplicate_total: load(&self.rejected_duplicate_total),
            rejected_contention_total: load(&self.rejected_contention_total),
            rejected_missing_total: load(&self.rejected_missing_total),
            releases_total: load(&self.releases_total),
            store_failures_total: load(&self.store_failures_total),
            gate_commands_sent: load(&self.gate_commands_sent),
            gate_command_failures: load(&self.gate_command_failures),
            occupied_slots: load(&self.occupied_slots),
        }
    }
}

/// Metrics summary for a reporting period
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub frames_total: u64,
    pub frames_per_sec: f64,
    pub avg_frame_latency_us: u64,
    pub max_frame_latency_us: u64,
    pub lat_buckets: [u64; METRICS_NUM_BUCKETS],
    pub lat_p50_us: u64,
    pub lat_p95_us: u64,
    pub lat_p99_us: u64,
    pub detections_total: u64,
    pub plates_read_total: u64,
    pub registry_hits_total: u64,
    pub registry_failures_total: u64,
    pub vision_failures_total: u64,
    pub matches_enqueued_total: u64,
    pub frames_dropped_total: u64,
    pub slots_assigned_total: u64,
    pub repeats_total: u64,
    pub rejected_duplicate_total: u64,
    pub rejected_contention_total: u64,
    pub rejected_missing_total: u64,
    pub releases_total: u64,
    pub store_failures_total: u64,
    pub gate_commands_sent: u64,
    pub gate_command_failures: u64,
    pub occupied_slots: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            frames_total = %self.frames_total,
            frames_per_sec = %format!("{:.1}", self.frames_per_sec),
            frame_avg_us = %self.avg_frame_latency_us,
            frame_max_us = %self.max_frame_latency_us,
            frame_p95_us = %self.lat_p95_us,
            detections = %self.detections_total,
            plates_read = %self.plates_read_total,
            registry_hits = %self.registry_hits_total,
            registry_failures = %self.registry_failures_total,
            matches = %self.matches_enqueued_total,
            frames_dropped = %self.frames_dropped_total,
            assigned = %self.slots_assigned_total,
            rejected_dup = %self.rejected_duplicate_total,
            rejected_contention = %self.rejected_contention_total,
            releases = %self.releases_total,
            occupied = %self.occupied_slots,
            gate_cmds = %self.gate_commands_sent,
            gate_failures = %self.gate_command_failures,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(1_000), 0);
        assert_eq!(bucket_index(1_001), 1);
        assert_eq!(bucket_index(512_000), 9);
        assert_eq!(bucket_index(10_000_000), 10);
    }

    #[test]
    fn test_report_resets_periodic_counters() {
        let metrics = Metrics::new();
        metrics.record_frame_processed(1_500);
        metrics.record_frame_processed(3_000);
        metrics.record_gate_command();

        let summary = metrics.report();
        assert_eq!(summary.frames_total, 2);
        assert_eq!(summary.avg_frame_latency_us, 2_250);
        assert_eq!(summary.max_frame_latency_us, 3_000);
        assert_eq!(summary.lat_p50_us, 2_000);
        assert_eq!(summary.gate_commands_sent, 1);

        let summary = metrics.report();
        assert_eq!(summary.frames_total, 2, "monotonic counter survives report");
        assert_eq!(summary.avg_frame_latency_us, 0);
        assert_eq!(summary.max_frame_latency_us, 0);
        assert_eq!(summary.gate_commands_sent, 1);
    }

    #[test]
    fn test_rejections_by_kind() {
        let metrics = Metrics::new();
        metrics.record_rejection(RejectKind::DuplicateElsewhere);
        metrics.record_rejection(RejectKind::DuplicateElsewhere);
        metrics.record_rejection(RejectKind::Contention);

        let summary = metrics.report();
        assert_eq!(summary.rejected_duplicate_total, 2);
        assert_eq!(summary.rejected_contention_total, 1);
        assert_eq!(summary.rejected_missing_total, 0);
    }

    #[test]
    fn test_percentile_empty() {
        let buckets = [0u64; METRICS_NUM_BUCKETS];
        assert_eq!(percentile_from_buckets(&buckets, 0.99), 0);
    }
}
