//! Process-global batching metrics.
//!
//! Each metric is a family of percentile samplers keyed by label values
//! (model name, and for padding the execution batch size). A sampler keeps a
//! bounded reservoir of the most recent 1024 observations and reports the
//! 25/50/75/90/95/99 percentiles over it. Families are registered exactly
//! once behind `once_cell` statics, so duplicate registration cannot occur.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

/// Reservoir size per sampler cell.
pub const MAX_SAMPLES: usize = 1024;

/// Percentiles reported by every sampler.
pub const PERCENTILES: [f64; 6] = [25.0, 50.0, 75.0, 90.0, 95.0, 99.0];

/// A bounded reservoir of recent observations.
pub struct PercentileSampler {
    samples: Mutex<Reservoir>,
}

struct Reservoir {
    buffer: Vec<f64>,
    next: usize,
    total: u64,
}

impl PercentileSampler {
    fn new() -> Self {
        Self {
            samples: Mutex::new(Reservoir {
                buffer: Vec::new(),
                next: 0,
                total: 0,
            }),
        }
    }

    pub fn add(&self, value: f64) {
        let mut reservoir = self.samples.lock().unwrap();
        if reservoir.buffer.len() < MAX_SAMPLES {
            reservoir.buffer.push(value);
        } else {
            let next = reservoir.next;
            reservoir.buffer[next] = value;
        }
        reservoir.next = (reservoir.next + 1) % MAX_SAMPLES;
        reservoir.total += 1;
    }

    /// Total number of observations ever recorded (not capped at the
    /// reservoir size).
    pub fn count(&self) -> u64 {
        self.samples.lock().unwrap().total
    }

    /// Nearest-rank percentile over the current reservoir contents, or
    /// `None` when nothing has been recorded yet.
    pub fn percentile(&self, percentile: f64) -> Option<f64> {
        let reservoir = self.samples.lock().unwrap();
        if reservoir.buffer.is_empty() {
            return None;
        }
        let mut sorted = reservoir.buffer.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let rank = ((percentile / 100.0) * sorted.len() as f64).ceil() as usize;
        Some(sorted[rank.clamp(1, sorted.len()) - 1])
    }
}

/// A named collection of sampler cells, one per label combination.
pub struct SamplerFamily {
    name: &'static str,
    cells: Mutex<HashMap<Vec<String>, Arc<PercentileSampler>>>,
}

impl SamplerFamily {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            cells: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The sampler cell for the given label values, created on first use.
    pub fn cell(&self, labels: &[&str]) -> Arc<PercentileSampler> {
        let key: Vec<String> = labels.iter().map(|l| l.to_string()).collect();
        self.cells
            .lock()
            .unwrap()
            .entry(key)
            .or_insert_with(|| Arc::new(PercentileSampler::new()))
            .clone()
    }
}

/// Batch size distribution on the inputs, by model name.
pub static INPUT_BATCH_SIZE: Lazy<SamplerFamily> =
    Lazy::new(|| SamplerFamily::new("batching/input_batch_size"));

/// Batch size distribution at processing time, by model name.
pub static PROCESSED_BATCH_SIZE: Lazy<SamplerFamily> =
    Lazy::new(|| SamplerFamily::new("batching/processed_batch_size"));

/// Padding size distribution, by model name and execution batch size.
pub static PADDING_SIZE: Lazy<SamplerFamily> =
    Lazy::new(|| SamplerFamily::new("batching/padding_size"));

/// Per-task queueing delay in milliseconds, by model name.
pub static BATCH_DELAY_MS: Lazy<SamplerFamily> =
    Lazy::new(|| SamplerFamily::new("batching/batch_delay_ms"));

/// Batches that exceeded the largest allowed size and were dispatched with
/// an un-rounded padded size.
static OVERSIZE_UNROUNDED_BATCHES: AtomicU64 = AtomicU64::new(0);

pub(crate) fn record_input_batch_size(batch_size: usize, model_name: &str) {
    INPUT_BATCH_SIZE.cell(&[model_name]).add(batch_size as f64);
}

pub(crate) fn record_processed_batch_size(batch_size: usize, model_name: &str) {
    PROCESSED_BATCH_SIZE
        .cell(&[model_name])
        .add(batch_size as f64);
}

pub(crate) fn record_padding_size(
    padding_size: usize,
    model_name: &str,
    execution_batch_size: usize,
) {
    PADDING_SIZE
        .cell(&[model_name, &execution_batch_size.to_string()])
        .add(padding_size as f64);
}

pub(crate) fn record_batch_delay_ms(delay_ms: f64, model_name: &str) {
    BATCH_DELAY_MS.cell(&[model_name]).add(delay_ms);
}

pub(crate) fn increment_oversize_unrounded_batches() {
    OVERSIZE_UNROUNDED_BATCHES.fetch_add(1, Ordering::Relaxed);
}

pub fn oversize_unrounded_batches() -> u64 {
    OVERSIZE_UNROUNDED_BATCHES.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampler_reports_percentiles_over_recorded_values() {
        let sampler = PercentileSampler::new();
        assert_eq!(sampler.percentile(50.0), None);
        for v in 1..=100 {
            sampler.add(v as f64);
        }
        assert_eq!(sampler.count(), 100);
        assert_eq!(sampler.percentile(50.0), Some(50.0));
        assert_eq!(sampler.percentile(99.0), Some(99.0));
        assert_eq!(sampler.percentile(25.0), Some(25.0));
    }

    #[test]
    fn reservoir_keeps_only_recent_samples() {
        let sampler = PercentileSampler::new();
        for v in 0..(MAX_SAMPLES * 2) {
            sampler.add(v as f64);
        }
        assert_eq!(sampler.count(), (MAX_SAMPLES * 2) as u64);
        // Everything from the first pass has been overwritten.
        assert!(sampler.percentile(25.0).unwrap() >= MAX_SAMPLES as f64);
    }

    #[test]
    fn family_reuses_cells_per_label_set() {
        let family = SamplerFamily::new("test/family");
        let a = family.cell(&["model-a"]);
        let b = family.cell(&["model-a"]);
        let c = family.cell(&["model-b"]);
        a.add(1.0);
        assert_eq!(b.count(), 1);
        assert_eq!(c.count(), 0);
        assert_eq!(family.name(), "test/family");
    }

    #[test]
    fn global_families_record_through_helpers() {
        record_input_batch_size(3, "metrics-test-model");
        record_input_batch_size(5, "metrics-test-model");
        let cell = INPUT_BATCH_SIZE.cell(&["metrics-test-model"]);
        assert_eq!(cell.count(), 2);
        assert_eq!(cell.percentile(99.0), Some(5.0));

        record_padding_size(2, "metrics-test-model", 8);
        let cell = PADDING_SIZE.cell(&["metrics-test-model", "8"]);
        assert_eq!(cell.count(), 1);
    }
}
