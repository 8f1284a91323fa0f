//! Running averages and trend classification.

use std::collections::VecDeque;

use serde::Serialize;

/// Number of samples in each trend comparison window.
pub const TREND_WINDOW: usize = 10;

/// Minimum number of samples before a trend is classified.
pub const MIN_TREND_SAMPLES: usize = 3;

/// Relative change beyond which a trend is not stable.
const TREND_THRESHOLD: f64 = 0.05;

/// Count-weighted running mean.
///
/// Merging keeps only the mean and the sample count, so updates are O(1)
/// and merging batches one by one gives the same mean as merging their
/// concatenation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RunningAverage {
    /// Current mean.
    pub mean: f64,
    /// Number of samples folded in.
    pub count: u64,
}

impl RunningAverage {
    /// Folds in a batch with mean `batch_mean` over `batch_count` samples.
    ///
    /// `new = (old * old_count + batch_mean * batch_count) / (old_count + batch_count)`
    pub fn merge(&mut self, batch_mean: f64, batch_count: u64) {
        if batch_count == 0 {
            return;
        }
        let total = self.count + batch_count;
        self.mean = (self.mean * self.count as f64 + batch_mean * batch_count as f64) / total as f64;
        self.count = total;
    }

    /// Folds in a single sample.
    pub fn push(&mut self, value: f64) {
        self.merge(value, 1);
    }

    /// Mean and count of `values`.
    pub fn of(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        Self {
            mean: values.iter().sum::<f64>() / values.len() as f64,
            count: values.len() as u64,
        }
    }
}

/// Direction a metric is moving in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Improving,
    Declining,
    Stable,
    InsufficientData,
}

impl TrendDirection {
    /// Compares the mean of the most recent window against the one before it.
    ///
    /// With at least 20 samples both windows hold ten samples. With fewer,
    /// the recent window takes the newer half (rounded up) and the previous
    /// window the rest. When higher values are worse, pass
    /// `higher_is_better = false` to invert the direction.
    pub fn classify(samples: &[f64], higher_is_better: bool) -> Self {
        let n = samples.len();
        if n < MIN_TREND_SAMPLES {
            return TrendDirection::InsufficientData;
        }

        let recent_len = TREND_WINDOW.min(n.div_ceil(2));
        let split = n - recent_len;
        let previous_start = split.saturating_sub(TREND_WINDOW);

        let recent = RunningAverage::of(&samples[split..]).mean;
        let previous = RunningAverage::of(&samples[previous_start..split]).mean;

        let change = if previous == 0.0 {
            recent - previous
        } else {
            (recent - previous) / previous.abs()
        };
        let change = if higher_is_better { change } else { -change };

        if change > TREND_THRESHOLD {
            TrendDirection::Improving
        } else if change < -TREND_THRESHOLD {
            TrendDirection::Declining
        } else {
            TrendDirection::Stable
        }
    }
}

/// Bounded sample history for one metric.
#[derive(Debug, Clone)]
pub struct TrendSeries {
    samples: VecDeque<f64>,
    higher_is_better: bool,
}

impl TrendSeries {
    /// Creates an empty series.
    pub fn new(higher_is_better: bool) -> Self {
        Self {
            samples: VecDeque::with_capacity(TREND_WINDOW * 2),
            higher_is_better,
        }
    }

    /// Appends a sample, evicting the oldest beyond two windows.
    pub fn push(&mut self, value: f64) {
        if self.samples.len() == TREND_WINDOW * 2 {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    /// Number of retained samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns whether the series holds no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Current trend.
    pub fn direction(&self) -> TrendDirection {
        let samples: Vec<f64> = self.samples.iter().copied().collect();
        TrendDirection::classify(&samples, self.higher_is_better)
    }
}
