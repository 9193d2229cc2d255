//! Smoothed training statistics.

use crate::common::*;

const DEFAULT_WINDOW_SIZE: usize = 20;

/// Tracks a series of values and provides smoothed values over a window or the global average.
#[derive(Debug, Clone)]
pub struct SmoothedValue {
    window: VecDeque<f64>,
    window_size: usize,
    total: f64,
    count: usize,
}

impl Default for SmoothedValue {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE)
    }
}

impl SmoothedValue {
    pub fn new(window_size: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(window_size),
            window_size: window_size.max(1),
            total: 0.0,
            count: 0,
        }
    }

    pub fn update(&mut self, value: f64) {
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(value);
        self.total += value;
        self.count += 1;
    }

    /// The median over the window. The lower one is taken for even lengths.
    pub fn median(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let sorted: Vec<f64> = self
            .window
            .iter()
            .copied()
            .sorted_by(|lhs, rhs| lhs.partial_cmp(rhs).unwrap_or(Ordering::Equal))
            .collect();
        sorted[(sorted.len() - 1) / 2]
    }

    pub fn avg(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().sum::<f64>() / self.window.len() as f64
    }

    pub fn global_avg(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.total / self.count as f64
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

/// Named smoothed values printed in insertion order.
#[derive(Debug, Clone)]
pub struct MetricLogger {
    meters: IndexMap<String, SmoothedValue>,
    delimiter: String,
}

impl Default for MetricLogger {
    fn default() -> Self {
        Self::new("  ")
    }
}

impl MetricLogger {
    pub fn new<S>(delimiter: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            meters: IndexMap::new(),
            delimiter: delimiter.into(),
        }
    }

    pub fn update<S>(&mut self, name: S, value: f64)
    where
        S: Into<String>,
    {
        self.meters.entry(name.into()).or_default().update(value);
    }

    pub fn get(&self, name: &str) -> Option<&SmoothedValue> {
        self.meters.get(name)
    }
}

impl Display for MetricLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = self
            .meters
            .iter()
            .map(|(name, meter)| {
                format!(
                    "{}: {:.4} ({:.4})",
                    name,
                    meter.median(),
                    meter.global_avg()
                )
            })
            .join(&self.delimiter);
        write!(f, "{}", text)
    }
}
