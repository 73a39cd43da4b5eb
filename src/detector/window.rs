use std::collections::VecDeque;

/// Bounded FIFO of `(regressors, target)` samples used to fit the model.
#[derive(Debug, Clone)]
pub struct TrainingWindow {
    samples: VecDeque<(Vec<f64>, f64)>,
    capacity: usize,
    dims: usize,
}

impl TrainingWindow {
    pub fn new(capacity: usize, dims: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            dims,
        }
    }

    /// Append a sample, evicting the oldest one when full.
    pub fn push(&mut self, row: Vec<f64>, target: f64) {
        debug_assert_eq!(row.len(), self.dims);
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back((row, target));
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() == self.capacity
    }

    /// Number of regressors per sample.
    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[f64], f64)> {
        self.samples.iter().map(|(row, t)| (row.as_slice(), *t))
    }

    pub fn mean_target(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().map(|(_, t)| t).sum::<f64>() / self.samples.len() as f64)
    }
}
