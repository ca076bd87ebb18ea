use std::collections::VecDeque;

/// Running average until `window` samples exist, then a sliding average over
/// the most recent `window` samples.
#[derive(Debug, Clone)]
pub struct SimpleMovingAverage {
    window: usize,
    samples: VecDeque<f64>,
    value: f64,
}

impl SimpleMovingAverage {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            samples: VecDeque::with_capacity(window + 1),
            value: 0.0,
        }
    }

    /// Adds a sample and returns the updated average.
    pub fn push(&mut self, sample: f64) -> f64 {
        self.samples.push_back(sample);
        if self.samples.len() > self.window {
            self.samples.pop_front();
        }
        self.value = self.samples.iter().sum::<f64>() / self.samples.len() as f64;
        self.value
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn window(&self) -> usize {
        self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_all_samples_before_the_window_fills() {
        let mut sma = SimpleMovingAverage::new(5);
        assert!(sma.is_empty());
        assert_eq!(sma.value(), 0.0);
        sma.push(10.0);
        sma.push(20.0);
        assert_eq!(sma.push(30.0), 20.0);
        assert_eq!(sma.len(), 3);
    }

    #[test]
    fn slides_once_full() {
        let mut sma = SimpleMovingAverage::new(3);
        for v in [1.0, 2.0, 3.0, 4.0, 5.0] {
            sma.push(v);
        }
        assert_eq!(sma.len(), 3);
        assert!((sma.value() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn zero_window_behaves_like_one() {
        let mut sma = SimpleMovingAverage::new(0);
        sma.push(3.0);
        assert_eq!(sma.push(7.0), 7.0);
        assert_eq!(sma.window(), 1);
    }
}
