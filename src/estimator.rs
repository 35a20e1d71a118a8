//! Fixed-window moving average used for bandwidth and RTT estimation.

use std::collections::VecDeque;

/// Arithmetic mean of the last `max_values` recorded samples.
///
/// An initial value is recorded at construction so `value()` is meaningful
/// before the first real sample arrives (e.g. before the first RTT sample
/// comes back from a ping).
#[derive(Debug, Clone)]
pub struct MovingAverage {
    values: VecDeque<i64>,
    max_values: usize,
}

impl MovingAverage {
    pub fn new(max_values: usize, initial_value: i64) -> Self {
        let max_values = max_values.max(1);
        let mut values = VecDeque::with_capacity(max_values);
        values.push_back(initial_value);
        MovingAverage { values, max_values }
    }

    pub fn record(&mut self, sample: i64) {
        self.values.push_back(sample);
        while self.values.len() > self.max_values {
            self.values.pop_front();
        }
    }

    pub fn value(&self) -> i64 {
        let sum: i64 = self.values.iter().sum();
        sum / self.values.len() as i64
    }

    pub fn sample_count(&self) -> usize {
        self.values.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_value_is_visible_before_any_sample() {
        let avg = MovingAverage::new(10, 42);
        assert_eq!(avg.value(), 42);
    }

    #[test]
    fn averages_the_last_n_samples() {
        let mut avg = MovingAverage::new(3, 0);
        avg.record(10);
        avg.record(20);
        avg.record(30);
        // window holds [0,10,20,30] until it overflows 3... the initial
        // value is itself a sample, so after 3 records the window is full.
        assert_eq!(avg.sample_count(), 3);
        avg.record(40);
        // oldest (0) dropped: window is now [20,30,40]
        assert_eq!(avg.sample_count(), 3);
        assert_eq!(avg.value(), (20 + 30 + 40) / 3);
    }

    #[test]
    fn floors_the_division() {
        let mut avg = MovingAverage::new(2, 1);
        avg.record(2);
        // (1+2)/2 = 1 (floor)
        assert_eq!(avg.value(), 1);
    }
}
