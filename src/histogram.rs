//! Fixed-bin histograms of correlation values.
//!
//! Classes keep one histogram of the scores of their members and one of the
//! scores of images that were compared but assigned elsewhere. The split
//! controller uses the same type to find the median score of a class.

/// Bin count used for class and split histograms.
pub const HISTOGRAM_BINS: usize = 200;

#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    min: f64,
    max: f64,
    bins: Vec<f64>,
}

impl Histogram {
    /// Count `samples` into `n_bins` equal bins over `[min, max]`.
    /// Non-finite samples and samples outside the range are ignored.
    pub fn from_samples(samples: &[f64], min: f64, max: f64, n_bins: usize) -> Self {
        let mut histogram = Self {
            min,
            max,
            bins: vec![0.0; n_bins.max(1)],
        };
        for &sample in samples.iter().filter(|s| s.is_finite()) {
            if let Some(idx) = histogram.index_of(sample) {
                histogram.bins[idx] += 1.0;
            }
        }
        histogram
    }

    /// Histogram over the range spanned by the samples themselves.
    pub fn over_samples(samples: &[f64], n_bins: usize) -> Self {
        let (min, max) = finite_range(samples).unwrap_or((0.0, 0.0));
        Self::from_samples(samples, min, max, n_bins)
    }

    /// Add one to every bin and scale the bins to sum to one.
    pub fn laplace_normalized(mut self) -> Self {
        self.bins.iter_mut().for_each(|b| *b += 1.0);
        let total: f64 = self.bins.iter().sum();
        self.bins.iter_mut().for_each(|b| *b /= total);
        self
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn bins(&self) -> &[f64] {
        &self.bins
    }

    /// True when every counted sample had the same value.
    pub fn is_degenerate(&self) -> bool {
        self.max - self.min <= f64::EPSILON * self.max.abs().max(1.0)
    }

    /// Bin holding `value`, or `None` outside `[min, max]`.
    pub fn index_of(&self, value: f64) -> Option<usize> {
        if !value.is_finite() || value < self.min || value > self.max {
            return None;
        }
        let width = self.max - self.min;
        if width <= 0.0 {
            return Some(0);
        }
        let n = self.bins.len();
        let idx = ((value - self.min) / width * n as f64).floor() as usize;
        Some(idx.min(n - 1))
    }

    /// Mass of all bins up to and including the one holding `value`.
    pub fn cumulative_at(&self, value: f64) -> Option<f64> {
        let idx = self.index_of(value)?;
        Some(self.bins[..=idx].iter().sum())
    }

    /// Value below which `percent` % of the mass lies, interpolated inside
    /// the bin where the threshold is crossed.
    pub fn percentile(&self, percent: f64) -> f64 {
        let total: f64 = self.bins.iter().sum();
        if total <= 0.0 {
            return self.min;
        }
        let step = (self.max - self.min) / self.bins.len() as f64;
        let target = percent / 100.0 * total;
        let mut cumulative = 0.0;
        for (i, &count) in self.bins.iter().enumerate() {
            if count > 0.0 && cumulative + count >= target {
                let within = (target - cumulative) / count;
                return self.min + (i as f64 + within) * step;
            }
            cumulative += count;
        }
        self.max
    }
}

/// Smallest and largest finite value, if any.
pub fn finite_range(samples: &[f64]) -> Option<(f64, f64)> {
    samples
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(None, |range, v| match range {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn laplace_correction_keeps_every_bin_positive() {
        let histogram = Histogram::from_samples(&[0.5, 0.5, 0.9], 0.0, 1.0, 10).laplace_normalized();
        assert!(histogram.bins().iter().all(|&b| b > 0.0));
        let total: f64 = histogram.bins().iter().sum();
        assert!((total - 1.0).abs() < 1e-12);
        // 13 counts in total, bin 5 holds 2 + 1.
        assert!((histogram.bins()[5] - 3.0 / 13.0).abs() < 1e-12);
    }

    #[test]
    fn values_outside_domain_have_no_bin() {
        let histogram = Histogram::from_samples(&[0.2, 0.4], 0.2, 0.4, 200);
        assert_eq!(histogram.index_of(0.1), None);
        assert_eq!(histogram.index_of(0.5), None);
        assert_eq!(histogram.index_of(0.4), Some(199));
        assert_eq!(histogram.index_of(0.2), Some(0));
        assert_eq!(histogram.cumulative_at(f64::NAN), None);
    }

    #[test]
    fn cumulative_mass_is_monotone() {
        let samples: Vec<f64> = (0..50).map(|i| i as f64 / 49.0).collect();
        let histogram = Histogram::over_samples(&samples, HISTOGRAM_BINS).laplace_normalized();
        let low = histogram.cumulative_at(0.1).unwrap();
        let high = histogram.cumulative_at(0.9).unwrap();
        assert!(low < high);
        assert!((histogram.cumulative_at(1.0).unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn median_of_uniform_samples() {
        let samples: Vec<f64> = (0..1000).map(|i| i as f64 / 999.0).collect();
        let histogram = Histogram::over_samples(&samples, HISTOGRAM_BINS);
        assert!((histogram.percentile(50.0) - 0.5).abs() < 0.01);
    }

    #[test]
    fn identical_samples_are_degenerate() {
        let histogram = Histogram::over_samples(&[0.7; 12], HISTOGRAM_BINS);
        assert!(histogram.is_degenerate());
        assert_eq!(histogram.index_of(0.7), Some(0));
        assert!((histogram.percentile(50.0) - 0.7).abs() < 1e-12);
        assert!(!Histogram::over_samples(&[0.1, 0.7], HISTOGRAM_BINS).is_degenerate());
    }
}
