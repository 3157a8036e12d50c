//! Robust summary statistics over a window of sensor values.

/// Consistency constant that scales MAD to a standard deviation estimate
/// for normally distributed data.
pub const MAD_TO_SIGMA: f64 = 1.4826;

/// Smallest spread used as a z-score denominator.
pub const SCALE_EPSILON: f64 = 1e-6;

/// A window of finite samples, oldest first.
#[derive(Debug, Clone)]
pub struct TimeSeries {
    values: Vec<f64>,
}

impl TimeSeries {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }

    pub fn variance(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let mean = self.mean();
        self.values.iter().map(|&x| (x - mean).powi(2)).sum::<f64>() / self.values.len() as f64
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn median(&self) -> f64 {
        median_of(&self.values)
    }

    /// Median absolute deviation around `center` (normally the median).
    pub fn mad(&self, center: f64) -> f64 {
        let deviations: Vec<f64> = self.values.iter().map(|v| (v - center).abs()).collect();
        median_of(&deviations)
    }

    /// Robust scale: `MAD * 1.4826`, or the standard deviation when the MAD
    /// collapses to zero, never below [`SCALE_EPSILON`].
    pub fn robust_scale(&self, median: f64) -> f64 {
        let mad = self.mad(median);
        let scale = if mad > 0.0 {
            mad * MAD_TO_SIGMA
        } else {
            self.std_dev()
        };
        scale.max(SCALE_EPSILON)
    }

    /// Robust z-score of `value` against this series.
    pub fn robust_z(&self, value: f64) -> f64 {
        let median = self.median();
        (value - median) / self.robust_scale(median)
    }

    /// Coefficient of variation, `None` when undefined (empty or zero mean).
    pub fn coefficient_of_variation(&self) -> Option<f64> {
        let mean = self.mean();
        if self.values.is_empty() || mean == 0.0 {
            return None;
        }
        Some((self.std_dev() / mean).abs())
    }
}

fn median_of(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[mid]
    } else {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    }
}

/// Ordinary least-squares slope of `points` (x, y).
///
/// Returns 0.0 with fewer than two points or no spread in x.
pub fn ols_slope(points: &[(f64, f64)]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }
    let n = points.len() as f64;
    let x_mean = points.iter().map(|p| p.0).sum::<f64>() / n;
    let y_mean = points.iter().map(|p| p.1).sum::<f64>() / n;
    let (cov, var) = points.iter().fold((0.0, 0.0), |(c, v), &(x, y)| {
        (c + (x - x_mean) * (y - y_mean), v + (x - x_mean).powi(2))
    });
    if var == 0.0 {
        return 0.0;
    }
    cov / var
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median_odd_and_even() {
        assert_eq!(TimeSeries::new(vec![5.0, 1.0, 3.0]).median(), 3.0);
        assert_eq!(TimeSeries::new(vec![4.0, 1.0, 3.0, 2.0]).median(), 2.5);
    }

    #[test]
    fn test_mad() {
        // |x - 3| = 2, 1, 0, 1, 97 -> median 1
        let ts = TimeSeries::new(vec![1.0, 2.0, 3.0, 4.0, 100.0]);
        assert_eq!(ts.mad(3.0), 1.0);
        assert!((ts.robust_scale(3.0) - MAD_TO_SIGMA).abs() < 1e-12);
    }

    #[test]
    fn test_outlier_does_not_inflate_scale() {
        let ts = TimeSeries::new(vec![10.0, 11.0, 9.0, 10.0, 10.5, 9.5, 5000.0]);
        // the 5000 sample barely moves the robust z of a modest reading
        assert!(ts.robust_z(12.0) > 2.0);
    }

    #[test]
    fn test_constant_series_is_safe() {
        let ts = TimeSeries::new(vec![7.0; 20]);
        assert_eq!(ts.robust_scale(7.0), SCALE_EPSILON);
        assert_eq!(ts.robust_z(7.0), 0.0);
    }

    #[test]
    fn test_zero_mad_falls_back_to_spread() {
        // more than half identical -> MAD is zero, std-dev is 1.6
        let ts = TimeSeries::new(vec![5.0, 5.0, 5.0, 5.0, 9.0]);
        let scale = ts.robust_scale(5.0);
        assert!((scale - 1.6).abs() < 1e-9);
    }

    #[test]
    fn test_slope() {
        let pts: Vec<(f64, f64)> = (0..6).map(|i| (i as f64, 2.0 * i as f64 + 1.0)).collect();
        assert!((ols_slope(&pts) - 2.0).abs() < 1e-12);
        assert_eq!(ols_slope(&[(0.0, 1.0)]), 0.0);
    }

    #[test]
    fn test_cv() {
        assert_eq!(TimeSeries::new(vec![0.0, 0.0]).coefficient_of_variation(), None);
        let cv = TimeSeries::new(vec![9.0, 11.0]).coefficient_of_variation().unwrap();
        assert!((cv - 0.1).abs() < 1e-12);
    }
}
