//! Robust statistics
//!
//! Median and Median Absolute Deviation are used instead of mean/variance so that a
//! single transient spike (door opened, sensor glitch) cannot dominate a result.

use crate::constants::analysis::MAD_SCALE;

fn sorted_finite(values: &[f64]) -> Vec<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    sorted
}

fn median_of_sorted(sorted: &[f64]) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Median of the finite values; `None` if there are none
pub fn median(values: &[f64]) -> Option<f64> {
    median_of_sorted(&sorted_finite(values))
}

/// Median Absolute Deviation (unscaled)
pub fn mad(values: &[f64]) -> Option<f64> {
    let center = median(values)?;
    let deviations: Vec<f64> = values
        .iter()
        .filter(|v| v.is_finite())
        .map(|v| (v - center).abs())
        .collect();
    median(&deviations)
}

/// Arithmetic mean of the finite values
pub fn mean(values: &[f64]) -> Option<f64> {
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return None;
    }
    Some(finite.iter().sum::<f64>() / finite.len() as f64)
}

/// Drop values further than `k` scaled MADs from the median
///
/// With zero spread there is no scale to judge against, so everything is kept.
pub fn reject_outliers(values: &[f64], k: f64) -> Vec<f64> {
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    let (Some(center), Some(spread)) = (median(&finite), mad(&finite)) else {
        return finite;
    };

    let scale = spread * MAD_SCALE;
    if scale <= f64::EPSILON {
        return finite;
    }

    finite
        .into_iter()
        .filter(|v| (v - center).abs() <= k * scale)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median_odd_even() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), Some(2.5));
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn test_median_ignores_nan() {
        assert_eq!(median(&[f64::NAN, 5.0, 1.0, 3.0]), Some(3.0));
    }

    #[test]
    fn test_mad_resists_single_spike() {
        let calm = [20.0, 20.1, 19.9, 20.0, 20.05];
        let spiky = [20.0, 20.1, 19.9, 20.0, 25.0];
        let calm_mad = mad(&calm).unwrap();
        let spiky_mad = mad(&spiky).unwrap();
        assert!((calm_mad - spiky_mad).abs() < 0.06);
    }

    #[test]
    fn test_reject_outliers() {
        let values = [0.2, 0.25, 0.22, 0.18, 2.0];
        let kept = reject_outliers(&values, 3.0);
        assert_eq!(kept.len(), 4);
        assert!(!kept.contains(&2.0));
    }

    #[test]
    fn test_reject_outliers_zero_spread_keeps_all() {
        let values = [0.2, 0.2, 0.2, 0.9];
        assert_eq!(reject_outliers(&values, 3.0).len(), 4);
    }

    #[test]
    fn test_mean() {
        assert_eq!(mean(&[1.0, 2.0, 3.0]), Some(2.0));
        assert_eq!(mean(&[]), None);
    }
}
