/// Scale factor turning a median absolute deviation into a normal-equivalent sigma.
pub const MAD_TO_SIGMA: f64 = 1.4826;

pub struct StatsHelper;

impl StatsHelper {
    pub fn mean(samples: &[f64]) -> Option<f64> {
        if samples.is_empty() {
            return None;
        }
        Some(samples.iter().sum::<f64>() / samples.len() as f64)
    }

    /// Unbiased sample variance; needs at least two samples.
    pub fn variance(samples: &[f64]) -> Option<f64> {
        if samples.len() < 2 {
            return None;
        }
        let mean = Self::mean(samples)?;
        let ss: f64 = samples.iter().map(|v| (v - mean).powi(2)).sum();
        Some(ss / (samples.len() - 1) as f64)
    }

    pub fn median(samples: &[f64]) -> Option<f64> {
        if samples.is_empty() {
            return None;
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 0 {
            Some(0.5 * (sorted[mid - 1] + sorted[mid]))
        } else {
            Some(sorted[mid])
        }
    }

    /// Median absolute deviation around the median, scaled to sigma.
    pub fn mad_sigma(samples: &[f64]) -> Option<f64> {
        let center = Self::median(samples)?;
        let deviations: Vec<f64> = samples.iter().map(|v| (v - center).abs()).collect();
        Self::median(&deviations).map(|mad| mad * MAD_TO_SIGMA)
    }

    /// Huber M-estimate of location with a MAD scale, by iteratively
    /// reweighted means starting from the median.
    pub fn huber_location(samples: &[f64], k: f64) -> Option<f64> {
        let mut center = Self::median(samples)?;
        let scale = Self::mad_sigma(samples)?;
        if scale <= f64::EPSILON {
            return Some(center);
        }
        for _ in 0..50 {
            let (mut weighted, mut weights) = (0.0, 0.0);
            for &value in samples {
                let r = ((value - center) / scale).abs();
                let w = if r <= k { 1.0 } else { k / r };
                weighted += w * value;
                weights += w;
            }
            let next = weighted / weights;
            if (next - center).abs() < 1e-9 * scale {
                return Some(next);
            }
            center = next;
        }
        Some(center)
    }

    /// Theil–Sen line fit: median of pairwise slopes, median intercept.
    /// Pairs with coincident `x` are skipped.
    pub fn theil_sen(xs: &[f64], ys: &[f64]) -> Option<(f64, f64)> {
        if xs.len() != ys.len() || xs.len() < 2 {
            return None;
        }
        let mut slopes = Vec::with_capacity(xs.len() * (xs.len() - 1) / 2);
        for i in 0..xs.len() {
            for j in (i + 1)..xs.len() {
                let dx = xs[j] - xs[i];
                if dx.abs() > 1e-9 {
                    slopes.push((ys[j] - ys[i]) / dx);
                }
            }
        }
        let slope = Self::median(&slopes)?;
        let intercepts: Vec<f64> = xs.iter().zip(ys).map(|(x, y)| y - slope * x).collect();
        let intercept = Self::median(&intercepts)?;
        Some((slope, intercept))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn median_handles_even_and_odd_lengths() {
        assert_eq!(StatsHelper::median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(StatsHelper::median(&[4.0, 1.0, 2.0, 3.0]), Some(2.5));
        assert_eq!(StatsHelper::median(&[]), None);
    }

    #[test]
    fn huber_resists_a_spike() {
        let samples = [10.0, 10.2, 9.9, 10.1, 9.8, 250.0];
        let mean = StatsHelper::mean(&samples).unwrap();
        let huber = StatsHelper::huber_location(&samples, 1.345).unwrap();
        assert!(mean > 45.0);
        assert!((huber - 10.0).abs() < 0.5, "huber {}", huber);
    }

    #[test]
    fn theil_sen_ignores_single_outlier() {
        let xs: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let mut ys: Vec<f64> = xs.iter().map(|x| 2.0 * x + 1.0).collect();
        ys[7] = 100.0;
        let (slope, intercept) = StatsHelper::theil_sen(&xs, &ys).unwrap();
        assert!((slope - 2.0).abs() < 1e-9);
        assert!((intercept - 1.0).abs() < 1e-9);
    }

    #[test]
    fn variance_needs_two_samples() {
        assert_eq!(StatsHelper::variance(&[1.0]), None);
        assert!((StatsHelper::variance(&[1.0, 3.0]).unwrap() - 2.0).abs() < 1e-12);
    }
}
