use crate::math::stats::StatsHelper;
use ndarray::{Array2, ArrayView1, Axis};

/// Feature matrices with explicit gaps: rows are time steps, columns features.
pub type GappyMatrix = Array2<Option<f64>>;

pub struct MatrixHelper;

impl MatrixHelper {
    /// Centres each column on its median and scales it by the noise level
    /// seen in first differences of consecutive present values, so a level
    /// shift does not inflate the scale. Falls back to the column's MAD sigma,
    /// then to unit scale. Gaps stay gaps.
    pub fn standardize_by_noise(data: &GappyMatrix) -> GappyMatrix {
        let mut out = data.clone();
        for (mut column, source) in out.axis_iter_mut(Axis(1)).zip(data.axis_iter(Axis(1))) {
            let present: Vec<f64> = source.iter().flatten().copied().collect();
            let center = StatsHelper::median(&present).unwrap_or(0.0);
            let diffs: Vec<f64> = present.windows(2).map(|w| w[1] - w[0]).collect();
            let scale = StatsHelper::mad_sigma(&diffs)
                .map(|s| s / std::f64::consts::SQRT_2)
                .filter(|s| *s > 1e-9)
                .or_else(|| StatsHelper::mad_sigma(&present).filter(|s| *s > 1e-9))
                .unwrap_or(1.0);
            for cell in column.iter_mut() {
                *cell = cell.map(|v| (v - center) / scale);
            }
        }
        out
    }

    /// Columns with at least `min_present` entries.
    pub fn usable_columns(data: &GappyMatrix, min_present: usize) -> Vec<usize> {
        data.axis_iter(Axis(1))
            .enumerate()
            .filter(|(_, column)| column.iter().flatten().count() >= min_present)
            .map(|(idx, _)| idx)
            .collect()
    }

    pub fn select_columns(data: &GappyMatrix, columns: &[usize]) -> GappyMatrix {
        data.select(Axis(1), columns)
    }

    /// Squared Euclidean distance over dimensions present in both rows,
    /// rescaled to the full dimensionality. `None` when nothing overlaps.
    pub fn gappy_distance(a: ArrayView1<Option<f64>>, b: ArrayView1<Option<f64>>) -> Option<f64> {
        let mut sum = 0.0;
        let mut shared = 0usize;
        for (x, y) in a.iter().zip(b.iter()) {
            if let (Some(x), Some(y)) = (x, y) {
                sum += (x - y).powi(2);
                shared += 1;
            }
        }
        if shared == 0 {
            return None;
        }
        Some(sum * a.len() as f64 / shared as f64)
    }
}
