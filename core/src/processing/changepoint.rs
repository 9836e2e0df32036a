use crate::config::SegmenterConfig;
use crate::interface::CellId;
use crate::math::matrix::{GappyMatrix, MatrixHelper};
use crate::prelude::{Feature, OmitReason, ProcessingStage, StageError, StageResult};
use crate::telemetry::LogManager;
use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};

/// Squared standardised distance below which two segment means share a state.
const MIN_STATE_SEPARATION: f64 = 4.0;

/// One finalised window of a cell's derived-feature series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub window: i64,
    pub start: f64,
    pub end: f64,
    pub features: Vec<Option<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellSeries {
    pub cell: CellId,
    pub feature_names: Vec<String>,
    pub points: Vec<SeriesPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AirMassSegment {
    pub id: String,
    pub cell: CellId,
    /// Half-open `[start, end)`; `end` is the next segment's `start`.
    pub start: f64,
    pub end: f64,
    pub first_window: i64,
    pub last_window: i64,
    pub windows: usize,
    pub state: usize,
    /// Mean of each feature over the segment, in input units.
    pub means: Vec<Option<f64>>,
    /// Strength of the change point opening this segment, in `[0, 1)`.
    pub boundary_score: Feature<f64>,
    /// Probability of entering this segment's state from the previous one.
    pub entry_transition_likelihood: Feature<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segmentation {
    pub cell: CellId,
    pub feature_names: Vec<String>,
    pub segments: Vec<AirMassSegment>,
    pub state_count: usize,
    /// Row-normalised state transition probabilities.
    pub transitions: Vec<Vec<f64>>,
}

impl Segmentation {
    pub fn segment_at(&self, window: i64) -> Option<&AirMassSegment> {
        self.segments
            .iter()
            .find(|s| window >= s.first_window && window <= s.last_window)
    }
}

/// Prefix sums per feature for O(d) segment costs.
struct CostTable {
    sum: Array2<f64>,
    sum_sq: Array2<f64>,
    count: Array2<f64>,
}

impl CostTable {
    fn new(data: &GappyMatrix) -> Self {
        let (n, d) = data.dim();
        let mut sum = Array2::zeros((n + 1, d));
        let mut sum_sq = Array2::zeros((n + 1, d));
        let mut count = Array2::zeros((n + 1, d));
        for t in 0..n {
            for j in 0..d {
                let (s, q, c) = match data[[t, j]] {
                    Some(x) => (x, x * x, 1.0),
                    None => (0.0, 0.0, 0.0),
                };
                sum[[t + 1, j]] = sum[[t, j]] + s;
                sum_sq[[t + 1, j]] = sum_sq[[t, j]] + q;
                count[[t + 1, j]] = count[[t, j]] + c;
            }
        }
        Self { sum, sum_sq, count }
    }

    /// Gaussian mean-shift cost of `[s, e)`: within-segment sum of squares.
    fn cost(&self, s: usize, e: usize) -> f64 {
        let d = self.sum.ncols();
        (0..d)
            .map(|j| {
                let c = self.count[[e, j]] - self.count[[s, j]];
                if c <= 0.0 {
                    return 0.0;
                }
                let sum = self.sum[[e, j]] - self.sum[[s, j]];
                let sq = self.sum_sq[[e, j]] - self.sum_sq[[s, j]];
                (sq - sum * sum / c).max(0.0)
            })
            .sum()
    }
}

/// Optimal-partitioning change-point detection plus state clustering.
pub struct Segmenter {
    config: SegmenterConfig,
    logger: LogManager,
}

impl Segmenter {
    pub fn new(config: SegmenterConfig) -> Self {
        Self {
            config,
            logger: LogManager::new("segmenter"),
        }
    }

    fn check_order(series: &CellSeries) -> StageResult<()> {
        for pair in series.points.windows(2) {
            if pair[1].start <= pair[0].start {
                return Err(StageError::OrderingViolation(format!(
                    "cell {} window {} at {} does not follow window {} at {}",
                    series.cell, pair[1].window, pair[1].start, pair[0].window, pair[0].start
                )));
            }
        }
        Ok(())
    }

    fn matrix(series: &CellSeries) -> GappyMatrix {
        let d = series.feature_names.len();
        let mut data = Array2::from_elem((series.points.len(), d), None);
        for (t, point) in series.points.iter().enumerate() {
            for (j, value) in point.features.iter().take(d).enumerate() {
                data[[t, j]] = value.filter(|v| v.is_finite());
            }
        }
        data
    }

    /// Segment start indices, always beginning with 0.
    fn partition(&self, table: &CostTable, n: usize, dims: usize) -> Vec<usize> {
        let m = self.config.min_segment_windows.max(1);
        if n < 2 * m {
            return vec![0];
        }
        let beta = self.config.penalty * dims.max(1) as f64 * (n.max(2) as f64).ln();
        let mut best = vec![f64::INFINITY; n + 1];
        let mut prev = vec![0usize; n + 1];
        best[0] = 0.0;
        for t in m..=n {
            let candidates = std::iter::once(0).chain(m..=t.saturating_sub(m));
            for s in candidates {
                if t - s < m || !best[s].is_finite() {
                    continue;
                }
                let penalty = if s == 0 { 0.0 } else { beta };
                let total = best[s] + table.cost(s, t) + penalty;
                if total < best[t] {
                    best[t] = total;
                    prev[t] = s;
                }
            }
        }
        let mut starts = Vec::new();
        let mut t = n;
        while t > 0 {
            let s = prev[t];
            starts.push(s);
            t = s;
        }
        starts.reverse();
        if starts.is_empty() {
            starts.push(0);
        }
        starts
    }

    fn segment_means(data: &GappyMatrix, start: usize, end: usize) -> Vec<Option<f64>> {
        data.slice(ndarray::s![start..end, ..])
            .axis_iter(Axis(1))
            .map(|column| {
                let present: Vec<f64> = column.iter().flatten().copied().collect();
                if present.is_empty() {
                    None
                } else {
                    Some(present.iter().sum::<f64>() / present.len() as f64)
                }
            })
            .collect()
    }

    fn distance(a: &[Option<f64>], b: &[Option<f64>]) -> f64 {
        let a = ndarray::ArrayView1::from(a);
        let b = ndarray::ArrayView1::from(b);
        MatrixHelper::gappy_distance(a, b).unwrap_or(0.0)
    }

    /// Deterministic k-means over segment means with farthest-point seeding.
    fn cluster(&self, means: &[Vec<Option<f64>>]) -> (Vec<usize>, usize) {
        if means.is_empty() {
            return (Vec::new(), 0);
        }
        let mut centroids = vec![means[0].clone()];
        while centroids.len() < self.config.max_states.max(1) {
            let farthest = means
                .iter()
                .enumerate()
                .map(|(i, m)| {
                    let nearest = centroids
                        .iter()
                        .map(|c| Self::distance(m, c))
                        .fold(f64::INFINITY, f64::min);
                    (i, nearest)
                })
                .fold((0, f64::NEG_INFINITY), |acc, cur| if cur.1 > acc.1 { cur } else { acc });
            if farthest.1 < MIN_STATE_SEPARATION {
                break;
            }
            centroids.push(means[farthest.0].clone());
        }

        let k = centroids.len();
        let mut labels = vec![usize::MAX; means.len()];
        for _ in 0..self.config.kmeans_iterations.max(1) {
            let next: Vec<usize> = means
                .iter()
                .map(|m| {
                    centroids
                        .iter()
                        .enumerate()
                        .map(|(c, centroid)| (c, Self::distance(m, centroid)))
                        .fold((0, f64::INFINITY), |acc, cur| if cur.1 < acc.1 { cur } else { acc })
                        .0
                })
                .collect();
            if next == labels {
                break;
            }
            labels = next;
            for (c, centroid) in centroids.iter_mut().enumerate() {
                for (j, value) in centroid.iter_mut().enumerate() {
                    let members: Vec<f64> = means
                        .iter()
                        .zip(&labels)
                        .filter(|(_, &label)| label == c)
                        .filter_map(|(m, _)| m[j])
                        .collect();
                    if !members.is_empty() {
                        *value = Some(members.iter().sum::<f64>() / members.len() as f64);
                    }
                }
            }
        }

        // Relabel states in order of first appearance.
        let mut order: Vec<usize> = Vec::new();
        for &label in &labels {
            if !order.contains(&label) {
                order.push(label);
            }
        }
        let relabelled = labels
            .iter()
            .map(|label| order.iter().position(|o| o == label).unwrap_or(0))
            .collect();
        (relabelled, order.len().min(k))
    }

    fn transitions(states: &[usize], k: usize) -> Vec<Vec<f64>> {
        let mut counts = vec![vec![0.0; k]; k];
        for pair in states.windows(2) {
            counts[pair[0]][pair[1]] += 1.0;
        }
        for row in counts.iter_mut() {
            let total: f64 = row.iter().sum();
            if total > 0.0 {
                row.iter_mut().for_each(|p| *p /= total);
            }
        }
        counts
    }
}

impl ProcessingStage for Segmenter {
    type Input = CellSeries;
    type Output = Segmentation;

    fn execute(&mut self, series: CellSeries) -> StageResult<Segmentation> {
        if series.points.is_empty() {
            return Err(StageError::InsufficientData(format!(
                "cell {} has no finalised windows",
                series.cell
            )));
        }
        Self::check_order(&series)?;

        let raw = Self::matrix(&series);
        let usable = MatrixHelper::usable_columns(&raw, 2);
        let scaled = MatrixHelper::select_columns(&MatrixHelper::standardize_by_noise(&raw), &usable);
        let n = series.points.len();
        let table = CostTable::new(&scaled);
        let starts = self.partition(&table, n, usable.len());

        let bounds: Vec<(usize, usize)> = starts
            .iter()
            .enumerate()
            .map(|(i, &s)| (s, starts.get(i + 1).copied().unwrap_or(n)))
            .collect();
        let scaled_means: Vec<Vec<Option<f64>>> = bounds
            .iter()
            .map(|&(s, e)| Self::segment_means(&scaled, s, e))
            .collect();
        let (states, k) = self.cluster(&scaled_means);
        let transitions = Self::transitions(&states, k);

        let mut segments = Vec::with_capacity(bounds.len());
        for (i, &(s, e)) in bounds.iter().enumerate() {
            let boundary_score = if i == 0 {
                Feature::omitted(OmitReason::NoTransition)
            } else {
                let (ps, _) = bounds[i - 1];
                let gain = table.cost(ps, e) - table.cost(ps, s) - table.cost(s, e);
                Feature::present(1.0 - (-gain.max(0.0) / 2.0).exp())
            };
            let entry_transition_likelihood = if i == 0 {
                Feature::omitted(OmitReason::NoTransition)
            } else {
                Feature::present(transitions[states[i - 1]][states[i]])
            };
            let end = match bounds.get(i + 1) {
                Some(&(next, _)) => series.points[next].start,
                None => series.points[n - 1].end,
            };
            segments.push(AirMassSegment {
                id: format!("AM-{}-{}-{}", series.cell.row, series.cell.col, i + 1),
                cell: series.cell,
                start: series.points[s].start,
                end,
                first_window: series.points[s].window,
                last_window: series.points[e - 1].window,
                windows: e - s,
                state: states[i],
                means: Self::segment_means(&raw, s, e),
                boundary_score,
                entry_transition_likelihood,
            });
        }

        self.logger.record(&format!(
            "cell {}: {} windows, {} segments, {} states",
            series.cell,
            n,
            segments.len(),
            k
        ));
        Ok(Segmentation {
            cell: series.cell,
            feature_names: series.feature_names,
            segments,
            state_count: k,
            transitions,
        })
    }

    fn cleanup(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    const CELL: CellId = CellId { row: 0, col: 2 };

    fn series(levels: &[(usize, f64)]) -> CellSeries {
        let mut points = Vec::new();
        let mut i = 0i64;
        for &(count, level) in levels {
            for _ in 0..count {
                let noise = if i % 2 == 0 { 0.1 } else { -0.1 } * (1.0 + (i % 3) as f64) / 2.0;
                points.push(SeriesPoint {
                    window: 100 + i,
                    start: 6000.0 + 60.0 * i as f64,
                    end: 6060.0 + 60.0 * i as f64,
                    features: vec![Some(level + noise), None],
                });
                i += 1;
            }
        }
        CellSeries {
            cell: CELL,
            feature_names: vec!["temperature_k".into(), "theta_v_k".into()],
            points,
        }
    }

    fn assert_covers(series: &CellSeries, seg: &Segmentation) {
        let first = &seg.segments[0];
        let last = &seg.segments[seg.segments.len() - 1];
        assert_eq!(first.start, series.points[0].start);
        assert_eq!(last.end, series.points[series.points.len() - 1].end);
        for pair in seg.segments.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        let total: usize = seg.segments.iter().map(|s| s.windows).sum();
        assert_eq!(total, series.points.len());
    }

    #[test]
    fn steady_series_is_one_segment() {
        let input = series(&[(20, 270.0)]);
        let seg = Segmenter::new(SegmenterConfig::default())
            .execute(input.clone())
            .unwrap();
        assert_eq!(seg.segments.len(), 1);
        assert_eq!(seg.segments[0].boundary_score.reason(), Some(OmitReason::NoTransition));
        assert_covers(&input, &seg);
    }

    #[test]
    fn level_shifts_split_and_recurring_state_is_shared() {
        let input = series(&[(10, 270.0), (10, 275.0), (10, 270.0)]);
        let seg = Segmenter::new(SegmenterConfig::default())
            .execute(input.clone())
            .unwrap();
        assert_eq!(seg.segments.len(), 3);
        assert_eq!(seg.segments[1].first_window, 110);
        assert_eq!(seg.segments[2].first_window, 120);
        assert_eq!(seg.state_count, 2);
        assert_eq!(seg.segments[0].state, seg.segments[2].state);
        assert_ne!(seg.segments[0].state, seg.segments[1].state);
        assert_eq!(seg.segments[1].entry_transition_likelihood, Feature::present(1.0));
        assert!(*seg.segments[1].boundary_score.get().unwrap() > 0.99);
        assert!((seg.segments[1].means[0].unwrap() - 275.0).abs() < 0.1);
        assert!(seg.segments[1].means[1].is_none());
        assert_covers(&input, &seg);
        assert_eq!(seg.segment_at(115).map(|s| s.id.as_str()), Some("AM-0-2-2"));
    }

    #[test]
    fn out_of_order_windows_are_rejected() {
        let mut input = series(&[(6, 270.0)]);
        input.points.swap(2, 3);
        let err = Segmenter::new(SegmenterConfig::default())
            .execute(input)
            .unwrap_err();
        assert_eq!(err.kind(), "ordering_violation");
    }

    #[test]
    fn short_series_stays_whole() {
        let input = series(&[(2, 270.0), (2, 280.0)]);
        let seg = Segmenter::new(SegmenterConfig::default())
            .execute(input.clone())
            .unwrap();
        assert_eq!(seg.segments.len(), 1);
        assert_covers(&input, &seg);
    }
}
