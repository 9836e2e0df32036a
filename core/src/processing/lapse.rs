use crate::config::LapseConfig;
use crate::interface::CellId;
use crate::math::stats::StatsHelper;
use crate::prelude::{StageError, StageResult};
use crate::processing::thermo::ThermoState;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProfilePoint {
    pub altitude_m: f64,
    pub temperature_k: f64,
}

impl From<&ThermoState> for ProfilePoint {
    fn from(state: &ThermoState) -> Self {
        Self {
            altitude_m: state.altitude_m,
            temperature_k: state.temperature_k,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InversionLayer {
    pub base_m: f64,
    pub top_m: f64,
    pub depth_m: f64,
    /// Temperature gain from base to top.
    pub strength_k: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LapseRateFit {
    pub cell: CellId,
    pub window: i64,
    /// `-dT/dz` in K/km; positive when temperature falls with height.
    pub lapse_rate_kperkm: f64,
    pub slope_k_per_m: f64,
    pub intercept_k: f64,
    pub residual_sigma_k: f64,
    pub bins: usize,
    pub span_m: f64,
    pub base_altitude_m: f64,
    pub inversion: Option<InversionLayer>,
}

impl LapseRateFit {
    pub fn inversion_flag(&self) -> bool {
        self.inversion.is_some()
    }
}

/// Robust temperature-versus-altitude fit over the bins of one cell window.
pub struct LapseDetector {
    config: LapseConfig,
}

impl LapseDetector {
    pub fn new(config: LapseConfig) -> Self {
        Self { config }
    }

    pub fn fit(&self, cell: CellId, window: i64, points: &[ProfilePoint]) -> StageResult<LapseRateFit> {
        if points.len() < self.config.min_bins {
            return Err(StageError::InsufficientData(format!(
                "lapse fit for cell {} window {} has {} of {} bins",
                cell,
                window,
                points.len(),
                self.config.min_bins
            )));
        }
        let mut sorted = points.to_vec();
        sorted.sort_by(|a, b| a.altitude_m.total_cmp(&b.altitude_m));
        let (low, high) = match (sorted.first(), sorted.last()) {
            (Some(low), Some(high)) => (low.altitude_m, high.altitude_m),
            _ => return Err(StageError::Internal("empty profile".into())),
        };
        let span = high - low;
        if span < self.config.min_span_m {
            return Err(StageError::InsufficientData(format!(
                "lapse fit for cell {} window {} spans {:.0} m of {:.0} m",
                cell, window, span, self.config.min_span_m
            )));
        }

        let xs: Vec<f64> = sorted.iter().map(|p| p.altitude_m).collect();
        let ys: Vec<f64> = sorted.iter().map(|p| p.temperature_k).collect();
        let (slope, intercept) = StatsHelper::theil_sen(&xs, &ys).ok_or_else(|| {
            StageError::InsufficientData(format!(
                "lapse fit for cell {} window {} has no distinct altitudes",
                cell, window
            ))
        })?;
        let residuals: Vec<f64> = xs
            .iter()
            .zip(&ys)
            .map(|(x, y)| y - (intercept + slope * x))
            .collect();
        let residual_sigma = StatsHelper::mad_sigma(&residuals).unwrap_or(0.0);

        let warming_kperkm = slope * 1000.0;
        let inversion = if warming_kperkm > self.config.inversion_threshold_kperkm
            && residual_sigma < self.config.max_residual_k
        {
            Some(Self::inversion_layer(&sorted))
        } else {
            None
        };

        Ok(LapseRateFit {
            cell,
            window,
            lapse_rate_kperkm: -warming_kperkm,
            slope_k_per_m: slope,
            intercept_k: intercept,
            residual_sigma_k: residual_sigma,
            bins: sorted.len(),
            span_m: span,
            base_altitude_m: low,
            inversion,
        })
    }

    /// Longest contiguous run of warming between altitude-sorted points; the
    /// whole profile when no pair warms.
    fn inversion_layer(sorted: &[ProfilePoint]) -> InversionLayer {
        let mut best = (0, sorted.len().saturating_sub(1));
        let mut best_len = 0;
        let mut run_start = 0;
        for i in 1..sorted.len() {
            if sorted[i].temperature_k > sorted[i - 1].temperature_k {
                let len = i - run_start;
                if len > best_len {
                    best_len = len;
                    best = (run_start, i);
                }
            } else {
                run_start = i;
            }
        }
        let (base, top) = (&sorted[best.0], &sorted[best.1]);
        InversionLayer {
            base_m: base.altitude_m,
            top_m: top.altitude_m,
            depth_m: top.altitude_m - base.altitude_m,
            strength_k: top.temperature_k - base.temperature_k,
        }
    }
}
