use crate::config::{BasinConfig, BoundaryLayerConfig};
use crate::interface::{CellId, Field, Icao, SealedBin};
use crate::math::stats::StatsHelper;
use crate::prelude::{StageError, StageResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Vertical resolution at which samples from different flights are merged.
const LEVEL_M: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProfileSample {
    pub icao: Icao,
    pub altitude_m: f64,
    pub temperature_k: Option<f64>,
    pub turbulence_var: Option<f64>,
}

impl ProfileSample {
    pub fn from_bin(bin: &SealedBin) -> Option<Self> {
        let icao = bin.key.icao()?;
        let sample = Self {
            icao,
            altitude_m: bin.altitude_m(),
            temperature_k: bin.value(Field::Temperature),
            turbulence_var: bin.value(Field::TurbulenceVar),
        };
        (sample.temperature_k.is_some() || sample.turbulence_var.is_some()).then_some(sample)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryMethod {
    Turbulence,
    Lapse,
    Combined,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundaryLayerEstimate {
    pub cell: CellId,
    pub window: i64,
    pub depth_m_agl: f64,
    pub top_msl_m: f64,
    pub method: BoundaryMethod,
    pub flights: usize,
    pub confidence: f64,
}

/// Composite mixed-layer depth from profiles flown through one cell.
pub struct BoundaryLayerEstimator {
    config: BoundaryLayerConfig,
    floor_elevation_m: f64,
}

impl BoundaryLayerEstimator {
    pub fn new(config: BoundaryLayerConfig, basin: &BasinConfig) -> Self {
        Self {
            config,
            floor_elevation_m: basin.floor_elevation_m,
        }
    }

    /// Median value per merged altitude level, bottom up.
    fn levels(
        samples: &[ProfileSample],
        value: impl Fn(&ProfileSample) -> Option<f64>,
    ) -> Vec<(f64, f64)> {
        let mut by_level: BTreeMap<i64, (Vec<f64>, Vec<f64>)> = BTreeMap::new();
        for sample in samples {
            if let Some(v) = value(sample) {
                let entry = by_level
                    .entry((sample.altitude_m / LEVEL_M).round() as i64)
                    .or_default();
                entry.0.push(sample.altitude_m);
                entry.1.push(v);
            }
        }
        by_level
            .values()
            .filter_map(|(alts, vals)| Some((StatsHelper::median(alts)?, StatsHelper::median(vals)?)))
            .collect()
    }

    /// Top of the turbulent layer attached to the lowest level.
    fn turbulence_top(&self, samples: &[ProfileSample]) -> Option<f64> {
        let levels = Self::levels(samples, |s| s.turbulence_var);
        let threshold = self.config.turbulence_threshold;
        if levels.first()?.1 < threshold {
            return None;
        }
        levels
            .windows(2)
            .find(|pair| pair[1].1 < threshold)
            .map(|pair| 0.5 * (pair[0].0 + pair[1].0))
    }

    /// Height where the lapse rate drops from near-dry-adiabatic to stable.
    fn lapse_top(&self, samples: &[ProfileSample]) -> Option<f64> {
        let levels = Self::levels(samples, |s| s.temperature_k);
        let lapses: Vec<(f64, f64, f64)> = levels
            .windows(2)
            .filter(|pair| pair[1].0 - pair[0].0 >= LEVEL_M)
            .map(|pair| {
                let lapse = -(pair[1].1 - pair[0].1) / (pair[1].0 - pair[0].0) * 1000.0;
                (pair[0].0, pair[1].0, lapse)
            })
            .collect();
        if lapses.first()?.2 < self.config.adiabatic_kperkm {
            return None;
        }
        lapses
            .iter()
            .find(|(_, _, lapse)| *lapse < self.config.stable_kperkm)
            .map(|(low, high, _)| 0.5 * (low + high))
    }

    pub fn estimate(
        &self,
        cell: CellId,
        window: i64,
        samples: &[ProfileSample],
    ) -> StageResult<BoundaryLayerEstimate> {
        let flights: BTreeSet<Icao> = samples.iter().map(|s| s.icao).collect();
        if flights.len() < self.config.min_flights {
            return Err(StageError::InsufficientData(format!(
                "boundary layer for cell {} window {} has {} of {} flights",
                cell,
                window,
                flights.len(),
                self.config.min_flights
            )));
        }
        let low = samples.iter().map(|s| s.altitude_m).fold(f64::INFINITY, f64::min);
        let high = samples.iter().map(|s| s.altitude_m).fold(f64::NEG_INFINITY, f64::max);
        if high - low < self.config.min_span_m {
            return Err(StageError::InsufficientData(format!(
                "boundary layer for cell {} window {} spans {:.0} m of {:.0} m",
                cell,
                window,
                (high - low).max(0.0),
                self.config.min_span_m
            )));
        }

        let (top, method, confidence) = match (self.turbulence_top(samples), self.lapse_top(samples)) {
            (Some(a), Some(b)) => (
                0.5 * (a + b),
                BoundaryMethod::Combined,
                0.6 + 0.4 * (-(a - b).abs() / 500.0).exp(),
            ),
            (Some(a), None) => (a, BoundaryMethod::Turbulence, 0.5),
            (None, Some(b)) => (b, BoundaryMethod::Lapse, 0.5),
            (None, None) => {
                return Err(StageError::InsufficientData(format!(
                    "no mixed-layer top found for cell {} window {}",
                    cell, window
                )))
            }
        };

        Ok(BoundaryLayerEstimate {
            cell,
            window,
            depth_m_agl: (top - self.floor_elevation_m).max(0.0),
            top_msl_m: top,
            method,
            flights: flights.len(),
            confidence,
        })
    }
}
