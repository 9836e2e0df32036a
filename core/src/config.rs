//! Explicit configuration passed into every stage constructor.
//!
//! Every section deserializes with defaults, so a YAML workflow only needs to
//! name what it changes.

use crate::interface::CellId;
use crate::prelude::{StageError, StageResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub basin: BasinConfig,
    pub normalizer: NormalizerConfig,
    pub quality: QualityConfig,
    pub window: WindowConfig,
    pub wind: WindConfig,
    pub thermo: ThermoConfig,
    pub lapse: LapseConfig,
    pub turbulence: TurbulenceConfig,
    pub altitude: AltitudeConfig,
    pub cold_pool: ColdPoolConfig,
    pub segmenter: SegmenterConfig,
    pub boundary_layer: BoundaryLayerConfig,
    pub scheduler: SchedulerConfig,
}

fn require(condition: bool, message: &str) -> StageResult<()> {
    if condition {
        Ok(())
    } else {
        Err(StageError::InvalidConfig(message.to_string()))
    }
}

impl PipelineConfig {
    /// Rejects configurations that would make a stage meaningless.
    pub fn validate(&self) -> StageResult<()> {
        let b = &self.basin;
        require(b.lat_min < b.lat_max, "basin.lat_min must be below basin.lat_max")?;
        require(b.lon_min < b.lon_max, "basin.lon_min must be below basin.lon_max")?;
        require(b.cell_size_deg > 0.0, "basin.cell_size_deg must be positive")?;
        require(b.margin_deg >= 0.0, "basin.margin_deg must not be negative")?;
        require(self.window.window_s > 0.0, "window.window_s must be positive")?;
        require(self.window.band_m > 0.0, "window.band_m must be positive")?;
        require(self.window.min_count >= 1, "window.min_count must be at least 1")?;
        if let Estimator::Huber { k } = self.window.estimator {
            require(k > 0.0, "window.estimator.k must be positive")?;
        }
        require(
            self.wind.consensus_confidence_cap < 0.5,
            "wind.consensus_confidence_cap must stay below the direct-estimate floor of 0.5",
        )?;
        require(self.wind.consensus_min_aircraft >= 2, "wind.consensus_min_aircraft must be at least 2")?;
        require(self.lapse.min_bins >= 2, "lapse.min_bins must be at least 2")?;
        require(self.turbulence.window_s > 0.0, "turbulence.window_s must be positive")?;
        require(self.turbulence.min_samples >= 2, "turbulence.min_samples must be at least 2")?;
        require(self.cold_pool.sustain_windows >= 1, "cold_pool.sustain_windows must be at least 1")?;
        require(
            self.segmenter.min_segment_windows >= 1,
            "segmenter.min_segment_windows must be at least 1",
        )?;
        require(self.segmenter.max_states >= 1, "segmenter.max_states must be at least 1")?;
        require(
            self.boundary_layer.stable_kperkm < self.boundary_layer.adiabatic_kperkm,
            "boundary_layer.stable_kperkm must be below boundary_layer.adiabatic_kperkm",
        )?;
        require(self.scheduler.aircraft_shards >= 1, "scheduler.aircraft_shards must be at least 1")?;
        require(self.scheduler.shard_queue >= 1, "scheduler.shard_queue must be at least 1")?;
        require(self.scheduler.cell_queue >= 1, "scheduler.cell_queue must be at least 1")?;
        require(
            self.scheduler.max_pending_windows >= 1,
            "scheduler.max_pending_windows must be at least 1",
        )?;
        Ok(())
    }
}

/// Geographic frame of the study basin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BasinConfig {
    pub name: String,
    pub receiver_lat: f64,
    pub receiver_lon: f64,
    pub lat_min: f64,
    pub lat_max: f64,
    pub lon_min: f64,
    pub lon_max: f64,
    pub margin_deg: f64,
    /// Basin floor elevation above mean sea level, used as the AGL reference.
    pub floor_elevation_m: f64,
    pub cell_size_deg: f64,
    /// Azimuth of the basin's long axis; the along-basin wind component is
    /// projected on it.
    pub axis_azimuth_deg: f64,
}

impl Default for BasinConfig {
    fn default() -> Self {
        Self {
            name: "uinta".into(),
            receiver_lat: 40.460_144,
            receiver_lon: -109.565_786,
            lat_min: 39.8,
            lat_max: 40.9,
            lon_min: -110.9,
            lon_max: -108.9,
            margin_deg: 0.5,
            floor_elevation_m: 1_550.0,
            cell_size_deg: 0.5,
            axis_azimuth_deg: 90.0,
        }
    }
}

impl BasinConfig {
    pub fn contains_with_margin(&self, lat: f64, lon: f64) -> bool {
        lat >= self.lat_min - self.margin_deg
            && lat <= self.lat_max + self.margin_deg
            && lon >= self.lon_min - self.margin_deg
            && lon <= self.lon_max + self.margin_deg
    }

    pub fn cell_of(&self, lat: f64, lon: f64) -> Option<CellId> {
        if !self.contains_with_margin(lat, lon) || self.cell_size_deg <= 0.0 {
            return None;
        }
        Some(CellId {
            row: ((lat - self.lat_min) / self.cell_size_deg).floor() as i32,
            col: ((lon - self.lon_min) / self.cell_size_deg).floor() as i32,
        })
    }

    /// Cell containing the receiver; the fallback for bins with no position.
    pub fn home_cell(&self) -> CellId {
        self.cell_of(self.receiver_lat, self.receiver_lon)
            .unwrap_or(CellId { row: 0, col: 0 })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    /// Emit Core columns in aviation units under suffixed names
    /// (`altitude_ft`, `ground_speed_kt`) instead of SI.
    pub retain_aviation_units: bool,
    /// Round Core aviation-unit values to their reporting resolution.
    pub quantize_core: bool,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            retain_aviation_units: true,
            quantize_core: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub check_crc: bool,
    pub check_pairing: bool,
    pub check_range: bool,
    /// Even and odd CPR frames must arrive within this many seconds.
    pub max_pair_gap_s: f64,
    /// Per-aircraft gate state is pruned after this much silence.
    pub state_timeout_s: f64,
    pub dedup_window_s: f64,
    pub min_altitude_m: f64,
    pub max_altitude_m: f64,
    pub max_ground_speed_ms: f64,
    pub max_airspeed_ms: f64,
    pub max_vertical_rate_ms: f64,
    pub max_roll_deg: f64,
    pub min_temperature_k: f64,
    pub max_temperature_k: f64,
    pub min_pressure_pa: f64,
    pub max_pressure_pa: f64,
    pub max_wind_speed_ms: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            check_crc: true,
            check_pairing: true,
            check_range: true,
            max_pair_gap_s: 10.0,
            state_timeout_s: 60.0,
            dedup_window_s: 1.0,
            min_altitude_m: -300.0,
            max_altitude_m: 15_500.0,
            max_ground_speed_ms: 350.0,
            max_airspeed_ms: 350.0,
            max_vertical_rate_ms: 40.0,
            max_roll_deg: 60.0,
            min_temperature_k: 183.0,
            max_temperature_k: 333.0,
            min_pressure_pa: 10_000.0,
            max_pressure_pa: 110_000.0,
            max_wind_speed_ms: 120.0,
        }
    }
}

/// Robust central-tendency estimator applied within each bin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Estimator {
    Median,
    Huber { k: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub window_s: f64,
    pub band_m: f64,
    pub min_count: usize,
    pub estimator: Estimator,
    pub inactivity_timeout_s: f64,
    /// Sealed bins stay revisable by late messages for this long.
    pub revision_horizon_s: f64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            window_s: 60.0,
            band_m: 150.0,
            min_count: 3,
            estimator: Estimator::Median,
            inactivity_timeout_s: 300.0,
            revision_horizon_s: 900.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindConfig {
    pub consensus_min_aircraft: usize,
    /// Upper bound on consensus confidence; direct estimates never fall below 0.5.
    pub consensus_confidence_cap: f64,
    pub direct_uncertainty_scale_ms: f64,
}

impl Default for WindConfig {
    fn default() -> Self {
        Self {
            consensus_min_aircraft: 2,
            consensus_confidence_cap: 0.4,
            direct_uncertainty_scale_ms: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThermoConfig {
    pub reference_pressure_pa: f64,
    /// Fall back to ISA static pressure at the pressure altitude.
    pub derive_pressure_from_altitude: bool,
}

impl Default for ThermoConfig {
    fn default() -> Self {
        Self {
            reference_pressure_pa: 100_000.0,
            derive_pressure_from_altitude: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LapseConfig {
    pub min_bins: usize,
    pub min_span_m: f64,
    pub inversion_threshold_kperkm: f64,
    pub max_residual_k: f64,
}

impl Default for LapseConfig {
    fn default() -> Self {
        Self {
            min_bins: 3,
            min_span_m: 300.0,
            inversion_threshold_kperkm: 0.5,
            max_residual_k: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TurbulenceConfig {
    pub window_s: f64,
    pub min_samples: usize,
    pub vertical_rate_var_threshold: f64,
    pub roll_var_threshold: f64,
    pub track_jitter_var_threshold: f64,
}

impl Default for TurbulenceConfig {
    fn default() -> Self {
        Self {
            window_s: 30.0,
            min_samples: 5,
            vertical_rate_var_threshold: 1.0,
            roll_var_threshold: 25.0,
            track_jitter_var_threshold: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AltitudeConfig {
    pub tolerance_ft: f64,
    pub apply_pressure_setting: bool,
}

impl Default for AltitudeConfig {
    fn default() -> Self {
        Self {
            tolerance_ft: 500.0,
            apply_pressure_setting: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColdPoolConfig {
    /// Bins below floor + this depth count as the low layer.
    pub low_layer_depth_m: f64,
    pub sustain_windows: usize,
    /// Cooling rates within this dead band (K/h) count as neither sign.
    pub rate_deadband_kph: f64,
    pub breakup_depth_m: f64,
    pub min_reversal_ms: f64,
}

impl Default for ColdPoolConfig {
    fn default() -> Self {
        Self {
            low_layer_depth_m: 600.0,
            sustain_windows: 3,
            rate_deadband_kph: 0.05,
            breakup_depth_m: 50.0,
            min_reversal_ms: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    /// Multiplier on the `d * ln(n)` change-point penalty.
    pub penalty: f64,
    pub min_segment_windows: usize,
    pub max_states: usize,
    pub kmeans_iterations: usize,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            penalty: 2.0,
            min_segment_windows: 3,
            max_states: 4,
            kmeans_iterations: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoundaryLayerConfig {
    pub min_flights: usize,
    pub min_span_m: f64,
    /// Vertical-rate variance (m²/s²) below which air counts as non-turbulent.
    pub turbulence_threshold: f64,
    pub adiabatic_kperkm: f64,
    pub stable_kperkm: f64,
}

impl Default for BoundaryLayerConfig {
    fn default() -> Self {
        Self {
            min_flights: 2,
            min_span_m: 500.0,
            turbulence_threshold: 0.5,
            adiabatic_kperkm: 8.0,
            stable_kperkm: 4.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub aircraft_shards: usize,
    pub shard_queue: usize,
    pub cell_queue: usize,
    /// Bins for a window may arrive this long after the cell watermark passes it.
    pub lateness_s: f64,
    pub max_pending_windows: usize,
    /// Stream-time interval between seal/prune ticks broadcast to shards.
    pub tick_interval_s: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            aircraft_shards: 4,
            shard_queue: 1024,
            cell_queue: 256,
            lateness_s: 120.0,
            max_pending_windows: 32,
            tick_interval_s: 10.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        PipelineConfig::default().validate().unwrap();
    }

    #[test]
    fn consensus_cap_must_stay_below_direct_floor() {
        let mut config = PipelineConfig::default();
        config.wind.consensus_confidence_cap = 0.6;
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), "invalid_config");
    }

    #[test]
    fn receiver_sits_in_home_cell() {
        let basin = BasinConfig::default();
        let cell = basin.home_cell();
        assert_eq!(basin.cell_of(basin.receiver_lat, basin.receiver_lon), Some(cell));
        assert!(basin.cell_of(10.0, 10.0).is_none());
    }

    #[test]
    fn partial_yaml_style_json_fills_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"window":{"window_s":30.0},"lapse":{"min_bins":5}}"#).unwrap();
        assert_eq!(config.window.window_s, 30.0);
        assert_eq!(config.window.min_count, 3);
        assert_eq!(config.lapse.min_bins, 5);
    }
}
