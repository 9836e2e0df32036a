use crate::config::WindConfig;
use crate::interface::{BinKey, BinScope, CellId, Field, Icao, SealedBin};
use crate::math::stats::StatsHelper;
use crate::math::vector::Vec2;
use crate::prelude::{StageError, StageResult};
use crate::telemetry::LogManager;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindMethod {
    /// Ground vector minus air vector of one aircraft.
    Direct,
    /// Robust mean of several aircraft's ground vectors; lower confidence.
    Consensus,
}

impl WindMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindMethod::Direct => "direct",
            WindMethod::Consensus => "consensus",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindEstimate {
    /// Aircraft bin for direct estimates, cell bin for consensus estimates.
    pub key: BinKey,
    pub version: u32,
    pub cell: CellId,
    pub window_start: f64,
    pub altitude_m: f64,
    pub u_ms: f64,
    pub v_ms: f64,
    pub speed_ms: f64,
    pub direction_to_deg: f64,
    pub direction_from_deg: f64,
    pub method: WindMethod,
    pub confidence: f64,
    pub uncertainty_ms: f64,
    pub sample_count: usize,
    /// Magnitude of derived minus Comm-B 4,4 reported wind, when reported.
    pub reported_delta_ms: Option<f64>,
}

impl WindEstimate {
    pub fn vector(&self) -> Vec2 {
        Vec2::new(self.u_ms, self.v_ms)
    }
}

/// Derives wind per sealed bin.
pub struct WindEstimator {
    config: WindConfig,
    logger: LogManager,
}

impl WindEstimator {
    pub fn new(config: WindConfig) -> Self {
        Self {
            config,
            logger: LogManager::new("wind"),
        }
    }

    fn ground_vector(bin: &SealedBin) -> Option<Vec2> {
        Some(Vec2::new(
            bin.value(Field::GroundU)?,
            bin.value(Field::GroundV)?,
        ))
    }

    fn dispersion(bin: &SealedBin, field: Field) -> f64 {
        bin.summary(field).map(|s| s.dispersion).unwrap_or(0.0)
    }

    fn reported_delta(bin: &SealedBin, wind: &Vec2) -> Option<f64> {
        let reported = Vec2::new(
            bin.value(Field::ReportedWindU)?,
            bin.value(Field::ReportedWindV)?,
        );
        Some(wind.sub(&reported).norm())
    }

    /// `wind = ground - air` for a bin carrying ground velocity, TAS and heading.
    pub fn direct(&self, bin: &SealedBin) -> StageResult<WindEstimate> {
        let missing = |what: &str| {
            StageError::InsufficientData(format!("{} has no usable {}", bin.key, what))
        };
        let ground = Self::ground_vector(bin).ok_or_else(|| missing("ground velocity"))?;
        let tas = bin.value(Field::TrueAirspeed).ok_or_else(|| missing("true airspeed"))?;
        let heading = bin.heading_deg().ok_or_else(|| missing("heading"))?;
        let air = Vec2::from_polar(tas, heading);
        let wind = ground.sub(&air);

        let count = [Field::GroundU, Field::TrueAirspeed, Field::HeadingX]
            .iter()
            .filter_map(|f| bin.counts.get(f))
            .copied()
            .min()
            .unwrap_or(0)
            .max(1);
        let heading_spread = tas
            * Self::dispersion(bin, Field::HeadingX).hypot(Self::dispersion(bin, Field::HeadingY));
        let spread = Self::dispersion(bin, Field::GroundU)
            .hypot(Self::dispersion(bin, Field::GroundV))
            .hypot(Self::dispersion(bin, Field::TrueAirspeed))
            .hypot(heading_spread);
        let uncertainty = spread / (count as f64).sqrt();
        let ratio = uncertainty / self.config.direct_uncertainty_scale_ms;
        let confidence = 0.5 + 0.5 / (1.0 + ratio * ratio);

        Ok(WindEstimate {
            key: bin.key,
            version: bin.version,
            cell: bin.cell,
            window_start: bin.window_start,
            altitude_m: bin.altitude_m(),
            u_ms: wind.u,
            v_ms: wind.v,
            speed_ms: wind.norm(),
            direction_to_deg: wind.azimuth_deg(),
            direction_from_deg: wind.from_direction_deg(),
            method: WindMethod::Direct,
            confidence,
            uncertainty_ms: uncertainty,
            sample_count: count,
            reported_delta_ms: Self::reported_delta(bin, &wind),
        })
    }

    /// Robust mean of the ground vectors of distinct aircraft sharing a cell,
    /// window and band. Air vectors of aircraft on diverse tracks cancel, so
    /// confidence scales with track diversity and never exceeds the cap.
    pub fn consensus(&self, peers: &[&SealedBin]) -> StageResult<WindEstimate> {
        // By aircraft, latest version first; arrival order must not matter.
        let mut peers = peers.to_vec();
        peers.sort_by_key(|bin| (bin.key.icao(), Reverse(bin.version)));
        let first = peers.first().ok_or_else(|| {
            StageError::InsufficientData("consensus wind needs at least one bin".into())
        })?;
        let mut seen: Vec<Icao> = Vec::new();
        let mut grounds = Vec::new();
        for bin in &peers {
            let Some(ground) = Self::ground_vector(bin) else { continue };
            let Some(icao) = bin.key.icao() else { continue };
            if !seen.contains(&icao) {
                seen.push(icao);
                grounds.push(ground);
            }
        }
        if grounds.len() < self.config.consensus_min_aircraft {
            return Err(StageError::InsufficientData(format!(
                "consensus for cell {} window {} band {} has {} of {} aircraft",
                first.cell,
                first.key.window,
                first.key.band,
                grounds.len(),
                self.config.consensus_min_aircraft
            )));
        }

        let us: Vec<f64> = grounds.iter().map(|g| g.u).collect();
        let vs: Vec<f64> = grounds.iter().map(|g| g.v).collect();
        let (u, v) = match (StatsHelper::median(&us), StatsHelper::median(&vs)) {
            (Some(u), Some(v)) => (u, v),
            _ => return Err(StageError::Internal("median of non-empty set".into())),
        };
        let wind = Vec2::new(u, v);

        let (mut sx, mut sy) = (0.0, 0.0);
        for g in &grounds {
            let n = g.norm();
            if n > 1e-6 {
                sx += g.u / n;
                sy += g.v / n;
            }
        }
        let resultant = sx.hypot(sy) / grounds.len() as f64;
        let diversity = (1.0 - resultant).clamp(0.0, 1.0);
        let confidence = self.config.consensus_confidence_cap * diversity;
        let uncertainty = StatsHelper::mad_sigma(&us)
            .unwrap_or(0.0)
            .hypot(StatsHelper::mad_sigma(&vs).unwrap_or(0.0))
            / (grounds.len() as f64).sqrt();

        self.logger.detail(&format!(
            "consensus for cell {} window {} from {} aircraft, diversity {:.2}",
            first.cell,
            first.key.window,
            grounds.len(),
            diversity
        ));

        let reported = peers
            .iter()
            .find_map(|bin| Self::reported_delta(bin, &wind));
        let version = peers.iter().map(|b| b.version).max().unwrap_or(1);
        Ok(WindEstimate {
            key: BinKey {
                scope: BinScope::Cell(first.cell),
                window: first.key.window,
                band: first.key.band,
            },
            version,
            cell: first.cell,
            window_start: first.window_start,
            altitude_m: first.altitude_m(),
            u_ms: wind.u,
            v_ms: wind.v,
            speed_ms: wind.norm(),
            direction_to_deg: wind.azimuth_deg(),
            direction_from_deg: wind.from_direction_deg(),
            method: WindMethod::Consensus,
            confidence,
            uncertainty_ms: uncertainty,
            sample_count: grounds.len(),
            reported_delta_ms: reported,
        })
    }

    /// Direct estimate when the bin has air data, consensus over `peers`
    /// otherwise. `peers` includes the bin itself.
    pub fn estimate(&self, bin: &SealedBin, peers: &[&SealedBin]) -> StageResult<WindEstimate> {
        match self.direct(bin) {
            Ok(estimate) => Ok(estimate),
            Err(StageError::InsufficientData(reason)) => {
                self.logger
                    .detail(&format!("{}; trying consensus", reason));
                self.consensus(peers)
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KT: f64 = 0.514_444;

    fn key(icao: u32) -> BinKey {
        BinKey {
            scope: BinScope::Aircraft(Icao::new(icao).unwrap()),
            window: 10,
            band: 12,
        }
    }

    fn flying(icao: u32, gs_kt: f64, track: f64, tas_kt: Option<f64>, heading: f64) -> SealedBin {
        let ground = Vec2::from_polar(gs_kt * KT, track);
        let head = Vec2::from_polar(1.0, heading);
        let mut fields = vec![(Field::GroundU, ground.u), (Field::GroundV, ground.v)];
        if let Some(tas) = tas_kt {
            fields.extend([
                (Field::TrueAirspeed, tas * KT),
                (Field::HeadingX, head.u),
                (Field::HeadingY, head.v),
            ]);
        }
        SealedBin::fixture(key(icao), &fields)
    }

    #[test]
    fn direct_wind_is_ground_minus_air() {
        let estimator = WindEstimator::new(WindConfig::default());
        let bin = flying(0xA00001, 120.0, 90.0, Some(100.0), 85.0);
        let wind = estimator.direct(&bin).unwrap();

        let ground = Vec2::from_polar(120.0 * KT, 90.0);
        let air = Vec2::from_polar(100.0 * KT, 85.0);
        assert!((wind.u_ms - (ground.u - air.u)).abs() < 0.01);
        assert!((wind.v_ms - (ground.v - air.v)).abs() < 0.01);

        assert!((wind.u_ms - 10.48).abs() < 0.01);
        assert!((wind.v_ms + 4.48).abs() < 0.01);
        assert!((wind.speed_ms / KT - 22.17).abs() < 0.01);
        assert!((wind.direction_to_deg - 113.2).abs() < 0.1);
        assert!((wind.direction_from_deg - 293.2).abs() < 0.1);
        assert_eq!(wind.method, WindMethod::Direct);
        assert!(wind.confidence > 0.5 && wind.confidence <= 1.0);
    }

    #[test]
    fn missing_air_data_falls_back_to_consensus() {
        let estimator = WindEstimator::new(WindConfig::default());
        let a = flying(0xA00001, 110.0, 0.0, None, 0.0);
        let b = flying(0xA00002, 90.0, 180.0, None, 0.0);
        let wind = estimator.estimate(&a, &[&a, &b]).unwrap();
        assert_eq!(wind.method, WindMethod::Consensus);
        assert!(wind.confidence <= WindConfig::default().consensus_confidence_cap);
        assert!(wind.confidence > 0.0);
        assert!((wind.v_ms - 10.0 * KT).abs() < 1e-6);
        assert!(matches!(wind.key.scope, BinScope::Cell(_)));
    }

    #[test]
    fn parallel_tracks_give_no_consensus_confidence() {
        let estimator = WindEstimator::new(WindConfig::default());
        let a = flying(0xA00001, 110.0, 45.0, None, 0.0);
        let b = flying(0xA00002, 120.0, 45.0, None, 0.0);
        let wind = estimator.consensus(&[&a, &b]).unwrap();
        assert!(wind.confidence < 1e-9);
    }

    #[test]
    fn consensus_does_not_depend_on_peer_order() {
        let estimator = WindEstimator::new(WindConfig::default());
        let mut a = flying(0xA00001, 110.0, 45.0, None, 0.0);
        let extra = SealedBin::fixture(a.key, &[(Field::Altitude, 1_850.0)]);
        a.summaries.extend(extra.summaries);
        let mut b = flying(0xA00002, 120.0, 300.0, None, 0.0);
        let extra = SealedBin::fixture(
            b.key,
            &[
                (Field::Altitude, 1_900.0),
                (Field::ReportedWindU, 4.0),
                (Field::ReportedWindV, -2.0),
            ],
        );
        b.summaries.extend(extra.summaries);

        let forward = estimator.consensus(&[&a, &b]).unwrap();
        let reverse = estimator.consensus(&[&b, &a]).unwrap();
        assert_eq!(forward, reverse);
        assert_eq!(forward.altitude_m, 1_850.0);
        assert!(forward.reported_delta_ms.is_some());
    }

    #[test]
    fn single_aircraft_without_air_data_is_omitted() {
        let estimator = WindEstimator::new(WindConfig::default());
        let a = flying(0xA00001, 110.0, 0.0, None, 0.0);
        let err = estimator.estimate(&a, &[&a]).unwrap_err();
        assert_eq!(err.kind(), "insufficient_data");
    }

    #[test]
    fn reported_wind_is_cross_checked() {
        let estimator = WindEstimator::new(WindConfig::default());
        let mut bin = flying(0xA00001, 120.0, 90.0, Some(100.0), 85.0);
        let derived = estimator.direct(&bin).unwrap().vector();
        let extra = SealedBin::fixture(
            bin.key,
            &[(Field::ReportedWindU, derived.u + 3.0), (Field::ReportedWindV, derived.v + 4.0)],
        );
        bin.summaries.extend(extra.summaries);
        let wind = estimator.direct(&bin).unwrap();
        assert!((wind.reported_delta_ms.unwrap() - 5.0).abs() < 1e-9);
    }
}
