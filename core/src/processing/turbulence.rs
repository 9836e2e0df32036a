use crate::config::TurbulenceConfig;
use crate::interface::{Field, Icao, MsgHash};
use crate::math::stats::StatsHelper;
use crate::math::vector::angle_diff_deg;
use crate::prelude::{Feature, OmitReason};
use crate::processing::quality::QualifiedMessage;
use crate::telemetry::LogManager;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// Comparison of kinematic exceedance with Comm-B 4,5 turbulence/shear levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShearAgreement {
    Agree,
    Disagree,
    Unavailable,
}

impl ShearAgreement {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShearAgreement::Agree => "agree",
            ShearAgreement::Disagree => "disagree",
            ShearAgreement::Unavailable => "unavailable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurbulenceProxy {
    pub icao: Icao,
    pub timestamp: f64,
    pub msg_hash: MsgHash,
    /// Vertical-rate variance, m²/s².
    pub vertical_rate_var: Feature<f64>,
    /// Roll variance, deg².
    pub roll_var: Feature<f64>,
    /// Track-rate variance, deg²/s².
    pub track_jitter_var: Feature<f64>,
    pub exceedances: Vec<String>,
    pub turbulent: Feature<bool>,
    pub reported_level: Option<u8>,
    pub shear_agreement: ShearAgreement,
}

#[derive(Debug, Clone, Copy, Default)]
struct Sample {
    timestamp: f64,
    vertical_rate: Option<f64>,
    roll: Option<f64>,
    track_rate: Option<f64>,
}

#[derive(Debug, Default)]
struct AircraftSeries {
    samples: VecDeque<Sample>,
    last_track: Option<(f64, f64)>,
    last_reported: Option<(f64, u8)>,
}

/// Rolling-window kinematic variance per aircraft.
pub struct TurbulenceCalculator {
    config: TurbulenceConfig,
    series: HashMap<Icao, AircraftSeries>,
    logger: LogManager,
}

impl TurbulenceCalculator {
    pub fn new(config: TurbulenceConfig) -> Self {
        Self {
            config,
            series: HashMap::new(),
            logger: LogManager::new("turbulence"),
        }
    }

    pub fn tracked_aircraft(&self) -> usize {
        self.series.len()
    }

    /// Drops aircraft whose newest sample is older than the rolling window.
    pub fn prune(&mut self, now: f64) -> usize {
        let window = self.config.window_s;
        let before = self.series.len();
        self.series.retain(|_, s| {
            s.samples
                .back()
                .map(|last| now - last.timestamp <= window)
                .unwrap_or(false)
                || s.last_reported.map(|(t, _)| now - t <= window).unwrap_or(false)
        });
        before - self.series.len()
    }

    fn variance(&self, values: impl Iterator<Item = f64>) -> Feature<f64> {
        let values: Vec<f64> = values.collect();
        if values.len() < self.config.min_samples {
            return Feature::omitted(OmitReason::InsufficientData);
        }
        match StatsHelper::variance(&values) {
            Some(var) => Feature::present(var),
            None => Feature::omitted(OmitReason::InsufficientData),
        }
    }

    /// Adds a message's kinematics and returns the rolling proxy at its time,
    /// or `None` when the message carried nothing turbulence-related.
    pub fn update(&mut self, msg: &QualifiedMessage) -> Option<TurbulenceProxy> {
        let m = &msg.message;
        let admitted = |value: Option<f64>, field: Field| value.filter(|_| msg.admits(field));
        let vertical_rate = admitted(m.vertical_rate_ms, Field::VerticalRate);
        let roll = admitted(m.roll_deg, Field::VerticalRate);
        let track = admitted(m.track_deg, Field::GroundU);
        let track_rate_reported = admitted(m.track_rate_dps, Field::VerticalRate);
        let reported = [m.turbulence_level, m.wind_shear_level]
            .into_iter()
            .flatten()
            .max();

        let window = self.config.window_s;
        let series = self.series.entry(m.icao).or_default();

        let track_rate = track_rate_reported.or_else(|| {
            let (t0, track0) = series.last_track?;
            let track = track?;
            let dt = m.timestamp - t0;
            (dt > 0.0 && dt <= window).then(|| angle_diff_deg(track0, track) / dt)
        });
        if let Some(track) = track {
            series.last_track = Some((m.timestamp, track));
        }
        if let Some(level) = reported {
            series.last_reported = Some((m.timestamp, level));
        }
        if vertical_rate.is_none() && roll.is_none() && track_rate.is_none() && reported.is_none() {
            return None;
        }

        series.samples.push_back(Sample {
            timestamp: m.timestamp,
            vertical_rate,
            roll,
            track_rate,
        });
        while series
            .samples
            .front()
            .map(|s| m.timestamp - s.timestamp > window)
            .unwrap_or(false)
        {
            series.samples.pop_front();
        }
        let samples: Vec<Sample> = series.samples.iter().copied().collect();
        let reported_level = series
            .last_reported
            .filter(|(t, _)| m.timestamp - t <= window)
            .map(|(_, level)| level);

        let vertical_rate_var = self.variance(samples.iter().filter_map(|s| s.vertical_rate));
        let roll_var = self.variance(samples.iter().filter_map(|s| s.roll));
        let track_jitter_var = self.variance(samples.iter().filter_map(|s| s.track_rate));

        let mut exceedances = Vec::new();
        let mut evaluated = false;
        for (name, feature, threshold) in [
            ("vertical_rate", &vertical_rate_var, self.config.vertical_rate_var_threshold),
            ("roll", &roll_var, self.config.roll_var_threshold),
            ("track_jitter", &track_jitter_var, self.config.track_jitter_var_threshold),
        ] {
            if let Some(var) = feature.get() {
                evaluated = true;
                if *var > threshold {
                    exceedances.push(name.to_string());
                }
            }
        }
        let turbulent = if evaluated {
            Feature::present(!exceedances.is_empty())
        } else {
            Feature::omitted(OmitReason::InsufficientData)
        };
        let shear_agreement = match (turbulent.get(), reported_level) {
            (Some(&kinematic), Some(level)) if kinematic == (level >= 1) => ShearAgreement::Agree,
            (Some(_), Some(_)) => ShearAgreement::Disagree,
            _ => ShearAgreement::Unavailable,
        };
        if shear_agreement == ShearAgreement::Disagree {
            self.logger.detail(&format!(
                "{} at {:.1}: kinematic exceedance {:?} disagrees with reported level {:?}",
                m.icao, m.timestamp, exceedances, reported_level
            ));
        }

        Some(TurbulenceProxy {
            icao: m.icao,
            timestamp: m.timestamp,
            msg_hash: m.msg_hash.clone(),
            vertical_rate_var,
            roll_var,
            track_jitter_var,
            exceedances,
            turbulent,
            reported_level,
            shear_agreement,
        })
    }
}
