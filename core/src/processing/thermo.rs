use crate::config::ThermoConfig;
use crate::interface::{BinKey, CellId, Field, SealedBin};
use crate::prelude::{Feature, OmitReason, StageError, StageResult};
use serde::{Deserialize, Serialize};

/// Specific gas constant of dry air, J/(kg·K).
pub const R_DRY: f64 = 287.05;
/// Specific heat of dry air at constant pressure, J/(kg·K).
pub const CP_DRY: f64 = 1004.6;
/// Ratio of the gas constants of dry air and water vapour.
pub const EPSILON: f64 = 0.622;

/// ISA static pressure at a pressure altitude in the troposphere.
pub fn isa_pressure_pa(altitude_m: f64) -> f64 {
    101_325.0 * (1.0 - 2.255_77e-5 * altitude_m).powf(5.255_88)
}

/// θ = T (p0 / p)^(R/cp).
pub fn potential_temperature_k(temperature_k: f64, pressure_pa: f64, reference_pa: f64) -> f64 {
    temperature_k * (reference_pa / pressure_pa).powf(R_DRY / CP_DRY)
}

/// Saturation vapour pressure over water (Bolton 1980).
pub fn saturation_vapour_pressure_pa(temperature_k: f64) -> f64 {
    let celsius = temperature_k - 273.15;
    611.2 * (17.67 * celsius / (celsius + 243.5)).exp()
}

/// Water-vapour mixing ratio (kg/kg) from relative humidity.
pub fn mixing_ratio(temperature_k: f64, pressure_pa: f64, humidity_pct: f64) -> f64 {
    let e = (humidity_pct / 100.0) * saturation_vapour_pressure_pa(temperature_k);
    EPSILON * e / (pressure_pa - e).max(1.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureSource {
    /// Comm-B 4,5 static pressure.
    Measured,
    /// ISA pressure at the Mode-S pressure altitude.
    PressureAltitude,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThermoState {
    pub key: BinKey,
    pub version: u32,
    pub cell: CellId,
    pub window_start: f64,
    pub altitude_m: f64,
    pub temperature_k: f64,
    pub temperature_uncertainty_k: f64,
    pub pressure_pa: f64,
    pub pressure_source: PressureSource,
    pub density_kgm3: f64,
    pub theta_k: f64,
    pub theta_v_k: Feature<f64>,
    pub mixing_ratio: Feature<f64>,
    pub humidity_missing: bool,
}

/// Density, θ and θv from a bin's temperature, pressure and humidity.
pub struct ThermoDeriver {
    config: ThermoConfig,
}

impl ThermoDeriver {
    pub fn new(config: ThermoConfig) -> Self {
        Self { config }
    }

    fn pressure(&self, bin: &SealedBin) -> StageResult<(f64, PressureSource)> {
        if let Some(p) = bin.value(Field::Pressure) {
            return Ok((p, PressureSource::Measured));
        }
        match bin.value(Field::Altitude) {
            Some(alt) if self.config.derive_pressure_from_altitude => {
                Ok((isa_pressure_pa(alt), PressureSource::PressureAltitude))
            }
            _ => Err(StageError::InsufficientData(format!(
                "{} has no usable pressure",
                bin.key
            ))),
        }
    }

    pub fn derive(&self, bin: &SealedBin) -> StageResult<ThermoState> {
        let temperature = bin.summary(Field::Temperature).ok_or_else(|| {
            StageError::InsufficientData(format!("{} has no usable temperature", bin.key))
        })?;
        let t = temperature.center;
        let (p, pressure_source) = self.pressure(bin)?;
        if p <= 0.0 || t <= 0.0 {
            return Err(StageError::InsufficientData(format!(
                "{} has non-physical state T={} p={}",
                bin.key, t, p
            )));
        }

        let theta = potential_temperature_k(t, p, self.config.reference_pressure_pa);
        let (density, theta_v, mixing, humidity_missing) = match bin.value(Field::Humidity) {
            Some(rh) => {
                let w = mixing_ratio(t, p, rh);
                let tv = t * (1.0 + w / EPSILON) / (1.0 + w);
                (
                    p / (R_DRY * tv),
                    Feature::present(theta * (1.0 + w / EPSILON) / (1.0 + w)),
                    Feature::present(w),
                    false,
                )
            }
            None => (
                p / (R_DRY * t),
                Feature::omitted(OmitReason::HumidityMissing),
                Feature::omitted(OmitReason::HumidityMissing),
                true,
            ),
        };

        Ok(ThermoState {
            key: bin.key,
            version: bin.version,
            cell: bin.cell,
            window_start: bin.window_start,
            altitude_m: bin.altitude_m(),
            temperature_k: t,
            temperature_uncertainty_k: temperature.dispersion / (temperature.count as f64).sqrt(),
            pressure_pa: p,
            pressure_source,
            density_kgm3: density,
            theta_k: theta,
            theta_v_k: theta_v,
            mixing_ratio: mixing,
            humidity_missing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::{BinScope, Icao};

    fn key() -> BinKey {
        BinKey {
            scope: BinScope::Aircraft(Icao::new(0xB00001).unwrap()),
            window: 5,
            band: 20,
        }
    }

    #[test]
    fn theta_equals_temperature_at_reference_pressure() {
        assert!((potential_temperature_k(290.0, 100_000.0, 100_000.0) - 290.0).abs() < 1e-12);
        let theta = potential_temperature_k(263.15, 70_000.0, 100_000.0);
        assert!((theta - 291.38).abs() < 0.01);
    }

    #[test]
    fn isa_pressure_matches_standard_atmosphere() {
        assert!((isa_pressure_pa(0.0) - 101_325.0).abs() < 1e-6);
        assert!((isa_pressure_pa(3048.0) - 69_682.0).abs() < 50.0);
    }

    #[test]
    fn humidity_missing_is_flagged_not_imputed() {
        let deriver = ThermoDeriver::new(ThermoConfig::default());
        let bin = SealedBin::fixture(
            key(),
            &[(Field::Temperature, 270.0), (Field::Pressure, 80_000.0)],
        );
        let state = deriver.derive(&bin).unwrap();
        assert!(state.humidity_missing);
        assert_eq!(state.theta_v_k.reason(), Some(OmitReason::HumidityMissing));
        assert!((state.density_kgm3 - 80_000.0 / (R_DRY * 270.0)).abs() < 1e-12);
        assert_eq!(state.pressure_source, PressureSource::Measured);
    }

    #[test]
    fn humidity_raises_virtual_theta_and_lowers_density() {
        let deriver = ThermoDeriver::new(ThermoConfig::default());
        let dry = SealedBin::fixture(key(), &[(Field::Temperature, 290.0), (Field::Pressure, 85_000.0)]);
        let moist = SealedBin::fixture(
            key(),
            &[
                (Field::Temperature, 290.0),
                (Field::Pressure, 85_000.0),
                (Field::Humidity, 60.0),
            ],
        );
        let dry = deriver.derive(&dry).unwrap();
        let moist = deriver.derive(&moist).unwrap();
        assert!(!moist.humidity_missing);
        assert!(*moist.theta_v_k.get().unwrap() > moist.theta_k);
        assert!(moist.density_kgm3 < dry.density_kgm3);
    }

    #[test]
    fn pressure_falls_back_to_pressure_altitude() {
        let deriver = ThermoDeriver::new(ThermoConfig::default());
        let bin = SealedBin::fixture(key(), &[(Field::Temperature, 270.0), (Field::Altitude, 3048.0)]);
        let state = deriver.derive(&bin).unwrap();
        assert_eq!(state.pressure_source, PressureSource::PressureAltitude);

        let strict = ThermoDeriver::new(ThermoConfig {
            derive_pressure_from_altitude: false,
            ..ThermoConfig::default()
        });
        assert_eq!(strict.derive(&bin).unwrap_err().kind(), "insufficient_data");
    }

    #[test]
    fn missing_temperature_is_insufficient() {
        let deriver = ThermoDeriver::new(ThermoConfig::default());
        let bin = SealedBin::fixture(key(), &[(Field::Pressure, 80_000.0)]);
        assert_eq!(deriver.derive(&bin).unwrap_err().kind(), "insufficient_data");
    }
}
