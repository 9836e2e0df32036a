use crate::config::AltitudeConfig;
use crate::interface::{BinKey, Field, SealedBin};
use crate::prelude::{StageError, StageResult};
use serde::{Deserialize, Serialize};

const FEET_PER_METRE: f64 = 1.0 / 0.3048;
const STANDARD_SETTING_PA: f64 = 101_325.0;
/// Indicated-altitude change per hPa of altimeter setting near the surface.
const METRES_PER_HPA: f64 = 27.0 * 0.3048;

/// Pressure altitude corrected to an altimeter setting.
pub fn corrected_baro_m(pressure_altitude_m: f64, setting_pa: f64) -> f64 {
    pressure_altitude_m + (setting_pa - STANDARD_SETTING_PA) / 100.0 * METRES_PER_HPA
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AltitudeResidual {
    pub key: BinKey,
    pub version: u32,
    /// Geometric minus corrected barometric altitude.
    pub residual_ft: f64,
    pub outlier: bool,
    pub corrected_baro_m: f64,
    pub setting_applied: bool,
}

pub struct AltitudeQa {
    config: AltitudeConfig,
}

impl AltitudeQa {
    pub fn new(config: AltitudeConfig) -> Self {
        Self { config }
    }

    pub fn check(&self, bin: &SealedBin) -> StageResult<AltitudeResidual> {
        let (baro, geometric) = match (bin.value(Field::Altitude), bin.value(Field::GeometricAltitude)) {
            (Some(baro), Some(geometric)) => (baro, geometric),
            _ => {
                return Err(StageError::InsufficientData(format!(
                    "{} lacks barometric or geometric altitude",
                    bin.key
                )))
            }
        };
        let setting = bin
            .value(Field::BaroSetting)
            .filter(|_| self.config.apply_pressure_setting);
        let corrected = match setting {
            Some(setting) => corrected_baro_m(baro, setting),
            None => baro,
        };
        let residual_ft = (geometric - corrected) * FEET_PER_METRE;
        Ok(AltitudeResidual {
            key: bin.key,
            version: bin.version,
            residual_ft,
            outlier: residual_ft.abs() > self.config.tolerance_ft,
            corrected_baro_m: corrected,
            setting_applied: setting.is_some(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::{BinScope, Icao};

    fn key() -> BinKey {
        BinKey {
            scope: BinScope::Aircraft(Icao::new(0xC00001).unwrap()),
            window: 1,
            band: 10,
        }
    }

    #[test]
    fn residual_within_tolerance_is_not_outlier() {
        let qa = AltitudeQa::new(AltitudeConfig::default());
        let bin = SealedBin::fixture(
            key(),
            &[(Field::Altitude, 3000.0), (Field::GeometricAltitude, 3030.48)],
        );
        let r = qa.check(&bin).unwrap();
        assert!((r.residual_ft - 100.0).abs() < 1e-6);
        assert!(!r.outlier);
        assert!(!r.setting_applied);
    }

    #[test]
    fn large_residual_is_outlier() {
        let qa = AltitudeQa::new(AltitudeConfig::default());
        let bin = SealedBin::fixture(
            key(),
            &[(Field::Altitude, 3000.0), (Field::GeometricAltitude, 2800.0)],
        );
        let r = qa.check(&bin).unwrap();
        assert!(r.residual_ft < -500.0);
        assert!(r.outlier);
    }

    #[test]
    fn pressure_setting_shifts_barometric_reference() {
        let qa = AltitudeQa::new(AltitudeConfig::default());
        let bin = SealedBin::fixture(
            key(),
            &[
                (Field::Altitude, 3000.0),
                (Field::GeometricAltitude, 3000.0 + 10.0 * METRES_PER_HPA),
                (Field::BaroSetting, 102_325.0),
            ],
        );
        let r = qa.check(&bin).unwrap();
        assert!(r.setting_applied);
        assert!(r.residual_ft.abs() < 1e-6);
    }

    #[test]
    fn missing_geometric_altitude_is_insufficient() {
        let qa = AltitudeQa::new(AltitudeConfig::default());
        let bin = SealedBin::fixture(key(), &[(Field::Altitude, 3000.0)]);
        assert_eq!(qa.check(&bin).unwrap_err().kind(), "insufficient_data");
    }
}
