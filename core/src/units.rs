//! Unit tags, conversions to canonical SI, and the per-field default units of
//! the decoder input contract.

use crate::prelude::{StageError, StageResult};
use serde::{Deserialize, Serialize};
use std::fmt;

const FEET_TO_M: f64 = 0.3048;
const KNOT_TO_MS: f64 = 1852.0 / 3600.0;
const FPM_TO_MS: f64 = FEET_TO_M / 60.0;
const INHG_TO_PA: f64 = 3386.389;
const KELVIN_OFFSET: f64 = 273.15;

/// Physical dimension of a quantity. Conversion only happens within a dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Length,
    Speed,
    Angle,
    AngularRate,
    Temperature,
    Pressure,
    Density,
    Fraction,
    Ratio,
    Time,
    LapseRate,
    SpeedVariance,
    AngleVariance,
    AngularRateVariance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    Metre,
    Foot,
    MetrePerSecond,
    Knot,
    KilometrePerHour,
    FootPerMinute,
    Degree,
    Radian,
    DegreePerSecond,
    Kelvin,
    Celsius,
    Fahrenheit,
    Pascal,
    Hectopascal,
    InchOfMercury,
    KilogramPerCubicMetre,
    Percent,
    Unitless,
    Second,
    KelvinPerKilometre,
    SquareMetrePerSecondSquared,
    SquareDegree,
    SquareDegreePerSecondSquared,
}

impl Unit {
    /// Parses a unit tag as written by decoders and operators.
    pub fn parse(tag: &str) -> StageResult<Unit> {
        let unit = match tag.trim() {
            "m" | "metre" | "meter" => Unit::Metre,
            "ft" | "feet" | "foot" => Unit::Foot,
            "m/s" | "mps" => Unit::MetrePerSecond,
            "kt" | "kts" | "kn" | "knot" => Unit::Knot,
            "km/h" | "kph" => Unit::KilometrePerHour,
            "ft/min" | "fpm" => Unit::FootPerMinute,
            "deg" | "degree" | "°" => Unit::Degree,
            "rad" => Unit::Radian,
            "deg/s" => Unit::DegreePerSecond,
            "K" | "kelvin" => Unit::Kelvin,
            "C" | "degC" | "°C" | "celsius" => Unit::Celsius,
            "F" | "degF" | "°F" => Unit::Fahrenheit,
            "Pa" => Unit::Pascal,
            "hPa" | "mb" | "mbar" => Unit::Hectopascal,
            "inHg" => Unit::InchOfMercury,
            "kg/m3" => Unit::KilogramPerCubicMetre,
            "%" | "pct" | "percent" => Unit::Percent,
            "1" | "unitless" | "mach" => Unit::Unitless,
            "s" => Unit::Second,
            "K/km" => Unit::KelvinPerKilometre,
            "m2/s2" => Unit::SquareMetrePerSecondSquared,
            "deg2" => Unit::SquareDegree,
            "deg2/s2" => Unit::SquareDegreePerSecondSquared,
            other => {
                return Err(StageError::UnitConversion(format!(
                    "unrecognized unit tag '{}'",
                    other
                )))
            }
        };
        Ok(unit)
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Unit::Metre => "m",
            Unit::Foot => "ft",
            Unit::MetrePerSecond => "m/s",
            Unit::Knot => "kt",
            Unit::KilometrePerHour => "km/h",
            Unit::FootPerMinute => "ft/min",
            Unit::Degree => "deg",
            Unit::Radian => "rad",
            Unit::DegreePerSecond => "deg/s",
            Unit::Kelvin => "K",
            Unit::Celsius => "degC",
            Unit::Fahrenheit => "degF",
            Unit::Pascal => "Pa",
            Unit::Hectopascal => "hPa",
            Unit::InchOfMercury => "inHg",
            Unit::KilogramPerCubicMetre => "kg/m3",
            Unit::Percent => "%",
            Unit::Unitless => "1",
            Unit::Second => "s",
            Unit::KelvinPerKilometre => "K/km",
            Unit::SquareMetrePerSecondSquared => "m2/s2",
            Unit::SquareDegree => "deg2",
            Unit::SquareDegreePerSecondSquared => "deg2/s2",
        }
    }

    pub fn dimension(&self) -> Dimension {
        match self {
            Unit::Metre | Unit::Foot => Dimension::Length,
            Unit::MetrePerSecond | Unit::Knot | Unit::KilometrePerHour | Unit::FootPerMinute => {
                Dimension::Speed
            }
            Unit::Degree | Unit::Radian => Dimension::Angle,
            Unit::DegreePerSecond => Dimension::AngularRate,
            Unit::Kelvin | Unit::Celsius | Unit::Fahrenheit => Dimension::Temperature,
            Unit::Pascal | Unit::Hectopascal | Unit::InchOfMercury => Dimension::Pressure,
            Unit::KilogramPerCubicMetre => Dimension::Density,
            Unit::Percent => Dimension::Fraction,
            Unit::Unitless => Dimension::Ratio,
            Unit::Second => Dimension::Time,
            Unit::KelvinPerKilometre => Dimension::LapseRate,
            Unit::SquareMetrePerSecondSquared => Dimension::SpeedVariance,
            Unit::SquareDegree => Dimension::AngleVariance,
            Unit::SquareDegreePerSecondSquared => Dimension::AngularRateVariance,
        }
    }

    /// Canonical unit of the dimension. Angles stay in degrees and relative
    /// humidity in percent; everything else is SI.
    pub fn canonical(dimension: Dimension) -> Unit {
        match dimension {
            Dimension::Length => Unit::Metre,
            Dimension::Speed => Unit::MetrePerSecond,
            Dimension::Angle => Unit::Degree,
            Dimension::AngularRate => Unit::DegreePerSecond,
            Dimension::Temperature => Unit::Kelvin,
            Dimension::Pressure => Unit::Pascal,
            Dimension::Density => Unit::KilogramPerCubicMetre,
            Dimension::Fraction => Unit::Percent,
            Dimension::Ratio => Unit::Unitless,
            Dimension::Time => Unit::Second,
            Dimension::LapseRate => Unit::KelvinPerKilometre,
            Dimension::SpeedVariance => Unit::SquareMetrePerSecondSquared,
            Dimension::AngleVariance => Unit::SquareDegree,
            Dimension::AngularRateVariance => Unit::SquareDegreePerSecondSquared,
        }
    }

    pub fn to_canonical(&self, value: f64) -> f64 {
        match self {
            Unit::Foot => value * FEET_TO_M,
            Unit::Knot => value * KNOT_TO_MS,
            Unit::KilometrePerHour => value / 3.6,
            Unit::FootPerMinute => value * FPM_TO_MS,
            Unit::Radian => value.to_degrees(),
            Unit::Celsius => value + KELVIN_OFFSET,
            Unit::Fahrenheit => (value - 32.0) * 5.0 / 9.0 + KELVIN_OFFSET,
            Unit::Hectopascal => value * 100.0,
            Unit::InchOfMercury => value * INHG_TO_PA,
            _ => value,
        }
    }

    pub fn from_canonical(&self, value: f64) -> f64 {
        match self {
            Unit::Foot => value / FEET_TO_M,
            Unit::Knot => value / KNOT_TO_MS,
            Unit::KilometrePerHour => value * 3.6,
            Unit::FootPerMinute => value / FPM_TO_MS,
            Unit::Radian => value.to_radians(),
            Unit::Celsius => value - KELVIN_OFFSET,
            Unit::Fahrenheit => (value - KELVIN_OFFSET) * 9.0 / 5.0 + 32.0,
            Unit::Hectopascal => value / 100.0,
            Unit::InchOfMercury => value / INHG_TO_PA,
            _ => value,
        }
    }

    /// Converts `value` from `self` into `target`, which must share a dimension.
    pub fn convert(&self, value: f64, target: Unit) -> StageResult<f64> {
        if self.dimension() != target.dimension() {
            return Err(StageError::UnitConversion(format!(
                "cannot convert {} to {}",
                self.symbol(),
                target.symbol()
            )));
        }
        Ok(target.from_canonical(self.to_canonical(value)))
    }

    pub const ALL: [Unit; 23] = [
        Unit::Metre,
        Unit::Foot,
        Unit::MetrePerSecond,
        Unit::Knot,
        Unit::KilometrePerHour,
        Unit::FootPerMinute,
        Unit::Degree,
        Unit::Radian,
        Unit::DegreePerSecond,
        Unit::Kelvin,
        Unit::Celsius,
        Unit::Fahrenheit,
        Unit::Pascal,
        Unit::Hectopascal,
        Unit::InchOfMercury,
        Unit::KilogramPerCubicMetre,
        Unit::Percent,
        Unit::Unitless,
        Unit::Second,
        Unit::KelvinPerKilometre,
        Unit::SquareMetrePerSecondSquared,
        Unit::SquareDegree,
        Unit::SquareDegreePerSecondSquared,
    ];
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Default native unit for every numeric field of the input contract.
pub const INPUT_FIELD_UNITS: [(&str, Unit); 21] = [
    ("latitude", Unit::Degree),
    ("longitude", Unit::Degree),
    ("altitude_ft", Unit::Foot),
    ("geometric_altitude_ft", Unit::Foot),
    ("altitude_diff_ft", Unit::Foot),
    ("ground_speed", Unit::Knot),
    ("track", Unit::Degree),
    ("vertical_rate", Unit::FootPerMinute),
    ("heading", Unit::Degree),
    ("tas", Unit::Knot),
    ("ias", Unit::Knot),
    ("mach", Unit::Unitless),
    ("roll", Unit::Degree),
    ("track_rate", Unit::DegreePerSecond),
    ("baro_pressure_setting", Unit::Hectopascal),
    ("temp_c", Unit::Celsius),
    ("pressure_hpa", Unit::Hectopascal),
    ("humidity_pct", Unit::Percent),
    ("wind_speed", Unit::Knot),
    ("wind_direction", Unit::Degree),
    ("timestamp", Unit::Second),
];

pub fn default_input_unit(field: &str) -> Option<Unit> {
    INPUT_FIELD_UNITS
        .iter()
        .find(|(name, _)| *name == field)
        .map(|(_, unit)| *unit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_unit_round_trips_through_canonical() {
        let samples = [-40.0, 0.0, 1.0, 29.92, 250.0, 35_000.0];
        for unit in Unit::ALL {
            for &value in &samples {
                let back = unit.from_canonical(unit.to_canonical(value));
                assert!(
                    (back - value).abs() < 1e-9 * value.abs().max(1.0),
                    "{} round trip {} -> {}",
                    unit,
                    value,
                    back
                );
            }
        }
    }

    #[test]
    fn every_input_field_unit_round_trips() {
        for (field, unit) in INPUT_FIELD_UNITS {
            let canonical = Unit::canonical(unit.dimension());
            let si = unit.convert(123.4, canonical).unwrap();
            let back = canonical.convert(si, unit).unwrap();
            assert!((back - 123.4).abs() < 1e-9, "{} did not round trip", field);
        }
    }

    #[test]
    fn known_conversions() {
        assert!((Unit::Knot.to_canonical(120.0) - 61.7333).abs() < 1e-3);
        assert!((Unit::Foot.to_canonical(1000.0) - 304.8).abs() < 1e-9);
        assert!((Unit::FootPerMinute.to_canonical(1000.0) - 5.08).abs() < 1e-9);
        assert!((Unit::Celsius.to_canonical(-56.5) - 216.65).abs() < 1e-9);
        assert!((Unit::Hectopascal.to_canonical(1013.25) - 101_325.0).abs() < 1e-9);
    }

    #[test]
    fn parse_rejects_unknown_tags() {
        assert_eq!(Unit::parse("kt").unwrap(), Unit::Knot);
        assert_eq!(Unit::parse("hPa").unwrap(), Unit::Hectopascal);
        let err = Unit::parse("furlong/fortnight").unwrap_err();
        assert_eq!(err.kind(), "unit_conversion");
    }

    #[test]
    fn convert_rejects_dimension_mismatch() {
        assert!(Unit::Knot.convert(1.0, Unit::Metre).is_err());
    }
}
